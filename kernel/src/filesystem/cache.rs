//! Page cache. A provider is a lockable, growable run of cache pages keyed
//! by block-offset-divided-by-blocks-per-page; a partition device reuses its
//! parent device's provider shifted by a fixed page offset, so the partition
//! and the raw device cache the same physical sectors once.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::Result;
use crate::memory::{self, Frame};
use crate::scheduler::mutex::Critical;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Clean,
    Dirty,
}

pub struct CachePage {
    frame: Option<Frame>,
    pub state: CacheState,
}

impl CachePage {
    const fn empty() -> Self {
        CachePage {
            frame: None,
            state: CacheState::Uninitialized,
        }
    }

    /// The backing frame, allocated on first touch.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if self.frame.is_none() {
            self.frame = Some(memory::allocate_one()?);
        }
        Ok(self.frame.as_mut().unwrap().bytes_mut())
    }
}

pub trait CacheProvider: Send + Sync {
    fn store(&self) -> &Critical<Vec<CachePage>>;

    /// Index shift applied before touching the store.
    fn page_offset(&self) -> usize {
        0
    }
}

/// Grows the store so `pages` pages are addressable past the offset.
pub fn ensure_capacity(pages: &mut Vec<CachePage>, len: usize) {
    while pages.len() < len {
        pages.push(CachePage::empty());
    }
}

pub struct DefaultCacheProvider {
    store: Critical<Vec<CachePage>>,
}

impl DefaultCacheProvider {
    pub fn new() -> Self {
        DefaultCacheProvider {
            store: Critical::new(Vec::new()),
        }
    }
}

impl CacheProvider for DefaultCacheProvider {
    fn store(&self) -> &Critical<Vec<CachePage>> {
        &self.store
    }
}

pub struct PartitionCacheProvider {
    page_offset: usize,
    base: Arc<dyn CacheProvider>,
}

impl PartitionCacheProvider {
    pub fn new(block_offset: usize, blocks_per_page: usize, base: Arc<dyn CacheProvider>) -> Self {
        PartitionCacheProvider {
            page_offset: block_offset / blocks_per_page,
            base,
        }
    }
}

impl CacheProvider for PartitionCacheProvider {
    fn store(&self) -> &Critical<Vec<CachePage>> {
        self.base.store()
    }

    fn page_offset(&self) -> usize {
        self.page_offset + self.base.page_offset()
    }
}
