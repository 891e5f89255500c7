//! The open-file graph. Every path that is open (or has open descendants)
//! owns exactly one live `FileOperator`; handles are per-caller capabilities
//! referencing one FOP. Drivers see opaque u64 payloads per FOP and per
//! handle and do block-granular I/O; this module does the byte translation,
//! the open-level bookkeeping and the collapse of unused FOPs.

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::debug_println;
use crate::error::{Error, Result};
use crate::memory::FRAME_SIZE;
use crate::scheduler::EventId;

use super::cache::{self, CacheProvider, CacheState, DefaultCacheProvider};
use super::devfs::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    None,
    Framebuffer,
    Keyboard,
    Mouse,
    Console,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    // framebuffer
    GetSize,
    GetDirectPointer,
    Swap,
    IsDoubleBuffered,
    // block
    GetBytesPerSector,
}

/// Answers to `DeviceOperation`s; which variant comes back depends on the op.
#[derive(Debug, Clone, Copy)]
pub enum DeviceControl {
    None,
    Size(usize, usize),
    Pointer(*mut u8),
    Flag(bool),
    BytesPerSector(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenLevel {
    /// Opening in this direction always fails.
    Block,
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy)]
pub struct Attributes {
    pub read_level: OpenLevel,
    pub write_level: OpenLevel,
    /// Also refuse openers of the opposite direction.
    pub exclusive: bool,
    pub volume_root: bool,
    /// Route I/O through the page cache.
    pub cache: bool,
    pub keep_on_close: bool,
}

pub const DEFAULT_ATTRIBUTES: Attributes = Attributes {
    read_level: OpenLevel::Single,
    write_level: OpenLevel::Single,
    exclusive: true,
    volume_root: false,
    cache: true,
    keep_on_close: false,
};

pub const VOLUME_ROOT_ATTRIBUTES: Attributes = Attributes {
    volume_root: true,
    ..DEFAULT_ATTRIBUTES
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
}

pub const OPEN_RO: OpenMode = OpenMode {
    read: true,
    write: false,
};
pub const OPEN_WO: OpenMode = OpenMode {
    read: false,
    write: true,
};
pub const OPEN_RW: OpenMode = OpenMode {
    read: true,
    write: true,
};

/// What a driver reports about a child before it becomes a FOP.
#[derive(Debug, Clone)]
pub struct FileAbstract {
    pub name: String,
    pub filesize: usize,
    pub kind: FileType,
    pub blocksize_exp: u8,
    pub attributes: Attributes,
}

pub struct FileAbstractWithData {
    pub abstract_: FileAbstract,
    pub fop_data: u64,
}

/// The contract every filesystem and device driver implements. All I/O is
/// in blocks of 2^blocksize_exp bytes; payloads are opaque to the VFS.
pub trait Driver: Send + Sync {
    fn read(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _block: usize,
        _count: usize,
        _buffer: &mut [u8],
    ) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _block: usize,
        _count: usize,
        _buffer: &[u8],
    ) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn find(&self, fop_data: u64, handle_data: &mut u64, name: &str)
    -> Result<FileAbstractWithData>;

    fn create(
        &self,
        fop_data: u64,
        handle_data: &mut u64,
        name: &str,
        kind: FileType,
    ) -> Result<FileAbstractWithData>;

    fn readdir(
        &self,
        fop_data: u64,
        handle_data: &mut u64,
        index: usize,
    ) -> Result<FileAbstractWithData>;

    fn remove(&self, fop_data: u64, handle_data: &mut u64, name: &str) -> Result<()>;

    fn device_type(&self, _fop_data: u64) -> DeviceType {
        DeviceType::None
    }

    fn create_device(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _name: &str,
        _device: Arc<dyn Device>,
    ) -> Result<FileAbstractWithData> {
        Err(Error::NotImplemented)
    }

    fn control_device(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _op: DeviceOperation,
    ) -> Result<DeviceControl> {
        Err(Error::NotImplemented)
    }

    fn destroy_fop_data(&self, _fop_data: u64) -> Result<()> {
        Ok(())
    }

    fn create_handle_data(&self, _fop_data: u64) -> Result<u64> {
        Ok(0)
    }

    fn destroy_handle_data(&self, _fop_data: u64, _handle_data: &mut u64) -> Result<()> {
        Ok(())
    }

    fn on_handle_create(&self, _fop_data: u64, _handle_data: &mut u64) {}

    fn on_handle_destroy(&self, _fop_data: u64, _handle_data: &mut u64) {}

    fn write_event(&self, _fop_data: u64, _handle_data: &mut u64) -> Option<EventId> {
        None
    }

    /// Cache backing for this FOP; None means a fresh default provider.
    fn cache_provider(&self, _fop_data: u64) -> Option<Arc<dyn CacheProvider>> {
        None
    }
}

#[derive(Default)]
struct OpenCounts {
    read: u32,
    write: u32,
}

pub struct FileOperator {
    name: String,
    driver: Arc<dyn Driver>,
    fop_data: u64,
    kind: FileType,
    blocksize_exp: u8,
    attributes: Attributes,
    filesize: AtomicUsize,
    /// Non-owning: the parent's children table owns us, and collapse only
    /// unlinks bottom-up while the parent is still reachable.
    parent: Weak<FileOperator>,
    counts: Mutex<OpenCounts>,
    children: Mutex<BTreeMap<String, Arc<FileOperator>>>,
    /// Mount overlay: resolution follows this before looking at children.
    mount: Mutex<Option<Arc<FileOperator>>>,
    cache: Option<Arc<dyn CacheProvider>>,
}

impl FileOperator {
    pub fn from_abstract(
        found: FileAbstractWithData,
        driver: Arc<dyn Driver>,
        parent: Weak<FileOperator>,
    ) -> Arc<FileOperator> {
        let FileAbstractWithData { abstract_, fop_data } = found;
        let cache = if abstract_.attributes.cache {
            Some(
                driver
                    .cache_provider(fop_data)
                    .unwrap_or_else(|| Arc::new(DefaultCacheProvider::new()) as _),
            )
        } else {
            None
        };
        Arc::new(FileOperator {
            name: abstract_.name,
            driver,
            fop_data,
            kind: abstract_.kind,
            blocksize_exp: abstract_.blocksize_exp,
            attributes: abstract_.attributes,
            filesize: AtomicUsize::new(abstract_.filesize),
            parent,
            counts: Mutex::new(OpenCounts::default()),
            children: Mutex::new(BTreeMap::new()),
            mount: Mutex::new(None),
            cache,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileType {
        self.kind
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn filesize(&self) -> usize {
        self.filesize.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> (u32, u32) {
        let counts = self.counts.lock();
        (counts.read, counts.write)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.lock().contains_key(name)
    }

    pub fn overlay(&self) -> Option<Arc<FileOperator>> {
        self.mount.lock().clone()
    }

    pub(super) fn set_overlay(&self, overlay: Option<Arc<FileOperator>>) {
        *self.mount.lock() = overlay;
    }

    pub fn is_busy(&self) -> bool {
        let counts = self.counts.lock();
        counts.read != 0
            || counts.write != 0
            || !self.children.lock().is_empty()
            || self.mount.lock().is_some()
    }

    /// The open-level check; bumps the matching counters on success.
    fn try_open(&self, mode: OpenMode) -> Result<()> {
        let mut counts = self.counts.lock();

        if mode.read {
            match self.attributes.read_level {
                OpenLevel::Block => return Err(Error::InvalidOpenMode),
                OpenLevel::Single if counts.read != 0 => return Err(Error::FileOpened),
                _ => {}
            }
            if self.attributes.exclusive && counts.write != 0 {
                return Err(Error::FileOpened);
            }
        }
        if mode.write {
            match self.attributes.write_level {
                OpenLevel::Block => return Err(Error::InvalidOpenMode),
                OpenLevel::Single if counts.write != 0 => return Err(Error::FileOpened),
                _ => {}
            }
            if self.attributes.exclusive && counts.read != 0 {
                return Err(Error::FileOpened);
            }
        }

        if mode.read {
            counts.read += 1;
        }
        if mode.write {
            counts.write += 1;
        }
        Ok(())
    }
}

impl Drop for FileOperator {
    fn drop(&mut self) {
        if let Err(e) = self.driver.destroy_fop_data(self.fop_data) {
            debug_println!("fs: failed to destroy fop data of {}: {:?}", self.name, e);
        }
    }
}

/// Follows mount overlays until the real target, so a handle on a mountpoint
/// is a handle on the mounted volume's root.
pub fn follow_overlay(mut fop: Arc<FileOperator>) -> Arc<FileOperator> {
    while let Some(next) = fop.overlay() {
        fop = next;
    }
    fop
}

pub struct Handle {
    fop: Arc<FileOperator>,
    mode: OpenMode,
    handle_data: u64,
    expired: bool,
}

impl Handle {
    /// Opens `fop` itself (mode check + handle construction). The caller has
    /// already resolved overlays.
    pub(super) fn open_fop(fop: Arc<FileOperator>, mode: OpenMode) -> Result<Handle> {
        fop.try_open(mode)?;
        let mut handle_data = match fop.driver.create_handle_data(fop.fop_data) {
            Ok(data) => data,
            Err(e) => {
                debug_println!("fs: failed to create handle data of {}: {:?}", fop.name, e);
                0
            }
        };
        fop.driver.on_handle_create(fop.fop_data, &mut handle_data);
        Ok(Handle {
            fop,
            mode,
            handle_data,
            expired: false,
        })
    }

    pub fn fop(&self) -> &Arc<FileOperator> {
        &self.fop
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Opens a child of this (directory) handle. Reuses the live FOP when
    /// the path is already open somewhere, otherwise materialises one via
    /// driver find; counters are bumped under the children lock so a
    /// concurrent collapse cannot unlink a FOP that just got an opener.
    pub fn open(&mut self, name: &str, mode: OpenMode) -> Result<Handle> {
        if !self.mode.read {
            return Err(Error::FileNotOpened);
        }

        let child = {
            let mut children = self.fop.children.lock();
            match children.get(name) {
                Some(existing) => {
                    let target = follow_overlay(existing.clone());
                    target.try_open(mode)?;
                    target
                }
                None => {
                    let found =
                        self.fop
                            .driver
                            .find(self.fop.fop_data, &mut self.handle_data, name)?;
                    let fop = FileOperator::from_abstract(
                        found,
                        self.fop.driver.clone(),
                        Arc::downgrade(&self.fop),
                    );
                    fop.try_open(mode)?;
                    children.insert(name.to_owned(), fop.clone());
                    fop
                }
            }
        };

        let mut handle_data = match child.driver.create_handle_data(child.fop_data) {
            Ok(data) => data,
            Err(e) => {
                debug_println!("fs: failed to create handle data of {}: {:?}", child.name, e);
                0
            }
        };
        child.driver.on_handle_create(child.fop_data, &mut handle_data);
        Ok(Handle {
            fop: child,
            mode,
            handle_data,
            expired: false,
        })
    }

    pub fn find(&mut self, name: &str) -> Result<FileAbstract> {
        if !self.mode.read {
            return Err(Error::FileNotOpened);
        }
        self.fop
            .driver
            .find(self.fop.fop_data, &mut self.handle_data, name)
            .map(|found| found.abstract_)
    }

    pub fn create(&mut self, name: &str, kind: FileType) -> Result<()> {
        if !self.mode.write {
            return Err(Error::FileNotOpened);
        }
        self.fop
            .driver
            .create(self.fop.fop_data, &mut self.handle_data, name, kind)
            .map(|_| ())
    }

    pub fn readdir(&mut self, index: usize) -> Result<FileAbstract> {
        if !self.mode.read {
            return Err(Error::FileNotOpened);
        }
        self.fop
            .driver
            .readdir(self.fop.fop_data, &mut self.handle_data, index)
            .map(|found| found.abstract_)
    }

    /// Removal is refused while the child is itself open (it would have a
    /// live FOP under us).
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !self.mode.write {
            return Err(Error::FileNotOpened);
        }
        if self.fop.has_child(name) {
            return Err(Error::FileOpened);
        }
        self.fop
            .driver
            .remove(self.fop.fop_data, &mut self.handle_data, name)
    }

    pub fn filesize(&self) -> Result<usize> {
        if !self.mode.read {
            return Err(Error::FileNotOpened);
        }
        Ok(self.fop.filesize())
    }

    pub fn blocksize(&self) -> usize {
        1 << self.fop.blocksize_exp
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        if !self.mode.read {
            return Err(Error::FileNotOpened);
        }
        if self.fop.kind != FileType::Device {
            return Ok(DeviceType::None);
        }
        Ok(self.fop.driver.device_type(self.fop.fop_data))
    }

    pub fn create_device(&mut self, name: &str, device: Arc<dyn Device>) -> Result<FileAbstract> {
        if !self.mode.write {
            return Err(Error::FileNotOpened);
        }
        self.fop
            .driver
            .create_device(self.fop.fop_data, &mut self.handle_data, name, device)
            .map(|found| found.abstract_)
    }

    pub fn control_device(&mut self, op: DeviceOperation) -> Result<DeviceControl> {
        self.fop
            .driver
            .control_device(self.fop.fop_data, &mut self.handle_data, op)
    }

    pub fn write_event(&mut self) -> Result<EventId> {
        self.fop
            .driver
            .write_event(self.fop.fop_data, &mut self.handle_data)
            .ok_or(Error::NotSupported)
    }

    /// Byte-granular read at `offset`; translated to block I/O, through the
    /// page cache when this FOP caches.
    pub fn read(&mut self, offset: usize, buffer: &mut [u8]) -> Result<usize> {
        if !self.mode.read {
            return Err(Error::FileNotOpened);
        }
        match self.fop.cache.clone() {
            Some(provider) => self.cached_read(&*provider, offset, buffer),
            None => self.direct_read(offset, buffer),
        }
    }

    /// Byte-granular write; partial blocks are read-modified-written. Cached
    /// writes only dirty the cache, flushing is the driver's business.
    pub fn write(&mut self, offset: usize, buffer: &[u8]) -> Result<usize> {
        if !self.mode.write {
            return Err(Error::FileNotOpened);
        }
        let written = match self.fop.cache.clone() {
            Some(provider) => self.cached_write(&*provider, offset, buffer)?,
            None => self.direct_write(offset, buffer)?,
        };
        self.fop.filesize.fetch_max(offset + written, Ordering::Relaxed);
        Ok(written)
    }

    fn fill_page(&mut self, page: &mut cache::CachePage, page_index: usize) -> Result<()> {
        let blocks_per_page = FRAME_SIZE >> self.fop.blocksize_exp;
        let bytes = page.bytes_mut()?;
        match self.fop.driver.read(
            self.fop.fop_data,
            &mut self.handle_data,
            page_index * blocks_per_page,
            blocks_per_page,
            bytes,
        ) {
            // a short or absent tail stays zero-filled
            Ok(_) | Err(Error::EndOfFile) | Err(Error::IndexOutOfRange) => {}
            Err(e) => return Err(e),
        }
        page.state = CacheState::Clean;
        Ok(())
    }

    fn cached_read(
        &mut self,
        provider: &dyn CacheProvider,
        offset: usize,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let shift = provider.page_offset();
        let mut done = 0;
        while done < buffer.len() {
            let pos = offset + done;
            let page_index = pos / FRAME_SIZE;
            let in_page = pos % FRAME_SIZE;
            let n = (FRAME_SIZE - in_page).min(buffer.len() - done);

            let mut store = provider.store().access();
            cache::ensure_capacity(&mut store, shift + page_index + 1);
            let page = &mut store[shift + page_index];
            if page.state == CacheState::Uninitialized {
                self.fill_page(page, page_index)?;
            }
            let bytes = page.bytes_mut()?;
            buffer[done..done + n].copy_from_slice(&bytes[in_page..in_page + n]);
            done += n;
        }
        Ok(done)
    }

    fn cached_write(
        &mut self,
        provider: &dyn CacheProvider,
        offset: usize,
        buffer: &[u8],
    ) -> Result<usize> {
        let shift = provider.page_offset();
        let mut done = 0;
        while done < buffer.len() {
            let pos = offset + done;
            let page_index = pos / FRAME_SIZE;
            let in_page = pos % FRAME_SIZE;
            let n = (FRAME_SIZE - in_page).min(buffer.len() - done);

            let mut store = provider.store().access();
            cache::ensure_capacity(&mut store, shift + page_index + 1);
            let page = &mut store[shift + page_index];
            if page.state == CacheState::Uninitialized && n != FRAME_SIZE {
                self.fill_page(page, page_index)?;
            }
            let bytes = page.bytes_mut()?;
            bytes[in_page..in_page + n].copy_from_slice(&buffer[done..done + n]);
            page.state = CacheState::Dirty;
            done += n;
        }
        Ok(done)
    }

    fn direct_read(&mut self, offset: usize, buffer: &mut [u8]) -> Result<usize> {
        let blocksize = 1usize << self.fop.blocksize_exp;
        let mut done = 0;
        while done < buffer.len() {
            let pos = offset + done;
            let block = pos / blocksize;
            let in_block = pos % blocksize;

            if in_block == 0 && buffer.len() - done >= blocksize {
                let count = (buffer.len() - done) / blocksize;
                let read = match self.fop.driver.read(
                    self.fop.fop_data,
                    &mut self.handle_data,
                    block,
                    count,
                    &mut buffer[done..done + count * blocksize],
                ) {
                    Ok(read) => read,
                    Err(Error::EndOfFile) | Err(Error::IndexOutOfRange) if done > 0 => break,
                    Err(e) => return Err(e),
                };
                done += read * blocksize;
                if read < count {
                    break;
                }
            } else {
                let mut bounce = vec![0u8; blocksize];
                match self.fop.driver.read(
                    self.fop.fop_data,
                    &mut self.handle_data,
                    block,
                    1,
                    &mut bounce,
                ) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(Error::EndOfFile) | Err(Error::IndexOutOfRange) if done > 0 => break,
                    Err(e) => return Err(e),
                }
                let n = (blocksize - in_block).min(buffer.len() - done);
                buffer[done..done + n].copy_from_slice(&bounce[in_block..in_block + n]);
                done += n;
            }
        }
        Ok(done)
    }

    fn direct_write(&mut self, offset: usize, buffer: &[u8]) -> Result<usize> {
        let blocksize = 1usize << self.fop.blocksize_exp;
        let mut done = 0;
        while done < buffer.len() {
            let pos = offset + done;
            let block = pos / blocksize;
            let in_block = pos % blocksize;

            if in_block == 0 && buffer.len() - done >= blocksize {
                let count = (buffer.len() - done) / blocksize;
                let written = self.fop.driver.write(
                    self.fop.fop_data,
                    &mut self.handle_data,
                    block,
                    count,
                    &buffer[done..done + count * blocksize],
                )?;
                done += written * blocksize;
                if written < count {
                    break;
                }
            } else {
                // read-modify-write for the partial block
                let mut bounce = vec![0u8; blocksize];
                match self.fop.driver.read(
                    self.fop.fop_data,
                    &mut self.handle_data,
                    block,
                    1,
                    &mut bounce,
                ) {
                    Ok(_) | Err(Error::EndOfFile) | Err(Error::IndexOutOfRange) => {}
                    Err(e) => return Err(e),
                }
                let n = (blocksize - in_block).min(buffer.len() - done);
                bounce[in_block..in_block + n].copy_from_slice(&buffer[done..done + n]);
                let written = self.fop.driver.write(
                    self.fop.fop_data,
                    &mut self.handle_data,
                    block,
                    1,
                    &bounce,
                )?;
                if written == 0 {
                    break;
                }
                done += n;
            }
        }
        Ok(done)
    }

    /// Tears down the handle: driver callbacks, counter drop, then the
    /// upward collapse of FOPs that nothing needs any more.
    pub fn close(mut self) {
        self.close_impl();
    }

    fn close_impl(&mut self) {
        if core::mem::replace(&mut self.expired, true) {
            return;
        }

        self.fop
            .driver
            .on_handle_destroy(self.fop.fop_data, &mut self.handle_data);
        if let Err(e) = self
            .fop
            .driver
            .destroy_handle_data(self.fop.fop_data, &mut self.handle_data)
        {
            debug_println!("fs: failed to destroy handle data: {:?}", e);
        }

        {
            let mut counts = self.fop.counts.lock();
            if self.mode.read {
                counts.read -= 1;
            }
            if self.mode.write {
                counts.write -= 1;
            }
        }

        let mut fop = self.fop.clone();
        loop {
            if fop.attributes.volume_root || fop.attributes.keep_on_close {
                break;
            }
            let Some(parent) = fop.parent.upgrade() else {
                break;
            };
            let mut children = parent.children.lock();
            // busyness re-checked under the parent's children lock: a racing
            // open bumps counters under this same lock before we can unlink
            if fop.is_busy() {
                break;
            }
            children.remove(&fop.name);
            drop(children);
            fop = parent;
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl Driver for NullDriver {
        fn find(&self, _: u64, _: &mut u64, _: &str) -> Result<FileAbstractWithData> {
            Err(Error::NoSuchFile)
        }

        fn create(&self, _: u64, _: &mut u64, _: &str, _: FileType) -> Result<FileAbstractWithData> {
            Err(Error::NotSupported)
        }

        fn readdir(&self, _: u64, _: &mut u64, _: usize) -> Result<FileAbstractWithData> {
            Err(Error::EndOfFile)
        }

        fn remove(&self, _: u64, _: &mut u64, _: &str) -> Result<()> {
            Err(Error::NoSuchFile)
        }
    }

    fn fop_with(read_level: OpenLevel, write_level: OpenLevel, exclusive: bool) -> Arc<FileOperator> {
        FileOperator::from_abstract(
            FileAbstractWithData {
                abstract_: FileAbstract {
                    name: "x".to_owned(),
                    filesize: 0,
                    kind: FileType::Regular,
                    blocksize_exp: 0,
                    attributes: Attributes {
                        read_level,
                        write_level,
                        exclusive,
                        volume_root: false,
                        cache: false,
                        keep_on_close: false,
                    },
                },
                fop_data: 0,
            },
            Arc::new(NullDriver),
            Weak::new(),
        )
    }

    #[test_case]
    fn blocked_directions_never_open() {
        let fop = fop_with(OpenLevel::Block, OpenLevel::Block, false);
        assert_eq!(fop.try_open(OPEN_RO), Err(Error::InvalidOpenMode));
        assert_eq!(fop.try_open(OPEN_WO), Err(Error::InvalidOpenMode));
        assert_eq!(fop.counts(), (0, 0));
    }

    #[test_case]
    fn single_admits_one_per_direction() {
        let fop = fop_with(OpenLevel::Single, OpenLevel::Single, false);
        fop.try_open(OPEN_RO).unwrap();
        assert_eq!(fop.try_open(OPEN_RO), Err(Error::FileOpened));
        // non-exclusive: the opposite direction is independent
        fop.try_open(OPEN_WO).unwrap();
        assert_eq!(fop.try_open(OPEN_WO), Err(Error::FileOpened));
        assert_eq!(fop.counts(), (1, 1));
    }

    #[test_case]
    fn exclusive_refuses_cross_direction() {
        let fop = fop_with(OpenLevel::Multi, OpenLevel::Multi, true);
        fop.try_open(OPEN_RO).unwrap();
        fop.try_open(OPEN_RO).unwrap();
        assert_eq!(fop.try_open(OPEN_WO), Err(Error::FileOpened));
        assert_eq!(fop.try_open(OPEN_RW), Err(Error::FileOpened));
        assert_eq!(fop.counts(), (2, 0));
    }

    #[test_case]
    fn failed_open_bumps_nothing() {
        let fop = fop_with(OpenLevel::Single, OpenLevel::Block, true);
        assert_eq!(fop.try_open(OPEN_RW), Err(Error::InvalidOpenMode));
        assert_eq!(fop.counts(), (0, 0));
        fop.try_open(OPEN_RO).unwrap();
        assert_eq!(fop.counts(), (1, 0));
    }
}
