//! Physical frame allocator. One bitmap covers up to 32 GiB of 4 KiB frames;
//! every allocation is handed out as an owning handle whose drop returns the
//! frames. At any instant a frame is either free in the bitmap or referenced
//! by exactly one live handle.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use linked_list_allocator::LockedHeap;
use x86_64::PhysAddr;

use crate::error::{Error, Result};
use crate::paging;
use crate::sync::SpinLock;

pub const FRAME_SIZE: usize = 4096;

const MAX_PHYSICAL_BYTES: usize = 32 << 30;
const MAX_FRAMES: usize = MAX_PHYSICAL_BYTES / FRAME_SIZE;
const BITS_PER_LINE: usize = u64::BITS as usize;
const MAP_LINES: usize = MAX_FRAMES / BITS_PER_LINE;

pub const HEAP_FRAMES: usize = 16 * 1024; // 64 MiB

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub static FRAME_ALLOCATOR: SpinLock<BitmapFrameAllocator> =
    SpinLock::new(BitmapFrameAllocator::new());

/// Identity of one physical frame: physical address = id * FRAME_SIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(usize);

impl FrameId {
    pub const fn new(id: usize) -> Self {
        FrameId(id)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub fn phys_addr(self) -> PhysAddr {
        PhysAddr::new((self.0 * FRAME_SIZE) as u64)
    }
}

pub struct BitmapFrameAllocator {
    map: [u64; MAP_LINES],
    range_begin: usize,
    range_end: usize,
    free: usize,
}

impl BitmapFrameAllocator {
    pub const fn new() -> Self {
        // nothing is allocatable until init() has seen the memory map
        BitmapFrameAllocator {
            map: [0; MAP_LINES],
            range_begin: 1,
            range_end: 1,
            free: 0,
        }
    }

    fn get_bit(&self, frame: usize) -> bool {
        self.map[frame / BITS_PER_LINE] & (1 << (frame % BITS_PER_LINE)) != 0
    }

    fn set_bit(&mut self, frame: usize, in_use: bool) {
        let line = &mut self.map[frame / BITS_PER_LINE];
        let mask = 1 << (frame % BITS_PER_LINE);
        if in_use {
            if *line & mask == 0 {
                self.free -= 1;
            }
            *line |= mask;
        } else {
            if *line & mask != 0 {
                self.free += 1;
            }
            *line &= !mask;
        }
    }

    fn set_bits(&mut self, first: usize, count: usize, in_use: bool) {
        for frame in first..(first + count).min(MAX_FRAMES) {
            self.set_bit(frame, in_use);
        }
    }

    /// Consumes the boot memory map. Everything defaults to in-use; usable
    /// descriptors clear their frames. Frame 0 stays reserved.
    pub fn init(&mut self, regions: &MemoryRegions) {
        self.map.fill(u64::MAX);
        self.free = 0;

        let mut available_end = 0usize;
        for region in regions.iter() {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let first = (region.start as usize).div_ceil(FRAME_SIZE);
            let end = region.end as usize / FRAME_SIZE;
            if end > first {
                self.set_bits(first, end - first, false);
                available_end = available_end.max(end);
            }
        }
        self.set_bit(0, true);
        self.range_begin = 1;
        self.range_end = available_end.min(MAX_FRAMES);
    }

    fn allocate_bits(&mut self, count: usize) -> Result<FrameId> {
        let mut start = self.range_begin;
        'scan: loop {
            for i in 0..count {
                if start + i >= self.range_end {
                    return Err(Error::OutOfMemory);
                }
                if self.get_bit(start + i) {
                    start += i + 1;
                    continue 'scan;
                }
            }
            self.set_bits(start, count, true);
            return Ok(FrameId(start));
        }
    }

    fn deallocate_bits(&mut self, first: FrameId, count: usize) {
        for frame in first.0..first.0 + count {
            assert!(self.get_bit(frame), "frame {frame} freed while free");
            self.set_bit(frame, false);
        }
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }
}

/// Owning handle for a contiguous frame range. Move-only; dropping it
/// returns the range to the allocator.
#[derive(Debug)]
pub struct FrameRange {
    first: FrameId,
    count: usize,
}

impl FrameRange {
    pub fn first(&self) -> FrameId {
        self.first
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.first.phys_addr()
    }

    /// Kernel-virtual view of the whole range through the physical window.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                paging::phys_to_virt(self.phys_addr()).as_mut_ptr(),
                self.count * FRAME_SIZE,
            )
        }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                paging::phys_to_virt(self.phys_addr()).as_ptr(),
                self.count * FRAME_SIZE,
            )
        }
    }

    /// Gives up ownership without freeing. Used once, for the heap.
    fn leak(self) -> FrameId {
        let first = self.first;
        core::mem::forget(self);
        first
    }
}

impl Drop for FrameRange {
    fn drop(&mut self) {
        FRAME_ALLOCATOR
            .lock()
            .deallocate_bits(self.first, self.count);
    }
}

/// The count = 1 specialisation.
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
}

impl Frame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.id.phys_addr()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                paging::phys_to_virt(self.phys_addr()).as_mut_ptr(),
                FRAME_SIZE,
            )
        }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(paging::phys_to_virt(self.phys_addr()).as_ptr(), FRAME_SIZE)
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        FRAME_ALLOCATOR.lock().deallocate_bits(self.id, 1);
    }
}

pub fn allocate(count: usize) -> Result<FrameRange> {
    let first = FRAME_ALLOCATOR.lock().allocate_bits(count)?;
    Ok(FrameRange { first, count })
}

pub fn allocate_one() -> Result<Frame> {
    let id = FRAME_ALLOCATOR.lock().allocate_bits(1)?;
    Ok(Frame { id })
}

pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_frames()
}

/// # Safety
/// Call once, after the physical window offset is known.
pub unsafe fn init(regions: &MemoryRegions) {
    FRAME_ALLOCATOR.lock().init(regions);
}

/// Carves a contiguous block out of physical memory and hands it to the
/// global heap. The block is leaked on purpose; the heap never shrinks.
pub fn init_heap() -> Result<()> {
    let range = allocate(HEAP_FRAMES)?;
    let base = paging::phys_to_virt(range.phys_addr());
    range.leak();
    unsafe {
        ALLOCATOR
            .lock()
            .init(base.as_mut_ptr(), HEAP_FRAMES * FRAME_SIZE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn conservation_and_reuse() {
        let before = free_frames();
        let a = allocate(3).unwrap();
        let b = allocate_one().unwrap();
        assert_eq!(free_frames(), before - 4);
        drop(a);
        drop(b);
        assert_eq!(free_frames(), before);
    }

    #[test_case]
    fn ranges_never_overlap() {
        let a = allocate(4).unwrap();
        let b = allocate(4).unwrap();
        let (a0, a1) = (a.first().get(), a.first().get() + a.count());
        let (b0, b1) = (b.first().get(), b.first().get() + b.count());
        assert!(a1 <= b0 || b1 <= a0);
    }
}
