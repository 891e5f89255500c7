//! Address spaces. The bootloader maps all physical memory at a fixed
//! higher-half window; every process owns a PML4 whose kernel half is copied
//! from the boot tables and whose slot 256 points at the process PDPT. All
//! user mappings are 4 KiB leaves reached through tables the page map owns.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::memory::{self, Frame};

/// Where the bootloader is told to put the physical-memory window
/// (PML4 slot 320, well clear of the user slot).
pub const PHYS_MAP_ADDR: u64 = 0xFFFF_A000_0000_0000;

/// All dynamic bootloader mappings are pushed above this (slot 384).
pub const DYNAMIC_RANGE_START: u64 = 0xFFFF_C000_0000_0000;

/// The single PML4 slot reserved for user space.
pub const USER_PML4_SLOT: usize = 256;

pub const USER_BASE: u64 = 0xFFFF_8000_0000_0000;

/// One past the last user-half address (slot 256 spans 512 GiB).
pub const USER_END: u64 = 0xFFFF_8080_0000_0000;

/// Highest mappable user page; the initial user stack frame goes here.
pub const USER_STACK_PAGE: u64 = 0xFFFF_807F_FFFF_F000;

static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn init(physical_memory_offset: u64) {
    PHYS_OFFSET.store(physical_memory_offset, Ordering::Relaxed);
}

pub fn phys_to_virt(addr: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYS_OFFSET.load(Ordering::Relaxed) + addr.as_u64())
}

bitflags! {
    /// Leaf mapping attributes. Intermediate tables always get
    /// present/write/user so mixed leaves can share them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attribute: u8 {
        const USER = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Attribute {
    pub const USER_WRITE: Attribute = Attribute::USER.union(Attribute::WRITE);
    pub const USER_EXECUTE: Attribute = Attribute::USER.union(Attribute::EXECUTE);
}

fn table_at(addr: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *phys_to_virt(addr).as_mut_ptr() }
}

/// A process's translation structure: its PML4, the PDPT behind slot 256,
/// every table reached from it, and the leaf frames whose lifetime must
/// match the address space. Dropping the map returns all of it to the frame
/// allocator.
pub struct PageMap {
    pml4: Frame,
    user_pdpt: PhysAddr,
    frames: Vec<Frame>,
}

impl PageMap {
    pub fn new() -> Result<PageMap> {
        let mut pml4 = memory::allocate_one()?;
        pml4.bytes_mut().fill(0);

        // Kernel half: reference the boot mappings from this PML4 as well.
        let (boot_pml4, _) = Cr3::read();
        let boot = table_at(boot_pml4.start_address());
        let new = table_at(pml4.phys_addr());
        for (i, entry) in boot.iter().enumerate() {
            if entry.is_unused() {
                continue;
            }
            assert!(i != USER_PML4_SLOT, "boot tables occupy the user PML4 slot");
            new[i] = entry.clone();
        }

        let mut pdpt = memory::allocate_one()?;
        pdpt.bytes_mut().fill(0);
        let pdpt_addr = pdpt.phys_addr();
        new[USER_PML4_SLOT].set_addr(
            pdpt_addr,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );

        Ok(PageMap {
            pml4,
            user_pdpt: pdpt_addr,
            frames: vec![pdpt],
        })
    }

    pub fn pml4_addr(&self) -> PhysAddr {
        self.pml4.phys_addr()
    }

    fn next_table(&mut self, parent: PhysAddr, index: usize) -> Result<PhysAddr> {
        let entry = &mut table_at(parent)[index];
        if entry.is_unused() {
            let mut table = memory::allocate_one()?;
            table.bytes_mut().fill(0);
            entry.set_addr(
                table.phys_addr(),
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE,
            );
            let addr = table.phys_addr();
            self.frames.push(table);
            Ok(addr)
        } else {
            Ok(entry.addr())
        }
    }

    /// Installs a 4 KiB leaf. `virt` must fall inside the user slot.
    pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, attr: Attribute) -> Result<()> {
        if usize::from(virt.p4_index()) != USER_PML4_SLOT {
            return Err(Error::IndexOutOfRange);
        }

        let pd = self.next_table(self.user_pdpt, usize::from(virt.p3_index()))?;
        let pt = self.next_table(pd, usize::from(virt.p2_index()))?;

        let mut flags = PageTableFlags::PRESENT;
        if attr.contains(Attribute::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if attr.contains(Attribute::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        table_at(pt)[usize::from(virt.p1_index())].set_addr(phys, flags);
        Ok(())
    }

    /// Takes ownership of a leaf frame so it lives exactly as long as the
    /// address space.
    pub fn adopt(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Loads this address space. Skipped by the context switch when the next
    /// thread belongs to the same process.
    pub fn activate(&self) {
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(self.pml4.phys_addr()),
                Cr3::read().1,
            );
        }
    }
}

/// Kernel-space MMIO mappings (LAPIC, IO APIC) go here, one page at a time.
pub const MMIO_BASE: u64 = 0xFFFF_B000_0000_0000;

static MMIO_NEXT: AtomicU64 = AtomicU64::new(MMIO_BASE);

/// Maps one page of device memory into the boot tables, uncached, and hands
/// back its virtual address. Intermediate tables are leaked: these mappings
/// live as long as the kernel and are copied into every process PML4.
pub fn map_kernel_mmio(phys: PhysAddr) -> Result<VirtAddr> {
    let virt = VirtAddr::new(MMIO_NEXT.fetch_add(memory::FRAME_SIZE as u64, Ordering::Relaxed));

    let mut table = kernel_pml4_addr();
    for index in [
        usize::from(virt.p4_index()),
        usize::from(virt.p3_index()),
        usize::from(virt.p2_index()),
    ] {
        let entry = &mut table_at(table)[index];
        if entry.is_unused() {
            let mut frame = memory::allocate_one()?;
            frame.bytes_mut().fill(0);
            entry.set_addr(
                frame.phys_addr(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
            core::mem::forget(frame);
        }
        table = entry.addr();
    }
    table_at(table)[usize::from(virt.p1_index())].set_addr(
        phys,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
    );
    x86_64::instructions::tlb::flush(virt);
    Ok(virt)
}

/// CR3 value for threads with no user half (kernel threads).
pub fn kernel_pml4_addr() -> PhysAddr {
    Cr3::read().0.start_address()
}

/// Reloads a known address space root, e.g. after a user process died.
pub fn activate_root(addr: PhysAddr) {
    unsafe {
        Cr3::write(PhysFrame::containing_address(addr), Cr3::read().1);
    }
}
