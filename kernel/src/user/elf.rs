//! Static ELF loading. Accepts x86-64 little-endian ET_EXEC images with
//! PT_LOAD segments only; everything is mapped as 4 KiB user pages inside
//! the process page map.

use core::ptr;

use x86_64::VirtAddr;
use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr0, Cr0Flags};

use crate::error::{Error, Result};
use crate::memory::{self, FRAME_SIZE, FrameRange};
use crate::paging::{Attribute, PageMap};

const PT_LOAD: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3e;

#[repr(C)]
#[derive(Clone, Copy)]
struct ElfHeader {
    ident: [u8; 16],
    elf_type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

fn program_header(image: &[u8], header: &ElfHeader, index: usize) -> ProgramHeader {
    let offset = header.phoff as usize + header.phentsize as usize * index;
    unsafe { ptr::read_unaligned(image.as_ptr().add(offset) as *const ProgramHeader) }
}

/// Maps the image into `page_map`, activates it and copies the segments in.
/// Returns the entry point. The caller still owns (and frees) the image.
pub fn load(image: &FrameRange, page_map: &mut PageMap) -> Result<u64> {
    let bytes = image.bytes();
    if bytes.len() < size_of::<ElfHeader>() {
        return Err(Error::NotElf);
    }

    let header = unsafe { ptr::read(bytes.as_ptr() as *const ElfHeader) };
    if &header.ident[0..4] != b"\x7fELF" {
        return Err(Error::NotElf);
    }
    // 64-bit, little-endian, executable, x86-64
    if header.ident[4] != 2
        || header.ident[5] != 1
        || header.elf_type != ET_EXEC
        || header.machine != EM_X86_64
    {
        return Err(Error::InvalidElf);
    }
    if (header.phentsize as usize) < size_of::<ProgramHeader>() {
        return Err(Error::InvalidElf);
    }
    let table_end = header.phoff as usize + header.phentsize as usize * header.phnum as usize;
    if table_end > bytes.len() {
        return Err(Error::InvalidElf);
    }

    // The mappable span is the union of the loadable segments.
    let mut segment_first = u64::MAX;
    let mut segment_last = 0u64;
    for i in 0..header.phnum as usize {
        let ph = program_header(bytes, &header, i);
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.filesz > ph.memsz || ph.offset + ph.filesz > bytes.len() as u64 {
            return Err(Error::InvalidElf);
        }
        segment_first = segment_first.min(ph.vaddr);
        segment_last = segment_last.max(ph.vaddr + ph.memsz);
    }
    if segment_first == u64::MAX {
        return Err(Error::InvalidElf);
    }
    segment_first &= !(FRAME_SIZE as u64 - 1);

    let frames = ((segment_last - segment_first) as usize).div_ceil(FRAME_SIZE);
    for i in 0..frames {
        let frame = memory::allocate_one()?;
        page_map.map(
            VirtAddr::new(segment_first + (i * FRAME_SIZE) as u64),
            frame.phys_addr(),
            Attribute::USER_EXECUTE,
        )?;
        page_map.adopt(frame);
    }

    page_map.activate();

    // The fresh mappings are not kernel-writable; lift write protection for
    // the copy only, with interrupts held off so nothing runs half-protected.
    interrupts::without_interrupts(|| {
        unsafe { Cr0::update(|flags| flags.remove(Cr0Flags::WRITE_PROTECT)) };
        for i in 0..header.phnum as usize {
            let ph = program_header(bytes, &header, i);
            if ph.p_type != PT_LOAD {
                continue;
            }
            unsafe {
                ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(ph.offset as usize),
                    ph.vaddr as *mut u8,
                    ph.filesz as usize,
                );
                ptr::write_bytes(
                    (ph.vaddr + ph.filesz) as *mut u8,
                    0,
                    (ph.memsz - ph.filesz) as usize,
                );
            }
        }
        unsafe { Cr0::update(|flags| flags.insert(Cr0Flags::WRITE_PROTECT)) };
    });

    Ok(header.entry)
}
