//! User-process round trip: a hand-assembled static ELF travels through the
//! VFS, gets loaded into a fresh address space, runs in ring 3, syscalls
//! back in, and every frame it touched returns on join.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec::Vec;

use bootloader_api::BootInfo;
use kernel::error::Error;
use kernel::filesystem::{self, vfs::FileType, vfs::OPEN_RO, vfs::OPEN_RW};
use kernel::memory::{self, FRAME_SIZE};
use kernel::paging::{self, PageMap};
use kernel::user::{self, elf};
use kernel::{log, scheduler};

bootloader_api::entry_point!(main, config = &kernel::BOOTLOADER_CONFIG);

fn main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init(boot_info);
    test_main();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel::test_panic_handler(info)
}

const GREETING: &[u8] = b"hi from ring3";

/// printk(message); exit()
fn user_program() -> Vec<u8> {
    let mut code = alloc::vec![
        0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, // mov rax, 0 (printk)
        0x48, 0x8D, 0x3D, 0x0B, 0x00, 0x00, 0x00, // lea rdi, [rip + 11] -> message
        0x0F, 0x05, // syscall
        0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1 (exit)
        0x0F, 0x05, // syscall
    ];
    code.extend_from_slice(GREETING);
    code.push(0);
    code
}

/// Minimal ET_EXEC image: one PT_LOAD segment at `vaddr`, code at file
/// offset 0x1000.
fn build_elf(code: &[u8], vaddr: u64) -> Vec<u8> {
    let mut image = Vec::new();
    // ELF header
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0u8; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&0x3eu16.to_le_bytes()); // x86-64
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&vaddr.to_le_bytes()); // entry
    image.extend_from_slice(&64u64.to_le_bytes()); // phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // flags
    image.extend_from_slice(&64u16.to_le_bytes()); // ehsize
    image.extend_from_slice(&56u16.to_le_bytes()); // phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // phnum
    image.extend_from_slice(&[0u8; 6]); // no section headers
    // program header
    image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image.extend_from_slice(&5u32.to_le_bytes()); // R+X
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // offset
    image.extend_from_slice(&vaddr.to_le_bytes());
    image.extend_from_slice(&vaddr.to_le_bytes());
    image.extend_from_slice(&(code.len() as u64).to_le_bytes()); // filesz
    image.extend_from_slice(&(code.len() as u64).to_le_bytes()); // memsz
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // align
    assert_eq!(image.len(), 64 + 56);

    image.resize(0x1000, 0);
    image.extend_from_slice(code);
    image
}

fn log_contains(needle: &[u8]) -> bool {
    let mut buf = [0u8; 16 * 1024];
    let n = log::LOG_RING.lock().read(&mut buf);
    buf[..n].windows(needle.len()).any(|w| w == needle)
}

#[test_case]
fn elf_round_trip_reclaims_every_frame() {
    let elf_bytes = build_elf(&user_program(), paging::USER_BASE + 0x40_0000);
    let baseline = memory::free_frames();

    // ship the binary through the filesystem, like a real first process
    filesystem::mount("tmpfs", "/bin").unwrap();
    {
        let mut dir = filesystem::open("/bin", OPEN_RW).unwrap();
        dir.create("init", FileType::Regular).unwrap();
    }
    {
        let mut file = filesystem::open("/bin/init", OPEN_RW).unwrap();
        assert_eq!(file.write(0, &elf_bytes).unwrap(), elf_bytes.len());
    }

    // read it back into an owned frame range
    let mut image = memory::allocate(elf_bytes.len().div_ceil(FRAME_SIZE)).unwrap();
    {
        let mut file = filesystem::open("/bin/init", OPEN_RO).unwrap();
        let n = file.read(0, &mut image.bytes_mut()[..elf_bytes.len()]).unwrap();
        assert_eq!(n, elf_bytes.len());
    }

    let (pid, tid) = user::create_user_process(image).unwrap();
    scheduler::wait_thread(pid, tid).unwrap();
    scheduler::wait_process(pid).unwrap();

    // the process is fully gone
    assert_eq!(scheduler::wait_process(pid), Err(Error::NoSuchProcess));

    // printk made it into the kernel log from ring 3
    assert!(log_contains(GREETING));

    // image frames, user stack, page-map tables and tmpfs data all returned
    filesystem::unmount("/bin").unwrap();
    assert_eq!(memory::free_frames(), baseline);
}

#[test_case]
fn loader_rejects_garbage() {
    let mut image = memory::allocate(1).unwrap();
    image.bytes_mut().fill(0);
    image.bytes_mut()[..4].copy_from_slice(b"NOPE");

    let mut page_map = PageMap::new().unwrap();
    assert_eq!(elf::load(&image, &mut page_map), Err(Error::NotElf));
}

#[test_case]
fn loader_rejects_truncated_header_table() {
    // valid magic, but the program header table runs past the image
    let mut bytes = build_elf(&user_program(), paging::USER_BASE + 0x40_0000);
    bytes[56] = 0xff; // phnum low byte
    bytes[57] = 0x0f;

    let mut image = memory::allocate(bytes.len().div_ceil(FRAME_SIZE)).unwrap();
    image.bytes_mut()[..bytes.len()].copy_from_slice(&bytes);

    let mut page_map = PageMap::new().unwrap();
    assert_eq!(elf::load(&image, &mut page_map), Err(Error::InvalidElf));
}

#[test_case]
fn failed_startup_still_reclaims_frames() {
    let baseline = memory::free_frames();

    let mut image = memory::allocate(1).unwrap();
    image.bytes_mut().fill(0xAA);

    let (pid, tid) = user::create_user_process(image).unwrap();
    scheduler::wait_thread(pid, tid).unwrap();
    scheduler::wait_process(pid).unwrap();

    assert_eq!(memory::free_frames(), baseline);
}
