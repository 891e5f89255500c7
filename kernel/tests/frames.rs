//! Frame allocator invariants: conservation, exclusivity, failure on
//! impossible requests.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec::Vec;
use bootloader_api::BootInfo;
use kernel::error::Error;
use kernel::memory;

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

#[test_case]
fn free_count_is_conserved() {
    let initial = memory::free_frames();

    let a = memory::allocate(8).unwrap();
    assert_eq!(memory::free_frames(), initial - 8);
    let b = memory::allocate(3).unwrap();
    let c = memory::allocate_one().unwrap();
    assert_eq!(memory::free_frames(), initial - 12);

    drop(b);
    assert_eq!(memory::free_frames(), initial - 9);
    drop(a);
    drop(c);
    assert_eq!(memory::free_frames(), initial);
}

#[test_case]
fn live_handles_never_overlap() {
    let handles: Vec<_> = (0..16)
        .map(|i| memory::allocate(i % 5 + 1).unwrap())
        .collect();

    for (i, a) in handles.iter().enumerate() {
        for b in handles.iter().skip(i + 1) {
            let (a0, a1) = (a.first().get(), a.first().get() + a.count());
            let (b0, b1) = (b.first().get(), b.first().get() + b.count());
            assert!(a1 <= b0 || b1 <= a0, "handles overlap: {a:?} vs {b:?}");
        }
    }
}

#[test_case]
fn freed_ranges_are_reusable() {
    let initial = memory::free_frames();
    for _ in 0..64 {
        let range = memory::allocate(32).unwrap();
        drop(range);
    }
    assert_eq!(memory::free_frames(), initial);
}

#[test_case]
fn impossible_requests_fail_cleanly() {
    // more than the machine can have
    let r = memory::allocate(1 << 24);
    assert!(matches!(r, Err(Error::OutOfMemory)));
    // and the failure must not have eaten anything
    let initial = memory::free_frames();
    let _ = memory::allocate(1 << 24);
    assert_eq!(memory::free_frames(), initial);
}

#[test_case]
fn heap_is_alive() {
    let mut v = Vec::new();
    for i in 0..10_000u64 {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<u64>(), 10_000 * 9_999 / 2);
}

#[test_case]
fn frame_contents_are_addressable() {
    let mut range = memory::allocate(2).unwrap();
    range.bytes_mut().fill(0xA5);
    assert!(range.bytes().iter().all(|b| *b == 0xA5));
}
