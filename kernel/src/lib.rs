#![no_std]
#![cfg_attr(test, no_main)]
#![feature(abi_x86_interrupt)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

pub mod acpi_handler;
pub mod apic;
pub mod console;
pub mod cpu;
pub mod error;
pub mod filesystem;
pub mod interrupts;
pub mod log;
pub mod memory;
pub mod message;
pub mod paging;
pub mod panic;
pub mod scheduler;
pub mod sync;
pub mod test_framework;
pub mod user;

pub use test_framework::{QemuExitCode, Testable, exit_qemu, test_panic_handler, test_runner};

use bootloader_api::BootInfo;
use bootloader_api::config::{BootloaderConfig, Mapping};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    // keep the bootloader's own mappings away from the user PML4 slot
    config.mappings.physical_memory = Some(Mapping::FixedAddress(paging::PHYS_MAP_ADDR));
    config.mappings.dynamic_range_start = Some(paging::DYNAMIC_RANGE_START);
    config
};

/// Brings the whole kernel up, in dependency order: physical window, frame
/// allocator, heap, CPU structures, IDT, console, message queue, scheduler,
/// syscall MSRs, VFS + boot devices, and finally the APIC timer that makes
/// scheduling preemptive.
pub fn init(boot_info: &'static mut BootInfo) {
    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");
    paging::init(phys_offset);

    unsafe { memory::init(&boot_info.memory_regions) };
    memory::init_heap().expect("failed to initialise the kernel heap");

    cpu::init();
    interrupts::init_idt();

    let framebuffer_device = match boot_info.framebuffer.as_mut() {
        Some(fb) => {
            panic::set_framebuffer(&raw mut *fb);
            let info = fb.info();
            let base = fb.buffer_mut().as_mut_ptr();
            let device =
                filesystem::devfs::FramebufferDevice::new(base, info.width, info.height, info.byte_len);
            console::init(fb);
            Some(device)
        }
        None => None,
    };

    message::init();
    scheduler::init();
    user::syscalls::init();

    filesystem::init();
    filesystem::register_boot_devices(framebuffer_device);

    match boot_info.rsdp_addr.into_option() {
        Some(rsdp) => {
            let tables =
                unsafe { acpi::AcpiTables::from_rsdp(acpi_handler::Handler, rsdp as usize) }
                    .expect("failed to parse ACPI tables");
            let platform_info = tables.platform_info().expect("no ACPI platform info");
            apic::enable(&platform_info.interrupt_model);
        }
        None => {
            kernel_log!("acpi: bootloader handed over no RSDP; timer preemption disabled");
        }
    }

    x86_64::instructions::interrupts::enable();
}

#[cfg(test)]
bootloader_api::entry_point!(test_kernel_main, config = &BOOTLOADER_CONFIG);

#[cfg(test)]
fn test_kernel_main(boot_info: &'static mut BootInfo) -> ! {
    init(boot_info);
    test_main();
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}
