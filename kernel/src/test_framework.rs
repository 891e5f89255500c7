//! No-std test plumbing: tests report over the debugcon and QEMU exits
//! through the isa-debug-exit device.

use core::panic::PanicInfo;

use x86_64::instructions::port::Port;

use crate::{debug_print, debug_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        debug_print!("{}...\t", core::any::type_name::<T>());
        self();
        debug_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    debug_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    debug_println!("all tests passed");
    exit_qemu(QemuExitCode::Success)
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    debug_println!("[failed]");
    debug_println!("{}", info);
    exit_qemu(QemuExitCode::Failed)
}
