//! The syscall boundary. MSRs route `syscall` to the entry stub, which saves
//! the user stack pointer, switches to the running thread's kernel stack and
//! dispatches on rax. Results return in rax, the error discriminant in rdx,
//! then sysret.

use core::arch::naked_asm;

use x86_64::VirtAddr;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;

use crate::cpu;
use crate::error::Error;
use crate::{kernel_log, paging, scheduler};

pub const SYSCALL_PRINTK: u64 = 0;
pub const SYSCALL_EXIT: u64 = 1;

const PRINTK_MAX: usize = 4096;

/// Returned to ring 3 as (rax, rdx) — the SysV two-register struct return
/// matches the syscall ABI for free.
#[repr(C)]
pub struct SyscallResult {
    pub value: u64,
    pub error: u64,
}

impl SyscallResult {
    fn ok(value: u64) -> Self {
        SyscallResult { value, error: 0 }
    }

    fn err(error: Error) -> Self {
        SyscallResult {
            value: 0,
            error: error.as_u64(),
        }
    }
}

pub fn init() {
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
    Star::write(
        cpu::user_cs_selector(),
        cpu::user_ss_selector(),
        cpu::kernel_cs_selector(),
        cpu::kernel_ss_selector(),
    )
    .unwrap();
    LStar::write(VirtAddr::from_ptr(syscall_entry as *const ()));
    // interrupts stay off until we are on a kernel stack
    SFMask::write(RFlags::INTERRUPT_FLAG);
}

/// rcx and r11 carry the user rip/rflags for sysret; the user rsp is parked
/// on the kernel stack because another thread may enter a syscall before we
/// leave this one.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn syscall_entry() {
    naked_asm!(
        "
        mov [rip + {user_rsp}], rsp
        mov rsp, [rip + {kernel_stack}]
        push qword ptr [rip + {user_rsp}]
        push rcx
        push r11
        sti

        // rax = number, rdi/rsi/rdx = args; shuffle into the SysV slots
        mov rcx, rdx
        mov rdx, rsi
        mov rsi, rdi
        mov rdi, rax
        call {dispatch}

        cli
        pop r11
        pop rcx
        pop rsp
        sysretq
        ",
        user_rsp = sym cpu::SYSCALL_USER_RSP,
        kernel_stack = sym cpu::SYSCALL_KERNEL_STACK,
        dispatch = sym syscall_dispatch,
    );
}

extern "sysv64" fn syscall_dispatch(number: u64, arg0: u64, _arg1: u64, _arg2: u64) -> SyscallResult {
    match number {
        SYSCALL_PRINTK => sys_printk(arg0),
        SYSCALL_EXIT => scheduler::exit_this_thread(),
        _ => SyscallResult::err(Error::NotSupported),
    }
}

/// Appends the user's NUL-terminated string to the kernel log.
fn sys_printk(string: u64) -> SyscallResult {
    if string < paging::USER_BASE || string + PRINTK_MAX as u64 > paging::USER_END {
        return SyscallResult::err(Error::InvalidData);
    }

    let mut len = 0usize;
    while len < PRINTK_MAX {
        let byte = unsafe { *((string + len as u64) as *const u8) };
        if byte == 0 {
            break;
        }
        len += 1;
    }

    let bytes = unsafe { core::slice::from_raw_parts(string as *const u8, len) };
    match core::str::from_utf8(bytes) {
        Ok(text) => {
            kernel_log!("{}", text);
            SyscallResult::ok(len as u64)
        }
        Err(_) => SyscallResult::err(Error::InvalidData),
    }
}
