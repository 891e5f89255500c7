//! Saved CPU state and the context switch itself.

use core::arch::naked_asm;
use core::mem::offset_of;
use core::sync::atomic::AtomicU8;

/// Everything a suspended thread needs to resume: general-purpose registers,
/// segment selectors, CR3, RFLAGS and the 512-byte FXSAVE area. Layout is
/// fixed because the switch assembly addresses fields by offset.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct ThreadContext {
    pub cr3: u64,
    pub rip: u64,
    pub rflags: u64,
    pub reserved1: u64,
    pub cs: u64,
    pub ss: u64,
    pub fs: u64,
    pub gs: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub fxsave_area: [u8; 512],
}

impl ThreadContext {
    pub const fn zeroed() -> Self {
        ThreadContext {
            cr3: 0,
            rip: 0,
            rflags: 0,
            reserved1: 0,
            cs: 0,
            ss: 0,
            fs: 0,
            gs: 0,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rdi: 0,
            rsi: 0,
            rsp: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            fxsave_area: [0; 512],
        }
    }

    /// Mask all SSE exceptions, the state fxrstor expects for a fresh thread.
    pub fn reset_mxcsr(&mut self) {
        self.fxsave_area[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
    }
}

/// Saves the running thread into `current`, releases the scheduler lock and
/// resumes `next` via iretq (which reloads rip/cs/rflags/rsp/ss in one go).
///
/// The lock byte is cleared only after `current` is fully saved, so a thread
/// is never observable half-saved; the final scratch registers are restored
/// after the release because they are exactly the registers holding our
/// pointers.
///
/// # Safety
/// Caller must hold the scheduler lock whose raw byte is `lock`, and must
/// forget the guard: the lock is released in here. Both context pointers must
/// stay valid until the lock release (they do: the scheduler owns them).
#[unsafe(naked)]
pub unsafe extern "sysv64" fn switch_contexts(
    _next: *const ThreadContext,
    _current: *mut ThreadContext,
    _lock: *const AtomicU8,
) {
    // next = rdi, current = rsi, lock = rdx
    naked_asm!(
        "
        mov [rsi + {off_rax}], rax
        mov [rsi + {off_rbx}], rbx
        mov [rsi + {off_rcx}], rcx
        mov [rsi + {off_rdx}], rdx
        mov [rsi + {off_rdi}], rdi
        mov [rsi + {off_rsi}], rsi
        mov [rsi + {off_rbp}], rbp
        mov [rsi + {off_r8}], r8
        mov [rsi + {off_r9}], r9
        mov [rsi + {off_r10}], r10
        mov [rsi + {off_r11}], r11
        mov [rsi + {off_r12}], r12
        mov [rsi + {off_r13}], r13
        mov [rsi + {off_r14}], r14
        mov [rsi + {off_r15}], r15

        // resume after our own return address, on the stack above it
        lea rax, [rsp + 8]
        mov [rsi + {off_rsp}], rax
        mov rax, [rsp]
        mov [rsi + {off_rip}], rax

        pushfq
        pop qword ptr [rsi + {off_rflags}]
        // threads always resume with interrupts on; the caller disabled them
        // only to protect this switch
        or qword ptr [rsi + {off_rflags}], 0x200

        xor rax, rax
        mov ax, cs
        mov [rsi + {off_cs}], rax
        mov ax, ss
        mov [rsi + {off_ss}], rax
        mov ax, fs
        mov [rsi + {off_fs}], rax
        mov ax, gs
        mov [rsi + {off_gs}], rax

        mov rax, cr3
        mov [rsi + {off_cr3}], rax
        fxsave [rsi + {off_fxsave}]

        // incoming thread
        fxrstor [rdi + {off_fxsave}]

        mov rax, [rdi + {off_cr3}]
        mov rcx, cr3
        cmp rax, rcx
        je 2f
        mov cr3, rax
        2:

        mov rax, [rdi + {off_fs}]
        mov fs, ax
        mov rax, [rdi + {off_gs}]
        mov gs, ax

        push qword ptr [rdi + {off_ss}]
        push qword ptr [rdi + {off_rsp}]
        push qword ptr [rdi + {off_rflags}]
        push qword ptr [rdi + {off_cs}]
        push qword ptr [rdi + {off_rip}]

        mov rax, [rdi + {off_rax}]
        mov rbx, [rdi + {off_rbx}]
        mov rsi, [rdi + {off_rsi}]
        mov rbp, [rdi + {off_rbp}]
        mov r8, [rdi + {off_r8}]
        mov r9, [rdi + {off_r9}]
        mov r10, [rdi + {off_r10}]
        mov r11, [rdi + {off_r11}]
        mov r12, [rdi + {off_r12}]
        mov r13, [rdi + {off_r13}]
        mov r14, [rdi + {off_r14}]
        mov r15, [rdi + {off_r15}]

        // outgoing thread is fully saved; let the scheduler go
        mov byte ptr [rdx], 0
        mov rcx, [rdi + {off_rcx}]
        mov rdx, [rdi + {off_rdx}]
        mov rdi, [rdi + {off_rdi}]
        iretq
        ",
        off_cr3 = const(offset_of!(ThreadContext, cr3)),
        off_rip = const(offset_of!(ThreadContext, rip)),
        off_rflags = const(offset_of!(ThreadContext, rflags)),
        off_cs = const(offset_of!(ThreadContext, cs)),
        off_ss = const(offset_of!(ThreadContext, ss)),
        off_fs = const(offset_of!(ThreadContext, fs)),
        off_gs = const(offset_of!(ThreadContext, gs)),
        off_rax = const(offset_of!(ThreadContext, rax)),
        off_rbx = const(offset_of!(ThreadContext, rbx)),
        off_rcx = const(offset_of!(ThreadContext, rcx)),
        off_rdx = const(offset_of!(ThreadContext, rdx)),
        off_rdi = const(offset_of!(ThreadContext, rdi)),
        off_rsi = const(offset_of!(ThreadContext, rsi)),
        off_rsp = const(offset_of!(ThreadContext, rsp)),
        off_rbp = const(offset_of!(ThreadContext, rbp)),
        off_r8 = const(offset_of!(ThreadContext, r8)),
        off_r9 = const(offset_of!(ThreadContext, r9)),
        off_r10 = const(offset_of!(ThreadContext, r10)),
        off_r11 = const(offset_of!(ThreadContext, r11)),
        off_r12 = const(offset_of!(ThreadContext, r12)),
        off_r13 = const(offset_of!(ThreadContext, r13)),
        off_r14 = const(offset_of!(ThreadContext, r14)),
        off_r15 = const(offset_of!(ThreadContext, r15)),
        off_fxsave = const(offset_of!(ThreadContext, fxsave_area)),
    );
}
