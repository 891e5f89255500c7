//! User process startup: a kernel thread builds the address space from an
//! ELF image, then drops to ring 3 and never comes back (user code leaves
//! through the exit syscall).

use alloc::boxed::Box;
use core::arch::naked_asm;

use x86_64::VirtAddr;

use crate::error::Result;
use crate::memory::{self, FRAME_SIZE, FrameRange};
use crate::paging::{self, Attribute, PageMap};
use crate::scheduler::{self, ProcessId, ThreadId};
use crate::kernel_log;

pub mod elf;
pub mod syscalls;

/// Creates a process whose first thread loads `image` and enters it in ring
/// 3. The image frames are consumed (and freed once the segments are
/// copied).
pub fn create_user_process(image: FrameRange) -> Result<(ProcessId, ThreadId)> {
    let pid = scheduler::create_process();
    let data = Box::into_raw(Box::new(image)) as u64;
    let tid = match scheduler::create_thread(pid, elf_startup, data) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(data as *mut FrameRange) });
            return Err(e);
        }
    };
    scheduler::wakeup_thread(pid, tid, None)?;
    Ok((pid, tid))
}

extern "sysv64" fn elf_startup(id: u64, data: u64) {
    let image = *unsafe { Box::from_raw(data as *mut FrameRange) };
    let (pid, _) = scheduler::current();

    match prepare(pid, image) {
        // no owned locals may be live past this point: the thread only
        // leaves ring 3 through exit, which never unwinds this frame
        Ok((entry, stack)) => unsafe { enter_user(id, 0, entry, stack) },
        Err(e) => {
            kernel_log!("user: failed to start process {}: {:?}", pid, e);
            scheduler::exit_this_thread();
        }
    }
}

fn prepare(pid: ProcessId, image: FrameRange) -> Result<(u64, u64)> {
    let shared = scheduler::process_shared(pid)?;

    let mut page_map = PageMap::new()?;
    let entry = elf::load(&image, &mut page_map)?;
    drop(image);

    // one stack frame at the top of the user half
    let stack = memory::allocate_one()?;
    page_map.map(
        VirtAddr::new(paging::USER_STACK_PAGE),
        stack.phys_addr(),
        Attribute::USER_WRITE,
    )?;
    page_map.adopt(stack);

    shared.set_page_map(Some(page_map));
    Ok((entry, paging::USER_STACK_PAGE + FRAME_SIZE as u64 - 8))
}

/// Drops to ring 3: user selectors come from STAR, rip/rflags from rcx/r11.
/// (thread id, argument) ride through rdi/rsi untouched.
#[unsafe(naked)]
unsafe extern "sysv64" fn enter_user(_id: u64, _arg: u64, _entry: u64, _stack: u64) -> ! {
    naked_asm!(
        "
        cli
        mov rsp, rcx
        mov rcx, rdx
        mov r11, 0x202
        sysretq
        "
    );
}
