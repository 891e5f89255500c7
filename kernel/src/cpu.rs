//! Per-CPU state: GDT, TSS, the selectors the scheduler and syscall paths
//! need, and the kernel-stack slots the syscall entry reads. Only the boot
//! processor is brought up; the structure is per-CPU so more can follow.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use alloc::boxed::Box;
use conquer_once::spin::OnceCell;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, DS, ES, FS, GS, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

static CPUS: OnceCell<Cpus> = OnceCell::uninit();

static KERNEL_CS: AtomicU16 = AtomicU16::new(0);
static KERNEL_SS: AtomicU16 = AtomicU16::new(0);
static USER_CS: AtomicU16 = AtomicU16::new(0);
static USER_SS: AtomicU16 = AtomicU16::new(0);

/// Loaded into rsp by the syscall entry; the scheduler keeps it pointing at
/// the running thread's kernel stack.
pub static SYSCALL_KERNEL_STACK: AtomicU64 = AtomicU64::new(0);

/// Where the syscall entry parks the user stack pointer until sysret.
pub static SYSCALL_USER_RSP: AtomicU64 = AtomicU64::new(0);

pub struct PerCpu {
    gdt: GlobalDescriptorTable,
    tss: &'static mut TaskStateSegment,
}

impl PerCpu {
    fn new() -> Self {
        let tss = Box::leak(Box::new(TaskStateSegment::new()));
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

            #[allow(unused_unsafe)]
            let stack_start = VirtAddr::from_ptr(unsafe { &raw const STACK });
            stack_start + STACK_SIZE as u64 // stacks grow downwards
        };

        PerCpu {
            gdt: GlobalDescriptorTable::new(),
            tss,
        }
    }

    /// Builds and loads the GDT. Segment order matters: sysret derives the
    /// user selectors from one STAR base, so user data must sit right below
    /// user code.
    unsafe fn init_gdt(&'static mut self) {
        let kernel_cs = self.gdt.append(Descriptor::kernel_code_segment());
        let kernel_ss = self.gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = self.gdt.append(Descriptor::tss_segment(self.tss));
        let user_ss = self.gdt.append(Descriptor::user_data_segment());
        let user_cs = self.gdt.append(Descriptor::user_code_segment());

        self.gdt.load();

        unsafe {
            CS::set_reg(kernel_cs);
            load_tss(tss_selector);

            DS::set_reg(kernel_ss);
            ES::set_reg(kernel_ss);
            FS::set_reg(kernel_ss);
            GS::set_reg(kernel_ss);
            SS::set_reg(kernel_ss);
        }

        KERNEL_CS.store(kernel_cs.0, Ordering::Relaxed);
        KERNEL_SS.store(kernel_ss.0, Ordering::Relaxed);
        USER_CS.store(user_cs.0, Ordering::Relaxed);
        USER_SS.store(user_ss.0, Ordering::Relaxed);
    }

    fn set_privilege_stack(&mut self, top: VirtAddr) {
        self.tss.privilege_stack_table[0] = top;
    }
}

/// All per-CPU data. Each CPU only touches its own slot, which is what makes
/// the UnsafeCell sound.
pub struct Cpus {
    cpu: UnsafeCell<PerCpu>, // just the boot processor for now
}

impl Cpus {
    #[allow(clippy::mut_from_ref)]
    fn get_cpu(&self) -> &mut PerCpu {
        unsafe { self.cpu.get().as_mut().unwrap() }
    }
}

unsafe impl Send for Cpus {}
unsafe impl Sync for Cpus {}

/// Index of the executing CPU. Single processor until AP bring-up exists.
pub fn current_id() -> u32 {
    0
}

pub fn kernel_cs() -> u16 {
    KERNEL_CS.load(Ordering::Relaxed)
}

pub fn kernel_ss() -> u16 {
    KERNEL_SS.load(Ordering::Relaxed)
}

pub fn user_cs_selector() -> SegmentSelector {
    SegmentSelector(USER_CS.load(Ordering::Relaxed))
}

pub fn user_ss_selector() -> SegmentSelector {
    SegmentSelector(USER_SS.load(Ordering::Relaxed))
}

pub fn kernel_cs_selector() -> SegmentSelector {
    SegmentSelector(KERNEL_CS.load(Ordering::Relaxed))
}

pub fn kernel_ss_selector() -> SegmentSelector {
    SegmentSelector(KERNEL_SS.load(Ordering::Relaxed))
}

/// Called by the scheduler on every dispatch: interrupts from ring 3 land on
/// the TSS stack, syscalls on the slot the entry stub reads.
pub fn set_kernel_stack(top: u64) {
    SYSCALL_KERNEL_STACK.store(top, Ordering::Relaxed);
    if let Some(cpus) = CPUS.get() {
        cpus.get_cpu().set_privilege_stack(VirtAddr::new(top));
    }
}

pub fn init() {
    CPUS.try_init_once(|| Cpus {
        cpu: UnsafeCell::new(PerCpu::new()),
    })
    .expect("cpu::init called twice");
    unsafe {
        CPUS.get().unwrap().get_cpu().init_gdt();
    }
}
