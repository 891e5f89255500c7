//! Local APIC + IO APIC bring-up: disables the legacy PIC, routes the
//! keyboard IRQ, enables the APIC and starts the preemption timer.

use acpi::InterruptModel;
use alloc::alloc::Global;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::model_specific::Msr;
use x86_64::{PhysAddr, VirtAddr};

use crate::paging;
use ioapic::IoApic;

mod ioapic;

pub const TIMER_VECTOR: u8 = 0x31;
pub const KEYBOARD_VECTOR: u8 = 0x41;
pub const SPURIOUS_VECTOR: u8 = 0xff;

const LAPIC_BASE_PHYSICAL_ADDRESS: u64 = 0xFEE0_0000;

const LAPIC_ID_OFFSET: u64 = 0x20;
const EOI_OFFSET: u64 = 0xb0;
const SIVR_OFFSET: u64 = 0xf0;
const DESTINATION_FORMAT_OFFSET: u64 = 0xe0;
const TASK_PRIORITY_OFFSET: u64 = 0x80;
const LVT_TIMER_OFFSET: u64 = 0x320;
const INITIAL_COUNT_OFFSET: u64 = 0x380;
const DIVIDE_CONFIG_OFFSET: u64 = 0x3e0;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

#[allow(dead_code)]
enum IsaIrq {
    PitTimer = 0,
    Keyboard = 1,
    Mouse = 12,
}

/// Interface for the ancient 8259 PIC, only used to turn it off.
mod pic {
    use x86_64::instructions::port::Port;

    const ICW1_ICW4: u8 = 0x01;
    const ICW1_INIT: u8 = 0x10;
    const ICW4_8086: u8 = 0x01;
    const CASCADE_IRQ: u8 = 2;

    struct Pic {
        command: Port<u8>,
        data: Port<u8>,
    }

    /// Remaps both PICs away from the exception vectors and masks all IRQs.
    pub fn initialise(offset1: u8, offset2: u8) {
        let mut pic1 = Pic {
            command: Port::new(0x20),
            data: Port::new(0x21),
        };
        let mut pic2 = Pic {
            command: Port::new(0xA0),
            data: Port::new(0xA1),
        };

        let mut wait = Port::<u8>::new(0x80);

        // https://wiki.osdev.org/8259_PIC#Disabling
        unsafe {
            pic1.command.write(ICW1_INIT | ICW1_ICW4);
            wait.write(0);
            pic2.command.write(ICW1_INIT | ICW1_ICW4);
            wait.write(0);
            pic1.data.write(offset1);
            wait.write(0);
            pic2.data.write(offset2);
            wait.write(0);
            pic1.data.write(1 << CASCADE_IRQ);
            wait.write(0);
            pic2.data.write(2);
            wait.write(0);

            pic1.data.write(ICW4_8086);
            wait.write(0);
            pic2.data.write(ICW4_8086);
            wait.write(0);

            // Mask all interrupts
            pic1.data.write(0xff);
            pic2.data.write(0xff);
        }
    }

    pub struct Imcr {
        selector_port: Port<u8>,
        value_port: Port<u8>,
    }

    impl Imcr {
        pub fn new() -> Self {
            Imcr {
                selector_port: Port::new(0x22),
                value_port: Port::new(0x23),
            }
        }

        pub fn enable_symmetric_io_mode(&mut self) {
            unsafe {
                self.selector_port.write(0x70u8); // select IMCR
                self.value_port.write(0x01u8); // NMI and INTR through the APIC
            }
        }
    }
}

pub unsafe fn end_of_interrupt() {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    unsafe {
        ((base + EOI_OFFSET) as *mut u32).write_volatile(0);
    }
}

#[allow(dead_code)]
pub enum TimerDivideConfig {
    DivideBy2 = 0b0000,
    DivideBy4 = 0b0001,
    DivideBy8 = 0b0010,
    DivideBy16 = 0b0011,
    DivideBy32 = 0b1000,
    DivideBy64 = 0b1001,
    DivideBy128 = 0b1010,
    DivideBy1 = 0b1011,
}

pub struct Lapic {
    base: VirtAddr,
}

impl Lapic {
    pub fn lapic_id(&self) -> u8 {
        (self.read(LAPIC_ID_OFFSET) >> 24) as u8
    }

    /// Maps the LAPIC registers and enables them via the spurious vector.
    /// Can only be called once.
    pub unsafe fn new(spurious_interrupt_vector: u8) -> Self {
        let base = paging::map_kernel_mmio(PhysAddr::new(LAPIC_BASE_PHYSICAL_ADDRESS))
            .expect("failed to map LAPIC registers");
        LAPIC_BASE.store(base.as_u64(), Ordering::Relaxed);

        let mut apic = Lapic { base };

        apic.write(SIVR_OFFSET, 0x100 | (spurious_interrupt_vector as u32)); // bit 8 enables the APIC
        apic.write(DESTINATION_FORMAT_OFFSET, 0xFFFFFFFF); // flat mode
        apic.write(TASK_PRIORITY_OFFSET, 0); // accept everything

        apic
    }

    pub fn configure_timer(
        &mut self,
        vector: u8,
        timer_initial: u32,
        timer_divide: TimerDivideConfig,
    ) {
        // The order is important DO NOT CHANGE
        self.write(DIVIDE_CONFIG_OFFSET, timer_divide as u32);
        self.write(LVT_TIMER_OFFSET, (1 << 17) | (vector as u32)); // periodic
        self.write(INITIAL_COUNT_OFFSET, timer_initial);
    }

    fn read(&self, offset: u64) -> u32 {
        unsafe { ((self.base.as_u64() + offset) as *const u32).read_volatile() }
    }

    fn write(&mut self, offset: u64, val: u32) {
        unsafe { ((self.base.as_u64() + offset) as *mut u32).write_volatile(val) }
    }
}

/// See: https://blog.wesleyac.com/posts/ioapic-interrupts
pub fn enable(interrupt_model: &InterruptModel<Global>) {
    // Step 1. Disable PIC
    pic::initialise(0x20, 0x28);

    // Step 2. Set IMCR
    let mut imcr = pic::Imcr::new();
    imcr.enable_symmetric_io_mode();

    // Step 3. Configure LAPIC spurious interrupt vector
    let mut lapic = unsafe { Lapic::new(SPURIOUS_VECTOR) };

    // Step 4. Find the keyboard GSI, honouring interrupt source overrides
    let (ioapics, overrides) = match interrupt_model {
        InterruptModel::Apic(apic_info) => {
            (&apic_info.io_apics, &apic_info.interrupt_source_overrides)
        }
        _ => panic!("interrupt model is not apic"),
    };

    let ioapic_info = &ioapics[0];
    let keyboard_gsi = overrides
        .iter()
        .find(|o| o.isa_source == IsaIrq::Keyboard as u8)
        .map(|o| o.global_system_interrupt)
        .unwrap_or(ioapic_info.global_system_interrupt_base + IsaIrq::Keyboard as u32);

    if keyboard_gsi < ioapic_info.global_system_interrupt_base {
        panic!("no IOAPIC connected to keyboard");
    }

    let gsi_base = ioapic_info.global_system_interrupt_base;

    // Step 5. Redirect the keyboard pin to its vector
    let mut ioapic = IoApic::new(ioapic_info);
    ioapic.set_ioredtbl(
        (keyboard_gsi - gsi_base) as u8,
        KEYBOARD_VECTOR,
        lapic.lapic_id(),
    );

    // Step 6. Enable the APIC globally
    let mut apic_base_msr = Msr::new(0x1b);
    unsafe { apic_base_msr.write(apic_base_msr.read() | (1 << 11)) };

    // Preemption tick
    lapic.configure_timer(TIMER_VECTOR, 1_000_000, TimerDivideConfig::DivideBy16);
}
