//! Scheduler behaviour under a live timer: events, joint waits, the mutex,
//! preemptive fairness and the error paths for bad ids.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bootloader_api::BootInfo;
use conquer_once::spin::OnceCell;
use kernel::error::Error;
use kernel::interrupts::TICKS;
use kernel::scheduler::{self, ThreadId, mutex::Mutex};

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

fn spawn(entry: extern "sysv64" fn(u64, u64), arg: u64, nice: i32) -> ThreadId {
    let tid = scheduler::create_thread(0, entry, arg).unwrap();
    scheduler::wakeup_thread(0, tid, Some(nice)).unwrap();
    tid
}

/// Busy-wait at the test thread's priority; yielding keeps same-nice
/// workers running.
fn poll_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..50_000_000u64 {
        if condition() {
            return;
        }
        scheduler::yield_now();
    }
    panic!("condition never became true");
}

// --- event wake ---

static EVENT: AtomicU32 = AtomicU32::new(0);
static EVENT_DONE: AtomicBool = AtomicBool::new(false);

extern "sysv64" fn event_waiter(_id: u64, _arg: u64) {
    scheduler::wait_event(EVENT.load(Ordering::SeqCst)).unwrap();
    EVENT_DONE.store(true, Ordering::SeqCst);
}

#[test_case]
fn notify_wakes_waiter() {
    let event = scheduler::create_event();
    EVENT.store(event, Ordering::SeqCst);

    let tid = spawn(event_waiter, 0, -2);
    poll_until(|| {
        scheduler::event_waiters(event)
            .unwrap()
            .contains(&(0, tid))
    });

    scheduler::notify_event(event).unwrap();
    // runnable (and unsubscribed) before notify returned
    assert!(scheduler::event_waiters(event).unwrap().is_empty());

    scheduler::wait_thread(0, tid).unwrap();
    assert!(EVENT_DONE.load(Ordering::SeqCst));
    scheduler::delete_event(event).unwrap();
}

// --- joint wait (two events, one notification) ---

static JOINT_E1: AtomicU32 = AtomicU32::new(0);
static JOINT_E2: AtomicU32 = AtomicU32::new(0);
static JOINT_DONE: AtomicBool = AtomicBool::new(false);

extern "sysv64" fn joint_waiter(_id: u64, _arg: u64) {
    let e1 = JOINT_E1.load(Ordering::SeqCst);
    let e2 = JOINT_E2.load(Ordering::SeqCst);
    scheduler::wait_events(&[e1, e2]).unwrap();
    // woken by e2; the e1 subscription is still ours to drop
    scheduler::unwait_event(e1).unwrap();
    JOINT_DONE.store(true, Ordering::SeqCst);
}

#[test_case]
fn waking_one_event_keeps_other_subscriptions() {
    let e1 = scheduler::create_event();
    let e2 = scheduler::create_event();
    JOINT_E1.store(e1, Ordering::SeqCst);
    JOINT_E2.store(e2, Ordering::SeqCst);

    let tid = spawn(joint_waiter, 0, -2);
    poll_until(|| scheduler::event_waiters(e2).unwrap().contains(&(0, tid)));
    assert!(scheduler::event_waiters(e1).unwrap().contains(&(0, tid)));

    scheduler::notify_event(e2).unwrap();
    // the waiter has not run yet: gone from e2, still on e1
    assert!(!scheduler::event_waiters(e2).unwrap().contains(&(0, tid)));
    assert!(scheduler::event_waiters(e1).unwrap().contains(&(0, tid)));

    scheduler::wait_thread(0, tid).unwrap();
    assert!(JOINT_DONE.load(Ordering::SeqCst));
    assert!(scheduler::event_waiters(e1).unwrap().is_empty());

    scheduler::delete_event(e1).unwrap();
    scheduler::delete_event(e2).unwrap();
}

// --- event deletion rules ---

static BUSY_EVENT: AtomicU32 = AtomicU32::new(0);

extern "sysv64" fn busy_event_waiter(_id: u64, _arg: u64) {
    let _ = scheduler::wait_event(BUSY_EVENT.load(Ordering::SeqCst));
}

#[test_case]
fn delete_refuses_events_with_waiters() {
    let event = scheduler::create_event();
    BUSY_EVENT.store(event, Ordering::SeqCst);

    let tid = spawn(busy_event_waiter, 0, -2);
    poll_until(|| !scheduler::event_waiters(event).unwrap().is_empty());

    assert_eq!(scheduler::delete_event(event), Err(Error::UnfinishedEvent));
    scheduler::notify_event(event).unwrap();
    scheduler::wait_thread(0, tid).unwrap();
    assert_eq!(scheduler::delete_event(event), Ok(()));
    assert_eq!(scheduler::wait_event(event), Err(Error::NoSuchEvent));
}

// --- mutex mutual exclusion ---

static MUTEX: OnceCell<Mutex> = OnceCell::uninit();
static IN_CRITICAL: AtomicU64 = AtomicU64::new(0);
static VIOLATIONS: AtomicU64 = AtomicU64::new(0);
static PASSES: AtomicU64 = AtomicU64::new(0);

extern "sysv64" fn mutex_worker(_id: u64, _arg: u64) {
    let mutex = MUTEX.get().unwrap();
    for _ in 0..500 {
        mutex.acquire();
        if IN_CRITICAL.fetch_add(1, Ordering::SeqCst) != 0 {
            VIOLATIONS.fetch_add(1, Ordering::SeqCst);
        }
        PASSES.fetch_add(1, Ordering::SeqCst);
        IN_CRITICAL.fetch_sub(1, Ordering::SeqCst);
        mutex.release();
    }
}

#[test_case]
fn mutex_admits_one_thread_at_a_time() {
    MUTEX.try_init_once(Mutex::new).unwrap();

    let a = spawn(mutex_worker, 0, 0);
    let b = spawn(mutex_worker, 1, 0);
    scheduler::wait_thread(0, a).unwrap();
    scheduler::wait_thread(0, b).unwrap();

    assert_eq!(VIOLATIONS.load(Ordering::SeqCst), 0);
    assert_eq!(PASSES.load(Ordering::SeqCst), 1000);
}

// --- preemptive fairness within one nice level ---

static FAIR_END: AtomicU64 = AtomicU64::new(0);
static FAIR_COUNTS: [AtomicU64; 2] = [AtomicU64::new(0), AtomicU64::new(0)];

extern "sysv64" fn fair_worker(_id: u64, arg: u64) {
    let counter = &FAIR_COUNTS[arg as usize];
    let end = FAIR_END.load(Ordering::SeqCst);
    while TICKS.load(Ordering::Relaxed) < end {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[test_case]
fn cpu_bound_threads_share_their_nice_level() {
    let start = TICKS.load(Ordering::SeqCst);
    FAIR_END.store(start + 300, Ordering::SeqCst);

    let a = spawn(fair_worker, 0, 0);
    let b = spawn(fair_worker, 1, 0);
    scheduler::wait_thread(0, a).unwrap();
    scheduler::wait_thread(0, b).unwrap();

    let count_a = FAIR_COUNTS[0].load(Ordering::SeqCst);
    let count_b = FAIR_COUNTS[1].load(Ordering::SeqCst);
    let total = count_a + count_b;
    assert!(total > 0);
    // round robin keeps each within a fraction of half the work
    assert!(
        count_a > total * 35 / 100 && count_a < total * 65 / 100,
        "unfair split: {count_a} vs {count_b}"
    );
}

// --- lifecycle error paths ---

extern "sysv64" fn nobody(_id: u64, _arg: u64) {}

#[test_case]
fn bad_ids_report_the_specific_error() {
    assert_eq!(
        scheduler::wakeup_thread(9999, 0, None),
        Err(Error::NoSuchProcess)
    );
    assert_eq!(scheduler::wait_thread(0, 9999), Err(Error::NoSuchThread));

    let tid = scheduler::create_thread(0, nobody, 0).unwrap();
    assert_eq!(
        scheduler::wakeup_thread(0, tid, Some(7)),
        Err(Error::InvalidNice)
    );

    // exit before it ever ran; a second exit of the zombie is a no-op
    scheduler::exit_thread(0, tid).unwrap();
    scheduler::exit_thread(0, tid).unwrap();
    assert_eq!(scheduler::wakeup_thread(0, tid, None), Err(Error::DeadThread));
    scheduler::wait_thread(0, tid).unwrap();
    assert_eq!(scheduler::wait_thread(0, tid), Err(Error::NoSuchThread));
}

#[test_case]
fn processes_are_reaped_after_their_threads() {
    let pid = scheduler::create_process();
    let tid = scheduler::create_thread(pid, nobody, 0).unwrap();
    scheduler::wakeup_thread(pid, tid, Some(-2)).unwrap();

    scheduler::wait_thread(pid, tid).unwrap();
    scheduler::wait_process(pid).unwrap();
    assert_eq!(scheduler::wait_process(pid), Err(Error::NoSuchProcess));
}
