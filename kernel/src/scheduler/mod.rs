//! Preemptive scheduler. Every mutation of scheduler state (processes,
//! threads, ready queues, event waiter lists) happens under one global
//! spinlock; interrupt-context entry points only ever try-lock it and skip
//! the tick when somebody else is mid-operation.
//!
//! Threads are addressed as (process id, thread id). Five ready queues, one
//! per nice level; the running thread is the front of the active queue and
//! preemption rotates it to the back.

pub mod context;
pub mod mutex;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::PhysAddr;
use x86_64::instructions::interrupts;

use crate::error::{Error, Result};
use crate::paging::PageMap;
use crate::sync::{SpinLock, SpinLockGuard};
use crate::{cpu, debug_println, message, paging};
use context::{ThreadContext, switch_contexts};

pub type ProcessId = u32;
pub type ThreadId = u32;
pub type EventId = u32;
pub type Nice = i32;

/// Kernel thread entry: receives (thread id, caller argument).
pub type ThreadEntry = extern "sysv64" fn(u64, u64);

pub const MAX_NICE: Nice = 2;
const QUEUE_COUNT: usize = (2 * MAX_NICE + 1) as usize;

/// Joiners block here; thread exit notifies it.
pub const THREAD_JOINED_EVENT: EventId = 0;

const KERNEL_STACK_BYTES: usize = 64 * 1024;

static SCHEDULER: OnceCell<SpinLock<SchedState>> = OnceCell::uninit();

pub struct Thread {
    pub id: ThreadId,
    pub process: ProcessId,
    pub nice: Nice,
    pub running: bool,
    pub zombie: bool,
    pub cpu: Option<u32>,
    events: Vec<EventId>,
    context: Box<ThreadContext>,
    kstack: Vec<u64>,
    kstack_top: u64,
}

impl Thread {
    fn new(id: ThreadId, process: ProcessId) -> Self {
        Thread {
            id,
            process,
            nice: 0,
            running: false,
            zombie: false,
            cpu: None,
            events: Vec::new(),
            context: Box::new(ThreadContext::zeroed()),
            kstack: Vec::new(),
            kstack_top: 0,
        }
    }

    /// Prepares the context so the first dispatch lands in `entry` with
    /// (id, arg) in the first two argument registers, on a fresh kernel
    /// stack whose bottom word returns into thread exit.
    fn init_context(&mut self, entry: ThreadEntry, arg: u64) {
        self.kstack = vec![0u64; KERNEL_STACK_BYTES / 8];
        let stack_base = self.kstack.as_ptr() as u64;
        let aligned_top = (stack_base + KERNEL_STACK_BYTES as u64) & !0xF;
        let rsp = aligned_top - 8;
        let on_return: extern "sysv64" fn() = thread_return;
        unsafe {
            *(rsp as *mut u64) = on_return as usize as u64;
        }
        self.kstack_top = rsp;

        let ctx = &mut self.context;
        ctx.rip = entry as usize as u64;
        ctx.rdi = self.id as u64;
        ctx.rsi = arg;
        ctx.rsp = rsp;
        ctx.rflags = 0x202;
        ctx.cr3 = paging::kernel_pml4_addr().as_u64();
        ctx.cs = cpu::kernel_cs() as u64;
        ctx.ss = cpu::kernel_ss() as u64;
        ctx.reset_mxcsr();
    }
}

/// State shared outside the scheduler lock: the page map itself (guarded by
/// its own spinlock, ordered below the scheduler lock) and a cached CR3 root
/// so the context switch never has to take the page-map lock.
pub struct ProcessShared {
    pub page_map: Mutex<Option<PageMap>>,
    root: AtomicU64,
}

impl ProcessShared {
    /// Installs (or clears) the user page map and refreshes the cached root.
    pub fn set_page_map(&self, map: Option<PageMap>) {
        let mut guard = self.page_map.lock();
        self.root.store(
            map.as_ref().map_or(0, |m| m.pml4_addr().as_u64()),
            Ordering::Release,
        );
        *guard = map;
    }

    fn root(&self) -> Option<PhysAddr> {
        match self.root.load(Ordering::Acquire) {
            0 => None,
            addr => Some(PhysAddr::new(addr)),
        }
    }
}

pub struct Process {
    pub id: ProcessId,
    threads: Vec<Option<Box<Thread>>>,
    shared: Arc<ProcessShared>,
}

impl Process {
    fn new(id: ProcessId) -> Self {
        Process {
            id,
            threads: Vec::new(),
            shared: Arc::new(ProcessShared {
                page_map: Mutex::new(None),
                root: AtomicU64::new(0),
            }),
        }
    }
}

fn find_empty_slot<T>(slots: &mut Vec<Option<T>>) -> usize {
    match slots.iter().position(Option::is_none) {
        Some(i) => i,
        None => {
            slots.push(None);
            slots.len() - 1
        }
    }
}

struct SchedState {
    processes: Vec<Option<Box<Process>>>,
    run_queues: [VecDeque<(ProcessId, ThreadId)>; QUEUE_COUNT],
    current_nice: Nice,
    reset_current_nice: bool,
    current: (ProcessId, ThreadId),
    kernel_thread: (ProcessId, ThreadId),
    events: Vec<Option<Vec<(ProcessId, ThreadId)>>>,
    boot_pml4: PhysAddr,
}

fn nice_index(nice: Nice) -> usize {
    (nice + MAX_NICE) as usize
}

fn index_nice(index: usize) -> Nice {
    index as Nice - MAX_NICE
}

fn is_valid_nice(nice: Nice) -> bool {
    (-MAX_NICE..=MAX_NICE).contains(&nice)
}

impl SchedState {
    fn process(&self, pid: ProcessId) -> Result<&Process> {
        self.processes
            .get(pid as usize)
            .and_then(|p| p.as_deref())
            .ok_or(Error::NoSuchProcess)
    }

    fn process_mut(&mut self, pid: ProcessId) -> Result<&mut Process> {
        self.processes
            .get_mut(pid as usize)
            .and_then(|p| p.as_deref_mut())
            .ok_or(Error::NoSuchProcess)
    }

    fn thread(&self, id: (ProcessId, ThreadId)) -> Result<&Thread> {
        self.process(id.0)?
            .threads
            .get(id.1 as usize)
            .and_then(|t| t.as_deref())
            .ok_or(Error::NoSuchThread)
    }

    fn thread_mut(&mut self, id: (ProcessId, ThreadId)) -> Result<&mut Thread> {
        self.process_mut(id.0)?
            .threads
            .get_mut(id.1 as usize)
            .and_then(|t| t.as_deref_mut())
            .ok_or(Error::NoSuchThread)
    }

    fn alive_thread_mut(&mut self, id: (ProcessId, ThreadId)) -> Result<&mut Thread> {
        let thread = self.thread_mut(id)?;
        if thread.zombie {
            return Err(Error::DeadThread);
        }
        Ok(thread)
    }

    fn remove_from_queue(&mut self, id: (ProcessId, ThreadId), nice: Nice) {
        self.run_queues[nice_index(nice)].retain(|t| *t != id);
    }

    fn change_nice_of_running(&mut self, id: (ProcessId, ThreadId), nice: Nice) -> Result<()> {
        let current = self.current;
        let thread = self.thread_mut(id)?;
        if thread.nice == nice {
            return Ok(());
        }
        let old = thread.nice;
        thread.nice = nice;

        if id == current {
            let front = self.run_queues[nice_index(old)].pop_front();
            assert_eq!(front, Some(id), "current thread not at queue front");
            self.run_queues[nice_index(nice)].push_front(id);
            self.current_nice = nice;
            if nice > old {
                self.reset_current_nice = true;
            }
        } else {
            self.remove_from_queue(id, old);
            self.run_queues[nice_index(nice)].push_back(id);
            if nice < self.current_nice {
                self.reset_current_nice = true;
            }
        }
        Ok(())
    }

    fn wakeup(&mut self, id: (ProcessId, ThreadId), nice: Option<Nice>) -> Result<()> {
        if let Some(nice) = nice
            && !is_valid_nice(nice)
        {
            return Err(Error::InvalidNice);
        }

        let current_nice = self.current_nice;
        let thread = self.alive_thread_mut(id)?;
        if thread.running {
            return match nice {
                Some(nice) => self.change_nice_of_running(id, nice),
                None => Ok(()),
            };
        }

        if let Some(nice) = nice {
            thread.nice = nice;
        }
        let nice = thread.nice;
        thread.running = true;
        self.run_queues[nice_index(nice)].push_back(id);
        if nice < current_nice {
            self.reset_current_nice = true;
        }
        Ok(())
    }

    /// Rotates the active queue and returns the thread to run next. The
    /// current thread must be at the front of the active queue; threads that
    /// stopped running are dropped instead of rotated.
    fn rotate_and_pick(&mut self) -> (ProcessId, ThreadId) {
        let index = nice_index(self.current_nice);
        let front = self.run_queues[index]
            .pop_front()
            .expect("scheduler: active queue empty");
        assert_eq!(front, self.current, "scheduler: queue front is not current");

        if self.thread(front).map(|t| t.running).unwrap_or(false) {
            self.run_queues[index].push_back(front);
        }
        if self.run_queues[index].is_empty() {
            self.reset_current_nice = true;
        }
        if self.reset_current_nice {
            self.reset_current_nice = false;
            for i in 0..QUEUE_COUNT {
                if !self.run_queues[i].is_empty() {
                    self.current_nice = index_nice(i);
                    break;
                }
            }
        }
        *self.run_queues[nice_index(self.current_nice)]
            .front()
            .expect("scheduler: no runnable thread")
    }

    fn subscribe(&mut self, id: (ProcessId, ThreadId), event: EventId) -> Result<()> {
        self.events
            .get_mut(event as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchEvent)?
            .push(id);
        self.thread_mut(id)?.events.push(event);
        Ok(())
    }

    fn cancel_subscriptions(&mut self, id: (ProcessId, ThreadId)) {
        let events = core::mem::take(&mut self.thread_mut(id).unwrap().events);
        for event in events {
            let waiters = self.events[event as usize]
                .as_mut()
                .expect("scheduler: thread subscribed to a deleted event");
            waiters.retain(|t| *t != id);
        }
    }
}

fn sched() -> &'static SpinLock<SchedState> {
    SCHEDULER.get().expect("scheduler::init not called")
}

/// Picks the next runnable thread and switches to it, releasing the
/// scheduler lock from the switch assembly. Returns (much later) when the
/// suspended thread is dispatched again.
fn switch_current(mut guard: SpinLockGuard<'static, SchedState>) {
    let prev = guard.current;
    let next = guard.rotate_and_pick();
    if next == prev {
        return;
    }
    guard.current = next;

    if let Ok(thread) = guard.thread_mut(prev) {
        thread.cpu = None;
    }

    let cr3 = {
        let process = guard.process(next.0).expect("next thread has no process");
        process
            .shared
            .root()
            .unwrap_or(guard.boot_pml4)
            .as_u64()
    };
    let (next_ctx, prev_ctx) = {
        let thread = guard.thread_mut(next).expect("next thread vanished");
        thread.cpu = Some(cpu::current_id());
        thread.context.cr3 = cr3;
        cpu::set_kernel_stack(thread.kstack_top);
        let next_ctx: *const ThreadContext = &*thread.context;
        let prev_ctx: *mut ThreadContext = &mut *guard
            .thread_mut(prev)
            .expect("previous thread vanished")
            .context;
        (next_ctx, prev_ctx)
    };

    // No interrupt may land between the lock release inside the switch and
    // the final iretq; the restored RFLAGS re-enables them.
    interrupts::disable();
    let lock = unsafe { sched().raw() };
    core::mem::forget(guard);
    unsafe { switch_contexts(next_ctx, prev_ctx, lock) };
}

/// Sleeps `id`. Switches away when it is the calling thread.
fn sleep_locked(mut guard: SpinLockGuard<'static, SchedState>, id: (ProcessId, ThreadId)) {
    let current = guard.current;
    let Ok(thread) = guard.thread_mut(id) else {
        return;
    };
    if !thread.running {
        return;
    }
    thread.running = false;
    if id == current {
        switch_current(guard);
    } else {
        let nice = guard.thread(id).unwrap().nice;
        guard.remove_from_queue(id, nice);
    }
}

fn wait_events_locked(
    mut guard: SpinLockGuard<'static, SchedState>,
    events: &[EventId],
) -> Result<()> {
    for &event in events {
        if guard
            .events
            .get(event as usize)
            .and_then(Option::as_ref)
            .is_none()
        {
            return Err(Error::NoSuchEvent);
        }
    }
    let me = guard.current;
    for &event in events {
        guard.subscribe(me, event)?;
    }
    sleep_locked(guard, me);
    Ok(())
}

fn notify_event_locked(
    guard: &mut SpinLockGuard<'static, SchedState>,
    event: EventId,
) -> Result<()> {
    let waiters = core::mem::take(
        guard
            .events
            .get_mut(event as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchEvent)?,
    );
    for waiter in waiters {
        // woken by this event: drop this subscription, keep the others
        guard.thread_mut(waiter)?.events.retain(|e| *e != event);
        guard.wakeup(waiter, None)?;
    }
    Ok(())
}

fn exit_locked(mut guard: SpinLockGuard<'static, SchedState>, id: (ProcessId, ThreadId)) {
    {
        let Ok(thread) = guard.thread_mut(id) else {
            return;
        };
        if thread.zombie {
            // exiting a zombie twice is a no-op
            return;
        }
        thread.zombie = true;
    }
    guard.cancel_subscriptions(id);
    debug_println!("scheduler: thread exited ({}.{})", id.0, id.1);
    notify_event_locked(&mut guard, THREAD_JOINED_EVENT).expect("thread-joined event missing");
    sleep_locked(guard, id);
}

extern "sysv64" fn thread_return() {
    exit_this_thread();
}

extern "sysv64" fn idle_main(_id: u64, _arg: u64) {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Turns the boot flow into thread (0.0), creates the idle thread, and
/// becomes ready for preemption.
pub fn init() {
    SCHEDULER
        .try_init_once(|| {
            let mut state = SchedState {
                processes: Vec::new(),
                run_queues: [const { VecDeque::new() }; QUEUE_COUNT],
                current_nice: -MAX_NICE,
                reset_current_nice: false,
                current: (0, 0),
                kernel_thread: (0, 0),
                events: vec![Some(Vec::new())], // THREAD_JOINED_EVENT
                boot_pml4: paging::kernel_pml4_addr(),
            };

            // the flow of control that called init becomes thread 0.0
            let mut process = Box::new(Process::new(0));
            let mut boot_thread = Box::new(Thread::new(0, 0));
            boot_thread.nice = -MAX_NICE;
            boot_thread.running = true;
            boot_thread.cpu = Some(cpu::current_id());
            process.threads.push(Some(boot_thread));
            state.processes.push(Some(process));
            state.run_queues[nice_index(-MAX_NICE)].push_back((0, 0));
            state
        })
        .expect("scheduler::init called twice");

    let idle = create_thread(0, idle_main, 0).expect("failed to create idle thread");
    wakeup_thread(0, idle, Some(MAX_NICE)).expect("failed to wake idle thread");
}

pub fn current() -> (ProcessId, ThreadId) {
    sched().lock().current
}

pub fn create_process() -> ProcessId {
    let mut guard = sched().lock();
    let pid = find_empty_slot(&mut guard.processes) as ProcessId;
    guard.processes[pid as usize] = Some(Box::new(Process::new(pid)));
    debug_println!("scheduler: process created ({pid})");
    pid
}

/// The process-shared block, for code that outlives the scheduler lock
/// (page-map setup during ELF startup).
pub fn process_shared(pid: ProcessId) -> Result<Arc<ProcessShared>> {
    Ok(sched().lock().process(pid)?.shared.clone())
}

pub fn create_thread(pid: ProcessId, entry: ThreadEntry, arg: u64) -> Result<ThreadId> {
    let mut guard = sched().lock();
    let process = guard.process_mut(pid)?;
    let tid = find_empty_slot(&mut process.threads) as ThreadId;
    let mut thread = Box::new(Thread::new(tid, pid));
    thread.init_context(entry, arg);
    process.threads[tid as usize] = Some(thread);
    debug_println!("scheduler: thread created ({pid}.{tid})");
    Ok(tid)
}

pub fn wakeup_thread(pid: ProcessId, tid: ThreadId, nice: Option<Nice>) -> Result<()> {
    sched().lock().wakeup((pid, tid), nice)
}

pub fn sleep_thread(pid: ProcessId, tid: ThreadId) -> Result<()> {
    let guard = sched().lock();
    guard.thread((pid, tid))?;
    sleep_locked(guard, (pid, tid));
    Ok(())
}

pub fn sleep_this_thread() {
    let guard = sched().lock();
    let me = guard.current;
    sleep_locked(guard, me);
}

pub fn exit_thread(pid: ProcessId, tid: ThreadId) -> Result<()> {
    let guard = sched().lock();
    guard.thread((pid, tid))?;
    exit_locked(guard, (pid, tid));
    Ok(())
}

pub fn exit_this_thread() -> ! {
    let guard = sched().lock();
    let me = guard.current;
    exit_locked(guard, me);
    unreachable!("zombie thread was scheduled again");
}

/// Joins a thread: blocks until it is a zombie, then destroys it.
pub fn wait_thread(pid: ProcessId, tid: ThreadId) -> Result<()> {
    loop {
        let mut guard = sched().lock();
        let thread = guard.thread((pid, tid))?;
        if thread.zombie {
            guard.process_mut(pid)?.threads[tid as usize] = None;
            return Ok(());
        }
        wait_events_locked(guard, &[THREAD_JOINED_EVENT])?;
    }
}

/// Joins a process: blocks until every thread is joined, then destroys the
/// process (dropping its page map and every frame it owns).
pub fn wait_process(pid: ProcessId) -> Result<()> {
    loop {
        let mut guard = sched().lock();
        let process = guard.process(pid)?;
        if process.threads.iter().all(Option::is_none) {
            guard.processes[pid as usize] = None;
            return Ok(());
        }
        wait_events_locked(guard, &[THREAD_JOINED_EVENT])?;
    }
}

/// Voluntarily gives up the CPU; the caller stays runnable.
pub fn yield_now() {
    switch_current(sched().lock());
}

/// Timer-tick entry. Try-locks the scheduler: a failure means another
/// context is mid-operation, and this tick's preemption is skipped.
pub fn may_switch() {
    let Some(scheduler) = SCHEDULER.get() else {
        return;
    };
    let Some(mut guard) = scheduler.try_lock() else {
        return;
    };
    if !message::is_empty() {
        let kernel_thread = guard.kernel_thread;
        let _ = guard.wakeup(kernel_thread, None);
    }
    switch_current(guard);
}

/// Called when a kernel message is posted, possibly from interrupt context.
pub fn wakeup_kernel_thread_may_fail() {
    let Some(scheduler) = SCHEDULER.get() else {
        return;
    };
    let Some(mut guard) = scheduler.try_lock() else {
        return;
    };
    let kernel_thread = guard.kernel_thread;
    let _ = guard.wakeup(kernel_thread, None);
}

pub fn create_event() -> EventId {
    let mut guard = sched().lock();
    let id = find_empty_slot(&mut guard.events) as EventId;
    guard.events[id as usize] = Some(Vec::new());
    id
}

pub fn delete_event(event: EventId) -> Result<()> {
    let mut guard = sched().lock();
    let waiters = guard
        .events
        .get_mut(event as usize)
        .and_then(Option::as_mut)
        .ok_or(Error::NoSuchEvent)?;
    if !waiters.is_empty() {
        return Err(Error::UnfinishedEvent);
    }
    guard.events[event as usize] = None;
    Ok(())
}

pub fn wait_event(event: EventId) -> Result<()> {
    wait_events_locked(sched().lock(), &[event])
}

pub fn wait_events(events: &[EventId]) -> Result<()> {
    wait_events_locked(sched().lock(), events)
}

/// Subscribes to `event` and sleeps — unless `cancel` returns true once the
/// scheduler lock is held, in which case nothing happens. Returns whether
/// the thread slept. This is the mutex's guard against the wakeup that
/// would otherwise race its subscription.
pub fn wait_event_unless(event: EventId, cancel: impl FnOnce() -> bool) -> Result<bool> {
    let guard = sched().lock();
    if guard
        .events
        .get(event as usize)
        .and_then(Option::as_ref)
        .is_none()
    {
        return Err(Error::NoSuchEvent);
    }
    if cancel() {
        return Ok(false);
    }
    wait_events_locked(guard, &[event])?;
    Ok(true)
}

/// Drops a subscription without waking anybody.
pub fn unwait_event(event: EventId) -> Result<()> {
    unwait_events(&[event])
}

pub fn unwait_events(events: &[EventId]) -> Result<()> {
    let mut guard = sched().lock();
    let me = guard.current;
    for &event in events {
        guard
            .events
            .get_mut(event as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchEvent)?
            .retain(|t| *t != me);
        guard.thread_mut(me)?.events.retain(|e| *e != event);
    }
    Ok(())
}

/// Wakes every waiter. Woken threads lose only this subscription.
pub fn notify_event(event: EventId) -> Result<()> {
    notify_event_locked(&mut sched().lock(), event)
}

/// Waiter-list snapshot, for diagnostics and tests.
pub fn event_waiters(event: EventId) -> Result<Vec<(ProcessId, ThreadId)>> {
    Ok(sched()
        .lock()
        .events
        .get(event as usize)
        .and_then(Option::as_ref)
        .ok_or(Error::NoSuchEvent)?
        .clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn nice_index_roundtrip() {
        for nice in -MAX_NICE..=MAX_NICE {
            assert_eq!(index_nice(nice_index(nice)), nice);
        }
        assert!(!is_valid_nice(MAX_NICE + 1));
        assert!(!is_valid_nice(-MAX_NICE - 1));
    }

    #[test_case]
    fn empty_slots_are_reused() {
        let mut slots: Vec<Option<u32>> = vec![Some(1), None, Some(3)];
        assert_eq!(find_empty_slot(&mut slots), 1);
        slots[1] = Some(2);
        assert_eq!(find_empty_slot(&mut slots), 3);
    }
}
