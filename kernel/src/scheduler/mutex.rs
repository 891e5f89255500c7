//! Scheduler-aware mutex: an atomic flag plus a wait event. Contended
//! acquirers block on the event instead of spinning; release notifies every
//! waiter and they race the retry (non-strict FIFO, a fresh acquirer may win
//! against a just-notified waiter).

use core::sync::atomic::{AtomicBool, Ordering};

use crate::scheduler::{self, EventId};

pub struct Mutex {
    flag: AtomicBool,
    event: EventId,
}

impl Mutex {
    /// The scheduler must be up; the mutex owns one event for its lifetime.
    pub fn new() -> Self {
        Mutex {
            flag: AtomicBool::new(false),
            event: scheduler::create_event(),
        }
    }

    pub fn acquire(&self) {
        loop {
            if !self.flag.swap(true, Ordering::Acquire) {
                return;
            }
            // The re-check runs under the scheduler lock, so a release that
            // slipped in between the failed swap and the subscription cannot
            // strand us on the event.
            let slept = scheduler::wait_event_unless(self.event, || {
                !self.flag.swap(true, Ordering::Acquire)
            })
            .expect("mutex wait event disappeared");
            if !slept {
                return;
            }
        }
    }

    pub fn release(&self) {
        self.flag.store(false, Ordering::Release);
        let _ = scheduler::notify_event(self.event);
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        self.acquire();
        MutexGuard { mutex: self }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let _ = scheduler::delete_event(self.event);
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// A value only reachable while holding its mutex. The blocking counterpart
/// of `spin::Mutex` for data held across driver waits.
pub struct Critical<T> {
    mutex: Mutex,
    data: core::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Critical<T> {}
unsafe impl<T: Send> Sync for Critical<T> {}

impl<T> Critical<T> {
    pub fn new(data: T) -> Self {
        Critical {
            mutex: Mutex::new(),
            data: core::cell::UnsafeCell::new(data),
        }
    }

    pub fn access(&self) -> CriticalGuard<'_, T> {
        self.mutex.acquire();
        CriticalGuard { critical: self }
    }
}

pub struct CriticalGuard<'a, T> {
    critical: &'a Critical<T>,
}

impl<T> core::ops::Deref for CriticalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.critical.data.get() }
    }
}

impl<T> core::ops::DerefMut for CriticalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.critical.data.get() }
    }
}

impl<T> Drop for CriticalGuard<'_, T> {
    fn drop(&mut self) {
        self.critical.mutex.release();
    }
}
