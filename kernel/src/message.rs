//! Kernel message queue. Interrupt handlers push, the kernel thread pops and
//! dispatches; pushing also pokes the scheduler so the kernel thread wakes.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

use crate::scheduler;

#[derive(Debug, Clone, Copy)]
pub enum Message {
    LapicTimer,
    /// Raw PS/2 scancode; decoding happens on the kernel thread.
    Keyboard(u8),
}

static QUEUE: OnceCell<ArrayQueue<Message>> = OnceCell::uninit();

pub fn init() {
    QUEUE
        .try_init_once(|| ArrayQueue::new(256))
        .expect("message::init called twice");
}

/// Safe from interrupt context: never blocks, drops the oldest message when
/// full, and only try-locks the scheduler for the wakeup.
pub fn post(message: Message) {
    if let Some(queue) = QUEUE.get() {
        queue.force_push(message);
    }
    scheduler::wakeup_kernel_thread_may_fail();
}

pub fn pop() -> Option<Message> {
    QUEUE.get().and_then(|queue| queue.pop())
}

pub fn is_empty() -> bool {
    QUEUE.get().is_none_or(|queue| queue.is_empty())
}
