//! Kernel log ring. `printk` appends to a fixed ring buffer and mirrors the
//! text to the QEMU debugcon so logs survive even when no console is mounted.

use core::fmt;
use core::fmt::Write;

use spin::Mutex;
use x86_64::instructions::port::Port;

const RING_SIZE: usize = 16 * 1024;

pub static LOG_RING: Mutex<LogRing> = Mutex::new(LogRing::new());

pub struct LogRing {
    buffer: [u8; RING_SIZE],
    head: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        LogRing {
            buffer: [0; RING_SIZE],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.buffer[(self.head + self.len) % RING_SIZE] = *byte;
            if self.len < RING_SIZE {
                self.len += 1;
            } else {
                self.head = (self.head + 1) % RING_SIZE; // oldest byte falls off
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Copies the newest-to-oldest contents into `out`, oldest first.
    /// Returns the number of bytes written.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        let skip = self.len - n;
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.buffer[(self.head + skip + i) % RING_SIZE];
        }
        n
    }
}

impl fmt::Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

/// Appends to the log ring and mirrors to the debugcon.
pub fn printk(args: fmt::Arguments) {
    let _ = LOG_RING.lock().write_fmt(args);
    let _ = DebugCons.write_fmt(args);
}

/// QEMU debugcon (`-debugcon stdio`), one byte at a time to port 0xe9.
pub struct DebugCons;

impl fmt::Write for DebugCons {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        unsafe {
            for c in s.as_bytes() {
                Port::new(0xe9).write(*c);
            }
        }

        Ok(())
    }
}

#[macro_export]
macro_rules! kernel_log {
    () => {
        $crate::log::printk(format_args!("\n"));
    };
    ($($arg:tt)*) => {
        $crate::log::printk(format_args!("{}\n", format_args!($($arg)*)));
    };
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        let _ = <$crate::log::DebugCons as core::fmt::Write>::write_fmt(&mut $crate::log::DebugCons {}, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! debug_println {
    () => {
        $crate::debug_print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::debug_print!("{}\n", format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ring_keeps_newest_bytes() {
        let mut ring = LogRing::new();
        ring.push(b"abc");
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");

        // overflow by more than the ring size, oldest bytes must fall off
        for _ in 0..RING_SIZE {
            ring.push(b"x");
        }
        ring.push(b"end");
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out[1..], b"end");
    }
}
