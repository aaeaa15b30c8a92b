//! The unrecoverable-error path
use core::fmt;

use crate::port::Port;

/// Identifies an internal invariant violation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FatalCode {
    /// A lock was acquired out of the fixed lock order.
    LockOrderViolation,
    /// A scheduler node is missing or is in an unexpected state.
    NodeArenaCorrupted,
    /// A thread was blocked twice or unblocked while not blocked.
    ThreadStateCorrupted,
    /// A waiter's wait flags disagree with the thread queue.
    WaitStateCorrupted,
    /// A watchdog handle does not name an armed watchdog.
    WatchdogCorrupted,
    /// The kernel could not set up the idle threads.
    InitFailed,
}

impl FatalCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockOrderViolation => "LockOrderViolation",
            Self::NodeArenaCorrupted => "NodeArenaCorrupted",
            Self::ThreadStateCorrupted => "ThreadStateCorrupted",
            Self::WaitStateCorrupted => "WaitStateCorrupted",
            Self::WatchdogCorrupted => "WatchdogCorrupted",
            Self::InitFailed => "InitFailed",
        }
    }
}

impl fmt::Debug for FatalCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report an internal invariant violation and halt.
#[cold]
#[inline(never)]
pub(crate) fn fatal(port: &impl Port, code: FatalCode) -> ! {
    log::error!("unrecoverable error: {code:?}");
    port.fatal(code)
}
