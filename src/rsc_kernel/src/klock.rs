//! Critical sections and the kernel lock hierarchy
//!
//! Every piece of shared kernel state lives in an [`OrderedLock`]. Taking one
//! requires a [`Critical`] guard, which keeps kernel-managed interrupts masked
//! on the current processor for as long as it lives. Locks are tagged with a
//! [`LockLevel`] and must be acquired in strictly increasing level order.
//! Debug builds check this at run time and report violations through the
//! fatal-error path.
use core::{cell::Cell, fmt, ops};

use crate::{
    fatal::{fatal, FatalCode},
    port::Port,
};

/// The position of a lock in the lock hierarchy. A lock can only be taken
/// while every held lock has a lower level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum LockLevel {
    /// The wait state of a thread (the thread-state lock).
    ThreadWait = 0,
    /// The state of a synchronization object, including its thread queue.
    Queue = 1,
    /// The priority bookkeeping of a thread.
    ThreadPriority = 2,
    /// The watchdog heap.
    Watchdog = 3,
    /// The scheduling state of a thread: its run state, pin level and the
    /// list of its scheduler nodes.
    ThreadSched = 4,
    /// A scheduler taken before the home scheduler during unpin.
    PinnedScheduler = 5,
    /// A scheduler.
    HomeScheduler = 6,
}

impl LockLevel {
    #[inline]
    const fn bit(self) -> u32 {
        1 << self as u8
    }

    /// The mask of this level and every level above it.
    #[inline]
    const fn at_or_above(self) -> u32 {
        !(self.bit() - 1)
    }
}

/// A scoped critical section. Kernel-managed interrupts stay masked on the
/// current processor while it exists.
pub(crate) struct Critical<'a, P: Port> {
    port: &'a P,
    /// The set of lock levels currently held through this guard. Only
    /// maintained in debug builds.
    held: Cell<u32>,
}

impl<'a, P: Port> Critical<'a, P> {
    #[inline]
    pub(crate) fn enter(port: &'a P) -> Self {
        port.enter_cpu_lock();
        Self {
            port,
            held: Cell::new(0),
        }
    }

    #[inline]
    pub(crate) fn port(&self) -> &'a P {
        self.port
    }

    #[inline]
    fn note_acquire(&self, level: LockLevel) {
        if cfg!(debug_assertions) {
            let held = self.held.get();
            if held & level.at_or_above() != 0 {
                log::error!("taking {level:?} while holding {held:#09b}");
                fatal(self.port, FatalCode::LockOrderViolation);
            }
            self.held.set(held | level.bit());
        }
    }

    #[inline]
    fn note_release(&self, level: LockLevel) {
        if cfg!(debug_assertions) {
            self.held.set(self.held.get() & !level.bit());
        }
    }

    /// Assert that no lock is held. Used before running code that may take
    /// locks at any level.
    #[inline]
    pub(crate) fn assert_unlocked(&self) {
        if cfg!(debug_assertions) && self.held.get() != 0 {
            fatal(self.port, FatalCode::LockOrderViolation);
        }
    }
}

impl<P: Port> Drop for Critical<'_, P> {
    #[inline]
    fn drop(&mut self) {
        debug_assert_eq!(self.held.get(), 0);
        self.port.leave_cpu_lock();
    }
}

/// A spinlock with a fixed place in the lock hierarchy.
pub(crate) struct OrderedLock<T> {
    level: LockLevel,
    inner: spin::Mutex<T>,
}

impl<T> OrderedLock<T> {
    pub(crate) const fn new(level: LockLevel, x: T) -> Self {
        Self {
            level,
            inner: spin::Mutex::new(x),
        }
    }

    /// Acquire the lock at its own level.
    #[inline]
    pub(crate) fn lock<'a, P: Port>(&'a self, cs: &'a Critical<'a, P>) -> OrderedGuard<'a, T, P> {
        self.lock_at(cs, self.level)
    }

    /// Acquire the lock at the specified level. Schedulers use this to
    /// distinguish the pinned scheduler from the home scheduler when both
    /// are held.
    #[inline]
    pub(crate) fn lock_at<'a, P: Port>(
        &'a self,
        cs: &'a Critical<'a, P>,
        level: LockLevel,
    ) -> OrderedGuard<'a, T, P> {
        cs.note_acquire(level);
        OrderedGuard {
            guard: self.inner.lock(),
            cs,
            level,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.try_lock() {
            Some(x) => f.debug_tuple("OrderedLock").field(&*x).finish(),
            None => f.write_str("OrderedLock(< locked >)"),
        }
    }
}

/// RAII guard of [`OrderedLock`].
pub(crate) struct OrderedGuard<'a, T, P: Port> {
    guard: spin::MutexGuard<'a, T>,
    cs: &'a Critical<'a, P>,
    level: LockLevel,
}

impl<T, P: Port> Drop for OrderedGuard<'_, T, P> {
    #[inline]
    fn drop(&mut self) {
        self.cs.note_release(self.level);
    }
}

impl<T, P: Port> ops::Deref for OrderedGuard<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T, P: Port> ops::DerefMut for OrderedGuard<'_, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::HostedPort;

    #[test]
    fn ascending_order_is_accepted() {
        let port = HostedPort::new(1);
        let cs = Critical::enter(&port);
        let a = OrderedLock::new(LockLevel::ThreadWait, 1);
        let b = OrderedLock::new(LockLevel::Queue, 2);
        let c = OrderedLock::new(LockLevel::HomeScheduler, 3);
        let ga = a.lock(&cs);
        let gb = b.lock(&cs);
        let gc = c.lock_at(&cs, LockLevel::PinnedScheduler);
        assert_eq!(*ga + *gb + *gc, 6);
        drop((gc, gb, ga));

        // Released levels can be taken again
        let gb = b.lock(&cs);
        drop(gb);
        cs.assert_unlocked();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "LockOrderViolation"))]
    fn descending_order_is_fatal() {
        let port = HostedPort::new(1);
        let cs = Critical::enter(&port);
        let a = OrderedLock::new(LockLevel::ThreadWait, ());
        let b = OrderedLock::new(LockLevel::Queue, ());
        let _gb = b.lock(&cs);
        let _ga = a.lock(&cs);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "LockOrderViolation"))]
    fn same_level_twice_is_fatal() {
        let port = HostedPort::new(1);
        let cs = Critical::enter(&port);
        let a = OrderedLock::new(LockLevel::ThreadWait, ());
        let b = OrderedLock::new(LockLevel::ThreadWait, ());
        let _ga = a.lock(&cs);
        let _gb = b.lock(&cs);
    }
}
