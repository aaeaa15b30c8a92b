//! The watchdog engine
//!
//! Watchdogs are kept in a binary min-heap ordered by expiration tick and
//! arming order. Every entry records its heap position so that cancelling a
//! watchdog takes logarithmic time.
//!
//! Expired watchdogs are removed while the watchdog lock is held, and their
//! callbacks run after the lock is released. A callback therefore races with
//! any other path that decides the fate of the same wait, and relies on the
//! wait-flags claim to resolve the race.
use alloc::vec::Vec;
use core::fmt;
use slab::Slab;

use crate::{
    fatal::{fatal, FatalCode},
    klock::{Critical, LockLevel, OrderedLock},
    port::Port,
    utils::binary_heap::{BinaryHeap, BinaryHeapCtx},
};

/// A watchdog callback. The argument is the value given to
/// [`Watchdogs::arm`].
pub(crate) type WatchdogFn<C> = fn(&C, u64);

/// Names an armed watchdog. A handle outlives its watchdog harmlessly:
/// cancelling a fired watchdog is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatchdogHandle {
    key: usize,
    seq: u64,
}

struct Watchdog<C> {
    expire: u64,
    seq: u64,
    callback: WatchdogFn<C>,
    arg: u64,
    heap_pos: usize,
}

struct WatchdogState<C> {
    /// The current tick count.
    now: u64,
    next_seq: u64,
    entries: Slab<Watchdog<C>>,
    /// Keys into `entries`
    heap: Vec<usize>,
}

struct HeapCtx<'a, C> {
    entries: &'a mut Slab<Watchdog<C>>,
}

impl<C> BinaryHeapCtx<usize> for HeapCtx<'_, C> {
    fn lt(&mut self, x: &usize, y: &usize) -> bool {
        let (x, y) = (&self.entries[*x], &self.entries[*y]);
        (x.expire, x.seq) < (y.expire, y.seq)
    }

    fn on_move(&mut self, e: &mut usize, new_index: usize) {
        self.entries[*e].heap_pos = new_index;
    }
}

/// The watchdog list.
pub(crate) struct Watchdogs<C> {
    state: OrderedLock<WatchdogState<C>>,
}

impl<C> Watchdogs<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: OrderedLock::new(
                LockLevel::Watchdog,
                WatchdogState {
                    now: 0,
                    next_seq: 0,
                    entries: Slab::new(),
                    heap: Vec::new(),
                },
            ),
        }
    }

    /// Get the current tick count.
    pub(crate) fn now<P: Port>(&self, cs: &Critical<'_, P>) -> u64 {
        self.state.lock(cs).now
    }

    /// Arm a watchdog that fires `delay` ticks from now.
    pub(crate) fn arm<P: Port>(
        &self,
        cs: &Critical<'_, P>,
        delay: u64,
        callback: WatchdogFn<C>,
        arg: u64,
    ) -> WatchdogHandle {
        let mut guard = self.state.lock(cs);
        let st = &mut *guard;

        let seq = st.next_seq;
        st.next_seq += 1;
        let expire = st.now.saturating_add(delay);
        let key = st.entries.insert(Watchdog {
            expire,
            seq,
            callback,
            arg,
            heap_pos: usize::MAX,
        });
        st.heap.heap_push(
            key,
            HeapCtx {
                entries: &mut st.entries,
            },
        );

        log::trace!("watchdog {key} armed for tick {expire}");
        WatchdogHandle { key, seq }
    }

    /// Cancel a watchdog. Returns `false` if it has already fired or been
    /// cancelled.
    pub(crate) fn cancel<P: Port>(&self, cs: &Critical<'_, P>, handle: WatchdogHandle) -> bool {
        let mut guard = self.state.lock(cs);
        let st = &mut *guard;

        match st.entries.get(handle.key) {
            Some(wd) if wd.seq == handle.seq => {
                let pos = wd.heap_pos;
                let removed = st.heap.heap_remove(
                    pos,
                    HeapCtx {
                        entries: &mut st.entries,
                    },
                );
                if removed != Some(handle.key) {
                    fatal(cs.port(), FatalCode::WatchdogCorrupted);
                }
                st.entries.remove(handle.key);
                log::trace!("watchdog {} cancelled", handle.key);
                true
            }
            _ => false,
        }
    }

    /// Advance the tick count by one and remove every watchdog that expires.
    /// Returns their callbacks in firing order. The caller invokes them after
    /// leaving this method.
    pub(crate) fn advance<P: Port>(&self, cs: &Critical<'_, P>) -> Vec<(WatchdogFn<C>, u64)> {
        let mut guard = self.state.lock(cs);
        let st = &mut *guard;
        st.now += 1;

        let mut fired = Vec::new();
        while let Some(&key) = st.heap.first() {
            if st.entries[key].expire > st.now {
                break;
            }
            st.heap.heap_pop(HeapCtx {
                entries: &mut st.entries,
            });
            let wd = st.entries.remove(key);
            log::trace!("watchdog {key} fired at tick {}", st.now);
            fired.push((wd.callback, wd.arg));
        }
        fired
    }

    /// Get the number of armed watchdogs.
    pub(crate) fn len<P: Port>(&self, cs: &Critical<'_, P>) -> usize {
        self.state.lock(cs).heap.len()
    }
}

impl<C> fmt::Debug for Watchdogs<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Watchdogs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::HostedPort;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<u64>>);

    fn record(log: &Log, arg: u64) {
        log.0.lock().unwrap().push(arg);
    }

    fn run_tick(wds: &Watchdogs<Log>, port: &HostedPort, log: &Log) {
        let fired = {
            let cs = Critical::enter(port);
            wds.advance(&cs)
        };
        for (f, arg) in fired {
            f(log, arg);
        }
    }

    #[test]
    fn fires_in_expiration_then_arming_order() {
        let port = HostedPort::new(1);
        let wds = Watchdogs::<Log>::new();
        let log = Log::default();
        {
            let cs = Critical::enter(&port);
            wds.arm(&cs, 2, record, 20);
            wds.arm(&cs, 1, record, 10);
            wds.arm(&cs, 2, record, 21);
            wds.arm(&cs, 3, record, 30);
        }

        run_tick(&wds, &port, &log);
        assert_eq!(*log.0.lock().unwrap(), [10]);
        run_tick(&wds, &port, &log);
        assert_eq!(*log.0.lock().unwrap(), [10, 20, 21]);
        run_tick(&wds, &port, &log);
        assert_eq!(*log.0.lock().unwrap(), [10, 20, 21, 30]);
    }

    #[test]
    fn cancelled_watchdogs_do_not_fire() {
        let port = HostedPort::new(1);
        let wds = Watchdogs::<Log>::new();
        let log = Log::default();
        let (a, b) = {
            let cs = Critical::enter(&port);
            let a = wds.arm(&cs, 1, record, 1);
            let b = wds.arm(&cs, 1, record, 2);
            assert!(wds.cancel(&cs, a));
            assert!(!wds.cancel(&cs, a));
            (a, b)
        };

        run_tick(&wds, &port, &log);
        assert_eq!(*log.0.lock().unwrap(), [2]);

        let cs = Critical::enter(&port);
        assert!(!wds.cancel(&cs, b));
        assert_eq!(wds.len(&cs), 0);

        // A recycled slot does not match a stale handle
        let c = wds.arm(&cs, 5, record, 3);
        assert_ne!(c, a);
        assert!(!wds.cancel(&cs, a));
        assert!(wds.cancel(&cs, c));
    }
}
