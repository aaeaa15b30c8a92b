//! Wait flags: the per-thread cell that decides the outcome of a wait
//!
//! A blocking operation first records its intent to block, then releases
//! the queue lock and blocks the thread in its schedulers, then tries to
//! commit the block. Any path resolving the wait in the meantime (surrender,
//! timeout, flush, delete) claims the cell instead. Both sides use a
//! compare-and-swap, so exactly one of them learns that the thread has to be
//! unblocked.
//!
//! ```text
//!              begin              commit_block
//!  (idle) ─────────────▶ INTEND ───────────────▶ BLOCKED
//!                          │                        │
//!                   claim  │ (Early)        claim   │ (Blocked: resolver
//!                          ▼                        ▼  unblocks the thread)
//!                      READY_AGAIN | status   READY_AGAIN | status
//! ```
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    error::{ResultCode, WaitError},
    id::SyncId,
    threadq::QueueKey,
    timeout::WatchdogHandle,
};

bitflags::bitflags! {
    /// The state bits of [`WaitCell`]. The status of a completed wait is
    /// stored above them.
    pub(crate) struct WaitFlags: u32 {
        const INTEND_TO_BLOCK = 1 << 0;
        const BLOCKED = 1 << 1;
        const READY_AGAIN = 1 << 2;
    }
}

const STATUS_SHIFT: u32 = 8;
const STATE_MASK: u32 = 0xff;

/// The result of [`WaitCell::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The thread has not blocked yet. It will notice the claim when it
    /// tries to commit the block and unblock itself.
    Early,
    /// The thread is blocked. The claimer must unblock it.
    Blocked,
    /// The wait was already resolved.
    Lost,
}

/// The outcome of a wait as reported by [`crate::Kernel::wait_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The thread has no wait in progress or unread.
    NotWaiting,
    /// The thread is waiting.
    Waiting,
    /// The wait has completed with this result. Reading it resets the
    /// thread to [`WaitOutcome::NotWaiting`].
    Completed(Result<(), WaitError>),
}

#[derive(Debug, Default)]
pub(crate) struct WaitCell(AtomicU32);

impl WaitCell {
    /// Record the intent to block. Discards an unread result.
    pub(crate) fn begin(&self) {
        self.0
            .store(WaitFlags::INTEND_TO_BLOCK.bits(), Ordering::Release);
    }

    /// Try to turn an intent into a block. Fails if a resolver has already
    /// claimed the wait, in which case the caller must undo the block.
    pub(crate) fn commit_block(&self) -> bool {
        self.0
            .compare_exchange(
                WaitFlags::INTEND_TO_BLOCK.bits(),
                WaitFlags::BLOCKED.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Decide the outcome of the wait.
    pub(crate) fn claim(&self, status: ResultCode) -> Claim {
        let ready = WaitFlags::READY_AGAIN.bits() | encode_status(status);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let flags = WaitFlags::from_bits_truncate(current & STATE_MASK);
            let claim = if flags == WaitFlags::INTEND_TO_BLOCK {
                Claim::Early
            } else if flags == WaitFlags::BLOCKED {
                Claim::Blocked
            } else {
                return Claim::Lost;
            };
            match self
                .0
                .compare_exchange_weak(current, ready, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return claim,
                Err(x) => current = x,
            }
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        let flags = WaitFlags::from_bits_truncate(self.0.load(Ordering::Acquire) & STATE_MASK);
        flags.intersects(WaitFlags::INTEND_TO_BLOCK | WaitFlags::BLOCKED)
    }

    /// Read the outcome. A completed outcome is consumed.
    pub(crate) fn take_outcome(&self) -> WaitOutcome {
        let current = self.0.load(Ordering::Acquire);
        let flags = WaitFlags::from_bits_truncate(current & STATE_MASK);
        if flags.contains(WaitFlags::READY_AGAIN) {
            if self
                .0
                .compare_exchange(current, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Only `begin` can intervene, which starts a new wait
                return WaitOutcome::Waiting;
            }
            WaitOutcome::Completed(WaitError::from_status(decode_status(current)))
        } else if flags.is_empty() {
            WaitOutcome::NotWaiting
        } else {
            WaitOutcome::Waiting
        }
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

fn encode_status(status: ResultCode) -> u32 {
    u32::from(status as i8 as u8) << STATUS_SHIFT
}

fn decode_status(bits: u32) -> ResultCode {
    ResultCode::from_i8((bits >> STATUS_SHIFT) as u8 as i8).unwrap_or(ResultCode::Unsatisfied)
}

/// The wait state of a thread, protected by the thread-wait lock.
#[derive(Debug, Default)]
pub(crate) struct ThreadWait {
    /// The object the thread waits on and its position in the object's
    /// thread queue.
    pub(crate) queue: Option<(SyncId, QueueKey)>,
    /// The timeout of the current wait.
    pub(crate) watchdog: Option<WatchdogHandle>,
    /// Incremented by every wait. Stale timeouts carry an older value.
    pub(crate) episode: u32,
}

impl ThreadWait {
    /// The argument of the timeout watchdog for the current episode.
    pub(crate) fn timeout_arg(&self, thread: crate::id::ThreadId) -> u64 {
        (u64::from(thread.raw()) << 32) | u64::from(self.episode)
    }
}

/// Split an argument made by [`ThreadWait::timeout_arg`].
pub(crate) fn split_timeout_arg(arg: u64) -> (u32, u32) {
    ((arg >> 32) as u32, arg as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_before_commit_is_early() {
        let cell = WaitCell::default();
        cell.begin();
        assert!(cell.is_waiting());
        assert_eq!(cell.claim(ResultCode::Successful), Claim::Early);
        assert!(!cell.commit_block());
        assert_eq!(cell.claim(ResultCode::Timeout), Claim::Lost);
        assert_eq!(cell.take_outcome(), WaitOutcome::Completed(Ok(())));
        assert_eq!(cell.take_outcome(), WaitOutcome::NotWaiting);
    }

    #[test]
    fn claim_after_commit_unblocks() {
        let cell = WaitCell::default();
        cell.begin();
        assert!(cell.commit_block());
        assert_eq!(cell.take_outcome(), WaitOutcome::Waiting);
        assert_eq!(cell.claim(ResultCode::Timeout), Claim::Blocked);
        assert_eq!(cell.claim(ResultCode::Successful), Claim::Lost);
        assert_eq!(
            cell.take_outcome(),
            WaitOutcome::Completed(Err(WaitError::Timeout))
        );
    }

    #[test]
    fn every_wait_status_survives_encoding() {
        for status in [
            ResultCode::Successful,
            ResultCode::Timeout,
            ResultCode::ObjectWasDeleted,
            ResultCode::Unsatisfied,
        ] {
            assert_eq!(decode_status(encode_status(status)), status);
        }
    }

    #[test]
    fn timeout_arg_round_trip() {
        let dir: crate::id::Directory<(), crate::id::ThreadId> = crate::id::Directory::new(1);
        let (id, _) = dir.allocate(|_| ()).unwrap();
        let w = ThreadWait {
            episode: 7,
            ..Default::default()
        };
        assert_eq!(split_timeout_arg(w.timeout_arg(id)), (id.raw(), 7));
    }
}
