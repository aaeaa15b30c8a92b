//! Per-processor state
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::{id::ThreadId, utils::IndexSet};

/// A set of processor indices.
pub type ProcessorSet = IndexSet;

/// The maximum number of processors.
pub const MAX_PROCESSORS: usize = crate::utils::INDEX_SET_LEN;

const NO_OWNER: usize = usize::MAX;

/// The state of one processor.
#[derive(Debug)]
pub(crate) struct Processor {
    pub(crate) index: usize,
    pub(crate) online: bool,
    /// The scheduler assigned by the configuration, if any. A processor
    /// without one can never be attached to a scheduler.
    pub(crate) configured: Option<usize>,
    /// The idle thread that runs when the owning scheduler has nothing else
    /// for this processor.
    pub(crate) idle: ThreadId,
    /// The index of the owning scheduler, or `NO_OWNER`.
    owner: AtomicUsize,
    /// The thread chosen to run next (raw id).
    heir: AtomicU32,
    /// The thread currently running (raw id).
    executing: AtomicU32,
    dispatch_necessary: AtomicBool,
}

impl Processor {
    pub(crate) fn new(index: usize, online: bool, configured: Option<usize>, idle: ThreadId) -> Self {
        Self {
            index,
            online,
            configured,
            idle,
            owner: AtomicUsize::new(NO_OWNER),
            heir: AtomicU32::new(idle.raw()),
            executing: AtomicU32::new(idle.raw()),
            dispatch_necessary: AtomicBool::new(false),
        }
    }

    pub(crate) fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            x => Some(x),
        }
    }

    /// Claim the processor for a scheduler. Fails if it's already owned.
    /// Only called with the claiming scheduler's lock held.
    pub(crate) fn try_claim(&self, scheduler: usize) -> bool {
        self.owner
            .compare_exchange(NO_OWNER, scheduler, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the processor. Only called with the owning scheduler's lock
    /// held.
    pub(crate) fn release(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    pub(crate) fn heir(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.heir.load(Ordering::Acquire))
    }

    pub(crate) fn executing(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.executing.load(Ordering::Acquire))
    }

    /// Choose the next thread for this processor. Returns `true` if the heir
    /// changed, in which case a dispatch must be requested.
    pub(crate) fn set_heir(&self, thread: ThreadId) -> bool {
        let old = self.heir.swap(thread.raw(), Ordering::AcqRel);
        if old != thread.raw() {
            log::trace!("cpu {}: heir {:?}", self.index, thread);
            self.dispatch_necessary.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_dispatch_necessary(&self) -> bool {
        self.dispatch_necessary.load(Ordering::Acquire)
    }

    /// Complete a context switch: the heir becomes the executing thread.
    pub(crate) fn dispatch(&self) -> Option<ThreadId> {
        self.dispatch_necessary.store(false, Ordering::Release);
        let heir = self.heir.load(Ordering::Acquire);
        self.executing.store(heir, Ordering::Release);
        ThreadId::from_raw(heir)
    }
}

/// The processors owned by each scheduler, for looking up affinity
/// candidates.
pub(crate) fn owners_of(processors: &[Processor], set: ProcessorSet) -> IndexSet {
    set.iter()
        .filter_map(|cpu| processors.get(cpu).and_then(Processor::owner))
        .collect()
}
