//! Thread priorities and the resource obligations that raise them
use alloc::vec::Vec;
use core::fmt;

use crate::{id::SyncId, utils::IndexSet};

/// A thread priority. A higher value is more urgent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// The priority a held resource imposes on its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Boost {
    /// No boost (a plain mutex, or an inheritance mutex without waiters).
    None,
    /// The same boost in every scheduler (inheritance and ceiling).
    Uniform(Priority),
    /// One ceiling per scheduler index (MrsP).
    PerScheduler(Vec<Option<Priority>>),
}

impl Boost {
    fn for_scheduler(&self, scheduler: usize) -> Option<Priority> {
        match self {
            Self::None => None,
            Self::Uniform(p) => Some(*p),
            Self::PerScheduler(ceilings) => ceilings.get(scheduler).copied().flatten(),
        }
    }
}

/// A resource held by a thread.
#[derive(Debug, Clone)]
pub(crate) struct Held {
    pub(crate) object: SyncId,
    pub(crate) boost: Boost,
    /// The schedulers allowed to help the owner while it holds the resource.
    pub(crate) help: IndexSet,
    /// The ceiling below which the owner's base priority must stay, if any.
    pub(crate) ceiling: Option<Priority>,
}

/// The priority bookkeeping of a thread.
#[derive(Debug)]
pub(crate) struct ThreadPriority {
    pub(crate) base: Priority,
    /// Resources held by the thread, in acquisition order.
    pub(crate) held: Vec<Held>,
    /// The absolute deadline of the current job (EDF schedulers only).
    pub(crate) deadline: Option<u64>,
}

impl ThreadPriority {
    pub(crate) fn new(base: Priority) -> Self {
        Self {
            base,
            held: Vec::new(),
            deadline: None,
        }
    }

    /// The effective priority of the thread in the specified scheduler: the
    /// maximum of the base priority and every boost that applies there.
    pub(crate) fn effective(&self, scheduler: usize) -> Priority {
        self.held
            .iter()
            .filter_map(|h| h.boost.for_scheduler(scheduler))
            .fold(self.base, Ord::max)
    }

    /// The union of every held resource's helping schedulers.
    pub(crate) fn help_set(&self) -> IndexSet {
        self.held
            .iter()
            .fold(IndexSet::EMPTY, |acc, h| acc.union(h.help))
    }

    pub(crate) fn owns(&self, object: SyncId) -> bool {
        self.held.iter().any(|h| h.object == object)
    }

    pub(crate) fn held_mut(&mut self, object: SyncId) -> Option<&mut Held> {
        self.held.iter_mut().find(|h| h.object == object)
    }

    pub(crate) fn add_held(&mut self, held: Held) {
        debug_assert!(!self.owns(held.object));
        self.held.push(held);
    }

    pub(crate) fn remove_held(&mut self, object: SyncId) -> Option<Held> {
        let i = self.held.iter().position(|h| h.object == object)?;
        Some(self.held.remove(i))
    }

    /// The lowest ceiling among the held ceiling resources.
    pub(crate) fn lowest_ceiling(&self) -> Option<Priority> {
        self.held.iter().filter_map(|h| h.ceiling).min()
    }
}
