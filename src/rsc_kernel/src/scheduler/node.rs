//! Scheduler nodes
use alloc::sync::Weak;
use slab::Slab;

use crate::{
    id::ThreadId,
    thread::Thread,
    utils::intrusive_list::{Link, LinkArena},
};

/// The node arena of one scheduler instance.
pub(crate) type NodeArena = Slab<SchedulerNode>;

/// The key of idle nodes. Every other key is more urgent.
pub(crate) const IDLE_KEY: u64 = u64::MAX;

/// The state of a scheduler node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// The node does not take part in scheduling decisions although its
    /// thread may be ready. Fresh helping nodes and nodes withdrawn because
    /// their thread runs elsewhere are in this state.
    Unscheduled,
    /// The thread is blocked.
    Blocked,
    /// The node is in the ready queue.
    Ready,
    /// The node occupies the processor with this index.
    Scheduled(usize),
}

/// Associates a thread with a scheduler instance.
#[derive(Debug)]
pub(crate) struct SchedulerNode {
    pub(crate) thread: ThreadId,
    /// Non-owning back reference. The thread frees its nodes before it dies.
    pub(crate) owner: Weak<Thread>,
    /// The thread's priority mapped into the scheduler's key space.
    pub(crate) key: u64,
    pub(crate) state: NodeState,
    pub(crate) idle: bool,
    pub(crate) link: Option<Link>,
    pub(crate) edf_entry: Option<(u64, i64)>,
}

impl SchedulerNode {
    pub(crate) fn new(thread: ThreadId, owner: Weak<Thread>, key: u64) -> Self {
        Self {
            thread,
            owner,
            key,
            state: NodeState::Blocked,
            idle: false,
            link: None,
            edf_entry: None,
        }
    }

    pub(crate) fn new_idle(thread: ThreadId, owner: Weak<Thread>) -> Self {
        Self {
            idle: true,
            state: NodeState::Unscheduled,
            ..Self::new(thread, owner, IDLE_KEY)
        }
    }
}

impl LinkArena for NodeArena {
    #[inline]
    fn link(&self, i: usize) -> Option<Link> {
        self[i].link
    }

    #[inline]
    fn set_link(&mut self, i: usize, link: Option<Link>) {
        self[i].link = link;
    }
}

/// Names a node in a specific scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    pub(crate) scheduler: usize,
    pub(crate) key: usize,
}
