//! Ready queues
//!
//! A ready queue holds the nodes that are ready but not scheduled, ordered by
//! key (lower is more urgent) and then by insertion order. It stores arena
//! indices only; the nodes themselves live in the scheduler's node arena.
use alloc::{boxed::Box, collections::BTreeMap, vec};

use super::node::NodeArena;
use crate::utils::{intrusive_list::ListHead, PrioBitmap};

/// Where a node is inserted among the nodes with an equal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertAt {
    /// Ahead of its peers. Used for preempted nodes, which keep their turn.
    Front,
    /// Behind its peers.
    Back,
}

/// The interface of a ready queue.
///
/// A node's key must not change while it's in a queue.
pub(crate) trait Queue: private::Sealed {
    fn push(&mut self, nodes: &mut NodeArena, node: usize, at: InsertAt);

    fn remove(&mut self, nodes: &mut NodeArena, node: usize);

    /// Get the most urgent node.
    fn first(&self, nodes: &NodeArena) -> Option<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::BitmapQueue {}
    impl Sealed for super::EdfQueue {}
    impl Sealed for super::ReadyQueue {}
}

/// A ready queue for fixed-priority scheduling: one FIFO list per key plus
/// a bitmap of the non-empty lists.
#[derive(Debug)]
pub(crate) struct BitmapQueue {
    bitmap: PrioBitmap,
    lists: Box<[ListHead]>,
    len: usize,
}

impl BitmapQueue {
    pub(crate) fn new(num_keys: usize) -> Self {
        Self {
            bitmap: PrioBitmap::new(num_keys),
            lists: vec![ListHead::new(); num_keys].into_boxed_slice(),
            len: 0,
        }
    }
}

impl Queue for BitmapQueue {
    fn push(&mut self, nodes: &mut NodeArena, node: usize, at: InsertAt) {
        let level = nodes[node].key as usize;
        let list = &mut self.lists[level];
        match at {
            InsertAt::Front => list.push_front(nodes, node),
            InsertAt::Back => list.push_back(nodes, node),
        }
        self.bitmap.set(level);
        self.len += 1;
    }

    fn remove(&mut self, nodes: &mut NodeArena, node: usize) {
        let level = nodes[node].key as usize;
        let list = &mut self.lists[level];
        list.remove(nodes, node);
        if list.is_empty() {
            self.bitmap.clear(level);
        }
        self.len -= 1;
    }

    fn first(&self, _: &NodeArena) -> Option<usize> {
        self.bitmap
            .find_set()
            .and_then(|level| self.lists[level].first)
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A ready queue for deadline scheduling, where keys are absolute deadlines
/// and too sparse for a bitmap.
#[derive(Debug, Default)]
pub(crate) struct EdfQueue {
    tree: BTreeMap<(u64, i64), usize>,
    front_seq: i64,
    back_seq: i64,
}

impl Queue for EdfQueue {
    fn push(&mut self, nodes: &mut NodeArena, node: usize, at: InsertAt) {
        let seq = match at {
            InsertAt::Front => {
                self.front_seq -= 1;
                self.front_seq
            }
            InsertAt::Back => {
                self.back_seq += 1;
                self.back_seq
            }
        };
        let entry = (nodes[node].key, seq);
        nodes[node].edf_entry = Some(entry);
        self.tree.insert(entry, node);
    }

    fn remove(&mut self, nodes: &mut NodeArena, node: usize) {
        if let Some(entry) = nodes[node].edf_entry.take() {
            self.tree.remove(&entry);
        } else {
            debug_assert!(false, "node {node} is not queued");
        }
    }

    fn first(&self, _: &NodeArena) -> Option<usize> {
        self.tree.values().next().copied()
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}

/// The ready queue of a scheduler instance, selected by the scheduler kind.
#[derive(Debug)]
pub(crate) enum ReadyQueue {
    Bitmap(BitmapQueue),
    Edf(EdfQueue),
}

impl Queue for ReadyQueue {
    #[inline]
    fn push(&mut self, nodes: &mut NodeArena, node: usize, at: InsertAt) {
        match self {
            Self::Bitmap(q) => q.push(nodes, node, at),
            Self::Edf(q) => q.push(nodes, node, at),
        }
    }

    #[inline]
    fn remove(&mut self, nodes: &mut NodeArena, node: usize) {
        match self {
            Self::Bitmap(q) => q.remove(nodes, node),
            Self::Edf(q) => q.remove(nodes, node),
        }
    }

    #[inline]
    fn first(&self, nodes: &NodeArena) -> Option<usize> {
        match self {
            Self::Bitmap(q) => q.first(nodes),
            Self::Edf(q) => q.first(nodes),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        match self {
            Self::Bitmap(q) => q.len(),
            Self::Edf(q) => q.len(),
        }
    }
}
