//! Scheduler instances
//!
//! A scheduler instance owns a set of processors and decides which of the
//! ready threads homed on (or helped by) it occupy them. All instances use
//! the same SMP framework, which handles any number of processors; the
//! scheduler kind only selects the ready queue and the mapping from thread
//! priorities to keys.
//!
//! # Node states
//!
//! ```text
//!              enqueue             slot free / preempts
//!  Unscheduled ───────▶ Ready ──────────────────────────▶ Scheduled
//!  Blocked     ───────▶   ▲    ◀────────────────────────     │
//!                         │          preempted (front)       │
//!                         └──── block / withdraw ────────────┘
//!                                      ▼
//!                            Blocked / Unscheduled
//! ```
//!
//! A thread can have nodes in several schedulers. The thread's `scheduled`
//! marker is claimed with a compare-and-swap by whichever scheduler wants to
//! occupy a processor with it, so a thread never runs on two processors at
//! once. A ready node whose thread runs elsewhere is withdrawn lazily when it
//! reaches the front of its queue.
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    dispatch::Actions,
    id::SchedulerId,
    klock::{LockLevel, OrderedLock},
    priority::{Priority, ThreadPriority},
    processor::{Processor, ProcessorSet},
    thread::Thread,
};

pub(crate) mod node;
pub(crate) mod readyqueue;

use self::{
    node::{NodeArena, NodeState, SchedulerNode},
    readyqueue::{BitmapQueue, EdfQueue, InsertAt, Queue, ReadyQueue},
};

/// The maximum number of scheduler instances.
pub const MAX_SCHEDULERS: usize = crate::utils::INDEX_SET_LEN;

/// The first key of the background band of EDF schedulers. Jobs with a
/// deadline use keys below it.
const EDF_BACKGROUND: u64 = 1 << 62;

/// The scheduling algorithm of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Fixed priorities, FIFO among equal priorities.
    Priority,
    /// Earliest deadline first. Threads without a released job run in a
    /// background band ordered by priority.
    Edf,
}

/// A scheduler instance.
#[derive(Debug)]
pub(crate) struct Scheduler {
    pub(crate) index: usize,
    pub(crate) id: SchedulerId,
    pub(crate) kind: SchedulerKind,
    num_levels: usize,
    pub(crate) state: OrderedLock<SchedulerState>,
    /// The number of non-idle threads using this scheduler as their home.
    pub(crate) homed: AtomicUsize,
}

impl Scheduler {
    pub(crate) fn new(index: usize, kind: SchedulerKind, num_levels: usize) -> Self {
        let ready = match kind {
            SchedulerKind::Priority => ReadyQueue::Bitmap(BitmapQueue::new(num_levels)),
            SchedulerKind::Edf => ReadyQueue::Edf(EdfQueue::default()),
        };
        Self {
            index,
            id: SchedulerId::from_index(index),
            kind,
            num_levels,
            state: OrderedLock::new(
                LockLevel::HomeScheduler,
                SchedulerState {
                    index,
                    nodes: NodeArena::new(),
                    ready,
                    slots: Vec::new(),
                },
            ),
            homed: AtomicUsize::new(0),
        }
    }

    /// Map a priority into this scheduler's key space.
    pub(crate) fn priority_key(&self, p: Priority) -> u64 {
        debug_assert!((p.0 as usize) < self.num_levels);
        (self.num_levels - 1 - p.0 as usize) as u64
    }

    /// Compute the key of a thread's node in this scheduler.
    pub(crate) fn key_for(&self, tp: &ThreadPriority) -> u64 {
        let background = self.priority_key(tp.effective(self.index));
        match (self.kind, tp.deadline) {
            (SchedulerKind::Edf, Some(deadline)) => deadline.min(EDF_BACKGROUND - 1),
            (SchedulerKind::Edf, None) => EDF_BACKGROUND + background,
            (SchedulerKind::Priority, _) => background,
        }
    }

    pub(crate) fn homed_threads(&self) -> usize {
        self.homed.load(Ordering::Relaxed)
    }
}

/// A processor owned by a scheduler instance.
#[derive(Debug)]
struct Slot {
    cpu: usize,
    /// The node occupying the processor.
    occupant: usize,
    /// The idle node of the processor.
    idle: usize,
}

/// What scheduler operations need besides the scheduler state.
pub(crate) struct SchedEnv<'a> {
    pub(crate) processors: &'a [Processor],
    pub(crate) actions: &'a mut Actions,
}

/// The lock-protected state of a scheduler instance.
#[derive(Debug)]
pub(crate) struct SchedulerState {
    index: usize,
    pub(crate) nodes: NodeArena,
    ready: ReadyQueue,
    slots: Vec<Slot>,
}

impl SchedulerState {
    /// The processors owned by the scheduler.
    pub(crate) fn processors(&self) -> ProcessorSet {
        self.slots.iter().map(|s| s.cpu).collect()
    }

    pub(crate) fn num_processors(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn node_state(&self, node: usize) -> NodeState {
        self.nodes[node].state
    }

    pub(crate) fn insert_node(&mut self, node: SchedulerNode) -> usize {
        let key = self.nodes.insert(node);
        log::trace!("sched {}: node {key} created for {:?}", self.index, self.nodes[key].thread);
        key
    }

    /// Withdraw and free a node.
    pub(crate) fn free_node(&mut self, node: usize, env: &mut SchedEnv<'_>) {
        self.withdraw(node, env);
        self.nodes.remove(node);
    }

    /// Claim the node's thread for the processor `cpu`.
    fn try_to_schedule(&self, node: usize, cpu: usize) -> bool {
        let n = &self.nodes[node];
        if n.idle {
            return true;
        }
        match n.owner.upgrade() {
            Some(thread) => thread.try_mark_scheduled(self.index, cpu),
            None => false,
        }
    }

    fn unmark_scheduled(&self, node: usize) {
        let n = &self.nodes[node];
        if !n.idle {
            if let Some(thread) = n.owner.upgrade() {
                thread.unmark_scheduled(self.index);
            }
        }
    }

    fn set_occupant(&mut self, slot_i: usize, node: usize, env: &mut SchedEnv<'_>) {
        let slot = &mut self.slots[slot_i];
        slot.occupant = node;
        let cpu = slot.cpu;
        let n = &mut self.nodes[node];
        n.state = NodeState::Scheduled(cpu);
        if env.processors[cpu].set_heir(n.thread) {
            env.actions.request_dispatch(cpu);
        }
    }

    /// Find the slot whose occupant is the least urgent.
    fn lowest_slot(&self) -> Option<usize> {
        let mut lowest: Option<(usize, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let key = self.nodes[slot.occupant].key;
            if lowest.map_or(true, |(_, k)| key > k) {
                lowest = Some((i, key));
            }
        }
        lowest.map(|(i, _)| i)
    }

    fn slot_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.cpu == cpu)
    }

    /// Give a slot whose occupant left to the most urgent ready node, or to
    /// the processor's idle node.
    fn fill_slot(&mut self, slot_i: usize, env: &mut SchedEnv<'_>) {
        let cpu = self.slots[slot_i].cpu;
        loop {
            match self.ready.first(&self.nodes) {
                None => {
                    let idle = self.slots[slot_i].idle;
                    self.set_occupant(slot_i, idle, env);
                    return;
                }
                Some(node) => {
                    self.ready.remove(&mut self.nodes, node);
                    if self.try_to_schedule(node, cpu) {
                        self.set_occupant(slot_i, node, env);
                        return;
                    }
                    // The thread runs elsewhere
                    self.nodes[node].state = NodeState::Unscheduled;
                }
            }
        }
    }

    /// Let ready nodes preempt less urgent scheduled nodes until the most
    /// urgent ready node is no more urgent than every scheduled node.
    pub(crate) fn schedule(&mut self, env: &mut SchedEnv<'_>) {
        while let Some(best) = self.ready.first(&self.nodes) {
            let Some(slot_i) = self.lowest_slot() else {
                return;
            };
            let victim = self.slots[slot_i].occupant;
            if self.nodes[best].key >= self.nodes[victim].key {
                return;
            }

            self.ready.remove(&mut self.nodes, best);
            if !self.try_to_schedule(best, self.slots[slot_i].cpu) {
                self.nodes[best].state = NodeState::Unscheduled;
                continue;
            }

            if self.nodes[victim].idle {
                self.nodes[victim].state = NodeState::Unscheduled;
            } else {
                log::trace!(
                    "sched {}: {:?} preempts {:?}",
                    self.index,
                    self.nodes[best].thread,
                    self.nodes[victim].thread
                );
                self.unmark_scheduled(victim);
                self.nodes[victim].state = NodeState::Ready;
                self.ready.push(&mut self.nodes, victim, InsertAt::Front);
                env.actions.ask_for_help(self.nodes[victim].thread);
            }
            self.set_occupant(slot_i, best, env);
        }
    }

    /// Make a blocked or unscheduled node ready.
    pub(crate) fn enqueue(&mut self, node: usize, at: InsertAt, env: &mut SchedEnv<'_>) {
        match self.nodes[node].state {
            NodeState::Blocked | NodeState::Unscheduled => {}
            NodeState::Ready | NodeState::Scheduled(_) => return,
        }
        if self.nodes[node].idle {
            return;
        }
        self.nodes[node].state = NodeState::Ready;
        self.ready.push(&mut self.nodes, node, at);
        self.schedule(env);
    }

    /// Make a blocked node ready. Its thread queues up behind ready threads
    /// of equal urgency.
    pub(crate) fn unblock(&mut self, node: usize, env: &mut SchedEnv<'_>) {
        self.enqueue(node, InsertAt::Back, env);
    }

    /// Take a node out of the ready queue or off its processor.
    fn take_out(&mut self, node: usize, new_state: NodeState, env: &mut SchedEnv<'_>) {
        match self.nodes[node].state {
            NodeState::Ready => {
                self.ready.remove(&mut self.nodes, node);
            }
            NodeState::Scheduled(cpu) => {
                self.unmark_scheduled(node);
                self.nodes[node].state = new_state;
                if let Some(slot_i) = self.slot_of_cpu(cpu) {
                    self.fill_slot(slot_i, env);
                }
            }
            NodeState::Blocked | NodeState::Unscheduled => {}
        }
        self.nodes[node].state = new_state;
    }

    pub(crate) fn block(&mut self, node: usize, env: &mut SchedEnv<'_>) {
        log::trace!("sched {}: block node {node}", self.index);
        self.take_out(node, NodeState::Blocked, env);
    }

    /// Remove a node from scheduling decisions while its thread stays
    /// ready.
    pub(crate) fn withdraw(&mut self, node: usize, env: &mut SchedEnv<'_>) {
        log::trace!("sched {}: withdraw node {node}", self.index);
        self.take_out(node, NodeState::Unscheduled, env);
    }

    /// Change the key of a node and restore the scheduling invariant.
    pub(crate) fn update_key(&mut self, node: usize, key: u64, env: &mut SchedEnv<'_>) {
        if self.nodes[node].key == key || self.nodes[node].idle {
            return;
        }
        match self.nodes[node].state {
            NodeState::Ready => {
                self.ready.remove(&mut self.nodes, node);
                self.nodes[node].key = key;
                self.ready.push(&mut self.nodes, node, InsertAt::Back);
            }
            _ => self.nodes[node].key = key,
        }
        self.schedule(env);
    }

    /// Let the node's equal-priority peers run first.
    pub(crate) fn yield_node(&mut self, node: usize, env: &mut SchedEnv<'_>) {
        match self.nodes[node].state {
            NodeState::Scheduled(cpu) => {
                let Some(best) = self.ready.first(&self.nodes) else {
                    return;
                };
                if self.nodes[best].key > self.nodes[node].key {
                    return;
                }
                let Some(slot_i) = self.slot_of_cpu(cpu) else {
                    return;
                };
                self.unmark_scheduled(node);
                self.nodes[node].state = NodeState::Ready;
                self.ready.push(&mut self.nodes, node, InsertAt::Back);
                self.fill_slot(slot_i, env);
                env.actions.ask_for_help(self.nodes[node].thread);
            }
            NodeState::Ready => {
                self.ready.remove(&mut self.nodes, node);
                self.ready.push(&mut self.nodes, node, InsertAt::Back);
            }
            NodeState::Blocked | NodeState::Unscheduled => {}
        }
    }

    /// Attach a processor. Its idle thread becomes the filler of the new slot
    /// and ready nodes may take it right away.
    pub(crate) fn add_processor(
        &mut self,
        cpu: usize,
        idle_thread: &Arc<Thread>,
        env: &mut SchedEnv<'_>,
    ) {
        let idle = self.insert_node(SchedulerNode::new_idle(
            idle_thread.id,
            Arc::downgrade(idle_thread),
        ));
        self.slots.push(Slot {
            cpu,
            occupant: idle,
            idle,
        });
        let slot_i = self.slots.len() - 1;
        self.set_occupant(slot_i, idle, env);
        // The new processor may be picked up by the heir chosen above, even
        // if it's unchanged
        env.actions.request_dispatch(cpu);
        self.schedule(env);
    }

    /// Detach a processor. Its occupant goes back to the ready queue.
    pub(crate) fn remove_processor(&mut self, cpu: usize, env: &mut SchedEnv<'_>) {
        let Some(slot_i) = self.slot_of_cpu(cpu) else {
            return;
        };
        let slot = self.slots.remove(slot_i);
        let occupant = slot.occupant;
        if occupant != slot.idle {
            self.unmark_scheduled(occupant);
            self.nodes[occupant].state = NodeState::Ready;
            self.ready.push(&mut self.nodes, occupant, InsertAt::Front);
            env.actions.ask_for_help(self.nodes[occupant].thread);
        }
        self.nodes.remove(slot.idle);

        let processor = &env.processors[cpu];
        if processor.set_heir(processor.idle) {
            env.actions.request_dispatch(cpu);
        }
        self.schedule(env);
    }
}
