//! Deferred actions
//!
//! Operations that change the state of several threads collect the follow-up
//! work in [`Actions`] while holding locks, and carry it out once every lock
//! is released. This keeps each critical section short and makes it possible
//! to follow chains of priority inheritance without nesting queue locks.
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use crate::{
    id::{SyncId, ThreadId},
    klock::Critical,
    port::Port,
    processor::ProcessorSet,
    thread::Thread,
    Kernel,
};

/// The maximum number of priority propagation steps carried out by one
/// commit. An ownership cycle that slipped past the deadlock check would
/// otherwise propagate forever. Unblocking and helping are not limited.
const MAX_PROPAGATION_STEPS: usize = 4096;

#[derive(Debug, Default)]
pub(crate) struct Actions {
    /// Threads whose effective priority may have changed.
    reprioritize: Vec<ThreadId>,
    /// Mutexes whose owner's boost must be recomputed.
    boost: Vec<SyncId>,
    /// Threads whose wait was claimed while they were blocked, in claim
    /// order.
    unblock: VecDeque<Arc<Thread>>,
    /// Ready threads to offer to the schedulers that can help them.
    help: Vec<ThreadId>,
    /// Processors whose heir changed.
    dispatch: ProcessorSet,
}

impl Actions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reprioritize(&mut self, thread: ThreadId) {
        push_unique(&mut self.reprioritize, thread);
    }

    pub(crate) fn boost(&mut self, object: SyncId) {
        push_unique(&mut self.boost, object);
    }

    pub(crate) fn unblock(&mut self, thread: Arc<Thread>) {
        self.unblock.push_back(thread);
    }

    pub(crate) fn ask_for_help(&mut self, thread: ThreadId) {
        push_unique(&mut self.help, thread);
    }

    pub(crate) fn request_dispatch(&mut self, cpu: usize) {
        self.dispatch.insert(cpu);
    }

    fn is_propagating(&self) -> bool {
        !self.reprioritize.is_empty() || !self.boost.is_empty()
    }
}

fn push_unique<T: PartialEq>(v: &mut Vec<T>, x: T) {
    if !v.contains(&x) {
        v.push(x);
    }
}

impl<P: Port> Kernel<P> {
    /// Carry out deferred actions. Must be called with no lock held.
    pub(crate) fn commit(&self, cs: &Critical<'_, P>, mut actions: Actions) {
        cs.assert_unlocked();

        let mut propagation_steps = 0;
        loop {
            if actions.is_propagating() {
                if propagation_steps < MAX_PROPAGATION_STEPS {
                    propagation_steps += 1;
                    if let Some(thread) = actions.reprioritize.pop() {
                        if let Some(thread) = self.threads.get(thread) {
                            self.reprioritize_thread(cs, &thread, &mut actions);
                        }
                    } else if let Some(object) = actions.boost.pop() {
                        if let Some(object) = self.syncs.get(object) {
                            self.recompute_boost(cs, &object, &mut actions);
                        }
                    }
                    continue;
                }
                log::warn!(
                    "priority propagation did not settle; dropping {:?} {:?}",
                    actions.reprioritize,
                    actions.boost
                );
                actions.reprioritize.clear();
                actions.boost.clear();
            }

            if let Some(thread) = actions.unblock.pop_front() {
                self.unblock_thread(cs, &thread, &mut actions);
            } else if let Some(thread) = actions.help.pop() {
                if let Some(thread) = self.threads.get(thread) {
                    self.update_helping(cs, &thread, &mut actions);
                }
            } else {
                break;
            }
        }

        for cpu in actions.dispatch.iter() {
            self.port.request_dispatch(cpu);
        }
    }
}
