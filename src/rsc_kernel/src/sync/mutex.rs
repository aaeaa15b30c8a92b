//! Mutexes and their locking protocols
//!
//! The owner of a mutex records a [`Held`] entry in its priority
//! bookkeeping. The entry describes what the mutex imposes on the owner:
//!
//!  - `None`: nothing.
//!  - `Inherit`: the highest priority among the waiters.
//!  - `Ceiling`: the ceiling, from the moment of acquisition.
//!  - `Mrsp`: the ceiling of each scheduler, and the waiters' home
//!    schedulers as helping schedulers.
//!
//! Entries whose content depends on the waiters are recomputed through
//! [`Actions::boost`] whenever the waiter set changes. A change of the
//! owner's effective priority repositions the owner in the queue it waits
//! on, which in turn recomputes the boost of that queue's owner. This is how
//! inheritance propagates along a chain of owners without nesting queue
//! locks.
use alloc::{sync::Arc, vec::Vec};

use crate::{
    dispatch::Actions,
    error::{ResultCode, SeizeError, SurrenderError},
    klock::Critical,
    port::Port,
    priority::{Boost, Held, Priority},
    thread::Thread,
    utils::IndexSet,
    Kernel,
};

use super::{Protocol, SeizeStatus, SyncKind, SyncObject, SyncState, Variant, WaitOption};

#[derive(Debug)]
pub(crate) struct MutexState {
    pub(crate) owner: Option<Arc<Thread>>,
    pub(crate) nest: u32,
    /// The ceiling per scheduler index. Empty for protocols without a
    /// ceiling.
    pub(crate) ceilings: Vec<Option<Priority>>,
}

impl MutexState {
    pub(crate) fn new(ceilings: Vec<Option<Priority>>) -> Self {
        Self {
            owner: None,
            nest: 0,
            ceilings,
        }
    }

    fn is_owned_by(&self, thread: &Thread) -> bool {
        self.owner.as_ref().map_or(false, |o| o.id == thread.id)
    }
}

/// Compute what `object` imposes on an owner homed on `home`.
fn held_entry(object: &SyncObject, st: &SyncState, home: usize) -> Held {
    let mut held = Held {
        object: object.id,
        boost: Boost::None,
        help: IndexSet::EMPTY,
        ceiling: None,
    };
    let Variant::Mutex(m) = &st.variant else {
        return held;
    };
    match object.attr.protocol {
        Protocol::None => {}
        Protocol::Inherit => {
            if let Some(p) = st.queue.max_priority() {
                held.boost = Boost::Uniform(p);
            }
        }
        Protocol::Ceiling => {
            if let Some(c) = m.ceilings.iter().copied().flatten().next() {
                held.boost = Boost::Uniform(c);
                held.ceiling = Some(c);
            }
        }
        Protocol::Mrsp => {
            held.boost = Boost::PerScheduler(m.ceilings.clone());
            held.ceiling = m.ceilings.get(home).copied().flatten();
            held.help = st.queue.iter().map(|w| w.thread.home()).collect();
        }
    }
    held
}

impl<P: Port> Kernel<P> {
    /// Check whether `thread` waiting on `object` would close a cycle of
    /// mutex owners. The walk takes one lock at a time, so a concurrently
    /// changing chain can slip past it; [`Kernel::commit`] bounds the
    /// propagation that such a cycle causes.
    fn would_deadlock(&self, cs: &Critical<'_, P>, thread: &Thread, object: &SyncObject) -> bool {
        let mut object = match self.syncs.get(object.id) {
            Some(x) => x,
            None => return false,
        };
        for _ in 0..self.threads.capacity() {
            let owner = match &object.state.lock(cs).variant {
                Variant::Mutex(m) => m.owner.clone(),
                _ => None,
            };
            let Some(owner) = owner else {
                return false;
            };
            if owner.id == thread.id {
                return true;
            }
            let Some((next, _)) = owner.wait.lock(cs).queue else {
                return false;
            };
            match self.syncs.get(next) {
                Some(next) if next.attr.kind == SyncKind::Mutex => object = next,
                _ => return false,
            }
        }
        true
    }

    pub(super) fn mutex_seize(
        &self,
        thread: &Arc<Thread>,
        object: &SyncObject,
        option: WaitOption,
        timeout: u64,
    ) -> Result<SeizeStatus, SeizeError> {
        let cs = Critical::enter(&self.port);
        if option == WaitOption::Wait && self.would_deadlock(&cs, thread, object) {
            return Err(SeizeError::WouldDeadlock);
        }

        let mut actions = Actions::new();
        {
            let mut w = thread.wait.lock(&cs);
            Self::check_not_waiting(thread)?;
            let mut st = object.state.lock(&cs);
            if st.deleted {
                return Err(SeizeError::InvalidId);
            }
            let attr = object.attr;
            let home = thread.home();
            let Variant::Mutex(m) = &mut st.variant else {
                return Err(SeizeError::NotDefined);
            };

            if m.is_owned_by(thread) {
                if !attr.recursive {
                    return Err(SeizeError::Unsatisfied);
                }
                m.nest += 1;
                return Ok(SeizeStatus::Acquired);
            }

            if matches!(attr.protocol, Protocol::Ceiling | Protocol::Mrsp) {
                let ceiling = m.ceilings.get(home).copied().flatten();
                let effective = thread.priority.lock(&cs).effective(home);
                if ceiling.map_or(true, |c| effective > c) {
                    return Err(SeizeError::CeilingViolated);
                }
            }

            if m.owner.is_none() {
                self.grant_mutex(&cs, object, &mut st, thread, 1, &mut actions);
                drop(st);
                drop(w);
                self.commit(&cs, actions);
                return Ok(SeizeStatus::Acquired);
            }

            if option == WaitOption::NoWait {
                return Err(SeizeError::Unsatisfied);
            }
            self.enqueue_waiter(&cs, thread, &mut w, object.id, &mut st, timeout, 1);
            self.note_waiters_changed(object, &mut actions);
        }
        self.finish_block(&cs, thread, &mut actions);
        self.commit(&cs, actions);
        Ok(SeizeStatus::Blocked)
    }

    /// Make `thread` the owner of a free mutex.
    pub(crate) fn grant_mutex(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        st: &mut SyncState,
        thread: &Arc<Thread>,
        nest: u32,
        actions: &mut Actions,
    ) {
        let held = held_entry(object, st, thread.home());
        let Some(m) = st.mutex_mut() else {
            return;
        };
        m.owner = Some(Arc::clone(thread));
        m.nest = nest.max(1);
        log::trace!("{:?} acquires {:?}", thread.id, object.id);

        if held.boost != Boost::None {
            actions.reprioritize(thread.id);
        }
        if !held.help.is_empty() {
            actions.ask_for_help(thread.id);
        }
        thread.priority.lock(cs).add_held(held);
    }

    /// Release a mutex owned by `thread`. The nest level is decremented
    /// unless `full_release` is set. Once released, ownership passes to the
    /// first waiter.
    pub(crate) fn mutex_surrender(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        object: &SyncObject,
        full_release: bool,
        actions: &mut Actions,
    ) -> Result<(), SurrenderError> {
        self.with_head(cs, object, |st, head| {
            if st.deleted {
                return Err(SurrenderError::InvalidId);
            }
            let m = st.mutex_mut().ok_or(SurrenderError::InvalidId)?;
            if !m.is_owned_by(thread) {
                return Err(SurrenderError::NotOwner);
            }
            if !full_release && m.nest > 1 {
                m.nest -= 1;
                return Ok(());
            }

            m.owner = None;
            m.nest = 0;
            log::trace!("{:?} releases {:?}", thread.id, object.id);
            if let Some(held) = thread.priority.lock(cs).remove_held(object.id) {
                if held.boost != Boost::None {
                    actions.reprioritize(thread.id);
                }
                if !held.help.is_empty() {
                    actions.ask_for_help(thread.id);
                }
            }

            if let Some(head) = head {
                if let Some(waiter) = st.queue.remove(head.key) {
                    st.waiters_changed();
                    let status = waiter.pending.unwrap_or(ResultCode::Successful);
                    self.grant_mutex(cs, object, st, head.thread, waiter.nest, actions);
                    self.resolve(cs, head.thread, head.wait, status, actions);
                }
            }
            Ok(())
        })
    }

    /// Bring the owner's entry for `object` up to date with the waiters.
    pub(crate) fn recompute_boost(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        actions: &mut Actions,
    ) {
        let st = object.state.lock(cs);
        let Variant::Mutex(m) = &st.variant else {
            return;
        };
        let Some(owner) = m.owner.clone() else {
            return;
        };
        let held = held_entry(object, &st, owner.home());

        let mut tp = owner.priority.lock(cs);
        let Some(entry) = tp.held_mut(object.id) else {
            return;
        };
        if entry.boost != held.boost {
            actions.reprioritize(owner.id);
        }
        if entry.help != held.help {
            actions.ask_for_help(owner.id);
        }
        *entry = held;
    }
}
