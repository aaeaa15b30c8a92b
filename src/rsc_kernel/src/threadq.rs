//! Thread queues and the blocking/wakeup engine
//!
//! Every synchronization object embeds a [`ThreadQueue`] in its
//! lock-protected state. A thread's position in a queue is recorded in the
//! thread's wait state, which is protected by the thread-wait lock. Code that
//! removes a specific thread from a queue holds both locks, taking the
//! thread-wait lock first.
//!
//! Waking the head of a queue needs the head's thread-wait lock, which can't
//! be taken while the queue lock is held. [`Kernel::with_head`] peeks at the
//! head, releases the queue lock, takes both locks in order and checks that
//! the head did not change in between.
//!
//! Operations waking every waiter at once (flush, barrier release, delete)
//! move the waiters to the object's detached list in one step under the
//! queue lock. Each detached thread is then resolved with its own
//! thread-wait lock held. Until then, a timeout of a detached waiter finds it
//! missing from the queue and does nothing.
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    dispatch::Actions,
    error::ResultCode,
    fatal::{fatal, FatalCode},
    id::{SyncId, ThreadId},
    klock::Critical,
    port::Port,
    priority::Priority,
    sync::{Detached, SyncObject, SyncState},
    thread::Thread,
    wait::{split_timeout_arg, Claim, ThreadWait},
    Kernel,
};

/// The queuing discipline of a thread queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Arrival order.
    Fifo,
    /// Highest priority first, arrival order among equal priorities.
    Priority,
}

/// The position of a waiter in a [`ThreadQueue`]. Smaller keys are woken
/// first.
pub(crate) type QueueKey = (u32, u64);

/// A thread waiting in a [`ThreadQueue`].
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) thread: Arc<Thread>,
    /// The thread's priority when it was queued or last repositioned.
    pub(crate) priority: Priority,
    /// The status to deliver once the thread acquires the mutex it is queued
    /// on. Set for condition waiters moved onto a mutex.
    pub(crate) pending: Option<ResultCode>,
    /// The mutex nest level to restore on acquisition.
    pub(crate) nest: u32,
}

impl Waiter {
    pub(crate) fn new(thread: Arc<Thread>, priority: Priority) -> Self {
        Self {
            thread,
            priority,
            pending: None,
            nest: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ThreadQueue {
    discipline: Discipline,
    waiters: BTreeMap<QueueKey, Waiter>,
    next_seq: u64,
}

impl ThreadQueue {
    pub(crate) fn new(discipline: Discipline) -> Self {
        Self {
            discipline,
            waiters: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn make_key(&mut self, priority: Priority) -> QueueKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.discipline {
            Discipline::Fifo => (0, seq),
            Discipline::Priority => (u32::MAX - priority.0, seq),
        }
    }

    pub(crate) fn insert(&mut self, waiter: Waiter) -> QueueKey {
        let key = self.make_key(waiter.priority);
        log::trace!("enqueue {:?} at {key:?}", waiter.thread.id);
        self.waiters.insert(key, waiter);
        key
    }

    pub(crate) fn remove(&mut self, key: QueueKey) -> Option<Waiter> {
        self.waiters.remove(&key)
    }

    /// Remove the waiter at `key` if it's `thread`.
    pub(crate) fn remove_thread(&mut self, key: QueueKey, thread: ThreadId) -> Option<Waiter> {
        match self.waiters.get(&key) {
            Some(w) if w.thread.id == thread => self.waiters.remove(&key),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, key: QueueKey, thread: ThreadId) -> bool {
        self.waiters
            .get(&key)
            .map_or(false, |w| w.thread.id == thread)
    }

    pub(crate) fn first(&self) -> Option<(QueueKey, &Waiter)> {
        self.waiters.iter().next().map(|(k, w)| (*k, w))
    }

    pub(crate) fn first_key(&self) -> Option<QueueKey> {
        self.waiters.keys().next().copied()
    }

    pub(crate) fn pop_first(&mut self) -> Option<Waiter> {
        let key = self.first_key()?;
        self.waiters.remove(&key)
    }

    /// Move a waiter according to its new priority. It goes behind the
    /// waiters of equal priority. Returns the new key.
    pub(crate) fn reposition(&mut self, key: QueueKey, priority: Priority) -> QueueKey {
        let Some(mut waiter) = self.waiters.remove(&key) else {
            return key;
        };
        if waiter.priority == priority || self.discipline == Discipline::Fifo {
            waiter.priority = priority;
            self.waiters.insert(key, waiter);
            return key;
        }
        waiter.priority = priority;
        self.insert(waiter)
    }

    /// The highest priority among the waiters.
    pub(crate) fn max_priority(&self) -> Option<Priority> {
        match self.discipline {
            Discipline::Priority => self.first().map(|(_, w)| w.priority),
            Discipline::Fifo => self.waiters.values().map(|w| w.priority).max(),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Waiter> + '_ {
        self.waiters.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// The head of a thread queue, locked by [`Kernel::with_head`].
pub(crate) struct Head<'a> {
    pub(crate) thread: &'a Arc<Thread>,
    pub(crate) wait: &'a mut ThreadWait,
    pub(crate) key: QueueKey,
}

/// Move every waiter of `st` to its detached list. Returns the threads to
/// pass to [`Kernel::resolve_detached`].
pub(crate) fn detach_all(st: &mut SyncState, status: ResultCode) -> Vec<Arc<Thread>> {
    let morph_to = st.condition_mutex();
    let mut threads = Vec::with_capacity(st.queue.len());
    while let Some(waiter) = st.queue.pop_first() {
        threads.push(Arc::clone(&waiter.thread));
        st.detached.push(Detached {
            waiter,
            status,
            morph_to,
        });
    }
    st.waiters_changed();
    threads
}

impl<P: Port> Kernel<P> {
    /// Put a thread into the queue of `object` and arm its timeout. The
    /// caller holds the thread's wait lock and the queue lock, and must call
    /// [`Self::finish_block`] after releasing them.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enqueue_waiter(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        w: &mut ThreadWait,
        object: SyncId,
        st: &mut SyncState,
        timeout: u64,
        nest: u32,
    ) {
        thread.wait_cell.begin();
        w.episode = w.episode.wrapping_add(1);
        let priority = thread.priority.lock(cs).effective(thread.home());
        let key = st.queue.insert(Waiter {
            nest,
            ..Waiter::new(Arc::clone(thread), priority)
        });
        w.queue = Some((object, key));
        if timeout > 0 {
            let arg = w.timeout_arg(thread.id);
            w.watchdog = Some(self.watchdogs.arm(cs, timeout, Self::on_timeout, arg));
        }
        st.waiters_changed();
    }

    /// The second half of blocking: block the thread in its schedulers
    /// unless its wait has already been resolved.
    pub(crate) fn finish_block(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        actions: &mut Actions,
    ) {
        self.block_thread(cs, thread, actions);
        if !thread.wait_cell.commit_block() {
            log::trace!("{:?} was resolved before blocking", thread.id);
            self.unblock_thread(cs, thread, actions);
        }
    }

    /// Decide the outcome of a wait for a thread that has been taken off its
    /// queue. The caller holds the thread's wait lock.
    pub(crate) fn resolve(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        w: &mut ThreadWait,
        status: ResultCode,
        actions: &mut Actions,
    ) {
        if let Some(handle) = w.watchdog.take() {
            self.watchdogs.cancel(cs, handle);
        }
        w.queue = None;
        log::trace!("resolve {:?}: {status:?}", thread.id);
        match thread.wait_cell.claim(status) {
            Claim::Early => {}
            Claim::Blocked => actions.unblock(Arc::clone(thread)),
            Claim::Lost => fatal(&self.port, FatalCode::WaitStateCorrupted),
        }
    }

    /// Call `f` with the queue lock of `object` held, and with the head of
    /// the queue locked, if there is one.
    pub(crate) fn with_head<R>(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        f: impl FnOnce(&mut SyncState, Option<Head<'_>>) -> R,
    ) -> R {
        loop {
            let head = {
                let st = object.state.lock(cs);
                st.queue
                    .first()
                    .map(|(key, waiter)| (key, Arc::clone(&waiter.thread)))
            };

            match head {
                None => {
                    let mut st = object.state.lock(cs);
                    if !st.queue.is_empty() {
                        continue;
                    }
                    return f(&mut *st, None);
                }
                Some((key, thread)) => {
                    let mut w = thread.wait.lock(cs);
                    let mut st = object.state.lock(cs);
                    if !st.queue.contains(key, thread.id) || st.queue.first_key() != Some(key) {
                        log::trace!("head of {:?} changed; retrying", object.id);
                        continue;
                    }
                    let head = Head {
                        thread: &thread,
                        wait: &mut *w,
                        key,
                    };
                    return f(&mut *st, Some(head));
                }
            }
        }
    }

    /// Resolve the threads detached by [`detach_all`].
    pub(crate) fn resolve_detached(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        threads: Vec<Arc<Thread>>,
        actions: &mut Actions,
    ) {
        for thread in threads {
            let mut w = thread.wait.lock(cs);
            let detached = {
                let mut st = object.state.lock(cs);
                let Some(i) = st
                    .detached
                    .iter()
                    .position(|d| Arc::ptr_eq(&d.waiter.thread, &thread))
                else {
                    // Deleted in the meantime
                    continue;
                };
                st.detached.swap_remove(i)
            };
            match detached.morph_to {
                Some(mutex) => {
                    self.move_to_mutex(cs, &thread, &mut w, detached.waiter, mutex, detached.status, actions)
                }
                None => self.resolve(cs, &thread, &mut w, detached.status, actions),
            }
        }
    }

    /// The timeout watchdog callback.
    fn on_timeout(&self, arg: u64) {
        let (raw, episode) = split_timeout_arg(arg);
        let Some(thread) = ThreadId::from_raw(raw).and_then(|id| self.threads.get(id)) else {
            return;
        };

        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let mut w = thread.wait.lock(&cs);
            if w.episode != episode {
                return;
            }
            let Some((object_id, key)) = w.queue else {
                return;
            };
            let Some(object) = self.syncs.get(object_id) else {
                return;
            };

            let (waiter, morph_to) = {
                let mut st = object.state.lock(&cs);
                let Some(waiter) = st.queue.remove_thread(key, thread.id) else {
                    // Already detached
                    return;
                };
                st.waiters_changed();
                self.note_waiters_changed(&object, &mut actions);
                (waiter, st.condition_mutex())
            };

            // The watchdog has fired; its handle is stale
            w.watchdog = None;
            log::debug!("{:?} timed out waiting on {object_id:?}", thread.id);
            match morph_to {
                Some(mutex) => self.move_to_mutex(
                    &cs,
                    &thread,
                    &mut w,
                    waiter,
                    mutex,
                    ResultCode::Timeout,
                    &mut actions,
                ),
                None => self.resolve(&cs, &thread, &mut w, ResultCode::Timeout, &mut actions),
            }
        }
        self.commit(&cs, actions);
    }

    /// Remove a thread from whatever it waits on without resolving the wait.
    /// Used when the thread is deleted.
    pub(crate) fn extract(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        w: &mut ThreadWait,
        actions: &mut Actions,
    ) {
        if let Some(handle) = w.watchdog.take() {
            self.watchdogs.cancel(cs, handle);
        }
        let Some((object_id, key)) = w.queue.take() else {
            return;
        };
        let Some(object) = self.syncs.get(object_id) else {
            return;
        };
        let mut st = object.state.lock(cs);
        if st.queue.remove_thread(key, thread.id).is_some() {
            st.waiters_changed();
            self.note_waiters_changed(&object, actions);
        } else if let Some(i) = st
            .detached
            .iter()
            .position(|d| Arc::ptr_eq(&d.waiter.thread, thread))
        {
            st.detached.swap_remove(i);
        }
        log::trace!("extracted {:?} from {object_id:?}", thread.id);
    }

    /// Requeue a waiting thread after its priority changed.
    pub(crate) fn reposition_waiter(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        actions: &mut Actions,
    ) {
        let mut w = thread.wait.lock(cs);
        let Some((object_id, key)) = w.queue else {
            return;
        };
        let Some(object) = self.syncs.get(object_id) else {
            return;
        };
        let mut st = object.state.lock(cs);
        if !st.queue.contains(key, thread.id) {
            return;
        }
        let priority = thread.priority.lock(cs).effective(thread.home());
        let new_key = st.queue.reposition(key, priority);
        w.queue = Some((object_id, new_key));
        self.note_waiters_changed(&object, actions);
    }

    /// The waiter set of `object` changed in a way that may affect the boost
    /// of its owner.
    pub(crate) fn note_waiters_changed(&self, object: &SyncObject, actions: &mut Actions) {
        if object.attr.protocol.uses_waiters() {
            actions.boost(object.id);
        }
    }
}
