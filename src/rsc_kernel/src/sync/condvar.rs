//! Condition variables
//!
//! A waiter releases its mutex and blocks on the condition. When notified
//! (or timed out, or flushed) it is moved onto the mutex's thread queue and
//! its wait completes only once it owns the mutex again, with the nest
//! level it had before. The status of the condition wait travels with it as
//! the waiter's pending status.
use alloc::sync::Arc;

use crate::{
    dispatch::Actions,
    error::{ConditionWaitError, ResultCode, SurrenderError},
    fatal::{fatal, FatalCode},
    id::{SyncId, ThreadId},
    klock::Critical,
    port::Port,
    thread::Thread,
    threadq::Waiter,
    wait::ThreadWait,
    Kernel,
};

use super::{SyncKind, SyncObject, Variant};

impl<P: Port> Kernel<P> {
    /// Release `mutex`, which the thread `executing` must own, and wait on
    /// `condition`. [`Kernel::wait_result`] reports the outcome once the
    /// thread owns the mutex again.
    ///
    /// Every thread waiting on a condition at the same time must use the
    /// same mutex.
    pub fn condition_wait(
        &self,
        executing: ThreadId,
        condition: SyncId,
        mutex: SyncId,
        timeout: u64,
    ) -> Result<(), ConditionWaitError> {
        let thread = self.get_user_thread(executing)?;
        let cond = self.get_sync(condition)?;
        let mutex = self.get_sync(mutex)?;
        if cond.attr.kind != SyncKind::Condition || mutex.attr.kind != SyncKind::Mutex {
            return Err(ConditionWaitError::NotDefined);
        }

        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let mut w = thread.wait.lock(&cs);
            if thread.wait_cell.is_waiting() {
                return Err(ConditionWaitError::IncorrectState);
            }

            let nest = {
                let st = mutex.state.lock(&cs);
                match &st.variant {
                    _ if st.deleted => return Err(ConditionWaitError::InvalidId),
                    Variant::Mutex(m) if m.owner.as_ref().map_or(false, |o| o.id == executing) => {
                        m.nest
                    }
                    _ => return Err(ConditionWaitError::NotOwner),
                }
            };

            let mut st = cond.state.lock(&cs);
            if st.deleted {
                return Err(ConditionWaitError::InvalidId);
            }
            let Variant::Condition { mutex: bound } = &mut st.variant else {
                return Err(ConditionWaitError::NotDefined);
            };
            match *bound {
                Some(b) if b != mutex.id => return Err(ConditionWaitError::IncorrectState),
                _ => *bound = Some(mutex.id),
            }
            self.enqueue_waiter(&cs, &thread, &mut w, cond.id, &mut st, timeout, nest);
        }

        // Ownership was checked above and only the owner can release it
        if self.mutex_surrender(&cs, &thread, &mutex, true, &mut actions).is_err() {
            fatal(&self.port, FatalCode::WaitStateCorrupted);
        }
        self.finish_block(&cs, &thread, &mut actions);
        self.commit(&cs, actions);

        log::debug!("condition_wait({executing:?}, {condition:?}, {:?}, {timeout})", mutex.id);
        Ok(())
    }

    /// Move the first waiter of a condition to its mutex.
    pub(super) fn condition_signal(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        actions: &mut Actions,
    ) -> Result<(), SurrenderError> {
        loop {
            let head = {
                let st = object.state.lock(cs);
                if st.deleted {
                    return Err(SurrenderError::InvalidId);
                }
                st.queue
                    .first()
                    .map(|(key, waiter)| (key, Arc::clone(&waiter.thread)))
            };
            let Some((key, thread)) = head else {
                return Ok(());
            };

            let mut w = thread.wait.lock(cs);
            let (waiter, mutex) = {
                let mut st = object.state.lock(cs);
                if st.queue.first_key() != Some(key) {
                    continue;
                }
                let Some(waiter) = st.queue.remove_thread(key, thread.id) else {
                    continue;
                };
                let mutex = st.condition_mutex();
                st.waiters_changed();
                (waiter, mutex)
            };
            match mutex {
                Some(mutex) => self.move_to_mutex(
                    cs,
                    &thread,
                    &mut w,
                    waiter,
                    mutex,
                    ResultCode::Successful,
                    actions,
                ),
                None => self.resolve(cs, &thread, &mut w, ResultCode::Successful, actions),
            }
            return Ok(());
        }
    }

    /// Move a condition waiter onto `mutex`. The wait completes with
    /// `status` once the thread owns the mutex. The caller holds the
    /// thread's wait lock.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn move_to_mutex(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        w: &mut ThreadWait,
        waiter: Waiter,
        mutex: SyncId,
        status: ResultCode,
        actions: &mut Actions,
    ) {
        // The condition wait is over; so is its timeout
        if let Some(handle) = w.watchdog.take() {
            self.watchdogs.cancel(cs, handle);
        }
        w.episode = w.episode.wrapping_add(1);
        w.queue = None;

        let Some(object) = self.syncs.get(mutex) else {
            self.resolve(cs, thread, w, ResultCode::ObjectWasDeleted, actions);
            return;
        };

        let mut st = object.state.lock(cs);
        let owned = match &st.variant {
            Variant::Mutex(m) if !st.deleted => Some(m.owner.is_some()),
            _ => None,
        };
        let Some(owned) = owned else {
            drop(st);
            self.resolve(cs, thread, w, ResultCode::ObjectWasDeleted, actions);
            return;
        };

        if !owned {
            self.grant_mutex(cs, &object, &mut st, thread, waiter.nest, actions);
            drop(st);
            self.resolve(cs, thread, w, status, actions);
            return;
        }

        let priority = thread.priority.lock(cs).effective(thread.home());
        let key = st.queue.insert(Waiter {
            priority,
            pending: Some(status),
            ..waiter
        });
        st.waiters_changed();
        w.queue = Some((mutex, key));
        self.note_waiters_changed(&object, actions);
        log::trace!("{:?} moves to {mutex:?}", thread.id);
    }
}
