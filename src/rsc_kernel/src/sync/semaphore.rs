//! Counting and binary semaphores
use alloc::sync::Arc;

use crate::{
    dispatch::Actions,
    error::{ResultCode, SeizeError, SurrenderError},
    klock::Critical,
    port::Port,
    thread::Thread,
    Kernel,
};

use super::{SeizeStatus, SyncObject, Variant, WaitOption};

impl<P: Port> Kernel<P> {
    pub(super) fn semaphore_seize(
        &self,
        thread: &Arc<Thread>,
        object: &SyncObject,
        option: WaitOption,
        timeout: u64,
    ) -> Result<SeizeStatus, SeizeError> {
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let mut w = thread.wait.lock(&cs);
            Self::check_not_waiting(thread)?;
            let mut st = object.state.lock(&cs);
            if st.deleted {
                return Err(SeizeError::InvalidId);
            }
            let Variant::Semaphore { count, .. } = &mut st.variant else {
                return Err(SeizeError::NotDefined);
            };
            if *count > 0 {
                *count -= 1;
                return Ok(SeizeStatus::Acquired);
            }
            if option == WaitOption::NoWait {
                return Err(SeizeError::Unsatisfied);
            }
            self.enqueue_waiter(&cs, thread, &mut w, object.id, &mut st, timeout, 1);
        }
        self.finish_block(&cs, thread, &mut actions);
        self.commit(&cs, actions);
        Ok(SeizeStatus::Blocked)
    }

    /// Wake the first waiter, or increment the count if there is none. A
    /// binary semaphore saturates at one.
    pub(super) fn semaphore_surrender(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        actions: &mut Actions,
    ) -> Result<(), SurrenderError> {
        self.with_head(cs, object, |st, head| {
            if st.deleted {
                return Err(SurrenderError::InvalidId);
            }
            if let Some(head) = head {
                st.queue.remove(head.key);
                st.waiters_changed();
                self.resolve(cs, head.thread, head.wait, ResultCode::Successful, actions);
                return Ok(());
            }

            let Variant::Semaphore { count, binary } = &mut st.variant else {
                return Err(SurrenderError::InvalidId);
            };
            if *binary {
                *count = 1;
            } else {
                *count = count.checked_add(1).ok_or(SurrenderError::Unsatisfied)?;
            }
            Ok(())
        })
    }
}
