//! Automatic and manual barriers
use alloc::sync::Arc;

use crate::{
    dispatch::Actions,
    error::{ResultCode, SeizeError, SurrenderError},
    klock::Critical,
    port::Port,
    thread::Thread,
    threadq::detach_all,
    Kernel,
};

use super::{SeizeStatus, SyncObject, Variant, WaitOption};

impl<P: Port> Kernel<P> {
    /// Wait at a barrier. The thread completing the party of an automatic
    /// barrier releases everyone and doesn't block.
    pub(super) fn barrier_wait(
        &self,
        thread: &Arc<Thread>,
        object: &SyncObject,
        option: WaitOption,
        timeout: u64,
    ) -> Result<SeizeStatus, SeizeError> {
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        let released = {
            let mut w = thread.wait.lock(&cs);
            Self::check_not_waiting(thread)?;
            let mut st = object.state.lock(&cs);
            if st.deleted {
                return Err(SeizeError::InvalidId);
            }
            let Variant::Barrier { parties } = st.variant else {
                return Err(SeizeError::NotDefined);
            };
            let arrived = st.queue.len() as u64 + 1;
            match parties {
                Some(n) if arrived >= u64::from(n) => Some(detach_all(&mut st, ResultCode::Successful)),
                _ if option == WaitOption::NoWait => return Err(SeizeError::Unsatisfied),
                _ => {
                    self.enqueue_waiter(&cs, thread, &mut w, object.id, &mut st, timeout, 1);
                    None
                }
            }
        };

        if let Some(threads) = released {
            log::trace!("{:?} completes {:?}", thread.id, object.id);
            self.resolve_detached(&cs, object, threads, &mut actions);
            self.commit(&cs, actions);
            return Ok(SeizeStatus::Acquired);
        }
        self.finish_block(&cs, thread, &mut actions);
        self.commit(&cs, actions);
        Ok(SeizeStatus::Blocked)
    }

    /// Release every waiter of a barrier.
    pub(super) fn barrier_release(
        &self,
        cs: &Critical<'_, P>,
        object: &SyncObject,
        actions: &mut Actions,
    ) -> Result<(), SurrenderError> {
        let threads = {
            let mut st = object.state.lock(cs);
            if st.deleted {
                return Err(SurrenderError::InvalidId);
            }
            detach_all(&mut st, ResultCode::Successful)
        };
        log::trace!("release {} waiters of {:?}", threads.len(), object.id);
        self.resolve_detached(cs, object, threads, actions);
        Ok(())
    }
}
