//! Threads
use alloc::sync::Arc;
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    dispatch::Actions,
    error::{
        BadIdError, CreateThreadError, DeleteThreadError, SetThreadAffinityError,
        SetThreadPriorityError, SetThreadSchedulerError, ThreadStateError,
    },
    id::{SchedulerId, ThreadId},
    klock::{Critical, LockLevel, OrderedLock},
    port::Port,
    priority::{Priority, ThreadPriority},
    processor::ProcessorSet,
    scheduler::{node::NodeRef, SchedulerKind, MAX_SCHEDULERS},
    wait::{ThreadWait, WaitCell, WaitOutcome},
    Kernel,
};

const NOT_SCHEDULED: usize = usize::MAX;

/// The run state of a thread as seen by its schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Ready,
    Blocked,
}

/// The scheduling state of a thread, protected by the thread-scheduling
/// lock.
#[derive(Debug)]
pub(crate) struct ThreadSched {
    pub(crate) state: RunState,
    /// The processors whose schedulers may help the thread. `None` means the
    /// home scheduler's processors.
    pub(crate) affinity: Option<ProcessorSet>,
    pub(crate) pin_level: u32,
    /// The scheduler the thread is frozen to while pinned.
    pub(crate) pinned: Option<usize>,
    /// The thread's scheduler nodes. The home node comes first.
    pub(crate) nodes: ArrayVec<NodeRef, MAX_SCHEDULERS>,
    pub(crate) deleted: bool,
}

impl ThreadSched {
    pub(crate) fn node_in(&self, scheduler: usize) -> Option<NodeRef> {
        self.nodes.iter().find(|n| n.scheduler == scheduler).copied()
    }

    /// The nodes taking part in scheduling decisions: only the pinned node
    /// while pinned, every node otherwise.
    pub(crate) fn active_nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        let pinned = self.pinned.filter(|_| self.pin_level > 0);
        self.nodes
            .iter()
            .copied()
            .filter(move |n| pinned.map_or(true, |p| n.scheduler == p))
    }
}

/// A thread control record.
#[derive(Debug)]
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    /// The processor whose idle thread this is.
    pub(crate) idle_cpu: Option<usize>,
    /// The index of the home scheduler. Only changed with the
    /// thread-scheduling lock held.
    home: AtomicUsize,
    /// `scheduler << 16 | cpu` of the processor the thread occupies, or
    /// `NOT_SCHEDULED`. Only changed with that scheduler's lock held.
    scheduled: AtomicUsize,
    pub(crate) wait_cell: WaitCell,
    pub(crate) wait: OrderedLock<ThreadWait>,
    pub(crate) priority: OrderedLock<ThreadPriority>,
    pub(crate) sched: OrderedLock<ThreadSched>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        priority: Priority,
        home: usize,
        affinity: Option<ProcessorSet>,
        idle_cpu: Option<usize>,
    ) -> Self {
        Self {
            id,
            idle_cpu,
            home: AtomicUsize::new(home),
            scheduled: AtomicUsize::new(NOT_SCHEDULED),
            wait_cell: WaitCell::default(),
            wait: OrderedLock::new(LockLevel::ThreadWait, ThreadWait::default()),
            priority: OrderedLock::new(LockLevel::ThreadPriority, ThreadPriority::new(priority)),
            sched: OrderedLock::new(
                LockLevel::ThreadSched,
                ThreadSched {
                    state: RunState::Blocked,
                    affinity,
                    pin_level: 0,
                    pinned: None,
                    nodes: ArrayVec::new(),
                    deleted: false,
                },
            ),
        }
    }

    #[inline]
    pub(crate) fn home(&self) -> usize {
        self.home.load(Ordering::Relaxed)
    }

    pub(crate) fn set_home(&self, scheduler: usize) {
        self.home.store(scheduler, Ordering::Relaxed);
    }

    /// Claim the thread for the processor `cpu` of `scheduler`. Fails if the
    /// thread already occupies a processor.
    pub(crate) fn try_mark_scheduled(&self, scheduler: usize, cpu: usize) -> bool {
        self.scheduled
            .compare_exchange(
                NOT_SCHEDULED,
                scheduler << 16 | cpu,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Undo [`Self::try_mark_scheduled`] if `scheduler` holds the claim.
    pub(crate) fn unmark_scheduled(&self, scheduler: usize) {
        let current = self.scheduled.load(Ordering::Acquire);
        if current != NOT_SCHEDULED && current >> 16 == scheduler {
            let _ = self.scheduled.compare_exchange(
                current,
                NOT_SCHEDULED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// `(scheduler, cpu)` of the processor the thread occupies.
    pub(crate) fn scheduled_on(&self) -> Option<(usize, usize)> {
        match self.scheduled.load(Ordering::Acquire) {
            NOT_SCHEDULED => None,
            x => Some((x >> 16, x & 0xffff)),
        }
    }
}

/// The creation parameters of a thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    pub priority: Priority,
    /// The home scheduler.
    pub scheduler: SchedulerId,
    /// The processors the thread may run on. `None` means the home
    /// scheduler's processors.
    pub affinity: Option<ProcessorSet>,
}

/// The state of a thread as reported by [`Kernel::thread_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Ready but not running.
    Ready,
    /// Running (or chosen to run) on this processor.
    Scheduled(usize),
    Blocked,
}

impl<P: Port> Kernel<P> {
    pub(crate) fn get_thread(&self, id: ThreadId) -> Result<Arc<Thread>, BadIdError> {
        self.threads.get(id).ok_or(BadIdError::InvalidId)
    }

    pub(crate) fn get_user_thread(&self, id: ThreadId) -> Result<Arc<Thread>, BadIdError> {
        self.get_thread(id).and_then(|t| {
            if t.idle_cpu.is_some() {
                // Idle threads are not visible through the thread API
                Err(BadIdError::InvalidId)
            } else {
                Ok(t)
            }
        })
    }

    fn check_priority(&self, p: Priority) -> bool {
        (p.0 as usize) < self.num_levels
    }

    /// Validate an affinity set against the home scheduler's processors.
    fn affinity_is_valid(&self, cs: &Critical<'_, P>, home: usize, set: ProcessorSet) -> bool {
        let home_cpus = self.schedulers[home].state.lock(cs).processors();
        !set.is_empty()
            && set.iter().all(|cpu| cpu < self.processors.len())
            && !set.intersection(home_cpus).is_empty()
    }

    /// Create a thread. The thread is ready immediately.
    pub fn thread_create(&self, attr: ThreadAttr) -> Result<ThreadId, CreateThreadError> {
        if !self.check_priority(attr.priority) {
            return Err(CreateThreadError::InvalidPriority);
        }
        let home = self.scheduler_index(attr.scheduler)?;

        let cs = Critical::enter(&self.port);
        if self.schedulers[home].state.lock(&cs).num_processors() == 0 {
            return Err(CreateThreadError::Unsatisfied);
        }
        if let Some(set) = attr.affinity {
            if !self.affinity_is_valid(&cs, home, set) {
                return Err(CreateThreadError::InvalidNumber);
            }
        }

        let (id, thread) = self
            .threads
            .allocate(|id| Thread::new(id, attr.priority, home, attr.affinity, None))
            .map_err(|_| CreateThreadError::TooMany)?;

        let mut actions = Actions::new();
        self.attach_home_node(&cs, &thread, home, &mut actions);
        self.schedulers[home].homed.fetch_add(1, Ordering::Relaxed);
        self.unblock_thread(&cs, &thread, &mut actions);
        self.commit(&cs, actions);

        log::debug!("thread_create({attr:?}) = {id:?}");
        Ok(id)
    }

    /// Delete a thread. A waiting thread is extracted from its thread queue.
    pub fn thread_delete(&self, id: ThreadId) -> Result<(), DeleteThreadError> {
        let thread = self.get_thread(id)?;
        if thread.idle_cpu.is_some() {
            return Err(DeleteThreadError::IncorrectState);
        }

        let cs = Critical::enter(&self.port);
        if !thread.priority.lock(&cs).held.is_empty() {
            return Err(DeleteThreadError::ResourceInUse);
        }

        let mut actions = Actions::new();
        {
            let mut w = thread.wait.lock(&cs);
            self.extract(&cs, &thread, &mut w, &mut actions);
            thread.wait_cell.reset();
        }
        {
            let mut ts = thread.sched.lock(&cs);
            ts.deleted = true;
            for node in core::mem::take(&mut ts.nodes) {
                let mut sched = self.schedulers[node.scheduler].state.lock(&cs);
                sched.free_node(node.key, &mut self.sched_env(&mut actions));
            }
            self.schedulers[thread.home()]
                .homed
                .fetch_sub(1, Ordering::Relaxed);
        }
        self.threads.free(id);
        self.commit(&cs, actions);

        log::debug!("thread_delete({id:?})");
        Ok(())
    }

    /// Set the base priority of a thread. Returns the old base priority.
    pub fn thread_set_priority(
        &self,
        id: ThreadId,
        priority: Priority,
    ) -> Result<Priority, SetThreadPriorityError> {
        if !self.check_priority(priority) {
            return Err(SetThreadPriorityError::InvalidPriority);
        }
        let thread = self.get_thread(id)?;
        if thread.idle_cpu.is_some() {
            return Err(SetThreadPriorityError::IncorrectState);
        }

        let cs = Critical::enter(&self.port);
        let old = {
            let mut tp = thread.priority.lock(&cs);
            if tp.lowest_ceiling().map_or(false, |c| priority > c) {
                return Err(SetThreadPriorityError::CeilingViolated);
            }
            core::mem::replace(&mut tp.base, priority)
        };

        let mut actions = Actions::new();
        actions.reprioritize(id);
        self.commit(&cs, actions);

        log::debug!("thread_set_priority({id:?}, {priority:?}) = {old:?}");
        Ok(old)
    }

    /// Get the base priority and the effective priority in the home
    /// scheduler.
    pub fn thread_priority(&self, id: ThreadId) -> Result<(Priority, Priority), BadIdError> {
        let thread = self.get_thread(id)?;
        let cs = Critical::enter(&self.port);
        let tp = thread.priority.lock(&cs);
        Ok((tp.base, tp.effective(thread.home())))
    }

    /// Move a thread behind the ready threads of equal priority.
    pub fn thread_yield(&self, id: ThreadId) -> Result<(), ThreadStateError> {
        let thread = self.get_user_thread(id)?;
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let ts = thread.sched.lock(&cs);
            if ts.state != RunState::Ready {
                return Err(ThreadStateError::IncorrectState);
            }
            for node in ts.active_nodes() {
                let mut sched = self.schedulers[node.scheduler].state.lock(&cs);
                sched.yield_node(node.key, &mut self.sched_env(&mut actions));
            }
        }
        self.commit(&cs, actions);
        Ok(())
    }

    /// Move a thread to another home scheduler.
    pub fn thread_set_scheduler(
        &self,
        id: ThreadId,
        scheduler: SchedulerId,
        priority: Priority,
    ) -> Result<(), SetThreadSchedulerError> {
        let thread = self.get_user_thread(id)?;
        let target = self.scheduler_index(scheduler)?;
        if !self.check_priority(priority) {
            return Err(SetThreadSchedulerError::InvalidPriority);
        }

        let cs = Critical::enter(&self.port);
        if thread.wait_cell.is_waiting() || !thread.priority.lock(&cs).held.is_empty() {
            return Err(SetThreadSchedulerError::ResourceInUse);
        }
        if self.schedulers[target].state.lock(&cs).num_processors() == 0 {
            return Err(SetThreadSchedulerError::Unsatisfied);
        }

        let mut actions = Actions::new();
        {
            let mut tp = thread.priority.lock(&cs);
            let mut ts = thread.sched.lock(&cs);
            if ts.pin_level > 0 {
                return Err(SetThreadSchedulerError::IncorrectState);
            }
            tp.base = priority;
            tp.deadline = None;
            for node in core::mem::take(&mut ts.nodes) {
                let mut sched = self.schedulers[node.scheduler].state.lock(&cs);
                sched.free_node(node.key, &mut self.sched_env(&mut actions));
            }
            self.schedulers[thread.home()]
                .homed
                .fetch_sub(1, Ordering::Relaxed);
            self.schedulers[target].homed.fetch_add(1, Ordering::Relaxed);
            thread.set_home(target);
            ts.affinity = None;
            self.insert_node(&cs, &thread, &tp, &mut ts, target, &mut actions);
        }
        actions.ask_for_help(id);
        self.commit(&cs, actions);

        log::debug!("thread_set_scheduler({id:?}, {scheduler:?}, {priority:?})");
        Ok(())
    }

    /// Change the set of processors a thread may run on.
    pub fn thread_set_affinity(
        &self,
        id: ThreadId,
        cpus: ProcessorSet,
    ) -> Result<(), SetThreadAffinityError> {
        let thread = self.get_user_thread(id)?;
        let cs = Critical::enter(&self.port);
        if !self.affinity_is_valid(&cs, thread.home(), cpus) {
            return Err(SetThreadAffinityError::InvalidNumber);
        }
        {
            let mut ts = thread.sched.lock(&cs);
            if ts.pin_level > 0 {
                return Err(SetThreadAffinityError::IncorrectState);
            }
            ts.affinity = Some(cpus);
        }
        let mut actions = Actions::new();
        actions.ask_for_help(id);
        self.commit(&cs, actions);
        Ok(())
    }

    pub fn thread_state(&self, id: ThreadId) -> Result<ThreadState, BadIdError> {
        let thread = self.get_thread(id)?;
        let cs = Critical::enter(&self.port);
        let ts = thread.sched.lock(&cs);
        Ok(match (ts.state, thread.scheduled_on()) {
            (RunState::Blocked, _) => ThreadState::Blocked,
            (RunState::Ready, Some((_, cpu))) => ThreadState::Scheduled(cpu),
            (RunState::Ready, None) => ThreadState::Ready,
        })
    }

    /// Read the outcome of the thread's last wait.
    pub fn wait_result(&self, id: ThreadId) -> Result<WaitOutcome, BadIdError> {
        Ok(self.get_thread(id)?.wait_cell.take_outcome())
    }

    /// Release a job with a deadline `relative_deadline` ticks from now. Only
    /// defined for threads homed on an EDF scheduler.
    pub fn thread_release_job(
        &self,
        id: ThreadId,
        relative_deadline: u64,
    ) -> Result<(), ThreadStateError> {
        let thread = self.get_user_thread(id)?;
        if self.schedulers[thread.home()].kind != SchedulerKind::Edf {
            return Err(ThreadStateError::NotDefined);
        }
        let cs = Critical::enter(&self.port);
        {
            let mut tp = thread.priority.lock(&cs);
            let now = self.watchdogs.now(&cs);
            tp.deadline = Some(now.saturating_add(relative_deadline));
        }
        let mut actions = Actions::new();
        actions.reprioritize(id);
        self.commit(&cs, actions);
        Ok(())
    }

    /// End the current job. The thread returns to the background band.
    pub fn thread_cancel_job(&self, id: ThreadId) -> Result<(), ThreadStateError> {
        let thread = self.get_user_thread(id)?;
        if self.schedulers[thread.home()].kind != SchedulerKind::Edf {
            return Err(ThreadStateError::NotDefined);
        }
        let cs = Critical::enter(&self.port);
        if thread.priority.lock(&cs).deadline.take().is_none() {
            return Err(ThreadStateError::IncorrectState);
        }
        let mut actions = Actions::new();
        actions.reprioritize(id);
        self.commit(&cs, actions);
        Ok(())
    }

    /// Create the home node of a thread.
    pub(crate) fn attach_home_node(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        home: usize,
        actions: &mut Actions,
    ) {
        let tp = thread.priority.lock(cs);
        let mut ts = thread.sched.lock(cs);
        self.insert_node(cs, thread, &tp, &mut ts, home, actions);
    }
}
