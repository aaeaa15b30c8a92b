//! SMP coordination: moving threads between the run states of their
//! scheduler nodes, helping, pinning and processor topology changes
use alloc::sync::Arc;

use crate::{
    dispatch::Actions,
    error::{AddProcessorError, BadIdError, RemoveProcessorError, ThreadStateError},
    fatal::{fatal, FatalCode},
    id::{SchedulerId, ThreadId},
    klock::{Critical, LockLevel},
    port::Port,
    priority::ThreadPriority,
    processor::{owners_of, ProcessorSet},
    scheduler::{
        node::{NodeRef, NodeState, SchedulerNode},
        readyqueue::InsertAt,
        SchedEnv,
    },
    thread::{RunState, Thread, ThreadSched},
    utils::IndexSet,
    Kernel,
};

impl<P: Port> Kernel<P> {
    pub(crate) fn sched_env<'a>(&'a self, actions: &'a mut Actions) -> SchedEnv<'a> {
        SchedEnv {
            processors: &self.processors,
            actions,
        }
    }

    pub(crate) fn scheduler_index(&self, id: SchedulerId) -> Result<usize, BadIdError> {
        match self.schedulers.get(id.index()) {
            Some(s) if s.id == id => Ok(s.index),
            _ => Err(BadIdError::InvalidId),
        }
    }

    /// Create a node for `thread` in the scheduler `scheduler`. The node is
    /// enqueued if the thread is ready and not pinned elsewhere.
    pub(crate) fn insert_node(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        tp: &ThreadPriority,
        ts: &mut ThreadSched,
        scheduler: usize,
        actions: &mut Actions,
    ) {
        let sched = &self.schedulers[scheduler];
        let mut state = sched.state.lock(cs);
        let key = state.insert_node(SchedulerNode::new(
            thread.id,
            Arc::downgrade(thread),
            sched.key_for(tp),
        ));
        let node = NodeRef { scheduler, key };
        if ts.nodes.try_push(node).is_err() {
            fatal(&self.port, FatalCode::NodeArenaCorrupted);
        }
        let frozen_elsewhere = ts.pin_level > 0 && ts.pinned != Some(scheduler);
        if ts.state == RunState::Ready && !frozen_elsewhere {
            state.unblock(key, &mut self.sched_env(actions));
        }
    }

    /// Remove a thread from every scheduler because it's about to block.
    pub(crate) fn block_thread(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        actions: &mut Actions,
    ) {
        let mut ts = thread.sched.lock(cs);
        if ts.deleted {
            return;
        }
        if ts.state != RunState::Ready {
            fatal(&self.port, FatalCode::ThreadStateCorrupted);
        }
        ts.state = RunState::Blocked;
        log::trace!("block {:?}", thread.id);
        for node in ts.nodes.iter() {
            let mut state = self.schedulers[node.scheduler].state.lock(cs);
            state.block(node.key, &mut self.sched_env(actions));
        }
    }

    /// Make a blocked thread ready again.
    pub(crate) fn unblock_thread(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        actions: &mut Actions,
    ) {
        {
            let mut ts = thread.sched.lock(cs);
            if ts.deleted {
                return;
            }
            if ts.state != RunState::Blocked {
                fatal(&self.port, FatalCode::ThreadStateCorrupted);
            }
            ts.state = RunState::Ready;
            log::trace!("unblock {:?}", thread.id);
            for node in ts.active_nodes() {
                let mut state = self.schedulers[node.scheduler].state.lock(cs);
                state.unblock(node.key, &mut self.sched_env(actions));
            }
        }
        actions.ask_for_help(thread.id);
    }

    /// Update the keys of a thread's nodes after its priority changed, and
    /// its position in the thread queue it waits on.
    pub(crate) fn reprioritize_thread(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        actions: &mut Actions,
    ) {
        {
            let tp = thread.priority.lock(cs);
            let ts = thread.sched.lock(cs);
            log::trace!("reprioritize {:?}: {:?}", thread.id, *tp);
            for node in ts.nodes.iter() {
                let sched = &self.schedulers[node.scheduler];
                let key = sched.key_for(&tp);
                let mut state = sched.state.lock(cs);
                state.update_key(node.key, key, &mut self.sched_env(actions));
            }
        }
        self.reposition_waiter(cs, thread, actions);
    }

    /// Ask for help: make the set of a thread's nodes match the schedulers
    /// that may run it, and offer a ready thread that isn't running to
    /// every one of them.
    ///
    /// The schedulers that may run a thread are its home scheduler, the
    /// schedulers helping it through MrsP mutexes it owns and the owners of
    /// the processors in its affinity set. The set is frozen while the
    /// thread is pinned.
    pub(crate) fn update_helping(
        &self,
        cs: &Critical<'_, P>,
        thread: &Arc<Thread>,
        actions: &mut Actions,
    ) {
        let tp = thread.priority.lock(cs);
        let mut ts = thread.sched.lock(cs);
        if ts.deleted || thread.idle_cpu.is_some() {
            return;
        }

        if ts.pin_level == 0 {
            let home = thread.home();
            let mut wanted = IndexSet::EMPTY.with(home).union(tp.help_set());
            if let Some(affinity) = ts.affinity {
                wanted = wanted.union(owners_of(&self.processors, affinity));
            }

            let mut i = 0;
            while i < ts.nodes.len() {
                let node = ts.nodes[i];
                if node.scheduler == home || wanted.contains(node.scheduler) {
                    i += 1;
                    continue;
                }
                log::trace!("{:?} leaves scheduler {}", thread.id, node.scheduler);
                ts.nodes.remove(i);
                let mut state = self.schedulers[node.scheduler].state.lock(cs);
                state.free_node(node.key, &mut self.sched_env(actions));
            }

            for scheduler in wanted.iter() {
                if scheduler < self.schedulers.len() && ts.node_in(scheduler).is_none() {
                    log::trace!("{:?} joins scheduler {scheduler}", thread.id);
                    self.insert_node(cs, thread, &tp, &mut ts, scheduler, actions);
                }
            }
        }

        if ts.state == RunState::Ready && thread.scheduled_on().is_none() {
            for node in ts.active_nodes() {
                let mut state = self.schedulers[node.scheduler].state.lock(cs);
                if matches!(
                    state.node_state(node.key),
                    NodeState::Unscheduled | NodeState::Blocked
                ) {
                    state.enqueue(node.key, InsertAt::Back, &mut self.sched_env(actions));
                }
            }
        }
    }

    /// Freeze a thread to the scheduler it currently runs on (or to its home
    /// scheduler if it's not running). Calls nest.
    pub fn thread_pin(&self, id: ThreadId) -> Result<(), ThreadStateError> {
        let thread = self.get_thread(id)?;
        if thread.idle_cpu.is_some() {
            return Err(ThreadStateError::IncorrectState);
        }
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let mut ts = thread.sched.lock(&cs);
            if ts.state != RunState::Ready {
                return Err(ThreadStateError::IncorrectState);
            }
            ts.pin_level += 1;
            if ts.pin_level == 1 {
                let target = thread
                    .scheduled_on()
                    .map(|(s, _)| s)
                    .filter(|&s| ts.node_in(s).is_some())
                    .unwrap_or_else(|| thread.home());
                ts.pinned = Some(target);
                log::trace!("pin {id:?} to scheduler {target}");

                for node in ts.nodes.iter().filter(|n| n.scheduler != target) {
                    let mut state = self.schedulers[node.scheduler].state.lock(&cs);
                    state.withdraw(node.key, &mut self.sched_env(&mut actions));
                }
                if let Some(node) = ts.node_in(target) {
                    let mut state = self.schedulers[target].state.lock(&cs);
                    if state.node_state(node.key) == NodeState::Unscheduled {
                        state.enqueue(node.key, InsertAt::Back, &mut self.sched_env(&mut actions));
                    }
                }
            }
        }
        self.commit(&cs, actions);
        Ok(())
    }

    /// Undo [`Self::thread_pin`]. When the last pin is released, a thread
    /// pinned away from home moves back to its home scheduler.
    pub fn thread_unpin(&self, id: ThreadId) -> Result<(), ThreadStateError> {
        let thread = self.get_thread(id)?;
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let mut ts = thread.sched.lock(&cs);
            if ts.pin_level == 0 {
                return Err(ThreadStateError::IncorrectState);
            }
            ts.pin_level -= 1;
            if ts.pin_level > 0 {
                return Ok(());
            }

            let home = thread.home();
            let pinned = ts.pinned.take();
            log::trace!("unpin {id:?} from scheduler {pinned:?}");
            if let (Some(pinned), RunState::Ready) = (pinned, ts.state) {
                // Nodes outside the pinned scheduler missed the last unblock
                for node in ts.nodes.iter().filter(|n| n.scheduler != pinned) {
                    let mut state = self.schedulers[node.scheduler].state.lock(&cs);
                    if state.node_state(node.key) == NodeState::Blocked {
                        state.withdraw(node.key, &mut self.sched_env(&mut actions));
                    }
                }
                if pinned != home {
                    let pinned_node = ts.node_in(pinned);
                    let home_node = ts.node_in(home);
                    let mut pinned_state = self.schedulers[pinned]
                        .state
                        .lock_at(&cs, LockLevel::PinnedScheduler);
                    if let Some(node) = pinned_node {
                        pinned_state.withdraw(node.key, &mut self.sched_env(&mut actions));
                    }
                    let mut home_state = self.schedulers[home].state.lock(&cs);
                    if let Some(node) = home_node {
                        home_state.enqueue(node.key, InsertAt::Back, &mut self.sched_env(&mut actions));
                    }
                    if let Some((_, cpu)) = thread.scheduled_on() {
                        actions.request_dispatch(cpu);
                    }
                }
            }
        }
        actions.ask_for_help(id);
        self.commit(&cs, actions);
        Ok(())
    }

    /// Attach a processor to a scheduler.
    pub fn scheduler_add_processor(
        &self,
        id: SchedulerId,
        cpu: usize,
    ) -> Result<(), AddProcessorError> {
        let index = self.scheduler_index(id)?;
        let processor = self
            .processors
            .get(cpu)
            .ok_or(AddProcessorError::NotConfigured)?;
        if processor.configured.is_none() {
            return Err(AddProcessorError::NotConfigured);
        }
        if !processor.online {
            return Err(AddProcessorError::IncorrectState);
        }

        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        self.attach_processor(&cs, index, cpu, &mut actions)?;
        self.help_everyone(&mut actions);
        self.commit(&cs, actions);

        log::debug!("scheduler_add_processor({id:?}, {cpu})");
        Ok(())
    }

    pub(crate) fn attach_processor(
        &self,
        cs: &Critical<'_, P>,
        scheduler: usize,
        cpu: usize,
        actions: &mut Actions,
    ) -> Result<(), AddProcessorError> {
        let mut state = self.schedulers[scheduler].state.lock(cs);
        if !self.processors[cpu].try_claim(scheduler) {
            return Err(AddProcessorError::ResourceInUse);
        }
        state.add_processor(cpu, &self.idle_threads[cpu], &mut self.sched_env(actions));
        Ok(())
    }

    /// Detach a processor from a scheduler.
    pub fn scheduler_remove_processor(
        &self,
        id: SchedulerId,
        cpu: usize,
    ) -> Result<(), RemoveProcessorError> {
        let index = self.scheduler_index(id)?;
        let processor = self
            .processors
            .get(cpu)
            .ok_or(RemoveProcessorError::InvalidNumber)?;

        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        {
            let sched = &self.schedulers[index];
            let mut state = sched.state.lock(&cs);
            if processor.owner() != Some(index) {
                return Err(RemoveProcessorError::InvalidNumber);
            }
            if state.num_processors() == 1 && sched.homed_threads() > 0 {
                return Err(RemoveProcessorError::ResourceInUse);
            }
            state.remove_processor(cpu, &mut self.sched_env(&mut actions));
            processor.release();
        }
        self.help_everyone(&mut actions);
        self.commit(&cs, actions);

        log::debug!("scheduler_remove_processor({id:?}, {cpu})");
        Ok(())
    }

    /// Processor ownership changed: every thread may have gained or lost a
    /// helping scheduler.
    fn help_everyone(&self, actions: &mut Actions) {
        for thread in self.threads.snapshot() {
            if thread.idle_cpu.is_none() {
                actions.ask_for_help(thread.id);
            }
        }
    }

    /// Get the scheduler owning a processor.
    pub fn scheduler_ident_by_processor(&self, cpu: usize) -> Option<SchedulerId> {
        let owner = self.processors.get(cpu)?.owner()?;
        Some(self.schedulers[owner].id)
    }

    /// Get the identifier of the scheduler with the configuration index
    /// `index`.
    pub fn scheduler_ident(&self, index: usize) -> Option<SchedulerId> {
        self.schedulers.get(index).map(|s| s.id)
    }

    /// Get the processors owned by a scheduler.
    pub fn scheduler_processors(&self, id: SchedulerId) -> Result<ProcessorSet, BadIdError> {
        let index = self.scheduler_index(id)?;
        let cs = Critical::enter(&self.port);
        let set = self.schedulers[index].state.lock(&cs).processors();
        Ok(set)
    }

    /// Get the schedulers that may run a thread: its home scheduler and the
    /// schedulers currently able to help it.
    pub fn thread_schedulers(&self, id: ThreadId) -> Result<IndexSet, BadIdError> {
        let thread = self.get_thread(id)?;
        let cs = Critical::enter(&self.port);
        let set = thread
            .sched
            .lock(&cs)
            .nodes
            .iter()
            .map(|n| n.scheduler)
            .collect();
        Ok(set)
    }
}
