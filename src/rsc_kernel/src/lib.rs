//! The scheduling and synchronization core of a real-time SMP kernel.
//!
//! A [`Kernel`] owns a set of scheduler instances, each of which owns some of
//! the configured processors. Threads are homed on one scheduler and may be
//! helped by others. Synchronization objects (semaphores, mutexes with
//! priority inheritance, priority ceiling or MrsP, barriers and condition
//! variables) block threads on thread queues with optional timeouts driven
//! by [`Kernel::tick`].
//!
//! The kernel does not switch contexts itself. It maintains the heir thread
//! of every processor and asks the [`Port`] to dispatch whenever a heir
//! changes.
//!
//! # Examples
//!
//! ```
//! use rsc_kernel::*;
//!
//! let mut b = CfgBuilder::new();
//! let sched = b.scheduler(SchedulerKind::Priority);
//! b.processor(ProcessorCfg { scheduler: Some(sched), online: true });
//! let kernel = Kernel::new(HostedPort::new(1), b.finish().unwrap());
//!
//! let sched = kernel.scheduler_ident(0).unwrap();
//! let t = kernel
//!     .thread_create(ThreadAttr { priority: Priority(10), scheduler: sched, affinity: None })
//!     .unwrap();
//! assert_eq!(kernel.heir(0), Some(t));
//!
//! let sem = kernel.sync_create(SyncKind::CountingSemaphore, Protocol::None, 0).unwrap();
//! assert_eq!(kernel.sync_seize(t, sem, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
//! assert_eq!(kernel.thread_state(t), Ok(ThreadState::Blocked));
//! ```
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

mod cfg;
mod dispatch;
mod error;
mod fatal;
mod id;
mod klock;
mod port;
mod priority;
mod processor;
mod scheduler;
mod smp;
mod sync;
mod thread;
mod threadq;
mod timeout;
mod utils;
mod wait;

pub use self::{
    cfg::{CfgBuilder, CfgError, KernelCfg, ProcessorCfg, MAX_PRIORITY_LEVELS},
    error::*,
    fatal::FatalCode,
    id::{SchedulerId, SyncId, ThreadId},
    port::{HostedPort, Port},
    priority::Priority,
    processor::{ProcessorSet, MAX_PROCESSORS},
    scheduler::{SchedulerKind, MAX_SCHEDULERS},
    sync::{Protocol, SeizeStatus, SyncAttr, SyncInfo, SyncKind, WaitOption},
    thread::{ThreadAttr, ThreadState},
    threadq::Discipline,
    utils::IndexSet,
    wait::WaitOutcome,
};

use self::{
    dispatch::Actions,
    fatal::fatal,
    id::Directory,
    klock::Critical,
    processor::Processor,
    scheduler::Scheduler,
    sync::SyncObject,
    thread::Thread,
    timeout::Watchdogs,
};

/// The kernel context.
pub struct Kernel<P: Port> {
    port: P,
    num_levels: usize,
    threads: Directory<Thread, ThreadId>,
    syncs: Directory<SyncObject, SyncId>,
    schedulers: Vec<Scheduler>,
    processors: Vec<Processor>,
    /// The idle thread of each processor.
    idle_threads: Vec<Arc<Thread>>,
    watchdogs: Watchdogs<Self>,
}

impl<P: Port> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("num_levels", &self.num_levels)
            .field("schedulers", &self.schedulers)
            .field("processors", &self.processors)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Initialize the kernel. Every online processor with an initial
    /// scheduler assignment is attached to that scheduler.
    pub fn new(port: P, cfg: KernelCfg) -> Self {
        let num_processors = cfg.processors.len();
        let threads = Directory::new(cfg.max_threads + num_processors);

        let mut idle_threads = Vec::with_capacity(num_processors);
        let mut processors = Vec::with_capacity(num_processors);
        for (cpu, p) in cfg.processors.iter().enumerate() {
            let home = p.scheduler.unwrap_or(0);
            let Ok((id, idle)) =
                threads.allocate(|id| Thread::new(id, Priority(0), home, None, Some(cpu)))
            else {
                fatal(&port, FatalCode::InitFailed);
            };
            idle_threads.push(idle);
            processors.push(Processor::new(cpu, p.online, p.scheduler, id));
        }

        let kernel = Self {
            port,
            num_levels: cfg.num_priority_levels,
            threads,
            syncs: Directory::new(cfg.max_sync_objects),
            schedulers: cfg
                .schedulers
                .iter()
                .enumerate()
                .map(|(i, &kind)| Scheduler::new(i, kind, cfg.num_priority_levels))
                .collect(),
            processors,
            idle_threads,
            watchdogs: Watchdogs::new(),
        };

        {
            let cs = Critical::enter(&kernel.port);
            let mut actions = Actions::new();
            for (cpu, p) in cfg.processors.iter().enumerate() {
                match p.scheduler {
                    Some(scheduler) if p.online => {
                        if let Err(e) = kernel.attach_processor(&cs, scheduler, cpu, &mut actions) {
                            log::warn!("processor {cpu} not attached: {e:?}");
                        }
                    }
                    _ => log::debug!("processor {cpu} starts unowned"),
                }
            }
            kernel.commit(&cs, actions);
        }

        log::debug!("kernel initialized: {kernel:?}");
        kernel
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn num_processors(&self) -> usize {
        self.processors.len()
    }

    /// Get the idle thread of a processor.
    pub fn idle_thread(&self, cpu: usize) -> Option<ThreadId> {
        self.processors.get(cpu).map(|p| p.idle)
    }

    /// Advance the tick count and fire every watchdog that expires.
    pub fn tick(&self) {
        let fired = {
            let cs = Critical::enter(&self.port);
            self.watchdogs.advance(&cs)
        };
        for (callback, arg) in fired {
            callback(self, arg);
        }
    }

    /// Get the current tick count.
    pub fn now(&self) -> u64 {
        let cs = Critical::enter(&self.port);
        self.watchdogs.now(&cs)
    }

    /// Get the number of armed timeouts.
    pub fn armed_timeouts(&self) -> usize {
        let cs = Critical::enter(&self.port);
        self.watchdogs.len(&cs)
    }

    /// Get the thread chosen to run next on a processor.
    pub fn heir(&self, cpu: usize) -> Option<ThreadId> {
        self.processors.get(cpu)?.heir()
    }

    /// Get the thread running on a processor.
    pub fn executing(&self, cpu: usize) -> Option<ThreadId> {
        self.processors.get(cpu)?.executing()
    }

    /// Get a flag indicating whether the heir of a processor changed since
    /// its last [`Self::dispatch`].
    pub fn is_dispatch_necessary(&self, cpu: usize) -> bool {
        self.processors
            .get(cpu)
            .map_or(false, Processor::is_dispatch_necessary)
    }

    /// Complete a context switch on a processor: its heir becomes the
    /// executing thread. Returns the new executing thread.
    pub fn dispatch(&self, cpu: usize) -> Option<ThreadId> {
        self.processors.get(cpu)?.dispatch()
    }
}
