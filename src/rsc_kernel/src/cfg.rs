//! Kernel configuration
use alloc::vec::Vec;
use core::fmt;

use crate::{processor::MAX_PROCESSORS, scheduler::SchedulerKind, scheduler::MAX_SCHEDULERS};

/// The maximum number of priority levels.
pub const MAX_PRIORITY_LEVELS: usize = 1024;

/// The configuration of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorCfg {
    /// The index of the scheduler the processor is initially assigned to.
    /// A processor without an initial assignment can't be attached to any
    /// scheduler.
    pub scheduler: Option<usize>,
    pub online: bool,
}

/// A validated kernel configuration, produced by [`CfgBuilder::finish`].
#[derive(Debug, Clone)]
pub struct KernelCfg {
    pub(crate) num_priority_levels: usize,
    pub(crate) schedulers: Vec<SchedulerKind>,
    pub(crate) processors: Vec<ProcessorCfg>,
    pub(crate) max_threads: usize,
    pub(crate) max_sync_objects: usize,
}

impl KernelCfg {
    pub fn num_priority_levels(&self) -> usize {
        self.num_priority_levels
    }

    pub fn num_processors(&self) -> usize {
        self.processors.len()
    }
}

/// A configuration error reported by [`CfgBuilder::finish`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CfgError {
    NoProcessors,
    TooManyProcessors,
    TooManySchedulers,
    /// A processor names a scheduler that was not configured.
    UnknownScheduler { cpu: usize, scheduler: usize },
    InvalidPriorityLevels,
}

impl fmt::Debug for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoProcessors => f.write_str("no processors are configured"),
            Self::TooManyProcessors => {
                write!(f, "at most {MAX_PROCESSORS} processors can be configured")
            }
            Self::TooManySchedulers => {
                write!(f, "at most {MAX_SCHEDULERS} schedulers can be configured")
            }
            Self::UnknownScheduler { cpu, scheduler } => {
                write!(f, "processor {cpu} is assigned to unknown scheduler {scheduler}")
            }
            Self::InvalidPriorityLevels => write!(
                f,
                "the number of priority levels must be in range 1..={MAX_PRIORITY_LEVELS}"
            ),
        }
    }
}

/// Builds a [`KernelCfg`].
///
/// # Examples
///
/// ```
/// use rsc_kernel::{CfgBuilder, ProcessorCfg, SchedulerKind};
///
/// let mut b = CfgBuilder::new();
/// let sched = b.scheduler(SchedulerKind::Priority);
/// b.processor(ProcessorCfg { scheduler: Some(sched), online: true });
/// let cfg = b.finish().unwrap();
/// assert_eq!(cfg.num_processors(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct CfgBuilder {
    inner: KernelCfg,
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CfgBuilder {
    pub fn new() -> Self {
        Self {
            inner: KernelCfg {
                num_priority_levels: 256,
                schedulers: Vec::new(),
                processors: Vec::new(),
                max_threads: 64,
                max_sync_objects: 64,
            },
        }
    }

    /// Specify the number of priority levels. Valid priorities are
    /// `0..n`; a higher value is more urgent. Defaults to 256.
    pub fn num_priority_levels(&mut self, n: usize) -> &mut Self {
        self.inner.num_priority_levels = n;
        self
    }

    /// Add a scheduler instance. Returns its index.
    pub fn scheduler(&mut self, kind: SchedulerKind) -> usize {
        self.inner.schedulers.push(kind);
        self.inner.schedulers.len() - 1
    }

    /// Add a processor. Returns its index.
    pub fn processor(&mut self, cfg: ProcessorCfg) -> usize {
        self.inner.processors.push(cfg);
        self.inner.processors.len() - 1
    }

    /// Specify the maximum number of threads, excluding idle threads.
    pub fn max_threads(&mut self, n: usize) -> &mut Self {
        self.inner.max_threads = n;
        self
    }

    pub fn max_sync_objects(&mut self, n: usize) -> &mut Self {
        self.inner.max_sync_objects = n;
        self
    }

    /// Validate the configuration.
    pub fn finish(&self) -> Result<KernelCfg, CfgError> {
        let cfg = &self.inner;
        if !(1..=MAX_PRIORITY_LEVELS).contains(&cfg.num_priority_levels) {
            return Err(CfgError::InvalidPriorityLevels);
        }
        if cfg.processors.is_empty() {
            return Err(CfgError::NoProcessors);
        }
        if cfg.processors.len() > MAX_PROCESSORS {
            return Err(CfgError::TooManyProcessors);
        }
        if cfg.schedulers.len() > MAX_SCHEDULERS {
            return Err(CfgError::TooManySchedulers);
        }
        for (cpu, p) in cfg.processors.iter().enumerate() {
            if let Some(scheduler) = p.scheduler {
                if scheduler >= cfg.schedulers.len() {
                    return Err(CfgError::UnknownScheduler { cpu, scheduler });
                }
            }
        }
        Ok(cfg.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(scheduler: usize) -> ProcessorCfg {
        ProcessorCfg {
            scheduler: Some(scheduler),
            online: true,
        }
    }

    #[test]
    fn rejects_unknown_scheduler() {
        let mut b = CfgBuilder::new();
        let s = b.scheduler(SchedulerKind::Priority);
        b.processor(online(s));
        b.processor(online(s + 1));
        assert_eq!(
            b.finish().err(),
            Some(CfgError::UnknownScheduler {
                cpu: 1,
                scheduler: s + 1
            })
        );
    }

    #[test]
    fn rejects_bad_limits() {
        let mut b = CfgBuilder::new();
        assert_eq!(b.finish().err(), Some(CfgError::NoProcessors));

        let s = b.scheduler(SchedulerKind::Edf);
        for _ in 0..=MAX_PROCESSORS {
            b.processor(online(s));
        }
        assert_eq!(b.finish().err(), Some(CfgError::TooManyProcessors));

        let mut b = CfgBuilder::new();
        b.processor(ProcessorCfg {
            scheduler: None,
            online: false,
        });
        b.num_priority_levels(0);
        assert_eq!(b.finish().err(), Some(CfgError::InvalidPriorityLevels));
        b.num_priority_levels(MAX_PRIORITY_LEVELS);
        assert!(b.finish().is_ok());
    }
}
