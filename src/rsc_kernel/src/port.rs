//! The interface to the context-switch and interrupt layers
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::fatal::FatalCode;

/// Implemented by a port. The kernel calls these methods to mask interrupts,
/// to ask a processor to switch to its heir thread, and to halt the system.
///
/// # Safety
///
/// `enter_cpu_lock` must mask every interrupt that can call into the kernel
/// on the current processor until the matching `leave_cpu_lock`. Calls nest.
pub unsafe trait Port: Send + Sync + 'static {
    /// Mask kernel-managed interrupts on the current processor.
    fn enter_cpu_lock(&self);

    /// Undo the matching `enter_cpu_lock`.
    fn leave_cpu_lock(&self);

    /// Ask the processor `cpu` to switch to its heir thread.
    ///
    /// This may be called for the current processor, in which case the
    /// switch is expected to happen once CPU Lock is released.
    fn request_dispatch(&self, cpu: usize);

    /// Halt or reset the system after an unrecoverable error.
    fn fatal(&self, code: FatalCode) -> !;
}

/// A [`Port`] for running the kernel on a hosted environment.
///
/// Interrupt masking is a no-op. Dispatch requests are counted per
/// processor so that a test harness can observe them.
#[derive(Debug)]
pub struct HostedPort {
    dispatch_requests: Vec<AtomicU32>,
    cpu_lock_depth: AtomicU32,
    halted: AtomicBool,
}

impl HostedPort {
    pub fn new(num_processors: usize) -> Self {
        Self {
            dispatch_requests: (0..num_processors).map(|_| AtomicU32::new(0)).collect(),
            cpu_lock_depth: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Get the number of dispatch requests issued for `cpu` so far.
    pub fn dispatch_requests(&self, cpu: usize) -> u32 {
        self.dispatch_requests
            .get(cpu)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Take and reset the number of dispatch requests issued for `cpu`.
    pub fn take_dispatch_requests(&self, cpu: usize) -> u32 {
        self.dispatch_requests
            .get(cpu)
            .map_or(0, |c| c.swap(0, Ordering::Relaxed))
    }

    /// Get a flag indicating whether a fatal error has been reported.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }
}

unsafe impl Port for HostedPort {
    fn enter_cpu_lock(&self) {
        self.cpu_lock_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn leave_cpu_lock(&self) {
        let old = self.cpu_lock_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert_ne!(old, 0);
    }

    fn request_dispatch(&self, cpu: usize) {
        log::trace!("request_dispatch({cpu})");
        if let Some(c) = self.dispatch_requests.get(cpu) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fatal(&self, code: FatalCode) -> ! {
        self.halted.store(true, Ordering::Relaxed);
        panic!("fatal error: {code:?}");
    }
}
