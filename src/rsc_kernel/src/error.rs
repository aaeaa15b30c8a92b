//! Status codes and per-directive error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use rsc_kernel::ResultCode;
            /// assert_eq!(ResultCode::ResourceInUse.as_str(), "ResourceInUse");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }

        impl fmt::Display for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All status codes (including success) a directive can produce.
    ///
    /// The numbering is stable so that a C directive layer can return these
    /// values unchanged.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The directive completed successfully.
        Successful = 0,
        /// The object identifier does not name a live object of the expected
        /// class.
        InvalidId = -4,
        /// A required output location was null. Only a C directive layer
        /// produces this code.
        InvalidAddress = -9,
        /// The object is held or contested.
        ResourceInUse = -12,
        /// The request could not be satisfied without waiting, or the
        /// resource reached its limit.
        Unsatisfied = -13,
        /// The wait timed out.
        Timeout = -6,
        /// The object was deleted while the caller was waiting on it.
        ObjectWasDeleted = -7,
        /// The caller's priority is more urgent than the priority ceiling.
        CeilingViolated = -18,
        /// The object or processor is in a state that disallows the
        /// operation.
        IncorrectState = -14,
        /// The processor has no configuration for the operation.
        NotConfigured = -22,
        /// A number argument is out of range.
        InvalidNumber = -10,
        /// The priority is out of range.
        InvalidPriority = -19,
        /// The caller does not own the resource.
        NotOwner = -23,
        /// The operation is not defined for the object variant.
        NotDefined = -11,
        /// The object directory is full.
        TooMany = -5,
        /// Blocking would close a cycle of mutex owners.
        WouldDeadlock = -30,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }

    /// Reconstruct a code from its numeric representation.
    pub fn from_i8(x: i8) -> Option<Self> {
        const ALL: [ResultCode; 16] = [
            ResultCode::Successful,
            ResultCode::InvalidId,
            ResultCode::InvalidAddress,
            ResultCode::ResourceInUse,
            ResultCode::Unsatisfied,
            ResultCode::Timeout,
            ResultCode::ObjectWasDeleted,
            ResultCode::CeilingViolated,
            ResultCode::IncorrectState,
            ResultCode::NotConfigured,
            ResultCode::InvalidNumber,
            ResultCode::InvalidPriority,
            ResultCode::NotOwner,
            ResultCode::NotDefined,
            ResultCode::TooMany,
            ResultCode::WouldDeadlock,
        ];
        ALL.iter().copied().find(|c| *c as i8 == x)
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Successful,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Successful,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod bad_id_error {}
    /// The identifier does not name a live object.
    pub enum BadIdError {
        InvalidId,
    }
}

define_error! {
    mod create_thread_error {}
    /// Error type for [`Kernel::thread_create`].
    ///
    /// [`Kernel::thread_create`]: crate::Kernel::thread_create
    pub enum CreateThreadError: BadIdError {
        /// The home scheduler is unknown.
        InvalidId,
        /// The priority is out of range.
        InvalidPriority,
        /// The home scheduler owns no processor.
        Unsatisfied,
        /// The thread directory is full.
        TooMany,
        /// The affinity set is empty or misses every processor of the home
        /// scheduler.
        InvalidNumber,
    }
}

define_error! {
    mod delete_thread_error {}
    /// Error type for [`Kernel::thread_delete`].
    ///
    /// [`Kernel::thread_delete`]: crate::Kernel::thread_delete
    pub enum DeleteThreadError: BadIdError {
        InvalidId,
        /// The thread owns a mutex.
        ResourceInUse,
        /// The thread is an idle thread.
        IncorrectState,
    }
}

define_error! {
    mod set_thread_priority_error {}
    /// Error type for [`Kernel::thread_set_priority`].
    ///
    /// [`Kernel::thread_set_priority`]: crate::Kernel::thread_set_priority
    pub enum SetThreadPriorityError: BadIdError {
        InvalidId,
        /// The priority is out of range.
        InvalidPriority,
        /// The thread owns a ceiling mutex whose ceiling is below the new
        /// priority.
        CeilingViolated,
        /// The thread is an idle thread.
        IncorrectState,
    }
}

define_error! {
    mod set_thread_scheduler_error {}
    /// Error type for [`Kernel::thread_set_scheduler`].
    ///
    /// [`Kernel::thread_set_scheduler`]: crate::Kernel::thread_set_scheduler
    pub enum SetThreadSchedulerError: BadIdError {
        InvalidId,
        InvalidPriority,
        /// The thread owns mutexes or waits on a thread queue.
        ResourceInUse,
        /// The target scheduler owns no processor.
        Unsatisfied,
        /// The thread is an idle thread or pinned.
        IncorrectState,
    }
}

define_error! {
    mod set_thread_affinity_error {}
    /// Error type for [`Kernel::thread_set_affinity`].
    ///
    /// [`Kernel::thread_set_affinity`]: crate::Kernel::thread_set_affinity
    pub enum SetThreadAffinityError: BadIdError {
        InvalidId,
        /// The set is empty or misses every processor of the home scheduler.
        InvalidNumber,
        /// The thread is an idle thread.
        IncorrectState,
    }
}

define_error! {
    mod thread_state_error {}
    /// Error type for simple per-thread directives.
    pub enum ThreadStateError: BadIdError {
        InvalidId,
        /// The thread is not in a state that allows the operation.
        IncorrectState,
        /// The directive is not defined for the thread's home scheduler.
        NotDefined,
    }
}

define_error! {
    mod create_sync_error {}
    /// Error type for [`Kernel::sync_create`].
    ///
    /// [`Kernel::sync_create`]: crate::Kernel::sync_create
    pub enum CreateSyncError {
        /// The combination of kind, protocol and discipline is not defined.
        NotDefined,
        /// A count or party number is out of range.
        InvalidNumber,
        /// The ceiling is out of range.
        InvalidPriority,
        /// The object directory is full.
        TooMany,
    }
}

define_error! {
    mod delete_sync_error {}
    /// Error type for [`Kernel::sync_delete`].
    ///
    /// [`Kernel::sync_delete`]: crate::Kernel::sync_delete
    pub enum DeleteSyncError: BadIdError {
        InvalidId,
        /// The object is held.
        ResourceInUse,
    }
}

define_error! {
    mod seize_error {}
    /// Error type for [`Kernel::sync_seize`].
    ///
    /// [`Kernel::sync_seize`]: crate::Kernel::sync_seize
    pub enum SeizeError: BadIdError {
        InvalidId,
        /// The resource is unavailable and the caller asked not to wait, or a
        /// non-recursive mutex was seized again by its owner.
        Unsatisfied,
        /// The caller's priority is more urgent than the ceiling.
        CeilingViolated,
        /// Seize is not defined for the object variant.
        NotDefined,
        /// The caller is already waiting.
        IncorrectState,
        /// Waiting would close an ownership cycle.
        WouldDeadlock,
    }
}

define_error! {
    mod surrender_error {}
    /// Error type for [`Kernel::sync_surrender`].
    ///
    /// [`Kernel::sync_surrender`]: crate::Kernel::sync_surrender
    pub enum SurrenderError: BadIdError {
        InvalidId,
        /// The caller does not own the mutex.
        NotOwner,
        /// The semaphore count would exceed its maximum.
        Unsatisfied,
    }
}

define_error! {
    mod flush_error {}
    /// Error type for [`Kernel::sync_flush`].
    ///
    /// [`Kernel::sync_flush`]: crate::Kernel::sync_flush
    pub enum FlushError: BadIdError {
        InvalidId,
        /// Flush is not defined for the object variant.
        NotDefined,
    }
}

define_error! {
    mod condition_wait_error {}
    /// Error type for [`Kernel::condition_wait`].
    ///
    /// [`Kernel::condition_wait`]: crate::Kernel::condition_wait
    pub enum ConditionWaitError: BadIdError {
        InvalidId,
        /// The caller does not own the mutex.
        NotOwner,
        /// The caller is already waiting, or other waiters use another mutex.
        IncorrectState,
        /// One of the objects has the wrong variant.
        NotDefined,
    }
}

define_error! {
    mod set_ceiling_error {}
    /// Error type for [`Kernel::sync_set_ceiling`].
    ///
    /// [`Kernel::sync_set_ceiling`]: crate::Kernel::sync_set_ceiling
    pub enum SetCeilingError: BadIdError {
        InvalidId,
        InvalidPriority,
        /// The object has no ceiling.
        NotDefined,
    }
}

define_error! {
    mod add_processor_error {}
    /// Error type for [`Kernel::scheduler_add_processor`].
    ///
    /// [`Kernel::scheduler_add_processor`]: crate::Kernel::scheduler_add_processor
    pub enum AddProcessorError: BadIdError {
        InvalidId,
        /// The processor does not exist or has no initial scheduler
        /// assignment.
        NotConfigured,
        /// The processor is offline.
        IncorrectState,
        /// The processor is owned by a scheduler.
        ResourceInUse,
    }
}

define_error! {
    mod remove_processor_error {}
    /// Error type for [`Kernel::scheduler_remove_processor`].
    ///
    /// [`Kernel::scheduler_remove_processor`]: crate::Kernel::scheduler_remove_processor
    pub enum RemoveProcessorError: BadIdError {
        InvalidId,
        /// The processor does not exist or is not owned by the scheduler.
        InvalidNumber,
        /// The processor is the last one of a scheduler still in use.
        ResourceInUse,
    }
}

define_error! {
    mod wait_error {}
    /// The unsuccessful outcome of a completed wait.
    pub enum WaitError {
        /// The timeout expired.
        Timeout,
        /// The object was deleted.
        ObjectWasDeleted,
        /// The waiter was flushed.
        Unsatisfied,
    }
}

impl WaitError {
    /// Map a wait status to the outcome of a wait.
    pub(crate) fn from_status(code: ResultCode) -> Result<(), Self> {
        match code {
            ResultCode::Successful => Ok(()),
            ResultCode::Timeout => Err(Self::Timeout),
            ResultCode::ObjectWasDeleted => Err(Self::ObjectWasDeleted),
            _ => Err(Self::Unsatisfied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip_through_i8() {
        for code in [
            ResultCode::Successful,
            ResultCode::Timeout,
            ResultCode::WouldDeadlock,
            ResultCode::InvalidAddress,
        ] {
            assert_eq!(ResultCode::from_i8(code as i8), Some(code));
        }
        assert_eq!(ResultCode::from_i8(1), None);
    }

    #[test]
    fn only_success_is_ok() {
        assert!(ResultCode::Successful.is_ok());
        assert!(ResultCode::Timeout.is_err());
        assert!(ResultCode::NotConfigured.is_err());
    }

    #[test]
    fn sub_error_converts() {
        assert_eq!(SeizeError::from(BadIdError::InvalidId), SeizeError::InvalidId);
        assert_eq!(
            RemoveProcessorError::from(BadIdError::InvalidId),
            RemoveProcessorError::InvalidId
        );
    }

    #[test]
    fn wait_status_mapping() {
        assert_eq!(WaitError::from_status(ResultCode::Successful), Ok(()));
        assert_eq!(
            WaitError::from_status(ResultCode::ObjectWasDeleted),
            Err(WaitError::ObjectWasDeleted)
        );
    }
}
