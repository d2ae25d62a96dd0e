//! Error types returned by the kernel directives.
//!
//! Every directive has its own error enum listing exactly the conditions it
//! can fail with. All of them share the discriminant space of [`ResultCode`],
//! making the conversion into the kernel-wide code free.
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
            /// use kestrel_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
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
    };
}

define_result_code! {
    /// All result codes (including success) that a directive can produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is
        /// available.
        Success = 0,
        /// A parameter is invalid in a way that is not covered by any other
        /// error codes.
        BadParam = -17,
        /// The specified object identifier is invalid, refers to a foreign
        /// node, or refers to a slot whose generation number does not match
        /// (the object was deleted and possibly recreated).
        BadId = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// No object with the specified name exists.
        BadName = -27,
        /// The object is in use and cannot be deleted.
        Busy = -28,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur.
        WouldDeadlock = -30,
        /// An object couldn't be created because the containing registry is
        /// full.
        TooMany = -33,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// A resource count would exceed its configured maximum value.
        Overflow = -43,
        /// The request couldn't be satisfied immediately, and the caller
        /// asked not to wait.
        Unsatisfied = -44,
        /// The wait operation was interrupted by another task.
        Interrupted = -49,
        /// The operation timed out.
        Timeout = -50,
        /// The object was deleted while the calling task was waiting on it.
        Deleted = -51,
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
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
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
                    Ok(()) => Self::Success,
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
    mod wait_error {}
    /// Error type for wait operations without timeout.
    pub enum WaitError {
        Interrupted,
        Deleted,
    }
}

define_error! {
    mod wait_timeout_error {}
    /// Error type for wait operations with timeout.
    pub enum WaitTimeoutError: WaitError {
        Interrupted,
        Timeout,
        Deleted,
    }
}

define_error! {
    mod ident_error {}
    /// Error type for the `ident` directive of every object class.
    pub enum IdentError {
        /// CPU Lock is active.
        BadContext,
        /// No object with the specified name exists.
        BadName,
    }
}

define_error! {
    mod create_task_error {}
    /// Error type for [`System::create_task`].
    ///
    /// [`System::create_task`]: crate::System::create_task
    pub enum CreateTaskError {
        /// CPU Lock is active.
        BadContext,
        /// The initial priority is out of range.
        BadParam,
        /// The task registry is full.
        TooMany,
    }
}

define_error! {
    mod start_task_error {}
    /// Error type for [`System::start_task`].
    ///
    /// [`System::start_task`]: crate::System::start_task
    pub enum StartTaskError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The task is not in the Dormant state.
        BadObjectState,
    }
}

define_error! {
    mod restart_task_error {}
    /// Error type for [`System::restart_task`].
    ///
    /// [`System::restart_task`]: crate::System::restart_task
    pub enum RestartTaskError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The task is in the Dormant state and was never started.
        BadObjectState,
    }
}

define_error! {
    mod delete_task_error {}
    /// Error type for [`System::delete_task`].
    ///
    /// [`System::delete_task`]: crate::System::delete_task
    pub enum DeleteTaskError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
    }
}

define_error! {
    mod suspend_task_error {}
    /// Error type for [`System::suspend_task`].
    ///
    /// [`System::suspend_task`]: crate::System::suspend_task
    pub enum SuspendTaskError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The task is in the Dormant state.
        BadObjectState,
    }
}

define_error! {
    mod resume_task_error {}
    /// Error type for [`System::resume_task`].
    ///
    /// [`System::resume_task`]: crate::System::resume_task
    pub enum ResumeTaskError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The task is in the Dormant state or is not suspended.
        BadObjectState,
    }
}

define_error! {
    mod set_task_priority_error {}
    /// Error type for [`System::set_task_priority`].
    ///
    /// [`System::set_task_priority`]: crate::System::set_task_priority
    pub enum SetTaskPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The priority is out of range, or the task owns a ceiling-protocol
        /// mutex and the new priority is higher (numerically lower) than the
        /// mutex's priority ceiling.
        BadParam,
        /// The task is in the Dormant state.
        BadObjectState,
    }
}

define_error! {
    mod get_task_priority_error {}
    /// Error type for [`System::task_priority`].
    ///
    /// [`System::task_priority`]: crate::System::task_priority
    pub enum GetTaskPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The task is in the Dormant state.
        BadObjectState,
    }
}

define_error! {
    mod set_task_deadline_error {}
    /// Error type for [`System::set_task_deadline`].
    ///
    /// [`System::set_task_deadline`]: crate::System::set_task_deadline
    pub enum SetTaskDeadlineError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The task is in the Dormant state.
        BadObjectState,
    }
}

define_error! {
    mod change_task_mode_error {}
    /// Error type for [`System::change_current_task_mode`].
    ///
    /// [`System::change_current_task_mode`]: crate::System::change_current_task_mode
    pub enum ChangeTaskModeError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`System::exit_task`].
    ///
    /// [`System::exit_task`]: crate::System::exit_task
    pub enum ExitTaskError {
        /// The current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`System::wake_after`].
    ///
    /// [`System::wake_after`]: crate::System::wake_after
    pub enum SleepError: WaitError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        Interrupted,
        Deleted,
    }
}

define_error! {
    mod create_mutex_error {}
    /// Error type for [`System::create_mutex`].
    ///
    /// [`System::create_mutex`]: crate::System::create_mutex
    pub enum CreateMutexError {
        /// CPU Lock is active.
        BadContext,
        /// The priority ceiling is out of range.
        BadParam,
        /// The mutex registry is full.
        TooMany,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`System::try_lock_mutex`].
    ///
    /// [`System::try_lock_mutex`]: crate::System::try_lock_mutex
    pub enum TryLockMutexError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The mutex is already locked and the caller asked not to wait.
        Unsatisfied,
        /// The current task already owns the mutex, and the mutex was created
        /// with [`Recursion::Refused`].
        ///
        /// [`Recursion::Refused`]: crate::mutex::Recursion::Refused
        WouldDeadlock,
        /// The mutex was created with the ceiling protocol and the current
        /// task's base priority is higher (numerically lower) than the
        /// mutex's priority ceiling.
        BadParam,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`System::lock_mutex`].
    ///
    /// [`System::lock_mutex`]: crate::System::lock_mutex
    pub enum LockMutexError: WaitError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        /// The mutex was deleted while the calling task was waiting for it.
        Deleted,
        /// The current task already owns the mutex, and the mutex was created
        /// with [`Recursion::Refused`].
        ///
        /// [`Recursion::Refused`]: crate::mutex::Recursion::Refused
        WouldDeadlock,
        /// The mutex was created with the ceiling protocol and the current
        /// task's base priority is higher (numerically lower) than the
        /// mutex's priority ceiling.
        BadParam,
    }
}

define_error! {
    mod lock_mutex_timeout_error {}
    /// Error type for [`System::lock_mutex_timeout`].
    ///
    /// [`System::lock_mutex_timeout`]: crate::System::lock_mutex_timeout
    pub enum LockMutexTimeoutError: WaitTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        Timeout,
        /// The mutex was deleted while the calling task was waiting for it.
        Deleted,
        /// The current task already owns the mutex, and the mutex was created
        /// with [`Recursion::Refused`].
        ///
        /// [`Recursion::Refused`]: crate::mutex::Recursion::Refused
        WouldDeadlock,
        /// The mutex was created with the ceiling protocol and the current
        /// task's base priority is higher (numerically lower) than the
        /// mutex's priority ceiling.
        BadParam,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`System::unlock_mutex`].
    ///
    /// [`System::unlock_mutex`]: crate::System::unlock_mutex
    pub enum UnlockMutexError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The current task does not currently own the mutex.
        NotOwner,
    }
}

define_error! {
    mod delete_mutex_error {}
    /// Error type for [`System::delete_mutex`].
    ///
    /// [`System::delete_mutex`]: crate::System::delete_mutex
    pub enum DeleteMutexError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The mutex is currently owned by a task.
        Busy,
    }
}

define_error! {
    mod create_semaphore_error {}
    /// Error type for [`System::create_semaphore`].
    ///
    /// [`System::create_semaphore`]: crate::System::create_semaphore
    pub enum CreateSemaphoreError {
        /// CPU Lock is active.
        BadContext,
        /// The initial count exceeds the maximum value, or the maximum value
        /// is zero.
        BadParam,
        /// The semaphore registry is full.
        TooMany,
    }
}

define_error! {
    mod poll_semaphore_error {}
    /// Error type for [`System::poll_semaphore`].
    ///
    /// [`System::poll_semaphore`]: crate::System::poll_semaphore
    pub enum PollSemaphoreError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The semaphore count is zero and the caller asked not to wait.
        Unsatisfied,
    }
}

define_error! {
    mod obtain_semaphore_error {}
    /// Error type for [`System::obtain_semaphore`].
    ///
    /// [`System::obtain_semaphore`]: crate::System::obtain_semaphore
    pub enum ObtainSemaphoreError: WaitError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        /// The semaphore was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod obtain_semaphore_timeout_error {}
    /// Error type for [`System::obtain_semaphore_timeout`].
    ///
    /// [`System::obtain_semaphore_timeout`]: crate::System::obtain_semaphore_timeout
    pub enum ObtainSemaphoreTimeoutError: WaitTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        Timeout,
        /// The semaphore was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod release_semaphore_error {}
    /// Error type for [`System::release_semaphore`].
    ///
    /// [`System::release_semaphore`]: crate::System::release_semaphore
    pub enum ReleaseSemaphoreError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The semaphore count is already at the maximum value.
        Overflow,
    }
}

define_error! {
    mod delete_semaphore_error {}
    /// Error type for [`System::delete_semaphore`].
    ///
    /// [`System::delete_semaphore`]: crate::System::delete_semaphore
    pub enum DeleteSemaphoreError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
    }
}

define_error! {
    mod create_queue_error {}
    /// Error type for [`System::create_queue`].
    ///
    /// [`System::create_queue`]: crate::System::create_queue
    pub enum CreateQueueError {
        /// CPU Lock is active.
        BadContext,
        /// The capacity or the maximum message size is out of range.
        BadParam,
        /// The message queue registry is full.
        TooMany,
    }
}

define_error! {
    mod try_send_error {}
    /// Error type for [`System::try_send`] and [`System::urgent_send`].
    ///
    /// [`System::try_send`]: crate::System::try_send
    /// [`System::urgent_send`]: crate::System::urgent_send
    pub enum TrySendError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The message is larger than the queue's maximum message size.
        BadParam,
        /// The pending message buffer is full and the caller asked not to
        /// wait.
        Unsatisfied,
    }
}

define_error! {
    mod send_error {}
    /// Error type for [`System::send`].
    ///
    /// [`System::send`]: crate::System::send
    pub enum SendError: WaitError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The message is larger than the queue's maximum message size.
        BadParam,
        Interrupted,
        /// The message queue was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod send_timeout_error {}
    /// Error type for [`System::send_timeout`].
    ///
    /// [`System::send_timeout`]: crate::System::send_timeout
    pub enum SendTimeoutError: WaitTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The message is larger than the queue's maximum message size.
        BadParam,
        Interrupted,
        Timeout,
        /// The message queue was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod try_receive_error {}
    /// Error type for [`System::try_receive`].
    ///
    /// [`System::try_receive`]: crate::System::try_receive
    pub enum TryReceiveError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// No message is pending and the caller asked not to wait.
        Unsatisfied,
    }
}

define_error! {
    mod receive_error {}
    /// Error type for [`System::receive`].
    ///
    /// [`System::receive`]: crate::System::receive
    pub enum ReceiveError: WaitError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        /// The message queue was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod receive_timeout_error {}
    /// Error type for [`System::receive_timeout`].
    ///
    /// [`System::receive_timeout`]: crate::System::receive_timeout
    pub enum ReceiveTimeoutError: WaitTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        Timeout,
        /// The message queue was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod broadcast_error {}
    /// Error type for [`System::broadcast`].
    ///
    /// [`System::broadcast`]: crate::System::broadcast
    pub enum BroadcastError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
        /// The message is larger than the queue's maximum message size.
        BadParam,
    }
}

define_error! {
    mod delete_queue_error {}
    /// Error type for [`System::delete_queue`].
    ///
    /// [`System::delete_queue`]: crate::System::delete_queue
    pub enum DeleteQueueError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
    }
}

define_error! {
    mod create_barrier_error {}
    /// Error type for [`System::create_barrier`].
    ///
    /// [`System::create_barrier`]: crate::System::create_barrier
    pub enum CreateBarrierError {
        /// CPU Lock is active.
        BadContext,
        /// The automatic release count is zero.
        BadParam,
        /// The barrier registry is full.
        TooMany,
    }
}

define_error! {
    mod wait_barrier_error {}
    /// Error type for [`System::wait_barrier`].
    ///
    /// [`System::wait_barrier`]: crate::System::wait_barrier
    pub enum WaitBarrierError: WaitError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        /// The barrier was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod wait_barrier_timeout_error {}
    /// Error type for [`System::wait_barrier_timeout`].
    ///
    /// [`System::wait_barrier_timeout`]: crate::System::wait_barrier_timeout
    pub enum WaitBarrierTimeoutError: WaitTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// Invalid object identifier.
        BadId,
        Interrupted,
        Timeout,
        /// The barrier was deleted while the calling task was waiting.
        Deleted,
    }
}

define_error! {
    mod release_barrier_error {}
    /// Error type for [`System::release_barrier`].
    ///
    /// [`System::release_barrier`]: crate::System::release_barrier
    pub enum ReleaseBarrierError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
    }
}

define_error! {
    mod delete_barrier_error {}
    /// Error type for [`System::delete_barrier`].
    ///
    /// [`System::delete_barrier`]: crate::System::delete_barrier
    pub enum DeleteBarrierError {
        /// CPU Lock is active.
        BadContext,
        /// Invalid object identifier.
        BadId,
    }
}

define_error! {
    mod time_error {}
    /// Error type for [`System::time`].
    ///
    /// [`System::time`]: crate::System::time
    pub enum TimeError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod dispatch_error {}
    /// Error type for [`System::disable_dispatch`] and
    /// [`System::enable_dispatch`].
    ///
    /// [`System::disable_dispatch`]: crate::System::disable_dispatch
    /// [`System::enable_dispatch`]: crate::System::enable_dispatch
    pub enum DispatchError {
        /// CPU Lock is active, the current context is not a task context, or
        /// dispatching is not disabled.
        BadContext,
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(IdentError)]
    #[into(CreateTaskError)]
    #[into(StartTaskError)]
    #[into(RestartTaskError)]
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskPriorityError)]
    #[into(SetTaskDeadlineError)]
    #[into(ChangeTaskModeError)]
    #[into(ExitTaskError)]
    #[into(SleepError)]
    #[into(CreateMutexError)]
    #[into(TryLockMutexError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(UnlockMutexError)]
    #[into(DeleteMutexError)]
    #[into(CreateSemaphoreError)]
    #[into(PollSemaphoreError)]
    #[into(ObtainSemaphoreError)]
    #[into(ObtainSemaphoreTimeoutError)]
    #[into(ReleaseSemaphoreError)]
    #[into(DeleteSemaphoreError)]
    #[into(CreateQueueError)]
    #[into(TrySendError)]
    #[into(SendError)]
    #[into(SendTimeoutError)]
    #[into(TryReceiveError)]
    #[into(ReceiveError)]
    #[into(ReceiveTimeoutError)]
    #[into(BroadcastError)]
    #[into(DeleteQueueError)]
    #[into(CreateBarrierError)]
    #[into(WaitBarrierError)]
    #[into(WaitBarrierTimeoutError)]
    #[into(ReleaseBarrierError)]
    #[into(DeleteBarrierError)]
    #[into(TimeError)]
    #[into(DispatchError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(StartTaskError)]
    #[into(RestartTaskError)]
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskPriorityError)]
    #[into(SetTaskDeadlineError)]
    #[into(TryLockMutexError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(UnlockMutexError)]
    #[into(DeleteMutexError)]
    #[into(PollSemaphoreError)]
    #[into(ObtainSemaphoreError)]
    #[into(ObtainSemaphoreTimeoutError)]
    #[into(ReleaseSemaphoreError)]
    #[into(DeleteSemaphoreError)]
    #[into(TrySendError)]
    #[into(SendError)]
    #[into(SendTimeoutError)]
    #[into(TryReceiveError)]
    #[into(ReceiveError)]
    #[into(ReceiveTimeoutError)]
    #[into(BroadcastError)]
    #[into(DeleteQueueError)]
    #[into(WaitBarrierError)]
    #[into(WaitBarrierTimeoutError)]
    #[into(ReleaseBarrierError)]
    #[into(DeleteBarrierError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `BadName`
    #[into(IdentError)]
    pub(crate) enum BadNameError {
        BadName,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(CreateTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(CreateMutexError)]
    #[into(CreateSemaphoreError)]
    #[into(CreateQueueError)]
    #[into(CreateBarrierError)]
    #[into(TrySendError)]
    #[into(SendError)]
    #[into(SendTimeoutError)]
    #[into(BroadcastError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_suberror! {
    /// `BadObjectState`
    #[into(StartTaskError)]
    #[into(RestartTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskPriorityError)]
    #[into(SetTaskDeadlineError)]
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

define_suberror! {
    /// `TooMany`
    #[into(CreateTaskError)]
    #[into(CreateMutexError)]
    #[into(CreateSemaphoreError)]
    #[into(CreateQueueError)]
    #[into(CreateBarrierError)]
    pub(crate) enum TooManyError {
        TooMany,
    }
}

define_suberror! {
    /// Some of the error codes shared by [`TryLockMutexError`],
    /// [`LockMutexError`], and [`LockMutexTimeoutError`]. Used internally
    /// by the mutex implementation.
    #[into(TryLockMutexError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    pub(crate) enum LockMutexPrecheckError {
        WouldDeadlock,
        BadParam,
    }
}

/// Convert `self` to `WaitError`, panicking if `self == Self::Timeout`.
#[inline]
pub(crate) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Interrupted => WaitError::Interrupted,
        WaitTimeoutError::Deleted => WaitError::Deleted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}
