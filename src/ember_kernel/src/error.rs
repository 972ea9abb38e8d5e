//! Result codes and per-operation error types
//!
//! Every operation of [`System`](crate::System) fails with an enum of its
//! own, listing only the codes that operation can produce. All of them
//! convert into [`ResultCode`].
use core::fmt;

/// Every code a kernel operation can report, including success.
///
/// Failures are negative.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum ResultCode {
    Success = 0,
    /// A parameter is out of range, or the requested transition isn't
    /// allowed for the target.
    BadParam = -17,
    /// The identifier doesn't refer to a live object.
    BadId = -18,
    /// The operation isn't allowed in the calling context, or CPU Lock is
    /// active.
    BadContext = -25,
    /// The target isn't in a state that allows the operation.
    BadObjectState = -41,
    /// The request has already fired or been cancelled.
    NotFound = -42,
    /// A fixed-size pool is full.
    QueueOverflow = -43,
    /// All hardware timer channels are in use.
    NoChannel = -44,
}

impl ResultCode {
    /// Get the name of the variant.
    ///
    /// ```
    /// use ember_kernel::ResultCode;
    /// assert_eq!(ResultCode::NoChannel.as_str(), "NoChannel");
    /// ```
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::BadParam => "BadParam",
            Self::BadId => "BadId",
            Self::BadContext => "BadContext",
            Self::BadObjectState => "BadObjectState",
            Self::NotFound => "NotFound",
            Self::QueueOverflow => "QueueOverflow",
            Self::NoChannel => "NoChannel",
        }
    }

    #[inline]
    pub const fn is_err(self) -> bool {
        (self as i8) < 0
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        !self.is_err()
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Define the error type of an operation. Each variant must name a
/// [`ResultCode`] variant, which it maps to.
macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                $vname
            ),*
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $( $name::$vname => Self::$vname ),*
                }
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                x.map_or_else(Self::from, |()| Self::Success)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(&ResultCode::from(*self), f)
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn maps_to_result_code() {
                $(
                    let code = ResultCode::from($name::$vname);
                    assert_eq!(code.as_str(), stringify!($vname));
                    assert!(code.is_err());
                    assert_eq!(ResultCode::from(Err($name::$vname)), code);
                )*
                assert_eq!(ResultCode::from(Ok::<(), $name>(())), ResultCode::Success);
            }
        }
    };
}

define_error! {
    mod create_task_error {}
    /// Error type for [`System::create_task`].
    ///
    /// [`System::create_task`]: crate::System::create_task
    pub enum CreateTaskError {
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range.
        BadParam,
        /// All task control blocks are in use.
        QueueOverflow,
    }
}

define_error! {
    mod set_task_status_error {}
    /// Error type for [`System::set_task_status`].
    ///
    /// [`System::set_task_status`]: crate::System::set_task_status
    pub enum SetTaskStatusError {
        /// CPU Lock is active.
        BadContext,
        /// The pid does not refer to a live task.
        BadId,
        /// `Running` was requested for a task other than the active task.
        BadParam,
    }
}

define_error! {
    mod sched_switch_error {}
    /// Error type for [`System::sched_switch`].
    ///
    /// [`System::sched_switch`]: crate::System::sched_switch
    pub enum SchedSwitchError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`System::exit_task`].
    ///
    /// [`System::exit_task`]: crate::System::exit_task
    pub enum ExitTaskError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod get_active_task_error {}
    /// Error type for [`System::active_task`].
    ///
    /// [`System::active_task`]: crate::System::active_task
    pub enum GetActiveTaskError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod query_task_error {}
    /// Error type for the per-task queries such as [`System::task_status`].
    ///
    /// [`System::task_status`]: crate::System::task_status
    pub enum QueryTaskError {
        /// CPU Lock is active.
        BadContext,
        /// The pid does not refer to a live task.
        BadId,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`System::yield_now`].
    ///
    /// [`System::yield_now`]: crate::System::yield_now
    pub enum YieldError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`System::sleep`].
    ///
    /// [`System::sleep`]: crate::System::sleep
    pub enum SleepError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod wakeup_error {}
    /// Error type for [`System::wakeup`].
    ///
    /// [`System::wakeup`]: crate::System::wakeup
    pub enum WakeupError {
        /// CPU Lock is active.
        BadContext,
        /// The pid does not refer to a live task.
        BadId,
        /// The task is not in the Sleeping state.
        BadObjectState,
    }
}

define_error! {
    mod set_hw_timer_error {}
    /// Error type for [`System::hw_timer_set`] and
    /// [`System::hw_timer_set_absolute`].
    ///
    /// [`System::hw_timer_set`]: crate::System::hw_timer_set
    /// [`System::hw_timer_set_absolute`]: crate::System::hw_timer_set_absolute
    pub enum SetHwTimerError {
        /// CPU Lock is active.
        BadContext,
        /// All channels are in use.
        NoChannel,
    }
}

define_error! {
    mod remove_hw_timer_error {}
    /// Error type for [`System::hw_timer_remove`].
    ///
    /// [`System::hw_timer_remove`]: crate::System::hw_timer_remove
    pub enum RemoveHwTimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod hw_timer_wait_error {}
    /// Error type for [`System::hw_timer_wait`].
    ///
    /// [`System::hw_timer_wait`]: crate::System::hw_timer_wait
    pub enum HwTimerWaitError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod time_error {}
    /// Error type for [`System::vtimer_now`].
    ///
    /// [`System::vtimer_now`]: crate::System::vtimer_now
    pub enum TimeError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod request_vtimer_error {}
    /// Error type for [`System::vtimer_request`] and
    /// [`System::vtimer_set_wakeup`].
    ///
    /// [`System::vtimer_request`]: crate::System::vtimer_request
    /// [`System::vtimer_set_wakeup`]: crate::System::vtimer_set_wakeup
    pub enum RequestVtimerError {
        /// CPU Lock is active.
        BadContext,
        /// The pid to wake up does not refer to a live task.
        BadId,
        /// The virtual timer pool is full.
        QueueOverflow,
    }
}

define_error! {
    mod cancel_vtimer_error {}
    /// Error type for [`System::vtimer_cancel`].
    ///
    /// [`System::vtimer_cancel`]: crate::System::vtimer_cancel
    pub enum CancelVtimerError {
        /// CPU Lock is active.
        BadContext,
        /// The request already fired or was cancelled.
        NotFound,
    }
}

define_error! {
    mod vtimer_sleep_error {}
    /// Error type for [`System::vtimer_sleep`].
    ///
    /// [`System::vtimer_sleep`]: crate::System::vtimer_sleep
    pub enum VtimerSleepError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The virtual timer pool is full.
        QueueOverflow,
    }
}

/// Define an internal error that several operations share. It converts
/// into [`ResultCode`] and into every `#[into]` type, each of which must
/// have variants of the same names.
macro_rules! define_suberror {
    (@from $Name:ident [$( $Variant:ident )*]) => {};

    (@from $Name:ident [$( $Variant:ident )*] $Target:path $(, $Rest:path )*) => {
        impl From<$Name> for $Target {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror!(@from $Name [$( $Variant )*] $( $Rest ),*);
    };

    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Target:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Clone, Copy, PartialEq, Eq)]
        $vis enum $Name {
            $( $Variant ),*
        }

        impl fmt::Debug for $Name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(&ResultCode::from(*self), f)
            }
        }

        define_suberror!(@from $Name [$( $Variant )*] ResultCode $(, $Target )*);
    };
}

define_suberror! {
    /// `BadContext`
    #[into(CreateTaskError)]
    #[into(SetTaskStatusError)]
    #[into(SchedSwitchError)]
    #[into(ExitTaskError)]
    #[into(GetActiveTaskError)]
    #[into(QueryTaskError)]
    #[into(YieldError)]
    #[into(SleepError)]
    #[into(WakeupError)]
    #[into(SetHwTimerError)]
    #[into(RemoveHwTimerError)]
    #[into(HwTimerWaitError)]
    #[into(TimeError)]
    #[into(RequestVtimerError)]
    #[into(CancelVtimerError)]
    #[into(VtimerSleepError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(SetTaskStatusError)]
    #[into(QueryTaskError)]
    #[into(WakeupError)]
    #[into(RequestVtimerError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(CreateTaskError)]
    #[into(SetTaskStatusError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_suberror! {
    /// `BadObjectState`
    #[into(WakeupError)]
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

define_suberror! {
    /// `NoChannel`
    #[into(SetHwTimerError)]
    pub(crate) enum NoChannelError {
        NoChannel,
    }
}

define_suberror! {
    /// `QueueOverflow`
    #[into(CreateTaskError)]
    #[into(RequestVtimerError)]
    #[into(VtimerSleepError)]
    pub(crate) enum QueueOverflowError {
        QueueOverflow,
    }
}

define_suberror! {
    /// `NotFound`
    #[into(CancelVtimerError)]
    pub(crate) enum NotFoundError {
        NotFound,
    }
}

define_suberror! {
    /// Errors reported by [`crate::task::wakeup_locked`].
    #[into(WakeupError)]
    pub(crate) enum WakeupLockedError {
        BadId,
        BadObjectState,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_are_negative() {
        assert!(ResultCode::Success.is_ok());
        for code in [
            ResultCode::BadParam,
            ResultCode::BadId,
            ResultCode::BadContext,
            ResultCode::BadObjectState,
            ResultCode::NotFound,
            ResultCode::QueueOverflow,
            ResultCode::NoChannel,
        ] {
            assert!(code.is_err(), "{code:?}");
        }
    }

    #[test]
    fn suberror_conversion() {
        assert_eq!(
            SetHwTimerError::from(NoChannelError::NoChannel),
            SetHwTimerError::NoChannel
        );
        assert_eq!(
            ResultCode::from(WakeupError::from(WakeupLockedError::BadObjectState)),
            ResultCode::BadObjectState
        );
        assert_eq!(format!("{:?}", CancelVtimerError::NotFound), "NotFound");
    }
}
