#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use ember_kernel::{KernelTraits, Pid, PortToKernel, System, TaskAttr, TimerTarget, UTicks};
use spin::Mutex as SpinMutex;
use std::{
    convert::Infallible,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate ember_kernel;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelTraits + PortToKernel {
    fn port_state() -> &'static State;
}

/// The execution context the simulated processor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Before [`Sim::start`]. Neither a task nor an interrupt context.
    Boot,
    Task,
    Interrupt,
}

/// Something observable that happened in the simulated hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The dispatcher ran and selected `pid`.
    Dispatch { pid: Option<Pid> },
    ChannelArmed { channel: usize, at: UTicks },
    ChannelDisarmed { channel: usize },
    ChannelFired { channel: usize, at: UTicks },
    TaskInitialized { pid: Pid },
    TaskExited { pid: Pid },
}

/// The panic payload used to unwind the stack of an exiting task.
#[derive(Debug)]
struct TaskExit {
    pid: Pid,
}

/// The state of an armed compare channel.
#[derive(Debug, Clone, Copy)]
struct Armed {
    at: UTicks,
    /// The counter value when the channel was armed.
    armed_at: UTicks,
}

impl Armed {
    /// Get the number of ticks until the deadline as seen at `counter`.
    /// Returns zero if the deadline has passed.
    fn remaining(&self, counter: UTicks) -> UTicks {
        let delay = self.at.wrapping_sub(self.armed_at);
        let elapsed = counter.wrapping_sub(self.armed_at);
        delay.saturating_sub(elapsed)
    }
}

#[derive(Debug, Clone, Copy)]
struct TaskEntry {
    entry_point: fn(usize),
    param: usize,
}

/// The simulated hardware.
#[derive(Debug)]
struct Hw {
    role: Role,
    counter: UTicks,
    /// The number of consecutive counter reads with no other port activity
    /// in between.
    polls: u32,
    /// Added to the counter after every read.
    auto_advance: UTicks,
    channels: Vec<Option<Armed>>,
    tasks: Vec<Option<TaskEntry>>,
    events: Vec<Event>,
}

impl Hw {
    fn touch(&mut self) {
        self.polls = 0;
    }
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    cpu_lock: AtomicBool,
    hw: SpinMutex<Hw>,
}

impl State {
    pub const MAX_TICK_COUNT: UTicks = UTicks::MAX;
    pub const SPIN_BARRIER: UTicks = 20;

    /// Once this many reads happen in a row, every further read advances the
    /// counter by one tick. This lets busy-wait loops make progress while
    /// keeping ordinary operations free of time drift.
    const SPIN_CREEP_POLLS: u32 = 64;

    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            hw: SpinMutex::new(Hw {
                role: Role::Boot,
                counter: 0,
                polls: 0,
                auto_advance: 0,
                channels: Vec::new(),
                tasks: Vec::new(),
                events: Vec::new(),
            }),
        }
    }

    fn push_event(&self, event: Event) {
        log::trace!("{event:?}");
        self.hw.lock().events.push(event);
    }

    /// Choose the next task and record the outcome.
    fn dispatch<Traits: PortInstance>(&self) {
        // Safety: CPU Lock inactive, we are the port
        unsafe {
            self.enter_cpu_lock();
            <Traits as PortToKernel>::choose_running_task();
            self.leave_cpu_lock();
        }
        self.record_dispatch::<Traits>();
    }

    fn record_dispatch<Traits: PortInstance>(&self) {
        let pid = System::<Traits>::active_task().ok().flatten();
        self.push_event(Event::Dispatch { pid });
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&self) {
        assert!(!self.is_cpu_lock_active());
        self.dispatch::<Traits>();
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(&self, pid: Pid) -> ! {
        assert!(self.is_cpu_lock_active());
        self.push_event(Event::TaskExited { pid });

        // Safety: CPU Lock active, we are the port
        unsafe {
            <Traits as PortToKernel>::choose_running_task();
            self.leave_cpu_lock();
        }
        self.record_dispatch::<Traits>();

        // Discard the task's "stack"
        panic::resume_unwind(Box::new(TaskExit { pid }))
    }

    pub unsafe fn enter_cpu_lock(&self) {
        let was_active = self.cpu_lock.swap(true, Ordering::Relaxed);
        assert!(!was_active, "CPU Lock is already active");
        self.hw.lock().touch();
        log::trace!("enter_cpu_lock");
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let was_active = self.cpu_lock.swap(false, Ordering::Relaxed);
        assert!(was_active, "CPU Lock is already inactive");
        self.hw.lock().touch();
        log::trace!("leave_cpu_lock");
    }

    pub unsafe fn initialize_task_state(&self, pid: Pid, attr: &TaskAttr) {
        {
            let mut hw = self.hw.lock();
            hw.touch();
            if hw.tasks.len() <= pid {
                hw.tasks.resize(pid + 1, None);
            }
            hw.tasks[pid] = Some(TaskEntry {
                entry_point: attr.entry_point,
                param: attr.entry_param,
            });
        }
        self.push_event(Event::TaskInitialized { pid });
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    pub fn is_task_context(&self) -> bool {
        self.hw.lock().role == Role::Task
    }

    pub fn is_interrupt_context(&self) -> bool {
        self.hw.lock().role == Role::Interrupt
    }

    pub unsafe fn tick_count(&self) -> UTicks {
        let mut hw = self.hw.lock();
        hw.polls = hw.polls.saturating_add(1);
        if hw.polls > Self::SPIN_CREEP_POLLS {
            hw.counter = hw.counter.wrapping_add(1);
        }
        let now = hw.counter;
        hw.counter = hw.counter.wrapping_add(hw.auto_advance);
        now
    }

    pub unsafe fn arm_channel(&self, channel: usize, target: TimerTarget) {
        let mut hw = self.hw.lock();
        hw.touch();
        assert!(
            hw.channels[channel].is_none(),
            "channel {channel} is already armed"
        );

        let now = hw.counter;
        let at = match target {
            TimerTarget::Relative(delay) => now.wrapping_add(delay),
            TimerTarget::Absolute(at) => at,
        };
        let armed = match target {
            // Treat targets more than half the counter range away as past
            TimerTarget::Absolute(at) if at.wrapping_sub(now) > UTicks::MAX / 2 => Armed {
                at: now,
                armed_at: now,
            },
            _ => Armed { at, armed_at: now },
        };
        hw.channels[channel] = Some(armed);
        drop(hw);

        self.push_event(Event::ChannelArmed { channel, at });
    }

    pub unsafe fn disarm_channel(&self, channel: usize) {
        {
            let mut hw = self.hw.lock();
            hw.touch();
            hw.channels[channel] = None;
        }
        self.push_event(Event::ChannelDisarmed { channel });
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The test driver interface of the simulator.
///
/// The simulator runs on the calling thread. Nothing happens unless one of
/// these functions is called: the counter only moves in
/// [`advance_time`](Self::advance_time) (and during busy-waits), and
/// task bodies only run in [`run_task`](Self::run_task).
pub struct Sim<Traits>(PhantomData<Traits>);

impl<Traits: PortInstance> Sim<Traits> {
    fn state() -> &'static State {
        Traits::port_state()
    }

    /// Boot the kernel. After this, tasks can be created in the boot context.
    pub fn boot() {
        let _ = env_logger::builder().is_test(true).try_init();

        let state = Self::state();
        {
            let mut hw = state.hw.lock();
            assert_eq!(hw.role, Role::Boot);
            hw.channels = vec![None; <Traits as ember_kernel::PortTimer>::NUM_CHANNELS];
        }

        // Safety: CPU Lock inactive, we are the port
        unsafe {
            state.enter_cpu_lock();
            <Traits as PortToKernel>::boot();
            state.leave_cpu_lock();
        }
        log::debug!("booted");
    }

    /// Leave the boot context and dispatch the first task.
    pub fn start() {
        let state = Self::state();
        {
            let mut hw = state.hw.lock();
            assert_eq!(hw.role, Role::Boot);
            hw.role = Role::Task;
        }
        state.dispatch::<Traits>();
    }

    /// Advance the counter by `ticks`, firing due channels in the order of
    /// their deadlines. Channels with the same deadline fire in the order of
    /// their indices.
    pub fn advance_time(ticks: UTicks) {
        let state = Self::state();
        let mut left = ticks;
        loop {
            let fired = {
                let mut hw = state.hw.lock();
                hw.touch();
                let counter = hw.counter;
                let next = (hw.channels.iter().enumerate())
                    .filter_map(|(i, armed)| armed.map(|armed| (armed.remaining(counter), i)))
                    .min();
                match next {
                    Some((remaining, channel)) if remaining <= left => {
                        hw.counter = counter.wrapping_add(remaining);
                        hw.channels[channel] = None;
                        left -= remaining;
                        Some((channel, hw.counter))
                    }
                    _ => {
                        hw.counter = counter.wrapping_add(left);
                        None
                    }
                }
            };

            let Some((channel, at)) = fired else { break };
            state.push_event(Event::ChannelFired { channel, at });

            // Safety: We are the port
            Self::in_interrupt(|| unsafe { <Traits as PortToKernel>::timer_channel_fired(channel) });
        }
    }

    /// Run `f` in an interrupt context. On return, dispatch a task if the
    /// kernel asked for it and the interrupt preempted a task.
    pub fn in_interrupt<R>(f: impl FnOnce() -> R) -> R {
        let state = Self::state();
        assert!(!state.is_cpu_lock_active());
        let prev_role = std::mem::replace(&mut state.hw.lock().role, Role::Interrupt);

        let output = f();

        state.hw.lock().role = prev_role;
        if prev_role == Role::Task && <Traits as PortToKernel>::is_context_switch_requested() {
            state.dispatch::<Traits>();
        }
        output
    }

    /// Run the entry point of the running task until it returns or exits.
    /// A task returning from its entry point exits.
    ///
    /// Returns the pid of the task that ran, or `None` if no task is running.
    pub fn run_task() -> Option<Pid> {
        let state = Self::state();
        let pid = System::<Traits>::active_task().ok().flatten()?;
        let entry = state.hw.lock().tasks.get(pid).copied().flatten()?;

        let result = Self::catch_task_exit(|| -> Infallible {
            (entry.entry_point)(entry.param);
            // Safety: Nothing on the "stack" needs dropping
            match unsafe { System::<Traits>::exit_task() } {
                Ok(never) => match never {},
                Err(e) => panic!("task {pid} failed to exit: {e:?}"),
            }
        });
        match result {
            Ok(never) => match never {},
            Err(exited) => assert_eq!(exited, pid),
        }
        Some(pid)
    }

    /// Call `f` as the body of the running task. Returns `Err(pid)` if the
    /// task exits inside `f`.
    pub fn catch_task_exit<R>(f: impl FnOnce() -> R) -> Result<R, Pid> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(output) => Ok(output),
            Err(payload) => match payload.downcast::<TaskExit>() {
                Ok(exit) => Err(exit.pid),
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }

    /// Get the counter value without counting it as a read.
    pub fn now() -> UTicks {
        Self::state().hw.lock().counter
    }

    pub fn set_auto_advance(ticks: UTicks) {
        Self::state().hw.lock().auto_advance = ticks;
    }

    pub fn role() -> Role {
        Self::state().hw.lock().role
    }

    /// Take the events recorded so far.
    pub fn take_events() -> Vec<Event> {
        std::mem::take(&mut Self::state().hw.lock().events)
    }

    /// Get the indices of the armed channels.
    pub fn armed_channels() -> Vec<usize> {
        (Self::state().hw.lock().channels.iter().enumerate())
            .filter(|(_, armed)| armed.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Instantiate the port.
///
/// The type must also be given to [`ember_kernel::build!`].
///
/// ```rust,ignore
/// ember_port_sim::use_port!(unsafe struct SystemTraits, num_channels = 4);
/// ember_kernel::build!(
///     SystemTraits,
///     num_tasks = 4,
///     num_priority_levels = 4,
///     num_vtimers = 8,
///     epoch_ticks = 1000,
/// );
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident, num_channels = $num_channels:expr $(,)?) => {
        $vis struct $SystemTraits;

        mod port_sim_impl {
            use super::$SystemTraits;
            use $crate::ember_kernel::{Pid, PortThreading, PortTimer, TaskAttr, TimerTarget, UTicks};
            use $crate::{PortInstance, State};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelTraits`
            unsafe impl PortThreading for $SystemTraits {
                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(pid: Pid) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(pid) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn initialize_task_state(pid: Pid, attr: &TaskAttr) {
                    unsafe { PORT_STATE.initialize_task_state(pid, attr) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                const NUM_CHANNELS: usize = $num_channels;
                const MAX_TICK_COUNT: UTicks = State::MAX_TICK_COUNT;
                const SPIN_BARRIER: UTicks = State::SPIN_BARRIER;

                unsafe fn tick_count() -> UTicks {
                    unsafe { PORT_STATE.tick_count() }
                }

                unsafe fn arm_channel(channel: usize, target: TimerTarget) {
                    unsafe { PORT_STATE.arm_channel(channel, target) }
                }

                unsafe fn disarm_channel(channel: usize) {
                    unsafe { PORT_STATE.disarm_channel(channel) }
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn remaining_counts_down() {
        let armed = Armed {
            at: 150,
            armed_at: 100,
        };
        assert_eq!(armed.remaining(100), 50);
        assert_eq!(armed.remaining(149), 1);
        assert_eq!(armed.remaining(150), 0);
        assert_eq!(armed.remaining(400), 0);
    }

    #[quickcheck]
    fn remaining_across_wraparound(armed_at: u32, delay: u16, elapsed: u16) -> bool {
        let armed = Armed {
            at: armed_at.wrapping_add(delay.into()),
            armed_at,
        };
        let remaining = armed.remaining(armed_at.wrapping_add(elapsed.into()));
        remaining == u32::from(delay).saturating_sub(elapsed.into())
    }
}
