//! Shared by the integration tests.
#![allow(dead_code)]

/// The priority of the idle task. Every scenario creates one so that the
/// dispatcher always has something to run.
pub const IDLE_PRIORITY: usize = 7;

pub fn idle(_: usize) {}

/// Instantiate the simulator port and a kernel in the current module. Defines
/// the `System` and `Sim` type aliases.
macro_rules! system {
    (
        num_channels = $num_channels:expr,
        num_tasks = $num_tasks:expr,
        num_vtimers = $num_vtimers:expr,
        epoch_ticks = $epoch_ticks:expr $(,)?
    ) => {
        ember_port_sim::use_port!(unsafe struct SystemTraits, num_channels = $num_channels);
        ember_kernel::build!(
            SystemTraits,
            num_tasks = $num_tasks,
            num_priority_levels = 8,
            num_vtimers = $num_vtimers,
            epoch_ticks = $epoch_ticks,
        );

        #[allow(dead_code)]
        type System = ember_kernel::System<SystemTraits>;
        #[allow(dead_code)]
        type Sim = ember_port_sim::Sim<SystemTraits>;

        /// Boot, create the idle task, and run `setup` in the boot context.
        /// Dispatches the first task afterwards.
        #[allow(dead_code)]
        fn boot_with(setup: impl FnOnce()) -> ember_kernel::Pid {
            Sim::boot();
            let idle = System::create_task(ember_kernel::TaskAttr::new(
                "idle",
                crate::common::idle,
                crate::common::IDLE_PRIORITY,
            ))
            .unwrap();
            setup();
            Sim::start();
            idle
        }
    };
}
