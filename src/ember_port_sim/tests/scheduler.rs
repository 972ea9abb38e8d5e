//! Scheduling scenarios on the simulator
#[macro_use]
mod common;

use ember_kernel::{CreateFlags, CreateTaskError, TaskAttr, TaskSt};
use ember_port_sim::Event;

fn nop(_: usize) {}

fn dispatched(events: &[Event]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Dispatch { pid } => *pid,
            _ => None,
        })
        .collect()
}

mod most_urgent_first {
    use super::*;
    system!(num_channels = 2, num_tasks = 4, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        let mut low = 0;
        let mut high = 0;
        let idle = boot_with(|| {
            low = System::create_task(TaskAttr::new("low", nop, 5)).unwrap();
            high = System::create_task(TaskAttr::new("high", nop, 1)).unwrap();
        });

        assert_eq!(System::active_task(), Ok(Some(high)));
        assert_eq!(System::task_status(high), Ok(TaskSt::Running));
        assert_eq!(System::task_status(low), Ok(TaskSt::Pending));
        assert_eq!(System::task_status(idle), Ok(TaskSt::Pending));
        assert_eq!(System::num_tasks(), Ok(3));
        assert_eq!(System::num_runnable_tasks(), Ok(3));
        assert_eq!(System::run_queues_consistent(), Ok(true));

        // `high` stays on its run-queue, so yielding picks it again
        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(high)));

        System::set_task_status(high, TaskSt::Sleeping).unwrap();
        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(low)));
        assert_eq!(System::num_runnable_tasks(), Ok(2));
        assert_eq!(System::run_queues_consistent(), Ok(true));
    }
}

mod round_robin {
    use super::*;
    system!(num_channels = 2, num_tasks = 4, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        let mut pids = Vec::new();
        boot_with(|| {
            for name in ["a", "b", "c"] {
                pids.push(System::create_task(TaskAttr::new(name, nop, 3)).unwrap());
            }
        });

        Sim::take_events();
        for _ in 0..5 {
            System::yield_now().unwrap();
        }

        let (a, b, c) = (pids[0], pids[1], pids[2]);
        assert_eq!(dispatched(&Sim::take_events()), [b, c, a, b, c]);
    }
}

mod switch_rule {
    use super::*;
    use ember_kernel::SchedSwitchError;
    system!(num_channels = 2, num_tasks = 4, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        let mut a = 0;
        let mut b = 0;
        boot_with(|| {
            a = System::create_task(TaskAttr::new("a", nop, 2)).unwrap();
            b = System::create_task(TaskAttr::new("b", nop, 2)).unwrap();

            // Neither a task nor an interrupt context
            assert_eq!(
                System::sched_switch(2, 2, false),
                Err(SchedSwitchError::BadContext)
            );
        });
        assert_eq!(System::active_task(), Ok(Some(a)));
        Sim::take_events();

        // `current > other` never switches
        System::sched_switch(3, 2, false).unwrap();
        assert!(dispatched(&Sim::take_events()).is_empty());

        // Equality switches immediately in a task context
        System::sched_switch(2, 2, false).unwrap();
        assert_eq!(dispatched(&Sim::take_events()), [b]);

        // In an interrupt handler, the switch happens on exit
        Sim::in_interrupt(|| {
            System::sched_switch(2, 3, true).unwrap();
            assert!(dispatched(&Sim::take_events()).is_empty());
        });
        assert_eq!(dispatched(&Sim::take_events()), [a]);
        assert_eq!(System::active_task(), Ok(Some(a)));
    }
}

mod wakeup {
    use super::*;
    use ember_kernel::WakeupError;
    system!(num_channels = 2, num_tasks = 4, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        let mut high = 0;
        let mut low = 0;
        boot_with(|| {
            high = System::create_task(TaskAttr::new("high", nop, 1)).unwrap();
            low = System::create_task(
                TaskAttr::new("low", nop, 4).flags(CreateFlags::SLEEPING),
            )
            .unwrap();
        });
        assert_eq!(System::task_status(low), Ok(TaskSt::Sleeping));
        assert_eq!(System::num_runnable_tasks(), Ok(2));
        Sim::take_events();

        // 1 <= 4, so the wake-up goes through the dispatcher, which keeps
        // the more urgent task running
        System::wakeup(low).unwrap();
        assert_eq!(System::task_status(low), Ok(TaskSt::Pending));
        assert_eq!(dispatched(&Sim::take_events()), [high]);

        assert_eq!(System::wakeup(low), Err(WakeupError::BadObjectState));
        assert_eq!(System::wakeup(42), Err(WakeupError::BadId));

        System::sleep().unwrap();
        assert_eq!(System::task_status(high), Ok(TaskSt::Sleeping));
        assert_eq!(System::active_task(), Ok(Some(low)));
        Sim::take_events();

        // 4 <= 1 doesn't hold, so `high` waits for the next dispatch
        System::wakeup(high).unwrap();
        assert!(dispatched(&Sim::take_events()).is_empty());
        assert_eq!(System::active_task(), Ok(Some(low)));
        assert_eq!(System::task_status(high), Ok(TaskSt::Pending));

        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(high)));
        assert_eq!(System::task_status(low), Ok(TaskSt::Pending));
        assert_eq!(System::run_queues_consistent(), Ok(true));
    }
}

mod exit_and_reuse {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    system!(num_channels = 2, num_tasks = 3, num_vtimers = 4, epoch_ticks = 100_000);

    static RAN: AtomicUsize = AtomicUsize::new(0);

    fn worker(param: usize) {
        RAN.store(param, Ordering::Relaxed);
    }

    fn early_exit(_: usize) {
        // Safety: Nothing on the stack needs dropping
        match unsafe { System::exit_task() } {
            Ok(never) => match never {},
            Err(e) => panic!("{e:?}"),
        }
    }

    #[test]
    fn test() {
        let mut w = 0;
        let idle = boot_with(|| {
            w = System::create_task(TaskAttr::new("worker", worker, 2).param(7)).unwrap();
        });
        assert_eq!(System::num_tasks(), Ok(2));

        assert_eq!(Sim::run_task(), Some(w));
        assert_eq!(RAN.load(Ordering::Relaxed), 7);
        assert!(Sim::take_events().contains(&Event::TaskExited { pid: w }));

        assert_eq!(System::active_task(), Ok(Some(idle)));
        assert_eq!(System::num_tasks(), Ok(1));
        assert_eq!(System::num_runnable_tasks(), Ok(1));
        assert!(System::task_status(w).is_err());

        // The freed control block is the first free one, so the pid is
        // reused. 7 <= 2 doesn't hold, so the new task waits for the next
        // dispatch.
        let w2 = System::create_task(TaskAttr::new("early", early_exit, 2)).unwrap();
        assert_eq!(w2, w);
        assert_eq!(System::active_task(), Ok(Some(idle)));
        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(w2)));

        assert_eq!(Sim::catch_task_exit(|| early_exit(0)), Err(w2));
        assert_eq!(System::active_task(), Ok(Some(idle)));
        assert_eq!(System::run_queues_consistent(), Ok(true));
    }
}

mod create_errors {
    use super::*;
    system!(num_channels = 2, num_tasks = 3, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        boot_with(|| {
            assert_eq!(
                System::create_task(TaskAttr::new("bad", nop, 8)),
                Err(CreateTaskError::BadParam)
            );
            System::create_task(TaskAttr::new("a", nop, 3)).unwrap();
            System::create_task(TaskAttr::new("b", nop, 3)).unwrap();
            assert_eq!(
                System::create_task(TaskAttr::new("c", nop, 3)),
                Err(CreateTaskError::QueueOverflow)
            );
        });
        assert_eq!(System::num_tasks(), Ok(3));
    }
}

mod blocked_states {
    use super::*;
    system!(num_channels = 2, num_tasks = 4, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        let mut a = 0;
        let mut b = 0;
        boot_with(|| {
            a = System::create_task(TaskAttr::new("a", nop, 3)).unwrap();
            b = System::create_task(TaskAttr::new("b", nop, 3)).unwrap();
        });
        assert_eq!(System::active_task(), Ok(Some(a)));

        System::set_task_status(b, TaskSt::ReceiveBlocked).unwrap();
        assert_eq!(System::num_runnable_tasks(), Ok(2));
        assert_eq!(System::run_queues_consistent(), Ok(true));

        System::set_task_status(b, TaskSt::Pending).unwrap();
        assert_eq!(System::num_runnable_tasks(), Ok(3));

        // Blocking the active task doesn't switch by itself
        System::set_task_status(a, TaskSt::MutexBlocked).unwrap();
        assert_eq!(System::active_task(), Ok(Some(a)));
        assert_eq!(System::num_runnable_tasks(), Ok(2));

        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(b)));
        assert_eq!(System::task_status(a), Ok(TaskSt::MutexBlocked));

        assert!(System::set_task_status(9, TaskSt::Pending).is_err());
    }
}

mod stack_check {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    system!(num_channels = 2, num_tasks = 3, num_vtimers = 4, epoch_ticks = 100_000);

    static STACK: [AtomicUsize; 16] = [const { AtomicUsize::new(0) }; 16];

    #[test]
    fn test() {
        let mut t = 0;
        let idle = boot_with(|| {
            t = System::create_task(
                TaskAttr::new("t", nop, 2)
                    .stack(&STACK)
                    .flags(CreateFlags::STACKTEST),
            )
            .unwrap();
        });
        assert_eq!(System::task_stack_free(t), Ok(Some(16)));
        assert_eq!(System::task_stack_free(idle), Ok(None));

        // Grow the "stack" down to word 5
        for word in &STACK[5..] {
            word.store(0x5a5a, Ordering::Relaxed);
        }
        assert_eq!(System::task_stack_free(t), Ok(Some(5)));

        // Overflow. The dispatcher logs it and carries on.
        STACK[0].store(0, Ordering::Relaxed);
        assert_eq!(System::task_stack_free(t), Ok(Some(0)));
        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(t)));
    }
}

mod running_only_for_active {
    use super::*;
    use ember_kernel::SetTaskStatusError;
    system!(num_channels = 2, num_tasks = 4, num_vtimers = 4, epoch_ticks = 100_000);

    #[test]
    fn test() {
        let mut a = 0;
        let mut b = 0;
        let idle = boot_with(|| {
            a = System::create_task(TaskAttr::new("a", nop, 3)).unwrap();
            b = System::create_task(TaskAttr::new("b", nop, 3)).unwrap();
        });
        assert_eq!(System::active_task(), Ok(Some(a)));

        assert_eq!(
            System::set_task_status(b, TaskSt::Running),
            Err(SetTaskStatusError::BadParam)
        );
        assert_eq!(
            System::set_task_status(idle, TaskSt::Running),
            Err(SetTaskStatusError::BadParam)
        );
        assert_eq!(System::task_status(b), Ok(TaskSt::Pending));

        // A sleeping task can't be made `Running` either
        System::set_task_status(b, TaskSt::Sleeping).unwrap();
        assert_eq!(
            System::set_task_status(b, TaskSt::Running),
            Err(SetTaskStatusError::BadParam)
        );
        assert_eq!(System::task_status(b), Ok(TaskSt::Sleeping));
        assert_eq!(System::num_runnable_tasks(), Ok(2));

        // The active task may restate its own status
        System::set_task_status(a, TaskSt::Running).unwrap();
        assert_eq!(System::task_status(a), Ok(TaskSt::Running));
        assert_eq!(System::run_queues_consistent(), Ok(true));
    }
}

/// Random status changes, each followed by a yield, never break the
/// run-queues or let a less urgent task run ahead of a `Pending` one.
mod random_status_changes {
    use super::*;
    use ember_kernel::{Pid, SetTaskStatusError};
    use quickcheck::QuickCheck;
    use std::sync::Mutex;

    system!(num_channels = 2, num_tasks = 6, num_vtimers = 4, epoch_ticks = 100_000);

    /// Every live task. The idle task comes first and is never touched.
    static PIDS: Mutex<Vec<Pid>> = Mutex::new(Vec::new());

    const STATES: [TaskSt; 7] = [
        TaskSt::Sleeping,
        TaskSt::MutexBlocked,
        TaskSt::ReceiveBlocked,
        TaskSt::SendBlocked,
        TaskSt::ReplyBlocked,
        TaskSt::Running,
        TaskSt::Pending,
    ];

    /// Each byte pair is one step: the task to change and its new status.
    fn run(program: Vec<(u8, u8)>) -> bool {
        let pids = PIDS.lock().unwrap().clone();
        let workers = &pids[1..];
        Sim::take_events();

        for (who, what) in program {
            let pid = workers[usize::from(who) % workers.len()];
            let new_st = STATES[usize::from(what) % STATES.len()];

            let was_active = System::active_task() == Ok(Some(pid));
            let result = System::set_task_status(pid, new_st);
            if new_st == TaskSt::Running && !was_active {
                assert_eq!(result, Err(SetTaskStatusError::BadParam));
            } else {
                assert_eq!(result, Ok(()));
            }
            System::yield_now().unwrap();

            assert_eq!(System::run_queues_consistent(), Ok(true));
            let active = System::active_task().unwrap().unwrap();
            assert_eq!(System::task_status(active), Ok(TaskSt::Running));
            let active_priority = System::task_priority(active).unwrap();

            for &other in &pids {
                if System::task_status(other) == Ok(TaskSt::Pending) {
                    let priority = System::task_priority(other).unwrap();
                    assert!(
                        active_priority <= priority,
                        "task {active} (priority {active_priority}) runs ahead of \
                         task {other} (priority {priority})"
                    );
                }
            }
        }
        true
    }

    #[test]
    fn test() {
        let mut workers = Vec::new();
        let idle = boot_with(|| {
            for (name, priority) in [("w1", 1), ("w2", 2), ("w3", 2), ("w4", 4), ("w5", 6)] {
                workers.push(System::create_task(TaskAttr::new(name, nop, priority)).unwrap());
            }
        });
        *PIDS.lock().unwrap() = std::iter::once(idle).chain(workers).collect();

        QuickCheck::new()
            .tests(200)
            .quickcheck(run as fn(Vec<(u8, u8)>) -> bool);
    }
}
