//! Virtual timer scenarios on the simulator
//!
//! Every system here uses 1000-tick epochs.
#[macro_use]
mod common;

use ember_kernel::{CancelVtimerError, EpochTime, RequestVtimerError, TaskAttr, TaskSt, UTicks};
use std::sync::Mutex;

fn nop(_: usize) {}

/// Requests made back to back, in any order of offsets, fire sorted by
/// deadline. Equal deadlines keep the request order.
mod deadline_order {
    use super::*;
    use quickcheck::QuickCheck;

    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static FIRED: Mutex<Vec<(usize, UTicks)>> = Mutex::new(Vec::new());

    fn record(param: usize) {
        FIRED.lock().unwrap().push((param, Sim::now()));
    }

    /// Offsets span a few epochs and stay above the spin barrier.
    fn fires_sorted(offsets: Vec<u16>) -> bool {
        let offsets: Vec<UTicks> = offsets
            .into_iter()
            .take(8)
            .map(|x| 20 + UTicks::from(x) % 2500)
            .collect();

        FIRED.lock().unwrap().clear();
        Sim::advance_time(0);
        let start = Sim::now();
        for (param, &offset) in offsets.iter().enumerate() {
            System::vtimer_request(offset, record, param).unwrap();
        }
        Sim::advance_time(3000);

        let mut expected: Vec<usize> = (0..offsets.len()).collect();
        expected.sort_by_key(|&param| offsets[param]);

        let fired = FIRED.lock().unwrap().clone();
        let order: Vec<usize> = fired.iter().map(|&(param, _)| param).collect();
        assert_eq!(order, expected, "offsets {offsets:?}");
        for &(param, at) in &fired {
            assert!(at - start >= offsets[param], "{param} fired early at {at}");
        }
        true
    }

    #[test]
    fn test() {
        boot_with(|| {});
        QuickCheck::new()
            .tests(100)
            .quickcheck(fires_sorted as fn(Vec<u16>) -> bool);
        assert_eq!(Sim::armed_channels(), [0]);
        assert_eq!(System::hw_timer_sleep_block_count(), 1);
    }
}

mod fixed_offsets {
    use super::*;
    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static FIRED: Mutex<Vec<(usize, UTicks)>> = Mutex::new(Vec::new());

    fn record(param: usize) {
        FIRED.lock().unwrap().push((param, Sim::now()));
    }

    #[test]
    fn test() {
        boot_with(|| {});
        System::vtimer_request(300, record, 1).unwrap();
        System::vtimer_request(100, record, 2).unwrap();
        System::vtimer_request(200, record, 3).unwrap();

        // One channel backs the earliest request
        assert_eq!(Sim::armed_channels(), [0]);
        assert_eq!(System::hw_timer_sleep_block_count(), 1);

        Sim::advance_time(999);
        assert_eq!(*FIRED.lock().unwrap(), [(2, 100), (3, 200), (1, 300)]);
        assert_eq!(System::vtimer_now(), Ok(EpochTime { epoch: 0, sub: 999 }));

        // The tick starts the next epoch
        Sim::advance_time(235);
        assert_eq!(System::vtimer_now(), Ok(EpochTime { epoch: 1, sub: 234 }));
        assert_eq!(Sim::armed_channels(), [0]);
    }
}

mod same_deadline {
    use super::*;
    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(param: usize) {
        FIRED.lock().unwrap().push(param);
    }

    #[test]
    fn test() {
        boot_with(|| {});
        for param in [1, 2, 3] {
            System::vtimer_request(200, record, param).unwrap();
        }
        Sim::advance_time(199);
        assert!(FIRED.lock().unwrap().is_empty());
        Sim::advance_time(1);
        assert_eq!(*FIRED.lock().unwrap(), [1, 2, 3]);
    }
}

mod epoch_rollover {
    use super::*;
    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static FIRED: Mutex<Vec<(usize, EpochTime)>> = Mutex::new(Vec::new());

    fn record(param: usize) {
        let now = System::vtimer_now().unwrap();
        FIRED.lock().unwrap().push((param, now));
    }

    #[test]
    fn test() {
        boot_with(|| {});
        Sim::take_events();
        System::vtimer_request(1500, record, 1).unwrap();
        System::vtimer_request(1000, record, 2).unwrap();
        System::vtimer_request(2100, record, 3).unwrap();

        // Requests in later epochs don't touch the channel
        assert_eq!(
            Sim::take_events()
                .iter()
                .filter(|e| matches!(e, ember_port_sim::Event::ChannelArmed { .. }))
                .count(),
            0
        );

        Sim::advance_time(999);
        assert!(FIRED.lock().unwrap().is_empty());

        // The request due at the epoch boundary runs after the tick
        Sim::advance_time(1);
        assert_eq!(
            *FIRED.lock().unwrap(),
            [(2, EpochTime { epoch: 1, sub: 0 })]
        );

        Sim::advance_time(2000);
        assert_eq!(
            *FIRED.lock().unwrap(),
            [
                (2, EpochTime { epoch: 1, sub: 0 }),
                (1, EpochTime { epoch: 1, sub: 500 }),
                (3, EpochTime { epoch: 2, sub: 100 }),
            ]
        );
        assert_eq!(System::vtimer_now(), Ok(EpochTime { epoch: 3, sub: 0 }));
    }
}

mod cancel {
    use super::*;
    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static FIRED: Mutex<Vec<(usize, UTicks)>> = Mutex::new(Vec::new());

    fn record(param: usize) {
        FIRED.lock().unwrap().push((param, Sim::now()));
    }

    #[test]
    fn test() {
        boot_with(|| {});
        let first = System::vtimer_request(100, record, 1).unwrap();
        let second = System::vtimer_request(200, record, 2).unwrap();
        let later = System::vtimer_request(2500, record, 3).unwrap();

        System::vtimer_cancel(first).unwrap();
        assert_eq!(
            System::vtimer_cancel(first),
            Err(CancelVtimerError::NotFound)
        );
        System::vtimer_cancel(later).unwrap();

        Sim::advance_time(300);
        assert_eq!(*FIRED.lock().unwrap(), [(2, 200)]);
        assert_eq!(
            System::vtimer_cancel(second),
            Err(CancelVtimerError::NotFound)
        );

        // The new request reuses the first slot. The old handle stays stale.
        let reused = System::vtimer_request(50, record, 4).unwrap();
        assert_eq!(
            System::vtimer_cancel(first),
            Err(CancelVtimerError::NotFound)
        );
        assert_ne!(reused, first);

        Sim::advance_time(3000);
        assert_eq!(*FIRED.lock().unwrap(), [(2, 200), (4, 350)]);
    }
}

mod pool_overflow {
    use super::*;
    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    #[test]
    fn test() {
        boot_with(|| {});
        let handles: Vec<_> = (0..8)
            .map(|i| System::vtimer_request(100 + i * 100, nop, 0).unwrap())
            .collect();
        assert_eq!(
            System::vtimer_request(100, nop, 0),
            Err(RequestVtimerError::QueueOverflow)
        );

        System::vtimer_cancel(handles[3]).unwrap();
        System::vtimer_request(100, nop, 0).unwrap();
    }
}

mod timed_sleep {
    use super::*;
    system!(num_channels = 2, num_tasks = 3, num_vtimers = 8, epoch_ticks = 1000);

    #[test]
    fn test() {
        let mut t = 0;
        let idle = boot_with(|| {
            t = System::create_task(TaskAttr::new("t", nop, 2)).unwrap();
        });
        assert_eq!(System::active_task(), Ok(Some(t)));

        // Acting as `t`
        System::vtimer_sleep(300).unwrap();
        assert_eq!(System::task_status(t), Ok(TaskSt::Sleeping));
        assert_eq!(System::active_task(), Ok(Some(idle)));

        Sim::advance_time(299);
        assert_eq!(System::task_status(t), Ok(TaskSt::Sleeping));

        // 7 <= 2 doesn't hold, so the idle task keeps running until it
        // yields
        Sim::advance_time(1);
        assert_eq!(System::task_status(t), Ok(TaskSt::Pending));
        assert_eq!(System::active_task(), Ok(Some(idle)));

        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(t)));
    }
}

mod short_sleep {
    use super::*;
    system!(num_channels = 2, num_tasks = 3, num_vtimers = 8, epoch_ticks = 1000);

    #[test]
    fn test() {
        let mut t = 0;
        boot_with(|| {
            t = System::create_task(TaskAttr::new("t", nop, 2)).unwrap();
        });

        let start = Sim::now();
        System::vtimer_sleep(5).unwrap();
        assert!(Sim::now() - start >= 5);
        assert_eq!(System::active_task(), Ok(Some(t)));
        assert_eq!(System::task_status(t), Ok(TaskSt::Running));
    }
}

mod timed_wakeup {
    use super::*;
    system!(num_channels = 2, num_tasks = 3, num_vtimers = 8, epoch_ticks = 1000);

    #[test]
    fn test() {
        let mut s = 0;
        let idle = boot_with(|| {
            s = System::create_task(
                TaskAttr::new("s", nop, 3).flags(ember_kernel::CreateFlags::SLEEPING),
            )
            .unwrap();
        });
        assert_eq!(System::active_task(), Ok(Some(idle)));

        assert_eq!(
            System::vtimer_set_wakeup(100, 99),
            Err(RequestVtimerError::BadId)
        );

        System::vtimer_set_wakeup(200, s).unwrap();
        Sim::advance_time(200);
        assert_eq!(System::task_status(s), Ok(TaskSt::Pending));
        System::yield_now().unwrap();
        assert_eq!(System::active_task(), Ok(Some(s)));

        // A wake-up that finds the task awake is dropped
        System::vtimer_set_wakeup(100, s).unwrap();
        Sim::advance_time(100);
        assert_eq!(System::task_status(s), Ok(TaskSt::Running));
    }
}

mod near_deadline {
    use super::*;
    system!(num_channels = 2, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static FIRED: Mutex<Vec<(usize, UTicks)>> = Mutex::new(Vec::new());

    fn record(param: usize) {
        FIRED.lock().unwrap().push((param, Sim::now()));
    }

    #[test]
    fn test() {
        boot_with(|| {});

        // Closer than the spin barrier: dispatched before the call returns
        System::vtimer_request(10, record, 1).unwrap();
        let fired = FIRED.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].1 >= 10);

        // The channel went back to the tick
        assert_eq!(Sim::armed_channels(), [0]);
        assert_eq!(System::hw_timer_sleep_block_count(), 1);
    }
}

mod no_free_channel {
    use super::*;
    use ember_kernel::HwTimerHandle;

    system!(num_channels = 1, num_tasks = 2, num_vtimers = 8, epoch_ticks = 1000);

    static APP_CHANNEL: Mutex<Option<HwTimerHandle>> = Mutex::new(None);
    static RELEASED_AT: Mutex<Option<UTicks>> = Mutex::new(None);

    /// Take the channel the virtual timers just gave back.
    fn grab(_: usize) {
        let handle = System::hw_timer_set(5000, nop, 0).unwrap();
        *APP_CHANNEL.lock().unwrap() = Some(handle);
    }

    fn release(_: usize) {
        *RELEASED_AT.lock().unwrap() = Some(Sim::now());
        let handle = APP_CHANNEL.lock().unwrap().take().unwrap();
        System::hw_timer_remove(handle).unwrap();
    }

    #[test]
    fn test() {
        boot_with(|| {});
        System::vtimer_request(100, grab, 0).unwrap();
        System::vtimer_request(300, release, 0).unwrap();

        // Once `grab` has taken the only channel, the kernel busy-waits for
        // `release`
        Sim::advance_time(100);
        let released_at = RELEASED_AT.lock().unwrap().unwrap();
        assert!((300..1000).contains(&released_at));
        assert!(Sim::now() >= 300);

        // ...which frees the channel for the tick
        assert_eq!(Sim::armed_channels(), [0]);
        assert_eq!(System::hw_timer_sleep_block_count(), 1);
        assert!(APP_CHANNEL.lock().unwrap().is_none());
    }
}
