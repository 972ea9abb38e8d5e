//! Task run-queue implementation (internal use only).
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::Pid,
    utils::{
        intrusive_list::{Link, LinkStore, ListError, ListHead},
        Init, PrioBitmap,
    },
    KernelCfg1, KernelTraits, PortThreading,
};

/// Represents the set of task run-queues, which tracks the tasks whose status
/// is `Running` or `Pending`, segregated by priority.
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue<Traits>: Send + Sync + fmt::Debug + Init + 'static + private::Sealed {
    /// Append the task `pid` to the back of the queue for `priority`.
    ///
    /// Panics if `pid` is already linked.
    fn push_back_task(&self, ctx: Ctx<'_, Traits>, pid: Pid, priority: usize)
    where
        Traits: KernelTraits;

    /// Unlink the task `pid` from the queue for `priority`.
    ///
    /// Panics if `pid` is not linked.
    fn remove_task(&self, ctx: Ctx<'_, Traits>, pid: Pid, priority: usize)
    where
        Traits: KernelTraits;

    /// Get the most urgent (numerically lowest) priority having a non-empty
    /// queue.
    fn first_ready_priority(&self, ctx: Ctx<'_, Traits>) -> Option<usize>
    where
        Traits: KernelTraits;

    /// Move the front task of the queue for `priority` to its back and
    /// return it.
    fn rotate(&self, ctx: Ctx<'_, Traits>, priority: usize) -> Option<Pid>
    where
        Traits: KernelTraits;

    /// Count the tasks linked to any of the queues.
    fn num_ready_tasks(&self, ctx: Ctx<'_, Traits>) -> usize
    where
        Traits: KernelTraits;

    /// Get the bitmap bit for `priority`.
    fn is_priority_ready(&self, ctx: Ctx<'_, Traits>, priority: usize) -> bool
    where
        Traits: KernelTraits;

    /// Return a flag indicating whether the queue for `priority` is empty,
    /// judging from the list itself rather than the bitmap.
    fn is_queue_empty(&self, ctx: Ctx<'_, Traits>, priority: usize) -> bool
    where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which prevents [`Queue`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The context type for [`Queue`].
pub struct Ctx<'a, Traits: PortThreading> {
    pub(crate) lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<'a, Traits: PortThreading> From<CpuLockTokenRefMut<'a, Traits>> for Ctx<'a, Traits> {
    #[inline]
    fn from(lock: CpuLockTokenRefMut<'a, Traits>) -> Self {
        Self { lock }
    }
}

/// The run-queue implementation that uses a set of FIFO queues segregated by
/// the priorities of contained tasks.
pub struct BitmapQueue<Traits: PortThreading, const LEN: usize> {
    /// Invariant: `queues[i].is_empty() != bitmap.get(i)`
    queues: [CpuLockCell<Traits, ListHead>; LEN],
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: PortThreading, const LEN: usize> BitmapQueue<Traits, LEN> {
    const CHECK_LEN: () = assert!(
        LEN <= PrioBitmap::CAPACITY,
        "too many priority levels for the run-queue bitmap"
    );
}

impl<Traits: PortThreading, const LEN: usize> Init for BitmapQueue<Traits, LEN> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = {
        let () = Self::CHECK_LEN;
        Self {
            queues: Init::INIT,
            bitmap: Init::INIT,
        }
    };
}

/// The `link` fields of the task pool, opened with CPU Lock.
struct TaskLinks<'a, Traits: PortThreading> {
    lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> LinkStore for TaskLinks<'_, Traits> {
    #[inline]
    fn link(&self, pid: usize) -> Option<Link> {
        Traits::task_cb_pool()[pid].link.get(&self.lock)
    }

    #[inline]
    fn set_link(&mut self, pid: usize, link: Option<Link>) {
        Traits::task_cb_pool()[pid]
            .link
            .replace(&mut self.lock, link);
    }
}

#[cold]
fn corrupted(e: ListError) -> ! {
    panic!("task run-queue is corrupted: {e:?}")
}

impl<Traits: KernelTraits, const LEN: usize> BitmapQueue<Traits, LEN> {
    /// Run `f` on the list head for `priority` and write the head back.
    fn with_list<R>(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        priority: usize,
        f: impl FnOnce(&mut ListHead, &mut TaskLinks<'_, Traits>) -> Result<R, ListError>,
    ) -> R {
        let mut head = self.queues[priority].get(&lock);
        let result = f(
            &mut head,
            &mut TaskLinks {
                lock: lock.borrow_mut(),
            },
        );
        self.queues[priority].replace(&mut lock, head);
        result.unwrap_or_else(|e| corrupted(e))
    }
}

impl<Traits: KernelTraits, const LEN: usize> Queue<Traits> for BitmapQueue<Traits, LEN>
where
    Traits: KernelCfg1<TaskReadyQueue = Self>,
{
    fn push_back_task(&self, Ctx { mut lock }: Ctx<'_, Traits>, pid: Pid, priority: usize) {
        self.with_list(lock.borrow_mut(), priority, |head, links| {
            head.push_back(links, pid)
        });
        self.bitmap.write(&mut lock).set(priority);

        log::trace!("pid {pid} queued at priority {priority}");
    }

    fn remove_task(&self, Ctx { mut lock }: Ctx<'_, Traits>, pid: Pid, priority: usize) {
        let now_empty = self.with_list(lock.borrow_mut(), priority, |head, links| {
            head.remove(links, pid)?;
            Ok(head.is_empty())
        });

        // The bit goes away with the last task of the level
        if now_empty {
            self.bitmap.write(&mut lock).clear(priority);
        }

        log::trace!("pid {pid} dequeued from priority {priority}");
    }

    #[inline]
    fn first_ready_priority(&self, Ctx { lock }: Ctx<'_, Traits>) -> Option<usize> {
        self.bitmap.read(&lock).find_set()
    }

    fn rotate(&self, Ctx { lock }: Ctx<'_, Traits>, priority: usize) -> Option<Pid> {
        self.with_list(lock, priority, |head, links| head.rotate(&*links))
    }

    fn num_ready_tasks(&self, Ctx { lock }: Ctx<'_, Traits>) -> usize {
        let links = TaskLinks { lock };
        self.queues
            .iter()
            .map(|head| head.get(&links.lock).iter(&links).count())
            .sum()
    }

    fn is_priority_ready(&self, Ctx { lock }: Ctx<'_, Traits>, priority: usize) -> bool {
        self.bitmap.read(&lock).get(priority)
    }

    fn is_queue_empty(&self, Ctx { lock }: Ctx<'_, Traits>, priority: usize) -> bool {
        self.queues[priority].read(&lock).is_empty()
    }
}

impl<Traits: KernelTraits, const LEN: usize> fmt::Debug for BitmapQueue<Traits, LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(mut lock) = crate::klock::lock_cpu::<Traits>() else {
            return f.write_str("BitmapQueue(<CPU Lock held>)");
        };
        let links = TaskLinks {
            lock: lock.borrow_mut(),
        };
        let mut map = f.debug_map();
        for (priority, head) in self.queues.iter().enumerate() {
            let head = head.get(&links.lock);
            if !head.is_empty() {
                map.entry(&priority, &DebugList(head, &links));
            }
        }
        map.finish()
    }
}

struct DebugList<'a, S>(ListHead, &'a S);

impl<S: LinkStore> fmt::Debug for DebugList<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.0.iter(self.1)).finish()
    }
}

impl<Traits: KernelTraits, const LEN: usize> private::Sealed for BitmapQueue<Traits, LEN> where
    Traits: KernelCfg1<TaskReadyQueue = Self>
{
}
