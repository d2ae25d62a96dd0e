//! Ready queues. The [`Queue`] trait hides the scheduling policy from the
//! rest of the kernel; the policy is chosen by `KernelCfg1::TaskReadyQueue`.
use core::fmt;

use crate::{
    cfg::{PriorityBitmap, Time, PRIORITY_LEVELS},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{
        intrusive_list::{self, CellList, Link, ListHead},
        Init, PrioBitmap,
    },
    KernelTraits, Port,
};

/// The ready-queue linkage embedded in every task control block. Shared by
/// all [`Queue`] implementations, so a task occupies the same storage no
/// matter which policy is configured.
pub struct ReadyQueueData<Traits: Port> {
    link: CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,
}

impl<Traits: Port> Init for ReadyQueueData<Traits> {
    const INIT: Self = Self { link: Init::INIT };
}

impl<Traits: Port> fmt::Debug for ReadyQueueData<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ReadyQueueData")
    }
}

impl<Traits: Port> ReadyQueueData<Traits> {
    /// Whether the task is currently linked into the ready queue.
    pub(crate) fn is_linked(&self, lock: &CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.get(&**lock).is_some()
    }
}

/// The operand of [`Queue`]'s methods.
pub struct Ctx<'a, Traits: Port> {
    pub(super) lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<'a, Traits: Port> From<CpuLockTokenRefMut<'a, Traits>> for Ctx<'a, Traits> {
    #[inline]
    fn from(lock: CpuLockTokenRefMut<'a, Traits>) -> Self {
        Self { lock }
    }
}

/// The outcome of [`Queue::pop_front_task`].
pub enum ScheduleDecision<T> {
    /// Let the currently running task continue.
    Keep,
    /// Switch to the specified task. `SwitchTo(None)` means idle.
    SwitchTo(Option<T>),
}

mod private {
    pub trait Sealed {}
}

/// A ready-task queue. The implementation of this trait defines the
/// scheduling policy of the kernel.
///
/// Tasks are pushed when they become schedulable (Ready with no outstanding
/// suspensions) and popped when the kernel picks the next task to run. The
/// running task itself is never in the queue.
pub trait Queue<Traits>:
    Send + Sync + Init + fmt::Debug + 'static + private::Sealed
{
    /// Should a ready task preempt `prev_task`?
    ///
    /// `prev_task` is the currently running task, or `None` if there is none
    /// (in which case any ready task wins).
    fn has_preempting_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task: Option<&'static TaskCb<Traits>>,
    ) -> bool
    where
        Traits: KernelTraits;

    /// Enqueue a task at the position a newly readied task takes.
    ///
    /// # Safety
    ///
    /// `task_cb` must be schedulable and not already queued.
    unsafe fn push_back_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Enqueue a task ahead of its equals. Used for a preempted task, which
    /// keeps its turn.
    ///
    /// # Safety
    ///
    /// `task_cb` must be schedulable and not already queued.
    unsafe fn push_front_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Decide which task should run next, dequeueing it if it is not
    /// `prev_task`.
    fn pop_front_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task: Option<&'static TaskCb<Traits>>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// Requeue a task after its effective priority changed from
    /// `old_priority` to `new_priority`. The task joins the back of its new
    /// equals, unless `prepend` puts it ahead of them (a priority-inheritance
    /// boost moves the owner in front of the tasks it now ties with).
    ///
    /// # Safety
    ///
    /// `task_cb` must be queued, and `old_priority` must be the priority it
    /// was queued under.
    unsafe fn reorder_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        new_priority: usize,
        old_priority: usize,
        prepend: bool,
    ) where
        Traits: KernelTraits;

    /// Requeue a task after its deadline changed.
    ///
    /// # Safety
    ///
    /// `task_cb` must be queued.
    unsafe fn reorder_task_deadline(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) where
        Traits: KernelTraits,
    {
        let Ctx { lock: _lock } = ctx;
        let _ = task_cb;
    }

    /// Dequeue a task that is no longer schedulable (suspended or deleted
    /// while Ready).
    ///
    /// # Safety
    ///
    /// `task_cb` must be queued under `priority`.
    unsafe fn remove_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        priority: usize,
    ) where
        Traits: KernelTraits;
}

struct ReadyListCtx<'a, 'b, 'c, Traits: Port> {
    head: &'a CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
    lock: &'b mut CpuLockTokenRefMut<'c, Traits>,
}

impl<Traits: Port> CellList for ReadyListCtx<'_, '_, '_, Traits> {
    type Elem = TaskCb<Traits>;

    fn head(&self) -> ListHead<TaskCb<Traits>> {
        self.head.get(&**self.lock)
    }
    fn set_head(&mut self, head: ListHead<TaskCb<Traits>>) {
        self.head.replace(&mut **self.lock, head);
    }
    fn link(&self, elem: &TaskCb<Traits>) -> Option<Link<TaskCb<Traits>>> {
        elem.ready_queue_data.link.get(&**self.lock)
    }
    fn set_link(&mut self, elem: &TaskCb<Traits>, link: Option<Link<TaskCb<Traits>>>) {
        elem.ready_queue_data.link.replace(&mut **self.lock, link);
    }
}

/// Fixed-priority scheduling: one FIFO per priority level plus an occupancy
/// bitmap.
///
/// Invariant: `bitmap.get(pri) == !queues[pri].is_empty()`.
pub struct BitmapQueue<Traits: Port> {
    queues: [CpuLockCell<Traits, ListHead<TaskCb<Traits>>>; PRIORITY_LEVELS],
    bitmap: CpuLockCell<Traits, PriorityBitmap>,
}

impl<Traits: Port> Init for BitmapQueue<Traits> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: Port> fmt::Debug for BitmapQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueue").finish_non_exhaustive()
    }
}

impl<Traits: Port> private::Sealed for BitmapQueue<Traits> {}

impl<Traits: Port> BitmapQueue<Traits> {
    fn insert(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        front: bool,
    ) {
        let pri = task_cb.effective_priority.get(&**lock) as usize;
        let mut ctx = ReadyListCtx {
            head: &self.queues[pri],
            lock,
        };
        if front {
            intrusive_list::push_front(&mut ctx, task_cb);
        } else {
            intrusive_list::push_back(&mut ctx, task_cb);
        }
        self.bitmap.write(&mut **lock).set(pri);
    }

    fn remove(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        pri: usize,
    ) {
        let mut ctx = ReadyListCtx {
            head: &self.queues[pri],
            lock,
        };
        intrusive_list::remove(&mut ctx, task_cb);
        if self.queues[pri].read(&**lock).is_empty() {
            self.bitmap.write(&mut **lock).clear(pri);
        }
    }
}

impl<Traits: Port> Queue<Traits> for BitmapQueue<Traits> {
    fn has_preempting_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task: Option<&'static TaskCb<Traits>>,
    ) -> bool
    where
        Traits: KernelTraits,
    {
        let Ctx { lock } = ctx;
        let limit = prev_task.map_or(usize::MAX, |t| t.effective_priority.get(&*lock) as usize);
        match self.bitmap.read(&*lock).find_set() {
            Some(pri) => pri < limit,
            None => false,
        }
    }

    unsafe fn push_back_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        self.insert(&mut lock, task_cb, false);
    }

    unsafe fn push_front_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        self.insert(&mut lock, task_cb, true);
    }

    fn pop_front_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task: Option<&'static TaskCb<Traits>>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        let prev_pri =
            prev_task.map_or(usize::MAX, |t| t.effective_priority.get(&*lock) as usize);
        let next_pri = self.bitmap.read(&*lock).find_set().unwrap_or(usize::MAX - 1);

        if prev_pri <= next_pri {
            ScheduleDecision::Keep
        } else if next_pri < PRIORITY_LEVELS {
            let mut ctx = ReadyListCtx {
                head: &self.queues[next_pri],
                lock: &mut lock,
            };
            // The bitmap invariant guarantees the list is non-empty
            let task = intrusive_list::pop_front(&mut ctx).unwrap();
            if self.queues[next_pri].read(&*lock).is_empty() {
                self.bitmap.write(&mut *lock).clear(next_pri);
            }
            ScheduleDecision::SwitchTo(Some(task))
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    unsafe fn reorder_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        new_priority: usize,
        old_priority: usize,
        prepend: bool,
    ) where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        debug_assert_ne!(new_priority, old_priority);
        self.remove(&mut lock, task_cb, old_priority);
        debug_assert_eq!(
            task_cb.effective_priority.get(&*lock) as usize,
            new_priority
        );
        self.insert(&mut lock, task_cb, prepend);
    }

    unsafe fn remove_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        priority: usize,
    ) where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        self.remove(&mut lock, task_cb, priority);
    }
}

/// Earliest-deadline-first scheduling.
///
/// A single queue ordered by deadline, breaking ties by fixed priority, then
/// by arrival. A task with no deadline runs after every deadline-bearing
/// task, in fixed priority order.
pub struct EdfQueue<Traits: Port> {
    queue: CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
}

impl<Traits: Port> Init for EdfQueue<Traits> {
    const INIT: Self = Self { queue: Init::INIT };
}

impl<Traits: Port> fmt::Debug for EdfQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EdfQueue").finish_non_exhaustive()
    }
}

impl<Traits: Port> private::Sealed for EdfQueue<Traits> {}

/// `(deadline-less, deadline, fixed priority)`; lexicographically smaller
/// runs first.
type EdfKey = (bool, Time, u8);

impl<Traits: Port> EdfQueue<Traits> {
    fn key(lock: &CpuLockTokenRefMut<'_, Traits>, task_cb: &TaskCb<Traits>) -> EdfKey {
        let (missing, deadline) = match task_cb.deadline.get(&**lock) {
            Some(d) => (false, d),
            None => (true, 0),
        };
        (missing, deadline, task_cb.effective_priority.get(&**lock))
    }

    fn insert(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        front: bool,
    ) {
        let key = Self::key(lock, task_cb);
        let mut pos = self.queue.read(&**lock).first;
        while let Some(t) = pos {
            let tk = Self::key(lock, t);
            let goes_before = if front { tk >= key } else { tk > key };
            if goes_before {
                break;
            }
            pos = t.ready_queue_data.link.read(&**lock).unwrap().next;
        }
        let mut ctx = ReadyListCtx {
            head: &self.queue,
            lock,
        };
        intrusive_list::insert_before(&mut ctx, task_cb, pos);
    }
}

impl<Traits: Port> Queue<Traits> for EdfQueue<Traits> {
    fn has_preempting_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task: Option<&'static TaskCb<Traits>>,
    ) -> bool
    where
        Traits: KernelTraits,
    {
        let Ctx { lock } = ctx;
        match (self.queue.read(&*lock).first, prev_task) {
            (Some(head), Some(prev)) => Self::key(&lock, head) < Self::key(&lock, prev),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    unsafe fn push_back_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        self.insert(&mut lock, task_cb, false);
    }

    unsafe fn push_front_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        self.insert(&mut lock, task_cb, true);
    }

    fn pop_front_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task: Option<&'static TaskCb<Traits>>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        let head = self.queue.read(&*lock).first;
        match (prev_task, head) {
            (Some(prev), Some(h)) if Self::key(&lock, prev) <= Self::key(&lock, h) => {
                ScheduleDecision::Keep
            }
            (Some(_), None) => ScheduleDecision::Keep,
            (_, Some(h)) => {
                let mut ctx = ReadyListCtx {
                    head: &self.queue,
                    lock: &mut lock,
                };
                intrusive_list::remove(&mut ctx, h);
                ScheduleDecision::SwitchTo(Some(h))
            }
            (None, None) => ScheduleDecision::SwitchTo(None),
        }
    }

    unsafe fn reorder_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        _new_priority: usize,
        _old_priority: usize,
        prepend: bool,
    ) where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        {
            let mut ctx = ReadyListCtx {
                head: &self.queue,
                lock: &mut lock,
            };
            intrusive_list::remove(&mut ctx, task_cb);
        }
        self.insert(&mut lock, task_cb, prepend);
    }

    unsafe fn reorder_task_deadline(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) where
        Traits: KernelTraits,
    {
        // Safety: forwarded from the caller
        unsafe { self.reorder_task(ctx, task_cb, 0, 0, false) }
    }

    unsafe fn remove_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        _priority: usize,
    ) where
        Traits: KernelTraits,
    {
        let Ctx { mut lock } = ctx;
        let mut ctx = ReadyListCtx {
            head: &self.queue,
            lock: &mut lock,
        };
        intrusive_list::remove(&mut ctx, task_cb);
    }
}
