//! Wait queues and the task blocking/unblocking engine.
//!
//! A task can be in at most one wait at a time. All of a wait's bookkeeping
//! (queue membership links, the result slot, the payload being exchanged)
//! lives in the task control block, so queueing never allocates. Everything
//! here runs under the CPU lock; the lock is what makes a "check condition,
//! then block" sequence atomic with respect to the timer and other tasks.
use crate::{
    cfg::{Priority, Ticks},
    error::{expect_not_timeout, BadObjectStateError, WaitError, WaitTimeoutError},
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    msgqueue::Message,
    mutex,
    mutex::MutexCb,
    task,
    task::{TaskCb, TaskSt},
    timeout::{self, insert_timeout, Timeout, TimeoutGuard, TimeoutRef},
    utils::{
        intrusive_list::{self, CellList, Link, ListHead},
        Init,
    },
    KernelTraits, Port,
};

/// The ordering discipline of a [`WaitQueue`], fixed at object creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// Waiters are released in the order they arrived.
    Fifo,
    /// Waiters are released in task priority order. Equal priorities keep
    /// arrival order.
    TaskPriority,
}

impl Init for QueueOrder {
    const INIT: Self = Self::Fifo;
}

/// What a blocked task is waiting to exchange. Stored in the task control
/// block and handed back to the waiter when the wait completes.
pub(crate) enum WaitPayload<Traits: Port> {
    None,
    Sleep,
    Semaphore,
    Mutex(&'static MutexCb<Traits>),
    /// The message this task is waiting to deposit into a full queue.
    SendMessage(Message),
    /// Filled in by the completer before the receiver is woken.
    ReceiveMessage(Message),
    Barrier,
}

impl<Traits: Port> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for WaitPayload<Traits> {}

/// The wait-related fields of a task control block.
pub(crate) struct TaskWait<Traits: Port> {
    /// Neighbors in the wait queue this task is currently enqueued on.
    link: CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,
    /// The queue this task is enqueued on, if the current wait has one.
    current_queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,
    /// Whether the task has an active (possibly queue-less) wait.
    waiting: CpuLockCell<Traits, bool>,
    wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
    pub(crate) payload: CpuLockCell<Traits, WaitPayload<Traits>>,
    /// The timeout registered for the current timed wait. Lets task deletion
    /// unregister a node that lives on the victim's stack.
    pub(crate) active_timeout: CpuLockCell<Traits, Option<TimeoutRef<Traits>>>,
}

impl<Traits: Port> Init for TaskWait<Traits> {
    const INIT: Self = Self {
        link: Init::INIT,
        current_queue: CpuLockCell::new(None),
        waiting: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
        payload: CpuLockCell::new(WaitPayload::None),
        active_timeout: CpuLockCell::new(None),
    };
}

/// A queue of tasks blocked on one synchronization object.
///
/// The control blocks that embed one are initialized once at compile time,
/// so the ordering discipline is set by `set_order` when the owning object
/// is created.
pub(crate) struct WaitQueue<Traits: Port> {
    waits: CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
    order: CpuLockCell<Traits, QueueOrder>,
}

impl<Traits: Port> Init for WaitQueue<Traits> {
    const INIT: Self = Self {
        waits: CpuLockCell::new(ListHead::INIT),
        order: Init::INIT,
    };
}

impl<Traits: Port> WaitQueue<Traits> {
    /// Set the ordering discipline. The queue must be empty.
    pub(crate) fn set_order(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, order: QueueOrder) {
        debug_assert!(self.waits.read(&**lock).is_empty());
        self.order.replace(&mut **lock, order);
    }
}

struct WaitListCtx<'a, 'b, 'c, Traits: Port> {
    head: &'a CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
    lock: &'b mut CpuLockTokenRefMut<'c, Traits>,
}

impl<Traits: Port> CellList for WaitListCtx<'_, '_, '_, Traits> {
    type Elem = TaskCb<Traits>;

    fn head(&self) -> ListHead<TaskCb<Traits>> {
        self.head.get(&**self.lock)
    }
    fn set_head(&mut self, head: ListHead<TaskCb<Traits>>) {
        self.head.replace(&mut **self.lock, head);
    }
    fn link(&self, elem: &TaskCb<Traits>) -> Option<Link<TaskCb<Traits>>> {
        elem.wait.link.get(&**self.lock)
    }
    fn set_link(&mut self, elem: &TaskCb<Traits>, link: Option<Link<TaskCb<Traits>>>) {
        elem.wait.link.replace(&mut **self.lock, link);
    }
}

/// Construct a timeout object that interrupts `task`'s wait when it expires.
fn new_timeout_object_for_task<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
) -> Timeout<Traits> {
    Timeout::new(interrupt_task_by_timeout::<Traits>, task as *const _ as usize)
}

fn interrupt_task_by_timeout<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was produced from `&'static TaskCb` by
    //         `new_timeout_object_for_task`
    let task = unsafe { &*(param as *const TaskCb<Traits>) };
    match interrupt_task(lock.borrow_mut(), task, Err(WaitTimeoutError::Timeout)) {
        // The wait completed or was torn down before the timeout fired
        Ok(()) | Err(BadObjectStateError::BadObjectState) => {}
    }
    lock
}

/// Pin a timeout object on the current stack, register it, record it as the
/// task's active timeout, and rebind `$lock` to a borrow of the guard that
/// will unregister it when the enclosing scope exits.
macro_rules! setup_timeout_wait {
    ($lock:ident, $task:expr, $delay:expr) => {
        let timeout = new_timeout_object_for_task::<Traits>($task);
        pin_utils::pin_mut!(timeout);
        let mut timeout_guard = TimeoutGuard {
            timeout: timeout.as_ref(),
            lock: $lock,
        };
        insert_timeout(
            timeout_guard.lock.borrow_mut(),
            timeout_guard.timeout,
            $delay,
        );
        $task.wait.active_timeout.replace(
            &mut *timeout_guard.lock,
            Some(TimeoutRef::new(timeout_guard.timeout)),
        );
        #[allow(unused_mut)]
        let mut $lock = timeout_guard.lock.borrow_mut();
    };
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Block the current task on this queue until a completer releases it.
    pub(crate) fn wait(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        self.wait_inner(lock, payload).map_err(expect_not_timeout)
    }

    /// Like [`Self::wait`], but give up after `delay` ticks.
    pub(crate) fn wait_timeout(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        delay: Ticks,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        // There is a running task; the caller checked the calling context
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        setup_timeout_wait!(lock, task, delay);
        self.wait_inner(lock, payload)
    }

    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        self.enqueue(&mut lock, task);
        task.wait.waiting.replace(&mut *lock, true);
        task.wait.payload.replace(&mut *lock, payload);
        task.wait.wait_result.replace(&mut *lock, Ok(()));

        task::wait_until_woken_up(lock.borrow_mut());

        debug_assert!(task.wait.link.get(&*lock).is_none());
        task.wait.active_timeout.replace(&mut *lock, None);
        task.wait
            .wait_result
            .get(&*lock)
            .map(|()| task.wait.payload.get(&*lock))
    }

    /// Link `task` at its place under the queue's ordering discipline: the
    /// back for FIFO, after its last equal for priority order.
    fn enqueue(
        &'static self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        let order = self.order.get(&**lock);
        let pos = match order {
            QueueOrder::Fifo => None,
            QueueOrder::TaskPriority => {
                let pri = task.effective_priority.get(&**lock);
                self.priority_insertion_pos(lock, pri)
            }
        };
        {
            let mut ctx = WaitListCtx {
                head: &self.waits,
                lock: &mut *lock,
            };
            match order {
                QueueOrder::Fifo => intrusive_list::push_back(&mut ctx, task),
                QueueOrder::TaskPriority => intrusive_list::insert_before(&mut ctx, task, pos),
            }
        }
        task.wait.current_queue.replace(&mut **lock, Some(self));
    }

    /// The first waiter whose priority is strictly worse than `pri`, which is
    /// where a priority-ordered insertion goes (after all equals).
    fn priority_insertion_pos(
        &self,
        lock: &CpuLockTokenRefMut<'_, Traits>,
        pri: Priority,
    ) -> Option<&'static TaskCb<Traits>> {
        let mut cur = self.waits.read(&**lock).first;
        while let Some(t) = cur {
            if t.effective_priority.get(&**lock) > pri {
                return Some(t);
            }
            cur = t.wait.link.read(&**lock).unwrap().next;
        }
        None
    }

    /// The waiter that would be released next.
    pub(crate) fn first_waiting_task(
        &self,
        lock: &CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.waits.read(&**lock).first
    }

    pub(crate) fn is_empty(&self, lock: &CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.waits.read(&**lock).is_empty()
    }

    pub(crate) fn waiter_count(&self, lock: &CpuLockTokenRefMut<'_, Traits>) -> usize {
        let mut n = 0;
        let mut cur = self.waits.read(&**lock).first;
        while let Some(t) = cur {
            n += 1;
            cur = t.wait.link.read(&**lock).unwrap().next;
        }
        n
    }

    /// Release the frontmost waiter with a successful result. Returns the
    /// released task.
    pub(crate) fn wake_up_one(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let mut ctx = WaitListCtx {
            head: &self.waits,
            lock: &mut lock,
        };
        let task = intrusive_list::pop_front(&mut ctx)?;
        complete_wait(lock, task, Ok(()));
        Some(task)
    }

    /// Release every waiter with a successful result. Returns how many tasks
    /// were released.
    pub(crate) fn wake_up_all(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        let mut n = 0;
        while self.wake_up_one(lock.borrow_mut()).is_some() {
            n += 1;
        }
        n
    }

    /// Release every waiter with the error `err`. Used when the object being
    /// waited on is deleted.
    pub(crate) fn flush_all(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        err: WaitTimeoutError,
    ) -> usize {
        let mut n = 0;
        loop {
            let mut ctx = WaitListCtx {
                head: &self.waits,
                lock: &mut lock,
            };
            let task = match intrusive_list::pop_front(&mut ctx) {
                Some(task) => task,
                None => break,
            };
            complete_wait(lock.borrow_mut(), task, Err(err));
            n += 1;
        }
        n
    }
}

/// Finish `task`'s wait with `result` and make it schedulable again.
///
/// The task must already be unlinked from any wait queue.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    result: Result<(), WaitTimeoutError>,
) {
    debug_assert!(task.wait.waiting.get(&*lock));
    debug_assert!(task.wait.link.get(&*lock).is_none());

    task.wait.waiting.replace(&mut *lock, false);
    task.wait.current_queue.replace(&mut *lock, None);
    task.wait.wait_result.replace(&mut *lock, result);

    assert_eq!(task.st.get(&*lock), TaskSt::Waiting);
    // Safety: the task is in the waiting state
    unsafe { task::make_ready(lock, task) };
}

/// Forcibly end `task`'s current wait with `result`, unlinking it from its
/// wait queue if it has one. Fails with `BadObjectState` if the task is not
/// waiting.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    result: Result<(), WaitTimeoutError>,
) -> Result<(), BadObjectStateError> {
    if task.st.get(&*lock) != TaskSt::Waiting {
        return Err(BadObjectStateError::BadObjectState);
    }

    let payload = task.wait.payload.get(&*lock);
    if let Some(queue) = task.wait.current_queue.get(&*lock) {
        let mut ctx = WaitListCtx {
            head: &queue.waits,
            lock: &mut lock,
        };
        intrusive_list::remove(&mut ctx, task);
    }
    complete_wait(lock.borrow_mut(), task, result);

    // Removing a waiter can lower the priority a mutex owner inherits
    if let WaitPayload::Mutex(mutex_cb) = payload {
        mutex::reevaluate_owner_priority(lock, mutex_cb);
    }

    Ok(())
}

/// Tear down `task`'s current wait without completing it. Used when the task
/// itself is being deleted or restarted; the task does not become Ready and
/// no result is reported.
pub(crate) fn cancel_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Waiting);

    let payload = task.wait.payload.get(&*lock);
    if let Some(queue) = task.wait.current_queue.get(&*lock) {
        let mut ctx = WaitListCtx {
            head: &queue.waits,
            lock: &mut lock,
        };
        intrusive_list::remove(&mut ctx, task);
    }
    if let Some(r) = task.wait.active_timeout.get(&*lock) {
        // Safety: the node lives on the waiting task's stack, which stays
        //         put until the task is disposed of
        unsafe { timeout::remove_timeout_by_ref(lock.borrow_mut(), r) };
        task.wait.active_timeout.replace(&mut *lock, None);
    }
    task.wait.waiting.replace(&mut *lock, false);
    task.wait.current_queue.replace(&mut *lock, None);

    // Removing a waiter can lower the priority a mutex owner inherits
    if let WaitPayload::Mutex(mutex_cb) = payload {
        mutex::reevaluate_owner_priority(lock, mutex_cb);
    }
}

/// Block the current task with no wait queue until `delay` ticks pass (or
/// the wait is interrupted). Expiry is reported as `Err(Timeout)`.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    delay: Ticks,
) -> Result<(), WaitTimeoutError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    setup_timeout_wait!(lock, task, delay);

    task.wait.current_queue.replace(&mut *lock, None);
    task.wait.waiting.replace(&mut *lock, true);
    task.wait.payload.replace(&mut *lock, WaitPayload::Sleep);
    task.wait.wait_result.replace(&mut *lock, Ok(()));

    task::wait_until_woken_up(lock.borrow_mut());

    task.wait.active_timeout.replace(&mut *lock, None);
    task.wait.wait_result.get(&*lock)
}

/// Reposition `task` in its priority-ordered wait queue after a priority
/// change. No-op for FIFO queues or if the task is not queued.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let queue = match task.wait.current_queue.get(&*lock) {
        Some(queue) if queue.order.get(&*lock) == QueueOrder::TaskPriority => queue,
        _ => return,
    };

    {
        let mut ctx = WaitListCtx {
            head: &queue.waits,
            lock: &mut lock,
        };
        intrusive_list::remove(&mut ctx, task);
    }
    let pri = task.effective_priority.get(&*lock);
    let pos = queue.priority_insertion_pos(&lock, pri);
    let mut ctx = WaitListCtx {
        head: &queue.waits,
        lock: &mut lock,
    };
    intrusive_list::insert_before(&mut ctx, task, pos);
}
