//! Task control blocks, the task state machine, and the dispatcher's
//! kernel-side half.
use core::{fmt, mem::forget};

use crate::{
    cfg::{Priority, Ticks, Time, PRIORITY_LEVELS},
    error::{
        BadContextError, BadIdError, BadObjectStateError, BadParamError, ChangeTaskModeError,
        CreateTaskError, DeleteTaskError, ExitTaskError, GetTaskPriorityError, IdentError,
        RestartTaskError, ResumeTaskError, SetTaskDeadlineError, SetTaskPriorityError, SleepError,
        StartTaskError, SuspendTaskError, WaitTimeoutError,
    },
    klock::{assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex,
    mutex::MutexCb,
    object::{Id, Name},
    state, timeout, wait,
    wait::TaskWait,
    utils::Init,
    KernelTraits, Port,
};

pub mod readyqueue;
use self::readyqueue::{Queue, ScheduleDecision};

/// Task state machine.
///
/// A `Ready` task with a non-zero suspension count is *not* in the ready
/// queue; it rejoins when the last suspension is lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// Created (or exited) but not started.
    Dormant,
    /// Schedulable, waiting for the processor.
    Ready,
    /// Currently executing.
    Running,
    /// Blocked on a wait operation.
    Waiting,
    /// Deleted. The control block holds this state until the slot is reused.
    Zombie,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

bitflags::bitflags! {
    /// Per-task execution mode flags.
    pub struct TaskMode: u8 {
        /// The task is not preempted by higher-priority tasks while it runs.
        /// Blocking and self-yield still switch tasks; the deferred
        /// preemption happens when the flag is cleared.
        const NO_PREEMPT = 1 << 0;
    }
}

impl Init for TaskMode {
    const INIT: Self = TaskMode::empty();
}

/// A task's entry point and its start argument.
#[derive(Debug, Clone, Copy)]
pub struct TaskEntry {
    pub entry: fn(usize),
    pub arg: usize,
}

/// A task control block.
pub struct TaskCb<Traits: Port> {
    /// The port's per-task state (e.g. the saved context).
    pub port_task_state: Traits::PortTaskState,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// The priority given by `create_task`/`set_task_priority`.
    pub(crate) base_priority: CpuLockCell<Traits, Priority>,
    /// `base_priority` combined with priority-protocol boosts.
    pub(crate) effective_priority: CpuLockCell<Traits, Priority>,
    /// The priority the task reverts to when (re)started.
    created_priority: CpuLockCell<Traits, Priority>,

    /// Outstanding `suspend_task` calls. Stacks with `Waiting`.
    pub(crate) suspend_count: CpuLockCell<Traits, u32>,
    pub(crate) mode: CpuLockCell<Traits, TaskMode>,
    /// Absolute EDF deadline. `None` ranks after every deadline-bearing task.
    pub(crate) deadline: CpuLockCell<Traits, Option<Time>>,

    entry: CpuLockCell<Traits, Option<TaskEntry>>,

    pub(crate) wait: TaskWait<Traits>,
    pub(crate) ready_queue_data: readyqueue::ReadyQueueData<Traits>,

    /// Most recently locked mutex this task still holds. The mutexes form a
    /// singly-linked chain through `MutexCb::prev_mutex_held`.
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,
}

impl<Traits: Port> Init for TaskCb<Traits>
where
    Traits::PortTaskState: Init,
{
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        st: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        created_priority: Init::INIT,
        suspend_count: Init::INIT,
        mode: Init::INIT,
        deadline: Init::INIT,
        entry: Init::INIT,
        wait: Init::INIT,
        ready_queue_data: Init::INIT,
        last_mutex_held: CpuLockCell::new(None),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// The entry point most recently given to `start_task`/`restart_task`.
    /// Read by the port when it constructs the task's execution context.
    pub(crate) fn task_entry(&self, lock: &CpuLockTokenRefMut<'_, Traits>) -> Option<TaskEntry> {
        self.entry.get(&**lock)
    }
}

/// The index of `task_cb`'s registry slot.
fn task_index<Traits: KernelTraits>(task_cb: &'static TaskCb<Traits>) -> usize {
    let base = Traits::state().tasks.as_ptr() as usize;
    (task_cb as *const _ as usize - base) / core::mem::size_of::<TaskCb<Traits>>()
}

fn task_cb_by_id<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    id: Id,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    let i = Traits::state().task_registry.read(&**lock).get(id)?;
    Ok(&Traits::state().tasks[i])
}

// ---------------------------------------------------------------------------
// Scheduling plumbing

/// Transition a task into the Ready state, enqueueing it if it is
/// schedulable.
///
/// # Safety
///
/// The task must be in a state from which Ready is a legal transition
/// (Dormant being started, Waiting being completed, or Running being
/// descheduled), and must not be in the ready queue.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.st.replace(&mut *lock, TaskSt::Ready);
    if task_cb.suspend_count.get(&*lock) == 0 {
        // Safety: the task is Ready, schedulable, and unqueued
        unsafe {
            Traits::state()
                .task_ready_queue
                .push_back_task(lock.into(), task_cb)
        };
    }
}

/// The running task, provided it is actually schedulable right now.
fn schedulable_running_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<&'static TaskCb<Traits>> {
    Traits::state()
        .running_task
        .get(&*lock)
        .filter(|t| t.st.get(&*lock) == TaskSt::Running && t.suspend_count.get(&*lock) == 0)
}

/// Select the task that should run next and update `running_task`
/// accordingly. The port then dispatches to whatever `running_task` holds.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();
    let prev_task = state.running_task.get(&*lock);
    let prev_schedulable = prev_task
        .filter(|t| t.st.get(&*lock) == TaskSt::Running && t.suspend_count.get(&*lock) == 0);

    let next_task = match state
        .task_ready_queue
        .pop_front_task(lock.borrow_mut().into(), prev_schedulable)
    {
        ScheduleDecision::Keep => return,
        ScheduleDecision::SwitchTo(t) => t,
    };

    if let Some(next) = next_task {
        next.st.replace(&mut *lock, TaskSt::Running);
    }

    if let Some(prev) = prev_task {
        if prev.st.get(&*lock) == TaskSt::Running {
            // Preempted. It keeps its turn, so it goes ahead of its equals.
            prev.st.replace(&mut *lock, TaskSt::Ready);
            if prev.suspend_count.get(&*lock) == 0 {
                // Safety: the task is Ready, schedulable, and unqueued
                unsafe {
                    state
                        .task_ready_queue
                        .push_front_task(lock.borrow_mut().into(), prev)
                };
            }
        }
    }

    state.running_task.replace(&mut *lock, next_task);
}

/// Relinquish the processor until the current task is scheduled again.
///
/// The CPU lock is released and re-acquired around each yield; `task_cb`'s
/// state is what tells us whether we have been picked up again.
fn yield_until_running<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    loop {
        let st = task_cb.st.get(&*lock);
        if st == TaskSt::Running && task_cb.suspend_count.get(&*lock) == 0 {
            break;
        }
        debug_assert!(matches!(st, TaskSt::Running | TaskSt::Ready | TaskSt::Waiting));
        // Safety: the port re-enters the CPU lock before resuming us, and we
        //         restore it below in case `yield_cpu` returns in place
        unsafe {
            Traits::leave_cpu_lock();
            Traits::yield_cpu();
            Traits::enter_cpu_lock();
        }
    }
}

/// Block the current task (which must be Running) until `complete_wait`
/// makes it Ready and the scheduler picks it up again.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let task_cb = Traits::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(task_cb.st.get(&*lock), TaskSt::Running);
    task_cb.st.replace(&mut *lock, TaskSt::Waiting);
    yield_until_running(lock, task_cb);
}

fn dispatching_disabled<Traits: KernelTraits>(lock: &CpuLockTokenRefMut<'_, Traits>) -> bool {
    let state = Traits::state();
    if *state.dispatch_disable_depth.read(&**lock) > 0 {
        return true;
    }
    match state.running_task.get(&**lock) {
        Some(t) => {
            t.st.get(&**lock) == TaskSt::Running
                && t.mode.get(&**lock).contains(TaskMode::NO_PREEMPT)
        }
        None => false,
    }
}

/// Release the CPU lock, yielding first if a ready task outranks the running
/// one. While dispatching is disabled (nesting depth or `NO_PREEMPT`), the
/// check is deferred instead.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();

    {
        let token = lock.borrow_mut();
        if dispatching_disabled(&token) {
            drop(token);
            state.dispatch_pending.replace(&mut *lock, true);
            return;
        }
    }

    let prev_task = schedulable_running_task(lock.borrow_mut());
    // A running task that stopped being schedulable forces a dispatch even
    // if the ready queue cannot better it
    let must_dispatch =
        prev_task.is_none() && state.running_task.get(&*lock).is_some();
    let preempt = must_dispatch
        || state
            .task_ready_queue
            .has_preempting_task(lock.borrow_mut().into(), prev_task);
    drop(lock);

    if preempt {
        // Safety: the CPU lock is inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Run the preemption check that was deferred while dispatching was
/// disabled, if there is one pending and dispatching is enabled again.
pub(crate) fn check_deferred_dispatch<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>) {
    let state = Traits::state();
    let pending = {
        let token = lock.borrow_mut();
        *state.dispatch_pending.read(&*token) && !dispatching_disabled(&token)
    };
    if pending {
        state.dispatch_pending.replace(&mut *lock, false);
        unlock_cpu_and_check_preemption(lock);
    }
}

// ---------------------------------------------------------------------------
// Directives

pub(crate) fn create_task<Traits: KernelTraits>(
    name: Name,
    priority: Priority,
) -> Result<Id, CreateTaskError> {
    if priority as usize >= PRIORITY_LEVELS {
        return Err(BadParamError::BadParam.into());
    }
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let (i, id) = state.task_registry.write(&mut *lock).allocate(name)?;
    let cb = &state.tasks[i];

    debug_assert!(matches!(
        cb.st.get(&*lock),
        TaskSt::Dormant | TaskSt::Zombie
    ));
    cb.st.replace(&mut *lock, TaskSt::Dormant);
    cb.created_priority.replace(&mut *lock, priority);
    cb.base_priority.replace(&mut *lock, priority);
    cb.effective_priority.replace(&mut *lock, priority);
    cb.suspend_count.replace(&mut *lock, 0);
    cb.mode.replace(&mut *lock, TaskMode::empty());
    cb.deadline.replace(&mut *lock, None);
    cb.entry.replace(&mut *lock, None);
    debug_assert!(cb.last_mutex_held.get(&*lock).is_none());
    Ok(id)
}

pub(crate) fn ident_task<Traits: KernelTraits>(name: Name) -> Result<Id, IdentError> {
    let lock = lock_cpu::<Traits>()?;
    let id = Traits::state().task_registry.read(&*lock).ident(name)?;
    Ok(id)
}

pub(crate) fn start_task<Traits: KernelTraits>(
    id: Id,
    entry: fn(usize),
    arg: usize,
) -> Result<(), StartTaskError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if cb.st.get(&*lock) != TaskSt::Dormant {
        return Err(BadObjectStateError::BadObjectState.into());
    }

    cb.entry.replace(&mut *lock, Some(TaskEntry { entry, arg }));
    let pri = cb.created_priority.get(&*lock);
    cb.base_priority.replace(&mut *lock, pri);
    cb.effective_priority.replace(&mut *lock, pri);
    cb.suspend_count.replace(&mut *lock, 0);
    cb.deadline.replace(&mut *lock, None);
    cb.mode.replace(&mut *lock, TaskMode::empty());

    // Safety: the task is Dormant and the CPU lock is held
    unsafe { Traits::initialize_task_state(cb) };
    // Safety: transition Dormant → Ready
    unsafe { make_ready(lock.borrow_mut(), cb) };

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

pub(crate) fn restart_task<Traits: KernelTraits>(
    id: Id,
    arg: usize,
) -> Result<(), RestartTaskError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let st = cb.st.get(&*lock);
    let entry = match (st, cb.entry.get(&*lock)) {
        (TaskSt::Dormant | TaskSt::Zombie, _) | (_, None) => {
            return Err(BadObjectStateError::BadObjectState.into())
        }
        (_, Some(e)) => e,
    };

    // Tear the task out of whatever it is doing
    match st {
        TaskSt::Ready => {
            if cb.suspend_count.get(&*lock) == 0 {
                let pri = cb.effective_priority.get(&*lock) as usize;
                // Safety: Ready and schedulable implies queued
                unsafe {
                    state
                        .task_ready_queue
                        .remove_task(lock.borrow_mut().into(), cb, pri)
                };
            }
        }
        TaskSt::Waiting => wait::cancel_wait_of_task(lock.borrow_mut(), cb),
        TaskSt::Running => {}
        TaskSt::Dormant | TaskSt::Zombie => unreachable!(),
    }
    mutex::abandon_held_mutexes(lock.borrow_mut(), cb);

    // Reset the execution state
    let pri = cb.created_priority.get(&*lock);
    cb.base_priority.replace(&mut *lock, pri);
    cb.effective_priority.replace(&mut *lock, pri);
    cb.suspend_count.replace(&mut *lock, 0);
    cb.mode.replace(&mut *lock, TaskMode::empty());
    cb.deadline.replace(&mut *lock, None);
    cb.entry.replace(
        &mut *lock,
        Some(TaskEntry {
            entry: entry.entry,
            arg,
        }),
    );

    // Safety: the task was started; its old context will not run again
    unsafe { Traits::discard_task_state(cb) };
    // Safety: the control block is back in a pristine started state
    unsafe { Traits::initialize_task_state(cb) };

    if st == TaskSt::Running {
        if Traits::is_task_context() {
            // Restarting ourselves: requeue, then leave through the
            // dispatcher. The port resumes this task from its fresh context.
            // Safety: transition Running → Ready
            unsafe { make_ready(lock.borrow_mut(), cb) };
            state.running_task.replace(&mut *lock, None);
            forget(lock);
            // Safety: the CPU lock is active and `running_task` is vacated
            unsafe { Traits::exit_and_dispatch(cb) };
        }
        state.running_task.replace(&mut *lock, None);
    }

    // Safety: transition (torn-down) Ready/Running/Waiting → Ready
    unsafe { make_ready(lock.borrow_mut(), cb) };
    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

pub(crate) fn delete_task<Traits: KernelTraits>(id: Id) -> Result<(), DeleteTaskError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let st = cb.st.get(&*lock);
    match st {
        TaskSt::Running if Traits::is_task_context() => {
            // Deleting ourselves is an exit that also frees the slot
            state.task_registry.write(&mut *lock).close(task_index(cb));
            exit_running_task(lock, cb);
        }
        TaskSt::Running => {
            mutex::abandon_held_mutexes(lock.borrow_mut(), cb);
            // Safety: the task will not run again
            unsafe { Traits::discard_task_state(cb) };
            state.running_task.replace(&mut *lock, None);
        }
        TaskSt::Dormant => {}
        TaskSt::Ready => {
            if cb.suspend_count.get(&*lock) == 0 {
                let pri = cb.effective_priority.get(&*lock) as usize;
                // Safety: Ready and schedulable implies queued
                unsafe {
                    state
                        .task_ready_queue
                        .remove_task(lock.borrow_mut().into(), cb, pri)
                };
            }
            mutex::abandon_held_mutexes(lock.borrow_mut(), cb);
            // Safety: the task will not run again
            unsafe { Traits::discard_task_state(cb) };
        }
        TaskSt::Waiting => {
            wait::cancel_wait_of_task(lock.borrow_mut(), cb);
            mutex::abandon_held_mutexes(lock.borrow_mut(), cb);
            // Safety: the task will not run again
            unsafe { Traits::discard_task_state(cb) };
        }
        TaskSt::Zombie => unreachable!(),
    }

    cb.st.replace(&mut *lock, TaskSt::Zombie);
    state.task_registry.write(&mut *lock).close(task_index(cb));

    // Abandoned mutexes may have readied a higher-priority task
    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Terminate the running task, vacate `running_task`, and leave through the
/// dispatcher. Shared by `exit_task` and self-delete.
fn exit_running_task<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    cb: &'static TaskCb<Traits>,
) -> ! {
    mutex::abandon_held_mutexes(lock.borrow_mut(), cb);
    debug_assert_eq!(cb.st.get(&*lock), TaskSt::Running);
    cb.st.replace(&mut *lock, TaskSt::Zombie);
    Traits::state().running_task.replace(&mut *lock, None);
    // The CPU lock stays active through `exit_and_dispatch`
    forget(lock);
    // Safety: the CPU lock is active and `running_task` is vacated
    unsafe { Traits::exit_and_dispatch(cb) }
}

pub(crate) fn exit_current_task<Traits: KernelTraits>(
) -> Result<core::convert::Infallible, ExitTaskError> {
    if !Traits::is_task_context() {
        return Err(BadContextError::BadContext.into());
    }

    let mut lock = if Traits::is_cpu_lock_active() {
        // Safety: the CPU lock is active and we are the kernel
        unsafe { assume_cpu_lock() }
    } else {
        lock_cpu::<Traits>().unwrap()
    };

    let state = Traits::state();
    let cb = state.running_task(lock.borrow_mut()).unwrap();
    state.task_registry.write(&mut *lock).close(task_index(cb));
    exit_running_task(lock, cb)
}

pub(crate) fn suspend_task<Traits: KernelTraits>(id: Id) -> Result<(), SuspendTaskError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    match cb.st.get(&*lock) {
        TaskSt::Dormant | TaskSt::Zombie => Err(BadObjectStateError::BadObjectState.into()),
        TaskSt::Running => {
            debug_assert!(core::ptr::eq(
                cb,
                state.running_task(lock.borrow_mut()).unwrap()
            ));
            *cb.suspend_count.write(&mut *lock) += 1;
            if Traits::is_task_context() {
                // Self-suspension: block in place until something resumes us
                yield_until_running(lock.borrow_mut(), cb);
            } else {
                // Takes effect at the next dispatching opportunity
                unlock_cpu_and_check_preemption(lock);
            }
            Ok(())
        }
        TaskSt::Ready => {
            let was_schedulable = cb.suspend_count.get(&*lock) == 0;
            *cb.suspend_count.write(&mut *lock) += 1;
            if was_schedulable {
                let pri = cb.effective_priority.get(&*lock) as usize;
                // Safety: Ready and schedulable implies queued
                unsafe {
                    state
                        .task_ready_queue
                        .remove_task(lock.borrow_mut().into(), cb, pri)
                };
            }
            Ok(())
        }
        TaskSt::Waiting => {
            *cb.suspend_count.write(&mut *lock) += 1;
            Ok(())
        }
    }
}

pub(crate) fn resume_task<Traits: KernelTraits>(id: Id) -> Result<(), ResumeTaskError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    match cb.st.get(&*lock) {
        TaskSt::Dormant | TaskSt::Zombie => {
            return Err(BadObjectStateError::BadObjectState.into())
        }
        _ => {}
    }
    let count = cb.suspend_count.get(&*lock);
    if count == 0 {
        return Err(BadObjectStateError::BadObjectState.into());
    }
    cb.suspend_count.replace(&mut *lock, count - 1);

    if count == 1 && cb.st.get(&*lock) == TaskSt::Ready {
        // Safety: the task is Ready, schedulable again, and unqueued
        unsafe {
            state
                .task_ready_queue
                .push_back_task(lock.borrow_mut().into(), cb)
        };
        unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

/// Commit a new effective priority and requeue the task accordingly.
/// Returns `true` if the priority actually changed.
///
/// `prepend` places a Ready task ahead of its new equals instead of behind
/// them; priority-inheritance boosts use it so the boosted owner runs before
/// the tasks it now ties with.
pub(crate) fn update_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    new: Priority,
    prepend: bool,
) -> bool {
    let old = task_cb.effective_priority.get(&*lock);
    if old == new {
        return false;
    }
    task_cb.effective_priority.replace(&mut *lock, new);

    match task_cb.st.get(&*lock) {
        TaskSt::Ready if task_cb.suspend_count.get(&*lock) == 0 => {
            // Safety: the task is queued under `old`
            unsafe {
                Traits::state().task_ready_queue.reorder_task(
                    lock.into(),
                    task_cb,
                    new as usize,
                    old as usize,
                    prepend,
                )
            };
        }
        TaskSt::Waiting => wait::reorder_wait_of_task(lock, task_cb),
        _ => {}
    }
    true
}

pub(crate) fn set_task_priority<Traits: KernelTraits>(
    id: Id,
    priority: Priority,
) -> Result<(), SetTaskPriorityError> {
    if priority as usize >= PRIORITY_LEVELS {
        return Err(BadParamError::BadParam.into());
    }
    let mut lock = lock_cpu::<Traits>()?;
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let st = cb.st.get(&*lock);
    if matches!(st, TaskSt::Dormant | TaskSt::Zombie) {
        return Err(BadObjectStateError::BadObjectState.into());
    }
    if cb.base_priority.get(&*lock) == priority {
        return Ok(());
    }
    if mutex::violates_ceiling(&lock.borrow_mut(), cb, priority) {
        return Err(BadParamError::BadParam.into());
    }

    cb.base_priority.replace(&mut *lock, priority);
    mutex::reapply_task_priority(lock.borrow_mut(), cb);

    if matches!(st, TaskSt::Running | TaskSt::Ready) {
        unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

pub(crate) fn task_priority<Traits: KernelTraits>(id: Id) -> Result<Priority, GetTaskPriorityError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    if matches!(cb.st.get(&*lock), TaskSt::Dormant | TaskSt::Zombie) {
        return Err(BadObjectStateError::BadObjectState.into());
    }
    Ok(cb.base_priority.get(&*lock))
}

pub(crate) fn task_effective_priority<Traits: KernelTraits>(
    id: Id,
) -> Result<Priority, GetTaskPriorityError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    if matches!(cb.st.get(&*lock), TaskSt::Dormant | TaskSt::Zombie) {
        return Err(BadObjectStateError::BadObjectState.into());
    }
    Ok(cb.effective_priority.get(&*lock))
}

pub(crate) fn set_task_deadline<Traits: KernelTraits>(
    id: Id,
    deadline: Option<Time>,
) -> Result<(), SetTaskDeadlineError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = task_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let st = cb.st.get(&*lock);
    if matches!(st, TaskSt::Dormant | TaskSt::Zombie) {
        return Err(BadObjectStateError::BadObjectState.into());
    }
    cb.deadline.replace(&mut *lock, deadline);

    if st == TaskSt::Ready && cb.suspend_count.get(&*lock) == 0 {
        // Safety: Ready and schedulable implies queued
        unsafe {
            Traits::state()
                .task_ready_queue
                .reorder_task_deadline(lock.borrow_mut().into(), cb)
        };
    }
    if matches!(st, TaskSt::Running | TaskSt::Ready) {
        unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

pub(crate) fn change_current_task_mode<Traits: KernelTraits>(
    mode: TaskMode,
) -> Result<TaskMode, ChangeTaskModeError> {
    if !Traits::is_task_context() {
        return Err(BadContextError::BadContext.into());
    }
    let mut lock = lock_cpu::<Traits>()?;
    let cb = Traits::state().running_task(lock.borrow_mut()).unwrap();
    let old = cb.mode.replace(&mut *lock, mode);

    if old.contains(TaskMode::NO_PREEMPT) && !mode.contains(TaskMode::NO_PREEMPT) {
        check_deferred_dispatch(lock);
    }
    Ok(old)
}

pub(crate) fn wake_after<Traits: KernelTraits>(ticks: Ticks) -> Result<(), SleepError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();

    if ticks == 0 {
        // Plain yield: go behind our equals
        let cb = state.running_task(lock.borrow_mut()).unwrap();
        cb.st.replace(&mut *lock, TaskSt::Ready);
        // Safety: the task is Ready, schedulable, and unqueued
        unsafe {
            state
                .task_ready_queue
                .push_back_task(lock.borrow_mut().into(), cb)
        };
        state.running_task.replace(&mut *lock, None);
        yield_until_running(lock.borrow_mut(), cb);
        return Ok(());
    }

    match wait::wait_no_queue_timeout(lock.borrow_mut(), ticks) {
        // Expiry is how a sleep normally ends
        Ok(()) | Err(WaitTimeoutError::Timeout) => Ok(()),
        Err(WaitTimeoutError::Interrupted) => Err(SleepError::Interrupted),
        Err(WaitTimeoutError::Deleted) => Err(SleepError::Deleted),
    }
}

/// The current value of the kernel tick counter.
pub(crate) fn system_time<Traits: KernelTraits>() -> Result<Time, crate::error::TimeError> {
    let mut lock = lock_cpu::<Traits>()?;
    let t = timeout::current_time(&lock.borrow_mut());
    Ok(t)
}
