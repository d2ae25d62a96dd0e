//! A static real-time kernel core: priority-scheduled tasks, tick-driven
//! timeouts, and a small family of synchronization objects (mutexes with
//! priority protocols, counting semaphores, message queues, barriers), all
//! addressed through generation-checked 32-bit identifiers.
//!
//! Everything is statically allocated. The kernel proper is generic over a
//! `Traits` type that ties together the port (the hardware-facing layer),
//! the chosen ready-queue implementation, and the `static` holding the
//! kernel's state. A port instantiates the kernel by implementing
//! [`KernelCfg1`], [`Port`], and [`KernelTraits`] on its trait type and
//! driving [`PortToKernel`] from its startup code, dispatcher, and timer.
//!
//! Mutual exclusion is provided by a single global *CPU lock* (interrupt
//! disable on a real port). Every kernel data structure is guarded by a
//! token tied to it, so access without holding the lock does not compile.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::{convert::Infallible, fmt, marker::PhantomData, mem::forget};

mod barrier;
pub mod cfg;
pub mod error;
mod klock;
mod msgqueue;
mod mutex;
mod object;
mod semaphore;
mod state;
mod task;
mod timeout;
mod utils;
mod wait;

#[cfg(test)]
mod test_port;

#[cfg(test)]
mod scenarios;

pub use self::{
    barrier::BarrierRelease,
    error::ResultCode,
    mutex::{MutexProtocol, Recursion},
    object::{build_name, Id, Name, ObjectClass, LOCAL_NODE},
    state::KernelState,
    task::{
        readyqueue::{BitmapQueue, Ctx, EdfQueue, Queue, ScheduleDecision},
        TaskCb, TaskMode, TaskSt,
    },
    utils::Init,
    wait::QueueOrder,
};

use crate::{
    cfg::{Priority, Ticks, Time},
    error::*,
    klock::assume_cpu_lock,
    object::Name as ObjName,
};

/// The first step of kernel instantiation: the choice of ready-queue
/// implementation.
///
/// This is separate from [`Port`] to break a type cycle: the ready queue is
/// generic over the whole trait type, which also carries the port's per-task
/// state.
///
/// # Safety
///
/// The associated ready queue must be used by exactly one kernel instance.
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The ready-queue implementation backing the scheduler, normally
    /// [`BitmapQueue`] or [`EdfQueue`].
    type TaskReadyQueue: Queue<Self> + Init + 'static;
}

/// The interface the kernel requires from the hardware-facing layer.
///
/// # Safety
///
/// The implementation must uphold each method's contract; the kernel's
/// soundness rests on them.
pub unsafe trait Port: KernelCfg1 {
    /// Per-task state owned by the port, e.g. the saved execution context.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// Try to activate the CPU lock. Returns `false` if it was already
    /// active.
    ///
    /// # Safety
    ///
    /// Only the kernel may call this.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Activate the CPU lock.
    ///
    /// # Safety
    ///
    /// The CPU lock must be inactive. Only the kernel may call this.
    unsafe fn enter_cpu_lock();

    /// Deactivate the CPU lock.
    ///
    /// # Safety
    ///
    /// The CPU lock must be active. Only the kernel may call this.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is a task context (as opposed to the
    /// startup, dispatcher, or interrupt context).
    fn is_task_context() -> bool;

    fn is_interrupt_context() -> bool;

    /// Trigger a dispatch: the port must (eventually) call
    /// [`PortToKernel::choose_running_task`] and resume whatever
    /// `running_task` then designates.
    ///
    /// # Safety
    ///
    /// The CPU lock must be inactive.
    unsafe fn yield_cpu();

    /// Dispatch the first task after boot. Never returns.
    ///
    /// # Safety
    ///
    /// The CPU lock must be active, and `choose_running_task` must have run.
    unsafe fn dispatch_first_task() -> !;

    /// Construct a fresh execution context for `task`, using the entry point
    /// recorded in its control block.
    ///
    /// # Safety
    ///
    /// The CPU lock must be active. The task must not have a live context.
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Discard `task`'s execution context.
    ///
    /// # Safety
    ///
    /// The CPU lock must be active. The context must never be resumed.
    unsafe fn discard_task_state(task: &'static TaskCb<Self>);

    /// Leave the current task permanently and dispatch the next one. Never
    /// returns.
    ///
    /// # Safety
    ///
    /// The CPU lock must be active and `running_task` already vacated or
    /// redirected.
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !;
}

/// The final step of kernel instantiation: the binding to the `static`
/// holding this instance's [`KernelState`].
///
/// # Safety
///
/// `state` must return the same object on every call, and that object must
/// be used by no other kernel instance.
pub unsafe trait KernelTraits: Port {
    fn state() -> &'static KernelState<Self>;
}

/// The kernel's entry points for the port: startup, dispatching, and the
/// timer. Automatically implemented on every [`KernelTraits`] type.
pub trait PortToKernel {
    /// Finish kernel initialization and dispatch the first task.
    ///
    /// # Safety
    ///
    /// Called exactly once, by the port's startup code, with the CPU lock
    /// active.
    unsafe fn boot() -> !;

    /// Update `running_task` to the task that should run next.
    ///
    /// # Safety
    ///
    /// Called by the port's dispatcher with the CPU lock active.
    unsafe fn choose_running_task();

    /// Advance the kernel's tick counter and fire expired timeouts. Called
    /// by the port's timer driver once per tick, with the CPU lock inactive.
    fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: the CPU lock is active per this function's contract
        let mut lock = unsafe { assume_cpu_lock::<Traits>() };
        task::choose_next_running_task(lock.borrow_mut());
        forget(lock);
        // Safety: the CPU lock is active and a task has been chosen
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: the CPU lock is active per this function's contract
        let mut lock = unsafe { assume_cpu_lock::<Traits>() };
        task::choose_next_running_task(lock.borrow_mut());
        // The port retains the CPU lock through the dispatch
        forget(lock);
    }

    fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// The kernel's directive surface, parameterized by the kernel instance.
///
/// All directives are associated functions; `System` itself is a zero-sized
/// handle.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    // ----------------------------------------------------------------------
    // Time and dispatching

    /// The number of ticks elapsed since boot.
    pub fn time() -> Result<Time, TimeError> {
        task::system_time::<Traits>()
    }

    /// Disable task dispatching. Nests; dispatching resumes when every
    /// disable has been undone by [`Self::enable_dispatch`].
    pub fn disable_dispatch() -> Result<(), DispatchError> {
        state::disable_dispatch::<Traits>()
    }

    /// Undo one [`Self::disable_dispatch`]. Re-enabling runs any preemption
    /// that was deferred in the meantime.
    pub fn enable_dispatch() -> Result<(), DispatchError> {
        state::enable_dispatch::<Traits>()
    }

    // ----------------------------------------------------------------------
    // Tasks

    /// Create a task in the Dormant state.
    pub fn create_task(name: ObjName, priority: Priority) -> Result<Id, CreateTaskError> {
        task::create_task::<Traits>(name, priority)
    }

    /// Find the lowest-indexed task named `name`.
    pub fn ident_task(name: ObjName) -> Result<Id, IdentError> {
        task::ident_task::<Traits>(name)
    }

    /// Start a Dormant task with the given entry point and argument.
    pub fn start_task(id: Id, entry: fn(usize), arg: usize) -> Result<(), StartTaskError> {
        task::start_task::<Traits>(id, entry, arg)
    }

    /// Restart a started task from its entry point with a new argument,
    /// tearing down whatever it was doing. A task may restart itself.
    pub fn restart_task(id: Id, arg: usize) -> Result<(), RestartTaskError> {
        task::restart_task::<Traits>(id, arg)
    }

    /// Delete a task, freeing its identifier. A task may delete itself.
    pub fn delete_task(id: Id) -> Result<(), DeleteTaskError> {
        task::delete_task::<Traits>(id)
    }

    /// Terminate the calling task.
    pub fn exit_task() -> Result<Infallible, ExitTaskError> {
        task::exit_current_task::<Traits>()
    }

    /// Suspend a task. Suspensions nest and stack with blocking waits.
    pub fn suspend_task(id: Id) -> Result<(), SuspendTaskError> {
        task::suspend_task::<Traits>(id)
    }

    /// Undo one suspension of a task.
    pub fn resume_task(id: Id) -> Result<(), ResumeTaskError> {
        task::resume_task::<Traits>(id)
    }

    /// Change a task's base priority.
    pub fn set_task_priority(id: Id, priority: Priority) -> Result<(), SetTaskPriorityError> {
        task::set_task_priority::<Traits>(id, priority)
    }

    /// A task's base priority.
    pub fn task_priority(id: Id) -> Result<Priority, GetTaskPriorityError> {
        task::task_priority::<Traits>(id)
    }

    /// A task's effective priority, including protocol boosts.
    pub fn task_effective_priority(id: Id) -> Result<Priority, GetTaskPriorityError> {
        task::task_effective_priority::<Traits>(id)
    }

    /// Set or clear a task's absolute deadline. Only meaningful under the
    /// [`EdfQueue`] scheduler.
    pub fn set_task_deadline(id: Id, deadline: Option<Time>) -> Result<(), SetTaskDeadlineError> {
        task::set_task_deadline::<Traits>(id, deadline)
    }

    /// Replace the calling task's mode flags, returning the previous mode.
    pub fn change_task_mode(mode: TaskMode) -> Result<TaskMode, ChangeTaskModeError> {
        task::change_current_task_mode::<Traits>(mode)
    }

    /// Put the calling task to sleep for `ticks` ticks. `0` yields the
    /// processor without sleeping.
    pub fn wake_after(ticks: Ticks) -> Result<(), SleepError> {
        task::wake_after::<Traits>(ticks)
    }

    // ----------------------------------------------------------------------
    // Mutexes

    pub fn create_mutex(
        name: ObjName,
        protocol: MutexProtocol,
        recursion: Recursion,
    ) -> Result<Id, CreateMutexError> {
        mutex::create_mutex::<Traits>(name, protocol, recursion)
    }

    pub fn ident_mutex(name: ObjName) -> Result<Id, IdentError> {
        mutex::ident_mutex::<Traits>(name)
    }

    /// Lock a mutex without blocking.
    pub fn try_lock_mutex(id: Id) -> Result<(), TryLockMutexError> {
        mutex::try_lock_mutex::<Traits>(id)
    }

    /// Lock a mutex, blocking until it is available.
    pub fn lock_mutex(id: Id) -> Result<(), LockMutexError> {
        mutex::lock_mutex::<Traits>(id)
    }

    /// Lock a mutex, blocking for at most `delay` ticks.
    pub fn lock_mutex_timeout(id: Id, delay: Ticks) -> Result<(), LockMutexTimeoutError> {
        mutex::lock_mutex_timeout::<Traits>(id, delay)
    }

    pub fn unlock_mutex(id: Id) -> Result<(), UnlockMutexError> {
        mutex::unlock_mutex::<Traits>(id)
    }

    pub fn delete_mutex(id: Id) -> Result<(), DeleteMutexError> {
        mutex::delete_mutex::<Traits>(id)
    }

    // ----------------------------------------------------------------------
    // Semaphores

    pub fn create_semaphore(
        name: ObjName,
        initial: u32,
        max_value: u32,
        order: QueueOrder,
    ) -> Result<Id, CreateSemaphoreError> {
        semaphore::create_semaphore::<Traits>(name, initial, max_value, order)
    }

    pub fn ident_semaphore(name: ObjName) -> Result<Id, IdentError> {
        semaphore::ident_semaphore::<Traits>(name)
    }

    /// Take one permit without blocking.
    pub fn poll_semaphore(id: Id) -> Result<(), PollSemaphoreError> {
        semaphore::poll_semaphore::<Traits>(id)
    }

    /// Take one permit, blocking until one is available.
    pub fn obtain_semaphore(id: Id) -> Result<(), ObtainSemaphoreError> {
        semaphore::obtain_semaphore::<Traits>(id)
    }

    /// Take one permit, blocking for at most `delay` ticks.
    pub fn obtain_semaphore_timeout(
        id: Id,
        delay: Ticks,
    ) -> Result<(), ObtainSemaphoreTimeoutError> {
        semaphore::obtain_semaphore_timeout::<Traits>(id, delay)
    }

    /// Return one permit, or hand it directly to a waiting task.
    pub fn release_semaphore(id: Id) -> Result<(), ReleaseSemaphoreError> {
        semaphore::release_semaphore::<Traits>(id)
    }

    /// The current permit count.
    pub fn semaphore_value(id: Id) -> Result<u32, PollSemaphoreError> {
        semaphore::semaphore_value::<Traits>(id)
    }

    pub fn delete_semaphore(id: Id) -> Result<(), DeleteSemaphoreError> {
        semaphore::delete_semaphore::<Traits>(id)
    }

    // ----------------------------------------------------------------------
    // Message queues

    pub fn create_queue(
        name: ObjName,
        max_messages: usize,
        order: QueueOrder,
    ) -> Result<Id, CreateQueueError> {
        msgqueue::create_queue::<Traits>(name, max_messages, order)
    }

    pub fn ident_queue(name: ObjName) -> Result<Id, IdentError> {
        msgqueue::ident_queue::<Traits>(name)
    }

    /// Send a message without blocking.
    pub fn try_send(id: Id, data: &[u8], priority: u8) -> Result<(), TrySendError> {
        msgqueue::try_send::<Traits>(id, data, priority)
    }

    /// Send a message that jumps to the front of the pending buffer.
    pub fn urgent_send(id: Id, data: &[u8], priority: u8) -> Result<(), TrySendError> {
        msgqueue::urgent_send::<Traits>(id, data, priority)
    }

    /// Send a message, blocking while the queue is full.
    pub fn send(id: Id, data: &[u8], priority: u8) -> Result<(), SendError> {
        msgqueue::send::<Traits>(id, data, priority)
    }

    /// Send a message, blocking for at most `delay` ticks.
    pub fn send_timeout(
        id: Id,
        data: &[u8],
        priority: u8,
        delay: Ticks,
    ) -> Result<(), SendTimeoutError> {
        msgqueue::send_timeout::<Traits>(id, data, priority, delay)
    }

    /// Receive a message without blocking. Returns the number of bytes
    /// copied into `out`.
    pub fn try_receive(id: Id, out: &mut [u8]) -> Result<usize, TryReceiveError> {
        msgqueue::try_receive::<Traits>(id, out)
    }

    /// Receive a message, blocking while the queue is empty.
    pub fn receive(id: Id, out: &mut [u8]) -> Result<usize, ReceiveError> {
        msgqueue::receive::<Traits>(id, out)
    }

    /// Receive a message, blocking for at most `delay` ticks.
    pub fn receive_timeout(
        id: Id,
        out: &mut [u8],
        delay: Ticks,
    ) -> Result<usize, ReceiveTimeoutError> {
        msgqueue::receive_timeout::<Traits>(id, out, delay)
    }

    /// Deliver a message to every task currently blocked in a receive.
    /// Returns how many tasks received it.
    pub fn broadcast(id: Id, data: &[u8], priority: u8) -> Result<usize, BroadcastError> {
        msgqueue::broadcast::<Traits>(id, data, priority)
    }

    pub fn delete_queue(id: Id) -> Result<(), DeleteQueueError> {
        msgqueue::delete_queue::<Traits>(id)
    }

    // ----------------------------------------------------------------------
    // Barriers

    pub fn create_barrier(name: ObjName, release: BarrierRelease) -> Result<Id, CreateBarrierError> {
        barrier::create_barrier::<Traits>(name, release)
    }

    pub fn ident_barrier(name: ObjName) -> Result<Id, IdentError> {
        barrier::ident_barrier::<Traits>(name)
    }

    /// Wait at a barrier until it trips.
    pub fn wait_barrier(id: Id) -> Result<(), WaitBarrierError> {
        barrier::wait_barrier::<Traits>(id)
    }

    /// Wait at a barrier for at most `delay` ticks.
    pub fn wait_barrier_timeout(id: Id, delay: Ticks) -> Result<(), WaitBarrierTimeoutError> {
        barrier::wait_barrier_timeout::<Traits>(id, delay)
    }

    /// Trip a barrier, releasing every waiter. Returns how many were
    /// released.
    pub fn release_barrier(id: Id) -> Result<usize, ReleaseBarrierError> {
        barrier::release_barrier::<Traits>(id)
    }

    pub fn delete_barrier(id: Id) -> Result<(), DeleteBarrierError> {
        barrier::delete_barrier::<Traits>(id)
    }
}
