//! The kernel's global state and calling-context checks.
use core::fmt;

use crate::{
    barrier::BarrierCb,
    cfg::{
        BARRIER_CAPACITY, MSG_QUEUE_CAPACITY, MUTEX_CAPACITY, SEMAPHORE_CAPACITY, TASK_CAPACITY,
    },
    error::{BadContextError, DispatchError},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    msgqueue::QueueCb,
    mutex::MutexCb,
    object::{ObjectClass, Registry},
    semaphore::SemaphoreCb,
    task,
    task::TaskCb,
    timeout::TimeoutGlobals,
    utils::Init,
    KernelTraits,
};

/// The whole of the kernel's mutable state, instantiated once per `Traits`
/// as a `static` and reached through [`KernelTraits::state`].
pub struct KernelState<Traits: KernelTraits> {
    pub(crate) running_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    pub(crate) task_ready_queue: Traits::TaskReadyQueue,

    /// Nesting depth of `disable_dispatch`.
    pub(crate) dispatch_disable_depth: CpuLockCell<Traits, u32>,
    /// A preemption check arrived while dispatching was disabled.
    pub(crate) dispatch_pending: CpuLockCell<Traits, bool>,

    pub(crate) timeouts: TimeoutGlobals<Traits>,

    pub(crate) task_registry: CpuLockCell<Traits, Registry<TASK_CAPACITY>>,
    pub(crate) tasks: [TaskCb<Traits>; TASK_CAPACITY],

    pub(crate) mutex_registry: CpuLockCell<Traits, Registry<MUTEX_CAPACITY>>,
    pub(crate) mutexes: [MutexCb<Traits>; MUTEX_CAPACITY],

    pub(crate) semaphore_registry: CpuLockCell<Traits, Registry<SEMAPHORE_CAPACITY>>,
    pub(crate) semaphores: [SemaphoreCb<Traits>; SEMAPHORE_CAPACITY],

    pub(crate) queue_registry: CpuLockCell<Traits, Registry<MSG_QUEUE_CAPACITY>>,
    pub(crate) msg_queues: [QueueCb<Traits>; MSG_QUEUE_CAPACITY],

    pub(crate) barrier_registry: CpuLockCell<Traits, Registry<BARRIER_CAPACITY>>,
    pub(crate) barriers: [BarrierCb<Traits>; BARRIER_CAPACITY],
}

impl<Traits: KernelTraits> Init for KernelState<Traits> {
    const INIT: Self = Self {
        running_task: CpuLockCell::new(None),
        task_ready_queue: Init::INIT,
        dispatch_disable_depth: Init::INIT,
        dispatch_pending: Init::INIT,
        timeouts: Init::INIT,
        task_registry: CpuLockCell::new(Registry::new(ObjectClass::Task)),
        tasks: Init::INIT,
        mutex_registry: CpuLockCell::new(Registry::new(ObjectClass::Mutex)),
        mutexes: Init::INIT,
        semaphore_registry: CpuLockCell::new(Registry::new(ObjectClass::Semaphore)),
        semaphores: Init::INIT,
        queue_registry: CpuLockCell::new(Registry::new(ObjectClass::MessageQueue)),
        msg_queues: Init::INIT,
        barrier_registry: CpuLockCell::new(Registry::new(ObjectClass::Barrier)),
        barriers: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("running_task", &self.running_task)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> KernelState<Traits> {
    /// The task in the Running state, if any. `None` while the idle loop has
    /// the processor.
    pub(crate) fn running_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.running_task.get(&*lock)
    }
}

/// Fail with `BadContext` unless called from a task context.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        return Err(BadContextError::BadContext);
    }
    Ok(())
}

/// Fail with `BadContext` unless the calling context may block: a task
/// context with dispatching enabled.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    expect_task_context::<Traits>()?;
    let lock = lock_cpu::<Traits>()?;
    if *Traits::state().dispatch_disable_depth.read(&*lock) > 0 {
        // Blocking would leave no way to ever dispatch another task
        return Err(BadContextError::BadContext);
    }
    Ok(())
}

/// Disable task dispatching. Nests.
pub(crate) fn disable_dispatch<Traits: KernelTraits>() -> Result<(), DispatchError> {
    expect_task_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    *Traits::state().dispatch_disable_depth.write(&mut *lock) += 1;
    Ok(())
}

/// Re-enable task dispatching. When the outermost disable is undone, a
/// deferred preemption check runs.
pub(crate) fn enable_dispatch<Traits: KernelTraits>() -> Result<(), DispatchError> {
    expect_task_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let depth = state.dispatch_disable_depth.get(&*lock);
    if depth == 0 {
        return Err(DispatchError::BadContext);
    }
    state.dispatch_disable_depth.replace(&mut *lock, depth - 1);
    if depth == 1 {
        task::check_deferred_dispatch(lock);
    }
    Ok(())
}
