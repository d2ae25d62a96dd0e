//! Counting semaphores.
//!
//! A release while tasks are waiting hands the permit directly to the
//! frontmost waiter; the count never ticks up and back down, so a
//! lower-priority poller can never slip in between.
use core::fmt;

use crate::{
    cfg::Ticks,
    error::{
        BadIdError, BadParamError, CreateSemaphoreError, DeleteSemaphoreError, IdentError,
        ObtainSemaphoreError, ObtainSemaphoreTimeoutError, PollSemaphoreError,
        ReleaseSemaphoreError, WaitTimeoutError,
    },
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{Id, Name},
    state, task,
    utils::Init,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port,
};

/// A semaphore control block.
pub(crate) struct SemaphoreCb<Traits: Port> {
    value: CpuLockCell<Traits, u32>,
    max_value: CpuLockCell<Traits, u32>,
    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        value: Init::INIT,
        max_value: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .finish_non_exhaustive()
    }
}

fn semaphore_cb_by_id<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    id: Id,
) -> Result<&'static SemaphoreCb<Traits>, BadIdError> {
    let i = Traits::state().semaphore_registry.read(&**lock).get(id)?;
    Ok(&Traits::state().semaphores[i])
}

pub(crate) fn create_semaphore<Traits: KernelTraits>(
    name: Name,
    initial: u32,
    max_value: u32,
    order: QueueOrder,
) -> Result<Id, CreateSemaphoreError> {
    if max_value == 0 || initial > max_value {
        return Err(BadParamError::BadParam.into());
    }
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let (i, id) = state.semaphore_registry.write(&mut *lock).allocate(name)?;
    let cb = &state.semaphores[i];

    cb.value.replace(&mut *lock, initial);
    cb.max_value.replace(&mut *lock, max_value);
    {
        let mut token = lock.borrow_mut();
        cb.wait_queue.set_order(&mut token, order);
    }
    Ok(id)
}

pub(crate) fn ident_semaphore<Traits: KernelTraits>(name: Name) -> Result<Id, IdentError> {
    let lock = lock_cpu::<Traits>()?;
    let id = Traits::state()
        .semaphore_registry
        .read(&*lock)
        .ident(name)?;
    Ok(id)
}

pub(crate) fn poll_semaphore<Traits: KernelTraits>(id: Id) -> Result<(), PollSemaphoreError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = semaphore_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let value = cb.value.get(&*lock);
    if value == 0 {
        return Err(PollSemaphoreError::Unsatisfied);
    }
    cb.value.replace(&mut *lock, value - 1);
    Ok(())
}

pub(crate) fn obtain_semaphore<Traits: KernelTraits>(id: Id) -> Result<(), ObtainSemaphoreError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = semaphore_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let value = cb.value.get(&*lock);
    if value > 0 {
        cb.value.replace(&mut *lock, value - 1);
        drop(lock);
        return Ok(());
    }
    cb.wait_queue
        .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;
    Ok(())
}

pub(crate) fn obtain_semaphore_timeout<Traits: KernelTraits>(
    id: Id,
    delay: Ticks,
) -> Result<(), ObtainSemaphoreTimeoutError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = semaphore_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let value = cb.value.get(&*lock);
    if value > 0 {
        cb.value.replace(&mut *lock, value - 1);
        drop(lock);
        return Ok(());
    }
    cb.wait_queue
        .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, delay)?;
    Ok(())
}

pub(crate) fn release_semaphore<Traits: KernelTraits>(
    id: Id,
) -> Result<(), ReleaseSemaphoreError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = semaphore_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if cb.wait_queue.wake_up_one(lock.borrow_mut()).is_some() {
        // Direct hand-off; the count stays untouched
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    let value = cb.value.get(&*lock);
    if value >= cb.max_value.get(&*lock) {
        return Err(ReleaseSemaphoreError::Overflow);
    }
    cb.value.replace(&mut *lock, value + 1);
    Ok(())
}

/// The current semaphore count.
pub(crate) fn semaphore_value<Traits: KernelTraits>(id: Id) -> Result<u32, PollSemaphoreError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = semaphore_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    Ok(cb.value.get(&*lock))
}

pub(crate) fn delete_semaphore<Traits: KernelTraits>(id: Id) -> Result<(), DeleteSemaphoreError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let i = state.semaphore_registry.read(&*lock).get(id)?;
    let cb = &state.semaphores[i];

    state.semaphore_registry.write(&mut *lock).close(i);
    cb.wait_queue
        .flush_all(lock.borrow_mut(), WaitTimeoutError::Deleted);

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}
