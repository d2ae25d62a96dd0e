//! Barriers.
//!
//! An automatic barrier trips itself when the configured number of tasks has
//! arrived; the tripping arrival does not block. A manual barrier only
//! releases its waiters when `release_barrier` is called.
use core::fmt;

use crate::{
    cfg::Ticks,
    error::{
        BadIdError, BadParamError, CreateBarrierError, DeleteBarrierError, IdentError,
        ReleaseBarrierError, WaitBarrierError, WaitBarrierTimeoutError, WaitTimeoutError,
    },
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{Id, Name},
    state, task,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port,
};

/// When a barrier releases its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierRelease {
    /// Trips by itself once this many tasks have arrived.
    Automatic(u32),
    /// Trips only on an explicit [`release_barrier`] call.
    Manual,
}

impl Init for BarrierRelease {
    const INIT: Self = Self::Manual;
}

/// A barrier control block.
pub(crate) struct BarrierCb<Traits: Port> {
    release: CpuLockCell<Traits, BarrierRelease>,
    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Init for BarrierCb<Traits> {
    const INIT: Self = Self {
        release: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for BarrierCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BarrierCb")
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

fn barrier_cb_by_id<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    id: Id,
) -> Result<&'static BarrierCb<Traits>, BadIdError> {
    let i = Traits::state().barrier_registry.read(&**lock).get(id)?;
    Ok(&Traits::state().barriers[i])
}

pub(crate) fn create_barrier<Traits: KernelTraits>(
    name: Name,
    release: BarrierRelease,
) -> Result<Id, CreateBarrierError> {
    if release == BarrierRelease::Automatic(0) {
        return Err(BadParamError::BadParam.into());
    }
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let (i, id) = state.barrier_registry.write(&mut *lock).allocate(name)?;
    let cb = &state.barriers[i];

    cb.release.replace(&mut *lock, release);
    Ok(id)
}

pub(crate) fn ident_barrier<Traits: KernelTraits>(name: Name) -> Result<Id, IdentError> {
    let lock = lock_cpu::<Traits>()?;
    let id = Traits::state().barrier_registry.read(&*lock).ident(name)?;
    Ok(id)
}

/// Whether this arrival is the one that trips an automatic barrier.
fn arrival_trips<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    cb: &'static BarrierCb<Traits>,
) -> bool {
    match cb.release.get(&**lock) {
        BarrierRelease::Automatic(n) => cb.wait_queue.waiter_count(lock) + 1 >= n as usize,
        BarrierRelease::Manual => false,
    }
}

pub(crate) fn wait_barrier<Traits: KernelTraits>(id: Id) -> Result<(), WaitBarrierError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = barrier_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if arrival_trips(&lock.borrow_mut(), cb) {
        cb.wait_queue.wake_up_all(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }
    cb.wait_queue.wait(lock.borrow_mut(), WaitPayload::Barrier)?;
    Ok(())
}

pub(crate) fn wait_barrier_timeout<Traits: KernelTraits>(
    id: Id,
    delay: Ticks,
) -> Result<(), WaitBarrierTimeoutError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = barrier_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if arrival_trips(&lock.borrow_mut(), cb) {
        cb.wait_queue.wake_up_all(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }
    cb.wait_queue
        .wait_timeout(lock.borrow_mut(), WaitPayload::Barrier, delay)?;
    Ok(())
}

/// Release every task waiting at the barrier. Returns how many were
/// released.
pub(crate) fn release_barrier<Traits: KernelTraits>(
    id: Id,
) -> Result<usize, ReleaseBarrierError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = barrier_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let n = cb.wait_queue.wake_up_all(lock.borrow_mut());
    task::unlock_cpu_and_check_preemption(lock);
    Ok(n)
}

pub(crate) fn delete_barrier<Traits: KernelTraits>(id: Id) -> Result<(), DeleteBarrierError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let i = state.barrier_registry.read(&*lock).get(id)?;
    let cb = &state.barriers[i];

    state.barrier_registry.write(&mut *lock).close(i);
    cb.wait_queue
        .flush_all(lock.borrow_mut(), WaitTimeoutError::Deleted);

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}
