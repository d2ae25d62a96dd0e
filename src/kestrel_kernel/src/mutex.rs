//! Mutexes with ownership tracking and priority protocols.
//!
//! Each task threads the mutexes it holds onto a singly-linked chain
//! (`TaskCb::last_mutex_held` → `MutexCb::prev_mutex_held`). The chain is
//! what lets priority changes, unlocks, and task deletion recompute the
//! owner's effective priority from everything it still holds.
use core::{fmt, ptr};

use crate::{
    cfg::{Priority, Ticks, PRIORITY_LEVELS},
    error::{
        BadIdError, BadParamError, CreateMutexError, DeleteMutexError, IdentError, LockMutexError,
        LockMutexPrecheckError, LockMutexTimeoutError, TryLockMutexError, UnlockMutexError,
    },
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{Id, Name},
    state, task,
    task::TaskCb,
    utils::Init,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port,
};

/// The priority protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustment. Waiters queue in FIFO order.
    None,
    /// Priority inheritance: the owner runs at the best effective priority
    /// among its waiters.
    Inherit,
    /// Immediate priority ceiling: the owner runs at the ceiling while it
    /// holds the mutex. Locking with a base priority stronger than the
    /// ceiling is an error.
    Ceiling(Priority),
}

impl Init for MutexProtocol {
    const INIT: Self = Self::None;
}

/// Whether a mutex may be locked again by the task that already owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    /// A nested lock by the owner fails with `WouldDeadlock`.
    Refused,
    /// Nested locks are counted and undone by matching unlocks.
    Allowed,
}

impl Init for Recursion {
    const INIT: Self = Self::Refused;
}

/// A mutex control block.
pub(crate) struct MutexCb<Traits: Port> {
    pub(crate) wait_queue: WaitQueue<Traits>,
    protocol: CpuLockCell<Traits, MutexProtocol>,
    recursion: CpuLockCell<Traits, Recursion>,
    owner: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    /// Lock nesting depth. Non-zero iff `owner` is `Some`.
    nest_count: CpuLockCell<Traits, u32>,
    /// The next link in the owner's held-mutex chain.
    prev_mutex_held: CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,
}

impl<Traits: Port> Init for MutexCb<Traits> {
    const INIT: Self = Self {
        wait_queue: Init::INIT,
        protocol: Init::INIT,
        recursion: Init::INIT,
        owner: CpuLockCell::new(None),
        nest_count: Init::INIT,
        prev_mutex_held: CpuLockCell::new(None),
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("protocol", &self.protocol)
            .field("nest_count", &self.nest_count)
            .finish_non_exhaustive()
    }
}

fn mutex_cb_by_id<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    id: Id,
) -> Result<&'static MutexCb<Traits>, BadIdError> {
    let i = Traits::state().mutex_registry.read(&**lock).get(id)?;
    Ok(&Traits::state().mutexes[i])
}

// ---------------------------------------------------------------------------
// Priority bookkeeping

/// Whether setting `task`'s base priority to `new_pri` would be stronger
/// than the ceiling of any ceiling mutex it holds or waits for.
pub(crate) fn violates_ceiling<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    new_pri: Priority,
) -> bool {
    let mut held = task.last_mutex_held.get(&**lock);
    while let Some(cb) = held {
        if let MutexProtocol::Ceiling(c) = cb.protocol.get(&**lock) {
            if new_pri < c {
                return true;
            }
        }
        held = cb.prev_mutex_held.get(&**lock);
    }
    if let WaitPayload::Mutex(cb) = task.wait.payload.get(&**lock) {
        if task.st.get(&**lock) == task::TaskSt::Waiting {
            if let MutexProtocol::Ceiling(c) = cb.protocol.get(&**lock) {
                if new_pri < c {
                    return true;
                }
            }
        }
    }
    false
}

/// `task`'s effective priority as implied by its base priority and the
/// mutexes it currently holds.
fn evaluate_task_priority<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) -> Priority {
    let mut pri = task.base_priority.get(&**lock);
    let mut held = task.last_mutex_held.get(&**lock);
    while let Some(cb) = held {
        match cb.protocol.get(&**lock) {
            MutexProtocol::None => {}
            MutexProtocol::Inherit => {
                // The queue is priority-ordered, so the head is the best
                if let Some(waiter) = cb.wait_queue.first_waiting_task(lock) {
                    pri = pri.min(waiter.effective_priority.get(&**lock));
                }
            }
            MutexProtocol::Ceiling(c) => pri = pri.min(c),
        }
        held = cb.prev_mutex_held.get(&**lock);
    }
    pri
}

/// Recompute `task`'s effective priority and propagate the change down the
/// blocking chain: if `task` is itself blocked on an inheritance mutex, its
/// owner may have to change too.
pub(crate) fn reapply_task_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let new = evaluate_task_priority(&lock, task);
    if !task::update_effective_priority(lock.borrow_mut(), task, new, false) {
        return;
    }
    if task.st.get(&*lock) == task::TaskSt::Waiting {
        if let WaitPayload::Mutex(next) = task.wait.payload.get(&*lock) {
            reevaluate_owner_priority(lock, next);
        }
    }
}

/// Recompute the owner's effective priority after `mutex_cb`'s wait queue
/// changed. Only inheritance mutexes couple the two.
pub(crate) fn reevaluate_owner_priority<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if mutex_cb.protocol.get(&*lock) != MutexProtocol::Inherit {
        return;
    }
    if let Some(owner) = mutex_cb.owner.get(&*lock) {
        reapply_task_priority(lock, owner);
    }
}

/// Raise every task in the blocking chain starting at `mutex_cb`'s owner to
/// at least `pri`. Used when a task is about to enqueue on an inheritance
/// mutex; once it is queued, the queue-based recomputation takes over.
fn boost_owner_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    pri: Priority,
) {
    let mut cur = mutex_cb;
    loop {
        if cur.protocol.get(&*lock) != MutexProtocol::Inherit {
            break;
        }
        let owner = match cur.owner.get(&*lock) {
            Some(owner) if owner.effective_priority.get(&*lock) > pri => owner,
            _ => break,
        };
        // A boost puts the owner ahead of the tasks it now ties with
        task::update_effective_priority(lock.borrow_mut(), owner, pri, true);
        if owner.st.get(&*lock) != task::TaskSt::Waiting {
            break;
        }
        match owner.wait.payload.get(&*lock) {
            WaitPayload::Mutex(next) => cur = next,
            _ => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Ownership transfer

/// Record `task` as the owner of `mutex_cb` and push the mutex onto the
/// task's held chain.
fn grant_ownership<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
) {
    debug_assert!(mutex_cb.owner.get(&*lock).is_none());
    mutex_cb.owner.replace(&mut *lock, Some(task));
    mutex_cb.nest_count.replace(&mut *lock, 1);
    let chain = task.last_mutex_held.get(&*lock);
    mutex_cb.prev_mutex_held.replace(&mut *lock, chain);
    task.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    // A ceiling boost, or inheritance from the remaining waiters
    reapply_task_priority(lock, task);
}

/// Unlink `mutex_cb` from `task`'s held chain.
fn release_ownership<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
) {
    let mut cur = task.last_mutex_held.get(&**lock);
    if let Some(head) = cur {
        if ptr::eq(head, mutex_cb) {
            let rest = mutex_cb.prev_mutex_held.get(&**lock);
            task.last_mutex_held.replace(&mut **lock, rest);
        } else {
            while let Some(cb) = cur {
                let prev = cb.prev_mutex_held.get(&**lock);
                if let Some(p) = prev {
                    if ptr::eq(p, mutex_cb) {
                        let rest = mutex_cb.prev_mutex_held.get(&**lock);
                        cb.prev_mutex_held.replace(&mut **lock, rest);
                        break;
                    }
                }
                cur = prev;
            }
        }
    }
    mutex_cb.prev_mutex_held.replace(&mut **lock, None);
    mutex_cb.owner.replace(&mut **lock, None);
    mutex_cb.nest_count.replace(&mut **lock, 0);
}

/// Hand the now-unowned `mutex_cb` to its frontmost waiter, if any.
fn transfer_to_next_waiter<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if let Some(next) = mutex_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        // The woken task cannot run before we release the CPU lock, so it
        // observes a fully transferred mutex
        grant_ownership(lock, mutex_cb, next);
    }
}

/// Release every mutex `task` holds, handing each to its next waiter. Used
/// when the task exits or is deleted or restarted.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    while let Some(mutex_cb) = task.last_mutex_held.get(&*lock) {
        release_ownership(&mut lock, mutex_cb, task);
        transfer_to_next_waiter(lock.borrow_mut(), mutex_cb);
    }
}

// ---------------------------------------------------------------------------
// Directives

pub(crate) fn create_mutex<Traits: KernelTraits>(
    name: Name,
    protocol: MutexProtocol,
    recursion: Recursion,
) -> Result<Id, CreateMutexError> {
    if let MutexProtocol::Ceiling(c) = protocol {
        if c as usize >= PRIORITY_LEVELS {
            return Err(BadParamError::BadParam.into());
        }
    }
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let (i, id) = state.mutex_registry.write(&mut *lock).allocate(name)?;
    let cb = &state.mutexes[i];

    cb.protocol.replace(&mut *lock, protocol);
    cb.recursion.replace(&mut *lock, recursion);
    cb.owner.replace(&mut *lock, None);
    cb.nest_count.replace(&mut *lock, 0);
    cb.prev_mutex_held.replace(&mut *lock, None);
    let order = match protocol {
        MutexProtocol::None => QueueOrder::Fifo,
        MutexProtocol::Inherit | MutexProtocol::Ceiling(_) => QueueOrder::TaskPriority,
    };
    {
        let mut token = lock.borrow_mut();
        cb.wait_queue.set_order(&mut token, order);
    }
    Ok(id)
}

pub(crate) fn ident_mutex<Traits: KernelTraits>(name: Name) -> Result<Id, IdentError> {
    let lock = lock_cpu::<Traits>()?;
    let id = Traits::state().mutex_registry.read(&*lock).ident(name)?;
    Ok(id)
}

/// Try to acquire without blocking. `Ok(true)` means acquired (or nested),
/// `Ok(false)` means owned by someone else.
fn lock_precheck<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
) -> Result<bool, LockMutexPrecheckError> {
    if let MutexProtocol::Ceiling(c) = cb.protocol.get(&*lock) {
        if task.base_priority.get(&*lock) < c {
            return Err(LockMutexPrecheckError::BadParam);
        }
    }

    match cb.owner.get(&*lock) {
        None => {
            grant_ownership(lock, cb, task);
            Ok(true)
        }
        Some(owner) if ptr::eq(owner, task) => match cb.recursion.get(&*lock) {
            Recursion::Allowed => {
                *cb.nest_count.write(&mut *lock) += 1;
                Ok(true)
            }
            Recursion::Refused => Err(LockMutexPrecheckError::WouldDeadlock),
        },
        Some(_) => Ok(false),
    }
}

pub(crate) fn try_lock_mutex<Traits: KernelTraits>(id: Id) -> Result<(), TryLockMutexError> {
    state::expect_task_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = mutex_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if lock_precheck(lock.borrow_mut(), cb, task)? {
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    } else {
        Err(TryLockMutexError::Unsatisfied)
    }
}

pub(crate) fn lock_mutex<Traits: KernelTraits>(id: Id) -> Result<(), LockMutexError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = mutex_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if !lock_precheck(lock.borrow_mut(), cb, task)? {
        if cb.protocol.get(&*lock) == MutexProtocol::Inherit {
            let pri = task.effective_priority.get(&*lock);
            boost_owner_chain(lock.borrow_mut(), cb, pri);
        }
        // Ownership is granted by the unlocker before we are woken
        cb.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(cb))?;
        debug_assert!(matches!(cb.owner.get(&*lock), Some(o) if ptr::eq(o, task)));
    }
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

pub(crate) fn lock_mutex_timeout<Traits: KernelTraits>(
    id: Id,
    delay: Ticks,
) -> Result<(), LockMutexTimeoutError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = mutex_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if !lock_precheck(lock.borrow_mut(), cb, task)? {
        if cb.protocol.get(&*lock) == MutexProtocol::Inherit {
            let pri = task.effective_priority.get(&*lock);
            boost_owner_chain(lock.borrow_mut(), cb, pri);
        }
        cb.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Mutex(cb), delay)?;
        debug_assert!(matches!(cb.owner.get(&*lock), Some(o) if ptr::eq(o, task)));
    }
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

pub(crate) fn unlock_mutex<Traits: KernelTraits>(id: Id) -> Result<(), UnlockMutexError> {
    state::expect_task_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = mutex_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    match cb.owner.get(&*lock) {
        Some(owner) if ptr::eq(owner, task) => {}
        _ => return Err(UnlockMutexError::NotOwner),
    }

    let nest = cb.nest_count.get(&*lock);
    if nest > 1 {
        cb.nest_count.replace(&mut *lock, nest - 1);
        return Ok(());
    }

    release_ownership(&mut lock.borrow_mut(), cb, task);
    // Shed the ceiling or inherited boost this mutex contributed
    reapply_task_priority(lock.borrow_mut(), task);
    transfer_to_next_waiter(lock.borrow_mut(), cb);

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

pub(crate) fn delete_mutex<Traits: KernelTraits>(id: Id) -> Result<(), DeleteMutexError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let i = state.mutex_registry.read(&*lock).get(id)?;
    let cb = &state.mutexes[i];

    if cb.owner.get(&*lock).is_some() {
        return Err(DeleteMutexError::Busy);
    }
    // Without an owner there can be no waiters
    debug_assert!(cb.wait_queue.is_empty(&lock.borrow_mut()));

    state.mutex_registry.write(&mut *lock).close(i);
    Ok(())
}
