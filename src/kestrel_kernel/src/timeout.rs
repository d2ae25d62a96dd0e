//! Tick-driven timeouts.
//!
//! Registered timeouts form a *delta list*: an expiry-ordered sequence in
//! which every node stores the number of ticks between its own expiry and its
//! predecessor's (the head's delta counts from the current tick). A timer
//! tick therefore only ever touches the head node. Nodes expiring on the same
//! tick fire in registration order.
//!
//! Timeout nodes are stack-allocated by the waiting task and pinned. A node
//! must be unlinked from the delta list before it is dropped; [`TimeoutGuard`]
//! does this on unwind, and [`Timeout::drop`] aborts if a linked node is
//! dropped anyway.
use arrayvec::ArrayVec;
use core::{fmt, marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::{
    cfg::{Ticks, Time, TIMEOUT_CAPACITY},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task,
    utils::Init,
    KernelTraits, Port,
};

pub(crate) struct TimeoutPropTag<Traits>(Traits);

/// The token that protects the per-node properties of [`Timeout`].
///
/// Protecting them with the CPU lock token alone would not work: walking the
/// delta list requires borrowing the list (stored in a [`CpuLockCell`])
/// *and* reading the nodes' fields at the same time. The node fields are
/// guarded by this second token, which is stored next to the list inside the
/// same `CpuLockCell`, so holding the CPU lock still transitively grants
/// access to everything.
type TimeoutPropToken<Traits> = tokenlock::UnsyncSingletonToken<TimeoutPropTag<Traits>>;
type TimeoutPropKeyhole<Traits> = tokenlock::SingletonTokenId<TimeoutPropTag<Traits>>;
type TimeoutPropCell<Traits, T> = tokenlock::UnsyncTokenLock<T, TimeoutPropKeyhole<Traits>>;

/// A reference to a [`Timeout`] in the delta list.
pub(super) struct TimeoutRef<Traits: Port>(NonNull<Timeout<Traits>>);

impl<Traits: Port> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for TimeoutRef<Traits> {}

// Safety: `TimeoutRef` can only be dereferenced under the CPU lock, and the
//         referents are kept alive while linked (see `Timeout::drop`)
unsafe impl<Traits: Port> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: Port> Sync for TimeoutRef<Traits> {}

impl<Traits: Port> TimeoutRef<Traits> {
    pub(crate) fn new(timeout: Pin<&Timeout<Traits>>) -> Self {
        Self(NonNull::from(timeout.get_ref()))
    }
    /// # Safety
    ///
    /// The referent must be alive. (Linked nodes always are; see
    /// [`Timeout`]'s `Drop` impl.)
    unsafe fn as_ref(&self) -> &Timeout<Traits> {
        // Safety: upheld by the caller
        unsafe { self.0.as_ref() }
    }
}

/// The function called when a [`Timeout`] expires. Runs with the CPU lock
/// held and must return the lock it was given.
pub(crate) type TimeoutFn<Traits> =
    fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A timeout registration. `!Unpin` because the delta list stores a raw
/// pointer to it.
pub(crate) struct Timeout<Traits: Port> {
    /// Ticks remaining after the predecessor expires. Only meaningful while
    /// linked.
    delta: TimeoutPropCell<Traits, Ticks>,
    /// Whether this node is currently in the delta list.
    linked: TimeoutPropCell<Traits, bool>,
    callback: TimeoutFn<Traits>,
    callback_param: usize,
    _pin: PhantomPinned,
}

impl<Traits: Port> Timeout<Traits> {
    pub(crate) const fn new(callback: TimeoutFn<Traits>, callback_param: usize) -> Self {
        Self {
            delta: TimeoutPropCell::new(TimeoutPropKeyhole::new(), 0),
            linked: TimeoutPropCell::new(TimeoutPropKeyhole::new(), false),
            callback,
            callback_param,
            _pin: PhantomPinned,
        }
    }
}

impl<Traits: Port> Drop for Timeout<Traits> {
    fn drop(&mut self) {
        if *self.linked.get_mut() {
            // The delta list would be left with a dangling pointer
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: Port> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("callback", &(self.callback as *const ()))
            .field("callback_param", &self.callback_param)
            .finish()
    }
}

struct ListAndPropToken<Traits: Port> {
    list: ArrayVec<TimeoutRef<Traits>, TIMEOUT_CAPACITY>,
    prop_token: TimeoutPropToken<Traits>,
}

impl<Traits: Port> Init for ListAndPropToken<Traits> {
    const INIT: Self = Self {
        list: Init::INIT,
        // Safety: this is the only instance of `TimeoutPropToken<Traits>`
        //         for this particular `Traits`
        prop_token: unsafe { TimeoutPropToken::new_unchecked() },
    };
}

/// The timekeeping part of the kernel state.
pub(crate) struct TimeoutGlobals<Traits: Port> {
    /// Ticks elapsed since boot.
    now: CpuLockCell<Traits, Time>,
    list_and_prop_token: CpuLockCell<Traits, ListAndPropToken<Traits>>,
    handle_tick_in_progress: CpuLockCell<Traits, bool>,
}

impl<Traits: Port> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        now: Init::INIT,
        list_and_prop_token: Init::INIT,
        handle_tick_in_progress: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

/// The current value of the kernel tick counter.
pub(crate) fn current_time<Traits: KernelTraits>(lock: &CpuLockTokenRefMut<'_, Traits>) -> Time {
    *Traits::state().timeouts.now.read(&**lock)
}

/// Locate the insertion point for a new delay in a delta-ordered sequence.
///
/// Returns the insertion index and the delta the new node will carry. A node
/// expiring on the same tick as an existing one goes after it, preserving
/// registration order.
fn delta_position(mut remaining: Ticks, deltas: impl Iterator<Item = Ticks>) -> (usize, Ticks) {
    let mut pos = 0;
    for d in deltas {
        if remaining < d {
            break;
        }
        remaining -= d;
        pos += 1;
    }
    (pos, remaining)
}

/// Register `timeout` to expire `delay` ticks from now.
///
/// `delay == 0` expires on the very next tick. Exceeding
/// [`TIMEOUT_CAPACITY`] concurrent registrations is a kernel configuration
/// error and aborts.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Pin<&Timeout<Traits>>,
    delay: Ticks,
) {
    let ListAndPropToken { list, prop_token } = Traits::state()
        .timeouts
        .list_and_prop_token
        .write(&mut *lock);

    assert!(
        !*timeout.linked.read(&*prop_token),
        "timeout is already registered"
    );
    assert!(list.len() < list.capacity(), "too many timeouts");

    let (pos, remaining) = delta_position(
        delay,
        // Safety: every node in the list is linked
        list.iter().map(|r| *unsafe { r.as_ref() }.delta.read(&*prop_token)),
    );

    // The successor's delta now counts from the new node's expiry
    if let Some(next) = list.get(pos) {
        // Safety: every node in the list is linked
        let next = unsafe { next.as_ref() };
        let d = next.delta.write(&mut *prop_token);
        *d -= remaining;
    }

    timeout.delta.replace(&mut *prop_token, remaining);
    timeout.linked.replace(&mut *prop_token, true);
    list.insert(pos, TimeoutRef(NonNull::from(timeout.get_ref())));
}

/// Unregister `timeout` if it is currently linked.
///
/// Returns `true` if the node was linked and has now been removed, `false`
/// if it was not linked (already expired or already removed). Safe to call
/// any number of times.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) -> bool {
    let ListAndPropToken { list, prop_token } = Traits::state()
        .timeouts
        .list_and_prop_token
        .write(&mut *lock);

    if !*timeout.linked.read(&*prop_token) {
        return false;
    }

    let i = list
        .iter()
        .position(|r| core::ptr::eq(r.0.as_ptr(), timeout))
        .unwrap();
    let delta = *timeout.delta.read(&*prop_token);
    list.remove(i);

    // Give the carried ticks to the successor
    if let Some(next) = list.get(i) {
        // Safety: every node in the list is linked
        let next = unsafe { next.as_ref() };
        *next.delta.write(&mut *prop_token) += delta;
    }

    timeout.linked.replace(&mut *prop_token, false);
    true
}

/// Like [`remove_timeout`], but through a [`TimeoutRef`]. Used when only a
/// reference to the node survives, e.g. when one task deletes another whose
/// timeout node lives on the victim's stack.
///
/// # Safety
///
/// The referent must be alive.
pub(crate) unsafe fn remove_timeout_by_ref<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    r: TimeoutRef<Traits>,
) -> bool {
    // Safety: upheld by the caller
    remove_timeout(lock, unsafe { r.as_ref() })
}

/// Whether `timeout` is currently in the delta list.
#[cfg(test)]
pub(crate) fn timeout_is_linked<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) -> bool {
    let lap = Traits::state().timeouts.list_and_prop_token.read(&**lock);
    *timeout.linked.read(&lap.prop_token)
}

/// Establishes a borrow of a [`Timeout`] and unregisters it when dropped,
/// even on unwind.
pub(crate) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(crate) timeout: Pin<&'a Timeout<Traits>>,
    pub(crate) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}

/// Advance the tick counter and fire expired timeouts. Called by the port's
/// timer driver via [`PortToKernel::timer_tick`].
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The port must not deliver ticks while the CPU lock is held
    let mut lock = lock_cpu::<Traits>().unwrap();
    let g = &Traits::state().timeouts;

    {
        let in_progress = g.handle_tick_in_progress.write(&mut *lock);
        assert!(!*in_progress, "tick handler reentered");
        *in_progress = true;
    }

    *g.now.write(&mut *lock) += 1;

    // One tick elapses for the head node only
    {
        let ListAndPropToken { list, prop_token } = g.list_and_prop_token.write(&mut *lock);
        if let Some(head) = list.first() {
            // Safety: every node in the list is linked
            let head = unsafe { head.as_ref() };
            let d = head.delta.write(&mut *prop_token);
            *d = d.saturating_sub(1);
        }
    }

    // Fire every node that has reached its expiry, in list order
    loop {
        let expired = {
            let ListAndPropToken { list, prop_token } = g.list_and_prop_token.write(&mut *lock);
            match list.first().copied() {
                // Safety: every node in the list is linked
                Some(r) if *unsafe { r.as_ref() }.delta.read(&*prop_token) == 0 => {
                    // Safety: the node was linked an instant ago, and nothing
                    //         can drop it while we hold the CPU lock
                    let head = unsafe { r.as_ref() };
                    head.linked.replace(&mut *prop_token, false);
                    list.remove(0);
                    Some((head.callback, head.callback_param))
                }
                _ => None,
            }
        };

        if let Some((callback, param)) = expired {
            lock = callback(param, lock);
        } else {
            break;
        }
    }

    g.handle_tick_in_progress.replace(&mut *lock, false);

    // An expired timeout may have readied a higher-priority task
    task::unlock_cpu_and_check_preemption(lock);
}
