//! End-to-end scheduling scenarios on the hosted test port.
//!
//! Tasks run on real threads, so the tests communicate through channels and
//! assert on the main thread; a panic inside a task thread would not fail
//! the harness. The main thread is neither a task nor an interrupt context,
//! which makes it a convenient stand-in for startup code and the timer.
use std::{
    sync::mpsc::{channel, Receiver, Sender},
    thread,
    time::Duration,
};

use crate::{
    build_name,
    error::{
        LockMutexError, ObtainSemaphoreError, ObtainSemaphoreTimeoutError,
        ReleaseSemaphoreError, SetTaskPriorityError, TryLockMutexError, TryReceiveError,
        TrySendError, UnlockMutexError,
    },
    test_port::kernel_instance,
    BarrierRelease, Id, MutexProtocol, PortToKernel, QueueOrder, Recursion, System, TaskMode,
};

/// Pass a context structure to a task entry point through its `usize`
/// argument.
fn leak<T>(x: T) -> usize {
    Box::leak(Box::new(x)) as *mut T as usize
}

fn recv(rx: &Receiver<String>) -> String {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("timed out waiting for a task signal")
}

fn assert_silent(rx: &Receiver<String>) {
    if let Ok(msg) = rx.recv_timeout(Duration::from_millis(200)) {
        panic!("expected no signal, got {msg:?}");
    }
}

/// Give concurrently running task threads time to reach their blocking
/// points.
fn settle() {
    thread::sleep(Duration::from_millis(100));
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if f() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("never observed: {what}");
}

#[test]
fn priority_inheritance_boosts_and_restores_owner() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        mtx: Id,
        gate: Id,
        tx: Sender<String>,
    }

    fn owner(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::lock_mutex(ctx.mtx).unwrap();
        ctx.tx.send("owner:locked".into()).unwrap();
        // Hold the mutex while the high-priority waiter piles up behind it
        S::obtain_semaphore(ctx.gate).unwrap();
        S::unlock_mutex(ctx.mtx).unwrap();
        let me = S::ident_task(build_name(*b"OWNR")).unwrap();
        let eff = S::task_effective_priority(me).unwrap();
        ctx.tx.send(format!("owner:after-unlock eff={eff}")).unwrap();
    }

    fn waiter(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::lock_mutex(ctx.mtx);
        ctx.tx.send(format!("waiter:locked {:?}", r)).unwrap();
        S::unlock_mutex(ctx.mtx).unwrap();
    }

    let mtx = S::create_mutex(
        build_name(*b"MTX0"),
        MutexProtocol::Inherit,
        Recursion::Refused,
    )
    .unwrap();
    let gate = S::create_semaphore(build_name(*b"GATE"), 0, 1, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();

    let o = S::create_task(build_name(*b"OWNR"), 10).unwrap();
    let w = S::create_task(build_name(*b"WAIT"), 3).unwrap();

    let ctx = leak(Ctx {
        mtx,
        gate,
        tx: tx.clone(),
    });
    S::start_task(o, owner, ctx).unwrap();
    assert_eq!(recv(&rx), "owner:locked");

    S::start_task(w, waiter, ctx).unwrap();
    // The waiter outranks the owner, so the owner inherits its priority
    wait_until("owner boosted to 3", || {
        S::task_effective_priority(o) == Ok(3)
    });
    assert_eq!(S::task_priority(o), Ok(10));

    S::release_semaphore(gate).unwrap();
    assert_eq!(recv(&rx), "waiter:locked Ok(())");
    assert_eq!(recv(&rx), "owner:after-unlock eff=10");
}

#[test]
fn inheritance_boost_puts_owner_ahead_of_its_new_equals() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        mtx: Id,
        gate: Id,
        tx: Sender<String>,
    }

    fn owner(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::lock_mutex(ctx.mtx).unwrap();
        ctx.tx.send("o:locked".into()).unwrap();
        S::obtain_semaphore(ctx.gate).unwrap();
        ctx.tx.send("o:awake".into()).unwrap();
        S::unlock_mutex(ctx.mtx).unwrap();
    }

    fn bystander(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::obtain_semaphore(ctx.gate).unwrap();
        ctx.tx.send("a:resumed".into()).unwrap();
    }

    fn contender(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::obtain_semaphore(ctx.gate).unwrap();
        S::lock_mutex(ctx.mtx).unwrap();
        ctx.tx.send("w:locked".into()).unwrap();
        S::unlock_mutex(ctx.mtx).unwrap();
    }

    struct StarterCtx {
        gate_o: Id,
        gate_w: Id,
        gate_a: Id,
    }

    // Runs at the strongest priority, so its releases only mark tasks Ready;
    // everything dispatches at once when it exits
    fn starter(arg: usize) {
        let ctx = unsafe { &*(arg as *const StarterCtx) };
        S::release_semaphore(ctx.gate_o).unwrap();
        S::release_semaphore(ctx.gate_w).unwrap();
        S::release_semaphore(ctx.gate_a).unwrap();
    }

    let mtx = S::create_mutex(
        build_name(*b"MTX0"),
        MutexProtocol::Inherit,
        Recursion::Refused,
    )
    .unwrap();
    let gate_o = S::create_semaphore(build_name(*b"GATO"), 0, 1, QueueOrder::Fifo).unwrap();
    let gate_w = S::create_semaphore(build_name(*b"GATW"), 0, 1, QueueOrder::Fifo).unwrap();
    let gate_a = S::create_semaphore(build_name(*b"GATA"), 0, 1, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();

    let o = S::create_task(build_name(*b"OWNR"), 10).unwrap();
    let a = S::create_task(build_name(*b"BYST"), 5).unwrap();
    let w = S::create_task(build_name(*b"CNTD"), 5).unwrap();

    let mk = |gate| {
        leak(Ctx {
            mtx,
            gate,
            tx: tx.clone(),
        })
    };
    S::start_task(o, owner, mk(gate_o)).unwrap();
    assert_eq!(recv(&rx), "o:locked");
    S::start_task(a, bystander, mk(gate_a)).unwrap();
    S::start_task(w, contender, mk(gate_w)).unwrap();
    settle();

    // Readying order at priority 5: the contender, then the bystander. The
    // contender immediately blocks on the mutex and its boost must move the
    // owner in front of the bystander, not behind it.
    let s = S::create_task(build_name(*b"STRT"), 0).unwrap();
    S::start_task(s, starter, leak(StarterCtx { gate_o, gate_w, gate_a })).unwrap();

    assert_eq!(recv(&rx), "o:awake");
    assert_eq!(recv(&rx), "a:resumed");
    assert_eq!(recv(&rx), "w:locked");
}

#[test]
fn ceiling_mutex_boosts_owner_and_rejects_violations() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        mtx: Id,
        me: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::lock_mutex(ctx.mtx).unwrap();
        let eff = S::task_effective_priority(ctx.me).unwrap();
        ctx.tx.send(format!("eff-held={eff}")).unwrap();
        // A base priority stronger than the ceiling must be refused while
        // the mutex is held
        let r = S::set_task_priority(ctx.me, 2);
        ctx.tx.send(format!("set-pri={r:?}")).unwrap();
        S::unlock_mutex(ctx.mtx).unwrap();
        let eff = S::task_effective_priority(ctx.me).unwrap();
        ctx.tx.send(format!("eff-released={eff}")).unwrap();

        // Once the priority really is stronger than the ceiling, locking is
        // refused outright
        S::set_task_priority(ctx.me, 2).unwrap();
        let r = S::try_lock_mutex(ctx.mtx);
        ctx.tx.send(format!("lock-strong={r:?}")).unwrap();
    }

    let mtx = S::create_mutex(
        build_name(*b"MTXC"),
        MutexProtocol::Ceiling(3),
        Recursion::Refused,
    )
    .unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    let ctx = leak(Ctx { mtx, me: t, tx });
    S::start_task(t, body, ctx).unwrap();

    assert_eq!(recv(&rx), "eff-held=3");
    assert_eq!(
        recv(&rx),
        format!("set-pri={:?}", Err::<(), _>(SetTaskPriorityError::BadParam))
    );
    assert_eq!(recv(&rx), "eff-released=5");
    assert_eq!(
        recv(&rx),
        format!("lock-strong={:?}", Err::<(), _>(TryLockMutexError::BadParam))
    );
}

#[test]
fn recursive_mutex_nests_and_refused_mutex_deadlocks() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        rec: Id,
        non: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::lock_mutex(ctx.rec).unwrap();
        let nested = S::lock_mutex(ctx.rec);
        ctx.tx.send(format!("nested={nested:?}")).unwrap();
        S::unlock_mutex(ctx.rec).unwrap();
        // Still owned after undoing only the inner lock
        let again = S::try_lock_mutex(ctx.rec);
        ctx.tx.send(format!("again={again:?}")).unwrap();
        S::unlock_mutex(ctx.rec).unwrap();
        S::unlock_mutex(ctx.rec).unwrap();
        let over = S::unlock_mutex(ctx.rec);
        ctx.tx.send(format!("over={over:?}")).unwrap();

        S::lock_mutex(ctx.non).unwrap();
        let dead = S::lock_mutex(ctx.non);
        ctx.tx.send(format!("dead={dead:?}")).unwrap();
        S::unlock_mutex(ctx.non).unwrap();
    }

    let rec = S::create_mutex(
        build_name(*b"MTXR"),
        MutexProtocol::None,
        Recursion::Allowed,
    )
    .unwrap();
    let non = S::create_mutex(
        build_name(*b"MTXN"),
        MutexProtocol::None,
        Recursion::Refused,
    )
    .unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { rec, non, tx })).unwrap();

    assert_eq!(recv(&rx), format!("nested={:?}", Ok::<_, LockMutexError>(())));
    assert_eq!(recv(&rx), format!("again={:?}", Ok::<_, TryLockMutexError>(())));
    assert_eq!(
        recv(&rx),
        format!("over={:?}", Err::<(), _>(UnlockMutexError::NotOwner))
    );
    assert_eq!(
        recv(&rx),
        format!("dead={:?}", Err::<(), _>(LockMutexError::WouldDeadlock))
    );
}

#[test]
fn exiting_owner_hands_mutex_to_waiter() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        mtx: Id,
        gate: Id,
        tx: Sender<String>,
    }

    fn owner(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::lock_mutex(ctx.mtx).unwrap();
        ctx.tx.send("owner:locked".into()).unwrap();
        S::obtain_semaphore(ctx.gate).unwrap();
        // Exit without unlocking; the kernel abandons the mutex for us
        let _ = S::exit_task();
    }

    fn waiter(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::lock_mutex(ctx.mtx);
        ctx.tx.send(format!("waiter:locked {r:?}")).unwrap();
        S::unlock_mutex(ctx.mtx).unwrap();
    }

    let mtx = S::create_mutex(
        build_name(*b"MTX0"),
        MutexProtocol::Inherit,
        Recursion::Refused,
    )
    .unwrap();
    let gate = S::create_semaphore(build_name(*b"GATE"), 0, 1, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    let o = S::create_task(build_name(*b"OWNR"), 4).unwrap();
    let w = S::create_task(build_name(*b"WAIT"), 5).unwrap();
    let ctx = leak(Ctx { mtx, gate, tx });

    S::start_task(o, owner, ctx).unwrap();
    assert_eq!(recv(&rx), "owner:locked");
    S::start_task(w, waiter, ctx).unwrap();
    settle();

    S::release_semaphore(gate).unwrap();
    assert_eq!(recv(&rx), "waiter:locked Ok(())");
}

#[test]
fn semaphore_release_hands_permit_directly_to_waiter() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        ctx.tx.send("blocking".into()).unwrap();
        let r = S::obtain_semaphore(ctx.sem);
        ctx.tx.send(format!("obtained {r:?}")).unwrap();
    }

    let sem = S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { sem, tx })).unwrap();

    assert_eq!(recv(&rx), "blocking");
    settle();

    S::release_semaphore(sem).unwrap();
    // The permit went straight to the waiter; it never touched the count
    assert_eq!(S::semaphore_value(sem), Ok(0));
    assert_eq!(recv(&rx), "obtained Ok(())");
    assert_eq!(S::semaphore_value(sem), Ok(0));
}

#[test]
fn priority_ordered_semaphore_wakes_best_waiter_first() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tag: &'static str,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::obtain_semaphore(ctx.sem).unwrap();
        ctx.tx.send(ctx.tag.into()).unwrap();
    }

    let sem =
        S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::TaskPriority).unwrap();
    let (tx, rx) = channel();

    for (name, pri, tag) in [
        (*b"TSK7", 7, "pri7"),
        (*b"TSK3", 3, "pri3"),
        (*b"TSK5", 5, "pri5"),
    ] {
        let t = S::create_task(build_name(name), pri).unwrap();
        S::start_task(
            t,
            body,
            leak(Ctx {
                sem,
                tag,
                tx: tx.clone(),
            }),
        )
        .unwrap();
        settle();
    }

    for expected in ["pri3", "pri5", "pri7"] {
        S::release_semaphore(sem).unwrap();
        assert_eq!(recv(&rx), expected);
    }
}

#[test]
fn equal_priority_waiters_wake_in_arrival_order() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tag: &'static str,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::obtain_semaphore(ctx.sem).unwrap();
        ctx.tx.send(ctx.tag.into()).unwrap();
    }

    let sem =
        S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::TaskPriority).unwrap();
    let (tx, rx) = channel();

    // Same priority throughout, so the priority discipline degenerates to
    // arrival order
    for (name, tag) in [(*b"TSKA", "first"), (*b"TSKB", "second"), (*b"TSKC", "third")] {
        let t = S::create_task(build_name(name), 5).unwrap();
        S::start_task(
            t,
            body,
            leak(Ctx {
                sem,
                tag,
                tx: tx.clone(),
            }),
        )
        .unwrap();
        settle();
    }

    for expected in ["first", "second", "third"] {
        S::release_semaphore(sem).unwrap();
        assert_eq!(recv(&rx), expected);
    }
}

#[test]
fn fifo_ordered_semaphore_ignores_priority() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tag: &'static str,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::obtain_semaphore(ctx.sem).unwrap();
        ctx.tx.send(ctx.tag.into()).unwrap();
    }

    let sem = S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();

    // The low-priority task arrives first and must be served first
    for (name, pri, tag) in [(*b"TSK7", 7, "arrived-first"), (*b"TSK3", 3, "arrived-second")] {
        let t = S::create_task(build_name(name), pri).unwrap();
        S::start_task(
            t,
            body,
            leak(Ctx {
                sem,
                tag,
                tx: tx.clone(),
            }),
        )
        .unwrap();
        settle();
    }

    for expected in ["arrived-first", "arrived-second"] {
        S::release_semaphore(sem).unwrap();
        assert_eq!(recv(&rx), expected);
    }
}

#[test]
fn semaphore_release_beyond_max_is_an_error() {
    kernel_instance!(K);
    type S = System<K>;

    let sem = S::create_semaphore(build_name(*b"SEM0"), 1, 2, QueueOrder::Fifo).unwrap();
    S::release_semaphore(sem).unwrap();
    assert_eq!(
        S::release_semaphore(sem),
        Err(ReleaseSemaphoreError::Overflow)
    );
    // The refused release left the count at its maximum
    assert_eq!(S::semaphore_value(sem), Ok(2));
}

#[test]
fn automatic_barrier_trips_on_third_arrival() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        bar: Id,
        tag: &'static str,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::wait_barrier(ctx.bar);
        ctx.tx.send(format!("{} {r:?}", ctx.tag)).unwrap();
    }

    let bar = S::create_barrier(build_name(*b"BAR0"), BarrierRelease::Automatic(3)).unwrap();
    let (tx, rx) = channel();

    for (name, pri, tag) in [(*b"TSKA", 5, "a"), (*b"TSKB", 6, "b")] {
        let t = S::create_task(build_name(name), pri).unwrap();
        S::start_task(
            t,
            body,
            leak(Ctx {
                bar,
                tag,
                tx: tx.clone(),
            }),
        )
        .unwrap();
    }
    settle();
    // Two arrivals are not enough
    assert_silent(&rx);

    let t = S::create_task(build_name(*b"TSKC"), 7).unwrap();
    S::start_task(t, body, leak(Ctx { bar, tag: "c", tx })).unwrap();

    let mut got: Vec<String> = (0..3).map(|_| recv(&rx)).collect();
    got.sort();
    assert_eq!(got, ["a Ok(())", "b Ok(())", "c Ok(())"]);
}

#[test]
fn manual_barrier_releases_only_on_demand() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        bar: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::wait_barrier(ctx.bar);
        ctx.tx.send(format!("released {r:?}")).unwrap();
    }

    let bar = S::create_barrier(build_name(*b"BAR0"), BarrierRelease::Manual).unwrap();
    let (tx, rx) = channel();
    for name in [*b"TSKA", *b"TSKB"] {
        let t = S::create_task(build_name(name), 5).unwrap();
        S::start_task(t, body, leak(Ctx { bar, tx: tx.clone() })).unwrap();
    }
    settle();
    assert_silent(&rx);

    assert_eq!(S::release_barrier(bar), Ok(2));
    assert_eq!(recv(&rx), "released Ok(())");
    assert_eq!(recv(&rx), "released Ok(())");
    // Nobody is waiting anymore
    assert_eq!(S::release_barrier(bar), Ok(0));
}

#[test]
fn timed_wait_expires_and_late_release_is_kept() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::obtain_semaphore_timeout(ctx.sem, 3);
        ctx.tx.send(format!("obtain {r:?}")).unwrap();
    }

    let sem = S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { sem, tx })).unwrap();
    settle();

    for _ in 0..3 {
        <K as PortToKernel>::timer_tick();
    }
    assert_eq!(
        recv(&rx),
        format!(
            "obtain {:?}",
            Err::<(), _>(ObtainSemaphoreTimeoutError::Timeout)
        )
    );

    // The release arrived after the deadline; the permit stays banked
    S::release_semaphore(sem).unwrap();
    assert_eq!(S::semaphore_value(sem), Ok(1));
}

#[test]
fn wake_after_counts_ticks() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let t0 = S::time().unwrap();
        ctx.tx.send("sleeping".into()).unwrap();
        S::wake_after(5).unwrap();
        let t1 = S::time().unwrap();
        ctx.tx.send(format!("slept {}", t1 - t0)).unwrap();
    }

    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { tx })).unwrap();
    assert_eq!(recv(&rx), "sleeping");
    settle();

    for _ in 0..5 {
        <K as PortToKernel>::timer_tick();
    }
    assert_eq!(recv(&rx), "slept 5");
}

#[test]
fn deleting_semaphore_interrupts_waiter_with_deleted() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::obtain_semaphore(ctx.sem);
        ctx.tx.send(format!("obtain {r:?}")).unwrap();
    }

    let sem = S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { sem, tx })).unwrap();
    settle();

    S::delete_semaphore(sem).unwrap();
    assert_eq!(
        recv(&rx),
        format!("obtain {:?}", Err::<(), _>(ObtainSemaphoreError::Deleted))
    );
    // The identifier went stale with the deletion
    assert!(S::release_semaphore(sem).is_err());
}

#[test]
fn suspended_task_stays_parked_through_a_wakeup() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        ctx.tx.send("blocking".into()).unwrap();
        S::obtain_semaphore(ctx.sem).unwrap();
        ctx.tx.send("woke".into()).unwrap();
    }

    let sem = S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { sem, tx })).unwrap();
    assert_eq!(recv(&rx), "blocking");
    settle();

    S::suspend_task(t).unwrap();
    S::release_semaphore(sem).unwrap();
    // The wait completed, but the suspension still holds the task back
    assert_silent(&rx);

    S::resume_task(t).unwrap();
    assert_eq!(recv(&rx), "woke");
}

#[test]
fn restart_cancels_wait_and_reruns_entry() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        sem: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        // The restart passes a context with the same layout but a new tag
        let ctx = unsafe { &*(arg as *const (Ctx, u32)) };
        ctx.0.tx.send(format!("run {}", ctx.1)).unwrap();
        if ctx.1 == 0 {
            let r = S::obtain_semaphore(ctx.0.sem);
            ctx.0.tx.send(format!("obtain {r:?}")).unwrap();
        }
    }

    let sem = S::create_semaphore(build_name(*b"SEM0"), 0, 10, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak((Ctx { sem, tx: tx.clone() }, 0u32))).unwrap();
    assert_eq!(recv(&rx), "run 0");
    settle();

    // The first incarnation is blocked on the semaphore; restarting tears
    // the wait down without reporting anything to it
    S::restart_task(t, leak((Ctx { sem, tx }, 1u32))).unwrap();
    assert_eq!(recv(&rx), "run 1");
    assert_silent(&rx);
}

#[test]
fn exited_task_frees_its_identifier() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        ctx.tx.send("ran".into()).unwrap();
    }

    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { tx })).unwrap();
    assert_eq!(recv(&rx), "ran");
    wait_until("identifier went stale", || S::delete_task(t).is_err());

    // The slot is reusable, and the new identifier is distinct
    let t2 = S::create_task(build_name(*b"TSK1"), 5).unwrap();
    assert_ne!(t, t2);
}

#[test]
fn message_queue_orders_by_priority_with_urgent_override() {
    kernel_instance!(K);
    type S = System<K>;

    let q = S::create_queue(build_name(*b"MSGQ"), 4, QueueOrder::Fifo).unwrap();
    S::try_send(q, b"beta", 5).unwrap();
    S::try_send(q, b"alpha", 1).unwrap();
    S::try_send(q, b"gamma", 5).unwrap();
    S::urgent_send(q, b"zeta", 9).unwrap();

    // Capacity is 4
    assert_eq!(S::try_send(q, b"late", 0), Err(TrySendError::Unsatisfied));

    let mut buf = [0u8; 32];
    let next = |buf: &mut [u8; 32]| {
        let n = S::try_receive(q, buf).unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    };
    assert_eq!(next(&mut buf), "zeta");
    assert_eq!(next(&mut buf), "alpha");
    assert_eq!(next(&mut buf), "beta");
    assert_eq!(next(&mut buf), "gamma");
    assert_eq!(
        S::try_receive(q, &mut buf),
        Err(TryReceiveError::Unsatisfied)
    );
}

#[test]
fn blocked_sender_backfills_freed_slot() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        q: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let r = S::send(ctx.q, b"blocked", 7);
        ctx.tx.send(format!("sent {r:?}")).unwrap();
    }

    let q = S::create_queue(build_name(*b"MSGQ"), 2, QueueOrder::Fifo).unwrap();
    S::try_send(q, b"one", 1).unwrap();
    S::try_send(q, b"two", 2).unwrap();

    let (tx, rx) = channel();
    let t = S::create_task(build_name(*b"TSK0"), 5).unwrap();
    S::start_task(t, body, leak(Ctx { q, tx })).unwrap();
    settle();

    let mut buf = [0u8; 32];
    let n = S::try_receive(q, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"one");
    assert_eq!(recv(&rx), "sent Ok(())");

    let n = S::try_receive(q, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"two");
    let n = S::try_receive(q, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"blocked");
}

#[test]
fn broadcast_reaches_every_waiting_receiver() {
    kernel_instance!(K);
    type S = System<K>;

    struct Ctx {
        q: Id,
        tx: Sender<String>,
    }

    fn body(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        let mut buf = [0u8; 32];
        let n = S::receive(ctx.q, &mut buf).unwrap();
        ctx.tx
            .send(String::from_utf8(buf[..n].to_vec()).unwrap())
            .unwrap();
    }

    let q = S::create_queue(build_name(*b"MSGQ"), 4, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();
    for name in [*b"TSKA", *b"TSKB", *b"TSKC"] {
        let t = S::create_task(build_name(name), 5).unwrap();
        S::start_task(t, body, leak(Ctx { q, tx: tx.clone() })).unwrap();
    }
    settle();

    assert_eq!(S::broadcast(q, b"fanout", 0), Ok(3));
    for _ in 0..3 {
        assert_eq!(recv(&rx), "fanout");
    }
    // Nothing was left in the pending buffer
    let mut buf = [0u8; 32];
    assert_eq!(
        S::try_receive(q, &mut buf),
        Err(TryReceiveError::Unsatisfied)
    );
}

#[test]
fn edf_scheduler_runs_earliest_deadline_first() {
    kernel_instance!(K, crate::EdfQueue<K>);
    type S = System<K>;

    struct Ctx {
        gate: Id,
        tag: &'static str,
        tx: Sender<String>,
    }

    fn deadline_task(arg: usize) {
        let ctx = unsafe { &*(arg as *const Ctx) };
        S::obtain_semaphore(ctx.gate).unwrap();
        ctx.tx.send(ctx.tag.into()).unwrap();
    }

    struct OrchCtx {
        gate_a: Id,
        gate_b: Id,
        tx: Sender<String>,
    }

    fn orchestrator(arg: usize) {
        let ctx = unsafe { &*(arg as *const OrchCtx) };
        // Ready both deadline tasks atomically with respect to dispatching,
        // then let the scheduler pick
        S::change_task_mode(TaskMode::NO_PREEMPT).unwrap();
        S::release_semaphore(ctx.gate_a).unwrap();
        S::release_semaphore(ctx.gate_b).unwrap();
        S::change_task_mode(TaskMode::empty()).unwrap();
        ctx.tx.send("orchestrator".into()).unwrap();
    }

    let gate_a = S::create_semaphore(build_name(*b"GATA"), 0, 1, QueueOrder::Fifo).unwrap();
    let gate_b = S::create_semaphore(build_name(*b"GATB"), 0, 1, QueueOrder::Fifo).unwrap();
    let (tx, rx) = channel();

    let a = S::create_task(build_name(*b"TSKA"), 5).unwrap();
    let b = S::create_task(build_name(*b"TSKB"), 5).unwrap();
    S::start_task(
        a,
        deadline_task,
        leak(Ctx {
            gate: gate_a,
            tag: "late-deadline",
            tx: tx.clone(),
        }),
    )
    .unwrap();
    S::start_task(
        b,
        deadline_task,
        leak(Ctx {
            gate: gate_b,
            tag: "early-deadline",
            tx: tx.clone(),
        }),
    )
    .unwrap();
    settle();

    S::set_task_deadline(a, Some(100)).unwrap();
    S::set_task_deadline(b, Some(50)).unwrap();

    let m = S::create_task(build_name(*b"ORCH"), 5).unwrap();
    S::start_task(m, orchestrator, leak(OrchCtx { gate_a, gate_b, tx })).unwrap();

    assert_eq!(recv(&rx), "early-deadline");
    assert_eq!(recv(&rx), "late-deadline");
    // The deadline-less orchestrator ran last
    assert_eq!(recv(&rx), "orchestrator");
}
