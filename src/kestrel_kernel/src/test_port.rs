//! A hosted port for the test suite.
//!
//! Each task runs on its own OS thread. Exactly one task thread executes at
//! a time as far as the kernel is concerned: a thread whose task is not the
//! running task is parked inside [`yield_cpu`], and the CPU lock is a
//! spinlock keyed by thread so a "critical section" excludes every other
//! thread, just like an interrupt-disable window excludes everything on a
//! single core.
//!
//! Tests play the part of the startup code and the timer interrupt: they
//! call directives and `PortToKernel::timer_tick` from the test thread,
//! which is neither a task nor an interrupt context.
use std::{
    cell::Cell,
    ptr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    thread,
};

use crate::{klock, task::TaskCb, utils::Init, KernelTraits, Port, PortToKernel, System};

/// The bound shared by every function here that pokes at the per-task port
/// state: the kernel instance must use this module as its port.
trait TestPort: KernelTraits + Port<PortTaskState = TaskState> {}
impl<Traits: KernelTraits + Port<PortTaskState = TaskState>> TestPort for Traits {}

std::thread_local! {
    /// The task control block owned by this thread, if it is a task thread.
    static CURRENT_TASK: Cell<*const ()> = const { Cell::new(ptr::null()) };
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
}

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

fn thread_id() -> usize {
    THREAD_ID.with(|c| {
        let mut id = c.get();
        if id == 0 {
            id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            c.set(id);
        }
        id
    })
}

/// The CPU lock of one kernel instance: a spinlock recording the owning
/// thread. Contended acquisition spins (the owner is in a critical section
/// and will release shortly); re-acquisition by the owner reports the lock
/// as already active, which is what the kernel maps to `BadContext`.
pub(crate) struct PortState {
    cpu_lock_owner: AtomicUsize,
}

impl PortState {
    pub(crate) const fn new() -> Self {
        Self {
            cpu_lock_owner: AtomicUsize::new(0),
        }
    }

    pub(crate) fn try_enter(&self) -> bool {
        let me = thread_id();
        loop {
            match self
                .cpu_lock_owner
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(owner) if owner == me => return false,
                Err(_) => thread::yield_now(),
            }
        }
    }

    pub(crate) fn enter(&self) {
        assert!(self.try_enter(), "CPU lock is already active");
    }

    pub(crate) fn leave(&self) {
        let prev = self.cpu_lock_owner.swap(0, Ordering::Release);
        assert_eq!(prev, thread_id(), "CPU lock released by a non-owner");
    }

    pub(crate) fn is_active(&self) -> bool {
        self.cpu_lock_owner.load(Ordering::Relaxed) == thread_id()
    }
}

/// The port's per-task state: the handle used to unpark the task's thread,
/// and a generation counter that retires stale threads after a restart.
pub(crate) struct TaskState {
    thread: Mutex<Option<thread::Thread>>,
    generation: AtomicU64,
}

impl Init for TaskState {
    const INIT: Self = Self {
        thread: Mutex::new(None),
        generation: AtomicU64::new(0),
    };
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

pub(crate) fn in_task_context() -> bool {
    CURRENT_TASK.with(|c| !c.get().is_null())
}

fn current_task<Traits: KernelTraits>() -> Option<&'static TaskCb<Traits>> {
    CURRENT_TASK.with(|c| {
        let p = c.get();
        if p.is_null() {
            None
        } else {
            // Safety: the pointer was set from an `&'static TaskCb<Traits>`
            //         of the same kernel instance by `task_thread_main`
            Some(unsafe { &*(p as *const TaskCb<Traits>) })
        }
    })
}

fn task_is_running<Traits: KernelTraits>(cb: &'static TaskCb<Traits>) -> bool {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let state = Traits::state();
    state
        .running_task(lock.borrow_mut())
        .is_some_and(|r| ptr::eq(r, cb))
}

fn unpark_task<Traits: TestPort>(cb: &'static TaskCb<Traits>) {
    if let Some(t) = cb.port_task_state.thread.lock().unwrap().as_ref() {
        t.unpark();
    }
}

/// Read the running task while the CPU lock is active, releasing the lock.
///
/// # Safety
///
/// The CPU lock must be active and unguarded.
unsafe fn take_running_task<Traits: KernelTraits>() -> Option<&'static TaskCb<Traits>> {
    // Safety: upheld by the caller
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    Traits::state().running_task(lock.borrow_mut())
}

pub(crate) unsafe fn yield_cpu<Traits: TestPort>() {
    // Safety: the CPU lock is inactive per `Port::yield_cpu`'s contract
    unsafe { Traits::enter_cpu_lock() };
    // Safety: the CPU lock is active
    unsafe { <Traits as PortToKernel>::choose_running_task() };
    // Safety: `choose_running_task` kept the CPU lock active
    let running = unsafe { take_running_task::<Traits>() };

    if let Some(cb) = running {
        unpark_task(cb);
    }

    // A task thread that lost the processor stays here until it gets it back
    if let Some(cur) = current_task::<Traits>() {
        while !task_is_running(cur) {
            thread::park();
        }
    }
}

pub(crate) unsafe fn dispatch_first_task<Traits: TestPort>() -> ! {
    // Safety: the CPU lock is active per the contract
    let running = unsafe { take_running_task::<Traits>() };
    if let Some(cb) = running {
        unpark_task(cb);
    }
    // The boot thread has nothing further to do; task threads and the test
    // thread drive all dispatching from here on
    loop {
        thread::park();
    }
}

pub(crate) unsafe fn exit_and_dispatch<Traits: TestPort>(_task: &'static TaskCb<Traits>) -> ! {
    // Safety: the CPU lock is active per the contract
    unsafe { <Traits as PortToKernel>::choose_running_task() };
    // Safety: `choose_running_task` kept the CPU lock active
    let running = unsafe { take_running_task::<Traits>() };
    if let Some(cb) = running {
        unpark_task(cb);
    }
    // This thread's task is gone; the thread itself is retired
    loop {
        thread::park();
    }
}

pub(crate) unsafe fn initialize_task_state<Traits: TestPort>(cb: &'static TaskCb<Traits>) {
    let ts = &cb.port_task_state;
    let generation = ts.generation.load(Ordering::Relaxed);
    let handle = thread::Builder::new()
        .spawn(move || task_thread_main::<Traits>(cb, generation))
        .unwrap();
    *ts.thread.lock().unwrap() = Some(handle.thread().clone());
}

pub(crate) unsafe fn discard_task_state<Traits: TestPort>(cb: &'static TaskCb<Traits>) {
    let ts = &cb.port_task_state;
    ts.generation.fetch_add(1, Ordering::Relaxed);
    // Kick a parked stale thread so it notices and retires
    if let Some(t) = ts.thread.lock().unwrap().take() {
        t.unpark();
    }
}

fn task_thread_main<Traits: TestPort>(cb: &'static TaskCb<Traits>, generation: u64) {
    CURRENT_TASK.with(|c| c.set(cb as *const _ as *const ()));

    // Wait to be scheduled for the first time
    loop {
        if cb.port_task_state.generation.load(Ordering::Relaxed) != generation {
            return;
        }
        if task_is_running(cb) {
            break;
        }
        thread::park();
    }

    let entry = {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        cb.task_entry(&lock.borrow_mut())
    };
    let entry = entry.expect("task scheduled without an entry point");
    (entry.entry)(entry.arg);

    // Returning from the entry function is an implicit exit
    let _ = System::<Traits>::exit_task();
    unreachable!();
}

/// Define a fresh kernel instance for one test: the traits type, its port,
/// and its state.
macro_rules! kernel_instance {
    ($Traits:ident) => {
        crate::test_port::kernel_instance!($Traits, crate::BitmapQueue<$Traits>);
    };
    ($Traits:ident, $queue:ty) => {
        struct $Traits;

        impl $Traits {
            fn port_state() -> &'static crate::test_port::PortState {
                static PORT_STATE: crate::test_port::PortState =
                    crate::test_port::PortState::new();
                &PORT_STATE
            }
        }

        unsafe impl crate::KernelCfg1 for $Traits {
            type TaskReadyQueue = $queue;
        }

        unsafe impl crate::Port for $Traits {
            type PortTaskState = crate::test_port::TaskState;

            unsafe fn try_enter_cpu_lock() -> bool {
                Self::port_state().try_enter()
            }
            unsafe fn enter_cpu_lock() {
                Self::port_state().enter()
            }
            unsafe fn leave_cpu_lock() {
                Self::port_state().leave()
            }
            fn is_cpu_lock_active() -> bool {
                Self::port_state().is_active()
            }
            fn is_task_context() -> bool {
                crate::test_port::in_task_context()
            }
            fn is_interrupt_context() -> bool {
                false
            }
            unsafe fn yield_cpu() {
                // Safety: forwarded contract
                unsafe { crate::test_port::yield_cpu::<Self>() }
            }
            unsafe fn dispatch_first_task() -> ! {
                // Safety: forwarded contract
                unsafe { crate::test_port::dispatch_first_task::<Self>() }
            }
            unsafe fn initialize_task_state(task: &'static crate::TaskCb<Self>) {
                // Safety: forwarded contract
                unsafe { crate::test_port::initialize_task_state::<Self>(task) }
            }
            unsafe fn discard_task_state(task: &'static crate::TaskCb<Self>) {
                // Safety: forwarded contract
                unsafe { crate::test_port::discard_task_state::<Self>(task) }
            }
            unsafe fn exit_and_dispatch(task: &'static crate::TaskCb<Self>) -> ! {
                // Safety: forwarded contract
                unsafe { crate::test_port::exit_and_dispatch::<Self>(task) }
            }
        }

        unsafe impl crate::KernelTraits for $Traits {
            fn state() -> &'static crate::KernelState<Self> {
                static STATE: crate::KernelState<$Traits> =
                    <crate::KernelState<$Traits> as crate::Init>::INIT;
                &STATE
            }
        }
    };
}

pub(crate) use kernel_instance;
