//! Priority-ordered message queues.
//!
//! Messages are small fixed-capacity byte buffers copied in and out of the
//! queue; nothing is allocated. Pending messages are kept sorted by message
//! priority (lower value first), ties in arrival order. When a receiver is
//! already waiting, a sent message bypasses the buffer and is deposited
//! straight into the receiver's wait payload.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    cfg::{Ticks, MAX_MESSAGE_SIZE, MAX_PENDING_MESSAGES},
    error::{
        BadIdError, BadParamError, BroadcastError, CreateQueueError, DeleteQueueError,
        IdentError, ReceiveError, ReceiveTimeoutError, SendError, SendTimeoutError,
        TryReceiveError, TrySendError, WaitTimeoutError,
    },
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{Id, Name},
    state, task,
    utils::Init,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port,
};

/// One message: an inline byte buffer plus its delivery priority.
#[derive(Clone, Copy)]
pub(crate) struct Message {
    bytes: [u8; MAX_MESSAGE_SIZE],
    len: usize,
    priority: u8,
}

impl Message {
    /// Copy `data` into a new message. Fails if `data` exceeds
    /// [`MAX_MESSAGE_SIZE`].
    fn new(data: &[u8], priority: u8) -> Result<Self, BadParamError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(BadParamError::BadParam);
        }
        let mut bytes = [0; MAX_MESSAGE_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            bytes,
            len: data.len(),
            priority,
        })
    }

    const EMPTY: Self = Self {
        bytes: [0; MAX_MESSAGE_SIZE],
        len: 0,
        priority: 0,
    };

    /// Copy the message out into `out`, truncating if `out` is smaller.
    /// Returns the number of bytes copied.
    fn read_into(&self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        out[..n].copy_from_slice(&self.bytes[..n]);
        n
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.len)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A message queue control block.
pub(crate) struct QueueCb<Traits: Port> {
    buffer: CpuLockCell<Traits, ArrayVec<Message, MAX_PENDING_MESSAGES>>,
    /// The buffer capacity chosen at creation, `1..=MAX_PENDING_MESSAGES`.
    max_messages: CpuLockCell<Traits, usize>,
    /// Tasks blocked in `send` because the buffer is full.
    pub(crate) send_queue: WaitQueue<Traits>,
    /// Tasks blocked in `receive` because the buffer is empty.
    pub(crate) recv_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Init for QueueCb<Traits> {
    const INIT: Self = Self {
        buffer: Init::INIT,
        max_messages: Init::INIT,
        send_queue: Init::INIT,
        recv_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("max_messages", &self.max_messages)
            .finish_non_exhaustive()
    }
}

fn queue_cb_by_id<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    id: Id,
) -> Result<&'static QueueCb<Traits>, BadIdError> {
    let i = Traits::state().queue_registry.read(&**lock).get(id)?;
    Ok(&Traits::state().msg_queues[i])
}

/// Insert `msg` behind every pending message of equal or stronger priority.
fn insert_by_priority(buffer: &mut ArrayVec<Message, MAX_PENDING_MESSAGES>, msg: Message) {
    let pos = buffer
        .iter()
        .position(|m| m.priority > msg.priority)
        .unwrap_or(buffer.len());
    buffer.insert(pos, msg);
}

pub(crate) fn create_queue<Traits: KernelTraits>(
    name: Name,
    max_messages: usize,
    order: QueueOrder,
) -> Result<Id, CreateQueueError> {
    if max_messages == 0 || max_messages > MAX_PENDING_MESSAGES {
        return Err(BadParamError::BadParam.into());
    }
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let (i, id) = state.queue_registry.write(&mut *lock).allocate(name)?;
    let cb = &state.msg_queues[i];

    cb.buffer.write(&mut *lock).clear();
    cb.max_messages.replace(&mut *lock, max_messages);
    {
        let mut token = lock.borrow_mut();
        cb.send_queue.set_order(&mut token, order);
        cb.recv_queue.set_order(&mut token, order);
    }
    Ok(id)
}

pub(crate) fn ident_queue<Traits: KernelTraits>(name: Name) -> Result<Id, IdentError> {
    let lock = lock_cpu::<Traits>()?;
    let id = Traits::state().queue_registry.read(&*lock).ident(name)?;
    Ok(id)
}

/// Deposit `msg`, preferring a waiting receiver over the buffer.
/// `Ok(true)` means delivered or buffered, `Ok(false)` means the buffer is
/// full. `urgent` bypasses the priority order and cuts to the front.
fn deposit<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static QueueCb<Traits>,
    msg: Message,
    urgent: bool,
) -> bool {
    if let Some(receiver) = cb.recv_queue.wake_up_one(lock.borrow_mut()) {
        // The receiver cannot resume before the CPU lock is released, so the
        // payload is in place by the time it reads it
        receiver
            .wait
            .payload
            .replace(&mut *lock, WaitPayload::ReceiveMessage(msg));
        return true;
    }

    let max = cb.max_messages.get(&*lock);
    let buffer = cb.buffer.write(&mut *lock);
    if buffer.len() >= max {
        return false;
    }
    if urgent {
        buffer.insert(0, msg);
    } else {
        insert_by_priority(buffer, msg);
    }
    true
}

/// Refill one buffer slot from the frontmost blocked sender, if any.
fn admit_blocked_sender<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static QueueCb<Traits>,
) {
    if let Some(sender) = cb.send_queue.wake_up_one(lock.borrow_mut()) {
        match sender.wait.payload.get(&*lock) {
            WaitPayload::SendMessage(msg) => {
                insert_by_priority(cb.buffer.write(&mut *lock), msg);
            }
            _ => unreachable!("sender blocked without a message"),
        }
    }
}

pub(crate) fn try_send<Traits: KernelTraits>(
    id: Id,
    data: &[u8],
    priority: u8,
) -> Result<(), TrySendError> {
    let msg = Message::new(data, priority)?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if deposit(lock.borrow_mut(), cb, msg, false) {
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    } else {
        Err(TrySendError::Unsatisfied)
    }
}

/// Like [`try_send`], but the message jumps the pending buffer's priority
/// order. Still non-blocking.
pub(crate) fn urgent_send<Traits: KernelTraits>(
    id: Id,
    data: &[u8],
    priority: u8,
) -> Result<(), TrySendError> {
    let msg = Message::new(data, priority)?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if deposit(lock.borrow_mut(), cb, msg, true) {
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    } else {
        Err(TrySendError::Unsatisfied)
    }
}

pub(crate) fn send<Traits: KernelTraits>(
    id: Id,
    data: &[u8],
    priority: u8,
) -> Result<(), SendError> {
    let msg = Message::new(data, priority)?;
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if deposit(lock.borrow_mut(), cb, msg, false) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }
    // Full; park with the message until a receiver frees a slot
    cb.send_queue
        .wait(lock.borrow_mut(), WaitPayload::SendMessage(msg))?;
    Ok(())
}

pub(crate) fn send_timeout<Traits: KernelTraits>(
    id: Id,
    data: &[u8],
    priority: u8,
    delay: Ticks,
) -> Result<(), SendTimeoutError> {
    let msg = Message::new(data, priority)?;
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if deposit(lock.borrow_mut(), cb, msg, false) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }
    cb.send_queue
        .wait_timeout(lock.borrow_mut(), WaitPayload::SendMessage(msg), delay)?;
    Ok(())
}

/// Take the frontmost pending message, backfilling from a blocked sender.
fn take_pending<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static QueueCb<Traits>,
) -> Option<Message> {
    let buffer = cb.buffer.write(&mut *lock);
    if buffer.is_empty() {
        return None;
    }
    let msg = buffer.remove(0);
    admit_blocked_sender(lock, cb);
    Some(msg)
}

pub(crate) fn try_receive<Traits: KernelTraits>(
    id: Id,
    out: &mut [u8],
) -> Result<usize, TryReceiveError> {
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    match take_pending(lock.borrow_mut(), cb) {
        Some(msg) => {
            task::unlock_cpu_and_check_preemption(lock);
            Ok(msg.read_into(out))
        }
        None => Err(TryReceiveError::Unsatisfied),
    }
}

pub(crate) fn receive<Traits: KernelTraits>(
    id: Id,
    out: &mut [u8],
) -> Result<usize, ReceiveError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if let Some(msg) = take_pending(lock.borrow_mut(), cb) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(msg.read_into(out));
    }

    let payload = cb
        .recv_queue
        .wait(lock.borrow_mut(), WaitPayload::ReceiveMessage(Message::EMPTY))?;
    match payload {
        WaitPayload::ReceiveMessage(msg) => Ok(msg.read_into(out)),
        _ => unreachable!("receiver woken without a message"),
    }
}

pub(crate) fn receive_timeout<Traits: KernelTraits>(
    id: Id,
    out: &mut [u8],
    delay: Ticks,
) -> Result<usize, ReceiveTimeoutError> {
    state::expect_waitable_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    if let Some(msg) = take_pending(lock.borrow_mut(), cb) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(msg.read_into(out));
    }

    let payload = cb.recv_queue.wait_timeout(
        lock.borrow_mut(),
        WaitPayload::ReceiveMessage(Message::EMPTY),
        delay,
    )?;
    match payload {
        WaitPayload::ReceiveMessage(msg) => Ok(msg.read_into(out)),
        _ => unreachable!("receiver woken without a message"),
    }
}

/// Deliver `data` to every task currently blocked in `receive`, without
/// touching the pending buffer. Returns the number of receivers released.
pub(crate) fn broadcast<Traits: KernelTraits>(
    id: Id,
    data: &[u8],
    priority: u8,
) -> Result<usize, BroadcastError> {
    let msg = Message::new(data, priority)?;
    let mut lock = lock_cpu::<Traits>()?;
    let cb = queue_cb_by_id::<Traits>(&lock.borrow_mut(), id)?;

    let mut n = 0;
    while let Some(receiver) = cb.recv_queue.wake_up_one(lock.borrow_mut()) {
        receiver
            .wait
            .payload
            .replace(&mut *lock, WaitPayload::ReceiveMessage(msg));
        n += 1;
    }

    task::unlock_cpu_and_check_preemption(lock);
    Ok(n)
}

pub(crate) fn delete_queue<Traits: KernelTraits>(id: Id) -> Result<(), DeleteQueueError> {
    let mut lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let i = state.queue_registry.read(&*lock).get(id)?;
    let cb = &state.msg_queues[i];

    state.queue_registry.write(&mut *lock).close(i);
    cb.buffer.write(&mut *lock).clear();
    cb.send_queue
        .flush_all(lock.borrow_mut(), WaitTimeoutError::Deleted);
    cb.recv_queue
        .flush_all(lock.borrow_mut(), WaitTimeoutError::Deleted);

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}
