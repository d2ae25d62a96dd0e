//! Static kernel configuration.
//!
//! Object pools are fixed-capacity arenas sized by the constants below. The
//! capacities are deliberately small; a port that needs more simply edits
//! them and rebuilds. Each capacity must not exceed 256 because object
//! identifiers address slots with an 8-bit field.
use crate::utils::TwoLevelBitmap;

/// The number of slots in the task registry.
pub const TASK_CAPACITY: usize = 8;

/// The number of slots in the mutex registry.
pub const MUTEX_CAPACITY: usize = 8;

/// The number of slots in the semaphore registry.
pub const SEMAPHORE_CAPACITY: usize = 8;

/// The number of slots in the message queue registry.
pub const MSG_QUEUE_CAPACITY: usize = 4;

/// The number of slots in the barrier registry.
pub const BARRIER_CAPACITY: usize = 4;

/// The maximum number of concurrently registered timeouts.
pub const TIMEOUT_CAPACITY: usize = 16;

/// The number of task priority levels. Valid priorities are
/// `0..PRIORITY_LEVELS`, with `0` being the highest.
pub const PRIORITY_LEVELS: usize = 64;

/// The largest message (in bytes) a message queue can carry.
pub const MAX_MESSAGE_SIZE: usize = 32;

/// The upper bound on a message queue's pending buffer capacity.
pub const MAX_PENDING_MESSAGES: usize = 16;

pub(crate) const PRIORITY_WORD_COUNT: usize =
    (PRIORITY_LEVELS + usize::BITS as usize - 1) / usize::BITS as usize;

/// The bitmap type used by the fixed-priority ready queue.
pub(crate) type PriorityBitmap = TwoLevelBitmap<PRIORITY_LEVELS, PRIORITY_WORD_COUNT>;

/// Task priority. Lower values mean higher urgency.
pub type Priority = u8;

/// A duration or timeout measured in timer ticks.
pub type Ticks = u32;

/// An absolute point on the kernel's tick counter. Also used for EDF
/// deadlines.
pub type Time = u64;
