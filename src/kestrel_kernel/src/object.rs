//! Object directory: identifiers, names, and per-class registries.
//!
//! Every kernel object is addressed by a 32-bit [`Id`] that encodes the
//! object's class, the node it lives on, and the registry slot it occupies.
//! A slot's generation number advances every time the slot is closed, so an
//! `Id` held across a delete/recreate cycle is detected as stale instead of
//! silently aliasing the new object.
use core::num::NonZeroU32;

use crate::{
    error::{BadIdError, BadNameError, TooManyError},
    utils::Init,
};

/// The node number of this (single-node) kernel instance. Never zero, which
/// keeps every well-formed `Id` non-zero.
pub const LOCAL_NODE: u32 = 1;

/// The API class field value used for all objects created by this kernel.
const API_CLASS: u32 = 1;

/// A 32-bit object name.
///
/// Conventionally built from four ASCII bytes with [`build_name`].
pub type Name = u32;

/// Build an object [`Name`] from four bytes.
///
/// # Examples
///
/// ```
/// use kestrel_kernel::build_name;
/// assert_eq!(build_name(*b"SEM1"), 0x53454d31);
/// ```
#[inline]
pub const fn build_name(bytes: [u8; 4]) -> Name {
    u32::from_be_bytes(bytes)
}

/// The class of a kernel object, stored in the topmost field of an [`Id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectClass {
    Task = 1,
    Mutex = 2,
    Semaphore = 3,
    MessageQueue = 4,
    Barrier = 5,
}

/// A 32-bit kernel object identifier.
///
/// Bit layout, from the most significant bit down:
///
/// ```text
/// | class: 5 | api: 3 | node: 8 | generation: 8 | slot: 8 |
/// ```
///
/// The `node` field is always [`LOCAL_NODE`] for objects created by this
/// kernel, which guarantees the raw value is non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(NonZeroU32);

impl Id {
    const CLASS_SHIFT: u32 = 27;
    const API_SHIFT: u32 = 24;
    const NODE_SHIFT: u32 = 16;
    const GEN_SHIFT: u32 = 8;

    pub(crate) fn new(class: ObjectClass, generation: u8, slot: u8) -> Self {
        let raw = ((class as u32) << Self::CLASS_SHIFT)
            | (API_CLASS << Self::API_SHIFT)
            | (LOCAL_NODE << Self::NODE_SHIFT)
            | ((generation as u32) << Self::GEN_SHIFT)
            | slot as u32;
        // The node field is `LOCAL_NODE` (non-zero)
        Self(NonZeroU32::new(raw).unwrap())
    }

    /// Reconstruct an `Id` from its raw 32-bit value.
    ///
    /// Returns `None` if the value is zero. No other validation is done here;
    /// a nonsensical `Id` is rejected with `BadId` when it's used.
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    /// Get the raw 32-bit value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0.get()
    }

    #[inline]
    fn class_field(self) -> u32 {
        self.raw() >> Self::CLASS_SHIFT
    }

    #[inline]
    fn api_field(self) -> u32 {
        (self.raw() >> Self::API_SHIFT) & 0b111
    }

    /// The node field.
    #[inline]
    pub const fn node(self) -> u32 {
        (self.raw() >> Self::NODE_SHIFT) & 0xff
    }

    /// The slot generation field.
    #[inline]
    pub const fn generation(self) -> u8 {
        (self.raw() >> Self::GEN_SHIFT) as u8
    }

    /// The registry slot field.
    #[inline]
    pub const fn slot(self) -> u8 {
        self.raw() as u8
    }
}

impl core::fmt::Debug for Id {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Id({:#010x})", self.raw())
    }
}

#[derive(Clone, Copy)]
struct Slot {
    occupied: bool,
    generation: u8,
    name: Name,
}

impl Init for Slot {
    const INIT: Self = Self {
        occupied: false,
        generation: 0,
        name: 0,
    };
}

/// The object directory for one object class: a fixed array of slots.
///
/// All operations must run under the CPU lock; the registry itself has no
/// interior locking. `get` is a constant-time index check, `ident` a linear
/// name scan.
pub(crate) struct Registry<const N: usize> {
    class: ObjectClass,
    slots: [Slot; N],
}

impl<const N: usize> Registry<N> {
    pub(crate) const fn new(class: ObjectClass) -> Self {
        Self {
            class,
            slots: [Slot::INIT; N],
        }
    }

    /// Claim the lowest-numbered free slot and bind `name` to it.
    pub(crate) fn allocate(&mut self, name: Name) -> Result<(usize, Id), TooManyError> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.occupied {
                slot.occupied = true;
                slot.name = name;
                return Ok((i, Id::new(self.class, slot.generation, i as u8)));
            }
        }
        Err(TooManyError::TooMany)
    }

    /// Resolve `id` to a slot index, validating every field.
    pub(crate) fn get(&self, id: Id) -> Result<usize, BadIdError> {
        let i = id.slot() as usize;
        if id.class_field() != self.class as u32
            || id.api_field() != API_CLASS
            || id.node() != LOCAL_NODE
            || i >= N
        {
            return Err(BadIdError::BadId);
        }
        let slot = &self.slots[i];
        if !slot.occupied || slot.generation != id.generation() {
            return Err(BadIdError::BadId);
        }
        Ok(i)
    }

    /// Find the lowest-indexed object named `name`.
    ///
    /// Duplicate names are permitted; later duplicates are shadowed until the
    /// earlier object is deleted.
    pub(crate) fn ident(&self, name: Name) -> Result<Id, BadNameError> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.occupied && slot.name == name {
                return Ok(Id::new(self.class, slot.generation, i as u8));
            }
        }
        Err(BadNameError::BadName)
    }

    /// Free a slot, advancing its generation so outstanding `Id`s go stale.
    pub(crate) fn close(&mut self, i: usize) {
        let slot = &mut self.slots[i];
        debug_assert!(slot.occupied);
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        let id = Id::new(ObjectClass::Semaphore, 0x42, 7);
        assert_eq!(id.class_field(), ObjectClass::Semaphore as u32);
        assert_eq!(id.api_field(), API_CLASS);
        assert_eq!(id.node(), LOCAL_NODE);
        assert_eq!(id.generation(), 0x42);
        assert_eq!(id.slot(), 7);
        assert_eq!(Id::from_raw(id.raw()), Some(id));
    }

    #[test]
    fn allocate_and_get() {
        let mut reg: Registry<4> = Registry::new(ObjectClass::Task);
        let (i, id) = reg.allocate(build_name(*b"TSK1")).unwrap();
        assert_eq!(i, 0);
        assert_eq!(reg.get(id), Ok(0));
    }

    #[test]
    fn allocate_exhaustion() {
        let mut reg: Registry<2> = Registry::new(ObjectClass::Task);
        reg.allocate(build_name(*b"AAAA")).unwrap();
        reg.allocate(build_name(*b"BBBB")).unwrap();
        assert_eq!(
            reg.allocate(build_name(*b"CCCC")),
            Err(TooManyError::TooMany)
        );
    }

    #[test]
    fn stale_id_rejected_after_close() {
        let mut reg: Registry<4> = Registry::new(ObjectClass::Mutex);
        let (i, id) = reg.allocate(build_name(*b"MTX1")).unwrap();
        reg.close(i);
        assert_eq!(reg.get(id), Err(BadIdError::BadId));

        // Recreating in the same slot must not resurrect the old id
        let (i2, id2) = reg.allocate(build_name(*b"MTX2")).unwrap();
        assert_eq!(i2, i);
        assert_ne!(id, id2);
        assert_eq!(reg.get(id), Err(BadIdError::BadId));
        assert_eq!(reg.get(id2), Ok(i2));
    }

    #[test]
    fn wrong_class_rejected() {
        let mut tasks: Registry<4> = Registry::new(ObjectClass::Task);
        let mutexes: Registry<4> = Registry::new(ObjectClass::Mutex);
        let (_, id) = tasks.allocate(build_name(*b"TSK1")).unwrap();
        assert_eq!(mutexes.get(id), Err(BadIdError::BadId));
    }

    #[test]
    fn foreign_node_rejected() {
        let mut reg: Registry<4> = Registry::new(ObjectClass::Task);
        let (_, id) = reg.allocate(build_name(*b"TSK1")).unwrap();
        let foreign = Id::from_raw(id.raw() ^ (2 << 16)).unwrap();
        assert_eq!(reg.get(foreign), Err(BadIdError::BadId));
    }

    #[test]
    fn ident_returns_lowest_indexed_duplicate() {
        let mut reg: Registry<4> = Registry::new(ObjectClass::Semaphore);
        let name = build_name(*b"SEM ");
        let (_, id0) = reg.allocate(name).unwrap();
        let (_, id1) = reg.allocate(name).unwrap();
        assert_eq!(reg.ident(name), Ok(id0));

        reg.close(reg.get(id0).unwrap());
        assert_eq!(reg.ident(name), Ok(id1));
    }

    #[test]
    fn ident_unknown_name() {
        let reg: Registry<4> = Registry::new(ObjectClass::Barrier);
        assert_eq!(
            reg.ident(build_name(*b"NONE")),
            Err(BadNameError::BadName)
        );
    }
}
