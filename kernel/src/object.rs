//! Object identifiers
//!
//! Every thread carries an [`ObjectId`] handed out by an [`ObjectRegistry`].
//! The core never manages uniqueness itself; it only asks the registry to
//! allocate, validate and free.
//!
//! Identifier layout (32 bits):
//!
//! ```text
//!  31    27 26  24 23     16 15              0
//! +--------+------+---------+----------------+
//! | class  | api  |  node   |     index      |
//! +--------+------+---------+----------------+
//! ```

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Class number used for thread identifiers
pub const THREAD_CLASS: u8 = 1;

/// API field of an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectApi {
    Internal = 1,
    Classic = 2,
    Posix = 3,
}

impl ObjectApi {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Internal),
            2 => Some(Self::Classic),
            3 => Some(Self::Posix),
            _ => None,
        }
    }
}

/// Opaque object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    const NODE_SHIFT: u32 = 16;
    const API_SHIFT: u32 = 24;
    const CLASS_SHIFT: u32 = 27;

    pub const fn build(api: ObjectApi, class: u8, node: u8, index: u16) -> Self {
        Self(
            ((class as u32 & 0x1f) << Self::CLASS_SHIFT)
                | ((api as u32 & 0x7) << Self::API_SHIFT)
                | ((node as u32) << Self::NODE_SHIFT)
                | index as u32,
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub const fn node(self) -> u8 {
        ((self.0 >> Self::NODE_SHIFT) & 0xff) as u8
    }

    pub fn api(self) -> Option<ObjectApi> {
        ObjectApi::from_bits(((self.0 >> Self::API_SHIFT) & 0x7) as u8)
    }

    pub const fn class(self) -> u8 {
        ((self.0 >> Self::CLASS_SHIFT) & 0x1f) as u8
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Handle registry consumed by the core
pub trait ObjectRegistry: Send {
    /// Allocate a fresh identifier, `None` when the registry is full
    fn allocate(&mut self, api: ObjectApi) -> Option<ObjectId>;

    /// Is this identifier currently allocated?
    fn is_valid(&self, id: ObjectId) -> bool;

    /// Return an identifier to the registry
    fn free(&mut self, id: ObjectId);

    /// Number of identifiers currently allocated
    fn active_count(&self) -> usize;
}

/// Local identifier table
///
/// Indices start at 1. Freed indices go to the back of the inactive FIFO so
/// a handle is reused as late as possible.
pub struct ObjectTable {
    node: u8,
    class: u8,
    slots: Vec<Option<ObjectId>>,
    inactive: VecDeque<u16>,
}

impl ObjectTable {
    pub fn new(node: u8, class: u8, maximum: usize) -> Self {
        let maximum = maximum.min(u16::MAX as usize) as u16;
        Self {
            node,
            class,
            slots: vec![None; maximum as usize + 1],
            inactive: (1..=maximum).collect(),
        }
    }

    pub fn maximum(&self) -> usize {
        self.slots.len() - 1
    }
}

impl ObjectRegistry for ObjectTable {
    fn allocate(&mut self, api: ObjectApi) -> Option<ObjectId> {
        let index = self.inactive.pop_front()?;
        let id = ObjectId::build(api, self.class, self.node, index);
        self.slots[index as usize] = Some(id);
        Some(id)
    }

    fn is_valid(&self, id: ObjectId) -> bool {
        self.slots
            .get(id.index() as usize)
            .map_or(false, |slot| *slot == Some(id))
    }

    fn free(&mut self, id: ObjectId) {
        if !self.is_valid(id) {
            log::warn!("[OBJ] free of unknown id {}", id);
            return;
        }
        let index = id.index();
        self.slots[index as usize] = None;
        self.inactive.push_back(index);
    }

    fn active_count(&self) -> usize {
        self.maximum() - self.inactive.len()
    }
}
