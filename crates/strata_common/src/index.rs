//! The persistent identity of a semantic unit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The dense integer index identifying a semantic unit.
///
/// A unit index is the unit's persistent identity: it names the backend
/// record on disk and the unit's slot in the registry. Index 0 is reserved
/// and never refers to a unit. Indices are unique among all units that are
/// on disk or loaded, and are recycled only after the unit at that index has
/// been explicitly deleted from disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitIndex(u32);

impl UnitIndex {
    /// Creates a unit index from its raw `u32` value.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw `u32` value of this index.
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns `true` if this is the reserved invalid index 0.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// A weak cross-unit reference to one item: `(unit index, local index)`.
///
/// Cross-unit references are never owning pointers; they are resolved lazily
/// through the registry and may resolve to "gone" if the target unit or item
/// has been deleted in the meantime. The item is always exclusively owned by
/// its unit's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ItemRef {
    /// The unit that owns the referenced item.
    pub unit: UnitIndex,
    /// The item's 1-based local index within that unit and kind.
    pub item: u32,
}

impl ItemRef {
    /// Creates a reference to item `item` of unit `unit`.
    pub fn new(unit: UnitIndex, item: u32) -> Self {
        Self { unit, item }
    }
}

impl fmt::Display for UnitIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UnitIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitIndex({})", self.0)
    }
}
