//! Homogeneous item storage: one sub-collection per item kind.
//!
//! Each storage owns the live items of one kind (scopes, declarations, or
//! diagnostics), their offset-table entries, and the temporary items that
//! never reach disk. Local indices are 1-based; index 0 is reserved.
//! Clearing an index only nulls the slot; indices are never renumbered
//! while the unit is alive, so stale references resolve to "gone" instead
//! of to a different item.

use strata_common::{InternalError, StrataResult};
use strata_store::Record;

use crate::item::StoredKind;

/// Base of the temporary index space. Temporary items are numbered downwards
/// from here, so they never collide with persisted indices, and the highest
/// bit always stays zero.
pub(crate) const TEMPORARY_BASE: u32 = 0x0FFF_FFFF;

/// Returns `true` if `index` lies in the temporary half of the index space.
pub fn is_temporary_index(index: u32) -> bool {
    index >= TEMPORARY_BASE / 2
}

/// One entry of a persisted offset table.
///
/// `data_offset` is the item's position in the payload arena (0 means the
/// item was deleted and has no payload); `parent_scope` is the local index
/// of the owning scope (0 means the file-level scope).
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ItemOffset {
    /// Offset of the item's record in the arena, or 0 for "deleted".
    pub data_offset: u32,
    /// Local index of the parent scope, or 0 for the file-level scope.
    pub parent_scope: u32,
}

/// A live item: its local index, its parent scope, and its typed payload.
#[derive(Clone, PartialEq, Debug)]
pub struct Item<T> {
    /// 1-based local index of the item within its unit and kind.
    pub local_index: u32,
    /// Local index of the parent scope (0 = file-level scope).
    pub parent_scope: u32,
    /// The typed payload.
    pub data: T,
}

struct Slot<T> {
    item: Item<T>,
    dirty: bool,
}

/// The in-memory side of one item kind's storage.
pub(crate) struct ItemStorage<T> {
    /// Resident items; `None` slots are deleted or not yet materialized.
    slots: Vec<Option<Slot<T>>>,
    /// Offset-table entries for persisted items (parallel to `slots` once
    /// the tables are loaded).
    offsets: Vec<ItemOffset>,
    /// Temporary items, never persisted.
    temporary: Vec<Option<Item<T>>>,
    /// Set when an index was allocated or cleared since the last store.
    structurally_changed: bool,
}

impl<T: StoredKind> ItemStorage<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            offsets: Vec::new(),
            temporary: Vec::new(),
            structurally_changed: false,
        }
    }

    /// Allocates an index for a new item. The returned index is never zero.
    /// Temporary items go to the separate never-persisted space.
    pub(crate) fn allocate(&mut self, parent_scope: u32, data: T, temporary: bool) -> u32 {
        if temporary {
            let index = TEMPORARY_BASE - self.temporary.len() as u32 - 1;
            self.temporary.push(Some(Item {
                local_index: index,
                parent_scope,
                data,
            }));
            index
        } else {
            let index = self.slots.len() as u32 + 1;
            self.slots.push(Some(Slot {
                item: Item {
                    local_index: index,
                    parent_scope,
                    data,
                },
                dirty: true,
            }));
            self.structurally_changed = true;
            index
        }
    }

    /// Nulls the slot of `index`. Other indices keep their numbering.
    pub(crate) fn clear_index(&mut self, index: u32) -> bool {
        if is_temporary_index(index) {
            let position = (TEMPORARY_BASE - index) as usize;
            match self.temporary.get_mut(position.wrapping_sub(1)) {
                Some(slot) => {
                    *slot = None;
                    true
                }
                None => false,
            }
        } else {
            let Some(real) = (index as usize).checked_sub(1) else {
                return false;
            };
            match self.slots.get_mut(real) {
                Some(slot) => {
                    *slot = None;
                    if let Some(offset) = self.offsets.get_mut(real) {
                        *offset = ItemOffset::default();
                    }
                    self.structurally_changed = true;
                    true
                }
                None => false,
            }
        }
    }

    /// Wholesale reset of the collection (used for diagnostics, which a
    /// reparse replaces as a group). Numbering restarts at 1.
    pub(crate) fn clear_all(&mut self) {
        self.slots.clear();
        self.offsets.clear();
        self.temporary.clear();
        self.structurally_changed = true;
    }

    /// Returns the cached item for `index` without touching the arena.
    pub(crate) fn cached(&self, index: u32) -> Option<Item<T>> {
        if is_temporary_index(index) {
            let position = (TEMPORARY_BASE - index) as usize;
            self.temporary.get(position.checked_sub(1)?)?.clone()
        } else {
            let slot = self.slots.get((index as usize).checked_sub(1)?)?;
            slot.as_ref().map(|slot| slot.item.clone())
        }
    }

    /// Caches a freshly materialized item (not dirty, it matches disk).
    pub(crate) fn cache_materialized(&mut self, item: Item<T>) {
        let real = (item.local_index as usize) - 1;
        debug_assert!(real < self.slots.len());
        if let Some(slot) = self.slots.get_mut(real) {
            *slot = Some(Slot { item, dirty: false });
        }
    }

    /// Applies a mutation to a cached item and marks it dirty. Returns
    /// `false` if the index has no resident item.
    pub(crate) fn mutate(&mut self, index: u32, f: impl FnOnce(&mut T)) -> bool {
        if is_temporary_index(index) {
            let position = (TEMPORARY_BASE - index) as usize;
            let Some(Some(item)) = self.temporary.get_mut(position.wrapping_sub(1)) else {
                return false;
            };
            f(&mut item.data);
            true
        } else {
            let Some(real) = (index as usize).checked_sub(1) else {
                return false;
            };
            let Some(Some(slot)) = self.slots.get_mut(real) else {
                return false;
            };
            f(&mut slot.item.data);
            slot.dirty = true;
            true
        }
    }

    /// The offset-table entry for a persisted index, if the index is in
    /// range.
    pub(crate) fn offset_for(&self, index: u32) -> Option<ItemOffset> {
        self.offsets.get((index as usize).checked_sub(1)?).copied()
    }

    /// Whether the item for `index` is resident (temporary items always are).
    pub(crate) fn is_loaded(&self, index: u32) -> bool {
        if is_temporary_index(index) {
            true
        } else {
            matches!(
                (index as usize)
                    .checked_sub(1)
                    .and_then(|real| self.slots.get(real)),
                Some(Some(_))
            )
        }
    }

    /// Number of persisted index slots (not counting temporaries).
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` if anything changed since the last store: a new or cleared
    /// index, or a mutated resident item.
    pub(crate) fn has_changes(&self) -> bool {
        self.structurally_changed
            || self
                .slots
                .iter()
                .any(|slot| matches!(slot, Some(slot) if slot.dirty))
    }

    /// Reads the offset table from the record and sizes the slot vector.
    /// Items stay unmaterialized.
    pub(crate) fn read_table(&mut self, record: &mut Record<'_>) -> StrataResult<()> {
        debug_assert!(self.slots.is_empty() && self.offsets.is_empty());

        let count = record
            .read_u32()
            .ok_or_else(|| InternalError::new("truncated offset table header"))?
            as usize;
        let bytes = record.read(count * 8);
        if bytes.len() != count * 8 {
            return Err(InternalError::new(format!(
                "offset table truncated: expected {count} entries"
            )));
        }

        self.offsets = bytes
            .chunks_exact(8)
            .map(|entry| ItemOffset {
                data_offset: u32::from_le_bytes(entry[0..4].try_into().unwrap()),
                parent_scope: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
            })
            .collect();
        self.slots.resize_with(count, || None);
        Ok(())
    }

    /// Writes the offset table to the record.
    pub(crate) fn write_table(&self, record: &mut Record<'_>) {
        record.write_u32(self.offsets.len() as u32);
        for offset in &self.offsets {
            record.write_u32(offset.data_offset);
            record.write_u32(offset.parent_scope);
        }
    }

    /// Serializes every resident item into `new_arena` and rebuilds the
    /// offset table in the same pass.
    ///
    /// Unresolved items that were never touched are copied verbatim from the
    /// old arena to avoid needless deserialization, but only when
    /// `reuse_old` says the stored format version matches the current one.
    /// The caller materializes everything beforehand otherwise.
    pub(crate) fn store_data(
        &mut self,
        new_arena: &mut Vec<u8>,
        old_arena: Option<&[u8]>,
        reuse_old: bool,
    ) -> StrataResult<()> {
        let old_offsets = std::mem::take(&mut self.offsets);
        let mut new_offsets = Vec::with_capacity(self.slots.len());

        for (position, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(slot) => {
                    let payload = slot.item.data.encode().map_err(|e| {
                        InternalError::new(format!(
                            "cannot encode {} {}: {e}",
                            T::KIND_NAME,
                            position + 1
                        ))
                    })?;
                    let data_offset =
                        append_record(new_arena, slot.item.data.type_tag(), &payload);
                    new_offsets.push(ItemOffset {
                        data_offset,
                        parent_scope: slot.item.parent_scope,
                    });
                    slot.dirty = false;
                }
                None => {
                    let old = old_offsets.get(position).copied().unwrap_or_default();
                    if old.data_offset == 0 {
                        new_offsets.push(ItemOffset::default());
                        continue;
                    }
                    if !reuse_old {
                        // The store path materializes everything before
                        // refusing verbatim reuse; reaching this is a bug.
                        return Err(InternalError::new(format!(
                            "unmaterialized {} {} survived a format upgrade",
                            T::KIND_NAME,
                            position + 1
                        )));
                    }
                    let arena = old_arena.ok_or_else(|| {
                        InternalError::new("old arena missing during verbatim item copy")
                    })?;
                    let raw = raw_record_at(arena, old.data_offset).ok_or_else(|| {
                        InternalError::new(format!(
                            "{} {} points outside the old arena",
                            T::KIND_NAME,
                            position + 1
                        ))
                    })?;
                    let data_offset = new_arena.len() as u32;
                    new_arena.extend_from_slice(raw);
                    new_offsets.push(ItemOffset {
                        data_offset,
                        parent_scope: old.parent_scope,
                    });
                }
            }
        }

        self.offsets = new_offsets;
        self.structurally_changed = false;
        Ok(())
    }

    /// Indices (1-based) of persisted slots that are offset-backed but not
    /// yet resident. Used to force full materialization.
    pub(crate) fn unmaterialized_indices(&self) -> Vec<u32> {
        self.offsets
            .iter()
            .enumerate()
            .filter(|(position, offset)| {
                offset.data_offset != 0
                    && matches!(self.slots.get(*position), Some(None))
            })
            .map(|(position, _)| position as u32 + 1)
            .collect()
    }

    /// Forgets the offset table (after delete-from-disk every resident item
    /// owns its data and nothing references the arena anymore).
    pub(crate) fn detach_offsets(&mut self) {
        for offset in &mut self.offsets {
            *offset = ItemOffset::default();
        }
        self.structurally_changed = true;
    }
}

/// Appends one framed item record (`[u32 len][u16 tag][payload]`) to the
/// arena and returns its offset.
pub(crate) fn append_record(arena: &mut Vec<u8>, tag: u16, payload: &[u8]) -> u32 {
    let offset = arena.len() as u32;
    let len = (payload.len() + 2) as u32;
    arena.extend_from_slice(&len.to_le_bytes());
    arena.extend_from_slice(&tag.to_le_bytes());
    arena.extend_from_slice(payload);
    offset
}

/// Reads the tag and payload of the record at `offset`.
pub(crate) fn record_at(arena: &[u8], offset: u32) -> Option<(u16, &[u8])> {
    let raw = raw_record_at(arena, offset)?;
    let tag = u16::from_le_bytes(raw[4..6].try_into().ok()?);
    Some((tag, &raw[6..]))
}

/// Returns the full framed bytes of the record at `offset` (for verbatim
/// copies between arenas).
pub(crate) fn raw_record_at(arena: &[u8], offset: u32) -> Option<&[u8]> {
    let start = offset as usize;
    let header_end = start.checked_add(4)?;
    if header_end > arena.len() {
        return None;
    }
    let len = u32::from_le_bytes(arena[start..header_end].try_into().ok()?) as usize;
    if len < 2 {
        return None;
    }
    let end = header_end.checked_add(len)?;
    if end > arena.len() {
        return None;
    }
    Some(&arena[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DeclKind, DeclarationData};
    use strata_common::Span;

    fn decl(name: &str) -> DeclarationData {
        DeclarationData {
            name: name.to_string(),
            kind: DeclKind::Variable,
            span: Span::DUMMY,
            is_definition: true,
        }
    }

    #[test]
    fn allocation_is_one_based() {
        let mut storage = ItemStorage::new();
        assert_eq!(storage.allocate(0, decl("a"), false), 1);
        assert_eq!(storage.allocate(1, decl("b"), false), 2);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn temporary_indices_come_from_the_upper_half() {
        let mut storage = ItemStorage::new();
        let persistent = storage.allocate(0, decl("p"), false);
        let temp = storage.allocate(0, decl("t"), true);

        assert!(!is_temporary_index(persistent));
        assert!(is_temporary_index(temp));
        assert_eq!(temp, TEMPORARY_BASE - 1);
        assert_eq!(storage.cached(temp).unwrap().data.name, "t");
    }

    #[test]
    fn clearing_nulls_without_renumbering() {
        let mut storage = ItemStorage::new();
        let first = storage.allocate(0, decl("first"), false);
        let second = storage.allocate(0, decl("second"), false);

        assert!(storage.clear_index(first));
        assert!(storage.cached(first).is_none());
        // The other index keeps resolving to the same item.
        assert_eq!(storage.cached(second).unwrap().data.name, "second");
        // A further allocation does not reuse the cleared index.
        assert_eq!(storage.allocate(0, decl("third"), false), 3);
    }

    #[test]
    fn clear_out_of_range_is_false() {
        let mut storage: ItemStorage<DeclarationData> = ItemStorage::new();
        assert!(!storage.clear_index(0));
        assert!(!storage.clear_index(5));
    }

    #[test]
    fn change_tracking() {
        let mut storage: ItemStorage<DeclarationData> = ItemStorage::new();
        assert!(!storage.has_changes());
        let index = storage.allocate(0, decl("x"), false);
        assert!(storage.has_changes());

        let mut arena = vec![0_u8];
        storage.store_data(&mut arena, None, true).unwrap();
        assert!(!storage.has_changes());

        assert!(storage.mutate(index, |d| d.name = "y".to_string()));
        assert!(storage.has_changes());
    }

    #[test]
    fn store_data_writes_offsets_and_arena() {
        let mut storage = ItemStorage::new();
        storage.allocate(0, decl("a"), false);
        storage.allocate(1, decl("b"), false);

        let mut arena = vec![0_u8];
        storage.store_data(&mut arena, None, true).unwrap();

        let first = storage.offset_for(1).unwrap();
        let second = storage.offset_for(2).unwrap();
        assert_ne!(first.data_offset, 0);
        assert_ne!(second.data_offset, 0);
        assert_eq!(second.parent_scope, 1);

        let (tag, payload) = record_at(&arena, first.data_offset).unwrap();
        assert_eq!(tag, crate::item::TAG_DECLARATION);
        assert!(!payload.is_empty());
    }

    #[test]
    fn store_data_copies_unmaterialized_verbatim() {
        // Build an "old" arena with two records, then a storage whose slots
        // are unmaterialized (as after a table load).
        let mut old_arena = vec![0_u8];
        let a = decl("alpha").encode().unwrap();
        let b = decl("beta").encode().unwrap();
        let off_a = append_record(&mut old_arena, crate::item::TAG_DECLARATION, &a);
        let off_b = append_record(&mut old_arena, crate::item::TAG_DECLARATION, &b);

        let mut storage: ItemStorage<DeclarationData> = ItemStorage::new();
        storage.offsets = vec![
            ItemOffset {
                data_offset: off_a,
                parent_scope: 0,
            },
            ItemOffset {
                data_offset: off_b,
                parent_scope: 1,
            },
        ];
        storage.slots.resize_with(2, || None);

        let mut new_arena = vec![0_u8];
        storage
            .store_data(&mut new_arena, Some(&old_arena), true)
            .unwrap();

        let copied = storage.offset_for(1).unwrap();
        let (_, payload) = record_at(&new_arena, copied.data_offset).unwrap();
        assert_eq!(payload, a.as_slice());
        assert_eq!(storage.offset_for(2).unwrap().parent_scope, 1);
    }

    #[test]
    fn store_data_refuses_verbatim_across_versions() {
        let mut old_arena = vec![0_u8];
        let a = decl("alpha").encode().unwrap();
        let off_a = append_record(&mut old_arena, crate::item::TAG_DECLARATION, &a);

        let mut storage: ItemStorage<DeclarationData> = ItemStorage::new();
        storage.offsets = vec![ItemOffset {
            data_offset: off_a,
            parent_scope: 0,
        }];
        storage.slots.resize_with(1, || None);

        let mut new_arena = vec![0_u8];
        assert!(storage
            .store_data(&mut new_arena, Some(&old_arena), false)
            .is_err());
    }

    #[test]
    fn record_at_rejects_out_of_bounds() {
        let mut arena = vec![0_u8];
        append_record(&mut arena, 1, b"xy");
        assert!(record_at(&arena, arena.len() as u32).is_none());
        assert!(record_at(&arena, (arena.len() as u32) - 2).is_none());
        assert!(raw_record_at(b"", 0).is_none());
    }

    #[test]
    fn unmaterialized_indices_reports_offset_backed_holes() {
        let mut storage: ItemStorage<DeclarationData> = ItemStorage::new();
        storage.offsets = vec![
            ItemOffset {
                data_offset: 1,
                parent_scope: 0,
            },
            ItemOffset::default(),
            ItemOffset {
                data_offset: 40,
                parent_scope: 0,
            },
        ];
        storage.slots.resize_with(3, || None);
        storage.cache_materialized(Item {
            local_index: 1,
            parent_scope: 0,
            data: decl("resident"),
        });

        assert_eq!(storage.unmaterialized_indices(), vec![3]);
    }
}
