//! Relation collection state machine.
//!
//! A collection is in exactly one of three states:
//!
//! - `Unloaded` - membership in storage is unknown; local adds and removes are
//!   kept as deltas and merged in when the collection loads
//! - `PendingSet` - the caller replaced the whole membership before loading; the
//!   set is diffed against storage when the collection loads
//! - `Loaded` - the full membership is known
//!
//! This module only tracks local membership. Keeping the reciprocal side and the
//! join-row ledger in step is the job of [`EntityGraph`](crate::EntityGraph).

use crate::entity::EntityHandle;

/// Current membership representation of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionState {
    Unloaded {
        /// Added before load, in add order.
        added: Vec<EntityHandle>,
        /// Removed before load.
        removed: Vec<EntityHandle>,
    },
    PendingSet(Vec<EntityHandle>),
    Loaded(Vec<EntityHandle>),
}

/// Membership of one relation field of one entity, plus the changes made to it
/// since the last successful flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationCollection {
    state: CollectionState,
    added_since_flush: Vec<EntityHandle>,
    removed_since_flush: Vec<EntityHandle>,
}

impl RelationCollection {
    pub fn unloaded() -> Self {
        Self::with_state(CollectionState::Unloaded {
            added: Vec::new(),
            removed: Vec::new(),
        })
    }

    pub fn loaded_empty() -> Self {
        Self::with_state(CollectionState::Loaded(Vec::new()))
    }

    fn with_state(state: CollectionState) -> Self {
        Self {
            state,
            added_since_flush: Vec::new(),
            removed_since_flush: Vec::new(),
        }
    }

    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, CollectionState::Loaded(_))
    }

    pub fn has_pending_set(&self) -> bool {
        matches!(self.state, CollectionState::PendingSet(_))
    }

    /// Members when they are known without a query.
    pub fn members(&self) -> Option<&[EntityHandle]> {
        match &self.state {
            CollectionState::Loaded(members) | CollectionState::PendingSet(members) => {
                Some(members)
            }
            CollectionState::Unloaded { .. } => None,
        }
    }

    /// Membership answer from local knowledge only.
    ///
    /// `None` means the answer depends on storage.
    pub fn contains_known(&self, other: EntityHandle) -> Option<bool> {
        match &self.state {
            CollectionState::Loaded(members) | CollectionState::PendingSet(members) => {
                Some(members.contains(&other))
            }
            CollectionState::Unloaded { added, removed } => {
                if added.contains(&other) {
                    Some(true)
                } else if removed.contains(&other) {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }

    /// Add `other` locally. Returns false when nothing changed.
    pub fn local_add(&mut self, other: EntityHandle) -> bool {
        match &mut self.state {
            CollectionState::Loaded(members) | CollectionState::PendingSet(members) => {
                if members.contains(&other) {
                    return false;
                }
                members.push(other);
                true
            }
            CollectionState::Unloaded { added, removed } => {
                let was_removed = remove_item(removed, other);
                if added.contains(&other) {
                    return was_removed;
                }
                added.push(other);
                true
            }
        }
    }

    /// Remove `other` locally. Returns false when nothing changed.
    pub fn local_remove(&mut self, other: EntityHandle) -> bool {
        match &mut self.state {
            CollectionState::Loaded(members) | CollectionState::PendingSet(members) => {
                remove_item(members, other)
            }
            CollectionState::Unloaded { added, removed } => {
                let was_added = remove_item(added, other);
                if removed.contains(&other) {
                    return was_added;
                }
                removed.push(other);
                true
            }
        }
    }

    pub(crate) fn record_add(&mut self, other: EntityHandle) {
        if !remove_item(&mut self.removed_since_flush, other)
            && !self.added_since_flush.contains(&other)
        {
            self.added_since_flush.push(other);
        }
    }

    pub(crate) fn record_remove(&mut self, other: EntityHandle) {
        if !remove_item(&mut self.added_since_flush, other)
            && !self.removed_since_flush.contains(&other)
        {
            self.removed_since_flush.push(other);
        }
    }

    /// Replace membership wholesale before load.
    pub(crate) fn set_pending(&mut self, values: Vec<EntityHandle>) {
        self.state = CollectionState::PendingSet(values);
    }

    /// Merge a freshly fetched baseline into local deltas and become loaded.
    ///
    /// Additions made before load come first, in add order; removals are
    /// dropped from the baseline. Returns the pending set, if one was waiting,
    /// so the caller can diff it against the baseline.
    pub(crate) fn merge_loaded(&mut self, baseline: Vec<EntityHandle>) -> Option<Vec<EntityHandle>> {
        let previous = std::mem::replace(&mut self.state, CollectionState::Loaded(Vec::new()));
        match previous {
            CollectionState::Unloaded { added, removed } => {
                let mut merged: Vec<EntityHandle> = added
                    .into_iter()
                    .filter(|h| !baseline.contains(h))
                    .collect();
                merged.extend(baseline.into_iter().filter(|h| !removed.contains(h)));
                dedup_in_place(&mut merged);
                self.state = CollectionState::Loaded(merged);
                None
            }
            CollectionState::PendingSet(values) => {
                let mut baseline = baseline;
                dedup_in_place(&mut baseline);
                self.state = CollectionState::Loaded(baseline);
                Some(values)
            }
            CollectionState::Loaded(_) => {
                // Reload: re-apply this unit of work's own changes on top.
                let mut merged: Vec<EntityHandle> = self
                    .added_since_flush
                    .iter()
                    .copied()
                    .filter(|h| !baseline.contains(h))
                    .collect();
                merged.extend(
                    baseline
                        .into_iter()
                        .filter(|h| !self.removed_since_flush.contains(h)),
                );
                dedup_in_place(&mut merged);
                self.state = CollectionState::Loaded(merged);
                None
            }
        }
    }

    /// Overwrite the members of a loaded collection.
    pub(crate) fn replace_loaded(&mut self, members: Vec<EntityHandle>) {
        self.state = CollectionState::Loaded(members);
    }

    /// Members added since the last flush.
    pub fn added(&self) -> &[EntityHandle] {
        &self.added_since_flush
    }

    /// Members removed since the last flush.
    pub fn removed(&self) -> &[EntityHandle] {
        &self.removed_since_flush
    }

    pub(crate) fn clear_changes(&mut self) {
        self.added_since_flush.clear();
        self.removed_since_flush.clear();
    }
}

fn remove_item(items: &mut Vec<EntityHandle>, item: EntityHandle) -> bool {
    let before = items.len();
    items.retain(|h| *h != item);
    items.len() != before
}

fn dedup_in_place(items: &mut Vec<EntityHandle>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|h| seen.insert(*h));
}

/// Options for loading a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Return hard- and soft-deleted members too.
    pub include_deleted: bool,
    /// Query storage even when the collection is already loaded.
    pub force_reload: bool,
}

impl LoadOptions {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `include_deleted` option (builder pattern).
    #[must_use]
    pub fn include_deleted(mut self, value: bool) -> Self {
        self.include_deleted = value;
        self
    }

    /// Set the `force_reload` option (builder pattern).
    #[must_use]
    pub fn force_reload(mut self, value: bool) -> Self {
        self.force_reload = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: usize) -> EntityHandle {
        EntityHandle::from_index(n)
    }

    #[test]
    fn add_is_idempotent() {
        let mut loaded = RelationCollection::loaded_empty();
        assert!(loaded.local_add(h(1)));
        assert!(!loaded.local_add(h(1)));
        assert_eq!(loaded.members(), Some(&[h(1)][..]));

        let mut unloaded = RelationCollection::unloaded();
        assert!(unloaded.local_add(h(1)));
        assert!(!unloaded.local_add(h(1)));
    }

    #[test]
    fn remove_then_add_before_load_cancels() {
        let mut c = RelationCollection::unloaded();
        assert!(c.local_remove(h(1)));
        assert_eq!(c.contains_known(h(1)), Some(false));
        assert!(c.local_add(h(1)));
        assert_eq!(c.contains_known(h(1)), Some(true));
        assert_eq!(c.contains_known(h(2)), None);
    }

    #[test]
    fn merge_prepends_additions_and_drops_removals() {
        // storage {x, y}; add z; remove x => [z, y]
        let (x, y, z) = (h(1), h(2), h(3));
        let mut c = RelationCollection::unloaded();
        c.local_add(z);
        c.local_remove(x);
        assert!(c.merge_loaded(vec![x, y]).is_none());
        assert_eq!(c.members(), Some(&[z, y][..]));
    }

    #[test]
    fn merge_keeps_add_order_for_multiple_additions() {
        let mut c = RelationCollection::unloaded();
        c.local_add(h(5));
        c.local_add(h(6));
        c.merge_loaded(vec![h(1)]);
        assert_eq!(c.members(), Some(&[h(5), h(6), h(1)][..]));
    }

    #[test]
    fn merge_deduplicates_additions_already_stored() {
        let mut c = RelationCollection::unloaded();
        c.local_add(h(1));
        c.merge_loaded(vec![h(1), h(2)]);
        assert_eq!(c.members(), Some(&[h(1), h(2)][..]));
    }

    #[test]
    fn pending_set_is_returned_on_merge() {
        let mut c = RelationCollection::unloaded();
        c.local_add(h(9));
        c.set_pending(vec![h(2), h(3)]);
        assert!(c.has_pending_set());
        assert_eq!(c.members(), Some(&[h(2), h(3)][..]));
        let pending = c.merge_loaded(vec![h(1), h(2)]);
        assert_eq!(pending, Some(vec![h(2), h(3)]));
        assert_eq!(c.members(), Some(&[h(1), h(2)][..]));
    }

    #[test]
    fn change_tracking_cancels_out() {
        let mut c = RelationCollection::loaded_empty();
        c.record_add(h(1));
        c.record_remove(h(1));
        assert!(c.added().is_empty());
        assert!(c.removed().is_empty());
        c.record_remove(h(2));
        assert_eq!(c.removed(), &[h(2)]);
    }

    #[test]
    fn reload_reapplies_local_changes() {
        let mut c = RelationCollection::loaded_empty();
        c.local_add(h(7));
        c.record_add(h(7));
        c.merge_loaded(vec![h(1)]);
        assert_eq!(c.members(), Some(&[h(7), h(1)][..]));
    }
}
