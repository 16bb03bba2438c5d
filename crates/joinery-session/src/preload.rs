//! Load hints, the preload cache, and the preload plugin interface.
//!
//! A [`PreloadPlugin`] can fold part of a load hint into the find that fetches
//! the owners (for example as SQL joins) and hand back the related rows it got
//! for free. Those rows are hydrated and recorded in the unit of work's
//! [`PreloadCache`], which every collection load consults before querying.

use crate::driver::FindQuery;
use joinery_core::{EntityMetadata, Result, Row, TaggedId};
use std::collections::{BTreeMap, HashMap};

/// A tree of relation names to load, e.g. `books.reviews` plus `tags`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadHint {
    children: BTreeMap<String, LoadHint>,
}

impl LoadHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a hint from dotted paths.
    pub fn from_paths<S: AsRef<str>>(paths: impl IntoIterator<Item = S>) -> Self {
        let mut hint = Self::new();
        for path in paths {
            hint.add_path(path.as_ref());
        }
        hint
    }

    pub fn add_path(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    #[must_use]
    pub fn with(mut self, path: &str) -> Self {
        self.add_path(path);
        self
    }

    /// Attach an existing sub-tree under `field`.
    pub fn insert(&mut self, field: &str, hint: LoadHint) {
        self.children.insert(field.to_string(), hint);
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&LoadHint> {
        self.children.get(field)
    }

    /// Top-level fields with their nested hints.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &LoadHint)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Dotted paths of every leaf.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (field, sub) in &self.children {
            if sub.is_empty() {
                out.push(field.clone());
            } else {
                out.extend(sub.paths().into_iter().map(|p| format!("{field}.{p}")));
            }
        }
        out
    }
}

/// Related rows a plugin extracted for one owner and relation.
#[derive(Debug, Clone)]
pub struct PreloadedRelation {
    pub owner: TaggedId,
    pub field: &'static str,
    /// Entity type of `rows`.
    pub other: &'static str,
    pub rows: Vec<Row>,
}

/// Collection memberships fetched ahead of time, keyed by owner id and field.
#[derive(Debug, Clone, Default)]
pub struct PreloadCache {
    entries: HashMap<(TaggedId, &'static str), Vec<TaggedId>>,
}

impl PreloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, owner: TaggedId, field: &'static str, members: Vec<TaggedId>) {
        self.entries.insert((owner, field), members);
    }

    /// Add one member, creating the entry if needed.
    pub fn push(&mut self, owner: TaggedId, field: &'static str, member: TaggedId) {
        let members = self.entries.entry((owner, field)).or_default();
        if !members.contains(&member) {
            members.push(member);
        }
    }

    pub fn get(&self, owner: &TaggedId, field: &'static str) -> Option<&[TaggedId]> {
        self.entries
            .get(&(owner.clone(), field))
            .map(Vec::as_slice)
    }

    pub fn remove(&mut self, owner: &TaggedId, field: &'static str) -> Option<Vec<TaggedId>> {
        self.entries.remove(&(owner.clone(), field))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Join-preloading collaborator used by
/// [`UnitOfWork::find_with_hint`](crate::UnitOfWork::find_with_hint).
pub trait PreloadPlugin: Send {
    /// Split `hint` into the part this plugin fetches with the owners' find
    /// and the part left for ordinary batched loads.
    fn partition_hint(&self, meta: &EntityMetadata, hint: &LoadHint) -> (LoadHint, LoadHint);

    /// Rewrite the owners' find so it also returns the preloaded relations.
    fn preload_populate(&self, meta: &EntityMetadata, hint: &LoadHint, query: &mut FindQuery);

    /// Pull the related rows back out of the owners' result rows.
    fn preload_load(
        &self,
        meta: &EntityMetadata,
        hint: &LoadHint,
        rows: &[Row],
    ) -> Result<Vec<PreloadedRelation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_from_paths_builds_a_tree() {
        let hint = LoadHint::from_paths(["books.reviews", "tags", "books"]);
        let fields: Vec<&str> = hint.fields().map(|(f, _)| f).collect();
        assert_eq!(fields, vec!["books", "tags"]);
        assert!(hint.get("books").unwrap().get("reviews").is_some());
        assert_eq!(hint.paths(), vec!["books.reviews".to_string(), "tags".to_string()]);
        assert!(LoadHint::from_paths(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn cache_push_deduplicates() {
        let mut cache = PreloadCache::new();
        let owner = TaggedId::int("a", 1);
        cache.push(owner.clone(), "books", TaggedId::int("b", 1));
        cache.push(owner.clone(), "books", TaggedId::int("b", 1));
        assert_eq!(cache.get(&owner, "books").map(<[TaggedId]>::len), Some(1));
        assert!(cache.get(&owner, "tags").is_none());
        assert!(cache.remove(&owner, "books").is_some());
        assert!(cache.is_empty());
    }
}
