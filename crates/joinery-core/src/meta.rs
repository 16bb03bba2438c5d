//! Entity metadata and the registry that ties entity types together.
//!
//! Metadata is plain data built once at startup. Every relation names its
//! target type and the field on that type that points back, so both sides of a
//! relation can be kept in sync without reflection.
//!
//! The [`MetadataRegistry`] is an explicit object handed to each unit of work;
//! it validates reciprocal declarations and precomputes the foreign-key order
//! used to sequence inserts and deletes.

use crate::error::{Error, Result};
use crate::id::{IdValue, TaggedId, split_tagged};
use std::collections::HashMap;
use std::sync::Arc;

/// Information about a join table backing a many-to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The join table name (e.g., `"authors_to_tags"`).
    pub table_name: &'static str,

    /// Column pointing at the owning side (e.g., `"author_id"`).
    pub local_column: &'static str,

    /// Column pointing at the other side (e.g., `"tag_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    /// Create a new join-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }

    /// The same join table seen from the other side.
    #[must_use]
    pub const fn reversed(self) -> Self {
        Self {
            table_name: self.table_name,
            local_column: self.remote_column,
            remote_column: self.local_column,
        }
    }
}

/// What a field is, including everything needed to navigate a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// The id column.
    PrimaryKey,
    /// A plain column.
    Primitive,
    /// Foreign key on this entity's table.
    ManyToOne {
        other: &'static str,
        /// Collection (one-to-many or one-to-one) on `other` holding this entity
        reciprocal: &'static str,
    },
    /// Children whose many-to-one `reciprocal` points at this entity.
    OneToMany {
        other: &'static str,
        reciprocal: &'static str,
        cascade_delete: bool,
    },
    /// Like one-to-many, with at most one child.
    OneToOne {
        other: &'static str,
        reciprocal: &'static str,
        cascade_delete: bool,
    },
    /// Membership stored as rows of a join table.
    ManyToMany {
        other: &'static str,
        reciprocal: &'static str,
        link: LinkTableInfo,
    },
}

/// A declared field of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: &'static str,
    /// Backing column for primitives, ids and many-to-one references.
    pub column: Option<&'static str>,
    pub kind: FieldKind,
}

impl FieldMeta {
    /// Does this field hold a collection of related entities?
    pub const fn is_collection(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } | FieldKind::ManyToMany { .. }
        )
    }

    /// Is this a many-to-one reference?
    pub const fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::ManyToOne { .. })
    }

    /// Is this a plain column (including version and soft-delete columns)?
    pub const fn is_primitive(&self) -> bool {
        matches!(self.kind, FieldKind::Primitive)
    }

    /// Type on the other side of a relation.
    pub const fn other_type(&self) -> Option<&'static str> {
        match self.kind {
            FieldKind::ManyToOne { other, .. }
            | FieldKind::OneToMany { other, .. }
            | FieldKind::OneToOne { other, .. }
            | FieldKind::ManyToMany { other, .. } => Some(other),
            FieldKind::PrimaryKey | FieldKind::Primitive => None,
        }
    }

    /// Field on the other side of a relation pointing back here.
    pub const fn reciprocal(&self) -> Option<&'static str> {
        match self.kind {
            FieldKind::ManyToOne { reciprocal, .. }
            | FieldKind::OneToMany { reciprocal, .. }
            | FieldKind::OneToOne { reciprocal, .. }
            | FieldKind::ManyToMany { reciprocal, .. } => Some(reciprocal),
            FieldKind::PrimaryKey | FieldKind::Primitive => None,
        }
    }

    /// Should deleting the owner delete the members of this collection?
    pub const fn cascades_delete(&self) -> bool {
        match self.kind {
            FieldKind::OneToMany { cascade_delete, .. }
            | FieldKind::OneToOne { cascade_delete, .. } => cascade_delete,
            _ => false,
        }
    }
}

/// Static description of one entity type.
///
/// ```
/// use joinery_core::meta::{EntityMetadata, LinkTableInfo};
///
/// let author = EntityMetadata::new("Author", "a", "authors")
///     .primitive("first_name")
///     .many_to_one("publisher", "publisher_id", "Publisher", "authors")
///     .one_to_many("books", "Book", "author")
///     .many_to_many("tags", "Tag", "authors", LinkTableInfo::new("authors_to_tags", "author_id", "tag_id"))
///     .version("version");
/// assert!(author.field("books").unwrap().is_collection());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub type_name: &'static str,
    pub tag: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub fields: Vec<FieldMeta>,
    /// Column checked and bumped on every update (optimistic locking).
    pub version_field: Option<&'static str>,
    /// Column whose non-null value marks the row as soft-deleted.
    pub soft_delete_field: Option<&'static str>,
}

impl EntityMetadata {
    /// Start describing a type whose id lives in column `id`.
    pub fn new(type_name: &'static str, tag: &'static str, table: &'static str) -> Self {
        Self {
            type_name,
            tag,
            table,
            id_column: "id",
            fields: vec![FieldMeta {
                name: "id",
                column: Some("id"),
                kind: FieldKind::PrimaryKey,
            }],
            version_field: None,
            soft_delete_field: None,
        }
    }

    /// Add a primitive field stored in a column of the same name.
    #[must_use]
    pub fn primitive(self, name: &'static str) -> Self {
        self.primitive_column(name, name)
    }

    /// Add a primitive field stored in a differently-named column.
    #[must_use]
    pub fn primitive_column(mut self, name: &'static str, column: &'static str) -> Self {
        self.fields.push(FieldMeta {
            name,
            column: Some(column),
            kind: FieldKind::Primitive,
        });
        self
    }

    #[must_use]
    pub fn many_to_one(
        mut self,
        name: &'static str,
        column: &'static str,
        other: &'static str,
        reciprocal: &'static str,
    ) -> Self {
        self.fields.push(FieldMeta {
            name,
            column: Some(column),
            kind: FieldKind::ManyToOne { other, reciprocal },
        });
        self
    }

    #[must_use]
    pub fn one_to_many(
        mut self,
        name: &'static str,
        other: &'static str,
        reciprocal: &'static str,
    ) -> Self {
        self.fields.push(FieldMeta {
            name,
            column: None,
            kind: FieldKind::OneToMany {
                other,
                reciprocal,
                cascade_delete: false,
            },
        });
        self
    }

    #[must_use]
    pub fn one_to_one(
        mut self,
        name: &'static str,
        other: &'static str,
        reciprocal: &'static str,
    ) -> Self {
        self.fields.push(FieldMeta {
            name,
            column: None,
            kind: FieldKind::OneToOne {
                other,
                reciprocal,
                cascade_delete: false,
            },
        });
        self
    }

    #[must_use]
    pub fn many_to_many(
        mut self,
        name: &'static str,
        other: &'static str,
        reciprocal: &'static str,
        link: LinkTableInfo,
    ) -> Self {
        self.fields.push(FieldMeta {
            name,
            column: None,
            kind: FieldKind::ManyToMany {
                other,
                reciprocal,
                link,
            },
        });
        self
    }

    /// Mark an already-declared one-to-many or one-to-one field as cascading deletes.
    #[must_use]
    pub fn cascade_delete(mut self, name: &'static str) -> Self {
        for field in &mut self.fields {
            if field.name != name {
                continue;
            }
            match &mut field.kind {
                FieldKind::OneToMany { cascade_delete, .. }
                | FieldKind::OneToOne { cascade_delete, .. } => *cascade_delete = true,
                _ => {}
            }
        }
        self
    }

    /// Add an optimistic-lock version column.
    #[must_use]
    pub fn version(mut self, name: &'static str) -> Self {
        self.version_field = Some(name);
        self.primitive(name)
    }

    /// Add a soft-delete timestamp column.
    #[must_use]
    pub fn soft_delete(mut self, name: &'static str) -> Self {
        self.soft_delete_field = Some(name);
        self.primitive(name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field, failing with `UnknownField` when it is not declared.
    pub fn require_field(&self, name: &str) -> Result<&FieldMeta> {
        self.field(name).ok_or_else(|| Error::UnknownField {
            entity: self.type_name,
            field: name.to_string(),
        })
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.column == Some(column))
    }

    /// Fields stored in this entity's own table, id excluded.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields
            .iter()
            .filter(|f| f.column.is_some() && !matches!(f.kind, FieldKind::PrimaryKey))
    }

    /// Relation fields holding collections.
    pub fn collection_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| f.is_collection())
    }
}

/// All entity types known to a unit of work.
#[derive(Debug, Default, Clone)]
pub struct MetadataRegistry {
    entities: Vec<Arc<EntityMetadata>>,
    by_name: HashMap<&'static str, usize>,
    by_tag: HashMap<&'static str, usize>,
    flush_order: Vec<&'static str>,
    cycles: Vec<Vec<&'static str>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type. Names, tags and tables must be unique.
    pub fn register(&mut self, meta: EntityMetadata) -> Result<()> {
        if self.by_name.contains_key(meta.type_name) {
            return Err(Error::config(format!(
                "entity type {} registered twice",
                meta.type_name
            )));
        }
        if self.by_tag.contains_key(meta.tag) {
            return Err(Error::config(format!(
                "tag '{}' of {} is already used",
                meta.tag, meta.type_name
            )));
        }
        if self.entities.iter().any(|e| e.table == meta.table) {
            return Err(Error::config(format!(
                "table {} is mapped by more than one type",
                meta.table
            )));
        }
        let index = self.entities.len();
        self.by_name.insert(meta.type_name, index);
        self.by_tag.insert(meta.tag, index);
        self.entities.push(Arc::new(meta));
        Ok(())
    }

    /// Register a type, builder style.
    pub fn with(mut self, meta: EntityMetadata) -> Result<Self> {
        self.register(meta)?;
        Ok(self)
    }

    /// Validate reciprocal declarations and compute the flush order.
    pub fn finish(mut self) -> Result<Arc<Self>> {
        for meta in &self.entities {
            self.validate_entity(meta)?;
        }
        let (order, cycles) = self.dependency_order();
        tracing::debug!(order = ?order, cycles = ?cycles, "Computed entity flush order");
        self.flush_order = order;
        self.cycles = cycles;
        Ok(Arc::new(self))
    }

    fn validate_entity(&self, meta: &EntityMetadata) -> Result<()> {
        for special in [meta.version_field, meta.soft_delete_field].into_iter().flatten() {
            meta.require_field(special)?;
        }
        for field in &meta.fields {
            let (Some(other), Some(reciprocal)) = (field.other_type(), field.reciprocal()) else {
                continue;
            };
            let other_meta = self.get(other).map_err(|_| {
                Error::config(format!(
                    "{}.{} points at unregistered type {}",
                    meta.type_name, field.name, other
                ))
            })?;
            let back = other_meta.field(reciprocal).ok_or_else(|| {
                Error::config(format!(
                    "{}.{} names reciprocal {}.{} which does not exist",
                    meta.type_name, field.name, other, reciprocal
                ))
            })?;
            let compatible = match (field.kind, back.kind) {
                (
                    FieldKind::ManyToOne { .. },
                    FieldKind::OneToMany { other, .. } | FieldKind::OneToOne { other, .. },
                )
                | (
                    FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. },
                    FieldKind::ManyToOne { other, .. },
                ) => other == meta.type_name,
                (
                    FieldKind::ManyToMany { link, .. },
                    FieldKind::ManyToMany {
                        other, link: back_link, ..
                    },
                ) => other == meta.type_name && link == back_link.reversed(),
                _ => false,
            };
            if !compatible || back.reciprocal() != Some(field.name) {
                return Err(Error::config(format!(
                    "{}.{} and {}.{} are not declared as reciprocals",
                    meta.type_name, field.name, other, reciprocal
                )));
            }
        }
        Ok(())
    }

    /// Strongly connected components of the "has a foreign key to" graph,
    /// emitted parents first.
    fn dependency_order(&self) -> (Vec<&'static str>, Vec<Vec<&'static str>>) {
        struct Tarjan<'a> {
            edges: &'a [Vec<usize>],
            index: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            next: usize,
            components: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index[v] = Some(self.next);
                self.lowlink[v] = self.next;
                self.next += 1;
                self.stack.push(v);
                self.on_stack[v] = true;
                for &w in &self.edges[v] {
                    match self.index[w] {
                        None => {
                            self.visit(w);
                            self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                        }
                        Some(w_index) if self.on_stack[w] => {
                            self.lowlink[v] = self.lowlink[v].min(w_index);
                        }
                        Some(_) => {}
                    }
                }
                if Some(self.lowlink[v]) == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.components.push(component);
                }
            }
        }

        let edges: Vec<Vec<usize>> = self
            .entities
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                let mut targets: Vec<usize> = meta
                    .fields
                    .iter()
                    .filter(|f| f.is_reference())
                    .filter_map(|f| f.other_type())
                    .filter_map(|other| self.by_name.get(other).copied())
                    .filter(|&t| t != i)
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                targets
            })
            .collect();

        let n = self.entities.len();
        let mut tarjan = Tarjan {
            edges: &edges,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            components: Vec::new(),
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }

        let name = |i: usize| self.entities[i].type_name;
        let order = tarjan
            .components
            .iter()
            .flat_map(|c| c.iter().map(|&i| name(i)))
            .collect();
        let cycles = tarjan
            .components
            .iter()
            .filter(|c| c.len() > 1)
            .map(|c| c.iter().map(|&i| name(i)).collect())
            .collect();
        (order, cycles)
    }

    /// Look up a type by name.
    pub fn get(&self, type_name: &str) -> Result<&Arc<EntityMetadata>> {
        self.by_name
            .get(type_name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| Error::config(format!("unknown entity type {}", type_name)))
    }

    pub fn by_tag(&self, tag: &str) -> Option<&Arc<EntityMetadata>> {
        self.by_tag.get(tag).map(|&i| &self.entities[i])
    }

    pub fn entities(&self) -> &[Arc<EntityMetadata>] {
        &self.entities
    }

    /// Parse `"tag:key"` into a tagged id of a registered type.
    pub fn parse_id(&self, raw: &str) -> Result<TaggedId> {
        let (tag, key) = split_tagged(raw)?;
        let meta = self
            .by_tag(tag)
            .ok_or_else(|| Error::InvalidId(raw.to_string()))?;
        Ok(TaggedId::new(meta.tag, IdValue::parse(key)?))
    }

    /// Parse a tagged id that must belong to `type_name`.
    ///
    /// A bare key without a tag is accepted and tagged with the type's tag.
    pub fn parse_id_for(&self, type_name: &str, raw: &str) -> Result<TaggedId> {
        let meta = self.get(type_name)?;
        if !raw.contains(':') {
            return Ok(TaggedId::new(meta.tag, IdValue::parse(raw)?));
        }
        let id = self.parse_id(raw)?;
        if id.tag() != meta.tag {
            return Err(Error::InvalidId(raw.to_string()));
        }
        Ok(id)
    }

    /// Types ordered so every type comes after the types it references.
    pub fn flush_order(&self) -> &[&'static str] {
        &self.flush_order
    }

    /// Position of a type in [`flush_order`](Self::flush_order).
    pub fn flush_position(&self, type_name: &str) -> usize {
        self.flush_order
            .iter()
            .position(|t| *t == type_name)
            .unwrap_or(usize::MAX)
    }

    /// Groups of types whose foreign keys reference each other.
    pub fn cycles(&self) -> &[Vec<&'static str>] {
        &self.cycles
    }

    /// The relation on the other side of `field`, with its owning metadata.
    pub fn reciprocal_of(
        &self,
        meta: &EntityMetadata,
        field: &FieldMeta,
    ) -> Result<(&Arc<EntityMetadata>, &FieldMeta)> {
        let (Some(other), Some(reciprocal)) = (field.other_type(), field.reciprocal()) else {
            return Err(Error::config(format!(
                "{}.{} is not a relation",
                meta.type_name, field.name
            )));
        };
        let other_meta = self.get(other)?;
        let back = other_meta.require_field(reciprocal)?;
        Ok((other_meta, back))
    }

    /// Foreign-key column on the child table for a one-to-many or one-to-one field.
    pub fn child_column(&self, meta: &EntityMetadata, field: &FieldMeta) -> Result<&'static str> {
        let (_, back) = self.reciprocal_of(meta, field)?;
        back.column.ok_or_else(|| {
            Error::config(format!(
                "{}.{} has no foreign key column on the child side",
                meta.type_name, field.name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                EntityMetadata::new("Publisher", "p", "publishers")
                    .primitive("name")
                    .one_to_many("authors", "Author", "publisher"),
            )
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Author", "a", "authors")
                        .primitive("first_name")
                        .many_to_one("publisher", "publisher_id", "Publisher", "authors")
                        .one_to_many("books", "Book", "author")
                        .many_to_many(
                            "tags",
                            "Tag",
                            "authors",
                            LinkTableInfo::new("authors_to_tags", "author_id", "tag_id"),
                        )
                        .cascade_delete("books"),
                )
            })
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Book", "b", "books")
                        .primitive("title")
                        .many_to_one("author", "author_id", "Author", "books"),
                )
            })
            .and_then(|r| {
                r.with(EntityMetadata::new("Tag", "t", "tags").many_to_many(
                    "authors",
                    "Author",
                    "tags",
                    LinkTableInfo::new("authors_to_tags", "tag_id", "author_id"),
                ))
            })
            .unwrap()
    }

    #[test]
    fn flush_order_puts_parents_first() {
        let registry = library().finish().unwrap();
        let order = registry.flush_order();
        let pos = |t: &str| order.iter().position(|o| *o == t).unwrap();
        assert!(pos("Publisher") < pos("Author"));
        assert!(pos("Author") < pos("Book"));
        assert!(registry.cycles().is_empty());
    }

    #[test]
    fn missing_reciprocal_is_rejected() {
        let registry = MetadataRegistry::new()
            .with(
                EntityMetadata::new("Author", "a", "authors")
                    .many_to_one("current_draft", "current_draft_id", "Book", "draft_of")
                    .one_to_many("books", "Book", "author"),
            )
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Book", "b", "books")
                        .many_to_one("author", "author_id", "Author", "books")
                        .one_to_one("draft_of", "Author", "current_draft"),
                )
            })
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Comment", "c", "comments")
                        .many_to_one("book", "book_id", "Book", "comments"),
                )
            });
        // Comment.book has no reciprocal declared on Book
        assert!(registry.unwrap().finish().is_err());
    }

    #[test]
    fn cycle_members_share_one_component() {
        let registry = MetadataRegistry::new()
            .with(
                EntityMetadata::new("Author", "a", "authors")
                    .many_to_one("current_draft", "current_draft_id", "Book", "draft_of")
                    .one_to_many("books", "Book", "author"),
            )
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Book", "b", "books")
                        .many_to_one("author", "author_id", "Author", "books")
                        .one_to_one("draft_of", "Author", "current_draft")
                        .one_to_many("comments", "Comment", "book"),
                )
            })
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Comment", "c", "comments")
                        .many_to_one("book", "book_id", "Book", "comments"),
                )
            })
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(registry.cycles(), &[vec!["Author", "Book"]]);
        assert_eq!(registry.flush_position("Comment"), 2);
    }

    #[test]
    fn parse_id_resolves_tags() {
        let registry = library().finish().unwrap();
        let id = registry.parse_id("a:1").unwrap();
        assert_eq!(id, TaggedId::int("a", 1));
        assert!(matches!(registry.parse_id("zz:1"), Err(Error::InvalidId(_))));
        assert!(matches!(
            registry.parse_id_for("Book", "a:1"),
            Err(Error::InvalidId(_))
        ));
        assert_eq!(
            registry.parse_id_for("Book", "7").unwrap(),
            TaggedId::int("b", 7)
        );
    }

    #[test]
    fn duplicate_tags_rejected() {
        let mut registry = library();
        let err = registry
            .register(EntityMetadata::new("Other", "a", "others"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn mismatched_join_columns_rejected() {
        let registry = MetadataRegistry::new()
            .with(EntityMetadata::new("Author", "a", "authors").many_to_many(
                "tags",
                "Tag",
                "authors",
                LinkTableInfo::new("authors_to_tags", "author_id", "tag_id"),
            ))
            .and_then(|r| {
                r.with(EntityMetadata::new("Tag", "t", "tags").many_to_many(
                    "authors",
                    "Author",
                    "tags",
                    LinkTableInfo::new("authors_to_tags", "author_id", "tag_id"),
                ))
            })
            .unwrap();
        assert!(registry.finish().is_err());
    }

    #[test]
    fn child_column_comes_from_reciprocal() {
        let registry = library().finish().unwrap();
        let author = registry.get("Author").unwrap();
        let books = author.field("books").unwrap();
        assert_eq!(registry.child_column(author, books).unwrap(), "author_id");
        assert!(books.cascades_delete());
    }
}
