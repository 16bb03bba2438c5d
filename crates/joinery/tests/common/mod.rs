//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use joinery::prelude::*;
use joinery::MemoryStats;
use std::sync::Arc;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Opt-in logging: `RUST_LOG=joinery_session=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Authors with books, reviews, an image and tags.
pub fn library() -> Arc<MetadataRegistry> {
    MetadataRegistry::new()
        .with(
            EntityMetadata::new("Author", "a", "authors")
                .primitive("first_name")
                .one_to_many("books", "Book", "author")
                .one_to_one("image", "Image", "author")
                .many_to_many(
                    "tags",
                    "Tag",
                    "authors",
                    LinkTableInfo::new("authors_to_tags", "author_id", "tag_id"),
                )
                .version("version"),
        )
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Book", "b", "books")
                    .primitive("title")
                    .many_to_one("author", "author_id", "Author", "books")
                    .one_to_many("reviews", "Review", "book")
                    .cascade_delete("reviews"),
            )
        })
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Review", "r", "reviews")
                    .primitive("rating")
                    .many_to_one("book", "book_id", "Book", "reviews"),
            )
        })
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Image", "i", "images")
                    .many_to_one("author", "author_id", "Author", "image"),
            )
        })
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Tag", "t", "tags")
                    .primitive("name")
                    .many_to_many(
                        "authors",
                        "Author",
                        "tags",
                        LinkTableInfo::new("authors_to_tags", "tag_id", "author_id"),
                    ),
            )
        })
        .and_then(MetadataRegistry::finish)
        .expect("library metadata is valid")
}

pub fn author_row(id: i64, name: &str) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("first_name", Value::from(name)),
        ("version", Value::BigInt(1)),
    ])
}

pub fn book_row(id: i64, title: &str, author: i64) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("title", Value::from(title)),
        ("author_id", Value::BigInt(author)),
    ])
}

pub fn review_row(id: i64, rating: i32, book: i64) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("rating", Value::Int(rating)),
        ("book_id", Value::BigInt(book)),
    ])
}

pub fn tag_row(id: i64, name: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("name", Value::from(name))])
}

pub fn link_row(id: i64, author: i64, tag: i64) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("author_id", Value::BigInt(author)),
        ("tag_id", Value::BigInt(tag)),
    ])
}

/// Seed the shared fixture:
///
/// - authors 1 (Ann) and 2 (Ben)
/// - books 10 and 11 by Ann, 12 by Ben
/// - review 100 on book 10
/// - tags 1 (x), 2 (y), 3 (w); Ann is tagged y (link 100) and w (link 101)
pub fn seeded_driver() -> MemoryDriver {
    let driver = MemoryDriver::new();
    seed(&driver);
    driver
}

pub fn seed(driver: &MemoryDriver) {
    driver
        .insert_rows("authors", "id", [author_row(1, "Ann"), author_row(2, "Ben")])
        .expect("seed authors");
    driver
        .insert_rows(
            "books",
            "id",
            [book_row(10, "x", 1), book_row(11, "y", 1), book_row(12, "z", 2)],
        )
        .expect("seed books");
    driver
        .insert_rows("reviews", "id", [review_row(100, 5, 10)])
        .expect("seed reviews");
    driver
        .insert_rows("tags", "id", [tag_row(1, "x"), tag_row(2, "y"), tag_row(3, "w")])
        .expect("seed tags");
    driver
        .insert_rows("authors_to_tags", "id", [link_row(100, 1, 2), link_row(101, 1, 3)])
        .expect("seed links");
}

pub fn finds(driver: &MemoryDriver) -> usize {
    driver.stats().finds
}

pub fn stats(driver: &MemoryDriver) -> MemoryStats {
    driver.stats()
}

pub fn int_column(row: &Row, column: &str) -> Option<i64> {
    row.get_by_name(column).and_then(Value::as_i64)
}
