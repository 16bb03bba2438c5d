//! Read windows, the preload cache and N+1 detection against the in-memory
//! driver.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{finds, library, seeded_driver, unwrap_outcome};
use joinery::prelude::*;
use joinery::{EntityMetadata as Meta, Filter, PreloadPlugin, PreloadedRelation};

#[test]
fn identical_finds_share_one_round_trip() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());
    let query = || FindQuery::entity("Author", "authors").filter(Filter::eq("first_name", "Ann"));

    rt.block_on(async {
        let mut window = uow.read_window();
        let first = window.find(query()).unwrap();
        let second = window.find(query()).unwrap();
        let results = unwrap_outcome(window.dispatch(&cx).await);
        assert_eq!(results.entities(first), results.entities(second));
        assert_eq!(results.entities(first).len(), 1);
    });
    assert_eq!(finds(&driver), 1);
}

#[test]
fn different_finds_take_one_round_trip_each() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());

    rt.block_on(async {
        let mut window = uow.read_window();
        let authors = window.find(FindQuery::entity("Author", "authors")).unwrap();
        let tags = window.find(FindQuery::entity("Tag", "tags")).unwrap();
        let results = unwrap_outcome(window.dispatch(&cx).await);
        assert_eq!(results.entities(authors).len(), 2);
        assert_eq!(results.entities(tags).len(), 3);
    });
    assert_eq!(finds(&driver), 2);
}

#[test]
fn lookups_by_id_merge_into_one_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());

    rt.block_on(async {
        let mut window = uow.read_window();
        let ann = window.load_by_id(&TaggedId::int("a", 1)).unwrap();
        let ben = window.load_by_id(&TaggedId::int("a", 2)).unwrap();
        let nobody = window.load_by_id(&TaggedId::int("a", 99)).unwrap();
        let results = unwrap_outcome(window.dispatch(&cx).await);
        assert!(results.entity(ann).is_some());
        assert!(results.entity(ben).is_some());
        assert!(results.entity(nobody).is_none());
    });
    assert_eq!(finds(&driver), 1);
}

#[test]
fn collections_of_many_owners_load_together() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());

    rt.block_on(async {
        let authors = unwrap_outcome(
            uow.find(&cx, FindQuery::entity("Author", "authors").order_by("id", false))
                .await,
        );
        let books = unwrap_outcome(uow.load_all(&cx, &authors, "books", LoadOptions::new()).await);
        assert_eq!(books[0].len(), 2);
        assert_eq!(books[1].len(), 1);
        assert_eq!(finds(&driver), 2);

        // Loaded collections answer from memory.
        let again = unwrap_outcome(uow.load(&cx, authors[0], "books", LoadOptions::new()).await);
        assert_eq!(again, books[0]);
        assert_eq!(finds(&driver), 2);

        let reloaded = unwrap_outcome(
            uow.load(&cx, authors[0], "books", LoadOptions::new().force_reload(true))
                .await,
        );
        assert_eq!(reloaded.len(), 2);
        assert_eq!(finds(&driver), 3);
    });
}

#[test]
fn populate_loads_one_level_per_round_trip() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());

    rt.block_on(async {
        let authors = unwrap_outcome(uow.find(&cx, FindQuery::entity("Author", "authors")).await);
        let hint = LoadHint::from_paths(["books.reviews"]);
        unwrap_outcome(uow.populate(&cx, &authors, &hint).await);
        // authors, books, reviews
        assert_eq!(finds(&driver), 3);

        let reviews: usize = authors
            .iter()
            .flat_map(|a| uow.graph().get(*a, "books").unwrap())
            .map(|b| uow.graph().get(b, "reviews").unwrap().len())
            .sum();
        assert_eq!(reviews, 1);
    });
}

#[test]
fn preload_cache_answers_without_a_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());

    rt.block_on(async {
        let ann = unwrap_outcome(uow.load_by_id(&cx, &TaggedId::int("a", 1)).await)
            .expect("author 1 exists");
        unwrap_outcome(uow.find(&cx, FindQuery::entity("Book", "books")).await);
        let before = finds(&driver);

        uow.preload_cache_mut().insert(
            TaggedId::int("a", 1),
            "books",
            vec![TaggedId::int("b", 11), TaggedId::int("b", 10)],
        );
        let books = unwrap_outcome(uow.load(&cx, ann, "books", LoadOptions::new()).await);
        assert_eq!(books.len(), 2);
        assert_eq!(finds(&driver), before);
        assert!(uow.preload_cache().is_empty());
    });
}

#[test]
fn includes_skips_storage_for_unsaved_entities() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());

    rt.block_on(async {
        let ann = unwrap_outcome(uow.load_by_id(&cx, &TaggedId::int("a", 1)).await)
            .expect("author 1 exists");
        let unsaved = uow.graph_mut().create("Book", []).unwrap();
        let before = finds(&driver);
        assert!(!unwrap_outcome(uow.includes(&cx, ann, "books", unsaved).await));
        assert_eq!(finds(&driver), before);

        let found = unwrap_outcome(
            uow.find_in_collection(&cx, ann, "books", &TaggedId::int("b", 11))
                .await,
        );
        assert!(found.is_some());
        assert_eq!(finds(&driver), before + 1);
        assert!(!uow.graph().is_loaded(ann, "books"));
    });
}

#[test]
fn single_owner_loads_in_a_loop_are_flagged() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let config = UnitOfWorkConfig::default().n1_threshold(2);
    let mut uow = UnitOfWork::with_config(library(), driver, config);

    rt.block_on(async {
        let authors = unwrap_outcome(uow.find(&cx, FindQuery::entity("Author", "authors")).await);
        for author in &authors {
            unwrap_outcome(uow.load(&cx, *author, "books", LoadOptions::new()).await);
        }
    });
    assert_eq!(uow.n1_tracker().count_for("Author", "books"), 2);
    assert_eq!(uow.n1_tracker().stats().potential_n1, 1);
}

/// Serves `books` from rows fetched ahead of time, the way a join-preloading
/// plugin would pull them out of a widened owner query.
struct CannedBooks {
    books: Vec<Row>,
}

impl PreloadPlugin for CannedBooks {
    fn partition_hint(&self, _meta: &Meta, hint: &LoadHint) -> (LoadHint, LoadHint) {
        let mut joined = LoadHint::new();
        let mut rest = LoadHint::new();
        for (field, sub) in hint.fields() {
            if field == "books" && sub.is_empty() {
                joined.insert(field, sub.clone());
            } else {
                rest.insert(field, sub.clone());
            }
        }
        (joined, rest)
    }

    fn preload_populate(&self, _meta: &Meta, _hint: &LoadHint, _query: &mut FindQuery) {}

    fn preload_load(
        &self,
        _meta: &Meta,
        _hint: &LoadHint,
        rows: &[Row],
    ) -> Result<Vec<PreloadedRelation>> {
        let mut relations = Vec::new();
        for row in rows {
            let Some(id) = row.get_by_name("id").and_then(Value::as_i64) else {
                continue;
            };
            let books = self
                .books
                .iter()
                .filter(|b| b.get_by_name("author_id").and_then(Value::as_i64) == Some(id))
                .cloned()
                .collect();
            relations.push(PreloadedRelation {
                owner: TaggedId::int("a", id),
                field: "books",
                other: "Book",
                rows: books,
            });
        }
        Ok(relations)
    }
}

#[test]
fn preload_plugin_folds_hint_into_the_owner_find() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = seeded_driver();
    let mut uow = UnitOfWork::new(library(), driver.clone());
    uow.set_preload_plugin(CannedBooks {
        books: driver.rows("books"),
    });

    rt.block_on(async {
        let hint = LoadHint::from_paths(["books", "tags"]);
        let authors = unwrap_outcome(
            uow.find_with_hint(&cx, FindQuery::entity("Author", "authors"), &hint)
                .await,
        );
        assert_eq!(authors.len(), 2);
        for author in &authors {
            assert!(uow.graph().is_loaded(*author, "books"));
            assert!(uow.graph().is_loaded(*author, "tags"));
        }
    });
    // authors, link rows, the tags they name; books came from the plugin
    assert_eq!(finds(&driver), 3);
    let tables: Vec<&str> = driver.finds().iter().map(|q| q.table).collect();
    assert!(!tables.contains(&"books"));
}
