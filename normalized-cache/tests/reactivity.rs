//! Subscription fan-out, invalidation, and stale tracking.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use normalized_cache::Artifact;
use normalized_cache::Cache;
use normalized_cache::FieldSelection;
use normalized_cache::Selection;
use pretty_assertions::assert_eq;
use serde_json_bytes::json;

use crate::alice;
use crate::no_variables;
use crate::schema;
use crate::shared;
use crate::user_fragment;
use crate::user_query;

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&count);
    (count, move || {
        observed.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn rewriting_identical_data_fires_nothing() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    let (fired, listener) = counter();
    cache.subscribe_query(shared(&user_query()), no_variables(), listener);

    cache.write_query(&user_query(), &no_variables(), &alice());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn one_changed_field_fires_exactly_its_subscribers() {
    let other_query = Artifact::query(
        "GetOtherUser",
        vec![FieldSelection::new("other")
            .select(vec![
                Selection::field("__typename"),
                Selection::field("id"),
                Selection::field("name"),
            ])
            .into()],
    );

    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());
    cache.write_query(
        &other_query,
        &no_variables(),
        &json!({"other": {"__typename": "User", "id": "2", "name": "Bob"}}),
    );

    let (user_fired, user_listener) = counter();
    cache.subscribe_query(shared(&user_query()), no_variables(), user_listener);
    let (other_fired, other_listener) = counter();
    cache.subscribe_query(shared(&other_query), no_variables(), other_listener);

    cache.write_query(
        &user_query(),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "1", "name": "Renamed"}}),
    );

    assert_eq!(user_fired.load(Ordering::SeqCst), 1);
    assert_eq!(other_fired.load(Ordering::SeqCst), 0);
}

#[test]
fn a_listener_fires_once_per_write_even_with_many_changes() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    let (fired, listener) = counter();
    cache.subscribe_query(shared(&user_query()), no_variables(), listener);

    // Both the name and id cells change; one invocation.
    cache.write_query(
        &user_query(),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "9", "name": "Zed"}}),
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn unsubscribe_stops_notifications_and_is_idempotent() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    let (fired, listener) = counter();
    let id = cache.subscribe_query(shared(&user_query()), no_variables(), listener);
    assert_eq!(cache.subscription_count(), 1);

    cache.unsubscribe(id);
    cache.unsubscribe(id);
    assert_eq!(cache.subscription_count(), 0);

    cache.write_query(
        &user_query(),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "1", "name": "Bob"}}),
    );
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn subscriptions_fire_when_missing_data_arrives() {
    let mut cache = Cache::new(schema());

    let (fired, listener) = counter();
    cache.subscribe_query(shared(&user_query()), no_variables(), listener);

    cache.write_query(&user_query(), &no_variables(), &alice());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The refreshed dependency set now covers the entity's cells.
    let (again, listener) = counter();
    cache.subscribe_fragment(
        shared(&user_fragment()),
        json!({"__fragmentRef": "User:1"}),
        listener,
    );
    cache.write_query(
        &user_query(),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "1", "name": "Bob"}}),
    );
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(again.load(Ordering::SeqCst), 1);
}

#[test]
fn invalidating_an_entity_fires_its_dependents_once() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    let (fired, listener) = counter();
    cache.subscribe_query(shared(&user_query()), no_variables(), listener);

    cache.invalidate(&[json!({"__typename": "User", "id": "1"})]);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Memoized data is preserved; the read is flagged stale.
    let result = cache.read_query(&user_query(), &no_variables());
    assert_eq!(result.data.as_deref(), Some(&alice()));
    assert!(result.stale);
}

#[test]
fn a_covering_write_clears_stale_marks() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    cache.invalidate(&[json!({"__typename": "User", "id": "1"})]);
    assert!(cache.read_query(&user_query(), &no_variables()).stale);

    cache.write_query(&user_query(), &no_variables(), &alice());
    assert!(!cache.read_query(&user_query(), &no_variables()).stale);
}

#[test]
fn field_level_invalidation_is_cell_scoped() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    cache.invalidate(&[json!({"__typename": "User", "id": "1", "field": "name"})]);
    assert!(cache.read_query(&user_query(), &no_variables()).stale);

    let id_only = Artifact::query(
        "GetUserId",
        vec![FieldSelection::new("user")
            .select(vec![Selection::field("__typename"), Selection::field("id")])
            .into()],
    );
    // A read that never touches the stale cell is not stale.
    assert!(!cache.read_query(&id_only, &no_variables()).stale);
}

#[test]
fn type_invalidation_prefix_scans_buckets() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    let (fired, listener) = counter();
    cache.subscribe_fragment(
        shared(&user_fragment()),
        json!({"__fragmentRef": "User:1"}),
        listener,
    );

    cache.invalidate(&[json!({"__typename": "User"})]);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(cache.read_query(&user_query(), &no_variables()).stale);
}

#[test]
fn root_field_invalidation_targets_the_root_bucket() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    cache.invalidate(&[json!({"__typename": "Query", "field": "user"})]);
    assert!(cache.read_query(&user_query(), &no_variables()).stale);
}

#[test]
fn a_panicking_listener_does_not_starve_the_rest() {
    let mut cache = Cache::new(schema());
    cache.write_query(&user_query(), &no_variables(), &alice());

    cache.subscribe_query(shared(&user_query()), no_variables(), || {
        panic!("listener exploded");
    });
    let (fired, listener) = counter();
    cache.subscribe_query(shared(&user_query()), no_variables(), listener);

    cache.write_query(
        &user_query(),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "1", "name": "Bob"}}),
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The cache itself stays consistent.
    let result = cache.read_query(&user_query(), &no_variables());
    assert_eq!(
        result.data.as_deref(),
        Some(&json!({"user": {"__typename": "User", "id": "1", "name": "Bob"}}))
    );
}

#[test]
fn masked_subscriptions_ignore_fragment_internals() {
    let masked = crate::masked_user_query();
    let mut cache = Cache::new(schema());
    cache.write_query(
        &Artifact::query(
            "Seed",
            vec![FieldSelection::new("user")
                .select(user_fragment().selections)
                .into()],
        ),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "1", "name": "Alice", "email": "a@x"}}),
    );

    let (masked_fired, masked_listener) = counter();
    cache.subscribe_query(shared(&masked), no_variables(), masked_listener);
    let (fragment_fired, fragment_listener) = counter();
    cache.subscribe_fragment(
        shared(&user_fragment()),
        json!({"__fragmentRef": "User:1"}),
        fragment_listener,
    );

    cache.write_query(
        &user_query(),
        &no_variables(),
        &json!({"user": {"__typename": "User", "id": "1", "name": "Bob"}}),
    );

    assert_eq!(masked_fired.load(Ordering::SeqCst), 0);
    assert_eq!(fragment_fired.load(Ordering::SeqCst), 1);
}
