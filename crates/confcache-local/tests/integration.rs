//! Integration tests: a ConfCache `Client` over `LocalEngine`.
//!
//! These tests drive the whole pipeline: engine writes fire subscription
//! callbacks, the client's task channel carries them to the dispatch
//! loop, and the flush delivers to listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use confcache_core::{
    set_global_error_handler, CacheResult, ChangeSet, Client, ConfError, Config, Engine, Entry, ErrorHandling,
    PreloadType, Schema, UnreturnedExt, UnsetFlags, Value, ValueType,
};
use confcache_local::LocalEngine;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn setup() -> (Arc<LocalEngine>, Client) {
    setup_with(Config::default())
}

fn setup_with(config: Config) -> (Arc<LocalEngine>, Client) {
    init_tracing();
    let engine = Arc::new(LocalEngine::new());
    let client = Client::for_engine(engine.clone(), config).unwrap();
    (engine, client)
}

type Changes = Arc<Mutex<Vec<(String, Option<Value>)>>>;

/// Record every `value_changed` broadcast.
fn record_changes(client: &Client) -> Changes {
    let changes: Changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    client.connect_value_changed(move |_, key, value| sink.lock().push((key.to_string(), value.cloned())));
    changes
}

/// Record the keys delivered to a listener on `namespace`.
fn record_listener(client: &Client, namespace: &str) -> Arc<Mutex<Vec<String>>> {
    let keys = Arc::new(Mutex::new(Vec::new()));
    let sink = keys.clone();
    client
        .notify_add(namespace, move |_, _, entry| sink.lock().push(entry.key.clone()))
        .unwrap();
    keys
}

// ---------------------------------------------------------------------------
// End-to-End Scenario
// ---------------------------------------------------------------------------

#[test]
fn test_add_dir_get_and_remote_push() {
    let (engine, client) = setup();
    engine.set("/apps/demo/x", &Value::Int(5)).unwrap();

    client.add_dir("/apps/demo", PreloadType::OneLevel).unwrap();
    assert_eq!(engine.all_entries_calls(), 1);
    assert_eq!(
        client.cache_lookup("/apps/demo/x"),
        CacheResult::Hit(Entry::new("/apps/demo/x", Value::Int(5)))
    );

    assert_eq!(client.get_int("/apps/demo/x").unwrap(), Some(5));
    assert_eq!(engine.get_entry_calls(), 0);

    let changes = record_changes(&client);
    engine.set("/apps/demo/x", &Value::Int(6)).unwrap();
    assert!(changes.lock().is_empty(), "delivery must wait for dispatch");

    assert!(client.dispatch_pending() >= 2);
    assert_eq!(*changes.lock(), vec![("/apps/demo/x".to_string(), Some(Value::Int(6)))]);
    assert_eq!(
        client.cache_lookup("/apps/demo/x"),
        CacheResult::Hit(Entry::new("/apps/demo/x", Value::Int(6)))
    );
}

#[test]
fn test_idempotent_remote_push_is_silent() {
    let (engine, client) = setup();
    engine.set("/apps/demo/x", &Value::Int(5)).unwrap();
    client.add_dir("/apps/demo", PreloadType::OneLevel).unwrap();
    let changes = record_changes(&client);

    engine.set("/apps/demo/x", &Value::Int(5)).unwrap();
    assert_eq!(client.dispatch_pending(), 1);
    assert!(changes.lock().is_empty());
    assert_eq!(client.pending_notifications(), 0);
}

#[test]
fn test_local_set_notifies_once() {
    let (engine, client) = setup();
    client.add_dir("/apps/demo", PreloadType::OneLevel).unwrap();
    let changes = record_changes(&client);

    client.set_int("/apps/demo/x", 7).unwrap();
    assert_eq!(client.cache_lookup("/apps/demo/x"), CacheResult::Miss);

    client.dispatch_pending();
    assert_eq!(*changes.lock(), vec![("/apps/demo/x".to_string(), Some(Value::Int(7)))]);
    assert_eq!(engine.get_entry("/apps/demo/x", false).unwrap().value, Some(Value::Int(7)));
}

// ---------------------------------------------------------------------------
// Directory Registry
// ---------------------------------------------------------------------------

#[test]
fn test_overlap_suppression() {
    let (engine, client) = setup();

    client.add_dir("/a", PreloadType::None).unwrap();
    client.add_dir("/a/b", PreloadType::None).unwrap();
    assert_eq!(engine.subscribed_dirs(), vec!["/a".to_string()]);
    assert_eq!(client.live_subscriptions(), 1);

    client.remove_dir("/a").unwrap();
    assert_eq!(engine.subscribed_dirs(), vec!["/a/b".to_string()]);
    assert_eq!(client.watched_dirs().len(), 1);
}

#[test]
fn test_ancestor_added_later_takes_over() {
    let (engine, client) = setup();

    client.add_dir("/a/b", PreloadType::None).unwrap();
    client.add_dir("/a/c", PreloadType::None).unwrap();
    assert_eq!(engine.live_subscriptions(), 2);

    client.add_dir("/a", PreloadType::None).unwrap();
    assert_eq!(engine.subscribed_dirs(), vec!["/a".to_string()]);

    // Still one delivery per change
    let changes = record_changes(&client);
    engine.set("/a/b/k", &Value::Bool(true)).unwrap();
    client.dispatch_pending();
    assert_eq!(changes.lock().len(), 1);
}

#[test]
fn test_ref_counted_dirs() {
    let (engine, client) = setup();

    client.add_dir("/a", PreloadType::None).unwrap();
    client.add_dir("/a", PreloadType::None).unwrap();
    assert_eq!(client.watched_dirs()[0].ref_count, 2);

    client.remove_dir("/a").unwrap();
    assert_eq!(engine.live_subscriptions(), 1);
    client.remove_dir("/a").unwrap();
    assert_eq!(engine.live_subscriptions(), 0);
    assert!(client.watched_dirs().is_empty());
}

#[test]
fn test_remove_dir_evicts_uncovered_entries_only() {
    let (engine, client) = setup();
    engine.set("/a/x", &Value::Int(1)).unwrap();
    engine.set("/a/b/y", &Value::Int(2)).unwrap();

    client.add_dir("/a", PreloadType::OneLevel).unwrap();
    client.add_dir("/a/b", PreloadType::OneLevel).unwrap();
    client.remove_dir("/a").unwrap();

    assert_eq!(client.cache_lookup("/a/x"), CacheResult::Miss);
    assert!(matches!(client.cache_lookup("/a/b/y"), CacheResult::Hit(_)));
    assert_eq!(client.cache_lookup("/a/b/absent"), CacheResult::NegativeHit);
}

#[test]
fn test_subscription_failure_and_retry() {
    let (engine, client) = setup();
    engine.fail_subscriptions(true);

    let err = client.add_dir("/s", PreloadType::OneLevel).unwrap_err();
    assert!(matches!(err, ConfError::SubscriptionFailed { ref dir, .. } if dir == "/s"));
    let watched = client.watched_dirs();
    assert_eq!(watched.len(), 1);
    assert_eq!(watched[0].remote_subscription, None);

    let changes = record_changes(&client);
    engine.set("/s/k", &Value::Int(1)).unwrap();
    assert_eq!(client.dispatch_pending(), 0);

    engine.fail_subscriptions(false);
    assert_eq!(client.retry_subscriptions().unwrap(), 1);
    engine.set("/s/k", &Value::Int(2)).unwrap();
    client.dispatch_pending();
    assert_eq!(*changes.lock(), vec![("/s/k".to_string(), Some(Value::Int(2)))]);

    client.remove_dir("/s").unwrap();
    assert!(client.watched_dirs().is_empty());
}

#[test]
fn test_stale_remote_change_is_dropped() {
    let (engine, client) = setup();
    client.add_dir("/a", PreloadType::None).unwrap();
    let changes = record_changes(&client);

    engine.set("/a/k", &Value::Int(1)).unwrap();
    client.remove_dir("/a").unwrap();

    client.dispatch_pending();
    assert!(changes.lock().is_empty());
    assert_eq!(client.cache_lookup("/a/k"), CacheResult::Miss);
}

#[test]
fn test_remove_dir_succeeds_while_other_dir_stays_bare() {
    let (engine, client) = setup();
    client.add_dir("/y", PreloadType::None).unwrap();
    engine.fail_subscriptions(true);
    assert!(client.add_dir("/x", PreloadType::None).is_err());

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    client.connect_error(move |_, e| sink.lock().push(e.clone()));

    client.remove_dir("/y").unwrap();

    let watched = client.watched_dirs();
    assert_eq!(watched.len(), 1);
    assert_eq!(watched[0].path, "/x");
    assert_eq!(watched[0].remote_subscription, None);
    assert_eq!(engine.live_subscriptions(), 0);

    // The bare directory is still reported
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ConfError::SubscriptionFailed { ref dir, .. } if dir == "/x"));
    drop(errors);

    engine.fail_subscriptions(false);
    assert_eq!(client.retry_subscriptions().unwrap(), 1);
    assert_eq!(engine.subscribed_dirs(), vec!["/x".to_string()]);
}

// ---------------------------------------------------------------------------
// Cache and Completeness
// ---------------------------------------------------------------------------

#[test]
fn test_completeness_invalidated_by_write() {
    let (engine, client) = setup();
    engine.set("/a/existing", &Value::Int(1)).unwrap();
    client.add_dir("/a", PreloadType::OneLevel).unwrap();

    assert_eq!(client.cache_lookup("/a/new_key"), CacheResult::NegativeHit);
    assert_eq!(client.get("/a/new_key").unwrap(), None);
    assert_eq!(engine.get_entry_calls(), 0);

    client.set_string("/a/new_key", "v").unwrap();
    assert_eq!(client.cache_lookup("/a/new_key"), CacheResult::Miss);
    assert_eq!(client.get_string("/a/new_key").unwrap(), Some("v".to_string()));
}

#[test]
fn test_recursive_preload_serves_from_cache() {
    let (engine, client) = setup();
    engine.set("/r/a", &Value::Int(1)).unwrap();
    engine.set("/r/b/c", &Value::Int(2)).unwrap();
    engine.set("/r/b/d/e", &Value::Int(3)).unwrap();

    client.add_dir("/r", PreloadType::Recursive).unwrap();
    assert_eq!(engine.all_entries_calls(), 3);

    let entries = client.all_entries("/r/b").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "/r/b/c");
    assert_eq!(engine.all_entries_calls(), 3);

    assert_eq!(client.get_int("/r/b/d/e").unwrap(), Some(3));
    assert_eq!(client.get("/r/b/missing").unwrap(), None);
    assert_eq!(engine.get_entry_calls(), 0);

    assert_eq!(client.all_dirs("/r").unwrap(), vec!["/r/b".to_string()]);
    assert!(client.dir_exists("/r/b/d").unwrap());
}

#[test]
fn test_unwatched_reads_are_not_cached() {
    let (engine, client) = setup();
    engine.set("/u/k", &Value::Int(1)).unwrap();

    assert_eq!(client.get_int("/u/k").unwrap(), Some(1));
    assert_eq!(client.get_int("/u/k").unwrap(), Some(1));
    assert_eq!(engine.get_entry_calls(), 2);
    assert_eq!(client.cached_entries(), 0);
}

#[test]
fn test_on_demand_fetch_caches_engine_answer() {
    let (engine, client) = setup();
    engine.install_schema("/schemas/w/size", Schema::with_default(ValueType::Int, Value::Int(4)));
    engine.associate_schema("/w/size", "/schemas/w/size");
    engine.set("/w/plain", &Value::Int(1)).unwrap();
    client.add_dir("/w", PreloadType::None).unwrap();

    for key in ["/w/size", "/w/plain"] {
        let fetched = client.get_entry(key, true).unwrap();
        assert_eq!(fetched, engine.get_entry(key, true).unwrap());
        assert_eq!(client.cache_lookup(key), CacheResult::Hit(fetched));
    }
    match client.cache_lookup("/w/size") {
        CacheResult::Hit(entry) => assert_eq!(entry.schema_name.as_deref(), Some("/schemas/w/size")),
        other => panic!("expected a cached entry, got {:?}", other),
    }
}

#[test]
fn test_preload_requires_watch() {
    let (_engine, client) = setup();
    assert!(matches!(
        client.preload("/nowhere", PreloadType::OneLevel),
        Err(ConfError::NotFound { .. })
    ));
}

#[test]
fn test_clear_cache() {
    let (engine, client) = setup();
    engine.set("/a/k", &Value::Int(1)).unwrap();
    client.add_dir("/a", PreloadType::OneLevel).unwrap();
    assert_eq!(client.cached_entries(), 1);

    client.clear_cache();
    assert_eq!(client.cached_entries(), 0);
    assert_eq!(client.cache_lookup("/a/absent"), CacheResult::Miss);
}

// ---------------------------------------------------------------------------
// Notification Queue
// ---------------------------------------------------------------------------

#[test]
fn test_flush_coalesces_repeated_key() {
    let (engine, client) = setup();
    engine.set("/a/k", &Value::Int(1)).unwrap();
    client.add_dir("/a", PreloadType::OneLevel).unwrap();
    let keys = record_listener(&client, "/a");

    client.notify("/a/k").unwrap();
    client.notify("/a/k").unwrap();
    client.notify("/a/k").unwrap();
    assert_eq!(client.pending_notifications(), 3);

    assert_eq!(client.dispatch_pending(), 1);
    assert_eq!(*keys.lock(), vec!["/a/k".to_string()]);
}

#[test]
fn test_flush_delivers_in_sorted_order() {
    let (_engine, client) = setup();
    client.add_dir("/", PreloadType::None).unwrap();
    let keys = record_listener(&client, "/");

    client.notify("/z").unwrap();
    client.notify("/a").unwrap();
    client.notify("/m").unwrap();
    client.dispatch_pending();

    assert_eq!(*keys.lock(), vec!["/a".to_string(), "/m".to_string(), "/z".to_string()]);
}

#[test]
fn test_value_changed_fires_before_listeners() {
    let (engine, client) = setup();
    client.add_dir("/a", PreloadType::None).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    client.notify_add("/a", move |_, _, _| sink.lock().push("listener")).unwrap();
    let sink = order.clone();
    client.connect_value_changed(move |_, _, _| sink.lock().push("value_changed"));

    engine.set("/a/k", &Value::Int(1)).unwrap();
    client.dispatch_pending();
    assert_eq!(*order.lock(), vec!["value_changed", "listener"]);
}

#[test]
fn test_listener_namespaces() {
    let (engine, client) = setup();
    client.add_dir("/apps", PreloadType::None).unwrap();
    let demo = record_listener(&client, "/apps/demo");
    let other = record_listener(&client, "/apps/other");
    let exact = record_listener(&client, "/apps/demo/x");

    engine.set("/apps/demo/x", &Value::Int(1)).unwrap();
    engine.set("/apps/demo/y", &Value::Int(1)).unwrap();
    client.dispatch_pending();

    assert_eq!(*demo.lock(), vec!["/apps/demo/x".to_string(), "/apps/demo/y".to_string()]);
    assert!(other.lock().is_empty());
    assert_eq!(*exact.lock(), vec!["/apps/demo/x".to_string()]);
}

#[test]
fn test_listener_may_write_back() {
    let (_engine, client) = setup();
    client.add_dir("/a", PreloadType::None).unwrap();
    let changes = record_changes(&client);
    client
        .notify_add("/a/trigger", |c, _, _| {
            c.set_int("/a/echo", 1).or_report(c);
        })
        .unwrap();

    client.set_int("/a/trigger", 1).unwrap();
    client.dispatch_pending();

    let keys: Vec<String> = changes.lock().iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec!["/a/trigger".to_string(), "/a/echo".to_string()]);
}

#[test]
fn test_notify_remove_stops_delivery() {
    let (engine, client) = setup();
    client.add_dir("/a", PreloadType::None).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let sink = count.clone();
    let id = client
        .notify_add("/a", move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    engine.set("/a/k", &Value::Int(1)).unwrap();
    client.dispatch_pending();
    assert!(client.notify_remove(id));

    engine.set("/a/k", &Value::Int(2)).unwrap();
    client.dispatch_pending();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_recursive_unset_notifies_evicted_keys() {
    let (engine, client) = setup();
    engine.set("/ru/a", &Value::Int(1)).unwrap();
    engine.set("/ru/b/c", &Value::Int(2)).unwrap();
    client.add_dir("/ru", PreloadType::Recursive).unwrap();
    let changes = record_changes(&client);

    client.recursive_unset("/ru", UnsetFlags::default()).unwrap();
    client.dispatch_pending();

    let changes = changes.lock();
    assert!(changes.contains(&("/ru/a".to_string(), None)));
    assert!(changes.contains(&("/ru/b/c".to_string(), None)));
    assert!(engine.is_empty());
}

// ---------------------------------------------------------------------------
// Dispatch Loop
// ---------------------------------------------------------------------------

#[test]
fn test_wait_and_dispatch_across_threads() {
    let (engine, client) = setup();
    client.add_dir("/t", PreloadType::None).unwrap();
    let changes = record_changes(&client);

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            engine.set("/t/k", &Value::Int(1)).unwrap();
        })
    };

    assert!(client.wait_and_dispatch(Duration::from_secs(5)) >= 1);
    writer.join().unwrap();
    client.dispatch_pending();
    assert_eq!(*changes.lock(), vec![("/t/k".to_string(), Some(Value::Int(1)))]);
}

#[test]
fn test_wait_and_dispatch_times_out() {
    let (_engine, client) = setup();
    assert_eq!(client.wait_and_dispatch(Duration::from_millis(10)), 0);
}

#[test]
fn test_dispatch_budget() {
    let config = Config { dispatch_budget: 1, ..Config::interactive() };
    let (engine, client) = setup_with(config);
    client.add_dir("/b", PreloadType::None).unwrap();

    engine.set("/b/1", &Value::Int(1)).unwrap();
    engine.set("/b/2", &Value::Int(2)).unwrap();
    engine.set("/b/3", &Value::Int(3)).unwrap();

    let mut total = 0;
    loop {
        let handled = client.dispatch_pending();
        assert!(handled <= 1);
        if handled == 0 {
            break;
        }
        total += handled;
    }
    // Three remote changes plus one flush
    assert_eq!(total, 4);
}

// ---------------------------------------------------------------------------
// Change Sets
// ---------------------------------------------------------------------------

#[test]
fn test_change_set_fail_fast() {
    let (engine, client) = setup();
    engine.fail_writes_to("/cs/b");

    let mut cs = ChangeSet::new();
    cs.set_int("/cs/a", 1);
    cs.set_int("/cs/b", 2);
    cs.set_int("/cs/c", 3);

    let err = client.commit_change_set(&mut cs, true).unwrap_err();
    assert!(matches!(err, ConfError::CommitFailed { ref key, .. } if key == "/cs/b"));

    assert_eq!(engine.get_entry("/cs/a", false).unwrap().value, Some(Value::Int(1)));
    assert_eq!(engine.get_entry("/cs/c", false).unwrap().value, None);
    assert!(!cs.contains("/cs/a"));
    assert!(cs.contains("/cs/b"));
    assert!(cs.contains("/cs/c"));

    engine.clear_faults();
    client.commit_change_set(&mut cs, true).unwrap();
    assert!(cs.is_empty());
}

#[test]
fn test_reverse_change_set_snapshot() {
    let (engine, client) = setup();
    engine.set("/k", &Value::from("old")).unwrap();

    let mut cs = ChangeSet::new();
    cs.set_string("/k", "new");
    cs.set_int("/fresh", 1);

    let mut reverse = client.reverse_change_set(&cs).unwrap();
    assert_eq!(reverse.check_value("/k"), Some(Some(&Value::from("old"))));
    assert_eq!(reverse.check_value("/fresh"), Some(None));

    client.commit_change_set(&mut cs, false).unwrap();
    assert_eq!(client.get_string("/k").unwrap(), Some("new".to_string()));

    client.commit_change_set(&mut reverse, true).unwrap();
    assert_eq!(client.get_string("/k").unwrap(), Some("old".to_string()));
    assert_eq!(client.get("/fresh").unwrap(), None);
}

#[test]
fn test_change_set_from_current() {
    let (engine, client) = setup();
    engine.set("/cur/a", &Value::Bool(true)).unwrap();

    let cs = client.change_set_from_current(&["/cur/a", "/cur/b"]).unwrap();
    assert_eq!(cs.check_value("/cur/a"), Some(Some(&Value::Bool(true))));
    assert_eq!(cs.check_value("/cur/b"), Some(None));
}

// ---------------------------------------------------------------------------
// Values and Schemas
// ---------------------------------------------------------------------------

#[test]
fn test_schema_defaults() {
    let (engine, client) = setup();
    engine.install_schema("/schemas/apps/demo/size", Schema::with_default(ValueType::Int, Value::Int(10)));
    engine.associate_schema("/apps/demo/size", "/schemas/apps/demo/size");

    assert_eq!(client.get_int("/apps/demo/size").unwrap(), Some(10));
    assert_eq!(client.get_without_default("/apps/demo/size").unwrap(), None);
    assert!(client.get_entry("/apps/demo/size", true).unwrap().is_default);
    assert_eq!(client.get_default_from_schema("/apps/demo/size").unwrap(), Some(Value::Int(10)));

    let schema = client.get_schema("/schemas/apps/demo/size").unwrap().unwrap();
    assert_eq!(schema.value_type, ValueType::Int);
}

#[test]
fn test_typed_lists_and_pairs() {
    let (_engine, client) = setup();

    client.set_list("/t/list", vec![1, 2, 3]).unwrap();
    assert_eq!(client.get_list::<i32>("/t/list").unwrap(), Some(vec![1, 2, 3]));
    assert!(matches!(client.get_list::<String>("/t/list"), Err(ConfError::TypeMismatch { .. })));

    client.set_pair("/t/pair", 4, "four").unwrap();
    assert_eq!(client.get_pair::<i32, String>("/t/pair").unwrap(), Some((4, "four".to_string())));

    client.set_float("/t/float", 0.5).unwrap();
    client.set_bool("/t/bool", true).unwrap();
    assert_eq!(client.get_float("/t/float").unwrap(), Some(0.5));
    assert_eq!(client.get_bool("/t/bool").unwrap(), Some(true));
    assert!(matches!(client.get_bool("/t/float"), Err(ConfError::TypeMismatch { .. })));
}

#[test]
fn test_invalid_values_rejected_before_engine() {
    let (engine, client) = setup();
    let nested = Value::List { list_type: ValueType::List, items: vec![] };

    assert!(matches!(client.set("/v/k", &nested), Err(ConfError::InvalidValue { .. })));
    assert!(matches!(client.set_int("/v//k", 1), Err(ConfError::InvalidKey { .. })));
    assert_eq!(engine.write_calls(), 0);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn test_write_policy_errors() {
    let (engine, client) = setup();
    engine.set_read_only("/locked");
    engine.set_mandatory("/apps/demo/forced", Value::Int(1));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    client.connect_error(move |_, e| sink.lock().push(e.clone()));

    let denied = client.set_int("/locked/k", 1).unwrap_err();
    assert!(matches!(denied, ConfError::PermissionDenied { .. }));
    assert!(!denied.is_benign());

    let overridden = client.set_int("/apps/demo/forced", 2).unwrap_err();
    assert!(matches!(overridden, ConfError::Overridden { .. }));
    assert!(overridden.is_benign());

    assert_eq!(errors.lock().len(), 2);
    assert!(!client.key_is_writable("/apps/demo/forced").unwrap());
    assert!(!client.key_is_writable("/locked/k").unwrap());
    assert!(client.key_is_writable("/free/k").unwrap());
}

#[test]
fn test_writability_of_absent_key_in_complete_dir() {
    let (engine, client) = setup();
    engine.set("/ro/x", &Value::Int(1)).unwrap();
    engine.set("/rw/x", &Value::Int(1)).unwrap();
    engine.set_read_only("/ro");
    client.add_dir("/ro", PreloadType::OneLevel).unwrap();
    client.add_dir("/rw", PreloadType::OneLevel).unwrap();

    assert_eq!(client.cache_lookup("/ro/absent"), CacheResult::NegativeHit);
    assert!(!client.key_is_writable("/ro/absent").unwrap());
    assert!(matches!(client.set_int("/ro/absent", 1), Err(ConfError::PermissionDenied { .. })));

    assert_eq!(client.cache_lookup("/rw/absent"), CacheResult::NegativeHit);
    assert!(client.key_is_writable("/rw/absent").unwrap());

    // Cached entries answer without a round trip
    let calls = engine.get_entry_calls();
    assert!(!client.key_is_writable("/ro/x").unwrap());
    assert!(client.key_is_writable("/rw/x").unwrap());
    assert_eq!(engine.get_entry_calls(), calls);
}

#[test]
fn test_engine_unavailable() {
    let (engine, client) = setup();
    engine.set_available(false);

    assert!(matches!(client.get("/any/k"), Err(ConfError::EngineUnavailable { .. })));
    assert!(client.suggest_sync().is_err());
    engine.set_available(true);
    assert!(client.suggest_sync().is_ok());
}

#[test]
fn test_global_error_handler_modes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    set_global_error_handler(Some(Arc::new(move |e: &ConfError| {
        if e.key().map_or(false, |k| k.starts_with("/global")) {
            sink.lock().push(e.to_string());
        }
    })));

    // Unreturned mode: only errors passed to or_report reach the handler
    let (engine, client) = setup();
    engine.set_read_only("/global/ro");
    assert!(client.set_int("/global/ro/a", 1).is_err());
    assert_eq!(seen.lock().len(), 0);
    assert!(client.set_int("/global/ro/b", 1).or_report(&client).is_none());
    assert_eq!(seen.lock().len(), 1);

    // All mode: every error, reported once
    let (engine, batch) = setup_with(Config::batch());
    engine.set_read_only("/global/ro");
    assert!(batch.set_int("/global/ro/c", 1).is_err());
    assert_eq!(seen.lock().len(), 2);
    assert!(batch.set_int("/global/ro/d", 1).or_report(&batch).is_none());
    assert_eq!(seen.lock().len(), 3);

    // None mode: nothing reaches the handler
    let quiet_config = Config { error_handling: ErrorHandling::None, ..Config::interactive() };
    let (engine, quiet) = setup_with(quiet_config);
    engine.set_read_only("/global/ro");
    assert!(quiet.set_int("/global/ro/e", 1).is_err());
    assert!(quiet.set_int("/global/ro/f", 1).or_report(&quiet).is_none());
    assert_eq!(seen.lock().len(), 3);

    set_global_error_handler(None);
}

// ---------------------------------------------------------------------------
// Client Registry and Teardown
// ---------------------------------------------------------------------------

#[test]
fn test_one_client_per_engine() {
    let (engine, client) = setup();
    client.add_dir("/shared", PreloadType::None).unwrap();

    let again = Client::for_engine(engine.clone(), Config::batch()).unwrap();
    assert!(Client::same_client(&client, &again));
    assert_eq!(again.watched_dirs().len(), 1);
    assert_eq!(again.config(), &Config::interactive());

    drop(client);
    drop(again);
    let fresh = Client::for_engine(engine.clone(), Config::default()).unwrap();
    assert!(fresh.watched_dirs().is_empty());
}

#[test]
fn test_teardown_cancels_pending_notifications() {
    let (engine, client) = setup();
    client.add_dir("/a", PreloadType::None).unwrap();
    client.add_dir("/b", PreloadType::None).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let sink = count.clone();
    client
        .notify_add("/", move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    engine.set("/a/k", &Value::Int(1)).unwrap();
    client.notify("/b/k").unwrap();
    client.notify("/b/j").unwrap();
    assert_eq!(engine.live_subscriptions(), 2);

    // A surviving handle keeps everything alive
    let watcher = client.clone();
    drop(client);
    assert_eq!(watcher.pending_notifications(), 2);
    assert_eq!(engine.live_subscriptions(), 2);

    drop(watcher);
    assert_eq!(engine.live_subscriptions(), 0);

    // The next client for this engine inherits no queue, tasks or watches
    let fresh = Client::for_engine(engine.clone(), Config::default()).unwrap();
    assert_eq!(fresh.pending_notifications(), 0);
    assert_eq!(fresh.dispatch_pending(), 0);
    assert!(fresh.watched_dirs().is_empty());
    assert_eq!(fresh.cached_entries(), 0);

    engine.set("/a/k", &Value::Int(2)).unwrap();
    assert_eq!(fresh.dispatch_pending(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}
