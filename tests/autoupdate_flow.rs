use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use plenum_sync::{
    connection::ERROR_CHANGE_ID_TOO_HIGH,
    prelude::*,
    test_support::{full_data, CaptureSink, RecordingHistory, SinkEvent, StaticPermissions, TableCachable},
};
use serde_json::json;

const CAN_SEE: &str = "widgets.can_see";
const SEEING_USER: UserId = 5;
const BLIND_USER: UserId = 7;

struct Fixture {
    widgets:    Arc<TableCachable>,
    cache:      Arc<ElementCache>,
    dispatcher: Arc<AutoupdateDispatcher>,
    history:    Arc<RecordingHistory>,
}

async fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let permissions = Arc::new(StaticPermissions::new().grant(SEEING_USER, CAN_SEE));
    let widgets = Arc::new(
        TableCachable::new("widgets")
            .restricted_by(CAN_SEE, permissions)
            .with_rows([json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})]),
    );
    let settings = Arc::new(
        TableCachable::new("core/config")
            .config()
            .with_rows([json!({"id": 1, "key": "general_name", "value": "Assembly"})]),
    );
    let registry = Arc::new(
        CachableRegistry::new([
            Arc::clone(&widgets) as Arc<dyn Cachable>,
            settings as Arc<dyn Cachable>,
        ])
        .expect("registry"),
    );

    let cache = Arc::new(ElementCache::in_memory(registry));
    cache.ensure_cache(false).await.expect("initial build");

    let history = Arc::new(RecordingHistory::new());
    let dispatcher = Arc::new(AutoupdateDispatcher::new(
        Arc::clone(&cache),
        Arc::clone(&history) as Arc<dyn HistoryStore>,
    ));

    Fixture {
        widgets,
        cache,
        dispatcher,
        history,
    }
}

fn ids_of(elements: &[FullData]) -> Vec<u64> {
    elements
        .iter()
        .map(|element| element.get("id").and_then(serde_json::Value::as_u64).expect("id"))
        .collect()
}

#[tokio::test]
async fn build_serves_all_collections() {
    let fx = fixture().await;

    let all = fx.cache.get_all_data(None).await.expect("all data");
    assert_eq!(ids_of(&all["widgets"]), vec![1, 2]);
    assert_eq!(all["core/config"].len(), 1);

    let lowest = fx.cache.lowest_change_id().await.expect("lowest");
    let current = fx.cache.current_change_id().await.expect("current");
    assert_eq!(lowest, current);
}

#[tokio::test]
async fn restriction_hides_collections_per_viewer() {
    let fx = fixture().await;

    let seeing = fx.cache.get_all_data(Some(SEEING_USER)).await.expect("all data");
    assert!(seeing.contains_key("widgets"));

    let blind = fx.cache.get_all_data(Some(BLIND_USER)).await.expect("all data");
    assert!(!blind.contains_key("widgets"));
    assert!(blind.contains_key("core/config"));

    let element = fx
        .cache
        .get_element("widgets", 1, Some(BLIND_USER))
        .await
        .expect("get element");
    assert!(element.is_none());
}

#[tokio::test]
async fn bundle_commit_assigns_one_change_id() {
    let fx = fixture().await;
    let before = fx.cache.current_change_id().await.expect("current");

    fx.widgets.upsert(full_data(json!({"id": 3, "name": "c"})));
    let mut bundle = fx.dispatcher.bundle();
    bundle.add([
        AutoupdateElement::new("widgets", 3),
        AutoupdateElement::new("widgets", 1).with_data(Some(full_data(json!({"id": 1, "name": "a2"})))),
    ]);
    let change_id = bundle.done().await.expect("commit").expect("non-empty bundle");
    assert_eq!(change_id, before + 1);

    let (to, changed, deleted) = fx
        .cache
        .get_data_since(None, change_id)
        .await
        .expect("diff");
    assert_eq!(to, change_id);
    assert_eq!(ids_of(&changed["widgets"]), vec![1, 3]);
    assert!(deleted.is_empty());
}

#[tokio::test]
async fn caught_up_clients_get_empty_diffs() {
    let fx = fixture().await;

    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "b"}))))]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    // Asking again from just past the last received change id yields nothing.
    let (to, changed, deleted) = fx
        .cache
        .get_data_since(None, change_id + 1)
        .await
        .expect("diff");
    assert_eq!(to, change_id);
    assert!(changed.is_empty());
    assert!(deleted.is_empty());
}

#[tokio::test]
async fn empty_bundle_commits_nothing() {
    let fx = fixture().await;
    let before = fx.cache.current_change_id().await.expect("current");

    let bundle = fx.dispatcher.bundle();
    assert_eq!(bundle.done().await.expect("commit"), None);
    assert_eq!(fx.cache.current_change_id().await.expect("current"), before);
}

#[tokio::test]
async fn unresolved_elements_missing_from_the_source_are_deletions() {
    let fx = fixture().await;

    fx.widgets.delete(2);
    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 2)]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    let (_, changed, deleted) = fx
        .cache
        .get_data_since(None, change_id)
        .await
        .expect("diff");
    assert!(changed.is_empty());
    assert_eq!(deleted, vec!["widgets:2".to_owned()]);
}

#[tokio::test]
async fn history_records_bundle_elements() {
    let fx = fixture().await;

    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "renamed"}))))
        .with_information(vec!["Widget renamed".to_owned()])
        .with_user_id(SEEING_USER)]);
    bundle.done().await.expect("commit");

    let entries = fx.history.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].element_id, "widgets:1");
    assert_eq!(entries[0].information, vec!["Widget renamed".to_owned()]);
    assert_eq!(entries[0].user_id, Some(SEEING_USER));
    assert!(entries[0].full_data.is_some());
}

#[tokio::test]
async fn broken_history_store_does_not_block_the_commit() {
    let fx = fixture().await;
    fx.history.fail_saves();

    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "still works"}))))]);
    let change_id = bundle.done().await.expect("commit");
    assert!(change_id.is_some());
    assert!(fx.history.entries().is_empty());
}

#[tokio::test]
async fn disabled_history_is_skipped() {
    let fx = fixture().await;

    let mut bundle = fx.dispatcher.bundle();
    bundle.disable_history();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "quiet"}))))]);
    bundle.done().await.expect("commit");
    assert!(fx.history.entries().is_empty());
}

#[tokio::test]
async fn connection_sends_restricted_diffs() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        None,
    );

    fx.widgets.upsert(full_data(json!({"id": 3, "name": "c"})));
    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 3)]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    connection.on_new_change_id(change_id).await;

    let events = sink.take();
    assert_eq!(events.len(), 1);
    let SinkEvent::Autoupdate { payload, .. } = &events[0]
    else {
        panic!("expected an autoupdate frame, got {events:?}");
    };
    assert!(!payload.all_data);
    assert_eq!(payload.from_change_id, change_id);
    assert_eq!(payload.to_change_id, change_id);
    assert_eq!(ids_of(&payload.changed["widgets"]), vec![3]);
    assert_eq!(connection.client_change_id().await, Some(change_id));
}

#[tokio::test]
async fn restricted_away_changes_become_deletions_for_the_viewer() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(BLIND_USER),
        None,
    );

    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "hidden"}))))]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    connection.on_new_change_id(change_id).await;

    let events = sink.take();
    assert_eq!(events.len(), 1);
    let SinkEvent::Autoupdate { payload, .. } = &events[0]
    else {
        panic!("expected an autoupdate frame, got {events:?}");
    };
    assert!(payload.changed.is_empty());
    assert_eq!(payload.deleted["widgets"], vec![1]);
}

#[tokio::test]
async fn marked_elements_are_never_reported_deleted() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(BLIND_USER),
        None,
    );

    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "partially visible"}))))
        .no_delete_on_restriction()]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    connection.on_new_change_id(change_id).await;

    // Everything was restricted away and nothing may be deleted: no frame.
    assert!(sink.take().is_empty());

    // The marker is internal and never reaches unrestricted readers either.
    let element = fx
        .cache
        .get_element("widgets", 1, None)
        .await
        .expect("get element")
        .expect("element exists");
    assert!(!element.contains_key("_no_delete_on_restriction"));
}

#[tokio::test]
async fn expired_change_ids_fall_back_to_a_full_resync() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        None,
    );

    // Change id 1 predates the build; no diff is answerable from there.
    connection
        .request_change_id(1, Some("req-1".to_owned()))
        .await
        .expect("request");

    let events = sink.take();
    assert_eq!(events.len(), 1);
    let SinkEvent::Autoupdate { payload, in_response } = &events[0]
    else {
        panic!("expected an autoupdate frame, got {events:?}");
    };
    assert!(payload.all_data);
    assert_eq!(in_response.as_deref(), Some("req-1"));
    assert_eq!(ids_of(&payload.changed["widgets"]), vec![1, 2]);

    let current = fx.cache.current_change_id().await.expect("current");
    assert_eq!(connection.client_change_id().await, Some(current));
}

#[tokio::test]
async fn future_change_ids_are_rejected_with_a_stable_code() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        None,
    );

    let current = fx.cache.current_change_id().await.expect("current");
    connection
        .request_change_id(current + 10, Some("req-2".to_owned()))
        .await
        .expect("request");

    let events = sink.take();
    assert_eq!(events.len(), 1);
    let SinkEvent::Error { code, in_response, .. } = &events[0]
    else {
        panic!("expected an error frame, got {events:?}");
    };
    assert_eq!(*code, ERROR_CHANGE_ID_TOO_HIGH);
    assert_eq!(in_response.as_deref(), Some("req-2"));
}

#[tokio::test]
async fn up_to_date_requests_send_nothing() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        None,
    );

    let current = fx.cache.current_change_id().await.expect("current");
    connection.request_change_id(current, None).await.expect("request");
    assert!(sink.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bursts_are_coalesced_into_one_frame() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        Some(Duration::from_millis(100)),
    );

    fx.widgets.upsert(full_data(json!({"id": 3, "name": "c"})));
    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 3)]);
    let first = bundle.done().await.expect("commit").expect("change id");
    connection.on_new_change_id(first).await;

    fx.widgets.upsert(full_data(json!({"id": 4, "name": "d"})));
    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 4)]);
    let second = bundle.done().await.expect("commit").expect("change id");
    connection.on_new_change_id(second).await;

    // Nothing goes out before the coalescing window closes.
    assert!(sink.events().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;

    let events = sink.take();
    assert_eq!(events.len(), 1);
    let SinkEvent::Autoupdate { payload, .. } = &events[0]
    else {
        panic!("expected an autoupdate frame, got {events:?}");
    };
    assert_eq!(payload.from_change_id, first);
    assert_eq!(payload.to_change_id, second);
    assert_eq!(ids_of(&payload.changed["widgets"]), vec![3, 4]);
}

#[tokio::test]
async fn subscribed_connections_are_driven_by_the_dispatcher() {
    let fx = fixture().await;
    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&fx.cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        None,
    );
    let driver = connection.subscribe(fx.dispatcher.subscribe_changes());

    fx.widgets.upsert(full_data(json!({"id": 3, "name": "c"})));
    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 3)]);
    bundle.done().await.expect("commit");

    // The frame is produced by the driver task; poll for it.
    let mut waited = 0;
    while sink.events().is_empty() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    let events = sink.take();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SinkEvent::Autoupdate { .. }));

    connection.close().await;
    driver.abort();
}

struct FailingPermissions;

#[async_trait]
impl PermissionService for FailingPermissions {
    async fn has_perm(&self, _: Option<UserId>, _: &str) -> Result<bool, CacheError> {
        Err(CacheError::external(std::io::Error::other("auth backend down")))
    }

    async fn user_groups(&self, _: Option<UserId>) -> Result<Vec<u64>, CacheError> {
        Err(CacheError::external(std::io::Error::other("auth backend down")))
    }
}

#[tokio::test]
async fn auth_outages_skip_the_push_instead_of_faking_deletions() {
    let widgets = Arc::new(
        TableCachable::new("widgets")
            .restricted_by(CAN_SEE, Arc::new(FailingPermissions))
            .with_rows([json!({"id": 1, "name": "a"})]),
    );
    let registry = Arc::new(
        CachableRegistry::new([Arc::clone(&widgets) as Arc<dyn Cachable>]).expect("registry"),
    );
    let cache = Arc::new(ElementCache::in_memory(registry));
    cache.ensure_cache(false).await.expect("initial build");
    let dispatcher = Arc::new(AutoupdateDispatcher::new(Arc::clone(&cache), Arc::new(NoHistory)));

    let sink = Arc::new(CaptureSink::new());
    let connection = AutoupdateConnection::new(
        Arc::clone(&cache),
        Arc::clone(&sink) as Arc<dyn AutoupdateSink>,
        Some(SEEING_USER),
        None,
    );

    let mut bundle = dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "still here"}))))]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    connection.on_new_change_id(change_id).await;

    // No frame at all: in particular no fabricated deletion of widget 1.
    assert!(sink.take().is_empty());

    // The client is not marked as caught up, so the push is retried on the
    // next round instead of being lost.
    assert_eq!(connection.client_change_id().await, Some(change_id - 1));
}

#[tokio::test]
async fn rebuilds_never_reuse_handed_out_change_ids() {
    let fx = fixture().await;

    let mut bundle = fx.dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "warm"}))))]);
    let warm = bundle.done().await.expect("commit").expect("change id");

    // External flush plus an immediate rebuild, well within one
    // millisecond of the warm commit.
    fx.cache.provider().clear().await.expect("flush");
    fx.cache.ensure_cache(true).await.expect("rebuild");

    let lowest = fx.cache.lowest_change_id().await.expect("lowest");
    assert!(
        lowest > warm,
        "rebuild seeded change id {lowest} although {warm} was already handed out"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_a_partial_bundle() {
    let fx = fixture().await;

    let dispatcher = Arc::clone(&fx.dispatcher);
    let writer = tokio::spawn(async move {
        for round in 1..=50u64 {
            let mut bundle = dispatcher.bundle();
            bundle.add([
                AutoupdateElement::new("widgets", 1)
                    .with_data(Some(full_data(json!({"id": 1, "round": round})))),
                AutoupdateElement::new("widgets", 2)
                    .with_data(Some(full_data(json!({"id": 2, "round": round})))),
            ]);
            bundle.done().await.expect("commit");
        }
    });

    let cache = Arc::clone(&fx.cache);
    let reader = tokio::spawn(async move {
        for _ in 0..200 {
            let widgets = cache.get_collection_data("widgets").await.expect("read");
            let first = widgets[&1].get("round").and_then(serde_json::Value::as_u64);
            let second = widgets[&2].get("round").and_then(serde_json::Value::as_u64);
            // Both elements of a bundle are visible together or not at all.
            assert_eq!(first, second, "observed a torn bundle: {widgets:?}");
            tokio::task::yield_now().await;
        }
    });

    writer.await.expect("writer");
    reader.await.expect("reader");
}

struct ActiveWidgets;

#[async_trait]
impl ProjectorResolver for ActiveWidgets {
    async fn projector_data(&self, cache: &ElementCache) -> Result<ProjectorData, CacheError> {
        let widgets = cache.get_collection_data("widgets").await?;
        Ok(BTreeMap::from([(1, widgets.into_values().collect())]))
    }
}

#[tokio::test]
async fn projector_updates_follow_every_commit() {
    let fx = fixture().await;
    let dispatcher = Arc::new(
        AutoupdateDispatcher::new(Arc::clone(&fx.cache), Arc::new(NoHistory))
            .with_projector(Arc::new(ActiveWidgets)),
    );
    let mut projector_rx = dispatcher.subscribe_projector();

    let mut bundle = dispatcher.bundle();
    bundle.add([AutoupdateElement::new("widgets", 1)
        .with_data(Some(full_data(json!({"id": 1, "name": "on stage"}))))]);
    let change_id = bundle.done().await.expect("commit").expect("change id");

    let update = projector_rx.recv().await.expect("projector update");
    assert_eq!(update.change_id, change_id);
    assert_eq!(update.data[&1].len(), 2);
}

#[tokio::test]
async fn an_externally_flushed_store_is_rebuilt_transparently() {
    let fx = fixture().await;
    let old_lowest = fx.cache.lowest_change_id().await.expect("lowest");

    fx.cache.provider().clear().await.expect("flush");

    let all = fx.cache.get_all_data(None).await.expect("rebuilt read");
    assert_eq!(ids_of(&all["widgets"]), vec![1, 2]);
    assert!(fx.cache.lowest_change_id().await.expect("lowest") >= old_lowest);
}
