// Two sync engines sharing an in-process hub and backing store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use marginalia_common::model::{Annotation, Body, BodyRef, Origin, Target, User};
use marginalia_common::protocol::broadcast::{BroadcastEvent, BroadcastMessage, Sender};
use marginalia_common::protocol::records::{AnnotationRecord, TargetRecord};
use marginalia_engine::lifecycle::Lifecycle;
use marginalia_engine::selection::Selection;
use marginalia_engine::store::Store;
use marginalia_engine::sync::{
    BackingStore, BackingStoreError, ChangeFeed, InMemoryBackingStore, LocalChannel, LocalHub,
    PeerIdentity, RealtimeChannel, RetryPolicy, SyncEngine, SyncError, SyncEvent, SyncOptions,
};
use serde_json::json;

struct Peer {
    store: Arc<Store>,
    selection: Arc<Selection>,
    engine: SyncEngine<InMemoryBackingStore, LocalChannel>,
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl Peer {
    fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn key(&self) -> &str {
        &self.engine.identity().presence_key
    }
}

fn options(broadcast_bodies: bool) -> SyncOptions {
    SyncOptions {
        broadcast_bodies,
        events_per_second: 0,
        retry: RetryPolicy { base_delay: Duration::from_millis(5), ..RetryPolicy::default() },
    }
}

fn peer(hub: &LocalHub, backing: &Arc<InMemoryBackingStore>, user: &str, options: SyncOptions) -> Peer {
    let store = Store::shared();
    let selection = Selection::new(Arc::clone(&store));
    let lifecycle = Lifecycle::new(Arc::clone(&store), Arc::clone(&selection));
    let engine = SyncEngine::new(
        PeerIdentity::with_key(format!("{user}-tab"), User::signed_in(user)),
        Arc::clone(&store),
        Arc::clone(&selection),
        lifecycle,
        Arc::clone(backing),
        Arc::new(hub.channel()),
        options,
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.events().subscribe(move |event| sink.lock().expect("events lock").push(event.clone()));

    Peer { store, selection, engine, events }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn seed(backing: &InMemoryBackingStore, annotation: &Annotation) {
    let actor = User::signed_in("seeder");
    backing.create_annotation(annotation, &actor).await.expect("seed annotation");
    backing.create_target(&annotation.target, &actor).await.expect("seed target");
    if !annotation.bodies.is_empty() {
        backing.upsert_bodies(&annotation.bodies, &actor).await.expect("seed bodies");
    }
}

fn setup() -> (LocalHub, Arc<InMemoryBackingStore>) {
    (LocalHub::new("layer"), Arc::new(InMemoryBackingStore::new()))
}

/// Backing store that has a peer broadcast while the snapshot is being read,
/// so the message lands between the channel join and the load.
struct BroadcastDuringLoad {
    inner: Arc<InMemoryBackingStore>,
    channel: LocalChannel,
    message: BroadcastMessage,
}

impl BackingStore for BroadcastDuringLoad {
    async fn fetch_all(&self) -> Result<Vec<AnnotationRecord>, BackingStoreError> {
        self.channel.broadcast(self.message.clone()).await.expect("hub is online");
        self.inner.fetch_all().await
    }

    async fn subscribe_changes(&self) -> Result<ChangeFeed, BackingStoreError> {
        self.inner.subscribe_changes().await
    }

    async fn create_annotation(&self, annotation: &Annotation, actor: &User) -> Result<(), BackingStoreError> {
        self.inner.create_annotation(annotation, actor).await
    }

    async fn create_target(&self, target: &Target, actor: &User) -> Result<(), BackingStoreError> {
        self.inner.create_target(target, actor).await
    }

    async fn update_target(&self, target: &Target, actor: &User) -> Result<(), BackingStoreError> {
        self.inner.update_target(target, actor).await
    }

    async fn upsert_bodies(&self, bodies: &[Body], actor: &User) -> Result<(), BackingStoreError> {
        self.inner.upsert_bodies(bodies, actor).await
    }

    async fn delete_bodies(&self, ids: &[String]) -> Result<(), BackingStoreError> {
        self.inner.delete_bodies(ids).await
    }

    async fn delete_annotation(&self, id: &str) -> Result<(), BackingStoreError> {
        self.inner.delete_annotation(id).await
    }
}

// ── Connect ────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_loads_the_snapshot() {
    let (hub, backing) = setup();
    seed(&backing, &Annotation::new("a1", json!({ "x": 1 })).with_body(Body::new("b1", "a1", "note"))).await;

    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");

    let loaded = alice.store.get_annotation("a1").expect("snapshot annotation");
    assert_eq!(loaded.target.version, Some(1));
    assert_eq!(loaded.bodies.len(), 1);
    assert_eq!(loaded.bodies[0].value, "note");
    assert!(matches!(&alice.events()[..], [SyncEvent::InitialLoad(a)] if a.len() == 1));
    assert!(alice.engine.is_connected());

    alice.engine.shutdown().await;
}

#[tokio::test]
async fn failed_initial_load_is_reported_and_leaves_the_channel() {
    let (hub, backing) = setup();
    backing.fail_next(BackingStoreError::Unavailable("connection refused".into()));

    let alice = peer(&hub, &backing, "alice", options(false));
    let err = alice.engine.connect().await.expect_err("load must fail");

    assert!(matches!(err, SyncError::InitialLoad(BackingStoreError::Unavailable(_))));
    assert!(matches!(&alice.events()[..], [SyncEvent::InitialLoadError(_)]));
    assert!(hub.member_keys().is_empty());
    assert!(!alice.engine.is_connected());

    // A later attempt can succeed.
    alice.engine.connect().await.expect("second connect");
    alice.engine.shutdown().await;
}

#[tokio::test]
async fn creates_broadcast_during_the_load_do_not_collide_with_the_snapshot() {
    let (hub, backing) = setup();
    let seeded = Annotation::new("a1", json!({ "x": 1 }));
    seed(&backing, &seeded).await;

    let racing = Arc::new(BroadcastDuringLoad {
        inner: Arc::clone(&backing),
        channel: hub.channel(),
        message: BroadcastMessage {
            from: Sender::new("bob-tab", "bob"),
            events: vec![
                BroadcastEvent::CreateAnnotation { annotation: seeded },
                BroadcastEvent::CreateAnnotation { annotation: Annotation::new("a2", json!({ "x": 2 })) },
            ],
        },
    });

    let store = Store::shared();
    let selection = Selection::new(Arc::clone(&store));
    let lifecycle = Lifecycle::new(Arc::clone(&store), Arc::clone(&selection));
    let engine = SyncEngine::new(
        PeerIdentity::with_key("alice-tab", User::signed_in("alice")),
        Arc::clone(&store),
        selection,
        lifecycle,
        racing,
        Arc::new(hub.channel()),
        options(false),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.events().subscribe(move |event| sink.lock().expect("events lock").push(event.clone()));

    engine.connect().await.expect("connect");

    assert!(store.contains("a1"));
    assert!(store.contains("a2"), "creates missing from the snapshot still apply");
    let events = events.lock().expect("events lock").clone();
    assert!(
        !events.iter().any(|e| matches!(e, SyncEvent::IntegrityError(_))),
        "unexpected integrity errors: {events:?}"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn unreachable_channel_fails_connect() {
    let (hub, backing) = setup();
    hub.set_offline(true);

    let alice = peer(&hub, &backing, "alice", options(false));
    let err = alice.engine.connect().await.expect_err("offline hub");
    assert!(matches!(err, SyncError::Connection(_)));
}

#[tokio::test]
async fn connecting_twice_is_rejected() {
    let (hub, backing) = setup();
    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");

    assert!(matches!(alice.engine.connect().await, Err(SyncError::AlreadyConnected)));
    alice.engine.shutdown().await;
}

// ── Propagation ────────────────────────────────────────────────────

#[tokio::test]
async fn local_create_reaches_peer_and_backing_store() {
    let (hub, backing) = setup();
    let alice = peer(&hub, &backing, "alice", options(false));
    let bob = peer(&hub, &backing, "bob", options(false));
    alice.engine.connect().await.expect("alice connect");
    bob.engine.connect().await.expect("bob connect");

    alice
        .store
        .add_annotation(Annotation::new("a1", json!({ "x": 1 })), Origin::Local)
        .expect("add annotation");

    eventually("backing target row", || backing.target("a1").is_some()).await;
    eventually("peer copy", || bob.store.contains("a1")).await;

    let mine = alice.store.get_annotation("a1").expect("local copy");
    let theirs = bob.store.get_annotation("a1").expect("peer copy");
    assert_eq!(mine.target.version, Some(1));
    assert_eq!(theirs.target.selector, mine.target.selector);
    assert_eq!(backing.annotation_ids(), vec!["a1".to_string()]);

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_bodies_from_two_peers_converge() {
    for broadcast_bodies in [false, true] {
        let (hub, backing) = setup();
        seed(&backing, &Annotation::new("a1", json!({}))).await;

        let alice = peer(&hub, &backing, "alice", options(broadcast_bodies));
        let bob = peer(&hub, &backing, "bob", options(broadcast_bodies));
        alice.engine.connect().await.expect("alice connect");
        bob.engine.connect().await.expect("bob connect");

        alice.store.add_body(Body::new("from-alice", "a1", "A"), Origin::Local).expect("alice body");
        bob.store.add_body(Body::new("from-bob", "a1", "B"), Origin::Local).expect("bob body");

        let both = |store: &Store| {
            store.get_annotation("a1").is_some_and(|a| a.has_body("from-alice") && a.has_body("from-bob"))
        };
        eventually("alice sees both bodies", || both(&alice.store)).await;
        eventually("bob sees both bodies", || both(&bob.store)).await;
        assert_eq!(backing.bodies_of("a1").len(), 2);

        alice.engine.shutdown().await;
        bob.engine.shutdown().await;
    }
}

#[tokio::test]
async fn moved_target_settles_on_the_persisted_version() {
    let (hub, backing) = setup();
    seed(&backing, &Annotation::new("a1", json!({ "x": 1 }))).await;

    let alice = peer(&hub, &backing, "alice", options(false));
    let bob = peer(&hub, &backing, "bob", options(false));
    alice.engine.connect().await.expect("alice connect");
    bob.engine.connect().await.expect("bob connect");

    alice.store.update_target(Target::new("a1", json!({ "x": 2 })), Origin::Local);

    let settled = |store: &Store| {
        store
            .get_annotation("a1")
            .is_some_and(|a| a.target.version == Some(2) && a.target.selector.as_value() == &json!({ "x": 2 }))
    };
    eventually("bob applies the move", || settled(&bob.store)).await;
    eventually("alice holds version 2", || settled(&alice.store)).await;
    assert_eq!(backing.target("a1").and_then(|t| t.version), Some(2));

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
}

#[tokio::test]
async fn out_of_band_writes_arrive_through_the_change_feed() {
    let (hub, backing) = setup();
    seed(&backing, &Annotation::new("a1", json!({ "x": 1 }))).await;

    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");

    let record = backing.target("a1").expect("target row");
    backing.external_target_update(TargetRecord { value: "{\"x\":9}".into(), ..record });

    eventually("external move applied", || {
        alice.store.get_annotation("a1").is_some_and(|a| a.target.version == Some(2))
    })
    .await;
    assert_eq!(
        alice.store.get_annotation("a1").expect("annotation").target.selector.as_value(),
        &json!({ "x": 9 })
    );

    alice.engine.shutdown().await;
}

#[tokio::test]
async fn edits_to_a_selected_annotation_persist_on_deselect() {
    let (hub, backing) = setup();
    seed(&backing, &Annotation::new("a1", json!({})).with_body(Body::new("b1", "a1", "draft"))).await;

    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");
    let writes_before = backing.write_count();

    alice.selection.set_selected(["a1"]);
    for text in ["draft 2", "draft 3", "final"] {
        alice
            .store
            .update_body(&BodyRef::new("b1", "a1"), Body::new("b1", "a1", text), Origin::Local)
            .expect("edit body");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backing.write_count(), writes_before, "held edits must not be written");

    alice.selection.clear();
    eventually("body persisted", || backing.body("b1").is_some_and(|b| b.value == "final")).await;
    assert_eq!(backing.write_count(), writes_before + 1);
    assert_eq!(backing.body("b1").and_then(|b| b.version), Some(2));

    alice.engine.shutdown().await;
}

#[tokio::test]
async fn local_delete_removes_rows_everywhere() {
    let (hub, backing) = setup();
    seed(&backing, &Annotation::new("a1", json!({})).with_body(Body::new("b1", "a1", "x"))).await;

    let alice = peer(&hub, &backing, "alice", options(false));
    let bob = peer(&hub, &backing, "bob", options(false));
    alice.engine.connect().await.expect("alice connect");
    bob.engine.connect().await.expect("bob connect");

    alice.store.delete_annotation("a1", Origin::Local);

    eventually("backing row gone", || backing.annotation_ids().is_empty()).await;
    eventually("peer copy gone", || !bob.store.contains("a1")).await;
    assert!(backing.bodies_of("a1").is_empty());

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
}

// ── Presence ───────────────────────────────────────────────────────

#[tokio::test]
async fn peers_see_each_other_and_their_selection() {
    let (hub, backing) = setup();
    seed(&backing, &Annotation::new("a1", json!({}))).await;

    let alice = peer(&hub, &backing, "alice", options(false));
    let bob = peer(&hub, &backing, "bob", options(false));
    alice.engine.connect().await.expect("alice connect");
    bob.engine.connect().await.expect("bob connect");

    let alice_key = alice.key().to_string();
    eventually("bob sees alice", || bob.engine.presence().get(&alice_key).is_some()).await;
    assert!(bob.engine.presence().get(bob.key()).is_none(), "own connection is not a present user");

    alice.selection.set_selected(["a1"]);
    eventually("selection propagated", || {
        bob.engine
            .presence()
            .get(&alice_key)
            .is_some_and(|u| u.selection == Some(vec!["a1".to_string()]))
    })
    .await;

    alice.engine.shutdown().await;
    eventually("alice left", || bob.engine.presence().get(&alice_key).is_none()).await;
    bob.engine.shutdown().await;
}

// ── Failures and shutdown ──────────────────────────────────────────

#[tokio::test]
async fn rejected_write_surfaces_a_save_error() {
    let (hub, backing) = setup();
    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");

    backing.fail_next(BackingStoreError::Rejected("permission denied".into()));
    alice.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");

    eventually("save error", || alice.events().iter().any(|e| matches!(e, SyncEvent::SaveError(_)))).await;
    let failed: Vec<&'static str> = alice
        .events()
        .iter()
        .filter_map(|e| match e {
            SyncEvent::SaveError(err) => Some(err.op.label()),
            _ => None,
        })
        .collect();
    assert_eq!(failed.first(), Some(&"create_annotation"));
    // The optimistic local state stays.
    assert!(alice.store.contains("a1"));

    alice.engine.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (hub, backing) = setup();
    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");

    backing.fail_next_n(BackingStoreError::Unavailable("timeout".into()), 2);
    alice.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");

    eventually("target persisted", || backing.target("a1").is_some()).await;
    assert!(!alice.events().iter().any(|e| matches!(e, SyncEvent::SaveError(_))));

    alice.engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_persistence_and_is_final() {
    let (hub, backing) = setup();
    let alice = peer(&hub, &backing, "alice", options(false));
    alice.engine.connect().await.expect("connect");

    alice.engine.shutdown().await;
    alice.engine.shutdown().await;
    assert!(hub.member_keys().is_empty());

    let writes = backing.write_count();
    alice.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backing.write_count(), writes);

    assert!(matches!(alice.engine.connect().await, Err(SyncError::ShutDown)));
}
