// Outbound persistence of local lifecycle events.
//
// Two phases per event:
//   APPLY_LOCAL     bump versions in the store right away (origin REMOTE, so
//                   neither the lifecycle nor the broadcaster sees it again)
//   PERSIST_REMOTE  queue the matching backing-store writes
//
// One worker drains the queue in order. Transient failures are retried with
// the configured backoff; anything else, or running out of attempts, is
// reported as a `SaveError`. The optimistic local state is never rolled back.

use std::ops::ControlFlow;
use std::sync::Arc;

use marginalia_common::diff::diff_annotations;
use marginalia_common::model::{Annotation, Body, Origin, Target, User};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use super::backing::{BackingStore, BackingStoreError};
use super::error::SaveError;
use super::retry::RetryPolicy;
use super::SyncEvent;
use crate::events::Emitter;
use crate::lifecycle::LifecycleEvent;
use crate::store::Store;

/// One backing-store write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    CreateAnnotation(Annotation),
    CreateTarget(Target),
    UpdateTarget(Target),
    UpsertBodies(Vec<Body>),
    DeleteBodies(Vec<String>),
    DeleteAnnotation(String),
}

impl WriteOp {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateAnnotation(_) => "create_annotation",
            Self::CreateTarget(_) => "create_target",
            Self::UpdateTarget(_) => "update_target",
            Self::UpsertBodies(_) => "upsert_bodies",
            Self::DeleteBodies(_) => "delete_bodies",
            Self::DeleteAnnotation(_) => "delete_annotation",
        }
    }

    pub fn annotation_id(&self) -> Option<&str> {
        match self {
            Self::CreateAnnotation(a) => Some(&a.id),
            Self::CreateTarget(t) | Self::UpdateTarget(t) => Some(&t.annotation),
            Self::UpsertBodies(bodies) => bodies.first().map(|b| b.annotation.as_str()),
            Self::DeleteBodies(_) => None,
            Self::DeleteAnnotation(id) => Some(id),
        }
    }
}

// ── APPLY_LOCAL ────────────────────────────────────────────────────

/// Bumps versions in the store for a lifecycle event and returns the writes
/// that persist it.
pub fn apply_local(store: &Store, event: &LifecycleEvent) -> Vec<WriteOp> {
    match event {
        LifecycleEvent::Create(annotation) => apply_create(store, annotation),
        LifecycleEvent::Update { annotation, previous } => apply_update(store, annotation, previous),
        LifecycleEvent::Delete(annotation) => vec![WriteOp::DeleteAnnotation(annotation.id.clone())],
        LifecycleEvent::SelectionChanged(_) => Vec::new(),
    }
}

fn apply_create(store: &Store, annotation: &Annotation) -> Vec<WriteOp> {
    let current = store.get_annotation(&annotation.id).unwrap_or_else(|| annotation.clone());

    let target = Target { version: Some(1), ..current.target.clone() };
    if target != current.target && store.contains(&current.id) {
        store.update_target(target.clone(), Origin::Remote);
    }

    let bodies: Vec<Body> =
        current.bodies.iter().map(|b| Body { version: Some(1), ..b.clone() }).collect();
    for body in &bodies {
        write_body(store, body);
    }

    let mut ops = vec![WriteOp::CreateAnnotation(current.clone()), WriteOp::CreateTarget(target)];
    if !bodies.is_empty() {
        ops.push(WriteOp::UpsertBodies(bodies));
    }
    ops
}

fn apply_update(store: &Store, annotation: &Annotation, previous: &Annotation) -> Vec<WriteOp> {
    let diff = diff_annotations(previous, annotation);
    let mut ops = Vec::new();

    if let Some(target) = diff.changed_target {
        let local_version = store
            .get_annotation(&annotation.id)
            .map_or(0, |a| a.target.version_or_zero())
            .max(previous.target.version_or_zero());
        let target = Target { version: Some(local_version + 1), ..target };
        if store.contains(&annotation.id) {
            store.update_target(target.clone(), Origin::Remote);
        }
        ops.push(WriteOp::UpdateTarget(target));
    }

    if !diff.removed_bodies.is_empty() {
        ops.push(WriteOp::DeleteBodies(diff.removed_bodies.into_iter().map(|b| b.id).collect()));
    }

    let mut upserts: Vec<Body> =
        diff.added_bodies.into_iter().map(|b| Body { version: Some(1), ..b }).collect();
    upserts.extend(diff.changed_bodies.into_iter().map(|b| {
        // The edit itself may have carried a stale or missing version.
        let local_version = store
            .get_body(&b.id)
            .map_or(0, |local| local.version_or_zero())
            .max(previous.body(&b.id).map_or(0, Body::version_or_zero));
        Body { version: Some(local_version + 1), ..b }
    }));
    for body in &upserts {
        write_body(store, body);
    }
    if !upserts.is_empty() {
        ops.push(WriteOp::UpsertBodies(upserts));
    }

    ops
}

fn write_body(store: &Store, body: &Body) {
    let Some(local) = store.get_body(&body.id) else { return };
    if &local == body {
        return;
    }
    if let Err(err) = store.update_body(&local.to_ref(), body.clone(), Origin::Remote) {
        warn!(annotation = %body.annotation, body = %body.id, error = %err, "version bump rejected");
    }
}

// ── PERSIST_REMOTE ─────────────────────────────────────────────────

pub(crate) struct Writer<B> {
    pub backing: Arc<B>,
    pub actor: User,
    pub retry: RetryPolicy,
    pub events: Arc<Emitter<SyncEvent>>,
    pub shutdown: watch::Receiver<bool>,
}

impl<B: BackingStore> Writer<B> {
    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<WriteOp>) {
        let mut rng = StdRng::from_entropy();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let op = tokio::select! {
                op = queue.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
                _ = self.shutdown.changed() => break,
            };
            if self.persist(op, &mut rng).await.is_break() {
                break;
            }
        }
        debug!("writer stopped");
    }

    async fn persist(&mut self, op: WriteOp, rng: &mut StdRng) -> ControlFlow<()> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.execute(&op).await {
                Ok(()) => {
                    debug!(op = op.label(), annotation = ?op.annotation_id(), attempt, "write persisted");
                    return ControlFlow::Continue(());
                }
                Err(error) => error,
            };
            if *self.shutdown.borrow() {
                return ControlFlow::Break(());
            }

            if error.is_transient() && attempt < attempts {
                let delay = self.retry.delay_for(attempt - 1, rng);
                warn!(op = op.label(), attempt, ?delay, %error, "write failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = self.shutdown.changed() => return ControlFlow::Break(()),
                }
            }

            error!(op = op.label(), annotation = ?op.annotation_id(), attempts = attempt, %error, "write abandoned");
            self.events.emit(&SyncEvent::SaveError(SaveError { op, error, attempts: attempt }));
            return ControlFlow::Continue(());
        }
    }

    async fn execute(&self, op: &WriteOp) -> Result<(), BackingStoreError> {
        match op {
            WriteOp::CreateAnnotation(annotation) => {
                self.backing.create_annotation(annotation, &self.actor).await
            }
            WriteOp::CreateTarget(target) => self.backing.create_target(target, &self.actor).await,
            WriteOp::UpdateTarget(target) => self.backing.update_target(target, &self.actor).await,
            WriteOp::UpsertBodies(bodies) => self.backing.upsert_bodies(bodies, &self.actor).await,
            WriteOp::DeleteBodies(ids) => self.backing.delete_bodies(ids).await,
            WriteOp::DeleteAnnotation(id) => self.backing.delete_annotation(id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::sync::memory::InMemoryBackingStore;
    use marginalia_common::model::BodyRef;
    use serde_json::json;

    fn seeded_store() -> Store {
        let store = Store::new();
        let annotation = Annotation::new("a1", json!({})).with_body(Body::new("b1", "a1", "one"));
        store.add_annotation(annotation, Origin::Local).expect("seed");
        store
    }

    #[test]
    fn create_stamps_version_one_and_persists_rows_in_order() {
        let store = seeded_store();
        let created = store.get_annotation("a1").expect("a1");

        let ops = apply_local(&store, &LifecycleEvent::Create(created));

        let labels: Vec<&str> = ops.iter().map(WriteOp::label).collect();
        assert_eq!(labels, vec!["create_annotation", "create_target", "upsert_bodies"]);
        let stored = store.get_annotation("a1").expect("a1");
        assert_eq!(stored.target.version, Some(1));
        assert_eq!(stored.bodies[0].version, Some(1));
    }

    #[test]
    fn update_bumps_changed_parts_past_the_local_version() {
        let store = seeded_store();
        apply_local(&store, &LifecycleEvent::Create(store.get_annotation("a1").expect("a1")));
        let previous = store.get_annotation("a1").expect("a1");

        store
            .update_body(&BodyRef::new("b1", "a1"), Body { version: Some(1), ..Body::new("b1", "a1", "two") }, Origin::Local)
            .expect("edit");
        store.add_body(Body::new("b2", "a1", "new"), Origin::Local).expect("add");
        let annotation = store.get_annotation("a1").expect("a1");

        let ops = apply_local(&store, &LifecycleEvent::Update { annotation, previous });

        let WriteOp::UpsertBodies(bodies) = &ops[0] else { panic!("expected upsert, got {ops:?}") };
        let versions: Vec<(&str, Option<i64>)> =
            bodies.iter().map(|b| (b.id.as_str(), b.version)).collect();
        assert_eq!(versions, vec![("b2", Some(1)), ("b1", Some(2))]);
        assert_eq!(store.get_body("b1").and_then(|b| b.version), Some(2));
    }

    #[test]
    fn target_move_and_body_removal_become_separate_writes() {
        let store = seeded_store();
        apply_local(&store, &LifecycleEvent::Create(store.get_annotation("a1").expect("a1")));
        let previous = store.get_annotation("a1").expect("a1");
        let mut annotation = previous.clone();
        annotation.target.selector = json!({ "moved": true }).into();
        annotation.bodies.clear();

        let ops = apply_local(&store, &LifecycleEvent::Update { annotation, previous });

        assert!(matches!(&ops[0], WriteOp::UpdateTarget(t) if t.version == Some(2)));
        assert_eq!(ops[1], WriteOp::DeleteBodies(vec!["b1".into()]));
    }

    fn writer(
        backing: Arc<InMemoryBackingStore>,
        retry: RetryPolicy,
    ) -> (Writer<InMemoryBackingStore>, Arc<Mutex<Vec<SaveError>>>, watch::Sender<bool>) {
        let events = Arc::new(Emitter::new());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        events.subscribe(move |event: &SyncEvent| {
            if let SyncEvent::SaveError(failure) = event {
                sink.lock().expect("lock").push(failure.clone());
            }
        });
        let (shutdown_tx, shutdown) = watch::channel(false);
        let writer = Writer { backing, actor: User::guest("me"), retry, events, shutdown };
        (writer, failures, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let backing = Arc::new(InMemoryBackingStore::new());
        backing.fail_next_n(BackingStoreError::Unavailable("offline".into()), 2);
        let (writer, failures, _shutdown) = writer(Arc::clone(&backing), RetryPolicy::default());

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WriteOp::CreateAnnotation(Annotation::new("a1", json!({})))).expect("queue");
        drop(tx);

        let started = tokio::time::Instant::now();
        writer.run(rx).await;

        assert_eq!(backing.annotation_ids(), vec!["a1".to_string()]);
        assert!(started.elapsed() >= Duration::from_millis(250 + 500));
        assert!(failures.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_a_save_error() {
        let backing = Arc::new(InMemoryBackingStore::new());
        backing.fail_next_n(BackingStoreError::Unavailable("offline".into()), 10);
        let retry = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        let (writer, failures, _shutdown) = writer(Arc::clone(&backing), retry);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WriteOp::DeleteAnnotation("a1".into())).expect("queue");
        drop(tx);
        writer.run(rx).await;

        let failures = failures.lock().expect("lock");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].op, WriteOp::DeleteAnnotation("a1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_not_retried_and_the_queue_moves_on() {
        let backing = Arc::new(InMemoryBackingStore::new());
        let (writer, failures, _shutdown) = writer(Arc::clone(&backing), RetryPolicy::default());

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WriteOp::CreateTarget(Target::new("ghost", json!({})))).expect("queue");
        tx.send(WriteOp::CreateAnnotation(Annotation::new("a1", json!({})))).expect("queue");
        drop(tx);
        writer.run(rx).await;

        let failures = failures.lock().expect("lock");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 1);
        assert_eq!(backing.annotation_ids(), vec!["a1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_pending_retries_silently() {
        let backing = Arc::new(InMemoryBackingStore::new());
        backing.fail_next_n(BackingStoreError::Unavailable("offline".into()), 10);
        let (writer, failures, shutdown) = writer(Arc::clone(&backing), RetryPolicy::default());

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WriteOp::DeleteAnnotation("a1".into())).expect("queue");
        let task = tokio::spawn(writer.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send_replace(true);
        task.await.expect("writer task");

        assert!(failures.lock().expect("lock").is_empty());
    }
}
