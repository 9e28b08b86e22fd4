// Authoritative in-memory annotation store.
//
// Every mutation runs to completion under the state lock and builds exactly
// one ChangeEvent, including a snapshot of the full contents. The lock is
// released before observers run, so observers may read and mutate the store
// from inside their callback.

pub mod observer;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use marginalia_common::model::{
    Annotation, AnnotationKey, Body, BodyRef, BodyUpdate, ChangeEvent, ChangeKind, ChangeSet,
    Origin, Target, TargetUpdate, Update,
};
use thiserror::Error;
use tracing::warn;

use observer::{should_notify, Callback, Observer};
pub use observer::{ObserveOptions, ObserverId};

// ── Errors ─────────────────────────────────────────────────────────

/// Integrity violations. These indicate a caller bug and abort the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("annotation {id} already exists")]
    DuplicateAnnotation { id: String },
    #[error("bulk add would overwrite existing annotations: {}", .ids.join(", "))]
    BulkOverwrite { ids: Vec<String> },
    #[error("annotation {annotation} already has a body with id {id}")]
    DuplicateBody { annotation: String, id: String },
    #[error("body {id} cannot move from annotation {from} to {to}")]
    ReparentedBody { id: String, from: String, to: String },
}

// ── State ──────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    order: Vec<String>,
    index: HashMap<String, Annotation>,
    // body id -> owning annotation id
    bodies: HashMap<String, String>,
}

impl State {
    fn snapshot(&self) -> Vec<Annotation> {
        self.order.iter().filter_map(|id| self.index.get(id)).cloned().collect()
    }

    fn insert(&mut self, annotation: Annotation) {
        for body in &annotation.bodies {
            self.bodies.insert(body.id.clone(), annotation.id.clone());
        }
        if !self.index.contains_key(&annotation.id) {
            self.order.push(annotation.id.clone());
        }
        self.index.insert(annotation.id.clone(), annotation);
    }

    fn remove(&mut self, id: &str) -> Option<Annotation> {
        let removed = self.index.remove(id)?;
        self.order.retain(|existing| existing != id);
        for body in &removed.bodies {
            if self.bodies.get(&body.id).is_some_and(|owner| owner == id) {
                self.bodies.remove(&body.id);
            }
        }
        Some(removed)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
        self.bodies.clear();
    }
}

// ── Store ──────────────────────────────────────────────────────────

pub struct Store {
    state: RwLock<State>,
    observers: Mutex<Vec<Observer>>,
    next_observer: AtomicU64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Observation ────────────────────────────────────────────────

    pub fn observe(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
        options: ObserveOptions,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Observer { id, callback, options });
        id
    }

    /// Returns `false` if the observer was not registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|observer| observer.id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn emit(&self, origin: Origin, affects: ChangeKind, changes: ChangeSet, state: Vec<Annotation>) {
        let event = ChangeEvent { origin, affects, changes, state };

        let matching: Vec<Callback> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|observer| should_notify(&observer.options, &event))
            .map(|observer| Arc::clone(&observer.callback))
            .collect();

        for callback in matching {
            callback(&event);
        }
    }

    // ── Annotations ────────────────────────────────────────────────

    pub fn add_annotation(&self, annotation: Annotation, origin: Origin) -> Result<(), StoreError> {
        let state = {
            let mut state = self.write();
            if state.index.contains_key(&annotation.id) {
                return Err(StoreError::DuplicateAnnotation { id: annotation.id });
            }
            state.insert(annotation.clone());
            state.snapshot()
        };

        self.emit(origin, ChangeKind::Annotation, ChangeSet::created(vec![annotation]), state);
        Ok(())
    }

    /// With `replace`, the store is cleared and reloaded and the event lists
    /// the previous contents as deleted. Without it, any id collision fails
    /// the whole call and nothing is inserted.
    pub fn bulk_add_annotations(
        &self,
        annotations: Vec<Annotation>,
        replace: bool,
        origin: Origin,
    ) -> Result<(), StoreError> {
        let (changes, state) = {
            let mut state = self.write();
            if replace {
                let previous = state.snapshot();
                state.clear();
                for annotation in &annotations {
                    state.insert(annotation.clone());
                }
                let changes =
                    ChangeSet { created: annotations, deleted: previous, updated: Vec::new() };
                (changes, state.snapshot())
            } else {
                let collisions: Vec<String> = {
                    let mut seen = HashSet::new();
                    annotations
                        .iter()
                        .filter(|a| state.index.contains_key(&a.id) || !seen.insert(a.id.as_str()))
                        .map(|a| a.id.clone())
                        .collect()
                };
                if !collisions.is_empty() {
                    return Err(StoreError::BulkOverwrite { ids: collisions });
                }
                for annotation in &annotations {
                    state.insert(annotation.clone());
                }
                (ChangeSet::created(annotations), state.snapshot())
            }
        };

        self.emit(origin, ChangeKind::Annotation, changes, state);
        Ok(())
    }

    /// Removes an annotation by id or by value. Missing ids are logged and ignored.
    pub fn delete_annotation<K: AnnotationKey + ?Sized>(
        &self,
        key: &K,
        origin: Origin,
    ) -> Option<Annotation> {
        let id = key.annotation_id();
        let (removed, state) = {
            let mut state = self.write();
            let Some(removed) = state.remove(id) else {
                warn!(annotation = %id, "delete_annotation: annotation not in store");
                return None;
            };
            (removed, state.snapshot())
        };

        self.emit(origin, ChangeKind::Annotation, ChangeSet::deleted(vec![removed.clone()]), state);
        Some(removed)
    }

    // ── Bodies ─────────────────────────────────────────────────────

    pub fn add_body(&self, body: Body, origin: Origin) -> Result<(), StoreError> {
        let (update, state) = {
            let mut state = self.write();
            let Some(old) = state.index.get(&body.annotation).cloned() else {
                warn!(annotation = %body.annotation, body = %body.id, "add_body: annotation not in store");
                return Ok(());
            };
            if old.has_body(&body.id) {
                return Err(StoreError::DuplicateBody { annotation: old.id, id: body.id });
            }

            let mut new = old.clone();
            new.bodies.push(body.clone());
            state.insert(new.clone());

            let mut update = Update::new(old, new);
            update.bodies_created.push(body);
            (update, state.snapshot())
        };

        self.emit(origin, ChangeKind::Body, ChangeSet::updated(vec![update]), state);
        Ok(())
    }

    /// Returns `true` if a body was removed.
    pub fn delete_body(&self, body: &BodyRef, origin: Origin) -> bool {
        let (update, state) = {
            let mut state = self.write();
            let Some(old) = state.index.get(&body.annotation).cloned() else {
                warn!(annotation = %body.annotation, body = %body.id, "delete_body: annotation not in store");
                return false;
            };
            let Some(position) = old.bodies.iter().position(|b| b.id == body.id) else {
                warn!(annotation = %body.annotation, body = %body.id, "delete_body: body not on annotation");
                return false;
            };

            let mut new = old.clone();
            let removed = new.bodies.remove(position);
            state.bodies.remove(&removed.id);
            state.insert(new.clone());

            let mut update = Update::new(old, new);
            update.bodies_deleted.push(removed);
            (update, state.snapshot())
        };

        self.emit(origin, ChangeKind::Body, ChangeSet::updated(vec![update]), state);
        true
    }

    /// Replaces the body identified by `old` with `new_body`. The body must
    /// stay on the same annotation.
    pub fn update_body(&self, old: &BodyRef, new_body: Body, origin: Origin) -> Result<(), StoreError> {
        if old.annotation != new_body.annotation {
            return Err(StoreError::ReparentedBody {
                id: old.id.clone(),
                from: old.annotation.clone(),
                to: new_body.annotation,
            });
        }

        let (update, state) = {
            let mut state = self.write();
            let Some(previous) = state.index.get(&old.annotation).cloned() else {
                warn!(annotation = %old.annotation, body = %old.id, "update_body: annotation not in store");
                return Ok(());
            };
            let Some(position) = previous.bodies.iter().position(|b| b.id == old.id) else {
                warn!(annotation = %old.annotation, body = %old.id, "update_body: body not on annotation");
                return Ok(());
            };
            if new_body.id != old.id && previous.has_body(&new_body.id) {
                return Err(StoreError::DuplicateBody { annotation: previous.id, id: new_body.id });
            }

            let mut next = previous.clone();
            let old_body = std::mem::replace(&mut next.bodies[position], new_body.clone());
            state.bodies.remove(&old_body.id);
            state.insert(next.clone());

            let mut update = Update::new(previous, next);
            update.bodies_updated.push(BodyUpdate { old_body, new_body });
            (update, state.snapshot())
        };

        self.emit(origin, ChangeKind::Body, ChangeSet::updated(vec![update]), state);
        Ok(())
    }

    // ── Targets ────────────────────────────────────────────────────

    pub fn update_target(&self, target: Target, origin: Origin) {
        self.bulk_update_targets(vec![target], origin);
    }

    /// Targets whose annotation is missing are logged and skipped. One event
    /// covers every target that applied; none applied means no event.
    pub fn bulk_update_targets(&self, targets: Vec<Target>, origin: Origin) {
        let (updates, state) = {
            let mut state = self.write();
            let mut updates = Vec::with_capacity(targets.len());
            for target in targets {
                let Some(old) = state.index.get(&target.annotation).cloned() else {
                    warn!(annotation = %target.annotation, "update_target: annotation not in store");
                    continue;
                };
                let mut new = old.clone();
                new.target = target.clone();
                state.insert(new.clone());

                let mut update = Update::new(old.clone(), new);
                update.target_updated =
                    Some(TargetUpdate { old_target: old.target, new_target: target });
                updates.push(update);
            }
            if updates.is_empty() {
                return;
            }
            (updates, state.snapshot())
        };

        self.emit(origin, ChangeKind::Target, ChangeSet::updated(updates), state);
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Owned copy; later store mutations do not affect it.
    pub fn get_annotation(&self, id: &str) -> Option<Annotation> {
        self.read().index.get(id).cloned()
    }

    pub fn get_body(&self, id: &str) -> Option<Body> {
        let state = self.read();
        let annotation = state.bodies.get(id).and_then(|owner| state.index.get(owner))?;
        annotation.body(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().index.contains_key(id)
    }

    /// Every annotation, in insertion order.
    pub fn all(&self) -> Vec<Annotation> {
        self.read().snapshot()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn annotation(id: &str) -> Annotation {
        Annotation::new(id, json!({ "type": "RECTANGLE" }))
    }

    fn record(store: &Store, options: ObserveOptions) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.observe(move |event| sink.lock().expect("lock").push(event.clone()), options);
        events
    }

    // ── Annotations ────────────────────────────────────────────────

    #[test]
    fn add_annotation_emits_created_with_full_state() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        let events = record(&store, ObserveOptions::default());

        store.add_annotation(annotation("a2"), Origin::Local).expect("add a2");

        let events = events.lock().expect("lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].affects, ChangeKind::Annotation);
        assert_eq!(events[0].changes.created[0].id, "a2");
        let ids: Vec<&str> = events[0].state.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
    }

    #[test]
    fn duplicate_add_fails_without_emitting() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("first add");
        let events = record(&store, ObserveOptions::default());

        let err = store.add_annotation(annotation("a1"), Origin::Remote).expect_err("duplicate");
        assert_eq!(err, StoreError::DuplicateAnnotation { id: "a1".into() });
        assert!(events.lock().expect("lock").is_empty());
    }

    #[test]
    fn bulk_add_without_replace_lists_every_collision() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        store.add_annotation(annotation("a2"), Origin::Local).expect("add a2");

        let err = store
            .bulk_add_annotations(
                vec![annotation("a1"), annotation("a3"), annotation("a2")],
                false,
                Origin::Local,
            )
            .expect_err("collisions");

        assert_eq!(err, StoreError::BulkOverwrite { ids: vec!["a1".into(), "a2".into()] });
        assert!(!store.contains("a3"));
    }

    #[test]
    fn bulk_add_with_replace_reports_previous_contents_as_deleted() {
        let store = Store::new();
        store.add_annotation(annotation("old"), Origin::Local).expect("add old");
        let events = record(&store, ObserveOptions::default());

        store
            .bulk_add_annotations(vec![annotation("n1"), annotation("n2")], true, Origin::Remote)
            .expect("replace");

        let events = events.lock().expect("lock");
        assert_eq!(events[0].origin, Origin::Remote);
        assert_eq!(events[0].changes.deleted[0].id, "old");
        assert_eq!(events[0].changes.created.len(), 2);
        assert_eq!(store.len(), 2);
        assert!(!store.contains("old"));
    }

    #[test]
    fn delete_annotation_accepts_id_or_value() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        store.add_annotation(annotation("a2"), Origin::Local).expect("add a2");

        assert!(store.delete_annotation("a1", Origin::Local).is_some());
        let a2 = store.get_annotation("a2").expect("a2 present");
        assert!(store.delete_annotation(&a2, Origin::Local).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn deleting_missing_annotation_is_a_silent_no_op() {
        let store = Store::new();
        let events = record(&store, ObserveOptions::default());
        assert!(store.delete_annotation("ghost", Origin::Local).is_none());
        assert!(events.lock().expect("lock").is_empty());
    }

    // ── Bodies ─────────────────────────────────────────────────────

    #[test]
    fn body_mutations_classify_the_update() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        let events = record(&store, ObserveOptions::default().affects(ChangeKind::Body));

        store.add_body(Body::new("b1", "a1", "first"), Origin::Local).expect("add body");
        store
            .update_body(&BodyRef::new("b1", "a1"), Body::new("b1", "a1", "second"), Origin::Local)
            .expect("update body");
        assert!(store.delete_body(&BodyRef::new("b1", "a1"), Origin::Local));

        let events = events.lock().expect("lock");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].changes.updated[0].bodies_created[0].value, "first");
        let change = &events[1].changes.updated[0].bodies_updated[0];
        assert_eq!((change.old_body.value.as_str(), change.new_body.value.as_str()), ("first", "second"));
        assert_eq!(events[2].changes.updated[0].bodies_deleted[0].id, "b1");
        assert!(store.get_body("b1").is_none());
    }

    #[test]
    fn update_body_rejects_reparenting() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        store.add_body(Body::new("b1", "a1", "x"), Origin::Local).expect("add body");

        let err = store
            .update_body(&BodyRef::new("b1", "a1"), Body::new("b1", "a2", "x"), Origin::Local)
            .expect_err("reparent");
        assert!(matches!(err, StoreError::ReparentedBody { .. }));
        assert_eq!(store.get_body("b1").map(|b| b.annotation), Some("a1".to_string()));
    }

    #[test]
    fn duplicate_body_is_rejected() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        store.add_body(Body::new("b1", "a1", "x"), Origin::Local).expect("add body");
        assert!(matches!(
            store.add_body(Body::new("b1", "a1", "y"), Origin::Local),
            Err(StoreError::DuplicateBody { .. })
        ));
    }

    #[test]
    fn body_on_missing_annotation_is_ignored() {
        let store = Store::new();
        store.add_body(Body::new("b1", "ghost", "x"), Origin::Local).expect("no-op");
        assert!(!store.delete_body(&BodyRef::new("b1", "ghost"), Origin::Local));
        assert!(store.get_body("b1").is_none());
    }

    // ── Targets ────────────────────────────────────────────────────

    #[test]
    fn bulk_update_targets_skips_missing_and_emits_once() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        let events = record(&store, ObserveOptions::default().affects(ChangeKind::Target));

        store.bulk_update_targets(
            vec![Target::new("a1", json!({ "x": 5 })), Target::new("ghost", json!({}))],
            Origin::Local,
        );
        store.update_target(Target::new("ghost", json!({})), Origin::Local);

        let events = events.lock().expect("lock");
        assert_eq!(events.len(), 1);
        let update = &events[0].changes.updated[0];
        let target = update.target_updated.as_ref().expect("target delta");
        assert_eq!(target.new_target.selector.as_value()["x"], 5);
        assert_eq!(update.old_value.target.selector.as_value()["type"], "RECTANGLE");
    }

    // ── Queries & observers ────────────────────────────────────────

    #[test]
    fn returned_annotations_are_detached_copies() {
        let store = Store::new();
        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");

        let mut copy = store.get_annotation("a1").expect("a1 present");
        copy.bodies.push(Body::new("b9", "a1", "sneaky"));

        assert!(store.get_annotation("a1").expect("a1 present").bodies.is_empty());
    }

    #[test]
    fn observers_can_mutate_the_store_reentrantly() {
        let store = Store::shared();
        let inner = Arc::clone(&store);
        store.observe(
            move |event| {
                for created in &event.changes.created {
                    let body = Body::new(format!("{}-auto", created.id), created.id.clone(), "");
                    inner.add_body(body, Origin::Remote).expect("nested add_body");
                }
            },
            ObserveOptions::default().origin(Origin::Local),
        );

        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        assert!(store.get_body("a1-auto").is_some());
    }

    #[test]
    fn unobserve_detaches_the_callback() {
        let store = Store::new();
        let events = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&events);
        let id = store.observe(move |_| *sink.lock().expect("lock") += 1, ObserveOptions::default());

        store.add_annotation(annotation("a1"), Origin::Local).expect("add a1");
        assert!(store.unobserve(id));
        store.add_annotation(annotation("a2"), Origin::Local).expect("add a2");

        assert_eq!(*events.lock().expect("lock"), 1);
        assert_eq!(store.observer_count(), 0);
    }
}
