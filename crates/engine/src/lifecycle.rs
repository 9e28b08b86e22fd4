// Derives coarse annotation lifecycle events from store and selection changes.
//
// Two states:
//   EMPTY    no snapshot held
//   SELECTED snapshot of the selected annotations as they were when selected
//
// While SELECTED, local edits to selected annotations are held back. When an
// annotation leaves the selection, its snapshot is compared with the current
// store value and at most one `Update` is emitted for the whole edit session.
// Remote edits to selected annotations are folded into the snapshot, so the
// final diff only contains this session's changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use marginalia_common::model::{Annotation, ChangeEvent, Origin, Update};

use crate::events::{Emitter, SubscriptionId};
use crate::selection::{Selection, SelectionState};
use crate::store::{ObserveOptions, ObserverId, Store};

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Create(Annotation),
    Delete(Annotation),
    Update { annotation: Annotation, previous: Annotation },
    /// Current selection snapshot after a selection transition.
    SelectionChanged(Vec<Annotation>),
}

#[derive(Default)]
struct Hooks {
    local: Option<ObserverId>,
    remote: Option<ObserverId>,
    selection: Option<SubscriptionId>,
}

pub struct Lifecycle {
    store: Arc<Store>,
    selection: Arc<Selection>,
    initial: Mutex<Option<Vec<Annotation>>>,
    emitter: Emitter<LifecycleEvent>,
    hooks: Mutex<Hooks>,
}

impl Lifecycle {
    pub fn new(store: Arc<Store>, selection: Arc<Selection>) -> Arc<Self> {
        let lifecycle = Arc::new(Self {
            store: Arc::clone(&store),
            selection: Arc::clone(&selection),
            initial: Mutex::new(None),
            emitter: Emitter::new(),
            hooks: Mutex::new(Hooks::default()),
        });

        let weak: Weak<Self> = Arc::downgrade(&lifecycle);
        let on_selection = selection.subscribe(move |state| {
            if let Some(lifecycle) = weak.upgrade() {
                lifecycle.on_selection(state);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&lifecycle);
        let local = store.observe(
            move |event| {
                if let Some(lifecycle) = weak.upgrade() {
                    lifecycle.on_local_change(event);
                }
            },
            ObserveOptions::default().origin(Origin::Local),
        );

        let weak: Weak<Self> = Arc::downgrade(&lifecycle);
        let remote = store.observe(
            move |event| {
                if let Some(lifecycle) = weak.upgrade() {
                    lifecycle.on_remote_change(event);
                }
            },
            ObserveOptions::default().origin(Origin::Remote),
        );

        *lifecycle.hooks.lock().unwrap_or_else(PoisonError::into_inner) =
            Hooks { local: Some(local), remote: Some(remote), selection: Some(on_selection) };

        lifecycle
    }

    pub fn on(&self, listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.emitter.subscribe(listener)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    /// Snapshot held for the current selection; `None` while nothing is selected.
    pub fn initial_selection(&self) -> Option<Vec<Annotation>> {
        self.initial().clone()
    }

    pub fn is_holding(&self, id: &str) -> bool {
        self.initial().as_ref().is_some_and(|held| held.iter().any(|a| a.id == id))
    }

    /// Stops listening to the store and the selection.
    pub fn detach(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(id) = hooks.local {
            self.store.unobserve(id);
        }
        if let Some(id) = hooks.remote {
            self.store.unobserve(id);
        }
        if let Some(id) = hooks.selection {
            self.selection.unsubscribe(id);
        }
    }

    fn initial(&self) -> MutexGuard<'_, Option<Vec<Annotation>>> {
        self.initial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Selection transitions ──────────────────────────────────────

    fn on_selection(&self, state: &SelectionState) {
        let mut pending = Vec::new();

        let current = {
            let mut initial = self.initial();
            match (initial.take(), state.is_empty()) {
                (None, true) => return,
                (None, false) => {
                    *initial = Some(self.fetch(&state.selected));
                }
                (Some(held), true) => {
                    pending.extend(held.into_iter().filter_map(|snapshot| self.session_update(snapshot)));
                }
                (Some(held), false) => {
                    let (staying, leaving): (Vec<_>, Vec<_>) =
                        held.into_iter().partition(|a| state.selected.contains(&a.id));
                    pending.extend(leaving.into_iter().filter_map(|snapshot| self.session_update(snapshot)));

                    let added: Vec<String> = state
                        .selected
                        .iter()
                        .filter(|id| !staying.iter().any(|a| &a.id == *id))
                        .cloned()
                        .collect();
                    let mut next = staying;
                    next.extend(self.fetch(&added));
                    *initial = Some(next);
                }
            }
            initial.clone().unwrap_or_default()
        };

        for event in pending {
            self.emitter.emit(&event);
        }
        self.emitter.emit(&LifecycleEvent::SelectionChanged(current));
    }

    fn fetch(&self, ids: &[String]) -> Vec<Annotation> {
        ids.iter().filter_map(|id| self.store.get_annotation(id)).collect()
    }

    /// One consolidated update if the annotation changed during the session.
    fn session_update(&self, snapshot: Annotation) -> Option<LifecycleEvent> {
        let current = self.store.get_annotation(&snapshot.id)?;
        (current != snapshot)
            .then_some(LifecycleEvent::Update { annotation: current, previous: snapshot })
    }

    // ── Store changes ──────────────────────────────────────────────

    fn on_local_change(&self, event: &ChangeEvent) {
        let mut pending: Vec<LifecycleEvent> = Vec::new();
        pending.extend(event.changes.created.iter().cloned().map(LifecycleEvent::Create));
        pending.extend(event.changes.deleted.iter().cloned().map(LifecycleEvent::Delete));

        {
            let initial = self.initial();
            let held = |id: &str| initial.as_ref().is_some_and(|h| h.iter().any(|a| a.id == id));
            pending.extend(event.changes.updated.iter().filter(|u| !held(u.annotation_id())).map(
                |update| LifecycleEvent::Update {
                    annotation: update.new_value.clone(),
                    previous: update.old_value.clone(),
                },
            ));
        }

        for event in pending {
            self.emitter.emit(&event);
        }
    }

    fn on_remote_change(&self, event: &ChangeEvent) {
        let mut initial = self.initial();
        let Some(held) = initial.as_mut() else { return };

        for update in &event.changes.updated {
            if let Some(snapshot) = held.iter_mut().find(|a| a.id == update.annotation_id()) {
                patch_snapshot(snapshot, update);
            }
        }
    }
}

/// Applies a remote delta to a held snapshot without touching parts the
/// delta does not mention.
fn patch_snapshot(snapshot: &mut Annotation, update: &Update) {
    let classified = update.target_updated.is_some()
        || !update.bodies_created.is_empty()
        || !update.bodies_deleted.is_empty()
        || !update.bodies_updated.is_empty();
    if !classified {
        *snapshot = update.new_value.clone();
        return;
    }

    if let Some(target) = &update.target_updated {
        snapshot.target = target.new_target.clone();
    }
    for body in &update.bodies_created {
        match snapshot.bodies.iter_mut().find(|b| b.id == body.id) {
            Some(existing) => *existing = body.clone(),
            None => snapshot.bodies.push(body.clone()),
        }
    }
    for body in &update.bodies_deleted {
        snapshot.bodies.retain(|b| b.id != body.id);
    }
    for change in &update.bodies_updated {
        match snapshot.bodies.iter_mut().find(|b| b.id == change.old_body.id) {
            Some(existing) => *existing = change.new_body.clone(),
            None => snapshot.bodies.push(change.new_body.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_common::model::{Body, BodyRef, Target};
    use serde_json::json;

    struct Fixture {
        store: Arc<Store>,
        selection: Arc<Selection>,
        lifecycle: Arc<Lifecycle>,
        events: Arc<Mutex<Vec<LifecycleEvent>>>,
    }

    fn fixture() -> Fixture {
        let store = Store::shared();
        let selection = Selection::new(Arc::clone(&store));
        let lifecycle = Lifecycle::new(Arc::clone(&store), Arc::clone(&selection));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        lifecycle.on(move |event| sink.lock().expect("lock").push(event.clone()));
        Fixture { store, selection, lifecycle, events }
    }

    fn updates(events: &Mutex<Vec<LifecycleEvent>>) -> Vec<(Annotation, Annotation)> {
        events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Update { annotation, previous } => {
                    Some((annotation.clone(), previous.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn local_create_and_delete_are_forwarded_immediately() {
        let f = fixture();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.store.delete_annotation("a1", Origin::Local);
        f.store.add_annotation(Annotation::new("r1", json!({})), Origin::Remote).expect("add");

        let events = f.events.lock().expect("lock");
        assert!(matches!(&events[0], LifecycleEvent::Create(a) if a.id == "a1"));
        assert!(matches!(&events[1], LifecycleEvent::Delete(a) if a.id == "a1"));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn edits_while_selected_collapse_into_one_update() {
        let f = fixture();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.selection.set_selected(["a1"]);
        let before = f.store.get_annotation("a1").expect("a1");

        f.store.add_body(Body::new("b1", "a1", "one"), Origin::Local).expect("add body");
        let b1 = BodyRef::new("b1", "a1");
        f.store.update_body(&b1, Body::new("b1", "a1", "two"), Origin::Local).expect("edit");
        f.store.update_body(&b1, Body::new("b1", "a1", "three"), Origin::Local).expect("edit");
        assert!(updates(&f.events).is_empty());

        f.selection.clear();

        let updates = updates(&f.events);
        assert_eq!(updates.len(), 1);
        let (annotation, previous) = &updates[0];
        assert_eq!(previous, &before);
        assert_eq!(annotation.bodies[0].value, "three");
        assert!(f.lifecycle.initial_selection().is_none());
    }

    #[test]
    fn unchanged_selection_emits_no_update() {
        let f = fixture();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.selection.set_selected(["a1"]);
        f.selection.clear();

        assert!(updates(&f.events).is_empty());
        let selection_events = f
            .events
            .lock()
            .expect("lock")
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::SelectionChanged(_)))
            .count();
        assert_eq!(selection_events, 2);
    }

    #[test]
    fn changing_selection_flushes_only_the_items_that_left() {
        let f = fixture();
        for id in ["a1", "a2", "a3"] {
            f.store.add_annotation(Annotation::new(id, json!({})), Origin::Local).expect("add");
        }
        f.selection.set_selected(["a1", "a2"]);
        f.store.update_target(Target::new("a1", json!({ "x": 1 })), Origin::Local);
        f.store.update_target(Target::new("a2", json!({ "x": 2 })), Origin::Local);

        f.selection.set_selected(["a2", "a3"]);

        let updates = updates(&f.events);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.id, "a1");
        let held: Vec<String> = f
            .lifecycle
            .initial_selection()
            .expect("still selected")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(held, vec!["a2", "a3"]);
    }

    #[test]
    fn local_updates_to_unselected_annotations_pass_through() {
        let f = fixture();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.store.update_target(Target::new("a1", json!({ "x": 9 })), Origin::Local);

        let updates = updates(&f.events);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.target.selector.as_value()["x"], 9);
    }

    #[test]
    fn remote_edits_patch_the_held_snapshot() {
        let f = fixture();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.selection.set_selected(["a1"]);

        f.store.add_body(Body::new("remote", "a1", "from peer"), Origin::Remote).expect("remote body");
        f.store.add_body(Body::new("mine", "a1", "local"), Origin::Local).expect("local body");
        f.selection.clear();

        let updates = updates(&f.events);
        assert_eq!(updates.len(), 1);
        let (annotation, previous) = &updates[0];
        assert!(previous.has_body("remote"));
        assert!(!previous.has_body("mine"));
        assert_eq!(annotation.bodies.len(), 2);
    }

    #[test]
    fn remote_only_changes_do_not_produce_updates_on_deselect() {
        let f = fixture();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.selection.set_selected(["a1"]);
        f.store.update_target(Target::new("a1", json!({ "moved": true })), Origin::Remote);
        f.selection.clear();

        assert!(updates(&f.events).is_empty());
    }

    #[test]
    fn detach_stops_all_forwarding() {
        let f = fixture();
        f.lifecycle.detach();
        f.store.add_annotation(Annotation::new("a1", json!({})), Origin::Local).expect("add");
        f.selection.set_selected(["a1"]);
        assert!(f.events.lock().expect("lock").is_empty());
    }
}
