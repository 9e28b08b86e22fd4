// Peer broadcast events -> store (origin REMOTE).
//
// Updates carry the sender's version. They apply when the incoming version
// is at least the local one and the value differs; an older version means
// the change feed already delivered something newer.

use marginalia_common::model::{BodyRef, Origin};
use marginalia_common::protocol::broadcast::BroadcastEvent;
use tracing::debug;

use super::error::IntegrityError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Stale, identical, or already gone.
    Skipped,
}

pub fn apply_broadcast(store: &Store, event: &BroadcastEvent) -> Result<ApplyOutcome, IntegrityError> {
    match event {
        BroadcastEvent::CreateAnnotation { annotation } => {
            store.add_annotation(annotation.clone(), Origin::Remote)?;
            Ok(ApplyOutcome::Applied)
        }

        BroadcastEvent::DeleteAnnotation { id } => {
            if !store.contains(id) {
                return Ok(ApplyOutcome::Skipped);
            }
            store.delete_annotation(id.as_str(), Origin::Remote);
            Ok(ApplyOutcome::Applied)
        }

        BroadcastEvent::CreateBody { body } | BroadcastEvent::UpdateBody { body } => {
            let Some(annotation) = store.get_annotation(&body.annotation) else {
                return Err(IntegrityError::MissingAnnotation {
                    annotation: body.annotation.clone(),
                    context: event.kind(),
                });
            };
            let Some(local) = annotation.body(&body.id) else {
                store.add_body(body.clone(), Origin::Remote)?;
                return Ok(ApplyOutcome::Applied);
            };
            if body.version_or_zero() < local.version_or_zero() || local == body {
                debug!(annotation = %body.annotation, body = %body.id, version = ?body.version, "skipping body broadcast");
                return Ok(ApplyOutcome::Skipped);
            }
            store.update_body(&local.to_ref(), body.clone(), Origin::Remote)?;
            Ok(ApplyOutcome::Applied)
        }

        BroadcastEvent::DeleteBody { id, annotation } => {
            let removed = store.delete_body(&BodyRef::new(id.clone(), annotation.clone()), Origin::Remote);
            Ok(if removed { ApplyOutcome::Applied } else { ApplyOutcome::Skipped })
        }

        BroadcastEvent::UpdateTarget { target } => {
            let Some(annotation) = store.get_annotation(&target.annotation) else {
                return Err(IntegrityError::MissingAnnotation {
                    annotation: target.annotation.clone(),
                    context: event.kind(),
                });
            };
            let local = &annotation.target;
            if target.version_or_zero() < local.version_or_zero() || local == target {
                debug!(annotation = %target.annotation, version = ?target.version, "skipping target broadcast");
                return Ok(ApplyOutcome::Skipped);
            }
            store.update_target(target.clone(), Origin::Remote);
            Ok(ApplyOutcome::Applied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use marginalia_common::model::{Annotation, Body, Target};
    use serde_json::json;

    fn store_with(annotation: Annotation) -> Store {
        let store = Store::new();
        store.add_annotation(annotation, Origin::Remote).expect("seed");
        store
    }

    #[test]
    fn duplicate_create_fails_loudly() {
        let annotation = Annotation::new("a1", json!({}));
        let store = Store::new();
        let event = BroadcastEvent::CreateAnnotation { annotation };

        assert_eq!(apply_broadcast(&store, &event), Ok(ApplyOutcome::Applied));
        assert_eq!(
            apply_broadcast(&store, &event),
            Err(IntegrityError::Store(StoreError::DuplicateAnnotation { id: "a1".into() }))
        );
    }

    #[test]
    fn unversioned_target_accepts_first_update_then_ignores_repeat() {
        let store = store_with(Annotation::new("a1", json!({ "x": 0 })));
        let mut target = Target::new("a1", json!({ "x": 1 }));
        target.version = Some(1);
        let event = BroadcastEvent::UpdateTarget { target: target.clone() };

        assert_eq!(apply_broadcast(&store, &event), Ok(ApplyOutcome::Applied));
        assert_eq!(apply_broadcast(&store, &event), Ok(ApplyOutcome::Skipped));
        assert_eq!(store.get_annotation("a1").expect("a1").target, target);
    }

    #[test]
    fn same_version_with_new_value_applies_but_older_does_not() {
        let mut seeded = Annotation::new("a1", json!({}));
        seeded.target.version = Some(3);
        let store = store_with(seeded);

        let mut same = Target::new("a1", json!({ "x": 1 }));
        same.version = Some(3);
        let mut older = Target::new("a1", json!({ "x": 2 }));
        older.version = Some(2);

        let apply = |target: Target| apply_broadcast(&store, &BroadcastEvent::UpdateTarget { target });
        assert_eq!(apply(same), Ok(ApplyOutcome::Applied));
        assert_eq!(apply(older), Ok(ApplyOutcome::Skipped));
        assert_eq!(store.get_annotation("a1").expect("a1").target.selector.as_value()["x"], 1);
    }

    #[test]
    fn body_update_for_unknown_body_adds_it() {
        let store = store_with(Annotation::new("a1", json!({})));
        let body = Body::new("b1", "a1", "hi");

        let event = BroadcastEvent::UpdateBody { body: body.clone() };
        assert_eq!(apply_broadcast(&store, &event), Ok(ApplyOutcome::Applied));
        assert_eq!(store.get_body("b1"), Some(body));
    }

    #[test]
    fn updates_for_unknown_annotations_are_integrity_errors() {
        let store = Store::new();
        let event = BroadcastEvent::UpdateTarget { target: Target::placeholder("ghost") };
        assert!(matches!(
            apply_broadcast(&store, &event),
            Err(IntegrityError::MissingAnnotation { context: "UPDATE_TARGET", .. })
        ));
    }

    #[test]
    fn deletes_of_missing_entities_are_skipped() {
        let store = Store::new();
        let event = BroadcastEvent::DeleteBody { id: "b1".into(), annotation: "a1".into() };
        assert_eq!(apply_broadcast(&store, &event), Ok(ApplyOutcome::Skipped));
        let event = BroadcastEvent::DeleteAnnotation { id: "a1".into() };
        assert_eq!(apply_broadcast(&store, &event), Ok(ApplyOutcome::Skipped));
    }
}
