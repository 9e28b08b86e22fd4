// Backing-store change notifications -> store (origin REMOTE).
//
// The backing store is the commit-order authority. A target or body row
// replaces the local value only when its version is strictly newer, so the
// echo of a write this peer already applied optimistically is dropped.

use marginalia_common::model::{Annotation, Body, Origin, Target};
use marginalia_common::protocol::cdc::{CdcMessage, RowChange};
use marginalia_common::protocol::records::{parse_body_record, parse_target_record};
use tracing::debug;

use super::error::IntegrityError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcOutcome {
    Applied,
    /// Not newer than the local value.
    Stale,
    /// Nothing in the store corresponds to this row change.
    Ignored,
}

pub fn reconcile(store: &Store, message: &CdcMessage) -> Result<CdcOutcome, IntegrityError> {
    let change = message.decode().map_err(|e| IntegrityError::Decode(e.to_string()))?;

    match change {
        RowChange::InsertAnnotation(_) | RowChange::UpdateAnnotation(_) | RowChange::DeleteTarget { .. } => {
            Ok(CdcOutcome::Ignored)
        }

        RowChange::DeleteAnnotation { id } => {
            if !store.contains(&id) {
                return Ok(CdcOutcome::Ignored);
            }
            store.delete_annotation(id.as_str(), Origin::Remote);
            Ok(CdcOutcome::Applied)
        }

        RowChange::InsertTarget(record) => {
            let target = parse_target_record(&record).map_err(|e| IntegrityError::Crosswalk(e.to_string()))?;
            if !store.contains(&target.annotation) {
                let annotation = Annotation {
                    id: target.annotation.clone(),
                    target,
                    bodies: Vec::new(),
                    visibility: None,
                };
                store.add_annotation(annotation, Origin::Remote)?;
                return Ok(CdcOutcome::Applied);
            }
            Ok(apply_target(store, target))
        }

        RowChange::UpdateTarget(record) => {
            let target = parse_target_record(&record).map_err(|e| IntegrityError::Crosswalk(e.to_string()))?;
            if !store.contains(&target.annotation) {
                return Err(IntegrityError::MissingAnnotation {
                    annotation: target.annotation,
                    context: "target UPDATE",
                });
            }
            Ok(apply_target(store, target))
        }

        RowChange::InsertBody(record) => {
            let body = parse_body_record(&record);
            if !store.contains(&body.annotation) {
                let skeleton = Annotation::skeleton(body.annotation.clone()).with_body(body);
                store.add_annotation(skeleton, Origin::Remote)?;
                return Ok(CdcOutcome::Applied);
            }
            apply_body(store, body)
        }

        RowChange::UpdateBody(record) => {
            let body = parse_body_record(&record);
            if !store.contains(&body.annotation) {
                return Err(IntegrityError::MissingAnnotation {
                    annotation: body.annotation,
                    context: "body UPDATE",
                });
            }
            apply_body(store, body)
        }

        RowChange::DeleteBody { id } => match store.get_body(&id) {
            Some(body) => {
                store.delete_body(&body.to_ref(), Origin::Remote);
                Ok(CdcOutcome::Applied)
            }
            None => Ok(CdcOutcome::Ignored),
        },
    }
}

fn apply_target(store: &Store, target: Target) -> CdcOutcome {
    let local = store.get_annotation(&target.annotation).map(|a| a.target.version_or_zero()).unwrap_or(0);
    if target.version_or_zero() <= local {
        debug!(annotation = %target.annotation, version = ?target.version, local, "discarding stale target row");
        return CdcOutcome::Stale;
    }
    store.update_target(target, Origin::Remote);
    CdcOutcome::Applied
}

fn apply_body(store: &Store, mut body: Body) -> Result<CdcOutcome, IntegrityError> {
    let Some(local) = store.get_annotation(&body.annotation).and_then(|a| a.body(&body.id).cloned()) else {
        store.add_body(body, Origin::Remote)?;
        return Ok(CdcOutcome::Applied);
    };

    if body.version_or_zero() <= local.version_or_zero() {
        debug!(annotation = %body.annotation, body = %body.id, version = ?body.version, "discarding stale body row");
        return Ok(CdcOutcome::Stale);
    }
    // Rows do not carry the body type.
    if body.body_type.is_none() {
        body.body_type = local.body_type.clone();
    }
    store.update_body(&local.to_ref(), body, Origin::Remote)?;
    Ok(CdcOutcome::Applied)
}
