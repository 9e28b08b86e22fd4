// In-process backing store.
//
// Behaves like the PostgreSQL schema: one target row per annotation, bodies
// keyed by id, versions minted on every committed write, foreign keys with
// cascading deletes, and a change notification for every row touched.
// Failures can be scripted for the next fetch or write.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use marginalia_common::model::{Annotation, Body, Target, User, Visibility};
use marginalia_common::protocol::cdc::{AnnotationRow, CdcEventType, CdcMessage, KeyRow, Table};
use marginalia_common::protocol::records::{
    body_to_record, target_to_record, AnnotationRecord, BodyRecord, ProfileRef, TargetRecord,
};
use tokio::sync::mpsc;

use super::backing::{BackingStore, BackingStoreError, ChangeFeed};

#[derive(Default)]
struct Tables {
    annotations: Vec<AnnotationRow>,
    targets: HashMap<String, TargetRecord>,
    bodies: Vec<BodyRecord>,
    subscribers: Vec<mpsc::UnboundedSender<CdcMessage>>,
    faults: VecDeque<BackingStoreError>,
    writes: usize,
}

impl Tables {
    fn publish(&mut self, message: CdcMessage) {
        let message = CdcMessage { commit_timestamp: Some(Utc::now()), ..message };
        self.subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn take_fault(&mut self) -> Result<(), BackingStoreError> {
        match self.faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn has_annotation(&self, id: &str) -> bool {
        self.annotations.iter().any(|row| row.id == id)
    }
}

#[derive(Default)]
pub struct InMemoryBackingStore {
    tables: Mutex<Tables>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next fetch or write fails with `error`.
    pub fn fail_next(&self, error: BackingStoreError) {
        self.fail_next_n(error, 1);
    }

    pub fn fail_next_n(&self, error: BackingStoreError, times: usize) {
        let mut tables = self.lock();
        tables.faults.extend(std::iter::repeat(error).take(times));
    }

    /// Committed writes so far (failed attempts excluded).
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn annotation_ids(&self) -> Vec<String> {
        self.lock().annotations.iter().map(|row| row.id.clone()).collect()
    }

    pub fn target(&self, annotation_id: &str) -> Option<TargetRecord> {
        self.lock().targets.get(annotation_id).cloned()
    }

    pub fn body(&self, id: &str) -> Option<BodyRecord> {
        self.lock().bodies.iter().find(|row| row.id == id).cloned()
    }

    pub fn bodies_of(&self, annotation_id: &str) -> Vec<BodyRecord> {
        self.lock().bodies.iter().filter(|row| row.annotation_id == annotation_id).cloned().collect()
    }

    /// Out-of-band write by another client: bumps the target version and
    /// publishes the change.
    pub fn external_target_update(&self, record: TargetRecord) {
        let mut tables = self.lock();
        let version = tables.targets.get(&record.annotation_id).and_then(|t| t.version).unwrap_or(0) + 1;
        let row = TargetRecord { version: Some(version), ..record };
        tables.targets.insert(row.annotation_id.clone(), row.clone());
        tables.writes += 1;
        tables.publish(CdcMessage::new(Table::Targets, CdcEventType::Update).with_new(&row));
    }
}

impl BackingStore for InMemoryBackingStore {
    async fn fetch_all(&self) -> Result<Vec<AnnotationRecord>, BackingStoreError> {
        let mut tables = self.lock();
        tables.take_fault()?;

        Ok(tables
            .annotations
            .iter()
            .map(|row| AnnotationRecord {
                id: row.id.clone(),
                is_private: row.is_private,
                targets: tables.targets.get(&row.id).cloned().into_iter().collect(),
                bodies: tables.bodies.iter().filter(|b| b.annotation_id == row.id).cloned().collect(),
            })
            .collect())
    }

    async fn subscribe_changes(&self) -> Result<ChangeFeed, BackingStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        Ok(rx)
    }

    async fn create_annotation(&self, annotation: &Annotation, _actor: &User) -> Result<(), BackingStoreError> {
        let mut tables = self.lock();
        tables.take_fault()?;
        if tables.has_annotation(&annotation.id) {
            return Err(BackingStoreError::Rejected(format!(
                "duplicate key: annotation {}",
                annotation.id
            )));
        }

        let row = AnnotationRow {
            id: annotation.id.clone(),
            is_private: Some(matches!(annotation.visibility, Some(Visibility::Private))),
        };
        tables.annotations.push(row.clone());
        tables.writes += 1;
        tables.publish(CdcMessage::new(Table::Annotations, CdcEventType::Insert).with_new(&row));
        Ok(())
    }

    async fn create_target(&self, target: &Target, actor: &User) -> Result<(), BackingStoreError> {
        let mut record =
            target_to_record(target, actor).map_err(|e| BackingStoreError::Rejected(e.to_string()))?;

        let mut tables = self.lock();
        tables.take_fault()?;
        if !tables.has_annotation(&target.annotation) {
            return Err(BackingStoreError::Rejected(format!(
                "foreign key: annotation {} does not exist",
                target.annotation
            )));
        }
        if tables.targets.contains_key(&target.annotation) {
            return Err(BackingStoreError::Rejected(format!(
                "duplicate key: target of {}",
                target.annotation
            )));
        }

        let now = Utc::now();
        record.version = Some(1);
        record.created_at = record.created_at.or(Some(now));
        record.updated_at = record.updated_at.or(Some(now));
        tables.targets.insert(record.annotation_id.clone(), record.clone());
        tables.writes += 1;
        tables.publish(CdcMessage::new(Table::Targets, CdcEventType::Insert).with_new(&record));
        Ok(())
    }

    async fn update_target(&self, target: &Target, actor: &User) -> Result<(), BackingStoreError> {
        let incoming =
            target_to_record(target, actor).map_err(|e| BackingStoreError::Rejected(e.to_string()))?;

        let mut tables = self.lock();
        tables.take_fault()?;
        let Some(existing) = tables.targets.get(&target.annotation).cloned() else {
            return Err(BackingStoreError::Rejected(format!("no target row for {}", target.annotation)));
        };

        let record = TargetRecord {
            value: incoming.value,
            updated_at: Some(Utc::now()),
            updated_by: Some(ProfileRef::Id(actor.id().to_string())),
            version: Some(existing.version.unwrap_or(0) + 1),
            ..existing
        };
        tables.targets.insert(record.annotation_id.clone(), record.clone());
        tables.writes += 1;
        tables.publish(CdcMessage::new(Table::Targets, CdcEventType::Update).with_new(&record));
        Ok(())
    }

    async fn upsert_bodies(&self, bodies: &[Body], actor: &User) -> Result<(), BackingStoreError> {
        let mut tables = self.lock();
        tables.take_fault()?;
        if let Some(orphan) = bodies.iter().find(|b| !tables.has_annotation(&b.annotation)) {
            return Err(BackingStoreError::Rejected(format!(
                "foreign key: annotation {} does not exist",
                orphan.annotation
            )));
        }

        let now = Utc::now();
        for body in bodies {
            let incoming = body_to_record(body, actor);
            let position = tables.bodies.iter().position(|row| row.id == body.id);
            let (event_type, record) = match position {
                Some(index) => {
                    let existing = tables.bodies[index].clone();
                    let record = BodyRecord {
                        purpose: incoming.purpose,
                        value: incoming.value,
                        updated_at: Some(now),
                        updated_by: incoming.updated_by,
                        version: Some(existing.version.unwrap_or(0) + 1),
                        ..existing
                    };
                    tables.bodies[index] = record.clone();
                    (CdcEventType::Update, record)
                }
                None => {
                    let record = BodyRecord {
                        created_at: incoming.created_at.or(Some(now)),
                        updated_at: incoming.updated_at.or(Some(now)),
                        version: Some(1),
                        ..incoming
                    };
                    tables.bodies.push(record.clone());
                    (CdcEventType::Insert, record)
                }
            };
            tables.writes += 1;
            tables.publish(CdcMessage::new(Table::Bodies, event_type).with_new(&record));
        }
        Ok(())
    }

    async fn delete_bodies(&self, ids: &[String]) -> Result<(), BackingStoreError> {
        let mut tables = self.lock();
        tables.take_fault()?;

        for id in ids {
            let before = tables.bodies.len();
            tables.bodies.retain(|row| &row.id != id);
            if tables.bodies.len() != before {
                tables.writes += 1;
                let key = KeyRow { id: Some(id.clone()), annotation_id: None };
                tables.publish(CdcMessage::new(Table::Bodies, CdcEventType::Delete).with_old(&key));
            }
        }
        Ok(())
    }

    async fn delete_annotation(&self, id: &str) -> Result<(), BackingStoreError> {
        let mut tables = self.lock();
        tables.take_fault()?;
        if !tables.has_annotation(id) {
            return Ok(());
        }

        let (removed, kept): (Vec<BodyRecord>, Vec<BodyRecord>) =
            std::mem::take(&mut tables.bodies).into_iter().partition(|row| row.annotation_id == id);
        tables.bodies = kept;
        for body in removed {
            let key = KeyRow { id: Some(body.id), annotation_id: Some(id.to_string()) };
            tables.publish(CdcMessage::new(Table::Bodies, CdcEventType::Delete).with_old(&key));
        }
        if tables.targets.remove(id).is_some() {
            let key = KeyRow { id: None, annotation_id: Some(id.to_string()) };
            tables.publish(CdcMessage::new(Table::Targets, CdcEventType::Delete).with_old(&key));
        }
        tables.annotations.retain(|row| row.id != id);
        tables.writes += 1;
        let key = KeyRow { id: Some(id.to_string()), annotation_id: None };
        tables.publish(CdcMessage::new(Table::Annotations, CdcEventType::Delete).with_old(&key));
        Ok(())
    }
}
