// Row-level change notifications from the backing store.
//
// Wire shape:
//   { "table": "targets", "eventType": "UPDATE", "new": {..row..}, "old": { "id": .. },
//     "commit_timestamp": "..." }
//
// `RowChange` is the typed form the sync engine reconciles against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::records::{BodyRecord, TargetRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Annotations,
    Targets,
    Bodies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CdcEventType {
    Insert,
    Update,
    Delete,
}

/// A raw change notification as delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcMessage {
    pub table: Table,
    #[serde(rename = "eventType")]
    pub event_type: CdcEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum CdcDecodeError {
    #[error("{event:?} on {table:?} is missing its `{field}` row")]
    MissingRow { table: Table, event: CdcEventType, field: &'static str },
    #[error("malformed {table:?} row: {source}")]
    Row {
        table: Table,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRow {
    pub id: String,
    #[serde(default)]
    pub is_private: Option<bool>,
}

/// Identifying columns carried in `old` for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub annotation_id: Option<String>,
}

/// Typed change, one variant per (table, event) pair the engine handles.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    InsertAnnotation(AnnotationRow),
    UpdateAnnotation(AnnotationRow),
    DeleteAnnotation { id: String },
    InsertTarget(TargetRecord),
    UpdateTarget(TargetRecord),
    DeleteTarget { annotation_id: Option<String> },
    InsertBody(BodyRecord),
    UpdateBody(BodyRecord),
    DeleteBody { id: String },
}

impl CdcMessage {
    pub fn new(table: Table, event_type: CdcEventType) -> Self {
        Self { table, event_type, new: None, old: None, commit_timestamp: None }
    }

    pub fn with_new<T: Serialize>(mut self, row: &T) -> Self {
        self.new = serde_json::to_value(row).ok();
        self
    }

    pub fn with_old<T: Serialize>(mut self, row: &T) -> Self {
        self.old = serde_json::to_value(row).ok();
        self
    }

    pub fn decode(&self) -> Result<RowChange, CdcDecodeError> {
        use CdcEventType::*;

        match (self.table, self.event_type) {
            (Table::Annotations, Insert) => Ok(RowChange::InsertAnnotation(self.new_row()?)),
            (Table::Annotations, Update) => Ok(RowChange::UpdateAnnotation(self.new_row()?)),
            (Table::Annotations, Delete) => {
                let key: KeyRow = self.old_row()?;
                let id = key.id.ok_or(CdcDecodeError::MissingRow {
                    table: self.table,
                    event: self.event_type,
                    field: "old.id",
                })?;
                Ok(RowChange::DeleteAnnotation { id })
            }
            (Table::Targets, Insert) => Ok(RowChange::InsertTarget(self.new_row()?)),
            (Table::Targets, Update) => Ok(RowChange::UpdateTarget(self.new_row()?)),
            (Table::Targets, Delete) => {
                let key: KeyRow = self.old_row()?;
                Ok(RowChange::DeleteTarget { annotation_id: key.annotation_id })
            }
            (Table::Bodies, Insert) => Ok(RowChange::InsertBody(self.new_row()?)),
            (Table::Bodies, Update) => Ok(RowChange::UpdateBody(self.new_row()?)),
            (Table::Bodies, Delete) => {
                let key: KeyRow = self.old_row()?;
                let id = key.id.ok_or(CdcDecodeError::MissingRow {
                    table: self.table,
                    event: self.event_type,
                    field: "old.id",
                })?;
                Ok(RowChange::DeleteBody { id })
            }
        }
    }

    fn new_row<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CdcDecodeError> {
        self.row(self.new.as_ref(), "new")
    }

    fn old_row<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CdcDecodeError> {
        self.row(self.old.as_ref(), "old")
    }

    fn row<T: for<'de> Deserialize<'de>>(
        &self,
        value: Option<&serde_json::Value>,
        field: &'static str,
    ) -> Result<T, CdcDecodeError> {
        let value = value.ok_or(CdcDecodeError::MissingRow {
            table: self.table,
            event: self.event_type,
            field,
        })?;
        T::deserialize(value).map_err(|source| CdcDecodeError::Row { table: self.table, source })
    }
}
