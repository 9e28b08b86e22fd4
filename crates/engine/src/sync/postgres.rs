// PostgreSQL backing store.
//
// Versions are minted by the UPDATE itself (`version = version + 1`), so the
// row order in the database is the commit order peers converge on. Row
// changes reach the change feed through a trigger that calls `pg_notify`
// with the row key only; the listener reads the current row back before
// handing the change on.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marginalia_common::model::{Annotation, Body, Target, User};
use marginalia_common::protocol::cdc::{CdcEventType, CdcMessage, KeyRow, Table};
use marginalia_common::protocol::records::{body_to_record, target_to_record, AnnotationRecord, ProfileRef};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions};
use serde::Deserialize;
use sqlx::types::Json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::backing::{BackingStore, BackingStoreError, ChangeFeed};

pub static MIGRATOR: Migrator = sqlx::migrate!("./src/sync/migrations");

/// Notification channel the migration's trigger publishes to.
pub const NOTIFY_CHANNEL: &str = "marginalia_changes";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

const FETCH_ALL_SQL: &str = r#"
SELECT json_build_object(
    'id', a.id,
    'is_private', a.is_private,
    'targets', COALESCE((
        SELECT json_agg(json_build_object(
            'annotation_id', t.annotation_id,
            'created_at', t.created_at,
            'created_by', CASE WHEN cp.id IS NULL THEN to_json(t.created_by) ELSE to_json(cp) END,
            'updated_at', t.updated_at,
            'updated_by', CASE WHEN up.id IS NULL THEN to_json(t.updated_by) ELSE to_json(up) END,
            'version', t.version,
            'value', t.value
        ))
        FROM targets t
        LEFT JOIN profiles cp ON cp.id = t.created_by
        LEFT JOIN profiles up ON up.id = t.updated_by
        WHERE t.annotation_id = a.id
    ), '[]'::json),
    'bodies', COALESCE((
        SELECT json_agg(json_build_object(
            'id', b.id,
            'annotation_id', b.annotation_id,
            'created_at', b.created_at,
            'created_by', CASE WHEN cp.id IS NULL THEN to_json(b.created_by) ELSE to_json(cp) END,
            'updated_at', b.updated_at,
            'updated_by', CASE WHEN up.id IS NULL THEN to_json(b.updated_by) ELSE to_json(up) END,
            'version', b.version,
            'purpose', b.purpose,
            'value', b.value
        ) ORDER BY b.created_at, b.id)
        FROM bodies b
        LEFT JOIN profiles cp ON cp.id = b.created_by
        LEFT JOIN profiles up ON up.id = b.updated_by
        WHERE b.annotation_id = a.id
    ), '[]'::json)
)
FROM annotations a
ORDER BY a.created_at, a.id
"#;

const ANNOTATION_ROW_SQL: &str = r#"
SELECT json_build_object('id', a.id, 'is_private', a.is_private)
FROM annotations a
WHERE a.id = $1
"#;

const TARGET_ROW_SQL: &str = r#"
SELECT json_build_object(
    'annotation_id', t.annotation_id,
    'created_at', t.created_at,
    'created_by', CASE WHEN cp.id IS NULL THEN to_json(t.created_by) ELSE to_json(cp) END,
    'updated_at', t.updated_at,
    'updated_by', CASE WHEN up.id IS NULL THEN to_json(t.updated_by) ELSE to_json(up) END,
    'version', t.version,
    'value', t.value
)
FROM targets t
LEFT JOIN profiles cp ON cp.id = t.created_by
LEFT JOIN profiles up ON up.id = t.updated_by
WHERE t.annotation_id = $1
"#;

const BODY_ROW_SQL: &str = r#"
SELECT json_build_object(
    'id', b.id,
    'annotation_id', b.annotation_id,
    'created_at', b.created_at,
    'created_by', CASE WHEN cp.id IS NULL THEN to_json(b.created_by) ELSE to_json(cp) END,
    'updated_at', b.updated_at,
    'updated_by', CASE WHEN up.id IS NULL THEN to_json(b.updated_by) ELSE to_json(up) END,
    'version', b.version,
    'purpose', b.purpose,
    'value', b.value
)
FROM bodies b
LEFT JOIN profiles cp ON cp.id = b.created_by
LEFT JOIN profiles up ON up.id = b.updated_by
WHERE b.id = $1
"#;

// ── Notifications ──────────────────────────────────────────────────

/// Key-only payload published by the notify trigger.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RowNotification {
    table: Table,
    #[serde(rename = "eventType")]
    event_type: CdcEventType,
    key: KeyRow,
    #[serde(default)]
    commit_timestamp: Option<DateTime<Utc>>,
}

impl RowNotification {
    fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    fn message(&self) -> CdcMessage {
        CdcMessage { commit_timestamp: self.commit_timestamp, ..CdcMessage::new(self.table, self.event_type) }
    }

    /// Deletions are complete as published: the key is all `old` carries.
    fn deletion(&self) -> Option<CdcMessage> {
        matches!(self.event_type, CdcEventType::Delete).then(|| self.message().with_old(&self.key))
    }

    /// Query and bind value that read the row back.
    fn row_query(&self) -> Option<(&'static str, &str)> {
        match self.table {
            Table::Annotations => Some((ANNOTATION_ROW_SQL, self.key.id.as_deref()?)),
            Table::Targets => Some((TARGET_ROW_SQL, self.key.annotation_id.as_deref()?)),
            Table::Bodies => Some((BODY_ROW_SQL, self.key.id.as_deref()?)),
        }
    }
}

/// Full change message for a notification. `None` when the row was deleted
/// again before it could be read; its DELETE notification follows.
async fn resolve(pool: &PgPool, note: &RowNotification) -> Result<Option<CdcMessage>, BackingStoreError> {
    if let Some(message) = note.deletion() {
        return Ok(Some(message));
    }
    let (sql, key) = note
        .row_query()
        .ok_or_else(|| BackingStoreError::Decode(format!("{:?} notification without a row key", note.table)))?;

    let row = sqlx::query_scalar::<_, Json<serde_json::Value>>(sql)
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(classify)?;
    Ok(row.map(|Json(row)| CdcMessage { new: Some(row), ..note.message() }))
}

pub struct PgBackingStore {
    pool: PgPool,
}

impl PgBackingStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        let connect_options = database_url
            .parse::<PgConnectOptions>()
            .context("failed to parse PostgreSQL connection options")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(connect_options)
            .await
            .context("failed to connect to PostgreSQL")?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.context("failed to apply annotation schema migrations")
    }
}

fn profile_id(profile: Option<&ProfileRef>) -> Option<&str> {
    profile.map(ProfileRef::id)
}

/// Splits driver errors into retryable availability problems and
/// everything else.
pub(crate) fn classify(err: sqlx::Error) -> BackingStoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackingStoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(_) | sqlx::Error::RowNotFound => {
            BackingStoreError::Rejected(err.to_string())
        }
        other => BackingStoreError::Decode(other.to_string()),
    }
}

impl BackingStore for PgBackingStore {
    async fn fetch_all(&self) -> Result<Vec<AnnotationRecord>, BackingStoreError> {
        let rows = sqlx::query_scalar::<_, Json<AnnotationRecord>>(FETCH_ALL_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(|Json(record)| record).collect())
    }

    async fn subscribe_changes(&self) -> Result<ChangeFeed, BackingStoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(classify)?;
        listener.listen(NOTIFY_CHANNEL).await.map_err(classify)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = tx.closed() => break,
                    notification = listener.recv() => match notification {
                        Ok(notification) => notification,
                        Err(err) => {
                            warn!(error = %err, "change feed listener failed");
                            break;
                        }
                    },
                };

                let note = match RowNotification::parse(notification.payload()) {
                    Ok(note) => note,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed change notification");
                        continue;
                    }
                };
                match resolve(&pool, &note).await {
                    Ok(Some(message)) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!(table = ?note.table, key = ?note.key, "changed row already gone"),
                    Err(err) => warn!(table = ?note.table, key = ?note.key, error = %err, "could not read changed row"),
                }
            }
            debug!("change feed listener stopped");
        });

        Ok(rx)
    }

    async fn create_annotation(&self, annotation: &Annotation, actor: &User) -> Result<(), BackingStoreError> {
        let creator = annotation.target.creator.as_ref().unwrap_or(actor);
        sqlx::query("INSERT INTO annotations (id, created_at, created_by, is_private) VALUES ($1, COALESCE($2, now()), $3, $4)")
            .bind(&annotation.id)
            .bind(annotation.target.created)
            .bind(creator.id())
            .bind(annotation.is_private())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_target(&self, target: &Target, actor: &User) -> Result<(), BackingStoreError> {
        let record = target_to_record(target, actor).map_err(|e| BackingStoreError::Rejected(e.to_string()))?;
        sqlx::query(
            r#"
INSERT INTO targets (annotation_id, created_at, created_by, updated_at, updated_by, version, value)
VALUES ($1, COALESCE($2, now()), $3, COALESCE($4, now()), $5, 1, $6)
            "#,
        )
        .bind(&record.annotation_id)
        .bind(record.created_at)
        .bind(profile_id(record.created_by.as_ref()))
        .bind(record.updated_at)
        .bind(profile_id(record.updated_by.as_ref()))
        .bind(&record.value)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn update_target(&self, target: &Target, actor: &User) -> Result<(), BackingStoreError> {
        let record = target_to_record(target, actor).map_err(|e| BackingStoreError::Rejected(e.to_string()))?;
        let result = sqlx::query(
            r#"
UPDATE targets
SET value = $2, updated_at = now(), updated_by = $3, version = version + 1
WHERE annotation_id = $1
            "#,
        )
        .bind(&record.annotation_id)
        .bind(&record.value)
        .bind(actor.id())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(BackingStoreError::Rejected(format!("no target row for {}", target.annotation)));
        }
        Ok(())
    }

    async fn upsert_bodies(&self, bodies: &[Body], actor: &User) -> Result<(), BackingStoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for body in bodies {
            let record = body_to_record(body, actor);
            sqlx::query(
                r#"
INSERT INTO bodies (id, annotation_id, created_at, created_by, updated_at, updated_by, version, purpose, value)
VALUES ($1, $2, COALESCE($3, now()), $4, COALESCE($5, now()), $6, 1, $7, $8)
ON CONFLICT (id) DO UPDATE
SET purpose = EXCLUDED.purpose,
    value = EXCLUDED.value,
    updated_at = now(),
    updated_by = EXCLUDED.updated_by,
    version = bodies.version + 1
                "#,
            )
            .bind(&record.id)
            .bind(&record.annotation_id)
            .bind(record.created_at)
            .bind(profile_id(record.created_by.as_ref()))
            .bind(record.updated_at)
            .bind(profile_id(record.updated_by.as_ref()))
            .bind(&record.purpose)
            .bind(&record.value)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)
    }

    async fn delete_bodies(&self, ids: &[String]) -> Result<(), BackingStoreError> {
        sqlx::query("DELETE FROM bodies WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_annotation(&self, id: &str) -> Result<(), BackingStoreError> {
        sqlx::query("DELETE FROM annotations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
