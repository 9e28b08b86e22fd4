// Durable backing store abstraction.
//
// The store mints a per-row version on every committed write and publishes
// row-level change notifications. Implementations: `InMemoryBackingStore`
// for tests and embedding, `PgBackingStore` for PostgreSQL.

use std::future::Future;

use marginalia_common::model::{Annotation, Body, Target, User};
use marginalia_common::protocol::cdc::CdcMessage;
use marginalia_common::protocol::records::AnnotationRecord;
use thiserror::Error;
use tokio::sync::mpsc;

/// Stream of change notifications. Messages published after
/// `subscribe_changes` returns are buffered until read.
pub type ChangeFeed = mpsc::UnboundedReceiver<CdcMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackingStoreError {
    /// Network or availability problem; worth retrying.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the write (constraint violation, missing row).
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("malformed data from backing store: {0}")]
    Decode(String),
}

impl BackingStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Operations the sync engine needs from durable storage.
///
/// All methods return `Send` futures so the writer can run on a
/// multi-threaded tokio runtime.
pub trait BackingStore: Send + Sync + 'static {
    /// Every annotation with its target and bodies.
    fn fetch_all(&self) -> impl Future<Output = Result<Vec<AnnotationRecord>, BackingStoreError>> + Send;

    /// Start receiving change notifications.
    fn subscribe_changes(&self) -> impl Future<Output = Result<ChangeFeed, BackingStoreError>> + Send;

    /// Inserts the annotation row only; target and bodies are separate writes.
    fn create_annotation(
        &self,
        annotation: &Annotation,
        actor: &User,
    ) -> impl Future<Output = Result<(), BackingStoreError>> + Send;

    fn create_target(
        &self,
        target: &Target,
        actor: &User,
    ) -> impl Future<Output = Result<(), BackingStoreError>> + Send;

    /// Overwrites the selector; the store increments the version.
    fn update_target(
        &self,
        target: &Target,
        actor: &User,
    ) -> impl Future<Output = Result<(), BackingStoreError>> + Send;

    /// Inserts new bodies at version 1 and increments the version of existing ones.
    fn upsert_bodies(
        &self,
        bodies: &[Body],
        actor: &User,
    ) -> impl Future<Output = Result<(), BackingStoreError>> + Send;

    fn delete_bodies(&self, ids: &[String]) -> impl Future<Output = Result<(), BackingStoreError>> + Send;

    /// Removes the annotation together with its target and bodies.
    fn delete_annotation(&self, id: &str) -> impl Future<Output = Result<(), BackingStoreError>> + Send;
}
