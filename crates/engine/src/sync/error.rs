// Error types surfaced by the sync engine.

use thiserror::Error;

use super::backing::BackingStoreError;
use super::channel::ChannelError;
use super::sender::WriteOp;
use crate::store::StoreError;

/// Inbound data that cannot be reconciled with the store. Reported through
/// `SyncEvent::IntegrityError`; the receive loops keep running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("{context} references annotation {annotation}, which is not in the store")]
    MissingAnnotation { annotation: String, context: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("undecodable change notification: {0}")]
    Decode(String),
    #[error("row could not be converted: {0}")]
    Crosswalk(String),
}

/// A write that could not be persisted. The optimistic local state is kept.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} failed after {attempts} attempt(s): {error}", .op.label())]
pub struct SaveError {
    pub op: WriteOp,
    pub error: BackingStoreError,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not join the realtime channel: {0}")]
    Connection(#[from] ChannelError),
    #[error("could not subscribe to the change feed: {0}")]
    ChangeFeed(#[source] BackingStoreError),
    #[error("initial load failed: {0}")]
    InitialLoad(#[source] BackingStoreError),
    #[error("engine is already connected")]
    AlreadyConnected,
    #[error("engine has been shut down")]
    ShutDown,
}
