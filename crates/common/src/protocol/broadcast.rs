// Peer broadcast messages for the realtime channel.
//
// A message carries the sender's identity plus an ordered batch of change
// events marshalled from one or more local store changes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{Annotation, Body, Target};

/// Who sent a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub presence_key: String,
    pub user_id: String,
}

impl Sender {
    pub fn new(presence_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { presence_key: presence_key.into(), user_id: user_id.into() }
    }
}

/// One change event on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastEvent {
    CreateAnnotation { annotation: Annotation },
    DeleteAnnotation { id: String },
    CreateBody { body: Body },
    DeleteBody { id: String, annotation: String },
    UpdateBody { body: Body },
    UpdateTarget { target: Target },
}

impl BroadcastEvent {
    /// Id of the annotation this event touches.
    pub fn annotation_id(&self) -> &str {
        match self {
            Self::CreateAnnotation { annotation } => &annotation.id,
            Self::DeleteAnnotation { id } => id,
            Self::CreateBody { body } | Self::UpdateBody { body } => &body.annotation,
            Self::DeleteBody { annotation, .. } => annotation,
            Self::UpdateTarget { target } => &target.annotation,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateAnnotation { .. } => "CREATE_ANNOTATION",
            Self::DeleteAnnotation { .. } => "DELETE_ANNOTATION",
            Self::CreateBody { .. } => "CREATE_BODY",
            Self::DeleteBody { .. } => "DELETE_BODY",
            Self::UpdateBody { .. } => "UPDATE_BODY",
            Self::UpdateTarget { .. } => "UPDATE_TARGET",
        }
    }
}

/// Unique ids of the annotations a peer was working on, excluding deletions.
///
/// Deleting an annotation ends the peer's interaction with it, so deletions
/// never count as activity.
pub fn affected_annotations(events: &[BroadcastEvent]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    events
        .iter()
        .filter(|event| !matches!(event, BroadcastEvent::DeleteAnnotation { .. }))
        .map(BroadcastEvent::annotation_id)
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// A batch of change events from one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub from: Sender,
    pub events: Vec<BroadcastEvent>,
}
