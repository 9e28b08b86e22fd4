// Change notifications emitted by the annotation store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::annotation::{Annotation, Body, Target};

/// Provenance of a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    /// Made by this process (user interaction or API call).
    Local,
    /// Ingested from the network or the backing store.
    Remote,
}

/// Which part of the annotations a change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Whole annotations were created or deleted.
    Annotation,
    Target,
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyUpdate {
    pub old_body: Body,
    pub new_body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetUpdate {
    pub old_target: Target,
    pub new_target: Target,
}

/// Fine-grained classification of a single annotation update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub old_value: Annotation,
    pub new_value: Annotation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bodies_created: Vec<Body>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bodies_deleted: Vec<Body>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bodies_updated: Vec<BodyUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_updated: Option<TargetUpdate>,
}

impl Update {
    pub fn new(old_value: Annotation, new_value: Annotation) -> Self {
        Self {
            old_value,
            new_value,
            bodies_created: Vec::new(),
            bodies_deleted: Vec::new(),
            bodies_updated: Vec::new(),
            target_updated: None,
        }
    }

    pub fn annotation_id(&self) -> &str {
        &self.old_value.id
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub created: Vec<Annotation>,
    #[serde(default)]
    pub deleted: Vec<Annotation>,
    #[serde(default)]
    pub updated: Vec<Update>,
}

impl ChangeSet {
    pub fn created(annotations: Vec<Annotation>) -> Self {
        Self { created: annotations, ..Self::default() }
    }

    pub fn deleted(annotations: Vec<Annotation>) -> Self {
        Self { deleted: annotations, ..Self::default() }
    }

    pub fn updated(updates: Vec<Update>) -> Self {
        Self { updated: updates, ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Ids of every annotation touched by this change set.
    pub fn affected_ids(&self) -> BTreeSet<&str> {
        self.created
            .iter()
            .map(|a| a.id.as_str())
            .chain(self.deleted.iter().map(|a| a.id.as_str()))
            .chain(self.updated.iter().map(Update::annotation_id))
            .collect()
    }
}

/// One atomic store mutation, delivered to every matching observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub origin: Origin,
    pub affects: ChangeKind,
    pub changes: ChangeSet,
    /// Full store contents at emission time, in insertion order.
    pub state: Vec<Annotation>,
}
