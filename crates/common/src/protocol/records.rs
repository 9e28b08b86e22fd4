// Backing-store row shapes and their crosswalk to the annotation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Annotation, Body, Selector, Target, User, Visibility};

#[derive(Debug, Error)]
pub enum CrosswalkError {
    #[error("annotation {id} has no target row")]
    MissingTarget { id: String },
    #[error("target of annotation {annotation} has an unparseable selector: {source}")]
    Selector {
        annotation: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode selector of annotation {annotation}: {source}")]
    Encode {
        annotation: String,
        #[source]
        source: serde_json::Error,
    },
}

// ── Rows ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// `created_by` / `updated_by` columns: a bare user id, or the profile row
/// when the query joined it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileRef {
    Id(String),
    Profile(ProfileRecord),
}

impl ProfileRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Profile(profile) => &profile.id,
        }
    }

    pub fn to_user(&self) -> User {
        match self {
            Self::Id(id) => User::signed_in(id.clone()),
            Self::Profile(profile) => User::SignedIn {
                id: profile.id.clone(),
                name: profile.nickname.clone(),
                email: profile.email.clone(),
                avatar: profile.avatar_url.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub annotation_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<ProfileRef>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<ProfileRef>,
    #[serde(default)]
    pub version: Option<i64>,
    /// JSON-encoded selector.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyRecord {
    pub id: String,
    pub annotation_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<ProfileRef>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<ProfileRef>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub value: String,
}

/// An annotation row with its target and body rows nested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub id: String,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub targets: Vec<TargetRecord>,
    #[serde(default)]
    pub bodies: Vec<BodyRecord>,
}

// ── Row → model ────────────────────────────────────────────────────

pub fn parse_target_record(record: &TargetRecord) -> Result<Target, CrosswalkError> {
    let selector: serde_json::Value =
        serde_json::from_str(&record.value).map_err(|source| CrosswalkError::Selector {
            annotation: record.annotation_id.clone(),
            source,
        })?;

    Ok(Target {
        annotation: record.annotation_id.clone(),
        selector: Selector::new(selector),
        creator: record.created_by.as_ref().map(ProfileRef::to_user),
        created: record.created_at,
        updated_by: record.updated_by.as_ref().map(ProfileRef::to_user),
        updated: record.updated_at,
        version: record.version,
    })
}

pub fn parse_body_record(record: &BodyRecord) -> Body {
    Body {
        id: record.id.clone(),
        annotation: record.annotation_id.clone(),
        body_type: None,
        purpose: record.purpose.clone(),
        value: record.value.clone(),
        creator: record.created_by.as_ref().map(ProfileRef::to_user),
        created: record.created_at,
        updated_by: record.updated_by.as_ref().map(ProfileRef::to_user),
        updated: record.updated_at,
        version: record.version,
    }
}

/// Only the first target row is used; an annotation without one is invalid.
pub fn parse_annotation_record(record: &AnnotationRecord) -> Result<Annotation, CrosswalkError> {
    let target = record
        .targets
        .first()
        .ok_or_else(|| CrosswalkError::MissingTarget { id: record.id.clone() })?;

    Ok(Annotation {
        id: record.id.clone(),
        target: parse_target_record(target)?,
        bodies: record.bodies.iter().map(parse_body_record).collect(),
        visibility: record.is_private.unwrap_or(false).then_some(Visibility::Private),
    })
}

// ── Model → row ────────────────────────────────────────────────────

/// Row for a target write. `actor` is recorded as creator and updater
/// when the target itself carries no attribution.
pub fn target_to_record(target: &Target, actor: &User) -> Result<TargetRecord, CrosswalkError> {
    let value = serde_json::to_string(target.selector.as_value()).map_err(|source| {
        CrosswalkError::Encode { annotation: target.annotation.clone(), source }
    })?;

    Ok(TargetRecord {
        annotation_id: target.annotation.clone(),
        created_at: target.created,
        created_by: Some(ProfileRef::Id(
            target.creator.as_ref().unwrap_or(actor).id().to_string(),
        )),
        updated_at: target.updated.or(target.created),
        updated_by: Some(ProfileRef::Id(actor.id().to_string())),
        version: target.version,
        value,
    })
}

pub fn body_to_record(body: &Body, actor: &User) -> BodyRecord {
    BodyRecord {
        id: body.id.clone(),
        annotation_id: body.annotation.clone(),
        created_at: body.created,
        created_by: Some(ProfileRef::Id(body.creator.as_ref().unwrap_or(actor).id().to_string())),
        updated_at: body.updated.or(body.created),
        updated_by: Some(ProfileRef::Id(actor.id().to_string())),
        version: body.version,
        purpose: body.purpose.clone(),
        value: body.value.clone(),
    }
}
