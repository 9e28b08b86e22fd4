use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::user::User;

// ── Selector ───────────────────────────────────────────────────────

/// Opaque description of the region an annotation points at.
///
/// The core never interprets selectors; shape geometry and media fragments
/// belong to the rendering layer. Equality is structural.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(pub serde_json::Value);

impl Selector {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Selector used for skeleton annotations whose target has not arrived yet.
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Selector {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

// ── Visibility ─────────────────────────────────────────────────────

/// Access label for an annotation. Only `PRIVATE` has built-in meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Visibility {
    Private,
    Other(String),
}

impl From<String> for Visibility {
    fn from(value: String) -> Self {
        if value == "PRIVATE" {
            Self::Private
        } else {
            Self::Other(value)
        }
    }
}

impl From<Visibility> for String {
    fn from(value: Visibility) -> Self {
        match value {
            Visibility::Private => "PRIVATE".to_string(),
            Visibility::Other(label) => label,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => f.write_str("PRIVATE"),
            Self::Other(label) => f.write_str(label),
        }
    }
}

// ── Target ─────────────────────────────────────────────────────────

/// The addressable region of an annotation. Exactly one per annotation,
/// versioned independently of the bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub annotation: String,
    pub selector: Selector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl Target {
    pub fn new(annotation: impl Into<String>, selector: impl Into<Selector>) -> Self {
        Self {
            annotation: annotation.into(),
            selector: selector.into(),
            creator: None,
            created: None,
            updated_by: None,
            updated: None,
            version: None,
        }
    }

    /// Target with an empty selector, used when a change arrives for an
    /// annotation this peer has never seen.
    pub fn placeholder(annotation: impl Into<String>) -> Self {
        Self::new(annotation, Selector::empty())
    }

    /// Version for arbitration; unversioned targets count as version 0.
    pub fn version_or_zero(&self) -> i64 {
        self.version.unwrap_or(0)
    }
}

// ── Body ───────────────────────────────────────────────────────────

/// A piece of content attached to an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    pub id: String,
    pub annotation: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub body_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl Body {
    pub fn new(
        id: impl Into<String>,
        annotation: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            annotation: annotation.into(),
            body_type: None,
            purpose: None,
            value: value.into(),
            creator: None,
            created: None,
            updated_by: None,
            updated: None,
            version: None,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn version_or_zero(&self) -> i64 {
        self.version.unwrap_or(0)
    }

    pub fn to_ref(&self) -> BodyRef {
        BodyRef { id: self.id.clone(), annotation: self.annotation.clone() }
    }
}

/// Minimal reference to a body: enough to locate it in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyRef {
    pub id: String,
    pub annotation: String,
}

impl BodyRef {
    pub fn new(id: impl Into<String>, annotation: impl Into<String>) -> Self {
        Self { id: id.into(), annotation: annotation.into() }
    }
}

impl From<&Body> for BodyRef {
    fn from(body: &Body) -> Self {
        body.to_ref()
    }
}

// ── Annotation ─────────────────────────────────────────────────────

/// A target region plus zero or more interpretive bodies.
///
/// Invariant: every `bodies[i].annotation == id` and `target.annotation == id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub target: Target,
    #[serde(default)]
    pub bodies: Vec<Body>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

impl Annotation {
    pub fn new(id: impl Into<String>, selector: impl Into<Selector>) -> Self {
        let id = id.into();
        Self { target: Target::new(id.clone(), selector), id, bodies: Vec::new(), visibility: None }
    }

    /// Empty annotation with a placeholder target and no bodies.
    pub fn skeleton(id: impl Into<String>) -> Self {
        let id = id.into();
        Self { target: Target::placeholder(id.clone()), id, bodies: Vec::new(), visibility: None }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.bodies.push(body);
        self
    }

    pub fn body(&self, id: &str) -> Option<&Body> {
        self.bodies.iter().find(|body| body.id == id)
    }

    pub fn has_body(&self, id: &str) -> bool {
        self.body(id).is_some()
    }

    pub fn is_private(&self) -> bool {
        matches!(self.visibility, Some(Visibility::Private))
    }

    /// Copy of this annotation with all bodies removed.
    pub fn without_bodies(&self) -> Self {
        Self {
            id: self.id.clone(),
            target: self.target.clone(),
            bodies: Vec::new(),
            visibility: self.visibility.clone(),
        }
    }
}

/// Anything that identifies an annotation: an id or the annotation itself.
pub trait AnnotationKey {
    fn annotation_id(&self) -> &str;
}

impl AnnotationKey for str {
    fn annotation_id(&self) -> &str {
        self
    }
}

impl AnnotationKey for String {
    fn annotation_id(&self) -> &str {
        self.as_str()
    }
}

impl AnnotationKey for Annotation {
    fn annotation_id(&self) -> &str {
        &self.id
    }
}

impl<K: AnnotationKey + ?Sized> AnnotationKey for &K {
    fn annotation_id(&self) -> &str {
        (**self).annotation_id()
    }
}
