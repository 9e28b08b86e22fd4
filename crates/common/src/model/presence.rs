use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::user::User;

/// A peer currently connected to the collaboration channel.
///
/// `presence_key` identifies the connection, not the person: the same user
/// in two tabs shows up as two present users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentUser {
    pub presence_key: String,
    pub user: User,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<String>>,
    pub last_active: DateTime<Utc>,
}

impl PresentUser {
    pub fn new(presence_key: impl Into<String>, user: User, color: impl Into<String>) -> Self {
        Self {
            presence_key: presence_key.into(),
            user,
            color: color.into(),
            selection: None,
            last_active: Utc::now(),
        }
    }

    /// Display label: the user's name, falling back to the id.
    pub fn label(&self) -> &str {
        self.user.display_name()
    }

    pub fn has_selection(&self) -> bool {
        self.selection.as_ref().is_some_and(|ids| !ids.is_empty())
    }
}
