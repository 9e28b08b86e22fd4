use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet for anonymous guest ids.
const GUEST_ID_ALPHABET: &[u8] = b"1234567890abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_";
pub const GUEST_ID_LEN: usize = 20;

/// A person editing annotations: either an anonymous guest or a signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum User {
    Guest {
        id: String,
    },
    #[serde(rename = "AUTHENTICATED")]
    SignedIn {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
}

impl User {
    pub fn guest(id: impl Into<String>) -> Self {
        Self::Guest { id: id.into() }
    }

    pub fn signed_in(id: impl Into<String>) -> Self {
        Self::SignedIn { id: id.into(), name: None, email: None, avatar: None }
    }

    /// A guest with a fresh random id.
    pub fn anonymous_guest() -> Self {
        Self::anonymous_guest_with(&mut rand::thread_rng())
    }

    pub fn anonymous_guest_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let id = (0..GUEST_ID_LEN)
            .map(|_| GUEST_ID_ALPHABET[rng.gen_range(0..GUEST_ID_ALPHABET.len())] as char)
            .collect();
        Self::Guest { id }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Guest { id } | Self::SignedIn { id, .. } => id,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Guest { .. } => None,
            Self::SignedIn { name, .. } => name.as_deref(),
        }
    }

    pub fn avatar(&self) -> Option<&str> {
        match self {
            Self::Guest { .. } => None,
            Self::SignedIn { avatar, .. } => avatar.as_deref(),
        }
    }

    /// Name if known, otherwise the id.
    pub fn display_name(&self) -> &str {
        self.name().unwrap_or_else(|| self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn anonymous_guest_has_twenty_char_id_from_alphabet() {
        let guest = User::anonymous_guest();
        assert!(guest.is_guest());
        assert_eq!(guest.id().len(), GUEST_ID_LEN);
        assert!(guest.id().bytes().all(|b| GUEST_ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn seeded_guests_are_reproducible() {
        let a = User::anonymous_guest_with(&mut StdRng::seed_from_u64(7));
        let b = User::anonymous_guest_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn wire_tags_match_user_type() {
        let guest = serde_json::to_value(User::guest("g1")).expect("serialize guest");
        assert_eq!(guest["type"], "GUEST");

        let user = User::SignedIn {
            id: "u1".into(),
            name: Some("Ada".into()),
            email: None,
            avatar: None,
        };
        let value = serde_json::to_value(&user).expect("serialize user");
        assert_eq!(value["type"], "AUTHENTICATED");
        assert_eq!(value["name"], "Ada");
        assert!(value.get("email").is_none());
        assert_eq!(user.display_name(), "Ada");
        assert_eq!(User::signed_in("u2").display_name(), "u2");
    }
}
