//! Domain Types
//!
//! Shapes owned by the hosted backend: users, sessions and bookmark rows.
//! The application only reads users and sessions; bookmarks are created and
//! destroyed through the row store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optional profile fields supplied by the identity provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A signed-in user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            user_metadata: UserMetadata::default(),
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn full_name(mut self, name: impl Into<String>) -> Self {
        self.user_metadata.full_name = Some(name.into());
        self
    }

    /// Name shown in the dashboard header: full name, then email, then id
    pub fn display_name(&self) -> &str {
        self.user_metadata
            .full_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Token-backed proof of authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub refresh_token: String,
    /// Absolute expiry, seconds since the Unix epoch
    #[serde(default)]
    pub expires_at: i64,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// True when the access token expires within `margin_secs` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        self.expires_at <= now.timestamp() + margin_secs
    }
}

/// A saved link, as stored in the `bookmarks` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub url: String,
    pub title: String,
    pub created_at: String,
    pub user_id: String,
}

impl Bookmark {
    /// Creation time, when the stored timestamp parses as RFC 3339
    pub fn created(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Insert payload for a new bookmark row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewBookmark {
    pub url: String,
    pub title: String,
    pub user_id: String,
}

/// Row ids arrive as strings (uuid) or numbers (bigint) depending on the table
pub(crate) fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallbacks() {
        let user = User::new("u1");
        assert_eq!(user.display_name(), "u1");

        let user = User::new("u1").email("me@example.com");
        assert_eq!(user.display_name(), "me@example.com");

        let user = User::new("u1").email("me@example.com").full_name("Ada");
        assert_eq!(user.display_name(), "Ada");
    }

    #[test]
    fn test_user_deserialize_without_metadata() {
        let json = r#"{"id": "abc", "email": "a@b.c"}"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user.id, "abc");
        assert_eq!(user.user_metadata, UserMetadata::default());
    }

    #[test]
    fn test_session_expiry_margin() {
        let now = Utc::now();
        let session = Session {
            access_token: "a".into(),
            token_type: "bearer".into(),
            refresh_token: "r".into(),
            expires_at: now.timestamp() + 30,
            user: User::new("u1"),
        };
        assert!(session.expires_within(now, 60));
        assert!(!session.expires_within(now, 10));
    }

    #[test]
    fn test_bookmark_numeric_id() {
        let json = r#"{"id": 42, "url": "https://a.b", "title": "A",
                       "created_at": "2024-01-01T00:00:00Z", "user_id": "u1"}"#;
        let bookmark: Bookmark = serde_json::from_str(json).unwrap();
        assert_eq!(bookmark.id, "42");
    }

    #[test]
    fn test_bookmark_created_parses_postgres_timestamp() {
        let bookmark = Bookmark {
            id: "1".into(),
            url: "https://example.com".into(),
            title: "Example".into(),
            created_at: "2024-03-01T12:30:00.123456+00:00".into(),
            user_id: "u1".into(),
        };
        let created = bookmark.created().unwrap();
        assert_eq!(created.timestamp(), 1709296200);
    }
}
