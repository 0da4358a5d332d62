//! Hosted Backend Client
//!
//! Implements the [`crate::backend`] seams against a Supabase project:
//!
//! - **auth**: GoTrue (`/auth/v1`) sessions, OAuth with PKCE, refresh, logout
//! - **rows**: PostgREST (`/rest/v1`) select/insert/delete
//! - **realtime**: Phoenix channels over websocket (`/realtime/v1/websocket`)
//!
//! All three share one HTTP client and the public anon key.
//!
//! ## Example
//!
//! ```rust,no_run
//! use linkshelf::{Config, LocalStore};
//! use linkshelf::supabase::connect;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_default();
//! let store = Arc::new(LocalStore::open(config.storage.data_path())?);
//! let backend = connect(&config, store)?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod messages;
mod realtime;
mod rows;

pub use auth::{pkce_challenge, SupabaseAuth, SESSION_KEY};
pub use messages::{ChangePayload, Frame};
pub use realtime::SupabaseRealtime;
pub use rows::SupabaseRows;

use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendError, BackendResult};
use crate::config::Config;
use crate::storage::LocalStore;

/// Endpoint, key and HTTP client shared by every service
#[derive(Clone)]
pub struct ProjectClient {
    http: Client,
    base_url: String,
    anon_key: String,
}

impl ProjectClient {
    pub fn new(config: &Config) -> BackendResult<Self> {
        config
            .supabase
            .require()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.supabase.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.supabase.base_url().to_string(),
            anon_key: config.supabase.anon_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// URL under the project, e.g. `url("/rest/v1/bookmarks")`
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request carrying the project key and, when given, the user's token
    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        access_token: Option<&str>,
    ) -> RequestBuilder {
        let builder = self
            .http
            .request(method, self.url(path))
            .header("apikey", &self.anon_key);
        builder.bearer_auth(access_token.unwrap_or(&self.anon_key))
    }
}

/// Build a [`Backend`] talking to the configured project
pub fn connect(config: &Config, store: Arc<LocalStore>) -> BackendResult<Backend> {
    let project = ProjectClient::new(config)?;

    let auth = Arc::new(SupabaseAuth::new(
        project.clone(),
        config.auth.clone(),
        store,
    ));
    let rows = Arc::new(SupabaseRows::new(project.clone(), &config.supabase));
    let feed = Arc::new(SupabaseRealtime::new(
        &project,
        &config.supabase,
        config.realtime.clone(),
        auth.events(),
    ));

    Ok(Backend::new(auth, rows, feed))
}

/// Map transport failures to backend errors
fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() {
        BackendError::Unavailable(e.to_string())
    } else {
        BackendError::Http(e)
    }
}

/// Turn a non-success response into an error carrying the service's message
async fn check_response(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 401 {
        return Err(BackendError::Unauthorized);
    }

    let text = response.text().await.unwrap_or_default();
    Err(BackendError::Api {
        status: status.as_u16(),
        message: error_message(&text),
    })
}

/// Pull the human-readable part out of a GoTrue/PostgREST error body
fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()))
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.supabase.url = "https://abcd.supabase.co/".to_string();
        config.supabase.anon_key = "anon".to_string();
        config
    }

    #[test]
    fn test_project_client_requires_settings() {
        let result = ProjectClient::new(&Config::default());
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn test_project_urls() {
        let project = ProjectClient::new(&test_config()).unwrap();
        assert_eq!(project.base_url(), "https://abcd.supabase.co");
        assert_eq!(
            project.url("/rest/v1/bookmarks"),
            "https://abcd.supabase.co/rest/v1/bookmarks"
        );
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"code":"42501","message":"permission denied"}"#),
            "permission denied"
        );
        assert_eq!(
            error_message(r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token"}"#),
            "Invalid Refresh Token"
        );
        assert_eq!(error_message("plain text"), "plain text");
    }

    #[test]
    fn test_connect_builds_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        assert!(connect(&test_config(), store).is_ok());
    }
}
