//! Auth Client
//!
//! Sessions against the project's GoTrue endpoints. The current session is
//! cached in memory and persisted to the [`LocalStore`]; every change is
//! published to session observers.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::{check_response, request_error, ProjectClient};
use crate::backend::{AuthEvent, AuthService, AuthorizeRequest, BackendError, BackendResult};
use crate::config::AuthConfig;
use crate::model::{Session, User};
use crate::storage::LocalStore;

/// Key under which the session is persisted
pub const SESSION_KEY: &str = "auth-token";

/// GoTrue-backed [`AuthService`]
pub struct SupabaseAuth {
    project: ProjectClient,
    config: AuthConfig,
    store: Arc<LocalStore>,
    /// Held across refreshes so concurrent callers never refresh twice
    current: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

impl SupabaseAuth {
    pub fn new(project: ProjectClient, config: AuthConfig, store: Arc<LocalStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            project,
            config,
            store,
            current: Mutex::new(None),
            events,
        }
    }

    /// Sender side of the session-change channel
    pub fn events(&self) -> broadcast::Sender<AuthEvent> {
        self.events.clone()
    }

    fn load_persisted(&self) -> Option<Session> {
        let raw = self.store.get(SESSION_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable persisted session");
                None
            }
        }
    }

    fn persist(&self, session: &Session) -> BackendResult<()> {
        self.store.set(SESSION_KEY, serde_json::to_string(session)?)?;
        Ok(())
    }

    fn forget(&self) -> BackendResult<()> {
        self.store.remove(SESSION_KEY)?;
        Ok(())
    }

    fn publish(&self, event: AuthEvent) {
        // No receivers is fine; nobody is watching yet
        let _ = self.events.send(event);
    }

    async fn token_request(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> BackendResult<Session> {
        let path = format!("/auth/v1/token?grant_type={}", grant_type);
        let response = self
            .project
            .request(Method::POST, &path, None)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let token: TokenResponse = check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        Ok(token.into_session(Utc::now().timestamp()))
    }

    /// Refresh `session` and swap the result into `current`
    async fn replace_tokens(
        &self,
        current: &mut Option<Session>,
        session: &Session,
    ) -> BackendResult<Option<Session>> {
        tracing::debug!(user_id = %session.user.id, "Refreshing session");
        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => {
                self.persist(&refreshed)?;
                *current = Some(refreshed.clone());
                self.publish(AuthEvent::TokenRefreshed(refreshed.clone()));
                Ok(Some(refreshed))
            }
            Err(e @ (BackendError::Api { .. } | BackendError::Unauthorized)) => {
                tracing::warn!(error = %e, "Refresh token rejected, signing out");
                *current = None;
                self.forget()?;
                self.publish(AuthEvent::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> BackendResult<Session> {
        self.token_request(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }
}

#[async_trait]
impl AuthService for SupabaseAuth {
    async fn get_session(&self) -> BackendResult<Option<Session>> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.load_persisted();
        }

        let Some(session) = current.clone() else {
            return Ok(None);
        };

        if !session.expires_within(Utc::now(), self.config.refresh_margin_secs) {
            return Ok(Some(session));
        }

        self.replace_tokens(&mut current, &session).await
    }

    async fn refresh_session(&self) -> BackendResult<Option<Session>> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.load_persisted();
        }
        let Some(session) = current.clone() else {
            return Ok(None);
        };
        self.replace_tokens(&mut current, &session).await
    }

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn authorize(&self, redirect_to: &str) -> BackendResult<AuthorizeRequest> {
        let code_verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let challenge = pkce_challenge(&code_verifier);

        let mut url = format!(
            "{}/auth/v1/authorize?provider={}&redirect_to={}&code_challenge={}&code_challenge_method=s256",
            self.project.base_url(),
            urlencoding::encode(&self.config.provider),
            urlencoding::encode(redirect_to),
            challenge,
        );
        if !self.config.prompt.is_empty() {
            url.push_str(&format!("&prompt={}", urlencoding::encode(&self.config.prompt)));
        }

        Ok(AuthorizeRequest { url, code_verifier })
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> BackendResult<Session> {
        let session = self
            .token_request(
                "pkce",
                serde_json::json!({ "auth_code": code, "code_verifier": code_verifier }),
            )
            .await
            .map_err(|e| match e {
                BackendError::Api { message, .. } => BackendError::SignIn(message),
                other => other,
            })?;

        self.persist(&session)?;
        *self.current.lock().await = Some(session.clone());
        tracing::info!(user_id = %session.user.id, "Signed in");
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        let session = {
            let mut current = self.current.lock().await;
            current.take().or_else(|| self.load_persisted())
        };

        let result = match session {
            Some(session) => {
                let response = self
                    .project
                    .request(Method::POST, "/auth/v1/logout", Some(&session.access_token))
                    .send()
                    .await
                    .map_err(request_error);
                match response {
                    Ok(response) => match check_response(response).await {
                        // Already revoked server-side
                        Err(BackendError::Unauthorized)
                        | Err(BackendError::Api { status: 404, .. }) => Ok(()),
                        other => other.map(|_| ()),
                    },
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };

        // The local session is gone whatever the service said
        self.forget()?;
        self.publish(AuthEvent::SignedOut);
        result
    }
}

/// S256 code challenge for a PKCE verifier
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest.as_ref())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenResponse {
    fn into_session(self, now: i64) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| now + self.expires_in.unwrap_or(3600));
        Session {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}
