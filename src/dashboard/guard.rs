//! Session Guard
//!
//! Decides whether the dashboard may be shown, and keeps watching session
//! changes for as long as it is.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::backend::{AuthEvent, AuthService};
use crate::model::Session;

/// The two places a user can be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Dashboard,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Proceed(Session),
    /// Send the user to the login view; carries the failure when the check itself broke
    Redirect(Option<String>),
}

impl GuardDecision {
    pub fn route(&self) -> Route {
        match self {
            GuardDecision::Proceed(_) => Route::Dashboard,
            GuardDecision::Redirect(_) => Route::Login,
        }
    }
}

/// Map a session-change notification onto a decision
pub fn decide(event: &AuthEvent) -> GuardDecision {
    match event.session() {
        Some(session) => GuardDecision::Proceed(session.clone()),
        None => GuardDecision::Redirect(None),
    }
}

pub struct SessionGuard {
    events: broadcast::Receiver<AuthEvent>,
}

impl SessionGuard {
    /// Start observing before the first check so no change slips between them
    pub fn new(auth: &dyn AuthService) -> Self {
        Self {
            events: auth.subscribe_auth(),
        }
    }

    pub async fn check(&self, auth: &dyn AuthService) -> GuardDecision {
        match auth.get_session().await {
            Ok(Some(session)) => {
                tracing::debug!(user_id = %session.user.id, "Session present");
                GuardDecision::Proceed(session)
            }
            Ok(None) => GuardDecision::Redirect(None),
            Err(e) => {
                tracing::warn!(error = %e, "Session check failed, treating as signed out");
                GuardDecision::Redirect(Some(e.to_string()))
            }
        }
    }

    /// Next session change; `None` once the auth service has gone away
    pub async fn next_change(&mut self) -> Option<AuthEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session notifications lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::model::User;

    #[tokio::test]
    async fn test_check_without_session_redirects() {
        let backend = MemoryBackend::new();
        let guard = SessionGuard::new(&backend);

        assert_eq!(guard.check(&backend).await, GuardDecision::Redirect(None));
    }

    #[tokio::test]
    async fn test_check_with_session_proceeds() {
        let backend = MemoryBackend::with_user(User::new("u1"));
        let guard = SessionGuard::new(&backend);

        match guard.check(&backend).await {
            GuardDecision::Proceed(session) => assert_eq!(session.user.id, "u1"),
            other => panic!("Expected Proceed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_failure_redirects_with_reason() {
        let backend = MemoryBackend::with_user(User::new("u1"));
        backend.fail_session(true);
        let guard = SessionGuard::new(&backend);

        let decision = guard.check(&backend).await;
        assert_eq!(decision.route(), Route::Login);
        assert!(matches!(decision, GuardDecision::Redirect(Some(_))));
    }

    #[tokio::test]
    async fn test_observes_changes_after_creation() {
        let backend = MemoryBackend::with_user(User::new("u1"));
        let mut guard = SessionGuard::new(&backend);

        backend.rotate_session().await;
        backend.end_session().await;

        let refreshed = guard.next_change().await.unwrap();
        assert_eq!(decide(&refreshed).route(), Route::Dashboard);
        let ended = guard.next_change().await.unwrap();
        assert_eq!(decide(&ended), GuardDecision::Redirect(None));
    }
}
