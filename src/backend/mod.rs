//! Backend Service Seams
//!
//! Everything non-trivial (sessions, row storage, change broadcast, access
//! control) lives in the hosted backend. This module names the three parts
//! of it the application talks to:
//!
//! - [`AuthService`]: session retrieval, session-change notifications, the
//!   OAuth redirect flow and sign-out
//! - [`RowStore`]: select/insert/delete on the bookmarks table
//! - [`ChangeFeed`]: insert/delete notifications filtered by owner
//!
//! A [`Backend`] bundles one of each and is passed explicitly to the
//! dashboard. [`memory::MemoryBackend`] implements all three in-process;
//! [`crate::supabase`] implements them against a hosted project.

pub mod memory;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::model::{Bookmark, NewBookmark, Session};
use crate::storage::StoreError;

pub use memory::MemoryBackend;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthEvent {
    /// The session this event leaves in place, if any
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthEvent::SignedIn(s) | AuthEvent::TokenRefreshed(s) => Some(s),
            AuthEvent::SignedOut => None,
        }
    }
}

/// Where to send the user to sign in, plus the PKCE verifier to keep
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub url: String,
    pub code_verifier: String,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// The active session, refreshed first when close to expiry
    async fn get_session(&self) -> BackendResult<Option<Session>>;

    /// Exchange the refresh token for new tokens now, whatever the expiry;
    /// `None` when there is no session or the refresh token was rejected
    async fn refresh_session(&self) -> BackendResult<Option<Session>>;

    /// Receive every session change from now on
    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent>;

    /// Start the OAuth redirect flow; the user is sent to the returned URL
    fn authorize(&self, redirect_to: &str) -> BackendResult<AuthorizeRequest>;

    /// Complete the redirect flow with the code handed to the callback route
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> BackendResult<Session>;

    async fn sign_out(&self) -> BackendResult<()>;
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Rows owned by `owner`, newest first
    async fn list_bookmarks(&self, session: &Session, owner: &str) -> BackendResult<Vec<Bookmark>>;

    async fn insert_bookmark(&self, session: &Session, row: NewBookmark) -> BackendResult<()>;

    async fn delete_bookmark(&self, session: &Session, id: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a change-feed subscription for rows matching `filter`
    async fn subscribe(&self, session: &Session, filter: FeedFilter) -> BackendResult<Subscription>;
}

/// Owner predicate for a subscription
///
/// The service applies it to insert notifications only; delete
/// notifications arrive unfiltered and are matched on the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub owner: String,
}

impl FeedFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    /// PostgREST-style filter expression, e.g. `user_id=eq.abc`
    pub fn expression(&self) -> String {
        format!("user_id=eq.{}", self.owner)
    }

    /// Whether a row owned by `owner` passes; unknown owners pass
    pub fn admits(&self, owner: Option<&str>) -> bool {
        owner.map_or(true, |o| o == self.owner)
    }
}

/// A row-level change pushed by the feed
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(Bookmark),
    /// `owner` is only known when the service ships the full old row
    Delete { id: String, owner: Option<String> },
    /// The feed reconnected after a drop; events may have been missed
    Resynced,
}

/// Producer half of a subscription
#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    active: Arc<AtomicBool>,
}

impl FeedSender {
    /// Deliver an event; false once the subscriber has gone away
    pub fn send(&self, event: ChangeEvent) -> bool {
        self.is_active() && self.tx.send(event).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Resolves when the subscriber unsubscribes or is dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer half of a change-feed subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Create a connected producer/consumer pair
    pub fn channel() -> (FeedSender, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        (
            FeedSender {
                tx,
                active: Arc::clone(&active),
            },
            Subscription { rx, active },
        )
    }

    /// Next event, or `None` once unsubscribed or the producer is gone
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        if !self.is_active() {
            return None;
        }
        let event = self.rx.recv().await;
        if event.is_none() {
            self.active.store(false, Ordering::SeqCst);
        }
        event
    }

    /// Stop delivery; anything already buffered is discarded
    pub fn unsubscribe(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// The hosted service, as the dashboard sees it
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthService>,
    pub rows: Arc<dyn RowStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Backend {
    pub fn new(
        auth: Arc<dyn AuthService>,
        rows: Arc<dyn RowStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self { auth, rows, feed }
    }

    /// All three services backed by one in-process fake
    pub fn in_memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            auth: Arc::clone(&backend) as Arc<dyn AuthService>,
            rows: Arc::clone(&backend) as Arc<dyn RowStore>,
            feed: backend as Arc<dyn ChangeFeed>,
        }
    }
}

/// Errors from backend service calls
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Session rejected by the auth service")]
    Unauthorized,

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Sign-in failed: {0}")]
    SignIn(String),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmark(id: &str) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            user_id: "u1".to_string(),
        }
    }

    #[test]
    fn test_filter_expression() {
        let filter = FeedFilter::owner("abc");
        assert_eq!(filter.expression(), "user_id=eq.abc");
        assert!(filter.admits(Some("abc")));
        assert!(filter.admits(None));
        assert!(!filter.admits(Some("other")));
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (tx, mut sub) = Subscription::channel();
        assert!(tx.send(ChangeEvent::Insert(bookmark("1"))));
        assert!(tx.send(ChangeEvent::Delete {
            id: "1".into(),
            owner: None
        }));

        assert_eq!(sub.next().await, Some(ChangeEvent::Insert(bookmark("1"))));
        assert!(matches!(sub.next().await, Some(ChangeEvent::Delete { .. })));
    }

    #[tokio::test]
    async fn test_unsubscribe_discards_buffered_and_stops_producer() {
        let (tx, mut sub) = Subscription::channel();
        tx.send(ChangeEvent::Insert(bookmark("1")));

        sub.unsubscribe();

        assert!(!sub.is_active());
        assert!(!tx.is_active());
        assert!(!tx.send(ChangeEvent::Insert(bookmark("2"))));
        assert_eq!(sub.next().await, None);
        // closed() resolves immediately once the receiver is closed
        tx.closed().await;
    }

    #[tokio::test]
    async fn test_producer_drop_ends_subscription() {
        let (tx, mut sub) = Subscription::channel();
        drop(tx);
        assert_eq!(sub.next().await, None);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_auth_event_session() {
        assert!(AuthEvent::SignedOut.session().is_none());
    }
}
