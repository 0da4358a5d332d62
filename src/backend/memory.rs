//! In-Memory Backend
//!
//! A process-local stand-in for the hosted service. Rows live in a vector,
//! insert notifications fan out to subscribers filtered by owner while
//! delete notifications reach everyone, as the hosted feed does. Session
//! changes go out on a broadcast channel. Every call is recorded, each
//! operation can be made to fail, and row writes can be held open, so
//! dashboard behavior can be checked without a network.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Notify, RwLock};
use uuid::Uuid;

use super::{
    AuthEvent, AuthService, AuthorizeRequest, BackendError, BackendResult, ChangeEvent,
    ChangeFeed, FeedFilter, FeedSender, RowStore, Subscription,
};
use crate::model::{Bookmark, NewBookmark, Session, User};

/// Which calls should fail
#[derive(Debug, Default)]
struct Faults {
    session: AtomicBool,
    fetch: AtomicBool,
    insert: AtomicBool,
    delete: AtomicBool,
    sign_out: AtomicBool,
    subscribe: AtomicBool,
}

/// Calls observed so far
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    pub inserts: Vec<NewBookmark>,
    pub deletes: Vec<String>,
    pub fetches: usize,
    pub sign_outs: usize,
    pub refreshes: usize,
    /// Access token presented on each insert or delete, in call order
    pub write_tokens: Vec<String>,
}

/// In-process implementation of every backend service
pub struct MemoryBackend {
    rows: RwLock<Vec<Bookmark>>,
    session: RwLock<Option<Session>>,
    subscribers: RwLock<HashMap<Uuid, (FeedFilter, FeedSender)>>,
    auth_tx: broadcast::Sender<AuthEvent>,
    calls: RwLock<CallLog>,
    faults: Faults,
    /// When false, writes succeed but no notifications go out
    feed_connected: AtomicBool,
    /// While set, inserts and deletes wait for `release_writes`
    writes_held: AtomicBool,
    writes_released: Notify,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A backend with `user` already signed in
    pub fn with_user(user: User) -> Self {
        Self::build(Some(session_for(user)))
    }

    fn build(session: Option<Session>) -> Self {
        let (auth_tx, _) = broadcast::channel(64);
        Self {
            rows: RwLock::new(Vec::new()),
            session: RwLock::new(session),
            subscribers: RwLock::new(HashMap::new()),
            auth_tx,
            calls: RwLock::new(CallLog::default()),
            faults: Faults::default(),
            feed_connected: AtomicBool::new(true),
            writes_held: AtomicBool::new(false),
            writes_released: Notify::new(),
        }
    }

    /// Start with `session` already in place
    pub fn with_session(session: Session) -> Self {
        Self::build(Some(session))
    }

    /// Sign `user` in and notify session observers
    pub async fn sign_in(&self, user: User) -> Session {
        let session = session_for(user);
        *self.session.write().await = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        session
    }

    /// Simulate the session disappearing from outside (expiry, other tab)
    pub async fn end_session(&self) {
        *self.session.write().await = None;
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
    }

    /// Issue new tokens for the current session and announce them
    pub async fn rotate_session(&self) -> Option<Session> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut()?;
        session.access_token = format!("access-{}", Uuid::new_v4());
        session.expires_at = Utc::now().timestamp() + 3600;
        let refreshed = session.clone();
        let _ = self.auth_tx.send(AuthEvent::TokenRefreshed(refreshed.clone()));
        Some(refreshed)
    }

    /// Add a row as if another client inserted it
    pub async fn insert_row(&self, row: NewBookmark) -> Bookmark {
        let bookmark = Bookmark {
            id: Uuid::new_v4().to_string(),
            url: row.url,
            title: row.title,
            created_at: Utc::now().to_rfc3339(),
            user_id: row.user_id,
        };
        self.rows.write().await.push(bookmark.clone());
        self.notify(ChangeEvent::Insert(bookmark.clone())).await;
        bookmark
    }

    /// Remove a row as if another client deleted it
    pub async fn delete_row(&self, id: &str) -> bool {
        let removed = {
            let mut rows = self.rows.write().await;
            let pos = rows.iter().position(|b| b.id == id);
            pos.map(|i| rows.remove(i))
        };
        match removed {
            Some(row) => {
                self.notify(ChangeEvent::Delete {
                    id: row.id,
                    owner: Some(row.user_id),
                })
                .await;
                true
            }
            None => false,
        }
    }

    /// Push an event to every subscriber, ignoring their filters
    pub async fn emit_unfiltered(&self, event: ChangeEvent) {
        for (_, sender) in self.subscribers.read().await.values() {
            sender.send(event.clone());
        }
    }

    /// Stop or resume notifications; resuming tells subscribers to resync
    pub async fn set_feed_connected(&self, connected: bool) {
        let was = self.feed_connected.swap(connected, Ordering::SeqCst);
        if connected && !was {
            self.emit_unfiltered(ChangeEvent::Resynced).await;
        }
    }

    pub fn fail_session(&self, fail: bool) {
        self.faults.session.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.faults.fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_insert(&self, fail: bool) {
        self.faults.insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.faults.delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.faults.sign_out.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.faults.subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make inserts and deletes wait until `release_writes`
    pub fn hold_writes(&self) {
        self.writes_held.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.writes_held.store(false, Ordering::SeqCst);
        self.writes_released.notify_waiters();
    }

    async fn write_gate(&self) {
        loop {
            let released = self.writes_released.notified();
            if !self.writes_held.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    pub async fn calls(&self) -> CallLog {
        self.calls.read().await.clone()
    }

    pub async fn rows(&self) -> Vec<Bookmark> {
        self.rows.read().await.clone()
    }

    /// Number of subscriptions still listening
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|(_, s)| s.is_active())
            .count()
    }

    async fn notify(&self, event: ChangeEvent) {
        if !self.feed_connected.load(Ordering::SeqCst) {
            tracing::debug!(?event, "Feed disconnected, notification dropped");
            return;
        }

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|_, (_, sender)| sender.is_active());

        let mut sent_count = 0;
        for (filter, sender) in subscribers.values() {
            let admitted = match &event {
                ChangeEvent::Insert(b) => filter.admits(Some(&b.user_id)),
                ChangeEvent::Delete { .. } | ChangeEvent::Resynced => true,
            };
            if admitted && sender.send(event.clone()) {
                sent_count += 1;
            }
        }

        tracing::trace!(subscribers = sent_count, "Broadcast change");
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> BackendResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable(format!("{} failed (injected)", what)))
        } else {
            Ok(())
        }
    }
}

fn session_for(user: User) -> Session {
    Session {
        access_token: format!("access-{}", Uuid::new_v4()),
        token_type: "bearer".to_string(),
        refresh_token: format!("refresh-{}", Uuid::new_v4()),
        expires_at: Utc::now().timestamp() + 3600,
        user,
    }
}

#[async_trait]
impl AuthService for MemoryBackend {
    async fn get_session(&self) -> BackendResult<Option<Session>> {
        self.check(&self.faults.session, "session check")?;
        Ok(self.session.read().await.clone())
    }

    async fn refresh_session(&self) -> BackendResult<Option<Session>> {
        self.calls.write().await.refreshes += 1;
        self.check(&self.faults.session, "refresh")?;
        Ok(self.rotate_session().await)
    }

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    fn authorize(&self, redirect_to: &str) -> BackendResult<AuthorizeRequest> {
        Ok(AuthorizeRequest {
            url: format!(
                "memory://authorize?redirect_to={}",
                urlencoding::encode(redirect_to)
            ),
            code_verifier: Uuid::new_v4().simple().to_string(),
        })
    }

    async fn exchange_code(&self, code: &str, _code_verifier: &str) -> BackendResult<Session> {
        if code.is_empty() {
            return Err(BackendError::SignIn("empty authorization code".into()));
        }
        Ok(self.sign_in(User::new(code)).await)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        self.calls.write().await.sign_outs += 1;
        // The service drops the session even when the call reports failure
        *self.session.write().await = None;
        self.check(&self.faults.sign_out, "sign-out")?;
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryBackend {
    async fn list_bookmarks(&self, _session: &Session, owner: &str) -> BackendResult<Vec<Bookmark>> {
        self.calls.write().await.fetches += 1;
        self.check(&self.faults.fetch, "fetch")?;

        // Rows are kept in insertion order; newest first means reversed
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .rev()
            .filter(|b| b.user_id == owner)
            .cloned()
            .collect())
    }

    async fn insert_bookmark(&self, session: &Session, row: NewBookmark) -> BackendResult<()> {
        {
            let mut calls = self.calls.write().await;
            calls.inserts.push(row.clone());
            calls.write_tokens.push(session.access_token.clone());
        }
        self.write_gate().await;
        self.check(&self.faults.insert, "insert")?;
        if row.user_id != session.user.id {
            return Err(BackendError::Api {
                status: 403,
                message: "new row violates row-level security policy".into(),
            });
        }
        self.insert_row(row).await;
        Ok(())
    }

    async fn delete_bookmark(&self, session: &Session, id: &str) -> BackendResult<()> {
        {
            let mut calls = self.calls.write().await;
            calls.deletes.push(id.to_string());
            calls.write_tokens.push(session.access_token.clone());
        }
        self.write_gate().await;
        self.check(&self.faults.delete, "delete")?;

        let owned = self
            .rows
            .read()
            .await
            .iter()
            .any(|b| b.id == id && b.user_id == session.user.id);
        // Row-level security turns a foreign delete into a silent no-op
        if owned {
            self.delete_row(id).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, _session: &Session, filter: FeedFilter) -> BackendResult<Subscription> {
        self.check(&self.faults.subscribe, "subscribe")?;

        let (sender, subscription) = Subscription::channel();
        let id = Uuid::new_v4();
        tracing::debug!(subscription_id = %id, owner = %filter.owner, "Feed subscribed");
        self.subscribers.write().await.insert(id, (filter, sender));
        Ok(subscription)
    }
}
