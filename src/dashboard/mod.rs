//! Dashboard State
//!
//! The view-model behind the dashboard. One task owns a [`Dashboard`] and
//! feeds it discrete events: user commands, change-feed notifications,
//! session changes and highlight deadlines. Nothing here is shared, so no
//! locks guard it.
//!
//! The bookmark list is a materialized view of the change feed. Adds and
//! deletes only talk to the row store; rows appear and disappear when the
//! feed reports them.
//!
//! Row writes come in two halves so a caller can show the in-flight state:
//! `begin_*` marks the dashboard and hands back a [`PendingWrite`] that runs
//! without borrowing it, and `finish_*` takes the result.

pub mod cache;
pub mod form;
pub mod guard;

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::backend::{
    AuthEvent, Backend, BackendError, BackendResult, ChangeEvent, FeedFilter, RowStore,
    Subscription,
};
use crate::clock::Clock;
use crate::config::DashboardConfig;
use crate::model::{Bookmark, NewBookmark, Session, User};
use crate::storage::LocalStore;

pub use cache::BookmarkList;
pub use form::{normalize_url, validate, AddForm, ValidationError, INSERT_FAILED};
pub use guard::{decide, GuardDecision, Route, SessionGuard};

/// Shown instead of an empty list when the initial fetch fails
pub const LOAD_FAILED: &str = "Failed to load bookmarks.";

/// Refresh this long before the access token expires, unless configured
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Wait before trying a failed refresh again
const REFRESH_RETRY_SECS: i64 = 30;

/// Something the dashboard should react to
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    Change(ChangeEvent),
    Auth(AuthEvent),
    /// The change feed stopped for good
    FeedClosed,
    /// The auth service stopped publishing session changes
    AuthClosed,
    /// A "new" highlight reached its deadline
    HighlightDue,
    /// The access token is about to expire
    RefreshDue,
}

/// A row write taken out of the dashboard so it can run while the
/// in-flight state is on screen
pub struct PendingWrite {
    rows: Arc<dyn RowStore>,
    session: Session,
    op: WriteOp,
}

enum WriteOp {
    Insert(NewBookmark),
    Delete(String),
}

impl PendingWrite {
    pub async fn run(self) -> BackendResult<()> {
        match self.op {
            WriteOp::Insert(row) => self.rows.insert_bookmark(&self.session, row).await,
            WriteOp::Delete(id) => self.rows.delete_bookmark(&self.session, &id).await,
        }
    }
}

pub struct Dashboard {
    backend: Backend,
    local: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    config: DashboardConfig,
    /// Open a change-feed subscription on activation
    live: bool,
    refresh_margin: Duration,

    route: Route,
    session: Option<Session>,
    /// When to trade the refresh token for new tokens
    refresh_at: Option<DateTime<Utc>>,
    bookmarks: BookmarkList,
    subscription: Option<Subscription>,
    guard: Option<SessionGuard>,
    pub form: AddForm,
    adding: bool,
    deleting_id: Option<String>,
    loading: bool,
    /// The single user-visible error line
    error: Option<String>,
    /// Why the last session check failed, when it failed rather than found nothing
    last_error: Option<String>,
}

impl Dashboard {
    pub fn new(
        backend: Backend,
        local: Arc<LocalStore>,
        clock: Arc<dyn Clock>,
        config: DashboardConfig,
    ) -> Self {
        let highlight = Duration::milliseconds(config.highlight_ms.max(0));
        Self {
            backend,
            local,
            clock,
            config,
            live: true,
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            route: Route::Login,
            session: None,
            refresh_at: None,
            bookmarks: BookmarkList::new(highlight),
            subscription: None,
            guard: None,
            form: AddForm::default(),
            adding: false,
            deleting_id: None,
            loading: false,
            error: None,
            last_error: None,
        }
    }

    /// Skip the change-feed subscription (one-shot commands)
    pub fn without_feed(mut self) -> Self {
        self.live = false;
        self
    }

    /// How long before expiry the session is refreshed
    pub fn refresh_margin(mut self, secs: i64) -> Self {
        self.refresh_margin = Duration::seconds(secs.max(0));
        self
    }

    /// Run the session guard and, if signed in, load and subscribe
    pub async fn activate(&mut self) -> Route {
        let guard = SessionGuard::new(self.backend.auth.as_ref());

        match guard.check(self.backend.auth.as_ref()).await {
            GuardDecision::Proceed(session) => {
                tracing::info!(user_id = %session.user.id, "Dashboard activated");
                self.last_error = None;
                self.route = Route::Dashboard;
                self.guard = Some(guard);
                self.set_session(session.clone());

                // Subscribe before fetching: anything that lands while the
                // fetch is in flight is buffered and deduplicated afterwards
                if self.live {
                    self.subscribe(&session).await;
                }
                self.load_bookmarks().await;
            }
            GuardDecision::Redirect(reason) => {
                tracing::info!("No active session, routing to login");
                self.last_error = reason;
                self.route = Route::Login;
            }
        }

        self.route
    }

    fn set_session(&mut self, session: Session) {
        let now = self.clock.now();
        let due = DateTime::from_timestamp(session.expires_at, 0).map(|at| at - self.refresh_margin);
        self.refresh_at = Some(match due {
            Some(at) if at > now => at,
            // Already inside the margin; the service just handed this out
            _ => now + Duration::seconds(REFRESH_RETRY_SECS),
        });
        self.session = Some(session);
    }

    async fn subscribe(&mut self, session: &Session) {
        let filter = FeedFilter::owner(&session.user.id);
        match self.backend.feed.subscribe(session, filter).await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => {
                tracing::warn!(error = %e, "Change feed unavailable, list will not update live");
            }
        }
    }

    /// Replace the list with a full fetch of the user's rows
    pub async fn load_bookmarks(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };

        self.loading = true;
        let result = self
            .backend
            .rows
            .list_bookmarks(&session, &session.user.id)
            .await;
        self.loading = false;

        match result {
            Ok(rows) => {
                tracing::debug!(count = rows.len(), "Bookmarks loaded");
                if self.error.as_deref() == Some(LOAD_FAILED) {
                    self.error = None;
                }
                self.bookmarks.replace_all(rows);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch bookmarks");
                self.bookmarks.clear();
                self.error = Some(LOAD_FAILED.to_string());
            }
        }
    }

    /// Apply one change-feed notification; true if the list changed
    pub async fn handle_change(&mut self, event: ChangeEvent) -> bool {
        if !self.is_subscribed() {
            tracing::debug!(?event, "Change ignored, no active subscription");
            return false;
        }
        let Some(owner) = self.user().map(|u| u.id.clone()) else {
            return false;
        };

        match event {
            ChangeEvent::Insert(bookmark) => {
                if bookmark.user_id != owner {
                    tracing::warn!(
                        bookmark_id = %bookmark.id,
                        user_id = %bookmark.user_id,
                        "Ignoring insert for another user"
                    );
                    return false;
                }
                let id = bookmark.id.clone();
                let added = self.bookmarks.apply_insert(bookmark, self.clock.now());
                if added {
                    tracing::debug!(bookmark_id = %id, "Bookmark added");
                }
                added
            }
            ChangeEvent::Delete { id, owner: Some(row_owner) } if row_owner != owner => {
                tracing::warn!(bookmark_id = %id, user_id = %row_owner, "Ignoring delete for another user");
                false
            }
            ChangeEvent::Delete { id, .. } => {
                let removed = self.bookmarks.apply_delete(&id);
                if removed {
                    tracing::debug!(bookmark_id = %id, "Bookmark removed");
                }
                removed
            }
            ChangeEvent::Resynced => {
                tracing::info!("Change feed reconnected, refetching");
                self.load_bookmarks().await;
                true
            }
        }
    }

    /// React to a session change; returns where the user should be
    pub async fn handle_auth_event(&mut self, event: AuthEvent) -> Route {
        if self.route != Route::Dashboard {
            return self.route;
        }

        match decide(&event) {
            GuardDecision::Proceed(session) => {
                let switched = self.user().map_or(false, |u| u.id != session.user.id);
                if switched {
                    // The list and the owner filter belong to the previous user
                    tracing::info!(user_id = %session.user.id, "Another user signed in, reloading");
                    self.deactivate();
                    self.reset();
                    return self.activate().await;
                }
                tracing::debug!(user_id = %session.user.id, "Session updated");
                self.set_session(session);
            }
            GuardDecision::Redirect(_) => {
                tracing::info!("Session ended, routing to login");
                self.end_session();
            }
        }
        self.route
    }

    /// Trade the refresh token for new tokens before the access token lapses
    pub async fn refresh_session(&mut self) -> Route {
        if self.route != Route::Dashboard {
            return self.route;
        }

        match self.backend.auth.refresh_session().await {
            Ok(Some(session)) => {
                tracing::debug!(user_id = %session.user.id, "Session refreshed");
                self.set_session(session);
            }
            Ok(None) => {
                tracing::info!("Session could not be refreshed, routing to login");
                self.end_session();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session refresh failed, will retry");
                self.refresh_at = Some(self.clock.now() + Duration::seconds(REFRESH_RETRY_SECS));
            }
        }
        self.route
    }

    /// Validate the form and mark the dashboard as saving
    ///
    /// `None` when the form is invalid or nobody is signed in; the reason is
    /// in [`Dashboard::error`].
    pub fn begin_add(&mut self) -> Option<PendingWrite> {
        self.error = None;

        let valid = match self.form.validate() {
            Ok(valid) => valid,
            Err(e) => {
                self.error = Some(e.to_string());
                return None;
            }
        };
        let Some(session) = self.session.clone() else {
            self.error = Some(BackendError::NotSignedIn.to_string());
            return None;
        };

        let row = NewBookmark {
            url: valid.url,
            title: valid.title,
            user_id: session.user.id.clone(),
        };
        self.adding = true;
        Some(PendingWrite {
            rows: Arc::clone(&self.backend.rows),
            session,
            op: WriteOp::Insert(row),
        })
    }

    pub fn finish_add(&mut self, result: BackendResult<()>) -> bool {
        self.adding = false;

        match result {
            Ok(()) => {
                tracing::info!("Bookmark submitted");
                self.form.clear();
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Insert failed");
                self.error = Some(INSERT_FAILED.to_string());
                false
            }
        }
    }

    /// Validate the form and insert it; the row shows up via the feed
    pub async fn submit_add(&mut self) -> bool {
        let Some(pending) = self.begin_add() else {
            return false;
        };
        let result = pending.run().await;
        self.finish_add(result)
    }

    /// Fill the form and submit it
    pub async fn add(&mut self, title: &str, url: &str) -> bool {
        self.form = AddForm::new(title, url);
        self.submit_add().await
    }

    /// Mark `id` as deleting
    pub fn begin_delete(&mut self, id: &str) -> BackendResult<PendingWrite> {
        let session = self.session.clone().ok_or(BackendError::NotSignedIn)?;

        self.deleting_id = Some(id.to_string());
        Ok(PendingWrite {
            rows: Arc::clone(&self.backend.rows),
            session,
            op: WriteOp::Delete(id.to_string()),
        })
    }

    pub fn finish_delete(&mut self, result: BackendResult<()>) -> BackendResult<()> {
        let id = self.deleting_id.take().unwrap_or_default();
        if let Err(e) = &result {
            tracing::error!(bookmark_id = %id, error = %e, "Delete failed");
        }
        result
    }

    /// Delete by id; the row stays listed until the feed reports the delete
    pub async fn delete(&mut self, id: &str) -> BackendResult<()> {
        let pending = self.begin_delete(id)?;
        let result = pending.run().await;
        self.finish_delete(result)
    }

    /// End highlights whose deadline has passed
    pub fn expire_highlights(&mut self) -> usize {
        self.bookmarks.expire_highlights(self.clock.now())
    }

    /// Time until the next highlight ends
    pub fn next_highlight_in(&self) -> Option<std::time::Duration> {
        self.bookmarks
            .next_expiry()
            .map(|at| (at - self.clock.now()).to_std().unwrap_or_default())
    }

    /// Time until the session should be refreshed
    pub fn next_refresh_in(&self) -> Option<std::time::Duration> {
        self.refresh_at
            .map(|at| (at - self.clock.now()).to_std().unwrap_or_default())
    }

    /// Unsubscribe, sign out, wipe local state, go to login
    pub async fn sign_out(&mut self) -> Route {
        self.deactivate();

        if let Err(e) = self.backend.auth.sign_out().await {
            tracing::warn!(error = %e, "Sign-out failed, continuing to login");
        }
        if let Err(e) = self.local.clear() {
            tracing::warn!(error = %e, "Failed to clear local storage");
        }

        self.reset();
        self.route = Route::Login;
        tracing::info!("Signed out");
        self.route
    }

    fn end_session(&mut self) {
        self.deactivate();
        self.reset();
        self.route = Route::Login;
    }

    /// Tear down the change feed and stop observing the session
    pub fn deactivate(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
            tracing::debug!("Change feed unsubscribed");
        }
        self.guard = None;
    }

    fn reset(&mut self) {
        self.session = None;
        self.refresh_at = None;
        self.bookmarks.clear();
        self.form.clear();
        self.adding = false;
        self.deleting_id = None;
        self.loading = false;
        self.error = None;
    }

    /// Wait for the next thing to react to; `None` when nothing is left to wait on
    pub async fn next_event(&mut self) -> Option<DashboardEvent> {
        let highlight_in = self.next_highlight_in();
        let refresh_in = self.next_refresh_in();
        if self.subscription.is_none()
            && self.guard.is_none()
            && highlight_in.is_none()
            && refresh_in.is_none()
        {
            return None;
        }

        let feed = self.subscription.as_mut();
        let guard = self.guard.as_mut();

        let event = tokio::select! {
            change = next_change(feed) => match change {
                Some(change) => DashboardEvent::Change(change),
                None => DashboardEvent::FeedClosed,
            },
            auth = next_auth(guard) => match auth {
                Some(auth) => DashboardEvent::Auth(auth),
                None => DashboardEvent::AuthClosed,
            },
            _ = sleep_for(highlight_in) => DashboardEvent::HighlightDue,
            _ = sleep_for(refresh_in) => DashboardEvent::RefreshDue,
        };
        Some(event)
    }

    /// Apply an event from [`Dashboard::next_event`]
    pub async fn dispatch(&mut self, event: DashboardEvent) -> Route {
        match event {
            DashboardEvent::Change(change) => {
                self.handle_change(change).await;
            }
            DashboardEvent::Auth(auth) => {
                self.handle_auth_event(auth).await;
            }
            DashboardEvent::FeedClosed => {
                tracing::warn!("Change feed closed, list will no longer update live");
                self.subscription = None;
            }
            DashboardEvent::AuthClosed => {
                tracing::warn!("Session notifications closed");
                self.guard = None;
            }
            DashboardEvent::HighlightDue => {
                self.expire_highlights();
            }
            DashboardEvent::RefreshDue => {
                self.refresh_session().await;
            }
        }
        self.route
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.user)
    }

    pub fn bookmarks(&self) -> &BookmarkList {
        &self.bookmarks
    }

    /// Resolve a 1-based list position or a literal id
    pub fn resolve(&self, id_or_index: &str) -> Option<&Bookmark> {
        if let Ok(index) = id_or_index.parse::<usize>() {
            if let Some(bookmark) = index.checked_sub(1).and_then(|i| self.bookmarks.get(i)) {
                return Some(bookmark);
            }
        }
        self.bookmarks.iter().find(|b| b.id == id_or_index)
    }

    pub fn is_new(&self, id: &str) -> bool {
        self.bookmarks.is_new(id)
    }

    pub fn is_deleting(&self, id: &str) -> bool {
        self.deleting_id.as_deref() == Some(id)
    }

    pub fn is_adding(&self) -> bool {
        self.adding
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().map_or(false, |s| s.is_active())
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }
}

async fn next_change(subscription: Option<&mut Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn next_auth(guard: Option<&mut SessionGuard>) -> Option<AuthEvent> {
    match guard {
        Some(guard) => guard.next_change().await,
        None => std::future::pending().await,
    }
}

async fn sleep_for(duration: Option<std::time::Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
