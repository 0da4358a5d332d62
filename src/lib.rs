//! # Linkshelf
//!
//! A personal bookmark manager with Google sign-in and live updates. Sessions,
//! row storage and change notification all live in a hosted Supabase
//! project; this crate is the client around it.
//!
//! ## Modules
//!
//! - [`backend`]: The auth / row store / change feed seams, plus an in-memory implementation
//! - [`supabase`]: Those seams implemented against a hosted project
//! - [`dashboard`]: Session guard, list cache, add form and the dashboard view-model
//! - [`render`]: Terminal renderings of the landing view and dashboard
//! - [`watch`]: The interactive live-dashboard loop
//! - [`callback`]: Local listener for the OAuth redirect
//! - [`storage`]: Persisted local state (the session lives here)
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linkshelf::{Backend, Config, Dashboard, LocalStore, Route, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let local = Arc::new(LocalStore::open(config.storage.data_path())?);
//!     let backend: Backend = linkshelf::supabase::connect(&config, Arc::clone(&local))?;
//!
//!     let mut dashboard = Dashboard::new(backend, local, Arc::new(SystemClock), config.dashboard);
//!     if dashboard.activate().await == Route::Dashboard {
//!         dashboard.add("Rust", "rust-lang.org").await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod callback;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod model;
pub mod render;
pub mod storage;
pub mod supabase;
pub mod watch;

// Re-export top-level types for convenience
pub use backend::{
    AuthEvent, AuthService, Backend, BackendError, BackendResult, ChangeEvent, ChangeFeed,
    FeedFilter, MemoryBackend, RowStore, Subscription,
};

pub use callback::{CallbackError, CallbackServer};

pub use clock::{Clock, ManualClock, SystemClock};

pub use config::{Config, ConfigError};

pub use dashboard::{AddForm, Dashboard, DashboardEvent, PendingWrite, Route, ValidationError};

pub use model::{Bookmark, NewBookmark, Session, User};

pub use storage::{LocalStore, StoreError};

pub use watch::WatchExit;
