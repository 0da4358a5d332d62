//! OAuth Callback Listener
//!
//! A short-lived local HTTP server that receives the identity provider's
//! redirect at `/auth/callback` and hands the authorization code back to
//! the `login` command.
//!
//! # Endpoints
//!
//! - `GET /auth/callback?code=...` - Sign-in completed
//! - `GET /auth/callback?error=...&error_description=...` - Sign-in refused

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

pub const CALLBACK_PATH: &str = "/auth/callback";

/// Why no authorization code arrived
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Sign-in refused: {error}: {description}")]
    Denied { error: String, description: String },

    #[error("Callback carried no authorization code")]
    MissingCode,

    #[error("Callback listener failed: {0}")]
    Listener(String),
}

pub type CallbackResult = Result<String, CallbackError>;

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Delivers the first callback outcome; later hits find it taken
struct CallbackState {
    outcome: Mutex<Option<oneshot::Sender<CallbackResult>>>,
}

const SIGNED_IN_PAGE: &str =
    "<html><body><h3>Signed in to Linkshelf.</h3><p>You can close this tab.</p></body></html>";
const FAILED_PAGE: &str =
    "<html><body><h3>Sign-in failed.</h3><p>Return to the terminal for details.</p></body></html>";
const DONE_PAGE: &str =
    "<html><body><h3>Sign-in already completed.</h3></body></html>";

/// Router serving the callback route; the outcome goes to `outcome`
pub fn callback_router(outcome: oneshot::Sender<CallbackResult>) -> Router {
    let state = Arc::new(CallbackState {
        outcome: Mutex::new(Some(outcome)),
    });

    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    let outcome = match (params.code, params.error) {
        (_, Some(error)) => Err(CallbackError::Denied {
            error,
            description: params.error_description.unwrap_or_default(),
        }),
        (Some(code), None) if !code.is_empty() => Ok(code),
        _ => Err(CallbackError::MissingCode),
    };

    let sender = state
        .outcome
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    let Some(sender) = sender else {
        return (StatusCode::GONE, Html(DONE_PAGE));
    };

    let response = match &outcome {
        Ok(_) => (StatusCode::OK, Html(SIGNED_IN_PAGE)),
        Err(e) => {
            tracing::warn!(error = %e, "Sign-in callback failed");
            (StatusCode::BAD_REQUEST, Html(FAILED_PAGE))
        }
    };
    let _ = sender.send(outcome);
    response
}

/// A bound callback listener waiting for one redirect
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl CallbackServer {
    /// Bind on localhost; port 0 picks a free one
    pub async fn bind(port: u16) -> Result<Self, CallbackError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| CallbackError::Listener(format!("bind port {}: {}", port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CallbackError::Listener(e.to_string()))?;
        Ok(Self { listener, addr })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Serve until the first callback arrives, then shut down
    pub async fn wait(self) -> CallbackResult {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let router = callback_router(outcome_tx);

        tracing::info!("Waiting for sign-in callback on {}", self.addr);
        let server = tokio::spawn(async move {
            axum::serve(self.listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let outcome = outcome_rx
            .await
            .unwrap_or_else(|_| Err(CallbackError::Listener("listener stopped".into())));

        let _ = stop_tx.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Callback listener error"),
            Err(e) => tracing::warn!(error = %e, "Callback listener task failed"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::util::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_code_is_delivered() {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(tx);

        let response = app.oneshot(get("/auth/callback?code=abc123")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.await.unwrap(), Ok("abc123".to_string()));
    }

    #[tokio::test]
    async fn test_provider_error_is_delivered() {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(tx);

        let response = app
            .oneshot(get(
                "/auth/callback?error=access_denied&error_description=User%20cancelled",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            rx.await.unwrap(),
            Err(CallbackError::Denied {
                error: "access_denied".into(),
                description: "User cancelled".into()
            })
        );
    }

    #[tokio::test]
    async fn test_missing_code() {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(tx);

        let response = app.oneshot(get("/auth/callback")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(rx.await.unwrap(), Err(CallbackError::MissingCode));
    }

    #[tokio::test]
    async fn test_second_callback_is_gone() {
        let (tx, _rx) = oneshot::channel();
        let app = callback_router(tx);

        let first = app.clone().oneshot(get("/auth/callback?code=a")).await.unwrap();
        let second = app.oneshot(get("/auth/callback?code=b")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_server_returns_code_and_stops() {
        let server = CallbackServer::bind(0).await.unwrap();
        let port = server.port();
        let waiting = tokio::spawn(server.wait());

        let response = reqwest::get(format!("http://127.0.0.1:{}/auth/callback?code=xyz", port))
            .await
            .unwrap();
        assert!(response.status().is_success());

        assert_eq!(waiting.await.unwrap(), Ok("xyz".to_string()));
    }
}
