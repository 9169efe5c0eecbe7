//! Local HTTP listener receiving the browser redirect at the end of the
//! authorization code flow.
//!
//! The first request to `/auth/callback` decides the outcome: a matching
//! `state` with a `code` succeeds, anything else fails the login. The server
//! shuts down once the outcome is taken or the listener is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::constants::CALLBACK_PATH;
use crate::error::{Error, Result};

const SUCCESS_BODY: &str = "Authentication complete. You can close this window.";

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    outcome: Arc<Mutex<Option<oneshot::Sender<Result<String>>>>>,
}

impl CallbackState {
    async fn deliver(&self, outcome: Result<String>) {
        if let Some(tx) = self.outcome.lock().await.take() {
            let _ = tx.send(outcome);
        }
    }
}

pub struct CallbackServer {
    local_addr: SocketAddr,
    outcome: oneshot::Receiver<Result<String>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CallbackServer {
    /// Bind `listen_addr` and start serving the callback route.
    pub async fn start(listen_addr: &str, expected_state: &str) -> Result<Self> {
        if expected_state.is_empty() {
            return Err(Error::InvalidRequest("expected state is required".into()));
        }

        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| Error::Callback(format!("listen on {listen_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Callback(format!("resolve listener address: {e}")))?;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = CallbackState {
            expected_state: Arc::from(expected_state),
            outcome: Arc::new(Mutex::new(Some(outcome_tx))),
        };
        let router = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(state);

        tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "oauth callback server failed");
            }
        });

        info!(%local_addr, "listening for oauth callback");
        Ok(Self {
            local_addr,
            outcome: outcome_rx,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{CALLBACK_PATH}", self.local_addr.port())
    }

    /// Wait for the browser redirect. Fails with [`Error::CallbackTimeout`]
    /// after `timeout`, or [`Error::Cancelled`] when `cancel` fires.
    pub async fn wait_for_code(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            received = tokio::time::timeout(timeout, &mut self.outcome) => match received {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::Callback(
                    "callback server stopped before a code arrived".into(),
                )),
                Err(_) => Err(Error::CallbackTimeout(timeout)),
            },
        };
        self.stop();
        outcome
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    let param = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();

    if param("state") != &*state.expected_state {
        state
            .deliver(Err(Error::Callback("oauth callback state mismatch".into())))
            .await;
        return (StatusCode::BAD_REQUEST, "state mismatch");
    }

    let error = param("error");
    if !error.is_empty() {
        let description = param("error_description");
        let message = if description.is_empty() {
            error.to_owned()
        } else {
            format!("{error}: {description}")
        };
        state.deliver(Err(Error::Callback(message))).await;
        return (StatusCode::BAD_REQUEST, "oauth error");
    }

    let code = param("code");
    if code.is_empty() {
        state
            .deliver(Err(Error::Callback("missing authorization code".into())))
            .await;
        return (StatusCode::BAD_REQUEST, "missing code");
    }

    state.deliver(Ok(code.to_owned())).await;
    (StatusCode::OK, SUCCESS_BODY)
}
