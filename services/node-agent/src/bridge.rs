//! Local HTTP bridge between a VM and the pending request store.
//!
//! Each VM gets its own server on the Unix socket Firecracker connects
//! guest vsock port 80 to. Endpoints:
//!
//! - `GET /next`: long-poll for the next invocation of the function the VM
//!   is currently bound to
//! - `POST /response?correlationId=...`: deliver a result; 204 when it
//!   matched an in-flight request, 404 otherwise

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::UnixListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::InvocationResponse;
use crate::store::PendingRequestStore;

/// How long a stopping bridge may finish in-flight requests before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct BridgeState {
    store: Arc<PendingRequestStore>,
    function_key: watch::Receiver<String>,
    vm_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseParams {
    correlation_id: Option<String>,
}

/// Socket path the bridge listens on for a VM's vsock UDS.
pub fn bridge_socket_path(vsock_uds: &Path) -> PathBuf {
    let mut path = vsock_uds.as_os_str().to_owned();
    path.push("_80");
    PathBuf::from(path)
}

/// Build the bridge router.
fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/next", get(next))
        .route("/response", post(response))
        .with_state(state)
}

async fn next(State(state): State<BridgeState>) -> Response {
    let mut key_rx = state.function_key.clone();

    // A generic VM can be bound to a function while it is already polling,
    // so the wait restarts whenever the binding changes.
    loop {
        let key = key_rx.borrow_and_update().clone();
        tokio::select! {
            result = state.store.dequeue(&key) => {
                return match result {
                    Ok(invocation) => {
                        debug!(
                            vm_id = %state.vm_id,
                            correlation_id = %invocation.correlation_id,
                            "Handing invocation to VM"
                        );
                        Json(invocation).into_response()
                    }
                    Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
                };
            }
            changed = key_rx.changed() => {
                if changed.is_err() {
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                }
            }
        }
    }
}

async fn response(
    State(state): State<BridgeState>,
    Query(params): Query<ResponseParams>,
    body: Bytes,
) -> StatusCode {
    let Some(correlation_id) = params.correlation_id.filter(|id| !id.is_empty()) else {
        return StatusCode::BAD_REQUEST;
    };

    info!(vm_id = %state.vm_id, correlation_id = %correlation_id, "Received response from VM");

    let response = match serde_json::from_slice::<InvocationResponse>(&body) {
        Ok(response) => response,
        Err(e) => {
            warn!(
                vm_id = %state.vm_id,
                correlation_id = %correlation_id,
                error = %e,
                "Malformed response from VM"
            );
            InvocationResponse::bad_gateway("function returned a malformed response")
        }
    };

    if state.store.try_complete(&correlation_id, response) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// A running bridge server.
#[derive(Debug)]
pub struct BridgeServer {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl BridgeServer {
    /// Bind `socket_path` and start serving `vm_id`'s poll/callback traffic.
    pub async fn start(
        socket_path: PathBuf,
        vm_id: &str,
        store: Arc<PendingRequestStore>,
        function_key: watch::Receiver<String>,
    ) -> std::io::Result<Self> {
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let state = BridgeState {
            store,
            function_key,
            vm_id: vm_id.to_string(),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "VM bridge server error");
            }
        });

        debug!(vm_id = %vm_id, socket = %socket_path.display(), "VM bridge listening");

        Ok(Self {
            socket_path,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Socket the bridge is bound to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop the server and remove its socket. Never fails.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            // Long-polling `/next` requests keep a graceful shutdown pending.
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), error = %e, "Failed to remove bridge socket");
            }
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_socket_path() {
        let path = bridge_socket_path(Path::new("/tmp/fc/v-abc.sock"));
        assert_eq!(path, PathBuf::from("/tmp/fc/v-abc.sock_80"));
    }
}
