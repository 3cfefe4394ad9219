//! Firecracker HTTP API client.
//!
//! This module provides an HTTP client for Firecracker's Unix socket API.
//! It handles configuration of the microVM before boot and instance actions.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use super::config::{BootSource, DriveConfig, NetworkInterface, VsockConfig};

/// Default timeout for a single API call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the Firecracker API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request to {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },
}

/// Firecracker API client for Unix socket communication.
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    timeout: Duration,
}

impl FirecrackerClient {
    /// Create a new Firecracker client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Configure the boot source (kernel, boot args).
    pub async fn put_boot_source(&self, config: &BootSource) -> Result<(), ApiError> {
        self.put("/boot-source", config).await
    }

    /// Add or update a drive.
    pub async fn put_drive(&self, config: &DriveConfig) -> Result<(), ApiError> {
        let path = format!("/drives/{}", config.drive_id);
        self.put(&path, config).await
    }

    /// Add or update a network interface.
    pub async fn put_network_interface(&self, config: &NetworkInterface) -> Result<(), ApiError> {
        let path = format!("/network-interfaces/{}", config.iface_id);
        self.put(&path, config).await
    }

    /// Configure vsock device.
    pub async fn put_vsock(&self, config: &VsockConfig) -> Result<(), ApiError> {
        self.put("/vsock", config).await
    }

    /// Start the microVM instance.
    pub async fn start_instance(&self) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.put("/actions", &Action { action_type: "InstanceStart" }).await
    }

    /// Get instance info.
    pub async fn get_instance_info(&self) -> Result<InstanceInfo, ApiError> {
        self.get("/").await
    }

    /// Perform a PUT request.
    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body_bytes = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "PUT request to Firecracker API");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body_bytes))?;

        let response = self.send(path, request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            error!(status = %status, path = path, message = %message, "Firecracker API error");
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Perform a GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "GET request to Firecracker API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.send(path, request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            let result = serde_json::from_reader(body.reader())?;
            Ok(result)
        } else {
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn send(
        &self,
        path: &str,
        request: Request<Body>,
    ) -> Result<hyper::Response<Body>, ApiError> {
        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ApiError::Timeout {
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Instance information from Firecracker.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InstanceInfo {
    /// Application name.
    pub app_name: String,
    /// Instance ID.
    pub id: String,
    /// State of the instance.
    pub state: String,
    /// VMM version.
    pub vmm_version: String,
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Poll until `socket_path` exists or `timeout` elapses.
///
/// Returns whether the socket appeared.
pub async fn wait_for_socket(socket_path: &Path, timeout: Duration, interval: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if socket_path.exists() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
