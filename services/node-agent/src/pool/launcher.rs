//! Starting and booting microVM processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use super::supervisor::VmProcess;
use crate::firecracker::{
    wait_for_socket, ApiError, BootSource, BootSpec, DriveConfig, FirecrackerClient,
    NetworkInterface, VsockConfig, GUEST_CID, NETWORK_INTERFACE_ID,
};
use crate::network::NetworkEntry;

/// Interval between control-socket existence checks.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from launching or booting a VM.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("VMM binary not found at {0}")]
    BinaryNotFound(PathBuf),

    #[error("failed to start VM process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("VM API error: {0}")]
    Api(#[from] ApiError),
}

/// A started, not yet booted VM.
#[derive(Debug)]
pub struct LaunchedVm {
    /// Supervised VMM process.
    pub process: VmProcess,
    /// Control API socket.
    pub api_socket: PathBuf,
    /// Host side of the vsock device. The bridge listens on `{vsock_uds}_80`.
    pub vsock_uds: PathBuf,
}

/// Starts VMM processes and drives their control API.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    /// Start a VMM process for `vm_id`, attach its NIC and vsock device.
    async fn launch(&self, vm_id: &str, network: &NetworkEntry) -> Result<LaunchedVm, LaunchError>;

    /// Configure drives and boot source of a launched VM, then start it.
    async fn boot(&self, api_socket: &Path, spec: &BootSpec) -> Result<(), LaunchError>;
}

/// Launcher settings.
#[derive(Debug, Clone)]
pub struct FirecrackerLauncherConfig {
    pub firecracker_path: PathBuf,
    pub work_dir: PathBuf,
    pub extra_args: Vec<String>,
    pub startup_timeout: Duration,
    /// Grace period when killing a process whose devices failed to attach.
    pub kill_grace: Duration,
}

/// Launches Firecracker processes.
pub struct FirecrackerLauncher {
    config: FirecrackerLauncherConfig,
}

impl FirecrackerLauncher {
    pub fn new(config: FirecrackerLauncherConfig) -> Self {
        Self { config }
    }

    async fn attach_devices(
        &self,
        client: &FirecrackerClient,
        vm_id: &str,
        network: &NetworkEntry,
    ) -> Result<(), ApiError> {
        client
            .put_network_interface(&NetworkInterface::new(
                NETWORK_INTERFACE_ID,
                &network.tap_device,
            ))
            .await?;

        // Relative to the process working directory.
        let uds = PathBuf::from(format!("./v-{}.sock", vm_id));
        client.put_vsock(&VsockConfig::new(GUEST_CID, uds)).await
    }
}

#[async_trait]
impl VmLauncher for FirecrackerLauncher {
    async fn launch(&self, vm_id: &str, network: &NetworkEntry) -> Result<LaunchedVm, LaunchError> {
        if !self.config.firecracker_path.exists() {
            return Err(LaunchError::BinaryNotFound(self.config.firecracker_path.clone()));
        }

        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let api_socket = self.config.work_dir.join(format!("fc-{}.sock", vm_id));
        let vsock_uds = self.config.work_dir.join(format!("v-{}.sock", vm_id));

        let mut command = Command::new(&self.config.firecracker_path);
        command
            .args(&self.config.extra_args)
            .arg("--api-sock")
            .arg(&api_socket)
            .current_dir(&self.config.work_dir);

        let process = VmProcess::spawn(command, vm_id)?;

        let ready = wait_for_socket(
            &api_socket,
            self.config.startup_timeout.max(Duration::from_secs(1)),
            SOCKET_POLL_INTERVAL,
        )
        .await;
        if !ready {
            warn!(
                vm_id = %vm_id,
                socket = %api_socket.display(),
                "API socket not ready after startup timeout, continuing"
            );
        }

        let client = FirecrackerClient::new(&api_socket);
        if let Err(e) = self.attach_devices(&client, vm_id, network).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to attach VM devices");
            process.kill(self.config.kill_grace).await;
            if let Err(err) = tokio::fs::remove_file(&api_socket).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(socket = %api_socket.display(), error = %err, "Failed to remove API socket");
                }
            }
            return Err(e.into());
        }

        info!(
            vm_id = %vm_id,
            pid = ?process.pid(),
            socket = %api_socket.display(),
            tap = %network.tap_device,
            "Started Firecracker process"
        );

        Ok(LaunchedVm {
            process,
            api_socket,
            vsock_uds,
        })
    }

    async fn boot(&self, api_socket: &Path, spec: &BootSpec) -> Result<(), LaunchError> {
        let client = FirecrackerClient::new(api_socket);

        client.put_drive(&DriveConfig::rootfs(spec.rootfs.clone())).await?;
        client.put_drive(&DriveConfig::overlayfs(spec.overlay.clone())).await?;
        client
            .put_boot_source(&BootSource::for_function(
                spec.kernel.clone(),
                spec.guest_ip,
                spec.host_ip,
            ))
            .await?;
        client.start_instance().await?;

        Ok(())
    }
}
