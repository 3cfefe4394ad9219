//! Exclusive, temporary use of a pooled VM.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::handle::ProcessHandle;
use super::launcher::LaunchError;
use super::ProcessPool;
use crate::firecracker::BootSpec;
use crate::network::NetworkEntry;

/// A leased VM. Return it with [`Lease::release`] or [`Lease::invalidate`].
///
/// A lease dropped without either is handled in the background: a VM that
/// finished booting goes back to the pool, any other VM is destroyed.
pub struct Lease {
    pool: Arc<ProcessPool>,
    handle: Arc<ProcessHandle>,
    warm: bool,
    returned: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.handle.id())
            .field("warm", &self.warm)
            .finish()
    }
}

impl Lease {
    pub(crate) fn new(pool: Arc<ProcessPool>, handle: Arc<ProcessHandle>, warm: bool) -> Self {
        Self {
            pool,
            handle,
            warm,
            returned: false,
        }
    }

    /// Whether the VM is already booted for the requested function.
    pub fn is_warm(&self) -> bool {
        self.warm
    }

    /// Leased handle.
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    /// Handle id.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Firecracker control API socket.
    pub fn api_socket(&self) -> &Path {
        self.handle.api_socket()
    }

    /// Network assigned to the VM.
    pub fn network(&self) -> &NetworkEntry {
        self.handle.network()
    }

    /// Configure and start the VM through the pool's launcher.
    pub async fn boot(&self, spec: &BootSpec) -> Result<(), LaunchError> {
        self.pool.launcher().boot(self.handle.api_socket(), spec).await?;
        self.handle.mark_configured();
        Ok(())
    }

    /// Keep `resource` alive for the lifetime of the VM.
    pub fn attach(&self, resource: impl Any + Send + Sync) {
        self.handle.attach(Box::new(resource));
    }

    /// Return the VM to the pool.
    pub async fn release(mut self) {
        self.returned = true;
        self.pool.release(&self.handle, false).await;
    }

    /// Destroy the VM instead of returning it.
    pub async fn invalidate(mut self) {
        self.returned = true;
        self.pool.release(&self.handle, true).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }

        let pool = self.pool.clone();
        let handle = self.handle.clone();
        let kill = !handle.is_configured();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                if kill {
                    debug!(handle_id = %handle.id(), "Lease dropped before boot, destroying VM");
                }
                runtime.spawn(async move { pool.release(&handle, kill).await });
            }
            Err(_) => warn!(handle_id = %handle.id(), "Lease dropped outside a runtime"),
        }
    }
}
