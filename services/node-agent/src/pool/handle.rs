//! Pooled microVM handle.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::supervisor::VmProcess;
use crate::bridge::BridgeServer;
use crate::network::NetworkEntry;

/// Function key of handles not bound to any function.
pub const GENERIC_KEY: &str = "";

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    Idle = 0,
    InUse = 1,
    Destroyed = 2,
}

impl HandleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::InUse,
            _ => Self::Destroyed,
        }
    }
}

/// One microVM process with its control socket, network and bridge.
///
/// State changes go through compare-and-swap, so a handle can never be
/// leased twice or torn down twice.
pub struct ProcessHandle {
    id: String,
    process: VmProcess,
    api_socket: PathBuf,
    vsock_uds: PathBuf,
    network: NetworkEntry,
    state: AtomicU8,
    configured: AtomicBool,
    last_used: Mutex<Instant>,
    function_key: watch::Sender<String>,
    bridge: tokio::sync::Mutex<Option<BridgeServer>>,
    resources: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("function_key", &self.function_key())
            .field("configured", &self.is_configured())
            .field("tap", &self.network.tap_device)
            .finish()
    }
}

impl ProcessHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        process: VmProcess,
        api_socket: PathBuf,
        vsock_uds: PathBuf,
        network: NetworkEntry,
        function_key: watch::Sender<String>,
        bridge: Option<BridgeServer>,
        state: HandleState,
    ) -> Self {
        Self {
            id,
            process,
            api_socket,
            vsock_uds,
            network,
            state: AtomicU8::new(state as u8),
            configured: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
            function_key,
            bridge: tokio::sync::Mutex::new(bridge),
            resources: Mutex::new(Vec::new()),
        }
    }

    /// Handle id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Firecracker control API socket.
    pub fn api_socket(&self) -> &Path {
        &self.api_socket
    }

    /// Host side of the vsock device.
    pub fn vsock_uds(&self) -> &Path {
        &self.vsock_uds
    }

    /// Network assigned to this VM.
    pub fn network(&self) -> &NetworkEntry {
        &self.network
    }

    /// OS process id of the VMM.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Function this VM was last bound to, empty for generic VMs.
    pub fn function_key(&self) -> String {
        self.function_key.borrow().clone()
    }

    /// Receiver following the function binding.
    pub fn subscribe_function_key(&self) -> watch::Receiver<String> {
        self.function_key.subscribe()
    }

    /// Bind this VM to `key`. A rebound VM must be booted again.
    pub(crate) fn bind(&self, key: &str) {
        self.configured.store(false, Ordering::Release);
        self.function_key.send_replace(key.to_string());
    }

    /// Whether the VM finished booting for its bound function.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub(crate) fn mark_configured(&self) {
        self.configured.store(true, Ordering::Release);
    }

    /// A handle is healthy iff its process has not exited.
    pub fn is_healthy(&self) -> bool {
        self.state() != HandleState::Destroyed && !self.process.has_exited()
    }

    /// Time since the handle was last leased or released.
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    pub(crate) fn touch(&self) {
        *self
            .last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    pub(crate) fn try_lease(&self) -> bool {
        self.transition(HandleState::Idle, HandleState::InUse)
    }

    pub(crate) fn try_return(&self) -> bool {
        self.transition(HandleState::InUse, HandleState::Idle)
    }

    /// Mark destroyed. Returns `false` if another caller already did.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.state.swap(HandleState::Destroyed as u8, Ordering::AcqRel)
            != HandleState::Destroyed as u8
    }

    fn transition(&self, from: HandleState, to: HandleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Keep `resource` alive until the VM is torn down.
    pub fn attach(&self, resource: Box<dyn Any + Send + Sync>) {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(resource);
    }

    /// Number of attached resources.
    pub fn resource_count(&self) -> usize {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub(crate) fn process(&self) -> &VmProcess {
        &self.process
    }

    pub(crate) async fn stop_bridge(&self) {
        if let Some(mut bridge) = self.bridge.lock().await.take() {
            bridge.stop().await;
        }
    }

    pub(crate) fn release_resources(&self) {
        let resources = std::mem::take(
            &mut *self
                .resources
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        drop(resources);
    }
}
