//! Pool of microVM processes.
//!
//! The pool hands out VMs keyed by function, preferring reuse:
//!
//! 1. An idle VM already booted for the function (warm, no configuration)
//! 2. An idle generic VM, rebound to the function (cold, needs boot)
//! 3. A new VM: network, VMM process, devices and bridge (cold)
//!
//! Availability wins over the size limit: when nothing idle fits, a VM is
//! created even above `max_pool_size`, and the surplus is destroyed on
//! release. A background reclaimer destroys function-bound VMs idle past
//! the timeout and drains VMs whose process exited. Generic idle VMs are
//! kept as the prewarm buffer.
//!
//! All idle queues sit behind one mutex taken by acquisition, release and
//! the reclaimer, so a handle is never lost or queued twice.

mod handle;
mod launcher;
mod lease;
mod supervisor;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bridge::{bridge_socket_path, BridgeServer};
use crate::network::{NetworkSetup, NetworkSetupError};
use crate::store::PendingRequestStore;

pub use handle::{HandleState, ProcessHandle, GENERIC_KEY};
pub use launcher::{FirecrackerLauncher, FirecrackerLauncherConfig, LaunchError, LaunchedVm, VmLauncher};
pub use lease::Lease;
pub use supervisor::VmProcess;

/// Errors from pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("function key must not be empty")]
    EmptyFunctionKey,

    #[error("network setup failed: {0}")]
    Network(#[from] NetworkSetupError),

    #[error("failed to launch VM: {0}")]
    Launch(#[from] LaunchError),

    #[error("failed to start VM bridge: {0}")]
    Bridge(std::io::Error),
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft cap on the number of VMs.
    pub max_pool_size: usize,
    /// Function-bound idle VMs older than this are destroyed.
    pub idle_timeout: Duration,
    /// Generic VMs started by [`ProcessPool::prewarm`], capped at `max_pool_size`.
    pub prewarm_count: usize,
    /// Grace period when killing a VM process.
    pub kill_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 4,
            idle_timeout: Duration::from_secs(300),
            prewarm_count: 5,
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    /// Reclaimer tick: half the idle timeout, at least five seconds.
    pub fn reclaim_interval(&self) -> Duration {
        (self.idle_timeout / 2).max(Duration::from_secs(5))
    }
}

/// Owns every VM handle on the node.
pub struct ProcessPool {
    config: PoolConfig,
    network: Arc<dyn NetworkSetup>,
    launcher: Arc<dyn VmLauncher>,
    store: Arc<PendingRequestStore>,
    all: DashMap<String, Arc<ProcessHandle>>,
    idle: Mutex<HashMap<String, VecDeque<Arc<ProcessHandle>>>>,
}

impl ProcessPool {
    pub fn new(
        config: PoolConfig,
        network: Arc<dyn NetworkSetup>,
        launcher: Arc<dyn VmLauncher>,
        store: Arc<PendingRequestStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            network,
            launcher,
            store,
            all: DashMap::new(),
            idle: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn launcher(&self) -> &Arc<dyn VmLauncher> {
        &self.launcher
    }

    /// Number of live VMs, leased or idle.
    pub fn size(&self) -> usize {
        self.all.len()
    }

    /// Number of idle VMs queued under `function_key`.
    pub fn idle_count(&self, function_key: &str) -> usize {
        self.idle_queues()
            .get(function_key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Snapshot of every live handle.
    pub fn handles(&self) -> Vec<Arc<ProcessHandle>> {
        self.all.iter().map(|h| h.value().clone()).collect()
    }

    /// Look up a live handle.
    pub fn get(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        self.all.get(id).map(|h| h.value().clone())
    }

    fn idle_queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Arc<ProcessHandle>>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pop an idle handle: one bound to `function_key` first, then a generic one.
    fn pop_idle(&self, function_key: &str) -> Option<(Arc<ProcessHandle>, bool)> {
        let mut idle = self.idle_queues();
        if let Some(handle) = idle.get_mut(function_key).and_then(VecDeque::pop_front) {
            return Some((handle, true));
        }
        idle.get_mut(GENERIC_KEY)
            .and_then(VecDeque::pop_front)
            .map(|handle| (handle, false))
    }

    /// Lease a VM for `function_key`.
    pub async fn acquire(self: &Arc<Self>, function_key: &str) -> Result<Lease, PoolError> {
        if function_key.trim().is_empty() {
            return Err(PoolError::EmptyFunctionKey);
        }

        while let Some((handle, bound)) = self.pop_idle(function_key) {
            if !handle.is_healthy() {
                debug!(handle_id = %handle.id(), "Dropping unhealthy idle VM");
                self.remove(&handle).await;
                continue;
            }
            if !handle.try_lease() {
                // Destroyed concurrently.
                continue;
            }

            if !bound {
                handle.bind(function_key);
            }
            // Bound but never booted: the lease must configure it.
            let warm = bound && handle.is_configured();
            handle.touch();
            debug!(
                handle_id = %handle.id(),
                function_key = %function_key,
                warm = warm,
                "Reusing idle VM"
            );
            return Ok(Lease::new(self.clone(), handle, warm));
        }

        let handle = self.start_new(function_key, HandleState::InUse).await?;
        Ok(Lease::new(self.clone(), handle, false))
    }

    /// Return a leased VM. Unhealthy, killed or surplus VMs are destroyed.
    pub async fn release(&self, handle: &Arc<ProcessHandle>, kill: bool) {
        let surplus = self.all.len() > self.config.max_pool_size;
        if kill || surplus || !handle.is_healthy() {
            debug!(
                handle_id = %handle.id(),
                kill = kill,
                surplus = surplus,
                "Destroying VM on release"
            );
            self.remove(handle).await;
            return;
        }

        let mut idle = self.idle_queues();
        if !handle.try_return() {
            warn!(handle_id = %handle.id(), state = ?handle.state(), "Release of a VM that is not leased");
            return;
        }
        handle.touch();
        idle.entry(handle.function_key())
            .or_default()
            .push_back(handle.clone());
    }

    async fn start_new(
        &self,
        function_key: &str,
        state: HandleState,
    ) -> Result<Arc<ProcessHandle>, PoolError> {
        if self.all.len() >= self.config.max_pool_size {
            warn!(
                size = self.all.len(),
                max = self.config.max_pool_size,
                "Pool at capacity, creating VM anyway"
            );
        }

        let id = ulid::Ulid::new().to_string().to_lowercase();
        let network = self.network.setup(&id).await?;

        let launched = match self.launcher.launch(&id, &network).await {
            Ok(launched) => launched,
            Err(e) => {
                self.network.destroy(&network).await;
                return Err(e.into());
            }
        };

        let (key_tx, key_rx) = watch::channel(function_key.to_string());
        let bridge = match BridgeServer::start(
            bridge_socket_path(&launched.vsock_uds),
            &id,
            self.store.clone(),
            key_rx,
        )
        .await
        {
            Ok(bridge) => bridge,
            Err(e) => {
                launched.process.kill(self.config.kill_grace).await;
                self.network.destroy(&network).await;
                remove_file_quietly(&launched.api_socket).await;
                return Err(PoolError::Bridge(e));
            }
        };

        let handle = Arc::new(ProcessHandle::new(
            id.clone(),
            launched.process,
            launched.api_socket,
            launched.vsock_uds,
            network,
            key_tx,
            Some(bridge),
            state,
        ));
        self.all.insert(id, handle.clone());

        info!(
            handle_id = %handle.id(),
            pid = ?handle.pid(),
            function_key = %function_key,
            size = self.all.len(),
            "Created VM"
        );
        Ok(handle)
    }

    /// Forget a handle and tear it down.
    async fn remove(&self, handle: &Arc<ProcessHandle>) {
        self.all.remove(handle.id());
        self.teardown(handle).await;
    }

    /// Kill the process, stop the bridge, destroy the network and delete
    /// socket files. Runs once per handle and never fails.
    async fn teardown(&self, handle: &ProcessHandle) {
        if !handle.mark_destroyed() {
            return;
        }

        handle.process().kill(self.config.kill_grace).await;
        handle.stop_bridge().await;
        self.network.destroy(handle.network()).await;
        remove_file_quietly(handle.api_socket()).await;
        remove_file_quietly(handle.vsock_uds()).await;
        handle.release_resources();

        info!(handle_id = %handle.id(), "Destroyed VM");
    }

    /// Destroy expired function-bound idle VMs and drain exited ones.
    pub async fn reclaim_idle(&self) {
        let mut doomed = Vec::new();
        {
            let mut idle = self.idle_queues();
            for (key, queue) in idle.iter_mut() {
                queue.retain(|handle| {
                    let expired =
                        key != GENERIC_KEY && handle.idle_for() > self.config.idle_timeout;
                    let keep = !expired
                        && handle.is_healthy()
                        && self.all.contains_key(handle.id());
                    if !keep {
                        doomed.push(handle.clone());
                    }
                    keep
                });
            }
            idle.retain(|_, queue| !queue.is_empty());
        }

        if !doomed.is_empty() {
            info!(count = doomed.len(), "Reclaiming idle VMs");
        }
        for handle in doomed {
            self.remove(&handle).await;
        }
    }

    /// Run the reclaimer until shutdown.
    pub async fn run_reclaimer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.reclaim_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.config.reclaim_interval(), "Starting idle VM reclaimer");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reclaim_idle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Idle VM reclaimer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Start `min(prewarm_count, max_pool_size)` generic idle VMs.
    ///
    /// Returns how many started.
    pub async fn prewarm(&self) -> usize {
        let count = self.config.prewarm_count.min(self.config.max_pool_size);
        let results = join_all((0..count).map(|_| self.start_new(GENERIC_KEY, HandleState::Idle))).await;

        let mut started = 0;
        for result in results {
            match result {
                Ok(handle) => {
                    self.idle_queues()
                        .entry(GENERIC_KEY.to_string())
                        .or_default()
                        .push_back(handle);
                    started += 1;
                }
                Err(e) => error!(error = %e, "Failed to prewarm VM"),
            }
        }

        info!(started = started, requested = count, "Prewarmed VMs");
        started
    }

    /// Best-effort teardown of every VM.
    pub async fn shutdown(&self) {
        let handles = self.handles();
        info!(count = handles.len(), "Shutting down VM pool");

        self.idle_queues().clear();
        join_all(handles.iter().map(|handle| self.remove(handle))).await;
    }
}

async fn remove_file_quietly(path: &std::path::Path) {
    let path: PathBuf = path.to_path_buf();
    if let Err(e) = tokio::fs::remove_file(&path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
