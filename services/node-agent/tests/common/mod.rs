//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use mango_node_agent::firecracker::BootSpec;
use mango_node_agent::models::InvocationResponse;
use mango_node_agent::network::{NetworkEntry, NetworkSetup, NetworkSetupError};
use mango_node_agent::pool::{
    LaunchError, LaunchedVm, Lease, PoolConfig, ProcessPool, VmLauncher, VmProcess,
};
use mango_node_agent::reader::{ReplyError, ReplySink};
use mango_node_agent::PendingRequestStore;

/// Hands out distinct address pairs and counts teardowns.
#[derive(Default)]
pub struct FakeNetwork {
    next: AtomicU32,
    pub destroyed: AtomicUsize,
    pub exhausted: AtomicBool,
}

#[async_trait]
impl NetworkSetup for FakeNetwork {
    async fn initialize(&self) -> Result<(), NetworkSetupError> {
        Ok(())
    }

    async fn setup(&self, _vm_id: &str) -> Result<NetworkEntry, NetworkSetupError> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(NetworkSetupError::NoFreeSubnet);
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let base = u32::from(Ipv4Addr::new(172, 16, 0, 0)) + n * 4;
        Ok(NetworkEntry {
            host_ip: Ipv4Addr::from(base + 1),
            guest_ip: Ipv4Addr::from(base + 2),
            tap_device: format!("tap{}-0", n),
            pool_name: format!("pool-{}/30", Ipv4Addr::from(base)),
        })
    }

    async fn destroy(&self, _entry: &NetworkEntry) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Launches `sleep` in place of a VMM and records boots.
pub struct FakeLauncher {
    dir: PathBuf,
    program: Mutex<(String, String)>,
    pub launched: AtomicUsize,
    pub boots: Mutex<Vec<BootSpec>>,
    pub fail_boot: AtomicBool,
}

impl FakeLauncher {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            program: Mutex::new(("sleep".to_string(), "300".to_string())),
            launched: AtomicUsize::new(0),
            boots: Mutex::new(Vec::new()),
            fail_boot: AtomicBool::new(false),
        }
    }

    /// Make future launches start a process that exits at once.
    pub fn short_lived(&self) {
        *self.program.lock().unwrap() = ("sleep".to_string(), "0".to_string());
    }

    /// Make future launches fail to spawn.
    pub fn broken(&self) {
        *self.program.lock().unwrap() = ("/nonexistent/firecracker".to_string(), String::new());
    }

    pub fn boot_count(&self) -> usize {
        self.boots.lock().unwrap().len()
    }
}

#[async_trait]
impl VmLauncher for FakeLauncher {
    async fn launch(&self, vm_id: &str, _network: &NetworkEntry) -> Result<LaunchedVm, LaunchError> {
        let (program, arg) = self.program.lock().unwrap().clone();
        let mut command = Command::new(program);
        command.arg(arg);
        let process = VmProcess::spawn(command, vm_id)?;
        self.launched.fetch_add(1, Ordering::SeqCst);

        Ok(LaunchedVm {
            process,
            api_socket: self.dir.join(format!("fc-{}.sock", vm_id)),
            vsock_uds: self.dir.join(format!("v-{}.sock", vm_id)),
        })
    }

    async fn boot(&self, _api_socket: &Path, spec: &BootSpec) -> Result<(), LaunchError> {
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err(LaunchError::BinaryNotFound(PathBuf::from("/nonexistent")));
        }
        self.boots.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

/// Captures produced replies.
#[derive(Default)]
pub struct RecordingReplies {
    pub sent: Mutex<Vec<SentReply>>,
}

#[derive(Debug, Clone)]
pub struct SentReply {
    pub topic: String,
    pub key: String,
    pub correlation_id: String,
    pub response: InvocationResponse,
}

#[async_trait]
impl ReplySink for RecordingReplies {
    async fn send_reply(
        &self,
        topic: &str,
        key: &str,
        correlation_id: &str,
        response: &InvocationResponse,
    ) -> Result<(), ReplyError> {
        self.sent.lock().unwrap().push(SentReply {
            topic: topic.to_string(),
            key: key.to_string(),
            correlation_id: correlation_id.to_string(),
            response: response.clone(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub network: Arc<FakeNetwork>,
    pub launcher: Arc<FakeLauncher>,
    pub store: Arc<PendingRequestStore>,
    pub pool: Arc<ProcessPool>,
}

pub fn pool_config(max_pool_size: usize, idle_timeout: Duration) -> PoolConfig {
    PoolConfig {
        max_pool_size,
        idle_timeout,
        prewarm_count: 2,
        kill_grace: Duration::from_secs(2),
    }
}

pub fn harness(config: PoolConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::default());
    let launcher = Arc::new(FakeLauncher::new(dir.path()));
    let store = Arc::new(PendingRequestStore::new(4));
    let pool = ProcessPool::new(config, network.clone(), launcher.clone(), store.clone());
    Harness {
        dir,
        network,
        launcher,
        store,
        pool,
    }
}

/// Boot `lease` with placeholder images.
pub async fn boot(lease: &Lease) {
    let network = lease.network();
    let spec = BootSpec {
        kernel: PathBuf::from("/images/vmlinux"),
        rootfs: PathBuf::from("/images/rootfs.ext4"),
        overlay: PathBuf::from("/overlays/overlay.ext4"),
        guest_ip: network.guest_ip,
        host_ip: network.host_ip,
    };
    lease.boot(&spec).await.unwrap();
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
