//! iptables-based network setup backed by the IP pool manager.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mango_ipam::IpPoolManager;
use tracing::{info, warn};

use super::tap::{create_tap, delete_tap, tap_name};
use super::{NetworkEntry, NetworkSetup, NetworkSetupError};
use crate::command::CommandRunner;

/// Name of the pool the configured subnet is registered under.
const ROOT_POOL: &str = "pool";

/// Prefix of every per-VM child pool: network, broadcast, host and guest.
const VM_SUBNET_PREFIX: u8 = 30;

/// Network setup using TAP devices, `ip` and `iptables-nft`.
pub struct IpTablesNetworkSetup {
    ipam: Arc<IpPoolManager>,
    runner: Arc<dyn CommandRunner>,
    egress_interface: String,
    /// Serializes pool selection with allocation so two VMs never race for
    /// the last addresses of the same child pool.
    allocation: Mutex<()>,
    tap_seq: AtomicU32,
}

impl IpTablesNetworkSetup {
    /// Register `subnet` and split it into per-VM /30 pools.
    pub fn new(
        ipam: Arc<IpPoolManager>,
        runner: Arc<dyn CommandRunner>,
        subnet: &str,
        egress_interface: &str,
    ) -> Result<Self, NetworkSetupError> {
        ipam.add_pool(ROOT_POOL, subnet, &[])?;
        let pools = ipam.split_into_sub_pools(ROOT_POOL, VM_SUBNET_PREFIX, false)?;
        info!(subnet = %subnet, pools = pools.len(), "Prepared per-VM subnets");

        Ok(Self {
            ipam,
            runner,
            egress_interface: egress_interface.to_string(),
            allocation: Mutex::new(()),
            tap_seq: AtomicU32::new(0),
        })
    }

    fn allocate_pair(&self) -> Result<NetworkEntry, NetworkSetupError> {
        let _guard = self
            .allocation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let pool = self
            .ipam
            .find_available_pool(2)
            .ok_or(NetworkSetupError::NoFreeSubnet)?;

        let host_ip = self.ipam.allocate(&pool)?;
        let guest_ip = match self.ipam.allocate(&pool) {
            Ok(ip) => ip,
            Err(e) => {
                let _ = self.ipam.release_all(&pool);
                return Err(e.into());
            }
        };

        let seq = self.tap_seq.fetch_add(1, Ordering::Relaxed);
        Ok(NetworkEntry {
            host_ip,
            guest_ip,
            tap_device: tap_name(seq, rand::random_range(0..1000)),
            pool_name: pool,
        })
    }

    /// Append `rule` to `chain`. Any identical rule is deleted first so
    /// restarts do not stack duplicates.
    async fn replace_rule(&self, table: &str, chain: &str, rule: &[&str]) -> Result<(), NetworkSetupError> {
        let args = |op: &'static str| {
            let mut args = vec!["-t", table, op, chain];
            args.extend_from_slice(rule);
            args
        };
        let _ = self.runner.run("iptables-nft", &args("-D")).await;
        self.runner.run("iptables-nft", &args("-A")).await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkSetup for IpTablesNetworkSetup {
    async fn initialize(&self) -> Result<(), NetworkSetupError> {
        let egress = self.egress_interface.as_str();

        // New outbound connections from any VM, and their return traffic.
        self.replace_rule(
            "filter",
            "FORWARD",
            &["-i", "tap+", "-o", egress, "-m", "conntrack", "--ctstate", "NEW", "-j", "ACCEPT"],
        )
        .await?;
        self.replace_rule(
            "filter",
            "FORWARD",
            &["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
        )
        .await?;
        self.replace_rule("nat", "POSTROUTING", &["-o", egress, "-j", "MASQUERADE"])
            .await?;

        info!(egress = %egress, "Host forwarding and NAT rules installed");
        Ok(())
    }

    async fn setup(&self, vm_id: &str) -> Result<NetworkEntry, NetworkSetupError> {
        let entry = self.allocate_pair()?;

        info!(
            vm_id = %vm_id,
            host_ip = %entry.host_ip,
            guest_ip = %entry.guest_ip,
            tap = %entry.tap_device,
            "Assigning VM network"
        );

        if let Err(e) = create_tap(self.runner.as_ref(), &entry.tap_device, entry.host_ip).await {
            if let Err(release_err) = self.ipam.release_all(&entry.pool_name) {
                warn!(pool = %entry.pool_name, error = %release_err, "Failed to release VM subnet");
            }
            return Err(e.into());
        }

        Ok(entry)
    }

    async fn destroy(&self, entry: &NetworkEntry) {
        delete_tap(self.runner.as_ref(), &entry.tap_device).await;
        if let Err(e) = self.ipam.release_all(&entry.pool_name) {
            warn!(pool = %entry.pool_name, error = %e, "Failed to release VM subnet");
        }
    }
}
