//! Network setup for microVM instances.
//!
//! Every VM gets a dedicated /30 carved from the configured subnet: one
//! address for the host end of a TAP device, one for the guest. Outbound
//! traffic from `tap+` devices is forwarded and masqueraded on the egress
//! interface.

mod setup;
mod tap;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::CommandError;

pub use setup::IpTablesNetworkSetup;
pub use tap::{tap_name, MAX_TAP_NAME_LEN};

/// Network resources assigned to one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    /// Host end of the point-to-point link, also the guest's gateway.
    pub host_ip: Ipv4Addr,
    /// Address configured inside the guest.
    pub guest_ip: Ipv4Addr,
    /// TAP device backing the guest NIC.
    pub tap_device: String,
    /// IPAM child pool both addresses came from.
    pub pool_name: String,
}

/// Errors from network setup.
#[derive(Debug, Error)]
pub enum NetworkSetupError {
    #[error("no free subnet available for a new VM")]
    NoFreeSubnet,

    #[error("IPAM error: {0}")]
    Ipam(#[from] mango_ipam::IpamError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),
}

/// Creates and destroys per-VM network resources.
#[async_trait]
pub trait NetworkSetup: Send + Sync {
    /// Install host-wide forwarding and NAT rules. Called once at startup.
    async fn initialize(&self) -> Result<(), NetworkSetupError>;

    /// Allocate an address pair and create a TAP device for a new VM.
    async fn setup(&self, vm_id: &str) -> Result<NetworkEntry, NetworkSetupError>;

    /// Remove the TAP device and return the addresses. Never fails.
    async fn destroy(&self, entry: &NetworkEntry);
}
