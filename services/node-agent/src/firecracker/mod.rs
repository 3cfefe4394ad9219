//! Firecracker microVM control.
//!
//! ## Components
//!
//! - `api`: HTTP client for Firecracker's Unix socket API
//! - `config`: VM configuration structures (boot, drives, network, vsock)

mod api;
mod config;

pub use api::{wait_for_socket, ApiError, FirecrackerClient, InstanceInfo};
pub use config::{
    function_boot_args, BootSource, BootSpec, DriveConfig, NetworkInterface, VsockConfig,
    GUEST_CID, NETWORK_INTERFACE_ID,
};
