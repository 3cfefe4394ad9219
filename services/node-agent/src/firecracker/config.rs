//! Firecracker VM configuration structures.
//!
//! These map to the Firecracker API objects used to bring up a function VM:
//! boot source, drives, network interface and vsock.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Interface id of the single guest NIC.
pub const NETWORK_INTERFACE_ID: &str = "net1";

/// Guest context id of the vsock device.
pub const GUEST_CID: u32 = 3;

/// Boot source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the kernel image.
    pub kernel_image_path: PathBuf,
    /// Kernel boot arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

impl BootSource {
    /// Boot source for a function VM with a static guest IP.
    pub fn for_function(kernel_image_path: PathBuf, guest_ip: Ipv4Addr, host_ip: Ipv4Addr) -> Self {
        Self {
            kernel_image_path,
            boot_args: Some(function_boot_args(guest_ip, host_ip)),
        }
    }
}

/// Kernel command line for a function VM.
///
/// The guest gets its address through the kernel `ip=` parameter with the
/// host side of the /30 as gateway, and mounts the writable overlay drive
/// on top of the read-only runtime root.
pub fn function_boot_args(guest_ip: Ipv4Addr, host_ip: Ipv4Addr) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:255.255.255.252::eth0:off init=/sbin/overlay-init overlay_root=/vdb",
        guest_ip, host_ip
    )
}

/// Block device (drive) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier.
    pub drive_id: String,
    /// Path to the drive image file.
    pub path_on_host: PathBuf,
    /// Whether this is the root device.
    pub is_root_device: bool,
    /// Whether the drive is read-only.
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Shared runtime root filesystem (vda), read-only.
    pub fn rootfs(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: true,
        }
    }

    /// Per-VM copy of the function overlay (vdb), writable.
    pub fn overlayfs(path: PathBuf) -> Self {
        Self {
            drive_id: "overlayfs".to_string(),
            path_on_host: path,
            is_root_device: false,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Unique interface identifier.
    pub iface_id: String,
    /// Host device name (tap device).
    pub host_dev_name: String,
    /// Guest MAC address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

impl NetworkInterface {
    /// Create a new network interface configuration.
    pub fn new(iface_id: &str, host_dev_name: &str) -> Self {
        Self {
            iface_id: iface_id.to_string(),
            host_dev_name: host_dev_name.to_string(),
            guest_mac: None,
        }
    }
}

/// Vsock device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Vsock context ID (CID) for the guest.
    pub guest_cid: u32,
    /// Path to the Unix domain socket, relative to the Firecracker working directory.
    pub uds_path: PathBuf,
}

impl VsockConfig {
    /// Create a new vsock configuration.
    pub fn new(guest_cid: u32, uds_path: PathBuf) -> Self {
        Self {
            guest_cid,
            uds_path,
        }
    }
}

/// Everything the dispatcher needs to boot a cold VM.
#[derive(Debug, Clone)]
pub struct BootSpec {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub overlay: PathBuf,
    pub guest_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
}
