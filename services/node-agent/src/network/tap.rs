//! TAP device creation and removal.
//!
//! Host-side setup for one VM:
//! - TAP device named `tap{n}-{r}` (at most 15 chars, IFNAMSIZ - 1)
//! - Host address `{host_ip}/30` assigned to the device
//! - Link up

use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner};

/// Maximum Linux interface name length.
pub const MAX_TAP_NAME_LEN: usize = 15;

/// Build a TAP device name from a sequence number and a random suffix.
pub fn tap_name(seq: u32, suffix: u32) -> String {
    format!("tap{}-{}", seq % 10_000_000, suffix % 1000)
}

/// Create a TAP device, assign the host address and bring it up.
///
/// The device is deleted again if any step after creation fails.
pub async fn create_tap(
    runner: &dyn CommandRunner,
    tap: &str,
    host_ip: Ipv4Addr,
) -> Result<(), CommandError> {
    info!(tap = %tap, host_ip = %host_ip, "Creating TAP device");

    runner.run("ip", &["tuntap", "add", tap, "mode", "tap"]).await?;

    let address = format!("{}/30", host_ip);
    let configured = async {
        runner.run("ip", &["addr", "add", &address, "dev", tap]).await?;
        runner.run("ip", &["link", "set", tap, "up"]).await
    }
    .await;

    if let Err(e) = configured {
        delete_tap(runner, tap).await;
        return Err(e);
    }

    debug!(tap = %tap, "TAP device created and configured");
    Ok(())
}

/// Delete a TAP device, logging failures.
pub async fn delete_tap(runner: &dyn CommandRunner, tap: &str) {
    if let Err(e) = runner.run("ip", &["link", "del", tap]).await {
        warn!(tap = %tap, error = %e, "Failed to delete TAP device");
    } else {
        debug!(tap = %tap, "TAP device deleted");
    }
}
