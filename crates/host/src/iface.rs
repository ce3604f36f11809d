//! Interface bring-up helper
//!
//! Addresses, routes and NAT for the tunnel are left to an external script,
//! invoked once after the TUN device exists.

use protocol::{PREFIX_LEN, Subnet};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use thiserror::Error;
use tracing::info;

/// Platform argument passed first to the script
pub const PLATFORM: &str = "linux";

#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("cannot run {}: {source}", script.display())]
    Spawn {
        script: PathBuf,
        source: std::io::Error,
    },

    #[error("{} failed with {status}", script.display())]
    Failed { script: PathBuf, status: ExitStatus },
}

/// `<script> linux <tun> <network> <host> <prefix> <upstream>`
pub fn iface_up_command(script: &Path, tun_name: &str, subnet: &Subnet, upstream: &str) -> Command {
    let mut command = Command::new(script);
    command
        .arg(PLATFORM)
        .arg(tun_name)
        .arg(subnet.network_address().to_string())
        .arg(subnet.host_address().to_string())
        .arg(PREFIX_LEN.to_string())
        .arg(upstream);
    command
}

/// Run the bring-up script; a nonzero exit is an error
pub fn iface_up(script: &Path, tun_name: &str, subnet: &Subnet, upstream: &str) -> Result<(), IfaceError> {
    let status = iface_up_command(script, tun_name, subnet, upstream)
        .status()
        .map_err(|source| IfaceError::Spawn {
            script: script.to_path_buf(),
            source,
        })?;

    if !status.success() {
        return Err(IfaceError::Failed {
            script: script.to_path_buf(),
            status,
        });
    }

    info!(
        "Configured {} as {}/{} via {}",
        tun_name,
        subnet.host_address(),
        PREFIX_LEN,
        upstream
    );
    Ok(())
}
