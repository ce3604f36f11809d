//! simple-rt
//!
//! Shares this machine's network connection with Android phones plugged in
//! over USB.

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::{RelayBridge, RelayCommand, RelayEvent, create_relay_bridge, setup_logging};
use host::config::HostConfig;
use host::lock::InstanceLock;
use host::relay::tun::TUN_PATH;
use host::relay::{LinuxTun, RelayEngine, TunnelDevice, is_tun_present};
use host::session::{SessionContext, SessionTable};
use host::{Dispatcher, SessionSupervisor, iface, resolver, spawn_usb_worker, usb};
use protocol::is_accessory_mode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "simple-rt")]
#[command(
    author,
    version,
    about = "SimpleRT - Reverse tethering for Android over USB"
)]
#[command(long_about = "
Shares the host's internet connection with Android phones connected over USB.
Each phone is switched into accessory mode, handed an address in a private
/24 network and relayed through a TUN interface.

EXAMPLES:
    # Share eth0 using the default nameserver
    sudo simple-rt -i eth0

    # Share wlan0 with the host's own resolver
    sudo simple-rt -i wlan0 -n local

    # List USB devices and exit
    simple-rt --list-devices

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/simple-rt/host.toml
    3. /etc/simple-rt/host.toml
    4. Built-in defaults

    Command-line flags override the configuration file.
")]
struct Args {
    /// Upstream network interface to share
    #[arg(short, long, value_name = "IFACE")]
    interface: Option<String>,

    /// Nameserver for accessories (IPv4 address, or "local" for the system resolver)
    #[arg(short, long, value_name = "ADDR")]
    nameserver: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    if let Some(interface) = args.interface {
        config.host.interface = interface;
    }
    if let Some(nameserver) = args.nameserver {
        config.host.nameserver = nameserver;
    }
    if let Some(log_level) = args.log_level {
        config.host.log_level = log_level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.host.log_level).context("Failed to setup logging")?;

    info!("simple-rt v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.host.log_level);

    if args.list_devices {
        return list_devices();
    }

    run(config).await
}

/// List USB devices and exit
fn list_devices() -> Result<()> {
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let devices = usb::enumerate(&context).context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let mode = if is_accessory_mode(device.vendor_id, device.product_id) {
            "  [accessory]"
        } else {
            ""
        };
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}{}",
            device.vendor_id, device.product_id, device.bus, device.address, mode
        );
    }

    Ok(())
}

async fn run(config: HostConfig) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("simple-rt must be run as root");
    }
    if !is_tun_present() {
        bail!("TUN is not available: {} does not exist", TUN_PATH);
    }
    let _lock = InstanceLock::acquire(&config.lock_path())
        .context("Failed to acquire the single-instance lock")?;

    let nameserver = resolver::resolve_nameserver(&config.host.nameserver)
        .context("Failed to resolve nameserver")?;
    let subnet = config.network.subnet;

    let tun = LinuxTun::open(None).context("Failed to create TUN device")?;
    let tun_name = tun.name().to_string();
    iface::iface_up(
        &config.iface_up_script(),
        &tun_name,
        &subnet,
        &config.host.interface,
    )
    .context("Failed to bring up the tunnel interface")?;

    let (bridge, worker) = create_relay_bridge();
    let events = worker.event_sink();

    let table = Arc::new(SessionTable::new());
    let engine = RelayEngine::new(Arc::new(tun), table.clone(), config.relay_settings());
    let tun_handle = engine
        .spawn(events.clone())
        .context("Failed to spawn tunnel reader")?;

    let context = SessionContext {
        table: table.clone(),
        sink: engine.clone(),
        events,
        subnet,
        buffer_size: config.usb.buffer_size,
    };
    let dispatcher = Arc::new(Dispatcher::new(
        config.driver_settings(nameserver),
        config.usb.filters.clone(),
        context,
        Arc::new(SessionSupervisor::new()),
    ));

    let usb_handle = match spawn_usb_worker(worker, dispatcher) {
        Ok(handle) => handle,
        Err(e) => {
            engine.stop();
            let _ = tun_handle.join();
            return Err(e).context("Failed to start USB worker");
        }
    };

    info!(
        "Relaying {} on {} via {}, press Ctrl+C to stop",
        subnet, tun_name, config.host.interface
    );
    let result = wait_for_shutdown(&bridge).await;

    info!("Shutting down...");
    match bridge.list_sessions().await {
        Ok(sessions) if !sessions.is_empty() => {
            for session in sessions {
                info!(
                    "Closing {} at {} ({:?})",
                    session.key, session.location, session.state
                );
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to list sessions: {}", e),
    }

    if let Err(e) = bridge.send_command(RelayCommand::Shutdown).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    if let Err(e) = usb_handle.join() {
        error!("USB worker thread panicked: {:?}", e);
    }

    engine.stop();
    if let Err(e) = tun_handle.join() {
        error!("Tunnel reader thread panicked: {:?}", e);
    }

    let pending = table.pending_count();
    if pending > 0 {
        warn!(
            "{} identifier(s) were announced to devices that never came online",
            pending
        );
    }

    info!("Shutdown complete");
    result
}

/// Log relay events until Ctrl+C or the tunnel closes
async fn wait_for_shutdown(bridge: &RelayBridge) -> Result<()> {
    loop {
        tokio::select! {
            signal = signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = bridge.recv_event() => match event {
                Ok(RelayEvent::SessionBound { key, id, address }) => {
                    info!("{} is online as {} ({})", key, address, id);
                }
                Ok(RelayEvent::SessionClosed { key, id: Some(id) }) => {
                    info!("{} released {}", key, id);
                }
                Ok(RelayEvent::SessionClosed { key, id: None }) => {
                    info!("{} went away before binding", key);
                }
                Ok(RelayEvent::TunnelClosed { reason }) => {
                    bail!("Tunnel closed: {}", reason);
                }
                Err(e) => {
                    bail!("Relay event channel closed: {}", e);
                }
            }
        }
    }
}
