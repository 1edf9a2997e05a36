//! usb-host
//!
//! Command line front end for the USB host library: lists the device tree or
//! watches hotplug and transfer events until interrupted.

use anyhow::{Context, Result};
use async_channel::Receiver;
use clap::Parser;
use common::setup_logging;
use host::{DeviceNode, HostConfig, HostServices, TopologySynchronizer, UsbEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-host")]
#[command(author, version, about = "USB host - inspect and watch the USB device tree")]
#[command(long_about = "
Builds a model of the USB device tree (host controllers, hubs and devices)
and keeps it in step with the system.

EXAMPLES:
    # Print the device tree and exit
    usb-host --list

    # Watch hotplug events until Ctrl-C
    usb-host

    # Run with a custom config and debug logging
    usb-host --config /path/to/host.toml --log-level debug

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-host/host.toml
    3. /etc/usb-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Print the device tree and exit
    #[arg(long)]
    list: bool,

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

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.host.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list {
        let mut config = config;
        config.usb.scan_interval_millis = 0;
        let services = HostServices::with_rusb(config).context("Failed to open libusb")?;
        services.start().context("Initial scan failed")?;
        print_tree(services.topology());
        return Ok(());
    }

    let services = HostServices::with_rusb(config).context("Failed to open libusb")?;
    let (listener, events) = host::ChannelListener::channel();
    services.add_listener(Arc::new(listener));
    services.start().context("Initial scan failed")?;
    print_tree(services.topology());

    let result = watch(events).await;

    info!("Shutting down...");
    services.shutdown();
    result
}

/// Print events until Ctrl-C
async fn watch(events: Receiver<UsbEvent>) -> Result<()> {
    info!("Watching for USB events, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C");
                return Ok(());
            }
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&event),
                    Err(e) => {
                        warn!("Event channel closed: {}", e);
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn print_event(event: &UsbEvent) {
    match event {
        UsbEvent::DeviceAttached {
            device,
            parent,
            port,
        } => {
            let parent = parent
                .as_ref()
                .map(|p| p.bus_address().to_string())
                .unwrap_or_else(|| "root".to_string());
            println!(
                "+ {} on {} port {}",
                device,
                parent,
                port.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
            );
        }
        UsbEvent::DeviceDetached { device } => println!("- {}", device),
        UsbEvent::TransferCompleted {
            source,
            actual_length,
        } => println!(
            "  {} ep {:#04x}: {} bytes",
            source.device.bus_address(),
            source.endpoint,
            actual_length
        ),
        UsbEvent::TransferFailed { source, error } => println!(
            "  {} ep {:#04x}: {}",
            source.device.bus_address(),
            source.endpoint,
            error
        ),
    }
}

fn print_tree(topology: &TopologySynchronizer) {
    let roots = topology.root_devices();
    if roots.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Root hub");
    for node in &roots {
        print_node(topology, node, 1);
    }
}

fn print_node(topology: &TopologySynchronizer, node: &Arc<DeviceNode>, depth: usize) {
    let port = node.port().map(|p| p.number).unwrap_or(0);
    let kind = match node.ports() {
        Some(ports) => format!("hub, {} ports", ports.number_of_ports()),
        None => format!("config {}", node.active_configuration_number()),
    };
    println!(
        "{:indent$}Port {}: {} {:?} ({})",
        "",
        port,
        node.id(),
        node.speed(),
        kind,
        indent = depth * 2
    );

    for child in topology.children(node) {
        print_node(topology, &child, depth + 1);
    }
}
