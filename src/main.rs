mod config;
mod transport;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use config::{AppConfig, TransportMode, CONFIG_ENV};
use spp_core::{
    ChannelObserver, ConnectionManager, Dialer, LinkEvent, Listener, Profile, RemoteIdentity,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use transport::{BtDiscovery, RfcommTransport, TcpTransport};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // spp-link [scan] [config.toml]
    let mut args = std::env::args().skip(1).peekable();
    let scan = args.next_if(|arg| arg == "scan").is_some();
    let config_path = args
        .next()
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    if scan {
        return run_scan(&config).await;
    }
    run_link(config).await
}

/// List nearby Bluetooth devices
async fn run_scan(config: &AppConfig) -> Result<()> {
    if config.mode != TransportMode::Rfcomm {
        bail!("scan needs mode = \"rfcomm\"");
    }
    let adapter = BtDiscovery::get_adapter().await?;
    let discovery = BtDiscovery::new(config.discovery.clone());
    let devices = discovery.scan(&adapter).await?;

    if devices.is_empty() {
        println!("no devices found");
    }
    for device in devices {
        let rssi = device
            .rssi
            .map(|rssi| format!("{} dBm", rssi))
            .unwrap_or_else(|| "-".into());
        println!("{}\t{}", device.identity(), rssi);
    }
    Ok(())
}

/// Listen (or dial the configured peer) and bridge the session to stdio
async fn run_link(config: AppConfig) -> Result<()> {
    let (listener, dialer): (Arc<dyn Listener>, Arc<dyn Dialer>) = match config.mode {
        TransportMode::Rfcomm => {
            let discovery = Arc::new(BtDiscovery::new(config.discovery.clone()));
            let rfcomm = Arc::new(RfcommTransport::new(config.rfcomm.clone(), discovery).await?);
            (rfcomm.clone() as Arc<dyn Listener>, rfcomm as Arc<dyn Dialer>)
        }
        TransportMode::TcpSimulation => {
            info!(
                "TCP simulation on {} (peer port {}, serial port {})",
                config.tcp.bind_host,
                config.tcp.port_for(Profile::Peer),
                config.tcp.port_for(Profile::SerialPort)
            );
            let tcp = Arc::new(TcpTransport::new(config.tcp.clone()));
            (tcp.clone() as Arc<dyn Listener>, tcp as Arc<dyn Dialer>)
        }
    };

    let (observer, mut events) = ChannelObserver::new();
    let manager = ConnectionManager::new(
        listener,
        dialer,
        Arc::new(observer),
        config.manager_config(),
    );

    match &config.peer {
        Some(peer) => {
            info!("Dialing {} as {}", peer, config.profile);
            manager
                .connect(RemoteIdentity::new(peer.as_str()), config.profile)
                .await?;
        }
        None => {
            info!("Listening as {}", config.profile);
            manager.start(config.profile).await?;
        }
    }

    let terminator = config.framing.line_terminator();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Main event loop
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => report(event),
                None => {
                    error!("Link event channel closed");
                    break;
                }
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let mut bytes = BytesMut::with_capacity(line.len() + terminator.len());
                    bytes.put_slice(line.as_bytes());
                    bytes.put_slice(terminator);
                    if let Err(e) = manager.write(bytes.freeze()).await {
                        warn!("Not sent: {}", e);
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    manager.stop().await?;
    Ok(())
}

fn report(event: LinkEvent) {
    match event {
        LinkEvent::StateChanged(state) => info!("State: {}", state),
        LinkEvent::DeviceIdentified(remote) => info!("Connected to {}", remote),
        LinkEvent::FrameReceived(frame) => println!("{}", String::from_utf8_lossy(&frame)),
        LinkEvent::BytesWritten(bytes) => debug!("Sent {} bytes", bytes.len()),
        LinkEvent::ConnectionFailed => warn!("Connection failed, listening again"),
        LinkEvent::ConnectionLost => warn!("Connection lost, listening again"),
        LinkEvent::WriteFailed { reason } => error!("Write failed: {}", reason),
        LinkEvent::ListenFailed { reason } => error!("Listening failed: {}", reason),
    }
}
