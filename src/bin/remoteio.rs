//! RemoteIO host
//!
//! Runs the audio server, optional outbound client connections and the HTTP
//! control API in one process.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remoteio::{
    audio::{CpalEnumerator, DeviceEnumerator, StaticEnumerator},
    config::AppConfig,
    media::{LogTransport, MediaDriver},
    network::{AudioServer, WsConnector},
    protocol::{DeviceRole, DeviceScope},
    ui::WebServer,
    ControlPlane,
};

#[derive(Parser, Debug)]
#[command(name = "remoteio")]
#[command(author, version, about = "Route audio inputs to remote output devices", long_about = None)]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, short = 'c', env = "REMOTEIO_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket port for inbound clients
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// HTTP control API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Do not accept inbound clients
    #[arg(long)]
    no_server: bool,

    /// Server to connect to on startup (repeatable)
    #[arg(long = "connect", value_name = "ADDRESS")]
    connect: Vec<String>,

    /// Output device new inbound clients are routed to
    #[arg(long)]
    output: Option<String>,

    /// Use these input names instead of the sound card (repeatable)
    #[arg(long = "fake-input", value_name = "NAME")]
    fake_inputs: Vec<String>,

    /// Use these output names instead of the sound card (repeatable)
    #[arg(long = "fake-output", value_name = "NAME")]
    fake_outputs: Vec<String>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(port) = self.api_port {
            config.api.http_port = port;
        }
        if self.no_server {
            config.server.enabled = false;
        }
        if self.output.is_some() {
            config.server.default_output = self.output.clone();
        }
    }

    fn enumerator(&self) -> Arc<dyn DeviceEnumerator> {
        if self.fake_inputs.is_empty() && self.fake_outputs.is_empty() {
            return Arc::new(CpalEnumerator::new());
        }
        let inputs: Vec<&str> = self.fake_inputs.iter().map(String::as_str).collect();
        let outputs: Vec<&str> = self.fake_outputs.iter().map(String::as_str).collect();
        Arc::new(StaticEnumerator::from_names(&inputs, &outputs))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().or_else(AppConfig::default_path);
    let mut config = AppConfig::load(config_path.as_deref())
        .with_context(|| format!("loading configuration from {:?}", config_path))?;
    args.apply(&mut config);

    tracing::info!("Starting RemoteIO");

    let plane = ControlPlane::new(&config, Arc::new(WsConnector::new()), args.enumerator());

    for role in [DeviceRole::Input, DeviceRole::Output] {
        if let Err(e) = plane.refresh(DeviceScope::Local, role).await {
            tracing::warn!("Initial {:?} enumeration failed: {}", role, e);
        }
    }
    for device in plane.list_client_devices() {
        tracing::info!("Input: {}{}", device.name, if device.is_default { " [DEFAULT]" } else { "" });
    }
    for device in plane.list_server_devices() {
        tracing::info!("Output: {}{}", device.name, if device.is_default { " [DEFAULT]" } else { "" });
    }

    // fall back to the system default output when none was configured
    if plane.snapshot().server_output.is_none() {
        if let Some(device) = plane.list_server_devices().into_iter().find(|d| d.is_default) {
            plane.set_server_output_device(&device.name)?;
        }
    }

    let _refresh = config
        .inventory
        .refresh_interval()
        .map(|period| plane.spawn_device_refresh(period));
    let _media = MediaDriver::attach(&plane, Arc::new(LogTransport));

    let _server = if config.server.enabled {
        let server = AudioServer::bind(&config.server, plane.clone()).await?;
        Some(server.spawn())
    } else {
        tracing::info!("Inbound server disabled");
        None
    };

    for address in &args.connect {
        match plane.connect_client(address).await {
            Ok(applied) => tracing::info!("Connected to {} as connection {}", address, applied.value.id),
            Err(e) => tracing::error!("Could not connect to {}: {}", address, e),
        }
    }

    let web_server = WebServer::new(config.api.clone(), plane.clone());
    web_server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    // close links politely before the runtime goes away
    for connection in plane.snapshot().connections.iter() {
        if let Err(e) = plane.disconnect(connection.id).await {
            tracing::debug!("Disconnect of {} on shutdown failed: {}", connection.id, e);
        }
    }
    Ok(())
}
