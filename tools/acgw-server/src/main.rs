//! acgw Gateway Server
//!
//! Accepts charger connections on the configured listeners and bridges
//! them to the MQTT backend.

use acgw_hub::{Hub, MqttLink, PassthroughTranslator, SharedTranslator};
use acgw_transport::{TcpServer, WebSocketServer};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{GatewayConfig, ListenerConfig, DEFAULT_HANDSHAKE_TIMEOUT_SECS};

#[derive(Parser)]
#[command(name = "acgw")]
#[command(about = "Device session gateway for EV chargers")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "ACGW_CONFIG")]
    config: Option<PathBuf>,

    /// Topic hostname (defaults to the machine hostname)
    #[arg(long, env = "ACGW_HOSTNAME")]
    hostname: Option<String>,

    /// MQTT broker host
    #[arg(long, env = "ACGW_BROKER_HOST")]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "ACGW_BROKER_PORT")]
    broker_port: Option<u16>,

    /// WebSocket listen address (added to the configured listeners)
    #[arg(long)]
    ws_listen: Option<String>,

    /// TCP listen address (added to the configured listeners)
    #[arg(long)]
    tcp_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn gateway_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(hostname) = &self.hostname {
            config.hub.hostname = hostname.clone();
        }
        if let Some(host) = &self.broker_host {
            config.mqtt.broker_host = host.clone();
        }
        if let Some(port) = self.broker_port {
            config.mqtt.broker_port = port;
        }
        if let Some(addr) = &self.ws_listen {
            config.listeners.push(ListenerConfig::Websocket {
                addr: addr.clone(),
                text_frames: true,
                handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            });
        }
        if let Some(addr) = &self.tcp_listen {
            config.listeners.push(ListenerConfig::Tcp {
                addr: addr.clone(),
                framing: Default::default(),
                keepalive_secs: 30,
            });
        }
        if config.listeners.is_empty() {
            config.listeners.push(ListenerConfig::Websocket {
                addr: "0.0.0.0:8080".into(),
                text_frames: true,
                handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            });
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs)?;

    let config = cli.gateway_config()?;
    info!("Starting acgw gateway as {}", config.hub.hostname);

    let link = MqttLink::new(&config.mqtt);
    let hub = Hub::builder(config.hub.clone(), link.publisher())
        .on_offline(|session, reason| {
            info!(
                device = session.device_id().as_deref().unwrap_or("-"),
                peer = %session.connect_info().peer,
                uptime_secs = session.uptime().as_secs(),
                "Session ended: {}",
                reason
            );
        })
        .build();
    let mqtt = link.spawn(hub.clone());

    let translator: SharedTranslator = Arc::new(PassthroughTranslator::from(config.translator));
    let mut listeners = Vec::new();

    for listener in &config.listeners {
        let hub = hub.clone();
        let translator = Arc::clone(&translator);

        let handle = match listener.clone() {
            ListenerConfig::Tcp {
                addr,
                framing,
                keepalive_secs,
            } => {
                let server = TcpServer::bind_with_config(
                    &addr,
                    ListenerConfig::tcp_config(framing, keepalive_secs),
                )
                .await
                .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
                tokio::spawn(async move { hub.serve_on(server, translator).await })
            }
            ListenerConfig::Websocket {
                addr,
                text_frames,
                handshake_timeout_secs,
            } => {
                let server = WebSocketServer::bind(&addr)
                    .await
                    .with_context(|| format!("Failed to bind WebSocket listener on {}", addr))?
                    .with_config(ListenerConfig::websocket_config(
                        text_frames,
                        handshake_timeout_secs,
                    ));
                tokio::spawn(async move { hub.serve_on(server, translator).await })
            }
        };
        info!("Listening on {}", listener.addr());
        listeners.push(handle);
    }

    info!("Gateway ready, accepting connections...");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    hub.shutdown().await;

    for listener in listeners {
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener failed: {}", e),
            Err(e) => error!("Listener task panicked: {}", e),
        }
    }
    if let Err(e) = mqtt.await {
        error!("MQTT link task failed: {}", e);
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}
