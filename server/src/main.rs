//! Ringway Server – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet den Server.

use anyhow::Result;
use clap::Parser;
use ringway_observability::logging_initialisieren;
use ringway_server::{config::ServerConfig, shutdown_signal_weiterleiten, Server};
use tokio::sync::watch;

/// Ringway Signaling-Server
#[derive(Debug, Parser)]
#[command(name = "ringway-server", version, about)]
struct Cli {
    /// Pfad zur TOML-Konfiguration
    #[arg(short, long, env = "RINGWAY_CONFIG", default_value = "config.toml")]
    config: String,

    /// TCP-Port fuer das Signaling (ueberschreibt die Konfiguration)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let mut config = ServerConfig::laden(&cli.config)?;
    if let Some(port) = cli.port {
        config.netzwerk.tcp_port = port;
    }

    logging_initialisieren(&config.logging.level, &config.logging.format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config,
        "Ringway Server wird initialisiert"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal_weiterleiten(
        tokio::signal::ctrl_c(),
        shutdown_tx,
    ));

    Server::neu(config).starten(shutdown_rx).await
}
