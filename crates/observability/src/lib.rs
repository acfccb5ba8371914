//! # ringway-observability
//!
//! Observability-Crate fuer Ringway:
//! - Prometheus-kompatible Metriken (`/metrics`)
//! - Health-Check-Endpunkt (`/health`)
//! - Structured Logging via tracing-subscriber

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{health_router, HealthResponse, HealthState, HealthStatus};
pub use logging::logging_initialisieren;
pub use metrics::{metrics_router, RingwayMetrics};

use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Baut den kombinierten Router fuer `/metrics` und `/health`
pub fn observability_router(metriken: RingwayMetrics, health: HealthState) -> Router {
    Router::new()
        .merge(metrics_router(metriken))
        .merge(health_router(health))
        .layer(TraceLayer::new_for_http())
}

/// Observability-HTTP-Server (Metriken + Health)
///
/// `binden` und `starten` sind getrennt, damit ein belegter Port als
/// Startfehler gemeldet wird bevor der Server-Task laeuft.
pub struct ObservabilityServer {
    listener: TcpListener,
    router: Router,
}

impl ObservabilityServer {
    pub async fn binden(
        bind_addr: SocketAddr,
        metriken: RingwayMetrics,
        health: HealthState,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Observability-Server: Bind auf {bind_addr} fehlgeschlagen"))?;
        Ok(Self {
            listener,
            router: observability_router(metriken, health),
        })
    }

    pub fn lokale_adresse(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Laeuft bis `shutdown_rx` ein `true`-Signal empfaengt
    pub async fn starten(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(addr = %self.lokale_adresse()?, "Observability-Server gestartet");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            })
            .await?;

        tracing::info!("Observability-Server gestoppt");
        Ok(())
    }
}
