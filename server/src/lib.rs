//! ringway-server – Bibliotheks-Root
//!
//! Deklariert alle Server-Module und stellt den oeffentlichen Einstiegspunkt
//! fuer Integrationstests bereit.

pub mod config;

use std::future::Future;

use anyhow::Result;
use config::ServerConfig;
use ringway_auth::AuthManager;
use ringway_observability::{HealthState, ObservabilityServer, RingwayMetrics};
use ringway_signaling::SignalingDienst;
use tokio::sync::watch;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Server-Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Metriken und Health-Zustand anlegen
    /// 2. Observability-Port binden (falls aktiviert)
    /// 3. Signaling-Dienst starten (TCP-Listener, Worker, Zeitgeber)
    /// 4. Observability-Server starten
    /// 5. Auf `shutdown_rx` warten
    ///
    /// Jeder Bind-Fehler beendet den Start sofort.
    pub async fn starten(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let tcp_adresse = self.config.tcp_bind_adresse()?;

        tracing::info!(
            server_name = %self.config.server.name,
            tcp = %tcp_adresse,
            max_verbindungen = self.config.server.max_verbindungen,
            "Server startet"
        );

        let metriken = RingwayMetrics::neu()?;
        let health = HealthState::neu();
        let auth = AuthManager::neu(self.config.auth_konfiguration()?);

        let observability = if self.config.observability.aktiviert {
            let adresse = self.config.observability_bind_adresse()?;
            Some(ObservabilityServer::binden(adresse, metriken.clone(), health.clone()).await?)
        } else {
            tracing::info!("Observability-Server deaktiviert");
            None
        };

        let dienst = SignalingDienst::starten(
            tcp_adresse,
            self.config.signaling_konfiguration(),
            auth,
            metriken.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        health.signaling_status_setzen(true);

        let observability = observability.map(|server| tokio::spawn(server.starten(shutdown_rx)));

        tracing::info!(
            adresse = %dienst.lokale_adresse(),
            "Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)..."
        );

        dienst.warten().await?;
        health.signaling_status_setzen(false);

        if let Some(handle) = observability {
            handle.await??;
        }

        tracing::info!("Server beendet");
        Ok(())
    }
}

/// Leitet ein Betriebssystem-Signal an den Shutdown-Kanal weiter
///
/// Schlaegt das Einrichten des Signal-Handlers fehl, wird das geloggt und
/// der Server laeuft weiter; er ist dann nur noch von aussen zu beenden.
pub async fn shutdown_signal_weiterleiten<F>(signal: F, shutdown_tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("Shutdown-Signal empfangen");
            let _ = shutdown_tx.send(true);
        }
        Err(e) => {
            tracing::error!(fehler = %e, "Signal-Handler nicht verfuegbar, Server laeuft ohne Ctrl-C weiter");
            std::future::pending::<()>().await;
        }
    }
}
