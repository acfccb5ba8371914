//! TCP-Listener – Bindet Socket, akzeptiert Verbindungen
//!
//! Der `SignalingServer` bindet einen TCP-Socket und startet fuer jede
//! eingehende Verbindung einen eigenen tokio-Task mit einer `ClientConnection`.
//! Das Verbindungslimit prueft der Worker beim `Befehl::Angenommen`.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::connection::ClientConnection;
use crate::dispatcher::Befehl;
use crate::error::{SignalingError, SignalingResult};
use crate::konfig::SignalingKonfiguration;

/// TCP-Signaling-Server
pub struct SignalingServer {
    listener: TcpListener,
    befehle: mpsc::Sender<Befehl>,
    konfig: SignalingKonfiguration,
}

impl SignalingServer {
    /// Bindet den Listener
    ///
    /// Port 0 waehlt einen freien Port, siehe `lokale_adresse()`.
    pub async fn binden(
        adresse: SocketAddr,
        befehle: mpsc::Sender<Befehl>,
        konfig: SignalingKonfiguration,
    ) -> SignalingResult<Self> {
        let listener = TcpListener::bind(adresse)
            .await
            .map_err(|quelle| SignalingError::Bind { adresse, quelle })?;
        Ok(Self {
            listener,
            befehle,
            konfig,
        })
    }

    /// Tatsaechlich gebundene Adresse
    pub fn lokale_adresse(&self) -> SignalingResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept-Loop, laeuft bis `shutdown_rx` ein `true`-Signal empfaengt
    pub async fn starten(self, mut shutdown_rx: watch::Receiver<bool>) -> SignalingResult<()> {
        tracing::info!(
            adresse = %self.lokale_adresse()?,
            "TCP Signaling-Server gestartet"
        );

        loop {
            tokio::select! {
                // Neue eingehende Verbindung
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(peer = %peer, fehler = %e, "TCP_NODELAY nicht gesetzt");
                            }
                            tracing::debug!(peer = %peer, "Verbindung akzeptiert");

                            let verbindung = ClientConnection::neu(peer, self.befehle.clone(), &self.konfig);
                            tokio::spawn(verbindung.verarbeiten(stream, shutdown_rx.clone()));
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Signaling-Server: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!("TCP Signaling-Server gestoppt");
        Ok(())
    }
}
