//! SignalingDienst – startet Worker, Listener und Zeitgeber gemeinsam

use std::net::SocketAddr;

use ringway_auth::{AuthEreignis, AuthManager};
use ringway_observability::RingwayMetrics;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatcher::SignalingKern;
use crate::engine::AnrufEreignis;
use crate::error::{SignalingError, SignalingResult};
use crate::konfig::SignalingKonfiguration;
use crate::registry::VerbindungsEreignis;
use crate::tcp::SignalingServer;
use crate::zeitgeber::zeitgeber_starten;

/// Laufender Signaling-Service
///
/// Gestoppt wird ueber den beim Start uebergebenen Shutdown-Kanal,
/// `warten()` blockiert bis alle Tasks beendet sind. Die Ereignis-Kanaele
/// werden nur ueber ihre Sender gehalten; Empfaenger entstehen erst beim
/// Abonnieren.
pub struct SignalingDienst {
    adresse: SocketAddr,
    server: JoinHandle<SignalingResult<()>>,
    worker: JoinHandle<()>,
    zeitgeber: Vec<JoinHandle<()>>,
    verbindungen: broadcast::Sender<VerbindungsEreignis>,
    anrufe: broadcast::Sender<AnrufEreignis>,
    auth: broadcast::Sender<AuthEreignis>,
}

impl SignalingDienst {
    /// Bindet den Listener und startet alle Tasks
    ///
    /// Ein Bind-Fehler wird zurueckgegeben bevor irgendein Task laeuft.
    pub async fn starten(
        adresse: SocketAddr,
        konfig: SignalingKonfiguration,
        auth: AuthManager,
        metriken: RingwayMetrics,
        shutdown_rx: watch::Receiver<bool>,
    ) -> SignalingResult<Self> {
        let (befehle_tx, befehle_rx) = mpsc::channel(konfig.befehl_queue_groesse.max(1));

        let server = SignalingServer::binden(adresse, befehle_tx.clone(), konfig.clone()).await?;
        let lokale_adresse = server.lokale_adresse()?;

        let kern = SignalingKern::neu(&konfig, auth, metriken, &befehle_tx);
        let verbindungen = kern.registry().ereignis_sender();
        let anrufe = kern.engine().ereignis_sender();
        let auth = kern.auth().ereignis_sender();

        let worker = tokio::spawn(kern.ausfuehren(befehle_rx, shutdown_rx.clone()));
        let zeitgeber = zeitgeber_starten(&konfig, befehle_tx, shutdown_rx.clone());
        let server = tokio::spawn(server.starten(shutdown_rx));

        tracing::info!(adresse = %lokale_adresse, "Signaling-Dienst gestartet");

        Ok(Self {
            adresse: lokale_adresse,
            server,
            worker,
            zeitgeber,
            verbindungen,
            anrufe,
            auth,
        })
    }

    /// Tatsaechlich gebundene Adresse (relevant bei Port 0)
    pub fn lokale_adresse(&self) -> SocketAddr {
        self.adresse
    }

    pub fn verbindungs_ereignisse(&self) -> broadcast::Receiver<VerbindungsEreignis> {
        self.verbindungen.subscribe()
    }

    pub fn anruf_ereignisse(&self) -> broadcast::Receiver<AnrufEreignis> {
        self.anrufe.subscribe()
    }

    pub fn auth_ereignisse(&self) -> broadcast::Receiver<AuthEreignis> {
        self.auth.subscribe()
    }

    /// Wartet bis Listener, Worker und Zeitgeber beendet sind
    pub async fn warten(self) -> SignalingResult<()> {
        let server = self.server.await.map_err(|e| {
            tracing::error!(fehler = %e, "Listener-Task abgebrochen");
            SignalingError::WorkerBeendet
        })?;

        for task in self.zeitgeber {
            let _ = task.await;
        }
        self.worker.await.map_err(|e| {
            tracing::error!(fehler = %e, "Worker-Task abgebrochen");
            SignalingError::WorkerBeendet
        })?;

        server
    }
}
