//! Client-Connection – Verwaltet eine einzelne TCP-Verbindung
//!
//! Jede TCP-Verbindung bekommt eine `ClientConnection` in einem eigenen
//! tokio-Task. Der Task haelt keinen Signaling-Zustand: er deframt
//! eingehende Bytes und reicht vollstaendige Frames als `Befehl` an den
//! Worker weiter, und er schreibt die fertig kodierten Frames aus seiner
//! Send-Queue auf den Socket.
//!
//! ## Lebenszyklus
//! ```text
//! Accept -> Befehl::Angenommen -> (ID vom Worker) -> Lese/Schreib-Schleife
//!                                                        |
//!     EOF / IO-Fehler / Idle-Timeout / Shutdown ---------+--> Befehl::Getrennt
//!     Codec-Fehler ---------------------------------------+--> Befehl::ProtokollFehler
//!     Send-Queue vom Worker geschlossen ------------------+--> Socket schliessen
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use ringway_core::{FehlerKlassifizierung, VerbindungsId};
use ringway_protocol::wire::FrameCodec;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use crate::dispatcher::Befehl;
use crate::konfig::SignalingKonfiguration;

/// Warum die Schleife einer Verbindung endete
#[derive(Debug, Clone, PartialEq, Eq)]
enum Trennung {
    /// Client hat den Socket geschlossen
    Eof,
    Io(String),
    Protokoll(String),
    Timeout,
    /// Worker hat die Verbindung entfernt
    VomServer,
    Shutdown,
    WorkerBeendet,
}

// ---------------------------------------------------------------------------
// ClientConnection
// ---------------------------------------------------------------------------

/// Verarbeitet eine einzelne TCP-Verbindung
pub struct ClientConnection {
    peer: SocketAddr,
    befehle: mpsc::Sender<Befehl>,
    max_frame_groesse: usize,
    sende_queue_groesse: usize,
    timeout: Option<Duration>,
}

impl ClientConnection {
    /// Erstellt eine neue ClientConnection
    pub fn neu(peer: SocketAddr, befehle: mpsc::Sender<Befehl>, konfig: &SignalingKonfiguration) -> Self {
        Self {
            peer,
            befehle,
            max_frame_groesse: konfig.max_frame_groesse,
            sende_queue_groesse: konfig.sende_queue_groesse.max(1),
            timeout: konfig.verbindungs_timeout(),
        }
    }

    /// Meldet die Verbindung beim Worker an und fuehrt die Schleife aus
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal eingeht.
    pub async fn verarbeiten(self, stream: TcpStream, mut shutdown_rx: watch::Receiver<bool>) {
        let peer = self.peer;

        let (sende_tx, mut sende_rx) = mpsc::channel::<Bytes>(self.sende_queue_groesse);
        let (antwort_tx, antwort_rx) = oneshot::channel();
        let angemeldet = self
            .befehle
            .send(Befehl::Angenommen {
                peer,
                tx: sende_tx,
                antwort: antwort_tx,
            })
            .await;
        if angemeldet.is_err() {
            tracing::warn!(peer = %peer, "Signaling-Worker nicht erreichbar – Verbindung verworfen");
            return;
        }

        let id = match antwort_rx.await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                tracing::info!(peer = %peer, fehler = %e, "Verbindung abgelehnt");
                return;
            }
            Err(_) => return,
        };

        tracing::info!(peer = %peer, verbindung = %id, "Neue Verbindung");

        let (lesen, mut schreiben) = stream.into_split();
        let mut frames = FramedRead::new(lesen, FrameCodec::with_max_size(self.max_frame_groesse));
        let mut letzter_empfang = Instant::now();

        let trennung = loop {
            let frist = self.timeout.map(|t| letzter_empfang + t);

            tokio::select! {
                // Eingehendes Frame vom Client
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            letzter_empfang = Instant::now();
                            tracing::trace!(peer = %peer, typ = frame.typ, laenge = frame.body.len(), "Frame empfangen");
                            let befehl = Befehl::Frame { verbindung: id, frame };
                            if self.befehle.send(befehl).await.is_err() {
                                break Trennung::WorkerBeendet;
                            }
                        }
                        Some(Err(e)) if e.art().schliesst_verbindung() => {
                            break Trennung::Protokoll(e.to_string());
                        }
                        Some(Err(e)) => break Trennung::Io(e.to_string()),
                        None => break Trennung::Eof,
                    }
                }

                // Ausgehendes Frame aus der Send-Queue
                ausgehend = sende_rx.recv() => {
                    match ausgehend {
                        Some(bytes) => {
                            if let Err(e) = schreiben.write_all(&bytes).await {
                                break Trennung::Io(e.to_string());
                            }
                        }
                        None => break Trennung::VomServer,
                    }
                }

                // Idle-Timeout
                _ = Self::frist_abwarten(frist) => {
                    break Trennung::Timeout;
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break Trennung::Shutdown;
                    }
                }
            }
        };

        self.abmelden(id, &trennung).await;
        let _ = schreiben.shutdown().await;
    }

    async fn frist_abwarten(frist: Option<Instant>) {
        match frist {
            Some(frist) => tokio::time::sleep_until(frist).await,
            None => std::future::pending().await,
        }
    }

    /// Meldet das Ende beim Worker (idempotent auf Worker-Seite)
    async fn abmelden(&self, id: VerbindungsId, trennung: &Trennung) {
        let peer = self.peer;
        match trennung {
            Trennung::Eof => tracing::info!(peer = %peer, verbindung = %id, "Verbindung vom Client getrennt"),
            Trennung::Io(fehler) => tracing::warn!(peer = %peer, fehler = %fehler, "IO-Fehler – Verbindung getrennt"),
            Trennung::Protokoll(fehler) => tracing::warn!(peer = %peer, fehler = %fehler, "Frame-Lesefehler"),
            Trennung::Timeout => tracing::warn!(peer = %peer, verbindung = %id, "Verbindungs-Timeout"),
            Trennung::VomServer => tracing::debug!(peer = %peer, verbindung = %id, "Verbindung vom Server geschlossen"),
            Trennung::Shutdown => tracing::info!(peer = %peer, "Shutdown-Signal – Verbindung wird getrennt"),
            Trennung::WorkerBeendet => {
                tracing::warn!(peer = %peer, "Signaling-Worker beendet");
                return;
            }
        }

        let befehl = match trennung {
            Trennung::Protokoll(fehler) => Befehl::ProtokollFehler {
                verbindung: id,
                fehler: fehler.clone(),
            },
            _ => Befehl::Getrennt { verbindung: id },
        };
        if self.befehle.send(befehl).await.is_err() {
            tracing::debug!(verbindung = %id, "Trennung nicht gemeldet – Worker beendet");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
