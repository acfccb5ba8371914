//! Signaling-Kern – Single-Writer-Worker und Nachrichten-Dispatch
//!
//! Der `SignalingKern` besitzt die ConnectionRegistry, die Anruf-Engine und
//! den AuthManager. Verbindungs-Tasks und Zeitgeber schicken `Befehl`e ueber
//! eine einzige mpsc-Queue, der Kern verarbeitet sie strikt nacheinander.
//! Dadurch braucht keine der Tabellen ein Lock.
//!
//! ## Routing
//! ```text
//! Befehl::Frame ──> ConnectionRegistry (Binden) ──> Nachricht
//!                                                      |
//!     +-- Login / Registrieren ──> AuthManager ──> 0x0A-Antwort
//!     +-- Heartbeat            ──> Echo
//!     +-- Anruf*               ──> CallSignalingEngine
//!     +-- Mediendaten          ──> CallSignalingEngine (Relay)
//!     +-- Text / Datei         ──> ignoriert
//! ```
//!
//! Fehler werden ueber `FehlerKlassifizierung` eingeordnet: nur
//! Protokollfehler schliessen die Verbindung, alles andere wird geloggt.
//!
//! Argon2 laeuft nicht im Worker: Login und Registrieren werden im Worker
//! geprueft, per `spawn_blocking` gehasht und als `Befehl::AuthErgebnis`
//! wieder eingereiht.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use ringway_auth::{AuthError, AuthManager, AuthResult, HashAuftrag, HashErgebnis};
use ringway_core::{CallId, FehlerKlassifizierung, UserId, VerbindungsId};
use ringway_observability::RingwayMetrics;
use ringway_protocol::{Anmeldedaten, AuthAntwort, ClientNachricht, RohFrame, ServerNachricht};
use tokio::sync::{mpsc, oneshot, watch};

use crate::engine::CallSignalingEngine;
use crate::error::{SignalingError, SignalingResult};
use crate::konfig::SignalingKonfiguration;
use crate::registry::{ConnectionRegistry, VerbindungsEreignis};

// ---------------------------------------------------------------------------
// Befehle
// ---------------------------------------------------------------------------

/// Arbeitsauftrag an den Signaling-Worker
#[derive(Debug)]
pub enum Befehl {
    /// Neue TCP-Verbindung; der Worker vergibt die ID
    Angenommen {
        peer: SocketAddr,
        tx: mpsc::Sender<Bytes>,
        antwort: oneshot::Sender<SignalingResult<VerbindungsId>>,
    },
    /// Vollstaendig deframtes Frame
    Frame {
        verbindung: VerbindungsId,
        frame: RohFrame,
    },
    /// Der Codec hat ein fehlerhaftes Frame gemeldet
    ProtokollFehler {
        verbindung: VerbindungsId,
        fehler: String,
    },
    /// Socket geschlossen (EOF, IO-Fehler, Timeout oder Shutdown)
    Getrennt { verbindung: VerbindungsId },
    /// Passwort-Hash ausserhalb des Workers fertig
    AuthErgebnis {
        verbindung: VerbindungsId,
        benutzername: String,
        ergebnis: AuthResult<HashErgebnis>,
    },
    TokensBereinigen,
    KlingelTimeout,
}

// ---------------------------------------------------------------------------
// SignalingKern
// ---------------------------------------------------------------------------

pub struct SignalingKern {
    registry: ConnectionRegistry,
    engine: CallSignalingEngine,
    auth: AuthManager,
    metriken: RingwayMetrics,
    klingel_timeout: Option<Duration>,
    /// Eigene Befehls-Queue fuer Hash-Ergebnisse; schwach, damit sie schliessen kann
    rueckkanal: mpsc::WeakSender<Befehl>,
    laufende_anmeldungen: HashSet<VerbindungsId>,
    max_parallele_anmeldungen: usize,
}

impl SignalingKern {
    pub fn neu(
        konfig: &SignalingKonfiguration,
        auth: AuthManager,
        metriken: RingwayMetrics,
        befehle: &mpsc::Sender<Befehl>,
    ) -> Self {
        let registry = ConnectionRegistry::neu(
            crate::broadcast::EventBroadcaster::neu(),
            konfig.max_verbindungen,
            konfig.registrierung_token_pflicht,
        );
        let engine = CallSignalingEngine::neu(registry.broadcaster().clone());
        Self {
            registry,
            engine,
            auth,
            metriken,
            klingel_timeout: konfig.klingel_timeout(),
            rueckkanal: befehle.downgrade(),
            laufende_anmeldungen: HashSet::new(),
            max_parallele_anmeldungen: konfig.max_parallele_anmeldungen.max(1),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &CallSignalingEngine {
        &self.engine
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn auth_mut(&mut self) -> &mut AuthManager {
        &mut self.auth
    }

    /// Worker-Schleife: laeuft bis die Queue geschlossen oder Shutdown gemeldet wird
    pub async fn ausfuehren(
        mut self,
        mut befehle: mpsc::Receiver<Befehl>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!("Signaling-Worker gestartet");

        loop {
            tokio::select! {
                befehl = befehle.recv() => {
                    match befehl {
                        Some(befehl) => self.befehl_verarbeiten(befehl),
                        None => {
                            tracing::debug!("Befehls-Queue geschlossen");
                            break;
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Signaling-Worker: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!(
            verbindungen = self.registry.verbindungs_anzahl(),
            anrufe = self.engine.anzahl(),
            "Signaling-Worker gestoppt"
        );
    }

    /// Verarbeitet genau einen Befehl vollstaendig
    pub fn befehl_verarbeiten(&mut self, befehl: Befehl) {
        match befehl {
            Befehl::Angenommen { peer, tx, antwort } => {
                let ergebnis = self.registry.verbindung_annehmen(peer, tx);
                if antwort.send(ergebnis).is_err() {
                    tracing::debug!(peer = %peer, "Verbindungs-Task vor der Antwort beendet");
                }
            }
            Befehl::Frame { verbindung, frame } => self.frame_verarbeiten(verbindung, frame),
            Befehl::ProtokollFehler { verbindung, fehler } => {
                tracing::warn!(verbindung = %verbindung, fehler = %fehler, "Fehlerhaftes Frame");
                self.metriken.protocol_errors_total.inc();
                self.trennen(verbindung);
            }
            Befehl::Getrennt { verbindung } => self.trennen(verbindung),
            Befehl::AuthErgebnis {
                verbindung,
                benutzername,
                ergebnis,
            } => {
                self.laufende_anmeldungen.remove(&verbindung);
                let ergebnis = ergebnis.and_then(|e| self.auth.abschliessen(e));
                self.auth_antworten(verbindung, &benutzername, ergebnis);
            }
            Befehl::TokensBereinigen => {
                let entfernt = self.auth.abgelaufene_tokens_bereinigen();
                if entfernt > 0 {
                    tracing::debug!(entfernt, "Abgelaufene Tokens bereinigt");
                }
            }
            Befehl::KlingelTimeout => {
                if let Some(max_alter) = self.klingel_timeout {
                    for _ in self.engine.unbeantwortete_anrufe_beenden(max_alter) {
                        self.metriken.anruf_beendet("zeitueberschreitung");
                    }
                }
            }
        }

        self.gauges_aktualisieren();
    }

    fn gauges_aktualisieren(&self) {
        self.metriken
            .connected_clients
            .set(self.registry.verbindungs_anzahl() as f64);
        self.metriken
            .online_users
            .set(self.registry.online_anzahl() as f64);
        self.metriken.calls_active.set(self.engine.anzahl() as f64);
    }

    fn frame_verarbeiten(&mut self, verbindung: VerbindungsId, frame: RohFrame) {
        let auth = &mut self.auth;
        let ergebnis = self.registry.frame_annehmen(verbindung, frame, |user_id, token| {
            let besitzer = auth.token_pruefen(token)?;
            if besitzer == *user_id {
                Ok(())
            } else {
                Err(SignalingError::Auth(AuthError::TokenUngueltig))
            }
        });

        let ereignisse = match ergebnis {
            Ok(ereignisse) => ereignisse,
            Err(e) => {
                self.fehler_behandeln(verbindung, e);
                return;
            }
        };

        for ereignis in ereignisse {
            let (user_id, typ, payload) = match ereignis {
                VerbindungsEreignis::Nachricht {
                    user_id,
                    typ,
                    payload,
                    ..
                } => (user_id, typ, payload),
                // Identitaet auf neue Verbindung uebernommen
                VerbindungsEreignis::Getrennt { user_id, .. } => {
                    self.anruf_bei_trennung_beenden(&user_id);
                    continue;
                }
                VerbindungsEreignis::Verbunden { .. } => continue,
            };

            if let Err(e) = self.nachricht_verarbeiten(verbindung, user_id, typ, payload) {
                let schliesst = e.art().schliesst_verbindung();
                self.fehler_behandeln(verbindung, e);
                if schliesst {
                    break;
                }
            }
        }
    }

    /// Protokollfehler schliessen die Verbindung, alle anderen nur loggen
    fn fehler_behandeln(&mut self, verbindung: VerbindungsId, fehler: SignalingError) {
        let art = fehler.art();
        if art.schliesst_verbindung() {
            tracing::warn!(verbindung = %verbindung, fehler = %fehler, "Protokollfehler – Verbindung wird geschlossen");
            self.metriken.protocol_errors_total.inc();
            self.trennen(verbindung);
        } else {
            tracing::info!(verbindung = %verbindung, art = art.label(), fehler = %fehler, "Anfrage abgewiesen");
        }
    }

    /// Entfernt die Verbindung und beendet einen laufenden Anruf des Benutzers
    ///
    /// Durch das Entfernen fallen die Sender weg, der Verbindungs-Task
    /// schliesst daraufhin den Socket.
    fn trennen(&mut self, verbindung: VerbindungsId) {
        let Some(VerbindungsEreignis::Getrennt { user_id, .. }) =
            self.registry.verbindung_trennen(verbindung)
        else {
            return;
        };
        self.anruf_bei_trennung_beenden(&user_id);
    }

    fn anruf_bei_trennung_beenden(&mut self, user_id: &UserId) {
        if self.engine.benutzer_getrennt(user_id).is_some() {
            self.metriken.anruf_beendet("getrennt");
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch nach Nachrichtentyp
    // -----------------------------------------------------------------------

    fn nachricht_verarbeiten(
        &mut self,
        verbindung: VerbindungsId,
        user_id: Option<UserId>,
        typ: u8,
        payload: Bytes,
    ) -> SignalingResult<()> {
        let nachricht = ClientNachricht::dekodieren(typ, payload)?;
        tracing::trace!(verbindung = %verbindung, typ = ?nachricht.typ(), "Nachricht empfangen");

        let (nachricht, user_id) = match (nachricht, user_id) {
            (ClientNachricht::Login(daten), _) => {
                self.login(verbindung, daten);
                return Ok(());
            }
            (ClientNachricht::Registrieren(daten), _) => {
                self.registrieren(verbindung, daten);
                return Ok(());
            }
            (nachricht, Some(user_id)) => (nachricht, user_id),
            (nachricht, None) => {
                return Err(SignalingError::protokoll(format!(
                    "{:?} ohne gebundene Identitaet",
                    nachricht.typ()
                )));
            }
        };

        match nachricht {
            ClientNachricht::Heartbeat => {
                self.antworten(verbindung, ServerNachricht::Heartbeat);
            }
            ClientNachricht::Legacy(typ) => {
                tracing::trace!(user_id = %user_id, typ = ?typ, "Legacy-Nachricht ignoriert");
            }
            ClientNachricht::AnrufAnfrage { callee, video } => {
                let caller = user_id;
                match self.engine.anruf_starten(&caller, &callee, video) {
                    Ok(_) => self.metriken.calls_started_total.inc(),
                    Err(e) => {
                        tracing::info!(caller = %caller, callee = %callee, fehler = %e, "Anruf nicht gestartet");
                        self.antworten(
                            verbindung,
                            ServerNachricht::AnrufAbgelehnt {
                                call_id: CallId::from(""),
                                grund: e.to_string(),
                            },
                        );
                    }
                }
            }
            ClientNachricht::AnrufAnnehmen { call_id } => {
                let sitzung = self
                    .engine
                    .sitzung(&call_id)
                    .ok_or_else(|| SignalingError::AnrufNichtGefunden(call_id.clone()))?;
                if sitzung.callee != user_id {
                    return Err(SignalingError::NichtTeilnehmer { call_id, user_id });
                }
                self.engine.anruf_annehmen(&call_id)?;
            }
            ClientNachricht::AnrufAblehnen { call_id, grund } => {
                self.teilnehmer_pruefen(&call_id, user_id)?;
                self.engine.anruf_ablehnen(&call_id, &grund)?;
                self.metriken.anruf_beendet("abgelehnt");
            }
            ClientNachricht::AnrufBeenden { call_id } => {
                self.teilnehmer_pruefen(&call_id, user_id)?;
                self.engine.anruf_beenden(&call_id)?;
                self.metriken.anruf_beendet("beendet");
            }
            ClientNachricht::Mediendaten { call_id, daten } => {
                let laenge = daten.len();
                if self.engine.medien_weiterleiten(&call_id, &user_id, daten) {
                    self.metriken.medien_weitergeleitet(laenge);
                }
            }
            ClientNachricht::Login(_) | ClientNachricht::Registrieren(_) => {}
        }
        Ok(())
    }

    fn teilnehmer_pruefen(&self, call_id: &CallId, user_id: UserId) -> SignalingResult<()> {
        let sitzung = self
            .engine
            .sitzung(call_id)
            .ok_or_else(|| SignalingError::AnrufNichtGefunden(call_id.clone()))?;
        if sitzung.ist_teilnehmer(&user_id) {
            Ok(())
        } else {
            Err(SignalingError::NichtTeilnehmer {
                call_id: call_id.clone(),
                user_id,
            })
        }
    }

    fn login(&mut self, verbindung: VerbindungsId, daten: Anmeldedaten) {
        let auftrag = self
            .auth
            .anmeldung_vorbereiten(&daten.benutzername, &daten.passwort);
        self.hash_auftrag_starten(verbindung, daten.benutzername, auftrag);
    }

    /// Registrieren stellt direkt einen Token aus (Antwort wie beim Login)
    fn registrieren(&mut self, verbindung: VerbindungsId, daten: Anmeldedaten) {
        let auftrag = self
            .auth
            .registrierung_vorbereiten(&daten.benutzername, &daten.passwort);
        self.hash_auftrag_starten(verbindung, daten.benutzername, auftrag);
    }

    /// Hasht auf dem Blocking-Pool; das Ergebnis kommt als `Befehl::AuthErgebnis` zurueck
    ///
    /// Pro Verbindung laeuft hoechstens ein Auftrag, insgesamt hoechstens
    /// `max_parallele_anmeldungen`. Alles darueber wird sofort abgewiesen.
    fn hash_auftrag_starten(
        &mut self,
        verbindung: VerbindungsId,
        benutzername: String,
        auftrag: AuthResult<HashAuftrag>,
    ) {
        let auftrag = match auftrag {
            Ok(auftrag) => auftrag,
            Err(e) => {
                self.auth_antworten(verbindung, &benutzername, Err(e));
                return;
            }
        };

        if self.laufende_anmeldungen.contains(&verbindung)
            || self.laufende_anmeldungen.len() >= self.max_parallele_anmeldungen
        {
            self.auth_antworten(verbindung, &benutzername, Err(AuthError::Ausgelastet));
            return;
        }
        self.laufende_anmeldungen.insert(verbindung);

        let rueckkanal = self.rueckkanal.clone();
        tokio::spawn(async move {
            let ergebnis = tokio::task::spawn_blocking(move || auftrag.ausfuehren())
                .await
                .unwrap_or_else(|e| {
                    Err(AuthError::PasswortHashing(format!("Hash-Task abgebrochen: {e}")))
                });

            let Some(befehle) = rueckkanal.upgrade() else {
                tracing::debug!(verbindung = %verbindung, "Worker beendet – Hash-Ergebnis verworfen");
                return;
            };
            let befehl = Befehl::AuthErgebnis {
                verbindung,
                benutzername,
                ergebnis,
            };
            if befehle.send(befehl).await.is_err() {
                tracing::debug!(verbindung = %verbindung, "Worker beendet – Hash-Ergebnis verworfen");
            }
        });
    }

    fn auth_antworten(
        &mut self,
        verbindung: VerbindungsId,
        benutzername: &str,
        ergebnis: AuthResult<(String, UserId)>,
    ) {
        let antwort = match ergebnis {
            Ok((token, user_id)) => AuthAntwort::Erfolg { token, user_id },
            Err(e) => {
                tracing::info!(
                    verbindung = %verbindung,
                    benutzername = %benutzername,
                    art = e.art().label(),
                    fehler = %e,
                    "Authentifizierung fehlgeschlagen"
                );
                self.metriken.auth_failures_total.inc();
                AuthAntwort::Fehler {
                    meldung: e.to_string(),
                }
            }
        };
        self.antworten(verbindung, ServerNachricht::Auth(antwort));
    }

    /// Antwort an genau die anfragende Verbindung (auch ungebunden)
    fn antworten(&self, verbindung: VerbindungsId, nachricht: ServerNachricht) {
        let frame = match nachricht.in_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(verbindung = %verbindung, fehler = %e, "Antwort konnte nicht kodiert werden");
                return;
            }
        };
        if let Err(e) = self.registry.an_verbindung_senden(verbindung, frame) {
            tracing::debug!(verbindung = %verbindung, fehler = %e, "Antwort nicht zugestellt");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use ringway_auth::{AuthKonfiguration, HashParameter};
    use ringway_protocol::{nachricht::string_schreiben, wire::FrameCodec, Registrierung};
    use std::ops::{Deref, DerefMut};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio_util::codec::Decoder;

    /// Kern mit eigener Befehls-Queue, damit Hash-Ergebnisse ankommen
    struct TestKern {
        kern: SignalingKern,
        _befehle_tx: mpsc::Sender<Befehl>,
        befehle_rx: mpsc::Receiver<Befehl>,
    }

    impl TestKern {
        /// Wartet auf das naechste Hash-Ergebnis und verarbeitet es
        async fn auth_abwarten(&mut self) {
            let befehl = tokio::time::timeout(Duration::from_secs(5), self.befehle_rx.recv())
                .await
                .expect("Hash-Ergebnis erwartet")
                .expect("Queue offen");
            assert!(matches!(befehl, Befehl::AuthErgebnis { .. }));
            self.kern.befehl_verarbeiten(befehl);
        }
    }

    impl Deref for TestKern {
        type Target = SignalingKern;
        fn deref(&self) -> &SignalingKern {
            &self.kern
        }
    }

    impl DerefMut for TestKern {
        fn deref_mut(&mut self) -> &mut SignalingKern {
            &mut self.kern
        }
    }

    fn kern_mit(konfig: SignalingKonfiguration) -> TestKern {
        let auth = AuthManager::neu(AuthKonfiguration {
            hash_parameter: HashParameter::minimal(),
            ..Default::default()
        });
        let (befehle_tx, befehle_rx) = mpsc::channel(64);
        let kern = SignalingKern::neu(&konfig, auth, RingwayMetrics::neu().unwrap(), &befehle_tx);
        TestKern {
            kern,
            _befehle_tx: befehle_tx,
            befehle_rx,
        }
    }

    fn kern() -> TestKern {
        kern_mit(SignalingKonfiguration::default())
    }

    struct Client {
        id: VerbindungsId,
        rx: mpsc::Receiver<Bytes>,
    }

    impl Client {
        fn verbinden(kern: &mut SignalingKern) -> Self {
            let (tx, rx) = mpsc::channel(32);
            let (antwort_tx, mut antwort_rx) = oneshot::channel();
            kern.befehl_verarbeiten(Befehl::Angenommen {
                peer: "127.0.0.1:40000".parse().unwrap(),
                tx,
                antwort: antwort_tx,
            });
            let id = antwort_rx.try_recv().unwrap().unwrap();
            Self { id, rx }
        }

        /// Verbindet und bindet die Identitaet per Heartbeat
        fn anmelden(kern: &mut SignalingKern, name: &str) -> Self {
            let mut client = Self::verbinden(kern);
            let frame =
                Registrierung::frame_bauen(&UserId::from(name), &ClientNachricht::Heartbeat).unwrap();
            client.roh_senden(kern, frame);
            assert_eq!(client.empfangen(), Some(ServerNachricht::Heartbeat));
            client
        }

        fn roh_senden(&self, kern: &mut SignalingKern, frame: RohFrame) {
            kern.befehl_verarbeiten(Befehl::Frame {
                verbindung: self.id,
                frame,
            });
        }

        fn senden(&self, kern: &mut SignalingKern, nachricht: ClientNachricht) {
            self.roh_senden(kern, nachricht.kodieren().unwrap());
        }

        fn empfangen(&mut self) -> Option<ServerNachricht> {
            let bytes = self.rx.try_recv().ok()?;
            let mut buf = BytesMut::from(&bytes[..]);
            let RohFrame { typ, body } = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
            Some(ServerNachricht::dekodieren(typ, body).unwrap())
        }

        fn ist_geschlossen(&mut self) -> bool {
            matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
        }
    }

    fn anruf_id(nachricht: Option<ServerNachricht>) -> CallId {
        match nachricht {
            Some(ServerNachricht::AnrufAnfrage { call_id, .. }) => call_id,
            andere => panic!("AnrufAnfrage erwartet, erhalten: {andere:?}"),
        }
    }

    #[test]
    fn anruf_szenario_ueber_den_kern() {
        let mut kern = kern();
        let mut alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");

        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let call_id = anruf_id(bob.empfangen());
        assert_eq!(kern.metriken.calls_started_total.get(), 1.0);

        // Relay vor dem Annehmen wird nicht zugestellt
        alice.senden(
            &mut kern,
            ClientNachricht::Mediendaten {
                call_id: call_id.clone(),
                daten: Bytes::from_static(b"frueh"),
            },
        );
        assert!(bob.empfangen().is_none());

        bob.senden(
            &mut kern,
            ClientNachricht::AnrufAnnehmen {
                call_id: call_id.clone(),
            },
        );
        let angenommen = ServerNachricht::AnrufAngenommen {
            call_id: call_id.clone(),
        };
        assert_eq!(alice.empfangen(), Some(angenommen.clone()));
        assert_eq!(bob.empfangen(), Some(angenommen));
        assert_eq!(kern.metriken.calls_active.get(), 1.0);

        let daten = Bytes::from_static(&[0, 255, 7, 7]);
        alice.senden(
            &mut kern,
            ClientNachricht::Mediendaten {
                call_id: call_id.clone(),
                daten: daten.clone(),
            },
        );
        assert_eq!(
            bob.empfangen(),
            Some(ServerNachricht::Mediendaten {
                call_id: call_id.clone(),
                daten
            })
        );
        assert_eq!(kern.metriken.media_bytes_total.get(), 4.0);

        alice.senden(
            &mut kern,
            ClientNachricht::AnrufBeenden {
                call_id: call_id.clone(),
            },
        );
        let beendet = ServerNachricht::AnrufBeendet { call_id };
        assert_eq!(alice.empfangen(), Some(beendet.clone()));
        assert_eq!(bob.empfangen(), Some(beendet));
        assert!(!kern.engine().ist_im_anruf(&UserId::from("alice")));
        assert!(!kern.engine().ist_im_anruf(&UserId::from("bob")));
        assert_eq!(kern.metriken.calls_active.get(), 0.0);
    }

    #[test]
    fn nur_der_angerufene_darf_annehmen() {
        let mut kern = kern();
        let mut alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");
        let mallory = Client::anmelden(&mut kern, "mallory");

        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: true,
            },
        );
        let call_id = anruf_id(bob.empfangen());

        for client in [&alice, &mallory] {
            client.senden(
                &mut kern,
                ClientNachricht::AnrufAnnehmen {
                    call_id: call_id.clone(),
                },
            );
        }
        mallory.senden(
            &mut kern,
            ClientNachricht::AnrufBeenden {
                call_id: call_id.clone(),
            },
        );

        // Abgewiesen, aber keine Verbindung geschlossen
        assert!(alice.empfangen().is_none());
        assert!(!alice.ist_geschlossen());
        assert!(kern.registry().ist_online(&UserId::from("mallory")));
        assert_eq!(
            kern.engine().sitzung(&call_id).unwrap().status,
            crate::engine::AnrufStatus::Anfrage
        );
    }

    #[test]
    fn besetzt_wird_mit_ablehnung_beantwortet() {
        let mut kern = kern();
        let alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");
        let mut carol = Client::anmelden(&mut kern, "carol");

        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let _ = bob.empfangen();

        carol.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        match carol.empfangen() {
            Some(ServerNachricht::AnrufAbgelehnt { call_id, grund }) => {
                assert_eq!(call_id.as_str(), "");
                assert!(grund.contains("bob"));
            }
            andere => panic!("Ablehnung erwartet: {andere:?}"),
        }
        assert!(bob.empfangen().is_none());
    }

    #[test]
    fn selbstanruf_haelt_verbindung_offen() {
        let mut kern = kern();
        let mut alice = Client::anmelden(&mut kern, "alice");
        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("alice"),
                video: false,
            },
        );
        assert!(matches!(
            alice.empfangen(),
            Some(ServerNachricht::AnrufAbgelehnt { .. })
        ));
        assert!(kern.registry().ist_online(&UserId::from("alice")));
    }

    #[tokio::test]
    async fn registrieren_und_login() {
        let mut kern = kern();
        let mut client = Client::verbinden(&mut kern);
        let daten = Anmeldedaten {
            benutzername: "alice".into(),
            passwort: "geheim123".into(),
        };

        client.senden(&mut kern, ClientNachricht::Registrieren(daten.clone()));
        // Gehasht wird ausserhalb, die Antwort kommt erst mit dem Ergebnis
        assert!(client.empfangen().is_none());
        kern.auth_abwarten().await;
        let (token, user_id) = match client.empfangen() {
            Some(ServerNachricht::Auth(AuthAntwort::Erfolg { token, user_id })) => (token, user_id),
            andere => panic!("Erfolg erwartet: {andere:?}"),
        };
        assert!(kern.auth_mut().token_validieren(&token));

        client.senden(&mut kern, ClientNachricht::Login(daten.clone()));
        kern.auth_abwarten().await;
        match client.empfangen() {
            Some(ServerNachricht::Auth(AuthAntwort::Erfolg {
                token: neu,
                user_id: uid,
            })) => {
                assert_eq!(uid, user_id);
                assert_ne!(neu, token);
                // Nur der neueste Token ist gueltig
                assert!(!kern.auth_mut().token_validieren(&token));
            }
            andere => panic!("Erfolg erwartet: {andere:?}"),
        }

        // Login/Registrieren binden keine Identitaet
        assert_eq!(kern.registry().online_anzahl(), 0);
    }

    #[tokio::test]
    async fn fehlgeschlagene_authentifizierung() {
        let mut kern = kern();
        let mut client = Client::verbinden(&mut kern);
        let daten = Anmeldedaten {
            benutzername: "alice".into(),
            passwort: "richtig".into(),
        };
        client.senden(&mut kern, ClientNachricht::Registrieren(daten.clone()));
        kern.auth_abwarten().await;
        let _ = client.empfangen();

        // Vergebener Name wird ohne Hashing sofort abgewiesen
        client.senden(&mut kern, ClientNachricht::Registrieren(daten));
        assert!(matches!(
            client.empfangen(),
            Some(ServerNachricht::Auth(AuthAntwort::Fehler { .. }))
        ));

        client.senden(
            &mut kern,
            ClientNachricht::Login(Anmeldedaten {
                benutzername: "alice".into(),
                passwort: "falsch".into(),
            }),
        );
        kern.auth_abwarten().await;
        assert!(matches!(
            client.empfangen(),
            Some(ServerNachricht::Auth(AuthAntwort::Fehler { .. }))
        ));
        assert_eq!(kern.metriken.auth_failures_total.get(), 2.0);
        assert!(!client.ist_geschlossen());
    }

    #[test]
    fn protokollfehler_schliesst_verbindung_und_beendet_anruf() {
        let mut kern = kern();
        let mut alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");

        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let call_id = anruf_id(bob.empfangen());

        bob.roh_senden(&mut kern, RohFrame::neu(0x42, Bytes::new()));

        assert!(bob.ist_geschlossen());
        assert!(!kern.registry().ist_online(&UserId::from("bob")));
        assert_eq!(
            alice.empfangen(),
            Some(ServerNachricht::AnrufBeendet { call_id })
        );
        assert_eq!(kern.metriken.protocol_errors_total.get(), 1.0);
    }

    #[test]
    fn trennung_beendet_anruf() {
        let mut kern = kern();
        let mut alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");

        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let call_id = anruf_id(bob.empfangen());
        bob.senden(
            &mut kern,
            ClientNachricht::AnrufAnnehmen {
                call_id: call_id.clone(),
            },
        );
        let _ = alice.empfangen();

        kern.befehl_verarbeiten(Befehl::Getrennt { verbindung: bob.id });
        assert_eq!(
            alice.empfangen(),
            Some(ServerNachricht::AnrufBeendet {
                call_id: call_id.clone()
            })
        );
        assert!(kern.engine().sitzung(&call_id).is_none());

        // Zweites Trennen ist folgenlos
        kern.befehl_verarbeiten(Befehl::Getrennt { verbindung: bob.id });
        assert_eq!(kern.registry().online_anzahl(), 1);
    }

    #[test]
    fn server_voll() {
        let mut kern = kern_mit(SignalingKonfiguration {
            max_verbindungen: 1,
            ..Default::default()
        });
        let _erster = Client::verbinden(&mut kern);

        let (tx, _rx) = mpsc::channel(4);
        let (antwort_tx, mut antwort_rx) = oneshot::channel();
        kern.befehl_verarbeiten(Befehl::Angenommen {
            peer: "127.0.0.1:40001".parse().unwrap(),
            tx,
            antwort: antwort_tx,
        });
        assert!(matches!(
            antwort_rx.try_recv().unwrap(),
            Err(SignalingError::ServerVoll(1))
        ));
    }

    fn heartbeat_mit_token(user_id: &str, token: &str) -> RohFrame {
        let mut body = BytesMut::new();
        string_schreiben(&mut body, user_id, "userId").unwrap();
        string_schreiben(&mut body, token, "token").unwrap();
        RohFrame::neu(0x07, body.freeze())
    }

    #[tokio::test]
    async fn token_pflicht_beim_binden() {
        let mut kern = kern_mit(SignalingKonfiguration {
            registrierung_token_pflicht: true,
            ..Default::default()
        });

        let mut anmelder = Client::verbinden(&mut kern);
        anmelder.senden(
            &mut kern,
            ClientNachricht::Registrieren(Anmeldedaten {
                benutzername: "alice".into(),
                passwort: "pw".into(),
            }),
        );
        kern.auth_abwarten().await;
        let (token, user_id) = match anmelder.empfangen() {
            Some(ServerNachricht::Auth(AuthAntwort::Erfolg { token, user_id })) => (token, user_id),
            andere => panic!("Erfolg erwartet: {andere:?}"),
        };

        let mut falsch = Client::verbinden(&mut kern);
        falsch.roh_senden(&mut kern, heartbeat_mit_token(user_id.as_str(), "gefaelscht"));
        assert!(falsch.ist_geschlossen());

        let mut richtig = Client::verbinden(&mut kern);
        richtig.roh_senden(&mut kern, heartbeat_mit_token(user_id.as_str(), &token));
        assert_eq!(richtig.empfangen(), Some(ServerNachricht::Heartbeat));
        assert!(kern.registry().ist_online(&user_id));
    }

    #[tokio::test]
    async fn laufende_anmeldungen_werden_begrenzt() {
        let mut kern = kern_mit(SignalingKonfiguration {
            max_parallele_anmeldungen: 2,
            ..Default::default()
        });
        let daten = |name: &str| Anmeldedaten {
            benutzername: name.into(),
            passwort: "pw".into(),
        };

        let mut erster = Client::verbinden(&mut kern);
        let mut zweiter = Client::verbinden(&mut kern);
        let mut dritter = Client::verbinden(&mut kern);

        erster.senden(&mut kern, ClientNachricht::Registrieren(daten("a")));
        // Zweiter Auftrag derselben Verbindung: sofort abgewiesen
        erster.senden(&mut kern, ClientNachricht::Registrieren(daten("b")));
        assert!(matches!(
            erster.empfangen(),
            Some(ServerNachricht::Auth(AuthAntwort::Fehler { .. }))
        ));

        zweiter.senden(&mut kern, ClientNachricht::Registrieren(daten("c")));
        // Globales Limit erreicht
        dritter.senden(&mut kern, ClientNachricht::Registrieren(daten("d")));
        assert!(matches!(
            dritter.empfangen(),
            Some(ServerNachricht::Auth(AuthAntwort::Fehler { meldung }))
                if meldung == AuthError::Ausgelastet.to_string()
        ));

        kern.auth_abwarten().await;
        kern.auth_abwarten().await;
        for client in [&mut erster, &mut zweiter] {
            assert!(matches!(
                client.empfangen(),
                Some(ServerNachricht::Auth(AuthAntwort::Erfolg { .. }))
            ));
        }
        assert!(kern.laufende_anmeldungen.is_empty());
        assert_eq!(kern.auth().benutzer_anzahl(), 2);

        // Nach Abschluss wieder frei
        dritter.senden(&mut kern, ClientNachricht::Registrieren(daten("d")));
        kern.auth_abwarten().await;
        assert!(matches!(
            dritter.empfangen(),
            Some(ServerNachricht::Auth(AuthAntwort::Erfolg { .. }))
        ));
    }

    #[tokio::test]
    async fn relay_laeuft_waehrend_anmeldungen_haengen() {
        let mut kern = kern();
        let alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");
        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let call_id = anruf_id(bob.empfangen());
        bob.senden(
            &mut kern,
            ClientNachricht::AnrufAnnehmen {
                call_id: call_id.clone(),
            },
        );
        let _ = bob.empfangen();

        let mut angreifer = Client::verbinden(&mut kern);
        angreifer.senden(
            &mut kern,
            ClientNachricht::Registrieren(Anmeldedaten {
                benutzername: "mallory".into(),
                passwort: "pw".into(),
            }),
        );

        // Hash noch nicht uebernommen, Relay trotzdem sofort zugestellt
        let daten = Bytes::from_static(b"frame");
        alice.senden(
            &mut kern,
            ClientNachricht::Mediendaten {
                call_id: call_id.clone(),
                daten: daten.clone(),
            },
        );
        assert_eq!(
            bob.empfangen(),
            Some(ServerNachricht::Mediendaten { call_id, daten })
        );
        assert!(angreifer.empfangen().is_none());

        kern.auth_abwarten().await;
        assert!(angreifer.empfangen().is_some());
    }

    #[test]
    fn neue_verbindung_uebernimmt_identitaet_und_beendet_anruf() {
        let mut kern = kern();
        let mut alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");
        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let call_id = anruf_id(bob.empfangen());

        let mut neue_alice = Client::verbinden(&mut kern);
        neue_alice.roh_senden(
            &mut kern,
            Registrierung::frame_bauen(&UserId::from("alice"), &ClientNachricht::Heartbeat).unwrap(),
        );

        assert!(alice.ist_geschlossen());
        let beendet = ServerNachricht::AnrufBeendet {
            call_id: call_id.clone(),
        };
        assert_eq!(bob.empfangen(), Some(beendet.clone()));
        assert_eq!(neue_alice.empfangen(), Some(beendet));
        assert_eq!(neue_alice.empfangen(), Some(ServerNachricht::Heartbeat));
        assert!(kern.engine().sitzung(&call_id).is_none());
        assert_eq!(kern.registry().online_anzahl(), 2);
        assert_eq!(kern.metriken.connected_clients.get(), 2.0);

        // Das spaete Getrennt der alten Verbindung aendert nichts mehr
        kern.befehl_verarbeiten(Befehl::Getrennt { verbindung: alice.id });
        assert!(kern.registry().ist_online(&UserId::from("alice")));
    }

    #[test]
    fn klingel_timeout_ohne_abgelaufene_anrufe() {
        let mut kern = kern();
        let alice = Client::anmelden(&mut kern, "alice");
        let mut bob = Client::anmelden(&mut kern, "bob");
        alice.senden(
            &mut kern,
            ClientNachricht::AnrufAnfrage {
                callee: UserId::from("bob"),
                video: false,
            },
        );
        let call_id = anruf_id(bob.empfangen());

        kern.befehl_verarbeiten(Befehl::KlingelTimeout);
        kern.befehl_verarbeiten(Befehl::TokensBereinigen);
        assert!(kern.engine().sitzung(&call_id).is_some());
    }

    #[tokio::test]
    async fn worker_stoppt_bei_shutdown() {
        let TestKern {
            kern,
            _befehle_tx: befehle_tx,
            befehle_rx,
        } = kern();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(kern.ausfuehren(befehle_rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Worker muss stoppen")
            .unwrap();
    }

    #[tokio::test]
    async fn worker_stoppt_wenn_alle_sender_weg_sind() {
        let TestKern {
            kern,
            _befehle_tx: befehle_tx,
            befehle_rx,
        } = kern();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(kern.ausfuehren(befehle_rx, shutdown_rx));
        // Der Kern selbst haelt die Queue nicht offen
        drop(befehle_tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Worker muss stoppen")
            .unwrap();
    }
}
