//! ConnectionRegistry – Verbindungen, Identitaeten und Verbindungs-Ereignisse
//!
//! Die Registry gehoert exklusiv dem Signaling-Worker. Sie vergibt beim
//! Accept eine `VerbindungsId`, bindet beim ersten Frame die vom Client
//! beanspruchte Identitaet und liefert fuer jedes Frame die passenden
//! Ereignisse in Empfangsreihenfolge zurueck.
//!
//! ## Ablauf pro Verbindung
//! ```text
//! verbindung_annehmen ──> ungebunden ──(erstes Frame)──> gebunden ──> verbindung_trennen
//!                              │
//!                              └── Login/Registrieren ohne Praefix (bleibt ungebunden)
//! ```
//!
//! Bindet eine neue Verbindung eine bereits gebundene Identitaet, wird die
//! alte Verbindung entfernt (halboffene Verbindung nach Reconnect).
//!
//! Ereignisse werden zusaetzlich an externe Abonnenten verteilt
//! (`abonnieren()`).

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ringway_core::{UserId, VerbindungsId};
use ringway_protocol::{NachrichtenTyp, Registrierung, RohFrame};
use tokio::sync::{broadcast, mpsc};

use crate::broadcast::EventBroadcaster;
use crate::error::{SignalingError, SignalingResult};

/// Kapazitaet des Ereignis-Kanals fuer externe Abonnenten
const EREIGNIS_KAPAZITAET: usize = 1024;

// ---------------------------------------------------------------------------
// Datentypen
// ---------------------------------------------------------------------------

/// Eine offene TCP-Verbindung
#[derive(Debug, Clone)]
pub struct Verbindung {
    pub id: VerbindungsId,
    /// Gebundene Identitaet, aendert sich nach dem Binden nicht mehr
    pub user_id: Option<UserId>,
    pub peer: SocketAddr,
    pub tx: mpsc::Sender<Bytes>,
    pub online: bool,
    pub angenommen_am: DateTime<Utc>,
}

/// Ereignisse der Registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbindungsEreignis {
    /// Identitaet wurde an eine Verbindung gebunden
    Verbunden {
        verbindung: VerbindungsId,
        user_id: UserId,
    },
    /// Gebundene Verbindung wurde getrennt
    Getrennt {
        verbindung: VerbindungsId,
        user_id: UserId,
    },
    /// Vollstaendiges Frame; `user_id` ist nur bei Login/Registrieren auf
    /// ungebundenen Verbindungen `None`
    Nachricht {
        verbindung: VerbindungsId,
        user_id: Option<UserId>,
        typ: u8,
        payload: Bytes,
    },
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

pub struct ConnectionRegistry {
    verbindungen: HashMap<VerbindungsId, Verbindung>,
    /// Online-Index: user_id -> gebundene Verbindung
    benutzer: HashMap<UserId, VerbindungsId>,
    broadcaster: EventBroadcaster,
    naechste_id: u64,
    max_verbindungen: usize,
    token_pflicht: bool,
    ereignisse: broadcast::Sender<VerbindungsEreignis>,
}

impl ConnectionRegistry {
    pub fn neu(broadcaster: EventBroadcaster, max_verbindungen: usize, token_pflicht: bool) -> Self {
        let (ereignisse, _) = broadcast::channel(EREIGNIS_KAPAZITAET);
        Self {
            verbindungen: HashMap::new(),
            benutzer: HashMap::new(),
            broadcaster,
            naechste_id: 1,
            max_verbindungen,
            token_pflicht,
            ereignisse,
        }
    }

    /// Abonniert Verbunden-, Getrennt- und Nachricht-Ereignisse
    pub fn abonnieren(&self) -> broadcast::Receiver<VerbindungsEreignis> {
        self.ereignisse.subscribe()
    }

    /// Sender des Ereignis-Kanals; haelt selbst keinen Empfaenger offen
    pub fn ereignis_sender(&self) -> broadcast::Sender<VerbindungsEreignis> {
        self.ereignisse.clone()
    }

    fn veroeffentlichen(&self, ereignisse: &[VerbindungsEreignis]) {
        if self.ereignisse.receiver_count() == 0 {
            return;
        }
        for ereignis in ereignisse {
            let _ = self.ereignisse.send(ereignis.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Lebenszyklus
    // -----------------------------------------------------------------------

    /// Legt eine neue, noch ungebundene Verbindung an
    ///
    /// Es findet keine Authentifizierung statt.
    pub fn verbindung_annehmen(
        &mut self,
        peer: SocketAddr,
        tx: mpsc::Sender<Bytes>,
    ) -> SignalingResult<VerbindungsId> {
        if self.verbindungen.len() >= self.max_verbindungen {
            tracing::warn!(
                peer = %peer,
                max = self.max_verbindungen,
                "Server voll – Verbindung abgelehnt"
            );
            return Err(SignalingError::ServerVoll(self.max_verbindungen));
        }

        let id = VerbindungsId(self.naechste_id);
        self.naechste_id += 1;

        self.verbindungen.insert(
            id,
            Verbindung {
                id,
                user_id: None,
                peer,
                tx,
                online: true,
                angenommen_am: Utc::now(),
            },
        );

        tracing::debug!(peer = %peer, verbindung = %id, "Verbindung angenommen");
        Ok(id)
    }

    /// Verarbeitet ein vollstaendiges Frame einer Verbindung
    ///
    /// Auf einer ungebundenen Verbindung bindet das erste Frame die Identitaet
    /// aus dem Praefix. Im gehaerteten Modus wird `token_pruefen` mit der
    /// beanspruchten Identitaet und dem mitgesendeten Token aufgerufen.
    ///
    /// Jeder Fehler ist ein Protokollfehler: die Verbindung muss geschlossen werden.
    pub fn frame_annehmen(
        &mut self,
        id: VerbindungsId,
        frame: RohFrame,
        token_pruefen: impl FnOnce(&UserId, &str) -> SignalingResult<()>,
    ) -> SignalingResult<Vec<VerbindungsEreignis>> {
        let Some(verbindung) = self.verbindungen.get(&id) else {
            // Frame nach dem Trennen – verwerfen
            tracing::trace!(verbindung = %id, "Frame fuer unbekannte Verbindung verworfen");
            return Ok(Vec::new());
        };
        let gebunden = verbindung.user_id.clone();

        let ereignisse = if let Some(user_id) = gebunden {
            vec![VerbindungsEreignis::Nachricht {
                verbindung: id,
                user_id: Some(user_id),
                typ: frame.typ,
                payload: frame.body,
            }]
        } else {
            let typ = NachrichtenTyp::try_from(frame.typ)?;
            if typ.ohne_identitaet_erlaubt() {
                vec![VerbindungsEreignis::Nachricht {
                    verbindung: id,
                    user_id: None,
                    typ: frame.typ,
                    payload: frame.body,
                }]
            } else {
                self.binden(id, typ, frame.body, token_pruefen)?
            }
        };

        self.veroeffentlichen(&ereignisse);
        Ok(ereignisse)
    }

    fn binden(
        &mut self,
        id: VerbindungsId,
        typ: NachrichtenTyp,
        body: Bytes,
        token_pruefen: impl FnOnce(&UserId, &str) -> SignalingResult<()>,
    ) -> SignalingResult<Vec<VerbindungsEreignis>> {
        let registrierung = Registrierung::aus_body(body)?;
        let user_id = registrierung.user_id.clone();

        let payload = if self.token_pflicht {
            if typ != NachrichtenTyp::Heartbeat {
                return Err(SignalingError::protokoll(
                    "Registrierung erfordert Heartbeat mit Token",
                ));
            }
            let token = registrierung.token()?;
            token_pruefen(&user_id, &token).map_err(|e| {
                SignalingError::protokoll(format!("Registrierung als {user_id} abgewiesen: {e}"))
            })?;
            // Token nicht an Abonnenten weiterreichen
            Bytes::new()
        } else {
            registrierung.rest
        };

        if !self.verbindungen.contains_key(&id) {
            return Ok(Vec::new());
        }

        let mut ereignisse = Vec::with_capacity(3);
        if let Some(&alte) = self.benutzer.get(&user_id) {
            if alte != id {
                tracing::info!(
                    user_id = %user_id,
                    alte = %alte,
                    neue = %id,
                    "Identitaet uebernommen – alte Verbindung wird geschlossen"
                );
                ereignisse.extend(self.entfernen(alte));
            }
        }

        let Some(verbindung) = self.verbindungen.get_mut(&id) else {
            return Ok(Vec::new());
        };
        verbindung.user_id = Some(user_id.clone());
        self.broadcaster
            .client_registrieren(user_id.clone(), id, verbindung.tx.clone());
        self.benutzer.insert(user_id.clone(), id);

        tracing::info!(user_id = %user_id, peer = %verbindung.peer, "Identitaet gebunden");

        ereignisse.push(VerbindungsEreignis::Verbunden {
            verbindung: id,
            user_id: user_id.clone(),
        });
        ereignisse.push(VerbindungsEreignis::Nachricht {
            verbindung: id,
            user_id: Some(user_id),
            typ: typ.als_byte(),
            payload,
        });
        Ok(ereignisse)
    }

    /// Entfernt eine Verbindung
    ///
    /// Idempotent. Gibt `Getrennt` nur fuer gebundene Verbindungen zurueck.
    pub fn verbindung_trennen(&mut self, id: VerbindungsId) -> Option<VerbindungsEreignis> {
        let ereignis = self.entfernen(id)?;
        self.veroeffentlichen(std::slice::from_ref(&ereignis));
        Some(ereignis)
    }

    /// Wie `verbindung_trennen`, aber ohne an Abonnenten zu verteilen
    fn entfernen(&mut self, id: VerbindungsId) -> Option<VerbindungsEreignis> {
        let mut verbindung = self.verbindungen.remove(&id)?;
        verbindung.online = false;

        let Some(user_id) = verbindung.user_id else {
            tracing::debug!(peer = %verbindung.peer, verbindung = %id, "Ungebundene Verbindung getrennt");
            return None;
        };

        if self.benutzer.get(&user_id) == Some(&id) {
            self.benutzer.remove(&user_id);
        }
        self.broadcaster.client_entfernen(&user_id, id);

        tracing::info!(user_id = %user_id, peer = %verbindung.peer, "Verbindung getrennt");

        Some(VerbindungsEreignis::Getrennt {
            verbindung: id,
            user_id,
        })
    }

    // -----------------------------------------------------------------------
    // Senden
    // -----------------------------------------------------------------------

    /// Sendet ein kodiertes Frame an die gebundene Verbindung eines Benutzers
    pub fn senden(&self, user_id: &UserId, frame: Bytes) -> SignalingResult<()> {
        self.broadcaster.an_user_senden(user_id, frame)
    }

    /// Sendet ein kodiertes Frame an eine bestimmte (auch ungebundene) Verbindung
    pub fn an_verbindung_senden(&self, id: VerbindungsId, frame: Bytes) -> SignalingResult<()> {
        let verbindung = self
            .verbindungen
            .get(&id)
            .ok_or_else(|| SignalingError::EmpfaengerUnbekannt(id.to_string()))?;

        verbindung.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(verbindung = %id, "Send-Queue voll – Frame verworfen");
                SignalingError::SendeQueueVoll(id.to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SignalingError::EmpfaengerOffline(id.to_string()),
        })
    }

    /// Sendet an alle gebundenen Verbindungen, gibt die Anzahl zurueck
    pub fn an_alle_senden(&self, frame: Bytes) -> usize {
        self.broadcaster.an_alle_senden(frame)
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    /// Alle Benutzer mit gebundener Verbindung (sortiert)
    pub fn online_benutzer(&self) -> Vec<UserId> {
        let mut benutzer: Vec<UserId> = self.benutzer.keys().cloned().collect();
        benutzer.sort();
        benutzer
    }

    pub fn ist_online(&self, user_id: &UserId) -> bool {
        self.benutzer.contains_key(user_id)
    }

    pub fn verbindungs_anzahl(&self) -> usize {
        self.verbindungen.len()
    }

    pub fn online_anzahl(&self) -> usize {
        self.benutzer.len()
    }

    pub fn verbindung(&self, id: VerbindungsId) -> Option<&Verbindung> {
        self.verbindungen.get(&id)
    }

    pub fn user_fuer_verbindung(&self, id: VerbindungsId) -> Option<&UserId> {
        self.verbindungen.get(&id)?.user_id.as_ref()
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ringway_core::CallId;
    use ringway_protocol::ClientNachricht;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::neu(EventBroadcaster::neu(), 16, false)
    }

    fn annehmen(registry: &mut ConnectionRegistry) -> (VerbindungsId, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        (registry.verbindung_annehmen(peer(), tx).unwrap(), rx)
    }

    fn erstes_frame(user: &str, nachricht: ClientNachricht) -> RohFrame {
        Registrierung::frame_bauen(&UserId::from(user), &nachricht).unwrap()
    }

    fn immer_gueltig(_: &UserId, _: &str) -> SignalingResult<()> {
        Ok(())
    }

    #[test]
    fn erstes_frame_bindet_identitaet() {
        let mut registry = registry();
        let (id, _rx) = annehmen(&mut registry);

        let ereignisse = registry
            .frame_annehmen(id, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();

        assert_eq!(ereignisse.len(), 2);
        assert_eq!(
            ereignisse[0],
            VerbindungsEreignis::Verbunden {
                verbindung: id,
                user_id: UserId::from("alice")
            }
        );
        assert!(matches!(
            &ereignisse[1],
            VerbindungsEreignis::Nachricht { typ: 7, user_id: Some(u), .. } if u.as_str() == "alice"
        ));
        assert!(registry.ist_online(&UserId::from("alice")));
        assert!(registry.broadcaster().ist_registriert(&UserId::from("alice")));
    }

    #[test]
    fn folgeframes_tragen_kein_praefix() {
        let mut registry = registry();
        let (id, _rx) = annehmen(&mut registry);
        registry
            .frame_annehmen(id, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();

        // "bob" waere als Praefix interpretiert worden – hier ist es die callId
        let folge = ClientNachricht::AnrufBeenden {
            call_id: CallId::from("bob"),
        }
        .kodieren()
        .unwrap();
        let ereignisse = registry.frame_annehmen(id, folge.clone(), immer_gueltig).unwrap();

        assert_eq!(
            ereignisse,
            vec![VerbindungsEreignis::Nachricht {
                verbindung: id,
                user_id: Some(UserId::from("alice")),
                typ: 5,
                payload: folge.body,
            }]
        );
        assert_eq!(registry.user_fuer_verbindung(id), Some(&UserId::from("alice")));
    }

    #[test]
    fn login_ohne_praefix_bindet_nicht() {
        let mut registry = registry();
        let (id, _rx) = annehmen(&mut registry);

        let frame = ClientNachricht::Login(ringway_protocol::Anmeldedaten {
            benutzername: "alice".into(),
            passwort: "pw".into(),
        })
        .kodieren()
        .unwrap();

        let ereignisse = registry.frame_annehmen(id, frame, immer_gueltig).unwrap();
        assert!(matches!(
            &ereignisse[..],
            [VerbindungsEreignis::Nachricht { user_id: None, typ: 8, .. }]
        ));
        assert_eq!(registry.online_anzahl(), 0);
    }

    #[test]
    fn neue_verbindung_uebernimmt_identitaet() {
        let mut registry = registry();
        let mut abo = registry.abonnieren();
        let (erste, mut rx1) = annehmen(&mut registry);
        let (zweite, _rx2) = annehmen(&mut registry);

        registry
            .frame_annehmen(erste, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();
        let ereignisse = registry
            .frame_annehmen(zweite, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();

        assert_eq!(ereignisse.len(), 3);
        assert_eq!(
            ereignisse[0],
            VerbindungsEreignis::Getrennt {
                verbindung: erste,
                user_id: UserId::from("alice")
            }
        );
        assert_eq!(
            ereignisse[1],
            VerbindungsEreignis::Verbunden {
                verbindung: zweite,
                user_id: UserId::from("alice")
            }
        );
        assert_eq!(registry.user_fuer_verbindung(zweite), Some(&UserId::from("alice")));
        assert!(registry.verbindung(erste).is_none());
        assert_eq!(registry.online_anzahl(), 1);
        assert_eq!(registry.verbindungs_anzahl(), 1);

        // Alte Send-Queue hat keinen Sender mehr: der Verbindungs-Task schliesst den Socket
        assert!(matches!(
            rx1.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(registry.verbindung_trennen(erste), None);

        // Getrennt wird genau einmal verteilt
        let mut getrennt = 0;
        while let Ok(ereignis) = abo.try_recv() {
            if matches!(ereignis, VerbindungsEreignis::Getrennt { .. }) {
                getrennt += 1;
            }
        }
        assert_eq!(getrennt, 1);
    }

    #[test]
    fn online_benutzer_sortiert() {
        let mut registry = registry();
        assert!(registry.online_benutzer().is_empty());

        let mut ids = Vec::new();
        for name in ["carol", "alice", "bob"] {
            let (id, rx) = annehmen(&mut registry);
            registry
                .frame_annehmen(id, erstes_frame(name, ClientNachricht::Heartbeat), immer_gueltig)
                .unwrap();
            ids.push((id, rx));
        }
        // Ungebundene Verbindung zaehlt nicht
        let (_ungebunden, _rx) = annehmen(&mut registry);

        assert_eq!(
            registry.online_benutzer(),
            vec![UserId::from("alice"), UserId::from("bob"), UserId::from("carol")]
        );

        registry.verbindung_trennen(ids[2].0);
        assert_eq!(
            registry.online_benutzer(),
            vec![UserId::from("alice"), UserId::from("carol")]
        );
    }

    #[test]
    fn unbekannter_typ_ist_protokollfehler() {
        let mut registry = registry();
        let (id, _rx) = annehmen(&mut registry);
        let ergebnis = registry.frame_annehmen(id, RohFrame::neu(0x42, Bytes::new()), immer_gueltig);
        assert!(matches!(ergebnis, Err(SignalingError::Protokoll(_))));
    }

    #[test]
    fn trennen_ist_idempotent() {
        let mut registry = registry();
        let (id, _rx) = annehmen(&mut registry);
        registry
            .frame_annehmen(id, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();

        let ereignis = registry.verbindung_trennen(id);
        assert_eq!(
            ereignis,
            Some(VerbindungsEreignis::Getrennt {
                verbindung: id,
                user_id: UserId::from("alice")
            })
        );
        assert_eq!(registry.verbindung_trennen(id), None);
        assert!(!registry.ist_online(&UserId::from("alice")));
        assert!(!registry.broadcaster().ist_registriert(&UserId::from("alice")));
        assert_eq!(registry.verbindungs_anzahl(), 0);
    }

    #[test]
    fn identitaet_nach_trennen_wieder_frei() {
        let mut registry = registry();
        let (erste, _rx1) = annehmen(&mut registry);
        registry
            .frame_annehmen(erste, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();
        registry.verbindung_trennen(erste);

        let (zweite, _rx2) = annehmen(&mut registry);
        assert!(registry
            .frame_annehmen(zweite, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .is_ok());
        assert_ne!(erste, zweite);
    }

    #[test]
    fn verbindungslimit() {
        let mut registry = ConnectionRegistry::neu(EventBroadcaster::neu(), 1, false);
        let (_id, _rx) = annehmen(&mut registry);
        let (tx, _rx2) = mpsc::channel(1);
        assert!(matches!(
            registry.verbindung_annehmen(peer(), tx),
            Err(SignalingError::ServerVoll(1))
        ));
    }

    #[test]
    fn senden_an_ungebundene_verbindung() {
        let mut registry = registry();
        let (id, mut rx) = annehmen(&mut registry);
        registry
            .an_verbindung_senden(id, Bytes::from_static(b"antwort"))
            .unwrap();
        assert_eq!(&rx.try_recv().unwrap()[..], b"antwort");

        assert!(matches!(
            registry.senden(&UserId::from("alice"), Bytes::new()),
            Err(SignalingError::EmpfaengerUnbekannt(_))
        ));
    }

    #[test]
    fn gehaerteter_modus_verlangt_token() {
        let mut registry = ConnectionRegistry::neu(EventBroadcaster::neu(), 16, true);

        // Kein Heartbeat
        let (id, _rx) = annehmen(&mut registry);
        let frame = erstes_frame(
            "alice",
            ClientNachricht::AnrufBeenden {
                call_id: CallId::from("x"),
            },
        );
        assert!(registry.frame_annehmen(id, frame, immer_gueltig).is_err());

        // Heartbeat mit falschem Token
        let (id, _rx) = annehmen(&mut registry);
        let mut body = bytes::BytesMut::new();
        ringway_protocol::nachricht::string_schreiben(&mut body, "alice", "userId").unwrap();
        ringway_protocol::nachricht::string_schreiben(&mut body, "tok", "token").unwrap();
        let frame = RohFrame::neu(7, body.freeze());
        let ergebnis = registry.frame_annehmen(id, frame.clone(), |_, token| {
            if token == "anderer" {
                Ok(())
            } else {
                Err(SignalingError::Auth(ringway_auth::AuthError::TokenUngueltig))
            }
        });
        assert!(matches!(ergebnis, Err(SignalingError::Protokoll(_))));

        // Heartbeat mit passendem Token
        let (id, _rx) = annehmen(&mut registry);
        let ereignisse = registry
            .frame_annehmen(id, frame, |user, token| {
                if user.as_str() == "alice" && token == "tok" {
                    Ok(())
                } else {
                    Err(SignalingError::Auth(ringway_auth::AuthError::TokenUngueltig))
                }
            })
            .unwrap();
        assert!(matches!(
            &ereignisse[1],
            VerbindungsEreignis::Nachricht { typ: 7, payload, .. } if payload.is_empty()
        ));
    }

    #[tokio::test]
    async fn abonnenten_erhalten_ereignisse() {
        let mut registry = registry();
        let mut rx = registry.abonnieren();
        let (id, _out) = annehmen(&mut registry);

        registry
            .frame_annehmen(id, erstes_frame("alice", ClientNachricht::Heartbeat), immer_gueltig)
            .unwrap();
        registry.verbindung_trennen(id);

        assert!(matches!(rx.recv().await.unwrap(), VerbindungsEreignis::Verbunden { .. }));
        assert!(matches!(rx.recv().await.unwrap(), VerbindungsEreignis::Nachricht { .. }));
        assert!(matches!(rx.recv().await.unwrap(), VerbindungsEreignis::Getrennt { .. }));
    }
}
