//! CallSignalingEngine – Zustandsmaschine der Anruf-Sitzungen
//!
//! Die Engine besitzt alle Anruf-Sitzungen und den Index Benutzer -> Anruf.
//! Sie wird ausschliesslich vom Signaling-Worker aufgerufen und sendet ihre
//! Frames ueber einen Clone des `EventBroadcaster`.
//!
//! ## Zustaende
//! ```text
//! Anfrage ──(annehmen)──> Aktiv ──(beenden)──> Beendet
//!    │                      │
//!    ├──(ablehnen)──────────┼──────────────> Beendet
//!    └──(Trennung)──────────┘
//! ```
//! `Beendet` ist terminal, die Sitzung wird sofort entfernt.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ringway_core::{CallId, UserId};
use ringway_protocol::ServerNachricht;
use tokio::sync::broadcast;

use crate::broadcast::EventBroadcaster;
use crate::error::{SignalingError, SignalingResult};

/// Grund fuer automatisch abgelehnte Anrufe
pub const GRUND_ZEITUEBERSCHREITUNG: &str = "Zeitueberschreitung";

const EREIGNIS_KAPAZITAET: usize = 256;

// ---------------------------------------------------------------------------
// Datentypen
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnrufStatus {
    /// Angerufener wurde benachrichtigt, Antwort steht aus
    Anfrage,
    Aktiv,
    Beendet,
}

impl AnrufStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anfrage => "Anfrage",
            Self::Aktiv => "Aktiv",
            Self::Beendet => "Beendet",
        }
    }
}

/// Eine Anruf-Sitzung zwischen zwei Benutzern
#[derive(Debug, Clone)]
pub struct AnrufSitzung {
    pub call_id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub status: AnrufStatus,
    pub video: bool,
    /// Zeitpunkt der Anfrage, beim Annehmen neu gesetzt
    pub start_zeit: DateTime<Utc>,
    pub end_zeit: Option<DateTime<Utc>>,
}

impl AnrufSitzung {
    pub fn ist_teilnehmer(&self, user_id: &UserId) -> bool {
        &self.caller == user_id || &self.callee == user_id
    }

    /// Der jeweils andere Teilnehmer
    pub fn gegenueber(&self, user_id: &UserId) -> Option<&UserId> {
        if &self.caller == user_id {
            Some(&self.callee)
        } else if &self.callee == user_id {
            Some(&self.caller)
        } else {
            None
        }
    }

    /// Dauer seit `start_zeit` bis Ende (oder jetzt)
    pub fn dauer(&self) -> chrono::Duration {
        self.end_zeit.unwrap_or_else(Utc::now) - self.start_zeit
    }
}

/// Ereignisse der Engine fuer externe Abonnenten (z.B. Medien-Anbieter)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnrufEreignis {
    Gestartet {
        call_id: CallId,
        caller: UserId,
        callee: UserId,
        video: bool,
    },
    Angenommen {
        call_id: CallId,
        caller: UserId,
        callee: UserId,
    },
    Abgelehnt {
        call_id: CallId,
        grund: String,
    },
    Beendet {
        call_id: CallId,
        dauer_ms: i64,
    },
}

// ---------------------------------------------------------------------------
// CallSignalingEngine
// ---------------------------------------------------------------------------

pub struct CallSignalingEngine {
    sitzungen: HashMap<CallId, AnrufSitzung>,
    /// Hoechstens ein laufender Anruf pro Benutzer
    benutzer_index: HashMap<UserId, CallId>,
    broadcaster: EventBroadcaster,
    ereignisse: broadcast::Sender<AnrufEreignis>,
}

impl CallSignalingEngine {
    pub fn neu(broadcaster: EventBroadcaster) -> Self {
        let (ereignisse, _) = broadcast::channel(EREIGNIS_KAPAZITAET);
        Self {
            sitzungen: HashMap::new(),
            benutzer_index: HashMap::new(),
            broadcaster,
            ereignisse,
        }
    }

    pub fn abonnieren(&self) -> broadcast::Receiver<AnrufEreignis> {
        self.ereignisse.subscribe()
    }

    pub fn ereignis_sender(&self) -> broadcast::Sender<AnrufEreignis> {
        self.ereignisse.clone()
    }

    fn ereignis_senden(&self, ereignis: AnrufEreignis) {
        let _ = self.ereignisse.send(ereignis);
    }

    /// Best-effort: Fehler werden nur geloggt
    fn senden(&self, empfaenger: &UserId, nachricht: ServerNachricht) -> bool {
        let frame = match nachricht.in_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id = %empfaenger, fehler = %e, "Frame konnte nicht kodiert werden");
                return false;
            }
        };
        match self.broadcaster.an_user_senden(empfaenger, frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(user_id = %empfaenger, fehler = %e, "Zustellung fehlgeschlagen");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Anrufsteuerung
    // -----------------------------------------------------------------------

    /// Startet einen Anruf und benachrichtigt den Angerufenen
    ///
    /// Die Sitzung entsteht auch wenn der Angerufene offline ist.
    pub fn anruf_starten(
        &mut self,
        caller: &UserId,
        callee: &UserId,
        video: bool,
    ) -> SignalingResult<CallId> {
        if caller == callee {
            return Err(SignalingError::SelbstAnruf);
        }
        for teilnehmer in [caller, callee] {
            if self.ist_im_anruf(teilnehmer) {
                return Err(SignalingError::BereitsImAnruf(teilnehmer.clone()));
            }
        }

        let mut call_id = CallId::neu();
        while self.sitzungen.contains_key(&call_id) {
            call_id = CallId::neu();
        }

        let sitzung = AnrufSitzung {
            call_id: call_id.clone(),
            caller: caller.clone(),
            callee: callee.clone(),
            status: AnrufStatus::Anfrage,
            video,
            start_zeit: Utc::now(),
            end_zeit: None,
        };
        self.sitzungen.insert(call_id.clone(), sitzung);
        self.benutzer_index.insert(caller.clone(), call_id.clone());
        self.benutzer_index.insert(callee.clone(), call_id.clone());

        tracing::info!(
            call_id = %call_id,
            caller = %caller,
            callee = %callee,
            video,
            "Anruf gestartet"
        );

        let zugestellt = self.senden(
            callee,
            ServerNachricht::AnrufAnfrage {
                call_id: call_id.clone(),
                caller: caller.clone(),
                video,
            },
        );
        if !zugestellt {
            tracing::info!(call_id = %call_id, callee = %callee, "Angerufener nicht erreichbar");
        }

        self.ereignis_senden(AnrufEreignis::Gestartet {
            call_id: call_id.clone(),
            caller: caller.clone(),
            callee: callee.clone(),
            video,
        });

        Ok(call_id)
    }

    /// Nimmt einen Anruf an (nur aus `Anfrage`)
    pub fn anruf_annehmen(&mut self, call_id: &CallId) -> SignalingResult<()> {
        let sitzung = self
            .sitzungen
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::AnrufNichtGefunden(call_id.clone()))?;

        if sitzung.status != AnrufStatus::Anfrage {
            return Err(SignalingError::UngueltigerZustand {
                call_id: call_id.clone(),
                erwartet: AnrufStatus::Anfrage.name(),
            });
        }

        sitzung.status = AnrufStatus::Aktiv;
        sitzung.start_zeit = Utc::now();
        let caller = sitzung.caller.clone();
        let callee = sitzung.callee.clone();

        tracing::info!(call_id = %call_id, caller = %caller, callee = %callee, "Anruf angenommen");

        for teilnehmer in [&caller, &callee] {
            self.senden(
                teilnehmer,
                ServerNachricht::AnrufAngenommen {
                    call_id: call_id.clone(),
                },
            );
        }

        self.ereignis_senden(AnrufEreignis::Angenommen {
            call_id: call_id.clone(),
            caller,
            callee,
        });
        Ok(())
    }

    /// Lehnt einen Anruf ab und entfernt die Sitzung
    pub fn anruf_ablehnen(&mut self, call_id: &CallId, grund: &str) -> SignalingResult<()> {
        let sitzung = self.sitzung_beenden(call_id)?;

        tracing::info!(call_id = %call_id, grund = %grund, "Anruf abgelehnt");

        for teilnehmer in [&sitzung.caller, &sitzung.callee] {
            self.senden(
                teilnehmer,
                ServerNachricht::AnrufAbgelehnt {
                    call_id: call_id.clone(),
                    grund: grund.to_string(),
                },
            );
        }

        self.ereignis_senden(AnrufEreignis::Abgelehnt {
            call_id: call_id.clone(),
            grund: grund.to_string(),
        });
        Ok(())
    }

    /// Beendet einen Anruf aus jedem nicht-terminalen Zustand
    pub fn anruf_beenden(&mut self, call_id: &CallId) -> SignalingResult<()> {
        let sitzung = self.sitzung_beenden(call_id)?;
        let dauer = sitzung.dauer();

        tracing::info!(
            call_id = %call_id,
            dauer_sek = dauer.num_seconds(),
            "Anruf beendet"
        );

        for teilnehmer in [&sitzung.caller, &sitzung.callee] {
            self.senden(
                teilnehmer,
                ServerNachricht::AnrufBeendet {
                    call_id: call_id.clone(),
                },
            );
        }

        self.ereignis_senden(AnrufEreignis::Beendet {
            call_id: call_id.clone(),
            dauer_ms: dauer.num_milliseconds(),
        });
        Ok(())
    }

    /// Leitet Mediendaten an den anderen Teilnehmer weiter
    ///
    /// Kein Fehler: ohne aktive Sitzung oder fuer Nicht-Teilnehmer passiert nichts.
    /// Gibt `true` zurueck wenn das Frame eingereiht wurde.
    pub fn medien_weiterleiten(&self, call_id: &CallId, von: &UserId, daten: Bytes) -> bool {
        let Some(sitzung) = self.sitzungen.get(call_id) else {
            return false;
        };
        if sitzung.status != AnrufStatus::Aktiv {
            return false;
        }
        let Some(empfaenger) = sitzung.gegenueber(von) else {
            tracing::debug!(call_id = %call_id, user_id = %von, "Mediendaten von Nicht-Teilnehmer ignoriert");
            return false;
        };

        self.senden(
            empfaenger,
            ServerNachricht::Mediendaten {
                call_id: call_id.clone(),
                daten,
            },
        )
    }

    /// Beendet den Anruf eines getrennten Benutzers
    pub fn benutzer_getrennt(&mut self, user_id: &UserId) -> Option<CallId> {
        let call_id = self.benutzer_index.get(user_id)?.clone();
        tracing::info!(user_id = %user_id, call_id = %call_id, "Teilnehmer getrennt – Anruf wird beendet");
        self.anruf_beenden(&call_id).ok()?;
        Some(call_id)
    }

    /// Lehnt alle Anfragen ab die laenger als `max_alter` unbeantwortet sind
    pub fn unbeantwortete_anrufe_beenden(&mut self, max_alter: Duration) -> Vec<CallId> {
        let Ok(max_alter) = chrono::Duration::from_std(max_alter) else {
            return Vec::new();
        };
        let jetzt = Utc::now();

        let abgelaufen: Vec<CallId> = self
            .sitzungen
            .values()
            .filter(|s| s.status == AnrufStatus::Anfrage && jetzt - s.start_zeit >= max_alter)
            .map(|s| s.call_id.clone())
            .collect();

        for call_id in &abgelaufen {
            if let Err(e) = self.anruf_ablehnen(call_id, GRUND_ZEITUEBERSCHREITUNG) {
                tracing::warn!(call_id = %call_id, fehler = %e, "Zeitueberschreitung nicht verarbeitet");
            }
        }
        abgelaufen
    }

    /// Entfernt Sitzung und Index-Eintraege, setzt Status und Endzeit
    fn sitzung_beenden(&mut self, call_id: &CallId) -> SignalingResult<AnrufSitzung> {
        let mut sitzung = self
            .sitzungen
            .remove(call_id)
            .ok_or_else(|| SignalingError::AnrufNichtGefunden(call_id.clone()))?;

        sitzung.status = AnrufStatus::Beendet;
        sitzung.end_zeit = Some(Utc::now());

        for teilnehmer in [&sitzung.caller, &sitzung.callee] {
            if self.benutzer_index.get(teilnehmer) == Some(call_id) {
                self.benutzer_index.remove(teilnehmer);
            }
        }
        Ok(sitzung)
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    pub fn sitzung(&self, call_id: &CallId) -> Option<&AnrufSitzung> {
        self.sitzungen.get(call_id)
    }

    /// Alle laufenden Sitzungen, aelteste zuerst
    pub fn aktive_anrufe(&self) -> Vec<&AnrufSitzung> {
        let mut sitzungen: Vec<_> = self.sitzungen.values().collect();
        sitzungen.sort_by_key(|s| s.start_zeit);
        sitzungen
    }

    pub fn anzahl(&self) -> usize {
        self.sitzungen.len()
    }

    pub fn ist_im_anruf(&self, user_id: &UserId) -> bool {
        self.benutzer_index.contains_key(user_id)
    }

    pub fn anruf_von(&self, user_id: &UserId) -> Option<&CallId> {
        self.benutzer_index.get(user_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
