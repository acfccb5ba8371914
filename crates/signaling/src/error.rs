//! Fehlertypen fuer den Signaling-Service

use std::net::SocketAddr;

use ringway_auth::AuthError;
use ringway_core::{CallId, FehlerArt, FehlerKlassifizierung, UserId};
use ringway_protocol::ProtokollFehler;
use thiserror::Error;

/// Fehlertyp fuer den Signaling-Service
#[derive(Debug, Error)]
pub enum SignalingError {
    /// IO-Fehler (TCP, Socket)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// TCP-Port konnte nicht gebunden werden
    #[error("Bind auf {adresse} fehlgeschlagen: {quelle}")]
    Bind {
        adresse: SocketAddr,
        #[source]
        quelle: std::io::Error,
    },

    /// Fehlerhaftes Frame oder unzulaessige Registrierung
    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    /// Authentifizierungsfehler
    #[error("Authentifizierungsfehler: {0}")]
    Auth(#[from] AuthError),

    // --- Anrufe ---
    #[error("Anruf nicht gefunden: {0}")]
    AnrufNichtGefunden(CallId),

    #[error("Anruf {call_id} ist nicht im Zustand {erwartet}")]
    UngueltigerZustand {
        call_id: CallId,
        erwartet: &'static str,
    },

    #[error("Benutzer ist bereits im Anruf: {0}")]
    BereitsImAnruf(UserId),

    #[error("Selbstanruf nicht moeglich")]
    SelbstAnruf,

    #[error("{user_id} ist nicht Teilnehmer von Anruf {call_id}")]
    NichtTeilnehmer { call_id: CallId, user_id: UserId },

    // --- Senden ---
    #[error("Empfaenger unbekannt: {0}")]
    EmpfaengerUnbekannt(String),

    #[error("Empfaenger offline: {0}")]
    EmpfaengerOffline(String),

    #[error("Send-Queue voll: {0}")]
    SendeQueueVoll(String),

    /// Server ist voll
    #[error("Server ist voll ({0} Verbindungen)")]
    ServerVoll(usize),

    /// Worker-Task laeuft nicht mehr
    #[error("Signaling-Worker nicht erreichbar")]
    WorkerBeendet,
}

impl SignalingError {
    /// Erstellt einen Protokollfehler
    pub fn protokoll(msg: impl Into<String>) -> Self {
        Self::Protokoll(msg.into())
    }
}

impl From<ProtokollFehler> for SignalingError {
    fn from(fehler: ProtokollFehler) -> Self {
        match fehler {
            ProtokollFehler::Io(e) => Self::Io(e),
            andere => Self::Protokoll(andere.to_string()),
        }
    }
}

impl FehlerKlassifizierung for SignalingError {
    fn art(&self) -> FehlerArt {
        match self {
            Self::Protokoll(_) => FehlerArt::Protokoll,
            Self::Auth(e) => e.art(),
            Self::AnrufNichtGefunden(_) => FehlerArt::NichtGefunden,
            Self::UngueltigerZustand { .. } | Self::SelbstAnruf | Self::NichtTeilnehmer { .. } => {
                FehlerArt::Sitzungszustand
            }
            Self::BereitsImAnruf(_) => FehlerArt::BereitsImAnruf,
            Self::Io(_)
            | Self::Bind { .. }
            | Self::EmpfaengerUnbekannt(_)
            | Self::EmpfaengerOffline(_)
            | Self::SendeQueueVoll(_)
            | Self::ServerVoll(_) => FehlerArt::Transport,
            Self::WorkerBeendet => FehlerArt::Intern,
        }
    }
}

/// Result-Typ fuer den Signaling-Service
pub type SignalingResult<T> = Result<T, SignalingError>;
