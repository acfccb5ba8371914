//! Fehlerklassen fuer Ringway
//!
//! Jedes Crate definiert seinen eigenen Fehler-Enum. Damit Dispatcher,
//! Logging und Metriken einheitlich reagieren koennen, ordnet jeder Fehler
//! sich ueber `FehlerKlassifizierung` genau einer `FehlerArt` zu.

use thiserror::Error;

/// Uebergeordnete Fehlerart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FehlerArt {
    /// Fehlerhaftes Frame – Verbindung wird geschlossen
    #[error("Protokollfehler")]
    Protokoll,

    /// Unbekannter Benutzer, falsche Anmeldedaten, ungueltiger Token
    #[error("Authentifizierungsfehler")]
    Authentifizierung,

    /// Operation im aktuellen Anrufzustand nicht erlaubt
    #[error("Ungueltiger Sitzungszustand")]
    Sitzungszustand,

    /// Unbekannte callId / userId / Token
    #[error("Nicht gefunden")]
    NichtGefunden,

    /// Teilnehmer ist bereits in einem Anruf
    #[error("Bereits im Anruf")]
    BereitsImAnruf,

    /// Transport (Bind, Senden, IO)
    #[error("Transportfehler")]
    Transport,

    /// Interner Fehler
    #[error("Interner Fehler")]
    Intern,
}

impl FehlerArt {
    /// Gibt `true` zurueck wenn die Verbindung des Verursachers geschlossen werden muss
    pub fn schliesst_verbindung(&self) -> bool {
        matches!(self, Self::Protokoll)
    }

    /// Kurzer Bezeichner fuer Metrik-Labels und strukturierte Logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Protokoll => "protokoll",
            Self::Authentifizierung => "auth",
            Self::Sitzungszustand => "zustand",
            Self::NichtGefunden => "nicht_gefunden",
            Self::BereitsImAnruf => "besetzt",
            Self::Transport => "transport",
            Self::Intern => "intern",
        }
    }
}

/// Ordnet einen konkreten Fehler einer `FehlerArt` zu
pub trait FehlerKlassifizierung {
    fn art(&self) -> FehlerArt;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nur_protokollfehler_schliessen() {
        assert!(FehlerArt::Protokoll.schliesst_verbindung());
        assert!(!FehlerArt::Authentifizierung.schliesst_verbindung());
        assert!(!FehlerArt::NichtGefunden.schliesst_verbindung());
    }

    #[test]
    fn labels_eindeutig() {
        let arten = [
            FehlerArt::Protokoll,
            FehlerArt::Authentifizierung,
            FehlerArt::Sitzungszustand,
            FehlerArt::NichtGefunden,
            FehlerArt::BereitsImAnruf,
            FehlerArt::Transport,
            FehlerArt::Intern,
        ];
        let mut labels: Vec<_> = arten.iter().map(|a| a.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), arten.len());
    }
}
