//! Fehlertypen fuer das Wire-Protokoll

use ringway_core::{FehlerArt, FehlerKlassifizierung};
use thiserror::Error;

/// Alle Fehler beim Lesen und Schreiben von Frames
#[derive(Debug, Error)]
pub enum ProtokollFehler {
    /// IO-Fehler des darunterliegenden Streams
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame zu gross: {laenge} Bytes (Maximum: {maximum} Bytes)")]
    FrameZuGross { laenge: usize, maximum: usize },

    /// Laengenfeld 0 – nicht einmal ein Typ-Byte
    #[error("Leeres Frame")]
    LeeresFrame,

    #[error("Unbekannter Nachrichtentyp: {0:#04x}")]
    UnbekannterTyp(u8),

    /// Bekannter Typ, aber in dieser Richtung nicht erlaubt
    #[error("Unerwarteter Nachrichtentyp: {0:#04x}")]
    UnerwarteterTyp(u8),

    #[error("Frame unvollstaendig, Feld '{feld}' fehlt")]
    Unvollstaendig { feld: &'static str },

    #[error("Feld '{feld}' ist kein gueltiges UTF-8")]
    UngueltigesUtf8 { feld: &'static str },

    #[error("{anzahl} ueberzaehlige Bytes in Nachricht {typ:#04x}")]
    UeberzaehligeBytes { typ: u8, anzahl: usize },

    #[error("Feld '{feld}' zu lang: {laenge} Bytes (Maximum: 65535)")]
    StringZuLang { feld: &'static str, laenge: usize },

    #[error("Leere User-ID im Registrierungs-Frame")]
    LeereUserId,
}

impl FehlerKlassifizierung for ProtokollFehler {
    fn art(&self) -> FehlerArt {
        match self {
            Self::Io(_) => FehlerArt::Transport,
            _ => FehlerArt::Protokoll,
        }
    }
}

/// Result-Alias fuer das Wire-Protokoll
pub type ProtokollResult<T> = Result<T, ProtokollFehler>;
