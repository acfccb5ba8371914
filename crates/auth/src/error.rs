//! Fehlertypen fuer den AuthManager

use ringway_core::{FehlerArt, FehlerKlassifizierung};
use thiserror::Error;

/// Alle moeglichen Fehler im AuthManager
#[derive(Debug, Error)]
pub enum AuthError {
    // --- Eingabe ---
    #[error("Benutzername und Passwort duerfen nicht leer sein")]
    LeereEingabe,

    // --- Passwort ---
    #[error("Passwort-Hashing fehlgeschlagen: {0}")]
    PasswortHashing(String),

    // --- Authentifizierung ---
    #[error("Benutzername oder Passwort falsch")]
    UngueltigeAnmeldedaten,

    #[error("Zu viele laufende Anmeldungen, bitte spaeter erneut versuchen")]
    Ausgelastet,

    // --- Benutzerverwaltung ---
    #[error("Benutzername bereits vergeben: {0}")]
    BenutzernameVergeben(String),

    #[error("Benutzer nicht gefunden: {0}")]
    BenutzerNichtGefunden(String),

    // --- Token ---
    #[error("Token nicht gefunden")]
    TokenNichtGefunden,

    #[error("Token ungueltig oder abgelaufen")]
    TokenUngueltig,
}

impl FehlerKlassifizierung for AuthError {
    fn art(&self) -> FehlerArt {
        match self {
            Self::BenutzerNichtGefunden(_) | Self::TokenNichtGefunden => FehlerArt::NichtGefunden,
            Self::PasswortHashing(_) => FehlerArt::Intern,
            _ => FehlerArt::Authentifizierung,
        }
    }
}

/// Result-Alias fuer den AuthManager
pub type AuthResult<T> = Result<T, AuthError>;
