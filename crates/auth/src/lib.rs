//! ringway-auth – AuthManager
//!
//! Dieses Crate implementiert:
//! - Passwort-Hashing mit Argon2id und eigenem Salt pro Benutzer
//! - Benutzerregistrierung und Anmeldung (in-memory)
//! - Bearer-Tokens mit TTL, hoechstens ein gueltiger Token pro Benutzer

pub mod error;
pub mod manager;
pub mod password;

// Bequeme Re-Exporte
pub use error::{AuthError, AuthResult};
pub use manager::{
    AuthEreignis, AuthKonfiguration, AuthManager, AuthToken, Benutzerdaten, HashAuftrag,
    HashErgebnis,
};
pub use password::{passwort_hashen, passwort_verifizieren, HashParameter};
