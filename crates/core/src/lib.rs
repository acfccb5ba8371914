//! ringway-core – Gemeinsame Typen und Fehlerklassen
//!
//! Dieses Crate stellt die Identifikationstypen und die Fehler-Klassifizierung
//! bereit, die von allen anderen Ringway-Crates gemeinsam genutzt werden.

pub mod error;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{FehlerArt, FehlerKlassifizierung};
pub use types::{CallId, UserId, VerbindungsId};
