//! ringway-protocol – Wire-Protokoll-Definitionen
//!
//! Dieses Crate definiert das Frame-Format, den inkrementellen Decoder und
//! alle Nachrichten die zwischen Client und Server ausgetauscht werden.

pub mod error;
pub mod nachricht;
pub mod wire;

pub use error::{ProtokollFehler, ProtokollResult};
pub use nachricht::{
    Anmeldedaten, AuthAntwort, ClientNachricht, NachrichtenTyp, Registrierung, ServerNachricht,
};
pub use wire::{FrameCodec, RohFrame};
