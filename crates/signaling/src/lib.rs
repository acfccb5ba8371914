//! ringway-signaling – TCP-Signaling- und Anruf-Service
//!
//! Dieser Crate implementiert den Signaling-Kern fuer Ringway. Er nimmt
//! TCP-Verbindungen an, bindet Identitaeten, steuert den Lebenszyklus von
//! Anrufen und leitet Mediendaten zwischen den Teilnehmern weiter.
//!
//! ## Architektur
//!
//! ```text
//! TCP Listener (SignalingServer)
//!     |
//!     v
//! ClientConnection (pro Verbindung ein Task, FrameCodec)
//!     |  Befehl::Frame / Getrennt / ProtokollFehler
//!     v
//! SignalingKern (ein Worker, eine Queue)
//!     |
//!     +-- ConnectionRegistry   (Verbindungen, Identitaet, Ereignisse)
//!     +-- AuthManager          (Login, Registrieren, Tokens)
//!     +-- CallSignalingEngine  (Anruf-Zustandsmaschine, Medien-Relay)
//!
//! EventBroadcaster – Send-Queues aller gebundenen Verbindungen
//! Zeitgeber        – Token-Bereinigung, Klingel-Timeout
//! ```

pub mod broadcast;
pub mod connection;
pub mod dienst;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod extern_;
pub mod konfig;
pub mod registry;
pub mod tcp;
pub mod zeitgeber;

// Bequeme Re-Exporte
pub use broadcast::EventBroadcaster;
pub use connection::ClientConnection;
pub use dienst::SignalingDienst;
pub use dispatcher::{Befehl, SignalingKern};
pub use engine::{AnrufEreignis, AnrufSitzung, AnrufStatus, CallSignalingEngine};
pub use error::{SignalingError, SignalingResult};
pub use extern_::{MedienAnbieter, MedienBruecke, Persistenz, PersistenzBruecke};
pub use konfig::SignalingKonfiguration;
pub use registry::{ConnectionRegistry, VerbindungsEreignis};
pub use tcp::SignalingServer;
