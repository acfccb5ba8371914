//! Event-Broadcaster – Ausgehende Tabelle aller gebundenen Verbindungen
//!
//! Der EventBroadcaster haelt die Send-Queues aller Verbindungen mit
//! gebundener Identitaet und stellt Methoden bereit, um fertig kodierte
//! Frames gezielt oder an alle zu senden.
//!
//! Geschrieben wird die Tabelle nur vom Signaling-Worker (Registrierung und
//! Trennung). Gelesen wird sie vom Worker und von der Anruf-Engine, die einen
//! Clone desselben Broadcasters haelt.
//!
//! Senden ist immer `try_send`: eine volle Queue verwirft das Frame mit
//! einer Warnung. Es gibt kein Retry und keine Pufferung.

use bytes::Bytes;
use dashmap::DashMap;
use ringway_core::{UserId, VerbindungsId};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{SignalingError, SignalingResult};

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Handle auf die Send-Queue einer gebundenen Verbindung
#[derive(Clone, Debug)]
pub struct ClientSender {
    pub user_id: UserId,
    pub verbindung: VerbindungsId,
    pub tx: mpsc::Sender<Bytes>,
}

impl ClientSender {
    /// Reiht ein Frame nicht-blockierend in die Queue ein
    pub fn senden(&self, frame: Bytes) -> SignalingResult<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(user_id = %self.user_id, "Send-Queue voll – Frame verworfen");
                Err(SignalingError::SendeQueueVoll(self.user_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(user_id = %self.user_id, "Send-Queue geschlossen (Client getrennt)");
                Err(SignalingError::EmpfaengerOffline(self.user_id.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventBroadcaster
// ---------------------------------------------------------------------------

/// Ausgehende Tabelle UserId -> Send-Queue
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    inner: Arc<EventBroadcasterInner>,
}

#[derive(Default)]
struct EventBroadcasterInner {
    /// Client-Sender, indiziert nach UserId
    clients: DashMap<UserId, ClientSender>,
}

impl EventBroadcaster {
    /// Erstellt einen neuen EventBroadcaster
    pub fn neu() -> Self {
        Self::default()
    }

    /// Traegt die Send-Queue einer frisch gebundenen Verbindung ein
    pub fn client_registrieren(
        &self,
        user_id: UserId,
        verbindung: VerbindungsId,
        tx: mpsc::Sender<Bytes>,
    ) {
        tracing::debug!(user_id = %user_id, verbindung = %verbindung, "Client im Broadcaster registriert");
        let sender = ClientSender {
            user_id: user_id.clone(),
            verbindung,
            tx,
        };
        self.inner.clients.insert(user_id, sender);
    }

    /// Entfernt einen Client, aber nur wenn der Eintrag zu dieser Verbindung gehoert
    pub fn client_entfernen(&self, user_id: &UserId, verbindung: VerbindungsId) -> bool {
        let entfernt = self
            .inner
            .clients
            .remove_if(user_id, |_, sender| sender.verbindung == verbindung)
            .is_some();
        if entfernt {
            tracing::debug!(user_id = %user_id, "Client aus Broadcaster entfernt");
        }
        entfernt
    }

    /// Sendet ein Frame an einen einzelnen Client
    pub fn an_user_senden(&self, user_id: &UserId, frame: Bytes) -> SignalingResult<()> {
        match self.inner.clients.get(user_id) {
            Some(sender) => sender.senden(frame),
            None => {
                tracing::debug!(user_id = %user_id, "Senden an unbekannten Client");
                Err(SignalingError::EmpfaengerUnbekannt(user_id.to_string()))
            }
        }
    }

    /// Sendet ein Frame an alle gebundenen Clients
    ///
    /// Gibt die Anzahl der erfolgreich eingereihten Frames zurueck.
    pub fn an_alle_senden(&self, frame: Bytes) -> usize {
        self.inner
            .clients
            .iter()
            .filter(|entry| entry.value().senden(frame.clone()).is_ok())
            .count()
    }

    /// Gibt die Anzahl der registrierten Clients zurueck
    pub fn client_anzahl(&self) -> usize {
        self.inner.clients.len()
    }

    /// Prueft ob ein Client registriert ist
    pub fn ist_registriert(&self, user_id: &UserId) -> bool {
        self.inner.clients.contains_key(user_id)
    }

    /// Alle registrierten User-IDs (unsortiert)
    pub fn user_ids(&self) -> Vec<UserId> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
