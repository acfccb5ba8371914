//! Schnittstellen zu externen Diensten
//!
//! Ringway selbst speichert nichts dauerhaft und erzeugt keine Medienkanaele.
//! Beides uebernehmen externe Dienste hinter den Traits `Persistenz` und
//! `MedienAnbieter`. Die Bruecken hier verbinden sie mit den Ereignissen von
//! Registry, AuthManager und Anruf-Engine, ohne den Worker zu blockieren.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ringway_auth::AuthEreignis;
use ringway_core::{CallId, UserId};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::engine::AnrufEreignis;
use crate::registry::VerbindungsEreignis;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExternFehler {
    #[error("Persistenz-Fehler: {0}")]
    Persistenz(String),

    #[error("Medien-Anbieter-Fehler: {0}")]
    MedienAnbieter(String),
}

pub type ExternResult<T> = Result<T, ExternFehler>;

// ---------------------------------------------------------------------------
// Persistenz
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenutzerStatus {
    Online,
    Offline,
    Beschaeftigt,
    Abwesend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profil {
    pub user_id: UserId,
    pub benutzername: String,
    pub spitzname: Option<String>,
    pub avatar: Option<String>,
    pub status: BenutzerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freund {
    pub user_id: UserId,
    pub spitzname: Option<String>,
    /// Eigene Notiz zum Kontakt
    pub bemerkung: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineNachricht {
    pub von: UserId,
    pub an: UserId,
    pub inhalt: Bytes,
    pub gesendet_am: DateTime<Utc>,
}

/// Dauerhafte Ablage von Profilen, Kontakten und Offline-Nachrichten
pub trait Persistenz: Send + Sync {
    fn benutzer_anlegen(
        &self,
        user_id: &UserId,
        benutzername: &str,
    ) -> impl Future<Output = ExternResult<()>> + Send;

    fn profil_laden(&self, user_id: &UserId) -> impl Future<Output = ExternResult<Option<Profil>>> + Send;

    fn freunde_auflisten(&self, user_id: &UserId) -> impl Future<Output = ExternResult<Vec<Freund>>> + Send;

    fn offline_nachricht_speichern(
        &self,
        nachricht: OfflineNachricht,
    ) -> impl Future<Output = ExternResult<()>> + Send;

    fn status_setzen(
        &self,
        user_id: &UserId,
        status: BenutzerStatus,
    ) -> impl Future<Output = ExternResult<()>> + Send;
}

// ---------------------------------------------------------------------------
// Medien-Anbieter
// ---------------------------------------------------------------------------

/// Externer Echtzeit-Medien-Dienst
pub trait MedienAnbieter: Send + Sync {
    /// Legt einen Kanal fuer zwei Teilnehmer an und gibt dessen Namen zurueck
    fn kanal_erstellen(
        &self,
        host: &UserId,
        gast: &UserId,
    ) -> impl Future<Output = ExternResult<String>> + Send;

    /// Erzeugt einen Zugangs-Token fuer einen Kanal
    fn kanal_token_erstellen(
        &self,
        kanal: &str,
        user_id: &UserId,
        ablauf: Duration,
    ) -> impl Future<Output = ExternResult<String>> + Send;

    fn kanal_schliessen(&self, _kanal: &str) -> impl Future<Output = ExternResult<()>> + Send {
        async { Ok(()) }
    }
}

// ---------------------------------------------------------------------------
// MedienBruecke
// ---------------------------------------------------------------------------

/// Kanal und Zugangs-Tokens fuer einen angenommenen Anruf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedienKanal {
    pub call_id: CallId,
    pub kanal: String,
    pub tokens: Vec<(UserId, String)>,
}

/// Steuert einen `MedienAnbieter` anhand der Anruf-Ereignisse
///
/// Angenommen -> Kanal + Tokens, Beendet/Abgelehnt -> Kanal schliessen.
pub struct MedienBruecke<M> {
    anbieter: Arc<M>,
    token_gueltigkeit: Duration,
    kanaele: HashMap<CallId, String>,
}

impl<M: MedienAnbieter + 'static> MedienBruecke<M> {
    pub fn neu(anbieter: Arc<M>, token_gueltigkeit: Duration) -> Self {
        Self {
            anbieter,
            token_gueltigkeit,
            kanaele: HashMap::new(),
        }
    }

    pub fn offene_kanaele(&self) -> usize {
        self.kanaele.len()
    }

    pub async fn ereignis_verarbeiten(
        &mut self,
        ereignis: &AnrufEreignis,
    ) -> ExternResult<Option<MedienKanal>> {
        match ereignis {
            AnrufEreignis::Angenommen {
                call_id,
                caller,
                callee,
            } => {
                let kanal = self.anbieter.kanal_erstellen(caller, callee).await?;
                let mut tokens = Vec::with_capacity(2);
                for teilnehmer in [caller, callee] {
                    let token = self
                        .anbieter
                        .kanal_token_erstellen(&kanal, teilnehmer, self.token_gueltigkeit)
                        .await?;
                    tokens.push((teilnehmer.clone(), token));
                }
                self.kanaele.insert(call_id.clone(), kanal.clone());
                tracing::info!(call_id = %call_id, kanal = %kanal, "Medienkanal erstellt");
                Ok(Some(MedienKanal {
                    call_id: call_id.clone(),
                    kanal,
                    tokens,
                }))
            }
            AnrufEreignis::Beendet { call_id, .. } | AnrufEreignis::Abgelehnt { call_id, .. } => {
                if let Some(kanal) = self.kanaele.remove(call_id) {
                    self.anbieter.kanal_schliessen(&kanal).await?;
                    tracing::debug!(call_id = %call_id, kanal = %kanal, "Medienkanal geschlossen");
                }
                Ok(None)
            }
            AnrufEreignis::Gestartet { .. } => Ok(None),
        }
    }

    /// Verarbeitet Ereignisse bis der Kanal schliesst oder Shutdown gemeldet wird
    pub async fn ausfuehren(
        mut self,
        mut ereignisse: broadcast::Receiver<AnrufEreignis>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                ereignis = ereignisse.recv() => {
                    match ereignis {
                        Ok(ereignis) => {
                            if let Err(e) = self.ereignis_verarbeiten(&ereignis).await {
                                tracing::warn!(fehler = %e, "Medien-Anbieter hat Ereignis nicht verarbeitet");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(verpasst)) => {
                            tracing::warn!(verpasst, "MedienBruecke hinkt hinterher");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PersistenzBruecke
// ---------------------------------------------------------------------------

/// Schreibt Registrierungen und Online-Status in die `Persistenz`
pub struct PersistenzBruecke<P> {
    persistenz: Arc<P>,
}

impl<P: Persistenz + 'static> PersistenzBruecke<P> {
    pub fn neu(persistenz: Arc<P>) -> Self {
        Self { persistenz }
    }

    pub async fn verbindung_verarbeiten(&self, ereignis: &VerbindungsEreignis) -> ExternResult<()> {
        match ereignis {
            VerbindungsEreignis::Verbunden { user_id, .. } => {
                self.persistenz.status_setzen(user_id, BenutzerStatus::Online).await
            }
            VerbindungsEreignis::Getrennt { user_id, .. } => {
                self.persistenz.status_setzen(user_id, BenutzerStatus::Offline).await
            }
            VerbindungsEreignis::Nachricht { .. } => Ok(()),
        }
    }

    pub async fn auth_verarbeiten(&self, ereignis: &AuthEreignis) -> ExternResult<()> {
        match ereignis {
            AuthEreignis::Registriert {
                user_id,
                benutzername,
            } => self.persistenz.benutzer_anlegen(user_id, benutzername).await,
            AuthEreignis::Angemeldet { .. } | AuthEreignis::TokenWiderrufen { .. } => Ok(()),
        }
    }

    pub async fn ausfuehren(
        self,
        mut verbindungen: broadcast::Receiver<VerbindungsEreignis>,
        mut auth: broadcast::Receiver<AuthEreignis>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let ergebnis = tokio::select! {
                ereignis = verbindungen.recv() => match ereignis {
                    Ok(ereignis) => self.verbindung_verarbeiten(&ereignis).await,
                    Err(broadcast::error::RecvError::Lagged(verpasst)) => {
                        tracing::warn!(verpasst, "PersistenzBruecke hinkt hinterher");
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                ereignis = auth.recv() => match ereignis {
                    Ok(ereignis) => self.auth_verarbeiten(&ereignis).await,
                    Err(broadcast::error::RecvError::Lagged(verpasst)) => {
                        tracing::warn!(verpasst, "PersistenzBruecke hinkt hinterher");
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    Ok(())
                }
            };

            if let Err(e) = ergebnis {
                tracing::warn!(fehler = %e, "Persistenz hat Ereignis nicht verarbeitet");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
