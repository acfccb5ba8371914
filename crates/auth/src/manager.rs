//! AuthManager fuer Ringway
//!
//! Verwaltet registrierte Benutzer und deren Bearer-Tokens im Speicher.
//! Pro Benutzer ist hoechstens ein Token gueltig: beim Ausstellen eines
//! neuen Tokens wird der vorherige widerrufen.
//!
//! Der Manager ist nicht `Sync`-geteilt, sondern gehoert dem Signaling-Worker
//! und wird dort sequenziell ueber `&mut self` benutzt. Abgelaufene Tokens
//! werden nur auf Anforderung bereinigt, der Manager startet selbst keine
//! Hintergrund-Tasks.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use ringway_core::UserId;
use tokio::sync::broadcast;

use crate::{
    error::{AuthError, AuthResult},
    password::{passwort_hashen, passwort_verifizieren, salt_erzeugen, HashParameter, SALT_LAENGE},
};

/// Standard-Token-Lebensdauer: 24 Stunden
const TOKEN_TTL_STUNDEN: i64 = 24;

/// Kapazitaet des Ereignis-Kanals
const EREIGNIS_KAPAZITAET: usize = 256;

// ---------------------------------------------------------------------------
// Datentypen
// ---------------------------------------------------------------------------

/// Gespeicherte Anmeldedaten eines Benutzers
#[derive(Debug, Clone)]
pub struct Benutzerdaten {
    pub user_id: UserId,
    pub benutzername: String,
    /// PHC-String (Argon2id)
    pub passwort_hash: String,
    /// Base64-kodiertes 16-Byte-Salt
    pub salt: String,
    pub erstellt_am: DateTime<Utc>,
    pub letzter_login: Option<DateTime<Utc>>,
}

/// Ein ausgestellter Bearer-Token
#[derive(Debug, Clone)]
pub struct AuthToken {
    /// Der Token-String (URL-sicheres Base64)
    pub token: String,
    pub user_id: UserId,
    pub ausgestellt_am: DateTime<Utc>,
    pub laeuft_ab_am: DateTime<Utc>,
    pub gueltig: bool,
}

impl AuthToken {
    /// Gibt `true` zurueck wenn der Ablaufzeitpunkt ueberschritten ist
    pub fn ist_abgelaufen(&self, jetzt: DateTime<Utc>) -> bool {
        jetzt > self.laeuft_ab_am
    }
}

/// Ereignisse des AuthManagers fuer externe Abonnenten
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEreignis {
    Registriert { user_id: UserId, benutzername: String },
    Angemeldet { user_id: UserId },
    TokenWiderrufen { user_id: UserId },
}

/// Passwort-Arbeit (Argon2id), die ausserhalb des Signaling-Workers laufen kann
pub enum HashAuftrag {
    Registrierung {
        benutzername: String,
        passwort: String,
        salt: [u8; SALT_LAENGE],
        parameter: HashParameter,
    },
    Anmeldung {
        user_id: UserId,
        benutzername: String,
        passwort: String,
        passwort_hash: String,
    },
}

impl HashAuftrag {
    pub fn benutzername(&self) -> &str {
        match self {
            Self::Registrierung { benutzername, .. } | Self::Anmeldung { benutzername, .. } => {
                benutzername
            }
        }
    }

    /// Fuehrt das Hashing bzw. die Verifikation aus
    ///
    /// Rechenintensiv und blockierend, gehoert in `spawn_blocking`.
    pub fn ausfuehren(self) -> AuthResult<HashErgebnis> {
        match self {
            Self::Registrierung {
                benutzername,
                passwort,
                salt,
                parameter,
            } => {
                let passwort_hash = passwort_hashen(&passwort, &salt, &parameter)?;
                Ok(HashErgebnis::Registrierung {
                    benutzername,
                    passwort_hash,
                    salt,
                })
            }
            Self::Anmeldung {
                user_id,
                benutzername,
                passwort,
                passwort_hash,
            } => {
                let passwort_korrekt = passwort_verifizieren(&passwort, &passwort_hash)?;
                Ok(HashErgebnis::Anmeldung {
                    user_id,
                    benutzername,
                    passwort_korrekt,
                })
            }
        }
    }
}

/// Ergebnis eines `HashAuftrag`s, wird mit `AuthManager::abschliessen` uebernommen
#[derive(Debug)]
pub enum HashErgebnis {
    Registrierung {
        benutzername: String,
        passwort_hash: String,
        salt: [u8; SALT_LAENGE],
    },
    Anmeldung {
        user_id: UserId,
        benutzername: String,
        passwort_korrekt: bool,
    },
}

/// Einstellungen des AuthManagers
#[derive(Debug, Clone)]
pub struct AuthKonfiguration {
    pub token_gueltigkeit: Duration,
    pub hash_parameter: HashParameter,
}

impl Default for AuthKonfiguration {
    fn default() -> Self {
        Self {
            token_gueltigkeit: Duration::hours(TOKEN_TTL_STUNDEN),
            hash_parameter: HashParameter::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthManager
// ---------------------------------------------------------------------------

/// In-Memory Benutzer- und Token-Verwaltung
pub struct AuthManager {
    konfig: AuthKonfiguration,
    /// user_id -> Anmeldedaten
    benutzer: HashMap<UserId, Benutzerdaten>,
    /// benutzername -> user_id
    namen: HashMap<String, UserId>,
    /// token -> AuthToken
    tokens: HashMap<String, AuthToken>,
    /// user_id -> aktuell gueltiger Token
    aktive_tokens: HashMap<UserId, String>,
    ereignisse: broadcast::Sender<AuthEreignis>,
}

impl AuthManager {
    pub fn neu(konfig: AuthKonfiguration) -> Self {
        let (ereignisse, _) = broadcast::channel(EREIGNIS_KAPAZITAET);
        Self {
            konfig,
            benutzer: HashMap::new(),
            namen: HashMap::new(),
            tokens: HashMap::new(),
            aktive_tokens: HashMap::new(),
            ereignisse,
        }
    }

    /// Abonniert Registrierungs-, Login- und Widerrufs-Ereignisse
    pub fn abonnieren(&self) -> broadcast::Receiver<AuthEreignis> {
        self.ereignisse.subscribe()
    }

    /// Sender des Ereignis-Kanals; haelt selbst keinen Empfaenger offen
    pub fn ereignis_sender(&self) -> broadcast::Sender<AuthEreignis> {
        self.ereignisse.clone()
    }

    fn ereignis_senden(&self, ereignis: AuthEreignis) {
        // Ohne Abonnenten ist send() ein Fehler – das ist kein Problem
        let _ = self.ereignisse.send(ereignis);
    }

    // -----------------------------------------------------------------------
    // Benutzer
    // -----------------------------------------------------------------------

    /// Registriert einen neuen Benutzer und gibt die vergebene UserId zurueck
    ///
    /// Hasht synchron. Im Signaling-Worker stattdessen
    /// `registrierung_vorbereiten` + `abschliessen` verwenden.
    pub fn registrieren(&mut self, benutzername: &str, passwort: &str) -> AuthResult<UserId> {
        self.registrierung_pruefen(benutzername, passwort)?;
        let salt = salt_erzeugen();
        let passwort_hash = passwort_hashen(passwort, &salt, &self.konfig.hash_parameter)?;
        self.benutzer_anlegen(benutzername, passwort_hash, salt)
    }

    /// Prueft die Anmeldedaten und stellt einen neuen Token aus
    pub fn authentifizieren(&mut self, benutzername: &str, passwort: &str) -> AuthResult<String> {
        let (user_id, passwort_hash) = self.gespeicherter_hash(benutzername)?;
        let korrekt = passwort_verifizieren(passwort, &passwort_hash)?;
        self.anmeldung_uebernehmen(&user_id, benutzername, korrekt)
    }

    // -----------------------------------------------------------------------
    // Zweiphasig: Pruefen im Worker, Hashen ausserhalb, Abschliessen im Worker
    // -----------------------------------------------------------------------

    /// Prueft eine Registrierung ohne zu hashen
    pub fn registrierung_vorbereiten(
        &self,
        benutzername: &str,
        passwort: &str,
    ) -> AuthResult<HashAuftrag> {
        self.registrierung_pruefen(benutzername, passwort)?;
        Ok(HashAuftrag::Registrierung {
            benutzername: benutzername.to_string(),
            passwort: passwort.to_string(),
            salt: salt_erzeugen(),
            parameter: self.konfig.hash_parameter,
        })
    }

    /// Laedt den gespeicherten Hash fuer eine spaetere Verifikation
    pub fn anmeldung_vorbereiten(&self, benutzername: &str, passwort: &str) -> AuthResult<HashAuftrag> {
        let (user_id, passwort_hash) = self.gespeicherter_hash(benutzername)?;
        Ok(HashAuftrag::Anmeldung {
            user_id,
            benutzername: benutzername.to_string(),
            passwort: passwort.to_string(),
            passwort_hash,
        })
    }

    /// Uebernimmt ein Hash-Ergebnis und stellt einen Token aus
    ///
    /// Eine Registrierung meldet den neuen Benutzer direkt an.
    pub fn abschliessen(&mut self, ergebnis: HashErgebnis) -> AuthResult<(String, UserId)> {
        match ergebnis {
            HashErgebnis::Registrierung {
                benutzername,
                passwort_hash,
                salt,
            } => {
                let user_id = self.benutzer_anlegen(&benutzername, passwort_hash, salt)?;
                let token = self.token_ausstellen(&user_id)?;
                Ok((token, user_id))
            }
            HashErgebnis::Anmeldung {
                user_id,
                benutzername,
                passwort_korrekt,
            } => {
                let token = self.anmeldung_uebernehmen(&user_id, &benutzername, passwort_korrekt)?;
                Ok((token, user_id))
            }
        }
    }

    fn registrierung_pruefen(&self, benutzername: &str, passwort: &str) -> AuthResult<()> {
        if benutzername.is_empty() || passwort.is_empty() {
            return Err(AuthError::LeereEingabe);
        }
        if self.namen.contains_key(benutzername) {
            return Err(AuthError::BenutzernameVergeben(benutzername.to_string()));
        }
        Ok(())
    }

    fn gespeicherter_hash(&self, benutzername: &str) -> AuthResult<(UserId, String)> {
        self.namen
            .get(benutzername)
            .and_then(|user_id| self.benutzer.get(user_id))
            .map(|daten| (daten.user_id.clone(), daten.passwort_hash.clone()))
            .ok_or_else(|| AuthError::BenutzerNichtGefunden(benutzername.to_string()))
    }

    fn benutzer_anlegen(
        &mut self,
        benutzername: &str,
        passwort_hash: String,
        salt: [u8; SALT_LAENGE],
    ) -> AuthResult<UserId> {
        // Zwischen Vorbereiten und Abschliessen kann der Name vergeben worden sein
        if self.namen.contains_key(benutzername) {
            return Err(AuthError::BenutzernameVergeben(benutzername.to_string()));
        }

        let mut user_id = UserId::zufaellig();
        while self.benutzer.contains_key(&user_id) {
            user_id = UserId::zufaellig();
        }

        let daten = Benutzerdaten {
            user_id: user_id.clone(),
            benutzername: benutzername.to_string(),
            passwort_hash,
            salt: base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, salt),
            erstellt_am: Utc::now(),
            letzter_login: None,
        };

        self.namen.insert(benutzername.to_string(), user_id.clone());
        self.benutzer.insert(user_id.clone(), daten);

        tracing::info!(
            user_id = %user_id,
            benutzername = %benutzername,
            "Neuer Benutzer registriert"
        );
        self.ereignis_senden(AuthEreignis::Registriert {
            user_id: user_id.clone(),
            benutzername: benutzername.to_string(),
        });

        Ok(user_id)
    }

    fn anmeldung_uebernehmen(
        &mut self,
        user_id: &UserId,
        benutzername: &str,
        passwort_korrekt: bool,
    ) -> AuthResult<String> {
        if !passwort_korrekt {
            tracing::warn!(benutzername = %benutzername, "Fehlgeschlagener Login-Versuch");
            return Err(AuthError::UngueltigeAnmeldedaten);
        }

        let daten = self
            .benutzer
            .get_mut(user_id)
            .ok_or_else(|| AuthError::BenutzerNichtGefunden(benutzername.to_string()))?;
        daten.letzter_login = Some(Utc::now());

        let token = self.token_ausstellen(user_id)?;

        tracing::info!(user_id = %user_id, benutzername = %benutzername, "Benutzer angemeldet");
        self.ereignis_senden(AuthEreignis::Angemeldet {
            user_id: user_id.clone(),
        });

        Ok(token)
    }

    pub fn benutzer_existiert(&self, benutzername: &str) -> bool {
        self.namen.contains_key(benutzername)
    }

    pub fn benutzerdaten(&self, user_id: &UserId) -> Option<&Benutzerdaten> {
        self.benutzer.get(user_id)
    }

    pub fn benutzer_anzahl(&self) -> usize {
        self.benutzer.len()
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    /// Stellt einen neuen Token aus und widerruft den bisherigen
    pub fn token_ausstellen(&mut self, user_id: &UserId) -> AuthResult<String> {
        if !self.benutzer.contains_key(user_id) {
            return Err(AuthError::BenutzerNichtGefunden(user_id.to_string()));
        }

        if let Some(alter_token) = self.aktive_tokens.get(user_id).cloned() {
            self.token_widerrufen(&alter_token)?;
        }

        let mut token = token_generieren();
        while self.tokens.contains_key(&token) {
            token = token_generieren();
        }

        let jetzt = Utc::now();
        let eintrag = AuthToken {
            token: token.clone(),
            user_id: user_id.clone(),
            ausgestellt_am: jetzt,
            laeuft_ab_am: jetzt
                .checked_add_signed(self.konfig.token_gueltigkeit)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            gueltig: true,
        };

        self.tokens.insert(token.clone(), eintrag);
        self.aktive_tokens.insert(user_id.clone(), token.clone());

        tracing::debug!(user_id = %user_id, "Neuer Token ausgestellt");
        Ok(token)
    }

    /// Prueft ob der Token existiert, gueltig und nicht abgelaufen ist
    ///
    /// Abgelaufene Tokens werden dabei als ungueltig markiert.
    pub fn token_validieren(&mut self, token: &str) -> bool {
        let jetzt = Utc::now();
        let Some(eintrag) = self.tokens.get_mut(token) else {
            return false;
        };
        if !eintrag.gueltig {
            return false;
        }
        if eintrag.ist_abgelaufen(jetzt) {
            eintrag.gueltig = false;
            let user_id = eintrag.user_id.clone();
            self.aktiven_index_entfernen(&user_id, token);
            tracing::debug!(user_id = %user_id, "Token abgelaufen");
            return false;
        }
        true
    }

    /// Loest einen gueltigen Token zur UserId auf
    pub fn user_id_fuer_token(&mut self, token: &str) -> Option<UserId> {
        self.token_pruefen(token).ok()
    }

    /// Wie `user_id_fuer_token`, unterscheidet aber unbekannte und ungueltige Tokens
    pub fn token_pruefen(&mut self, token: &str) -> AuthResult<UserId> {
        if !self.tokens.contains_key(token) {
            return Err(AuthError::TokenNichtGefunden);
        }
        if !self.token_validieren(token) {
            return Err(AuthError::TokenUngueltig);
        }
        self.tokens
            .get(token)
            .map(|t| t.user_id.clone())
            .ok_or(AuthError::TokenNichtGefunden)
    }

    /// Markiert einen Token als ungueltig
    pub fn token_widerrufen(&mut self, token: &str) -> AuthResult<()> {
        let eintrag = self
            .tokens
            .get_mut(token)
            .ok_or(AuthError::TokenNichtGefunden)?;
        eintrag.gueltig = false;
        let user_id = eintrag.user_id.clone();

        self.aktiven_index_entfernen(&user_id, token);

        tracing::debug!(user_id = %user_id, "Token widerrufen");
        self.ereignis_senden(AuthEreignis::TokenWiderrufen { user_id });
        Ok(())
    }

    /// Entfernt abgelaufene und widerrufene Tokens, gibt die Anzahl zurueck
    pub fn abgelaufene_tokens_bereinigen(&mut self) -> usize {
        let jetzt = Utc::now();
        let vorher = self.tokens.len();

        let mut entfernte = Vec::new();
        self.tokens.retain(|token, eintrag| {
            let behalten = eintrag.gueltig && !eintrag.ist_abgelaufen(jetzt);
            if !behalten {
                entfernte.push((eintrag.user_id.clone(), token.clone()));
            }
            behalten
        });
        for (user_id, token) in &entfernte {
            self.aktiven_index_entfernen(user_id, token);
        }

        let entfernt = vorher - self.tokens.len();
        if entfernt > 0 {
            tracing::debug!(anzahl = entfernt, "Abgelaufene Tokens bereinigt");
        }
        entfernt
    }

    /// Anzahl gespeicherter Token-Eintraege (gueltig oder nicht)
    pub fn token_anzahl(&self) -> usize {
        self.tokens.len()
    }

    /// Entfernt den Index-Eintrag nur wenn er auf genau diesen Token zeigt
    fn aktiven_index_entfernen(&mut self, user_id: &UserId, token: &str) {
        if self.aktive_tokens.get(user_id).map(String::as_str) == Some(token) {
            self.aktive_tokens.remove(user_id);
        }
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::neu(AuthKonfiguration::default())
    }
}

/// Generiert einen kryptografisch sicheren Token (URL-sicheres Base64)
fn token_generieren() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}
