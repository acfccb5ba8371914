//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist.

use std::net::SocketAddr;

use anyhow::Context;
use ringway_auth::{AuthKonfiguration, HashParameter};
use ringway_signaling::SignalingKonfiguration;
use serde::{Deserialize, Serialize};

/// Obergrenze fuer `auth.token_gueltigkeit_stunden` (zehn Jahre)
pub const MAX_TOKEN_GUELTIGKEIT_STUNDEN: i64 = 24 * 365 * 10;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerEinstellungen,
    /// Netzwerk-Einstellungen
    pub netzwerk: NetzwerkEinstellungen,
    /// Verbindungen und Anrufe
    pub signaling: SignalingEinstellungen,
    /// Tokens und Passwort-Hashing
    pub auth: AuthEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Observability-Einstellungen (Metriken, Health)
    pub observability: ObservabilityEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename des Servers
    pub name: String,
    /// Maximale Anzahl gleichzeitiger TCP-Verbindungen
    pub max_verbindungen: usize,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Ringway Server".into(),
            max_verbindungen: 512,
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    /// Port fuer das Signaling-Protokoll
    pub tcp_port: u16,
    /// Maximale Frame-Groesse (Typ + Body) in Bytes
    pub max_frame_groesse: usize,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            tcp_port: 8888,
            max_frame_groesse: ringway_protocol::wire::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Signaling-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingEinstellungen {
    /// Idle-Timeout pro Verbindung in Sekunden (0 = aus)
    pub verbindungs_timeout_sek: u64,
    /// Unbeantwortete Anrufe werden danach abgelehnt (0 = aus)
    pub klingel_timeout_sek: u64,
    /// Ausgehende Queue pro Verbindung (Frames)
    pub sende_queue_groesse: usize,
    /// Erstes Frame muss ein Heartbeat mit gueltigem Token sein
    pub registrierung_token_pflicht: bool,
    /// Gleichzeitig laufende Passwort-Hashes (Login/Registrieren)
    pub max_parallele_anmeldungen: usize,
}

impl Default for SignalingEinstellungen {
    fn default() -> Self {
        let standard = SignalingKonfiguration::default();
        Self {
            verbindungs_timeout_sek: standard.verbindungs_timeout_sek,
            klingel_timeout_sek: standard.klingel_timeout_sek,
            sende_queue_groesse: standard.sende_queue_groesse,
            registrierung_token_pflicht: standard.registrierung_token_pflicht,
            max_parallele_anmeldungen: standard.max_parallele_anmeldungen,
        }
    }
}

/// Auth-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEinstellungen {
    pub token_gueltigkeit_stunden: i64,
    /// Intervall der Token-Bereinigung in Sekunden (0 = aus)
    pub token_bereinigung_sek: u64,
    /// Argon2-Speicherkosten in KiB
    pub hash_speicher_kib: u32,
    pub hash_iterationen: u32,
    pub hash_parallelitaet: u32,
}

impl Default for AuthEinstellungen {
    fn default() -> Self {
        let hash = HashParameter::default();
        Self {
            token_gueltigkeit_stunden: 24,
            token_bereinigung_sek: SignalingKonfiguration::default().token_bereinigung_sek,
            hash_speicher_kib: hash.speicher_kib,
            hash_iterationen: hash.iterationen,
            hash_parallelitaet: hash.parallelitaet,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    /// Aktiviert den Observability-Server
    pub aktiviert: bool,
    /// Port fuer Metriken und Health (Standard: 9300)
    pub port: u16,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            port: 9300,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                config.pruefen()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Prueft Werte die serde allein nicht abfangen kann
    pub fn pruefen(&self) -> anyhow::Result<()> {
        if !ringway_observability::logging::log_level_gueltig(&self.logging.level) {
            anyhow::bail!("Unbekanntes Log-Level '{}'", self.logging.level);
        }
        if !ringway_observability::logging::log_format_gueltig(&self.logging.format) {
            anyhow::bail!("Unbekanntes Log-Format '{}'", self.logging.format);
        }
        if !(1..=MAX_TOKEN_GUELTIGKEIT_STUNDEN).contains(&self.auth.token_gueltigkeit_stunden) {
            anyhow::bail!(
                "auth.token_gueltigkeit_stunden muss zwischen 1 und {MAX_TOKEN_GUELTIGKEIT_STUNDEN} liegen"
            );
        }
        if self.signaling.max_parallele_anmeldungen == 0 {
            anyhow::bail!("signaling.max_parallele_anmeldungen muss positiv sein");
        }
        if self.netzwerk.max_frame_groesse == 0 {
            anyhow::bail!("netzwerk.max_frame_groesse muss positiv sein");
        }
        self.tcp_bind_adresse()?;
        Ok(())
    }

    /// Gibt die vollstaendige Bind-Adresse fuer TCP zurueck
    pub fn tcp_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        let adresse = format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.tcp_port);
        adresse
            .parse()
            .with_context(|| format!("Ungueltige TCP-Bind-Adresse '{adresse}'"))
    }

    /// Gibt die Bind-Adresse fuer den Observability-Server zurueck
    pub fn observability_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        let adresse = format!("{}:{}", self.netzwerk.bind_adresse, self.observability.port);
        adresse
            .parse()
            .with_context(|| format!("Ungueltige Observability-Adresse '{adresse}'"))
    }

    pub fn signaling_konfiguration(&self) -> SignalingKonfiguration {
        SignalingKonfiguration {
            max_verbindungen: self.server.max_verbindungen,
            max_frame_groesse: self.netzwerk.max_frame_groesse,
            verbindungs_timeout_sek: self.signaling.verbindungs_timeout_sek,
            klingel_timeout_sek: self.signaling.klingel_timeout_sek,
            token_bereinigung_sek: self.auth.token_bereinigung_sek,
            sende_queue_groesse: self.signaling.sende_queue_groesse,
            registrierung_token_pflicht: self.signaling.registrierung_token_pflicht,
            max_parallele_anmeldungen: self.signaling.max_parallele_anmeldungen,
            ..SignalingKonfiguration::default()
        }
    }

    pub fn auth_konfiguration(&self) -> anyhow::Result<AuthKonfiguration> {
        let token_gueltigkeit = chrono::Duration::try_hours(self.auth.token_gueltigkeit_stunden)
            .with_context(|| {
                format!(
                    "auth.token_gueltigkeit_stunden = {} ist ausserhalb des darstellbaren Bereichs",
                    self.auth.token_gueltigkeit_stunden
                )
            })?;
        Ok(AuthKonfiguration {
            token_gueltigkeit,
            hash_parameter: HashParameter {
                speicher_kib: self.auth.hash_speicher_kib,
                iterationen: self.auth.hash_iterationen,
                parallelitaet: self.auth.hash_parallelitaet,
            },
        })
    }
}
