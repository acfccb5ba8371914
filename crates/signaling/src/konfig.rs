//! Laufzeit-Einstellungen des Signaling-Service

use std::time::Duration;

/// Konfiguration fuer den Signaling-Service
#[derive(Debug, Clone)]
pub struct SignalingKonfiguration {
    /// Maximale gleichzeitige TCP-Verbindungen
    pub max_verbindungen: usize,
    /// Maximale Frame-Groesse (Typ + Body) in Bytes
    pub max_frame_groesse: usize,
    /// Ohne empfangenes Frame wird die Verbindung nach dieser Zeit getrennt (0 = aus)
    pub verbindungs_timeout_sek: u64,
    /// Unbeantwortete Anrufe werden nach dieser Zeit abgelehnt (0 = aus)
    pub klingel_timeout_sek: u64,
    /// Intervall der Token-Bereinigung (0 = aus)
    pub token_bereinigung_sek: u64,
    /// Groesse der ausgehenden Queue pro Verbindung
    pub sende_queue_groesse: usize,
    /// Groesse der Befehls-Queue des Workers
    pub befehl_queue_groesse: usize,
    /// Registrierungs-Frame muss einen gueltigen Token fuer die Identitaet tragen
    pub registrierung_token_pflicht: bool,
    /// Gleichzeitig laufende Passwort-Hashes (Login/Registrieren), pro Verbindung hoechstens einer
    pub max_parallele_anmeldungen: usize,
}

impl Default for SignalingKonfiguration {
    fn default() -> Self {
        Self {
            max_verbindungen: 512,
            max_frame_groesse: ringway_protocol::wire::DEFAULT_MAX_FRAME_SIZE,
            verbindungs_timeout_sek: 90,
            klingel_timeout_sek: 60,
            token_bereinigung_sek: 15 * 60,
            sende_queue_groesse: 64,
            befehl_queue_groesse: 1024,
            registrierung_token_pflicht: false,
            max_parallele_anmeldungen: 4,
        }
    }
}

impl SignalingKonfiguration {
    pub fn verbindungs_timeout(&self) -> Option<Duration> {
        sekunden(self.verbindungs_timeout_sek)
    }

    pub fn klingel_timeout(&self) -> Option<Duration> {
        sekunden(self.klingel_timeout_sek)
    }

    pub fn token_bereinigung(&self) -> Option<Duration> {
        sekunden(self.token_bereinigung_sek)
    }
}

fn sekunden(wert: u64) -> Option<Duration> {
    (wert > 0).then(|| Duration::from_secs(wert))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_schaltet_timer_ab() {
        let konfig = SignalingKonfiguration {
            klingel_timeout_sek: 0,
            ..Default::default()
        };
        assert_eq!(konfig.klingel_timeout(), None);
        assert_eq!(
            konfig.verbindungs_timeout(),
            Some(Duration::from_secs(90))
        );
    }
}
