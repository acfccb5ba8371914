//! Passwort-Hashing mit Argon2id
//!
//! Jeder Benutzer erhaelt bei der Registrierung ein eigenes zufaelliges
//! 16-Byte-Salt. Der Digest wird als PHC-String gespeichert, das Salt
//! zusaetzlich separat in den Benutzerdaten.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params, Version,
};
use rand::RngCore;

use crate::error::AuthError;

/// Laenge des zufaelligen Salts in Bytes
pub const SALT_LAENGE: usize = 16;

/// Argon2id-Kostenparameter
///
/// Standardwerte gemaess OWASP-Empfehlungen:
/// - Speicher: 64 MiB
/// - Iterationen: 3
/// - Parallelismus: 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParameter {
    pub speicher_kib: u32,
    pub iterationen: u32,
    pub parallelitaet: u32,
}

impl Default for HashParameter {
    fn default() -> Self {
        Self {
            speicher_kib: 64 * 1024,
            iterationen: 3,
            parallelitaet: 1,
        }
    }
}

impl HashParameter {
    /// Minimal zulaessige Kosten (nur fuer Tests und Entwicklung)
    pub fn minimal() -> Self {
        Self {
            speicher_kib: 8,
            iterationen: 1,
            parallelitaet: 1,
        }
    }

    fn argon2_instanz(&self) -> Result<Argon2<'static>, AuthError> {
        let params = Params::new(
            self.speicher_kib,
            self.iterationen,
            self.parallelitaet,
            None, // output_len: Standard (32 Bytes)
        )
        .map_err(|e| AuthError::PasswortHashing(format!("Argon2-Parameter ungueltig: {e}")))?;

        Ok(Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Erzeugt ein neues zufaelliges Salt
pub fn salt_erzeugen() -> [u8; SALT_LAENGE] {
    let mut salt = [0u8; SALT_LAENGE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Hasht ein Passwort mit Argon2id und dem uebergebenen Salt
///
/// Gibt den PHC-String zurueck (inkl. Algorithmus, Parameter und Salt).
pub fn passwort_hashen(
    passwort: &str,
    salt: &[u8],
    parameter: &HashParameter,
) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(salt).map_err(|e| AuthError::PasswortHashing(e.to_string()))?;

    parameter
        .argon2_instanz()?
        .hash_password(passwort.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::PasswortHashing(e.to_string()))
}

/// Verifiziert ein Passwort gegen einen gespeicherten PHC-Hash
///
/// Die Kostenparameter werden aus dem PHC-String gelesen.
pub fn passwort_verifizieren(passwort: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AuthError::PasswortHashing(format!("Ungueltiges Hash-Format: {e}")))?;

    match Argon2::default().verify_password(passwort.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AuthError::PasswortHashing(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwort_hashen_und_verifizieren() {
        let passwort = "sicheres_passwort_123!";
        let salt = salt_erzeugen();
        let hash = passwort_hashen(passwort, &salt, &HashParameter::minimal())
            .expect("Hashing fehlgeschlagen");

        assert!(
            hash.starts_with("$argon2id$"),
            "Hash muss mit $argon2id$ beginnen"
        );
        assert!(!hash.contains(passwort), "Hash darf kein Klartext enthalten");

        let korrekt = passwort_verifizieren(passwort, &hash).expect("Verifikation fehlgeschlagen");
        assert!(korrekt, "Passwort muss korrekt verifiziert werden");
    }

    #[test]
    fn falsches_passwort_wird_abgelehnt() {
        let salt = salt_erzeugen();
        let hash = passwort_hashen("richtiges_passwort", &salt, &HashParameter::minimal()).unwrap();

        let korrekt = passwort_verifizieren("falsches_passwort", &hash).unwrap();
        assert!(!korrekt, "Falsches Passwort muss abgelehnt werden");
    }

    #[test]
    fn gleiches_salt_gleicher_hash() {
        let salt = [7u8; SALT_LAENGE];
        let p = HashParameter::minimal();
        let hash1 = passwort_hashen("pw", &salt, &p).unwrap();
        let hash2 = passwort_hashen("pw", &salt, &p).unwrap();
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn verschiedene_salts_verschiedene_hashes() {
        let p = HashParameter::minimal();
        let hash1 = passwort_hashen("pw", &salt_erzeugen(), &p).unwrap();
        let hash2 = passwort_hashen("pw", &salt_erzeugen(), &p).unwrap();
        assert_ne!(hash1, hash2, "Verschiedene Salts muessen verschiedene Hashes erzeugen");
    }

    #[test]
    fn ungueltiges_hash_format_gibt_fehler() {
        let ergebnis = passwort_verifizieren("passwort", "kein_gueltiger_hash");
        assert!(ergebnis.is_err());
    }

    #[test]
    fn ungueltige_parameter_geben_fehler() {
        let p = HashParameter {
            speicher_kib: 0,
            iterationen: 0,
            parallelitaet: 0,
        };
        assert!(passwort_hashen("pw", &salt_erzeugen(), &p).is_err());
    }
}
