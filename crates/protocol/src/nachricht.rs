//! Nachrichten des Signaling-Protokolls
//!
//! Definiert die Nachrichtentyp-Tabelle und die typisierten Nachrichten
//! beider Richtungen. Alle Integer sind Big-Endian, Strings werden als
//! `[len:u16][utf8]` uebertragen.
//!
//! ## Typ-Tabelle
//!
//! | Typ  | Name             | Client → Server                | Server → Client                      |
//! |------|------------------|--------------------------------|--------------------------------------|
//! | 0    | Text             | ignoriert (Legacy)             | –                                    |
//! | 1    | Datei            | ignoriert (Legacy)             | –                                    |
//! | 2    | Anruf-Anfrage    | `[calleeId][isVideo:u8]`       | `[callId][callerId][isVideo:u8]`     |
//! | 3    | Anruf annehmen   | `[callId]`                     | `[callId]`                           |
//! | 4    | Anruf ablehnen   | `[callId][grund]`              | `[callId][grund]`                    |
//! | 5    | Anruf beenden    | `[callId]`                     | `[callId]`                           |
//! | 6    | Mediendaten      | `[callId][roh]`                | `[callId][roh]`                      |
//! | 7    | Heartbeat        | leer                           | leer (Echo)                          |
//! | 0x08 | Login            | `[benutzername][passwort]`     | –                                    |
//! | 0x09 | Registrieren     | `[benutzername][passwort]`     | –                                    |
//! | 0x0A | Auth-Antwort     | –                              | `[ok:u8]` + Token/UserId oder Fehler |
//!
//! ## Registrierungs-Frame
//!
//! Das erste Frame einer Verbindung traegt vor dem eigentlichen Body die
//! Identitaet des Clients: `[userIdLen:u16][userId][rest]`. Alle weiteren
//! Frames tragen nur noch den Body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ringway_core::{CallId, UserId};

use crate::error::{ProtokollFehler, ProtokollResult};
use crate::wire::RohFrame;

// ---------------------------------------------------------------------------
// Nachrichtentypen
// ---------------------------------------------------------------------------

/// Typ-Byte einer Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NachrichtenTyp {
    Text = 0x00,
    Datei = 0x01,
    AnrufAnfrage = 0x02,
    AnrufAnnehmen = 0x03,
    AnrufAblehnen = 0x04,
    AnrufBeenden = 0x05,
    Mediendaten = 0x06,
    Heartbeat = 0x07,
    Login = 0x08,
    Registrieren = 0x09,
    AuthAntwort = 0x0A,
}

impl NachrichtenTyp {
    pub fn als_byte(self) -> u8 {
        self as u8
    }

    /// Login und Registrierung duerfen auf ungebundenen Verbindungen ohne
    /// Identitaets-Praefix gesendet werden
    pub fn ohne_identitaet_erlaubt(self) -> bool {
        matches!(self, Self::Login | Self::Registrieren)
    }
}

impl TryFrom<u8> for NachrichtenTyp {
    type Error = ProtokollFehler;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x00 => Self::Text,
            0x01 => Self::Datei,
            0x02 => Self::AnrufAnfrage,
            0x03 => Self::AnrufAnnehmen,
            0x04 => Self::AnrufAblehnen,
            0x05 => Self::AnrufBeenden,
            0x06 => Self::Mediendaten,
            0x07 => Self::Heartbeat,
            0x08 => Self::Login,
            0x09 => Self::Registrieren,
            0x0A => Self::AuthAntwort,
            andere => return Err(ProtokollFehler::UnbekannterTyp(andere)),
        })
    }
}

// ---------------------------------------------------------------------------
// String-Hilfsfunktionen
// ---------------------------------------------------------------------------

/// Liest einen `[len:u16][utf8]`-String vom Anfang des Buffers
pub fn string_lesen(buf: &mut Bytes, feld: &'static str) -> ProtokollResult<String> {
    if buf.remaining() < 2 {
        return Err(ProtokollFehler::Unvollstaendig { feld });
    }
    let laenge = buf.get_u16() as usize;
    if buf.remaining() < laenge {
        return Err(ProtokollFehler::Unvollstaendig { feld });
    }
    let roh = buf.split_to(laenge);
    String::from_utf8(roh.to_vec()).map_err(|_| ProtokollFehler::UngueltigesUtf8 { feld })
}

/// Schreibt einen `[len:u16][utf8]`-String
pub fn string_schreiben(buf: &mut BytesMut, wert: &str, feld: &'static str) -> ProtokollResult<()> {
    let laenge = wert.len();
    if laenge > u16::MAX as usize {
        return Err(ProtokollFehler::StringZuLang { feld, laenge });
    }
    buf.reserve(2 + laenge);
    buf.put_u16(laenge as u16);
    buf.put_slice(wert.as_bytes());
    Ok(())
}

fn bool_lesen(buf: &mut Bytes, feld: &'static str) -> ProtokollResult<bool> {
    if !buf.has_remaining() {
        return Err(ProtokollFehler::Unvollstaendig { feld });
    }
    Ok(buf.get_u8() != 0)
}

fn ende_pruefen(buf: &Bytes, typ: NachrichtenTyp) -> ProtokollResult<()> {
    if buf.has_remaining() {
        return Err(ProtokollFehler::UeberzaehligeBytes {
            typ: typ.als_byte(),
            anzahl: buf.remaining(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registrierungs-Frame
// ---------------------------------------------------------------------------

/// Zerlegter Body eines Registrierungs-Frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registrierung {
    /// Vom Client beanspruchte Identitaet
    pub user_id: UserId,
    /// Typ-spezifischer Body hinter dem Praefix
    pub rest: Bytes,
}

impl Registrierung {
    /// Trennt das Identitaets-Praefix vom Body
    pub fn aus_body(mut body: Bytes) -> ProtokollResult<Self> {
        let user_id = string_lesen(&mut body, "userId")?;
        if user_id.is_empty() {
            return Err(ProtokollFehler::LeereUserId);
        }
        Ok(Self {
            user_id: UserId(user_id),
            rest: body,
        })
    }

    /// Liest `[tokenLen:u16][token]` aus dem Rest (gehaerteter Modus)
    pub fn token(&self) -> ProtokollResult<String> {
        let mut rest = self.rest.clone();
        let token = string_lesen(&mut rest, "token")?;
        ende_pruefen(&rest, NachrichtenTyp::Heartbeat)?;
        Ok(token)
    }

    /// Baut das erste Frame einer Verbindung: Praefix + kodierte Nachricht
    pub fn frame_bauen(user_id: &UserId, nachricht: &ClientNachricht) -> ProtokollResult<RohFrame> {
        let innen = nachricht.kodieren()?;
        let mut body = BytesMut::with_capacity(2 + user_id.as_str().len() + innen.body.len());
        string_schreiben(&mut body, user_id.as_str(), "userId")?;
        body.put_slice(&innen.body);
        Ok(RohFrame::neu(innen.typ, body.freeze()))
    }
}

// ---------------------------------------------------------------------------
// Anmeldedaten
// ---------------------------------------------------------------------------

/// Benutzername + Passwort aus Login- und Registrierungs-Frames
#[derive(Clone, PartialEq, Eq)]
pub struct Anmeldedaten {
    pub benutzername: String,
    pub passwort: String,
}

impl std::fmt::Debug for Anmeldedaten {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anmeldedaten")
            .field("benutzername", &self.benutzername)
            .field("passwort", &"***")
            .finish()
    }
}

impl Anmeldedaten {
    fn lesen(body: &mut Bytes) -> ProtokollResult<Self> {
        let benutzername = string_lesen(body, "benutzername")?;
        let passwort = string_lesen(body, "passwort")?;
        Ok(Self {
            benutzername,
            passwort,
        })
    }

    fn schreiben(&self, buf: &mut BytesMut) -> ProtokollResult<()> {
        string_schreiben(buf, &self.benutzername, "benutzername")?;
        string_schreiben(buf, &self.passwort, "passwort")
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Nachricht vom Client an den Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNachricht {
    /// Typ 0/1 – wird vom Server ignoriert
    Legacy(NachrichtenTyp),
    AnrufAnfrage { callee: UserId, video: bool },
    AnrufAnnehmen { call_id: CallId },
    AnrufAblehnen { call_id: CallId, grund: String },
    AnrufBeenden { call_id: CallId },
    Mediendaten { call_id: CallId, daten: Bytes },
    Heartbeat,
    Login(Anmeldedaten),
    Registrieren(Anmeldedaten),
}

impl ClientNachricht {
    pub fn typ(&self) -> NachrichtenTyp {
        match self {
            Self::Legacy(typ) => *typ,
            Self::AnrufAnfrage { .. } => NachrichtenTyp::AnrufAnfrage,
            Self::AnrufAnnehmen { .. } => NachrichtenTyp::AnrufAnnehmen,
            Self::AnrufAblehnen { .. } => NachrichtenTyp::AnrufAblehnen,
            Self::AnrufBeenden { .. } => NachrichtenTyp::AnrufBeenden,
            Self::Mediendaten { .. } => NachrichtenTyp::Mediendaten,
            Self::Heartbeat => NachrichtenTyp::Heartbeat,
            Self::Login(_) => NachrichtenTyp::Login,
            Self::Registrieren(_) => NachrichtenTyp::Registrieren,
        }
    }

    /// Dekodiert einen Body (ohne Identitaets-Praefix)
    ///
    /// Heartbeat und Legacy-Typen ignorieren ihren Body. Die Auth-Antwort ist
    /// in dieser Richtung nicht erlaubt.
    pub fn dekodieren(typ: u8, mut body: Bytes) -> ProtokollResult<Self> {
        let typ = NachrichtenTyp::try_from(typ)?;

        let nachricht = match typ {
            NachrichtenTyp::Text | NachrichtenTyp::Datei => return Ok(Self::Legacy(typ)),
            NachrichtenTyp::Heartbeat => return Ok(Self::Heartbeat),
            NachrichtenTyp::AnrufAnfrage => {
                let callee = UserId(string_lesen(&mut body, "calleeId")?);
                let video = bool_lesen(&mut body, "isVideo")?;
                Self::AnrufAnfrage { callee, video }
            }
            NachrichtenTyp::AnrufAnnehmen => Self::AnrufAnnehmen {
                call_id: CallId(string_lesen(&mut body, "callId")?),
            },
            NachrichtenTyp::AnrufAblehnen => {
                let call_id = CallId(string_lesen(&mut body, "callId")?);
                let grund = string_lesen(&mut body, "grund")?;
                Self::AnrufAblehnen { call_id, grund }
            }
            NachrichtenTyp::AnrufBeenden => Self::AnrufBeenden {
                call_id: CallId(string_lesen(&mut body, "callId")?),
            },
            NachrichtenTyp::Mediendaten => {
                let call_id = CallId(string_lesen(&mut body, "callId")?);
                // Rest ist opak
                let daten = body.split_off(0);
                Self::Mediendaten { call_id, daten }
            }
            NachrichtenTyp::Login => Self::Login(Anmeldedaten::lesen(&mut body)?),
            NachrichtenTyp::Registrieren => Self::Registrieren(Anmeldedaten::lesen(&mut body)?),
            NachrichtenTyp::AuthAntwort => {
                return Err(ProtokollFehler::UnerwarteterTyp(typ.als_byte()))
            }
        };

        ende_pruefen(&body, typ)?;
        Ok(nachricht)
    }

    /// Kodiert die Nachricht (ohne Identitaets-Praefix)
    pub fn kodieren(&self) -> ProtokollResult<RohFrame> {
        let mut buf = BytesMut::new();
        match self {
            Self::Legacy(_) | Self::Heartbeat => {}
            Self::AnrufAnfrage { callee, video } => {
                string_schreiben(&mut buf, callee.as_str(), "calleeId")?;
                buf.put_u8(*video as u8);
            }
            Self::AnrufAnnehmen { call_id } | Self::AnrufBeenden { call_id } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
            }
            Self::AnrufAblehnen { call_id, grund } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
                string_schreiben(&mut buf, grund, "grund")?;
            }
            Self::Mediendaten { call_id, daten } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
                buf.put_slice(daten);
            }
            Self::Login(daten) | Self::Registrieren(daten) => daten.schreiben(&mut buf)?,
        }
        Ok(RohFrame::neu(self.typ().als_byte(), buf.freeze()))
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Ergebnis eines Login- oder Registrierungs-Versuchs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAntwort {
    Erfolg { token: String, user_id: UserId },
    Fehler { meldung: String },
}

/// Nachricht vom Server an einen Client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNachricht {
    /// Eingehender Anruf (an den Angerufenen)
    AnrufAnfrage {
        call_id: CallId,
        caller: UserId,
        video: bool,
    },
    AnrufAngenommen { call_id: CallId },
    /// Abgelehnt – bei fehlgeschlagenem Anrufaufbau mit leerer CallId
    AnrufAbgelehnt { call_id: CallId, grund: String },
    AnrufBeendet { call_id: CallId },
    Mediendaten { call_id: CallId, daten: Bytes },
    Heartbeat,
    Auth(AuthAntwort),
}

impl ServerNachricht {
    pub fn typ(&self) -> NachrichtenTyp {
        match self {
            Self::AnrufAnfrage { .. } => NachrichtenTyp::AnrufAnfrage,
            Self::AnrufAngenommen { .. } => NachrichtenTyp::AnrufAnnehmen,
            Self::AnrufAbgelehnt { .. } => NachrichtenTyp::AnrufAblehnen,
            Self::AnrufBeendet { .. } => NachrichtenTyp::AnrufBeenden,
            Self::Mediendaten { .. } => NachrichtenTyp::Mediendaten,
            Self::Heartbeat => NachrichtenTyp::Heartbeat,
            Self::Auth(_) => NachrichtenTyp::AuthAntwort,
        }
    }

    pub fn kodieren(&self) -> ProtokollResult<RohFrame> {
        let mut buf = BytesMut::new();
        match self {
            Self::AnrufAnfrage {
                call_id,
                caller,
                video,
            } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
                string_schreiben(&mut buf, caller.as_str(), "callerId")?;
                buf.put_u8(*video as u8);
            }
            Self::AnrufAngenommen { call_id } | Self::AnrufBeendet { call_id } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
            }
            Self::AnrufAbgelehnt { call_id, grund } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
                string_schreiben(&mut buf, grund, "grund")?;
            }
            Self::Mediendaten { call_id, daten } => {
                string_schreiben(&mut buf, call_id.as_str(), "callId")?;
                buf.put_slice(daten);
            }
            Self::Heartbeat => {}
            Self::Auth(AuthAntwort::Erfolg { token, user_id }) => {
                buf.put_u8(1);
                string_schreiben(&mut buf, token, "token")?;
                string_schreiben(&mut buf, user_id.as_str(), "userId")?;
            }
            Self::Auth(AuthAntwort::Fehler { meldung }) => {
                buf.put_u8(0);
                string_schreiben(&mut buf, meldung, "fehler")?;
            }
        }
        Ok(RohFrame::neu(self.typ().als_byte(), buf.freeze()))
    }

    /// Kodiert die Nachricht inklusive Laengen-Umschlag
    pub fn in_bytes(&self) -> ProtokollResult<Bytes> {
        self.kodieren()?.in_bytes()
    }

    /// Dekodiert eine Server-Nachricht (Client-Seite)
    pub fn dekodieren(typ: u8, mut body: Bytes) -> ProtokollResult<Self> {
        let typ = NachrichtenTyp::try_from(typ)?;

        let nachricht = match typ {
            NachrichtenTyp::AnrufAnfrage => {
                let call_id = CallId(string_lesen(&mut body, "callId")?);
                let caller = UserId(string_lesen(&mut body, "callerId")?);
                let video = bool_lesen(&mut body, "isVideo")?;
                Self::AnrufAnfrage {
                    call_id,
                    caller,
                    video,
                }
            }
            NachrichtenTyp::AnrufAnnehmen => Self::AnrufAngenommen {
                call_id: CallId(string_lesen(&mut body, "callId")?),
            },
            NachrichtenTyp::AnrufAblehnen => {
                let call_id = CallId(string_lesen(&mut body, "callId")?);
                let grund = string_lesen(&mut body, "grund")?;
                Self::AnrufAbgelehnt { call_id, grund }
            }
            NachrichtenTyp::AnrufBeenden => Self::AnrufBeendet {
                call_id: CallId(string_lesen(&mut body, "callId")?),
            },
            NachrichtenTyp::Mediendaten => {
                let call_id = CallId(string_lesen(&mut body, "callId")?);
                let daten = body.split_off(0);
                Self::Mediendaten { call_id, daten }
            }
            NachrichtenTyp::Heartbeat => Self::Heartbeat,
            NachrichtenTyp::AuthAntwort => {
                if !body.has_remaining() {
                    return Err(ProtokollFehler::Unvollstaendig { feld: "success" });
                }
                if body.get_u8() != 0 {
                    let token = string_lesen(&mut body, "token")?;
                    let user_id = UserId(string_lesen(&mut body, "userId")?);
                    Self::Auth(AuthAntwort::Erfolg { token, user_id })
                } else {
                    let meldung = string_lesen(&mut body, "fehler")?;
                    Self::Auth(AuthAntwort::Fehler { meldung })
                }
            }
            andere => return Err(ProtokollFehler::UnerwarteterTyp(andere.als_byte())),
        };

        ende_pruefen(&body, typ)?;
        Ok(nachricht)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
