//! Wire-Format fuer TCP-Verbindungen
//!
//! Jedes Frame steckt in einem Laengen-Umschlag, gefolgt vom Typ-Byte und dem
//! typ-spezifischen Body.
//!
//! ## Frame-Format
//!
//! ```text
//! +--------+--------+--------+--------+--------+----...----+
//! |      Laenge (u32 BE)              |  Typ   |   Body    |
//! +--------+--------+--------+--------+--------+----...----+
//! ```
//!
//! Die Laenge zaehlt Typ-Byte + Body (ohne die 4 Laengen-Bytes).
//! Maximale Frame-Groesse ist konfigurierbar (Standard: 1 MB).
//!
//! ## Inkrementelles Dekodieren
//!
//! Ein einzelner Read kann null, ein oder mehrere Frames enthalten, und ein
//! Frame kann ueber mehrere Reads verteilt sein. Der `FrameCodec` haelt
//! deshalb pro Verbindung einen expliziten Zustand: entweder fehlen noch
//! Bytes fuer das Laengenfeld, oder die Laenge ist bekannt und es fehlen
//! noch Payload-Bytes. `tokio_util::codec::FramedRead` puffert die
//! angefangenen Bytes zwischen den Reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtokollFehler;

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Frame-Groesse (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// RohFrame
// ---------------------------------------------------------------------------

/// Ein vollstaendig dekodiertes, aber noch nicht interpretiertes Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RohFrame {
    /// Typ-Byte
    pub typ: u8,
    /// Body ohne Typ-Byte
    pub body: Bytes,
}

impl RohFrame {
    pub fn neu(typ: u8, body: impl Into<Bytes>) -> Self {
        Self {
            typ,
            body: body.into(),
        }
    }

    /// Kodiert das Frame inklusive Laengen-Umschlag in einen eigenen Buffer
    pub fn in_bytes(self) -> Result<Bytes, ProtokollFehler> {
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + 1 + self.body.len());
        FrameCodec::new().encode(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// Zustand des inkrementellen Decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeZustand {
    /// Es fehlen noch Bytes fuer das Laengenfeld
    Laenge,
    /// Laenge gelesen, es werden noch `n` Payload-Bytes (Typ + Body) erwartet
    Payload(usize),
}

/// tokio-util Codec fuer frame-basierte TCP-Verbindungen
///
/// Implementiert `Encoder<RohFrame>` und `Decoder` fuer nahtlose
/// Integration mit `tokio_util::codec::FramedRead`.
///
/// # Beispiel
///
/// ```rust,no_run
/// use tokio_util::codec::FramedRead;
/// use ringway_protocol::wire::FrameCodec;
///
/// // let (lesen, _) = stream.into_split();
/// // let frames = FramedRead::new(lesen, FrameCodec::new());
/// ```
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximale erlaubte Frame-Groesse in Bytes
    max_frame_size: usize,
    zustand: DecodeZustand,
}

impl FrameCodec {
    /// Erstellt einen neuen `FrameCodec` mit Standard-Limits
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Erstellt einen `FrameCodec` mit benutzerdefinierter maximaler Frame-Groesse
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            zustand: DecodeZustand::Laenge,
        }
    }

    /// Gibt die konfigurierte maximale Frame-Groesse zurueck
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Aktueller Decoder-Zustand
    pub fn zustand(&self) -> DecodeZustand {
        self.zustand
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Decoder-Implementierung
// ---------------------------------------------------------------------------

impl Decoder for FrameCodec {
    type Item = RohFrame;
    type Error = ProtokollFehler;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let laenge = match self.zustand {
            DecodeZustand::Laenge => {
                if src.len() < LENGTH_FIELD_SIZE {
                    return Ok(None);
                }

                let laenge = src.get_u32() as usize;
                if laenge == 0 {
                    return Err(ProtokollFehler::LeeresFrame);
                }
                if laenge > self.max_frame_size {
                    return Err(ProtokollFehler::FrameZuGross {
                        laenge,
                        maximum: self.max_frame_size,
                    });
                }

                self.zustand = DecodeZustand::Payload(laenge);
                laenge
            }
            DecodeZustand::Payload(laenge) => laenge,
        };

        if src.len() < laenge {
            // Speicher vorbelegen um Reallocations zu vermeiden
            src.reserve(laenge - src.len());
            return Ok(None);
        }

        self.zustand = DecodeZustand::Laenge;

        let mut payload = src.split_to(laenge).freeze();
        let typ = payload.get_u8();

        Ok(Some(RohFrame { typ, body: payload }))
    }
}

// ---------------------------------------------------------------------------
// Encoder-Implementierung
// ---------------------------------------------------------------------------

impl Encoder<RohFrame> for FrameCodec {
    type Error = ProtokollFehler;

    fn encode(&mut self, item: RohFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let laenge = 1 + item.body.len();

        if laenge > self.max_frame_size {
            return Err(ProtokollFehler::FrameZuGross {
                laenge,
                maximum: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_FIELD_SIZE + laenge);
        dst.put_u32(laenge as u32);
        dst.put_u8(item.typ);
        dst.put_slice(&item.body);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn kodiert(typ: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(RohFrame::neu(typ, body.to_vec()), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn laengenfeld_zaehlt_typ_und_body() {
        let buf = kodiert(7, b"");
        assert_eq!(&buf[..], &[0, 0, 0, 1, 7]);

        let buf = kodiert(6, b"abc");
        assert_eq!(&buf[..4], &[0, 0, 0, 4]);
        assert_eq!(buf.len(), LENGTH_FIELD_SIZE + 4);
    }

    #[test]
    fn unvollstaendiges_laengenfeld_wartet() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.zustand(), DecodeZustand::Laenge);
        // Nichts darf verbraucht worden sein
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn zustand_bleibt_ueber_mehrere_reads_erhalten() {
        let mut codec = FrameCodec::new();
        let ganz = kodiert(5, b"call-123");

        // Laengenfeld + 2 Bytes
        let mut buf = BytesMut::from(&ganz[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.zustand(), DecodeZustand::Payload(9));

        // Rest nachliefern
        buf.extend_from_slice(&ganz[6..]);
        let frame = codec.decode(&mut buf).unwrap().expect("Frame erwartet");
        assert_eq!(frame.typ, 5);
        assert_eq!(&frame.body[..], b"call-123");
        assert_eq!(codec.zustand(), DecodeZustand::Laenge);
        assert!(buf.is_empty());
    }

    #[test]
    fn mehrere_frames_in_einem_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&kodiert(7, b""));
        buf.extend_from_slice(&kodiert(3, b"x"));
        buf.extend_from_slice(&kodiert(6, b"yz"));

        let typen: Vec<u8> = std::iter::from_fn(|| codec.decode(&mut buf).unwrap())
            .map(|f| f.typ)
            .collect();
        assert_eq!(typen, vec![7, 3, 6]);
        assert!(buf.is_empty());
    }

    #[test]
    fn zu_grosses_frame_wird_abgelehnt() {
        let mut codec = FrameCodec::with_max_size(100);
        let mut buf = BytesMut::new();
        buf.put_u32(200);
        buf.put_slice(&[b'x'; 200]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtokollFehler::FrameZuGross { laenge: 200, maximum: 100 })
        ));
    }

    #[test]
    fn leeres_frame_wird_abgelehnt() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtokollFehler::LeeresFrame)
        ));
    }

    #[test]
    fn encode_lehnt_zu_grosse_nachricht_ab() {
        let mut codec = FrameCodec::with_max_size(4);
        let mut buf = BytesMut::new();
        let ergebnis = codec.encode(RohFrame::neu(6, vec![0u8; 10]), &mut buf);
        assert!(ergebnis.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn framed_read_ueber_byteweise_reads() {
        let (mut schreiber, leser) = tokio::io::duplex(8);
        let mut frames = FramedRead::new(leser, FrameCodec::new());

        let mut daten = BytesMut::new();
        daten.extend_from_slice(&kodiert(2, b"bob\x01"));
        daten.extend_from_slice(&kodiert(7, b""));

        tokio::spawn(async move {
            // Jedes Byte einzeln schreiben: Frames ueberspannen viele Reads
            for byte in daten.iter() {
                schreiber.write_all(&[*byte]).await.unwrap();
            }
        });

        let erstes = frames.next().await.unwrap().unwrap();
        assert_eq!(erstes.typ, 2);
        assert_eq!(&erstes.body[..], b"bob\x01");

        let zweites = frames.next().await.unwrap().unwrap();
        assert_eq!(zweites.typ, 7);
        assert!(zweites.body.is_empty());

        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn abgeschnittenes_frame_bei_eof_ist_fehler() {
        let (mut schreiber, leser) = tokio::io::duplex(64);
        let mut frames = FramedRead::new(leser, FrameCodec::new());

        let ganz = kodiert(5, b"abgeschnitten");
        schreiber.write_all(&ganz[..8]).await.unwrap();
        drop(schreiber);

        let ergebnis = frames.next().await.expect("Ergebnis erwartet");
        assert!(ergebnis.is_err());
    }
}
