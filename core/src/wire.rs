//! The peer wire protocol.
//!
//! Frames are length-delimited and typed: a big-endian `u32` body length,
//! a `u32` message tag, then the fields. Strings are length-prefixed UTF-8;
//! timestamps are `(u64 sec, u32 usec)`; signatures are 16 raw bytes. A
//! product class travels as its time window plus its specification list,
//! each spec a feedtype and a pattern conjunction, which round-trips the
//! trailing-signature form unchanged.
//!
//! Subscription handshake: a downstream opens with `FeedMe`/`NotifyMe` and
//! receives `Ok`, `Reclass`, or `BadPattern`; an upstream offering data
//! opens with `Hiya`. Products then flow as `HereIs` (primary mode) or
//! `ComingSoon`/`BlkData` (alternate mode), notifications as
//! `Notification`.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::class::{ClassError, ClassSpec, Pattern, ProductClass};
use crate::feedtype::Feedtype;
use crate::product::{Product, ProductInfo, Signature, Timestamp};

/// Upper bound on one frame; anything larger is a protocol violation.
pub const MAX_FRAME: u32 = 256 * 1024 * 1024;

/// `max_hereis` sentinel meaning "no size gate" in primary mode.
pub const HEREIS_UNLIMITED: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("peer I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("oversized frame: {0} bytes")]
    FrameTooLarge(u32),

    #[error("unknown message tag {0}")]
    BadTag(u32),

    #[error("malformed string field")]
    BadString,

    #[error(transparent)]
    BadPattern(#[from] ClassError),
}

const TAG_HIYA: u32 = 1;
const TAG_FEEDME: u32 = 2;
const TAG_NOTIFYME: u32 = 3;
const TAG_IS_ALIVE: u32 = 4;
const TAG_HEREIS: u32 = 5;
const TAG_NOTIFICATION: u32 = 6;
const TAG_COMINGSOON: u32 = 7;
const TAG_BLKDATA: u32 = 8;
const TAG_OK: u32 = 9;
const TAG_RECLASS: u32 = 10;
const TAG_BADPATTERN: u32 = 11;
const TAG_DONTSEND: u32 = 12;
const TAG_ALIVE: u32 = 13;

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Upstream offers `class`; reply is `Ok(max_hereis)` or `Reclass`.
    Hiya { class: ProductClass },
    /// Downstream subscribes for products.
    FeedMe { class: ProductClass, max_hereis: u32 },
    /// Downstream subscribes for metadata only.
    NotifyMe { class: ProductClass },
    /// Liveness probe for a worker id.
    IsAlive { id: u32 },
    /// Whole product, primary mode.
    HereIs { product: Product },
    /// Metadata-only delivery.
    Notification { info: ProductInfo },
    /// Alternate mode announcement; reply is `Ok` or `DontSend`.
    ComingSoon { info: ProductInfo, size: u32 },
    /// Alternate mode payload block.
    BlkData {
        signature: Signature,
        offset: u32,
        data: Vec<u8>,
    },
    /// Positive reply carrying `max_hereis` or the assigned worker id.
    Ok { value: u32 },
    /// The subscription was reduced; continue with this class (or drop, if
    /// it is empty).
    Reclass { class: ProductClass },
    /// The request contained an uncompilable pattern.
    BadPattern,
    /// Decline an announced product.
    DontSend,
    /// Liveness answer.
    Alive { alive: bool },
}

// ---------------------------------------------------------------------
// Field codecs.

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u32::<BigEndian>(s.len() as u32).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(r: &mut impl Read) -> Result<String, WireError> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| WireError::BadString)
}

fn write_timestamp(buf: &mut Vec<u8>, ts: Timestamp) {
    buf.write_u64::<BigEndian>(ts.sec).unwrap();
    buf.write_u32::<BigEndian>(ts.usec).unwrap();
}

fn read_timestamp(r: &mut impl Read) -> Result<Timestamp, WireError> {
    Ok(Timestamp::new(
        r.read_u64::<BigEndian>()?,
        r.read_u32::<BigEndian>()?,
    ))
}

fn write_class(buf: &mut Vec<u8>, class: &ProductClass) {
    write_timestamp(buf, class.from);
    write_timestamp(buf, class.to);
    buf.write_u32::<BigEndian>(class.specs.len() as u32).unwrap();
    for spec in &class.specs {
        buf.write_u32::<BigEndian>(spec.feedtype.0).unwrap();
        buf.write_u32::<BigEndian>(spec.patterns.len() as u32).unwrap();
        for pattern in &spec.patterns {
            write_string(buf, pattern.source());
        }
    }
}

fn read_class(r: &mut impl Read) -> Result<ProductClass, WireError> {
    let from = read_timestamp(r)?;
    let to = read_timestamp(r)?;
    let nspecs = r.read_u32::<BigEndian>()?;
    let mut specs = Vec::with_capacity(nspecs.min(1024) as usize);
    for _ in 0..nspecs {
        let feedtype = Feedtype(r.read_u32::<BigEndian>()?);
        let npatterns = r.read_u32::<BigEndian>()?;
        let mut patterns = Vec::with_capacity(npatterns.min(64) as usize);
        for _ in 0..npatterns {
            patterns.push(Pattern::compile(&read_string(r)?)?);
        }
        specs.push(ClassSpec { feedtype, patterns });
    }
    Ok(ProductClass { from, to, specs }.canonical())
}

fn write_info(buf: &mut Vec<u8>, info: &ProductInfo) {
    buf.extend_from_slice(info.signature.as_bytes());
    write_timestamp(buf, info.arrival);
    buf.write_u32::<BigEndian>(info.feedtype.0).unwrap();
    buf.write_u32::<BigEndian>(info.seqno).unwrap();
    buf.write_u32::<BigEndian>(info.size).unwrap();
    write_string(buf, &info.ident);
    write_string(buf, &info.origin);
}

fn read_info(r: &mut impl Read) -> Result<ProductInfo, WireError> {
    let mut sig = [0u8; 16];
    r.read_exact(&mut sig)?;
    let arrival = read_timestamp(r)?;
    let feedtype = Feedtype(r.read_u32::<BigEndian>()?);
    let seqno = r.read_u32::<BigEndian>()?;
    let size = r.read_u32::<BigEndian>()?;
    let ident = read_string(r)?;
    let origin = read_string(r)?;
    Ok(ProductInfo {
        signature: Signature(sig),
        arrival,
        feedtype,
        seqno,
        ident,
        origin,
        size,
    })
}

// ---------------------------------------------------------------------
// Frame codec.

impl Message {
    fn tag(&self) -> u32 {
        match self {
            Message::Hiya { .. } => TAG_HIYA,
            Message::FeedMe { .. } => TAG_FEEDME,
            Message::NotifyMe { .. } => TAG_NOTIFYME,
            Message::IsAlive { .. } => TAG_IS_ALIVE,
            Message::HereIs { .. } => TAG_HEREIS,
            Message::Notification { .. } => TAG_NOTIFICATION,
            Message::ComingSoon { .. } => TAG_COMINGSOON,
            Message::BlkData { .. } => TAG_BLKDATA,
            Message::Ok { .. } => TAG_OK,
            Message::Reclass { .. } => TAG_RECLASS,
            Message::BadPattern => TAG_BADPATTERN,
            Message::DontSend => TAG_DONTSEND,
            Message::Alive { .. } => TAG_ALIVE,
        }
    }
}

/// Writes one frame.
pub fn write_message(w: &mut impl Write, message: &Message) -> Result<(), WireError> {
    let mut body = Vec::new();
    body.write_u32::<BigEndian>(message.tag()).unwrap();
    match message {
        Message::Hiya { class } | Message::NotifyMe { class } | Message::Reclass { class } => {
            write_class(&mut body, class);
        }
        Message::FeedMe { class, max_hereis } => {
            write_class(&mut body, class);
            body.write_u32::<BigEndian>(*max_hereis).unwrap();
        }
        Message::IsAlive { id } => body.write_u32::<BigEndian>(*id).unwrap(),
        Message::HereIs { product } => {
            write_info(&mut body, &product.info);
            body.write_u32::<BigEndian>(product.data.len() as u32).unwrap();
            body.extend_from_slice(&product.data);
        }
        Message::Notification { info } => write_info(&mut body, info),
        Message::ComingSoon { info, size } => {
            write_info(&mut body, info);
            body.write_u32::<BigEndian>(*size).unwrap();
        }
        Message::BlkData {
            signature,
            offset,
            data,
        } => {
            body.extend_from_slice(signature.as_bytes());
            body.write_u32::<BigEndian>(*offset).unwrap();
            body.write_u32::<BigEndian>(data.len() as u32).unwrap();
            body.extend_from_slice(data);
        }
        Message::Ok { value } => body.write_u32::<BigEndian>(*value).unwrap(),
        Message::Alive { alive } => body.write_u32::<BigEndian>(*alive as u32).unwrap(),
        Message::BadPattern | Message::DontSend => {}
    }
    if body.len() as u64 > MAX_FRAME as u64 {
        return Err(WireError::FrameTooLarge(body.len() as u32));
    }
    w.write_u32::<BigEndian>(body.len() as u32)?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame. Blocks until a full frame arrives.
pub fn read_message(r: &mut impl Read) -> Result<Message, WireError> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    let mut body = io::Cursor::new(body);
    let r = &mut body;

    let tag = r.read_u32::<BigEndian>()?;
    let message = match tag {
        TAG_HIYA => Message::Hiya {
            class: read_class(r)?,
        },
        TAG_FEEDME => Message::FeedMe {
            class: read_class(r)?,
            max_hereis: r.read_u32::<BigEndian>()?,
        },
        TAG_NOTIFYME => Message::NotifyMe {
            class: read_class(r)?,
        },
        TAG_IS_ALIVE => Message::IsAlive {
            id: r.read_u32::<BigEndian>()?,
        },
        TAG_HEREIS => {
            let info = read_info(r)?;
            let len = r.read_u32::<BigEndian>()?;
            if len > MAX_FRAME {
                return Err(WireError::FrameTooLarge(len));
            }
            let mut data = vec![0u8; len as usize];
            r.read_exact(&mut data)?;
            Message::HereIs {
                product: Product { info, data },
            }
        }
        TAG_NOTIFICATION => Message::Notification {
            info: read_info(r)?,
        },
        TAG_COMINGSOON => Message::ComingSoon {
            info: read_info(r)?,
            size: r.read_u32::<BigEndian>()?,
        },
        TAG_BLKDATA => {
            let mut sig = [0u8; 16];
            r.read_exact(&mut sig)?;
            let offset = r.read_u32::<BigEndian>()?;
            let len = r.read_u32::<BigEndian>()?;
            if len > MAX_FRAME {
                return Err(WireError::FrameTooLarge(len));
            }
            let mut data = vec![0u8; len as usize];
            r.read_exact(&mut data)?;
            Message::BlkData {
                signature: Signature(sig),
                offset,
                data,
            }
        }
        TAG_OK => Message::Ok {
            value: r.read_u32::<BigEndian>()?,
        },
        TAG_RECLASS => Message::Reclass {
            class: read_class(r)?,
        },
        TAG_BADPATTERN => Message::BadPattern,
        TAG_DONTSEND => Message::DontSend,
        TAG_ALIVE => Message::Alive {
            alive: r.read_u32::<BigEndian>()? != 0,
        },
        other => return Err(WireError::BadTag(other)),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{TS_END, TS_ZERO};

    fn roundtrip(message: Message) -> Message {
        let mut buf = Vec::new();
        write_message(&mut buf, &message).unwrap();
        read_message(&mut io::Cursor::new(buf)).unwrap()
    }

    fn sample_class() -> ProductClass {
        ProductClass::new(vec![
            ClassSpec::new(Feedtype(0b110), "^sa.*").unwrap(),
            ClassSpec::new(Feedtype(0b001), "^fo.*").unwrap(),
        ])
    }

    #[test]
    fn wire_class_roundtrip() {
        let class = sample_class();
        let echoed = roundtrip(Message::Reclass {
            class: class.clone(),
        });
        assert_eq!(echoed, Message::Reclass { class });
    }

    #[test]
    fn wire_class_with_signature_hint_roundtrip() {
        let sig = Signature::of(b"resume here");
        let class = sample_class().with_signature_hint(sig);
        let echoed = roundtrip(Message::FeedMe {
            class: class.clone(),
            max_hereis: HEREIS_UNLIMITED,
        });
        match echoed {
            Message::FeedMe { class: got, max_hereis } => {
                assert_eq!(max_hereis, HEREIS_UNLIMITED);
                let (_, hint) = got.take_signature_hint();
                assert_eq!(hint, Some(sig));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wire_conjunction_class_roundtrip() {
        let narrowed = sample_class().intersect(&ProductClass::new(vec![ClassSpec::new(
            Feedtype(u32::MAX),
            "[0-9]+$",
        )
        .unwrap()]));
        assert!(narrowed.specs.iter().any(|s| s.patterns.len() > 1));
        let echoed = roundtrip(Message::Reclass {
            class: narrowed.clone(),
        });
        assert_eq!(echoed, Message::Reclass { class: narrowed });
    }

    #[test]
    fn wire_hereis_roundtrip() {
        let mut product = Product::new(Feedtype(4), 42, "foo", "origin.example", vec![9u8; 300]);
        product.info.arrival = Timestamp::new(1000, 0);
        let echoed = roundtrip(Message::HereIs {
            product: product.clone(),
        });
        assert_eq!(echoed, Message::HereIs { product });
    }

    #[test]
    fn wire_blkdata_roundtrip() {
        let message = Message::BlkData {
            signature: Signature::of(b"block"),
            offset: 8192,
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn wire_small_messages_roundtrip() {
        for message in [
            Message::IsAlive { id: 7 },
            Message::Ok { value: 7 },
            Message::BadPattern,
            Message::DontSend,
            Message::Alive { alive: true },
            Message::Alive { alive: false },
        ] {
            assert_eq!(roundtrip(message.clone()), message);
        }
    }

    #[test]
    fn wire_empty_class_roundtrip() {
        let class = ProductClass::empty();
        assert_eq!(class.from, TS_ZERO);
        assert_eq!(class.to, TS_END);
        let echoed = roundtrip(Message::Reclass {
            class: class.clone(),
        });
        assert_eq!(echoed, Message::Reclass { class });
    }

    #[test]
    fn wire_bad_tag_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(4).unwrap(); // length
        buf.write_u32::<BigEndian>(999).unwrap(); // tag
        assert!(matches!(
            read_message(&mut io::Cursor::new(buf)),
            Err(WireError::BadTag(999))
        ));
    }

    #[test]
    fn wire_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MAX_FRAME + 1).unwrap();
        assert!(matches!(
            read_message(&mut io::Cursor::new(buf)),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn wire_uncompilable_pattern_in_class() {
        // Hand-build a Reclass frame whose pattern does not compile.
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(TAG_RECLASS).unwrap();
        write_timestamp(&mut body, TS_ZERO);
        write_timestamp(&mut body, TS_END);
        body.write_u32::<BigEndian>(1).unwrap(); // one spec
        body.write_u32::<BigEndian>(1).unwrap(); // feedtype
        body.write_u32::<BigEndian>(1).unwrap(); // one pattern
        write_string(&mut body, "([unclosed");
        let mut frame = Vec::new();
        frame.write_u32::<BigEndian>(body.len() as u32).unwrap();
        frame.extend_from_slice(&body);
        assert!(matches!(
            read_message(&mut io::Cursor::new(frame)),
            Err(WireError::BadPattern(_))
        ));
    }
}
