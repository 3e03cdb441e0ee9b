//! Data-products and their metadata.
//!
//! A product is one atomic payload plus metadata, inserted into the queue
//! once and delivered many times. The 16-byte content signature deduplicates
//! products across redundant ingest paths; the arrival timestamp assigned at
//! insert is the canonical ordering key.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::feedtype::Feedtype;

/// 16-byte content-derived product signature (md5 of the payload).
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signature(pub [u8; 16]);

impl Signature {
    /// Computes the signature of a payload.
    pub fn of(data: &[u8]) -> Self {
        Signature(md5::compute(data).0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Signatures read better as hex strings than as byte arrays.
impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Error, Debug)]
#[error("invalid product signature: {0}")]
pub struct SignatureParseError(String);

impl FromStr for Signature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| SignatureParseError(s.to_string()))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| SignatureParseError(s.to_string()))?;
        Ok(Signature(arr))
    }
}

/// Arrival timestamp: seconds and microseconds since the Unix epoch.
///
/// Ordering is lexicographic on `(sec, usec)`; within the queue, equal
/// timestamps are tie-broken by the in-file sequence counter.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: u64,
    pub usec: u32,
}

/// "From the beginning" sentinel.
pub const TS_ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };
/// "End of time" sentinel.
pub const TS_END: Timestamp = Timestamp {
    sec: u64::MAX,
    usec: 999_999,
};

impl Timestamp {
    pub fn new(sec: u64, usec: u32) -> Self {
        Timestamp { sec, usec }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: elapsed.as_secs(),
            usec: elapsed.subsec_micros(),
        }
    }

    /// The timestamp as a UTC datetime. Saturates on out-of-range values
    /// (the `TS_END` sentinel has no calendar form).
    pub fn to_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.sec as i64, self.usec * 1000)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Timestamp {
            sec: dt.timestamp().max(0) as u64,
            usec: dt.timestamp_subsec_micros(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Product metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductInfo {
    pub signature: Signature,
    /// Assigned by the queue at insert; canonical ordering key.
    pub arrival: Timestamp,
    pub feedtype: Feedtype,
    pub seqno: u32,
    /// Opaque product identifier within the namespace.
    pub ident: String,
    pub origin: String,
    pub size: u32,
}

impl fmt::Display for ProductInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>8} {} {:>6} {}",
            self.arrival, self.size, self.signature, self.seqno, self.ident
        )
    }
}

/// A complete product: metadata plus payload. Immutable after insertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Product {
    pub info: ProductInfo,
    pub data: Vec<u8>,
}

impl Product {
    /// Builds a product from raw bytes: signature from content, size from
    /// length, arrival left zero for the queue to assign.
    pub fn new(feedtype: Feedtype, seqno: u32, ident: &str, origin: &str, data: Vec<u8>) -> Self {
        Product {
            info: ProductInfo {
                signature: Signature::of(&data),
                arrival: TS_ZERO,
                feedtype,
                seqno,
                ident: ident.to_string(),
                origin: origin.to_string(),
                size: data.len() as u32,
            },
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_signature_roundtrip() {
        let sig = Signature::of(b"an example payload");
        let parsed: Signature = sig.to_string().parse().unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn product_signature_rejects_short_hex() {
        assert!("0badc0de".parse::<Signature>().is_err());
        assert!("not hex at all, thirty-two chars".parse::<Signature>().is_err());
    }

    #[test]
    fn product_timestamp_ordering() {
        let a = Timestamp::new(1000, 0);
        let b = Timestamp::new(1000, 1);
        let c = Timestamp::new(1001, 0);
        assert!(a < b && b < c);
        assert!(TS_ZERO < a && c < TS_END);
    }

    #[test]
    fn product_timestamp_utc_roundtrip() {
        let ts = Timestamp::new(1_711_927_800, 250_000); // 2024-03-31T23:30:00.25Z
        let dt = ts.to_utc();
        assert_eq!(Timestamp::from_utc(dt), ts);
        assert_eq!(dt.format("%Y-%m-%dT%H:%M").to_string(), "2024-03-31T23:30");
    }

    #[test]
    fn product_new_computes_signature_and_size() {
        let p = Product::new(Feedtype(4), 42, "foo", "host.example", vec![0u8; 100]);
        assert_eq!(p.info.size, 100);
        assert_eq!(p.info.signature, Signature::of(&vec![0u8; 100]));
        assert_eq!(p.info.arrival, TS_ZERO);
    }
}
