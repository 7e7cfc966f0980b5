//! Timestamp identifiers (TIDs)
//!
//! A TID is a 13-character base32-sortable identifier packing a microsecond
//! timestamp and a 10-bit clock id:
//!
//! ```text
//! 0TTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTCCCCCCCCCC
//! ```
//!
//! Lexicographic order on TIDs equals numeric order on the packed value, so
//! record keys and commit revisions sort chronologically for free.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use smol_str::SmolStr;

use crate::error::{ErrorKind, RepoError, Result};

const S32_CHARS: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Encode a u64 as exactly 13 sort-order base32 characters
fn s32_encode(mut i: u64) -> SmolStr {
    let mut buf = [0u8; 13];
    for slot in buf.iter_mut().rev() {
        *slot = S32_CHARS[(i & 0x1F) as usize];
        i >>= 5;
    }
    // 13 chars cover 65 bits; the top bit is always zero for valid input
    SmolStr::new(std::str::from_utf8(&buf).expect("s32 alphabet is ASCII"))
}

/// Decode a sort-order base32 string to a u64
fn s32_decode(s: &str) -> Option<u64> {
    let mut i: u64 = 0;
    for c in s.bytes() {
        let v = S32_CHARS.iter().position(|&x| x == c)?;
        i = (i << 5) | v as u64;
    }
    Some(i)
}

fn is_valid_tid(s: &str) -> bool {
    s.len() == 13
        && s.bytes().all(|b| S32_CHARS.contains(&b))
        // packed value fits 64 bits, so the first char carries at most 4 bits
        && matches!(s.as_bytes()[0], b'2'..=b'7' | b'a'..=b'j')
}

/// A timestamp identifier: record key suffix and commit revision marker
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parse a TID from a string, validating length and alphabet
    pub fn new(s: &str) -> Result<Self> {
        if is_valid_tid(s) {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(RepoError::new(ErrorKind::Serialization, None)
                .with_context(format!("invalid TID: {s:?}"))
                .with_help("TIDs are 13 sort-order base32 characters"))
        }
    }

    /// Build a TID from a microsecond timestamp and clock id
    pub fn from_micros(micros: u64, clock_id: u16) -> Self {
        let packed = ((micros << 10) & 0x7FFF_FFFF_FFFF_FC00) | (clock_id as u64 & 0x3FF);
        Self(s32_encode(packed))
    }

    /// Build a TID from an event sequence number
    ///
    /// Commit revisions use the allocated sequence as the timestamp field with
    /// clock id 0, so `rev` order, `seq` order, and chain order all agree.
    pub fn from_sequence(seq: u64) -> Self {
        Self::from_micros(seq, 0)
    }

    /// The microsecond timestamp (or sequence number) packed into this TID
    pub fn timestamp(&self) -> u64 {
        s32_decode(&self.0).expect("validated on construction") >> 10
    }

    /// The 10-bit clock id packed into this TID
    pub fn clock_id(&self) -> u16 {
        (s32_decode(&self.0).expect("validated on construction") & 0x3FF) as u16
    }

    /// String view of the TID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Tid {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: SmolStr = Deserialize::deserialize(deserializer)?;
        Tid::new(&s).map_err(D::Error::custom)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Monotonic TID source
///
/// Guarantees strictly increasing TIDs across calls even when the system
/// clock stalls or drifts backwards: each tick is at least one microsecond
/// after the previous one.
#[derive(Debug, Clone)]
pub struct Ticker {
    clock_id: u16,
    last_micros: u64,
}

impl Ticker {
    /// Create a ticker with a random clock id
    pub fn new() -> Self {
        Self {
            clock_id: rand::random::<u16>() & 0x3FF,
            last_micros: 0,
        }
    }

    /// Next TID, strictly greater than any previously returned
    pub fn next(&mut self) -> Tid {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        self.last_micros = now.max(self.last_micros + 1);
        Tid::from_micros(self.last_micros, self.clock_id)
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_13_chars() {
        assert_eq!(s32_encode(0).len(), 13);
        assert_eq!(s32_encode(0), "2222222222222");
        assert_eq!(s32_encode(u64::MAX >> 1).len(), 13);
    }

    #[test]
    fn decode_inverts_encode() {
        for n in [0u64, 1, 31, 32, 1 << 20, (1 << 63) - 1] {
            assert_eq!(s32_decode(&s32_encode(n)), Some(n));
        }
    }

    #[test]
    fn tid_roundtrip_fields() {
        let tid = Tid::from_micros(1_700_000_000_000_000, 17);
        assert_eq!(tid.timestamp(), 1_700_000_000_000_000);
        assert_eq!(tid.clock_id(), 17);
        assert_eq!(tid.as_str().len(), 13);
    }

    #[test]
    fn tid_order_matches_time_order() {
        let a = Tid::from_micros(1_000, 5);
        let b = Tid::from_micros(1_001, 0);
        assert!(a < b);
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn sequence_tids_sort_with_sequence() {
        let revs: Vec<Tid> = (1..100).map(Tid::from_sequence).collect();
        let mut sorted = revs.clone();
        sorted.sort();
        assert_eq!(revs, sorted);
        assert_eq!(revs[10].timestamp(), 11);
    }

    #[test]
    fn parse_rejects_bad_tids() {
        assert!(Tid::new("").is_err());
        assert!(Tid::new("short").is_err());
        assert!(Tid::new("1111111111111").is_err()); // '1' not in alphabet
        assert!(Tid::new("z222222222222").is_err()); // top bit set
        assert!(Tid::new("2222222222222").is_ok());
    }

    #[test]
    fn ticker_is_strictly_monotonic() {
        let mut ticker = Ticker::new();
        let mut prev = ticker.next();
        for _ in 0..1000 {
            let next = ticker.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn serde_roundtrip() {
        let tid = Tid::from_micros(123_456_789, 3);
        let cbor = serde_ipld_dagcbor::to_vec(&tid).unwrap();
        let back: Tid = serde_ipld_dagcbor::from_slice(&cbor).unwrap();
        assert_eq!(tid, back);
    }
}
