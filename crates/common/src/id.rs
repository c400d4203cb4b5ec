//! Time-ordered 64-bit document identifiers.
//!
//! Layout (most significant first): 42 bits of milliseconds since
//! [`ID_EPOCH_MS`], 10 bits of per-process node entropy, 12 bits of
//! sequence within the millisecond. Ids sort by creation time first.

use crate::DocumentError;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// 2020-01-01T00:00:00Z.
pub const ID_EPOCH_MS: u64 = 1_577_836_800_000;

const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;
const TIME_SHIFT: u32 = NODE_BITS + SEQ_BITS;

/// A unique, totally ordered document identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Generate a fresh id from the process-wide generator.
    pub fn new() -> Self {
        generator().next()
    }

    /// Wrap a raw 64-bit value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Creation time encoded in the id, in epoch milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> TIME_SHIFT) + ID_EPOCH_MS
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| DocumentError::InvalidId(s.to_string()))
    }
}

// Ids travel as decimal strings so 64-bit values survive JSON consumers
// that only have doubles.
impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = DocumentId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a document id as a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(DocumentId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(DocumentId)
                    .map_err(|_| E::custom(format!("negative document id {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

struct IdGenerator {
    node: u64,
    /// (last millisecond offset, sequence within it)
    state: Mutex<(u64, u64)>,
}

impl IdGenerator {
    fn next(&self) -> DocumentId {
        let mut state = self.state.lock();
        let (last_ms, seq) = *state;
        let now = crate::now_ms().saturating_sub(ID_EPOCH_MS);

        // A clock that moved backwards keeps issuing from the last millisecond.
        let (ms, seq) = if now > last_ms {
            (now, 0)
        } else {
            let seq = (seq + 1) & SEQ_MASK;
            if seq == 0 {
                (last_ms + 1, 0)
            } else {
                (last_ms, seq)
            }
        };
        *state = (ms, seq);

        DocumentId((ms << TIME_SHIFT) | ((self.node & NODE_MASK) << SEQ_BITS) | seq)
    }
}

fn generator() -> &'static IdGenerator {
    static GENERATOR: OnceLock<IdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(|| IdGenerator {
        node: rand::thread_rng().gen_range(0..=NODE_MASK),
        state: Mutex::new((0, 0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let ids: Vec<DocumentId> = (0..10_000).map(|_| DocumentId::new()).collect();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_timestamp_is_recent() {
        let before = crate::now_ms();
        let id = DocumentId::new();
        assert!(id.timestamp_ms() + 1000 >= before);
    }

    #[test]
    fn test_parse_and_display() {
        let id = DocumentId::from_raw(123_456_789);
        assert_eq!(id.to_string(), "123456789");
        assert_eq!("123456789".parse::<DocumentId>().unwrap(), id);
        assert!("not-an-id".parse::<DocumentId>().is_err());
    }

    #[test]
    fn test_serde_accepts_string_and_number() {
        let id = DocumentId::from_raw(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
        let from_str: DocumentId = serde_json::from_str("\"42\"").unwrap();
        let from_num: DocumentId = serde_json::from_str("42").unwrap();
        assert_eq!(from_str, id);
        assert_eq!(from_num, id);
        assert!(serde_json::from_str::<DocumentId>("-1").is_err());
    }
}
