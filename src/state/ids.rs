//! Snowflake identifiers.
//!
//! 64-bit, time-ordered ids: 41 bits of milliseconds since [`EPOCH_MS`],
//! 10 bits of node id and a 12 bit per-millisecond sequence. Ids minted on
//! different nodes never collide, and ids minted on one node are strictly
//! increasing even if the wall clock steps backwards.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 2023-01-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: i64 = 1_672_531_200_000;

/// Number of bits reserved for the node id.
pub const NODE_BITS: u32 = 10;

/// Number of bits reserved for the sequence.
pub const SEQUENCE_BITS: u32 = 12;

/// Largest valid node id.
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// A Snowflake id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(u64);

impl Snowflake {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds since the unix epoch at which this id was minted.
    pub fn timestamp_ms(&self) -> i64 {
        (self.0 >> (NODE_BITS + SEQUENCE_BITS)) as i64 + EPOCH_MS
    }

    pub fn node_id(&self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & u64::from(MAX_NODE_ID)) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & MAX_SEQUENCE) as u16
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

// Serialized as a decimal string; JSON clients lose precision past 2^53.
impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    sequence: u64,
}

/// Thread-safe Snowflake generator for one node.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node_id: u16,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator {
    /// Create a generator. Node ids above [`MAX_NODE_ID`] are masked.
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: node_id & MAX_NODE_ID,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Mint the next id.
    pub fn next_id(&self) -> Snowflake {
        let mut state = self.state.lock();
        let mut now = elapsed_ms();

        // Never go backwards: reuse the last millisecond if the clock stepped back.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; borrow the next one.
                now = state.last_ms + 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let raw = ((now as u64) << (NODE_BITS + SEQUENCE_BITS))
            | (u64::from(self.node_id) << SEQUENCE_BITS)
            | state.sequence;
        Snowflake(raw)
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

fn elapsed_ms() -> i64 {
    (chrono::Utc::now().timestamp_millis() - EPOCH_MS).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_strictly_increase() {
        let gen = SnowflakeGenerator::new(3);
        let mut last = gen.next_id();
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_fields_decode() {
        let gen = SnowflakeGenerator::new(17);
        let id = gen.next_id();
        assert_eq!(id.node_id(), 17);
        let drift = (id.timestamp_ms() - chrono::Utc::now().timestamp_millis()).abs();
        assert!(drift < 5_000);
    }

    #[test]
    fn test_node_id_masked() {
        let gen = SnowflakeGenerator::new(MAX_NODE_ID + 5);
        assert_eq!(gen.node_id(), 4);
    }

    #[test]
    fn test_unique_across_threads() {
        let gen = Arc::new(SnowflakeGenerator::new(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || (0..2_000).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    #[test]
    fn test_serializes_as_string() {
        let id = Snowflake::from_raw(1234567890123456789);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1234567890123456789\"");
        let back: Snowflake = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
