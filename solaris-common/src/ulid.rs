//! Time-sortable 128-bit identifiers.
//!
//! Layout: 48-bit millisecond timestamp in the high bits, 80 bits of
//! entropy in the low bits, the whole thing compared and encoded as a
//! big-endian 128-bit integer so lexicographic byte order equals numeric
//! order equals creation order.

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ulid(pub u128);

impl Ulid {
    /// Generates a new identifier from the current wall-clock time and a
    /// fresh 80 bits of entropy. Two calls within the same millisecond are
    /// NOT guaranteed ordered by this function alone; callers that need
    /// strict monotonicity within a millisecond must route through a
    /// per-log monotonic generator, see [`MonotonicGenerator`].
    pub fn new() -> Self {
        Self::from_parts(Utc::now().timestamp_millis() as u64, &mut rand::thread_rng())
    }

    pub fn from_parts(timestamp_ms: u64, rng: &mut impl RngCore) -> Self {
        let ts = (timestamp_ms & 0xFFFF_FFFF_FFFF) as u128; // 48 bits
        let mut entropy = [0u8; 16];
        rng.fill_bytes(&mut entropy);
        // keep only the low 80 bits of the random buffer
        let entropy = u128::from_be_bytes(entropy) & ((1u128 << 80) - 1);

        Ulid((ts << 80) | entropy)
    }

    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> 80) as u64
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_ms() as i64)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Smallest identifier possible, used as a sentinel lower bound.
    pub const MIN: Ulid = Ulid(0);
    /// Largest identifier possible, used as a sentinel upper bound.
    pub const MAX: Ulid = Ulid(u128::MAX);

    /// Binary-increment, treating the id as a big-endian 128-bit integer.
    /// Used only for cursor advancement across a chunk boundary; never
    /// used to fabricate record ids.
    pub fn next(self) -> Self {
        Ulid(self.0.saturating_add(1))
    }

    /// Binary-decrement, see [`Ulid::next`].
    pub fn prev(self) -> Self {
        Ulid(self.0.saturating_sub(1))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Ulid(u128::from_be_bytes(bytes))
    }

    /// Crockford base-32 encoding, 26 ASCII characters.
    pub fn to_string_encoded(&self) -> String {
        let mut out = vec![0u8; ENCODED_LEN];
        let mut value = self.0;

        for slot in out.iter_mut().rev() {
            *slot = ENCODING[(value & 0x1F) as usize];
            value >>= 5;
        }

        // SAFETY: ENCODING only contains ASCII bytes.
        String::from_utf8(out).unwrap()
    }

    pub fn from_string_encoded(input: &str) -> Result<Self> {
        if input.len() != ENCODED_LEN {
            return Err(Error::invalid(format!(
                "ulid must be {ENCODED_LEN} characters, got {}",
                input.len()
            )));
        }

        let mut value: u128 = 0;

        for ch in input.chars() {
            let digit = decode_char(ch)
                .ok_or_else(|| Error::invalid(format!("invalid ulid character: {ch}")))?;
            value = (value << 5) | digit as u128;
        }

        Ok(Ulid(value))
    }
}

impl Default for Ulid {
    fn default() -> Self {
        Ulid::new()
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_encoded())
    }
}

fn decode_char(ch: char) -> Option<u8> {
    let upper = ch.to_ascii_uppercase();
    ENCODING.iter().position(|&b| b as char == upper).map(|p| p as u8)
}

/// Generates strictly increasing ids within the same millisecond by
/// bumping the entropy component instead of re-rolling it. A plain
/// `Ulid::new()` per record would not guarantee that ordering.
pub struct MonotonicGenerator {
    last: Option<Ulid>,
}

impl MonotonicGenerator {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn next_after(&mut self, floor: Option<Ulid>) -> Ulid {
        let now_ms = Utc::now().timestamp_millis() as u64;
        let candidate = Ulid::from_parts(now_ms, &mut rand::thread_rng());

        let min_floor = match (self.last, floor) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                self.last = Some(candidate);
                return candidate;
            }
        };

        let next = if candidate > min_floor {
            candidate
        } else {
            min_floor.next()
        };

        self.last = Some(next);
        next
    }
}

impl Default for MonotonicGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let id = Ulid::new();
        let encoded = id.to_string_encoded();
        assert_eq!(encoded.len(), 26);
        let decoded = Ulid::from_string_encoded(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn next_prev_are_inverse_at_boundary() {
        let id = Ulid(42);
        assert_eq!(id.next().prev(), id);
    }

    #[test]
    fn ordering_follows_timestamp() {
        let mut rng = rand::thread_rng();
        let a = Ulid::from_parts(1_000, &mut rng);
        let b = Ulid::from_parts(2_000, &mut rng);
        assert!(a < b);
    }

    #[test]
    fn monotonic_generator_strictly_increases_same_millisecond() {
        let mut gen = MonotonicGenerator::new();
        let mut last = None;

        for _ in 0..1000 {
            let id = gen.next_after(last);
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
    }
}
