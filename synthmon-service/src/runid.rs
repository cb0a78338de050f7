//! Per-run identifiers.
//!
//! A [`RunId`] is a 26-character, Crockford-base32 token with a 48-bit
//! millisecond timestamp prefix and 80 bits of entropy. Entropy is monotonic
//! within one millisecond so that two jitter-less tests firing on the same
//! tick never produce colliding object keys.

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENTROPY_BITS: u32 = 80;
const ENTROPY_MASK: u128 = (1 << ENTROPY_BITS) - 1;
const ENCODED_LEN: usize = 26;

/// Identifier for one test run, unique across runs of the same test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u128);

impl RunId {
    /// Generates the next identifier from the process-wide generator.
    pub fn generate() -> RunId {
        static STATE: Mutex<(u64, u128)> = Mutex::new((0, 0));

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut state = STATE.lock().expect("run-id generator poisoned");
        let (last_ms, last_entropy) = *state;

        let entropy = if now_ms == last_ms {
            // Same millisecond: increment. 2^80 increments per millisecond
            // are unreachable, so the wrap-around mask never fires.
            (last_entropy + 1) & ENTROPY_MASK
        } else {
            let mut buf = [0u8; 10];
            rand::rng().fill_bytes(&mut buf);
            let mut value = 0u128;
            for byte in buf {
                value = (value << 8) | byte as u128;
            }
            value
        };

        *state = (now_ms, entropy);
        RunId(((now_ms as u128) << ENTROPY_BITS) | entropy)
    }

    /// The millisecond timestamp encoded in the prefix.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> ENTROPY_BITS) as u64
    }

    #[cfg(test)]
    fn from_parts(ms: u64, entropy: u128) -> RunId {
        RunId(((ms as u128) << ENTROPY_BITS) | (entropy & ENTROPY_MASK))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = (ENCODED_LEN - 1 - i) as u32 * 5;
            *slot = ALPHABET[((self.0 >> shift) & 0x1f) as usize];
        }
        // The alphabet is ASCII by construction.
        f.write_str(std::str::from_utf8(&out).expect("base32 output is ascii"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_to_26_crockford_characters() {
        let id = RunId::generate();
        let encoded = id.to_string();
        assert_eq!(encoded.len(), 26);
        assert!(encoded.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn ids_are_monotonic_within_a_millisecond() {
        let ids: Vec<RunId> = (0..64).map(|_| RunId::generate()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        // Lexicographic order of the encoding matches numeric order.
        let encoded: Vec<String> = ids.iter().map(RunId::to_string).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn timestamp_prefix_round_trips() {
        let id = RunId::from_parts(1_700_000_000_123, 42);
        assert_eq!(id.timestamp_ms(), 1_700_000_000_123);
    }

    #[test]
    fn known_encoding() {
        // All-zero id encodes to all '0'.
        assert_eq!(RunId(0).to_string(), "0".repeat(26));
        // Entropy of 1 flips only the last character.
        assert_eq!(
            RunId::from_parts(0, 1).to_string(),
            format!("{}1", "0".repeat(25))
        );
    }
}
