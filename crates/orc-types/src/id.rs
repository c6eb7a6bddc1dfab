//! Lexicographically sortable, time-ordered opaque identifiers.
//!
//! Each id is `<prefix>_<26 Crockford-base32 chars>`, matching the ULID
//! layout: 48 bits of millisecond timestamp followed by 80 bits of
//! randomness. Two ids minted in the same millisecond on the same process
//! are kept strictly increasing by incrementing the random component,
//! mirroring the standard ULID monotonic-generator trick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Returns the current UTC wall-clock time with millisecond resolution.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A fixed, test-only clock. Advances only when told to.
pub struct FixedClock {
    millis: AtomicU64,
}

impl FixedClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Monotonic id minter. One instance is normally shared process-wide.
pub struct IdGenerator {
    state: Mutex<(u64, u128)>,
    rng: Mutex<u64>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(seed_from_time())
    }
}

impl IdGenerator {
    pub fn new(rng_seed: u64) -> Self {
        Self {
            state: Mutex::new((0, 0)),
            rng: Mutex::new(rng_seed | 1),
        }
    }

    /// Mint a new id with the given type prefix (e.g. `"run"`, `"stp"`).
    pub fn new_id(&self, prefix: &str, clock: &dyn Clock) -> String {
        let ts = clock.now_ms() & 0xFFFF_FFFF_FFFF; // 48 bits
        let mut state = self.state.lock().unwrap();
        let random = if ts == state.0 {
            state.1 = state.1.wrapping_add(1) & MAX_80_BIT;
            state.1
        } else {
            let r = self.next_random_80();
            *state = (ts, r);
            r
        };
        drop(state);
        format!("{prefix}_{}", encode_ulid(ts, random))
    }

    fn next_random_80(&self) -> u128 {
        let mut guard = self.rng.lock().unwrap();
        let hi = xorshift64(&mut guard) as u128;
        let lo = xorshift64(&mut guard) as u128;
        ((hi << 64) | lo) & MAX_80_BIT
    }
}

const MAX_80_BIT: u128 = (1u128 << 80) - 1;

fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn seed_from_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E3779B97F4A7C15)
}

/// Encode a 48-bit timestamp and 80-bit random value as 26 Crockford chars.
fn encode_ulid(timestamp_ms: u64, random: u128) -> String {
    let mut value: u128 = (timestamp_ms as u128) << 80 | (random & MAX_80_BIT);
    let mut chars = [0u8; 26];
    for slot in chars.iter_mut().rev() {
        *slot = CROCKFORD_ALPHABET[(value & 0x1F) as usize];
        value >>= 5;
    }
    String::from_utf8(chars.to_vec()).expect("crockford alphabet is ascii")
}

/// Validates `^<prefix>_[0-9A-HJKMNP-TV-Z]{26}$`.
pub fn is_valid_id(prefix: &str, id: &str) -> bool {
    let Some(rest) = id.strip_prefix(prefix).and_then(|r| r.strip_prefix('_')) else {
        return false;
    };
    rest.len() == 26
        && rest
            .bytes()
            .all(|b| CROCKFORD_ALPHABET.contains(&b.to_ascii_uppercase()))
}

/// Global id types minted across the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    Run,
    Step,
    Workflow,
    Tenant,
    Agent,
    Policy,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Run => "run",
            IdKind::Step => "stp",
            IdKind::Workflow => "wfr",
            IdKind::Tenant => "ten",
            IdKind::Agent => "agt",
            IdKind::Policy => "pol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_lexicographically_sorted_over_time() {
        let gen = IdGenerator::new(42);
        let clock = FixedClock::new(1_700_000_000_000);
        let a = gen.new_id("run", &clock);
        clock.advance(1);
        let b = gen.new_id("run", &clock);
        clock.advance(1000);
        let c = gen.new_id("run", &clock);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn same_millisecond_ids_are_monotonic() {
        let gen = IdGenerator::new(7);
        let clock = FixedClock::new(1_700_000_000_000);
        let a = gen.new_id("stp", &clock);
        let b = gen.new_id("stp", &clock);
        let c = gen.new_id("stp", &clock);
        assert!(a < b, "{a} should sort before {b}");
        assert!(b < c, "{b} should sort before {c}");
    }

    #[test]
    fn validates_prefix_and_shape() {
        let gen = IdGenerator::default();
        let clock = SystemClock;
        let id = gen.new_id("run", &clock);
        assert!(is_valid_id("run", &id));
        assert!(!is_valid_id("stp", &id));
        assert!(!is_valid_id("run", "run_tooshort"));
        assert!(!is_valid_id("run", "run_ILOU00000000000000000000")); // contains excluded letters I,L,O,U
    }

    #[test]
    fn ids_have_expected_shape() {
        let gen = IdGenerator::default();
        let clock = SystemClock;
        let id = gen.new_id("wfr", &clock);
        assert!(id.starts_with("wfr_"));
        assert_eq!(id.len(), "wfr_".len() + 26);
    }
}
