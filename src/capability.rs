//! Capability handles for ambient state the design notes forbid making a
//! process-wide singleton: the current-time source and the randomness
//! source. Components take these as constructor arguments instead of
//! reaching for `Utc::now()`/`rand::thread_rng()` directly, so tests can
//! inject deterministic fakes.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Current-time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed-or-steppable clock for deterministic tests.
pub struct FixedClock(parking_lot::Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(parking_lot::Mutex::new(at))
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.0.lock();
        *guard += duration;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// Randomness source, used by the introduction puzzle factory (solution
/// strings) and the inserter's jittered backoff. The RNG source itself is
/// treated as an external collaborator; this trait is the seam at which a
/// host-supplied source can be substituted.
pub trait RandomSource: Send + Sync {
    /// Fills `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);

    /// Uniform random `u64` in `[0, bound)`. `bound` must be nonzero.
    fn next_bounded(&self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf) % bound
    }

    /// Random alphanumeric solution string of the given length, used for
    /// introduction-puzzle solutions.
    fn solution_string(&self, len: usize) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        (0..len)
            .map(|_| {
                let idx = self.next_bounded(ALPHABET.len() as u64) as usize;
                ALPHABET[idx] as char
            })
            .collect()
    }
}

/// `rand`-backed default implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buf);
    }
}

/// Deterministic counter-based source for tests.
pub struct CountingRandom(std::sync::atomic::AtomicU64);

impl CountingRandom {
    pub fn new(seed: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(seed))
    }
}

impl RandomSource for CountingRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let v = self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            *byte = (v & 0xff) as u8;
        }
    }
}

/// Bundle of capabilities threaded through the engine's constructors.
#[derive(Clone)]
pub struct Capabilities {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
}

impl Capabilities {
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(SystemRandom),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
