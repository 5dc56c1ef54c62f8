//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (wall clock, randomness,
//! timers). Production uses [`SystemEnv`]; tests use a fixed clock and a
//! seeded RNG so retention sweeps and retry delays are reproducible.

use std::time::Duration;

use sotto_proto::{InstanceUid, Uid};

/// Abstract environment providing time, randomness, and sleep.
///
/// # Invariants
///
/// - `now_ms()` never goes backwards within one execution context.
/// - `random_bytes()` uses cryptographically secure entropy in production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time, unix milliseconds.
    ///
    /// Wall clock (not a monotonic instant) because persisted rows carry
    /// absolute timestamps that must survive a restart.
    fn now_ms(&self) -> u64;

    /// Sleep for the specified duration.
    ///
    /// Only driver code awaits this (retry backoff); step logic never does.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill the buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Draw a fresh generic uid.
    fn random_uid(&self) -> Uid {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        Uid::from_bytes(bytes)
    }

    /// Draw a fresh instance uid.
    fn random_instance_uid(&self) -> InstanceUid {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        InstanceUid::from_bytes(bytes)
    }

    /// Draw one 32-byte nonce for a protocol step.
    fn random_nonce(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Production environment: system clock, tokio timers, OS entropy.
#[derive(Clone, Debug, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}
