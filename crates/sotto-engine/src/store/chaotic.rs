//! Chaotic store wrapper for fault injection testing.
//!
//! Wraps a real store and fails `commit` at a configured rate. Reads always
//! pass through: the failure mode under test is the atomic batch commit,
//! which is the only transient error the runner retries.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex};

use sotto_proto::{ChannelTarget, CryptoIdentity, InstanceUid, MessageId};

use super::{
    InstanceLink, ProtocolInstanceRow, ProtocolStore, ReceivedMessageRow, StoreError, WriteBatch,
};

/// Simple deterministic RNG for chaos injection.
///
/// Linear congruential generator: fast, dependency-free, reproducible with
/// the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0).
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn should_fail(&mut self, failure_rate: f64) -> bool {
        self.next() < failure_rate
    }
}

/// Store wrapper that randomly rejects commits.
#[derive(Clone)]
pub struct ChaoticStore<S: ProtocolStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail).
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    failed_commits: Arc<Mutex<usize>>,
}

impl<S: ProtocolStore> ChaoticStore<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0].
    #[must_use]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0].
    #[must_use]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            failed_commits: Arc::new(Mutex::new(0)),
        }
    }

    /// Underlying store, for checking invariants after chaos.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of commits rejected so far.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn failed_commit_count(&self) -> usize {
        *self.failed_commits.lock().expect("Mutex poisoned")
    }
}

impl<S: ProtocolStore> ProtocolStore for ChaoticStore<S> {
    fn instance(
        &self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<Option<ProtocolInstanceRow>, StoreError> {
        self.inner.instance(owned_identity, instance_uid)
    }

    fn all_instances(&self) -> Result<Vec<ProtocolInstanceRow>, StoreError> {
        self.inner.all_instances()
    }

    fn message(&self, message_id: MessageId) -> Result<Option<ReceivedMessageRow>, StoreError> {
        self.inner.message(message_id)
    }

    fn all_message_ids(&self) -> Result<Vec<MessageId>, StoreError> {
        self.inner.all_message_ids()
    }

    fn messages_for_instance(
        &self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<Vec<ReceivedMessageRow>, StoreError> {
        self.inner.messages_for_instance(owned_identity, instance_uid)
    }

    fn links_with_parent(
        &self,
        owned_identity: CryptoIdentity,
        parent: InstanceUid,
    ) -> Result<Vec<InstanceLink>, StoreError> {
        self.inner.links_with_parent(owned_identity, parent)
    }

    fn links_with_child(
        &self,
        owned_identity: CryptoIdentity,
        child: InstanceUid,
    ) -> Result<Vec<InstanceLink>, StoreError> {
        self.inner.links_with_child(owned_identity, child)
    }

    fn running_creation_targets(&self) -> Result<Vec<ChannelTarget>, StoreError> {
        self.inner.running_creation_targets()
    }

    fn creation_instances_for_target(
        &self,
        target: ChannelTarget,
    ) -> Result<Vec<InstanceUid>, StoreError> {
        self.inner.creation_instances_for_target(target)
    }

    #[allow(clippy::expect_used)]
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let fail = self.rng.lock().expect("Mutex poisoned").should_fail(self.failure_rate);
        if fail {
            *self.failed_commits.lock().expect("Mutex poisoned") += 1;
            return Err(StoreError::CommitFailed("injected commit failure".to_string()));
        }
        self.inner.commit(batch)
    }
}
