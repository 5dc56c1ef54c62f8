//! Channel presence coordinator.
//!
//! Periodically (bootstrap, app-foreground) finds remote devices we should
//! have a secure channel with but do not, and starts the protocol that heals
//! each gap. One shared candidate-selection pass serves both healing modes;
//! an explicit elapsed-time policy decides per candidate whether to send a
//! cheap signed ping (which starts channel creation) or to distrust the
//! stale device record entirely and re-discover the identity's devices.
//!
//! # Invariants
//!
//! - A candidate already covered by a running creation protocol is skipped.
//!   This is the idempotence guarantee: repeated sweeps with no state change
//!   post nothing, so a sweep per app-foreground cannot storm the network.
//! - Per-device failures are logged and skipped; one broken candidate never
//!   aborts the batch.
//! - The coordinator only reads and starts protocol runs; it never mutates
//!   instance state directly.

use std::{collections::HashSet, time::Duration};

use sotto_proto::{ChannelTarget, CryptoIdentity, ProtocolKind, payloads};
use thiserror::Error;

use crate::{
    collaborators::{
        ChannelGateway, CollaboratorError, DeviceScope, IdentityDirectory, RemoteDevice,
    },
    env::Environment,
    runner::ProtocolIntake,
    store::{ProtocolStore, StoreError},
};

/// When to distrust a device record instead of pinging it.
#[derive(Clone, Copy, Debug)]
pub struct PresencePolicy {
    /// A candidate not heard from for this long takes the
    /// delete-then-discover path; anything fresher is pinged.
    pub stale_after: Duration,
    /// Skip owned identities that are not active (ping mode only; stale
    /// records are cleaned regardless).
    pub require_active_identity: bool,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self { stale_after: Duration::from_secs(30 * 24 * 60 * 60), require_active_identity: true }
    }
}

/// What one sweep did; returned for observability and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresenceSummary {
    /// Device pairs lacking a channel.
    pub candidates: usize,
    /// Channel-creation runs started (ping mode).
    pub creations_started: usize,
    /// Device-discovery runs started (delete-then-discover mode).
    pub discoveries_started: usize,
    /// Candidates skipped because a creation protocol is already running.
    pub skipped_running: usize,
    /// Candidates skipped because of per-device failures.
    pub failures: usize,
}

/// Errors that abort a whole sweep (per-device errors never do).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// Store snapshot query failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Enumerating owned identities failed.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// The coordinator. Holds snapshots-only references; all work happens in
/// [`sweep`](Self::sweep).
pub struct PresenceCoordinator<'a, E, S, I, C, R>
where
    E: Environment,
    S: ProtocolStore,
    I: IdentityDirectory,
    C: ChannelGateway,
    R: ProtocolIntake + ?Sized,
{
    env: &'a E,
    store: &'a S,
    identity: &'a I,
    channel: &'a C,
    starter: &'a R,
    policy: PresencePolicy,
}

impl<'a, E, S, I, C, R> PresenceCoordinator<'a, E, S, I, C, R>
where
    E: Environment,
    S: ProtocolStore,
    I: IdentityDirectory,
    C: ChannelGateway,
    R: ProtocolIntake + ?Sized,
{
    /// Create a coordinator.
    pub const fn new(
        env: &'a E,
        store: &'a S,
        identity: &'a I,
        channel: &'a C,
        starter: &'a R,
        policy: PresencePolicy,
    ) -> Self {
        Self { env, store, identity, channel, starter, policy }
    }

    /// Run one sweep over one device scope.
    ///
    /// # Errors
    ///
    /// Only setup queries (owned identities, running creation keys) abort
    /// the sweep; per-device failures are counted and skipped.
    pub fn sweep(&self, scope: DeviceScope) -> Result<PresenceSummary, PresenceError> {
        let now_ms = self.env.now_ms();
        let running: HashSet<ChannelTarget> =
            self.store.running_creation_targets()?.into_iter().collect();

        let mut summary = PresenceSummary::default();

        for owned in self.identity.owned_identities()? {
            let devices = match self.identity.remote_devices(owned, scope) {
                Ok(devices) => devices,
                Err(err) => {
                    tracing::warn!(owned = %owned, error = %err, "could not enumerate devices");
                    summary.failures += 1;
                    continue;
                },
            };

            let covered: HashSet<_> = match self.channel.covered_devices(owned) {
                Ok(covered) => covered.into_iter().collect(),
                Err(err) => {
                    tracing::warn!(owned = %owned, error = %err, "could not enumerate channels");
                    summary.failures += 1;
                    continue;
                },
            };

            for candidate in devices {
                if covered.contains(&(candidate.remote_identity, candidate.device)) {
                    continue;
                }

                summary.candidates += 1;

                let target = ChannelTarget {
                    owned_identity: owned,
                    remote_identity: candidate.remote_identity,
                    remote_device: candidate.device,
                };

                if running.contains(&target) {
                    tracing::debug!(
                        owned = %owned,
                        remote = %candidate.remote_identity,
                        device = %candidate.device,
                        "creation already running, skipping candidate"
                    );
                    summary.skipped_running += 1;
                    continue;
                }

                let stale = candidate.last_seen_ms.is_some_and(|seen| {
                    now_ms.saturating_sub(seen) > self.policy.stale_after.as_millis() as u64
                });

                let healed = if stale {
                    self.delete_then_discover(owned, &candidate)
                } else {
                    self.start_creation(owned, scope, target)
                };

                match healed {
                    Ok(Started::Creation) => summary.creations_started += 1,
                    Ok(Started::Discovery) => summary.discoveries_started += 1,
                    Ok(Started::Skipped) => {},
                    Err(err) => {
                        tracing::warn!(
                            owned = %owned,
                            remote = %candidate.remote_identity,
                            device = %candidate.device,
                            error = %err,
                            "could not heal candidate, skipping"
                        );
                        summary.failures += 1;
                    },
                }
            }
        }

        tracing::info!(
            candidates = summary.candidates,
            creations = summary.creations_started,
            discoveries = summary.discoveries_started,
            skipped = summary.skipped_running,
            failures = summary.failures,
            "presence sweep done"
        );

        Ok(summary)
    }

    /// Ping mode: start the matching channel-creation protocol. Nothing is
    /// deleted; gated on the owned identity being active.
    fn start_creation(
        &self,
        owned: CryptoIdentity,
        scope: DeviceScope,
        target: ChannelTarget,
    ) -> Result<Started, SweepFailure> {
        if self.policy.require_active_identity && !self.identity.is_active(owned)? {
            tracing::debug!(owned = %owned, "identity inactive, not starting channel creation");
            return Ok(Started::Skipped);
        }

        let kind = match scope {
            DeviceScope::ContactDevices => ProtocolKind::ChannelCreationContactDevice,
            DeviceScope::OwnedDevices => ProtocolKind::ChannelCreationOwnedDevice,
        };
        let instance_uid = self.env.random_instance_uid();
        let payload = payloads::channel_creation::Message::Initiate(
            payloads::channel_creation::Initiate {
                remote_identity: target.remote_identity,
                remote_device: target.remote_device,
            },
        )
        .into_payload(kind, instance_uid)?;

        self.starter.start_protocol(owned, payload)?;
        tracing::info!(
            owned = %owned,
            remote = %target.remote_identity,
            device = %target.remote_device,
            "started channel creation for uncovered device"
        );
        Ok(Started::Creation)
    }

    /// Stale mode: the device record itself is suspect. Delete it and ask
    /// the server for the identity's real device list.
    fn delete_then_discover(
        &self,
        owned: CryptoIdentity,
        candidate: &RemoteDevice,
    ) -> Result<Started, SweepFailure> {
        self.identity.delete_device(owned, candidate.remote_identity, candidate.device)?;

        let instance_uid = self.env.random_instance_uid();
        let payload = payloads::device_discovery::Message::Initiate(
            payloads::device_discovery::Initiate { remote_identity: candidate.remote_identity },
        )
        .into_payload(instance_uid)?;

        self.starter.start_protocol(owned, payload)?;
        tracing::info!(
            owned = %owned,
            remote = %candidate.remote_identity,
            device = %candidate.device,
            "deleted stale device and started discovery"
        );
        Ok(Started::Discovery)
    }
}

enum Started {
    Creation,
    Discovery,
    Skipped,
}

/// Per-candidate failure; never aborts the sweep.
#[derive(Error, Debug)]
enum SweepFailure {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Runner(#[from] crate::runner::RunnerError),
    #[error("codec error: {0}")]
    Codec(#[from] sotto_proto::CodecError),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sotto_proto::{ChannelTarget, Recipient};

    use super::*;
    use crate::{
        events::event_channel,
        runner::{ProtocolRunner, RunnerConfig},
        store::MemoryStore,
        testutil::{FixedEnv, MockChannel, MockDirectory, device, identity},
    };

    const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

    struct Fixture {
        env: FixedEnv,
        store: MemoryStore,
        directory: MockDirectory,
        channel: MockChannel,
        runner: Arc<ProtocolRunner<FixedEnv, MemoryStore, MockDirectory, MockChannel>>,
    }

    fn fixture() -> Fixture {
        let env = FixedEnv::at(100 * DAY_MS);
        let store = MemoryStore::new();
        let directory = MockDirectory::new();
        let channel = MockChannel::new();
        let (sink, _events) = event_channel(256);
        let runner = Arc::new(ProtocolRunner::new(
            env.clone(),
            store.clone(),
            Arc::new(directory.clone()),
            Arc::new(channel.clone()),
            sink,
            RunnerConfig::default(),
        ));
        Fixture { env, store, directory, channel, runner }
    }

    impl Fixture {
        fn coordinator(
            &self,
        ) -> PresenceCoordinator<
            '_,
            FixedEnv,
            MemoryStore,
            MockDirectory,
            MockChannel,
            ProtocolRunner<FixedEnv, MemoryStore, MockDirectory, MockChannel>,
        > {
            PresenceCoordinator::new(
                &self.env,
                &self.store,
                &self.directory,
                &self.channel,
                self.runner.as_ref(),
                PresencePolicy::default(),
            )
        }
    }

    #[tokio::test]
    async fn one_creation_per_uncovered_device_and_idempotent_resweep() {
        let f = fixture();
        let alice = identity(1);
        let bob = identity(2);
        f.directory.add_owned(alice, device(10));
        f.directory.add_contact(alice, bob);
        let now = f.env.now_ms();
        f.directory.add_remote_device(alice, bob, device(20), Some(now));
        f.directory.add_remote_device(alice, bob, device(21), Some(now));

        // Device 20 is already covered by a channel.
        f.channel.add_channel(ChannelTarget {
            owned_identity: alice,
            remote_identity: bob,
            remote_device: device(20),
        });

        let summary = f.coordinator().sweep(DeviceScope::ContactDevices).unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.creations_started, 1);
        assert_eq!(summary.discoveries_started, 0);

        // Run the started protocol so its creation key is registered.
        f.runner.drain().await;
        assert_eq!(f.channel.posted().len(), 1, "exactly one ping for (alice, bob/21)");

        // A second sweep with no state change posts nothing new.
        let summary = f.coordinator().sweep(DeviceScope::ContactDevices).unwrap();
        assert_eq!(summary.creations_started, 0);
        assert_eq!(summary.skipped_running, 1);
        f.runner.drain().await;
        assert_eq!(f.channel.posted().len(), 1);
    }

    #[tokio::test]
    async fn stale_device_is_deleted_and_rediscovered() {
        let f = fixture();
        let alice = identity(1);
        let bob = identity(2);
        f.directory.add_owned(alice, device(10));
        f.directory.add_contact(alice, bob);
        let stale_seen = f.env.now_ms() - 40 * DAY_MS;
        f.directory.add_remote_device(alice, bob, device(22), Some(stale_seen));

        let summary = f.coordinator().sweep(DeviceScope::ContactDevices).unwrap();
        assert_eq!(summary.discoveries_started, 1);
        assert_eq!(summary.creations_started, 0);
        assert_eq!(f.directory.deleted_devices(), vec![(alice, bob, device(22))]);

        f.runner.drain().await;
        let posted = f.channel.posted();
        assert_eq!(posted.len(), 1);
        assert!(matches!(posted[0].to, Recipient::Server), "discovery queries the server");
    }

    #[tokio::test]
    async fn inactive_identities_are_not_pinged() {
        let f = fixture();
        let alice = identity(1);
        let bob = identity(2);
        f.directory.add_owned(alice, device(10));
        f.directory.add_contact(alice, bob);
        f.directory.add_remote_device(alice, bob, device(20), Some(f.env.now_ms()));
        f.directory.set_inactive(alice);

        let summary = f.coordinator().sweep(DeviceScope::ContactDevices).unwrap();
        assert_eq!(summary.creations_started, 0);

        // Without the gate the same candidate is pinged.
        let coordinator = PresenceCoordinator::new(
            &f.env,
            &f.store,
            &f.directory,
            &f.channel,
            f.runner.as_ref(),
            PresencePolicy { require_active_identity: false, ..PresencePolicy::default() },
        );
        let summary = coordinator.sweep(DeviceScope::ContactDevices).unwrap();
        assert_eq!(summary.creations_started, 1);
    }

    #[tokio::test]
    async fn per_device_failure_never_aborts_the_sweep() {
        let f = fixture();
        let alice = identity(1);
        let bob = identity(2);
        f.directory.add_owned(alice, device(10));
        f.directory.add_contact(alice, bob);
        let now = f.env.now_ms();
        // One stale device (its deletion will fail) and one fresh one.
        f.directory.add_remote_device(alice, bob, device(20), Some(now - 40 * DAY_MS));
        f.directory.add_remote_device(alice, bob, device(21), Some(now));
        f.directory.set_fail_delete_device(true);

        let summary = f.coordinator().sweep(DeviceScope::ContactDevices).unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.creations_started, 1, "the healthy candidate is still healed");
    }

    #[tokio::test]
    async fn owned_device_scope_starts_owned_device_creation() {
        let f = fixture();
        let alice = identity(1);
        f.directory.add_owned(alice, device(10));
        // Another device of alice herself.
        f.directory.add_remote_device(alice, alice, device(11), Some(f.env.now_ms()));

        let summary = f.coordinator().sweep(DeviceScope::OwnedDevices).unwrap();
        assert_eq!(summary.creations_started, 1);

        f.runner.drain().await;
        let posted = f.channel.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].payload.kind, ProtocolKind::ChannelCreationOwnedDevice);
    }
}
