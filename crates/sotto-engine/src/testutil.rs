//! Shared fakes for unit tests: deterministic environment and an in-memory
//! identity directory with a toy signature scheme (a "signature" is the
//! signer's identity bytes followed by the challenge).

// Shared by every suite; not every suite uses every helper.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use sotto_proto::{
    ChannelTarget, CryptoIdentity, DeviceUid, DialogMessage, OutboundMessage, Uid,
};

use crate::{
    collaborators::{
        ChannelGateway, CollaboratorError, DeviceScope, IdentityDirectory, RemoteDevice,
    },
    env::Environment,
};

/// Identity with all bytes set to `n`.
pub fn identity(n: u8) -> CryptoIdentity {
    CryptoIdentity::from_bytes([n; 32])
}

/// Device uid with all bytes set to `n`.
pub fn device(n: u8) -> DeviceUid {
    DeviceUid::from_bytes([n; 32])
}

/// Generic uid with all bytes set to `n`.
pub fn uid(n: u8) -> Uid {
    Uid::from_bytes([n; 32])
}

/// Deterministic environment: settable clock, counter-based randomness,
/// instant sleeps.
#[derive(Clone)]
pub struct FixedEnv {
    now_ms: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
}

impl FixedEnv {
    pub fn at(now_ms: u64) -> Self {
        Self { now_ms: Arc::new(AtomicU64::new(now_ms)), counter: Arc::new(AtomicU64::new(1)) }
    }

    pub fn advance(&self, by_ms: u64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Environment for FixedEnv {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = (n as u8).wrapping_add(i as u8).wrapping_mul(31);
        }
    }
}

/// The toy signature the mock directory produces for `signer`.
pub fn mock_signature(signer: CryptoIdentity, challenge: &[u8]) -> Bytes {
    let mut sig = Vec::with_capacity(32 + challenge.len());
    sig.extend_from_slice(signer.as_bytes());
    sig.extend_from_slice(challenge);
    Bytes::from(sig)
}

#[derive(Default)]
struct DirectoryState {
    owned: Vec<CryptoIdentity>,
    inactive: HashSet<CryptoIdentity>,
    current_devices: HashMap<CryptoIdentity, DeviceUid>,
    contacts: HashMap<CryptoIdentity, HashSet<CryptoIdentity>>,
    remote_devices: HashMap<(CryptoIdentity, CryptoIdentity), Vec<RemoteDevice>>,
    deleted_devices: Vec<(CryptoIdentity, CryptoIdentity, DeviceUid)>,
    added_devices: Vec<(CryptoIdentity, CryptoIdentity, DeviceUid)>,
    imported_snapshots: Vec<(CryptoIdentity, Vec<u8>)>,
    fail_delete_device: bool,
}

/// In-memory [`IdentityDirectory`] with recording mutators.
#[derive(Clone, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_owned(&self, owned: CryptoIdentity, current_device: DeviceUid) {
        let mut state = self.state.lock().unwrap();
        if !state.owned.contains(&owned) {
            state.owned.push(owned);
        }
        state.current_devices.insert(owned, current_device);
    }

    pub fn set_inactive(&self, owned: CryptoIdentity) {
        self.state.lock().unwrap().inactive.insert(owned);
    }

    pub fn add_contact(&self, owned: CryptoIdentity, remote: CryptoIdentity) {
        self.state.lock().unwrap().contacts.entry(owned).or_default().insert(remote);
    }

    pub fn add_remote_device(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
        dev: DeviceUid,
        last_seen_ms: Option<u64>,
    ) {
        self.state
            .lock()
            .unwrap()
            .remote_devices
            .entry((owned, remote))
            .or_default()
            .push(RemoteDevice { remote_identity: remote, device: dev, last_seen_ms });
    }

    pub fn deleted_devices(&self) -> Vec<(CryptoIdentity, CryptoIdentity, DeviceUid)> {
        self.state.lock().unwrap().deleted_devices.clone()
    }

    pub fn added_devices(&self) -> Vec<(CryptoIdentity, CryptoIdentity, DeviceUid)> {
        self.state.lock().unwrap().added_devices.clone()
    }

    pub fn imported_snapshots(&self) -> Vec<(CryptoIdentity, Vec<u8>)> {
        self.state.lock().unwrap().imported_snapshots.clone()
    }

    pub fn set_fail_delete_device(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete_device = fail;
    }
}

impl IdentityDirectory for MockDirectory {
    fn owned_identities(&self) -> Result<Vec<CryptoIdentity>, CollaboratorError> {
        Ok(self.state.lock().unwrap().owned.clone())
    }

    fn is_active(&self, owned: CryptoIdentity) -> Result<bool, CollaboratorError> {
        let state = self.state.lock().unwrap();
        if !state.owned.contains(&owned) {
            return Err(CollaboratorError::UnknownIdentity);
        }
        Ok(!state.inactive.contains(&owned))
    }

    fn current_device(&self, owned: CryptoIdentity) -> Result<DeviceUid, CollaboratorError> {
        self.state
            .lock()
            .unwrap()
            .current_devices
            .get(&owned)
            .copied()
            .ok_or(CollaboratorError::UnknownIdentity)
    }

    fn remote_devices(
        &self,
        owned: CryptoIdentity,
        scope: DeviceScope,
    ) -> Result<Vec<RemoteDevice>, CollaboratorError> {
        let state = self.state.lock().unwrap();
        let mut devices = Vec::new();
        for ((o, remote), rows) in &state.remote_devices {
            if *o != owned {
                continue;
            }
            let in_scope = match scope {
                DeviceScope::ContactDevices => *remote != owned,
                DeviceScope::OwnedDevices => *remote == owned,
            };
            if in_scope {
                devices.extend(rows.iter().copied());
            }
        }
        devices.sort_by_key(|d| (d.remote_identity, d.device));
        Ok(devices)
    }

    fn devices_of(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, CollaboratorError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .remote_devices
            .get(&(owned, remote))
            .map(|rows| rows.iter().map(|r| r.device).collect())
            .unwrap_or_default())
    }

    fn is_contact(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
    ) -> Result<bool, CollaboratorError> {
        let state = self.state.lock().unwrap();
        Ok(state.contacts.get(&owned).is_some_and(|set| set.contains(&remote)))
    }

    fn add_device(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
        dev: DeviceUid,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock().unwrap();
        state.added_devices.push((owned, remote, dev));
        state
            .remote_devices
            .entry((owned, remote))
            .or_default()
            .push(RemoteDevice { remote_identity: remote, device: dev, last_seen_ms: None });
        Ok(())
    }

    fn delete_device(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
        dev: DeviceUid,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete_device {
            return Err(CollaboratorError::Unavailable("injected delete failure".to_string()));
        }
        state.deleted_devices.push((owned, remote, dev));
        if let Some(rows) = state.remote_devices.get_mut(&(owned, remote)) {
            rows.retain(|r| r.device != dev);
        }
        Ok(())
    }

    fn sign_challenge(
        &self,
        owned: CryptoIdentity,
        challenge: &[u8],
    ) -> Result<Bytes, CollaboratorError> {
        Ok(mock_signature(owned, challenge))
    }

    fn verify_challenge(
        &self,
        remote: CryptoIdentity,
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<bool, CollaboratorError> {
        Ok(signature == mock_signature(remote, challenge).as_ref())
    }

    fn import_snapshot(
        &self,
        owned: CryptoIdentity,
        snapshot: &[u8],
    ) -> Result<(), CollaboratorError> {
        self.state.lock().unwrap().imported_snapshots.push((owned, snapshot.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    channels: HashMap<ChannelTarget, Vec<u8>>,
    posted: Vec<OutboundMessage>,
    dialogs: Vec<DialogMessage>,
    fail_message_posts: bool,
    fail_dialog_posts: bool,
}

/// In-memory [`ChannelGateway`] recording every post.
#[derive(Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a channel already exists for `target`.
    pub fn add_channel(&self, target: ChannelTarget) {
        self.state.lock().unwrap().channels.insert(target, Vec::new());
    }

    pub fn set_fail_message_posts(&self, fail: bool) {
        self.state.lock().unwrap().fail_message_posts = fail;
    }

    pub fn set_fail_dialog_posts(&self, fail: bool) {
        self.state.lock().unwrap().fail_dialog_posts = fail;
    }

    pub fn posted(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().posted.clone()
    }

    pub fn dialogs(&self) -> Vec<DialogMessage> {
        self.state.lock().unwrap().dialogs.clone()
    }

    pub fn channel_seed(&self, target: ChannelTarget) -> Option<Vec<u8>> {
        self.state.lock().unwrap().channels.get(&target).cloned()
    }
}

impl ChannelGateway for MockChannel {
    fn channel_exists(&self, target: ChannelTarget) -> Result<bool, CollaboratorError> {
        Ok(self.state.lock().unwrap().channels.contains_key(&target))
    }

    fn covered_devices(
        &self,
        owned: CryptoIdentity,
    ) -> Result<Vec<(CryptoIdentity, DeviceUid)>, CollaboratorError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .keys()
            .filter(|t| t.owned_identity == owned)
            .map(|t| (t.remote_identity, t.remote_device))
            .collect())
    }

    fn establish_channel(
        &self,
        target: ChannelTarget,
        seed: &[u8],
    ) -> Result<(), CollaboratorError> {
        self.state.lock().unwrap().channels.insert(target, seed.to_vec());
        Ok(())
    }

    fn delete_channel(&self, target: ChannelTarget) -> Result<(), CollaboratorError> {
        self.state.lock().unwrap().channels.remove(&target);
        Ok(())
    }

    fn post_message(&self, message: &OutboundMessage) -> Result<Uid, CollaboratorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_message_posts {
            return Err(CollaboratorError::PostFailed("injected post failure".to_string()));
        }
        state.posted.push(message.clone());
        let n = state.posted.len() as u8;
        Ok(Uid::from_bytes([n; 32]))
    }

    fn post_dialog(&self, dialog: &DialogMessage) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_dialog_posts {
            return Err(CollaboratorError::PostFailed("injected dialog failure".to_string()));
        }
        state.dialogs.push(dialog.clone());
        Ok(())
    }
}
