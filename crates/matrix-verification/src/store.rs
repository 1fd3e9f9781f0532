// Copyright 2026 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The key source the verification flows read from.
//!
//! Verification needs to know which identity keys the participating devices
//! and users claim, both to check received MACs and to build QR codes. This
//! module provides that as a small in-memory collaborator. What to do with a
//! successfully verified device, persisting trust or uploading signatures, is
//! left to the caller.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId,
    UserId,
};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// The identity data of the account that is doing the verifying.
#[derive(Clone, Debug)]
pub struct OwnAccount {
    /// The user id of our own account.
    pub user_id: OwnedUserId,
    /// The id of the device we're running on.
    pub device_id: OwnedDeviceId,
    /// The Ed25519 identity key of our device.
    pub ed25519_key: Ed25519PublicKey,
}

/// The public identity keys of a device, ours or someone else's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    keys: BTreeMap<OwnedDeviceKeyId, String>,
}

impl DeviceData {
    /// Create the key data for a device out of its Ed25519 and Curve25519
    /// identity keys.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: Ed25519PublicKey,
        curve25519_key: Curve25519PublicKey,
    ) -> Self {
        let keys = BTreeMap::from([
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device_id),
                ed25519_key.to_base64(),
            ),
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &device_id),
                curve25519_key.to_base64(),
            ),
        ]);

        Self { user_id, device_id, keys }
    }

    /// The id of the user this device belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// All identity keys of the device, in their base64 form, keyed by the
    /// full key id.
    pub fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        &self.keys
    }

    /// The Ed25519 identity key of the device, if it has a valid one.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);
        let key = self.keys.get(&key_id)?;

        Ed25519PublicKey::from_base64(key).ok()
    }
}

/// The public cross-signing identity of a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentityData {
    user_id: OwnedUserId,
    master_key: Ed25519PublicKey,
    verified: bool,
}

impl UserIdentityData {
    /// Create identity data from a user's master cross-signing key.
    ///
    /// `verified` tells the verification flows whether we already trust this
    /// identity, which decides if the master key is included in our MACs and
    /// which QR code flavor we generate.
    pub fn new(user_id: OwnedUserId, master_key: Ed25519PublicKey, verified: bool) -> Self {
        Self { user_id, master_key, verified }
    }

    /// The id of the user this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The master cross-signing key of the user.
    pub fn master_key(&self) -> Ed25519PublicKey {
        self.master_key
    }

    /// Do we consider this identity to be trusted.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// The key id under which the master key appears in MAC events.
    pub(crate) fn master_key_id(&self) -> String {
        format!("{}:{}", DeviceKeyAlgorithm::Ed25519, self.master_key.to_base64())
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    devices: HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceData>>,
    identities: HashMap<OwnedUserId, UserIdentityData>,
}

/// The in-memory collection of device and identity keys the verification
/// flows read from.
#[derive(Clone)]
pub struct VerificationStore {
    /// Our own account's static identity data.
    pub account: OwnAccount,
    inner: Arc<StdRwLock<StoreInner>>,
}

impl fmt::Debug for VerificationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationStore").field("account", &self.account).finish_non_exhaustive()
    }
}

impl VerificationStore {
    /// Create a new store for the given account.
    pub fn new(account: OwnAccount) -> Self {
        Self { account, inner: Default::default() }
    }

    /// Add or replace the key data of a device.
    pub fn add_device(&self, device: DeviceData) {
        self.inner
            .write()
            .unwrap()
            .devices
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), device);
    }

    /// Add or replace the cross-signing identity of a user.
    pub fn add_identity(&self, identity: UserIdentityData) {
        self.inner
            .write()
            .unwrap()
            .identities
            .insert(identity.user_id.clone(), identity);
    }

    /// Fetch the key data of a device.
    pub fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceData> {
        self.inner
            .read()
            .unwrap()
            .devices
            .get(user_id)
            .and_then(|d| d.get(device_id))
            .cloned()
    }

    /// Fetch the cross-signing identity of a user.
    pub fn get_identity(&self, user_id: &UserId) -> Option<UserIdentityData> {
        self.inner.read().unwrap().identities.get(user_id).cloned()
    }

    /// The device ids of all known devices of a user, excluding our own
    /// device when looking at our own user.
    pub fn get_user_devices(&self, user_id: &UserId) -> Vec<OwnedDeviceId> {
        self.inner
            .read()
            .unwrap()
            .devices
            .get(user_id)
            .map(|devices| {
                devices
                    .keys()
                    .filter(|&d| {
                        user_id != self.account.user_id || *d != self.account.device_id
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Collect the identities taking part in a verification with the given
    /// device.
    pub(crate) fn get_identities(&self, other_device: DeviceData) -> IdentitiesBeingVerified {
        let own_identity = self.get_identity(&self.account.user_id);
        let other_identity = self.get_identity(other_device.user_id());

        IdentitiesBeingVerified {
            store: self.clone(),
            device_being_verified: other_device,
            own_identity,
            identity_being_verified: other_identity,
        }
    }
}

/// The identities that take part in one verification flow.
#[derive(Clone, Debug)]
pub(crate) struct IdentitiesBeingVerified {
    pub store: VerificationStore,
    pub device_being_verified: DeviceData,
    pub own_identity: Option<UserIdentityData>,
    pub identity_being_verified: Option<UserIdentityData>,
}

impl IdentitiesBeingVerified {
    pub fn user_id(&self) -> &UserId {
        &self.store.account.user_id
    }

    pub fn other_user_id(&self) -> &UserId {
        self.device_being_verified.user_id()
    }

    pub fn other_device_id(&self) -> &DeviceId {
        self.device_being_verified.device_id()
    }

    pub fn is_self_verification(&self) -> bool {
        self.user_id() == self.other_user_id()
    }
}
