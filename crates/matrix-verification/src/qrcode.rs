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

use std::sync::Arc;

use as_variant::as_variant;
use eyeball::{ObservableWriteGuard, SharedObservable};
use futures_core::Stream;
use futures_util::StreamExt;
use matrix_verification_qrcode::{qrcode::QrCode, EncodingError, QrMode, QrVerificationData};
use rand::{thread_rng, RngCore};
use ruma::{
    events::{
        key::verification::{
            cancel::CancelCode,
            done::{KeyVerificationDoneEventContent, ToDeviceKeyVerificationDoneEventContent},
            start::{
                self, KeyVerificationStartEventContent, ReciprocateV1Content, StartMethod,
                ToDeviceKeyVerificationStartEventContent,
            },
        },
        relation::Reference,
        AnyMessageLikeEventContent, AnyToDeviceEventContent,
    },
    serde::Base64,
    DeviceId, OwnedDeviceId, OwnedUserId, RoomId, TransactionId, UserId,
};
use thiserror::Error;
use tracing::trace;
use vodozemac::Ed25519PublicKey;

use crate::{
    channel::FlowId,
    event_enums::{CancelContent, DoneContent, OutgoingContent, OwnedStartContent, StartContent},
    outgoing::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest},
    requests::RequestHandle,
    store::{DeviceData, IdentitiesBeingVerified, UserIdentityData, VerificationStore},
    CancelInfo, Cancelled,
};

const SECRET_SIZE: usize = 16;

/// The ways validating a scanned QR code can fail.
#[derive(Debug, Error)]
pub enum ScanError {
    /// A key embedded in the QR code did not match the key we know for the
    /// party it is supposed to belong to.
    #[error("The keys that are being verified didn't match (expected {expected}, found {found})")]
    KeyMismatch {
        /// The ed25519 key we know for the party.
        expected: String,
        /// The ed25519 key the QR code carried.
        found: String,
    },
    /// A participating user has no cross signing identity, so there is
    /// nothing the QR flow could verify for them.
    #[error("The user {0} is missing a valid cross signing identity")]
    MissingCrossSigningIdentity(OwnedUserId),
    /// No keys are known for the device participating in the verification.
    #[error("The user's {0} device {1} is not E2E capable")]
    MissingDeviceKeys(OwnedUserId, OwnedDeviceId),
    /// The QR code belongs to a different verification flow than the one it
    /// was scanned for.
    #[error("The unique verification flow id did not match (expected {expected}, found {found})")]
    FlowIdMismatch {
        /// The flow id of the verification the scan happened for.
        expected: String,
        /// The flow id embedded in the QR code.
        found: String,
    },
}

/// The state of a QR code verification, as presented to users of the crate.
#[derive(Debug, Clone)]
pub enum QrVerificationState {
    /// The shared secret was generated and the QR code can be displayed.
    ///
    /// Despite the name, no `m.key.verification.start` message was exchanged
    /// yet; it arrives once the other side scans the code.
    Started,
    /// The other side scanned our QR code and its reciprocation carried the
    /// right shared secret.
    Scanned,
    /// We confirmed the other side's scan and sent our
    /// `m.key.verification.done`.
    Confirmed,
    /// We scanned the other side's QR code and can send the reciprocation
    /// message built by [`QrVerification::reciprocate`].
    ///
    /// Despite the name, the `m.reciprocate.v1` message may not have been
    /// sent yet.
    Reciprocated,
    /// The flow concluded successfully.
    Done {
        /// The devices this flow verified.
        verified_devices: Vec<DeviceData>,
        /// The user identities this flow verified.
        verified_identities: Vec<UserIdentityData>,
    },
    /// The flow was cancelled, by either side.
    Cancelled(CancelInfo),
}

impl From<&InnerState> for QrVerificationState {
    fn from(value: &InnerState) -> Self {
        match value {
            InnerState::Created(_) => Self::Started,
            InnerState::Scanned(_) => Self::Scanned,
            InnerState::Confirmed(_) => Self::Confirmed,
            InnerState::Reciprocated(_) => Self::Reciprocated,
            InnerState::Done(s) => Self::Done {
                verified_devices: s.state.verified_devices.to_vec(),
                verified_identities: s.state.verified_master_keys.to_vec(),
            },
            InnerState::Cancelled(s) => Self::Cancelled(s.state.clone().into()),
        }
    }
}

/// A verification flow where one side displays a QR code and the other scans
/// it.
#[derive(Clone)]
pub struct QrVerification {
    flow_id: FlowId,
    inner: Arc<QrVerificationData>,
    state: SharedObservable<InnerState>,
    identities: IdentitiesBeingVerified,
    request_handle: Option<RequestHandle>,
    we_started: bool,
}

impl std::fmt::Debug for QrVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrVerification")
            .field("flow_id", &self.flow_id)
            .field("inner", &self.inner)
            .field("state", &self.state)
            .finish()
    }
}

impl QrVerification {
    /// Did the other side scan our QR code.
    ///
    /// While this is true the flow waits for our user to confirm that the
    /// scan happened, via [`confirm_scanning()`](Self::confirm_scanning).
    pub fn has_been_scanned(&self) -> bool {
        matches!(*self.state.read(), InnerState::Scanned(_))
    }

    /// Did we confirm the other side's scan of our QR code.
    pub fn has_been_confirmed(&self) -> bool {
        matches!(*self.state.read(), InnerState::Confirmed(_))
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        self.identities.user_id()
    }

    /// The user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        self.identities.other_user_id()
    }

    /// The device id of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        self.identities.other_device_id()
    }

    /// Did we initiate the verification request.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Why and by whom was the flow cancelled, if it was.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant!(&*self.state.read(), InnerState::Cancelled(c) => {
            c.state.clone().into()
        })
    }

    /// Did the flow finish successfully.
    pub fn is_done(&self) -> bool {
        matches!(*self.state.read(), InnerState::Done(_))
    }

    /// Was the flow cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.read(), InnerState::Cancelled(_))
    }

    /// Is the flow verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.identities.is_self_verification()
    }

    /// Did we scan the other side's QR code.
    pub fn reciprocated(&self) -> bool {
        matches!(*self.state.read(), InnerState::Reciprocated(_))
    }

    /// The unique id of this QR code verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// The room the verification happens in, for in-room flows.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self.flow_id() {
            FlowId::ToDevice(_) => None,
            FlowId::InRoom(r, _) => Some(r),
        }
    }

    /// Render this verification flow as a `QrCode` object.
    ///
    /// The object can be turned into an image or into a unicode string. For
    /// the raw payload bytes use [`to_bytes()`](Self::to_bytes) instead.
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        self.inner.to_qr_code()
    }

    /// Encode this verification flow into the raw bytes of its QR payload.
    ///
    /// For an already rendered code use [`to_qr_code()`](Self::to_qr_code)
    /// instead.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        self.inner.to_bytes()
    }

    /// Cancel the flow on behalf of the user, with `m.user`.
    pub fn cancel(&self) -> Option<OutgoingVerificationRequest> {
        self.cancel_with_code(CancelCode::User)
    }

    /// Cancel the flow with the given `CancelCode`.
    ///
    /// Prefer [`cancel()`](Self::cancel): the state machine picks the right
    /// code for protocol failures on its own, user initiated cancellations
    /// should use `CancelCode::User`.
    ///
    /// Returns the cancellation request that needs to be sent out, or `None`
    /// if the flow was already cancelled.
    pub fn cancel_with_code(&self, code: CancelCode) -> Option<OutgoingVerificationRequest> {
        let mut state = self.state.write();

        if let Some(request) = &self.request_handle {
            request.cancel_with_code(&code);
        }

        if matches!(&*state, InnerState::Cancelled(_)) {
            return None;
        }

        let cancelled = QrState::<Cancelled>::new(true, code);
        let content = cancelled.as_content(self.flow_id());
        ObservableWriteGuard::set(&mut state, InnerState::Cancelled(cancelled));

        Some(self.content_to_request(content))
    }

    /// Tell the other side that we scanned their QR code.
    ///
    /// Builds the `m.reciprocate.v1` start request carrying the shared
    /// secret, or `None` if we aren't the scanning side.
    pub fn reciprocate(&self) -> Option<OutgoingVerificationRequest> {
        as_variant!(&*self.state.read(), InnerState::Reciprocated(s) => {
            self.content_to_request(s.as_content(self.flow_id()))
        })
    }

    /// Confirm that the other side has scanned our QR code.
    ///
    /// Builds the `m.key.verification.done` request, or `None` if no scan
    /// has been received.
    pub fn confirm_scanning(&self) -> Option<OutgoingVerificationRequest> {
        let mut state = self.state.write();

        let InnerState::Scanned(s) = &*state else {
            return None;
        };

        let confirmed = s.clone().confirm_scanning();
        let content = confirmed.as_content(&self.flow_id);
        ObservableWriteGuard::set(&mut state, InnerState::Confirmed(confirmed));

        Some(self.content_to_request(content))
    }

    fn content_to_request(&self, content: OutgoingContent) -> OutgoingVerificationRequest {
        match content {
            OutgoingContent::Room(room_id, content) => {
                RoomMessageRequest { room_id, txn_id: TransactionId::new(), content }.into()
            }
            OutgoingContent::ToDevice(c) => ToDeviceRequest::with_id(
                self.identities.other_user_id(),
                self.identities.other_device_id().to_owned(),
                &c,
                TransactionId::new(),
            )
            .into(),
        }
    }

    /// Which of the two sides gets verified once the flow completes depends
    /// on the QR mode and on whether we were the one scanning.
    fn verified_parties(&self) -> (Option<&DeviceData>, Option<&UserIdentityData>) {
        let we_scanned = matches!(*self.state.read(), InnerState::Reciprocated(_));
        let device = &self.identities.device_being_verified;
        let identity = self.identities.identity_being_verified.as_ref();

        match (self.inner.mode(), we_scanned) {
            (QrMode::CrossUser, _) => (None, identity),
            (QrMode::SelfTrusted, false) | (QrMode::SelfUntrusted, true) => (Some(device), None),
            (QrMode::SelfTrusted, true) | (QrMode::SelfUntrusted, false) => (None, identity),
        }
    }

    pub(crate) fn receive_done(
        &self,
        content: &DoneContent<'_>,
    ) -> Option<OutgoingVerificationRequest> {
        match self.state.get() {
            InnerState::Confirmed(s) => {
                let (verified_device, verified_identity) = self.verified_parties();

                self.state.set(InnerState::Done(s.into_done(
                    content,
                    verified_device,
                    verified_identity,
                )));

                None
            }
            InnerState::Reciprocated(s) => {
                let (verified_device, verified_identity) = self.verified_parties();

                let done = s.into_done(content, verified_device, verified_identity);
                let content = done.as_content(self.flow_id());
                self.state.set(InnerState::Done(done));

                Some(self.content_to_request(content))
            }
            InnerState::Created(_)
            | InnerState::Scanned(_)
            | InnerState::Done(_)
            | InnerState::Cancelled(_) => None,
        }
    }

    pub(crate) fn receive_reciprocation(
        &self,
        content: &StartContent<'_>,
    ) -> Option<OutgoingVerificationRequest> {
        let mut state = self.state.write();

        let InnerState::Created(s) = &*state else {
            return None;
        };

        match s.clone().receive_reciprocate(content) {
            Ok(s) => {
                ObservableWriteGuard::set(&mut state, InnerState::Scanned(s));
                None
            }
            Err(s) => {
                let content = s.as_content(self.flow_id());
                ObservableWriteGuard::set(&mut state, InnerState::Cancelled(s));
                Some(self.content_to_request(content))
            }
        }
    }

    pub(crate) fn receive_cancel(&self, sender: &UserId, content: &CancelContent<'_>) {
        if sender != self.other_user_id() {
            return;
        }

        let mut state = self.state.write();

        let cancelled = match &*state {
            InnerState::Created(s) => s.clone().into_cancelled(content),
            InnerState::Scanned(s) => s.clone().into_cancelled(content),
            InnerState::Confirmed(s) => s.clone().into_cancelled(content),
            InnerState::Reciprocated(s) => s.clone().into_cancelled(content),
            InnerState::Done(_) | InnerState::Cancelled(_) => return,
        };

        trace!(
            ?sender,
            code = content.cancel_code().as_str(),
            "Cancelling a QR verification, other user has cancelled"
        );

        ObservableWriteGuard::set(&mut state, InnerState::Cancelled(cancelled));
    }

    fn generate_secret() -> Base64 {
        let mut shared_secret = vec![0u8; SECRET_SIZE];
        thread_rng().fill_bytes(&mut shared_secret);

        Base64::new(shared_secret)
    }

    pub(crate) fn new_self(
        flow_id: FlowId,
        own_master_key: Ed25519PublicKey,
        other_device_key: Ed25519PublicKey,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        let inner = QrVerificationData::self_trusted(
            flow_id.as_str().to_owned(),
            own_master_key,
            other_device_key,
            Self::generate_secret(),
        );

        Self::new_helper(flow_id, inner, identities, we_started, request_handle)
    }

    pub(crate) fn new_self_no_master(
        store: VerificationStore,
        flow_id: FlowId,
        own_master_key: Ed25519PublicKey,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> QrVerification {
        let inner = QrVerificationData::self_untrusted(
            flow_id.as_str().to_owned(),
            store.account.ed25519_key,
            own_master_key,
            Self::generate_secret(),
        );

        Self::new_helper(flow_id, inner, identities, we_started, request_handle)
    }

    pub(crate) fn new_cross(
        flow_id: FlowId,
        own_master_key: Ed25519PublicKey,
        other_master_key: Ed25519PublicKey,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        let inner = QrVerificationData::cross_user(
            flow_id.as_str().to_owned(),
            own_master_key,
            other_master_key,
            Self::generate_secret(),
        );

        Self::new_helper(flow_id, inner, identities, we_started, request_handle)
    }

    pub(crate) fn from_scan(
        store: VerificationStore,
        other_user_id: OwnedUserId,
        other_device_id: OwnedDeviceId,
        flow_id: FlowId,
        qr_code: QrVerificationData,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Result<Self, ScanError> {
        if flow_id.as_str() != qr_code.flow_id() {
            return Err(ScanError::FlowIdMismatch {
                expected: flow_id.as_str().to_owned(),
                found: qr_code.flow_id().to_owned(),
            });
        }

        let other_device = store.get_device(&other_user_id, &other_device_id).ok_or_else(|| {
            ScanError::MissingDeviceKeys(other_user_id.clone(), other_device_id.clone())
        })?;

        let identities = store.get_identities(other_device);

        let own_identity = identities
            .own_identity
            .as_ref()
            .ok_or_else(|| ScanError::MissingCrossSigningIdentity(store.account.user_id.clone()))?;

        let other_identity = identities
            .identity_being_verified
            .as_ref()
            .ok_or_else(|| ScanError::MissingCrossSigningIdentity(other_user_id.clone()))?;

        let check_key = |key: Ed25519PublicKey, expected: Ed25519PublicKey| {
            if key != expected {
                Err(ScanError::KeyMismatch {
                    expected: expected.to_base64(),
                    found: key.to_base64(),
                })
            } else {
                Ok(())
            }
        };

        match qr_code.mode() {
            QrMode::CrossUser => {
                check_key(qr_code.first_key(), other_identity.master_key())?;
                check_key(qr_code.second_key(), own_identity.master_key())?;
            }
            QrMode::SelfTrusted => {
                check_key(qr_code.first_key(), other_identity.master_key())?;
                check_key(qr_code.second_key(), store.account.ed25519_key)?;
            }
            QrMode::SelfUntrusted => {
                let device_key =
                    identities.device_being_verified.ed25519_key().ok_or_else(|| {
                        ScanError::MissingDeviceKeys(other_user_id.clone(), other_device_id.clone())
                    })?;

                check_key(qr_code.first_key(), device_key)?;
                check_key(qr_code.second_key(), other_identity.master_key())?;
            }
        }

        let secret = qr_code.secret().to_owned();
        let own_device_id = store.account.device_id.clone();

        Ok(Self {
            flow_id,
            inner: qr_code.into(),
            state: SharedObservable::new(InnerState::Reciprocated(QrState {
                state: Reciprocated { secret, own_device_id },
            })),
            identities,
            we_started,
            request_handle,
        })
    }

    fn new_helper(
        flow_id: FlowId,
        inner: QrVerificationData,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        let secret = inner.secret().to_owned();

        Self {
            flow_id,
            inner: inner.into(),
            state: SharedObservable::new(InnerState::Created(QrState {
                state: Created { secret },
            })),
            identities,
            we_started,
            request_handle,
        }
    }

    /// Listen for changes in the QrCode verification process.
    ///
    /// The changes are presented as a stream of [`QrVerificationState`]
    /// values.
    pub fn changes(&self) -> impl Stream<Item = QrVerificationState> {
        self.state.subscribe().map(|s| (&s).into())
    }

    /// Get the current state of the verification process.
    pub fn state(&self) -> QrVerificationState {
        (&*self.state.read()).into()
    }
}

#[derive(Debug, Clone)]
enum InnerState {
    /// The QR code can be displayed, waiting for the other side to scan it.
    Created(QrState<Created>),

    /// The other side scanned our code and its `m.reciprocate.v1` start
    /// message carried the matching shared secret.
    Scanned(QrState<Scanned>),

    /// Our user confirmed the scan and our `m.key.verification.done` went
    /// out.
    Confirmed(QrState<Confirmed>),

    /// We scanned the other side's QR code and can reciprocate.
    Reciprocated(QrState<Reciprocated>),

    /// The other side's `m.key.verification.done` arrived, the flow is
    /// complete.
    Done(QrState<Done>),

    /// The flow was cancelled or failed.
    Cancelled(QrState<Cancelled>),
}

#[derive(Clone, Debug)]
struct QrState<S: Clone> {
    state: S,
}

impl<S: Clone> QrState<S> {
    pub fn into_cancelled(self, content: &CancelContent<'_>) -> QrState<Cancelled> {
        QrState { state: Cancelled::new(false, content.cancel_code().to_owned()) }
    }
}

#[derive(Clone, Debug)]
struct Created {
    secret: Base64,
}

#[derive(Clone, Debug)]
struct Scanned {}

#[derive(Clone, Debug)]
struct Confirmed {}

#[derive(Clone, Debug)]
struct Reciprocated {
    own_device_id: OwnedDeviceId,
    secret: Base64,
}

#[derive(Clone, Debug)]
struct Done {
    verified_devices: Arc<[DeviceData]>,
    verified_master_keys: Arc<[UserIdentityData]>,
}

fn done_content(flow_id: &FlowId) -> OutgoingContent {
    match flow_id {
        FlowId::ToDevice(t) => AnyToDeviceEventContent::KeyVerificationDone(
            ToDeviceKeyVerificationDoneEventContent::new(t.to_owned()),
        )
        .into(),
        FlowId::InRoom(r, e) => (
            r.to_owned(),
            AnyMessageLikeEventContent::KeyVerificationDone(KeyVerificationDoneEventContent::new(
                Reference::new(e.to_owned()),
            )),
        )
            .into(),
    }
}

fn done_state(
    verified_device: Option<&DeviceData>,
    verified_identity: Option<&UserIdentityData>,
) -> QrState<Done> {
    let devices: Vec<_> = verified_device.into_iter().cloned().collect();
    let identities: Vec<_> = verified_identity.into_iter().cloned().collect();

    QrState {
        state: Done { verified_devices: devices.into(), verified_master_keys: identities.into() },
    }
}

impl Reciprocated {
    fn as_content(&self, flow_id: &FlowId) -> OutgoingContent {
        let content = ReciprocateV1Content::new(self.secret.clone());
        let method = StartMethod::ReciprocateV1(content);

        let content: OwnedStartContent = match flow_id {
            FlowId::ToDevice(t) => ToDeviceKeyVerificationStartEventContent::new(
                self.own_device_id.clone(),
                t.clone(),
                method,
            )
            .into(),
            FlowId::InRoom(r, e) => (
                r.clone(),
                KeyVerificationStartEventContent::new(
                    self.own_device_id.clone(),
                    method,
                    Reference::new(e.clone()),
                ),
            )
                .into(),
        };

        content.into()
    }
}

impl QrState<Scanned> {
    fn confirm_scanning(self) -> QrState<Confirmed> {
        QrState { state: Confirmed {} }
    }
}

impl QrState<Cancelled> {
    fn new(cancelled_by_us: bool, cancel_code: CancelCode) -> Self {
        QrState { state: Cancelled::new(cancelled_by_us, cancel_code) }
    }

    fn as_content(&self, flow_id: &FlowId) -> OutgoingContent {
        self.state.as_content(flow_id)
    }
}

impl QrState<Created> {
    fn receive_reciprocate(
        self,
        content: &StartContent<'_>,
    ) -> Result<QrState<Scanned>, QrState<Cancelled>> {
        match content.method() {
            start::StartMethod::ReciprocateV1(m) => {
                if self.state.secret == m.secret {
                    Ok(QrState { state: Scanned {} })
                } else {
                    Err(QrState::<Cancelled>::new(false, CancelCode::KeyMismatch))
                }
            }
            _ => Err(QrState::<Cancelled>::new(false, CancelCode::UnknownMethod)),
        }
    }
}

impl QrState<Done> {
    fn as_content(&self, flow_id: &FlowId) -> OutgoingContent {
        done_content(flow_id)
    }
}

impl QrState<Confirmed> {
    fn into_done(
        self,
        _: &DoneContent<'_>,
        verified_device: Option<&DeviceData>,
        verified_identity: Option<&UserIdentityData>,
    ) -> QrState<Done> {
        done_state(verified_device, verified_identity)
    }

    fn as_content(&self, flow_id: &FlowId) -> OutgoingContent {
        done_content(flow_id)
    }
}

impl QrState<Reciprocated> {
    fn as_content(&self, flow_id: &FlowId) -> OutgoingContent {
        self.state.as_content(flow_id)
    }

    fn into_done(
        self,
        _: &DoneContent<'_>,
        verified_device: Option<&DeviceData>,
        verified_identity: Option<&UserIdentityData>,
    ) -> QrState<Done> {
        done_state(verified_device, verified_identity)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use matrix_verification_qrcode::QrVerificationData;
    use ruma::{device_id, event_id, room_id, user_id, DeviceId, OwnedDeviceId, UserId};
    use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519SecretKey};

    use super::{QrVerification, QrVerificationState};
    use crate::{
        channel::FlowId,
        event_enums::{DoneContent, OutgoingContent, StartContent},
        store::{DeviceData, OwnAccount, UserIdentityData, VerificationStore},
    };

    fn user_id() -> &'static UserId {
        user_id!("@example:localhost")
    }

    fn device_id() -> &'static DeviceId {
        device_id!("DEVICEID")
    }

    fn account_and_device(
        user_id: &UserId,
        device_id: &OwnedDeviceId,
    ) -> (OwnAccount, DeviceData) {
        let ed25519_key = Ed25519SecretKey::new().public_key();
        let curve25519_key = Curve25519PublicKey::from_slice(ed25519_key.as_bytes()).unwrap();

        let account = OwnAccount {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            ed25519_key,
        };
        let device =
            DeviceData::new(user_id.to_owned(), device_id.to_owned(), ed25519_key, curve25519_key);

        (account, device)
    }

    fn master_key() -> Ed25519PublicKey {
        Ed25519SecretKey::new().public_key()
    }

    #[test]
    fn verification_creation() {
        let (account, device) = account_and_device(user_id(), &device_id().to_owned());
        let device_key = account.ed25519_key;

        let store = VerificationStore::new(account);
        let master_key = master_key();

        store.add_device(device.clone());
        store.add_identity(UserIdentityData::new(user_id().to_owned(), master_key, false));

        let identities = store.get_identities(device);

        let flow_id = FlowId::ToDevice("test_transaction".into());

        let verification = QrVerification::new_self_no_master(
            store.clone(),
            flow_id.clone(),
            master_key,
            identities.clone(),
            false,
            None,
        );

        assert_matches!(verification.state(), QrVerificationState::Started);
        assert_eq!(verification.inner.first_key(), device_key);
        assert_eq!(verification.inner.second_key(), master_key);

        let verification = QrVerification::new_self(
            flow_id,
            master_key,
            device_key,
            identities.clone(),
            false,
            None,
        );

        assert_matches!(verification.state(), QrVerificationState::Started);
        assert_eq!(verification.inner.first_key(), master_key);
        assert_eq!(verification.inner.second_key(), device_key);

        let bob_master_key = self::master_key();

        let flow_id =
            FlowId::InRoom(room_id!("!test:example").to_owned(), event_id!("$EVENTID").to_owned());

        let verification =
            QrVerification::new_cross(flow_id, master_key, bob_master_key, identities, false, None);

        assert_matches!(verification.state(), QrVerificationState::Started);
        assert_eq!(verification.inner.first_key(), master_key);
        assert_eq!(verification.inner.second_key(), bob_master_key);
    }

    #[test]
    fn reciprocate_receival() {
        let test = |flow_id: FlowId| {
            let (alice_account, alice_device) =
                account_and_device(user_id(), &device_id().to_owned());
            let (bob_account, bob_device) =
                account_and_device(user_id(), &device_id!("BOBDEVICE").to_owned());

            let master_key = master_key();
            let identity = UserIdentityData::new(user_id().to_owned(), master_key, false);

            let alice_store = VerificationStore::new(alice_account.clone());
            alice_store.add_device(bob_device.clone());
            alice_store.add_identity(identity.clone());

            let bob_store = VerificationStore::new(bob_account);
            bob_store.add_device(alice_device.clone());
            bob_store.add_identity(identity);

            let identities = alice_store.get_identities(bob_device);

            let alice_verification = QrVerification::new_self_no_master(
                alice_store,
                flow_id.clone(),
                master_key,
                identities,
                false,
                None,
            );
            assert_matches!(alice_verification.state(), QrVerificationState::Started);

            let qr_code = alice_verification.to_bytes().unwrap();
            let qr_code = QrVerificationData::from_bytes(qr_code).unwrap();

            let bob_verification = QrVerification::from_scan(
                bob_store,
                alice_account.user_id.clone(),
                alice_account.device_id.clone(),
                flow_id,
                qr_code,
                false,
                None,
            )
            .unwrap();

            let request = bob_verification.reciprocate().unwrap();
            assert_matches!(bob_verification.state(), QrVerificationState::Reciprocated);

            let content = OutgoingContent::try_from(&request).unwrap();
            let content = StartContent::try_from(&content).unwrap();

            alice_verification.receive_reciprocation(&content);
            assert_matches!(alice_verification.state(), QrVerificationState::Scanned);

            let request = alice_verification.confirm_scanning().unwrap();
            assert_matches!(alice_verification.state(), QrVerificationState::Confirmed);

            let content = OutgoingContent::try_from(&request).unwrap();
            let content = DoneContent::try_from(&content).unwrap();

            assert!(!alice_verification.is_done());
            assert!(!bob_verification.is_done());

            let request = bob_verification.receive_done(&content).unwrap();
            let content = OutgoingContent::try_from(&request).unwrap();
            let content = DoneContent::try_from(&content).unwrap();
            alice_verification.receive_done(&content);

            assert_matches!(
                alice_verification.state(),
                QrVerificationState::Done { verified_identities, .. }
            );
            assert_eq!(verified_identities.len(), 1);
            assert!(alice_verification.is_done());

            assert_matches!(
                bob_verification.state(),
                QrVerificationState::Done { verified_devices, .. }
            );
            assert_eq!(verified_devices.len(), 1);
            assert!(bob_verification.is_done());
        };

        let flow_id = FlowId::ToDevice("test_transaction".into());
        test(flow_id);

        let flow_id =
            FlowId::InRoom(room_id!("!test:example").to_owned(), event_id!("$EVENTID").to_owned());
        test(flow_id);
    }
}
