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

mod helpers;
mod inner_sas;
mod sas_state;

use std::sync::Arc;

use eyeball::{ObservableWriteGuard, SharedObservable};
use futures_core::Stream;
use futures_util::StreamExt;
use inner_sas::InnerSas;
use ruma::{
    events::{
        key::verification::{cancel::CancelCode, start::SasV1Content, ShortAuthenticationString},
        AnyMessageLikeEventContent, AnyToDeviceEventContent,
    },
    DeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, RoomId, TransactionId, UserId,
};
pub use sas_state::AcceptedProtocols;
use tracing::{debug, error, trace};

use crate::{
    cache::RequestInfo,
    channel::FlowId,
    event_enums::{AnyVerificationContent, OutgoingContent, OwnedAcceptContent, StartContent},
    outgoing::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest},
    requests::RequestHandle,
    store::{DeviceData, IdentitiesBeingVerified, OwnAccount, UserIdentityData},
    CancelInfo, Emoji,
};

/// A verification flow that asks the users to compare a short auth string.
///
/// The heavy lifting happens in the [`InnerSas`] state machine behind the
/// observable, this handle adds locking and converts the contents the state
/// machine emits into sendable requests.
#[derive(Clone, Debug)]
pub struct Sas {
    inner: SharedObservable<InnerSas>,
    account: OwnAccount,
    identities_being_verified: IdentitiesBeingVerified,
    flow_id: Arc<FlowId>,
    we_started: bool,
    request_handle: Option<RequestHandle>,
}

/// The names of the internal states, for transition logging only.
#[derive(Debug, Clone, Copy)]
enum State {
    Created,
    Started,
    Accepted,
    WeAccepted,
    KeyReceived,
    KeySent,
    KeysExchanged,
    Confirmed,
    MacReceived,
    WaitingForDone,
    Done,
    Cancelled,
}

impl From<&InnerSas> for State {
    fn from(value: &InnerSas) -> Self {
        match value {
            InnerSas::Created(_) => Self::Created,
            InnerSas::Started(_) => Self::Started,
            InnerSas::Accepted(_) => Self::Accepted,
            InnerSas::WeAccepted(_) => Self::WeAccepted,
            InnerSas::KeyReceived(_) => Self::KeyReceived,
            InnerSas::KeySent(_) => Self::KeySent,
            InnerSas::KeysExchanged(_) => Self::KeysExchanged,
            InnerSas::Confirmed(_) => Self::Confirmed,
            InnerSas::MacReceived(_) => Self::MacReceived,
            InnerSas::WaitingForDone(_) => Self::WaitingForDone,
            InnerSas::Done(_) => Self::Done,
            InnerSas::Cancelled(_) => Self::Cancelled,
        }
    }
}

/// The emoji representation of the short auth string.
#[derive(Debug, Clone)]
pub struct EmojiShortAuthString {
    /// The seven indices into the emoji table, each between 0 and 63
    /// inclusive.
    ///
    /// Clients that ship a [translated] emoji table should present the
    /// entries these indices select.
    ///
    /// [translated]: https://github.com/matrix-org/matrix-doc/blob/master/data-definitions/
    pub indices: [u8; 7],

    /// The seven emojis with their English descriptions.
    pub emojis: [Emoji; 7],
}

/// The state the SAS verification is in, as presented to users of the crate.
#[derive(Debug, Clone)]
pub enum SasState {
    /// A start event was exchanged and its proposed protocols can be
    /// accepted.
    Started {
        /// The protocols the `m.key.verification.start` event proposed.
        protocols: SasV1Content,
    },
    /// Both sides settled on a protocol selection, the key exchange is in
    /// progress.
    Accepted {
        /// The protocols the `m.key.verification.accept` event selected.
        accepted_protocols: AcceptedProtocols,
    },
    /// Both public keys arrived, the short auth string can be shown.
    KeysExchanged {
        /// The emoji form of the short auth string, `None` if emoji wasn't
        /// among the accepted SAS methods.
        emojis: Option<EmojiShortAuthString>,
        /// The decimal form of the short auth string.
        decimals: (u16, u16, u16),
    },
    /// We confirmed that the strings match and are waiting for the other
    /// side to do the same.
    Confirmed,
    /// Both sides confirmed, the verification is complete.
    Done {
        /// The devices this flow verified.
        verified_devices: Vec<DeviceData>,
        /// The user identities this flow verified.
        verified_identities: Vec<UserIdentityData>,
    },
    /// The flow was cancelled, by either side.
    Cancelled(CancelInfo),
}

impl PartialEq for SasState {
    /// Compares the discriminants only, the payloads are ignored.
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Started { .. }, Self::Started { .. })
                | (Self::Accepted { .. }, Self::Accepted { .. })
                | (Self::KeysExchanged { .. }, Self::KeysExchanged { .. })
                | (Self::Confirmed, Self::Confirmed)
                | (Self::Done { .. }, Self::Done { .. })
                | (Self::Cancelled(_), Self::Cancelled(_))
        )
    }
}

impl From<&InnerSas> for SasState {
    fn from(value: &InnerSas) -> Self {
        let presentable = |emojis: [Emoji; 7], indices: [u8; 7], decimals: (u16, u16, u16)| {
            let emojis =
                value.supports_emoji().then_some(EmojiShortAuthString { emojis, indices });
            Self::KeysExchanged { emojis, decimals }
        };

        match value {
            InnerSas::Created(s) => {
                Self::Started { protocols: s.state.protocol_definitions.to_owned() }
            }
            InnerSas::Started(s) => {
                Self::Started { protocols: s.state.protocol_definitions.to_owned() }
            }
            InnerSas::Accepted(s) => Self::Accepted {
                accepted_protocols: s.state.accepted_protocols.as_ref().to_owned(),
            },
            InnerSas::WeAccepted(s) => Self::Accepted {
                accepted_protocols: s.state.accepted_protocols.as_ref().to_owned(),
            },
            InnerSas::KeySent(s) => Self::Accepted {
                accepted_protocols: s.state.accepted_protocols.as_ref().to_owned(),
            },
            InnerSas::KeyReceived(s) => Self::Accepted {
                accepted_protocols: s.state.accepted_protocols.as_ref().to_owned(),
            },
            InnerSas::KeysExchanged(s) => {
                presentable(s.get_emoji(), s.get_emoji_index(), s.get_decimal())
            }
            InnerSas::MacReceived(s) => {
                presentable(s.get_emoji(), s.get_emoji_index(), s.get_decimal())
            }
            InnerSas::Confirmed(_) | InnerSas::WaitingForDone(_) => Self::Confirmed,
            InnerSas::Done(s) => Self::Done {
                verified_devices: s.verified_devices().to_vec(),
                verified_identities: s.verified_identities().to_vec(),
            },
            InnerSas::Cancelled(c) => Self::Cancelled(c.state.as_ref().clone().into()),
        }
    }
}

impl Sas {
    fn new(
        inner: InnerSas,
        flow_id: FlowId,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        Self {
            inner: SharedObservable::new(inner),
            account: identities.store.account.clone(),
            identities_being_verified: identities,
            flow_id: flow_id.into(),
            we_started,
            request_handle,
        }
    }

    fn start_helper(
        flow_id: FlowId,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> (Sas, OutgoingContent) {
        let (inner, content) = InnerSas::start(
            identities.store.account.clone(),
            identities.device_being_verified.clone(),
            identities.own_identity.clone(),
            identities.identity_being_verified.clone(),
            flow_id.clone(),
            request_handle.is_some(),
        );

        (Self::new(inner, flow_id, identities, we_started, request_handle), content)
    }

    /// Begin a new SAS flow with the given device over to-device messages.
    ///
    /// Returns the `Sas` handle together with the start content that needs
    /// to be sent to the other device.
    pub(crate) fn start(
        identities: IdentitiesBeingVerified,
        transaction_id: OwnedTransactionId,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> (Sas, OutgoingContent) {
        Self::start_helper(
            FlowId::ToDevice(transaction_id),
            identities,
            we_started,
            request_handle,
        )
    }

    /// Begin a new SAS flow with the given device inside a room.
    ///
    /// Returns the `Sas` handle together with the start content that needs
    /// to be sent into the room.
    pub(crate) fn start_in_room(
        flow_id: OwnedEventId,
        room_id: OwnedRoomId,
        identities: IdentitiesBeingVerified,
        we_started: bool,
        request_handle: RequestHandle,
    ) -> (Sas, OutgoingContent) {
        Self::start_helper(
            FlowId::InRoom(room_id, flow_id),
            identities,
            we_started,
            Some(request_handle),
        )
    }

    /// Build a `Sas` for an `m.key.verification.start` event the other side
    /// sent.
    ///
    /// If the start event proposes protocols we can't work with, the error
    /// carries the cancellation that should be sent back.
    pub(crate) fn from_start_event(
        flow_id: FlowId,
        content: &StartContent<'_>,
        identities: IdentitiesBeingVerified,
        request_handle: Option<RequestHandle>,
        we_started: bool,
    ) -> Result<Sas, OutgoingContent> {
        let inner = InnerSas::from_start_event(
            identities.store.account.clone(),
            identities.device_being_verified.clone(),
            flow_id.clone(),
            content,
            identities.own_identity.clone(),
            identities.identity_being_verified.clone(),
            request_handle.is_some(),
        )?;

        Ok(Self::new(inner, flow_id, identities, we_started, request_handle))
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.account.user_id
    }

    /// Our own device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.account.device_id
    }

    /// The user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        self.identities_being_verified.other_user_id()
    }

    /// The device id of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        self.identities_being_verified.other_device_id()
    }

    /// The device of the other side.
    pub fn other_device(&self) -> &DeviceData {
        &self.identities_being_verified.device_being_verified
    }

    /// The unique id of this SAS flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// The room the verification happens in, for in-room flows.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id().room_id()
    }

    /// Was emoji among the SAS methods both sides accepted.
    pub fn supports_emoji(&self) -> bool {
        self.inner.read().supports_emoji()
    }

    /// Did this flow branch off of a verification request.
    pub fn started_from_request(&self) -> bool {
        self.inner.read().started_from_request()
    }

    /// Is the flow verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.identities_being_verified.is_self_verification()
    }

    /// Have we already confirmed that the short auth strings match.
    pub fn have_we_confirmed(&self) -> bool {
        self.inner.read().have_we_confirmed()
    }

    /// Did the start event get answered with an accept event yet.
    pub fn has_been_accepted(&self) -> bool {
        self.inner.read().has_been_accepted()
    }

    /// Why and by whom was the flow cancelled, if it was.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        if let InnerSas::Cancelled(c) = &*self.inner.read() {
            Some(c.state.as_ref().clone().into())
        } else {
            None
        }
    }

    /// Did we start this SAS flow.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Has the flow been sitting around longer than its timeout allows.
    pub fn timed_out(&self) -> bool {
        self.inner.read().timed_out()
    }

    /// Can the short auth string be shown to the user yet.
    pub fn can_be_presented(&self) -> bool {
        self.inner.read().can_be_presented()
    }

    /// Did the flow finish successfully.
    pub fn is_done(&self) -> bool {
        self.inner.read().is_done()
    }

    /// Was the flow cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.read().is_cancelled()
    }

    /// The emoji form of the short auth string, once it can be presented.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        self.inner.read().emoji()
    }

    /// The indices into the emoji table, once the short auth string can be
    /// presented.
    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        self.inner.read().emoji_index()
    }

    /// The decimal form of the short auth string, once it can be presented.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.inner.read().decimals()
    }

    /// The devices this flow verified, if it is done.
    pub fn verified_devices(&self) -> Option<Arc<[DeviceData]>> {
        self.inner.read().verified_devices()
    }

    /// The user identities this flow verified, if it is done.
    pub fn verified_identities(&self) -> Option<Arc<[UserIdentityData]>> {
        self.inner.read().verified_identities()
    }

    /// Listen for changes in the SAS verification process.
    ///
    /// The changes are presented as a stream of [`SasState`] values.
    pub fn changes(&self) -> impl Stream<Item = SasState> {
        self.inner.subscribe().map(|s| (&s).into())
    }

    /// Get the current state of the verification process.
    pub fn state(&self) -> SasState {
        (&*self.inner.read()).into()
    }

    fn state_debug(&self) -> State {
        (&*self.inner.read()).into()
    }

    #[cfg(test)]
    pub(crate) fn set_creation_time(&self, time: std::time::Instant) {
        self.inner.update(|inner| {
            inner.set_creation_time(time);
        });
    }

    /// Run a consuming state machine transition under the write lock.
    ///
    /// The closure gets a copy of the current state and returns the state to
    /// store, `None` meaning the transition didn't apply, plus whatever the
    /// transition produced.
    fn transition<T>(&self, apply: impl FnOnce(InnerSas) -> (Option<InnerSas>, T)) -> T {
        let mut guard = self.inner.write();
        let (next, output) = apply((*guard).clone());

        if let Some(next) = next {
            ObservableWriteGuard::set(&mut guard, next);
        }

        output
    }

    /// Accept the proposed protocols, allowing both the emoji and the
    /// decimal method.
    ///
    /// Returns the accept request that needs to be sent out, or `None` if
    /// there is no start event waiting to be accepted.
    pub fn accept(&self) -> Option<OutgoingVerificationRequest> {
        self.accept_with_settings(Default::default())
    }

    /// Accept the proposed protocols, restricted by the given settings.
    ///
    /// Returns the accept request that needs to be sent out, or `None` if
    /// there is no start event waiting to be accepted.
    pub fn accept_with_settings(
        &self,
        settings: AcceptSettings,
    ) -> Option<OutgoingVerificationRequest> {
        let old_state = self.state_debug();

        let request = self.transition(|sas| match sas.accept(settings.allowed_methods) {
            Some((sas, content)) => (Some(sas), Some(content)),
            None => (None, None),
        })
        .map(|content| match content {
            OwnedAcceptContent::ToDevice(c) => {
                self.content_to_request(&AnyToDeviceEventContent::KeyVerificationAccept(c)).into()
            }
            OwnedAcceptContent::Room(room_id, content) => RoomMessageRequest {
                room_id,
                txn_id: TransactionId::new(),
                content: AnyMessageLikeEventContent::KeyVerificationAccept(content),
            }
            .into(),
        });

        trace!(
            flow_id = self.flow_id().as_str(),
            ?old_state,
            new_state = ?self.state_debug(),
            "Accepted SAS verification"
        );

        request
    }

    /// Confirm that the short auth strings match on both sides.
    ///
    /// Returns the MAC request, and possibly the closing done request, that
    /// need to be sent out. Empty if the flow isn't at a point where
    /// confirming means anything.
    pub fn confirm(&self) -> Vec<OutgoingVerificationRequest> {
        let contents = self.transition(|sas| {
            let (sas, contents) = sas.confirm();
            (Some(sas), contents)
        });

        let requests: Vec<_> =
            contents.into_iter().map(|content| self.any_content_to_request(content)).collect();

        if !requests.is_empty() {
            trace!(
                user_id = ?self.other_user_id(),
                device_id = ?self.other_device_id(),
                "Confirming SAS verification"
            )
        }

        requests
    }

    /// Cancel the flow on behalf of the user, with `m.user`.
    ///
    /// Returns the cancellation request that needs to be sent out, or `None`
    /// if the flow was already cancelled.
    pub fn cancel(&self) -> Option<OutgoingVerificationRequest> {
        self.cancel_with_code(CancelCode::User)
    }

    /// Cancel the flow with the given `CancelCode`.
    ///
    /// Prefer [`cancel()`](Self::cancel): the state machine picks the right
    /// code for protocol failures on its own, explicit codes are only needed
    /// for situations it can't see, such as the user declaring that the
    /// strings did not match (`m.mismatched_sas`).
    ///
    /// Returns the cancellation request that needs to be sent out, or `None`
    /// if the flow was already cancelled.
    pub fn cancel_with_code(&self, code: CancelCode) -> Option<OutgoingVerificationRequest> {
        if let Some(request) = &self.request_handle {
            request.cancel_with_code(&code);
        }

        let content = self.transition(|sas| {
            let (sas, content) = sas.cancel(true, code);
            (Some(sas), content)
        });

        content.map(|content| self.any_content_to_request(content))
    }

    pub(crate) fn cancel_if_timed_out(&self) -> Option<OutgoingVerificationRequest> {
        if self.is_cancelled() || self.is_done() {
            None
        } else if self.timed_out() {
            self.cancel_with_code(CancelCode::Timeout)
        } else {
            None
        }
    }

    pub(crate) fn receive_any_event(
        &self,
        sender: &UserId,
        content: &AnyVerificationContent<'_>,
    ) -> Option<(OutgoingContent, Option<RequestInfo>)> {
        let old_state = self.state_debug();

        let content = self.transition(|sas| {
            let (sas, content) = sas.receive_any_event(sender, content);
            (Some(sas), content)
        });

        trace!(
            flow_id = self.flow_id().as_str(),
            ?old_state,
            new_state = ?self.state_debug(),
            "SAS received an event and changed its state"
        );

        content
    }

    pub(crate) fn mark_request_as_sent(&self, request_id: &TransactionId) {
        let old_state = self.state_debug();

        self.transition(|sas| match sas.mark_request_as_sent(request_id) {
            Some(sas) => (Some(sas), ()),
            None => {
                error!(
                    flow_id = self.flow_id().as_str(),
                    ?request_id,
                    "Tried to mark a request as sent, but the request ID didn't match"
                );
                (None, ())
            }
        });

        debug!(
            flow_id = self.flow_id().as_str(),
            ?old_state,
            new_state = ?self.state_debug(),
            ?request_id,
            "Marked a SAS verification HTTP request as sent"
        );
    }

    fn any_content_to_request(&self, content: OutgoingContent) -> OutgoingVerificationRequest {
        match content {
            OutgoingContent::ToDevice(c) => self.content_to_request(&c).into(),
            OutgoingContent::Room(room_id, content) => {
                RoomMessageRequest { room_id, txn_id: TransactionId::new(), content }.into()
            }
        }
    }

    pub(crate) fn content_to_request(&self, content: &AnyToDeviceEventContent) -> ToDeviceRequest {
        ToDeviceRequest::with_id(
            self.other_user_id(),
            self.other_device_id().to_owned(),
            content,
            TransactionId::new(),
        )
    }
}

/// Restrictions on the accept-reply for a SAS verification.
#[derive(Debug)]
pub struct AcceptSettings {
    allowed_methods: Vec<ShortAuthenticationString>,
}

impl Default for AcceptSettings {
    /// All methods are allowed.
    fn default() -> Self {
        Self {
            allowed_methods: vec![
                ShortAuthenticationString::Decimal,
                ShortAuthenticationString::Emoji,
            ],
        }
    }
}

impl AcceptSettings {
    /// Create settings restricting the allowed SAS methods
    ///
    /// # Arguments
    ///
    /// * `methods` - The methods this client allows at most
    pub fn with_allowed_methods(methods: Vec<ShortAuthenticationString>) -> Self {
        Self { allowed_methods: methods }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id, DeviceId, TransactionId, UserId};
    use vodozemac::{Curve25519PublicKey, Ed25519SecretKey};

    use super::{Sas, SasState};
    use crate::{
        event_enums::{AcceptContent, KeyContent, MacContent, OutgoingContent, StartContent},
        store::{DeviceData, OwnAccount, VerificationStore},
    };

    fn alice_id() -> &'static UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("JLAFKJWSCS")
    }

    fn bob_id() -> &'static UserId {
        user_id!("@bob:example.org")
    }

    fn bob_device_id() -> &'static DeviceId {
        device_id!("BOBDEVICE")
    }

    fn account_and_device(user_id: &UserId, device_id: &DeviceId) -> (OwnAccount, DeviceData) {
        let ed25519_key = Ed25519SecretKey::new().public_key();
        let curve25519_key =
            Curve25519PublicKey::from_slice(Ed25519SecretKey::new().public_key().as_bytes())
                .unwrap();

        let account = OwnAccount {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            ed25519_key,
        };
        let device =
            DeviceData::new(user_id.to_owned(), device_id.to_owned(), ed25519_key, curve25519_key);

        (account, device)
    }

    #[test]
    fn sas_wrapper_full() {
        let (alice_account, alice_device) = account_and_device(alice_id(), alice_device_id());
        let (bob_account, bob_device) = account_and_device(bob_id(), bob_device_id());

        let alice_store = VerificationStore::new(alice_account);
        alice_store.add_device(bob_device.clone());

        let bob_store = VerificationStore::new(bob_account);
        bob_store.add_device(alice_device.clone());

        let identities = alice_store.get_identities(bob_device);

        let (alice, content) = Sas::start(identities, TransactionId::new(), true, None);

        assert_matches!(alice.state(), SasState::Started { .. });

        let flow_id = alice.flow_id().to_owned();
        let content = StartContent::try_from(&content).unwrap();

        let identities = bob_store.get_identities(alice_device);
        let bob = Sas::from_start_event(flow_id, &content, identities, None, false).unwrap();

        assert_matches!(bob.state(), SasState::Started { .. });

        let request = bob.accept().unwrap();

        let content = OutgoingContent::try_from(&request).unwrap();
        let content = AcceptContent::try_from(&content).unwrap();

        let (content, request_info) =
            alice.receive_any_event(bob.user_id(), &content.into()).unwrap();

        assert_matches!(alice.state(), SasState::Accepted { .. });
        assert_matches!(bob.state(), SasState::Accepted { .. });

        // Neither side has exchanged keys, the short auth string stays
        // hidden.
        assert!(!alice.can_be_presented());
        assert!(!bob.can_be_presented());

        alice.mark_request_as_sent(&request_info.unwrap().request_id);

        let content = KeyContent::try_from(&content).unwrap();
        let (content, request_info) =
            bob.receive_any_event(alice.user_id(), &content.into()).unwrap();

        // Bob received Alice's key but hasn't flushed his own key out yet.
        assert!(!bob.can_be_presented());
        assert_matches!(bob.state(), SasState::Accepted { .. });

        bob.mark_request_as_sent(&request_info.unwrap().request_id);
        assert!(bob.can_be_presented());
        assert_matches!(bob.state(), SasState::KeysExchanged { .. });

        let content = KeyContent::try_from(&content).unwrap();
        alice.receive_any_event(bob.user_id(), &content.into());
        assert_matches!(alice.state(), SasState::KeysExchanged { .. });
        assert!(alice.can_be_presented());

        // Both sides must derive the same short auth string.
        assert_eq!(alice.emoji().unwrap(), bob.emoji().unwrap());
        assert_eq!(alice.decimals().unwrap(), bob.decimals().unwrap());

        let mut requests = alice.confirm();
        assert_matches!(alice.state(), SasState::Confirmed);
        assert_eq!(requests.len(), 1);

        let request = requests.pop().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = MacContent::try_from(&content).unwrap();
        bob.receive_any_event(alice.user_id(), &content.into());
        assert_matches!(bob.state(), SasState::KeysExchanged { .. });

        let mut requests = bob.confirm();
        assert_matches!(bob.state(), SasState::Done { .. });
        assert_eq!(requests.len(), 1);

        let request = requests.pop().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = MacContent::try_from(&content).unwrap();
        alice.receive_any_event(bob.user_id(), &content.into());

        assert!(alice.verified_devices().unwrap().contains(alice.other_device()));
        assert!(bob.verified_devices().unwrap().contains(bob.other_device()));
        assert_matches!(alice.state(), SasState::Done { .. });
        assert_matches!(bob.state(), SasState::Done { .. });
    }
}
