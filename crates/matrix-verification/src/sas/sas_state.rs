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

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ruma::{
    events::{
        key::verification::{
            accept::{
                AcceptMethod, KeyVerificationAcceptEventContent,
                SasV1ContentInit as AcceptV1ContentInit,
                ToDeviceKeyVerificationAcceptEventContent,
            },
            cancel::{
                CancelCode, KeyVerificationCancelEventContent,
                ToDeviceKeyVerificationCancelEventContent,
            },
            done::{KeyVerificationDoneEventContent, ToDeviceKeyVerificationDoneEventContent},
            key::{KeyVerificationKeyEventContent, ToDeviceKeyVerificationKeyEventContent},
            start::{
                KeyVerificationStartEventContent, SasV1Content, SasV1ContentInit, StartMethod,
                ToDeviceKeyVerificationStartEventContent,
            },
            HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
            ShortAuthenticationString,
        },
        relation::Reference,
        AnyMessageLikeEventContent, AnyToDeviceEventContent,
    },
    serde::Base64,
    DeviceId, OwnedTransactionId, TransactionId, UserId,
};
use tracing::trace;
use vodozemac::{
    sas::{EstablishedSas, Mac, Sas as OlmSas},
    Curve25519PublicKey,
};

use super::helpers::{
    calculate_commitment, get_decimal, get_emoji, get_emoji_index, get_mac_content,
    receive_mac_event, SasIds,
};
use crate::{
    cache::RequestInfo,
    channel::FlowId,
    event_enums::{
        AcceptContent, DoneContent, KeyContent, MacContent, OutgoingContent, OwnedAcceptContent,
        OwnedStartContent, StartContent,
    },
    store::{DeviceData, OwnAccount, UserIdentityData},
    Cancelled, Emoji,
};

const KEY_AGREEMENT_PROTOCOLS: &[KeyAgreementProtocol] =
    &[KeyAgreementProtocol::Curve25519HkdfSha256];
const HASHES: &[HashAlgorithm] = &[HashAlgorithm::Sha256];
const STRINGS: &[ShortAuthenticationString] =
    &[ShortAuthenticationString::Decimal, ShortAuthenticationString::Emoji];

// The max time a SAS flow can take from start to done.
const MAX_AGE: Duration = Duration::from_secs(60 * 5);

// The max time a SAS object will wait for a new event to arrive.
const MAX_EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// The MAC constructions this implementation can calculate and check.
///
/// The original `hkdf-hmac-sha256` method base64 encoded its input in an
/// incorrect manner, the `.v2` variant fixes this. We support both and prefer
/// the fixed one when the other side offers it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportedMacMethod {
    /// The old, wrong way to calculate the per-key MACs.
    HkdfHmacSha256,
    /// The fixed way to calculate the per-key MACs.
    HkdfHmacSha256V2,
}

impl From<SupportedMacMethod> for MessageAuthenticationCode {
    fn from(value: SupportedMacMethod) -> Self {
        match value {
            #[allow(deprecated)]
            SupportedMacMethod::HkdfHmacSha256 => MessageAuthenticationCode::HkdfHmacSha256,
            SupportedMacMethod::HkdfHmacSha256V2 => MessageAuthenticationCode::HkdfHmacSha256V2,
        }
    }
}

impl TryFrom<&MessageAuthenticationCode> for SupportedMacMethod {
    type Error = ();

    fn try_from(value: &MessageAuthenticationCode) -> Result<Self, Self::Error> {
        match value {
            #[allow(deprecated)]
            MessageAuthenticationCode::HkdfHmacSha256 => Ok(Self::HkdfHmacSha256),
            MessageAuthenticationCode::HkdfHmacSha256V2 => Ok(Self::HkdfHmacSha256V2),
            _ => Err(()),
        }
    }
}

impl SupportedMacMethod {
    /// Pick the best MAC method out of the ones the other side offers.
    fn from_mac_methods(methods: &[MessageAuthenticationCode]) -> Option<Self> {
        if methods.contains(&MessageAuthenticationCode::HkdfHmacSha256V2) {
            Some(Self::HkdfHmacSha256V2)
        } else {
            #[allow(deprecated)]
            methods
                .contains(&MessageAuthenticationCode::HkdfHmacSha256)
                .then_some(Self::HkdfHmacSha256)
        }
    }

    pub fn calculate_mac(&self, sas: &EstablishedSas, input: &str, info: &str) -> Base64 {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => {
                Base64::parse(sas.calculate_mac_invalid_base64(input, info))
                    .expect("We can always decode our own MAC")
            }
            SupportedMacMethod::HkdfHmacSha256V2 => {
                Base64::new(sas.calculate_mac(input, info).as_bytes().to_vec())
            }
        }
    }

    pub fn verify_mac(
        &self,
        sas: &EstablishedSas,
        input: &str,
        info: &str,
        mac: &Base64,
    ) -> Result<(), CancelCode> {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => {
                let calculated = Base64::parse(sas.calculate_mac_invalid_base64(input, info))
                    .expect("We can always decode our own MAC");

                if &calculated == mac {
                    Ok(())
                } else {
                    Err(CancelCode::KeyMismatch)
                }
            }
            SupportedMacMethod::HkdfHmacSha256V2 => {
                let mac = Mac::from_base64(&mac.encode()).map_err(|_| CancelCode::KeyMismatch)?;
                sas.verify_mac(input, info, &mac).map_err(|_| CancelCode::KeyMismatch)
            }
        }
    }
}

/// The protocols that both sides agreed to use for the SAS flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedProtocols {
    /// The key agreement protocol that will establish the shared secret.
    pub key_agreement_protocol: KeyAgreementProtocol,
    /// The hash algorithm that was used for the commitment.
    pub hash: HashAlgorithm,
    /// The MAC construction the final key MACs will use.
    pub message_auth_code: SupportedMacMethod,
    /// The ways the short auth string can be presented.
    pub short_auth_string: Vec<ShortAuthenticationString>,
}

impl TryFrom<&ruma::events::key::verification::accept::SasV1Content> for AcceptedProtocols {
    type Error = CancelCode;

    fn try_from(
        content: &ruma::events::key::verification::accept::SasV1Content,
    ) -> Result<Self, Self::Error> {
        let mac_method = SupportedMacMethod::try_from(&content.message_authentication_code)
            .map_err(|_| CancelCode::UnknownMethod)?;

        if !KEY_AGREEMENT_PROTOCOLS.contains(&content.key_agreement_protocol)
            || !HASHES.contains(&content.hash)
            || (!content.short_authentication_string.contains(&ShortAuthenticationString::Emoji)
                && !content
                    .short_authentication_string
                    .contains(&ShortAuthenticationString::Decimal))
        {
            Err(CancelCode::UnknownMethod)
        } else {
            Ok(Self {
                hash: content.hash.clone(),
                key_agreement_protocol: content.key_agreement_protocol.clone(),
                message_auth_code: mac_method,
                short_auth_string: content.short_authentication_string.clone(),
            })
        }
    }
}

impl TryFrom<&SasV1Content> for AcceptedProtocols {
    type Error = CancelCode;

    fn try_from(content: &SasV1Content) -> Result<Self, Self::Error> {
        let mac_method = SupportedMacMethod::from_mac_methods(&content.message_authentication_codes)
            .ok_or(CancelCode::UnknownMethod)?;

        if !content
            .key_agreement_protocols
            .contains(&KeyAgreementProtocol::Curve25519HkdfSha256)
            || !content.hashes.contains(&HashAlgorithm::Sha256)
            || (!content.short_authentication_string.contains(&ShortAuthenticationString::Decimal)
                && !content
                    .short_authentication_string
                    .contains(&ShortAuthenticationString::Emoji))
        {
            Err(CancelCode::UnknownMethod)
        } else {
            let mut short_auth_string: Vec<_> = content
                .short_authentication_string
                .iter()
                .filter(|m| STRINGS.contains(m))
                .cloned()
                .collect();
            short_auth_string.sort_by_key(|m| m.to_string());

            Ok(Self {
                hash: HashAlgorithm::Sha256,
                key_agreement_protocol: KeyAgreementProtocol::Curve25519HkdfSha256,
                message_auth_code: mac_method,
                short_auth_string,
            })
        }
    }
}

impl Default for AcceptedProtocols {
    fn default() -> Self {
        AcceptedProtocols {
            hash: HashAlgorithm::Sha256,
            key_agreement_protocol: KeyAgreementProtocol::Curve25519HkdfSha256,
            message_auth_code: SupportedMacMethod::HkdfHmacSha256V2,
            short_auth_string: STRINGS.to_vec(),
        }
    }
}

/// A type level state machine modeling the SAS flow.
///
/// This is the generic struct holding common data between the different states
/// and the specific state.
#[derive(Clone)]
pub struct SasState<S: Clone> {
    /// The SAS struct generating our ephemeral key, consumed by the key
    /// agreement once the other side's key arrives.
    inner: Arc<Mutex<Option<OlmSas>>>,

    /// Our own ephemeral public key, remembered since establishing the shared
    /// secret consumes the `inner` SAS struct.
    our_public_key: Curve25519PublicKey,

    /// Struct holding the identities that are doing the SAS dance.
    ids: SasIds,

    /// The instant when the SAS object was created. If more than `MAX_AGE`
    /// has elapsed the flow will be cancelled with a `CancelCode::Timeout`.
    creation_time: Arc<Instant>,

    /// The instant the SAS object last received an event.
    last_event_time: Arc<Instant>,

    /// The unique identifier of this SAS flow.
    ///
    /// This will be the transaction id for to-device events and the event id
    /// of the initial request for in-room events.
    pub verification_flow_id: Arc<FlowId>,

    /// Did the SAS flow get started by an `m.key.verification.request`.
    pub started_from_request: bool,

    /// The SAS state we're in.
    pub state: Arc<S>,
}

impl<S: Clone + fmt::Debug> fmt::Debug for SasState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasState")
            .field("flow_id", &self.verification_flow_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// The initial SAS state.
#[derive(Clone, Debug)]
pub struct Created {
    pub protocol_definitions: SasV1Content,
}

/// The initial SAS state if the other side started the SAS verification.
#[derive(Clone, Debug)]
pub struct Started {
    pub accepted_protocols: Arc<AcceptedProtocols>,
    pub protocol_definitions: SasV1Content,
    commitment: Base64,
}

/// The SAS state we're in after we accepted the verification the other side
/// started.
#[derive(Clone, Debug)]
pub struct WeAccepted {
    pub accepted_protocols: Arc<AcceptedProtocols>,
    commitment: Base64,
}

/// The SAS state we're in after the other side accepted our start event.
#[derive(Clone, Debug)]
pub struct Accepted {
    pub accepted_protocols: Arc<AcceptedProtocols>,
    start_content: Arc<OwnedStartContent>,
    commitment: Base64,
    request_id: OwnedTransactionId,
}

/// The SAS state we're in after our key event went out but the other side's
/// key didn't arrive yet.
#[derive(Clone, Debug)]
pub struct KeySent {
    pub accepted_protocols: Arc<AcceptedProtocols>,
    start_content: Arc<OwnedStartContent>,
    commitment: Base64,
}

/// The SAS state we're in after we received the public key of the other
/// side but our own key event hasn't been sent out yet.
#[derive(Clone, Debug)]
pub struct KeyReceived {
    sas: Arc<EstablishedSas>,
    we_started: bool,
    request_id: OwnedTransactionId,
    pub accepted_protocols: Arc<AcceptedProtocols>,
}

/// Both public keys were exchanged, from now on the short auth string can be
/// shown to the user.
#[derive(Clone, Debug)]
pub struct KeysExchanged {
    sas: Arc<EstablishedSas>,
    we_started: bool,
    pub accepted_protocols: Arc<AcceptedProtocols>,
}

/// The SAS state we're in after the user confirmed that the short auth
/// string matches. We still need to receive a MAC event from the other side.
#[derive(Clone, Debug)]
pub struct Confirmed {
    sas: Arc<EstablishedSas>,
    pub accepted_protocols: Arc<AcceptedProtocols>,
}

/// The SAS state we're in after we received a MAC event from the other side.
/// Our own user still needs to confirm that the short auth string matches.
#[derive(Clone, Debug)]
pub struct MacReceived {
    sas: Arc<EstablishedSas>,
    we_started: bool,
    verified_devices: Arc<[DeviceData]>,
    verified_master_keys: Arc<[UserIdentityData]>,
    pub accepted_protocols: Arc<AcceptedProtocols>,
}

/// The SAS state we're in after both sides exchanged MACs, waiting for the
/// final done event of the other side.
#[derive(Clone, Debug)]
pub struct WaitingForDone {
    verified_devices: Arc<[DeviceData]>,
    verified_master_keys: Arc<[UserIdentityData]>,
}

/// The SAS state indicating that the verification finished successfully.
///
/// The device in the verified devices list can be marked as verified and the
/// master keys in the verified master key list can be signed.
#[derive(Clone, Debug)]
pub struct Done {
    verified_devices: Arc<[DeviceData]>,
    verified_master_keys: Arc<[UserIdentityData]>,
}

impl<S: Clone> SasState<S> {
    /// Get our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.ids.account.user_id
    }

    /// Get our own device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.ids.account.device_id
    }

    #[cfg(test)]
    pub fn other_device(&self) -> DeviceData {
        self.ids.other_device.clone()
    }

    pub fn cancel(self, cancelled_by_us: bool, cancel_code: CancelCode) -> SasState<Cancelled> {
        SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            verification_flow_id: self.verification_flow_id,
            started_from_request: self.started_from_request,
            state: Arc::new(Cancelled::new(cancelled_by_us, cancel_code)),
        }
    }

    /// Did our SAS verification time out.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > MAX_AGE || self.last_event_time.elapsed() > MAX_EVENT_TIMEOUT
    }

    #[cfg(test)]
    pub fn set_creation_time(&mut self, time: Instant) {
        self.creation_time = Arc::new(time);
    }

    fn check_event(&self, sender: &UserId, flow_id: &str) -> Result<(), CancelCode> {
        if flow_id != self.verification_flow_id.as_str() {
            Err(CancelCode::UnknownTransaction)
        } else if sender != self.ids.other_device.user_id() {
            Err(CancelCode::UserMismatch)
        } else if self.timed_out() {
            Err(CancelCode::Timeout)
        } else {
            Ok(())
        }
    }

    fn key_content(&self) -> OutgoingContent {
        let key = Base64::new(self.our_public_key.as_bytes().to_vec());

        match self.verification_flow_id.as_ref() {
            FlowId::ToDevice(s) => AnyToDeviceEventContent::KeyVerificationKey(
                ToDeviceKeyVerificationKeyEventContent::new(s.clone(), key),
            )
            .into(),
            FlowId::InRoom(r, e) => (
                r.clone(),
                AnyMessageLikeEventContent::KeyVerificationKey(
                    KeyVerificationKeyEventContent::new(key, Reference::new(e.clone())),
                ),
            )
                .into(),
        }
    }

    /// Consume our ephemeral key and establish the shared secret with the
    /// other side's public key.
    fn establish_sas(&self, their_public_key: &Base64) -> Result<EstablishedSas, CancelCode> {
        let their_public_key = Curve25519PublicKey::from_slice(their_public_key.as_bytes())
            .map_err(|_| CancelCode::KeyMismatch)?;

        let sas = self
            .inner
            .lock()
            .unwrap()
            .take()
            .ok_or(CancelCode::UnexpectedMessage)?;

        sas.diffie_hellman(their_public_key).map_err(|_| CancelCode::KeyMismatch)
    }
}

impl SasState<Created> {
    /// Create a new SAS verification flow that we initiate.
    ///
    /// # Arguments
    ///
    /// * `account` - Our own account.
    ///
    /// * `other_device` - The other device which we are going to verify.
    pub fn new(
        account: OwnAccount,
        other_device: DeviceData,
        own_identity: Option<UserIdentityData>,
        other_identity: Option<UserIdentityData>,
        flow_id: FlowId,
        started_from_request: bool,
    ) -> SasState<Created> {
        let sas = OlmSas::new();
        let our_public_key = sas.public_key();

        SasState {
            inner: Arc::new(Mutex::new(Some(sas))),
            our_public_key,
            ids: SasIds { account, own_identity, other_device, other_identity },
            verification_flow_id: flow_id.into(),

            creation_time: Arc::new(Instant::now()),
            last_event_time: Arc::new(Instant::now()),
            started_from_request,

            state: Arc::new(Created {
                protocol_definitions: SasV1ContentInit {
                    short_authentication_string: STRINGS.to_vec(),
                    key_agreement_protocols: KEY_AGREEMENT_PROTOCOLS.to_vec(),
                    message_authentication_codes: vec![
                        #[allow(deprecated)]
                        MessageAuthenticationCode::HkdfHmacSha256,
                        MessageAuthenticationCode::HkdfHmacSha256V2,
                    ],
                    hashes: HASHES.to_vec(),
                }
                .into(),
            }),
        }
    }

    /// Get the content for the start event.
    ///
    /// The content needs to be sent to the other device.
    pub fn as_content(&self) -> OwnedStartContent {
        match self.verification_flow_id.as_ref() {
            FlowId::ToDevice(s) => OwnedStartContent::ToDevice(
                ToDeviceKeyVerificationStartEventContent::new(
                    self.device_id().to_owned(),
                    s.clone(),
                    StartMethod::SasV1(self.state.protocol_definitions.clone()),
                ),
            ),
            FlowId::InRoom(r, e) => OwnedStartContent::Room(
                r.clone(),
                KeyVerificationStartEventContent::new(
                    self.device_id().to_owned(),
                    StartMethod::SasV1(self.state.protocol_definitions.clone()),
                    Reference::new(e.clone()),
                ),
            ),
        }
    }

    /// Receive an `m.key.verification.accept` event, changing the state into
    /// an `Accepted` one.
    pub fn into_accepted(
        self,
        sender: &UserId,
        content: &AcceptContent<'_>,
    ) -> Result<SasState<Accepted>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        if let AcceptMethod::SasV1(content) = content.method() {
            let accepted_protocols = AcceptedProtocols::try_from(content)
                .map_err(|c| self.clone().cancel(true, c))?;

            let start_content = self.as_content().into();

            Ok(SasState {
                inner: self.inner,
                our_public_key: self.our_public_key,
                ids: self.ids,
                verification_flow_id: self.verification_flow_id,
                creation_time: self.creation_time,
                last_event_time: Arc::new(Instant::now()),
                started_from_request: self.started_from_request,
                state: Arc::new(Accepted {
                    start_content,
                    commitment: content.commitment.clone(),
                    request_id: TransactionId::new(),
                    accepted_protocols: accepted_protocols.into(),
                }),
            })
        } else {
            Err(self.cancel(true, CancelCode::UnknownMethod))
        }
    }
}

impl SasState<Started> {
    /// Create a new SAS verification flow from an `m.key.verification.start`
    /// event that the other side sent us.
    pub fn from_start_event(
        account: OwnAccount,
        other_device: DeviceData,
        own_identity: Option<UserIdentityData>,
        other_identity: Option<UserIdentityData>,
        flow_id: FlowId,
        content: &StartContent<'_>,
        started_from_request: bool,
    ) -> Result<SasState<Started>, SasState<Cancelled>> {
        let canceled = {
            let account = account.clone();
            let own_identity = own_identity.clone();
            let other_device = other_device.clone();
            let other_identity = other_identity.clone();
            let flow_id = flow_id.clone();

            move |code: CancelCode| SasState {
                inner: Arc::new(Mutex::new(None)),
                our_public_key: OlmSas::new().public_key(),

                creation_time: Arc::new(Instant::now()),
                last_event_time: Arc::new(Instant::now()),

                ids: SasIds { account, own_identity, other_device, other_identity },

                verification_flow_id: flow_id.into(),
                started_from_request,
                state: Arc::new(Cancelled::new(true, code)),
            }
        };

        if let StartMethod::SasV1(method_content) = content.method() {
            let sas = OlmSas::new();
            let our_public_key = sas.public_key();

            let commitment = calculate_commitment(our_public_key, content);

            trace!(
                public_key = our_public_key.to_base64(),
                ?commitment,
                "Calculated commitment for the accept event"
            );

            match AcceptedProtocols::try_from(method_content) {
                Ok(accepted_protocols) => Ok(SasState {
                    inner: Arc::new(Mutex::new(Some(sas))),
                    our_public_key,

                    ids: SasIds { account, own_identity, other_device, other_identity },

                    creation_time: Arc::new(Instant::now()),
                    last_event_time: Arc::new(Instant::now()),

                    verification_flow_id: flow_id.into(),
                    started_from_request,

                    state: Arc::new(Started {
                        accepted_protocols: accepted_protocols.into(),
                        protocol_definitions: method_content.clone(),
                        commitment,
                    }),
                }),
                Err(code) => Err(canceled(code)),
            }
        } else {
            Err(canceled(CancelCode::UnknownMethod))
        }
    }

    /// Accept the SAS verification, restricting the SAS methods to the given
    /// ones.
    pub fn into_we_accepted(self, methods: Vec<ShortAuthenticationString>) -> SasState<WeAccepted> {
        let mut accepted_protocols = self.state.accepted_protocols.as_ref().to_owned();
        accepted_protocols.short_auth_string.retain(|m| methods.contains(m));

        // The methods field in the accept event isn't allowed to be empty, if
        // the user tried to restrict them to an empty set we fall back to
        // decimal.
        if accepted_protocols.short_auth_string.is_empty() {
            accepted_protocols.short_auth_string = vec![ShortAuthenticationString::Decimal];
        }

        SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            started_from_request: self.started_from_request,
            state: Arc::new(WeAccepted {
                accepted_protocols: accepted_protocols.into(),
                commitment: self.state.commitment.clone(),
            }),
        }
    }
}

impl SasState<WeAccepted> {
    /// Get the content for the accept event.
    ///
    /// The content needs to be sent to the other device.
    pub fn as_content(&self) -> OwnedAcceptContent {
        let method = AcceptMethod::SasV1(
            AcceptV1ContentInit {
                commitment: self.state.commitment.clone(),
                hash: self.state.accepted_protocols.hash.clone(),
                key_agreement_protocol: self
                    .state
                    .accepted_protocols
                    .key_agreement_protocol
                    .clone(),
                message_authentication_code: self.state.accepted_protocols.message_auth_code.into(),
                short_authentication_string: self
                    .state
                    .accepted_protocols
                    .short_auth_string
                    .clone(),
            }
            .into(),
        );

        match self.verification_flow_id.as_ref() {
            FlowId::ToDevice(s) => {
                ToDeviceKeyVerificationAcceptEventContent::new(s.clone(), method).into()
            }
            FlowId::InRoom(r, e) => (
                r.clone(),
                KeyVerificationAcceptEventContent::new(method, Reference::new(e.clone())),
            )
                .into(),
        }
    }

    /// Receive an `m.key.verification.key` event, changing the state into
    /// a `KeyReceived` one.
    pub fn into_key_received(
        self,
        sender: &UserId,
        content: &KeyContent<'_>,
    ) -> Result<SasState<KeyReceived>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        let established = self
            .establish_sas(content.public_key())
            .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: Arc::new(Instant::now()),
            started_from_request: self.started_from_request,
            state: Arc::new(KeyReceived {
                sas: established.into(),
                we_started: false,
                request_id: TransactionId::new(),
                accepted_protocols: self.state.accepted_protocols.clone(),
            }),
        })
    }
}

impl SasState<Accepted> {
    /// Get the content for our key event together with the request info that
    /// gates the transition into the `KeySent` state.
    pub fn as_content(&self) -> (OutgoingContent, RequestInfo) {
        (
            self.key_content(),
            RequestInfo {
                flow_id: self.verification_flow_id.as_ref().to_owned(),
                request_id: self.state.request_id.to_owned(),
            },
        )
    }

    /// Receive an `m.key.verification.key` event, changing the state into
    /// a `KeyReceived` one.
    ///
    /// The other side committed to its public key in the accept event, a key
    /// that doesn't match the commitment cancels the flow.
    pub fn into_key_received(
        self,
        sender: &UserId,
        content: &KeyContent<'_>,
    ) -> Result<SasState<KeyReceived>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        self.check_commitment(content).map_err(|c| self.clone().cancel(true, c))?;

        let established = self
            .establish_sas(content.public_key())
            .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: Arc::new(Instant::now()),
            started_from_request: self.started_from_request,
            state: Arc::new(KeyReceived {
                sas: established.into(),
                we_started: true,
                request_id: self.state.request_id.clone(),
                accepted_protocols: self.state.accepted_protocols.clone(),
            }),
        })
    }

    /// Our key event was sent out, wait for the other side's key.
    pub fn into_key_sent(self, request_id: &TransactionId) -> Option<SasState<KeySent>> {
        (self.state.request_id == request_id).then(|| SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            started_from_request: self.started_from_request,
            state: Arc::new(KeySent {
                accepted_protocols: self.state.accepted_protocols.clone(),
                start_content: self.state.start_content.clone(),
                commitment: self.state.commitment.clone(),
            }),
        })
    }

    fn check_commitment(&self, content: &KeyContent<'_>) -> Result<(), CancelCode> {
        let their_public_key = Curve25519PublicKey::from_slice(content.public_key().as_bytes())
            .map_err(|_| CancelCode::KeyMismatch)?;

        let commitment =
            calculate_commitment(their_public_key, &self.state.start_content.as_start_content());

        if self.state.commitment == commitment {
            Ok(())
        } else {
            Err(CancelCode::MismatchedCommitment)
        }
    }
}

impl SasState<KeySent> {
    /// Receive an `m.key.verification.key` event, changing the state into
    /// a `KeysExchanged` one.
    pub fn into_keys_exchanged(
        self,
        sender: &UserId,
        content: &KeyContent<'_>,
    ) -> Result<SasState<KeysExchanged>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        self.check_commitment(content).map_err(|c| self.clone().cancel(true, c))?;

        let established = self
            .establish_sas(content.public_key())
            .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: Arc::new(Instant::now()),
            started_from_request: self.started_from_request,
            state: Arc::new(KeysExchanged {
                sas: established.into(),
                we_started: true,
                accepted_protocols: self.state.accepted_protocols.clone(),
            }),
        })
    }

    fn check_commitment(&self, content: &KeyContent<'_>) -> Result<(), CancelCode> {
        let their_public_key = Curve25519PublicKey::from_slice(content.public_key().as_bytes())
            .map_err(|_| CancelCode::KeyMismatch)?;

        let commitment =
            calculate_commitment(their_public_key, &self.state.start_content.as_start_content());

        if self.state.commitment == commitment {
            Ok(())
        } else {
            Err(CancelCode::MismatchedCommitment)
        }
    }
}

impl SasState<KeyReceived> {
    /// Get the content for our key event together with the request info that
    /// gates the transition into the `KeysExchanged` state.
    ///
    /// This needs to be sent out only if the other side started the flow.
    pub fn as_content(&self) -> (OutgoingContent, RequestInfo) {
        (
            self.key_content(),
            RequestInfo {
                flow_id: self.verification_flow_id.as_ref().to_owned(),
                request_id: self.state.request_id.to_owned(),
            },
        )
    }

    /// Our key event was sent out, both sides now hold both public keys.
    pub fn into_keys_exchanged(
        self,
        request_id: &TransactionId,
    ) -> Option<SasState<KeysExchanged>> {
        (self.state.request_id == request_id).then(|| SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            ids: self.ids,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            started_from_request: self.started_from_request,
            state: Arc::new(KeysExchanged {
                sas: self.state.sas.clone(),
                we_started: self.state.we_started,
                accepted_protocols: self.state.accepted_protocols.clone(),
            }),
        })
    }
}

impl SasState<KeysExchanged> {
    /// Get the emoji version of the short auth string.
    pub fn get_emoji(&self) -> [Emoji; 7] {
        get_emoji(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// Get the index of the emoji of the short auth string.
    pub fn get_emoji_index(&self) -> [u8; 7] {
        get_emoji_index(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// Get the decimal version of the short auth string.
    pub fn get_decimal(&self) -> (u16, u16, u16) {
        get_decimal(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// Receive an `m.key.verification.mac` event, changing the state into
    /// a `MacReceived` one.
    pub fn into_mac_received(
        self,
        sender: &UserId,
        content: &MacContent<'_>,
    ) -> Result<SasState<MacReceived>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        let (devices, master_keys) = receive_mac_event(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            sender,
            self.state.accepted_protocols.message_auth_code,
            content,
        )
        .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: Arc::new(Instant::now()),
            ids: self.ids,
            started_from_request: self.started_from_request,
            state: Arc::new(MacReceived {
                sas: self.state.sas.clone(),
                we_started: self.state.we_started,
                verified_devices: devices.into(),
                verified_master_keys: master_keys.into(),
                accepted_protocols: self.state.accepted_protocols.clone(),
            }),
        })
    }

    /// Confirm that the short auth string matches.
    ///
    /// This needs to be done by the user, this will put us in the `Confirmed`
    /// state.
    pub fn confirm(self) -> SasState<Confirmed> {
        SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            ids: self.ids,
            started_from_request: self.started_from_request,
            state: Arc::new(Confirmed {
                sas: self.state.sas.clone(),
                accepted_protocols: self.state.accepted_protocols.clone(),
            }),
        }
    }
}

impl SasState<Confirmed> {
    /// Receive an `m.key.verification.mac` event, changing the state into
    /// a `Done` one.
    pub fn into_done(
        self,
        sender: &UserId,
        content: &MacContent<'_>,
    ) -> Result<SasState<Done>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        let (devices, master_keys) = receive_mac_event(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            sender,
            self.state.accepted_protocols.message_auth_code,
            content,
        )
        .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            verification_flow_id: self.verification_flow_id,
            ids: self.ids,
            started_from_request: self.started_from_request,

            state: Arc::new(Done {
                verified_devices: devices.into(),
                verified_master_keys: master_keys.into(),
            }),
        })
    }

    /// Receive an `m.key.verification.mac` event, changing the state into
    /// a `WaitingForDone` one.
    ///
    /// This is the transition that request initiated flows take, they close
    /// with a pair of `m.key.verification.done` events.
    pub fn into_waiting_for_done(
        self,
        sender: &UserId,
        content: &MacContent<'_>,
    ) -> Result<SasState<WaitingForDone>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        let (devices, master_keys) = receive_mac_event(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            sender,
            self.state.accepted_protocols.message_auth_code,
            content,
        )
        .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            verification_flow_id: self.verification_flow_id,
            ids: self.ids,
            started_from_request: self.started_from_request,

            state: Arc::new(WaitingForDone {
                verified_devices: devices.into(),
                verified_master_keys: master_keys.into(),
            }),
        })
    }

    /// Get the content for the mac event.
    ///
    /// The content needs to be automatically sent to the other side.
    pub fn as_content(&self) -> OutgoingContent {
        get_mac_content(
            &self.state.sas,
            &self.ids,
            &self.verification_flow_id,
            self.state.accepted_protocols.message_auth_code,
        )
    }
}

impl SasState<MacReceived> {
    /// Confirm that the short auth string matches, completing the flow.
    ///
    /// This needs to be done by the user, this will put us in the `Done`
    /// state since the other side already confirmed and sent us a MAC event.
    pub fn confirm(self) -> SasState<Done> {
        SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            ids: self.ids,
            started_from_request: self.started_from_request,
            state: Arc::new(Done {
                verified_devices: self.state.verified_devices.clone(),
                verified_master_keys: self.state.verified_master_keys.clone(),
            }),
        }
    }

    /// Confirm that the short auth string matches but wait for the other side
    /// to send its done event before we consider the flow to be finished.
    pub fn confirm_and_wait_for_done(self) -> SasState<WaitingForDone> {
        SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            verification_flow_id: self.verification_flow_id,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            ids: self.ids,
            started_from_request: self.started_from_request,
            state: Arc::new(WaitingForDone {
                verified_devices: self.state.verified_devices.clone(),
                verified_master_keys: self.state.verified_master_keys.clone(),
            }),
        }
    }

    /// Get the content for the mac event we still need to send out.
    pub fn as_content(&self) -> OutgoingContent {
        get_mac_content(
            &self.state.sas,
            &self.ids,
            &self.verification_flow_id,
            self.state.accepted_protocols.message_auth_code,
        )
    }

    /// Get the emoji version of the short auth string.
    pub fn get_emoji(&self) -> [Emoji; 7] {
        get_emoji(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// Get the index of the emoji of the short auth string.
    pub fn get_emoji_index(&self) -> [u8; 7] {
        get_emoji_index(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }

    /// Get the decimal version of the short auth string.
    pub fn get_decimal(&self) -> (u16, u16, u16) {
        get_decimal(
            &self.state.sas,
            &self.ids,
            self.verification_flow_id.as_str(),
            self.state.we_started,
        )
    }
}

impl SasState<WaitingForDone> {
    /// Get the content for the done event we send out.
    pub fn done_content(&self) -> OutgoingContent {
        match self.verification_flow_id.as_ref() {
            FlowId::ToDevice(t) => AnyToDeviceEventContent::KeyVerificationDone(
                ToDeviceKeyVerificationDoneEventContent::new(t.clone()),
            )
            .into(),
            FlowId::InRoom(r, e) => (
                r.clone(),
                AnyMessageLikeEventContent::KeyVerificationDone(
                    KeyVerificationDoneEventContent::new(Reference::new(e.clone())),
                ),
            )
                .into(),
        }
    }

    /// Receive an `m.key.verification.done` event, completing the flow.
    pub fn into_done(
        self,
        sender: &UserId,
        content: &DoneContent<'_>,
    ) -> Result<SasState<Done>, SasState<Cancelled>> {
        self.check_event(sender, content.flow_id())
            .map_err(|c| self.clone().cancel(true, c))?;

        Ok(SasState {
            inner: self.inner,
            our_public_key: self.our_public_key,
            creation_time: self.creation_time,
            last_event_time: self.last_event_time,
            verification_flow_id: self.verification_flow_id,
            ids: self.ids,
            started_from_request: self.started_from_request,

            state: Arc::new(Done {
                verified_devices: self.state.verified_devices.clone(),
                verified_master_keys: self.state.verified_master_keys.clone(),
            }),
        })
    }
}

impl SasState<Done> {
    /// Get the content for the done event we send out when the flow was
    /// started by a request.
    pub fn done_content(&self) -> OutgoingContent {
        match self.verification_flow_id.as_ref() {
            FlowId::ToDevice(t) => AnyToDeviceEventContent::KeyVerificationDone(
                ToDeviceKeyVerificationDoneEventContent::new(t.clone()),
            )
            .into(),
            FlowId::InRoom(r, e) => (
                r.clone(),
                AnyMessageLikeEventContent::KeyVerificationDone(
                    KeyVerificationDoneEventContent::new(Reference::new(e.clone())),
                ),
            )
                .into(),
        }
    }

    /// Get the list of devices this flow verified.
    pub fn verified_devices(&self) -> Arc<[DeviceData]> {
        self.state.verified_devices.clone()
    }

    /// Get the list of user identities this flow verified.
    pub fn verified_identities(&self) -> Arc<[UserIdentityData]> {
        self.state.verified_master_keys.clone()
    }
}

impl SasState<Cancelled> {
    /// Get the content for the cancel event.
    pub fn as_content(&self) -> OutgoingContent {
        match self.verification_flow_id.as_ref() {
            FlowId::ToDevice(s) => AnyToDeviceEventContent::KeyVerificationCancel(
                ToDeviceKeyVerificationCancelEventContent::new(
                    s.clone(),
                    self.state.reason.to_owned(),
                    self.state.cancel_code.clone(),
                ),
            )
            .into(),
            FlowId::InRoom(r, e) => (
                r.clone(),
                AnyMessageLikeEventContent::KeyVerificationCancel(
                    KeyVerificationCancelEventContent::new(
                        self.state.reason.to_owned(),
                        self.state.cancel_code.clone(),
                        Reference::new(e.clone()),
                    ),
                ),
            )
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use ruma::{
        device_id,
        events::key::verification::{
            accept::AcceptMethod, cancel::CancelCode, ShortAuthenticationString,
        },
        user_id, DeviceId, TransactionId, UserId,
    };
    use vodozemac::{Curve25519PublicKey, Ed25519SecretKey};

    use super::{Accepted, Created, SasState, Started};
    use crate::{
        channel::FlowId,
        event_enums::{AcceptContent, KeyContent, MacContent, OutgoingContent, OwnedAcceptContent},
        store::{DeviceData, OwnAccount},
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

    fn accept_content(content: &OwnedAcceptContent) -> AcceptContent<'_> {
        match content {
            OwnedAcceptContent::ToDevice(c) => AcceptContent::from(c),
            OwnedAcceptContent::Room(_, c) => AcceptContent::from(c),
        }
    }

    fn key_content(content: &OutgoingContent) -> KeyContent<'_> {
        KeyContent::try_from(content).unwrap()
    }

    fn get_sas_pair() -> (SasState<Created>, SasState<Started>) {
        let (alice, alice_device) = account_and_device(alice_id(), alice_device_id());
        let (bob, bob_device) = account_and_device(bob_id(), bob_device_id());

        let flow_id = FlowId::ToDevice(TransactionId::new());
        let alice_sas =
            SasState::<Created>::new(alice, bob_device, None, None, flow_id.clone(), false);

        let start_content = alice_sas.as_content();
        let start_content = start_content.as_start_content();

        let bob_sas = SasState::<Started>::from_start_event(
            bob,
            alice_device,
            None,
            None,
            flow_id,
            &start_content,
            false,
        );

        (alice_sas, bob_sas.unwrap())
    }

    #[test]
    fn create_sas() {
        let (_, _) = get_sas_pair();
    }

    #[test]
    fn sas_accept() {
        let (alice, bob) = get_sas_pair();

        let bob = bob.into_we_accepted(vec![
            ShortAuthenticationString::Decimal,
            ShortAuthenticationString::Emoji,
        ]);
        let content = bob.as_content();

        alice.into_accepted(bob_id(), &accept_content(&content)).unwrap();
    }

    #[test]
    fn sas_full_flow() {
        let (alice, bob) = get_sas_pair();

        let bob = bob.into_we_accepted(vec![
            ShortAuthenticationString::Decimal,
            ShortAuthenticationString::Emoji,
        ]);
        let content = bob.as_content();

        let alice: SasState<Accepted> =
            alice.into_accepted(bob_id(), &accept_content(&content)).unwrap();

        let (content, _) = alice.as_content();
        let bob = bob.into_key_received(alice_id(), &key_content(&content)).unwrap();

        let (content, _) = bob.as_content();
        let alice = alice.into_key_received(bob_id(), &key_content(&content)).unwrap();

        let request_id = alice.state.request_id.clone();
        let alice = alice.into_keys_exchanged(&request_id).unwrap();
        let request_id = bob.state.request_id.clone();
        let bob = bob.into_keys_exchanged(&request_id).unwrap();

        assert_eq!(alice.get_decimal(), bob.get_decimal());
        assert_eq!(alice.get_emoji(), bob.get_emoji());
        assert_eq!(alice.get_emoji_index(), bob.get_emoji_index());

        let bob = bob.confirm();
        let content = bob.as_content();
        let content = MacContent::try_from(&content).unwrap();

        let alice = alice.into_mac_received(bob_id(), &content).unwrap();
        let alice = alice.confirm();
        let content = alice.as_content();
        let content = MacContent::try_from(&content).unwrap();
        let bob = bob.into_done(alice_id(), &content).unwrap();

        assert!(bob.verified_devices().contains(&bob.other_device()));
        assert!(alice.verified_devices().contains(&alice.other_device()));
    }

    #[test]
    fn sas_mismatched_commitment() {
        let (alice, bob) = get_sas_pair();

        let bob = bob.into_we_accepted(vec![ShortAuthenticationString::Emoji]);
        let mut content = bob.as_content();

        match &mut content {
            OwnedAcceptContent::ToDevice(c) => match &mut c.method {
                AcceptMethod::SasV1(c) => {
                    c.commitment = ruma::serde::Base64::new(b"fake commitment".to_vec());
                }
                _ => panic!("Unexpected accept method"),
            },
            OwnedAcceptContent::Room(..) => panic!("Unexpected in-room accept content"),
        }

        let alice: SasState<Accepted> =
            alice.into_accepted(bob_id(), &accept_content(&content)).unwrap();

        let (content, _) = alice.as_content();
        let bob = bob.into_key_received(alice_id(), &key_content(&content)).unwrap();

        let (content, _) = bob.as_content();
        let cancelled = alice
            .into_key_received(bob_id(), &key_content(&content))
            .expect_err("The commitment didn't match");

        assert_eq!(cancelled.state.cancel_code, CancelCode::MismatchedCommitment);
        assert!(cancelled.state.cancelled_by_us);
    }

    #[test]
    fn sas_invalid_sender() {
        let (alice, bob) = get_sas_pair();

        let bob = bob.into_we_accepted(vec![ShortAuthenticationString::Emoji]);
        let content = bob.as_content();

        let cancelled = alice
            .into_accepted(user_id!("@malory:example.org"), &accept_content(&content))
            .expect_err("Didn't cancel on a sender mismatch");

        assert_eq!(cancelled.state.cancel_code, CancelCode::UserMismatch);
    }

    #[test]
    #[allow(clippy::unchecked_duration_subtraction)]
    fn sas_timeout() {
        let (mut alice, bob) = get_sas_pair();

        let bob = bob.into_we_accepted(vec![ShortAuthenticationString::Emoji]);
        let content = bob.as_content();

        alice.set_creation_time(Instant::now() - Duration::from_secs(600));
        assert!(alice.timed_out());

        let cancelled = alice
            .into_accepted(bob_id(), &accept_content(&content))
            .expect_err("Didn't cancel on a timeout");

        assert_eq!(cancelled.state.cancel_code, CancelCode::Timeout);
    }
}
