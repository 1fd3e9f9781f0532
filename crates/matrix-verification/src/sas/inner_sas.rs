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

#[cfg(test)]
use std::time::Instant;

use as_variant::as_variant;
use ruma::{
    events::key::verification::{cancel::CancelCode, ShortAuthenticationString},
    TransactionId, UserId,
};
use tracing::trace;

use super::sas_state::{
    Accepted, AcceptedProtocols, Confirmed, Created, Done, KeyReceived, KeySent, KeysExchanged,
    MacReceived, SasState, Started, WaitingForDone, WeAccepted,
};
use crate::{
    cache::RequestInfo,
    channel::FlowId,
    event_enums::{
        AcceptContent, AnyVerificationContent, DoneContent, KeyContent, MacContent,
        OutgoingContent, OwnedAcceptContent, StartContent,
    },
    store::{DeviceData, OwnAccount, UserIdentityData},
    Cancelled, Emoji,
};

/// Apply `$body` to the typestate held by any of the variants.
///
/// Only usable for operations the generic `SasState<S>` impl provides, or for
/// fields every state shares.
macro_rules! with_state {
    ($sas:expr, $state:ident => $body:expr) => {
        match $sas {
            InnerSas::Created($state) => $body,
            InnerSas::Started($state) => $body,
            InnerSas::WeAccepted($state) => $body,
            InnerSas::Accepted($state) => $body,
            InnerSas::KeySent($state) => $body,
            InnerSas::KeyReceived($state) => $body,
            InnerSas::KeysExchanged($state) => $body,
            InnerSas::Confirmed($state) => $body,
            InnerSas::MacReceived($state) => $body,
            InnerSas::WaitingForDone($state) => $body,
            InnerSas::Done($state) => $body,
            InnerSas::Cancelled($state) => $body,
        }
    };
}

/// The type-erased SAS state machine.
///
/// Each variant wraps the matching [`SasState`] typestate so a single value
/// can be stored behind the observable in [`Sas`](super::Sas). Transitions
/// consume the old value and produce a new one together with any content that
/// needs to go out.
#[derive(Clone, Debug)]
pub enum InnerSas {
    Created(SasState<Created>),
    Started(SasState<Started>),
    Accepted(SasState<Accepted>),
    WeAccepted(SasState<WeAccepted>),
    KeyReceived(SasState<KeyReceived>),
    KeySent(SasState<KeySent>),
    KeysExchanged(SasState<KeysExchanged>),
    Confirmed(SasState<Confirmed>),
    MacReceived(SasState<MacReceived>),
    WaitingForDone(SasState<WaitingForDone>),
    Done(SasState<Done>),
    Cancelled(SasState<Cancelled>),
}

impl InnerSas {
    pub fn start(
        account: OwnAccount,
        other_device: DeviceData,
        own_identity: Option<UserIdentityData>,
        other_identity: Option<UserIdentityData>,
        transaction_id: FlowId,
        started_from_request: bool,
    ) -> (InnerSas, OutgoingContent) {
        let state = SasState::<Created>::new(
            account,
            other_device,
            own_identity,
            other_identity,
            transaction_id,
            started_from_request,
        );
        let start_content = state.as_content();

        (InnerSas::Created(state), start_content.into())
    }

    pub fn from_start_event(
        account: OwnAccount,
        other_device: DeviceData,
        flow_id: FlowId,
        content: &StartContent<'_>,
        own_identity: Option<UserIdentityData>,
        other_identity: Option<UserIdentityData>,
        started_from_request: bool,
    ) -> Result<InnerSas, OutgoingContent> {
        SasState::<Started>::from_start_event(
            account,
            other_device,
            own_identity,
            other_identity,
            flow_id,
            content,
            started_from_request,
        )
        .map(InnerSas::Started)
        .map_err(|cancelled| cancelled.as_content())
    }

    pub fn started_from_request(&self) -> bool {
        with_state!(self, s => s.started_from_request)
    }

    pub fn has_been_accepted(&self) -> bool {
        !matches!(self, InnerSas::Created(_) | InnerSas::Started(_) | InnerSas::Cancelled(_))
    }

    fn accepted_protocols(&self) -> Option<&AcceptedProtocols> {
        let protocols = match self {
            InnerSas::Started(s) => &s.state.accepted_protocols,
            InnerSas::WeAccepted(s) => &s.state.accepted_protocols,
            InnerSas::Accepted(s) => &s.state.accepted_protocols,
            InnerSas::KeySent(s) => &s.state.accepted_protocols,
            InnerSas::KeyReceived(s) => &s.state.accepted_protocols,
            InnerSas::KeysExchanged(s) => &s.state.accepted_protocols,
            InnerSas::MacReceived(s) => &s.state.accepted_protocols,
            InnerSas::Created(_)
            | InnerSas::Confirmed(_)
            | InnerSas::WaitingForDone(_)
            | InnerSas::Done(_)
            | InnerSas::Cancelled(_) => return None,
        };

        Some(protocols.as_ref())
    }

    pub fn supports_emoji(&self) -> bool {
        self.accepted_protocols().is_some_and(|protocols| {
            protocols.short_auth_string.contains(&ShortAuthenticationString::Emoji)
        })
    }

    pub fn accept(
        self,
        methods: Vec<ShortAuthenticationString>,
    ) -> Option<(InnerSas, OwnedAcceptContent)> {
        let InnerSas::Started(started) = self else { return None };

        let accepted = started.into_we_accepted(methods);
        let content = accepted.as_content();

        trace!(
            flow_id = accepted.verification_flow_id.as_str(),
            accepted_protocols = ?accepted.state.accepted_protocols,
            "Accepted a SAS verification"
        );

        Some((InnerSas::WeAccepted(accepted), content))
    }

    pub fn cancel(
        self,
        cancelled_by_us: bool,
        code: CancelCode,
    ) -> (InnerSas, Option<OutgoingContent>) {
        // Terminal states stay as they are.
        if matches!(self, InnerSas::Done(_) | InnerSas::Cancelled(_)) {
            return (self, None);
        }

        let cancelled = with_state!(self, s => s.cancel(cancelled_by_us, code));
        let content = cancelled.as_content();

        (InnerSas::Cancelled(cancelled), Some(content))
    }

    pub fn confirm(self) -> (InnerSas, Vec<OutgoingContent>) {
        match self {
            InnerSas::KeysExchanged(s) => {
                // We're the first to confirm, only our MAC goes out.
                let confirmed = s.confirm();
                let mac = confirmed.as_content();
                (InnerSas::Confirmed(confirmed), vec![mac])
            }
            InnerSas::MacReceived(s) if s.started_from_request => {
                let mac = s.as_content();
                let waiting = s.confirm_and_wait_for_done();
                let contents = vec![mac, waiting.done_content()];
                (InnerSas::WaitingForDone(waiting), contents)
            }
            InnerSas::MacReceived(s) => {
                let mac = s.as_content();
                let done = s.confirm();
                (InnerSas::Done(done), vec![mac])
            }
            _ => (self, Vec::new()),
        }
    }

    fn receive_accept(
        self,
        sender: &UserId,
        content: &AcceptContent<'_>,
    ) -> (Self, Option<(OutgoingContent, Option<RequestInfo>)>) {
        let InnerSas::Created(created) = self else { return (self, None) };

        match created.into_accepted(sender, content) {
            Ok(accepted) => {
                let (key_content, request_info) = accepted.as_content();
                (InnerSas::Accepted(accepted), Some((key_content, Some(request_info))))
            }
            Err(cancelled) => Self::cancellation(cancelled),
        }
    }

    fn receive_key(
        self,
        sender: &UserId,
        content: &KeyContent<'_>,
    ) -> (Self, Option<(OutgoingContent, Option<RequestInfo>)>) {
        match self {
            // They accepted our start and sent their key first, we reply with
            // ours.
            InnerSas::WeAccepted(s) => match s.into_key_received(sender, content) {
                Ok(key_received) => {
                    let (key_content, request_info) = key_received.as_content();
                    (InnerSas::KeyReceived(key_received), Some((key_content, Some(request_info))))
                }
                Err(cancelled) => Self::cancellation(cancelled),
            },
            // We started and already sent our key with the accept roundtrip,
            // nothing further goes out.
            InnerSas::Accepted(s) => match s.into_key_received(sender, content) {
                Ok(key_received) => (InnerSas::KeyReceived(key_received), None),
                Err(cancelled) => Self::cancellation(cancelled),
            },
            InnerSas::KeySent(s) => match s.into_keys_exchanged(sender, content) {
                Ok(exchanged) => (InnerSas::KeysExchanged(exchanged), None),
                Err(cancelled) => Self::cancellation(cancelled),
            },
            _ => (self, None),
        }
    }

    fn receive_mac(
        self,
        sender: &UserId,
        content: &MacContent<'_>,
    ) -> (Self, Option<(OutgoingContent, Option<RequestInfo>)>) {
        match self {
            InnerSas::KeysExchanged(s) => match s.into_mac_received(sender, content) {
                Ok(mac_received) => (InnerSas::MacReceived(mac_received), None),
                Err(cancelled) => Self::cancellation(cancelled),
            },
            InnerSas::Confirmed(s) if s.started_from_request => {
                match s.into_waiting_for_done(sender, content) {
                    Ok(waiting) => {
                        let done = waiting.done_content();
                        (InnerSas::WaitingForDone(waiting), Some((done, None)))
                    }
                    Err(cancelled) => Self::cancellation(cancelled),
                }
            }
            InnerSas::Confirmed(s) => match s.into_done(sender, content) {
                Ok(done) => (InnerSas::Done(done), None),
                Err(cancelled) => Self::cancellation(cancelled),
            },
            _ => (self, None),
        }
    }

    fn receive_done(
        self,
        sender: &UserId,
        content: &DoneContent<'_>,
    ) -> (Self, Option<(OutgoingContent, Option<RequestInfo>)>) {
        let InnerSas::WaitingForDone(waiting) = self else { return (self, None) };

        match waiting.into_done(sender, content) {
            Ok(done) => (InnerSas::Done(done), None),
            Err(cancelled) => Self::cancellation(cancelled),
        }
    }

    fn cancellation(
        state: SasState<Cancelled>,
    ) -> (Self, Option<(OutgoingContent, Option<RequestInfo>)>) {
        let content = state.as_content();
        (InnerSas::Cancelled(state), Some((content, None)))
    }

    pub fn receive_any_event(
        self,
        sender: &UserId,
        content: &AnyVerificationContent<'_>,
    ) -> (Self, Option<(OutgoingContent, Option<RequestInfo>)>) {
        match content {
            AnyVerificationContent::Accept(c) => self.receive_accept(sender, c),
            AnyVerificationContent::Key(c) => self.receive_key(sender, c),
            AnyVerificationContent::Mac(c) => self.receive_mac(sender, c),
            AnyVerificationContent::Done(c) => self.receive_done(sender, c),
            AnyVerificationContent::Cancel(c) => {
                let (cancelled, _) = self.cancel(false, c.cancel_code().to_owned());
                (cancelled, None)
            }
            AnyVerificationContent::Request(_)
            | AnyVerificationContent::Ready(_)
            | AnyVerificationContent::Start(_) => (self, None),
        }
    }

    pub fn mark_request_as_sent(self, request_id: &TransactionId) -> Option<Self> {
        match self {
            InnerSas::Accepted(s) => s.into_key_sent(request_id).map(InnerSas::KeySent),
            InnerSas::KeyReceived(s) => {
                s.into_keys_exchanged(request_id).map(InnerSas::KeysExchanged)
            }
            other => Some(other),
        }
    }

    #[cfg(test)]
    pub fn set_creation_time(&mut self, time: Instant) {
        with_state!(self, s => s.set_creation_time(time))
    }

    pub fn timed_out(&self) -> bool {
        with_state!(self, s => s.timed_out())
    }

    pub fn can_be_presented(&self) -> bool {
        matches!(self, InnerSas::KeysExchanged(_) | InnerSas::MacReceived(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, InnerSas::Done(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InnerSas::Cancelled(_))
    }

    pub fn have_we_confirmed(&self) -> bool {
        matches!(self, InnerSas::Confirmed(_) | InnerSas::WaitingForDone(_) | InnerSas::Done(_))
    }

    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        match self {
            InnerSas::KeysExchanged(s) => Some(s.get_emoji()),
            InnerSas::MacReceived(s) => Some(s.get_emoji()),
            _ => None,
        }
    }

    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        match self {
            InnerSas::KeysExchanged(s) => Some(s.get_emoji_index()),
            InnerSas::MacReceived(s) => Some(s.get_emoji_index()),
            _ => None,
        }
    }

    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        match self {
            InnerSas::KeysExchanged(s) => Some(s.get_decimal()),
            InnerSas::MacReceived(s) => Some(s.get_decimal()),
            _ => None,
        }
    }

    pub fn verified_devices(&self) -> Option<Arc<[DeviceData]>> {
        as_variant!(self, InnerSas::Done).map(|s| s.verified_devices())
    }

    pub fn verified_identities(&self) -> Option<Arc<[UserIdentityData]>> {
        as_variant!(self, InnerSas::Done).map(|s| s.verified_identities())
    }
}
