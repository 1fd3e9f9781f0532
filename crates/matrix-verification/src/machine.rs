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
    collections::HashMap,
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{
    events::{
        key::verification::VerificationMethod, AnyToDeviceEvent, AnyToDeviceEventContent,
        ToDeviceEvent,
    },
    serde::Raw,
    uint, DeviceId, EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, RoomId,
    SecondsSinceUnixEpoch, TransactionId, UInt, UserId,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    cache::{RequestInfo, VerificationCache},
    channel::FlowId,
    event_enums::{
        AnyEvent, AnyVerificationContent, CancelContent, DoneContent, OutgoingContent,
        RequestContent, StartContent,
    },
    outgoing::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest},
    requests::VerificationRequest,
    sas::Sas,
    store::{DeviceData, VerificationStore},
    Verification,
};

fn warn_flow_id_mismatch(flow_id: &FlowId) {
    warn!(
        flow_id = flow_id.as_str(),
        "Received a verification event with a mismatched flow id, \
         the verification object was created for a in-room \
         verification but a event was received over to-device \
         messaging or vice versa"
    );
}

/// The per-account registry of verification flows.
///
/// Events for every flow we take part in are funneled through
/// [`receive_any_event()`], replies the flows produce are queued up and can be
/// fetched with [`outgoing_messages()`].
///
/// [`receive_any_event()`]: #method.receive_any_event
/// [`outgoing_messages()`]: #method.outgoing_messages
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    pub(crate) store: VerificationStore,
    verifications: VerificationCache,
    requests: Arc<StdRwLock<HashMap<OwnedUserId, HashMap<String, VerificationRequest>>>>,
}

impl VerificationMachine {
    /// Create a new verification machine reading keys from the given store.
    pub fn new(store: VerificationStore) -> Self {
        Self { store, verifications: VerificationCache::new(), requests: Default::default() }
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.store.account.user_id
    }

    /// Our own device id.
    pub fn own_device_id(&self) -> &DeviceId {
        &self.store.account.device_id
    }

    /// The store this machine reads device and identity keys from.
    pub fn store(&self) -> &VerificationStore {
        &self.store
    }

    /// Request a verification to be done with another user's device, or one
    /// of our own devices, over to-device messages.
    ///
    /// An empty `recipient_devices` list addresses all of the user's devices.
    pub fn request_to_device_verification(
        &self,
        user_id: &UserId,
        recipient_devices: Vec<OwnedDeviceId>,
        methods: Option<Vec<VerificationMethod>>,
    ) -> (VerificationRequest, OutgoingVerificationRequest) {
        let flow_id = FlowId::from(TransactionId::new());

        let verification = VerificationRequest::new(
            self.verifications.clone(),
            self.store.clone(),
            flow_id,
            user_id,
            recipient_devices,
            methods,
        );

        self.insert_request(verification.clone());

        let request = verification.request_to_device();

        (verification, request.into())
    }

    /// Create a verification request object for a request that was already
    /// sent out as an in-room message.
    ///
    /// The content of the message is created with
    /// [`VerificationRequest::request()`], `request_event_id` is the event id
    /// the message got once it was sent.
    pub fn request_verification(
        &self,
        other_user_id: &UserId,
        room_id: &RoomId,
        request_event_id: &EventId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> VerificationRequest {
        let flow_id = FlowId::InRoom(room_id.to_owned(), request_event_id.to_owned());

        let request = VerificationRequest::new(
            self.verifications.clone(),
            self.store.clone(),
            flow_id,
            other_user_id,
            vec![],
            methods,
        );

        self.insert_request(request.clone());

        request
    }

    /// Start a SAS verification with the given device directly, skipping the
    /// request handshake.
    pub fn start_sas(&self, device: DeviceData) -> (Sas, OutgoingVerificationRequest) {
        let identities = self.store.get_identities(device.clone());
        let (sas, content) = Sas::start(identities, TransactionId::new(), true, None);

        let request = match content {
            OutgoingContent::Room(room_id, content) => {
                RoomMessageRequest { room_id, txn_id: TransactionId::new(), content }.into()
            }
            OutgoingContent::ToDevice(content) => {
                let request = ToDeviceRequest::with_id(
                    device.user_id(),
                    device.device_id().to_owned(),
                    &content,
                    TransactionId::new(),
                );

                self.verifications.insert_sas(sas.clone());

                request.into()
            }
        };

        (sas, request)
    }

    /// Get the verification request that is happening with the given user,
    /// identified by the given flow id.
    pub fn get_request(
        &self,
        user_id: &UserId,
        flow_id: impl AsRef<str>,
    ) -> Option<VerificationRequest> {
        self.requests.read().unwrap().get(user_id)?.get(flow_id.as_ref()).cloned()
    }

    /// Get all the verification requests that are happening with the given
    /// user.
    pub fn get_requests(&self, user_id: &UserId) -> Vec<VerificationRequest> {
        self.requests
            .read()
            .unwrap()
            .get(user_id)
            .map(|v| v.iter().map(|(_, value)| value.clone()).collect())
            .unwrap_or_default()
    }

    /// Add a new `VerificationRequest` object to the registry.
    ///
    /// If there are any existing requests with this user (and different
    /// flow_id), both the existing and new request will be cancelled.
    fn insert_request(&self, request: VerificationRequest) {
        if let Some(r) = self.get_request(request.other_user(), request.flow_id().as_str()) {
            debug!(flow_id = r.flow_id().as_str(), "Ignoring known verification request");
            return;
        }

        let mut requests = self.requests.write().unwrap();
        let user_requests = requests.entry(request.other_user().to_owned()).or_default();

        // Cancel all the old verification requests as well as the new one we
        // have for this user if someone tries to have two verifications going
        // on at once.
        for old_verification in user_requests.values_mut() {
            if !old_verification.is_cancelled() {
                warn!(
                    "Received a new verification request whilst another request \
                    with the same user is ongoing. Cancelling both requests."
                );

                if let Some(r) = old_verification.cancel() {
                    self.verifications.add_request(r)
                }

                if let Some(r) = request.cancel() {
                    self.verifications.add_request(r)
                }
            }
        }

        // We still want to add the new verification request, in case users
        // want to inspect the verification object a matching
        // `m.key.verification.request` produced.
        user_requests.insert(request.flow_id().as_str().to_owned(), request);
    }

    /// Get the verification flow that is happening with the given user,
    /// identified by the given flow id.
    pub fn get_verification(&self, user_id: &UserId, flow_id: &str) -> Option<Verification> {
        self.verifications.get(user_id, flow_id)
    }

    /// Get the SAS verification flow that is happening with the given user,
    /// identified by the given flow id.
    pub fn get_sas(&self, user_id: &UserId, flow_id: &str) -> Option<Sas> {
        self.verifications.get_sas(user_id, flow_id)
    }

    fn is_timestamp_valid(timestamp: MilliSecondsSinceUnixEpoch) -> bool {
        // The event should be ignored if the event is older than 10 minutes
        let old_timestamp_threshold: UInt = uint!(600);
        // The event should be ignored if the event is 5 minutes or more into
        // the future.
        let timestamp_threshold: UInt = uint!(300);

        let timestamp = timestamp.as_secs();
        let now = SecondsSinceUnixEpoch::now().get();

        !(now.saturating_sub(timestamp) > old_timestamp_threshold
            || timestamp.saturating_sub(now) > timestamp_threshold)
    }

    fn queue_up_content(
        &self,
        recipient: &UserId,
        recipient_device: &DeviceId,
        content: OutgoingContent,
        request_info: Option<RequestInfo>,
    ) {
        self.verifications.queue_up_content(recipient, recipient_device, content, request_info)
    }

    /// Mark an outgoing request as sent, advancing the flow that queued it
    /// up.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) {
        self.verifications.mark_request_as_sent(request_id);
    }

    /// All the queued up requests that need to be sent out.
    pub fn outgoing_messages(&self) -> Vec<OutgoingVerificationRequest> {
        self.verifications.outgoing_requests()
    }

    /// Drop terminal flows from the registry and cancel the ones that have
    /// timed out.
    ///
    /// The returned events mirror the cancellations the timeouts produced, so
    /// local listeners can observe them the same way they observe remote
    /// cancellations.
    pub fn garbage_collect(&self) -> Vec<Raw<AnyToDeviceEvent>> {
        let mut events = vec![];

        let mut requests: Vec<OutgoingVerificationRequest> = {
            let mut requests = self.requests.write().unwrap();

            for user_verification in requests.values_mut() {
                user_verification.retain(|_, v| !(v.is_done() || v.is_cancelled()));
            }
            requests.retain(|_, v| !v.is_empty());

            requests.values().flatten().filter_map(|(_, v)| v.cancel_if_timed_out()).collect()
        };

        requests.extend(self.verifications.garbage_collect());

        for request in requests {
            if let Ok(OutgoingContent::ToDevice(AnyToDeviceEventContent::KeyVerificationCancel(
                content,
            ))) = OutgoingContent::try_from(&request)
            {
                let event = ToDeviceEvent::new(self.own_user_id().to_owned(), content);

                events.push(
                    Raw::new(&event)
                        .expect("Failed to serialize m.key_verification.cancel event")
                        .cast(),
                );
            }

            self.verifications.add_request(request)
        }

        events
    }

    /// Receive a verification event and advance the flow it belongs to.
    ///
    /// Events that don't belong to any flow, that have a mismatched flow id,
    /// or that were sent by us are ignored.
    #[instrument(skip_all)]
    pub fn receive_any_event<'a>(&self, event: impl Into<AnyEvent<'a>>) {
        let event = event.into();

        let Ok(flow_id) = FlowId::try_from(&event) else {
            // Not a verification event.
            return;
        };

        let Some(sender) = event.sender() else {
            return;
        };

        let Some(content) = event.verification_content() else { return };

        match &content {
            AnyVerificationContent::Request(r) => {
                self.receive_request_content(&event, sender, flow_id, r)
            }
            AnyVerificationContent::Cancel(c) => {
                self.receive_cancel_content(sender, &flow_id, &content, c)
            }
            AnyVerificationContent::Ready(c) => {
                let Some(request) = self.get_request(sender, flow_id.as_str()) else {
                    return;
                };

                if request.flow_id() == &flow_id {
                    request.receive_ready(sender, c);
                } else {
                    warn_flow_id_mismatch(&flow_id);
                }
            }
            AnyVerificationContent::Start(c) => self.receive_start_content(sender, flow_id, c),
            AnyVerificationContent::Accept(_)
            | AnyVerificationContent::Key(_)
            | AnyVerificationContent::Mac(_) => self.receive_sas_content(sender, &flow_id, &content),
            AnyVerificationContent::Done(c) => {
                self.receive_done_content(sender, &flow_id, &content, c)
            }
        }
    }

    fn receive_request_content(
        &self,
        event: &AnyEvent<'_>,
        sender: &UserId,
        flow_id: FlowId,
        content: &RequestContent<'_>,
    ) {
        info!(from_device = content.from_device().as_str(), "Received a new verification request");

        let Some(timestamp) = event.timestamp() else {
            warn!(
                from_device = content.from_device().as_str(),
                "The key verification request didn't contain a valid timestamp"
            );
            return;
        };

        if !Self::is_timestamp_valid(timestamp) {
            trace!(
                from_device = content.from_device().as_str(),
                ?timestamp,
                "The received verification request was too old or too far into the future",
            );
            return;
        }

        let sent_from_us = sender == self.store.account.user_id
            && (content.from_device() == self.store.account.device_id || event.is_room_event());

        if sent_from_us {
            trace!(
                from_device = content.from_device().as_str(),
                "The received verification request was sent by us, ignoring it",
            );
            return;
        }

        let request = VerificationRequest::from_request(
            self.verifications.clone(),
            self.store.clone(),
            sender,
            flow_id,
            content,
            timestamp,
        );

        self.insert_request(request);
    }

    fn receive_cancel_content(
        &self,
        sender: &UserId,
        flow_id: &FlowId,
        content: &AnyVerificationContent<'_>,
        cancel_content: &CancelContent<'_>,
    ) {
        if let Some(request) = self.get_request(sender, flow_id.as_str()) {
            request.receive_cancel(sender, cancel_content);
        }

        match self.get_verification(sender, flow_id.as_str()) {
            Some(Verification::SasV1(sas)) => {
                // A cancellation never produces outgoing content.
                let _ = sas.receive_any_event(sender, content);
            }
            Some(Verification::QrV1(qr)) => qr.receive_cancel(sender, cancel_content),
            None => {}
        }
    }

    fn receive_start_content(&self, sender: &UserId, flow_id: FlowId, content: &StartContent<'_>) {
        if let Some(request) = self.get_request(sender, flow_id.as_str()) {
            if request.flow_id() == &flow_id {
                request.receive_start(sender, content)
            } else {
                warn_flow_id_mismatch(&flow_id);
            }
        } else if let FlowId::ToDevice(_) = flow_id {
            // A start event without a preceding request, the deprecated way
            // of beginning a to-device verification.
            let Some(device) = self.store.get_device(sender, content.from_device()) else {
                return;
            };

            let identities = self.store.get_identities(device);

            match Sas::from_start_event(flow_id, content, identities, None, false) {
                Ok(sas) => {
                    self.verifications.insert_sas(sas);
                }
                Err(cancellation) => {
                    self.queue_up_content(sender, content.from_device(), cancellation, None)
                }
            }
        }
    }

    fn receive_sas_content(
        &self,
        sender: &UserId,
        flow_id: &FlowId,
        content: &AnyVerificationContent<'_>,
    ) {
        let Some(sas) = self.get_sas(sender, flow_id.as_str()) else {
            return;
        };

        if sas.flow_id() != flow_id {
            warn_flow_id_mismatch(flow_id);
            return;
        }

        // Even when the event makes the flow done there may be content to
        // send out, e.g. our own MAC if we had already confirmed, or the
        // closing done event.
        let Some((content, request_info)) = sas.receive_any_event(sender, content) else {
            return;
        };

        self.queue_up_content(sas.other_user_id(), sas.other_device_id(), content, request_info);
    }

    fn receive_done_content(
        &self,
        sender: &UserId,
        flow_id: &FlowId,
        content: &AnyVerificationContent<'_>,
        done_content: &DoneContent<'_>,
    ) {
        if let Some(request) = self.get_request(sender, flow_id.as_str()) {
            request.receive_done(sender, done_content);
        }

        match self.get_verification(sender, flow_id.as_str()) {
            Some(Verification::SasV1(sas)) => {
                if let Some((content, request_info)) = sas.receive_any_event(sender, content) {
                    self.queue_up_content(
                        sas.other_user_id(),
                        sas.other_device_id(),
                        content,
                        request_info,
                    );
                }
            }
            Some(Verification::QrV1(qr)) => {
                if let Some(request) = qr.receive_done(done_content) {
                    self.verifications.add_request(request);
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceId, MilliSecondsSinceUnixEpoch, TransactionId, UserId};
    use vodozemac::{Curve25519PublicKey, Ed25519SecretKey};

    use super::VerificationMachine;
    use crate::{
        cache::VerificationCache,
        channel::FlowId,
        event_enums::{AcceptContent, KeyContent, MacContent, OutgoingContent},
        requests::VerificationRequest,
        sas::Sas,
        store::{DeviceData, OwnAccount, VerificationStore},
        tests::wrap_any_to_device_content,
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

    fn verification_machine() -> (VerificationMachine, VerificationStore) {
        let (alice_account, alice_device) = account_and_device(alice_id(), alice_device_id());
        let (bob_account, bob_device) = account_and_device(bob_id(), bob_device_id());

        let alice_store = VerificationStore::new(alice_account);
        alice_store.add_device(bob_device);

        let bob_store = VerificationStore::new(bob_account);
        bob_store.add_device(alice_device);

        let machine = VerificationMachine::new(alice_store);

        (machine, bob_store)
    }

    fn setup_verification_machine() -> (VerificationMachine, Sas) {
        let (machine, bob_store) = verification_machine();

        let alice_device = bob_store.get_device(alice_id(), alice_device_id()).unwrap();

        let identities = bob_store.get_identities(alice_device);
        let (bob_sas, start_content) = Sas::start(identities, TransactionId::new(), true, None);

        machine.receive_any_event(&wrap_any_to_device_content(bob_sas.user_id(), start_content));

        (machine, bob_sas)
    }

    #[test]
    fn create() {
        let (alice_account, _) = account_and_device(alice_id(), alice_device_id());
        let _ = VerificationMachine::new(VerificationStore::new(alice_account));
    }

    #[test]
    fn full_flow() {
        let (alice_machine, bob) = setup_verification_machine();

        let alice = alice_machine.get_sas(bob.user_id(), bob.flow_id().as_str()).unwrap();

        let request = alice.accept().unwrap();

        let content = OutgoingContent::try_from(&request).unwrap();
        let content = AcceptContent::try_from(&content).unwrap().into();

        let (content, request_info) = bob.receive_any_event(alice.user_id(), &content).unwrap();

        let event = wrap_any_to_device_content(bob.user_id(), content);

        assert!(alice_machine.verifications.outgoing_requests().is_empty());
        alice_machine.receive_any_event(&event);
        assert!(!alice_machine.verifications.outgoing_requests().is_empty());

        let request = alice_machine.verifications.outgoing_requests().first().cloned().unwrap();
        let txn_id = request.request_id().to_owned();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = KeyContent::try_from(&content).unwrap().into();

        alice_machine.mark_request_as_sent(&txn_id);

        assert!(bob.receive_any_event(alice.user_id(), &content).is_none());

        assert!(alice.emoji().is_some());
        // Bob can only show the emoji if it marks the request carrying the
        // m.key.verification.key event as sent.
        assert!(bob.emoji().is_none());
        bob.mark_request_as_sent(&request_info.unwrap().request_id);
        assert!(bob.emoji().is_some());
        assert_eq!(alice.emoji(), bob.emoji());

        let mut requests = alice.confirm();
        assert!(requests.len() == 1);
        let request = requests.pop().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = MacContent::try_from(&content).unwrap().into();
        bob.receive_any_event(alice.user_id(), &content);

        let mut requests = bob.confirm();
        assert!(requests.len() == 1);
        let request = requests.pop().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = MacContent::try_from(&content).unwrap().into();
        alice.receive_any_event(bob.user_id(), &content);

        assert!(alice.is_done());
        assert!(bob.is_done());
    }

    #[test]
    #[allow(unknown_lints, clippy::unchecked_duration_subtraction)]
    fn timing_out() {
        use std::time::{Duration, Instant};

        let (alice_machine, bob) = setup_verification_machine();
        let alice = alice_machine.get_sas(bob.user_id(), bob.flow_id().as_str()).unwrap();

        assert!(!alice.timed_out());
        assert!(alice_machine.verifications.outgoing_requests().is_empty());

        alice.set_creation_time(Instant::now() - Duration::from_secs(60 * 15));
        assert!(alice.timed_out());
        assert!(alice_machine.verifications.outgoing_requests().is_empty());
        alice_machine.garbage_collect();
        assert!(!alice_machine.verifications.outgoing_requests().is_empty());
        alice_machine.garbage_collect();
        assert!(alice_machine.verifications.is_empty());
    }

    /// Test to ensure that we cancel both verifications if a second one gets
    /// started while another one is going on.
    #[test]
    fn double_verification_cancellation() {
        let (machine, bob_store) = verification_machine();

        let alice_device = bob_store.get_device(alice_id(), alice_device_id()).unwrap();
        let identities = bob_store.get_identities(alice_device);

        // Start the first sas verification.
        let (bob_sas, start_content) =
            Sas::start(identities.clone(), TransactionId::new(), true, None);

        machine.receive_any_event(&wrap_any_to_device_content(bob_sas.user_id(), start_content));

        let alice_sas = machine.get_sas(bob_sas.user_id(), bob_sas.flow_id().as_str()).unwrap();

        // We're not yet cancelled.
        assert!(!alice_sas.is_cancelled());

        let second_transaction_id = TransactionId::new();
        let (bob_sas, start_content) =
            Sas::start(identities, second_transaction_id.clone(), true, None);
        machine.receive_any_event(&wrap_any_to_device_content(bob_sas.user_id(), start_content));

        let second_sas = machine.get_sas(bob_sas.user_id(), bob_sas.flow_id().as_str()).unwrap();

        // Make sure we fetched the new one.
        assert_eq!(second_sas.flow_id().as_str(), second_transaction_id);

        // Make sure both of them are cancelled.
        assert!(alice_sas.is_cancelled());
        assert!(second_sas.is_cancelled());
    }

    /// Test to ensure that we cancel both verification requests if a second
    /// one gets started while another one is going on.
    #[test]
    fn double_verification_request_cancellation() {
        let (machine, bob_store) = verification_machine();

        // Start the first verification request.
        let flow_id = FlowId::ToDevice("TEST_FLOW_ID".into());

        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store.clone(),
            flow_id.clone(),
            alice_id(),
            vec![],
            None,
        );

        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();

        machine.receive_any_event(&wrap_any_to_device_content(bob_id(), content));

        let alice_request = machine.get_request(bob_id(), bob_request.flow_id().as_str()).unwrap();

        // We're not yet cancelled.
        assert!(!alice_request.is_cancelled());

        let second_transaction_id = TransactionId::new();
        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store,
            second_transaction_id.clone().into(),
            alice_id(),
            vec![],
            None,
        );

        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();

        machine.receive_any_event(&wrap_any_to_device_content(bob_id(), content));

        let second_request =
            machine.get_request(bob_id(), bob_request.flow_id().as_str()).unwrap();

        // Make sure we fetched the new one.
        assert_eq!(second_request.flow_id().as_str(), second_transaction_id);

        // Make sure both of them are cancelled.
        assert!(alice_request.is_cancelled());
        assert!(second_request.is_cancelled());
    }

    /// Ensure that if a duplicate request is added (i.e. matching user and
    /// flow_id) the existing request is not cancelled and the new one is
    /// ignored.
    #[test]
    fn ignore_identical_verification_request() {
        let (machine, bob_store) = verification_machine();

        // Start the first verification request.
        let flow_id = FlowId::ToDevice("TEST_FLOW_ID".into());

        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store.clone(),
            flow_id.clone(),
            alice_id(),
            vec![],
            None,
        );

        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();

        machine.receive_any_event(&wrap_any_to_device_content(bob_id(), content));

        let first_request = machine.get_request(bob_id(), bob_request.flow_id().as_str()).unwrap();

        // We're not yet cancelled.
        assert!(!first_request.is_cancelled());

        // Bob is adding a second request with the same flow_id as before.
        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store,
            flow_id,
            alice_id(),
            vec![],
            None,
        );

        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();

        machine.receive_any_event(&wrap_any_to_device_content(bob_id(), content));

        let second_request =
            machine.get_request(bob_id(), bob_request.flow_id().as_str()).unwrap();

        // None of the requests are cancelled.
        assert!(!first_request.is_cancelled());
        assert!(!second_request.is_cancelled());
    }

    /// A request received with a wildly wrong timestamp never makes it into
    /// the registry.
    #[test]
    fn ignore_stale_verification_request() {
        let (machine, bob_store) = verification_machine();

        let flow_id = FlowId::ToDevice("TEST_FLOW_ID".into());

        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store,
            flow_id,
            alice_id(),
            vec![],
            None,
        );

        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();

        // Rewrite the timestamp to an hour ago.
        let content = if let OutgoingContent::ToDevice(
            ruma::events::AnyToDeviceEventContent::KeyVerificationRequest(mut c),
        ) = content
        {
            let now = MilliSecondsSinceUnixEpoch::now().get();
            c.timestamp = MilliSecondsSinceUnixEpoch(now.saturating_sub(ruma::uint!(3600000)));
            OutgoingContent::ToDevice(
                ruma::events::AnyToDeviceEventContent::KeyVerificationRequest(c),
            )
        } else {
            panic!("Unexpected content type");
        };

        machine.receive_any_event(&wrap_any_to_device_content(bob_id(), content));

        assert!(machine.get_request(bob_id(), bob_request.flow_id().as_str()).is_none());
    }
}
