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
    cmp::Ordering,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use as_variant::as_variant;
use matrix_verification_qrcode::QrVerificationData;
use ruma::{
    events::{
        key::verification::{
            cancel::CancelCode,
            ready::{KeyVerificationReadyEventContent, ToDeviceKeyVerificationReadyEventContent},
            request::ToDeviceKeyVerificationRequestEventContent,
            start::StartMethod,
            VerificationMethod,
        },
        relation::Reference,
        room::message::KeyVerificationRequestEventContent,
        AnyMessageLikeEventContent, AnyToDeviceEventContent,
    },
    to_device::DeviceIdOrAllDevices,
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use tracing::{info, trace, warn};

use crate::{
    cache::VerificationCache,
    channel::FlowId,
    event_enums::{
        CancelContent, DoneContent, OutgoingContent, ReadyContent, RequestContent, StartContent,
    },
    outgoing::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest},
    qrcode::{QrVerification, ScanError},
    sas::Sas,
    store::{DeviceData, OwnAccount, VerificationStore},
    CancelInfo, Cancelled, Verification,
};

const SUPPORTED_METHODS: &[VerificationMethod] = &[
    VerificationMethod::SasV1,
    VerificationMethod::QrCodeShowV1,
    VerificationMethod::ReciprocateV1,
];

/// How long a verification request we sent out stays actionable.
const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(60 * 10);

/// How long a received verification request stays actionable. Shorter than
/// the sender's window so we don't answer a request the other side has
/// already given up on.
const RECEIVED_TIMEOUT: Duration = Duration::from_secs(60 * 2);

/// The initial handshake of an interactive verification.
///
/// One side requests the verification, the other side answers with a ready
/// event, and once both are ready the flow transitions into one of the
/// concrete verification methods.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    verification_cache: VerificationCache,
    account: OwnAccount,
    flow_id: Arc<FlowId>,
    other_user_id: OwnedUserId,
    inner: Arc<Mutex<InnerRequest>>,
    creation_time: Arc<Instant>,
    timeout: Duration,
    we_started: bool,
    recipient_devices: Arc<Vec<OwnedDeviceId>>,
}

/// A backwards pointer from a verification flow to the request it branched
/// off of.
///
/// Cancelling a SAS or QR flow must also cancel its parent request; the
/// child object holds one of these to do so.
#[derive(Clone, Debug)]
pub(crate) struct RequestHandle {
    inner: Arc<Mutex<InnerRequest>>,
}

impl RequestHandle {
    pub fn cancel_with_code(&self, cancel_code: &CancelCode) {
        self.inner.lock().unwrap().cancel(true, cancel_code)
    }
}

impl From<Arc<Mutex<InnerRequest>>> for RequestHandle {
    fn from(inner: Arc<Mutex<InnerRequest>>) -> Self {
        Self { inner }
    }
}

impl VerificationRequest {
    pub(crate) fn new(
        cache: VerificationCache,
        store: VerificationStore,
        flow_id: FlowId,
        other_user: &UserId,
        recipient_devices: Vec<OwnedDeviceId>,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Self {
        let account = store.account.clone();
        let inner = Mutex::new(InnerRequest::Created(RequestState::new(
            cache.clone(),
            store,
            other_user,
            &flow_id,
            methods,
        )))
        .into();

        Self {
            account,
            verification_cache: cache,
            flow_id: flow_id.into(),
            inner,
            other_user_id: other_user.to_owned(),
            creation_time: Instant::now().into(),
            timeout: VERIFICATION_TIMEOUT,
            we_started: true,
            recipient_devices: recipient_devices.into(),
        }
    }

    pub(crate) fn from_request(
        cache: VerificationCache,
        store: VerificationStore,
        sender: &UserId,
        flow_id: FlowId,
        content: &RequestContent<'_>,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> Self {
        let account = store.account.clone();

        // The sender's clock started ticking when the event was sent, ours
        // when we saw it. Cap our window so it can't outlive theirs.
        let age = MilliSecondsSinceUnixEpoch::now().get().saturating_sub(timestamp.get());
        let age = Duration::from_millis(age.into());
        let timeout = RECEIVED_TIMEOUT.min(VERIFICATION_TIMEOUT.saturating_sub(age));

        Self {
            verification_cache: cache.clone(),
            inner: Arc::new(Mutex::new(InnerRequest::Requested(
                RequestState::from_request_event(cache, store, sender, &flow_id, content),
            ))),
            account,
            other_user_id: sender.to_owned(),
            flow_id: flow_id.into(),
            we_started: false,
            creation_time: Instant::now().into(),
            timeout,
            recipient_devices: vec![].into(),
        }
    }

    /// Build the to-device request asking the other side for verification.
    ///
    /// Used for self-verifications; the content is fanned out to the devices
    /// this request targets.
    pub(crate) fn request_to_device(&self) -> ToDeviceRequest {
        let inner = self.inner.lock().unwrap();

        let methods = as_variant!(&*inner, InnerRequest::Created(c) => c.state.our_methods.clone())
            .unwrap_or_else(|| SUPPORTED_METHODS.to_vec());

        let content = ToDeviceKeyVerificationRequestEventContent::new(
            self.account.device_id.clone(),
            self.flow_id().as_str().into(),
            methods,
            MilliSecondsSinceUnixEpoch::now(),
        );

        ToDeviceRequest::for_recipient_devices(
            self.other_user(),
            self.recipient_devices.to_vec(),
            &AnyToDeviceEventContent::KeyVerificationRequest(content),
        )
    }

    /// Build the room message content asking another user for verification.
    ///
    /// The message should be sent into a room we consider to be a DM with
    /// the other user; its body doubles as a fallback for clients without
    /// in-chat verification support.
    pub fn request(
        own_user_id: &UserId,
        own_device_id: &DeviceId,
        other_user_id: &UserId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> KeyVerificationRequestEventContent {
        KeyVerificationRequestEventContent::new(
            format!(
                "{own_user_id} is requesting to verify your key, but your client does not \
                support in-chat key verification. You will need to use legacy \
                key verification to verify keys."
            ),
            methods.unwrap_or_else(|| SUPPORTED_METHODS.to_vec()),
            own_device_id.into(),
            other_user_id.to_owned(),
        )
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.account.user_id
    }

    /// The user id of the other side.
    pub fn other_user(&self) -> &UserId {
        &self.other_user_id
    }

    /// The device id of the other side, once a single device is known.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        match &*self.inner.lock().unwrap() {
            InnerRequest::Requested(r) => Some(r.state.other_device_id.clone()),
            InnerRequest::Ready(r) => Some(r.state.other_device_id.clone()),
            _ => None,
        }
    }

    /// The room the verification happens in, for in-room flows.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self.flow_id.as_ref() {
            FlowId::ToDevice(_) => None,
            FlowId::InRoom(r, _) => Some(r),
        }
    }

    /// Why and by whom was the request cancelled, if it was.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant!(&*self.inner.lock().unwrap(), InnerRequest::Cancelled(c) => {
            c.state.clone().into()
        })
    }

    /// Was the request answered by another one of our devices.
    pub fn is_passive(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), InnerRequest::Passive(_))
    }

    /// Can a verification flow be started, i.e. did both sides exchange
    /// ready events.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), InnerRequest::Ready(_))
    }

    /// Has the request been sitting around longer than its timeout allows.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > self.timeout
    }

    /// The verification methods the other side advertised.
    ///
    /// Present once the other side requested the verification or once the
    /// request is in the ready state.
    pub fn their_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        match &*self.inner.lock().unwrap() {
            InnerRequest::Requested(r) => Some(r.state.their_methods.clone()),
            InnerRequest::Ready(r) => Some(r.state.their_methods.clone()),
            _ => None,
        }
    }

    /// The verification methods we advertised.
    ///
    /// Present once we requested the verification or once the request is in
    /// the ready state.
    pub fn our_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        match &*self.inner.lock().unwrap() {
            InnerRequest::Created(r) => Some(r.state.our_methods.clone()),
            InnerRequest::Ready(r) => Some(r.state.our_methods.clone()),
            _ => None,
        }
    }

    /// The verification methods both sides support.
    ///
    /// This is the intersection of [`our_supported_methods()`] and
    /// [`their_supported_methods()`], in our preference order. It becomes
    /// available once the request is in the ready state; the result does not
    /// depend on the order either side listed its methods in.
    ///
    /// [`our_supported_methods()`]: Self::our_supported_methods
    /// [`their_supported_methods()`]: Self::their_supported_methods
    pub fn methods(&self) -> Option<Vec<VerificationMethod>> {
        as_variant!(&*self.inner.lock().unwrap(), InnerRequest::Ready(r) => {
            r.state
                .our_methods
                .iter()
                .filter(|m| r.state.their_methods.contains(m))
                .cloned()
                .collect()
        })
    }

    /// The unique id of this verification request.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Is the request verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.own_user_id() == self.other_user()
    }

    /// Did we initiate the verification request.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Has the flow that was started with this request finished.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), InnerRequest::Done(_))
    }

    /// Has the request, or the flow started with it, been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), InnerRequest::Cancelled(_))
    }

    /// Generate a QR code another client can scan to verify us.
    ///
    /// Returns the existing `QrVerification` if one was already generated
    /// for this flow.
    pub fn generate_qr_code(&self) -> Option<QrVerification> {
        if let Some(qr) = self.verification_cache.get_qr(self.other_user(), self.flow_id().as_str())
        {
            return Some(qr);
        }

        let inner = self.inner.lock().unwrap().clone();
        inner.generate_qr_code(self.we_started, self.inner.clone().into())
    }

    /// Start a QR verification from a QR code we scanned.
    ///
    /// Returns a `ScanError` if the QR code isn't valid, `None` if the
    /// request isn't in the ready state, otherwise the `QrVerification`
    /// driving the remainder of the flow.
    pub fn scan_qr_code(
        &self,
        data: QrVerificationData,
    ) -> Result<Option<QrVerification>, ScanError> {
        let ready = as_variant!(&*self.inner.lock().unwrap(), InnerRequest::Ready(r) => {
            (
                r.store.clone(),
                r.other_user_id.clone(),
                r.state.other_device_id.clone(),
                r.flow_id.as_ref().clone(),
            )
        });

        let Some((store, other_user_id, other_device_id, flow_id)) = ready else {
            return Ok(None);
        };

        let qr_verification = QrVerification::from_scan(
            store,
            other_user_id,
            other_device_id,
            flow_id,
            data,
            self.we_started,
            Some(self.inner.clone().into()),
        )?;

        self.verification_cache.insert_qr(qr_verification.clone());

        Ok(Some(qr_verification))
    }

    /// Accept the verification request, advertising the given methods as
    /// supported by us.
    pub fn accept_with_methods(
        &self,
        methods: Vec<VerificationMethod>,
    ) -> Option<OutgoingVerificationRequest> {
        let mut inner = self.inner.lock().unwrap();

        inner.accept(methods).map(|c| match c {
            OutgoingContent::ToDevice(content) => {
                ToDeviceRequest::new(self.other_user(), inner.other_device_id(), &content).into()
            }
            OutgoingContent::Room(room_id, content) => {
                RoomMessageRequest { room_id, txn_id: TransactionId::new(), content }.into()
            }
        })
    }

    /// Accept the verification request with the default methods.
    ///
    /// These are `m.sas.v1`, `m.qr_code.show.v1` and `m.reciprocate.v1`; to
    /// advertise QR scanning, or to drop QR showing, use
    /// [`accept_with_methods()`](Self::accept_with_methods) instead.
    pub fn accept(&self) -> Option<OutgoingVerificationRequest> {
        self.accept_with_methods(SUPPORTED_METHODS.to_vec())
    }

    /// Cancel the verification request.
    pub fn cancel(&self) -> Option<OutgoingVerificationRequest> {
        self.cancel_with_code(CancelCode::User)
    }

    fn cancel_with_code(&self, cancel_code: CancelCode) -> Option<OutgoingVerificationRequest> {
        let mut inner = self.inner.lock().unwrap();

        // Created means that we're the ones who sent out the request, and
        // it's unanswered, so every recipient device needs to be notified.
        let send_to_everyone = self.we_started() && matches!(&*inner, InnerRequest::Created(_));
        let other_device = inner.other_device_id();

        inner.cancel(true, &cancel_code);

        let content =
            as_variant!(&*inner, InnerRequest::Cancelled(c) => c.state.as_content(self.flow_id()));

        let request = content.map(|c| match c {
            OutgoingContent::ToDevice(content) => {
                if send_to_everyone {
                    ToDeviceRequest::for_recipient_devices(
                        self.other_user(),
                        self.recipient_devices.to_vec(),
                        &content,
                    )
                    .into()
                } else {
                    ToDeviceRequest::new(self.other_user(), other_device, &content).into()
                }
            }
            OutgoingContent::Room(room_id, content) => {
                RoomMessageRequest { room_id, txn_id: TransactionId::new(), content }.into()
            }
        });

        drop(inner);

        if let Some(verification) =
            self.verification_cache.get(self.other_user(), self.flow_id().as_str())
        {
            match verification {
                Verification::SasV1(s) => s.cancel_with_code(cancel_code),
                Verification::QrV1(q) => q.cancel_with_code(cancel_code),
            };
        }

        request
    }

    pub(crate) fn cancel_if_timed_out(&self) -> Option<OutgoingVerificationRequest> {
        if self.is_cancelled() || self.is_done() {
            None
        } else if self.timed_out() {
            let request = self.cancel_with_code(CancelCode::Timeout);

            if self.is_passive() {
                None
            } else {
                trace!(
                    other_user = ?self.other_user(),
                    flow_id = self.flow_id().as_str(),
                    "Timing a verification request out"
                );
                request
            }
        } else {
            None
        }
    }

    /// Build a cancellation for devices that received the request but should
    /// not continue in the verification.
    ///
    /// When the other user accepts on one of their devices, every other
    /// device that received the request gets a cancellation with code
    /// `m.accepted` (`filter_device` names the accepting device). When they
    /// decline we can't know which device declined, so the cancellation goes
    /// to all of them.
    pub(crate) fn cancel_for_other_devices(
        &self,
        code: CancelCode,
        filter_device: Option<&DeviceId>,
    ) -> Option<ToDeviceRequest> {
        let cancelled = Cancelled::new(true, code);
        let cancel_content = cancelled.as_content(self.flow_id());

        let OutgoingContent::ToDevice(c) = cancel_content else {
            return None;
        };

        let recipients: Vec<OwnedDeviceId> = self
            .recipient_devices
            .iter()
            .filter(|&d| filter_device.map_or(true, |device| **d != *device))
            .cloned()
            .collect();

        // No recipients left with a filter device present means the request
        // only ever reached the device that accepted it.
        if recipients.is_empty() && filter_device.is_some() {
            None
        } else {
            Some(ToDeviceRequest::for_recipient_devices(self.other_user(), recipients, &c))
        }
    }

    pub(crate) fn receive_ready(&self, sender: &UserId, content: &ReadyContent<'_>) {
        let mut inner = self.inner.lock().unwrap();

        match &*inner {
            InnerRequest::Created(s) => {
                *inner = InnerRequest::Ready(s.clone().into_ready(sender, content));

                if let Some(request) =
                    self.cancel_for_other_devices(CancelCode::Accepted, Some(content.from_device()))
                {
                    self.verification_cache.add_request(request.into());
                }
            }
            InnerRequest::Requested(s) => {
                // A ready from another one of our devices means that device
                // answered the request; we only get to watch.
                if sender == self.own_user_id() && content.from_device() != &*self.account.device_id
                {
                    *inner = InnerRequest::Passive(s.clone().into_passive(content))
                }
            }
            InnerRequest::Ready(_)
            | InnerRequest::Passive(_)
            | InnerRequest::Done(_)
            | InnerRequest::Cancelled(_) => {}
        }
    }

    pub(crate) fn receive_start(&self, sender: &UserId, content: &StartContent<'_>) {
        let inner = self.inner.lock().unwrap().clone();

        if let InnerRequest::Ready(s) = inner {
            s.receive_start(sender, content, self.we_started, self.inner.clone().into());
        } else {
            warn!(
                ?sender,
                device_id = ?content.from_device(),
                "Received a key verification start event but we're not yet in the ready state"
            )
        }
    }

    pub(crate) fn receive_done(&self, sender: &UserId, content: &DoneContent<'_>) {
        if sender == self.other_user() {
            trace!(
                other_user = ?self.other_user(),
                flow_id = self.flow_id().as_str(),
                "Marking a verification request as done"
            );

            self.inner.lock().unwrap().receive_done(content);
        }
    }

    pub(crate) fn receive_cancel(&self, sender: &UserId, content: &CancelContent<'_>) {
        if sender != self.other_user() {
            return;
        }

        trace!(
            ?sender,
            code = content.cancel_code().as_str(),
            "Cancelling a verification request, other user has cancelled"
        );
        self.inner.lock().unwrap().cancel(false, content.cancel_code());

        if self.we_started() {
            if let Some(request) =
                self.cancel_for_other_devices(content.cancel_code().to_owned(), None)
            {
                self.verification_cache.add_request(request.into());
            }
        }
    }

    /// Transition from this request into a SAS verification flow.
    ///
    /// Returns `None` if the request isn't in the ready state, if the other
    /// side doesn't support SAS, or if a verification flow already exists
    /// for this request.
    pub fn start_sas(&self) -> Option<(Sas, OutgoingVerificationRequest)> {
        if self.verification_cache.get(self.other_user(), self.flow_id().as_str()).is_some() {
            return None;
        }

        let inner = self.inner.lock().unwrap().clone();
        let other_device_id = inner.other_device_id();

        let InnerRequest::Ready(s) = inner else {
            return None;
        };

        let (sas, content) = s.start_sas(self.we_started, self.inner.clone().into())?;

        self.verification_cache.insert_sas(sas.clone());

        let request = match content {
            OutgoingContent::ToDevice(content) => {
                ToDeviceRequest::new(self.other_user(), other_device_id, &content).into()
            }
            OutgoingContent::Room(room_id, content) => {
                RoomMessageRequest { room_id, txn_id: TransactionId::new(), content }.into()
            }
        };

        Some((sas, request))
    }
}

#[derive(Clone, Debug)]
enum InnerRequest {
    Created(RequestState<Created>),
    Requested(RequestState<Requested>),
    Ready(RequestState<Ready>),
    Passive(RequestState<Passive>),
    Done(RequestState<Done>),
    Cancelled(RequestState<Cancelled>),
}

impl InnerRequest {
    fn other_device_id(&self) -> DeviceIdOrAllDevices {
        match self {
            InnerRequest::Ready(r) => {
                DeviceIdOrAllDevices::DeviceId(r.state.other_device_id.to_owned())
            }
            _ => DeviceIdOrAllDevices::AllDevices,
        }
    }

    fn accept(&mut self, methods: Vec<VerificationMethod>) -> Option<OutgoingContent> {
        let InnerRequest::Requested(s) = self else {
            return None;
        };

        let (state, content) = s.clone().accept(methods);
        *self = InnerRequest::Ready(state);

        Some(content)
    }

    fn receive_done(&mut self, content: &DoneContent<'_>) {
        *self = InnerRequest::Done(match self {
            InnerRequest::Ready(s) => s.clone().into_done(content),
            InnerRequest::Passive(s) => s.clone().into_done(content),
            _ => return,
        })
    }

    fn cancel(&mut self, cancelled_by_us: bool, cancel_code: &CancelCode) {
        let cancelled = match self {
            InnerRequest::Created(s) => s.clone().into_canceled(cancelled_by_us, cancel_code),
            InnerRequest::Requested(s) => s.clone().into_canceled(cancelled_by_us, cancel_code),
            InnerRequest::Ready(s) => s.clone().into_canceled(cancelled_by_us, cancel_code),
            InnerRequest::Passive(_) | InnerRequest::Done(_) | InnerRequest::Cancelled(_) => {
                return
            }
        };

        trace!(
            cancelled_by_us,
            code = cancel_code.as_str(),
            "Verification request going into the cancelled state"
        );

        *self = InnerRequest::Cancelled(cancelled);
    }

    fn generate_qr_code(
        &self,
        we_started: bool,
        request_handle: RequestHandle,
    ) -> Option<QrVerification> {
        as_variant!(self, InnerRequest::Ready(s) => {
            s.generate_qr_code(we_started, request_handle)
        })
        .flatten()
    }
}

#[derive(Clone, Debug)]
struct RequestState<S: Clone> {
    verification_cache: VerificationCache,
    store: VerificationStore,
    flow_id: Arc<FlowId>,

    /// The user id of the other side of this verification request.
    pub other_user_id: OwnedUserId,

    /// The phase the request is in.
    state: S,
}

impl<S: Clone> RequestState<S> {
    /// Move into a different phase, keeping the shared request data.
    fn replace_state<T: Clone>(self, state: T) -> RequestState<T> {
        RequestState {
            verification_cache: self.verification_cache,
            store: self.store,
            flow_id: self.flow_id,
            other_user_id: self.other_user_id,
            state,
        }
    }

    fn into_done(self, _: &DoneContent<'_>) -> RequestState<Done> {
        self.replace_state(Done {})
    }

    fn into_canceled(
        self,
        cancelled_by_us: bool,
        cancel_code: &CancelCode,
    ) -> RequestState<Cancelled> {
        let state = Cancelled::new(cancelled_by_us, cancel_code.clone());
        self.replace_state(state)
    }
}

impl RequestState<Created> {
    fn new(
        cache: VerificationCache,
        store: VerificationStore,
        other_user_id: &UserId,
        flow_id: &FlowId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Self {
        let our_methods = methods.unwrap_or_else(|| SUPPORTED_METHODS.to_vec());

        Self {
            other_user_id: other_user_id.to_owned(),
            state: Created { our_methods },
            verification_cache: cache,
            store,
            flow_id: flow_id.to_owned().into(),
        }
    }

    fn into_ready(self, _sender: &UserId, content: &ReadyContent<'_>) -> RequestState<Ready> {
        let our_methods = self.state.our_methods.clone();

        self.replace_state(Ready {
            their_methods: content.methods().to_owned(),
            our_methods,
            other_device_id: content.from_device().into(),
        })
    }
}

#[derive(Clone, Debug)]
struct Created {
    /// The verification methods we advertised.
    pub our_methods: Vec<VerificationMethod>,
}

#[derive(Clone, Debug)]
struct Requested {
    /// The verification methods the sender advertised.
    pub their_methods: Vec<VerificationMethod>,

    /// The device that sent the verification request.
    pub other_device_id: OwnedDeviceId,
}

impl RequestState<Requested> {
    fn from_request_event(
        cache: VerificationCache,
        store: VerificationStore,
        sender: &UserId,
        flow_id: &FlowId,
        content: &RequestContent<'_>,
    ) -> RequestState<Requested> {
        RequestState {
            store,
            verification_cache: cache,
            flow_id: flow_id.to_owned().into(),
            other_user_id: sender.to_owned(),
            state: Requested {
                their_methods: content.methods().to_owned(),
                other_device_id: content.from_device().into(),
            },
        }
    }

    fn into_passive(self, content: &ReadyContent<'_>) -> RequestState<Passive> {
        let state = Passive { other_device_id: content.from_device().to_owned() };
        self.replace_state(state)
    }

    fn accept(self, methods: Vec<VerificationMethod>) -> (RequestState<Ready>, OutgoingContent) {
        let their_methods = self.state.their_methods.clone();
        let other_device_id = self.state.other_device_id.clone();

        let state = self.replace_state(Ready {
            their_methods,
            our_methods: methods.clone(),
            other_device_id,
        });

        let content = match state.flow_id.as_ref() {
            FlowId::ToDevice(i) => AnyToDeviceEventContent::KeyVerificationReady(
                ToDeviceKeyVerificationReadyEventContent::new(
                    state.store.account.device_id.clone(),
                    methods,
                    i.to_owned(),
                ),
            )
            .into(),
            FlowId::InRoom(r, e) => (
                r.to_owned(),
                AnyMessageLikeEventContent::KeyVerificationReady(
                    KeyVerificationReadyEventContent::new(
                        state.store.account.device_id.clone(),
                        methods,
                        Reference::new(e.to_owned()),
                    ),
                ),
            )
                .into(),
        };

        (state, content)
    }
}

#[derive(Clone, Debug)]
struct Ready {
    /// The verification methods the other side advertised.
    pub their_methods: Vec<VerificationMethod>,

    /// The verification methods we advertised.
    pub our_methods: Vec<VerificationMethod>,

    /// The device that answered the verification request.
    pub other_device_id: OwnedDeviceId,
}

impl RequestState<Ready> {
    fn to_started_sas(
        &self,
        content: &StartContent<'_>,
        other_device: DeviceData,
        we_started: bool,
        request_handle: RequestHandle,
    ) -> Result<Sas, OutgoingContent> {
        let identities = self.store.get_identities(other_device);

        Sas::from_start_event(
            (*self.flow_id).clone(),
            content,
            identities,
            Some(request_handle),
            we_started,
        )
    }

    fn generate_qr_code(
        &self,
        we_started: bool,
        request_handle: RequestHandle,
    ) -> Option<QrVerification> {
        // Showing a code only makes sense if we advertised showing and the
        // other side advertised scanning.
        if !self.state.our_methods.contains(&VerificationMethod::QrCodeShowV1)
            || !self.state.their_methods.contains(&VerificationMethod::QrCodeScanV1)
        {
            return None;
        }

        let Some(device) = self.store.get_device(&self.other_user_id, &self.state.other_device_id)
        else {
            warn!(
                user_id = ?self.other_user_id,
                device_id = ?self.state.other_device_id,
                "Can't create a QR code, the device that accepted the \
                 verification doesn't exist"
            );
            return None;
        };

        let identities = self.store.get_identities(device);

        let Some(other_identity) = identities.identity_being_verified.clone() else {
            warn!(
                user_id = ?self.other_user_id,
                device_id = ?self.state.other_device_id,
                "Can't create a QR code, the user doesn't have a valid cross \
                 signing identity"
            );
            return None;
        };

        let flow_id = self.flow_id.as_ref().clone();
        let handle = Some(request_handle);

        let verification = if !identities.is_self_verification() {
            let Some(own_identity) = identities.own_identity.clone() else {
                warn!(
                    user_id = ?self.other_user_id,
                    device_id = ?self.state.other_device_id,
                    "Can't create a QR code, we don't have a cross signing \
                     identity of our own"
                );
                return None;
            };

            QrVerification::new_cross(
                flow_id,
                own_identity.master_key(),
                other_identity.master_key(),
                identities,
                we_started,
                handle,
            )
        } else if other_identity.is_verified() {
            let Some(device_key) = identities.device_being_verified.ed25519_key() else {
                warn!(
                    user_id = ?self.other_user_id,
                    device_id = ?self.state.other_device_id,
                    "Can't create a QR code, the other device doesn't have \
                     a valid device key"
                );
                return None;
            };

            QrVerification::new_self(
                flow_id,
                other_identity.master_key(),
                device_key,
                identities,
                we_started,
                handle,
            )
        } else {
            QrVerification::new_self_no_master(
                self.store.clone(),
                flow_id,
                other_identity.master_key(),
                identities,
                we_started,
                handle,
            )
        };

        self.verification_cache.insert_qr(verification.clone());

        Some(verification)
    }

    /// When both sides started a SAS flow at the same time, the side with
    /// the smaller (user id, device id) pair wins and the loser adopts the
    /// winner's flow.
    fn we_win_start_race(&self, sender: &UserId, device_id: &DeviceId) -> bool {
        let own_user_id: &UserId = &self.store.account.user_id;
        let own_device_id: &DeviceId = &self.store.account.device_id;

        matches!(
            (sender.cmp(own_user_id), device_id.cmp(own_device_id)),
            (Ordering::Greater, _) | (Ordering::Equal, Ordering::Greater)
        )
    }

    fn receive_sas_start(
        &self,
        sender: &UserId,
        content: &StartContent<'_>,
        device: DeviceData,
        we_started: bool,
        request_handle: RequestHandle,
    ) {
        let sas = match self.to_started_sas(content, device.clone(), we_started, request_handle) {
            Ok(s) => s,
            Err(c) => {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    content = ?c,
                    "Can't start key verification, canceling.",
                );
                self.verification_cache.queue_up_content(
                    device.user_id(),
                    device.device_id(),
                    c,
                    None,
                );
                return;
            }
        };

        if let Some(Verification::SasV1(_)) =
            self.verification_cache.get(sender, self.flow_id.as_str())
        {
            if self.we_win_start_race(sender, device.device_id()) {
                trace!(?sender, "Ignored a SAS start, our own start event wins the race");
            } else {
                info!(?sender, "Replaced our SAS flow, the other side's start event wins the race");
                self.verification_cache.replace_sas(sas);
            }
        } else {
            info!("Started a new SAS verification.");
            self.verification_cache.insert_sas(sas);
        }
    }

    fn receive_start(
        &self,
        sender: &UserId,
        content: &StartContent<'_>,
        we_started: bool,
        request_handle: RequestHandle,
    ) {
        info!(?sender, device = ?content.from_device(), "Received a new verification start event");

        let Some(device) = self.store.get_device(sender, content.from_device()) else {
            warn!(
                ?sender,
                device = ?content.from_device(),
                "Received a key verification start event from an unknown device"
            );
            return;
        };

        match content.method() {
            StartMethod::SasV1(_) => {
                self.receive_sas_start(sender, content, device, we_started, request_handle)
            }
            StartMethod::ReciprocateV1(_) => {
                if let Some(qr_verification) =
                    self.verification_cache.get_qr(sender, content.flow_id())
                {
                    if let Some(request) = qr_verification.receive_reciprocation(content) {
                        self.verification_cache.add_request(request)
                    }
                    trace!(
                        ?sender,
                        device_id = ?device.device_id(),
                        verification = ?qr_verification,
                        "Received a QR code reciprocation"
                    )
                }
            }
            m => {
                warn!(
                    method = ?m,
                    "Received a key verification start event with an unsupported method, \
                     cancelling"
                );

                let cancelled = Cancelled::new(true, CancelCode::UnknownMethod);
                let content = cancelled.as_content(&self.flow_id);

                self.verification_cache.queue_up_content(
                    device.user_id(),
                    device.device_id(),
                    content,
                    None,
                )
            }
        }
    }

    fn start_sas(
        self,
        we_started: bool,
        request_handle: RequestHandle,
    ) -> Option<(Sas, OutgoingContent)> {
        if !self.state.their_methods.contains(&VerificationMethod::SasV1) {
            return None;
        }

        let Some(device) = self.store.get_device(&self.other_user_id, &self.state.other_device_id)
        else {
            warn!(
                user_id = ?self.other_user_id,
                device_id = ?self.state.other_device_id,
                "Can't start the SAS verification flow, the device that \
                 accepted the verification doesn't exist"
            );
            return None;
        };

        let identities = self.store.get_identities(device);

        Some(match self.flow_id.as_ref() {
            FlowId::ToDevice(t) => {
                Sas::start(identities, t.to_owned(), we_started, Some(request_handle))
            }
            FlowId::InRoom(r, e) => Sas::start_in_room(
                e.to_owned(),
                r.to_owned(),
                identities,
                we_started,
                request_handle,
            ),
        })
    }
}

#[derive(Clone, Debug)]
struct Passive {
    /// The sibling device that answered the verification request.
    #[allow(dead_code)]
    pub other_device_id: OwnedDeviceId,
}

#[derive(Clone, Debug)]
struct Done {}

#[cfg(test)]
mod tests {
    use ruma::{
        device_id, event_id,
        events::key::verification::VerificationMethod,
        room_id, user_id, DeviceId, MilliSecondsSinceUnixEpoch, UserId,
    };
    use vodozemac::{Curve25519PublicKey, Ed25519SecretKey};

    use super::VerificationRequest;
    use crate::{
        cache::VerificationCache,
        channel::FlowId,
        event_enums::{OutgoingContent, ReadyContent, RequestContent, StartContent},
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

    fn verification_stores() -> (VerificationStore, VerificationStore) {
        let (alice_account, alice_device) = account_and_device(alice_id(), alice_device_id());
        let (bob_account, bob_device) = account_and_device(bob_id(), bob_device_id());

        let alice_store = VerificationStore::new(alice_account);
        alice_store.add_device(bob_device);

        let bob_store = VerificationStore::new(bob_account);
        bob_store.add_device(alice_device);

        (alice_store, bob_store)
    }

    #[test]
    fn request_accepting() {
        let event_id = event_id!("$1234localhost").to_owned();
        let room_id = room_id!("!test:localhost").to_owned();

        let (alice_store, bob_store) = verification_stores();

        let content = VerificationRequest::request(
            &bob_store.account.user_id,
            &bob_store.account.device_id,
            alice_id(),
            None,
        );

        let flow_id = FlowId::InRoom(room_id, event_id);

        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store,
            flow_id.clone(),
            alice_id(),
            vec![],
            None,
        );

        let alice_request = VerificationRequest::from_request(
            VerificationCache::new(),
            alice_store,
            bob_id(),
            flow_id,
            &(&content).into(),
            MilliSecondsSinceUnixEpoch::now(),
        );

        let request = alice_request.accept().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = ReadyContent::try_from(&content).unwrap();

        bob_request.receive_ready(alice_id(), &content);

        assert!(bob_request.is_ready());
        assert!(alice_request.is_ready());
        assert_eq!(bob_request.other_device_id().unwrap(), alice_device_id());
    }

    #[test]
    fn methods_intersection_ignores_ordering() {
        let flow_id = FlowId::ToDevice("methods_intersection".into());

        let (alice_store, bob_store) = verification_stores();

        let bob_request = VerificationRequest::new(
            VerificationCache::new(),
            bob_store,
            flow_id.clone(),
            alice_id(),
            vec![alice_device_id().to_owned()],
            Some(vec![VerificationMethod::QrCodeShowV1, VerificationMethod::SasV1]),
        );

        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();
        let request_content = RequestContent::try_from(&content).unwrap();

        let alice_request = VerificationRequest::from_request(
            VerificationCache::new(),
            alice_store,
            bob_id(),
            flow_id,
            &request_content,
            MilliSecondsSinceUnixEpoch::now(),
        );

        // Alice lists the common methods in a different order and adds one
        // Bob doesn't know.
        let request = alice_request
            .accept_with_methods(vec![
                VerificationMethod::SasV1,
                VerificationMethod::QrCodeScanV1,
                VerificationMethod::QrCodeShowV1,
            ])
            .unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = ReadyContent::try_from(&content).unwrap();

        bob_request.receive_ready(alice_id(), &content);

        let alice_methods = alice_request.methods().unwrap();
        let bob_methods = bob_request.methods().unwrap();

        assert_eq!(alice_methods.len(), 2);
        assert_eq!(bob_methods.len(), 2);
        assert!(alice_methods.iter().all(|m| bob_methods.contains(m)));
        assert!(alice_methods.contains(&VerificationMethod::SasV1));
        assert!(alice_methods.contains(&VerificationMethod::QrCodeShowV1));
    }

    #[test]
    fn passive_when_a_sibling_device_accepts() {
        let flow_id = FlowId::ToDevice("sibling_accepts".into());

        let sibling_device_id = device_id!("SIBLING");

        let (requester_account, _) = account_and_device(alice_id(), device_id!("REQUESTER"));
        let (our_account, _) = account_and_device(alice_id(), alice_device_id());
        let (sibling_account, _) = account_and_device(alice_id(), sibling_device_id);

        let requester_store = VerificationStore::new(requester_account);
        let our_store = VerificationStore::new(our_account);
        let sibling_store = VerificationStore::new(sibling_account);

        // A self-verification request addressed to both of our sibling
        // devices.
        let requester = VerificationRequest::new(
            VerificationCache::new(),
            requester_store,
            flow_id.clone(),
            alice_id(),
            vec![alice_device_id().to_owned(), sibling_device_id.to_owned()],
            None,
        );

        let request = requester.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();
        let request_content = RequestContent::try_from(&content).unwrap();

        let our_request = VerificationRequest::from_request(
            VerificationCache::new(),
            our_store,
            alice_id(),
            flow_id.clone(),
            &request_content,
            MilliSecondsSinceUnixEpoch::now(),
        );

        let sibling_request = VerificationRequest::from_request(
            VerificationCache::new(),
            sibling_store,
            alice_id(),
            flow_id,
            &request_content,
            MilliSecondsSinceUnixEpoch::now(),
        );

        // The sibling answers first; its ready lands on our device too.
        let request = sibling_request.accept().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = ReadyContent::try_from(&content).unwrap();

        our_request.receive_ready(alice_id(), &content);

        // We only get to watch from now on.
        assert!(our_request.is_passive());
        assert!(!our_request.is_ready());
        assert!(our_request.accept().is_none());
    }

    #[test]
    fn requesting_until_sas() {
        let event_id = event_id!("$1234localhost").to_owned();
        let room_id = room_id!("!test:localhost").to_owned();

        let (alice_store, bob_store) = verification_stores();

        let alice_cache = VerificationCache::new();
        let bob_cache = VerificationCache::new();

        let content = VerificationRequest::request(
            &bob_store.account.user_id,
            &bob_store.account.device_id,
            alice_id(),
            None,
        );

        let flow_id = FlowId::InRoom(room_id, event_id);

        let bob_request = VerificationRequest::new(
            bob_cache.clone(),
            bob_store,
            flow_id.clone(),
            alice_id(),
            vec![],
            None,
        );

        let alice_request = VerificationRequest::from_request(
            alice_cache.clone(),
            alice_store,
            bob_id(),
            flow_id.clone(),
            &(&content).into(),
            MilliSecondsSinceUnixEpoch::now(),
        );

        let request = alice_request.accept().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = ReadyContent::try_from(&content).unwrap();

        bob_request.receive_ready(alice_id(), &content);

        let (bob_sas, start_request) = bob_request.start_sas().unwrap();
        let content = OutgoingContent::try_from(&start_request).unwrap();
        let content = StartContent::try_from(&content).unwrap();

        alice_request.receive_start(bob_id(), &content);
        let alice_sas = alice_cache.get_sas(bob_id(), flow_id.as_str()).unwrap();

        assert!(!bob_sas.is_cancelled());
        assert!(!alice_sas.is_cancelled());
        assert!(alice_sas.accept().is_some());

        // A second start_sas call must not spawn a second flow.
        assert!(bob_request.start_sas().is_none());
    }

    #[test]
    fn simultaneous_starts() {
        let txn_id = "unique_and_random_id";
        let flow_id = FlowId::ToDevice(txn_id.into());

        let (alice_store, bob_store) = verification_stores();

        let alice_cache = VerificationCache::new();
        let bob_cache = VerificationCache::new();

        let bob_request = VerificationRequest::new(
            bob_cache.clone(),
            bob_store,
            flow_id.clone(),
            alice_id(),
            vec![alice_device_id().to_owned()],
            None,
        );
        let request = bob_request.request_to_device();
        let content = OutgoingContent::try_from(&request).unwrap();
        let request_content = RequestContent::try_from(&content).unwrap();

        let alice_request = VerificationRequest::from_request(
            alice_cache.clone(),
            alice_store,
            bob_id(),
            flow_id.clone(),
            &request_content,
            MilliSecondsSinceUnixEpoch::now(),
        );

        let request = alice_request.accept().unwrap();
        let content = OutgoingContent::try_from(&request).unwrap();
        let content = ReadyContent::try_from(&content).unwrap();

        bob_request.receive_ready(alice_id(), &content);

        // Both sides start a SAS flow before seeing the other's start.
        let (_, alice_start) = alice_request.start_sas().unwrap();
        let (_, bob_start) = bob_request.start_sas().unwrap();

        let alice_start = OutgoingContent::try_from(&alice_start).unwrap();
        let alice_start = StartContent::try_from(&alice_start).unwrap();
        let bob_start = OutgoingContent::try_from(&bob_start).unwrap();
        let bob_start = StartContent::try_from(&bob_start).unwrap();

        // Alice has the smaller user id, her start event wins on both sides:
        // she ignores Bob's start, Bob adopts hers.
        alice_request.receive_start(bob_id(), &bob_start);
        bob_request.receive_start(alice_id(), &alice_start);

        let alice_sas = alice_cache.get_sas(bob_id(), flow_id.as_str()).unwrap();
        let bob_sas = bob_cache.get_sas(alice_id(), flow_id.as_str()).unwrap();

        // Alice's object is still the one she created, so Bob needs to
        // accept; Bob's object was replaced by the incoming start, which
        // means he's now the one who can accept.
        assert!(alice_sas.accept().is_none());
        assert!(bob_sas.accept().is_some());
    }
}
