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
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{
    events::key::verification::cancel::CancelCode, DeviceId, OwnedTransactionId, OwnedUserId,
    TransactionId, UserId,
};
use tracing::{debug, trace, warn};

use crate::{
    channel::FlowId,
    event_enums::OutgoingContent,
    outgoing::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest},
    Verification,
};

/// The pair of ids that connects an outgoing request to the verification
/// flow that produced it.
///
/// Some state transitions only happen once our own message has actually gone
/// out. The flow hands this out alongside the content so the send can be
/// routed back to it.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    /// The flow that is waiting for the request to be sent out.
    pub flow_id: FlowId,
    /// The id of the request.
    pub request_id: OwnedTransactionId,
}

/// The set of currently live verifications and the requests they have queued
/// up.
#[derive(Clone, Debug)]
pub struct VerificationCache {
    inner: Arc<VerificationCacheInner>,
}

#[derive(Debug, Default)]
struct VerificationCacheInner {
    verification: StdRwLock<BTreeMap<OwnedUserId, BTreeMap<String, Verification>>>,
    outgoing_requests: StdRwLock<BTreeMap<OwnedTransactionId, OutgoingVerificationRequest>>,
    flow_ids_waiting_for_response: StdRwLock<BTreeMap<OwnedTransactionId, (OwnedUserId, FlowId)>>,
}

impl VerificationCache {
    pub fn new() -> Self {
        Self { inner: Default::default() }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.inner.verification.read().unwrap().values().all(|m| m.is_empty())
    }

    pub fn insert(&self, verification: impl Into<Verification>) {
        let verification = verification.into();

        self.inner
            .verification
            .write()
            .unwrap()
            .entry(verification.other_user().to_owned())
            .or_default()
            .insert(verification.flow_id().as_str().to_owned(), verification);
    }

    /// Add a new short auth string flow, cancelling any other flow that is
    /// still ongoing with the same user.
    pub fn insert_sas(&self, sas: crate::sas::Sas) {
        for verification in self.user_verifications(sas.other_user_id()) {
            if verification.flow_id().as_str() != sas.flow_id().as_str()
                && !(verification.is_done() || verification.is_cancelled())
            {
                warn!(
                    user_id = ?sas.other_user_id(),
                    "A new verification was started while another one with \
                     the same user is ongoing. Cancelling both of them."
                );

                if let Some(request) = verification.cancel() {
                    self.add_request(request);
                }

                if let Some(request) = sas.cancel_with_code(CancelCode::UnexpectedMessage) {
                    self.add_request(request);
                }
            }
        }

        self.insert(sas);
    }

    /// Swap out an existing flow for the given one, without any cancellation.
    ///
    /// Used when a simultaneous start race is lost and the other side's flow
    /// is adopted in place of ours.
    pub fn replace_sas(&self, sas: crate::sas::Sas) {
        self.insert(sas);
    }

    pub fn insert_qr(&self, qr: crate::qrcode::QrVerification) {
        self.insert(qr);
    }

    pub fn get(&self, sender: &UserId, flow_id: &str) -> Option<Verification> {
        self.inner.verification.read().unwrap().get(sender)?.get(flow_id).cloned()
    }

    fn user_verifications(&self, user_id: &UserId) -> Vec<Verification> {
        self.inner
            .verification
            .read()
            .unwrap()
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_sas(&self, user_id: &UserId, flow_id: &str) -> Option<crate::sas::Sas> {
        self.get(user_id, flow_id).and_then(|v| v.sas_v1())
    }

    pub fn get_qr(&self, user_id: &UserId, flow_id: &str) -> Option<crate::qrcode::QrVerification> {
        self.get(user_id, flow_id).and_then(|v| v.qr_v1())
    }

    /// All the requests that are queued up and waiting to be sent out.
    pub fn outgoing_requests(&self) -> Vec<OutgoingVerificationRequest> {
        self.inner.outgoing_requests.read().unwrap().values().cloned().collect()
    }

    /// Drop the verifications that have reached a terminal state and cancel
    /// the ones that have timed out.
    pub fn garbage_collect(&self) -> Vec<OutgoingVerificationRequest> {
        let mut verification = self.inner.verification.write().unwrap();

        for user_verification in verification.values_mut() {
            user_verification.retain(|_, v| !(v.is_done() || v.is_cancelled()));
        }
        verification.retain(|_, m| !m.is_empty());

        verification
            .values()
            .flatten()
            .filter_map(|(_, v)| v.clone().sas_v1().and_then(|s| s.cancel_if_timed_out()))
            .collect()
    }

    pub fn add_request(&self, request: OutgoingVerificationRequest) {
        trace!(?request, "Adding an outgoing request to the request cache");
        self.inner.outgoing_requests.write().unwrap().insert(request.request_id().to_owned(), request);
    }

    /// Wrap a content into an outgoing request for the given recipient device
    /// and queue it up.
    pub fn queue_up_content(
        &self,
        recipient: &UserId,
        recipient_device: &DeviceId,
        content: OutgoingContent,
        request_info: Option<RequestInfo>,
    ) {
        let request_id = request_info
            .as_ref()
            .map(|i| i.request_id.to_owned())
            .unwrap_or_else(TransactionId::new);

        if let Some(info) = request_info {
            trace!(?info, "Queuing up a request that will require a response");
            self.inner
                .flow_ids_waiting_for_response
                .write()
                .unwrap()
                .insert(info.request_id, (recipient.to_owned(), info.flow_id));
        }

        match content {
            OutgoingContent::ToDevice(c) => {
                let request =
                    ToDeviceRequest::with_id(recipient, recipient_device.to_owned(), &c, request_id);

                self.add_request(request.into());
            }
            OutgoingContent::Room(room_id, content) => {
                self.add_request(RoomMessageRequest { room_id, txn_id: request_id, content }.into());
            }
        }
    }

    /// Mark a queued up request as sent, advancing the flow that was waiting
    /// for the send.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) {
        let waiting_flow =
            self.inner.flow_ids_waiting_for_response.read().unwrap().get(request_id).cloned();

        if let Some((user_id, flow_id)) = waiting_flow {
            debug!(%user_id, flow_id = flow_id.as_str(), "Marking a verification request as sent");

            if let Some(sas) = self.get_sas(&user_id, flow_id.as_str()) {
                sas.mark_request_as_sent(request_id);
            }
        }

        self.inner.outgoing_requests.write().unwrap().remove(request_id);
    }
}

impl Default for VerificationCache {
    fn default() -> Self {
        Self::new()
    }
}
