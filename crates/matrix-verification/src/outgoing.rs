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

//! Outgoing request types.
//!
//! The state machines in this crate never talk to a homeserver themselves,
//! they queue up values of these types. The surrounding application sends
//! them out and reports the send back with
//! [`VerificationMachine::mark_request_as_sent()`].
//!
//! [`VerificationMachine::mark_request_as_sent()`]:
//! crate::VerificationMachine::mark_request_as_sent

use std::collections::BTreeMap;

use ruma::{
    events::{AnyMessageLikeEventContent, AnyToDeviceEventContent, ToDeviceEventContent},
    serde::Raw,
    to_device::DeviceIdOrAllDevices,
    OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};

/// A to-device message that should be sent out.
///
/// Contents are keyed by recipient user and device, the same shape the
/// `sendToDevice` endpoint expects.
#[derive(Clone, Debug)]
pub struct ToDeviceRequest {
    /// The type of the event that is being sent.
    pub event_type: ruma::events::ToDeviceEventType,

    /// A request identifier, doubles as the transaction id of the
    /// `sendToDevice` call.
    pub txn_id: OwnedTransactionId,

    /// A map of users to devices to the content of the event.
    pub messages:
        BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Raw<AnyToDeviceEventContent>>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request for a single recipient device.
    pub fn new(
        recipient: &UserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        content: &AnyToDeviceEventContent,
    ) -> Self {
        Self::with_id(recipient, recipient_device, content, TransactionId::new())
    }

    /// Create a new to-device request with a fixed request id.
    pub fn with_id(
        recipient: &UserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        content: &AnyToDeviceEventContent,
        txn_id: OwnedTransactionId,
    ) -> Self {
        let event_type = content.event_type();
        let raw = Raw::new(content).expect("Failed to serialize a to-device event content");

        let device_messages = BTreeMap::from([(recipient_device.into(), raw)]);
        let messages = BTreeMap::from([(recipient.to_owned(), device_messages)]);

        Self { event_type, txn_id, messages }
    }

    /// Create a new to-device request fanning the same content out to several
    /// devices of one user.
    pub(crate) fn for_recipient_devices(
        recipient: &UserId,
        recipient_devices: Vec<OwnedDeviceId>,
        content: &AnyToDeviceEventContent,
    ) -> Self {
        let event_type = content.event_type();
        let raw = Raw::new(content).expect("Failed to serialize a to-device event content");

        let recipient_devices: Vec<DeviceIdOrAllDevices> = if recipient_devices.is_empty() {
            vec![DeviceIdOrAllDevices::AllDevices]
        } else {
            recipient_devices.into_iter().map(Into::into).collect()
        };

        let device_messages =
            recipient_devices.into_iter().map(|d| (d, raw.clone())).collect();
        let messages = BTreeMap::from([(recipient.to_owned(), device_messages)]);

        Self { event_type, txn_id: TransactionId::new(), messages }
    }

    /// The unique id of this request.
    pub fn request_id(&self) -> &TransactionId {
        &self.txn_id
    }
}

/// A room message that should be sent out as part of an in-room verification.
#[derive(Clone, Debug)]
pub struct RoomMessageRequest {
    /// The room the message should be sent to.
    pub room_id: OwnedRoomId,

    /// A transaction id uniquely identifying this message send.
    pub txn_id: OwnedTransactionId,

    /// The content of the message.
    pub content: AnyMessageLikeEventContent,
}

impl RoomMessageRequest {
    /// The unique id of this request.
    pub fn request_id(&self) -> &TransactionId {
        &self.txn_id
    }
}

/// An outgoing request originating from one of the verification state
/// machines.
#[derive(Clone, Debug)]
pub enum OutgoingVerificationRequest {
    /// The request is a to-device message.
    ToDevice(ToDeviceRequest),
    /// The request is a room message.
    InRoom(RoomMessageRequest),
}

impl OutgoingVerificationRequest {
    /// The unique id of this request.
    pub fn request_id(&self) -> &TransactionId {
        match self {
            Self::ToDevice(r) => r.request_id(),
            Self::InRoom(r) => r.request_id(),
        }
    }
}

impl From<ToDeviceRequest> for OutgoingVerificationRequest {
    fn from(r: ToDeviceRequest) -> Self {
        Self::ToDevice(r)
    }
}

impl From<RoomMessageRequest> for OutgoingVerificationRequest {
    fn from(r: RoomMessageRequest) -> Self {
        Self::InRoom(r)
    }
}
