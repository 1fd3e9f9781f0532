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

//! A state machine implementation of the interactive verification protocol
//! for Matrix devices and users.
//!
//! Interactive verification lets two devices prove to each other that they
//! hold the keys they claim to hold, either by comparing a short auth string
//! (emoji or decimals) or by scanning a QR code. The handshake starts with an
//! `m.key.verification.request`, transitions into one of the methods once
//! both sides are ready, and ends with both sides exchanging MACs over their
//! keys.
//!
//! This crate is transport agnostic. Events are fed into a
//! [`VerificationMachine`] and replies are queued up as
//! [`OutgoingVerificationRequest`]s which the caller is responsible for
//! sending out, over to-device messaging or as room messages depending on the
//! flow. Once a request was sent, [`VerificationMachine::mark_request_as_sent()`]
//! needs to be called with the request id so the flow that queued it up can
//! make progress.
//!
//! ```
//! use matrix_verification::{OwnAccount, VerificationMachine, VerificationStore};
//! use ruma::{device_id, user_id};
//! use vodozemac::Ed25519SecretKey;
//!
//! let account = OwnAccount {
//!     user_id: user_id!("@alice:example.org").to_owned(),
//!     device_id: device_id!("DEVICEID").to_owned(),
//!     ed25519_key: Ed25519SecretKey::new().public_key(),
//! };
//!
//! let store = VerificationStore::new(account);
//! // Seed the store with the keys of the devices we may verify, then:
//! let machine = VerificationMachine::new(store);
//! # drop(machine);
//! ```

#![warn(missing_docs, missing_debug_implementations)]

mod cache;
mod channel;
pub mod event_enums;
mod machine;
mod outgoing;
mod qrcode;
mod requests;
mod sas;
mod store;

pub use channel::FlowId;
use event_enums::OutgoingContent;
pub use machine::VerificationMachine;
pub use matrix_verification_qrcode;
pub use outgoing::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest};
pub use qrcode::{QrVerification, QrVerificationState, ScanError};
pub use requests::VerificationRequest;
use ruma::{
    events::{
        key::verification::cancel::{
            CancelCode, KeyVerificationCancelEventContent,
            ToDeviceKeyVerificationCancelEventContent,
        },
        relation::Reference,
        AnyMessageLikeEventContent, AnyToDeviceEventContent,
    },
    UserId,
};
pub use sas::{AcceptSettings, AcceptedProtocols, EmojiShortAuthString, Sas, SasState};
pub use store::{DeviceData, OwnAccount, UserIdentityData, VerificationStore};

/// An emoji that is used for interactive verification using a short auth
/// string.
///
/// This will contain a single emoji and description from the fixed list of 64
/// the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string, for
    /// example: 🐶
    pub symbol: &'static str,
    /// The description of the emoji, for example 'Dog'.
    pub description: &'static str,
}

/// An enum over the different verification flows.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Verification {
    /// The `m.sas.v1` verification variant.
    SasV1(Sas),
    /// The `m.qr_code.*.v1` verification variant.
    QrV1(QrVerification),
}

impl Verification {
    /// Try to deconstruct this verification enum into a SAS verification.
    pub fn sas_v1(self) -> Option<Sas> {
        as_variant::as_variant!(self, Verification::SasV1)
    }

    /// Try to deconstruct this verification enum into a QR code verification.
    pub fn qr_v1(self) -> Option<QrVerification> {
        as_variant::as_variant!(self, Verification::QrV1)
    }

    /// Has this verification finished.
    pub fn is_done(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.is_done(),
            Verification::QrV1(qr) => qr.is_done(),
        }
    }

    /// Get the ID that uniquely identifies this verification flow.
    pub fn flow_id(&self) -> &FlowId {
        match self {
            Verification::SasV1(s) => s.flow_id(),
            Verification::QrV1(qr) => qr.flow_id(),
        }
    }

    /// Has the verification been cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.is_cancelled(),
            Verification::QrV1(qr) => qr.is_cancelled(),
        }
    }

    /// Get our own user id that is participating in this verification.
    pub fn user_id(&self) -> &UserId {
        match self {
            Verification::SasV1(v) => v.user_id(),
            Verification::QrV1(v) => v.user_id(),
        }
    }

    /// Get the other user id that is participating in this verification.
    pub fn other_user(&self) -> &UserId {
        match self {
            Verification::SasV1(s) => s.other_user_id(),
            Verification::QrV1(qr) => qr.other_user_id(),
        }
    }

    /// Is this a verification verifying a device that belongs to us.
    pub fn is_self_verification(&self) -> bool {
        match self {
            Verification::SasV1(v) => v.is_self_verification(),
            Verification::QrV1(v) => v.is_self_verification(),
        }
    }

    pub(crate) fn cancel(&self) -> Option<OutgoingVerificationRequest> {
        match self {
            Verification::SasV1(s) => s.cancel(),
            Verification::QrV1(qr) => qr.cancel(),
        }
    }
}

impl From<Sas> for Verification {
    fn from(sas: Sas) -> Self {
        Self::SasV1(sas)
    }
}

impl From<QrVerification> for Verification {
    fn from(qr: QrVerification) -> Self {
        Self::QrV1(qr)
    }
}

/// Information about the cancellation of a verification request or
/// verification flow.
#[derive(Clone, Debug)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: &'static str,
}

impl CancelInfo {
    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

impl From<Cancelled> for CancelInfo {
    fn from(c: Cancelled) -> Self {
        Self { cancelled_by_us: c.cancelled_by_us, cancel_code: c.cancel_code, reason: c.reason }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Cancelled {
    pub cancelled_by_us: bool,
    pub cancel_code: CancelCode,
    pub reason: &'static str,
}

impl Cancelled {
    pub fn new(cancelled_by_us: bool, code: CancelCode) -> Self {
        let reason = match code {
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::KeyMismatch => "The expected key did not match the verified one.",
            CancelCode::MismatchedCommitment => {
                "The hash commitment did not match the expected value."
            }
            CancelCode::MismatchedSas => "The short authentication strings did not match.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::UserMismatch => "The expected user did not match the verified user.",
            _ => "Unknown cancel reason",
        };

        Self { cancelled_by_us, cancel_code: code, reason }
    }

    pub fn as_content(&self, flow_id: &FlowId) -> OutgoingContent {
        match flow_id {
            FlowId::ToDevice(s) => AnyToDeviceEventContent::KeyVerificationCancel(
                ToDeviceKeyVerificationCancelEventContent::new(
                    s.clone(),
                    self.reason.to_owned(),
                    self.cancel_code.clone(),
                ),
            )
            .into(),

            FlowId::InRoom(r, e) => (
                r.clone(),
                AnyMessageLikeEventContent::KeyVerificationCancel(
                    KeyVerificationCancelEventContent::new(
                        self.reason.to_owned(),
                        self.cancel_code.clone(),
                        Reference::new(e.clone()),
                    ),
                ),
            )
                .into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ruma::{
        events::{AnyToDeviceEvent, AnyToDeviceEventContent, ToDeviceEvent},
        UserId,
    };

    use crate::event_enums::OutgoingContent;

    pub(crate) fn wrap_any_to_device_content(
        sender: &UserId,
        content: OutgoingContent,
    ) -> AnyToDeviceEvent {
        let content = if let OutgoingContent::ToDevice(c) = content { c } else { unreachable!() };
        let sender = sender.to_owned();

        match content {
            AnyToDeviceEventContent::KeyVerificationRequest(c) => {
                AnyToDeviceEvent::KeyVerificationRequest(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationReady(c) => {
                AnyToDeviceEvent::KeyVerificationReady(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationKey(c) => {
                AnyToDeviceEvent::KeyVerificationKey(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationStart(c) => {
                AnyToDeviceEvent::KeyVerificationStart(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationAccept(c) => {
                AnyToDeviceEvent::KeyVerificationAccept(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationMac(c) => {
                AnyToDeviceEvent::KeyVerificationMac(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationDone(c) => {
                AnyToDeviceEvent::KeyVerificationDone(ToDeviceEvent::new(sender, c))
            }
            AnyToDeviceEventContent::KeyVerificationCancel(c) => {
                AnyToDeviceEvent::KeyVerificationCancel(ToDeviceEvent::new(sender, c))
            }

            _ => unreachable!(),
        }
    }
}
