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

//! Enums unifying the to-device and in-room flavors of the verification
//! events.
//!
//! Every step of a verification exists twice in the event schema, once as a
//! to-device event and once as an in-room event. The state machines don't
//! care which transport an event arrived on, so this module gives each step a
//! borrowed view enum with accessors for the fields the machines read.

use std::collections::BTreeMap;

use as_variant::as_variant;
use ruma::{
    events::{
        key::verification::{
            accept::{
                AcceptMethod, KeyVerificationAcceptEventContent,
                ToDeviceKeyVerificationAcceptEventContent,
            },
            cancel::{
                CancelCode, KeyVerificationCancelEventContent,
                ToDeviceKeyVerificationCancelEventContent,
            },
            done::{KeyVerificationDoneEventContent, ToDeviceKeyVerificationDoneEventContent},
            key::{KeyVerificationKeyEventContent, ToDeviceKeyVerificationKeyEventContent},
            mac::{KeyVerificationMacEventContent, ToDeviceKeyVerificationMacEventContent},
            ready::{KeyVerificationReadyEventContent, ToDeviceKeyVerificationReadyEventContent},
            request::ToDeviceKeyVerificationRequestEventContent,
            start::{
                KeyVerificationStartEventContent, StartMethod,
                ToDeviceKeyVerificationStartEventContent,
            },
            VerificationMethod,
        },
        room::message::{KeyVerificationRequestEventContent, MessageType},
        AnyMessageLikeEvent, AnyMessageLikeEventContent, AnyToDeviceEvent, AnyToDeviceEventContent,
        MessageLikeEvent,
    },
    serde::Base64,
    CanonicalJsonValue, DeviceId, EventId, MilliSecondsSinceUnixEpoch, OwnedRoomId, UserId,
};

use crate::{
    channel::FlowId,
    outgoing::{OutgoingVerificationRequest, ToDeviceRequest},
};

/// A verification event from either transport, before we know which step it
/// carries.
#[derive(Debug)]
pub enum AnyEvent<'a> {
    /// An in-room event.
    Room(&'a AnyMessageLikeEvent),
    /// A to-device event.
    ToDevice(&'a AnyToDeviceEvent),
}

impl AnyEvent<'_> {
    /// Did this event arrive over the in-room transport.
    pub fn is_room_event(&self) -> bool {
        matches!(self, AnyEvent::Room(_))
    }

    /// The user that sent this event.
    ///
    /// `None` for to-device events that aren't part of a verification.
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Self::Room(e) => Some(e.sender()),
            Self::ToDevice(e) => match e {
                AnyToDeviceEvent::KeyVerificationRequest(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationReady(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationStart(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationAccept(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationKey(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationMac(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationDone(e) => Some(&e.sender),
                AnyToDeviceEvent::KeyVerificationCancel(e) => Some(&e.sender),
                _ => None,
            },
        }
    }

    /// The server timestamp of the event, if the event carries one.
    ///
    /// All in-room events have one. Of the to-device events only the
    /// `m.key.verification.request` does.
    pub fn timestamp(&self) -> Option<MilliSecondsSinceUnixEpoch> {
        match self {
            Self::Room(e) => Some(e.origin_server_ts()),
            Self::ToDevice(e) => as_variant!(
                e,
                AnyToDeviceEvent::KeyVerificationRequest(e) => e.content.timestamp
            ),
        }
    }

    /// The event id, if this is an in-room event.
    ///
    /// To-device events don't have an id, in-room events use theirs for
    /// deduplication.
    pub fn event_id(&self) -> Option<&EventId> {
        as_variant!(self, Self::Room(e) => e.event_id())
    }

    /// Interpret the event as a verification step, if it is one.
    pub fn verification_content(&self) -> Option<AnyVerificationContent<'_>> {
        match self {
            Self::Room(e) => match e {
                AnyMessageLikeEvent::RoomMessage(MessageLikeEvent::Original(m)) => {
                    as_variant::as_variant!(
                        &m.content.msgtype,
                        MessageType::VerificationRequest(c) => RequestContent::from(c).into()
                    )
                }
                AnyMessageLikeEvent::KeyVerificationReady(MessageLikeEvent::Original(e)) => {
                    Some(ReadyContent::from(&e.content).into())
                }
                AnyMessageLikeEvent::KeyVerificationStart(MessageLikeEvent::Original(e)) => {
                    Some(StartContent::from(&e.content).into())
                }
                AnyMessageLikeEvent::KeyVerificationAccept(MessageLikeEvent::Original(e)) => {
                    Some(AcceptContent::from(&e.content).into())
                }
                AnyMessageLikeEvent::KeyVerificationKey(MessageLikeEvent::Original(e)) => {
                    Some(KeyContent::from(&e.content).into())
                }
                AnyMessageLikeEvent::KeyVerificationMac(MessageLikeEvent::Original(e)) => {
                    Some(MacContent::from(&e.content).into())
                }
                AnyMessageLikeEvent::KeyVerificationDone(MessageLikeEvent::Original(e)) => {
                    Some(DoneContent::from(&e.content).into())
                }
                AnyMessageLikeEvent::KeyVerificationCancel(MessageLikeEvent::Original(e)) => {
                    Some(CancelContent::from(&e.content).into())
                }
                _ => None,
            },
            Self::ToDevice(e) => match e {
                AnyToDeviceEvent::KeyVerificationRequest(e) => {
                    Some(RequestContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationReady(e) => {
                    Some(ReadyContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationStart(e) => {
                    Some(StartContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationAccept(e) => {
                    Some(AcceptContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationKey(e) => {
                    Some(KeyContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationMac(e) => {
                    Some(MacContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationDone(e) => {
                    Some(DoneContent::from(&e.content).into())
                }
                AnyToDeviceEvent::KeyVerificationCancel(e) => {
                    Some(CancelContent::from(&e.content).into())
                }
                _ => None,
            },
        }
    }
}

impl<'a> From<&'a AnyMessageLikeEvent> for AnyEvent<'a> {
    fn from(e: &'a AnyMessageLikeEvent) -> Self {
        Self::Room(e)
    }
}

impl<'a> From<&'a AnyToDeviceEvent> for AnyEvent<'a> {
    fn from(e: &'a AnyToDeviceEvent) -> Self {
        Self::ToDevice(e)
    }
}

macro_rules! from_for_enum {
    ($type:ident, $enum_variant:ident, $enum:ident) => {
        impl From<$type> for $enum {
            fn from(c: $type) -> Self {
                Self::$enum_variant(c)
            }
        }
    };
}

macro_rules! from_borrow_for_enum {
    ($type:ident, $enum_variant:ident, $enum:ident) => {
        impl<'a> From<&'a $type> for $enum<'a> {
            fn from(c: &'a $type) -> Self {
                Self::$enum_variant(c)
            }
        }
    };
}

macro_rules! from_content_for_any {
    ($type:ident, $enum_variant:ident) => {
        impl<'a> From<$type<'a>> for AnyVerificationContent<'a> {
            fn from(c: $type<'a>) -> Self {
                Self::$enum_variant(c)
            }
        }
    };
}

from_borrow_for_enum!(ToDeviceKeyVerificationRequestEventContent, ToDevice, RequestContent);
from_borrow_for_enum!(KeyVerificationRequestEventContent, Room, RequestContent);
from_borrow_for_enum!(ToDeviceKeyVerificationReadyEventContent, ToDevice, ReadyContent);
from_borrow_for_enum!(KeyVerificationReadyEventContent, Room, ReadyContent);
from_borrow_for_enum!(ToDeviceKeyVerificationStartEventContent, ToDevice, StartContent);
from_borrow_for_enum!(KeyVerificationStartEventContent, Room, StartContent);
from_borrow_for_enum!(ToDeviceKeyVerificationAcceptEventContent, ToDevice, AcceptContent);
from_borrow_for_enum!(KeyVerificationAcceptEventContent, Room, AcceptContent);
from_borrow_for_enum!(ToDeviceKeyVerificationKeyEventContent, ToDevice, KeyContent);
from_borrow_for_enum!(KeyVerificationKeyEventContent, Room, KeyContent);
from_borrow_for_enum!(ToDeviceKeyVerificationMacEventContent, ToDevice, MacContent);
from_borrow_for_enum!(KeyVerificationMacEventContent, Room, MacContent);
from_borrow_for_enum!(ToDeviceKeyVerificationDoneEventContent, ToDevice, DoneContent);
from_borrow_for_enum!(KeyVerificationDoneEventContent, Room, DoneContent);
from_borrow_for_enum!(ToDeviceKeyVerificationCancelEventContent, ToDevice, CancelContent);
from_borrow_for_enum!(KeyVerificationCancelEventContent, Room, CancelContent);

from_content_for_any!(RequestContent, Request);
from_content_for_any!(ReadyContent, Ready);
from_content_for_any!(StartContent, Start);
from_content_for_any!(AcceptContent, Accept);
from_content_for_any!(KeyContent, Key);
from_content_for_any!(MacContent, Mac);
from_content_for_any!(DoneContent, Done);
from_content_for_any!(CancelContent, Cancel);

/// A single verification step, from either transport.
#[derive(Debug)]
pub enum AnyVerificationContent<'a> {
    /// The content of an `m.key.verification.request` event.
    Request(RequestContent<'a>),
    /// The content of an `m.key.verification.ready` event.
    Ready(ReadyContent<'a>),
    /// The content of an `m.key.verification.start` event.
    Start(StartContent<'a>),
    /// The content of an `m.key.verification.accept` event.
    Accept(AcceptContent<'a>),
    /// The content of an `m.key.verification.key` event.
    Key(KeyContent<'a>),
    /// The content of an `m.key.verification.mac` event.
    Mac(MacContent<'a>),
    /// The content of an `m.key.verification.done` event.
    Done(DoneContent<'a>),
    /// The content of an `m.key.verification.cancel` event.
    Cancel(CancelContent<'a>),
}

/// The content of an `m.key.verification.request` event, or of the room
/// message that plays its role in a room.
#[derive(Clone, Copy, Debug)]
pub enum RequestContent<'a> {
    /// The `m.key.verification.request` to-device event content.
    ToDevice(&'a ToDeviceKeyVerificationRequestEventContent),
    /// The `m.room.message` content with the `m.key.verification.request`
    /// msgtype.
    Room(&'a KeyVerificationRequestEventContent),
}

impl RequestContent<'_> {
    /// The device that sent the request.
    pub fn from_device(&self) -> &DeviceId {
        match self {
            Self::ToDevice(c) => &c.from_device,
            Self::Room(c) => &c.from_device,
        }
    }

    /// The verification methods the sender supports.
    pub fn methods(&self) -> &[VerificationMethod] {
        match self {
            Self::ToDevice(c) => &c.methods,
            Self::Room(c) => &c.methods,
        }
    }
}

/// The content of an `m.key.verification.ready` event.
#[derive(Clone, Copy, Debug)]
pub enum ReadyContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationReadyEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationReadyEventContent),
}

impl ReadyContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }

    /// The device that answered the request.
    pub fn from_device(&self) -> &DeviceId {
        match self {
            Self::ToDevice(c) => &c.from_device,
            Self::Room(c) => &c.from_device,
        }
    }

    /// The verification methods both sides support.
    pub fn methods(&self) -> &[VerificationMethod] {
        match self {
            Self::ToDevice(c) => &c.methods,
            Self::Room(c) => &c.methods,
        }
    }
}

/// The content of an `m.key.verification.start` event.
#[derive(Clone, Copy, Debug)]
pub enum StartContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationStartEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationStartEventContent),
}

impl StartContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }

    /// The device that started the verification.
    pub fn from_device(&self) -> &DeviceId {
        match self {
            Self::ToDevice(c) => &c.from_device,
            Self::Room(c) => &c.from_device,
        }
    }

    /// The method specific part of the content.
    pub fn method(&self) -> &StartMethod {
        match self {
            Self::ToDevice(c) => &c.method,
            Self::Room(c) => &c.method,
        }
    }

    /// The canonical JSON form of the content, as it is fed into the
    /// commitment calculation.
    pub fn canonical_json(&self) -> CanonicalJsonValue {
        let content = match self {
            Self::ToDevice(c) => serde_json::to_value(c),
            Self::Room(c) => serde_json::to_value(c),
        };

        content
            .expect("The start event content can always be serialized")
            .try_into()
            .expect("The start event content is always a valid canonical JSON object")
    }
}

/// The content of an `m.key.verification.accept` event.
#[derive(Clone, Copy, Debug)]
pub enum AcceptContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationAcceptEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationAcceptEventContent),
}

impl AcceptContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }

    /// The method specific part of the content.
    pub fn method(&self) -> &AcceptMethod {
        match self {
            Self::ToDevice(c) => &c.method,
            Self::Room(c) => &c.method,
        }
    }
}

/// The content of an `m.key.verification.key` event.
#[derive(Clone, Copy, Debug)]
pub enum KeyContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationKeyEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationKeyEventContent),
}

impl KeyContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }

    /// The ephemeral public key the other side wants to use for the key
    /// agreement.
    pub fn public_key(&self) -> &Base64 {
        match self {
            Self::ToDevice(c) => &c.key,
            Self::Room(c) => &c.key,
        }
    }
}

/// The content of an `m.key.verification.mac` event.
#[derive(Clone, Copy, Debug)]
pub enum MacContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationMacEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationMacEventContent),
}

impl MacContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }

    /// The MACs over the keys the other side wants us to verify, keyed by
    /// key id.
    pub fn mac(&self) -> &BTreeMap<String, Base64> {
        match self {
            Self::ToDevice(c) => &c.mac,
            Self::Room(c) => &c.mac,
        }
    }

    /// The MAC over the list of key ids.
    pub fn keys(&self) -> &Base64 {
        match self {
            Self::ToDevice(c) => &c.keys,
            Self::Room(c) => &c.keys,
        }
    }
}

/// The content of an `m.key.verification.done` event.
#[derive(Clone, Copy, Debug)]
pub enum DoneContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationDoneEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationDoneEventContent),
}

impl DoneContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }
}

/// The content of an `m.key.verification.cancel` event.
#[derive(Clone, Copy, Debug)]
pub enum CancelContent<'a> {
    /// The to-device variant of the content.
    ToDevice(&'a ToDeviceKeyVerificationCancelEventContent),
    /// The in-room variant of the content.
    Room(&'a KeyVerificationCancelEventContent),
}

impl CancelContent<'_> {
    /// The id of the flow this event belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::ToDevice(c) => c.transaction_id.as_str(),
            Self::Room(c) => c.relates_to.event_id.as_str(),
        }
    }

    /// The machine readable cancellation code.
    pub fn cancel_code(&self) -> &CancelCode {
        match self {
            Self::ToDevice(c) => &c.code,
            Self::Room(c) => &c.code,
        }
    }

    /// The human readable cancellation reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::ToDevice(c) => &c.reason,
            Self::Room(c) => &c.reason,
        }
    }
}

/// An owned `m.key.verification.start` content, the form the SAS state
/// machine keeps the sent or received start event in.
#[derive(Clone, Debug)]
pub enum OwnedStartContent {
    /// The to-device variant of the content.
    ToDevice(ToDeviceKeyVerificationStartEventContent),
    /// The in-room variant of the content, with the room it belongs to.
    Room(OwnedRoomId, KeyVerificationStartEventContent),
}

impl OwnedStartContent {
    /// A borrowed view of the content.
    pub fn as_start_content(&self) -> StartContent<'_> {
        match self {
            Self::ToDevice(c) => StartContent::ToDevice(c),
            Self::Room(_, c) => StartContent::Room(c),
        }
    }

    /// A mutable reference to the method specific part of the content.
    pub fn method_mut(&mut self) -> &mut StartMethod {
        match self {
            Self::ToDevice(c) => &mut c.method,
            Self::Room(_, c) => &mut c.method,
        }
    }

    /// The id of the flow this content belongs to.
    pub fn flow_id(&self) -> FlowId {
        match self {
            Self::ToDevice(c) => FlowId::ToDevice(c.transaction_id.clone()),
            Self::Room(r, c) => FlowId::InRoom(r.clone(), c.relates_to.event_id.clone()),
        }
    }

    /// The canonical JSON form of the content.
    pub fn canonical_json(&self) -> CanonicalJsonValue {
        self.as_start_content().canonical_json()
    }
}

from_for_enum!(ToDeviceKeyVerificationStartEventContent, ToDevice, OwnedStartContent);

impl From<(OwnedRoomId, KeyVerificationStartEventContent)> for OwnedStartContent {
    fn from((room_id, content): (OwnedRoomId, KeyVerificationStartEventContent)) -> Self {
        Self::Room(room_id, content)
    }
}

/// An owned `m.key.verification.accept` content.
#[derive(Clone, Debug)]
pub enum OwnedAcceptContent {
    /// The to-device variant of the content.
    ToDevice(ToDeviceKeyVerificationAcceptEventContent),
    /// The in-room variant of the content, with the room it belongs to.
    Room(OwnedRoomId, KeyVerificationAcceptEventContent),
}

impl OwnedAcceptContent {
    /// A mutable reference to the method specific part of the content.
    pub fn method_mut(&mut self) -> &mut AcceptMethod {
        match self {
            Self::ToDevice(c) => &mut c.method,
            Self::Room(_, c) => &mut c.method,
        }
    }
}

from_for_enum!(ToDeviceKeyVerificationAcceptEventContent, ToDevice, OwnedAcceptContent);

impl From<(OwnedRoomId, KeyVerificationAcceptEventContent)> for OwnedAcceptContent {
    fn from((room_id, content): (OwnedRoomId, KeyVerificationAcceptEventContent)) -> Self {
        Self::Room(room_id, content)
    }
}

/// An event content that is ready to be wrapped into an outgoing request.
#[derive(Clone, Debug)]
pub enum OutgoingContent {
    /// A content that should be sent as a room message.
    Room(OwnedRoomId, AnyMessageLikeEventContent),
    /// A content that should be sent as a to-device message.
    ToDevice(AnyToDeviceEventContent),
}

impl From<AnyToDeviceEventContent> for OutgoingContent {
    fn from(content: AnyToDeviceEventContent) -> Self {
        Self::ToDevice(content)
    }
}

impl From<(OwnedRoomId, AnyMessageLikeEventContent)> for OutgoingContent {
    fn from((room_id, content): (OwnedRoomId, AnyMessageLikeEventContent)) -> Self {
        Self::Room(room_id, content)
    }
}

impl From<OwnedStartContent> for OutgoingContent {
    fn from(content: OwnedStartContent) -> Self {
        match content {
            OwnedStartContent::Room(room_id, content) => {
                Self::Room(room_id, AnyMessageLikeEventContent::KeyVerificationStart(content))
            }
            OwnedStartContent::ToDevice(content) => {
                Self::ToDevice(AnyToDeviceEventContent::KeyVerificationStart(content))
            }
        }
    }
}

impl From<OwnedAcceptContent> for OutgoingContent {
    fn from(content: OwnedAcceptContent) -> Self {
        match content {
            OwnedAcceptContent::Room(room_id, content) => {
                Self::Room(room_id, AnyMessageLikeEventContent::KeyVerificationAccept(content))
            }
            OwnedAcceptContent::ToDevice(content) => {
                Self::ToDevice(AnyToDeviceEventContent::KeyVerificationAccept(content))
            }
        }
    }
}

macro_rules! try_from_outgoing_content {
    ($type:ident, $enum_variant:ident) => {
        impl<'a> TryFrom<&'a OutgoingContent> for $type<'a> {
            type Error = ();

            fn try_from(value: &'a OutgoingContent) -> Result<Self, Self::Error> {
                match value {
                    OutgoingContent::Room(_, c) => {
                        if let AnyMessageLikeEventContent::$enum_variant(c) = c {
                            Ok(Self::Room(c))
                        } else {
                            Err(())
                        }
                    }
                    OutgoingContent::ToDevice(c) => {
                        if let AnyToDeviceEventContent::$enum_variant(c) = c {
                            Ok(Self::ToDevice(c))
                        } else {
                            Err(())
                        }
                    }
                }
            }
        }
    };
}

impl<'a> TryFrom<&'a OutgoingContent> for RequestContent<'a> {
    type Error = ();

    fn try_from(value: &'a OutgoingContent) -> Result<Self, Self::Error> {
        match value {
            OutgoingContent::Room(_, AnyMessageLikeEventContent::RoomMessage(m)) => {
                if let MessageType::VerificationRequest(c) = &m.msgtype {
                    Ok(Self::Room(c))
                } else {
                    Err(())
                }
            }
            OutgoingContent::ToDevice(AnyToDeviceEventContent::KeyVerificationRequest(c)) => {
                Ok(Self::ToDevice(c))
            }
            _ => Err(()),
        }
    }
}

try_from_outgoing_content!(ReadyContent, KeyVerificationReady);
try_from_outgoing_content!(StartContent, KeyVerificationStart);
try_from_outgoing_content!(AcceptContent, KeyVerificationAccept);
try_from_outgoing_content!(KeyContent, KeyVerificationKey);
try_from_outgoing_content!(MacContent, KeyVerificationMac);
try_from_outgoing_content!(DoneContent, KeyVerificationDone);
try_from_outgoing_content!(CancelContent, KeyVerificationCancel);

impl TryFrom<&ToDeviceRequest> for OutgoingContent {
    type Error = String;

    fn try_from(request: &ToDeviceRequest) -> Result<Self, Self::Error> {
        use ruma::events::ToDeviceEventType;
        use serde_json::Value;

        let json: Value = serde_json::from_str(
            request
                .messages
                .values()
                .next()
                .and_then(|m| m.values().next())
                .map(|c| c.json().get())
                .ok_or_else(|| "Content is missing from the request".to_owned())?,
        )
        .map_err(|e| e.to_string())?;

        let content = match &request.event_type {
            ToDeviceEventType::KeyVerificationRequest => {
                AnyToDeviceEventContent::KeyVerificationRequest(
                    serde_json::from_value(json).map_err(|e| e.to_string())?,
                )
            }
            ToDeviceEventType::KeyVerificationReady => {
                AnyToDeviceEventContent::KeyVerificationReady(
                    serde_json::from_value(json).map_err(|e| e.to_string())?,
                )
            }
            ToDeviceEventType::KeyVerificationStart => {
                AnyToDeviceEventContent::KeyVerificationStart(
                    serde_json::from_value(json).map_err(|e| e.to_string())?,
                )
            }
            ToDeviceEventType::KeyVerificationAccept => {
                AnyToDeviceEventContent::KeyVerificationAccept(
                    serde_json::from_value(json).map_err(|e| e.to_string())?,
                )
            }
            ToDeviceEventType::KeyVerificationKey => AnyToDeviceEventContent::KeyVerificationKey(
                serde_json::from_value(json).map_err(|e| e.to_string())?,
            ),
            ToDeviceEventType::KeyVerificationMac => AnyToDeviceEventContent::KeyVerificationMac(
                serde_json::from_value(json).map_err(|e| e.to_string())?,
            ),
            ToDeviceEventType::KeyVerificationDone => AnyToDeviceEventContent::KeyVerificationDone(
                serde_json::from_value(json).map_err(|e| e.to_string())?,
            ),
            ToDeviceEventType::KeyVerificationCancel => {
                AnyToDeviceEventContent::KeyVerificationCancel(
                    serde_json::from_value(json).map_err(|e| e.to_string())?,
                )
            }
            e => return Err(format!("Unsupported event type {e}")),
        };

        Ok(Self::ToDevice(content))
    }
}

impl TryFrom<&OutgoingVerificationRequest> for OutgoingContent {
    type Error = String;

    fn try_from(request: &OutgoingVerificationRequest) -> Result<Self, Self::Error> {
        match request {
            OutgoingVerificationRequest::ToDevice(r) => Self::try_from(r),
            OutgoingVerificationRequest::InRoom(r) => {
                Ok(Self::Room(r.room_id.clone(), r.content.clone()))
            }
        }
    }
}
