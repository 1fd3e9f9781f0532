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

use std::collections::BTreeMap;

use ruma::{
    events::{
        key::verification::{
            cancel::CancelCode,
            mac::{KeyVerificationMacEventContent, ToDeviceKeyVerificationMacEventContent},
        },
        relation::Reference,
        AnyMessageLikeEventContent, AnyToDeviceEventContent,
    },
    serde::Base64,
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceKeyId, UserId,
};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use vodozemac::{
    sas::{EstablishedSas, SasBytes},
    Curve25519PublicKey,
};

use super::sas_state::SupportedMacMethod;
use crate::{
    channel::FlowId,
    event_enums::{MacContent, OutgoingContent, StartContent},
    store::{DeviceData, OwnAccount, UserIdentityData},
    Emoji,
};

/// Everyone involved in a single SAS flow: our own account and identity, and
/// the device and identity on the other end.
#[derive(Clone, Debug)]
pub struct SasIds {
    pub account: OwnAccount,
    pub own_identity: Option<UserIdentityData>,
    pub other_device: DeviceData,
    pub other_identity: Option<UserIdentityData>,
}

/// The emoji table of the SAS emoji method, in index order.
///
/// Defined by the sas-emoji.json data definition, which also carries the
/// translations of the descriptions.
const SAS_EMOJI: [Emoji; 64] = [
    Emoji { symbol: "🐶", description: "Dog" },
    Emoji { symbol: "🐱", description: "Cat" },
    Emoji { symbol: "🦁", description: "Lion" },
    Emoji { symbol: "🐎", description: "Horse" },
    Emoji { symbol: "🦄", description: "Unicorn" },
    Emoji { symbol: "🐷", description: "Pig" },
    Emoji { symbol: "🐘", description: "Elephant" },
    Emoji { symbol: "🐰", description: "Rabbit" },
    Emoji { symbol: "🐼", description: "Panda" },
    Emoji { symbol: "🐓", description: "Rooster" },
    Emoji { symbol: "🐧", description: "Penguin" },
    Emoji { symbol: "🐢", description: "Turtle" },
    Emoji { symbol: "🐟", description: "Fish" },
    Emoji { symbol: "🐙", description: "Octopus" },
    Emoji { symbol: "🦋", description: "Butterfly" },
    Emoji { symbol: "🌷", description: "Flower" },
    Emoji { symbol: "🌳", description: "Tree" },
    Emoji { symbol: "🌵", description: "Cactus" },
    Emoji { symbol: "🍄", description: "Mushroom" },
    Emoji { symbol: "🌏", description: "Globe" },
    Emoji { symbol: "🌙", description: "Moon" },
    Emoji { symbol: "☁️", description: "Cloud" },
    Emoji { symbol: "🔥", description: "Fire" },
    Emoji { symbol: "🍌", description: "Banana" },
    Emoji { symbol: "🍎", description: "Apple" },
    Emoji { symbol: "🍓", description: "Strawberry" },
    Emoji { symbol: "🌽", description: "Corn" },
    Emoji { symbol: "🍕", description: "Pizza" },
    Emoji { symbol: "🎂", description: "Cake" },
    Emoji { symbol: "❤️", description: "Heart" },
    Emoji { symbol: "😀", description: "Smiley" },
    Emoji { symbol: "🤖", description: "Robot" },
    Emoji { symbol: "🎩", description: "Hat" },
    Emoji { symbol: "👓", description: "Glasses" },
    Emoji { symbol: "🔧", description: "Spanner" },
    Emoji { symbol: "🎅", description: "Santa" },
    Emoji { symbol: "👍", description: "Thumbs Up" },
    Emoji { symbol: "☂️", description: "Umbrella" },
    Emoji { symbol: "⌛", description: "Hourglass" },
    Emoji { symbol: "⏰", description: "Clock" },
    Emoji { symbol: "🎁", description: "Gift" },
    Emoji { symbol: "💡", description: "Light Bulb" },
    Emoji { symbol: "📕", description: "Book" },
    Emoji { symbol: "✏️", description: "Pencil" },
    Emoji { symbol: "📎", description: "Paperclip" },
    Emoji { symbol: "✂️", description: "Scissors" },
    Emoji { symbol: "🔒", description: "Lock" },
    Emoji { symbol: "🔑", description: "Key" },
    Emoji { symbol: "🔨", description: "Hammer" },
    Emoji { symbol: "☎️", description: "Telephone" },
    Emoji { symbol: "🏁", description: "Flag" },
    Emoji { symbol: "🚂", description: "Train" },
    Emoji { symbol: "🚲", description: "Bicycle" },
    Emoji { symbol: "✈️", description: "Aeroplane" },
    Emoji { symbol: "🚀", description: "Rocket" },
    Emoji { symbol: "🏆", description: "Trophy" },
    Emoji { symbol: "⚽", description: "Ball" },
    Emoji { symbol: "🎸", description: "Guitar" },
    Emoji { symbol: "🎺", description: "Trumpet" },
    Emoji { symbol: "🔔", description: "Bell" },
    Emoji { symbol: "⚓", description: "Anchor" },
    Emoji { symbol: "🎧", description: "Headphones" },
    Emoji { symbol: "📁", description: "Folder" },
    Emoji { symbol: "📌", description: "Pin" },
];

/// Calculate the commitment that goes into our accept event.
///
/// The commitment is the hash of our ephemeral public key concatenated with
/// the canonical JSON of the start event content, so the key we later reveal
/// can be checked against what we committed to.
pub fn calculate_commitment(public_key: Curve25519PublicKey, content: &StartContent<'_>) -> Base64 {
    let start_content = content.canonical_json().to_string();

    let hash = Sha256::new()
        .chain_update(public_key.to_base64())
        .chain_update(start_content)
        .finalize();

    Base64::new(hash.as_slice().to_owned())
}

/// The info string MACs are keyed with.
///
/// The pair that generated the MACs comes first, the receiving pair second.
fn mac_info(
    first: (&UserId, &DeviceId),
    second: (&UserId, &DeviceId),
    flow_id: &str,
) -> String {
    let (first_user, first_device) = first;
    let (second_user, second_device) = second;

    format!(
        "MATRIX_KEY_VERIFICATION_MAC\
        {first_user}{first_device}{second_user}{second_device}{flow_id}"
    )
}

fn mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    mac_info(
        (ids.other_device.user_id(), ids.other_device.device_id()),
        (&ids.account.user_id, &ids.account.device_id),
        flow_id,
    )
}

fn mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    mac_info(
        (&ids.account.user_id, &ids.account.device_id),
        (ids.other_device.user_id(), ids.other_device.device_id()),
        flow_id,
    )
}

/// Check the MACs of a received `m.key.verification.mac` event.
///
/// First validates the MAC over the sorted list of key ids, then each per-key
/// MAC against the key we have on record for that id. Key ids we know nothing
/// about are logged and skipped, a MAC that fails to validate rejects the
/// whole event.
///
/// Returns the devices and user identities whose keys the MACs vouched for.
pub fn receive_mac_event(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    sender: &UserId,
    mac_method: SupportedMacMethod,
    content: &MacContent<'_>,
) -> Result<(Vec<DeviceData>, Vec<UserIdentityData>), CancelCode> {
    let info = mac_info_receive(ids, flow_id);

    trace!(
        ?sender,
        device_id = ?ids.other_device.device_id(),
        "Received a key.verification.mac event"
    );

    let mut key_ids: Vec<&str> = content.mac().keys().map(|k| k.as_str()).collect();
    key_ids.sort_unstable();
    mac_method.verify_mac(sas, &key_ids.join(","), &format!("{info}KEY_IDS"), content.keys())?;

    let mut verified_devices = Vec::new();
    let mut verified_identities = Vec::new();

    for (key_id, key_mac) in content.mac() {
        trace!(
            ?sender,
            device_id = ?ids.other_device.device_id(),
            key_id,
            "Checking a SAS MAC",
        );

        let Ok(key_id) = OwnedDeviceKeyId::try_from(key_id.as_str()) else {
            continue;
        };

        if let Some(key) = ids.other_device.keys().get(&key_id) {
            mac_method.verify_mac(sas, key, &format!("{info}{key_id}"), key_mac)?;
            trace!(?sender, ?key_id, "Successfully verified a device key");
            verified_devices.push(ids.other_device.clone());
        } else if let Some(identity) =
            ids.other_identity.as_ref().filter(|i| key_id.as_str() == i.master_key_id())
        {
            mac_method.verify_mac(
                sas,
                &identity.master_key().to_base64(),
                &format!("{info}{key_id}"),
                key_mac,
            )?;
            trace!(?sender, ?key_id, "Successfully verified a master key");
            verified_identities.push(identity.clone());
        } else {
            warn!(
                "Key ID {key_id} in MAC event from {sender} {} doesn't belong to any device \
                or user identity",
                ids.other_device.device_id()
            );
        }
    }

    Ok((verified_devices, verified_identities))
}

/// Build the content of our own `m.key.verification.mac` event.
///
/// MACs our device key, and our master cross-signing key when our own
/// identity is verified, then adds the MAC over the sorted list of key ids.
pub fn get_mac_content(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &FlowId,
    mac_method: SupportedMacMethod,
) -> OutgoingContent {
    let info = mac_info_send(ids, flow_id.as_str());
    let mut mac: BTreeMap<String, Base64> = BTreeMap::new();

    let device_key_id =
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &ids.account.device_id);
    mac.insert(
        device_key_id.to_string(),
        mac_method.calculate_mac(
            sas,
            &ids.account.ed25519_key.to_base64(),
            &format!("{info}{device_key_id}"),
        ),
    );

    if let Some(identity) = ids.own_identity.as_ref().filter(|i| i.is_verified()) {
        let master_key_id = identity.master_key_id();
        let master_key_mac = mac_method.calculate_mac(
            sas,
            &identity.master_key().to_base64(),
            &format!("{info}{master_key_id}"),
        );

        mac.insert(master_key_id, master_key_mac);
    }

    let mut key_ids: Vec<&str> = mac.keys().map(|s| s.as_str()).collect();
    key_ids.sort_unstable();
    let keys = mac_method.calculate_mac(sas, &key_ids.join(","), &format!("{info}KEY_IDS"));

    match flow_id {
        FlowId::ToDevice(t) => AnyToDeviceEventContent::KeyVerificationMac(
            ToDeviceKeyVerificationMacEventContent::new(t.clone(), mac, keys),
        )
        .into(),
        FlowId::InRoom(r, e) => (
            r.clone(),
            AnyMessageLikeEventContent::KeyVerificationMac(KeyVerificationMacEventContent::new(
                mac,
                keys,
                Reference::new(e.clone()),
            )),
        )
            .into(),
    }
}

/// The info string the short auth string bytes are derived with.
///
/// Both (user, device, public key) triples go in, the starting side's triple
/// first so both sides derive the same bytes.
fn sas_info(
    ids: &SasIds,
    own_pubkey: Curve25519PublicKey,
    their_pubkey: Curve25519PublicKey,
    flow_id: &str,
    we_started: bool,
) -> String {
    let ours =
        format!("{}|{}|{}", ids.account.user_id, ids.account.device_id, own_pubkey.to_base64());
    let theirs = format!(
        "{}|{}|{}",
        ids.other_device.user_id(),
        ids.other_device.device_id(),
        their_pubkey.to_base64()
    );

    let (first, second) = if we_started { (ours, theirs) } else { (theirs, ours) };
    let info = format!("MATRIX_KEY_VERIFICATION_SAS|{first}|{second}|{flow_id}");

    trace!("Generated a SAS extra info: {}", info);

    info
}

fn short_auth_bytes(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> SasBytes {
    sas.bytes(&sas_info(ids, sas.our_public_key(), sas.their_public_key(), flow_id, we_started))
}

/// The emoji representation of the short auth string, seven emojis with
/// their English descriptions.
pub fn get_emoji(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [Emoji; 7] {
    short_auth_bytes(sas, ids, flow_id, we_started)
        .emoji_indices()
        .map(|index| SAS_EMOJI[usize::from(index)])
}

/// The emoji indices of the short auth string, seven numbers between 0 and
/// 63 inclusive.
///
/// Useful for clients that ship their own, possibly translated, emoji table.
pub fn get_emoji_index(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [u8; 7] {
    short_auth_bytes(sas, ids, flow_id, we_started).emoji_indices()
}

/// The decimal representation of the short auth string, three numbers
/// between 1000 and 9191 inclusive.
pub fn get_decimal(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> (u16, u16, u16) {
    short_auth_bytes(sas, ids, flow_id, we_started).decimals()
}

#[cfg(test)]
mod tests {
    use ruma::{
        events::key::verification::start::ToDeviceKeyVerificationStartEventContent, serde::Base64,
    };
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::calculate_commitment;
    use crate::event_enums::StartContent;

    #[test]
    fn commitment_calculation() {
        let commitment = Base64::parse("CCQmB4JCdB0FW21FdAnHj/Hu8+W9+Nb0vgwPEnZZQ4g").unwrap();

        let public_key =
            Curve25519PublicKey::from_base64("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg")
                .unwrap();
        let content = json!({
            "from_device":"XOWLHHFSWM",
            "transaction_id":"bYxBsirjUJO9osar6ST4i2M2NjrYLA7l",
            "method":"m.sas.v1",
            "key_agreement_protocols":["curve25519-hkdf-sha256","curve25519"],
            "hashes":["sha256"],
            "message_authentication_codes":["hkdf-hmac-sha256","hmac-sha256"],
            "short_authentication_string":["decimal","emoji"]
        });

        let content: ToDeviceKeyVerificationStartEventContent =
            serde_json::from_value(content).unwrap();
        let content = StartContent::from(&content);
        let calculated_commitment = calculate_commitment(public_key, &content);

        assert_eq!(commitment, calculated_commitment);
    }
}
