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

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use qrcode::QrCode;
use ruma::serde::Base64;
use vodozemac::Ed25519PublicKey;

use crate::error::{DecodingError, EncodingError};

const HEADER: &[u8; 6] = b"MATRIX";
const VERSION: u8 = 0x02;
const MIN_SECRET_LEN: usize = 8;

/// The verification mode a QR code payload was generated for.
///
/// The mode decides which identity keys the two 32-byte key slots carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrMode {
    /// Verifying another user.
    ///
    /// The first key is the master cross-signing key of the displaying user,
    /// the second key is what the displaying device believes the scanning
    /// user's master key to be.
    CrossUser,
    /// Verifying another device of our own user, where the displaying device
    /// already trusts the master cross-signing key.
    ///
    /// The first key is the master key, the second one the scanning device's
    /// own Ed25519 key.
    SelfTrusted,
    /// Verifying another device of our own user, where the displaying device
    /// does not yet trust the master cross-signing key.
    ///
    /// The first key is the displaying device's own Ed25519 key, the second
    /// one the master key.
    SelfUntrusted,
}

impl QrMode {
    fn from_byte(byte: u8) -> Result<Self, DecodingError> {
        match byte {
            0x00 => Ok(Self::CrossUser),
            0x01 => Ok(Self::SelfTrusted),
            0x02 => Ok(Self::SelfUntrusted),
            b => Err(DecodingError::Mode(b)),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::CrossUser => 0x00,
            Self::SelfTrusted => 0x01,
            Self::SelfUntrusted => 0x02,
        }
    }
}

/// The decoded payload of a verification QR code.
///
/// The byte layout, defined by the wire protocol, is:
///
/// * the ASCII string `MATRIX`
/// * one version byte, must be `0x02`
/// * one mode byte, see [`QrMode`]
/// * the flow id (the event id or transaction id of the verification
///   request), prefixed by its length in bytes as a big-endian `u16`
/// * the first key, 32 bytes
/// * the second key, 32 bytes
/// * the remainder of the payload is a random shared secret, at least 8
///   bytes long
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrVerificationData {
    mode: QrMode,
    flow_id: String,
    first_key: Ed25519PublicKey,
    second_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl QrVerificationData {
    /// Create a payload for verifying another user.
    ///
    /// `own_master_key` is our own master cross-signing key,
    /// `other_master_key` what we believe the other user's master key to be.
    pub fn cross_user(
        flow_id: String,
        own_master_key: Ed25519PublicKey,
        other_master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self {
            mode: QrMode::CrossUser,
            flow_id,
            first_key: own_master_key,
            second_key: other_master_key,
            shared_secret,
        }
    }

    /// Create a payload for self-verification where we trust the master
    /// cross-signing key.
    pub fn self_trusted(
        flow_id: String,
        master_key: Ed25519PublicKey,
        other_device_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self {
            mode: QrMode::SelfTrusted,
            flow_id,
            first_key: master_key,
            second_key: other_device_key,
            shared_secret,
        }
    }

    /// Create a payload for self-verification where we don't yet trust the
    /// master cross-signing key.
    pub fn self_untrusted(
        flow_id: String,
        own_device_key: Ed25519PublicKey,
        master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self {
            mode: QrMode::SelfUntrusted,
            flow_id,
            first_key: own_device_key,
            second_key: master_key,
            shared_secret,
        }
    }

    /// Parse the decoded payload of a scanned QR code.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        let mut cursor = Cursor::new(bytes);

        let mut header = [0u8; 6];
        cursor.read_exact(&mut header)?;
        let version = cursor.read_u8()?;
        let mode = cursor.read_u8()?;

        if &header != HEADER {
            return Err(DecodingError::Header);
        } else if version != VERSION {
            return Err(DecodingError::Version(version));
        }

        let mode = QrMode::from_byte(mode)?;

        let flow_id_len = cursor.read_u16::<BigEndian>()?;
        let mut flow_id = vec![0u8; flow_id_len.into()];
        cursor.read_exact(&mut flow_id)?;

        let mut first_key = [0u8; 32];
        let mut second_key = [0u8; 32];
        cursor.read_exact(&mut first_key)?;
        cursor.read_exact(&mut second_key)?;

        let mut shared_secret = Vec::new();
        cursor.read_to_end(&mut shared_secret)?;

        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(DecodingError::SharedSecret(shared_secret.len()));
        }

        Ok(Self {
            mode,
            flow_id: String::from_utf8(flow_id)?,
            first_key: Ed25519PublicKey::from_slice(&first_key)?,
            second_key: Ed25519PublicKey::from_slice(&second_key)?,
            shared_secret: Base64::new(shared_secret),
        })
    }

    /// Encode the payload into the raw bytes a QR code should carry.
    ///
    /// This is the exact inverse of [`QrVerificationData::from_bytes()`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let flow_id_len: u16 = self
            .flow_id
            .len()
            .try_into()
            .map_err(|_| EncodingError::FlowIdLength(self.flow_id.len()))?;

        let mut bytes = Vec::with_capacity(8 + 2 + self.flow_id.len() + 64);

        bytes.extend_from_slice(HEADER);
        bytes.push(VERSION);
        bytes.push(self.mode.as_byte());
        bytes.extend_from_slice(&flow_id_len.to_be_bytes());
        bytes.extend_from_slice(self.flow_id.as_bytes());
        bytes.extend_from_slice(self.first_key.as_bytes());
        bytes.extend_from_slice(self.second_key.as_bytes());
        bytes.extend_from_slice(self.shared_secret.as_bytes());

        Ok(bytes)
    }

    /// Render the payload as a `QrCode` that can be displayed and scanned.
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        Ok(QrCode::new(self.to_bytes()?)?)
    }

    /// The mode of this payload.
    pub fn mode(&self) -> QrMode {
        self.mode
    }

    /// The id of the verification flow this payload belongs to.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// The key in the first key slot, its meaning depends on the mode.
    pub fn first_key(&self) -> Ed25519PublicKey {
        self.first_key
    }

    /// The key in the second key slot, its meaning depends on the mode.
    pub fn second_key(&self) -> Ed25519PublicKey {
        self.second_key
    }

    /// The random shared secret embedded into the QR code.
    pub fn secret(&self) -> &Base64 {
        &self.shared_secret
    }
}

impl TryFrom<&[u8]> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl TryFrom<Vec<u8>> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}
