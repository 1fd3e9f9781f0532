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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs)]

mod error;
mod types;

pub use error::{DecodingError, EncodingError};
pub use qrcode;
pub use types::{QrMode, QrVerificationData};

#[cfg(test)]
mod tests {
    use vodozemac::Ed25519SecretKey;

    use crate::{DecodingError, QrMode, QrVerificationData};

    #[test]
    fn decode_invalid_header() {
        let data = b"NonMatrixCode";
        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::Header)));
    }

    #[test]
    fn decode_invalid_version() {
        let data = b"MATRIX\x01\x03";
        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::Version(1))));
    }

    #[test]
    fn decode_invalid_mode() {
        let data = b"MATRIX\x02\x03";
        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::Mode(3))));
    }

    #[test]
    fn decode_missing_data() {
        let data = b"MATRIX\x02\x02";
        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::Read(_))));
    }

    #[test]
    fn decode_short_secret() {
        let data = b"MATRIX\
                   \x02\x02\x00\x07\
                   FLOW_ID\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRET";

        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::SharedSecret(6))));
    }

    #[test]
    fn decode_invalid_keys() {
        let data = b"MATRIX\
                   \x02\x00\x00\x0f\
                   $test:localhost\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRETISLONGENOUGH";
        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::Keys(_))));
    }

    #[test]
    fn encode_decode_round_trip() {
        let first_key = Ed25519SecretKey::new().public_key();
        let second_key = Ed25519SecretKey::new().public_key();

        let data = QrVerificationData::cross_user(
            "$event_id:localhost".to_owned(),
            first_key,
            second_key,
            ruma::serde::Base64::new(b"SHARED_SECRET".to_vec()),
        );

        let bytes = data.to_bytes().unwrap();
        assert_eq!(&bytes[..8], b"MATRIX\x02\x00");

        let decoded = QrVerificationData::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, data);
        assert_eq!(decoded.mode(), QrMode::CrossUser);
        assert_eq!(decoded.flow_id(), "$event_id:localhost");
        assert_eq!(decoded.secret().as_bytes(), b"SHARED_SECRET");
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn self_verification_modes() {
        let master_key = Ed25519SecretKey::new().public_key();
        let device_key = Ed25519SecretKey::new().public_key();
        let secret = ruma::serde::Base64::new(b"SHARED_SECRET".to_vec());

        let trusted = QrVerificationData::self_trusted(
            "FLOWID".to_owned(),
            master_key,
            device_key,
            secret.clone(),
        );
        let untrusted =
            QrVerificationData::self_untrusted("FLOWID".to_owned(), device_key, master_key, secret);

        let trusted = QrVerificationData::from_bytes(trusted.to_bytes().unwrap()).unwrap();
        let untrusted = QrVerificationData::from_bytes(untrusted.to_bytes().unwrap()).unwrap();

        assert_eq!(trusted.mode(), QrMode::SelfTrusted);
        assert_eq!(trusted.first_key(), master_key);
        assert_eq!(untrusted.mode(), QrMode::SelfUntrusted);
        assert_eq!(untrusted.second_key(), master_key);
    }
}
