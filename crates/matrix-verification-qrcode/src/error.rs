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

use thiserror::Error;

/// Error for the decoding of a scanned QR code payload.
#[derive(Debug, Error)]
pub enum DecodingError {
    /// The payload is missing the mandatory `MATRIX` header.
    #[error("the QR code is missing the mandatory header")]
    Header,
    /// The payload declares a version we don't support.
    #[error("the QR code contains an unsupported version: {0}")]
    Version(u8),
    /// The payload declares an unknown verification mode.
    #[error("the QR code contains an unknown verification mode: {0}")]
    Mode(u8),
    /// The payload was truncated or otherwise too short to read.
    #[error("the QR code can't be read: {0}")]
    Read(#[from] std::io::Error),
    /// The embedded Ed25519 keys are invalid.
    #[error("the QR code contains invalid identity keys: {0}")]
    Keys(#[from] vodozemac::KeyError),
    /// The flow id isn't valid UTF-8.
    #[error("the QR code contains a non UTF-8 flow id: {0}")]
    FlowId(#[from] std::string::FromUtf8Error),
    /// The trailing shared secret is shorter than the protocol minimum.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),
}

/// Error for the encoding of a QR code payload.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The payload doesn't fit into a QR code.
    #[error("the data doesn't fit into a QR code: {0}")]
    Qr(#[from] qrcode::types::QrError),
    /// The flow id is longer than a 16 bit length prefix can express.
    #[error("the verification flow id is too long to be encoded: {0} bytes")]
    FlowIdLength(usize),
}
