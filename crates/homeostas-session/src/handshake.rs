// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary framed session handshake (`session`, C12, §4.4 and §6).

use homeostas_digest::{digest, Key512, LightCipher};

/// Total handshake packet length on the wire (§6).
pub const PACKET_LEN: usize = 196;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Proto {
    Raw = 0,
    V1 = 1,
}

impl Proto {
    fn from_u8(v: u8) -> Self {
        if v == 1 {
            Proto::V1
        } else {
            Proto::Raw
        }
    }
}

/// Per-field negotiation stance (§4.4 "Negotiation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionMode {
    Disable = 0,
    Allow = 1,
    Prefer = 2,
    Required = 3,
}

impl OptionMode {
    fn from_u8(v: u8) -> Self {
        match v & 0b11 {
            0 => OptionMode::Disable,
            1 => OptionMode::Allow,
            2 => OptionMode::Prefer,
            _ => OptionMode::Required,
        }
    }
}

/// Encryption/compression algorithm id space; values `>= MAX_ALGO` are
/// rejected by the negotiation rules (§4.4 "Enc id out of range").
pub const MAX_ALGO: u8 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum HandshakeError {
    #[error("protocol version mismatch")]
    InvalidProto,
    #[error("encryption disabled by the server but required by the client")]
    EncryptionDisabled,
    #[error("encryption required by the server but disabled by the client")]
    EncryptionRequired,
    #[error("client requested an out-of-range encryption algorithm")]
    InvalidEncryption,
    #[error("compression disabled by the server but required by the client")]
    CompressionDisabled,
    #[error("compression required by the server but disabled by the client")]
    CompressionRequired,
    #[error("client requested an out-of-range compression algorithm")]
    InvalidCompression,
}

/// One (un-scrambled) handshake packet. `error` mirrors `HandshakeError` as a
/// wire byte (0 = none) so a rejecting side can still reply per §8 scenario 4.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakePacket {
    pub session_key: Key512,
    pub public_key: Key512,
    pub fingerprint: Key512,
    pub error: u8,
    pub proto_version: u8,
    pub encryption: u8,
    pub encryption_option: OptionMode,
    pub compression: u8,
    pub compression_option: OptionMode,
}

impl HandshakePacket {
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[0..64].copy_from_slice(self.session_key.as_slice());
        buf[64..128].copy_from_slice(self.public_key.as_slice());
        buf[128..192].copy_from_slice(self.fingerprint.as_slice());
        buf[192] = self.error;
        buf[193] = self.proto_version;
        buf[194] = (self.encryption & 0x3f) | ((self.encryption_option as u8) << 6);
        buf[195] = (self.compression & 0x3f) | ((self.compression_option as u8) << 6);
        buf
    }

    pub fn decode(buf: &[u8; PACKET_LEN]) -> Self {
        let key_from = |s: &[u8]| {
            let mut arr = [0u8; 64];
            arr.copy_from_slice(s);
            Key512(arr)
        };
        HandshakePacket {
            session_key: key_from(&buf[0..64]),
            public_key: key_from(&buf[64..128]),
            fingerprint: key_from(&buf[128..192]),
            error: buf[192],
            proto_version: buf[193],
            encryption: buf[194] & 0x3f,
            encryption_option: OptionMode::from_u8(buf[194] >> 6),
            compression: buf[195] & 0x3f,
            compression_option: OptionMode::from_u8(buf[195] >> 6),
        }
    }

    pub fn proto(&self) -> Proto {
        Proto::from_u8(self.proto_version)
    }
}

/// XOR everything after `session_key` with the `light_cipher` keystream
/// keyed by `session_key` (§4.4: "self-scrambled"). Applying it twice is the
/// identity (§8 "Handshake scramble involution").
pub fn scramble(key: &Key512, buf: &mut [u8; PACKET_LEN]) {
    let mut cipher = LightCipher::new(*key);
    cipher.apply(&mut buf[64..]);
}

fn check_required_pair(
    client: OptionMode,
    server: OptionMode,
    disabled_err: HandshakeError,
    required_err: HandshakeError,
) -> Result<(), HandshakeError> {
    if client == OptionMode::Required && server == OptionMode::Disable {
        return Err(disabled_err);
    }
    if client == OptionMode::Disable && server == OptionMode::Required {
        return Err(required_err);
    }
    Ok(())
}

/// The server's local policy for one handshake field.
#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy {
    pub option: OptionMode,
    pub algo: u8,
}

/// Server-side negotiation result: the algorithm ids actually selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub encryption: u8,
    pub compression: u8,
}

/// Apply §4.4's negotiation rules from the server's perspective. On success,
/// returns the algorithms the server should reply with.
pub fn negotiate_server(
    client: &HandshakePacket,
    server_proto: Proto,
    encryption_policy: FieldPolicy,
    compression_policy: FieldPolicy,
) -> Result<Negotiated, HandshakeError> {
    if client.proto() != server_proto {
        return Err(HandshakeError::InvalidProto);
    }
    if client.encryption >= MAX_ALGO {
        return Err(HandshakeError::InvalidEncryption);
    }
    if client.compression >= MAX_ALGO {
        return Err(HandshakeError::InvalidCompression);
    }

    check_required_pair(
        client.encryption_option,
        encryption_policy.option,
        HandshakeError::EncryptionDisabled,
        HandshakeError::EncryptionRequired,
    )?;
    check_required_pair(
        client.compression_option,
        compression_policy.option,
        HandshakeError::CompressionDisabled,
        HandshakeError::CompressionRequired,
    )?;

    Ok(Negotiated {
        encryption: pick_algo(encryption_policy, client.encryption),
        compression: pick_algo(compression_policy, client.compression),
    })
}

fn pick_algo(policy: FieldPolicy, client_algo: u8) -> u8 {
    match policy.option {
        OptionMode::Disable => 0,
        OptionMode::Allow => client_algo,
        OptionMode::Prefer | OptionMode::Required => policy.algo,
    }
}

/// Derives the local/remote transport keys from the handshake material
/// (§4.4: "an application-supplied key-derivation functor... deterministic,
/// two 64-byte keys from the two packets"). Keyed on a domain-separating tag
/// so the local and remote keys never collide even for a symmetric peer.
pub fn derive_transport_keys(
    public_key: &Key512,
    session_key: &Key512,
    fingerprint: &Key512,
) -> (Key512, Key512) {
    let mut local_input = Vec::with_capacity(64 * 3 + 1);
    local_input.extend_from_slice(public_key.as_slice());
    local_input.extend_from_slice(session_key.as_slice());
    local_input.extend_from_slice(fingerprint.as_slice());
    local_input.push(b'L');
    let local = digest(&local_input);

    let mut remote_input = local_input;
    *remote_input.last_mut().unwrap() = b'R';
    let remote = digest(&remote_input);

    (local, remote)
}
