// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session establishment: runs the handshake over a raw transport and hands
//! back a keyed [`FramedStream`] (C12, §4.4 "Negotiation").

use crate::error::{Result, SessionError};
use crate::framed::FramedStream;
use crate::handshake::{
    derive_transport_keys, negotiate_server, scramble, FieldPolicy, HandshakeError,
    HandshakePacket, Negotiated, OptionMode, Proto, PACKET_LEN,
};
use homeostas_digest::{Cipher, Key512, LightCipher, StrongCipher};
use rand::RngCore;
use std::io::{Read, Write};

/// Encryption/compression algorithm ids this build implements (§4.2, §4.4).
/// `0 = none`, `1 = light_cipher`, `2 = strong_cipher`; ids `>= MAX_ALGO`
/// are rejected during negotiation.
fn cipher_for_algo(algo: u8, key: Key512) -> Cipher {
    match algo {
        1 => Cipher::Light(LightCipher::new(key)),
        2 => Cipher::Strong(StrongCipher::new(key)),
        _ => Cipher::None,
    }
}

/// This host's local handshake policy, supplied by the caller (the
/// supervisor reads these from configuration; §4.4 leaves the policy itself
/// out of the core contract).
#[derive(Debug, Clone, Copy)]
pub struct LocalPolicy {
    pub public_key: Key512,
    pub fingerprint: Key512,
    pub encryption: FieldPolicy,
    pub compression: FieldPolicy,
}

fn write_packet<T: Read + Write>(transport: &mut T, packet: &HandshakePacket) -> Result<()> {
    let mut buf = packet.encode();
    scramble(&packet.session_key, &mut buf);
    transport.write_all(&buf)?;
    Ok(())
}

fn read_packet<T: Read + Write>(transport: &mut T, session_key: Key512) -> Result<HandshakePacket> {
    let mut buf = [0u8; PACKET_LEN];
    transport.read_exact(&mut buf)?;
    scramble(&session_key, &mut buf);
    Ok(HandshakePacket::decode(&buf))
}

/// Client side of §4.4 step 2-4: send our offer, read the server's reply,
/// derive transport keys, and hand back a keyed [`FramedStream`].
pub fn connect_client<T: Read + Write>(
    mut transport: T,
    policy: &LocalPolicy,
) -> Result<FramedStream<T>> {
    let mut session_key_bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut session_key_bytes);
    let session_key = Key512(session_key_bytes);

    let offer = HandshakePacket {
        session_key,
        public_key: policy.public_key,
        fingerprint: policy.fingerprint,
        error: 0,
        proto_version: Proto::V1 as u8,
        encryption: policy.encryption.algo,
        encryption_option: policy.encryption.option,
        compression: policy.compression.algo,
        compression_option: policy.compression.option,
    };
    write_packet(&mut transport, &offer)?;

    // The server replies using the client's session_key to scramble, since
    // the scramble key is never renegotiated within one handshake (§4.4).
    let reply = read_packet(&mut transport, session_key)?;
    if reply.error != 0 {
        return Err(SessionError::Protocol("server rejected the handshake"));
    }

    let (local_key, remote_key) =
        derive_transport_keys(&offer.public_key, &session_key, &offer.fingerprint);
    let encryptor = cipher_for_algo(reply.encryption, local_key);
    let decryptor = cipher_for_algo(reply.encryption, remote_key);
    Ok(FramedStream::new(transport, encryptor, decryptor))
}

/// Server side of §4.4 step 3: read the client's offer, negotiate, reply,
/// and hand back a keyed [`FramedStream`].
pub fn accept_server<T: Read + Write>(
    mut transport: T,
    policy: &LocalPolicy,
) -> Result<FramedStream<T>> {
    let mut buf = [0u8; PACKET_LEN];
    transport.read_exact(&mut buf)?;
    // The scramble key is the client's session_key, sent in the clear as
    // the packet's first 64 bytes (§4.4 "self-scrambled": "every byte
    // except session_key").
    let mut session_key_bytes = [0u8; 64];
    session_key_bytes.copy_from_slice(&buf[0..64]);
    let session_key = Key512(session_key_bytes);
    scramble(&session_key, &mut buf);
    let offer = HandshakePacket::decode(&buf);

    let negotiated = negotiate_server(&offer, Proto::V1, policy.encryption, policy.compression);

    let (encryption, compression, error) = match negotiated {
        Ok(Negotiated {
            encryption,
            compression,
        }) => (encryption, compression, 0u8),
        Err(e) => (0, 0, handshake_error_code(e)),
    };

    let reply = HandshakePacket {
        session_key,
        public_key: policy.public_key,
        fingerprint: policy.fingerprint,
        error,
        proto_version: Proto::V1 as u8,
        encryption,
        encryption_option: policy.encryption.option,
        compression,
        compression_option: policy.compression.option,
    };
    write_packet(&mut transport, &reply)?;

    if error != 0 {
        return Err(SessionError::Protocol("rejected the client's handshake"));
    }

    let (local_key, remote_key) =
        derive_transport_keys(&offer.public_key, &session_key, &offer.fingerprint);
    let encryptor = cipher_for_algo(encryption, local_key);
    let decryptor = cipher_for_algo(encryption, remote_key);
    Ok(FramedStream::new(transport, encryptor, decryptor))
}

fn handshake_error_code(e: HandshakeError) -> u8 {
    match e {
        HandshakeError::InvalidProto => 1,
        HandshakeError::EncryptionDisabled => 2,
        HandshakeError::EncryptionRequired => 3,
        HandshakeError::InvalidEncryption => 4,
        HandshakeError::CompressionDisabled => 5,
        HandshakeError::CompressionRequired => 6,
        HandshakeError::InvalidCompression => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn allow_policy(public_key: Key512, fingerprint: Key512) -> LocalPolicy {
        LocalPolicy {
            public_key,
            fingerprint,
            encryption: FieldPolicy {
                option: OptionMode::Allow,
                algo: 1,
            },
            compression: FieldPolicy {
                option: OptionMode::Disable,
                algo: 0,
            },
        }
    }

    #[test]
    fn matching_policies_negotiate_a_shared_light_cipher_and_can_exchange_bytes() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client_policy = allow_policy(Key512([1u8; 64]), Key512([2u8; 64]));
        let server_policy = allow_policy(Key512([3u8; 64]), Key512([4u8; 64]));

        let server_handle = std::thread::spawn(move || accept_server(server_sock, &server_policy));
        let mut client_stream = connect_client(client_sock, &client_policy).unwrap();
        let mut server_stream = server_handle.join().unwrap().unwrap();

        client_stream
            .write_delimited(b"ping", crate::framed::DEFAULT_DELIMITER)
            .unwrap();
        let got = server_stream
            .read_until(crate::framed::DEFAULT_DELIMITER)
            .unwrap();
        assert_eq!(got, b"ping");
    }

    #[test]
    fn client_rejects_a_proto_mismatch_reply() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client_policy = allow_policy(Key512([1u8; 64]), Key512([2u8; 64]));

        let server_handle = std::thread::spawn(move || {
            let mut buf = [0u8; PACKET_LEN];
            server_sock.try_clone().unwrap().read_exact(&mut buf).unwrap();
            let mut session_key = [0u8; 64];
            session_key.copy_from_slice(&buf[0..64]);
            let mut rejection = HandshakePacket::decode(&buf);
            rejection.error = 1;
            let mut out = rejection.encode();
            scramble(&Key512(session_key), &mut out);
            let mut sock = server_sock;
            sock.write_all(&out).unwrap();
        });

        let result = connect_client(client_sock, &client_policy);
        server_handle.join().unwrap();
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }
}
