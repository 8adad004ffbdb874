// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

mod error;
mod framed;
mod handshake;
mod rdt;
mod session;

pub use error::{Result, SessionError};
pub use framed::{FramedStream, DEFAULT_DELIMITER};
pub use handshake::{
    derive_transport_keys, negotiate_server, scramble, FieldPolicy, HandshakeError,
    HandshakePacket, Negotiated, OptionMode, Proto, MAX_ALGO, PACKET_LEN,
};
pub use rdt::{
    BlockMessage, EntryMessage, MirrorSink, RdtClient, RdtServer, MODULE_RDT, OP_ACK,
    OP_BLOCK_RESPONSE, OP_ENTRY_RESPONSE, OP_REQUEST_CHANGES,
};
pub use session::{accept_server, connect_client, LocalPolicy};
