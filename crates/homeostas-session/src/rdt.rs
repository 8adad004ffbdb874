// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote directory tracker protocol (`rdt_module`, C13, §4.5 and §6).
//!
//! Payload bytes for a changed block are an external collaborator (out of
//! scope beyond this module boundary, §1); this module only carries the
//! `(entry, block, tombstone)` metadata that tells a mirror what to fetch.

use crate::error::{Result, SessionError};
use crate::framed::FramedStream;
use homeostas_catalog::Catalog;
use homeostas_digest::Key512;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

pub const MODULE_RDT: u8 = 1;

pub const OP_REQUEST_CHANGES: u8 = 1;
pub const OP_ENTRY_RESPONSE: u8 = 2;
pub const OP_BLOCK_RESPONSE: u8 = 3;
pub const OP_ACK: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct EntryMessage {
    pub parent_id: u64,
    pub entry_id: u64,
    pub mtime: u64,
    pub file_size: u64,
    pub block_size: u64,
    pub is_dir: bool,
    pub name: String,
}

impl EntryMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(41 + self.name.len() + 1);
        buf.extend_from_slice(&self.parent_id.to_le_bytes());
        buf.extend_from_slice(&self.entry_id.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.file_size.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.push(self.is_dir as u8);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMessage {
    pub block_no: u64,
    pub deleted: bool,
    pub commit: bool,
}

impl BlockMessage {
    fn encode(&self) -> [u8; 10] {
        let mut buf = [0u8; 10];
        buf[0..8].copy_from_slice(&self.block_no.to_le_bytes());
        buf[8] = self.deleted as u8;
        buf[9] = self.commit as u8;
        buf
    }

    fn decode(buf: &[u8; 10]) -> Self {
        BlockMessage {
            block_no: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            deleted: buf[8] != 0,
            commit: buf[9] != 0,
        }
    }
}

/// Server side: pulls a subscriber's dirty rows out of its catalog and
/// streams them (§4.5 "Server flow"). One instance per connected subscriber.
pub struct RdtServer {
    sent_entries: HashSet<i64>,
}

impl Default for RdtServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RdtServer {
    pub fn new() -> Self {
        RdtServer {
            sent_entries: HashSet::new(),
        }
    }

    /// Handle one `RequestChanges`: stream every currently dirty row until
    /// the change feed is empty, acknowledging per entry (§9 resolves the
    /// "single batch vs. stream until drained" open question this way).
    pub fn handle_request_changes<T: Read + Write>(
        &mut self,
        stream: &mut FramedStream<T>,
        catalog: &Catalog,
        tracker: &Key512,
    ) -> Result<()> {
        loop {
            let changes = catalog.change_feed(tracker)?;
            let Some(first) = changes.first() else {
                break;
            };
            let entry_id = first.entry_id;

            self.send_ancestors(stream, catalog, entry_id)?;
            self.send_entry(stream, catalog, entry_id)?;

            for change in changes.iter().take_while(|c| c.entry_id == entry_id) {
                self.send_block(stream, change.block_no, change.tombstone, false)?;
            }
            self.send_block(stream, 0, false, true)?;

            self.expect_ack(stream)?;
            catalog.ack_entry(tracker, entry_id)?;
        }
        Ok(())
    }

    fn send_ancestors<T: Read + Write>(
        &mut self,
        stream: &mut FramedStream<T>,
        catalog: &Catalog,
        entry_id: i64,
    ) -> Result<()> {
        let mut chain = Vec::new();
        let mut cursor = catalog
            .get_entry(entry_id)?
            .ok_or(SessionError::Protocol("unknown entry in change feed"))?
            .parent_id;
        while let Some(id) = cursor {
            if self.sent_entries.contains(&id) {
                break;
            }
            let row = catalog
                .get_entry(id)?
                .ok_or(SessionError::Protocol("missing ancestor row"))?;
            cursor = row.parent_id;
            chain.push(id);
        }
        for id in chain.into_iter().rev() {
            self.send_entry(stream, catalog, id)?;
        }
        Ok(())
    }

    fn send_entry<T: Read + Write>(
        &mut self,
        stream: &mut FramedStream<T>,
        catalog: &Catalog,
        entry_id: i64,
    ) -> Result<()> {
        if self.sent_entries.contains(&entry_id) {
            return Ok(());
        }
        let row = catalog
            .get_entry(entry_id)?
            .ok_or(SessionError::Protocol("unknown entry"))?;
        let msg = EntryMessage {
            parent_id: row.parent_id.unwrap_or(0) as u64,
            entry_id: row.id as u64,
            mtime: row.mtime_ns as u64,
            file_size: row.size,
            block_size: row.block_size as u64,
            is_dir: row.is_dir,
            name: row.name,
        };
        stream.write_bytes(&[OP_ENTRY_RESPONSE])?;
        stream.write_bytes(&msg.encode())?;
        self.sent_entries.insert(entry_id);
        Ok(())
    }

    fn send_block<T: Read + Write>(
        &mut self,
        stream: &mut FramedStream<T>,
        block_no: i64,
        deleted: bool,
        commit: bool,
    ) -> Result<()> {
        let msg = BlockMessage {
            block_no: block_no as u64,
            deleted,
            commit,
        };
        stream.write_bytes(&[OP_BLOCK_RESPONSE])?;
        stream.write_bytes(&msg.encode())?;
        Ok(())
    }

    fn expect_ack<T: Read + Write>(&self, stream: &mut FramedStream<T>) -> Result<()> {
        let op = stream.read_exact_bytes(1)?;
        if op.first() != Some(&OP_ACK) {
            return Err(SessionError::Protocol("expected ACK"));
        }
        Ok(())
    }
}

/// Receives entry/block notifications from an `RdtClient` mirror pass. The
/// actual block payload transfer is an external collaborator; this trait
/// only carries the catalog-shaped metadata §4.5 assigns to this module.
pub trait MirrorSink {
    fn on_entry(&mut self, local_parent_id: i64, entry: &EntryMessage) -> i64;
    fn on_block(&mut self, local_entry_id: i64, block: &BlockMessage);
}

/// Client side: mirrors a remote catalog's dirty rows into a local one
/// (§4.5 "Client flow"). Deduplicates `(entry_id, block_no, mtime)` so
/// at-least-once redelivery after a crash-restart is idempotent (§4.5
/// "Idempotence").
pub struct RdtClient {
    remote_to_local: HashMap<u64, i64>,
    seen_blocks: HashSet<(u64, u64, u64)>,
}

impl Default for RdtClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RdtClient {
    pub fn new() -> Self {
        RdtClient {
            remote_to_local: HashMap::new(),
            seen_blocks: HashSet::new(),
        }
    }

    pub fn send_request_changes<T: Read + Write>(&self, stream: &mut FramedStream<T>) -> Result<()> {
        stream.write_bytes(&[MODULE_RDT, OP_REQUEST_CHANGES])
    }

    /// Pump one request/response cycle: read entries and blocks until the
    /// server's terminator, tracking local ids through `sink`, then send the
    /// ACK closing the server's transaction.
    pub fn drain_one_entry<T: Read + Write>(
        &mut self,
        stream: &mut FramedStream<T>,
        root_local_id: i64,
        sink: &mut dyn MirrorSink,
    ) -> Result<()> {
        let mut current_local_entry: Option<i64> = None;
        let mut current_mtime: u64 = 0;

        loop {
            let op = stream.read_exact_bytes(1)?;
            match op.first() {
                Some(&OP_ENTRY_RESPONSE) => {
                    let msg = self.read_entry(stream)?;
                    let local_parent = if msg.parent_id == 0 {
                        root_local_id
                    } else {
                        *self
                            .remote_to_local
                            .get(&msg.parent_id)
                            .ok_or(SessionError::Protocol("entry references unsent parent"))?
                    };
                    let local_id = sink.on_entry(local_parent, &msg);
                    self.remote_to_local.insert(msg.entry_id, local_id);
                    current_local_entry = Some(local_id);
                    current_mtime = msg.mtime;
                }
                Some(&OP_BLOCK_RESPONSE) => {
                    let raw: [u8; 10] = stream.read_exact_bytes(10)?.try_into().unwrap();
                    let block = BlockMessage::decode(&raw);
                    if block.commit {
                        stream.write_bytes(&[OP_ACK])?;
                        return Ok(());
                    }
                    let Some(local_id) = current_local_entry else {
                        return Err(SessionError::Protocol("block before entry"));
                    };
                    let key = (local_id as u64, block.block_no, current_mtime);
                    if self.seen_blocks.insert(key) {
                        sink.on_block(local_id, &block);
                    }
                }
                _ => return Err(SessionError::Protocol("unexpected RDT opcode")),
            }
        }
    }

    fn read_entry<T: Read + Write>(&self, stream: &mut FramedStream<T>) -> Result<EntryMessage> {
        let header: Vec<u8> = stream.read_exact_bytes(40)?;
        let parent_id = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let entry_id = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let mtime = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let file_size = u64::from_le_bytes(header[24..32].try_into().unwrap());
        let block_size = u64::from_le_bytes(header[32..40].try_into().unwrap());
        let is_dir = stream.read_exact_bytes(1)?[0] != 0;
        let name = self.read_nul_terminated(stream)?;
        Ok(EntryMessage {
            parent_id,
            entry_id,
            mtime,
            file_size,
            block_size,
            is_dir,
            name,
        })
    }

    fn read_nul_terminated<T: Read + Write>(&self, stream: &mut FramedStream<T>) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = stream.read_exact_bytes(1)?[0];
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        String::from_utf8(bytes).map_err(|_| SessionError::Protocol("non-utf8 entry name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostas_digest::Cipher;
    use std::io::Cursor;

    struct Loopback {
        outbound: Vec<u8>,
        inbound: Cursor<Vec<u8>>,
    }

    impl Loopback {
        fn new(preloaded: Vec<u8>) -> Self {
            Loopback {
                outbound: Vec::new(),
                inbound: Cursor::new(preloaded),
            }
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn entry_and_block_messages_roundtrip_over_wire_bytes() {
        let entry = EntryMessage {
            parent_id: 0,
            entry_id: 42,
            mtime: 123,
            file_size: 10_000,
            block_size: 4096,
            is_dir: false,
            name: "file.bin".to_string(),
        };
        let encoded = entry.encode();
        assert_eq!(encoded[encoded.len() - 1], 0);
        assert!(encoded.ends_with(b"file.bin\0"));

        let block = BlockMessage {
            block_no: 2,
            deleted: true,
            commit: false,
        };
        assert_eq!(BlockMessage::decode(&block.encode()), block);
    }

    #[test]
    fn server_streams_new_tracker_full_sync_and_client_mirrors_it() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = catalog.root_id().unwrap();
        let entry_id = catalog
            .insert_entry(Some(root), "a.txt", false, 111, 10_000, 4096, true)
            .unwrap();
        catalog
            .upsert_block(entry_id, 1, 111, homeostas_digest::digest(b"one"))
            .unwrap();
        catalog
            .upsert_block(entry_id, 2, 111, homeostas_digest::digest(b"two"))
            .unwrap();

        let tracker = Key512([9u8; 64]);
        catalog.add_remote_tracker(&tracker).unwrap();

        let mut server = RdtServer::new();
        // Pre-seed the transport's inbound side with the client's ACK byte,
        // since this test exercises wire encoding rather than two real
        // sockets.
        let mut server_stream =
            FramedStream::new(Loopback::new(vec![OP_ACK]), Cipher::None, Cipher::None);

        server
            .handle_request_changes(&mut server_stream, &catalog, &tracker)
            .unwrap();

        let wire = server_stream.into_inner().outbound;

        struct RecordingSink {
            entries: Vec<(i64, String)>,
            blocks: Vec<(i64, u64, bool)>,
            next_id: i64,
        }
        impl MirrorSink for RecordingSink {
            fn on_entry(&mut self, _local_parent_id: i64, entry: &EntryMessage) -> i64 {
                self.next_id += 1;
                self.entries.push((self.next_id, entry.name.clone()));
                self.next_id
            }
            fn on_block(&mut self, local_entry_id: i64, block: &BlockMessage) {
                self.blocks.push((local_entry_id, block.block_no, block.deleted));
            }
        }

        let mut client = RdtClient::new();
        let mut client_stream = FramedStream::new(Loopback::new(wire), Cipher::None, Cipher::None);
        let mut sink = RecordingSink {
            entries: Vec::new(),
            blocks: Vec::new(),
            next_id: 0,
        };
        client
            .drain_one_entry(&mut client_stream, 0, &mut sink)
            .unwrap();

        assert_eq!(sink.entries.len(), 1);
        assert_eq!(sink.entries[0].1, "a.txt");
        assert_eq!(sink.blocks.len(), 2);

        let ack_sent = client_stream.into_inner().outbound;
        assert_eq!(ack_sent, vec![OP_ACK]);
    }
}
