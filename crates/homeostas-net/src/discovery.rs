// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery cache: key → address-set, plus the announcer sighting table
//! (`discovery`, C11, §4.3).

use crate::error::Result;
use crate::socket_addr::{v4, v6};
use homeostas_digest::Key512;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default expiry for a discovery record after its last refresh (§3
/// `PeerRecord`).
pub const DEFAULT_EXPIRE_SECS: i64 = 60;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS known_announcers (
    public_key BLOB PRIMARY KEY,
    mtime_ns   INTEGER NOT NULL,
    expire_ns  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS known_peers (
    public_key BLOB PRIMARY KEY,
    p2p_key    BLOB NOT NULL,
    addrs      BLOB NOT NULL,
    mtime_ns   INTEGER NOT NULL,
    expire_ns  INTEGER NOT NULL
);
";

pub struct Discovery {
    conn: Mutex<Connection>,
}

impl Discovery {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA page_size = 4096;
             PRAGMA journal_mode = WAL;
             PRAGMA auto_vacuum = FULL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Discovery {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or update a peer record. If `p2p_key` is omitted on an update,
    /// the existing one is retained (§4.3 `announce_host`).
    pub fn announce_host(
        &self,
        public_key: &Key512,
        addrs: Option<&[SocketAddr]>,
        p2p_key: Option<&Key512>,
    ) -> Result<()> {
        let now = now_ns();
        let expire = now + DEFAULT_EXPIRE_SECS * 1_000_000_000;
        let conn = self.conn.lock().unwrap();

        let existing_p2p: Option<Vec<u8>> = conn
            .query_row(
                "SELECT p2p_key FROM known_peers WHERE public_key = ?1",
                params![public_key.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        let existing_addrs: Option<Vec<u8>> = conn
            .query_row(
                "SELECT addrs FROM known_peers WHERE public_key = ?1",
                params![public_key.as_slice()],
                |row| row.get(0),
            )
            .optional()?;

        let p2p_bytes = p2p_key
            .map(|k| k.as_slice().to_vec())
            .or(existing_p2p)
            .unwrap_or_else(|| Key512::zero().as_slice().to_vec());
        let addrs_bytes = addrs
            .map(pack_addrs)
            .unwrap_or_else(|| existing_addrs.unwrap_or_default());

        conn.execute(
            "INSERT INTO known_peers (public_key, p2p_key, addrs, mtime_ns, expire_ns)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(public_key) DO UPDATE SET
                p2p_key = excluded.p2p_key,
                addrs = excluded.addrs,
                mtime_ns = excluded.mtime_ns,
                expire_ns = excluded.expire_ns",
            params![public_key.as_slice(), p2p_bytes, addrs_bytes, now, expire],
        )?;
        Ok(())
    }

    /// Return the cached address set, empty on miss or expiry (lazily
    /// purged on read, §3 `PeerRecord`).
    pub fn discover_host(&self, public_key: &Key512) -> Result<Vec<SocketAddr>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT addrs, expire_ns FROM known_peers WHERE public_key = ?1",
                params![public_key.as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((addrs, expire_ns)) = row else {
            return Ok(Vec::new());
        };
        if expire_ns < now_ns() {
            conn.execute(
                "DELETE FROM known_peers WHERE public_key = ?1",
                params![public_key.as_slice()],
            )?;
            return Ok(Vec::new());
        }
        Ok(unpack_addrs(&addrs))
    }

    /// Return the cached p2p key, or a zeroed key on miss/expiry.
    pub fn discover_host_p2p_key(&self, public_key: &Key512) -> Result<Key512> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT p2p_key, expire_ns FROM known_peers WHERE public_key = ?1",
                params![public_key.as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((key_bytes, expire_ns)) = row else {
            return Ok(Key512::zero());
        };
        if expire_ns < now_ns() || key_bytes.len() != Key512::LEN {
            return Ok(Key512::zero());
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&key_bytes);
        Ok(Key512(arr))
    }

    /// Record that `public_key` announced itself (rendezvous peer sighting).
    pub fn record_announcer(&self, public_key: &Key512) -> Result<()> {
        let now = now_ns();
        let expire = now + DEFAULT_EXPIRE_SECS * 1_000_000_000;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO known_announcers (public_key, mtime_ns, expire_ns) VALUES (?1, ?2, ?3)
             ON CONFLICT(public_key) DO UPDATE SET mtime_ns = excluded.mtime_ns, expire_ns = excluded.expire_ns",
            params![public_key.as_slice(), now, expire],
        )?;
        Ok(())
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Pack a socket address list as a concatenation of family-sized structures
/// (§4.3 `announce_host`: "packed `addrs`... concatenation of socket-address
/// structures sized per family").
fn pack_addrs(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            SocketAddr::V4(a) => {
                out.push(4u8);
                out.extend_from_slice(&a.ip().octets());
                out.extend_from_slice(&a.port().to_le_bytes());
            }
            SocketAddr::V6(a) => {
                out.push(6u8);
                out.extend_from_slice(&a.ip().octets());
                out.extend_from_slice(&a.port().to_le_bytes());
            }
        }
    }
    out
}

fn unpack_addrs(buf: &[u8]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        match buf.get(i) {
            Some(4) if i + 7 <= buf.len() => {
                let o = &buf[i + 1..i + 5];
                let port = u16::from_le_bytes([buf[i + 5], buf[i + 6]]);
                out.push(v4(o[0], o[1], o[2], o[3], port));
                i += 7;
            }
            Some(6) if i + 19 <= buf.len() => {
                let mut segments = [0u16; 8];
                for (s, chunk) in segments.iter_mut().zip(buf[i + 1..i + 17].chunks_exact(2)) {
                    *s = u16::from_be_bytes([chunk[0], chunk[1]]);
                }
                let port = u16::from_le_bytes([buf[i + 17], buf[i + 18]]);
                out.push(v6(segments, port));
                i += 19;
            }
            _ => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_then_discover_roundtrips_addresses() {
        let discovery = Discovery::open_in_memory().unwrap();
        let key = Key512([7u8; 64]);
        let addrs = vec!["203.0.113.5:4000".parse().unwrap()];
        discovery.announce_host(&key, Some(&addrs), None).unwrap();
        assert_eq!(discovery.discover_host(&key).unwrap(), addrs);
    }

    #[test]
    fn missing_peer_returns_empty_and_zero_key() {
        let discovery = Discovery::open_in_memory().unwrap();
        let key = Key512([9u8; 64]);
        assert!(discovery.discover_host(&key).unwrap().is_empty());
        assert!(discovery.discover_host_p2p_key(&key).unwrap().is_zero());
    }

    #[test]
    fn update_without_p2p_key_retains_existing() {
        let discovery = Discovery::open_in_memory().unwrap();
        let key = Key512([1u8; 64]);
        let p2p = Key512([2u8; 64]);
        discovery.announce_host(&key, None, Some(&p2p)).unwrap();

        let addrs = vec!["198.51.100.2:5000".parse().unwrap()];
        discovery.announce_host(&key, Some(&addrs), None).unwrap();

        assert_eq!(discovery.discover_host_p2p_key(&key).unwrap(), p2p);
        assert_eq!(discovery.discover_host(&key).unwrap(), addrs);
    }

    #[test]
    fn expired_record_is_purged_on_read() {
        let discovery = Discovery::open_in_memory().unwrap();
        let key = Key512([3u8; 64]);
        {
            let conn = discovery.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO known_peers (public_key, p2p_key, addrs, mtime_ns, expire_ns)
                 VALUES (?1, ?2, ?3, 0, -1)",
                params![key.as_slice(), Key512::zero().as_slice(), pack_addrs(&[])],
            )
            .unwrap();
        }
        assert!(discovery.discover_host(&key).unwrap().is_empty());

        // The row must be gone, so a fresh announce_host upserts cleanly.
        let addrs = vec!["192.0.2.9:80".parse().unwrap()];
        discovery.announce_host(&key, Some(&addrs), None).unwrap();
        assert_eq!(discovery.discover_host(&key).unwrap(), addrs);
    }
}
