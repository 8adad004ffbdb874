// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-directory catalog: entry/block/subscriber tables and the triggers
//! that keep a subscriber's change feed correct without duplicating them in
//! application code (C5, §3, §6).

use crate::error::Result;
use homeostas_digest::Key512;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// One `entry` row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub is_dir: bool,
    pub mtime_ns: i64,
    pub size: u64,
    pub block_size: u32,
    pub digest: Option<Key512>,
    pub is_alive: bool,
}

/// One `block` row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub entry_id: i64,
    pub block_no: i64,
    pub mtime_ns: i64,
    pub digest: Key512,
}

/// One dirty `remote_tracking` row joined against its entry, as served to a
/// subscriber by the change feed (§4.1, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub entry_id: i64,
    pub block_no: i64,
    pub tombstone: bool,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS entry (
    id         INTEGER PRIMARY KEY,
    parent_id  INTEGER REFERENCES entry(id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    is_dir     INTEGER NOT NULL,
    mtime_ns   INTEGER NOT NULL,
    size       INTEGER NOT NULL,
    block_size INTEGER NOT NULL,
    digest     BLOB,
    is_alive   INTEGER NOT NULL,
    UNIQUE(parent_id, name)
);

CREATE INDEX IF NOT EXISTS idx_entry_parent ON entry(parent_id);

CREATE TABLE IF NOT EXISTS block (
    entry_id INTEGER NOT NULL REFERENCES entry(id) ON DELETE CASCADE,
    block_no INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    digest   BLOB NOT NULL,
    UNIQUE(entry_id, block_no)
);

CREATE INDEX IF NOT EXISTS idx_block_entry ON block(entry_id);

CREATE TABLE IF NOT EXISTS remote_tracker (
    key BLOB PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS remote_tracking (
    entry_id    INTEGER NOT NULL,
    block_no    INTEGER NOT NULL,
    tracker_key BLOB NOT NULL REFERENCES remote_tracker(key) ON DELETE CASCADE,
    tombstone   INTEGER NOT NULL DEFAULT 0,
    UNIQUE(entry_id, block_no, tracker_key) ON CONFLICT REPLACE
);

CREATE INDEX IF NOT EXISTS idx_remote_tracking_tracker ON remote_tracking(tracker_key);
CREATE INDEX IF NOT EXISTS idx_remote_tracking_entry ON remote_tracking(entry_id, block_no);

-- Trigger 2 (§3): deleting a block tombstones it for every known tracker.
-- Fires for direct block deletes and for cascaded deletes from a deleted
-- entry, since recursive_triggers is enabled below.
CREATE TRIGGER IF NOT EXISTS trg_block_delete_tombstone
AFTER DELETE ON block
BEGIN
    INSERT INTO remote_tracking (entry_id, block_no, tracker_key, tombstone)
    SELECT OLD.entry_id, OLD.block_no, key, 1 FROM remote_tracker;
END;

-- Trigger 3 (§3): a newly-subscribed tracker gets a full initial sync.
CREATE TRIGGER IF NOT EXISTS trg_tracker_insert_fullsync
AFTER INSERT ON remote_tracker
BEGIN
    INSERT INTO remote_tracking (entry_id, block_no, tracker_key, tombstone)
    SELECT entry_id, block_no, NEW.key, 0 FROM block;
END;
";

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA page_size = 4096;
             PRAGMA journal_mode = WAL;
             PRAGMA auto_vacuum = FULL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA recursive_triggers = ON;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        let catalog = Catalog {
            conn: Mutex::new(conn),
        };
        catalog.ensure_root()?;
        Ok(catalog)
    }

    fn ensure_root(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM entry WHERE parent_id IS NULL",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        drop(conn);
        self.insert_entry(None, "", true, 0, 0, 0, true)
    }

    pub fn root_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT id FROM entry WHERE parent_id IS NULL", [], |row| {
            row.get(0)
        })
        .map_err(Into::into)
    }

    /// Draw a random 64-bit id not currently used by any `entry` row (§3).
    fn fresh_entry_id(conn: &Connection) -> Result<i64> {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: i64 = rng.gen();
            let used: Option<i64> = conn
                .query_row("SELECT id FROM entry WHERE id = ?1", params![candidate], |r| {
                    r.get(0)
                })
                .optional()?;
            if used.is_none() {
                return Ok(candidate);
            }
        }
    }

    pub fn find_child(&self, parent_id: i64, name: &str) -> Result<Option<EntryRow>> {
        let conn = self.conn.lock().unwrap();
        Self::query_entry(
            &conn,
            "SELECT id, parent_id, name, is_dir, mtime_ns, size, block_size, digest, is_alive
             FROM entry WHERE parent_id = ?1 AND name = ?2",
            params![parent_id, name],
        )
    }

    pub fn get_entry(&self, id: i64) -> Result<Option<EntryRow>> {
        let conn = self.conn.lock().unwrap();
        Self::query_entry(
            &conn,
            "SELECT id, parent_id, name, is_dir, mtime_ns, size, block_size, digest, is_alive
             FROM entry WHERE id = ?1",
            params![id],
        )
    }

    fn query_entry(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<EntryRow>> {
        let row = conn
            .query_row(sql, params, |row| {
                let digest: Option<Vec<u8>> = row.get(7)?;
                Ok(EntryRow {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    name: row.get(2)?,
                    is_dir: row.get::<_, i64>(3)? != 0,
                    mtime_ns: row.get(4)?,
                    size: row.get::<_, i64>(5)? as u64,
                    block_size: row.get::<_, i64>(6)? as u32,
                    digest: digest.and_then(to_key512),
                    is_alive: row.get::<_, i64>(8)? != 0,
                })
            })
            .optional()?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_entry(
        &self,
        parent_id: Option<i64>,
        name: &str,
        is_dir: bool,
        mtime_ns: i64,
        size: u64,
        block_size: u32,
        is_alive: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id = Self::fresh_entry_id(&conn)?;
        conn.execute(
            "INSERT INTO entry (id, parent_id, name, is_dir, mtime_ns, size, block_size, digest, is_alive)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
            params![
                id,
                parent_id,
                name,
                is_dir as i64,
                mtime_ns,
                size as i64,
                block_size as i64,
                is_alive as i64,
            ],
        )?;
        Ok(id)
    }

    /// Update metadata and clear the digest (§4.1 step 3: "insert or update
    /// with the new metadata and clear digest").
    pub fn update_entry_meta(&self, id: i64, mtime_ns: i64, size: u64, is_alive: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entry SET mtime_ns = ?1, size = ?2, digest = NULL, is_alive = ?3 WHERE id = ?4",
            params![mtime_ns, size as i64, is_alive as i64, id],
        )?;
        Ok(())
    }

    pub fn touch_alive(&self, id: i64, alive: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entry SET is_alive = ?1 WHERE id = ?2",
            params![alive as i64, id],
        )?;
        Ok(())
    }

    pub fn set_entry_digest(&self, id: i64, digest: Key512) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entry SET digest = ?1 WHERE id = ?2",
            params![digest.as_slice(), id],
        )?;
        Ok(())
    }

    /// §4.1 step 1: reset every row's liveness marker to stale before a walk.
    pub fn begin_rescan(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE entry SET is_alive = 0", [])?;
        Ok(())
    }

    /// §4.1 step 4: delete everything still stale. Cascades (entry → block →
    /// tombstones, entry → child entries) apply automatically.
    pub fn sweep_dead(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM entry WHERE is_alive = 0 AND parent_id IS NOT NULL",
            [],
        )?;
        Ok(changed as u64)
    }

    pub fn get_block(&self, entry_id: i64, block_no: i64) -> Result<Option<BlockRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT entry_id, block_no, mtime_ns, digest FROM block
             WHERE entry_id = ?1 AND block_no = ?2",
            params![entry_id, block_no],
            |row| {
                let digest: Vec<u8> = row.get(3)?;
                Ok(BlockRow {
                    entry_id: row.get(0)?,
                    block_no: row.get(1)?,
                    mtime_ns: row.get(2)?,
                    digest: to_key512(digest).unwrap_or(Key512::zero()),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn upsert_block(&self, entry_id: i64, block_no: i64, mtime_ns: i64, digest: Key512) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO block (entry_id, block_no, mtime_ns, digest) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entry_id, block_no) DO UPDATE SET mtime_ns = excluded.mtime_ns, digest = excluded.digest",
            params![entry_id, block_no, mtime_ns, digest.as_slice()],
        )?;
        Ok(())
    }

    /// §4.1 step 3: a block written in place (not deleted) has no trigger of
    /// its own, so replace any existing `remote_tracking` rows for it with
    /// non-tombstone ones for every known tracker.
    pub fn mark_block_updated(&self, entry_id: i64, block_no: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO remote_tracking (entry_id, block_no, tracker_key, tombstone)
             SELECT ?1, ?2, key, 0 FROM remote_tracker",
            params![entry_id, block_no],
        )?;
        Ok(())
    }

    /// §4.1 step 3: shrink tail — removing these rows fires trigger 2.
    pub fn delete_blocks_after(&self, entry_id: i64, last_block_no: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM block WHERE entry_id = ?1 AND block_no > ?2",
            params![entry_id, last_block_no],
        )?;
        Ok(n as u64)
    }

    pub fn block_count(&self, entry_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(MAX(block_no), 0) FROM block WHERE entry_id = ?1",
            params![entry_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    pub fn blocks_for_entry(&self, entry_id: i64) -> Result<Vec<BlockRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entry_id, block_no, mtime_ns, digest FROM block
             WHERE entry_id = ?1 ORDER BY block_no",
        )?;
        let rows = stmt
            .query_map(params![entry_id], |row| {
                let digest: Vec<u8> = row.get(3)?;
                Ok(BlockRow {
                    entry_id: row.get(0)?,
                    block_no: row.get(1)?,
                    mtime_ns: row.get(2)?,
                    digest: to_key512(digest).unwrap_or(Key512::zero()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Register a subscriber; trigger 3 seeds its initial full sync.
    pub fn add_remote_tracker(&self, key: &Key512) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO remote_tracker (key) VALUES (?1)",
            params![key.as_slice()],
        )?;
        Ok(())
    }

    pub fn has_remote_tracker(&self, key: &Key512) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<Vec<u8>> = conn
            .query_row(
                "SELECT key FROM remote_tracker WHERE key = ?1",
                params![key.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn remove_remote_tracker(&self, key: &Key512) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM remote_tracker WHERE key = ?1",
            params![key.as_slice()],
        )?;
        Ok(())
    }

    /// The ordered change feed for one subscriber (§4.1 "Change feed").
    pub fn change_feed(&self, tracker: &Key512) -> Result<Vec<ChangeRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entry_id, block_no, tombstone FROM remote_tracking
             WHERE tracker_key = ?1 ORDER BY entry_id, block_no",
        )?;
        let rows = stmt
            .query_map(params![tracker.as_slice()], |row| {
                Ok(ChangeRow {
                    entry_id: row.get(0)?,
                    block_no: row.get(1)?,
                    tombstone: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Acknowledge (remove) the dirty rows for one entry once a client has
    /// durably applied them (§4.5 ACK).
    pub fn ack_entry(&self, tracker: &Key512, entry_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM remote_tracking WHERE tracker_key = ?1 AND entry_id = ?2",
            params![tracker.as_slice(), entry_id],
        )?;
        Ok(())
    }

    pub fn children_ids(&self, parent_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM entry WHERE parent_id = ?1")?;
        let ids = stmt
            .query_map(params![parent_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Open one of §4.1's short (~50ms) rescan-batch transactions. Callers
    /// issue their writes through the normal `Catalog` methods (each of
    /// which still locks the connection per call) and then `commit_batch`;
    /// safe as long as a single thread drives one catalog's writes, which
    /// matches §5's "one rescan thread per tracked directory".
    pub fn begin_batch(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit_batch(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_batch(&self) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute_batch("ROLLBACK");
    }
}

fn to_key512(bytes: Vec<u8>) -> Option<Key512> {
    if bytes.len() == Key512::LEN {
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Some(Key512(arr))
    } else {
        None
    }
}
