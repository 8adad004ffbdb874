// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `config_store`: a typed value tree persisted in a keyed SQLite table
//! (C4, §3 `ConfigVariable`, §6 on-disk format).

use crate::variant::{Kind, Variant};
use homeostas_digest::Key512;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("empty path segment in {0:?}")]
    EmptySegment(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Synthetic id of the tree root; node ids are otherwise assigned by
/// `AUTOINCREMENT` starting at 1, so 0 is never ambiguous.
const ROOT_ID: i64 = 0;

/// Typed configuration value tree, backed by a dedicated SQLite database
/// (`~/.homeostas/homeostas.sqlite`, §6).
pub struct ConfigStore {
    conn: Mutex<Connection>,
}

impl ConfigStore {
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
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS node (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER NOT NULL,
                name      TEXT NOT NULL,
                kind      INTEGER NOT NULL,
                int_value  INTEGER,
                real_value REAL,
                text_value TEXT,
                blob_value BLOB,
                UNIQUE(parent_id, name),
                FOREIGN KEY(parent_id) REFERENCES node(id) ON DELETE CASCADE
            )",
            [],
        )?;
        // Synthetic self-referencing root so every real node can carry a
        // non-null, enforceable parent_id (see ROOT_ID).
        conn.execute(
            "INSERT OR IGNORE INTO node (id, parent_id, name, kind) VALUES (0, 0, '', 0)",
            [],
        )?;
        let store = ConfigStore {
            conn: Mutex::new(conn),
        };
        Ok(store)
    }

    /// Look up (but do not create) the node id for a dotted path.
    fn find_node(conn: &Connection, path: &str) -> Result<Option<i64>> {
        let mut parent = ROOT_ID;
        for segment in split_path(path)? {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM node WHERE parent_id = ?1 AND name = ?2",
                    params![parent, segment],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => parent = id,
                None => return Ok(None),
            }
        }
        Ok(Some(parent))
    }

    /// Look up, creating `Null` intermediate nodes as needed, and return the
    /// leaf node id.
    fn ensure_node(conn: &Connection, path: &str) -> Result<i64> {
        let mut parent = ROOT_ID;
        for segment in split_path(path)? {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM node WHERE parent_id = ?1 AND name = ?2",
                    params![parent, segment],
                    |row| row.get(0),
                )
                .optional()?;
            parent = match id {
                Some(id) => id,
                None => {
                    conn.execute(
                        "INSERT INTO node (parent_id, name, kind) VALUES (?1, ?2, ?3)",
                        params![parent, segment, Kind::Null as i64],
                    )?;
                    conn.last_insert_rowid()
                }
            };
        }
        Ok(parent)
    }

    fn row_to_variant(
        kind: i64,
        int_value: Option<i64>,
        real_value: Option<f64>,
        text_value: Option<String>,
        blob_value: Option<Vec<u8>>,
    ) -> Variant {
        match Kind::from_i64(kind) {
            Some(Kind::Null) | None => Variant::Null,
            Some(Kind::Bool) => Variant::Bool(int_value.unwrap_or(0) != 0),
            Some(Kind::I64) => Variant::I64(int_value.unwrap_or(0)),
            Some(Kind::F64) => Variant::F64(real_value.unwrap_or(0.0)),
            Some(Kind::Text) => Variant::Text(text_value.unwrap_or_default()),
            Some(Kind::Bytes) => Variant::Bytes(blob_value.unwrap_or_default()),
            Some(Kind::Key512) => {
                let bytes = blob_value.unwrap_or_default();
                if bytes.len() == Key512::LEN {
                    let mut arr = [0u8; 64];
                    arr.copy_from_slice(&bytes);
                    Variant::Key512(Key512(arr))
                } else {
                    Variant::Null
                }
            }
        }
    }

    pub fn get(&self, path: &str) -> Result<Variant> {
        let conn = self.conn.lock().unwrap();
        let Some(id) = Self::find_node(&conn, path)? else {
            return Ok(Variant::Null);
        };
        let row = conn.query_row(
            "SELECT kind, int_value, real_value, text_value, blob_value FROM node WHERE id = ?1",
            params![id],
            |row| {
                Ok(Self::row_to_variant(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;
        Ok(row)
    }

    pub fn set(&self, path: &str, value: impl Into<Variant>) -> Result<()> {
        let value = value.into();
        let conn = self.conn.lock().unwrap();
        let id = Self::ensure_node(&conn, path)?;

        let kind = Kind::of(&value) as i64;
        let (int_value, real_value, text_value, blob_value): (
            Option<i64>,
            Option<f64>,
            Option<String>,
            Option<Vec<u8>>,
        ) = match &value {
            Variant::Null => (None, None, None, None),
            Variant::Bool(b) => (Some(*b as i64), None, None, None),
            Variant::I64(i) => (Some(*i), None, None, None),
            Variant::F64(f) => (None, Some(*f), None, None),
            Variant::Text(s) => (None, None, Some(s.clone()), None),
            Variant::Bytes(b) => (None, None, None, Some(b.clone())),
            Variant::Key512(k) => (None, None, None, Some(k.as_slice().to_vec())),
        };

        conn.execute(
            "UPDATE node SET kind = ?1, int_value = ?2, real_value = ?3,
                text_value = ?4, blob_value = ?5 WHERE id = ?6",
            params![kind, int_value, real_value, text_value, blob_value, id],
        )?;
        Ok(())
    }

    /// Names of the immediate children of `path` (`""` for the root).
    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let parent = if path.is_empty() {
            Some(ROOT_ID)
        } else {
            Self::find_node(&conn, path)?
        };
        let Some(parent) = parent else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare("SELECT name FROM node WHERE parent_id = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![parent], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Some(id) = Self::find_node(&conn, path)? {
            conn.execute("DELETE FROM node WHERE id = ?1", params![id])?;
        }
        Ok(())
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('.')
        .map(|s| {
            if s.is_empty() {
                Err(ConfigError::EmptySegment(path.to_owned()))
            } else {
                Ok(s)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.set("net.listen.port", 4242i64).unwrap();
        assert_eq!(store.get("net.listen.port").unwrap().as_i64(), Some(4242));
    }

    #[test]
    fn missing_path_is_null() {
        let store = ConfigStore::open_in_memory().unwrap();
        assert!(store.get("nothing.here").unwrap().is_null());
    }

    #[test]
    fn children_lists_immediate_names_only() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.set("net.listen.port", 4242i64).unwrap();
        store.set("net.listen.host", "0.0.0.0").unwrap();
        store.set("net.timeout_ms", 10_000i64).unwrap();

        let mut children = store.children("net").unwrap();
        children.sort();
        assert_eq!(children, vec!["listen", "timeout_ms"]);
    }

    #[test]
    fn overwriting_changes_kind() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.set("a.b", "text").unwrap();
        assert_eq!(store.get("a.b").unwrap().as_text(), Some("text"));
        store.set("a.b", 7i64).unwrap();
        assert_eq!(store.get("a.b").unwrap().as_i64(), Some(7));
    }

    #[test]
    fn key512_roundtrips() {
        let store = ConfigStore::open_in_memory().unwrap();
        let key = Key512([0x42; 64]);
        store.set("identity.public_key", key).unwrap();
        assert_eq!(store.get("identity.public_key").unwrap().as_key512(), Some(&key));
    }

    #[test]
    fn remove_drops_subtree() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.set("a.b.c", 1i64).unwrap();
        store.remove("a.b").unwrap();
        assert!(store.get("a.b.c").unwrap().is_null());
    }
}
