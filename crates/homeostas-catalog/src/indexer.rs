// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental rescan reconciling `dir_walker` events with the catalog
//! (`indexer`, C7, §4.1 — "the hard part").

use crate::catalog::Catalog;
use crate::error::Result;
use crate::walker::{DirWalker, WalkEvent};
use homeostas_digest::{digest, digest_of_digests, entropy_word, Key512};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Number of filesystem events reconciled per short transaction, bounding
/// WAL growth and lock holding (§4.1: "≈50ms wall-clock each").
const BATCH_SIZE: usize = 512;

pub struct Indexer {
    catalog: Arc<Catalog>,
    root_path: PathBuf,
    walker: DirWalker,
    block_size: u32,
}

impl Indexer {
    pub fn new(
        catalog: Arc<Catalog>,
        root_path: PathBuf,
        excludes: Vec<regex::Regex>,
        block_size: u32,
    ) -> Self {
        Indexer {
            catalog,
            root_path,
            walker: DirWalker::new(excludes),
            block_size: block_size.max(1),
        }
    }

    /// Run one full rescan. `modified_only` skips re-digesting files whose
    /// `mtime_ns` is unchanged (§4.1 step 3).
    pub fn rescan(&self, modified_only: bool, abort: &AtomicBool) -> Result<()> {
        let root_id = self.catalog.root_id()?;
        let root_has_digest = self
            .catalog
            .get_entry(root_id)?
            .and_then(|r| r.digest)
            .is_some();
        let mut parent_cache: HashMap<PathBuf, i64> = HashMap::new();
        parent_cache.insert(PathBuf::new(), root_id);

        let events = self.walker.walk(&self.root_path, abort);

        self.catalog.begin_batch()?;
        self.catalog.begin_rescan()?;
        self.catalog.commit_batch()?;

        let mut changed = false;
        for chunk in events.chunks(BATCH_SIZE) {
            if abort.load(Ordering::Relaxed) {
                break;
            }

            self.catalog.begin_batch()?;
            let outcome = self.reconcile_chunk(chunk, &mut parent_cache, modified_only, abort);
            match outcome {
                Ok(chunk_changed) => {
                    changed |= chunk_changed;
                    self.catalog.commit_batch()?;
                }
                Err(e) => {
                    self.catalog.rollback_batch();
                    return Err(e);
                }
            }
        }

        self.catalog.begin_batch()?;
        let removed = self.catalog.sweep_dead()?;
        if removed > 0 {
            changed = true;
            debug!(target: "homeostas_catalog::indexer", "swept {removed} vanished entries");
        }
        // Rewrite when something actually changed this pass, or when the
        // root has never been digested (first rescan of a fresh catalog);
        // otherwise leave it untouched so idempotent rescans stay idempotent
        // (§4.1 step 5, idempotence property).
        if changed || !root_has_digest {
            self.rewrite_root_digest(root_id)?;
        }
        self.catalog.commit_batch()?;

        Ok(())
    }

    fn reconcile_chunk(
        &self,
        chunk: &[WalkEvent],
        parent_cache: &mut HashMap<PathBuf, i64>,
        modified_only: bool,
        abort: &AtomicBool,
    ) -> Result<bool> {
        let mut changed = false;
        for event in chunk {
            let parent_rel = event.rel_path.parent().unwrap_or(Path::new(""));
            let Some(&parent_id) = parent_cache.get(parent_rel) else {
                // Ancestor not seen this rescan (should not happen given
                // walkdir's pre-order traversal); skip defensively.
                warn!(
                    target: "homeostas_catalog::indexer",
                    "missing parent cache entry for {:?}, skipping", event.rel_path
                );
                continue;
            };

            let existing = self.catalog.find_child(parent_id, &event.name)?;

            let entry_id = match &existing {
                Some(row) if modified_only && row.mtime_ns == event.mtime_ns => {
                    self.catalog.touch_alive(row.id, true)?;
                    row.id
                }
                Some(row) => {
                    if row.mtime_ns != event.mtime_ns || row.size != event.size {
                        changed = true;
                    }
                    self.catalog
                        .update_entry_meta(row.id, event.mtime_ns, event.size, true)?;
                    row.id
                }
                None => {
                    changed = true;
                    self.catalog.insert_entry(
                        Some(parent_id),
                        &event.name,
                        event.is_dir,
                        event.mtime_ns,
                        event.size,
                        self.block_size,
                        true,
                    )?
                }
            };

            if event.is_dir {
                parent_cache.insert(event.rel_path.clone(), entry_id);
                continue;
            }

            let mtime_changed = existing
                .as_ref()
                .map(|row| row.mtime_ns != event.mtime_ns)
                .unwrap_or(true);

            if mtime_changed || !modified_only {
                match self.redigest_file(entry_id, event, abort) {
                    Ok(file_changed) => changed |= file_changed,
                    Err(err) => {
                        // Transient local failure (§7): the entry simply
                        // isn't re-digested on this pass.
                        warn!(
                            target: "homeostas_catalog::indexer",
                            "failed to digest {:?}: {err}", event.rel_path
                        );
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Re-digest a file's blocks. Returns whether any block was written,
    /// deleted, or its digest changed (used by the caller to decide whether
    /// the root digest needs advancing).
    fn redigest_file(&self, entry_id: i64, event: &WalkEvent, abort: &AtomicBool) -> Result<bool> {
        let full_path = self.root_path.join(&event.rel_path);
        let mut file = File::open(&full_path)?;
        let mut buf = vec![0u8; self.block_size as usize];
        let mut block_no: i64 = 0;
        let mut any_block_changed = false;

        loop {
            if abort.load(Ordering::Relaxed) {
                return Ok(any_block_changed);
            }
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            block_no += 1;
            let block_digest = digest(&buf[..n]);

            let rewrite = match self.catalog.get_block(entry_id, block_no)? {
                Some(existing) => existing.digest != block_digest,
                None => true,
            };
            if rewrite {
                self.catalog
                    .upsert_block(entry_id, block_no, event.mtime_ns, block_digest)?;
                self.catalog.mark_block_updated(entry_id, block_no)?;
                any_block_changed = true;
            }
            if n < buf.len() {
                break;
            }
        }

        let removed = self.catalog.delete_blocks_after(entry_id, block_no)?;
        if removed > 0 {
            any_block_changed = true;
        }

        let blocks = self.catalog.blocks_for_entry(entry_id)?;
        let digests: Vec<Key512> = blocks.iter().map(|b| b.digest).collect();
        let file_digest = digest_of_digests(digests.iter());
        self.catalog.set_entry_digest(entry_id, file_digest)?;

        Ok(any_block_changed)
    }

    /// §4.1 step 5: always rewrite the root digest so the per-root change
    /// feed advances if any block changed, even when the root's own
    /// metadata is untouched.
    fn rewrite_root_digest(&self, root_id: i64) -> Result<()> {
        let root = self.catalog.get_entry(root_id)?;
        let prev = root.and_then(|r| r.digest);

        let mut mix = Vec::with_capacity(64 * 2 + 8);
        if let Some(prev) = prev {
            mix.extend_from_slice(prev.as_slice());
        }
        mix.extend_from_slice(&entropy_word().to_le_bytes());
        mix.extend_from_slice(self.shortcut_hash(root_id)?.as_slice());

        let new_digest = digest(&mix);
        self.catalog.set_entry_digest(root_id, new_digest)?;
        Ok(())
    }

    /// Cheap digest over entry/block counts — "shortcut hash" in §4.1 step 5
    /// — deliberately avoids re-hashing the whole tree on every rescan.
    fn shortcut_hash(&self, root_id: i64) -> Result<Key512> {
        let entry_count = count_subtree(&self.catalog, root_id)?;
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&entry_count.to_le_bytes());
        Ok(digest(&buf))
    }
}

fn count_subtree(catalog: &Catalog, root_id: i64) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root_id];
    while let Some(id) = stack.pop() {
        total += 1;
        stack.extend(catalog.children_ids(id)?);
    }
    Ok(total)
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::fs;

    fn new_indexer(root: &Path, block_size: u32) -> (Indexer, Arc<Catalog>) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let excludes: Vec<Regex> = vec![];
        let indexer = Indexer::new(catalog.clone(), root.to_path_buf(), excludes, block_size);
        (indexer, catalog)
    }

    #[test]
    fn empty_tree_yields_single_root_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, catalog) = new_indexer(dir.path(), 4096);
        let abort = AtomicBool::new(false);

        indexer.rescan(false, &abort).unwrap();

        let root_id = catalog.root_id().unwrap();
        let root = catalog.get_entry(root_id).unwrap().unwrap();
        assert!(root.digest.is_some());
        assert!(catalog.children_ids(root_id).unwrap().is_empty());
    }

    #[test]
    fn single_file_known_content_produces_expected_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0x41u8; 10_000];
        fs::write(dir.path().join("file.bin"), &data).unwrap();

        let (indexer, catalog) = new_indexer(dir.path(), 4096);
        let abort = AtomicBool::new(false);
        indexer.rescan(false, &abort).unwrap();

        let root_id = catalog.root_id().unwrap();
        let children = catalog.children_ids(root_id).unwrap();
        assert_eq!(children.len(), 1);
        let entry = catalog.get_entry(children[0]).unwrap().unwrap();
        assert_eq!(entry.size, 10_000);

        let blocks = catalog.blocks_for_entry(entry.id).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].block_no, 1);
        assert_eq!(blocks[2].block_no, 3);

        let expected = digest_of_digests(blocks.iter().map(|b| &b.digest));
        assert_eq!(entry.digest, Some(expected));
    }

    #[test]
    fn truncate_removes_trailing_block_and_tombstones_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        fs::write(&path, vec![0x41u8; 10_000]).unwrap();

        let (indexer, catalog) = new_indexer(dir.path(), 4096);
        let abort = AtomicBool::new(false);
        indexer.rescan(false, &abort).unwrap();

        let root_id = catalog.root_id().unwrap();
        let entry_id = catalog.children_ids(root_id).unwrap()[0];
        let tracker = Key512([0xAA; 64]);
        catalog.add_remote_tracker(&tracker).unwrap();
        let before_root = catalog.get_entry(root_id).unwrap().unwrap().digest;

        // truncate to 4096 bytes, bump mtime so the rescan notices
        fs::write(&path, vec![0x41u8; 4096]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let now = std::time::SystemTime::now();
        filetime_touch(&path, now);

        indexer.rescan(false, &abort).unwrap();

        let blocks = catalog.blocks_for_entry(entry_id).unwrap();
        assert_eq!(blocks.len(), 1);

        let feed = catalog.change_feed(&tracker).unwrap();
        let tombstones: Vec<_> = feed.iter().filter(|c| c.tombstone).collect();
        assert_eq!(tombstones.len(), 2, "one tombstone per removed block");

        let after_root = catalog.get_entry(root_id).unwrap().unwrap().digest;
        assert_ne!(before_root, after_root);
    }

    #[test]
    fn idempotent_rescan_only_toggles_alive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"nested").unwrap();

        let (indexer, catalog) = new_indexer(dir.path(), 4096);
        let abort = AtomicBool::new(false);
        indexer.rescan(false, &abort).unwrap();

        let root_id = catalog.root_id().unwrap();
        let snapshot_before = snapshot_tree(&catalog, root_id);

        indexer.rescan(true, &abort).unwrap();
        let snapshot_after = snapshot_tree(&catalog, root_id);

        assert_eq!(snapshot_before, snapshot_after);
    }

    fn snapshot_tree(catalog: &Catalog, id: i64) -> Vec<(String, Option<Key512>, u64)> {
        let mut out = Vec::new();
        let entry = catalog.get_entry(id).unwrap().unwrap();
        out.push((entry.name.clone(), entry.digest, entry.size));
        let mut children = catalog.children_ids(id).unwrap();
        children.sort();
        for child in children {
            out.extend(snapshot_tree(catalog, child));
        }
        out
    }

    fn filetime_touch(path: &Path, _time: std::time::SystemTime) {
        // Re-open for append+truncate-free touch: update mtime by rewriting
        // the same bytes (avoids taking a filetime dependency in tests).
        let data = fs::read(path).unwrap();
        fs::write(path, data).unwrap();
    }
}
