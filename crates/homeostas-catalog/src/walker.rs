// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recursive directory walk producing `(path, stat, match)` events
//! (`dir_walker`, C6).

use regex::Regex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// One accessible, non-excluded filesystem entry (§4.1 step 2).
#[derive(Debug, Clone, PartialEq)]
pub struct WalkEvent {
    pub rel_path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub mtime_ns: i64,
    pub size: u64,
}

/// Recursive walker honoring an exclude-pattern list read from
/// configuration (`original_source/app/src/indexer.cpp`'s regex filter) and
/// skipping unreadable entries.
pub struct DirWalker {
    excludes: Vec<Regex>,
}

impl DirWalker {
    pub fn new(excludes: Vec<Regex>) -> Self {
        DirWalker { excludes }
    }

    fn excluded(&self, rel_path: &Path) -> bool {
        let s = rel_path.to_string_lossy();
        self.excludes.iter().any(|re| re.is_match(&s))
    }

    /// Walk `root`, yielding one event per accessible, non-excluded entry.
    /// `abort` is polled between entries (§4.1 "Failures": "the walker
    /// checks an abort flag between entries").
    pub fn walk(&self, root: &Path, abort: &AtomicBool) -> Vec<WalkEvent> {
        let mut out = Vec::new();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                let Ok(rel) = entry.path().strip_prefix(root) else {
                    return true;
                };
                if self.excluded(rel) {
                    return false;
                }
                if entry.file_type().is_dir() && !is_dir_accessible(entry.path()) {
                    return false;
                }
                true
            });

        for item in walker {
            if abort.load(Ordering::Relaxed) {
                break;
            }

            let entry = match item {
                Ok(entry) => entry,
                // Permission-denied (or similar) on readdir: the whole
                // subtree under the failing directory is simply absent from
                // the walk, matching "when a directory is skipped, its
                // subtree is skipped".
                Err(_) => continue,
            };

            let rel_path = match entry.path().strip_prefix(root) {
                Ok(p) => p.to_path_buf(),
                Err(_) => continue,
            };

            let is_dir = entry.file_type().is_dir();
            if !is_dir && !is_file_readable(entry.path()) {
                continue;
            }

            let Ok(meta) = entry.metadata() else {
                continue;
            };

            let mtime_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);

            let name = entry
                .file_name()
                .to_str()
                .map(|s| s.to_owned())
                .unwrap_or_default();

            out.push(WalkEvent {
                rel_path,
                name,
                is_dir,
                mtime_ns,
                size: if is_dir { 0 } else { meta.len() },
            });
        }

        out
    }
}

fn is_dir_accessible(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok()
}

fn is_file_readable(path: &Path) -> bool {
    File::open(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/file.txt"), b"hello").unwrap();
        fs::write(dir.path().join("a/b/nested.txt"), b"world").unwrap();

        let walker = DirWalker::new(vec![]);
        let abort = AtomicBool::new(false);
        let mut events = walker.walk(dir.path(), &abort);
        events.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        let names: Vec<String> = events.iter().map(|e| e.name.clone()).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        assert!(names.contains(&"file.txt".to_string()));
        assert!(names.contains(&"nested.txt".to_string()));
    }

    #[test]
    fn excludes_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/bin"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"y").unwrap();

        let walker = DirWalker::new(vec![Regex::new("^target").unwrap()]);
        let abort = AtomicBool::new(false);
        let events = walker.walk(dir.path(), &abort);

        assert!(events.iter().any(|e| e.name == "keep.txt"));
        assert!(!events.iter().any(|e| e.name == "target"));
        assert!(!events.iter().any(|e| e.name == "bin"));
    }

    #[test]
    fn empty_directory_yields_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let walker = DirWalker::new(vec![]);
        let abort = AtomicBool::new(false);
        assert!(walker.walk(dir.path(), &abort).is_empty());
    }
}
