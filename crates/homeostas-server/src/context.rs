// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervisor composing C8-C13 behind a single process lifecycle
//! (C14, §2, §5 "Shared resources").

use crate::pool::WorkerPool;
use anyhow::{Context, Result};
use dashmap::DashMap;
use homeostas_catalog::{Catalog, Indexer};
use homeostas_digest::Key512;
use homeostas_model::ConfigStore;
use homeostas_net::{enumerate_interfaces, partition_global, Discovery, ListenerSet};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default rescan cadence for a tracked directory (§4.1 "Rescan cadence").
const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum worker pool size regardless of hardware concurrency (§5).
const MIN_WORKERS: usize = 2;

/// One tracked directory: its catalog, indexer, and rescan loop handle.
struct TrackedDir {
    catalog: Arc<Catalog>,
    abort: Arc<AtomicBool>,
}

/// Process-wide state: configuration, discovery, per-directory catalogs, and
/// the worker pool that runs rescans and connection-plane tasks (§5
/// "Singletons... have process-wide lifetime; they are initialized on first
/// use and torn down before process exit").
pub struct AppContext {
    pub home: PathBuf,
    pub config: ConfigStore,
    pub discovery: Discovery,
    pub public_key: Key512,
    pool: Arc<WorkerPool>,
    tracked: DashMap<PathBuf, TrackedDir>,
}

impl AppContext {
    /// Open (creating if necessary) `home` and the two process-wide stores
    /// within it, mirroring `hdds-persistence::SqliteStore::new`'s
    /// create-on-open behavior.
    pub fn startup(home: &Path) -> Result<Self> {
        std::fs::create_dir_all(home)
            .with_context(|| format!("creating home directory {}", home.display()))?;

        let config = ConfigStore::open(home.join("homeostas.sqlite"))
            .context("opening configuration store")?;
        let discovery =
            Discovery::open(home.join("discovery.sqlite")).context("opening discovery store")?;

        let public_key = load_or_generate_public_key(&config)?;

        Ok(AppContext {
            home: home.to_path_buf(),
            config,
            discovery,
            public_key,
            pool: Arc::new(WorkerPool::with_default_max(MIN_WORKERS)),
            tracked: DashMap::new(),
        })
    }

    /// Add a directory to track: open its per-directory catalog, run an
    /// initial full rescan, then submit a periodic `modified_only` rescan
    /// loop to the worker pool (§4.1 "one rescan thread per tracked
    /// directory").
    pub fn track(&self, dir: &Path) -> Result<()> {
        let canonical = dir
            .canonicalize()
            .with_context(|| format!("resolving tracked directory {}", dir.display()))?;
        if self.tracked.contains_key(&canonical) {
            return Ok(());
        }

        let db_path = self.home.join(catalog_db_name(&canonical));
        let catalog = Arc::new(Catalog::open(db_path).context("opening directory catalog")?);
        let abort = Arc::new(AtomicBool::new(false));

        let indexer = Indexer::new(catalog.clone(), canonical.clone(), Vec::new(), 1 << 20);
        indexer
            .rescan(false, &abort)
            .context("initial full rescan")?;

        self.tracked.insert(
            canonical.clone(),
            TrackedDir {
                catalog: catalog.clone(),
                abort: abort.clone(),
            },
        );

        self.spawn_rescan_loop(canonical, catalog, abort);
        Ok(())
    }

    fn spawn_rescan_loop(&self, root: PathBuf, catalog: Arc<Catalog>, abort: Arc<AtomicBool>) {
        let pool = self.pool.clone();
        std::thread::spawn(move || loop {
            if abort.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(DEFAULT_RESCAN_INTERVAL);
            if abort.load(Ordering::Relaxed) {
                return;
            }
            let catalog = catalog.clone();
            let root = root.clone();
            let abort_for_job = abort.clone();
            pool.submit(move || {
                let indexer = Indexer::new(catalog, root, Vec::new(), 1 << 20);
                if let Err(err) = indexer.rescan(true, &abort_for_job) {
                    tracing::warn!(error = %err, "rescan failed, will retry next tick");
                }
            });
        });
    }

    /// Enumerate this host's candidate addresses for the announcer and
    /// NAT-PMP mapping, split into globally reachable vs. private (§4.3).
    pub fn local_addresses(&self) -> (Vec<std::net::IpAddr>, Vec<std::net::IpAddr>) {
        partition_global(enumerate_interfaces())
    }

    pub fn bind_listener(&self, interfaces: &[std::net::IpAddr]) -> Result<ListenerSet> {
        let port = homeostas_net::pick_initial_port();
        ListenerSet::bind_with_backoff(interfaces, port, 16)
            .context("binding the session listener")
    }

    pub fn shutdown(&self) {
        for entry in self.tracked.iter() {
            entry.value().abort.store(true, Ordering::Relaxed);
        }
    }
}

fn catalog_db_name(dir: &Path) -> String {
    let digest = homeostas_digest::digest(dir.to_string_lossy().as_bytes());
    format!(
        "{}.sqlite",
        digest.to_short_string(Key512::SHORT_ALPHABET, '\0', 0)
    )
}

/// The configuration-stored identity key, generated once on first startup
/// (§3 `ConfigVariable`; §6 process interface has no separate identity
/// file, so this lives under the config store like everything else).
fn load_or_generate_public_key(config: &ConfigStore) -> Result<Key512> {
    if let Ok(value) = config.get("identity.public_key") {
        if let Some(key) = value.as_key512() {
            return Ok(*key);
        }
    }
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    let key = Key512(bytes);
    config
        .set("identity.public_key", key)
        .context("persisting generated identity key")?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_creates_home_and_persists_a_stable_identity_key() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("homeostas");

        let first = AppContext::startup(&home).unwrap();
        assert!(home.join("homeostas.sqlite").exists());
        assert!(home.join("discovery.sqlite").exists());

        let second = AppContext::startup(&home).unwrap();
        assert_eq!(first.public_key, second.public_key);
    }

    #[test]
    fn tracking_a_directory_twice_is_a_no_op() {
        let home = tempfile::tempdir().unwrap();
        let tracked = tempfile::tempdir().unwrap();
        std::fs::write(tracked.path().join("a.txt"), b"hello").unwrap();

        let context = AppContext::startup(home.path()).unwrap();
        context.track(tracked.path()).unwrap();
        context.track(tracked.path()).unwrap();

        assert_eq!(context.tracked.len(), 1);
        context.shutdown();
    }
}
