//! Veilnet Node Database
//!
//! Local cache of verified router contacts, keyed by router id and backed
//! by one file per contact under a root directory. All disk work funnels
//! through an injected [`WorkDispatcher`] so the event loop never blocks;
//! the in-memory map stays authoritative when a write fails and the entry
//! is retried on the next flush.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use veilnet_contact::RouterContact;
use veilnet_core::config::NodeDbConfig;
use veilnet_core::{Result, RouterId, Time, WorkDispatcher};

const RC_FILE_EXT: &str = "signed";

struct Entry {
    rc: RouterContact,
    inserted_at: Time,
}

/// Contact cache with per-pubkey disk persistence.
pub struct NodeDb {
    entries: Mutex<HashMap<RouterId, Entry>>,
    next_flush_at: Mutex<Time>,
    root: Option<PathBuf>,
    disk: Arc<dyn WorkDispatcher>,
    config: NodeDbConfig,
}

impl NodeDb {
    /// Database rooted at `root`; contact files live directly inside it.
    pub fn new(root: PathBuf, disk: Arc<dyn WorkDispatcher>, config: NodeDbConfig) -> NodeDb {
        NodeDb {
            entries: Mutex::new(HashMap::new()),
            next_flush_at: Mutex::new(Time::ZERO),
            root: Some(root),
            disk,
            config,
        }
    }

    /// Memory-only database, for tests and ephemeral nodes.
    pub fn in_memory(disk: Arc<dyn WorkDispatcher>, config: NodeDbConfig) -> NodeDb {
        NodeDb {
            entries: Mutex::new(HashMap::new()),
            next_flush_at: Mutex::new(Time::ZERO),
            root: None,
            disk,
            config,
        }
    }

    fn path_for(&self, pk: &RouterId) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(format!("{}.{RC_FILE_EXT}", pk.to_hex())))
    }

    /// Synchronously scan the root directory, decoding every contact
    /// file. Undecodable files are logged and skipped, never deleted.
    pub fn load_from_disk(&self, now: Time) -> Result<usize> {
        let Some(root) = &self.root else {
            return Ok(0);
        };
        std::fs::create_dir_all(root)?;
        let mut loaded = 0;
        for item in std::fs::read_dir(root)? {
            let item = item?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RC_FILE_EXT) {
                continue;
            }
            match load_one(&path) {
                Ok(rc) => {
                    self.entries.lock().insert(
                        rc.router_id(),
                        Entry {
                            rc,
                            inserted_at: now,
                        },
                    );
                    loaded += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping undecodable contact file");
                }
            }
        }
        debug!(loaded, "nodedb loaded from disk");
        Ok(loaded)
    }

    /// Write every cached contact out through the disk dispatcher.
    pub fn save_to_disk(&self) {
        let Some(_) = &self.root else {
            return;
        };
        let pending: Vec<(PathBuf, Vec<u8>)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter_map(|(pk, entry)| Some((self.path_for(pk)?, entry.rc.encode())))
                .collect()
        };
        self.disk.post(Box::new(move || {
            for (path, bytes) in pending {
                write_one(&path, &bytes);
            }
        }));
    }

    pub fn num_loaded(&self) -> usize {
        self.entries.lock().len()
    }

    /// Insert `rc` unless we already hold a contact for the same relay
    /// that is at least as fresh. Ties keep the existing record.
    pub fn put_if_newer(&self, rc: RouterContact, now: Time) {
        let pk = rc.router_id();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&pk) {
            if !rc.is_newer_than(&existing.rc) {
                return;
            }
        }
        entries.insert(
            pk,
            Entry {
                rc: rc.clone(),
                inserted_at: now,
            },
        );
        drop(entries);
        self.schedule_write(&pk, rc);
    }

    /// Unconditional replace.
    pub fn put(&self, rc: RouterContact, now: Time) {
        let pk = rc.router_id();
        self.entries.lock().insert(
            pk,
            Entry {
                rc: rc.clone(),
                inserted_at: now,
            },
        );
        self.schedule_write(&pk, rc);
    }

    fn schedule_write(&self, pk: &RouterId, rc: RouterContact) {
        let Some(path) = self.path_for(pk) else {
            return;
        };
        let bytes = rc.encode();
        self.disk.post(Box::new(move || {
            write_one(&path, &bytes);
        }));
    }

    pub fn get(&self, pk: &RouterId) -> Option<RouterContact> {
        self.entries.lock().get(pk).map(|e| e.rc.clone())
    }

    pub fn has(&self, pk: &RouterId) -> bool {
        self.entries.lock().contains_key(pk)
    }

    /// The single contact whose id minimizes `pubkey XOR key`.
    pub fn find_closest_to(&self, key: &RouterId) -> Option<RouterContact> {
        let entries = self.entries.lock();
        entries
            .values()
            .min_by_key(|e| e.rc.router_id().xor_distance(key))
            .map(|e| e.rc.clone())
    }

    /// Up to `n` contacts sorted by XOR distance ascending, ties broken
    /// by pubkey order.
    pub fn find_many_closest_to(&self, key: &RouterId, n: usize) -> Vec<RouterContact> {
        let entries = self.entries.lock();
        let mut all: Vec<&Entry> = entries.values().collect();
        all.sort_by_key(|e| {
            let id = e.rc.router_id();
            (id.xor_distance(key), id)
        });
        all.into_iter().take(n).map(|e| e.rc.clone()).collect()
    }

    /// A uniformly random contact passing `filter`, if any. Entries are
    /// cloned under the lock; nothing aliases the map afterwards.
    pub fn get_random(&self, filter: impl Fn(&RouterContact) -> bool) -> Option<RouterContact> {
        let entries = self.entries.lock();
        let mut candidates: Vec<&Entry> = entries.values().collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .find(|e| filter(&e.rc))
            .map(|e| e.rc.clone())
    }

    pub fn visit_all(&self, mut visit: impl FnMut(&RouterContact)) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            visit(&entry.rc);
        }
    }

    pub fn visit_inserted_before(&self, cutoff: Time, mut visit: impl FnMut(&RouterContact)) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            if entry.inserted_at < cutoff {
                visit(&entry.rc);
            }
        }
    }

    pub fn remove(&self, pk: &RouterId) {
        if self.entries.lock().remove(pk).is_some() {
            self.schedule_remove_files(vec![*pk]);
        }
    }

    /// Remove all entries matching `predicate`; their files are deleted
    /// asynchronously.
    pub fn remove_if(&self, predicate: impl Fn(&RouterContact) -> bool) {
        let removed: Vec<RouterId> = {
            let mut entries = self.entries.lock();
            let doomed: Vec<RouterId> = entries
                .iter()
                .filter(|(_, e)| predicate(&e.rc))
                .map(|(pk, _)| *pk)
                .collect();
            for pk in &doomed {
                entries.remove(pk);
            }
            doomed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "nodedb removed contacts");
            self.schedule_remove_files(removed);
        }
    }

    /// Evict entries inserted before `cutoff` whose relay is not pinned
    /// by `keep`.
    pub fn remove_stale(&self, keep: &HashSet<RouterId>, cutoff: Time) {
        let removed: Vec<RouterId> = {
            let mut entries = self.entries.lock();
            let doomed: Vec<RouterId> = entries
                .iter()
                .filter(|(pk, e)| e.inserted_at < cutoff && !keep.contains(pk))
                .map(|(pk, _)| *pk)
                .collect();
            for pk in &doomed {
                entries.remove(pk);
            }
            doomed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "nodedb evicted stale contacts");
            self.schedule_remove_files(removed);
        }
    }

    fn schedule_remove_files(&self, idents: Vec<RouterId>) {
        if self.root.is_none() {
            return;
        }
        let paths: Vec<PathBuf> = idents.iter().filter_map(|pk| self.path_for(pk)).collect();
        self.disk.post(Box::new(move || {
            for path in paths {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = %path.display(), error = %e, "failed to remove contact file");
                    }
                }
            }
        }));
    }

    /// Periodic upkeep: flush on the configured interval and evict
    /// entries past the stale age.
    pub fn tick(&self, now: Time, keep: &HashSet<RouterId>) {
        let flush = {
            let mut next = self.next_flush_at.lock();
            if now >= *next {
                *next = now + self.config.flush_interval;
                true
            } else {
                false
            }
        };
        if flush {
            self.save_to_disk();
        }
        let cutoff = now.saturating_sub(self.config.stale_age);
        if cutoff > Time::ZERO {
            self.remove_stale(keep, cutoff);
        }
    }
}

fn write_one(path: &Path, bytes: &[u8]) {
    if let Err(e) = std::fs::write(path, bytes) {
        warn!(file = %path.display(), error = %e, "failed to write contact file");
    }
}

fn load_one(path: &Path) -> Result<RouterContact> {
    let bytes = std::fs::read(path)?;
    RouterContact::decode(&bytes)
}
