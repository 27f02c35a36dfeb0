//! Persistence for PlayGrid host and platform records.
//!
//! Each store keeps its collection in memory behind a read-write lock and
//! rewrites `{state_path}/{collection}.json` on every mutation, going
//! through a temp file + rename so a crash mid-write cannot leave a torn
//! snapshot on disk. State changes for a given host are serialized through
//! [`HostStore::transition`]; concurrent incompatible attempts collapse so
//! that exactly one caller applies the change.

#![forbid(unsafe_code)]

use chrono::Utc;
use grid_proto::{HostRecord, HostState, PlatformProfile};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("host '{0}' not found")]
    HostNotFound(String),

    #[error("platform '{0}' not found")]
    PlatformNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Snapshot I/O ────────────────────────────────────────────────────────────

fn collection_path(state_path: &Path, collection: &str) -> PathBuf {
    state_path.join(format!("{collection}.json"))
}

/// Read a collection snapshot. A missing file is an empty collection; an
/// unreadable or unparseable one is logged and treated as empty rather than
/// blocking startup.
fn read_snapshot<T: DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no snapshot yet");
            return HashMap::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "snapshot unreadable, starting empty");
            return HashMap::new();
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "snapshot failed to parse, starting empty");
            HashMap::new()
        }
    }
}

/// Rewrite the full collection. The temp-file rename keeps the previous
/// snapshot intact until the new one is complete.
fn write_snapshot<T: Serialize>(path: &Path, data: &HashMap<String, T>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

// ─── HostStore ───────────────────────────────────────────────────────────────

/// What happened when a CAS transition was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was applied by this caller.
    Applied,
    /// The host was already in the target state. Idempotent success: a
    /// concurrent caller won the race and this caller must not repeat
    /// provider side effects.
    AlreadyThere,
    /// The host's current state was not in the allowed set.
    Rejected { actual: HostState },
}

/// In-memory host record store with durable snapshots and per-record
/// optimistic concurrency.
///
/// Every write bumps `version` and `updated_at`. Records are never removed;
/// terminal states are retained for billing.
pub struct HostStore {
    hosts: RwLock<HashMap<String, HostRecord>>,
    path: PathBuf,
}

impl HostStore {
    pub fn open(state_path: &Path, collection: &str) -> Self {
        let path = collection_path(state_path, collection);
        let hosts: HashMap<String, HostRecord> = read_snapshot(&path);
        debug!(count = hosts.len(), collection, "host store opened");
        Self { hosts: RwLock::new(hosts), path }
    }

    pub fn insert(&self, host: HostRecord) {
        let mut hosts = self.hosts.write();
        hosts.insert(host.host_id.clone(), host);
        self.snapshot(&hosts);
    }

    pub fn get(&self, host_id: &str) -> Option<HostRecord> {
        self.hosts.read().get(host_id).cloned()
    }

    pub fn all(&self) -> Vec<HostRecord> {
        self.hosts.read().values().cloned().collect()
    }

    /// Hosts currently in one of the given states.
    pub fn in_states(&self, states: &[HostState]) -> Vec<HostRecord> {
        self.hosts
            .read()
            .values()
            .filter(|h| states.contains(&h.state))
            .cloned()
            .collect()
    }

    /// The user's non-terminal host for a platform, if any (dedupe lookup).
    pub fn find_active(&self, user_id: &str, platform: &str) -> Option<HostRecord> {
        self.hosts
            .read()
            .values()
            .find(|h| h.user_id == user_id && h.platform == platform && !h.state.is_terminal())
            .cloned()
    }

    /// Look a host up by its agent manifest token.
    pub fn find_by_token(&self, vm_token: &str) -> Option<HostRecord> {
        self.hosts
            .read()
            .values()
            .find(|h| h.vm_token == vm_token)
            .cloned()
    }

    /// Compare-and-set state transition.
    ///
    /// Atomically moves the host to `to` if its current state is in
    /// `allowed_from`. The write lock spans read-check-write, so per-host
    /// transitions are linearized; the loser of a race observes the new
    /// state and gets [`TransitionOutcome::AlreadyThere`].
    pub fn transition(
        &self,
        host_id: &str,
        allowed_from: &[HostState],
        to: HostState,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut hosts = self.hosts.write();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::HostNotFound(host_id.to_string()))?;

        if host.state == to {
            return Ok(TransitionOutcome::AlreadyThere);
        }
        if !allowed_from.contains(&host.state) || !host.state.can_transition(to) {
            return Ok(TransitionOutcome::Rejected { actual: host.state });
        }

        host.state = to;
        host.version += 1;
        host.updated_at = Utc::now();
        self.snapshot(&hosts);
        Ok(TransitionOutcome::Applied)
    }

    /// Mutate non-state fields of a record. Bumps `version`/`updated_at`.
    pub fn update<F>(&self, host_id: &str, f: F) -> Result<HostRecord, StoreError>
    where
        F: FnOnce(&mut HostRecord),
    {
        let mut hosts = self.hosts.write();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::HostNotFound(host_id.to_string()))?;
        f(host);
        host.version += 1;
        host.updated_at = Utc::now();
        let updated = host.clone();
        self.snapshot(&hosts);
        Ok(updated)
    }

    fn snapshot(&self, hosts: &HashMap<String, HostRecord>) {
        if let Err(e) = write_snapshot(&self.path, hosts) {
            warn!(path = %self.path.display(), error = %e, "host snapshot write failed");
        }
    }
}

// ─── ProfileStore ────────────────────────────────────────────────────────────

/// Platform profile store, keyed by platform tag.
pub struct ProfileStore {
    profiles: RwLock<HashMap<String, PlatformProfile>>,
    path: PathBuf,
}

impl ProfileStore {
    pub fn open(state_path: &Path, collection: &str) -> Self {
        let path = collection_path(state_path, collection);
        let profiles: HashMap<String, PlatformProfile> = read_snapshot(&path);
        debug!(count = profiles.len(), collection, "profile store opened");
        Self { profiles: RwLock::new(profiles), path }
    }

    pub fn get(&self, platform: &str) -> Option<PlatformProfile> {
        self.profiles.read().get(platform).cloned()
    }

    pub fn all(&self) -> Vec<PlatformProfile> {
        self.profiles.read().values().cloned().collect()
    }

    /// Insert or replace a profile. The profile must validate.
    pub fn put(&self, profile: PlatformProfile) -> Result<(), String> {
        profile.validate()?;
        let mut profiles = self.profiles.write();
        profiles.insert(profile.platform.clone(), profile);
        if let Err(e) = write_snapshot(&self.path, &profiles) {
            warn!(path = %self.path.display(), error = %e, "profile snapshot write failed");
        }
        Ok(())
    }
}
