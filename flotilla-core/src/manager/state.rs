//! Authoritative in-memory state
//!
//! Holds the runner record set and the total shard assignment map under a
//! single coarse lock. Mutations are invoked only by the control loop;
//! readers take consistent snapshots. Every committed mutation bumps the
//! commit version and yields a per-runner delta for the persister and
//! notifier.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{FlotillaError, Result};
use crate::manager::engine::EngineView;
use crate::storage::{PersistedAssignment, PersistedRunner, PersistedState};

/// Shard identifier: a positive integer in `[1, total_shards]`
pub type ShardId = u32;

/// Address of a worker process, compared by value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunnerAddress {
    pub host: String,
    pub port: u16,
}

impl RunnerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RunnerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Record kept for each registered runner
#[derive(Debug, Clone)]
pub struct RunnerRecord {
    /// Deployed software version; non-decreasing per address
    pub version: u64,
    /// When the runner registered (or was recovered from a snapshot)
    pub registered_at: Instant,
    /// Last observed heartbeat
    pub last_heartbeat: Instant,
    /// Consecutive failed health pings
    pub strikes: u32,
    /// False for snapshot-recovered runners until their first heartbeat
    pub verified: bool,
}

/// Per-runner difference produced by one commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerDelta {
    pub assigned: BTreeSet<ShardId>,
    pub revoked: BTreeSet<ShardId>,
}

/// Difference between two consecutive committed snapshots
#[derive(Debug, Clone, Default)]
pub struct Delta {
    changes: BTreeMap<RunnerAddress, RunnerDelta>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &BTreeMap<RunnerAddress, RunnerDelta> {
        &self.changes
    }

    /// Total number of shard moves this delta describes
    pub fn move_count(&self) -> usize {
        self.changes
            .values()
            .map(|d| d.assigned.len() + d.revoked.len())
            .sum()
    }

    fn assigned(&mut self, addr: &RunnerAddress, shard: ShardId) {
        self.changes
            .entry(addr.clone())
            .or_default()
            .assigned
            .insert(shard);
    }

    fn revoked(&mut self, addr: &RunnerAddress, shard: ShardId) {
        self.changes
            .entry(addr.clone())
            .or_default()
            .revoked
            .insert(shard);
    }
}

/// Result of a committed mutation
#[derive(Debug)]
pub struct Commit {
    pub version: u64,
    pub delta: Delta,
}

struct Inner {
    runners: BTreeMap<RunnerAddress, RunnerRecord>,
    assignments: BTreeMap<ShardId, Option<RunnerAddress>>,
    commit_version: u64,
}

/// The state store: one coarse lock over runners and assignments
///
/// Contention is trivial at the event rates the manager sees, so a single
/// `parking_lot::Mutex` guards the whole state.
pub struct StateStore {
    total_shards: u32,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Create an empty store with every shard unassigned
    pub fn new(total_shards: u32) -> Self {
        let assignments = (1..=total_shards).map(|s| (s, None)).collect();
        Self {
            total_shards,
            inner: Mutex::new(Inner {
                runners: BTreeMap::new(),
                assignments,
                commit_version: 0,
            }),
        }
    }

    /// Initialize from a recovered snapshot, before the event intake opens
    ///
    /// Recovered runners are unverified until their first heartbeat; the
    /// prober picks them up on its first tick.
    pub fn seed(&self, snapshot: &PersistedState, now: Instant) -> Result<()> {
        if snapshot.total_shards != self.total_shards {
            return Err(FlotillaError::SnapshotMismatch {
                snapshot: snapshot.total_shards,
                configured: self.total_shards,
            });
        }

        let mut inner = self.inner.lock();
        for runner in &snapshot.runners {
            inner.runners.insert(
                RunnerAddress::new(runner.host.clone(), runner.port),
                RunnerRecord {
                    version: runner.version,
                    registered_at: now,
                    last_heartbeat: now,
                    strikes: 0,
                    verified: false,
                },
            );
        }
        for entry in &snapshot.assignments {
            if entry.shard == 0 || entry.shard > self.total_shards {
                return Err(FlotillaError::ShardOutOfRange {
                    shard: entry.shard,
                    total: self.total_shards,
                });
            }
            if let Some(owner) = &entry.owner {
                if !inner.runners.contains_key(owner) {
                    return Err(FlotillaError::UnknownOwner {
                        shard: entry.shard,
                        addr: owner.clone(),
                    });
                }
            }
            inner.assignments.insert(entry.shard, entry.owner.clone());
        }
        inner.commit_version = snapshot.version;
        Ok(())
    }

    /// Register a runner, or update its version on a rolling-upgrade
    /// re-register
    ///
    /// Idempotent on `(address, version)`: an identical re-register commits
    /// nothing. A lower version is client misuse.
    pub fn add_runner(
        &self,
        addr: &RunnerAddress,
        version: u64,
        now: Instant,
    ) -> Result<Option<Commit>> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.runners.get_mut(addr) {
            if record.version == version {
                record.last_heartbeat = now;
                record.strikes = 0;
                record.verified = true;
                return Ok(None);
            }
            if record.version > version {
                return Err(FlotillaError::VersionRegression {
                    addr: addr.clone(),
                    current: record.version,
                    proposed: version,
                });
            }
            record.version = version;
            record.last_heartbeat = now;
            record.strikes = 0;
            record.verified = true;
        } else {
            inner.runners.insert(
                addr.clone(),
                RunnerRecord {
                    version,
                    registered_at: now,
                    last_heartbeat: now,
                    strikes: 0,
                    verified: true,
                },
            );
        }
        inner.commit_version += 1;
        Ok(Some(Commit {
            version: inner.commit_version,
            delta: Delta::default(),
        }))
    }

    /// Remove a runner and unassign its shards in the same commit
    ///
    /// No transient state where the runner is gone but its shards still
    /// point to it is ever visible to readers.
    pub fn remove_runner(&self, addr: &RunnerAddress) -> Result<Commit> {
        let mut inner = self.inner.lock();
        if inner.runners.remove(addr).is_none() {
            return Err(FlotillaError::RunnerNotRegistered { addr: addr.clone() });
        }

        let mut delta = Delta::default();
        for (shard, owner) in inner.assignments.iter_mut() {
            if owner.as_ref() == Some(addr) {
                delta.revoked(addr, *shard);
                *owner = None;
            }
        }
        inner.commit_version += 1;
        Ok(Commit {
            version: inner.commit_version,
            delta,
        })
    }

    /// Refresh a runner's heartbeat; resets strikes and verifies it
    pub fn heartbeat(&self, addr: &RunnerAddress, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .runners
            .get_mut(addr)
            .ok_or_else(|| FlotillaError::RunnerNotRegistered { addr: addr.clone() })?;
        record.last_heartbeat = now;
        record.strikes = 0;
        record.verified = true;
        Ok(())
    }

    /// Count a failed health ping; returns the consecutive strike total
    pub fn record_strike(&self, addr: &RunnerAddress) -> Result<u32> {
        let mut inner = self.inner.lock();
        let record = inner
            .runners
            .get_mut(addr)
            .ok_or_else(|| FlotillaError::RunnerNotRegistered { addr: addr.clone() })?;
        record.strikes += 1;
        Ok(record.strikes)
    }

    /// Apply a batch of unassignments and assignments atomically
    ///
    /// Removes are applied before adds; a shard that changes owner within
    /// the batch must appear in both lists. Partial application is
    /// forbidden: all validation happens before the first write.
    pub fn apply_assignments(
        &self,
        removes: &[(ShardId, RunnerAddress)],
        adds: &[(ShardId, RunnerAddress)],
    ) -> Result<Option<Commit>> {
        if removes.is_empty() && adds.is_empty() {
            return Ok(None);
        }

        let mut inner = self.inner.lock();

        let removed: BTreeSet<ShardId> = removes.iter().map(|(s, _)| *s).collect();
        for (shard, expected) in removes {
            let current = self.slot(&inner, *shard)?;
            match current {
                Some(owner) if owner == expected => {}
                other => {
                    return Err(FlotillaError::OwnerMismatch {
                        shard: *shard,
                        expected: expected.clone(),
                        actual: other
                            .as_ref()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "unassigned".into()),
                    });
                }
            }
        }
        for (shard, target) in adds {
            if !inner.runners.contains_key(target) {
                return Err(FlotillaError::UnknownOwner {
                    shard: *shard,
                    addr: target.clone(),
                });
            }
            let current = self.slot(&inner, *shard)?;
            if let Some(owner) = current {
                if !removed.contains(shard) {
                    return Err(FlotillaError::AssignmentOverwrite {
                        shard: *shard,
                        current: owner.clone(),
                    });
                }
            }
        }

        let mut delta = Delta::default();
        for (shard, owner) in removes {
            inner.assignments.insert(*shard, None);
            delta.revoked(owner, *shard);
        }
        for (shard, target) in adds {
            inner.assignments.insert(*shard, Some(target.clone()));
            delta.assigned(target, *shard);
        }
        inner.commit_version += 1;
        Ok(Some(Commit {
            version: inner.commit_version,
            delta,
        }))
    }

    fn slot<'a>(&self, inner: &'a Inner, shard: ShardId) -> Result<&'a Option<RunnerAddress>> {
        if shard == 0 || shard > self.total_shards {
            return Err(FlotillaError::ShardOutOfRange {
                shard,
                total: self.total_shards,
            });
        }
        inner
            .assignments
            .get(&shard)
            .ok_or_else(|| FlotillaError::Internal {
                message: format!("shard {shard} missing from assignment map"),
            })
    }

    // ---- read-only snapshot accessors ----

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn commit_version(&self) -> u64 {
        self.inner.lock().commit_version
    }

    pub fn all_runners(&self) -> BTreeMap<RunnerAddress, RunnerRecord> {
        self.inner.lock().runners.clone()
    }

    pub fn runner_count(&self) -> usize {
        self.inner.lock().runners.len()
    }

    pub fn all_assignments(&self) -> BTreeMap<ShardId, Option<RunnerAddress>> {
        self.inner.lock().assignments.clone()
    }

    pub fn assignments_for(&self, addr: &RunnerAddress) -> BTreeSet<ShardId> {
        self.inner
            .lock()
            .assignments
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(addr))
            .map(|(shard, _)| *shard)
            .collect()
    }

    pub fn assigned_count(&self) -> usize {
        self.inner
            .lock()
            .assignments
            .values()
            .filter(|o| o.is_some())
            .count()
    }

    pub fn is_registered(&self, addr: &RunnerAddress) -> bool {
        self.inner.lock().runners.contains_key(addr)
    }

    /// Snapshot for the pure assignment engine
    pub fn engine_view(&self) -> EngineView {
        let inner = self.inner.lock();
        EngineView {
            runners: inner
                .runners
                .iter()
                .map(|(addr, rec)| (addr.clone(), rec.version))
                .collect(),
            assignments: inner.assignments.clone(),
        }
    }

    /// Runners the prober should ping: silent beyond the threshold, plus
    /// unverified snapshot-recovered runners
    pub fn probe_candidates(&self, now: Instant, threshold: Duration) -> Vec<RunnerAddress> {
        self.inner
            .lock()
            .runners
            .iter()
            .filter(|(_, rec)| !rec.verified || now.duration_since(rec.last_heartbeat) > threshold)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Full durable snapshot of the current committed state
    pub fn persisted_state(&self) -> PersistedState {
        let inner = self.inner.lock();
        PersistedState::new(
            inner.commit_version,
            self.total_shards,
            inner
                .runners
                .iter()
                .map(|(addr, rec)| PersistedRunner {
                    host: addr.host.clone(),
                    port: addr.port,
                    version: rec.version,
                })
                .collect(),
            inner
                .assignments
                .iter()
                .map(|(shard, owner)| PersistedAssignment {
                    shard: *shard,
                    owner: owner.clone(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> RunnerAddress {
        RunnerAddress::new("10.0.0.1", 7000 + n)
    }

    #[tokio::test]
    async fn domain_always_complete() {
        let store = StateStore::new(16);
        assert_eq!(store.all_assignments().len(), 16);
        let now = Instant::now();
        store.add_runner(&addr(1), 1, now).unwrap();
        store
            .apply_assignments(&[], &[(1, addr(1)), (16, addr(1))])
            .unwrap();
        let map = store.all_assignments();
        assert_eq!(map.len(), 16);
        assert_eq!(map[&1], Some(addr(1)));
        assert_eq!(map[&8], None);
    }

    #[tokio::test]
    async fn register_is_idempotent_on_address_and_version() {
        let store = StateStore::new(4);
        let now = Instant::now();
        assert!(store.add_runner(&addr(1), 3, now).unwrap().is_some());
        assert!(store.add_runner(&addr(1), 3, now).unwrap().is_none());
        // Upgrade commits, downgrade is misuse
        assert!(store.add_runner(&addr(1), 4, now).unwrap().is_some());
        assert!(matches!(
            store.add_runner(&addr(1), 2, now),
            Err(FlotillaError::VersionRegression { .. })
        ));
    }

    #[tokio::test]
    async fn remove_runner_unassigns_in_same_commit() {
        let store = StateStore::new(8);
        let now = Instant::now();
        store.add_runner(&addr(1), 1, now).unwrap();
        store
            .apply_assignments(&[], &[(2, addr(1)), (5, addr(1))])
            .unwrap();

        let commit = store.remove_runner(&addr(1)).unwrap();
        let delta = commit.delta.changes().get(&addr(1)).unwrap();
        assert_eq!(delta.revoked, BTreeSet::from([2, 5]));
        assert!(delta.assigned.is_empty());
        assert_eq!(store.assigned_count(), 0);
        assert!(!store.is_registered(&addr(1)));
    }

    #[tokio::test]
    async fn overwrite_in_place_is_invariant_violation() {
        let store = StateStore::new(4);
        let now = Instant::now();
        store.add_runner(&addr(1), 1, now).unwrap();
        store.add_runner(&addr(2), 1, now).unwrap();
        store.apply_assignments(&[], &[(1, addr(1))]).unwrap();

        let err = store
            .apply_assignments(&[], &[(1, addr(2))])
            .unwrap_err();
        assert!(err.is_fatal());
        // Explicit unassign-then-assign in one batch is fine
        store
            .apply_assignments(&[(1, addr(1))], &[(1, addr(2))])
            .unwrap();
        assert_eq!(store.all_assignments()[&1], Some(addr(2)));
    }

    #[tokio::test]
    async fn batch_validation_rejects_before_any_write() {
        let store = StateStore::new(4);
        let now = Instant::now();
        store.add_runner(&addr(1), 1, now).unwrap();
        let before = store.all_assignments();

        // Second add targets an unknown runner; the first must not apply
        let err = store
            .apply_assignments(&[], &[(1, addr(1)), (2, addr(9))])
            .unwrap_err();
        assert!(matches!(err, FlotillaError::UnknownOwner { .. }));
        assert_eq!(store.all_assignments(), before);
        assert_eq!(store.commit_version(), 1);
    }

    #[tokio::test]
    async fn strikes_reset_on_heartbeat() {
        let store = StateStore::new(4);
        let now = Instant::now();
        store.add_runner(&addr(1), 1, now).unwrap();
        assert_eq!(store.record_strike(&addr(1)).unwrap(), 1);
        assert_eq!(store.record_strike(&addr(1)).unwrap(), 2);
        store.heartbeat(&addr(1), now).unwrap();
        assert_eq!(store.record_strike(&addr(1)).unwrap(), 1);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_runner_is_misuse() {
        let store = StateStore::new(4);
        let err = store.heartbeat(&addr(1), Instant::now()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ClientMisuse);
    }

    #[tokio::test]
    async fn seed_restores_snapshot_and_marks_unverified() {
        let store = StateStore::new(4);
        let now = Instant::now();
        store.add_runner(&addr(1), 2, now).unwrap();
        store.apply_assignments(&[], &[(3, addr(1))]).unwrap();
        let snapshot = store.persisted_state();

        let restored = StateStore::new(4);
        restored.seed(&snapshot, now).unwrap();
        assert_eq!(restored.all_assignments(), store.all_assignments());
        assert_eq!(restored.commit_version(), store.commit_version());
        assert!(!restored.all_runners()[&addr(1)].verified);
        // Unverified runners are probe candidates even with a fresh heartbeat
        assert_eq!(
            restored.probe_candidates(now, Duration::from_secs(60)),
            vec![addr(1)]
        );
    }

    #[tokio::test]
    async fn seed_rejects_mismatched_shard_space() {
        let store = StateStore::new(4);
        let snapshot = store.persisted_state();
        let other = StateStore::new(8);
        assert!(matches!(
            other.seed(&snapshot, Instant::now()),
            Err(FlotillaError::SnapshotMismatch { .. })
        ));
    }
}
