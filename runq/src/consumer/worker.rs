use std::cmp::Ordering;
use std::fmt;

use super::collaborators::BackgroundWorkerRecord;

/// A `major.minor` worker version compared part by part as numbers, so
/// `20240101.10` is newer than `20240101.9`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerVersion {
    raw: String,
    parts: [Option<u64>; 2],
}

impl WorkerVersion {
    pub fn parse(raw: &str) -> Self {
        let mut parts = [None, None];
        for (slot, part) in parts.iter_mut().zip(raw.split('.')) {
            *slot = part.trim().parse().ok();
        }
        Self {
            raw: raw.to_string(),
            parts,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Strictly newer. Unparseable or equal parts never make a version newer.
    pub fn is_newer_than(&self, other: &WorkerVersion) -> bool {
        match compare_part(self.parts[0], other.parts[0]) {
            Some(Ordering::Greater) => return true,
            Some(Ordering::Less) => return false,
            _ => {}
        }
        compare_part(self.parts[1], other.parts[1]) == Some(Ordering::Greater)
    }
}

fn compare_part(a: Option<u64>, b: Option<u64>) -> Option<Ordering> {
    Some(a?.cmp(&b?))
}

impl fmt::Display for WorkerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Background workers registered on one connection.
///
/// Deprecated workers are kept aside so runs already locked to them can
/// still be dispatched; they are never picked for new runs.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    active: Vec<BackgroundWorkerRecord>,
    deprecated: Vec<BackgroundWorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.active.iter().any(|worker| worker.id == worker_id)
    }

    /// Returns `false` when the worker was already registered.
    pub fn register(&mut self, worker: BackgroundWorkerRecord) -> bool {
        if self.contains(&worker.id) {
            return false;
        }
        self.active.push(worker);
        true
    }

    /// Move a worker, by id or friendly id, to the deprecated set. Unknown
    /// ids are ignored.
    pub fn deprecate(&mut self, worker_id: &str) -> bool {
        let Some(index) = self
            .active
            .iter()
            .position(|worker| worker.id == worker_id || worker.friendly_id == worker_id)
        else {
            return false;
        };
        let worker = self.active.remove(index);
        self.deprecated.push(worker);
        true
    }

    /// Newest active worker. Ties keep the earlier registration.
    pub fn latest(&self) -> Option<&BackgroundWorkerRecord> {
        let mut workers = self.active.iter();
        let first = workers.next()?;
        let mut latest = (first, WorkerVersion::parse(&first.version));
        for worker in workers {
            let version = WorkerVersion::parse(&worker.version);
            if version.is_newer_than(&latest.1) {
                latest = (worker, version);
            }
        }
        Some(latest.0)
    }

    /// The worker a run should be dispatched to: the one it is locked to,
    /// deprecated or not, else the latest.
    pub fn resolve(&self, locked_to_version_id: Option<&str>) -> Option<&BackgroundWorkerRecord> {
        match locked_to_version_id {
            Some(id) => self
                .deprecated
                .iter()
                .chain(self.active.iter())
                .find(|worker| worker.id == id),
            None => self.latest(),
        }
    }

    pub fn active_ids(&self) -> Vec<&str> {
        self.active.iter().map(|worker| worker.id.as_str()).collect()
    }

    pub fn deprecated_ids(&self) -> Vec<&str> {
        self.deprecated.iter().map(|worker| worker.id.as_str()).collect()
    }
}
