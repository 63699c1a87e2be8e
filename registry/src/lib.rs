//! Failure registry
//!
//! Every ongoing failure is a [`CurrentFail`] keyed by fingerprint. The whole
//! set lives in one JSON file, rewritten after each change by a single
//! background persister; the latest snapshot always wins.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use hostwatch_core::{Error, Result};

pub mod models;

pub use models::{CurrentFail, FailSubject};

/// File name of the persisted registry inside the save directory
pub const FAILS_FILE: &str = "hostwatch-fails.json";

type Snapshot = Arc<BTreeMap<String, CurrentFail>>;

/// Registry of ongoing failures
pub struct FailRegistry {
    fails: Mutex<HashMap<String, CurrentFail>>,
    path: Option<PathBuf>,
    snapshots: watch::Sender<Snapshot>,
}

impl FailRegistry {
    /// Create a registry that is never persisted
    pub fn in_memory() -> Self {
        Self::with_records(HashMap::new(), None)
    }

    fn with_records(fails: HashMap<String, CurrentFail>, path: Option<PathBuf>) -> Self {
        let snapshot = Arc::new(fails.clone().into_iter().collect());
        let (snapshots, _) = watch::channel(snapshot);
        Self {
            fails: Mutex::new(fails),
            path,
            snapshots,
        }
    }

    /// Load the registry persisted in `save_dir`
    ///
    /// A missing file means an empty registry.
    pub fn open(save_dir: impl AsRef<Path>) -> Result<Self> {
        let path = save_dir.as_ref().join(FAILS_FILE);
        let fails = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<HashMap<String, CurrentFail>>(&content)
                .map_err(|e| Error::State(format!("can't parse {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::State(format!(
                    "can't read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        info!(path = %path.display(), records = fails.len(), "Fail registry loaded");
        Ok(Self::with_records(fails, Some(path)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CurrentFail>> {
        // A panic while holding the lock leaves the map consistent
        self.fails.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish the new state to the persister; called with the lock held
    fn publish(&self, fails: &HashMap<String, CurrentFail>) {
        let snapshot: BTreeMap<String, CurrentFail> =
            fails.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    pub fn get(&self, fingerprint: &str) -> Option<CurrentFail> {
        self.lock().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Count one more failure, creating the record if needed
    ///
    /// Returns the updated record and whether it was just created. The
    /// success streak is reset.
    pub fn increment_fail(&self, subject: FailSubject, now: DateTime<Utc>) -> (CurrentFail, bool) {
        let fingerprint = subject.fingerprint();
        let mut fails = self.lock();
        let created = !fails.contains_key(&fingerprint);
        let record = fails
            .entry(fingerprint.clone())
            .and_modify(|r| {
                r.fail_count = r.fail_count.saturating_add(1);
                r.ok_count = 0;
            })
            .or_insert_with(|| CurrentFail::new(subject, now))
            .clone();
        self.publish(&fails);
        debug!(
            fingerprint = %fingerprint,
            subject = %record.subject,
            fail_count = record.fail_count,
            "Failure counted"
        );
        (record, created)
    }

    /// Count one success on an existing record
    pub fn increment_ok(&self, fingerprint: &str) -> Option<CurrentFail> {
        let mut fails = self.lock();
        let record = fails.get_mut(fingerprint).map(|r| {
            r.ok_count = r.ok_count.saturating_add(1);
            r.clone()
        });
        if record.is_some() {
            self.publish(&fails);
        }
        record
    }

    /// Delete a record, returning it if it existed
    pub fn remove(&self, fingerprint: &str) -> Option<CurrentFail> {
        let mut fails = self.lock();
        let removed = fails.remove(fingerprint);
        if removed.is_some() {
            self.publish(&fails);
        }
        removed
    }

    /// Records concerning one host
    pub fn for_host(&self, host: &str) -> Vec<CurrentFail> {
        let mut records: Vec<CurrentFail> = self
            .lock()
            .values()
            .filter(|r| r.subject.host() == host)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.fail_start);
        records
    }

    /// Current records, ordered by fingerprint
    pub fn snapshot(&self) -> BTreeMap<String, CurrentFail> {
        self.snapshots.borrow().as_ref().clone()
    }

    /// Write the current state synchronously
    pub fn save_now(&self) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, &self.snapshot()),
            None => Ok(()),
        }
    }

    /// Start the background persister
    ///
    /// Each published snapshot replaces the previous one; intermediate
    /// states may be skipped. Returns `None` for in-memory registries.
    pub fn spawn_persister(&self) -> Option<JoinHandle<()>> {
        let path = self.path.clone()?;
        let mut rx = self.snapshots.subscribe();
        Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                let target = path.clone();
                let written =
                    tokio::task::spawn_blocking(move || write_atomic(&target, &snapshot)).await;
                match written {
                    Ok(Ok(())) => debug!(path = %path.display(), "Fail registry saved"),
                    Ok(Err(e)) => error!(path = %path.display(), error = %e, "Can't save fail registry"),
                    Err(e) => error!(error = %e, "Fail registry persister crashed"),
                }
            }
        }))
    }
}

/// Serialize to a temp file next to `path`, then rename over it
fn write_atomic(path: &Path, fails: &BTreeMap<String, CurrentFail>) -> Result<()> {
    let json = serde_json::to_string_pretty(fails)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp_path = parent.join(format!(".{}.tmp", FAILS_FILE));
    fs::write(&tmp_path, json).map_err(|e| {
        Error::State(format!("failed to write {}: {}", tmp_path.display(), e))
    })?;
    fs::rename(&tmp_path, path).map_err(|e| {
        Error::State(format!(
            "failed to rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn check(host: &str, index: usize) -> FailSubject {
        FailSubject::Check {
            host: host.into(),
            probe: "disk".into(),
            index,
        }
    }

    #[test]
    fn test_increment_and_recover() {
        let registry = FailRegistry::in_memory();
        let now = Utc::now();

        let (first, created) = registry.increment_fail(check("web1", 0), now);
        assert!(created);
        assert_eq!(first.fail_count, 1);

        let fp = first.subject.fingerprint();
        assert_eq!(registry.increment_ok(&fp).unwrap().ok_count, 1);

        let (second, created) = registry.increment_fail(check("web1", 0), now);
        assert!(!created);
        assert_eq!(second.fail_count, 2);
        assert_eq!(second.ok_count, 0);
        assert_eq!(second.unique_id, first.unique_id);

        assert!(registry.remove(&fp).is_some());
        assert!(registry.remove(&fp).is_none());
        assert!(registry.increment_ok(&fp).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_persist_then_reload_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FailRegistry::open(dir.path()).unwrap();
        assert!(registry.is_empty());

        let now = Utc::now();
        registry.increment_fail(check("web1", 0), now);
        registry.increment_fail(check("web1", 1), now);
        registry.increment_fail(check("web1", 1), now);
        registry.increment_fail(FailSubject::Run { host: "db1".into() }, now);
        registry.save_now().unwrap();

        let reloaded = FailRegistry::open(dir.path()).unwrap();
        assert_eq!(reloaded.snapshot(), registry.snapshot());
        assert_eq!(reloaded.for_host("web1").len(), 2);
        assert!(!dir.path().join(format!(".{}.tmp", FAILS_FILE)).exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(FAILS_FILE), "{ not json").unwrap();
        assert!(FailRegistry::open(dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_background_persister_writes_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FailRegistry::open(dir.path()).unwrap());
        let persister = registry.spawn_persister().unwrap();

        let now = Utc::now();
        let (record, _) = registry.increment_fail(check("web1", 0), now);
        registry.increment_fail(check("web1", 2), now);
        registry.remove(&record.subject.fingerprint());

        let mut on_disk = BTreeMap::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(content) = fs::read_to_string(dir.path().join(FAILS_FILE)) {
                on_disk = serde_json::from_str(&content).unwrap();
                if on_disk == registry.snapshot() {
                    break;
                }
            }
        }
        assert_eq!(on_disk, registry.snapshot());
        assert_eq!(on_disk.len(), 1);
        persister.abort();
    }
}
