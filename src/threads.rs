use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Open,
    Updated,
    Fixed,
}

impl ThreadStatus {
    /// Open and updated threads still track an unresolved issue.
    pub fn is_active(self) -> bool {
        matches!(self, ThreadStatus::Open | ThreadStatus::Updated)
    }
}

/// An earlier occurrence of the same fingerprint that was fixed before the
/// issue came back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastOccurrence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
    pub first_seen_iteration: u32,
    pub last_seen_iteration: u32,
    pub fixed_in_iteration: u32,
}

/// Host work still owed for a fixed record whose confirmation did not go
/// through. Later passes finish it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSync {
    #[default]
    Synced,
    /// Neither the fixed comment nor the resolve reached the host.
    ConfirmPending,
    /// The fixed comment was posted; the thread is not resolved yet.
    ResolvePending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
    pub status: ThreadStatus,
    pub first_seen_iteration: u32,
    pub last_seen_iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_in_iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub description: String,
    /// Sequence of the reconciliation pass that last wrote this record.
    pub last_pass: u64,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub host_sync: HostSync,
    #[serde(default)]
    pub history: Vec<PastOccurrence>,
}

impl ThreadRecord {
    /// A fixed record whose host thread still needs a confirmation or a resolve.
    pub fn needs_host_resolution(&self) -> bool {
        self.status == ThreadStatus::Fixed
            && self.external_thread_id.is_some()
            && self.host_sync != HostSync::Synced
    }
}

/// Threads are keyed by fingerprint within one PR file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadScope {
    pub pr_id: u64,
    pub file_path: String,
}

impl ThreadScope {
    pub fn new(pr_id: u64, file_path: impl Into<String>) -> Self {
        Self {
            pr_id,
            file_path: file_path.into(),
        }
    }
}

/// Key-value persistence of thread records.
///
/// `put` is a compare-and-swap: it succeeds only when the stored revision
/// equals `expected_revision` (`None` meaning "must not exist yet") and
/// fails with `Error::ReconciliationConflict` otherwise. The written record
/// is returned with its new revision.
pub trait ThreadStore: Send + Sync {
    fn get(&self, scope: &ThreadScope, fingerprint: &str) -> Result<Option<ThreadRecord>>;

    fn list(&self, scope: &ThreadScope) -> Result<Vec<ThreadRecord>>;

    fn put(
        &self,
        scope: &ThreadScope,
        record: ThreadRecord,
        expected_revision: Option<u64>,
    ) -> Result<ThreadRecord>;

    /// Removes a record outright, including its history. Reconciliation
    /// never deletes: fixed records stay for audit. Exposed for callers that
    /// administer the store, such as dropping the threads of a closed PR.
    fn delete(&self, scope: &ThreadScope, fingerprint: &str) -> Result<()>;

    /// Returns the next pass sequence for `scope`, starting at 1.
    fn begin_pass(&self, scope: &ThreadScope) -> Result<u64>;
}

/// Lets callers keep a handle on a store they hand to the engine.
impl<T: ThreadStore + ?Sized> ThreadStore for Arc<T> {
    fn get(&self, scope: &ThreadScope, fingerprint: &str) -> Result<Option<ThreadRecord>> {
        (**self).get(scope, fingerprint)
    }

    fn list(&self, scope: &ThreadScope) -> Result<Vec<ThreadRecord>> {
        (**self).list(scope)
    }

    fn put(
        &self,
        scope: &ThreadScope,
        record: ThreadRecord,
        expected_revision: Option<u64>,
    ) -> Result<ThreadRecord> {
        (**self).put(scope, record, expected_revision)
    }

    fn delete(&self, scope: &ThreadScope, fingerprint: &str) -> Result<()> {
        (**self).delete(scope, fingerprint)
    }

    fn begin_pass(&self, scope: &ThreadScope) -> Result<u64> {
        (**self).begin_pass(scope)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ScopeData {
    #[serde(default)]
    passes: u64,
    #[serde(default)]
    threads: BTreeMap<String, ThreadRecord>,
}

impl ScopeData {
    fn put(&mut self, mut record: ThreadRecord, expected_revision: Option<u64>) -> Result<ThreadRecord> {
        let current = self.threads.get(&record.fingerprint).map(|r| r.revision);
        if current != expected_revision {
            return Err(Error::ReconciliationConflict {
                fingerprint: record.fingerprint,
            });
        }
        record.revision = current.map_or(1, |r| r + 1);
        self.threads.insert(record.fingerprint.clone(), record.clone());
        Ok(record)
    }

    fn begin_pass(&mut self) -> u64 {
        self.passes += 1;
        self.passes
    }
}

/// Process-local store, mainly for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    scopes: Mutex<HashMap<ThreadScope, ScopeData>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_scope<T>(&self, scope: &ThreadScope, f: impl FnOnce(&mut ScopeData) -> T) -> Result<T> {
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|_| Error::ThreadStore("thread store lock poisoned".to_string()))?;
        Ok(f(scopes.entry(scope.clone()).or_default()))
    }
}

impl ThreadStore for InMemoryThreadStore {
    fn get(&self, scope: &ThreadScope, fingerprint: &str) -> Result<Option<ThreadRecord>> {
        self.with_scope(scope, |data| data.threads.get(fingerprint).cloned())
    }

    fn list(&self, scope: &ThreadScope) -> Result<Vec<ThreadRecord>> {
        self.with_scope(scope, |data| data.threads.values().cloned().collect())
    }

    fn put(
        &self,
        scope: &ThreadScope,
        record: ThreadRecord,
        expected_revision: Option<u64>,
    ) -> Result<ThreadRecord> {
        self.with_scope(scope, |data| data.put(record, expected_revision))?
    }

    fn delete(&self, scope: &ThreadScope, fingerprint: &str) -> Result<()> {
        self.with_scope(scope, |data| {
            data.threads.remove(fingerprint);
        })
    }

    fn begin_pass(&self, scope: &ThreadScope) -> Result<u64> {
        self.with_scope(scope, ScopeData::begin_pass)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrThreadsFile {
    #[serde(default)]
    files: BTreeMap<String, ScopeData>,
}

/// Thread records persisted as TOML, one file per PR, in `state_dir`.
///
/// Every operation is a load-modify-save under one process-wide lock.
/// A corrupt file is an error: dropping it would lose external thread ids
/// and lead to duplicate threads.
pub struct FileThreadStore {
    state_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileThreadStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn pr_file(&self, pr_id: u64) -> PathBuf {
        self.state_dir.join(format!("pr-{pr_id}.toml"))
    }

    fn load(&self, pr_id: u64) -> Result<PrThreadsFile> {
        let path = self.pr_file(pr_id);
        if !path.exists() {
            return Ok(PrThreadsFile::default());
        }
        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| {
            Error::ThreadStore(format!("corrupted thread file {}: {e}", path.display()))
        })
    }

    fn save(&self, pr_id: u64, data: &PrThreadsFile) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        let content = toml::to_string_pretty(data)
            .map_err(|e| Error::ThreadStore(format!("failed to serialize threads: {e}")))?;
        let path = self.pr_file(pr_id);
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "thread store saved");
        Ok(())
    }

    fn update<T>(
        &self,
        scope: &ThreadScope,
        write: bool,
        f: impl FnOnce(&mut ScopeData) -> Result<T>,
    ) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::ThreadStore("thread store lock poisoned".to_string()))?;
        let mut data = self.load(scope.pr_id)?;
        let value = f(data.files.entry(scope.file_path.clone()).or_default())?;
        if write {
            self.save(scope.pr_id, &data)?;
        }
        Ok(value)
    }
}

impl ThreadStore for FileThreadStore {
    fn get(&self, scope: &ThreadScope, fingerprint: &str) -> Result<Option<ThreadRecord>> {
        self.update(scope, false, |data| Ok(data.threads.get(fingerprint).cloned()))
    }

    fn list(&self, scope: &ThreadScope) -> Result<Vec<ThreadRecord>> {
        self.update(scope, false, |data| Ok(data.threads.values().cloned().collect()))
    }

    fn put(
        &self,
        scope: &ThreadScope,
        record: ThreadRecord,
        expected_revision: Option<u64>,
    ) -> Result<ThreadRecord> {
        self.update(scope, true, |data| data.put(record, expected_revision))
    }

    fn delete(&self, scope: &ThreadScope, fingerprint: &str) -> Result<()> {
        self.update(scope, true, |data| {
            data.threads.remove(fingerprint);
            Ok(())
        })
    }

    fn begin_pass(&self, scope: &ThreadScope) -> Result<u64> {
        self.update(scope, true, |data| Ok(data.begin_pass()))
    }
}
