//! In-memory job table backed by the spool directory.
pub mod array;
pub mod files;
pub mod record;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use self::array::ArrayRecord;
pub use self::files::StoreError;
use self::files::{JobFiles, SCRIPT_SUFFIX};
use crate::types::job::Job;
use crate::types::protocol::FileKind;

/// Shared handle to one job. The mutex is the job's lock.
pub type JobRef = Arc<Mutex<Job>>;

/// Locks a job, recovering from a poisoned lock.
pub fn lock(job: &JobRef) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaveMode {
    /// Rewrite the critical record in place.
    Quick,
    /// Atomically rewrite the whole job.
    Full,
}

/// Save counters, mostly of interest to tests.
#[derive(Debug, Default)]
pub struct SaveStats {
    quick: AtomicU64,
    full: AtomicU64,
}

impl SaveStats {
    pub fn quick(&self) -> u64 {
        self.quick.load(Ordering::Relaxed)
    }

    pub fn full(&self) -> u64 {
        self.full.load(Ordering::Relaxed)
    }
}

/// Server-wide state kept in the spool next to the job files.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerState {
    next_seq: u64,
}

const SERVER_STATE_FILE: &str = "server.yaml";

#[derive(Default)]
struct Table {
    jobs: HashMap<String, JobRef>,
    /// Insertion order, for listings.
    order: Vec<String>,
}

#[derive(Default)]
struct Arrays {
    records: HashMap<String, ArrayRecord>,
    /// Children in the table, by parent id.
    children: HashMap<String, BTreeSet<String>>,
}

pub struct JobStore {
    table: RwLock<Table>,
    files: JobFiles,
    arrays: Mutex<Arrays>,
    next_seq: Mutex<u64>,
    stats: SaveStats,
}

impl JobStore {
    /// Opens (creating if needed) a spool directory.
    pub fn open(
        dir: impl Into<PathBuf>,
        save_retries: u32,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let state_path = dir.join(SERVER_STATE_FILE);
        let state: ServerState = match fs::read_to_string(&state_path) {
            Ok(text) => {
                serde_yaml::from_str(&text).map_err(|e| StoreError::Corrupt {
                    path: state_path.clone(),
                    reason: e.to_string(),
                })?
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ServerState::default()
            },
            Err(source) => {
                return Err(StoreError::Io {
                    path: state_path,
                    source,
                })
            },
        };

        Ok(Self {
            table: RwLock::new(Table::default()),
            files: JobFiles::new(dir, save_retries),
            arrays: Mutex::new(Arrays::default()),
            next_seq: Mutex::new(state.next_seq),
            stats: SaveStats::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        self.files.dir()
    }

    pub fn files(&self) -> &JobFiles {
        &self.files
    }

    pub fn stats(&self) -> &SaveStats {
        &self.stats
    }

    /// Allocates the next job id, persisting the counter first so an id is
    /// never handed out twice across restarts.
    pub fn next_job_id(&self, server_name: &str) -> Result<String, StoreError> {
        let mut seq =
            self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let this = *seq;
        let state = ServerState { next_seq: this + 1 };
        let path = self.dir().join(SERVER_STATE_FILE);
        let tmp = self.dir().join(format!("{SERVER_STATE_FILE}.new"));
        let text =
            serde_yaml::to_string(&state).map_err(|e| StoreError::Encode {
                id: SERVER_STATE_FILE.into(),
                reason: e.to_string(),
            })?;
        fs::write(&tmp, text)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| StoreError::Io { path, source })?;
        *seq = this + 1;
        Ok(format!("{this}.{server_name}"))
    }

    fn lock_arrays(&self) -> MutexGuard<'_, Arrays> {
        self.arrays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<JobRef> {
        self.read_table().jobs.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_table().jobs.contains_key(id)
    }

    /// Adds a job; `None` if one with the same id is already present.
    pub fn insert(&self, job: Job) -> Option<JobRef> {
        let mut table = self.write_table();
        if table.jobs.contains_key(&job.id) {
            return None;
        }
        let id = job.id.clone();
        if let Some(a) = &job.array {
            self.lock_arrays()
                .children
                .entry(a.parent_id.clone())
                .or_default()
                .insert(id.clone());
        }
        let job = Arc::new(Mutex::new(job));
        table.jobs.insert(id.clone(), Arc::clone(&job));
        table.order.push(id);
        Some(job)
    }

    /// Drops a job from the table without touching its files.
    pub fn remove(&self, id: &str) -> Option<JobRef> {
        let mut table = self.write_table();
        let job = table.jobs.remove(id)?;
        table.order.retain(|j| j != id);
        Some(job)
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> Vec<String> {
        self.read_table().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read_table().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists `job`. A quick save of a job never fully saved becomes a full
    /// save. A full save clears the dirty flag.
    pub fn save(
        &self,
        job: &mut Job,
        mode: SaveMode,
    ) -> Result<(), StoreError> {
        let mode = if mode == SaveMode::Quick && job.modified {
            SaveMode::Full
        } else {
            mode
        };

        if mode == SaveMode::Quick {
            match self.files.quick_save(job) {
                Ok(()) => {
                    self.stats.quick.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                },
                Err(StoreError::NotFound { .. }) => {
                    debug!(
                        job_id = %job.id,
                        "no job file yet, doing a full save"
                    );
                },
                Err(e) => return Err(e),
            }
        }

        self.files.full_save(job)?;
        self.stats.full.fetch_add(1, Ordering::Relaxed);
        job.modified = false;
        Ok(())
    }

    /// Saves and logs failures. The in-memory job stays authoritative.
    pub fn save_or_log(&self, job: &mut Job, mode: SaveMode) -> bool {
        match self.save(job, mode) {
            Ok(()) => true,
            Err(error) => {
                error!(job_id = %job.id, ?mode, %error, "failed to save job");
                false
            },
        }
    }

    /// Removes a job from the table and deletes its files. Callers cancel
    /// the job's tasks and unlink it from its queue first.
    ///
    /// When the job was the last remaining child of an array, the array
    /// descriptor goes too.
    pub fn purge(&self, id: &str) {
        self.remove(id);

        if let Err(error) = self.files.remove(id) {
            warn!(job_id = %id, %error, "failed to remove job files");
        }

        let finished = {
            let mut arrays = self.lock_arrays();
            let parent = arrays
                .children
                .iter_mut()
                .find_map(|(p, c)| {
                    c.remove(id).then(|| (p.clone(), c.is_empty()))
                });
            match parent {
                Some((parent, true)) => {
                    arrays.children.remove(&parent);
                    arrays.records.remove(&parent)
                },
                _ => None,
            }
        };

        if let Some(rec) = finished {
            if let Err(error) = rec.remove(self.dir()) {
                warn!(
                    array_id = %rec.parent_id,
                    %error,
                    "failed to remove array file"
                );
            }
            debug!(array_id = %rec.parent_id, "array finished");
        }
    }

    pub fn write_script(
        &self,
        id: &str,
        seq: u32,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.files.write_chunk(id, SCRIPT_SUFFIX, seq, data)
    }

    pub fn read_script(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.files.read_chunked(id, SCRIPT_SUFFIX)
    }

    pub fn write_run_file(
        &self,
        id: &str,
        kind: FileKind,
        seq: u32,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.files.write_chunk(id, kind.suffix(), seq, data)
    }

    pub fn read_run_file(
        &self,
        id: &str,
        kind: FileKind,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.files.read_chunked(id, kind.suffix())
    }

    /// Copies a job's script under another id (array children share the
    /// parent's script).
    pub fn copy_script(&self, from: &str, to: &str) -> Result<(), StoreError> {
        match self.read_script(from)? {
            Some(data) => self.write_script(to, 0, &data),
            None => Ok(()),
        }
    }

    /// Reads every job and array file in the spool.
    pub fn recover(&self) -> Result<Vec<Job>, StoreError> {
        let (jobs, errors) = self.files.recover_all()?;
        for error in errors {
            error!(%error, "discarding unrecoverable job file");
        }

        let (arrays, errors) = ArrayRecord::load_all(self.dir())?;
        for error in errors {
            error!(%error, "discarding unrecoverable array file");
        }
        let mut table = self.lock_arrays();
        for rec in arrays {
            table.records.insert(rec.parent_id.clone(), rec);
        }

        Ok(jobs)
    }

    pub fn save_array(&self, rec: ArrayRecord) -> Result<(), StoreError> {
        rec.save(self.dir())?;
        self.lock_arrays().records.insert(rec.parent_id.clone(), rec);
        Ok(())
    }

    pub fn array(&self, parent_id: &str) -> Option<ArrayRecord> {
        self.lock_arrays().records.get(parent_id).cloned()
    }

    /// Whether `parent_id`'s array is being deleted as a whole.
    pub fn array_deleting(&self, parent_id: &str) -> bool {
        self.array(parent_id).map(|a| a.deleting).unwrap_or(false)
    }

    /// Ids of the array's children still in the table.
    pub fn array_children(&self, parent_id: &str) -> Vec<String> {
        self.lock_arrays()
            .children
            .get(parent_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Array parents known to the store.
    pub fn array_ids(&self) -> Vec<String> {
        self.lock_arrays().records.keys().cloned().collect()
    }

    /// Forgets an array and deletes its descriptor.
    pub fn remove_array(&self, parent_id: &str) {
        let rec = {
            let mut arrays = self.lock_arrays();
            arrays.children.remove(parent_id);
            arrays.records.remove(parent_id)
        };
        if let Some(rec) = rec {
            if let Err(error) = rec.remove(self.dir()) {
                warn!(
                    array_id = %parent_id,
                    %error,
                    "failed to remove array file"
                );
            }
        }
    }
}
