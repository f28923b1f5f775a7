//! Job files in the spool directory.
//!
//! `<id>.JB` holds the critical record followed by a length-prefixed YAML
//! section with everything else. Full saves go through `<id>.JB.new` and a
//! rename so a crash never leaves a torn `.JB`. The script and per-run output
//! files live beside it as `.SC`, `.OU`, `.ER` and `.CK`.
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::record::{CriticalRecord, RecordError, RECORD_LEN};
use crate::types::attribute::AttributeMap;
use crate::types::job::{ArrayMembership, Job};
use crate::types::protocol::FileKind;

pub const JOB_SUFFIX: &str = "JB";
pub const NEW_SUFFIX: &str = "JB.new";
pub const SCRIPT_SUFFIX: &str = "SC";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: not found", .path.display())]
    NotFound { path: PathBuf },
    #[error("{}: corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error(
        "{}: holds job '{found}', not the job its name implies",
        .path.display()
    )]
    Ghost { path: PathBuf, found: String },
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("job {id}: cannot encode: {reason}")]
    Encode { id: String, reason: String },
    #[error("job {id}: full save failed after {attempts} attempts: {source}")]
    SaveFailed {
        id: String,
        attempts: u32,
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound {
                path: path.to_owned(),
            }
        } else {
            StoreError::Io {
                path: path.to_owned(),
                source,
            }
        }
    }

    fn corrupt(path: &Path, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            path: path.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Everything in a job file after the critical record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JobBody {
    #[serde(default)]
    attrs: AttributeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exec_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    array: Option<ArrayMembership>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    rejected_dests: BTreeSet<String>,
}

/// Maps a job id onto a file stem. Ids are `<seq>[<idx>].<server>`, so
/// anything outside that alphabet is replaced.
pub fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            '.' | '-' | '_' | '[' | ']' => c,
            _ => '_',
        })
        .collect()
}

#[derive(Debug)]
pub struct JobFiles {
    dir: PathBuf,
    save_retries: u32,
}

impl JobFiles {
    pub fn new(dir: impl Into<PathBuf>, save_retries: u32) -> Self {
        Self {
            dir: dir.into(),
            save_retries: save_retries.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{suffix}", file_stem(id)))
    }

    /// Rewrites the critical record in place. Fails with `NotFound` when the
    /// job has never been fully saved.
    pub fn quick_save(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path(&job.id, JOB_SUFFIX);
        let record = CriticalRecord::from(job)
            .encode()
            .map_err(|e| encode_error(job, e))?;

        let mut f = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        f.seek(SeekFrom::Start(0))
            .and_then(|_| f.write_all(&record))
            .and_then(|_| f.sync_data())
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Writes the whole job to a temporary file and renames it into place,
    /// retrying a bounded number of times. On failure the previous file is
    /// left untouched.
    pub fn full_save(&self, job: &Job) -> Result<(), StoreError> {
        let data = encode_job(job)?;
        let path = self.path(&job.id, JOB_SUFFIX);
        let tmp = self.path(&job.id, NEW_SUFFIX);

        let mut last = None;
        for attempt in 1..=self.save_retries {
            match write_and_rename(&tmp, &path, &data) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        %error,
                        "full save failed"
                    );
                    let _ = fs::remove_file(&tmp);
                    last = Some(error);
                },
            }
        }

        Err(StoreError::SaveFailed {
            id: job.id.clone(),
            attempts: self.save_retries,
            source: last
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::Other)),
        })
    }

    /// Reads a job file back. The file name must match the id inside it.
    pub fn recover(&self, path: &Path) -> Result<Job, StoreError> {
        let data = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let job = decode_job(path, &data)?;

        let stem = file_stem(&job.id);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name != format!("{stem}.{JOB_SUFFIX}")
            && name != format!("{stem}.{NEW_SUFFIX}")
        {
            return Err(StoreError::Ghost {
                path: path.to_owned(),
                found: job.id,
            });
        }

        Ok(job)
    }

    /// Recovers every job file in the spool. Failures are returned alongside
    /// the jobs; the files behind them are left for inspection.
    ///
    /// Leftover `.JB.new` files are dealt with first: a complete one is a
    /// full save that crashed just before its rename and is promoted, a torn
    /// one is removed.
    pub fn recover_all(
        &self,
    ) -> Result<(Vec<Job>, Vec<StoreError>), StoreError> {
        for path in self.list(NEW_SUFFIX)? {
            match self.recover(&path) {
                Ok(job) => {
                    let target = self.path(&job.id, JOB_SUFFIX);
                    fs::rename(&path, &target)
                        .map_err(|e| StoreError::io(&path, e))?;
                    debug!(job_id = %job.id, "promoted pending full save");
                },
                Err(error) => {
                    warn!(%error, "discarding incomplete full save");
                    fs::remove_file(&path)
                        .map_err(|e| StoreError::io(&path, e))?;
                },
            }
        }

        let mut jobs = Vec::new();
        let mut errors = Vec::new();
        for path in self.list(JOB_SUFFIX)? {
            match self.recover(&path) {
                Ok(job) => jobs.push(job),
                Err(error) => errors.push(error),
            }
        }
        jobs.sort_by_key(|j| (j.queue_time, j.id.clone()));

        Ok((jobs, errors))
    }

    fn list(&self, suffix: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dot_suffix = format!(".{suffix}");
        let mut out = Vec::new();
        let entries =
            fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(&dot_suffix))
                .unwrap_or(false);
            if matches {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Deletes every file belonging to a job.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let suffixes = [
            JOB_SUFFIX,
            NEW_SUFFIX,
            SCRIPT_SUFFIX,
            FileKind::StdOut.suffix(),
            FileKind::StdErr.suffix(),
            FileKind::Checkpoint.suffix(),
        ];
        for suffix in suffixes {
            let path = self.path(id, suffix);
            match fs::remove_file(&path) {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Stores one chunk of a script or per-run file. Chunk 0 starts the file
    /// afresh so a re-sent transfer does not append to stale data.
    pub fn write_chunk(
        &self,
        id: &str,
        suffix: &str,
        seq: u32,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.path(id, suffix);
        let mut opts = OpenOptions::new();
        opts.create(true);
        if seq == 0 {
            opts.write(true).truncate(true);
        } else {
            opts.append(true);
        }
        let mut f = opts.open(&path).map_err(|e| StoreError::io(&path, e))?;
        f.write_all(data)
            .and_then(|_| f.sync_data())
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Reads a script or per-run file; `None` when it does not exist.
    pub fn read_chunked(
        &self,
        id: &str,
        suffix: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(id, suffix);
        match File::open(&path) {
            Ok(mut f) => {
                let mut data = Vec::new();
                f.read_to_end(&mut data).map_err(|e| StoreError::io(&path, e))?;
                Ok(Some(data))
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

fn encode_error(job: &Job, e: RecordError) -> StoreError {
    StoreError::Encode {
        id: job.id.clone(),
        reason: e.to_string(),
    }
}

fn encode_job(job: &Job) -> Result<BytesMut, StoreError> {
    let mut buf = CriticalRecord::from(job)
        .encode()
        .map_err(|e| encode_error(job, e))?;

    let body = JobBody {
        attrs: job.attrs.clone(),
        exec_host: job.exec_host.clone(),
        session_id: job.session_id,
        array: job.array.clone(),
        rejected_dests: job.rejected_dests.clone(),
    };
    let yaml = serde_yaml::to_string(&body).map_err(|e| StoreError::Encode {
        id: job.id.clone(),
        reason: e.to_string(),
    })?;

    buf.put_u32(yaml.len() as u32);
    buf.put_slice(yaml.as_bytes());
    Ok(buf)
}

fn decode_job(path: &Path, data: &[u8]) -> Result<Job, StoreError> {
    let record = CriticalRecord::decode(data)
        .map_err(|e| StoreError::corrupt(path, e))?;

    let rest = &data[RECORD_LEN..];
    if rest.len() < 4 {
        return Err(StoreError::corrupt(path, "missing attribute section"));
    }
    let (len, rest) = rest.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() != len {
        return Err(StoreError::corrupt(
            path,
            format!(
                "attribute section is {} bytes, expected {len}",
                rest.len()
            ),
        ));
    }
    let body: JobBody =
        serde_yaml::from_slice(rest).map_err(|e| StoreError::corrupt(path, e))?;

    let mut job = Job::new(record.id.clone());
    record.apply_to(&mut job);
    job.attrs = body.attrs;
    job.exec_host = body.exec_host;
    job.session_id = body.session_id;
    job.array = body.array;
    job.rejected_dests = body.rejected_dests;
    job.modified = false;
    Ok(job)
}

fn write_and_rename(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    drop(f);
    fs::rename(tmp, path)
}
