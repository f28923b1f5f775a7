//! Job arrays: a fixed-size descriptor file per array, named from the
//! parent's sequence number.
use std::fs;
use std::io;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use super::files::{file_stem, StoreError};
use crate::types::job::{split_job_id, MAX_JOB_ID_LEN};

pub const ARRAY_SUFFIX: &str = "AR";

const MAGIC: u32 = 0x424a_4152;
pub const ARRAY_RECORD_LEN: usize = 4 + 2 + MAX_JOB_ID_LEN + 4 + 4 + 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArrayRecord {
    /// `<seq>[].<server>`
    pub parent_id: String,
    pub size: u32,
    /// Children created so far.
    pub cloned: u32,
    /// A delete of the whole array is in progress.
    pub deleting: bool,
}

impl ArrayRecord {
    pub fn new(parent_id: impl Into<String>, size: u32) -> Self {
        Self {
            parent_id: parent_id.into(),
            size,
            cloned: 0,
            deleting: false,
        }
    }

    /// Id of child `index`.
    pub fn child_id(&self, index: u32) -> String {
        let (seq, server) = split_job_id(&self.parent_id);
        let seq = seq.trim_end_matches("[]");
        format!("{seq}[{index}].{server}")
    }

    /// File name prefix shared by the descriptor: the parent's sequence.
    pub fn prefix(&self) -> String {
        let (seq, _) = split_job_id(&self.parent_id);
        file_stem(seq.trim_end_matches("[]"))
    }

    fn encode(&self) -> Result<BytesMut, StoreError> {
        if self.parent_id.len() > MAX_JOB_ID_LEN {
            return Err(StoreError::Encode {
                id: self.parent_id.clone(),
                reason: "array id too long".into(),
            });
        }
        let mut buf = BytesMut::with_capacity(ARRAY_RECORD_LEN);
        buf.put_u32(MAGIC);
        buf.put_u16(self.parent_id.len() as u16);
        buf.put_slice(self.parent_id.as_bytes());
        buf.put_bytes(0, MAX_JOB_ID_LEN - self.parent_id.len());
        buf.put_u32(self.size);
        buf.put_u32(self.cloned);
        buf.put_u8(self.deleting as u8);
        Ok(buf)
    }

    fn decode(path: &Path, mut data: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            path: path.to_owned(),
            reason: reason.to_owned(),
        };
        if data.len() != ARRAY_RECORD_LEN {
            return Err(corrupt("wrong size"));
        }
        if data.get_u32() != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let len = data.get_u16() as usize;
        if len > MAX_JOB_ID_LEN {
            return Err(corrupt("id too long"));
        }
        let parent_id = std::str::from_utf8(&data[..len])
            .map_err(|_| corrupt("id is not UTF-8"))?
            .to_owned();
        data.advance(MAX_JOB_ID_LEN);

        Ok(Self {
            parent_id,
            size: data.get_u32(),
            cloned: data.get_u32(),
            deleting: data.get_u8() != 0,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(format!("{}.{ARRAY_SUFFIX}", self.prefix()));
        let tmp = path.with_extension("AR.new");
        let data = self.encode()?;
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&tmp, &data).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    pub fn remove(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(format!("{}.{ARRAY_SUFFIX}", self.prefix()));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Loads every descriptor in `dir`.
    pub fn load_all(
        dir: &Path,
    ) -> Result<(Vec<Self>, Vec<StoreError>), StoreError> {
        let io_err = |source| StoreError::Io {
            path: dir.to_owned(),
            source,
        };
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARRAY_SUFFIX) {
                continue;
            }
            match fs::read(&path) {
                Ok(data) => match Self::decode(&path, &data) {
                    Ok(r) => records.push(r),
                    Err(e) => errors.push(e),
                },
                Err(source) => errors.push(StoreError::Io { path, source }),
            }
        }
        Ok((records, errors))
    }
}

/// Parent id for the array created from job `id`.
pub fn parent_id_for(id: &str) -> String {
    let (seq, server) = split_job_id(id);
    format!("{seq}[].{server}")
}

/// Whether `id` names an array parent.
pub fn is_parent_id(id: &str) -> bool {
    split_job_id(id).0.ends_with("[]")
}
