//! The fixed-size critical part of a job file.
//!
//! Layout (big-endian):
//!
//! | field       | bytes |
//! |-------------|-------|
//! | magic       | 4     |
//! | version     | 2     |
//! | id length   | 2     |
//! | id          | 86    |
//! | state       | 1     |
//! | substate    | 1     |
//! | svrflags    | 4     |
//! | queue len   | 1     |
//! | queue       | 32    |
//! | destin len  | 2     |
//! | destin      | 128   |
//! | queue_time  | 8     |
//! | state_time  | 8     |
//! | reserved    | 1     |
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::types::job::{Job, SvrFlags, MAX_JOB_ID_LEN};
use crate::types::states::{JobState, JobSubstate, Phase};

const MAGIC: u32 = 0x424a_4f42;
const VERSION: u16 = 1;

pub const MAX_QUEUE_LEN: usize = 32;
pub const MAX_DESTIN_LEN: usize = 128;

/// Size of the encoded record.
pub const RECORD_LEN: usize = 4
    + 2
    + 2
    + MAX_JOB_ID_LEN
    + 1
    + 1
    + 4
    + 1
    + MAX_QUEUE_LEN
    + 2
    + MAX_DESTIN_LEN
    + 8
    + 8
    + 1;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RecordError {
    #[error("short record: {0} bytes")]
    Short(usize),
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported record version {0}")]
    Version(u16),
    #[error("{0} too long")]
    TooLong(&'static str),
    #[error("{0} is not valid UTF-8")]
    BadText(&'static str),
    #[error("bad state {0}/{1}")]
    BadState(u8, u8),
}

/// The part of a job rewritten in place on every state transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CriticalRecord {
    pub id: String,
    pub state: JobState,
    pub substate: JobSubstate,
    pub svrflags: SvrFlags,
    pub queue: String,
    pub destin: Option<String>,
    pub queue_time: i64,
    pub state_time: i64,
}

impl From<&Job> for CriticalRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            substate: job.substate,
            svrflags: job.svrflags,
            queue: job.queue.clone(),
            destin: job.destin.clone(),
            queue_time: job.queue_time,
            state_time: job.state_time,
        }
    }
}

fn put_padded(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
    width: usize,
) -> Result<(), RecordError> {
    if value.len() > width {
        return Err(RecordError::TooLong(field));
    }
    buf.put_slice(value.as_bytes());
    buf.put_bytes(0, width - value.len());
    Ok(())
}

fn take_padded(
    buf: &mut &[u8],
    field: &'static str,
    len: usize,
    width: usize,
) -> Result<String, RecordError> {
    if len > width {
        return Err(RecordError::TooLong(field));
    }
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| RecordError::BadText(field))?
        .to_owned();
    buf.advance(width);
    Ok(text)
}

impl CriticalRecord {
    pub fn encode(&self) -> Result<BytesMut, RecordError> {
        let mut buf = BytesMut::with_capacity(RECORD_LEN);
        let destin = self.destin.as_deref().unwrap_or("");

        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(self.id.len().min(u16::MAX as usize) as u16);
        put_padded(&mut buf, "job id", &self.id, MAX_JOB_ID_LEN)?;
        buf.put_u8(self.state.code());
        buf.put_u8(self.substate.code());
        buf.put_u32(self.svrflags.bits());
        buf.put_u8(self.queue.len().min(u8::MAX as usize) as u8);
        put_padded(&mut buf, "queue", &self.queue, MAX_QUEUE_LEN)?;
        buf.put_u16(destin.len().min(u16::MAX as usize) as u16);
        put_padded(&mut buf, "destination", destin, MAX_DESTIN_LEN)?;
        buf.put_i64(self.queue_time);
        buf.put_i64(self.state_time);
        buf.put_u8(0);

        debug_assert_eq!(buf.len(), RECORD_LEN);
        Ok(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < RECORD_LEN {
            return Err(RecordError::Short(buf.len()));
        }

        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(RecordError::BadMagic(magic));
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(RecordError::Version(version));
        }

        let id_len = buf.get_u16() as usize;
        let id = take_padded(&mut buf, "job id", id_len, MAX_JOB_ID_LEN)?;

        let (s, ss) = (buf.get_u8(), buf.get_u8());
        let phase = match (JobState::from_code(s), JobSubstate::from_code(ss)) {
            (Some(state), Some(substate)) => Phase::new(state, substate),
            _ => return Err(RecordError::BadState(s, ss)),
        };
        if !phase.is_legal() {
            return Err(RecordError::BadState(s, ss));
        }

        let svrflags = SvrFlags::from_bits_truncate(buf.get_u32());
        let queue_len = buf.get_u8() as usize;
        let queue = take_padded(&mut buf, "queue", queue_len, MAX_QUEUE_LEN)?;
        let destin_len = buf.get_u16() as usize;
        let destin =
            take_padded(&mut buf, "destination", destin_len, MAX_DESTIN_LEN)?;

        Ok(Self {
            id,
            state: phase.state,
            substate: phase.substate,
            svrflags,
            queue,
            destin: (!destin.is_empty()).then_some(destin),
            queue_time: buf.get_i64(),
            state_time: buf.get_i64(),
        })
    }

    /// Copies the record's fields onto `job`.
    pub fn apply_to(self, job: &mut Job) {
        job.id = self.id;
        job.state = self.state;
        job.substate = self.substate;
        job.svrflags = self.svrflags;
        job.queue = self.queue;
        job.destin = self.destin;
        job.queue_time = self.queue_time;
        job.state_time = self.state_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CriticalRecord {
        CriticalRecord {
            id: "7.head".into(),
            state: JobState::Transit,
            substate: JobSubstate::TransOutCommit,
            svrflags: SvrFlags::HAS_RUN | SvrFlags::STAGED_IN,
            queue: "route".into(),
            destin: Some("batch@other:15001".into()),
            queue_time: 1_700_000_000,
            state_time: 1_700_000_100,
        }
    }

    #[test]
    fn fixed_size_and_decodable() {
        let r = record();
        let buf = r.encode().unwrap();
        assert_eq!(buf.len(), RECORD_LEN);
        assert_eq!(CriticalRecord::decode(&buf).unwrap(), r);

        let mut plain = record();
        plain.destin = None;
        plain.id = "x".repeat(MAX_JOB_ID_LEN);
        let buf = plain.encode().unwrap();
        assert_eq!(buf.len(), RECORD_LEN);
        assert_eq!(CriticalRecord::decode(&buf).unwrap(), plain);
    }

    #[test]
    fn rejects_bad_input() {
        let mut r = record();
        r.queue = "q".repeat(MAX_QUEUE_LEN + 1);
        assert_eq!(r.encode(), Err(RecordError::TooLong("queue")));

        let buf = record().encode().unwrap();
        assert_eq!(
            CriticalRecord::decode(&buf[..RECORD_LEN - 1]),
            Err(RecordError::Short(RECORD_LEN - 1))
        );

        let mut bad = buf.to_vec();
        bad[0] = 0;
        assert!(matches!(
            CriticalRecord::decode(&bad),
            Err(RecordError::BadMagic(_))
        ));

        // Queued state with a running substate.
        let mut bad = buf.to_vec();
        bad[4 + 2 + 2 + MAX_JOB_ID_LEN] = JobState::Queued.code();
        bad[4 + 2 + 2 + MAX_JOB_ID_LEN + 1] = JobSubstate::Running.code();
        assert!(matches!(
            CriticalRecord::decode(&bad),
            Err(RecordError::BadState(_, _))
        ));
    }
}
