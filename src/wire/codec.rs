//! Framing and encoding of batch requests and replies.
//!
//! Every frame is `<protocol type> <protocol version> <body length> <body>`,
//! all integers big-endian `u32`. A request body is `<discriminant> <user>
//! <fields>`; a reply body is `<code> <aux> <choice> <fields>`.
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::channel::{ChannelError, WireChannel, WouldBlock};
use super::primitives::*;
use crate::types::protocol::{
    BatchReply, BatchRequest, ErrorCode, FileKind, ReplyBody, RequestBody,
    StatusEntry, PROTOCOL_TYPE, PROTOCOL_VERSION,
};

const HEADER_LEN: usize = 12;

/// Frames above this size are refused and the connection dropped.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum CodecError {
    #[error("protocol mismatch: type {ptype}, version {version}")]
    ProtocolMismatch { ptype: u32, version: u32 },
    #[error("truncated message")]
    Truncated,
    #[error("unknown request discriminant {0}")]
    UnknownRequest(i32),
    #[error("unknown reply choice {0}")]
    UnknownReplyChoice(i32),
    #[error("malformed string")]
    BadString,
    #[error("invalid field value")]
    BadValue,
    #[error("{0} trailing bytes after message")]
    TrailingData(usize),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

impl CodecError {
    /// The batch error code a request failing with this error is answered
    /// with.
    pub fn reply_code(&self) -> ErrorCode {
        match self {
            CodecError::UnknownRequest(_) => ErrorCode::UnknownRequest,
            _ => ErrorCode::Protocol,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl WireError {
    /// Whether the connection must be dropped. A decode error only costs the
    /// one frame it occurred in.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            WireError::Channel(_) => true,
            WireError::Codec(CodecError::FrameTooLarge(_)) => true,
            WireError::Codec(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WireError::Channel(ChannelError::Timeout))
    }
}

fn begin_frame(buf: &mut BytesMut) -> usize {
    put_u32(buf, PROTOCOL_TYPE);
    put_u32(buf, PROTOCOL_VERSION);
    let at = buf.len();
    put_u32(buf, 0);
    at
}

fn end_frame(buf: &mut BytesMut, len_at: usize) {
    let body_len = (buf.len() - len_at - 4) as u32;
    buf[len_at..len_at + 4].copy_from_slice(&body_len.to_be_bytes());
}

pub fn encode_request(req: &BatchRequest, buf: &mut BytesMut) {
    use RequestBody::*;

    let at = begin_frame(buf);
    put_i32(buf, req.body.code());
    put_string(buf, &req.user);

    match &req.body {
        QueueJob {
            job_id,
            destination,
            attrs,
        } => {
            put_string(buf, job_id);
            put_string(buf, destination);
            put_attrs(buf, attrs);
        },
        JobCred { cred_type, data } => {
            put_u32(buf, *cred_type);
            put_bytes(buf, data);
        },
        JobScript { job_id, seq, data } => {
            put_string(buf, job_id);
            put_u32(buf, *seq);
            put_bytes(buf, data);
        },
        ReadyToCommit { job_id }
        | Commit { job_id }
        | DeleteJob { job_id }
        | LocateJob { job_id }
        | Rerun { job_id } => put_string(buf, job_id),
        HoldJob { job_id, hold } | ReleaseJob { job_id, hold } => {
            put_string(buf, job_id);
            put_string(buf, hold);
        },
        ModifyJob { job_id, attrs } => {
            put_string(buf, job_id);
            put_attrs(buf, attrs);
        },
        MoveJob {
            job_id,
            destination,
        }
        | RunJob {
            job_id,
            destination,
        }
        | AsyncRunJob {
            job_id,
            destination,
        } => {
            put_string(buf, job_id);
            put_string(buf, destination);
        },
        Shutdown { manner } => put_u32(buf, *manner),
        SignalJob { job_id, signal } => {
            put_string(buf, job_id);
            put_string(buf, signal);
        },
        StatusJob { id, attrs } => {
            put_string(buf, id);
            put_attrs(buf, attrs);
        },
        StatusQueue { name } | StatusNode { name } => put_string(buf, name),
        StatusServer | Disconnect => {},
        OrderJob { job_a, job_b } => {
            put_string(buf, job_a);
            put_string(buf, job_b);
        },
        CopyFiles { job_id, files } | DelFiles { job_id, files } => {
            put_string(buf, job_id);
            put_strings(buf, files);
        },
        JobObit {
            job_id,
            exit_status,
            attrs,
        } => {
            put_string(buf, job_id);
            put_i32(buf, *exit_status);
            put_attrs(buf, attrs);
        },
        JobFile {
            job_id,
            kind,
            seq,
            data,
        } => {
            put_string(buf, job_id);
            put_u32(buf, kind.code());
            put_u32(buf, *seq);
            put_bytes(buf, data);
        },
    }

    end_frame(buf, at);
}

pub fn decode_request(body: Bytes) -> Result<BatchRequest, CodecError> {
    let mut d = Decoder::new(body);
    let code = d.expect_i32()?;
    let user = d.expect_string()?;

    let body = match code {
        1 => RequestBody::QueueJob {
            job_id: d.expect_string()?,
            destination: d.expect_string()?,
            attrs: d.expect_attrs()?,
        },
        2 => RequestBody::JobCred {
            cred_type: d.expect_u32()?,
            data: d.expect_bytes()?.to_vec(),
        },
        3 => RequestBody::JobScript {
            job_id: d.expect_string()?,
            seq: d.expect_u32()?,
            data: d.expect_bytes()?.to_vec(),
        },
        4 => RequestBody::ReadyToCommit {
            job_id: d.expect_string()?,
        },
        5 => RequestBody::Commit {
            job_id: d.expect_string()?,
        },
        6 => RequestBody::DeleteJob {
            job_id: d.expect_string()?,
        },
        7 => RequestBody::HoldJob {
            job_id: d.expect_string()?,
            hold: d.expect_string()?,
        },
        8 => RequestBody::LocateJob {
            job_id: d.expect_string()?,
        },
        11 => RequestBody::ModifyJob {
            job_id: d.expect_string()?,
            attrs: d.expect_attrs()?,
        },
        12 => RequestBody::MoveJob {
            job_id: d.expect_string()?,
            destination: d.expect_string()?,
        },
        13 => RequestBody::ReleaseJob {
            job_id: d.expect_string()?,
            hold: d.expect_string()?,
        },
        14 => RequestBody::Rerun {
            job_id: d.expect_string()?,
        },
        15 => RequestBody::RunJob {
            job_id: d.expect_string()?,
            destination: d.expect_string()?,
        },
        17 => RequestBody::Shutdown {
            manner: d.expect_u32()?,
        },
        18 => RequestBody::SignalJob {
            job_id: d.expect_string()?,
            signal: d.expect_string()?,
        },
        19 => RequestBody::StatusJob {
            id: d.expect_string()?,
            attrs: d.expect_attrs()?,
        },
        20 => RequestBody::StatusQueue {
            name: d.expect_string()?,
        },
        21 => RequestBody::StatusServer,
        23 => RequestBody::AsyncRunJob {
            job_id: d.expect_string()?,
            destination: d.expect_string()?,
        },
        50 => RequestBody::OrderJob {
            job_a: d.expect_string()?,
            job_b: d.expect_string()?,
        },
        54 => RequestBody::CopyFiles {
            job_id: d.expect_string()?,
            files: d.expect_strings()?,
        },
        55 => RequestBody::DelFiles {
            job_id: d.expect_string()?,
            files: d.expect_strings()?,
        },
        56 => RequestBody::JobObit {
            job_id: d.expect_string()?,
            exit_status: d.expect_i32()?,
            attrs: d.expect_attrs()?,
        },
        57 => RequestBody::JobFile {
            job_id: d.expect_string()?,
            kind: FileKind::from_code(d.expect_u32()?)
                .ok_or(CodecError::BadValue)?,
            seq: d.expect_u32()?,
            data: d.expect_bytes()?.to_vec(),
        },
        58 => RequestBody::StatusNode {
            name: d.expect_string()?,
        },
        59 => RequestBody::Disconnect,
        other => return Err(CodecError::UnknownRequest(other)),
    };

    d.expect_done_and(BatchRequest { user, body })
}

pub fn encode_reply(reply: &BatchReply, buf: &mut BytesMut) {
    let at = begin_frame(buf);
    put_i32(buf, reply.code.code());
    put_i32(buf, reply.aux);
    put_i32(buf, reply.body.choice());

    match &reply.body {
        ReplyBody::Null => {},
        ReplyBody::Queue(id)
        | ReplyBody::ReadyToCommit(id)
        | ReplyBody::Commit(id) => put_string(buf, id),
        ReplyBody::Select(ids) => put_strings(buf, ids),
        ReplyBody::Status(entries) => {
            put_u32(buf, entries.len() as u32);
            for e in entries {
                put_string(buf, &e.name);
                put_attrs(buf, &e.attrs);
            }
        },
        ReplyBody::Text(text) | ReplyBody::Locate(text) => {
            put_string(buf, text)
        },
        ReplyBody::ResourceQuery {
            available,
            allocated,
            reserved,
            down,
        } => {
            put_u32(buf, available.len() as u32);
            put_i32s(buf, available);
            put_i32s(buf, allocated);
            put_i32s(buf, reserved);
            put_i32s(buf, down);
        },
    }

    end_frame(buf, at);
}

pub fn decode_reply(body: Bytes) -> Result<BatchReply, CodecError> {
    let mut d = Decoder::new(body);
    let code = ErrorCode::from_code(d.expect_i32()?);
    let aux = d.expect_i32()?;
    let choice = d.expect_i32()?;

    let body = match choice {
        1 => ReplyBody::Null,
        2 => ReplyBody::Queue(d.expect_string()?),
        3 => ReplyBody::ReadyToCommit(d.expect_string()?),
        4 => ReplyBody::Commit(d.expect_string()?),
        5 => ReplyBody::Select(d.expect_strings()?),
        6 => {
            let n = d.expect_u32()? as usize;
            let mut entries = Vec::new();
            for _ in 0..n {
                entries.push(StatusEntry {
                    name: d.expect_string()?,
                    attrs: d.expect_attrs()?,
                });
            }
            ReplyBody::Status(entries)
        },
        7 => ReplyBody::Text(d.expect_string()?),
        8 => ReplyBody::Locate(d.expect_string()?),
        9 => {
            let n = d.expect_resource_count()?;
            ReplyBody::ResourceQuery {
                available: d.expect_i32s(n)?,
                allocated: d.expect_i32s(n)?,
                reserved: d.expect_i32s(n)?,
                down: d.expect_i32s(n)?,
            }
        },
        other => return Err(CodecError::UnknownReplyChoice(other)),
    };

    d.expect_done_and(BatchReply { code, aux, body })
}

/// Takes one whole frame from the channel's buffer without blocking.
///
/// The outer result is `WouldBlock` when the frame is not fully buffered.
/// The inner result carries header errors; on those the frame has been
/// consumed (except when it is too large to skip).
fn take_frame<S>(
    ch: &mut WireChannel<S>,
) -> Result<Result<Bytes, CodecError>, WouldBlock> {
    let header = ch.try_read(HEADER_LEN)?;
    let mut d = Decoder::new(header);
    let fields = (d.expect_u32(), d.expect_u32(), d.expect_u32());
    let (ptype, version, len) = match fields {
        (Ok(p), Ok(v), Ok(l)) => (p, v, l as usize),
        _ => return Ok(Err(CodecError::Truncated)),
    };

    if len > MAX_FRAME_LEN {
        return Ok(Err(CodecError::FrameTooLarge(len)));
    }

    let body = ch.try_read(len)?;

    if (ptype, version) != (PROTOCOL_TYPE, PROTOCOL_VERSION) {
        return Ok(Err(CodecError::ProtocolMismatch { ptype, version }));
    }

    Ok(Ok(body))
}

/// Reads one frame, waiting for more data as needed, and decodes it with
/// `decode`. A decode failure consumes the frame so the next read starts on
/// the following one.
async fn read_frame<S, T>(
    ch: &mut WireChannel<S>,
    decode: fn(Bytes) -> Result<T, CodecError>,
) -> Result<T, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match take_frame(ch) {
            Ok(frame) => {
                ch.commit_read();
                return Ok(decode(frame?)?);
            },
            Err(WouldBlock) => {
                ch.rollback_read();
                ch.fill().await?;
            },
        }
    }
}

pub async fn read_request<S>(
    ch: &mut WireChannel<S>,
) -> Result<BatchRequest, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_frame(ch, decode_request).await
}

pub async fn read_reply<S>(
    ch: &mut WireChannel<S>,
) -> Result<BatchReply, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_frame(ch, decode_reply).await
}

/// Encodes and sends one request.
pub async fn write_request<S>(
    ch: &mut WireChannel<S>,
    req: &BatchRequest,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    encode_request(req, ch.write_buf());
    ch.flush().await?;
    Ok(())
}

pub async fn write_reply<S>(
    ch: &mut WireChannel<S>,
    reply: &BatchReply,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    encode_reply(reply, ch.write_buf());
    ch.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    use crate::types::attribute::Attribute;
    use crate::types::job::MAX_JOB_ID_LEN;

    fn frame_body(buf: &BytesMut) -> Bytes {
        Bytes::copy_from_slice(&buf[HEADER_LEN..])
    }

    #[track_caller]
    fn request_round_trip(body: RequestBody) {
        let req = BatchRequest::new("alice", body);
        let mut buf = BytesMut::new();
        encode_request(&req, &mut buf);
        assert_eq!(decode_request(frame_body(&buf)).unwrap(), req);

        let mut again = BytesMut::new();
        encode_request(&decode_request(frame_body(&buf)).unwrap(), &mut again);
        assert_eq!(again, buf);
    }

    #[track_caller]
    fn reply_round_trip(reply: BatchReply) {
        let mut buf = BytesMut::new();
        encode_reply(&reply, &mut buf);
        assert_eq!(decode_reply(frame_body(&buf)).unwrap(), reply);
    }

    #[test]
    fn requests_round_trip() {
        let long_id = "9".repeat(MAX_JOB_ID_LEN);

        request_round_trip(RequestBody::QueueJob {
            job_id: String::new(),
            destination: "batch@head".into(),
            attrs: vec![
                Attribute::new("Job_Name", "sim"),
                Attribute::resource("Resource_List", "nodes", "4"),
            ],
        });
        request_round_trip(RequestBody::JobScript {
            job_id: long_id.clone(),
            seq: 0,
            data: b"#!/bin/sh\necho hi\n".to_vec(),
        });
        request_round_trip(RequestBody::ReadyToCommit { job_id: long_id });
        request_round_trip(RequestBody::JobFile {
            job_id: "1.head".into(),
            kind: FileKind::StdErr,
            seq: 3,
            data: Vec::new(),
        });
        request_round_trip(RequestBody::JobObit {
            job_id: "1.head".into(),
            exit_status: -2,
            attrs: Vec::new(),
        });
        request_round_trip(RequestBody::DelFiles {
            job_id: "1.head".into(),
            files: vec!["1.head.OU".into()],
        });
        request_round_trip(RequestBody::StatusServer);
        request_round_trip(RequestBody::Disconnect);
    }

    #[test]
    fn client_requests_round_trip() {
        let long_id = "7".repeat(MAX_JOB_ID_LEN);

        request_round_trip(RequestBody::Commit { job_id: long_id.clone() });
        request_round_trip(RequestBody::JobCred {
            cred_type: 2,
            data: vec![0, 255, 7],
        });
        request_round_trip(RequestBody::JobCred {
            cred_type: 0,
            data: Vec::new(),
        });
        request_round_trip(RequestBody::DeleteJob { job_id: "1.head".into() });
        request_round_trip(RequestBody::HoldJob {
            job_id: long_id.clone(),
            hold: "u".into(),
        });
        request_round_trip(RequestBody::ReleaseJob {
            job_id: "1.head".into(),
            hold: String::new(),
        });
        request_round_trip(RequestBody::ModifyJob {
            job_id: "1.head".into(),
            attrs: vec![
                Attribute::new("Priority", "10"),
                Attribute::resource("Resource_List", "walltime", "01:00:00"),
            ],
        });
        request_round_trip(RequestBody::ModifyJob {
            job_id: "1.head".into(),
            attrs: Vec::new(),
        });
        request_round_trip(RequestBody::MoveJob {
            job_id: "1.head".into(),
            destination: "batch@other:15001".into(),
        });
        request_round_trip(RequestBody::RunJob {
            job_id: long_id.clone(),
            destination: String::new(),
        });
        request_round_trip(RequestBody::AsyncRunJob {
            job_id: "1.head".into(),
            destination: "node1:15002".into(),
        });
        request_round_trip(RequestBody::Rerun { job_id: "1.head".into() });
        request_round_trip(RequestBody::SignalJob {
            job_id: "1.head".into(),
            signal: "SIGUSR1".into(),
        });
        request_round_trip(RequestBody::OrderJob {
            job_a: "1.head".into(),
            job_b: long_id.clone(),
        });
        request_round_trip(RequestBody::LocateJob { job_id: long_id });
        request_round_trip(RequestBody::StatusJob {
            id: String::new(),
            attrs: vec![Attribute::new("job_state", "")],
        });
        request_round_trip(RequestBody::StatusJob {
            id: "1.head".into(),
            attrs: Vec::new(),
        });
        request_round_trip(RequestBody::StatusQueue { name: String::new() });
        request_round_trip(RequestBody::StatusQueue { name: "batch".into() });
        request_round_trip(RequestBody::StatusNode { name: "node1".into() });
        request_round_trip(RequestBody::Shutdown { manner: 1 });
        request_round_trip(RequestBody::CopyFiles {
            job_id: "1.head".into(),
            files: vec!["1.head.OU".into(), "1.head.ER".into()],
        });
        request_round_trip(RequestBody::CopyFiles {
            job_id: "1.head".into(),
            files: Vec::new(),
        });
    }

    #[test]
    fn replies_round_trip() {
        reply_round_trip(BatchReply::null());
        let commit = ReplyBody::Commit("1.head".into());
        reply_round_trip(BatchReply::ok(commit).with_aux(4242));
        reply_round_trip(BatchReply::error(ErrorCode::JobExists));
        reply_round_trip(BatchReply::ok(ReplyBody::Status(vec![StatusEntry {
            name: "1.head".into(),
            attrs: vec![Attribute::new("job_state", "Q")],
        }])));
        reply_round_trip(BatchReply::ok(ReplyBody::ResourceQuery {
            available: vec![1, 2],
            allocated: vec![0, 1],
            reserved: vec![0, 0],
            down: vec![0, 1],
        }));

        let long_id = "3".repeat(MAX_JOB_ID_LEN);
        reply_round_trip(BatchReply::ok(ReplyBody::Queue(long_id.clone())));
        reply_round_trip(BatchReply::ok(ReplyBody::Queue(String::new())));
        reply_round_trip(BatchReply::ok(ReplyBody::ReadyToCommit(long_id)));
        reply_round_trip(BatchReply::ok(ReplyBody::Select(vec![
            "1.head".into(),
            "2.head".into(),
        ])));
        reply_round_trip(BatchReply::ok(ReplyBody::Select(Vec::new())));
        let text = ReplyBody::Text("queue is disabled".into());
        reply_round_trip(BatchReply::ok(text));
        reply_round_trip(BatchReply::ok(ReplyBody::Text(String::new())));
        let locate = ReplyBody::Locate("batch@other:15001".into());
        reply_round_trip(BatchReply::ok(locate));
        reply_round_trip(BatchReply::ok(ReplyBody::Status(Vec::new())));
    }

    #[test]
    fn unknown_discriminants_are_distinct_errors() {
        let mut buf = BytesMut::new();
        put_i32(&mut buf, 99);
        put_string(&mut buf, "u");
        assert_eq!(
            decode_request(buf.freeze()),
            Err(CodecError::UnknownRequest(99))
        );

        let mut buf = BytesMut::new();
        put_i32(&mut buf, 0);
        put_i32(&mut buf, 0);
        put_i32(&mut buf, 77);
        assert_eq!(
            decode_reply(buf.freeze()),
            Err(CodecError::UnknownReplyChoice(77))
        );

        let mut buf = BytesMut::new();
        put_i32(&mut buf, 0);
        assert_eq!(decode_reply(buf.freeze()), Err(CodecError::Truncated));
    }

    #[tokio::test]
    async fn bad_frames_cost_only_themselves() {
        let (mut client, server) = io::duplex(4096);
        let mut ch = WireChannel::new(server);

        let mut out = BytesMut::new();
        // Wrong protocol version.
        put_u32(&mut out, PROTOCOL_TYPE);
        put_u32(&mut out, 9);
        put_u32(&mut out, 4);
        put_i32(&mut out, 59);
        // Unknown request.
        let at = begin_frame(&mut out);
        put_i32(&mut out, 1000);
        put_string(&mut out, "u");
        end_frame(&mut out, at);
        // A good one, split across writes below.
        encode_request(
            &BatchRequest::new(
                "u",
                RequestBody::Commit {
                    job_id: "5.h".into(),
                },
            ),
            &mut out,
        );

        let (first, second) = out.split_at(out.len() - 3);
        let (first, second) = (first.to_vec(), second.to_vec());
        tokio::spawn(async move {
            client.write_all(&first).await.unwrap();
            yield_now().await;
            client.write_all(&second).await.unwrap();
        });

        let e = read_request(&mut ch).await.unwrap_err();
        assert!(matches!(
            e,
            WireError::Codec(CodecError::ProtocolMismatch {
                ptype: 2,
                version: 9
            })
        ));
        assert!(!e.is_fatal_to_connection());

        let e = read_request(&mut ch).await.unwrap_err();
        assert!(matches!(
            e,
            WireError::Codec(CodecError::UnknownRequest(1000))
        ));

        let req = read_request(&mut ch).await.unwrap();
        assert_eq!(req.body, RequestBody::Commit { job_id: "5.h".into() });

        let e = read_request(&mut ch).await.unwrap_err();
        assert!(e.is_fatal_to_connection());
    }

    #[tokio::test]
    async fn oversized_frames_are_fatal() {
        let (mut client, server) = io::duplex(64);
        let mut ch = WireChannel::new(server);

        let mut out = BytesMut::new();
        put_u32(&mut out, PROTOCOL_TYPE);
        put_u32(&mut out, PROTOCOL_VERSION);
        put_u32(&mut out, (MAX_FRAME_LEN + 1) as u32);
        client.write_all(&out).await.unwrap();

        let e = read_request(&mut ch).await.unwrap_err();
        assert!(e.is_fatal_to_connection());
    }
}
