//! Helpers shared by unit tests: scratch directories and a scripted peer
//! speaking the batch protocol.
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::types::protocol::{BatchReply, BatchRequest, ReplyBody, RequestBody};
use crate::wire::codec::{read_request, write_reply};
use crate::wire::WireChannel;

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A directory under the system temp dir, removed on drop.
pub struct TestDir(PathBuf);

impl TestDir {
    pub fn new(name: &str) -> Self {
        let n = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir()
            .join(format!("batchd-{name}-{}-{n}", process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

/// What a [`FakePeer`] does with one request.
pub enum PeerAction {
    Reply(BatchReply),
    /// Never answer; keep the connection open.
    Stall,
    /// Drop the connection without answering.
    Close,
}

type Script = dyn Fn(usize, &BatchRequest) -> PeerAction + Send + Sync;

/// A loopback server answering each request as scripted. The script gets the
/// index of the connection the request arrived on.
pub struct FakePeer {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<(usize, BatchRequest)>>>,
    task: JoinHandle<()>,
}

impl FakePeer {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(usize, &BatchRequest) -> PeerAction + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);

        let task = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let mut n = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        n,
                        stream,
                        Arc::clone(&script),
                        Arc::clone(&log),
                    ));
                    n += 1;
                }
            })
        };

        Self { addr, log, task }
    }

    /// A peer that accepts every job, committing with session id `session`.
    pub async fn accepting(session: i32) -> Self {
        Self::start(move |_, req| PeerAction::Reply(accept(req, session))).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `127.0.0.1:<port>`
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Requests received so far, Disconnects excluded.
    pub fn requests(&self) -> Vec<(usize, BatchRequest)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.body != RequestBody::Disconnect)
            .cloned()
            .collect()
    }

    /// Names of the requests received so far, Disconnects excluded.
    pub fn request_names(&self) -> Vec<&'static str> {
        self.requests().iter().map(|(_, r)| r.body.name()).collect()
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The reply a well-behaved receiver gives to `req`.
pub fn accept(req: &BatchRequest, session: i32) -> BatchReply {
    match &req.body {
        RequestBody::QueueJob { job_id, .. } => {
            BatchReply::ok(ReplyBody::Queue(job_id.clone()))
        },
        RequestBody::ReadyToCommit { job_id } => {
            BatchReply::ok(ReplyBody::ReadyToCommit(job_id.clone()))
        },
        RequestBody::Commit { job_id } => {
            BatchReply::ok(ReplyBody::Commit(job_id.clone())).with_aux(session)
        },
        _ => BatchReply::null(),
    }
}

async fn serve(
    conn: usize,
    stream: TcpStream,
    script: Arc<Script>,
    log: Arc<Mutex<Vec<(usize, BatchRequest)>>>,
) {
    let mut ch = WireChannel::new(stream);
    while let Ok(req) = read_request(&mut ch).await {
        log.lock().unwrap().push((conn, req.clone()));
        if req.body == RequestBody::Disconnect {
            return;
        }
        match script(conn, &req) {
            PeerAction::Reply(reply) => {
                if write_reply(&mut ch, &reply).await.is_err() {
                    return;
                }
            },
            PeerAction::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return;
            },
            PeerAction::Close => return,
        }
    }
}
