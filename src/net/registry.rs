use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::types::protocol::{BatchRequest, RequestBody};
use crate::wire::codec::write_request;
use crate::wire::WireChannel;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no free connections")]
    NoFreeConnections,
    #[error("peer unreachable: {0}")]
    Unreachable(#[source] io::Error),
    #[error("unknown host '{0}'")]
    UnknownHost(String),
    #[error("timed out connecting")]
    Timeout,
    #[error("connection registry is shut down")]
    Closed,
}

impl ConnectError {
    /// Whether a later attempt at the same peer may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectError::NoFreeConnections | ConnectError::Timeout => true,
            ConnectError::Unreachable(e) => !matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::Unsupported
            ),
            ConnectError::UnknownHost(_) | ConnectError::Closed => false,
        }
    }
}

/// Where a destination lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// This server; reached without the network.
    Local,
    Remote { host: String, port: u16 },
}

impl Target {
    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local)
    }
}

#[derive(Debug)]
struct SlotInfo {
    peer: String,
    opened: Instant,
}

/// Bounded table of outbound connections.
///
/// The table lock only guards handle allocation and release; connecting,
/// sending and closing happen outside it.
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: Mutex<Vec<Option<SlotInfo>>>,
    closed: AtomicBool,
    server_name: String,
    port: u16,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(
        max: usize,
        server_name: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new((0..max).map(|_| None).collect()),
            closed: AtomicBool::new(false),
            server_name: server_name.into(),
            port,
            connect_timeout,
            disconnect_timeout,
        })
    }

    /// Resolves `host[:port]` against this server's identity. A missing port
    /// means `default_port`.
    pub fn resolve(
        &self,
        addr: &str,
        default_port: u16,
    ) -> Result<Target, ConnectError> {
        let (host, port) = match addr.rsplit_once(':') {
            Some((h, p)) => (
                h,
                p.parse()
                    .map_err(|_| ConnectError::UnknownHost(addr.to_owned()))?,
            ),
            None => (addr, default_port),
        };
        if host.is_empty() {
            return Err(ConnectError::UnknownHost(addr.to_owned()));
        }

        if host == self.server_name && port == self.port {
            Ok(Target::Local)
        } else {
            Ok(Target::Remote {
                host: host.to_owned(),
                port,
            })
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<SlotInfo>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, peer: &str) -> Result<usize, ConnectError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectError::Closed);
        }
        let mut slots = self.lock_slots();
        let idx = slots
            .iter()
            .position(Option::is_none)
            .ok_or(ConnectError::NoFreeConnections)?;
        slots[idx] = Some(SlotInfo {
            peer: peer.to_owned(),
            opened: Instant::now(),
        });
        Ok(idx)
    }

    fn release(&self, handle: usize) {
        let info = self.lock_slots().get_mut(handle).and_then(Option::take);
        if let Some(info) = info {
            trace!(
                handle,
                peer = %info.peer,
                open_ms = info.opened.elapsed().as_millis() as u64,
                "released connection"
            );
        }
    }

    /// Number of handles currently in use.
    pub fn active(&self) -> usize {
        self.lock_slots().iter().filter(|s| s.is_some()).count()
    }

    /// Opens a connection to `host:port`, holding a handle for its lifetime.
    pub async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<Connection, ConnectError> {
        let peer = format!("{host}:{port}");
        let handle = self.allocate(&peer)?;
        // Frees the handle on every early return below.
        let slot = SlotGuard {
            registry: Arc::clone(self),
            handle,
        };

        let lookup = lookup_host((host, port));
        let addrs = match timeout(self.connect_timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.collect::<Vec<_>>(),
            Ok(Err(_)) => {
                return Err(ConnectError::UnknownHost(host.to_owned()))
            },
            Err(_) => return Err(ConnectError::Timeout),
        };
        if addrs.is_empty() {
            return Err(ConnectError::UnknownHost(host.to_owned()));
        }

        let connect = TcpStream::connect(&addrs[..]);
        let stream = match timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::Unreachable(e)),
            Err(_) => return Err(ConnectError::Timeout),
        };
        if let Err(error) = stream.set_nodelay(true) {
            warn!(%error, %peer, "failed to set NODELAY");
        }

        debug!(handle, %peer, "connected");

        Ok(Connection {
            slot,
            peer,
            channel: WireChannel::new(stream),
        })
    }

    /// Closes a connection cooperatively: sends Disconnect, then waits
    /// (bounded) for the peer to close before releasing the handle.
    pub async fn disconnect(&self, mut conn: Connection) {
        let bye = BatchRequest::new("", RequestBody::Disconnect);
        let wait = self.disconnect_timeout;

        let res = timeout(wait, async {
            conn.channel.set_timeout(Some(wait));
            write_request(&mut conn.channel, &bye).await?;
            conn.channel.drain_to_eof().await?;
            Ok::<_, crate::wire::WireError>(())
        })
        .await;

        match res {
            Ok(Ok(())) => trace!(peer = %conn.peer, "orderly disconnect"),
            Ok(Err(error)) => {
                debug!(peer = %conn.peer, %error, "disconnect failed")
            },
            Err(_) => debug!(peer = %conn.peer, "peer did not close in time"),
        }
    }

    /// Refuses new connections. Open ones are unaffected.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct SlotGuard {
    registry: Arc<ConnectionRegistry>,
    handle: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.release(self.handle);
    }
}

/// An open outbound connection. Dropping it releases its handle.
pub struct Connection {
    slot: SlotGuard,
    peer: String,
    pub(crate) channel: WireChannel<TcpStream>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.slot.handle)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn handle(&self) -> usize {
        self.slot.handle
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::wire::codec::read_request;

    fn registry(max: usize) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(
            max,
            "head",
            15001,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn resolves_self_as_local() {
        let r = registry(1);
        assert_eq!(r.resolve("head", 15001).unwrap(), Target::Local);
        assert_eq!(r.resolve("head:15001", 1).unwrap(), Target::Local);
        assert_eq!(
            r.resolve("head:16000", 15001).unwrap(),
            Target::Remote {
                host: "head".into(),
                port: 16000
            }
        );
        assert!(matches!(
            r.resolve("other:x", 1),
            Err(ConnectError::UnknownHost(_))
        ));
    }

    #[tokio::test]
    async fn table_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let r = registry(1);

        let first = r.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(r.active(), 1);
        let err = r.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ConnectError::NoFreeConnections));
        assert!(err.is_retryable());

        drop(first);
        assert_eq!(r.active(), 0);
        let again = r.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(again.handle(), 0);
    }

    #[tokio::test]
    async fn refused_connections_are_retryable_and_free_their_slot() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let r = registry(2);

        let err = r.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ConnectError::Unreachable(_)), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(r.active(), 0);
    }

    #[tokio::test]
    async fn disconnect_waits_for_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let r = registry(1);

        let peer = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let mut ch = WireChannel::new(s);
            let req = read_request(&mut ch).await.unwrap();
            // Closing the socket here is what the client waits for.
            req.body
        });

        let conn = r.connect("127.0.0.1", port).await.unwrap();
        r.disconnect(conn).await;
        assert_eq!(peer.await.unwrap(), RequestBody::Disconnect);
        assert_eq!(r.active(), 0);
    }

    #[tokio::test]
    async fn shut_down_registry_refuses_connects() {
        let r = registry(1);
        r.shutdown();
        let err = r.connect("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, ConnectError::Closed));
        assert!(!err.is_retryable());
    }
}
