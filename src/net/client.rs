use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use super::registry::{ConnectError, Connection};
use crate::types::protocol::{BatchReply, BatchRequest, ErrorCode};
use crate::wire::codec::{read_reply, write_request};
use crate::wire::WireError;

/// Failure of one request/reply exchange with a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer rejected request: {0}")]
    Rejected(ErrorCode),
}

/// What a sender should do after a failed exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Back off, reconnect and try again.
    Retry,
    /// Give up on this destination.
    Fatal,
    /// The peer's outcome is unknown.
    Timeout,
}

impl TransportError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TransportError::Connect(ConnectError::Timeout) => {
                Disposition::Timeout
            },
            TransportError::Connect(e) if e.is_retryable() => {
                Disposition::Retry
            },
            TransportError::Connect(_) => Disposition::Fatal,
            TransportError::Wire(e) if e.is_timeout() => Disposition::Timeout,
            TransportError::Wire(WireError::Channel(_)) => Disposition::Retry,
            TransportError::Wire(WireError::Codec(_)) => Disposition::Fatal,
            TransportError::Rejected(code) if code.is_transient() => {
                Disposition::Retry
            },
            TransportError::Rejected(_) => Disposition::Fatal,
        }
    }

    /// The batch error code reported to a client for this failure.
    pub fn reply_code(&self) -> ErrorCode {
        match self {
            TransportError::Rejected(code) => *code,
            TransportError::Connect(ConnectError::NoFreeConnections) => {
                ErrorCode::NoConnects
            },
            TransportError::Connect(ConnectError::UnknownHost(_)) => {
                ErrorCode::BadHost
            },
            TransportError::Connect(_) => ErrorCode::NoServer,
            TransportError::Wire(e) if e.is_timeout() => ErrorCode::Timeout,
            TransportError::Wire(WireError::Codec(_)) => ErrorCode::Protocol,
            TransportError::Wire(_) => ErrorCode::System,
        }
    }
}

impl Connection {
    /// Sends one request and waits, bounded by `wait`, for its reply. A reply
    /// carrying an error code becomes [`TransportError::Rejected`].
    pub async fn request(
        &mut self,
        req: &BatchRequest,
        wait: Duration,
    ) -> Result<BatchReply, TransportError> {
        trace!(peer = %self.peer(), request = req.body.name(), "sending");

        self.channel.set_timeout(Some(wait));
        write_request(&mut self.channel, req).await?;
        let reply = read_reply(&mut self.channel).await?;

        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(TransportError::Rejected(reply.code))
        }
    }
}
