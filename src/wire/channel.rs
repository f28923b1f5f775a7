use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("end of stream")]
    Eof,
    #[error("timed out waiting for peer")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Not enough buffered data to satisfy a read without touching the stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WouldBlock;

/// Buffered, byte-oriented channel over a stream.
///
/// Reads are tentative until committed: `try_read` advances a cursor over
/// the buffered bytes, `commit_read` discards everything before the cursor
/// and `rollback_read` moves the cursor back to the last commit point. This
/// lets a decoder that runs out of data give up, wait for more bytes and
/// start again from the top of the message.
///
/// Writes accumulate until `flush`.
pub struct WireChannel<S> {
    stream: S,
    /// Data read from the stream. Everything in here is uncommitted.
    rbuf: BytesMut,
    /// Read position within `rbuf`; 0 is the last commit point.
    cursor: usize,
    wbuf: BytesMut,
    /// Bound on every blocking read, write or flush.
    timeout: Option<Duration>,
}

impl<S> WireChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            rbuf: BytesMut::new(),
            cursor: 0,
            wbuf: BytesMut::new(),
            timeout: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Takes `n` bytes from the buffer, or fails without consuming anything.
    pub fn try_read(&mut self, n: usize) -> Result<Bytes, WouldBlock> {
        let end = self.cursor.checked_add(n).ok_or(WouldBlock)?;
        if end > self.rbuf.len() {
            return Err(WouldBlock);
        }
        let out = Bytes::copy_from_slice(&self.rbuf[self.cursor..end]);
        self.cursor = end;
        Ok(out)
    }

    /// Drops everything read since the last commit.
    pub fn commit_read(&mut self) {
        self.rbuf.advance(self.cursor);
        self.cursor = 0;
    }

    /// Rewinds to the last commit point.
    pub fn rollback_read(&mut self) {
        self.cursor = 0;
    }

    /// Buffered bytes not yet passed over by the cursor.
    pub fn pending(&self) -> usize {
        self.rbuf.len() - self.cursor
    }

    pub fn write(&mut self, data: &[u8]) {
        self.wbuf.extend_from_slice(data);
    }

    /// Mutable access to the write buffer for encoders.
    pub fn write_buf(&mut self) -> &mut BytesMut {
        &mut self.wbuf
    }

    /// Discards both buffers. Used when the underlying stream is replaced so
    /// no stale bytes carry over.
    pub fn reset(&mut self) {
        self.rbuf.clear();
        self.wbuf.clear();
        self.cursor = 0;
    }

    /// Swaps in a new stream, resetting both buffers, and returns the old one.
    pub fn replace_stream(&mut self, stream: S) -> S {
        self.reset();
        std::mem::replace(&mut self.stream, stream)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> WireChannel<S> {
    /// Reads more data from the stream into the buffer, returning the number
    /// of bytes read.
    ///
    /// Cancel-safe: the only await is a `read_buf` on the stream.
    pub async fn fill(&mut self) -> Result<usize, ChannelError> {
        loop {
            let read = self.stream.read_buf(&mut self.rbuf);
            let res = match self.timeout {
                Some(t) => match timeout(t, read).await {
                    Ok(res) => res,
                    Err(_) => return Err(ChannelError::Timeout),
                },
                None => read.await,
            };

            return match res {
                Ok(0) => Err(ChannelError::Eof),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    /// Reads exactly `n` bytes, waiting on the stream as needed. The bytes
    /// are not committed.
    pub async fn read(&mut self, n: usize) -> Result<Bytes, ChannelError> {
        loop {
            match self.try_read(n) {
                Ok(data) => return Ok(data),
                Err(WouldBlock) => {
                    self.fill().await?;
                },
            }
        }
    }

    /// Sends the write buffer, retrying interrupted writes.
    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        while !self.wbuf.is_empty() {
            let write = self.stream.write(&self.wbuf);
            let res = match self.timeout {
                Some(t) => match timeout(t, write).await {
                    Ok(res) => res,
                    Err(_) => return Err(ChannelError::Timeout),
                },
                None => write.await,
            };

            match res {
                Ok(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into())
                },
                Ok(n) => self.wbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.stream.flush().await?;
        Ok(())
    }

    /// Reads and discards until the peer closes the stream.
    pub async fn drain_to_eof(&mut self) -> Result<(), ChannelError> {
        loop {
            match self.fill().await {
                Ok(_) => {
                    self.rbuf.clear();
                    self.cursor = 0;
                },
                Err(ChannelError::Eof) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn rollback_rereads_from_commit_point() {
        let (mut client, server) = io::duplex(64);
        let mut ch = WireChannel::new(server);

        client.write_all(b"abcd").await.unwrap();
        ch.fill().await.unwrap();

        assert_eq!(ch.try_read(2).unwrap(), &b"ab"[..]);
        assert_eq!(ch.try_read(4), Err(WouldBlock));
        ch.rollback_read();
        assert_eq!(ch.try_read(3).unwrap(), &b"abc"[..]);
        ch.commit_read();
        assert_eq!(ch.pending(), 1);

        client.write_all(b"ef").await.unwrap();
        assert_eq!(ch.read(3).await.unwrap(), &b"def"[..]);
    }

    #[tokio::test]
    async fn reads_reassemble_fragments() {
        let (mut client, server) = io::duplex(64);
        let mut ch = WireChannel::new(server);

        tokio::spawn(async move {
            for part in [&b"he"[..], &b"ll"[..], &b"o"[..]] {
                client.write_all(part).await.unwrap();
                yield_now().await;
            }
        });

        assert_eq!(ch.read(5).await.unwrap(), &b"hello"[..]);
        assert!(matches!(ch.read(1).await, Err(ChannelError::Eof)));
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_eof() {
        let (_client, server) = io::duplex(64);
        let mut ch = WireChannel::new(server);
        ch.set_timeout(Some(Duration::from_millis(20)));

        assert!(matches!(ch.read(1).await, Err(ChannelError::Timeout)));
    }

    #[tokio::test]
    async fn flush_sends_buffered_writes() {
        let (mut client, server) = io::duplex(64);
        let mut ch = WireChannel::new(server);

        ch.write(b"ping");
        ch.write(b"!");
        ch.flush().await.unwrap();

        let mut got = [0u8; 5];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping!");
    }

    #[tokio::test]
    async fn replacing_the_stream_drops_stale_bytes() {
        let (mut old_client, old_server) = io::duplex(64);
        let mut ch = WireChannel::new(old_server);

        old_client.write_all(b"stale").await.unwrap();
        ch.fill().await.unwrap();
        ch.write(b"unsent");

        let (mut client, server) = io::duplex(64);
        ch.replace_stream(server);
        assert_eq!(ch.pending(), 0);

        client.write_all(b"new").await.unwrap();
        assert_eq!(ch.read(3).await.unwrap(), &b"new"[..]);

        ch.flush().await.unwrap();
        drop(ch);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
