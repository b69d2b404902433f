//! Transport session: one outbound TCP connection with closeable,
//! deadline-aware line I/O.
//!
//! The session is driven by a single task, but it can be closed from any
//! other task through a [`SessionCloser`]. Every blocking operation races
//! the connection's close token, so a close wakes a pending read or write
//! immediately instead of waiting for the peer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;
use crate::frame::{terminate, TERMINATOR};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a line not yet terminated. Kept across calls so a deadline
    /// firing mid-line loses nothing.
    pending: Vec<u8>,
    closed: CancellationToken,
}

/// Cloneable handle that force-closes whatever connection the session holds.
#[derive(Clone)]
pub struct SessionCloser {
    shutdown: CancellationToken,
    current: Arc<Mutex<CancellationToken>>,
}

impl SessionCloser {
    fn new(shutdown: CancellationToken) -> Self {
        let current = shutdown.child_token();
        Self {
            shutdown,
            current: Arc::new(Mutex::new(current)),
        }
    }

    /// Closes the current connection. Idempotent; returns `true` only for
    /// the call that actually closed it.
    pub fn close(&self) -> bool {
        let token = self.lock().clone();
        let first = !token.is_cancelled();
        token.cancel();
        first
    }

    /// Token for a new connection. Born cancelled once shutdown was requested.
    fn renew(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        let previous = std::mem::replace(&mut *self.lock(), token.clone());
        previous.cancel();
        token
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A closeable client connection carrying newline-terminated frames out
/// and lines back.
pub struct TransportSession {
    conn: Option<Connection>,
    closer: SessionCloser,
}

impl TransportSession {
    /// Creates a session with no connection. Once `shutdown` is cancelled the
    /// session closes and never opens again.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            conn: None,
            closer: SessionCloser::new(shutdown),
        }
    }

    pub fn closer(&self) -> SessionCloser {
        self.closer.clone()
    }

    pub fn is_open(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| !conn.closed.is_cancelled())
    }

    /// Connects to `address`, replacing any previous connection.
    ///
    /// On failure the session holds no connection and every I/O call fails
    /// with [`SessionError::Closed`] without blocking.
    pub async fn open(&mut self, address: &str) -> Result<(), SessionError> {
        self.conn = None;
        let closed = self.closer.renew();

        let stream = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(SessionError::Closed),
            res = TcpStream::connect(address) => res.map_err(|source| SessionError::Connect {
                address: address.to_owned(),
                source,
            })?,
        };
        // Frames are small and each one waits for an answer.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "cannot set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(reader),
            writer,
            pending: Vec::new(),
            closed,
        });
        Ok(())
    }

    /// Writes `payload` followed by the line terminator, fully or not at all
    /// as far as the caller is concerned.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        self.write_raw(&terminate(payload)).await
    }

    /// Writes `bytes` as they are, without appending a terminator.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let conn = self.live()?;
        let closed = conn.closed.clone();

        let res = tokio::select! {
            biased;
            _ = closed.cancelled() => Err(SessionError::Closed),
            res = conn.writer.write_all(bytes) => res.map_err(SessionError::Write),
        };
        if matches!(res, Err(SessionError::Closed)) {
            self.conn = None;
        }
        res
    }

    /// Waits for one line, at most `deadline`.
    ///
    /// Returns the line without its terminator, [`SessionError::DeadlineExceeded`]
    /// if nothing complete arrived in time, or a transport error. Bytes of an
    /// incomplete line stay buffered for the next call.
    pub async fn read_line(&mut self, deadline: Duration) -> Result<String, SessionError> {
        let conn = self.live()?;
        let closed = conn.closed.clone();

        let res = tokio::select! {
            biased;
            _ = closed.cancelled() => Err(SessionError::Closed),
            res = tokio::time::timeout(
                deadline,
                conn.reader.read_until(TERMINATOR, &mut conn.pending),
            ) => match res {
                Err(_) => Err(SessionError::DeadlineExceeded(deadline)),
                Ok(Err(e)) => Err(SessionError::Read(e)),
                Ok(Ok(_)) if conn.pending.last() != Some(&TERMINATOR) => {
                    Err(SessionError::PeerClosed)
                }
                Ok(Ok(_)) => Ok(take_line(&mut conn.pending)),
            },
        };
        if matches!(res, Err(SessionError::Closed)) {
            self.conn = None;
        }
        res
    }

    /// Closes the connection. Safe to call any number of times; returns
    /// `true` if this call released a live connection.
    pub fn close(&mut self) -> bool {
        self.closer.close();
        self.conn.take().is_some()
    }

    /// The connection, unless there is none or it was closed from elsewhere.
    fn live(&mut self) -> Result<&mut Connection, SessionError> {
        if self
            .conn
            .as_ref()
            .is_some_and(|conn| conn.closed.is_cancelled())
        {
            self.conn = None;
        }
        self.conn.as_mut().ok_or(SessionError::Closed)
    }
}

fn take_line(pending: &mut Vec<u8>) -> String {
    pending.pop();
    if pending.last() == Some(&b'\r') {
        pending.pop();
    }
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    line
}
