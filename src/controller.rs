//! Upload controller: the batch-upload / poll protocol over one session.
//!
//! ```text
//! IDLE -> CONNECTING -> UPLOADING -> POLLING -> CLOSED
//!    \________\______________\___________\____-> ABORTED
//! ```
//!
//! Cancellation is observed at fixed points (before connecting, before each
//! batch, before each read, at every poll attempt) and the pacing sleep
//! races it. A signal watcher may also close the session from another task;
//! the session then fails the pending I/O, which ends the run the same way.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch_buffer::{Batch, BatchBuffer};
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::events::{AckFailure, EventSink, UploadEvent};
use crate::frame::{encode_done, parse_ack};
use crate::records::RecordItem;
use crate::session::{SessionCloser, TransportSession};

/// Lifecycle of one upload cycle. `Closed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Uploading,
    /// Completion marker sent, waiting for the final result.
    Polling,
    /// Result received and the connection released.
    Closed,
    /// Stopped early by a failure or by cancellation.
    Aborted,
}

/// What one run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub state: State,
    pub cancelled: bool,
    pub batches_sent: usize,
    pub records_sent: usize,
    pub records_rejected: usize,
    pub acks_ok: usize,
    pub acks_failed: usize,
    pub winners: Option<String>,
}

impl Default for UploadReport {
    fn default() -> Self {
        Self {
            state: State::Idle,
            cancelled: false,
            batches_sent: 0,
            records_sent: 0,
            records_rejected: 0,
            acks_ok: 0,
            acks_failed: 0,
            winners: None,
        }
    }
}

/// Why a run stopped before reaching `CLOSED`.
enum Stop {
    Cancelled,
    Failed,
}

type Step = Result<(), Stop>;

/// Drives one upload cycle over its own [`TransportSession`].
///
/// Outcomes go to the injected [`EventSink`]; the controller keeps no global
/// logger of its own.
pub struct UploadController {
    config: ClientConfig,
    cancel: CancellationToken,
    session: TransportSession,
    sink: Arc<dyn EventSink>,
    state: State,
}

impl UploadController {
    /// Builds an idle controller. Cancelling `cancel` stops the run at its
    /// next check and closes the session for good.
    pub fn new(config: ClientConfig, cancel: CancellationToken, sink: Arc<dyn EventSink>) -> Self {
        let session = TransportSession::new(cancel.clone());
        Self {
            config,
            cancel,
            session,
            sink,
            state: State::Idle,
        }
    }

    /// Handle that force-closes the session from another task.
    pub fn closer(&self) -> SessionCloser {
        self.session.closer()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Runs one full cycle: connect, upload every batch of `source`, send the
    /// completion marker and wait for the final result.
    ///
    /// Never fails: every problem is reported to the sink and reflected in
    /// the returned report. The connection is released before returning.
    pub async fn run<S>(mut self, source: S) -> UploadReport
    where
        S: Stream<Item = RecordItem>,
    {
        let mut report = UploadReport::default();

        let state = match self.drive(source, &mut report).await {
            Ok(()) => State::Closed,
            Err(Stop::Failed) => State::Aborted,
            Err(Stop::Cancelled) => {
                report.cancelled = true;
                self.sink.record(UploadEvent::Cancelled);
                State::Aborted
            }
        };
        if self.session.close() {
            debug!("connection closed");
        }
        self.transition(state);
        self.sink.record(UploadEvent::LoopFinished);

        report.state = state;
        report
    }

    async fn drive<S>(&mut self, source: S, report: &mut UploadReport) -> Step
    where
        S: Stream<Item = RecordItem>,
    {
        self.check_cancel()?;
        self.transition(State::Connecting);
        match self.session.open(&self.config.server_address).await {
            Ok(()) => self.sink.record(UploadEvent::Connected),
            Err(_) if self.cancel.is_cancelled() => return Err(Stop::Cancelled),
            Err(e) => {
                self.sink.record(UploadEvent::ConnectFailed {
                    error: e.to_string(),
                });
                return Err(Stop::Failed);
            }
        }

        self.transition(State::Uploading);
        self.upload(source, report).await?;
        self.send_done().await?;

        self.transition(State::Polling);
        self.poll(report).await
    }

    async fn upload<S>(&mut self, source: S, report: &mut UploadReport) -> Step
    where
        S: Stream<Item = RecordItem>,
    {
        let mut source = pin!(source);
        let mut buffer = BatchBuffer::new(self.config.batch_max_amount);

        while let Some(item) = source.next().await {
            self.check_cancel()?;
            match item {
                Ok(bet) => {
                    if buffer.push(&bet) {
                        if let Some(batch) = buffer.flush() {
                            self.send_batch(batch, report).await?;
                        }
                    }
                }
                Err(e) => {
                    report.records_rejected += 1;
                    self.sink.record(UploadEvent::RecordRejected(e));
                }
            }
        }
        if let Some(batch) = buffer.flush() {
            self.send_batch(batch, report).await?;
        }
        Ok(())
    }

    /// Paces, writes one batch and checks its acknowledgment. Only a write
    /// failure or cancellation stops the upload.
    async fn send_batch(&mut self, batch: Batch, report: &mut UploadReport) -> Step {
        self.check_cancel()?;
        self.pace().await?;

        if let Err(e) = self.session.write_frame(&batch.payload).await {
            self.check_cancel()?;
            self.sink.record(UploadEvent::BatchWriteFailed {
                count: batch.count,
                error: e.to_string(),
            });
            return Err(Stop::Failed);
        }
        report.batches_sent += 1;
        report.records_sent += batch.count;
        self.sink.record(UploadEvent::BatchSent { count: batch.count });

        self.check_cancel()?;
        let failure = match self.session.read_line(self.config.loop_period).await {
            Ok(line) => match parse_ack(&line) {
                Some(n) if n == batch.count => None,
                _ => Some(AckFailure::Mismatch {
                    expected: batch.count,
                    received: line,
                }),
            },
            Err(_) if self.cancel.is_cancelled() => return Err(Stop::Cancelled),
            Err(SessionError::DeadlineExceeded(_)) => Some(AckFailure::Timeout),
            Err(e) => Some(AckFailure::Transport(e.to_string())),
        };

        match failure {
            None => {
                report.acks_ok += 1;
                self.sink.record(UploadEvent::BatchAcked { count: batch.count });
            }
            Some(failure) => {
                report.acks_failed += 1;
                self.sink.record(UploadEvent::BatchAckFailed(failure));
            }
        }
        Ok(())
    }

    async fn send_done(&mut self) -> Step {
        self.check_cancel()?;
        match self.session.write_raw(&encode_done(&self.config.id)).await {
            Ok(()) => {
                self.sink.record(UploadEvent::DoneSent);
                Ok(())
            }
            Err(_) if self.cancel.is_cancelled() => Err(Stop::Cancelled),
            Err(e) => {
                self.sink.record(UploadEvent::DoneFailed {
                    error: e.to_string(),
                });
                Err(Stop::Failed)
            }
        }
    }

    /// Waits for the final result line, retrying on deadline expiry up to
    /// `poll_attempts` times.
    async fn poll(&mut self, report: &mut UploadReport) -> Step {
        let attempts = self.config.poll_attempts;
        for attempt in 1..=attempts {
            self.check_cancel()?;
            match self.session.read_line(self.config.poll_timeout).await {
                Ok(result) => {
                    report.winners = Some(result.clone());
                    self.sink.record(UploadEvent::Winners { result });
                    return Ok(());
                }
                Err(e) if e.is_deadline() => {
                    debug!(attempt, attempts, "no result yet");
                }
                Err(_) if self.cancel.is_cancelled() => return Err(Stop::Cancelled),
                Err(e) => {
                    self.sink.record(UploadEvent::PollFailed {
                        error: e.to_string(),
                    });
                    return Err(Stop::Failed);
                }
            }
        }
        self.check_cancel()?;
        self.sink.record(UploadEvent::PollExhausted { attempts });
        Err(Stop::Failed)
    }

    /// Inter-batch delay; returns early on cancellation.
    async fn pace(&self) -> Step {
        let period: Duration = self.config.loop_period;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }

    fn check_cancel(&self) -> Step {
        if self.cancel.is_cancelled() {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: State) {
        debug!(from = ?self.state, to = ?next, "state");
        self.state = next;
    }
}
