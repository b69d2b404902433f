//! Upload outcomes reported by the controller.
//!
//! The controller only produces [`UploadEvent`]s; where they end up is decided
//! by the [`EventSink`] it was built with. The binary uses [`TracingSink`],
//! tests use [`MemorySink`].

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::error::RecordError;

/// Why a batch acknowledgment did not confirm the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFailure {
    /// The server answered with a different count.
    Mismatch { expected: usize, received: String },
    Timeout,
    Transport(String),
}

/// One observable step of an upload run, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Connected,
    ConnectFailed { error: String },
    RecordRejected(RecordError),
    BatchSent { count: usize },
    BatchWriteFailed { count: usize, error: String },
    BatchAcked { count: usize },
    /// The batch was written but not confirmed. The upload goes on.
    BatchAckFailed(AckFailure),
    DoneSent,
    DoneFailed { error: String },
    Winners { result: String },
    /// Every poll attempt hit its deadline.
    PollExhausted { attempts: u32 },
    PollFailed { error: String },
    Cancelled,
    LoopFinished,
}

/// Destination of controller events. Called from the driving task only.
pub trait EventSink: Send + Sync {
    fn record(&self, event: UploadEvent);
}

/// Logs every event through `tracing` in the `action | result` style.
#[derive(Debug, Clone)]
pub struct TracingSink {
    client_id: String,
}

impl TracingSink {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn record(&self, event: UploadEvent) {
        let client_id = self.client_id.as_str();
        match event {
            UploadEvent::Connected => {
                info!(action = "connect", result = "success", client_id);
            }
            UploadEvent::ConnectFailed { error } => {
                error!(action = "connect", result = "fail", client_id, %error);
            }
            UploadEvent::RecordRejected(e) => {
                warn!(action = "create_bet", result = "fail", client_id, line = e.line, error = %e.reason);
            }
            UploadEvent::BatchSent { count } => {
                info!(action = "batch_sent", result = "success", client_id, cantidad = count);
            }
            UploadEvent::BatchWriteFailed { count, error } => {
                error!(action = "apuesta_enviada", result = "fail", client_id, cantidad = count, %error);
            }
            UploadEvent::BatchAcked { count } => {
                info!(action = "apuesta_enviada", result = "success", cantidad = count);
            }
            UploadEvent::BatchAckFailed(AckFailure::Mismatch { expected, received }) => {
                error!(
                    action = "apuesta_enviada",
                    result = "fail",
                    client_id,
                    expected,
                    cantidad = %received,
                    error = "server could not process batch"
                );
            }
            UploadEvent::BatchAckFailed(AckFailure::Timeout) => {
                error!(action = "apuesta_enviada", result = "fail", client_id, error = "no acknowledgment in time");
            }
            UploadEvent::BatchAckFailed(AckFailure::Transport(error)) => {
                error!(action = "apuesta_enviada", result = "fail", client_id, %error);
            }
            UploadEvent::DoneSent => {
                info!(action = "done_sent", result = "success", client_id);
            }
            UploadEvent::DoneFailed { error } => {
                error!(action = "done_sent", result = "fail", client_id, %error);
            }
            UploadEvent::Winners { result: winners } => {
                info!(action = "consulta_ganadores", result = "success", cant_ganadores = %winners);
            }
            UploadEvent::PollExhausted { attempts } => {
                error!(action = "consulta_ganadores", result = "fail", client_id, attempts, error = "no result from server");
            }
            UploadEvent::PollFailed { error } => {
                error!(action = "consulta_ganadores", result = "fail", client_id, %error);
            }
            UploadEvent::Cancelled => {
                info!(action = "cancel", result = "success", client_id, info = "closing socket");
            }
            UploadEvent::LoopFinished => {
                info!(action = "loop_finished", result = "success", client_id);
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<UploadEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: UploadEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
