//! Bet uploader client.
//!
//! Reads an agency's bets file, uploads it to the lottery server in paced
//! batches over one TCP connection, announces completion and waits for the
//! final result. SIGINT / SIGTERM cancel the run and close the connection
//! promptly wherever the protocol currently is.

pub mod batch_buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod frame;
pub mod logging;
pub mod records;
pub mod session;
pub mod signals;
pub mod types;

pub use config::ClientConfig;
pub use controller::{State, UploadController, UploadReport};
pub use error::{Error, Result};
pub use events::{EventSink, MemorySink, TracingSink, UploadEvent};
pub use session::{SessionCloser, TransportSession};
pub use types::Bet;
