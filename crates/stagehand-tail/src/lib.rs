//! stagehand-tail — a file-to-channel pump for job logs.
//!
//! [`stream`] waits for a log file to appear, forwards every complete line
//! to a channel as the writer appends it, and stops when the owning job
//! reaches a terminal state or the viewer goes away.
//!
//! The tailer knows nothing about WebSockets, tests, or deployments. The
//! caller supplies a finished check and a cancellation receiver; the same
//! pump serves test logs and provisioning logs.
//!
//! Cancellation here only ends the stream. It never touches the job that
//! is writing the file.

pub mod error;
pub mod tailer;

pub use error::{TailError, TailResult};
pub use tailer::{TailConfig, stream};
