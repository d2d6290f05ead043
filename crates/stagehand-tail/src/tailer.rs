//! The polling tail loop.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{TailError, TailResult};

/// Polling cadence for [`stream`].
#[derive(Debug, Clone, Copy)]
pub struct TailConfig {
    /// How often to look for a log file that does not exist yet.
    pub wait_interval: Duration,
    /// How often to look for new bytes once the file is open.
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_millis(300),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Follow `path`, sending each complete line (terminators stripped) to `sink`.
///
/// After every read pass `finished` is awaited; once it reports `true` the
/// job is finished, the file is drained one last time and the stream ends
/// with `Ok(())`. A trailing line without a newline is only forwarded on
/// that final drain.
///
/// Setting `cancel` to `true` ends the stream with [`TailError::Canceled`]
/// after a best-effort final read. Dropping the receiving half of `sink`
/// ends it with [`TailError::SinkClosed`].
pub async fn stream<P, F>(
    path: &Path,
    mut finished: P,
    sink: &mpsc::Sender<String>,
    mut cancel: watch::Receiver<bool>,
    config: TailConfig,
) -> TailResult<()>
where
    P: FnMut() -> F,
    F: Future<Output = bool>,
{
    let file = loop {
        match File::open(path).await {
            Ok(file) => break file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::select! {
            _ = tokio::time::sleep(config.wait_interval) => {}
            _ = cancelled(&mut cancel) => {
                debug!(?path, "canceled while waiting for log file");
                return Err(TailError::Canceled);
            }
            _ = sink.closed() => return Err(TailError::SinkClosed),
        }
    };
    debug!(?path, "log file opened");

    let mut reader = BufReader::new(file);
    let mut pending = Vec::new();

    loop {
        forward_lines(&mut reader, &mut pending, sink).await?;

        if finished().await {
            forward_lines(&mut reader, &mut pending, sink).await?;
            if !pending.is_empty() {
                send_line(&mut pending, sink).await?;
            }
            debug!(?path, "job finished, log stream complete");
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = cancelled(&mut cancel) => {
                let _ = forward_lines(&mut reader, &mut pending, sink).await;
                debug!(?path, "log stream canceled");
                return Err(TailError::Canceled);
            }
            _ = sink.closed() => return Err(TailError::SinkClosed),
        }
    }
}

/// Read every complete line currently in the file. A partial line stays in
/// `pending` until its newline arrives.
async fn forward_lines(
    reader: &mut BufReader<File>,
    pending: &mut Vec<u8>,
    sink: &mpsc::Sender<String>,
) -> TailResult<()> {
    loop {
        let read = reader.read_until(b'\n', pending).await?;
        if read == 0 || pending.last() != Some(&b'\n') {
            return Ok(());
        }
        send_line(pending, sink).await?;
    }
}

async fn send_line(pending: &mut Vec<u8>, sink: &mpsc::Sender<String>) -> TailResult<()> {
    let line = String::from_utf8_lossy(pending)
        .trim_end_matches(['\n', '\r'])
        .to_string();
    pending.clear();
    sink.send(line).await.map_err(|_| TailError::SinkClosed)
}

/// Resolves once the flag is set. A dropped sender means nobody can cancel
/// any more, so this then never resolves.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
