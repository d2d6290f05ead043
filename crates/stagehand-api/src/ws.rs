//! WebSocket log streaming for tests and deployments.
//!
//! Every frame is a JSON object `{"type": "info"|"error"|"log", "message": ...}`.
//! The stream ends when the job settles or the client goes away. A client
//! disconnect only stops the tailer; the job keeps running.

use std::future::Future;
use std::path::PathBuf;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use stagehand_tail::{TailConfig, TailError};

use crate::ApiState;
use crate::handlers::test_id;

/// Lines buffered between the tailer and the socket writer.
const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Info,
    Error,
    Log,
}

impl FrameKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::Log => "log",
        }
    }
}

fn frame(kind: FrameKind, message: &str) -> Message {
    let body = serde_json::json!({ "type": kind.as_str(), "message": message });
    Message::Text(body.to_string().into())
}

type Sender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, kind: FrameKind, message: &str) -> bool {
    sender.send(frame(kind, message)).await.is_ok()
}

fn draining() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(serde_json::json!({
            "error": "Service is draining - please reconnect to active instance"
        })),
    )
        .into_response()
}

/// GET /{prefix}/ws/stages/{stage_id}/tests/{sequence}
pub async fn stream_test_log(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<ApiState>,
    Path((stage_id, sequence)): Path<(String, String)>,
) -> Response {
    if state.drain.is_draining() {
        return draining();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let test_id = match test_id(&stage_id, &sequence) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let (mut sender, receiver) = socket.split();
        let test = match state.stages.get_test(&test_id) {
            Ok(test) if test.stage_id == stage_id => test,
            Ok(_) => {
                send(&mut sender, FrameKind::Error, "test does not belong to the requested stage")
                    .await;
                let _ = sender.close().await;
                return;
            }
            Err(e) => {
                send(&mut sender, FrameKind::Error, &e.to_string()).await;
                let _ = sender.close().await;
                return;
            }
        };
        if test.log_path.is_empty() {
            send(&mut sender, FrameKind::Error, "log path is not available for this test run")
                .await;
            let _ = sender.close().await;
            return;
        }

        let stages = state.stages.clone();
        let finished = move || {
            let done = stages.test_finished(&test_id);
            async move { done }
        };
        follow(sender, receiver, PathBuf::from(test.log_path), finished, state.tail).await;
    })
}

/// GET /{prefix}/ws/deployments/{id}/logs
pub async fn stream_deployment_log(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    if state.drain.is_draining() {
        return draining();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let (mut sender, receiver) = socket.split();
        let dep = match state.deployments.get(&id) {
            Ok(dep) => dep,
            Err(e) => {
                send(&mut sender, FrameKind::Error, &e.to_string()).await;
                let _ = sender.close().await;
                return;
            }
        };
        if dep.log_path.is_empty() {
            send(&mut sender, FrameKind::Error, "log path is not available for this deployment")
                .await;
            let _ = sender.close().await;
            return;
        }

        let deployments = state.deployments.clone();
        let finished = move || {
            let done = deployments.deployment_settled(&id);
            async move { done }
        };
        follow(sender, receiver, PathBuf::from(dep.log_path), finished, state.tail).await;
    })
}

/// Pump `path` into the socket until the tailer stops.
///
/// The tailer gets its own cancellation channel, fired only when the
/// client side closes.
async fn follow<P, F>(
    mut sender: Sender,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    path: PathBuf,
    finished: P,
    config: TailConfig,
) where
    P: FnMut() -> F + Send + 'static,
    F: Future<Output = bool> + Send + 'static,
{
    if !tokio::fs::try_exists(&path).await.unwrap_or(false)
        && !send(&mut sender, FrameKind::Info, "waiting for log file").await
    {
        return;
    }
    if !send(&mut sender, FrameKind::Info, "log stream starting").await {
        return;
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let tail = tokio::spawn(async move {
        stagehand_tail::stream(&path, finished, &line_tx, cancel_rx, config).await
    });

    let mut client_gone = false;
    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => {
                    if !send(&mut sender, FrameKind::Log, &line).await {
                        client_gone = true;
                        break;
                    }
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    client_gone = true;
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = cancel_tx.send(true);
    drop(line_rx);
    let outcome = tail.await;
    if client_gone {
        debug!("log viewer disconnected");
        return;
    }

    match outcome {
        Ok(Ok(())) => {
            send(&mut sender, FrameKind::Info, "log stream ended").await;
        }
        Ok(Err(TailError::Canceled | TailError::SinkClosed)) => {}
        Ok(Err(e)) => {
            warn!(error = %e, "log stream failed");
            send(&mut sender, FrameKind::Error, "log stream failed").await;
        }
        Err(e) => {
            warn!(error = %e, "log tail task aborted");
            send(&mut sender, FrameKind::Error, "log stream failed").await;
        }
    }
    let _ = sender.close().await;
}
