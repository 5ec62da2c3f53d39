//! JSON-lines transport: one request object per stdin line, one response
//! object per stdout line. Calls run concurrently; responses are written in
//! completion order and carry the request's `id` when it had one.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsbox_core::{EngineError, ExecutionResult, Executor};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    tool: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    result: ExecutionResult,
}

fn malformed(line: &str, error: &serde_json::Error) -> Response {
    // Salvage the id so the caller can still correlate the failure.
    let id = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|value| value.get("id").cloned());
    Response {
        id,
        result: ExecutionResult::failure(&EngineError::invalid_args(format!(
            "malformed request: {error}"
        ))),
    }
}

async fn write_responses(mut rx: mpsc::Receiver<Response>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).context("failed to encode response")?;
        line.push(b'\n');
        stdout.write_all(&line).await.context("failed to write response")?;
        stdout.flush().await.context("failed to flush stdout")?;
    }
    Ok(())
}

pub async fn handle_serve_command(executor: Executor) -> Result<()> {
    let executor = Arc::new(executor);
    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<Response>(64);
    let writer = tokio::spawn(write_responses(rx));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; cancelling in-flight calls");
                shutdown.cancel();
            }
        });
    }

    info!(driver = executor.driver_name(), "serving tool calls on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut calls = JoinSet::new();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "rejecting malformed request");
                if tx.send(malformed(&line, &error)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let executor = Arc::clone(&executor);
        let cancel = shutdown.child_token();
        let tx = tx.clone();
        calls.spawn(async move {
            let result = executor.execute(&request.tool, request.args, &cancel).await;
            let response = Response {
                id: request.id,
                result,
            };
            if tx.send(response).await.is_err() {
                warn!(tool = %request.tool, "response dropped; writer has stopped");
            }
        });

        // Reap finished calls so the set does not grow without bound.
        while calls.try_join_next().is_some() {}
    }

    while let Some(joined) = calls.join_next().await {
        if let Err(error) = joined {
            warn!(%error, "tool call task failed");
        }
    }
    drop(tx);
    executor.shutdown().await;
    writer.await.context("response writer panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_flatten_the_result() -> Result<()> {
        let response = Response {
            id: Some(json!(7)),
            result: ExecutionResult::ok(json!({"ok": 1})),
        };
        assert_eq!(
            serde_json::to_value(&response)?,
            json!({"id": 7, "success": true, "data": {"ok": 1}})
        );
        Ok(())
    }

    #[test]
    fn malformed_requests_keep_their_id() {
        let line = r#"{"id": "abc", "args": {}}"#;
        let Err(error) = serde_json::from_str::<Request>(line) else {
            panic!("request without a tool must not parse");
        };
        let response = malformed(line, &error);
        assert_eq!(response.id, Some(json!("abc")));
        assert!(!response.result.success);
        assert!(response.result.error.unwrap_or_default().contains("missing field `tool`"));
    }
}
