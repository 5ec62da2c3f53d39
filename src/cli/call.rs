use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wsbox_core::Executor;

/// Run one tool call. Returns whether it succeeded.
pub async fn handle_call_command(executor: Executor, tool: &str, args: &str) -> Result<bool> {
    let args: Value = serde_json::from_str(args).context("--args must be a JSON object")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; cancelling");
                cancel.cancel();
            }
        });
    }

    let result = executor.execute(tool, args, &cancel).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("failed to encode result")?
    );
    // Background processes do not outlive a one-shot call.
    executor.shutdown().await;
    Ok(result.success)
}
