//! Lifecycle hook and build command execution.
//!
//! Hooks are shell commands that block the pipeline for their target until
//! they exit. A non-zero exit is fatal and never retried; a configured
//! timeout kills the process and fails the run.

use std::time::Duration;

use alloy_core::primitives::Address;
use tokio::process::Command;

use crate::error::GemcutError;

/// Context passed to hooks as environment variables.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub target: String,
    pub network: String,
    /// The diamond address, once known. Unset for hooks running before
    /// address derivation on a first deployment.
    pub diamond: Option<Address>,
}

impl HookContext {
    fn apply(&self, command: &mut Command) {
        command.env("GEMCUT_TARGET", &self.target);
        command.env("GEMCUT_NETWORK", &self.network);
        if let Some(diamond) = &self.diamond {
            command.env("GEMCUT_DIAMOND", diamond.to_string());
        }
    }
}

/// Run a named hook command, capturing its output.
pub async fn run_hook(
    name: &str,
    command_line: &str,
    context: Option<&HookContext>,
    timeout: Option<Duration>,
) -> Result<(), GemcutError> {
    tracing::info!(hook = name, command = command_line, "Running hook");

    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line).kill_on_drop(true);
    if let Some(context) = context {
        context.apply(&mut command);
    }

    let output_future = command.output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, output_future)
            .await
            .map_err(|_| GemcutError::HookFailure {
                hook: name.to_string(),
                code: -1,
                output: format!("hook timed out after {}s and was killed", limit.as_secs()),
            })?,
        None => output_future.await,
    }
    .map_err(|e| GemcutError::HookFailure {
        hook: name.to_string(),
        code: -1,
        output: format!("failed to spawn hook: {e}"),
    })?;

    if !output.status.success() {
        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(GemcutError::HookFailure {
            hook: name.to_string(),
            code: output.status.code().unwrap_or(-1),
            output: captured,
        });
    }

    tracing::debug!(hook = name, "Hook completed");
    Ok(())
}
