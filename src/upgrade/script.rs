//! Pre- and post-install script execution.
//!
//! On Unix the script is made executable and run through `bash` (or `sh`
//! when bash is not installed). Elsewhere the script file is launched
//! directly. In both cases the destination root is passed as the only
//! argument and output is captured line by line.

use anyhow::Result;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::UpdaterError;

/// Output stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStream {
    Stdout,
    Stderr,
}

impl ScriptStream {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of script output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    pub stream: ScriptStream,
    pub text: String,
}

/// Runs upgrade scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptRunner;

impl ScriptRunner {
    /// Runs `script` in `working_dir` with `destination` as its argument.
    ///
    /// Every output line is logged and handed to `on_line` as it arrives.
    /// Blocks until the script exits; a non-zero exit status or a failure to
    /// start is a [`UpdaterError::ScriptExecutionError`].
    pub async fn run<F>(
        &self,
        script: &Path,
        working_dir: &Path,
        destination: &Path,
        mut on_line: F,
    ) -> Result<()>
    where
        F: FnMut(ScriptLine),
    {
        let script_name = script.display().to_string();
        let failed = |reason: String| UpdaterError::ScriptExecutionError {
            script: script_name.clone(),
            reason,
        };

        let mut command = build_command(script).await.map_err(|e| failed(e.to_string()))?;
        command
            .arg(destination)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Running script {} {}", script.display(), destination.display());
        let mut child = command.spawn().map_err(|e| failed(format!("failed to start: {e}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(failed("output streams unavailable".to_string()).into());
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open) = (true, true);

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(text)) => {
                        debug!(target: "script", "{text}");
                        on_line(ScriptLine { stream: ScriptStream::Stdout, text });
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Failed to read script stdout: {e}");
                        stdout_open = false;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(text)) => {
                        warn!(target: "script", "{text}");
                        on_line(ScriptLine { stream: ScriptStream::Stderr, text });
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!("Failed to read script stderr: {e}");
                        stderr_open = false;
                    }
                },
            }
        }

        let status = child.wait().await.map_err(|e| failed(format!("failed to wait: {e}")))?;
        if !status.success() {
            let reason = match status.code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            };
            return Err(failed(reason).into());
        }

        debug!("Script {} completed", script.display());
        Ok(())
    }
}

#[cfg(unix)]
async fn build_command(script: &Path) -> std::io::Result<Command> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(script).await?.permissions();
    if permissions.mode() & 0o111 != 0o111 {
        permissions.set_mode(permissions.mode() | 0o755);
        tokio::fs::set_permissions(script, permissions).await?;
    }

    let shell = which::which("bash").unwrap_or_else(|_| "sh".into());
    let mut command = Command::new(shell);
    command.arg(script);
    Ok(command)
}

#[cfg(not(unix))]
async fn build_command(script: &Path) -> std::io::Result<Command> {
    tokio::fs::metadata(script).await?;
    Ok(Command::new(script))
}
