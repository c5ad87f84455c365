use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ScriptHandler;
use crate::engine::{HandlerError, HandlerOutput};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a local executable per request: input JSON on stdin, JSON or plain
/// text back on stdout.
#[derive(Debug)]
pub struct ScriptRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ScriptRunner {
    pub fn new(spec: &ScriptHandler, base_dir: &Path) -> Result<Self, HandlerError> {
        let program = base_dir.join(&spec.file);
        if !program.exists() {
            return Err(HandlerError::Script(format!(
                "script not found at {}",
                program.display()
            )));
        }
        Ok(Self {
            program,
            args: spec.args.clone(),
        })
    }

    pub async fn call(&self, input: &Value) -> Result<HandlerOutput, HandlerError> {
        let payload =
            serde_json::to_vec(input).map_err(|err| HandlerError::Script(err.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| {
            HandlerError::Script(format!(
                "failed to launch {}: {err}",
                self.program.display()
            ))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HandlerError::Script("stdin not captured".to_string()))?;

        let run = async {
            // A script that never reads stdin closes the pipe early; that is
            // not an error.
            if let Err(err) = stdin.write_all(&payload).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(err);
                }
            }
            drop(stdin);
            child.wait_with_output().await
        };
        let output = timeout(SCRIPT_TIMEOUT, run)
            .await
            .map_err(|_| {
                HandlerError::Script(format!(
                    "script timed out after {}s",
                    SCRIPT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|err| HandlerError::Script(format!("script failed: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HandlerError::Script(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match serde_json::from_str(&text) {
            Ok(value) => Ok(HandlerOutput::Json(value)),
            Err(_) => Ok(HandlerOutput::Text(text)),
        }
    }
}
