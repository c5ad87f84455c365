//! One-shot CLI fallback for when the persistent session is unavailable.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::WorkiqError;
use crate::transport::augmented_path;
use crate::WorkiqConfig;

const FALLBACK_TARGET: &str = "workiq::fallback";

/// Captured output is truncated beyond this many bytes.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Runs `workiq ask -q <query>` as a single synchronous command. The query
/// is shell-quoted so embedded quotes stay inside their argument position.
pub async fn invoke_cli(config: &WorkiqConfig, query: &str) -> Result<String, WorkiqError> {
    let command_line = render_ask_command(&config.binary, query);
    debug!(target: FALLBACK_TARGET, command = %command_line, "invoking workiq cli");

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&command_line)
        .env("PATH", augmented_path(config.bin_dir.as_deref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(WorkiqError::Spawn)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WorkiqError::Spawn(std::io::Error::other("stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| WorkiqError::Spawn(std::io::Error::other("stderr not captured")))?;

    let run = async {
        let (stdout, stderr) = tokio::join!(read_capped(stdout), read_capped(stderr));
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout?, stderr?))
    };
    let outcome = timeout(config.cli_timeout, run).await;

    let (status, stdout, stderr) = match outcome {
        Ok(result) => result?,
        Err(_) => {
            let _ = child.start_kill();
            return Err(WorkiqError::Cli(format!(
                "workiq cli timed out after {}s",
                config.cli_timeout.as_secs()
            )));
        }
    };

    if !status.success() {
        let detail = String::from_utf8_lossy(&stderr);
        return Err(WorkiqError::Cli(format!(
            "workiq exited with {status}: {}",
            detail.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

async fn read_capped<R>(mut reader: R) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut output = Vec::new();
    (&mut reader)
        .take(MAX_OUTPUT_BYTES)
        .read_to_end(&mut output)
        .await?;
    // Keep draining past the cap so the child never blocks on a full pipe.
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(output)
}

pub(crate) fn render_ask_command(binary: &str, query: &str) -> String {
    format!("{} ask -q {}", shell_quote(binary), shell_quote(query))
}

pub(crate) fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config_with_binary(binary: &str) -> WorkiqConfig {
        WorkiqConfig {
            binary: binary.to_string(),
            bin_dir: None,
            ..WorkiqConfig::default()
        }
    }

    #[test]
    fn shell_quote_handles_quotes_and_spaces() {
        assert_eq!(shell_quote("simple"), "'simple'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("don't"), "'don'\"'\"'t'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn render_ask_command_quotes_the_query() {
        let rendered = render_ask_command("workiq", "meetings on 'Monday'");
        assert_eq!(
            rendered,
            "'workiq' ask -q 'meetings on '\"'\"'Monday'\"'\"''"
        );
    }

    #[tokio::test]
    async fn query_quotes_reach_the_command_literally() {
        // `echo` stands in for the workiq binary: its output is exactly the
        // argument vector the shell delivered.
        let config = config_with_binary("echo");
        let output = invoke_cli(&config, "don't panic").await.expect("cli failed");
        assert_eq!(output, "ask -q don't panic");
    }

    #[tokio::test]
    async fn nonzero_exit_includes_stderr() {
        let config = config_with_binary("/nonexistent/workiq-test-binary");
        let err = invoke_cli(&config, "anything")
            .await
            .expect_err("expected cli failure");
        match err {
            WorkiqError::Cli(message) => {
                assert!(message.contains("exited with"), "message: {message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out_and_is_killed() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let script = dir.path().join("workiq");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").expect("write failed");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod failed");
        }

        let config = WorkiqConfig {
            binary: script.to_string_lossy().into_owned(),
            bin_dir: None,
            cli_timeout: Duration::from_millis(100),
            ..WorkiqConfig::default()
        };
        let err = invoke_cli(&config, "anything")
            .await
            .expect_err("expected timeout");
        assert!(matches!(err, WorkiqError::Cli(ref message) if message.contains("timed out")));
    }
}
