//! Host command execution (`ip`, `iptables-nft`).

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Errors from running a host command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Runs host commands. Swapped for a recorder in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, failing on a non-zero exit status.
    async fn run(&self, program: &str, args: &[&str]) -> Result<(), CommandError>;
}

/// Runs commands as child processes of the agent.
#[derive(Debug, Default, Clone)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<(), CommandError> {
        let command = format!("{} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(command = %command, stderr = %stderr, "Command failed");
            return Err(CommandError::Failed {
                command,
                code: output.status.code(),
                stderr,
            });
        }

        debug!(command = %command, "Command completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_and_failure() {
        let runner = HostCommandRunner;
        runner.run("true", &[]).await.unwrap();

        let err = runner.run("sh", &["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = HostCommandRunner
            .run("definitely-not-a-real-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
