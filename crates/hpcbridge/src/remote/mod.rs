//! Execution of commands and file transfers on remote resources.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

use crate::engine::config::{get_retry_attempts, get_retry_backoff, SSH_TRANSPORT_FAULT};
use crate::job::{FileManifest, Resource};

mod runner;

pub use runner::{CommandOutput, CommandRunner, ProcessRunner, RunnerFuture};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(
        "Remote command on `{destination}` failed with exit code {exit_code} after {attempts} attempt(s)\nStderr: {stderr}\nStdout: {stdout}"
    )]
    Execution {
        destination: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
        attempts: u32,
    },
    #[error(
        "Transfer with `{destination}` failed with exit code {exit_code} after {attempts} attempt(s)\nStderr: {stderr}"
    )]
    Transfer {
        destination: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
        attempts: u32,
    },
    #[error("Cannot start `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Text printed by the remote side, if the call got that far.
    pub fn output(&self) -> Option<(&str, &str)> {
        match self {
            RemoteError::Execution { stdout, stderr, .. }
            | RemoteError::Transfer { stdout, stderr, .. } => Some((stdout, stderr)),
            RemoteError::Spawn { .. } => None,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            attempts: get_retry_attempts(),
            backoff: get_retry_backoff(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local directory to the remote directory.
    Upload,
    /// Remote directory to the local directory.
    Download,
}

#[derive(Copy, Clone)]
enum CallKind {
    Command,
    Transfer,
}

impl CallKind {
    /// `ssh` reserves exit code 255 for its own failures. Transfer tools do not separate
    /// transient and permanent failures, so every failed transfer is retried.
    fn is_retriable(self, exit_code: i32) -> bool {
        match self {
            CallKind::Command => exit_code == SSH_TRANSPORT_FAULT,
            CallKind::Transfer => exit_code != 0,
        }
    }
}

/// Runs commands on resources through `ssh` and transfers files through `rsync`.
///
/// The executor keeps no state between calls.
pub struct RemoteExecutor {
    runner: Box<dyn CommandRunner>,
    policy: RetryPolicy,
    ssh_program: String,
    rsync_program: String,
}

impl RemoteExecutor {
    pub fn new(
        runner: Box<dyn CommandRunner>,
        policy: RetryPolicy,
        ssh_program: String,
        rsync_program: String,
    ) -> Self {
        Self {
            runner,
            policy,
            ssh_program,
            rsync_program,
        }
    }

    /// Executor using the local `ssh` and `rsync` binaries and the retry policy from the
    /// environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let ssh = which::which("ssh")
            .context("Cannot find `ssh` binary. Make sure that OpenSSH is installed.")?;
        let rsync = which::which("rsync")
            .context("Cannot find `rsync` binary. Make sure that rsync is installed.")?;
        Ok(Self::new(
            Box::new(ProcessRunner),
            RetryPolicy::from_env(),
            path_to_string(&ssh),
            path_to_string(&rsync),
        ))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Executes the given command lines (joined with `&&`) on the resource.
    ///
    /// Connection failures are retried, a failure of the command itself is returned
    /// immediately.
    pub async fn execute(
        &self,
        resource: &Resource,
        commands: &[String],
    ) -> RemoteResult<CommandOutput> {
        let args = ssh_args(resource, commands);
        log::debug!(
            "Executing on {}: {}",
            resource.destination(),
            commands.join(" && ")
        );
        let (output, attempts) = self
            .run_with_retry(&self.ssh_program, &args, CallKind::Command, resource)
            .await?;
        log::trace!(
            "Remote command output: exit code {}\nstdout: {}\nstderr: {}",
            output.exit_code,
            output.stdout.trim(),
            output.stderr.trim()
        );
        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::Execution {
                destination: resource.destination(),
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                attempts,
            })
        }
    }

    /// Synchronizes the contents of `local` and `remote` directories, honoring the
    /// patterns of `manifest`.
    pub async fn transfer(
        &self,
        resource: &Resource,
        local: &Path,
        remote: &str,
        manifest: &FileManifest,
        direction: TransferDirection,
    ) -> RemoteResult<()> {
        let local = format!("{}/", local.display().to_string().trim_end_matches('/'));
        let remote = format!(
            "{}:{}/",
            resource.destination(),
            remote.trim_end_matches('/')
        );
        let (source, destination) = match direction {
            TransferDirection::Upload => (local, remote),
            TransferDirection::Download => (remote, local),
        };
        let args = rsync_args(resource, manifest, source, destination);
        log::debug!("Transferring files: rsync {}", args.join(" "));

        let (output, attempts) = self
            .run_with_retry(&self.rsync_program, &args, CallKind::Transfer, resource)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                destination: resource.destination(),
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                attempts,
            })
        }
    }

    /// Returns the last output and the number of performed attempts.
    async fn run_with_retry(
        &self,
        program: &str,
        args: &[String],
        kind: CallKind,
        resource: &Resource,
    ) -> RemoteResult<(CommandOutput, u32)> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let output =
                self.runner
                    .run(program, args)
                    .await
                    .map_err(|source| RemoteError::Spawn {
                        program: program.to_string(),
                        source,
                    })?;
            if output.success() || !kind.is_retriable(output.exit_code) || attempt >= attempts {
                return Ok((output, attempt));
            }
            log::warn!(
                "Connection to {} failed (attempt {attempt}/{attempts}, exit code {}), retrying in {}: {}",
                resource.destination(),
                output.exit_code,
                humantime::format_duration(self.policy.backoff),
                output.stderr.trim()
            );
            tokio::time::sleep(self.policy.backoff).await;
            attempt += 1;
        }
    }
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn ssh_args(resource: &Resource, commands: &[String]) -> Vec<String> {
    let mut args = vec!["-p".to_string(), resource.port.to_string()];
    if let Some(identity) = &resource.identity {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.extend([
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        resource.destination(),
        commands.join(" && "),
    ]);
    args
}

fn rsync_args(
    resource: &Resource,
    manifest: &FileManifest,
    source: String,
    destination: String,
) -> Vec<String> {
    let mut shell = format!("ssh -p {}", resource.port);
    if let Some(identity) = &resource.identity {
        shell.push_str(&format!(" -i {}", identity.display()));
    }
    let mut args = vec!["-az".to_string(), "-e".to_string(), shell];
    args.extend(
        manifest
            .exclude
            .iter()
            .map(|pattern| format!("--exclude={pattern}")),
    );
    if !manifest.include.is_empty() {
        args.push("--include=*/".to_string());
        args.extend(
            manifest
                .include
                .iter()
                .map(|pattern| format!("--include={pattern}")),
        );
        args.push("--exclude=*".to_string());
    }
    args.push(source);
    args.push(destination);
    args
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::job::FileManifest;
    use crate::remote::{RemoteError, TransferDirection};
    use crate::tests::utils::{resource, ScriptedRunner};

    fn ok(stdout: &str) -> (i32, String) {
        (0, stdout.to_string())
    }

    #[tokio::test]
    async fn execute_joins_commands() {
        let runner = ScriptedRunner::new(vec![ok("done")]);
        let executor = runner.executor();
        let output = executor
            .execute(
                &resource("cluster"),
                &["cd /scratch".to_string(), "qsub submit.pbs".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "done");
        insta::assert_debug_snapshot!(runner.calls(), @r###"
        [
            (
                "ssh",
                [
                    "-p",
                    "22",
                    "-o",
                    "BatchMode=yes",
                    "user@cluster.example.org",
                    "cd /scratch && qsub submit.pbs",
                ],
            ),
        ]
        "###);
    }

    #[tokio::test]
    async fn execute_passes_identity() {
        let runner = ScriptedRunner::new(vec![ok("")]);
        let executor = runner.executor();
        let mut resource = resource("cluster");
        resource.port = 2222;
        resource.identity = Some(PathBuf::from("/home/user/.ssh/id_hpc"));
        executor
            .execute(&resource, &["true".to_string()])
            .await
            .unwrap();
        let (_, args) = runner.calls().remove(0);
        assert_eq!(&args[..4], &["-p", "2222", "-i", "/home/user/.ssh/id_hpc"]);
    }

    #[tokio::test]
    async fn execute_transport_fault_retried_three_times() {
        let runner = ScriptedRunner::new(vec![(255, String::new()); 3]);
        let executor = runner.executor();
        let error = executor
            .execute(&resource("cluster"), &["true".to_string()])
            .await
            .unwrap_err();
        assert_eq!(runner.calls().len(), 3);
        assert!(matches!(
            error,
            RemoteError::Execution {
                exit_code: 255,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn execute_succeeds_on_third_attempt() {
        let runner = ScriptedRunner::new(vec![
            (255, String::new()),
            (255, String::new()),
            ok("1234.server"),
        ]);
        let executor = runner.executor();
        let output = executor
            .execute(&resource("cluster"), &["qsub submit.pbs".to_string()])
            .await
            .unwrap();
        assert_eq!(output.stdout, "1234.server");
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn execute_command_failure_not_retried() {
        let runner = ScriptedRunner::new(vec![(1, "qsub: error".to_string())]);
        let executor = runner.executor();
        let error = executor
            .execute(&resource("cluster"), &["qsub submit.pbs".to_string()])
            .await
            .unwrap_err();
        assert_eq!(runner.calls().len(), 1);
        match error {
            RemoteError::Execution {
                exit_code,
                attempts,
                stdout,
                ..
            } => {
                assert_eq!(exit_code, 1);
                assert_eq!(attempts, 1);
                assert_eq!(stdout, "qsub: error");
            }
            error => panic!("Unexpected error {error:?}"),
        }
    }

    #[tokio::test]
    async fn transfer_retries_any_failure() {
        let runner = ScriptedRunner::new(vec![(12, String::new()), (23, String::new()), ok("")]);
        let executor = runner.executor();
        executor
            .transfer(
                &resource("cluster"),
                Path::new("/home/user/job"),
                "/scratch/user/job1abcde",
                &FileManifest::default(),
                TransferDirection::Upload,
            )
            .await
            .unwrap();
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn transfer_fails_after_attempts() {
        let runner = ScriptedRunner::new(vec![(23, String::new()); 3]);
        let executor = runner.executor();
        let error = executor
            .transfer(
                &resource("cluster"),
                Path::new("/home/user/job"),
                "/scratch/user/job1abcde",
                &FileManifest::default(),
                TransferDirection::Download,
            )
            .await
            .unwrap_err();
        assert_eq!(runner.calls().len(), 3);
        assert!(matches!(
            error,
            RemoteError::Transfer {
                exit_code: 23,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transfer_download_filters() {
        let runner = ScriptedRunner::new(vec![ok("")]);
        let executor = runner.executor();
        let manifest = FileManifest {
            include: vec!["*.out".to_string(), "log*".to_string()],
            exclude: vec!["*.tmp".to_string()],
        };
        executor
            .transfer(
                &resource("cluster"),
                Path::new("/home/user/job/"),
                "/scratch/user/job1abcde",
                &manifest,
                TransferDirection::Download,
            )
            .await
            .unwrap();
        insta::assert_debug_snapshot!(runner.calls(), @r###"
        [
            (
                "rsync",
                [
                    "-az",
                    "-e",
                    "ssh -p 22",
                    "--exclude=*.tmp",
                    "--include=*/",
                    "--include=*.out",
                    "--include=log*",
                    "--exclude=*",
                    "user@cluster.example.org:/scratch/user/job1abcde/",
                    "/home/user/job/",
                ],
            ),
        ]
        "###);
    }
}
