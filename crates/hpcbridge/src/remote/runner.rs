use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use bstr::ByteSlice;
use tokio::process::Command;

/// Captured result of a finished local process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for matching messages regardless of the stream they were
    /// printed to.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<CommandOutput>> + 'a>>;

/// Runs a local program (`ssh`, `rsync`) to completion.
pub trait CommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> RunnerFuture<'a>;
}

/// Runs commands as child processes of the current process.
#[derive(Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;
            Ok(CommandOutput {
                stdout: output.stdout.to_str_lossy().into_owned(),
                stderr: output.stderr.to_str_lossy().into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            })
        })
    }
}
