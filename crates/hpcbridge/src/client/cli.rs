use std::path::PathBuf;

use clap::Parser;
use clap_complete::Shell;

use crate::scheduler::SchedulerFamily;

#[derive(clap::ValueEnum, Clone)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "HPCB_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::HPCB_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Submit the jobs of a job file and monitor them until they finish
    Submit(SubmitOpts),
    /// Resume monitoring of jobs from a recovery file
    Recover(RecoverOpts),
    /// Display the jobs stored in a recovery file
    Status(StatusOpts),
    /// Print the submission scripts of a job file without contacting any resource
    Script(ScriptOpts),
    /// Generate shell completion script
    GenerateCompletion(GenerateCompletionOpts),
}

#[derive(Parser)]
pub struct SubmitOpts {
    /// Path to a job file
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub jobfile: PathBuf,

    /// Where the state of the jobs is stored.
    ///
    /// Defaults to `<jobfile>.recovery.toml` next to the job file.
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub recovery_file: Option<PathBuf>,

    /// Return right after the jobs are submitted.
    ///
    /// Monitoring can be resumed later with `hpcb recover`.
    #[arg(long)]
    pub disconnect: bool,
}

#[derive(Parser)]
pub struct RecoverOpts {
    /// Path to a recovery file written by `hpcb submit`
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub recovery_file: PathBuf,
}

#[derive(Parser)]
pub struct StatusOpts {
    /// Path to a recovery file written by `hpcb submit`
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub recovery_file: PathBuf,
}

#[derive(Parser)]
pub struct ScriptOpts {
    /// Path to a job file
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub jobfile: PathBuf,

    /// Scheduler used for resources which do not specify one
    #[arg(long, value_enum)]
    pub scheduler: Option<SchedulerFamily>,

    /// Print only the script of the job with this name
    #[arg(long)]
    pub job: Option<String>,
}

#[derive(Parser)]
pub struct GenerateCompletionOpts {
    /// Shell flavour for which the completion script should be generated
    #[arg(value_enum)]
    pub shell: Shell,
}
