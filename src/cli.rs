//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

use crate::recovery::classifier::{FailureType, Priority};
use crate::recovery::job::DeadLetterStatus;
use crate::recovery::log::RecoveryStrategy;
use crate::recovery::pattern::{PatternSeverity, PatternStatus, PatternType};

/// Dead-letter quarantine and adaptive recovery engine for background job queues.
#[derive(Parser, Debug)]
#[command(name = "job-recovery", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/config/recovery.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the recovery daemon: intake, sweeps, watchdog and metrics.
    Run,

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// List quarantined jobs.
    List(ListArgs),

    /// Show a job and its recovery history.
    Show(JobArgs),

    /// Show dashboard statistics for a tenant.
    Stats(TenantArgs),

    /// Show recovery performance over a trailing period.
    Report {
        #[command(flatten)]
        tenant: TenantArgs,

        /// Number of days to cover.
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// List failure patterns.
    Patterns(PatternArgs),

    /// Schedule a recovery attempt for a job.
    Retry(RetryArgs),

    /// Approve a recovery attempt waiting for approval.
    Approve(DecisionArgs),

    /// Reject a recovery attempt waiting for approval.
    Reject(DecisionArgs),

    /// Archive a job and cancel its pending attempt.
    Cancel {
        #[command(flatten)]
        job: JobArgs,

        /// Reason recorded on the cancelled attempt.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Assign a job to an operator.
    Assign {
        #[command(flatten)]
        job: JobArgs,

        /// Operator to assign; omit to clear the assignment.
        #[arg(long)]
        to: Option<String>,
    },

    /// Change the status of a failure pattern.
    #[command(name = "pattern-status")]
    PatternStatus {
        #[command(flatten)]
        tenant: TenantArgs,

        pattern_id: Uuid,

        status: PatternStatus,
    },

    /// Run one sweep and print its report.
    Sweep,
}

/// Tenant selector shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct TenantArgs {
    /// Tenant to operate on.
    #[arg(short, long, env = "RECOVERY_TENANT")]
    pub tenant: String,
}

/// Selects one job.
#[derive(Args, Debug)]
pub struct JobArgs {
    #[command(flatten)]
    pub tenant: TenantArgs,

    /// Dead-letter job id.
    pub job_id: Uuid,
}

/// Output format for listing commands.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub tenant: TenantArgs,

    #[arg(long)]
    pub status: Option<DeadLetterStatus>,

    #[arg(long)]
    pub priority: Option<Priority>,

    #[arg(long)]
    pub failure_type: Option<FailureType>,

    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long)]
    pub platform: Option<String>,

    #[arg(long)]
    pub channel: Option<String>,

    #[arg(long)]
    pub assigned_to: Option<String>,

    /// Only critical (true) or only non-critical (false) jobs.
    #[arg(long)]
    pub critical: Option<bool>,

    #[arg(long, default_value_t = 1)]
    pub page: usize,

    #[arg(long, default_value_t = 20)]
    pub per_page: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct PatternArgs {
    #[command(flatten)]
    pub tenant: TenantArgs,

    #[arg(long)]
    pub status: Option<PatternStatus>,

    #[arg(long = "type")]
    pub pattern_type: Option<PatternType>,

    #[arg(long)]
    pub min_severity: Option<PatternSeverity>,

    #[arg(long)]
    pub queue: Option<String>,
}

#[derive(Args, Debug)]
pub struct RetryArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// exponential_backoff, immediate, next_business_window or fixed:<seconds>.
    #[arg(long, default_value = "immediate")]
    pub strategy: RecoveryStrategy,

    /// Operator scheduling the retry.
    #[arg(long)]
    pub by: String,

    /// Hold the attempt until it is approved.
    #[arg(long)]
    pub require_approval: bool,

    /// Extra retries granted to a permanently failed job.
    #[arg(long, default_value_t = 0)]
    pub grant: u32,

    /// Replacement payload as JSON.
    #[arg(long)]
    pub payload: Option<String>,

    /// Queue to resubmit to instead of the original one.
    #[arg(long)]
    pub target_queue: Option<String>,
}

#[derive(Args, Debug)]
pub struct DecisionArgs {
    #[command(flatten)]
    pub tenant: TenantArgs,

    /// Recovery log id.
    pub log_id: Uuid,

    /// Operator making the decision.
    #[arg(long)]
    pub by: String,

    #[arg(long)]
    pub notes: Option<String>,
}
