//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CancelCommand, JobsCommand, RunCommand, ScheduleCommand, ServeCommand, StatusCommand,
    ValidateCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;

/// Content campaign orchestrator and publish scheduler
#[derive(Debug, Parser, Clone)]
#[command(name = "campaign")]
#[command(version)]
#[command(about = "Run content campaigns and schedule their publication", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run every pipeline of a campaign
    Run(RunCommand),

    /// Validate a campaign configuration
    Validate(ValidateCommand),

    /// Schedule a deferred action
    Schedule(ScheduleCommand),

    /// Cancel a pending job
    Cancel(CancelCommand),

    /// Show one job
    Status(StatusCommand),

    /// List scheduled jobs
    Jobs(JobsCommand),

    /// Run the scheduler until Ctrl-C
    Serve(ServeCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
