use std::path::PathBuf;

use anyhow::Result;
use ccat_sync::{recent_reports_markdown, run_job_from_env, JobKind};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ccat-cli")]
#[command(about = "Course catalog enrichment jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Insert departments listed for the configured term.
    Departments,
    /// Insert newly listed courses and fill missing titles.
    CoursesBase,
    /// Fill outline fields for every course not yet fully described.
    DeepRefresh,
    /// Fill outline fields for courses without a description.
    DeepBackfill,
    /// Map local courses to grade-site ids.
    DiggerMap,
    /// Refresh grade statistics for every mapped course.
    DiggerStats,
    /// Compute enrollment stats for courses that have none.
    CourseStats,
    /// Print a digest of the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

impl Commands {
    fn job(&self) -> Option<JobKind> {
        match self {
            Commands::Departments => Some(JobKind::Departments),
            Commands::CoursesBase => Some(JobKind::CoursesBase),
            Commands::DeepRefresh => Some(JobKind::DeepRefresh),
            Commands::DeepBackfill => Some(JobKind::DeepBackfill),
            Commands::DiggerMap => Some(JobKind::DiggerMap),
            Commands::DiggerStats => Some(JobKind::DiggerStats),
            Commands::CourseStats => Some(JobKind::CourseStats),
            Commands::Report { .. } => None,
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    if let Some(kind) = cli.command.job() {
        let summary = run_job_from_env(kind).await?;
        println!("{}", summary.summary_line());
        return Ok(());
    }

    if let Commands::Report { runs, root } = &cli.command {
        print!("{}", recent_reports_markdown(*runs, root)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommand_names_match_job_names() {
        for kind in JobKind::ALL {
            let cli = Cli::try_parse_from(["ccat-cli", kind.as_str()]).expect("parse");
            assert_eq!(cli.command.job(), Some(kind));
        }
    }

    #[test]
    fn report_takes_run_count() {
        let cli = Cli::try_parse_from(["ccat-cli", "report", "--runs", "2"]).expect("parse");
        assert!(matches!(cli.command, Commands::Report { runs: 2, .. }));
        assert!(Cli::try_parse_from(["ccat-cli"]).is_err());
    }
}
