mod commands;
mod logging;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use featurepipe_engine::RunRequest;

use crate::commands::run::OutputFormat;
use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "featurepipe",
    version,
    about = "Declarative feature pipelines: resolve, compute, validate and materialize feature tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Execute and validate but skip materialization; print the rows instead
    #[arg(long)]
    dry_run: bool,
    /// How to print each run result
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute every feature as of a date and materialize with the configured write mode
    Run {
        /// Pipeline YAML files (run concurrently)
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
        /// Reference date (YYYY-MM-DD)
        #[arg(long)]
        as_of: NaiveDate,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Recompute every feature over the full source history and overwrite the target
    Backfill {
        /// Pipeline YAML file
        pipeline: PathBuf,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Compute every feature as of a date and upsert into the target
    Update {
        /// Pipeline YAML file
        pipeline: PathBuf,
        /// Reference date (YYYY-MM-DD)
        #[arg(long)]
        as_of: NaiveDate,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Add one new feature column to an existing feature table
    InsertFeature {
        /// Pipeline YAML file
        pipeline: PathBuf,
        /// Feature definition YAML file
        #[arg(long)]
        feature: PathBuf,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Parse, validate and resolve a pipeline without touching the warehouse
    Check {
        /// Pipeline YAML files
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },
    /// Print the feature execution order
    Plan {
        /// Pipeline YAML file
        pipeline: PathBuf,
        /// Show the plan for inserting this feature instead
        #[arg(long)]
        feature: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run {
            pipelines,
            as_of,
            args,
        } => {
            commands::run::execute(&pipelines, RunRequest::Full { as_of }, args.dry_run, args.output)
                .await
        }
        Commands::Backfill { pipeline, args } => {
            commands::run::execute(&[pipeline], RunRequest::Backfill, args.dry_run, args.output).await
        }
        Commands::Update {
            pipeline,
            as_of,
            args,
        } => {
            commands::run::execute(&[pipeline], RunRequest::Update { as_of }, args.dry_run, args.output)
                .await
        }
        Commands::InsertFeature {
            pipeline,
            feature,
            args,
        } => {
            let request = commands::insert_feature_request(&feature)?;
            commands::run::execute(&[pipeline], request, args.dry_run, args.output).await
        }
        Commands::Check { pipelines } => commands::check::execute(&pipelines),
        Commands::Plan { pipeline, feature } => commands::plan::execute(&pipeline, feature.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_accepts_several_pipelines() {
        let cli = Cli::try_parse_from([
            "featurepipe",
            "run",
            "a.yaml",
            "b.yaml",
            "--as-of",
            "2024-06-30",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                pipelines,
                as_of,
                args,
            } => {
                assert_eq!(pipelines.len(), 2);
                assert_eq!(as_of, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
                assert!(args.dry_run);
                assert_eq!(args.output, OutputFormat::Text);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_update_requires_a_valid_date() {
        assert!(Cli::try_parse_from(["featurepipe", "update", "a.yaml"]).is_err());
        assert!(
            Cli::try_parse_from(["featurepipe", "update", "a.yaml", "--as-of", "30/06/2024"]).is_err()
        );
    }

    #[test]
    fn test_insert_feature_takes_feature_file() {
        let cli = Cli::try_parse_from([
            "featurepipe",
            "--log-format",
            "json",
            "insert-feature",
            "p.yaml",
            "--feature",
            "f.yaml",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::InsertFeature { .. }));
    }
}
