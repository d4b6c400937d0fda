//! # lobeseg
//!
//! A command-line tool to segment lung lobes (and optionally emphysema) in
//! chest CT volumes, and to stage NIfTI cohorts for it.
//!
//! ## Usage
//!
//! ```bash
//! lobeseg infer --config config.YAML --emp --vis
//! lobeseg stage --manifest use_case_record.csv --raw-dir <pool> --out-dir <cohort>/data/nifti --limit 10
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use anyhow::Result;
use clap::{Parser, Subcommand};

use lobeseg::{batch, stage};

#[derive(Parser, Debug)]
#[command(name = "lobeseg")]
#[command(about = "Segment lung lobes and emphysema in chest CT NIfTI volumes")]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Segment every volume in the configured data folder
    Infer {
        #[command(flatten)]
        args: batch::InferArgs,
    },
    /// Symlink the volumes listed in a manifest into a cohort folder
    Stage {
        #[command(flatten)]
        args: stage::StageArgs,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();

    match args.command {
        Commands::Infer { args } => batch::run(&args).map(|_| ()),
        Commands::Stage { args } => stage::run(&args).map(|_| ()),
    }
}
