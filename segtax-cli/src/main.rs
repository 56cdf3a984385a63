//! segtax CLI: evaluate universal-taxonomy segmentation models against
//! training and held-out datasets.

mod commands;

use clap::Parser;
use segtax_core::{ConfigOverrides, EvalTaxonomy, UnmappedPolicy};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// segtax: cross-taxonomy semantic segmentation evaluation
#[derive(Parser, Debug)]
#[command(name = "segtax", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Score cached predictions and write a report
    Evaluate(RunArgs),
    /// Print the evaluation context a dataset and model resolve to
    Resolve(RunArgs),
    /// Inspect the taxonomy tables
    Taxonomy {
        #[command(subcommand)]
        action: TaxonomyAction,
    },
    /// Print a stored report
    Show {
        /// Report file or results directory
        path: PathBuf,
        /// Print the raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Values that override the configuration for one run.
#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Dataset to evaluate on
    #[arg(short, long)]
    dataset: Option<String>,

    /// Model identifier, e.g. mseg-3m or mseg-3m-unrelabeled
    #[arg(short, long)]
    model_name: Option<String>,

    /// Path to the model weights
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Shorter-side resize target used at inference
    #[arg(long)]
    base_size: Option<u32>,

    /// Request an evaluation taxonomy: universal, test_dataset or naive
    #[arg(long)]
    taxonomy: Option<EvalTaxonomy>,

    /// Handling of labels without a mapping
    #[arg(long, value_enum)]
    unmapped: Option<PolicyArg>,

    /// Number of evaluation workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Cached label maps to score
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Root directory for results
    #[arg(long)]
    results_root: Option<PathBuf>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            dataset: self.dataset.clone(),
            model_name: self.model_name.clone(),
            model_path: self.model_path.clone(),
            base_size: self.base_size,
            eval_taxonomy: self.taxonomy,
            unmapped_policy: self.unmapped.map(UnmappedPolicy::from),
            workers: self.workers,
            prediction_cache: self.cache.clone(),
            results_root: self.results_root.clone(),
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyArg {
    /// Leave the pixel unscored
    Ignore,
    /// Abort the run
    Fail,
}

impl From<PolicyArg> for UnmappedPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Ignore => UnmappedPolicy::Ignore,
            PolicyArg::Fail => UnmappedPolicy::Fail,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum TaxonomyAction {
    /// List registered datasets with their roles
    List,
    /// Show a dataset's classes and their universal counterparts
    Show {
        /// Dataset name
        dataset: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Destination (defaults to ./segtax.toml)
        #[arg(default_value = "segtax.toml")]
        path: PathBuf,
    },
    /// Show the effective configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "segtax", "segtax")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "segtax.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, cli.config.as_deref())
}
