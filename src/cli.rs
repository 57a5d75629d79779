use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "relayscan",
    version,
    about = "Protection-relay configuration extraction tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Inventory(InventoryArgs),
    Extract(ExtractArgs),
    Calibrate(CalibrateArgs),
    Validate(ValidateArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long, default_value = ".cache/relayscan")]
    pub cache_root: PathBuf,

    /// Defaults to `<cache-root>/sources`.
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, default_value = ".cache/relayscan")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    #[arg(long)]
    pub inventory_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub extract_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub calibration_path: Option<PathBuf>,

    #[arg(long = "config")]
    pub config_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub refresh_inventory: bool,

    /// Worker threads; defaults to the available parallelism.
    #[arg(long)]
    pub jobs: Option<usize>,

    #[arg(long)]
    pub document_timeout_secs: Option<u64>,

    /// Overrides `raster_dpi` from the config file.
    #[arg(long)]
    pub raster_dpi: Option<f64>,

    #[arg(long)]
    pub max_pages_per_doc: Option<u32>,

    #[arg(long)]
    pub records_jsonl: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CalibrateArgs {
    #[arg(long, default_value = ".cache/relayscan")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub samples_path: PathBuf,

    #[arg(long)]
    pub calibration_path: Option<PathBuf>,

    #[arg(long = "config")]
    pub config_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long, default_value = ".cache/relayscan")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub glossary_path: PathBuf,

    /// Defaults to the most recent run in the staging store.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Restrict to one document's rows.
    #[arg(long)]
    pub filename: Option<String>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,

    #[arg(long, default_value_t = 0.5)]
    pub min_confidence: f64,

    /// Fail when any code is missing, unexpected or mismatched.
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/relayscan")]
    pub cache_root: PathBuf,
}
