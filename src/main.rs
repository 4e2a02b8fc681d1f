// main.rs

// --- External Crate Imports ---
use anyhow::{Error, Result};
use clap::Parser;
use log::info;
use std::time::Instant;

use fc_matrices::{run, PipelineConfig, SchaeferAtlas, SubjectLayout};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting fc_matrices with args: {:?}", cli_args);

    // --- 1. Atlas provider ---
    let atlas_dir = cli_args.atlas_dir.clone().unwrap_or_else(cli::default_atlas_dir);
    info!("Atlas data directory: {}", atlas_dir.display());
    let provider = SchaeferAtlas::new(atlas_dir)
        .yeo_networks(cli_args.yeo_networks)
        .resolution_mm(cli_args.resolution_mm)
        .allow_download(!cli_args.offline && cfg!(feature = "download"));

    // --- 2. Pipeline configuration ---
    let mut config = PipelineConfig::new(&cli_args.subjects_dir, &cli_args.output, cli_args.n_rois);
    config.layout = SubjectLayout::with_suffix(cli_args.volume_suffix.clone());
    config.interpolation = cli_args.interpolation;
    config.standardize = !cli_args.no_standardize;
    config.cache_dir = if cli_args.no_cache {
        None
    } else {
        Some(cli_args.cache_dir.clone())
    };
    config.failure_policy = cli_args.on_error;
    config.manifest = cli_args.manifest.clone();

    // --- 3. Run ---
    let summary = run(&config, &provider)?;

    println!(
        "\n Saved connectivity matrices to: {}",
        summary.output.display()
    );
    info!(
        "fc_matrices finished successfully in {:.2?} ({} processed, {} skipped).",
        total_time_start.elapsed(),
        summary.processed,
        summary.skipped.len()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use clap::Parser;
    use fc_matrices::driver::FailurePolicy;
    use fc_matrices::geometry::Interpolation;
    use std::path::PathBuf;

    pub(crate) fn default_atlas_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fc_matrices")
            .join("schaefer_2018")
    }

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Functional connectivity matrices from resting-state fMRI.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Directory holding one subdirectory per subject.
        #[arg(short = 'd', long = "subjects-dir", required = true)]
        pub(crate) subjects_dir: PathBuf,

        /// Output .npy file.
        #[arg(short, long = "out", required = true)]
        pub(crate) output: PathBuf,

        #[arg(short = 'n', long, default_value_t = 100)]
        pub(crate) n_rois: usize,

        #[arg(long, default_value_t = 7)]
        pub(crate) yeo_networks: u8,

        #[arg(long, default_value_t = 1)]
        pub(crate) resolution_mm: u8,

        #[arg(long)]
        pub(crate) atlas_dir: Option<PathBuf>,

        /// Never download atlas files.
        #[arg(long)]
        pub(crate) offline: bool,

        #[arg(long, default_value = "fc_matrices_cache")]
        pub(crate) cache_dir: PathBuf,

        #[arg(long)]
        pub(crate) no_cache: bool,

        /// Appended to each subject directory's name to locate its volume.
        #[arg(long, default_value = ".gz")]
        pub(crate) volume_suffix: String,

        #[arg(long, default_value = "continuous")]
        pub(crate) interpolation: Interpolation,

        #[arg(long)]
        pub(crate) no_standardize: bool,

        /// skip | skip-missing | abort
        #[arg(long, default_value = "skip")]
        pub(crate) on_error: FailurePolicy,

        /// Optional JSON manifest describing the subject axis.
        #[arg(long)]
        pub(crate) manifest: Option<PathBuf>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}
