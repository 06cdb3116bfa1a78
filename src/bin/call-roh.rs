//! Call ROH from precomputed posteriors
//!
//! Reads `posterior0.csv` / `map.csv` for every requested chromosome of one
//! sample, calls ROH blocks on each chromosome in parallel and writes one
//! combined call table plus a short summary.

use clap::Parser;
use hapcon_rust::{
    calling::{call_genome, CallingParams, ModelParams},
    io::{write_call_table, write_summary_report, PosteriorFolder},
    report::SummaryReport,
    PosteriorMode,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "call-roh",
    version,
    about = "Calls runs of homozygosity from per-chromosome HMM posteriors"
)]
struct Cli {
    /// Sample folder containing chr<ch>/posterior0.csv and chr<ch>/map.csv
    #[arg(long, required = true)]
    input_folder: PathBuf,

    /// Sample ID written to the call table
    #[arg(long, required = true)]
    iid: String,

    /// Chromosomes to call, comma-separated
    #[arg(
        long,
        default_value = "1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22",
        value_delimiter = ','
    )]
    chromosomes: Vec<String>,

    /// Posterior convention: 'standard' (log-space non-ROH) or 'mmr' (ROH probability)
    #[arg(long, default_value = "standard")]
    posterior_mode: PosteriorMode,

    /// Posterior probability cutoff for the ROH state
    #[arg(long, default_value_t = 0.8)]
    cutoff: f64,

    /// Minimum ROH length to keep [Morgan]
    #[arg(long, default_value_t = 0.01)]
    min_len: f64,

    /// Maximum gap between blocks to merge [Morgan]
    #[arg(long, default_value_t = 0.01)]
    max_gap: f64,

    /// Do not merge blocks separated by small gaps
    #[arg(long)]
    no_merge: bool,

    /// Output call table (gzipped if it ends in .gz)
    #[arg(long, default_value = "roh.csv")]
    output_file: PathBuf,

    /// Optional summary report
    #[arg(long)]
    summary_file: Option<PathBuf>,

    /// Number of threads to use
    #[arg(long, default_value_t = 1)]
    n_threads: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Calling ROH for {} from {:?}", cli.iid, cli.input_folder);
    log::info!("Using {} threads", cli.n_threads);

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()?;

    // ===================================================================
    // 1. Validate calling parameters
    // ===================================================================
    let params = CallingParams::new(
        cli.posterior_mode,
        cli.cutoff,
        cli.min_len,
        cli.max_gap,
        !cli.no_merge,
    )?;
    log::info!("Calling parameters: {:?}", params);

    // ===================================================================
    // 2. Call all chromosomes
    // ===================================================================
    // Posteriors on disk were decoded under fixed model parameters.
    let model = ModelParams {
        contamination: 0.0,
        error_rate: 0.0,
    };
    let source = PosteriorFolder::new(&cli.input_folder);
    let calls = call_genome(&source, &cli.iid, &cli.chromosomes, &params, &model)?;

    // ===================================================================
    // 3. Save output
    // ===================================================================
    write_call_table(&cli.output_file, &calls)?;

    let report = SummaryReport::from_calls(&calls, params.mode);
    if let Some(summary_file) = &cli.summary_file {
        write_summary_report(summary_file, &report)?;
    } else {
        eprint!("{}", report);
    }

    log::info!("ROH calling for {} completed successfully.", cli.iid);
    Ok(())
}
