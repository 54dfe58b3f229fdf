use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hugemap_bin::init_logging_with_progress;
use hugemap_core::util::{
    DEFAULT_HUGETLBFS_DIR, DEFAULT_REQUIRED_PAGES, LARGE_MAP_LENGTH, MEMINFO_PATH, WINDOW_LEN,
};
use hugemap_core::{HugePageInfo, MappingVerifier, Outcome, VerifierConfig};
use log::{info, warn};
use serde::Serialize;

/// CLI arguments for the `large_map` binary.
///
/// Checks that a file on a hugetlbfs volume can be mapped beyond the 4 GiB
/// offset. Exits successfully if the volume is not set up.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// Directory on the hugetlbfs volume.
    #[clap(long = "dir", default_value = DEFAULT_HUGETLBFS_DIR)]
    dir: PathBuf,
    /// Required huge page size in KB.
    #[clap(long = "page-size-kb", default_value = "2048")]
    page_size_kb: u64,
    /// Required number of free huge pages.
    #[clap(long = "pages", default_value_t = DEFAULT_REQUIRED_PAGES)]
    pages: u64,
    /// Length of the sparse file in bytes.
    #[clap(long = "length", default_value_t = LARGE_MAP_LENGTH)]
    length: u64,
    /// Number of random bytes written at the end of the file.
    #[clap(long = "window", default_value_t = WINDOW_LEN)]
    window: usize,
    /// Seed for the random bytes.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Source of the huge page statistics.
    #[clap(long = "meminfo", default_value = MEMINFO_PATH)]
    meminfo: PathBuf,
    /// Keep the file on the volume after the run.
    #[clap(long = "keep")]
    keep: bool,
    /// Output file for the run report (JSON format).
    #[clap(long = "output")]
    output: Option<PathBuf>,
    /// Verbose output - log every state transition.
    #[clap(long = "verbose", short = 'v')]
    verbose: bool,
}

impl From<&CliArgs> for VerifierConfig {
    fn from(args: &CliArgs) -> Self {
        VerifierConfig {
            dir: args.dir.clone(),
            page_size: args.page_size_kb * 1024,
            required_pages: args.pages,
            length: args.length,
            window_len: args.window,
            seed: args.seed,
            keep_file: args.keep,
        }
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let progress = init_logging_with_progress(if args.verbose { "debug" } else { "info" })?;
    info!("CLI args: {:?}", args);

    let info = HugePageInfo::from_path(&args.meminfo);
    let mut verifier = MappingVerifier::new(VerifierConfig::from(&args), &info).with_progress(&progress);
    info!("Seed: {}", verifier.report().seed);

    let result = verifier.run();

    if let Some(output) = &args.output {
        verifier
            .report()
            .save_to_file(output)
            .with_context(|| format!("writing report to {}", output.display()))?;
    }

    match result.context("large mapping check failed")? {
        Outcome::Done => info!("PASSED"),
        Outcome::Aborted(reason) => warn!("SKIPPED: {}", reason),
    }
    Ok(())
}
