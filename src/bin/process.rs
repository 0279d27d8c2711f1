//! CLI binary for job execution.
//!
//! Drives either the Batch API engine (default) or the realtime engine over
//! the pending jobs in the shared store.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use moraqman::{
    batch, realtime, BatchOutcome, EngineConfig, JobStore, NoopProgressCallback, OpenAiClient,
    RunProgressCallback,
};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Submit one batch of 50 jobs and wait for it
  moraqman-process --batch-size 50

  # Drain the whole pending pool, batch after batch
  moraqman-process --loop

  # At most 5 batches, one dictionary only
  moraqman-process --dict alqab --loop --max-batches 5

  # Import results from batches submitted earlier
  moraqman-process --resume

  # Immediate extraction with 8 concurrent calls
  moraqman-process --realtime --max-jobs 20 --concurrency 8

  # Check batch and job status
  moraqman-process --status

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY    OpenAI API key (required except for --status)
  MORAQMAN_MODEL    Override the vision model ID
  MORAQMAN_DB       Override the job store path
"#;

/// Execute extraction jobs via the OpenAI Batch API or realtime calls.
#[derive(Parser, Debug)]
#[command(
    name = "moraqman-process",
    version,
    about = "Execute extraction jobs via the OpenAI Batch API or realtime calls",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Path to the shared job store.
    #[arg(long, env = "MORAQMAN_DB", default_value = "jobs.db")]
    db: PathBuf,

    /// Jobs per batch submission.
    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Process one dictionary folder only.
    #[arg(long, value_name = "FOLDER")]
    dict: Option<String>,

    /// Vision model ID.
    #[arg(long, env = "MORAQMAN_MODEL", default_value = "gpt-5.1")]
    model: String,

    /// Show batch and job status, then exit.
    #[arg(long)]
    status: bool,

    /// Re-poll submitted batches and import any completed results.
    #[arg(long)]
    resume: bool,

    /// Keep submitting batches until no pending jobs remain.
    #[arg(long = "loop")]
    loop_mode: bool,

    /// Maximum number of batches to submit.
    #[arg(long)]
    max_batches: Option<u32>,

    /// Use the realtime engine instead of the Batch API.
    #[arg(long)]
    realtime: bool,

    /// Maximum jobs to claim in realtime mode.
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Concurrent API calls in realtime mode.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Seconds between batch status polls.
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,

    /// Maximum seconds to wait per batch before leaving it to --resume.
    #[arg(long, default_value_t = 3600)]
    max_wait: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

// ── Terminal progress bar for realtime runs ──────────────────────────────────

/// Renders a live bar and per-page log lines. Jobs complete out of order
/// under concurrency, so the bar only counts and never assumes sequence.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        Self { bar }
    }
}

impl RunProgressCallback for CliProgress {
    fn on_run_start(&self, total_jobs: usize) {
        self.bar.set_length(total_jobs as u64);
        self.bar.reset_eta();
    }

    fn on_job_done(&self, folder: &str, page_num: u32) {
        self.bar
            .println(format!("  {} {} page {}", green("✓"), folder, page_num));
        self.bar.inc(1);
    }

    fn on_job_failed(&self, folder: &str, page_num: u32, error: &str) {
        self.bar.println(format!(
            "  {} {} page {}: {}",
            red("✗"),
            folder,
            page_num,
            error
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _total_jobs: usize, _completed: usize) {
        self.bar.finish_and_clear();
    }
}

fn print_status(store: &JobStore) -> Result<()> {
    let batches = store.unimported_batches().context("Failed to list batches")?;
    if !batches.is_empty() {
        println!("{}", bold("Batches awaiting import:"));
        for b in &batches {
            println!("  {}  {}  ({} jobs)", b.id, b.status, b.job_ids.len());
        }
        println!();
    }

    println!(
        "{:<30} {:>7} {:>7} {:>8} {:>7} {:>11}",
        bold("Dictionary"),
        "Pages",
        "Done",
        "Pending",
        "Failed",
        "Processing"
    );
    for row in store.dictionary_progress().context("Failed to query progress")? {
        println!(
            "{:<30} {:>7} {:>7} {:>8} {:>7} {:>11}",
            row.folder_name, row.total_pages, row.done, row.pending, row.failed, row.processing
        );
    }
    Ok(())
}

fn describe(outcome: &BatchOutcome) -> String {
    match outcome {
        BatchOutcome::NoJobs => "no pending jobs".to_string(),
        BatchOutcome::Skipped => red("all claimed jobs failed request building"),
        BatchOutcome::Submitted { batch_id } => {
            cyan(&format!("batch {batch_id} still running; use --resume later"))
        }
        BatchOutcome::Imported { success, failed } => {
            green(&format!("imported {success} success, {failed} failed"))
        }
        BatchOutcome::Reverted { state, reset } => {
            red(&format!("batch {state}: {reset} jobs reset to pending"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let store = JobStore::open(&cli.db)
        .with_context(|| format!("Failed to open job store at {}", cli.db.display()))?;

    if cli.status {
        return print_status(&store);
    }

    let mut builder = EngineConfig::builder()
        .model(&cli.model)
        .batch_size(cli.batch_size)
        .concurrency(cli.concurrency)
        .poll_interval_secs(cli.poll_interval)
        .max_wait_secs(cli.max_wait);
    if let Some(dict) = &cli.dict {
        builder = builder.dict_filter(dict);
    }
    if let Some(n) = cli.max_jobs {
        builder = builder.max_jobs(n);
    }
    let config = builder.build().context("Invalid engine configuration")?;

    let api_key = std::env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY is not set; the execution engines need it")?;
    let client = OpenAiClient::new(api_key, &config)?;

    // A crash in an earlier run can leave claimed jobs stranded in
    // `processing`; anything no live batch covers goes back to the pool.
    let reclaimed = store.reclaim_orphaned_processing()?;
    if reclaimed > 0 && !cli.quiet {
        println!("{} reclaimed {reclaimed} orphaned jobs", cyan("◆"));
    }

    if cli.resume {
        let handled = batch::resume(&store, &client)
            .await
            .context("Resume pass failed")?;
        if !cli.quiet {
            println!("{} handled {handled} batches", green("✔"));
        }
        return Ok(());
    }

    if cli.realtime {
        let progress: Box<dyn RunProgressCallback> = if cli.quiet {
            Box::new(NoopProgressCallback)
        } else {
            Box::new(CliProgress::new())
        };
        let report = realtime::run_realtime(&store, &client, &config, progress.as_ref())
            .await
            .context("Realtime run failed")?;
        if !cli.quiet {
            println!(
                "{} {} completed, {} failed",
                green("✔"),
                bold(&report.completed.to_string()),
                report.failed
            );
        }
        return Ok(());
    }

    let outcomes = batch::run_loop(&store, &client, &config, cli.loop_mode, cli.max_batches)
        .await
        .context("Batch run failed")?;

    if !cli.quiet {
        if outcomes.is_empty() {
            println!("{} no pending jobs", green("✔"));
        }
        for (i, outcome) in outcomes.iter().enumerate() {
            println!("batch #{}: {}", i + 1, describe(outcome));
        }
        print_status(&store)?;
    }
    Ok(())
}
