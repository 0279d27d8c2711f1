//! CLI binary for job preparation.
//!
//! A thin shim over the library crate that scans the dictionary root and
//! registers unprocessed volumes in the job store.

use anyhow::{Context, Result};
use clap::Parser;
use moraqman::{prepare, JobStore};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Prepare every unprocessed dictionary folder
  moraqman-prepare --root maajim/moraqman

  # Force re-preparation of one folder (deletes its existing jobs)
  moraqman-prepare --root maajim/moraqman --force aami_faseeh

  # Show preparation status only
  moraqman-prepare --status

DESCRIPTOR FORMAT (file named `description` inside each folder):
  line 1:  dictionary name (Arabic)
  line 2:  description
  line 3:  prompt_name,context_pages        (optional)
  later:   skip N                           (optional)
"#;

/// Scan dictionary folders and create extraction jobs.
#[derive(Parser, Debug)]
#[command(
    name = "moraqman-prepare",
    version,
    about = "Scan dictionary folders and create extraction jobs",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Root directory containing one sub-folder per dictionary.
    #[arg(long, env = "MORAQMAN_ROOT", default_value = "maajim/moraqman")]
    root: PathBuf,

    /// Path to the shared job store.
    #[arg(long, env = "MORAQMAN_DB", default_value = "jobs.db")]
    db: PathBuf,

    /// Force re-preparation of this folder only.
    #[arg(long, value_name = "FOLDER")]
    force: Option<String>,

    /// Show the status table and exit.
    #[arg(long)]
    status: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

fn print_status(store: &JobStore) -> Result<()> {
    let rows = store.dictionary_progress().context("Failed to query progress")?;
    if rows.is_empty() {
        println!("No dictionaries in the job store yet.");
        return Ok(());
    }

    println!(
        "{:<30} {:>7} {:>7} {:>8} {:>7}  {}",
        bold("Dictionary"),
        "Pages",
        "Done",
        "Pending",
        "Failed",
        "Status"
    );
    let mut total_pages = 0u32;
    let mut total_done = 0u32;
    for row in &rows {
        total_pages += row.total_pages;
        total_done += row.done;
        println!(
            "{:<30} {:>7} {:>7} {:>8} {:>7}  {}",
            row.folder_name, row.total_pages, row.done, row.pending, row.failed, row.status
        );
    }
    if total_pages > 0 {
        let pct = total_done as f64 / total_pages as f64 * 100.0;
        println!(
            "\n{}",
            dim(&format!(
                "Overall progress: {pct:.1}% ({total_done}/{total_pages} pages)"
            ))
        );
    }
    Ok(())
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

    let report = prepare::scan(&store, &cli.root, cli.force.as_deref())
        .await
        .context("Preparation scan failed")?;

    if !cli.quiet {
        println!(
            "{} prepared {}, skipped {}, errors {}",
            green("✔"),
            bold(&report.prepared.to_string()),
            report.skipped,
            report.errors
        );
        print_status(&store)?;
    }
    Ok(())
}
