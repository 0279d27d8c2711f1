//! CLI binary for result finalization.
//!
//! Merges completed page payloads into the unified per-dictionary artifact.

use anyhow::{Context, Result};
use clap::Parser;
use moraqman::{finalize, JobStore};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

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
  # Finalize every dictionary with completed pages
  moraqman-finalize --root maajim/moraqman

  # Finalize one dictionary
  moraqman-finalize --dict aami_faseeh

  # Preview the merge without writing anything
  moraqman-finalize --dry-run

  # Per-dictionary status summary
  moraqman-finalize --summary

The artifact is written to <root>/<folder>/<folder>.json as
{"name", "description", "type": "moraqman", "data": {...}}.
"#;

/// Merge completed page results into final dictionary JSON files.
#[derive(Parser, Debug)]
#[command(
    name = "moraqman-finalize",
    version,
    about = "Merge completed page results into final dictionary JSON files",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Path to the shared job store.
    #[arg(long, env = "MORAQMAN_DB", default_value = "jobs.db")]
    db: PathBuf,

    /// Root directory the artifacts are written under.
    #[arg(long, env = "MORAQMAN_ROOT", default_value = "maajim/moraqman")]
    root: PathBuf,

    /// Finalize one dictionary folder only.
    #[arg(long, value_name = "FOLDER")]
    dict: Option<String>,

    /// Merge and preview without writing files or updating status.
    #[arg(long)]
    dry_run: bool,

    /// Show the per-dictionary summary and exit.
    #[arg(long)]
    summary: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

fn print_summary(store: &JobStore) -> Result<()> {
    println!(
        "{:<30} {:<12} {}",
        bold("Dictionary"),
        "Status",
        "Progress"
    );
    for row in store.dictionary_progress().context("Failed to query progress")? {
        println!(
            "{:<30} {:<12} {}/{}",
            row.folder_name, row.status, row.done, row.total_pages
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

    if cli.summary {
        return print_summary(&store);
    }

    let outcomes = finalize::run(&store, &cli.root, cli.dict.as_deref(), cli.dry_run)
        .await
        .context("Finalization failed")?;

    if !cli.quiet {
        if outcomes.is_empty() {
            println!("No dictionaries ready to finalize.");
        }
        for outcome in &outcomes {
            match &outcome.output_path {
                Some(path) => println!(
                    "{} {}: {} entries → {}",
                    green("✔"),
                    bold(&outcome.folder_name),
                    outcome.entries,
                    path.display()
                ),
                None => {
                    println!(
                        "{} {}: {} entries (dry run)",
                        green("✔"),
                        bold(&outcome.folder_name),
                        outcome.entries
                    );
                    for (key, value) in &outcome.samples {
                        let key: String = key.chars().take(40).collect();
                        let value: String = value.chars().take(50).collect();
                        println!("    {}", dim(&format!("• {key}: {value}…")));
                    }
                }
            }
        }
        print_summary(&store)?;
    }
    Ok(())
}
