//! # moraqman
//!
//! Digitize scanned Arabic dictionaries into term→definition JSON using
//! Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Classical OCR collapses on diacritized Arabic dictionary scans — two-column
//! RTL layouts, تشكيل marks, and entries flowing across page boundaries come
//! out garbled. Instead this crate rasterises each page into a PNG and lets a
//! VLM read it as a lexicographer would, producing structured JSON entries
//! that survive continuations and duplicate headwords.
//!
//! ## Pipeline Overview
//!
//! ```text
//! dictionary folders (PDF + descriptor)
//!  │
//!  ├─ 1. Prepare   scan folders, create per-page jobs in SQLite
//!  ├─ 2. Process   batch (OpenAI Batch API) or realtime extraction
//!  │     ├─ render    rasterise context + current page via pdfium
//!  │     ├─ encode    PNG → base64 data URIs (high/low detail)
//!  │     └─ request   prompt template + images → chat completion
//!  └─ 3. Finalize  merge page payloads → {folder}/{folder}.json
//! ```
//!
//! The three stages are separate binaries sharing one SQLite job store, so a
//! volume can be prepared once, processed across many sessions (batch runs
//! are cheap but slow; realtime runs are immediate), and finalized whenever
//! enough pages have landed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use moraqman::{EngineConfig, JobStore, OpenAiClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = JobStore::open("jobs.db")?;
//!     let config = EngineConfig::builder().batch_size(25).build()?;
//!     let client = OpenAiClient::new(std::env::var("OPENAI_API_KEY")?, &config)?;
//!     let outcome = moraqman::batch::run_batch_once(&store, &client, &config).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the three binaries (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! moraqman = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod finalize;
pub mod pipeline;
pub mod prepare;
pub mod progress;
pub mod prompts;
pub mod realtime;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use api::{OpenAiClient, VisionApi};
pub use batch::BatchOutcome;
pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{ApiError, MoraqmanError, StoreError};
pub use finalize::FinalizeOutcome;
pub use prepare::{PrepareOutcome, ScanReport};
pub use progress::{NoopProgressCallback, RunProgressCallback};
pub use realtime::RealtimeReport;
pub use store::{BatchState, ClaimedJob, DictStatus, JobStatus, JobStore};
