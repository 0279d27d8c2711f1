//! Error types for the moraqman library.
//!
//! Three distinct error types reflect three distinct failure scopes:
//!
//! * [`MoraqmanError`] — **Fatal**: the current operation cannot proceed at
//!   all (missing folder, corrupt PDF, broken store). Returned as
//!   `Err(MoraqmanError)` from the top-level entry points.
//!
//! * [`ApiError`] — an OpenAI API call failed. Carries enough structure
//!   ([`ApiError::is_transient`]) for the execution engines to decide between
//!   retrying in place and recording a terminal failure on the job.
//!
//! * [`StoreError`] — a job-store operation failed. Wrapped into
//!   [`MoraqmanError::Store`] at the pipeline boundary.
//!
//! The separation keeps the blast radius of each failure small: a bad folder
//! never aborts a scan, a 500 never marks a job failed, and a failed batch
//! never loses its jobs.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the moraqman library.
///
/// Job-level failures are recorded on the job row in the store rather than
/// propagated here.
#[derive(Debug, Error)]
pub enum MoraqmanError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The dictionary root directory was not found.
    #[error("Dictionary root not found: '{path}'\nCheck the path exists and is readable.")]
    RootNotFound { path: PathBuf },

    /// The descriptor file exists but could not be read.
    #[error("Failed to read descriptor '{path}': {source}")]
    DescriptorUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// A job references a page number the document does not have.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: u32, detail: String },

    // ── Store errors ──────────────────────────────────────────────────────
    /// A job-store operation failed.
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    // ── API errors ────────────────────────────────────────────────────────
    /// An OpenAI API call failed fatally (batch lifecycle, file upload).
    #[error("OpenAI API error: {0}")]
    Api(#[from] ApiError),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write the final dictionary artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// An error from the OpenAI API, classified for retry decisions.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request timed out before a response arrived.
    #[error("API request timed out")]
    Timeout,

    /// The connection could not be established or was dropped mid-flight.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success HTTP status.
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// The response body was not in the expected shape.
    #[error("Invalid API response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether the execution engines should retry this error in place.
    ///
    /// Timeouts, connection failures, 429 and 5xx are transient. Everything
    /// else (other 4xx, malformed responses) is terminal for the job.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Connect(_) => true,
            ApiError::Status { code, .. } => *code == 429 || *code >= 500,
            ApiError::InvalidResponse(_) => false,
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_connect() || e.is_request() {
            ApiError::Connect(e.to_string())
        } else {
            ApiError::InvalidResponse(e.to_string())
        }
    }
}

/// Errors from the SQLite job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store file could not be opened or created.
    #[error("Failed to open job store: {0}")]
    Io(#[from] std::io::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("Job store lock poisoned")]
    LockPoisoned,

    /// A row held a value outside the schema's CHECK domain.
    #[error("Corrupt store row: {0}")]
    Corrupt(String),
}
