//! Pipeline stages turning a job row into an API request.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. switch rendering backend) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! job ──▶ render ──▶ encode ──▶ request
//!        (pdfium)   (base64)   (wire body)
//! ```
//!
//! 1. [`render`]  — rasterise the context window plus current page; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 2. [`encode`]  — PNG-encode and base64-wrap each image as a data URI
//! 3. [`request`] — assemble the chat-completion body and batch JSONL line

pub mod encode;
pub mod render;
pub mod request;
