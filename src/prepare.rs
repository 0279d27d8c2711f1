//! Job preparation: scan dictionary folders and create job rows.
//!
//! Each folder under the dictionary root holds one scanned volume: a PDF,
//! an optional `description` descriptor file, and (once finalized) the
//! `<folder>/<folder>.json` artifact. Preparation registers the dictionary
//! and creates one pending job per page after the skip prefix, all in one
//! transaction, so a crash mid-scan never leaves a half-prepared volume.
//!
//! Descriptor format:
//!
//! ```text
//! line 1:  dictionary name (Arabic)
//! line 2:  description
//! line 3:  prompt_name,context_pages   (optional; or just a prompt name)
//! later:   skip N                      (optional; skip the first N pages)
//! ```

use crate::error::MoraqmanError;
use crate::pipeline::render::page_count;
use crate::store::{DictionaryMeta, JobStore};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DESCRIPTOR_FILE: &str = "description";
const DEFAULT_PROMPT: &str = "arabic_only_with_diacritics";
const DEFAULT_CONTEXT_PAGES: u32 = 1;

/// Parsed descriptor metadata for one dictionary folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub description: String,
    pub prompt_name: String,
    pub context_pages: u32,
    pub skip_pages: u32,
}

impl Descriptor {
    /// Defaults used when the descriptor file is missing.
    fn defaults(folder_name: &str) -> Self {
        Self {
            name: folder_name.to_string(),
            description: format!("معجم {folder_name}"),
            prompt_name: DEFAULT_PROMPT.to_string(),
            context_pages: DEFAULT_CONTEXT_PAGES,
            skip_pages: 0,
        }
    }
}

/// Parse descriptor file content. Malformed optional lines fall back to
/// their defaults rather than failing the folder.
pub fn parse_descriptor(folder_name: &str, content: &str) -> Descriptor {
    let mut result = Descriptor::defaults(folder_name);
    let lines: Vec<&str> = content.trim().lines().collect();

    if let Some(line) = lines.first() {
        let name = line.trim();
        if !name.is_empty() {
            result.name = name.to_string();
        }
    }
    if let Some(line) = lines.get(1) {
        result.description = line.trim().to_string();
    }
    if let Some(line) = lines.get(2) {
        let config_line = line.trim();
        match config_line.split_once(',') {
            Some((prompt, pages)) => {
                result.prompt_name = prompt.trim().to_string();
                if let Ok(n) = pages.trim().parse() {
                    result.context_pages = n;
                }
            }
            None => {
                if !config_line.is_empty() {
                    result.prompt_name = config_line.to_string();
                }
            }
        }
    }

    // The skip directive can sit on line 4 or any later line.
    for line in lines.iter().skip(3) {
        let line = line.trim().to_lowercase();
        if let Some(rest) = line.strip_prefix("skip") {
            if let Ok(n) = rest.trim().parse() {
                result.skip_pages = n;
            }
        }
    }

    result
}

/// Read and parse the folder's descriptor file, falling back to defaults
/// when the file does not exist.
pub fn read_descriptor(folder_path: &Path) -> Result<Descriptor, MoraqmanError> {
    let folder_name = folder_name_of(folder_path);
    let desc_path = folder_path.join(DESCRIPTOR_FILE);

    if !desc_path.exists() {
        return Ok(Descriptor::defaults(&folder_name));
    }

    let content = std::fs::read_to_string(&desc_path).map_err(|source| {
        MoraqmanError::DescriptorUnreadable {
            path: desc_path,
            source,
        }
    })?;
    Ok(parse_descriptor(&folder_name, &content))
}

/// Find the first PDF file inside a dictionary folder.
pub fn find_pdf(folder_path: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(folder_path).ok()?;
    let mut pdfs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false)
        })
        .collect();
    pdfs.sort();
    pdfs.into_iter().next()
}

/// Whether the folder already holds its final `<folder>/<folder>.json`
/// artifact from a previous full run.
pub fn has_final_artifact(folder_path: &Path) -> bool {
    let folder_name = folder_name_of(folder_path);
    folder_path.join(format!("{folder_name}.json")).exists()
}

fn folder_name_of(folder_path: &Path) -> String {
    folder_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Outcome of preparing one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Jobs were created for the folder.
    Prepared { jobs_created: u32 },
    /// Folder already registered (and not forced).
    AlreadyRegistered { status: String },
    /// Folder already has its final artifact (and not forced).
    AlreadyFinalized,
    /// No PDF found in the folder.
    NoPdf,
}

/// Prepare one dictionary folder: parse the descriptor, count pages, and
/// insert the dictionary with its job range.
pub async fn prepare_folder(
    store: &JobStore,
    folder_path: &Path,
    force: bool,
) -> Result<PrepareOutcome, MoraqmanError> {
    let folder_name = folder_name_of(folder_path);

    if !force {
        if let Some((_, status)) = store.dictionary_by_folder(&folder_name)? {
            return Ok(PrepareOutcome::AlreadyRegistered { status });
        }
        if has_final_artifact(folder_path) {
            return Ok(PrepareOutcome::AlreadyFinalized);
        }
    }

    let Some(pdf_path) = find_pdf(folder_path) else {
        return Ok(PrepareOutcome::NoPdf);
    };

    let descriptor = read_descriptor(folder_path)?;
    let total_pages = page_count(&pdf_path).await?;

    let meta = DictionaryMeta {
        folder_name: folder_name.clone(),
        name: descriptor.name,
        description: descriptor.description,
        prompt_name: descriptor.prompt_name,
        context_pages: descriptor.context_pages,
        skip_pages: descriptor.skip_pages.min(total_pages),
        pdf_path: pdf_path.to_string_lossy().into_owned(),
        total_pages,
    };

    let (_, jobs_created) = store.create_dictionary_with_jobs(&meta, force)?;
    info!(
        "Prepared '{}': {} jobs (pages {}..={}, prompt {})",
        folder_name,
        jobs_created,
        meta.skip_pages + 1,
        total_pages,
        meta.prompt_name
    );
    Ok(PrepareOutcome::Prepared { jobs_created })
}

/// Totals from one scan pass.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub prepared: u32,
    pub skipped: u32,
    pub errors: u32,
}

/// Scan every folder under `root` and prepare the unprocessed ones.
///
/// With `force_folder` set, only that folder is processed and its existing
/// rows are replaced. Per-folder failures are logged and counted; they
/// never abort the scan.
pub async fn scan(
    store: &JobStore,
    root: &Path,
    force_folder: Option<&str>,
) -> Result<ScanReport, MoraqmanError> {
    if !root.is_dir() {
        return Err(MoraqmanError::RootNotFound {
            path: root.to_path_buf(),
        });
    }

    let mut folders: Vec<PathBuf> = std::fs::read_dir(root)
        .map_err(|e| MoraqmanError::Internal(format!("Failed to list '{}': {e}", root.display())))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    folders.sort();

    let mut report = ScanReport::default();

    for folder in folders {
        let folder_name = folder_name_of(&folder);
        if let Some(only) = force_folder {
            if folder_name != only {
                continue;
            }
        }
        let force = force_folder == Some(folder_name.as_str());

        match prepare_folder(store, &folder, force).await {
            Ok(PrepareOutcome::Prepared { jobs_created }) => {
                report.prepared += 1;
                info!("'{}': created {} jobs", folder_name, jobs_created);
            }
            Ok(PrepareOutcome::AlreadyRegistered { status }) => {
                report.skipped += 1;
                info!("'{}': already in store (status: {})", folder_name, status);
            }
            Ok(PrepareOutcome::AlreadyFinalized) => {
                report.skipped += 1;
                info!("'{}': already has final artifact", folder_name);
            }
            Ok(PrepareOutcome::NoPdf) => {
                report.skipped += 1;
                warn!("'{}': no PDF file found", folder_name);
            }
            Err(e) => {
                report.errors += 1;
                warn!("'{}': preparation failed: {}", folder_name, e);
            }
        }
    }

    Ok(report)
}
