//! Result finalization: merge per-page extraction payloads into one unified
//! dictionary artifact.
//!
//! Page payloads arrive in two shapes depending on the prompt template: a
//! JSON array of term entries (bilingual layouts) or a JSON object keyed by
//! headword (Arabic-only layouts). Model output is not perfectly disciplined,
//! so decoding also unwraps the wrapper keys the model occasionally invents
//! and promotes a bare single-entry object to a one-element array.
//!
//! Merging is order-sensitive: pages are processed in page order, a
//! `__continuation__` payload appends to the last key inserted by the
//! previous page, keyed duplicates keep the longer definition, and array
//! entries strictly overwrite (a later page's rendering of a term is assumed
//! more complete).

use crate::error::MoraqmanError;
use crate::store::{FinalizeCandidate, JobStore};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Wrapper keys the model sometimes nests its array under.
const WRAPPER_KEYS: &[&str] = &["data", "entries", "json", "result", "array", "json_array"];

const CONTINUATION_KEY: &str = "__continuation__";

/// One entry of an array-form payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TermEntry {
    #[serde(default)]
    pub english: Option<String>,
    #[serde(default)]
    pub arabic: Option<String>,
    #[serde(default)]
    pub arabic_term: Option<String>,
    #[serde(default)]
    pub is_continuation: bool,
}

/// A decoded page payload, normalised to one of the two template shapes.
#[derive(Debug, Clone)]
pub enum PagePayload {
    /// Array form: bilingual term entries.
    Entries(Vec<TermEntry>),
    /// Object form: headword → definition, with the continuation marker
    /// split out.
    Keyed {
        continuation: Option<String>,
        entries: Vec<(String, String)>,
    },
}

/// Normalise a raw page payload.
///
/// Returns `None` for payloads that carry no entries: error objects the
/// model emitted instead of data, or shapes with nothing usable in them.
pub fn decode_payload(value: Value) -> Option<PagePayload> {
    let value = match value {
        Value::Object(map) => {
            if map.contains_key("error") {
                return None;
            }

            let mut unwrapped = None;
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(items)) = map.get(*key) {
                    unwrapped = Some(Value::Array(items.clone()));
                    break;
                }
            }

            match unwrapped {
                Some(array) => array,
                // A bare entry object is a one-element array in disguise.
                None if map.contains_key("arabic_term") => {
                    Value::Array(vec![Value::Object(map)])
                }
                None => Value::Object(map),
            }
        }
        other => other,
    };

    match value {
        Value::Array(items) => {
            let entries = items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect();
            Some(PagePayload::Entries(entries))
        }
        Value::Object(map) => {
            let mut continuation = None;
            let mut entries = Vec::with_capacity(map.len());
            for (key, val) in map {
                let text = match val {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                if key == CONTINUATION_KEY {
                    continuation = Some(text);
                } else {
                    entries.push((key, text));
                }
            }
            Some(PagePayload::Keyed {
                continuation,
                entries,
            })
        }
        _ => None,
    }
}

/// Merge decoded pages, in page order, into one term→definition map.
pub fn merge_pages(pages: Vec<(u32, PagePayload)>) -> Map<String, Value> {
    let mut merged: Map<String, Value> = Map::new();
    let mut last_key: Option<String> = None;

    for (page_num, payload) in pages {
        match payload {
            PagePayload::Entries(entries) => {
                for entry in entries {
                    // Continuation fragments in array form belong to an
                    // entry already emitted with its full text.
                    if entry.is_continuation {
                        continue;
                    }
                    let term = match entry.arabic_term.as_deref() {
                        Some(t) if !t.is_empty() => t,
                        _ => continue,
                    };
                    let english = entry.english.as_deref().unwrap_or("");
                    let arabic = entry.arabic.as_deref().unwrap_or("");

                    let (key, value) = if !english.is_empty() {
                        let value = if !arabic.is_empty() {
                            format!("{term}\n{arabic}")
                        } else {
                            term.to_string()
                        };
                        (format!("{term} ({english})"), value)
                    } else {
                        (term.to_string(), arabic.to_string())
                    };

                    merged.insert(key.clone(), Value::String(value));
                    last_key = Some(key);
                }
            }
            PagePayload::Keyed {
                continuation,
                entries,
            } => {
                if let Some(text) = continuation {
                    if let Some(key) = last_key.as_ref() {
                        if let Some(Value::String(existing)) = merged.get_mut(key) {
                            existing.push(' ');
                            existing.push_str(&text);
                            debug!("Page {}: merged continuation into '{}'", page_num, key);
                        }
                    }
                }

                for (key, value) in entries {
                    match merged.get(&key) {
                        Some(Value::String(existing)) if existing.len() >= value.len() => {
                            // Duplicate headword: the longer definition wins.
                        }
                        _ => {
                            merged.insert(key.clone(), Value::String(value));
                        }
                    }
                    last_key = Some(key);
                }
            }
        }
    }

    merged
}

/// Outcome of finalizing one dictionary.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub folder_name: String,
    pub entries: usize,
    /// First few merged entries, for dry-run preview.
    pub samples: Vec<(String, String)>,
    /// Where the artifact was written; `None` on dry runs.
    pub output_path: Option<PathBuf>,
}

/// Merge a dictionary's completed pages and write its unified artifact.
///
/// With `dry_run` the merge still happens (and samples are returned) but
/// nothing is written and the dictionary status is untouched.
pub async fn finalize_dictionary(
    store: &JobStore,
    candidate: &FinalizeCandidate,
    output_root: &Path,
    dry_run: bool,
) -> Result<FinalizeOutcome, MoraqmanError> {
    let payloads = store.completed_page_payloads(candidate.id)?;
    info!(
        "'{}': merging {} pages ({}/{} completed)",
        candidate.folder_name,
        payloads.len(),
        candidate.completed_pages,
        candidate.total_pages
    );

    let mut decoded = Vec::with_capacity(payloads.len());
    for (page_num, raw) in payloads {
        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => {
                warn!("'{}' page {}: invalid JSON, skipping", candidate.folder_name, page_num);
                continue;
            }
        };
        if let Some(payload) = decode_payload(value) {
            decoded.push((page_num, payload));
        } else {
            warn!("'{}' page {}: no usable entries, skipping", candidate.folder_name, page_num);
        }
    }

    let merged = merge_pages(decoded);
    let samples = merged
        .iter()
        .take(3)
        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
        .collect();

    let outcome_entries = merged.len();
    if dry_run {
        return Ok(FinalizeOutcome {
            folder_name: candidate.folder_name.clone(),
            entries: outcome_entries,
            samples,
            output_path: None,
        });
    }

    let artifact = serde_json::json!({
        "name": candidate.name,
        "description": candidate.description,
        "type": "moraqman",
        "data": Value::Object(merged),
    });

    let output_path = output_root
        .join(&candidate.folder_name)
        .join(format!("{}.json", candidate.folder_name));
    write_artifact(&output_path, &artifact)?;
    store.mark_dictionary_finalized(candidate.id)?;
    info!(
        "'{}': wrote {} entries to {}",
        candidate.folder_name,
        outcome_entries,
        output_path.display()
    );

    Ok(FinalizeOutcome {
        folder_name: candidate.folder_name.clone(),
        entries: outcome_entries,
        samples,
        output_path: Some(output_path),
    })
}

/// Write the artifact atomically: temp file in the same directory, then
/// rename over the final path.
fn write_artifact(path: &Path, artifact: &Value) -> Result<(), MoraqmanError> {
    let io_err = |source: std::io::Error| MoraqmanError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let pretty = serde_json::to_string_pretty(artifact)
        .map_err(|e| MoraqmanError::Internal(format!("Artifact serialisation failed: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, pretty).map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

/// Finalize every eligible dictionary. Per-dictionary failures are logged
/// and counted; they never abort the pass.
pub async fn run(
    store: &JobStore,
    output_root: &Path,
    dict_filter: Option<&str>,
    dry_run: bool,
) -> Result<Vec<FinalizeOutcome>, MoraqmanError> {
    let candidates = store.finalize_candidates(dict_filter)?;
    if candidates.is_empty() {
        info!("No dictionaries ready to finalize");
        return Ok(Vec::new());
    }

    let mut outcomes = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match finalize_dictionary(store, &candidate, output_root, dry_run).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!("'{}': finalization failed: {}", candidate.folder_name, e),
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(value: Value) -> PagePayload {
        decode_payload(value).expect("payload should decode")
    }

    #[test]
    fn continuation_appends_to_last_entry() {
        let pages = vec![
            (1, page(json!({"a": "foo"}))),
            (2, page(json!({"__continuation__": "bar", "b": "baz"}))),
        ];
        let merged = merge_pages(pages);
        assert_eq!(merged["a"], "foo bar");
        assert_eq!(merged["b"], "baz");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn continuation_without_predecessor_is_dropped() {
        let pages = vec![(1, page(json!({"__continuation__": "orphan", "a": "x"})))];
        let merged = merge_pages(pages);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["a"], "x");
    }

    #[test]
    fn duplicate_keys_keep_longer_definition() {
        let pages = vec![
            (1, page(json!({"كلمة": "تعريف طويل ومفصل جدا"}))),
            (2, page(json!({"كلمة": "قصير"}))),
        ];
        let merged = merge_pages(pages);
        assert_eq!(merged["كلمة"], "تعريف طويل ومفصل جدا");

        let pages = vec![
            (1, page(json!({"كلمة": "قصير"}))),
            (2, page(json!({"كلمة": "تعريف طويل ومفصل جدا"}))),
        ];
        let merged = merge_pages(pages);
        assert_eq!(merged["كلمة"], "تعريف طويل ومفصل جدا");
    }

    #[test]
    fn array_entries_strictly_overwrite() {
        let pages = vec![
            (
                1,
                page(json!([{"english": "flow", "arabic": "long long definition", "arabic_term": "تدفق"}])),
            ),
            (
                2,
                page(json!([{"english": "flow", "arabic": "short", "arabic_term": "تدفق"}])),
            ),
        ];
        let merged = merge_pages(pages);
        // Later page wins regardless of length.
        assert_eq!(merged["تدفق (flow)"], "تدفق\nshort");
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn array_entry_key_formats() {
        let pages = vec![(
            1,
            page(json!([
                {"english": "flow", "arabic": "def", "arabic_term": "تدفق"},
                {"english": "", "arabic": "تعريف", "arabic_term": "مصطلح"},
                {"english": "bare", "arabic": "", "arabic_term": "عاري"},
                {"english": "x", "arabic": "y", "arabic_term": ""},
                {"english": "skip", "arabic": "z", "arabic_term": "مكرر", "is_continuation": true}
            ])),
        )];
        let merged = merge_pages(pages);
        assert_eq!(merged["تدفق (flow)"], "تدفق\ndef");
        assert_eq!(merged["مصطلح"], "تعريف");
        assert_eq!(merged["عاري (bare)"], "عاري");
        // Empty terms and continuation-flagged entries are dropped.
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn wrapper_keys_are_unwrapped() {
        for wrapper in ["data", "entries", "json", "result", "array", "json_array"] {
            let value = json!({ wrapper: [{"english": "a", "arabic": "b", "arabic_term": "ت"}] });
            match decode_payload(value) {
                Some(PagePayload::Entries(entries)) => assert_eq!(entries.len(), 1),
                other => panic!("wrapper '{wrapper}' not unwrapped: {other:?}"),
            }
        }
    }

    #[test]
    fn single_entry_object_is_promoted() {
        let value = json!({"english": "a", "arabic": "b", "arabic_term": "ت"});
        match decode_payload(value) {
            Some(PagePayload::Entries(entries)) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].arabic_term.as_deref(), Some("ت"));
            }
            other => panic!("single entry not promoted: {other:?}"),
        }
    }

    #[test]
    fn error_payload_is_skipped() {
        assert!(decode_payload(json!({"error": "model refused"})).is_none());
        assert!(decode_payload(json!("just a string")).is_none());
    }

    #[test]
    fn merged_map_preserves_page_order() {
        let pages = vec![
            (1, page(json!({"ب": "2", "أ": "1"}))),
            (2, page(json!({"ج": "3"}))),
        ];
        let merged = merge_pages(pages);
        let keys: Vec<&String> = merged.keys().collect();
        assert_eq!(keys, ["ب", "أ", "ج"]);
    }
}
