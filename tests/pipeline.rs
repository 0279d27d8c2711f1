//! Integration tests for the store → import → finalize path.
//!
//! No network and no PDF rendering: jobs are created directly in an
//! in-memory store, batch output is fed in as canned JSONL, and the merge
//! runs against a tempdir output root.

use moraqman::store::DictionaryMeta;
use moraqman::{batch, finalize, JobStore};
use serde_json::{json, Value};
use std::collections::HashMap;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn meta(folder: &str, total_pages: u32, skip_pages: u32) -> DictionaryMeta {
    DictionaryMeta {
        folder_name: folder.to_string(),
        name: format!("معجم {folder}"),
        description: "اختبار".to_string(),
        prompt_name: "arabic_only_with_diacritics".to_string(),
        context_pages: 1,
        skip_pages,
        pdf_path: format!("{folder}/book.pdf"),
        total_pages,
    }
}

fn output_line(custom_id: &str, content: Value) -> String {
    json!({
        "custom_id": custom_id,
        "response": {
            "status_code": 200,
            "body": {
                "choices": [
                    {"message": {"content": content.to_string()}}
                ]
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn full_pipeline_from_jobs_to_artifact() {
    let store = JobStore::open_in_memory().expect("open store");
    let (dict_id, jobs_created) = store
        .create_dictionary_with_jobs(&meta("qamus_test", 3, 0), false)
        .expect("create dictionary");
    assert_eq!(jobs_created, 3);

    // Claim everything as a batch engine would and build the id mapping.
    let claimed = store.claim_pending_jobs(None, 10).expect("claim");
    assert_eq!(claimed.len(), 3);
    let mapping: HashMap<String, i64> =
        claimed.iter().map(|j| (j.custom_id(), j.id)).collect();

    // Page 2 continues page 1's last entry; page 3 repeats a headword with
    // a shorter definition that must lose.
    let jsonl = [
        output_line(
            "qamus_test_page_1",
            json!({"أَبّ (father)": "أَبّ\nالوالد"}),
        ),
        output_line(
            "qamus_test_page_2",
            json!({"__continuation__": "وأصل الكلمة", "أَثَر (trace)": "أَثَر\nبقية الشيء"}),
        ),
        output_line(
            "qamus_test_page_3",
            json!({"أَثَر (trace)": "أَثَر\nقصير"}),
        ),
    ]
    .join("\n");

    let (success, failed) = batch::import_output(&store, &mapping, &jsonl).expect("import");
    assert_eq!(success, 3);
    assert_eq!(failed, 0);

    store.refresh_dictionary_status(dict_id).expect("refresh");
    let progress = store.dictionary_progress().expect("progress");
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].done, 3);
    assert_eq!(progress[0].status, "completed");

    // Merge and write the artifact.
    let root = tempfile::tempdir().expect("tempdir");
    let outcomes = finalize::run(&store, root.path(), None, false)
        .await
        .expect("finalize");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].entries, 2);
    let artifact_path = outcomes[0].output_path.as_ref().expect("output path");
    assert_eq!(
        artifact_path,
        &root.path().join("qamus_test").join("qamus_test.json")
    );

    let artifact: Value =
        serde_json::from_str(&std::fs::read_to_string(artifact_path).expect("read artifact"))
            .expect("parse artifact");
    assert_eq!(artifact["type"], "moraqman");
    assert_eq!(artifact["name"], "معجم qamus_test");
    assert_eq!(artifact["description"], "اختبار");

    let data = artifact["data"].as_object().expect("data object");
    assert_eq!(data.len(), 2);
    // Continuation appended to page 1's last entry with a joining space.
    assert_eq!(data["أَبّ (father)"], "أَبّ\nالوالد وأصل الكلمة");
    // The longer definition from page 2 survives page 3's repeat.
    assert_eq!(data["أَثَر (trace)"], "أَثَر\nبقية الشيء");

    // The dictionary is finalized with a completion timestamp.
    let (_, status) = store
        .dictionary_by_folder("qamus_test")
        .expect("lookup")
        .expect("dictionary exists");
    assert_eq!(status, "finalized");
    assert!(store
        .dictionary_completed_at(dict_id)
        .expect("timestamp lookup")
        .is_some());
}

#[tokio::test]
async fn failed_pages_do_not_block_partial_finalization() {
    let store = JobStore::open_in_memory().expect("open store");
    let (dict_id, _) = store
        .create_dictionary_with_jobs(&meta("naqis", 2, 0), false)
        .expect("create dictionary");

    let claimed = store.claim_pending_jobs(None, 10).expect("claim");
    let mapping: HashMap<String, i64> =
        claimed.iter().map(|j| (j.custom_id(), j.id)).collect();

    let jsonl = [
        output_line("naqis_page_1", json!({"باب (chapter)": "باب\nمدخل"})),
        json!({
            "custom_id": "naqis_page_2",
            "error": {"message": "Rate limit reached"}
        })
        .to_string(),
    ]
    .join("\n");

    let (success, failed) = batch::import_output(&store, &mapping, &jsonl).expect("import");
    assert_eq!(success, 1);
    assert_eq!(failed, 1);

    store.refresh_dictionary_status(dict_id).expect("refresh");

    // One completed page is enough to merge; the dictionary stays partial
    // until the failed page is retried, but the artifact is still written.
    let root = tempfile::tempdir().expect("tempdir");
    let outcomes = finalize::run(&store, root.path(), None, false)
        .await
        .expect("finalize");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].entries, 1);
    assert!(outcomes[0].output_path.as_ref().expect("path").exists());
}

#[tokio::test]
async fn dry_run_previews_without_writing() {
    let store = JobStore::open_in_memory().expect("open store");
    let (dict_id, _) = store
        .create_dictionary_with_jobs(&meta("muswada", 1, 0), false)
        .expect("create dictionary");

    let claimed = store.claim_pending_jobs(None, 10).expect("claim");
    let mapping: HashMap<String, i64> =
        claimed.iter().map(|j| (j.custom_id(), j.id)).collect();
    let jsonl = output_line("muswada_page_1", json!({"عين (eye)": "عين\nعضو البصر"}));
    batch::import_output(&store, &mapping, &jsonl).expect("import");

    let root = tempfile::tempdir().expect("tempdir");
    let outcomes = finalize::run(&store, root.path(), None, true)
        .await
        .expect("finalize");
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].output_path.is_none());
    assert_eq!(outcomes[0].samples.len(), 1);
    assert!(!root.path().join("muswada").exists());

    // Status untouched on dry runs, so the folder stays a candidate.
    let (_, status) = store
        .dictionary_by_folder("muswada")
        .expect("lookup")
        .expect("dictionary exists");
    assert_ne!(status, "finalized");
    assert!(store
        .dictionary_completed_at(dict_id)
        .expect("timestamp lookup")
        .is_none());
}
