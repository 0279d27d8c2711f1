//! Batch execution engine: submit claimed jobs to the OpenAI Batch API,
//! poll to completion, and import the results.
//!
//! One run claims up to `batch_size` jobs, renders their request lines into
//! an in-memory JSONL payload, uploads it, creates the batch, and polls at
//! `poll_interval` until the batch reaches a terminal state or `max_wait`
//! elapses. A timed-out batch is left submitted; a later `--resume` pass
//! picks it up. Failure, cancellation, and expiry all return the covered
//! jobs to the pending pool with their attempt counts untouched — batch
//! lifecycle errors attach to the batch row, never to the jobs.

use crate::api::OpenAiClient;
use crate::config::EngineConfig;
use crate::error::MoraqmanError;
use crate::pipeline::request::build_batch_line;
use crate::store::{BatchState, ClaimedJob, JobStore};
use std::collections::HashMap;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Outcome of one batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// No pending jobs matched the claim; the loop is done.
    NoJobs,
    /// Every claimed job failed request building; nothing was submitted.
    Skipped,
    /// The batch is still running after `max_wait`; left for a resume pass.
    Submitted { batch_id: String },
    /// Results downloaded and written to the jobs table.
    Imported { success: u32, failed: u32 },
    /// The batch ended without output; covered jobs were reset to pending.
    Reverted { state: BatchState, reset: usize },
}

/// Claim, submit, and drive one batch to a terminal state.
pub async fn run_batch_once(
    store: &JobStore,
    client: &OpenAiClient,
    config: &EngineConfig,
) -> Result<BatchOutcome, MoraqmanError> {
    let jobs = store.claim_pending_jobs(config.dict_filter.as_deref(), config.batch_size)?;
    if jobs.is_empty() {
        return Ok(BatchOutcome::NoJobs);
    }
    info!("Claimed {} jobs for batch submission", jobs.len());

    let (jsonl, submitted) = build_jsonl(store, &jobs, config).await?;
    if submitted.is_empty() {
        return Ok(BatchOutcome::Skipped);
    }

    let file_id = client.upload_batch_file(jsonl).await?;
    let remote = client.create_batch(&file_id).await?;
    info!("Created batch {} (status: {})", remote.id, remote.status);

    let job_ids: Vec<i64> = submitted.iter().map(|j| j.id).collect();
    store.create_batch(
        &remote.id,
        &file_id,
        BatchState::from_remote(&remote.status),
        &job_ids,
    )?;

    poll_batch(store, client, config, &remote.id, &job_ids).await
}

/// Render request lines for the claimed jobs into a JSONL payload.
///
/// A job whose pages cannot be rendered is recorded as failed and excluded;
/// one unreadable page never blocks the rest of the batch.
async fn build_jsonl(
    store: &JobStore,
    jobs: &[ClaimedJob],
    config: &EngineConfig,
) -> Result<(Vec<u8>, Vec<ClaimedJob>), MoraqmanError> {
    let mut jsonl = Vec::new();
    let mut submitted = Vec::with_capacity(jobs.len());

    for job in jobs {
        match build_batch_line(job, config).await {
            Ok(line) => {
                let serialized = serde_json::to_string(&line)
                    .map_err(|e| MoraqmanError::Internal(format!("JSONL encode failed: {e}")))?;
                jsonl.extend_from_slice(serialized.as_bytes());
                jsonl.push(b'\n');
                submitted.push(job.clone());
            }
            Err(e) => {
                warn!("Job {} ({}): request build failed: {}", job.id, job.custom_id(), e);
                store.record_job_failed(job.id, &e.to_string(), job.attempts + 1)?;
            }
        }
    }

    Ok((jsonl, submitted))
}

/// Poll a submitted batch until terminal or `max_wait` elapses, then apply
/// the terminal handling: import on completion, reset on anything else.
async fn poll_batch(
    store: &JobStore,
    client: &OpenAiClient,
    config: &EngineConfig,
    batch_id: &str,
    job_ids: &[i64],
) -> Result<BatchOutcome, MoraqmanError> {
    let started = Instant::now();

    loop {
        let remote = client.retrieve_batch(batch_id).await?;
        let state = BatchState::from_remote(&remote.status);
        store.update_batch_status(batch_id, state)?;

        info!(
            "Batch {}: {} ({}/{} done, {} failed, {}s elapsed)",
            batch_id,
            state,
            remote.request_counts.completed,
            remote.request_counts.total,
            remote.request_counts.failed,
            started.elapsed().as_secs()
        );

        if state == BatchState::Completed {
            let Some(output_file_id) = remote.output_file_id else {
                warn!("Batch {} completed without an output file", batch_id);
                let reset = store.reset_jobs_to_pending(job_ids)?;
                return Ok(BatchOutcome::Reverted { state, reset });
            };
            return import_batch(store, client, batch_id, job_ids, &output_file_id).await;
        }

        if state.reverts_jobs() {
            let reset = store.reset_jobs_to_pending(job_ids)?;
            warn!("Batch {} {}: reset {} jobs to pending", batch_id, state, reset);
            return Ok(BatchOutcome::Reverted { state, reset });
        }

        if started.elapsed().as_secs() >= config.max_wait_secs {
            info!(
                "Batch {} still {} after {}s; leaving it for --resume",
                batch_id, state, config.max_wait_secs
            );
            return Ok(BatchOutcome::Submitted {
                batch_id: batch_id.to_string(),
            });
        }

        sleep(Duration::from_secs(config.poll_interval_secs)).await;
    }
}

/// Download a completed batch's output and import it line by line.
async fn import_batch(
    store: &JobStore,
    client: &OpenAiClient,
    batch_id: &str,
    job_ids: &[i64],
    output_file_id: &str,
) -> Result<BatchOutcome, MoraqmanError> {
    let data = client.file_content(output_file_id).await?;
    let mapping = store.custom_id_mapping(job_ids)?;

    let (success, failed) = import_output(store, &mapping, &data)?;
    store.update_batch_status(batch_id, BatchState::Imported)?;
    info!("Batch {} imported: {} success, {} failed", batch_id, success, failed);

    refresh_affected_dictionaries(store, job_ids)?;
    Ok(BatchOutcome::Imported { success, failed })
}

/// Write batch output lines to the jobs table.
///
/// A line with a remote error or a non-200 status marks its job failed with
/// the message; otherwise the job completes with the model's content.
/// Unknown custom ids are logged and skipped.
pub fn import_output(
    store: &JobStore,
    mapping: &HashMap<String, i64>,
    data: &str,
) -> Result<(u32, u32), MoraqmanError> {
    let mut success = 0u32;
    let mut failed = 0u32;

    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: crate::pipeline::request::BatchOutputLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                warn!("Unparseable batch output line, skipping: {}", e);
                continue;
            }
        };

        let Some(&job_id) = mapping.get(&parsed.custom_id) else {
            warn!("Unknown custom_id in batch output: {}", parsed.custom_id);
            continue;
        };

        let (_, attempts, _) = store.job_state(job_id)?;

        // An error object fails the job even when a response body is also
        // present, and even when its message is null.
        if let Some(err) = parsed.error {
            let message = err.message.unwrap_or_else(|| "Unknown error".to_string());
            store.record_job_failed(job_id, &message, attempts + 1)?;
            failed += 1;
            continue;
        }

        match parsed.response {
            Some(response) if response.status_code == 200 => match response.body.content() {
                Some(content) => {
                    store.record_job_completed(job_id, content, attempts + 1)?;
                    success += 1;
                }
                None => {
                    store.record_job_failed(job_id, "No choices in response", attempts + 1)?;
                    failed += 1;
                }
            },
            Some(response) => {
                let message = format!("HTTP {}", response.status_code);
                store.record_job_failed(job_id, &message, attempts + 1)?;
                failed += 1;
            }
            None => {
                store.record_job_failed(job_id, "Unknown error", attempts + 1)?;
                failed += 1;
            }
        }
    }

    Ok((success, failed))
}

fn refresh_affected_dictionaries(store: &JobStore, _job_ids: &[i64]) -> Result<(), MoraqmanError> {
    // Job→dictionary fan-in is small; refreshing every dictionary keeps the
    // status column honest without tracking which ids belong where.
    for progress in store.dictionary_progress()? {
        if let Some((dict_id, _)) = store.dictionary_by_folder(&progress.folder_name)? {
            store.refresh_dictionary_status(dict_id)?;
        }
    }
    Ok(())
}

/// Repeatedly run batches until the pending pool drains.
///
/// Without `loop_mode` only one batch runs. `max_batches` bounds the loop
/// regardless.
pub async fn run_loop(
    store: &JobStore,
    client: &OpenAiClient,
    config: &EngineConfig,
    loop_mode: bool,
    max_batches: Option<u32>,
) -> Result<Vec<BatchOutcome>, MoraqmanError> {
    let mut outcomes = Vec::new();
    let limit = max_batches.unwrap_or(u32::MAX);

    while (outcomes.len() as u32) < limit {
        let outcome = run_batch_once(store, client, config).await?;
        let done = outcome == BatchOutcome::NoJobs;
        if !done {
            outcomes.push(outcome);
        }
        if done || !loop_mode {
            break;
        }
        if store.pending_job_count(config.dict_filter.as_deref())? == 0 {
            info!("All jobs processed");
            break;
        }
    }

    Ok(outcomes)
}

/// Re-poll every non-imported batch and apply its terminal handling.
///
/// Per-batch errors are logged and skipped so one unreachable batch does
/// not block importing the others.
pub async fn resume(store: &JobStore, client: &OpenAiClient) -> Result<u32, MoraqmanError> {
    let batches = store.unimported_batches()?;
    if batches.is_empty() {
        info!("No batches awaiting import");
        return Ok(0);
    }

    let mut handled = 0u32;
    for batch in batches {
        let remote = match client.retrieve_batch(&batch.id).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Batch {}: status check failed: {}", batch.id, e);
                continue;
            }
        };
        let state = BatchState::from_remote(&remote.status);
        info!(
            "Batch {}: {} ({}/{})",
            batch.id, state, remote.request_counts.completed, remote.request_counts.total
        );

        if state == BatchState::Completed {
            if let Some(output_file_id) = remote.output_file_id {
                match import_batch(store, client, &batch.id, &batch.job_ids, &output_file_id).await
                {
                    Ok(_) => handled += 1,
                    Err(e) => warn!("Batch {}: import failed: {}", batch.id, e),
                }
            }
        } else if state.reverts_jobs() {
            let reset = store.reset_jobs_to_pending(&batch.job_ids)?;
            store.update_batch_status(&batch.id, state)?;
            info!("Batch {} {}: reset {} jobs", batch.id, state, reset);
            handled += 1;
        } else {
            store.update_batch_status(&batch.id, state)?;
        }
    }

    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DictionaryMeta, JobStatus, JobStore};

    fn seeded_store(pages: u32) -> (JobStore, Vec<ClaimedJob>) {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(
                &DictionaryMeta {
                    folder_name: "alqab".to_string(),
                    name: "الألقاب".to_string(),
                    description: "test".to_string(),
                    prompt_name: "arabic_only_with_diacritics".to_string(),
                    context_pages: 1,
                    skip_pages: 0,
                    pdf_path: "/data/alqab/alqab.pdf".to_string(),
                    total_pages: pages,
                },
                false,
            )
            .unwrap();
        let jobs = store.claim_pending_jobs(None, pages as usize).unwrap();
        (store, jobs)
    }

    #[test]
    fn import_writes_success_and_failure_lines() {
        let (store, jobs) = seeded_store(3);
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        let mapping = store.custom_id_mapping(&ids).unwrap();

        let data = concat!(
            r#"{"custom_id":"alqab_page_1","response":{"status_code":200,"body":{"choices":[{"message":{"content":"{\"كلمة\":\"تعريف\"}"}}]}}}"#,
            "\n",
            r#"{"custom_id":"alqab_page_2","response":{"status_code":500,"body":{"choices":[]}},"error":null}"#,
            "\n",
            r#"{"custom_id":"alqab_page_3","response":null,"error":{"message":"content policy violation"}}"#,
            "\n",
        );

        let (success, failed) = import_output(&store, &mapping, data).unwrap();
        assert_eq!(success, 1);
        assert_eq!(failed, 2);

        let (status, attempts, _) = store.job_state(mapping["alqab_page_1"]).unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(attempts, 1);

        let (status, _, error) = store.job_state(mapping["alqab_page_3"]).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.as_deref(), Some("content policy violation"));
    }

    #[test]
    fn import_skips_unknown_custom_ids_and_garbage() {
        let (store, jobs) = seeded_store(1);
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        let mapping = store.custom_id_mapping(&ids).unwrap();

        let data = concat!(
            "not json at all\n",
            r#"{"custom_id":"other_dict_page_9","response":{"status_code":200,"body":{"choices":[{"message":{"content":"{}"}}]}}}"#,
            "\n",
        );

        let (success, failed) = import_output(&store, &mapping, data).unwrap();
        assert_eq!(success, 0);
        assert_eq!(failed, 0);

        let (status, _, _) = store.job_state(jobs[0].id).unwrap();
        assert_eq!(status, JobStatus::Processing);
    }

    #[test]
    fn missing_content_counts_as_failure() {
        let (store, jobs) = seeded_store(1);
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        let mapping = store.custom_id_mapping(&ids).unwrap();

        let data = r#"{"custom_id":"alqab_page_1","response":{"status_code":200,"body":{"choices":[]}}}"#;
        let (success, failed) = import_output(&store, &mapping, data).unwrap();
        assert_eq!((success, failed), (0, 1));

        let (status, _, error) = store.job_state(jobs[0].id).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.as_deref(), Some("No choices in response"));
    }

    #[test]
    fn error_object_wins_over_response_body() {
        let (store, jobs) = seeded_store(1);
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        let mapping = store.custom_id_mapping(&ids).unwrap();

        // A null-message error next to a healthy 200 body still fails the job.
        let data = r#"{"custom_id":"alqab_page_1","response":{"status_code":200,"body":{"choices":[{"message":{"content":"{}"}}]}},"error":{"message":null}}"#;
        let (success, failed) = import_output(&store, &mapping, data).unwrap();
        assert_eq!((success, failed), (0, 1));

        let (status, attempts, error) = store.job_state(jobs[0].id).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(attempts, 1);
        assert_eq!(error.as_deref(), Some("Unknown error"));
    }
}
