//! Realtime execution engine: synchronous chat completions with bounded
//! concurrency.
//!
//! Jobs are claimed through the same atomic pending→processing flip as the
//! batch engine, then processed by a `buffer_unordered` pool of workers.
//! Transient API failures (timeout, connection loss, 429, 5xx) retry in
//! place with linear backoff — `retry_base_secs × attempt`, capped at
//! `retry_max_secs` — indefinitely; the job simply waits out the outage.
//! Terminal failures (other 4xx, malformed responses) record the error on
//! the job and move on.

use crate::api::VisionApi;
use crate::config::EngineConfig;
use crate::error::{ApiError, MoraqmanError};
use crate::pipeline::request::{build_page_request, ChatBody};
use crate::progress::RunProgressCallback;
use crate::store::{ClaimedJob, JobStore};
use futures::{stream, StreamExt};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Totals from one realtime run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RealtimeReport {
    pub completed: u32,
    pub failed: u32,
}

/// Claim up to `max_jobs` (default: `batch_size`) pending jobs and process
/// them with `concurrency` workers.
///
/// `progress` receives per-job events as workers finish; pass
/// [`crate::progress::NoopProgressCallback`] when no reporting is needed.
pub async fn run_realtime(
    store: &JobStore,
    api: &dyn VisionApi,
    config: &EngineConfig,
    progress: &dyn RunProgressCallback,
) -> Result<RealtimeReport, MoraqmanError> {
    let limit = config.max_jobs.unwrap_or(config.batch_size);
    let jobs = store.claim_pending_jobs(config.dict_filter.as_deref(), limit)?;
    if jobs.is_empty() {
        info!("No pending jobs to process");
        return Ok(RealtimeReport::default());
    }
    info!(
        "Processing {} jobs with {} workers",
        jobs.len(),
        config.concurrency
    );
    let total = jobs.len();
    progress.on_run_start(total);

    let dict_ids: Vec<i64> = {
        let mut ids: Vec<i64> = jobs.iter().map(|j| j.dictionary_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };

    let results: Vec<Result<bool, MoraqmanError>> = stream::iter(
        jobs.into_iter()
            .map(|job| process_job(store, api, config, progress, job)),
    )
    .buffer_unordered(config.concurrency)
    .collect()
    .await;

    let mut report = RealtimeReport::default();
    for result in results {
        if result? {
            report.completed += 1;
        } else {
            report.failed += 1;
        }
    }

    for dict_id in dict_ids {
        store.refresh_dictionary_status(dict_id)?;
    }

    progress.on_run_complete(total, report.completed as usize);
    info!(
        "Realtime run finished: {} completed, {} failed",
        report.completed, report.failed
    );
    Ok(report)
}

/// Process one claimed job end to end. Returns whether it completed.
///
/// A request-build failure (unreadable page) is terminal for the job and
/// costs no API attempt.
async fn process_job(
    store: &JobStore,
    api: &dyn VisionApi,
    config: &EngineConfig,
    progress: &dyn RunProgressCallback,
    job: ClaimedJob,
) -> Result<bool, MoraqmanError> {
    progress.on_job_start(&job.folder_name, job.page_num);

    let body = match build_page_request(&job, config).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Job {} ({}): request build failed: {}", job.id, job.custom_id(), e);
            store.record_job_failed(job.id, &e.to_string(), job.attempts)?;
            progress.on_job_failed(&job.folder_name, job.page_num, &e.to_string());
            return Ok(false);
        }
    };

    let (result, attempts) = extract_with_retry(api, config, &body, job.attempts, &job).await;
    match result {
        Ok(content) => {
            debug!("Job {} ({}): completed in {} attempts", job.id, job.custom_id(), attempts);
            store.record_job_completed(job.id, &content, attempts)?;
            progress.on_job_done(&job.folder_name, job.page_num);
            Ok(true)
        }
        Err(e) => {
            warn!("Job {} ({}): terminal failure: {}", job.id, job.custom_id(), e);
            store.record_job_failed(job.id, &e.to_string(), attempts)?;
            progress.on_job_failed(&job.folder_name, job.page_num, &e.to_string());
            Ok(false)
        }
    }
}

/// Call the API, retrying transient failures in place with capped linear
/// backoff. Returns the final outcome and the cumulative attempt count
/// (prior attempts plus every call made here).
pub async fn extract_with_retry(
    api: &dyn VisionApi,
    config: &EngineConfig,
    body: &ChatBody,
    prior_attempts: u32,
    job: &ClaimedJob,
) -> (Result<String, ApiError>, u32) {
    let mut attempts = prior_attempts;
    let mut retry = 0u32;

    loop {
        attempts += 1;
        match api.extract(body).await {
            Ok(content) => return (Ok(content), attempts),
            Err(e) if e.is_transient() => {
                retry += 1;
                let backoff = config.backoff_secs(retry);
                warn!(
                    "Job {} ({}): transient error ({}), retrying in {}s",
                    job.id,
                    job.custom_id(),
                    e,
                    backoff
                );
                sleep(Duration::from_secs(backoff)).await;
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::Detail;
    use crate::pipeline::request::assemble_chat_body;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A stub API that replays a scripted sequence of outcomes.
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<String, ApiError>>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<String, ApiError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl VisionApi for ScriptedApi {
        async fn extract(&self, _body: &ChatBody) -> Result<String, ApiError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ApiError::InvalidResponse("script exhausted".into())))
        }
    }

    fn test_job() -> ClaimedJob {
        ClaimedJob {
            id: 7,
            dictionary_id: 1,
            page_num: 3,
            folder_name: "alqab".to_string(),
            pdf_path: "/data/alqab/alqab.pdf".to_string(),
            total_pages: 10,
            context_pages: 1,
            prompt_name: "arabic_only_with_diacritics".to_string(),
            attempts: 0,
        }
    }

    fn test_body() -> ChatBody {
        assemble_chat_body(
            "extract".to_string(),
            vec![("data:image/png;base64,AAAA".to_string(), Detail::High)],
            &EngineConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let api = ScriptedApi::new(vec![
            Err(ApiError::Timeout),
            Err(ApiError::Timeout),
            Err(ApiError::Timeout),
            Ok("{\"كلمة\":\"تعريف\"}".to_string()),
        ]);
        let config = EngineConfig::default();
        let job = test_job();

        let (result, attempts) =
            extract_with_retry(&api, &config, &test_body(), 0, &job).await;
        assert_eq!(result.unwrap(), "{\"كلمة\":\"تعريف\"}");
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried() {
        let api = ScriptedApi::new(vec![
            Err(ApiError::Status {
                code: 429,
                message: "slow down".into(),
            }),
            Ok("{}".to_string()),
        ]);
        let config = EngineConfig::default();
        let job = test_job();

        let (result, attempts) =
            extract_with_retry(&api, &config, &test_body(), 2, &job).await;
        assert!(result.is_ok());
        // Two prior attempts plus two calls here.
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn terminal_errors_stop_immediately() {
        let api = ScriptedApi::new(vec![Err(ApiError::Status {
            code: 400,
            message: "bad request".into(),
        })]);
        let config = EngineConfig::default();
        let job = test_job();

        let (result, attempts) =
            extract_with_retry(&api, &config, &test_body(), 0, &job).await;
        assert!(matches!(result, Err(ApiError::Status { code: 400, .. })));
        assert_eq!(attempts, 1);
    }
}
