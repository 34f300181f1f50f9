mod catalog;
mod exercises;
mod friendly;
mod lang;
mod lint;
mod redis_manager;
mod session;
mod steps;
mod worker;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::redis_manager::{RedisManager, ResultPublisher};
use crate::session::{SessionManager, INTERNAL_ERROR_MESSAGE};
use crate::worker::protocol::{SourceTag, TaskOutcome, TaskSpec, WorkerEvent};

/// Job received from the Redis queue: one learner submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionJob {
    pub submission_id: i64,
    pub session_key: String,
    pub page_slug: String,
    pub step_name: String,
    /// The submitted text: a whole program or a single shell line.
    pub input: String,
    pub source: SourceTag,
    /// Abort the session's pending interactive run instead of running
    /// `input`.
    #[serde(default)]
    pub cancel: bool,
}

/// Terminal result of handling a submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: i64,
    pub session_key: String,
    pub passed: bool,
    /// The run is blocked on input(); send the next line to continue.
    pub awaiting_input: bool,
    pub messages: Vec<String>,
    pub passed_tests: Vec<String>,
    pub lint: Vec<String>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
    /// Diagnostic detail for engine-side failures (not learner-facing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn main() -> Result<()> {
    // The same executable runs as the grading service (default) or as a
    // sandboxed worker child (--worker).
    if std::env::args().any(|arg| arg == "--worker") {
        return worker::worker_main();
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(service_main())
}

async fn service_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("tutor=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    catalog::init_from_env()?;
    info!(
        "Loaded course catalog with pages: {}",
        catalog::page_slugs().join(", ")
    );

    let session_config = session::SessionConfig::from_env()?;
    info!(
        "Worker program: {:?}, task timeout: {:?}",
        session_config.worker_program, session_config.task_timeout
    );
    let session_store = std::sync::Arc::new(session::SessionStore::new());
    let manager = std::sync::Arc::new(SessionManager::new(session_config, session_store));

    let mut redis = RedisManager::from_env().await?;

    info!("Waiting for submissions...");

    loop {
        let job = redis.pop_job().await?;
        info!(
            "Received submission: id={}, session={}, step={}/{}",
            job.submission_id, job.session_key, job.page_slug, job.step_name
        );

        let manager = manager.clone();
        let publisher = redis.publisher();
        tokio::spawn(async move {
            let submission_id = job.submission_id;
            let session_key = job.session_key.clone();
            match process_submission(&manager, publisher.clone(), job).await {
                Ok(result) => {
                    info!(
                        "Submission completed: id={}, passed={}, awaiting_input={}",
                        result.submission_id, result.passed, result.awaiting_input
                    );
                    store(publisher, &result).await;
                }
                Err(e) => {
                    error!("Failed to process submission {}: {:#}", submission_id, e);
                    let result = internal_error_result(
                        submission_id,
                        &session_key,
                        &format!("{:#}", e),
                    );
                    store(publisher, &result).await;
                }
            }
        });
    }
}

async fn process_submission(
    manager: &SessionManager,
    mut publisher: ResultPublisher,
    job: SubmissionJob,
) -> Result<SubmissionResult> {
    let mut events = if job.cancel {
        manager.cancel(&job.session_key)
    } else {
        let task = TaskSpec {
            code: job.input.clone(),
            source: job.source,
            page_slug: job.page_slug.clone(),
            step_name: job.step_name.clone(),
        };
        manager.submit(&job.session_key, task)
    };
    let mut terminal = None;
    while let Some(event) = events.recv().await {
        if let Err(e) = publisher.publish_event(&job.session_key, &event).await {
            warn!("Failed to publish event: {:#}", e);
        }
        if event.is_terminal() {
            terminal = Some(event);
        }
    }

    let result = match terminal {
        Some(WorkerEvent::Completed(outcome)) => result_from_outcome(&job, outcome),
        Some(WorkerEvent::InputRequest) => SubmissionResult {
            submission_id: job.submission_id,
            session_key: job.session_key.clone(),
            passed: false,
            awaiting_input: true,
            messages: Vec::new(),
            passed_tests: Vec::new(),
            lint: Vec::new(),
            output: String::new(),
            trace: None,
            error: None,
        },
        Some(WorkerEvent::InternalError { details }) => {
            error!(
                "Worker internal error for submission {}: {}",
                job.submission_id, details
            );
            internal_error_result(job.submission_id, &job.session_key, &details)
        }
        // Cancelling an idle session produces no events at all.
        None if job.cancel => SubmissionResult {
            submission_id: job.submission_id,
            session_key: job.session_key.clone(),
            passed: false,
            awaiting_input: false,
            messages: Vec::new(),
            passed_tests: Vec::new(),
            lint: Vec::new(),
            output: String::new(),
            trace: None,
            error: None,
        },
        _ => internal_error_result(
            job.submission_id,
            &job.session_key,
            "event stream ended without a terminal event",
        ),
    };
    Ok(result)
}

fn result_from_outcome(job: &SubmissionJob, outcome: TaskOutcome) -> SubmissionResult {
    SubmissionResult {
        submission_id: job.submission_id,
        session_key: job.session_key.clone(),
        passed: outcome.passed,
        awaiting_input: false,
        messages: outcome.messages,
        passed_tests: outcome.passed_tests,
        lint: outcome.lint,
        output: outcome.output,
        trace: outcome.trace,
        error: None,
    }
}

fn internal_error_result(
    submission_id: i64,
    session_key: &str,
    details: &str,
) -> SubmissionResult {
    SubmissionResult {
        submission_id,
        session_key: session_key.to_string(),
        passed: false,
        awaiting_input: false,
        messages: vec![INTERNAL_ERROR_MESSAGE.to_string()],
        passed_tests: Vec::new(),
        lint: Vec::new(),
        output: String::new(),
        trace: None,
        error: Some(details.to_string()),
    }
}

async fn store(mut publisher: ResultPublisher, result: &SubmissionResult) {
    if let Err(e) = publisher.store_result(result).await {
        error!(
            "Failed to store result for submission {}: {:#}",
            result.submission_id, e
        );
    }
}
