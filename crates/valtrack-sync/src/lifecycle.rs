//! Job lifecycle: guaranteed cleanup and a uniform execution record.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use valtrack_core::{JobExecutionRecord, JobStatus};

type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Release actions registered during setup, run last-in first-out.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupStack {
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.actions
            .push((name.into(), Box::new(move || Box::pin(action()) as CleanupFuture)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every action in reverse registration order. A failing or
    /// panicking action is logged and the rest still run. Returns the number
    /// of actions that failed.
    pub async fn unwind(mut self) -> usize {
        let mut failures = 0;
        while let Some((name, action)) = self.actions.pop() {
            if let Err(err) = guarded(action()).await {
                failures += 1;
                warn!(cleanup = %name, error = %format!("{err:#}"), "cleanup action failed");
            }
        }
        failures
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("actions", &self.actions.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

/// One unit of scheduled work.
///
/// Hooks run in this order: `setup`, `pre_run`, `run`, `post_run`, then the
/// cleanup actions `setup` registered. Only `run` is required.
#[async_trait]
pub trait Job: Send {
    type Output: Serialize + Send;

    fn job_id(&self) -> &str;

    async fn setup(&mut self, _cleanup: &mut CleanupStack) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_run(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&mut self) -> anyhow::Result<Self::Output>;

    /// Called after the job reached a terminal status. Errors are logged only.
    async fn post_run(&mut self, _status: JobStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn guarded<T, F>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn advance(status: &mut JobStatus, next: JobStatus) {
    debug_assert!(status.can_transition_to(next), "{status} -> {next}");
    *status = next;
}

async fn drive<J: Job>(job: &mut J, cleanup: &mut CleanupStack, status: &mut JobStatus) -> anyhow::Result<JsonValue> {
    guarded(job.setup(cleanup))
        .await
        .map_err(|err| err.context("setup failed"))?;
    guarded(job.pre_run())
        .await
        .map_err(|err| err.context("pre-run hook failed"))?;

    advance(status, JobStatus::Running);
    info!("job running");
    let output = guarded(job.run()).await?;
    Ok(serde_json::to_value(output)?)
}

/// Execute one job invocation. Never fails: every error lands in the
/// returned record with status `FAILED`.
pub async fn execute<J: Job>(job: &mut J) -> JobExecutionRecord {
    let job_id = job.job_id().to_string();
    let run_id = Uuid::new_v4();
    let span = info_span!("job", job_id = %job_id, %run_id);

    async move {
        let started_at = Utc::now();
        let mut status = JobStatus::Pending;
        let mut cleanup = CleanupStack::default();

        let (result, error) = match drive(job, &mut cleanup, &mut status).await {
            Ok(result) => {
                advance(&mut status, JobStatus::Completed);
                (result, None)
            }
            Err(err) => {
                advance(&mut status, JobStatus::Failed);
                let message = format!("{err:#}");
                error!(error = %message, "job failed");
                (json!({}), Some(message))
            }
        };

        if let Err(err) = guarded(job.post_run(status)).await {
            warn!(error = %format!("{err:#}"), "post-run hook failed");
        }
        cleanup.unwind().await;

        let finished_at = Utc::now();
        let duration_seconds = (finished_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        info!(%status, duration_seconds, "job finished");

        JobExecutionRecord {
            job_id,
            run_id,
            status,
            started_at,
            finished_at,
            duration_seconds,
            result,
            error,
        }
    }
    .instrument(span)
    .await
}
