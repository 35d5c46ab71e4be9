//! Environment provisioning and release.
//!
//! Environments are produced asynchronously by an external environment
//! provider. The [`EnvironmentProvider`] trait abstracts the two ways the
//! runner talks to it:
//!
//! - [`http::HttpEnvironmentProvider`] — the direct HTTP API with a task-id
//!   handoff (request, poll, release).
//! - [`cluster::ClusterEnvironmentProvider`] — operator mode, where an
//!   external controller owns the requests and the runner watches
//!   `EnvironmentRequest` resources and deletes `Environment` resources.
//!
//! The [`EnvironmentRequester`] is the background task that drives
//! provisioning to a terminal state, reporting through the shared
//! [`EnvironmentStatusHandle`]. Suite orchestrators read that status while
//! they wait for environments to appear on the bus.

pub mod cluster;
pub mod http;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::{Deadline, TaskContext};
use crate::executor::SubSuiteDefinition;

/// Errors from talking to the environment provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider could not be reached.
    #[error("Environment provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The Kubernetes API rejected a call (operator mode).
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The provider responded, but with an error.
    #[error("{0}")]
    Response(String),
}

/// Provisioning state of the environment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    NotStarted,
    Pending,
    Success,
    Failure,
}

/// Snapshot of the provider status.
#[derive(Debug, Clone)]
pub struct EnvironmentStatus {
    pub state: EnvironmentState,
    pub error: Option<String>,
    /// Task id from the direct-mode handoff, when there is one.
    pub task_id: Option<String>,
}

/// Shared, mutex-guarded environment status.
///
/// All writes go through [`set_status`](Self::set_status); a SUCCESS never
/// overwrites a FAILURE.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentStatusHandle {
    inner: Arc<Mutex<StatusInner>>,
}

#[derive(Debug)]
struct StatusInner {
    state: EnvironmentState,
    error: Option<String>,
    task_id: Option<String>,
}

impl Default for StatusInner {
    fn default() -> Self {
        Self {
            state: EnvironmentState::NotStarted,
            error: None,
            task_id: None,
        }
    }
}

impl EnvironmentStatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the current status.
    pub fn get(&self) -> EnvironmentStatus {
        let inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        EnvironmentStatus {
            state: inner.state,
            error: inner.error.clone(),
            task_id: inner.task_id.clone(),
        }
    }

    /// Sets the provider status.
    pub fn set_status(&self, state: EnvironmentState, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        if inner.state == EnvironmentState::Failure && state == EnvironmentState::Success {
            warn!("Ignoring SUCCESS status write after FAILURE");
            return;
        }
        debug!(?state, ?error, "Setting environment status");
        inner.state = state;
        inner.error = error;
    }

    /// Remembers the direct-mode task id.
    pub fn set_task_id(&self, task_id: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        inner.task_id = Some(task_id);
    }
}

/// Provisioning progress as observed from the provider.
#[derive(Debug, Clone)]
pub enum Provisioning {
    Pending,
    Ready,
    Failed(String),
}

/// Capability to request and release test environments.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// The main suite ids to correlate environments with, one per suite.
    ///
    /// Direct providers generate them; in operator mode they come from the
    /// `EnvironmentRequest` resources the controller created.
    async fn main_suite_ids(
        &self,
        testrun_id: &str,
        suite_count: usize,
    ) -> Result<Vec<String>, ProviderError>;

    /// Issues the environment request. Returns the provider task id when the
    /// handoff produces one.
    async fn start(
        &self,
        testrun_id: &str,
        main_suite_ids: &[String],
    ) -> Result<Option<String>, ProviderError>;

    /// Observes provisioning progress.
    async fn check(&self, testrun_id: &str) -> Result<Provisioning, ProviderError>;

    /// Releases the environment bound to one sub suite. Idempotent.
    async fn release_sub_suite(
        &self,
        testrun_id: &str,
        definition: &SubSuiteDefinition,
    ) -> Result<(), ProviderError>;

    /// Releases every environment reservation tied to the testrun. Idempotent.
    async fn release_all(&self, testrun_id: &str) -> Result<(), ProviderError>;
}

/// Background task driving the environment provider to a terminal state.
pub struct EnvironmentRequester {
    provider: Arc<dyn EnvironmentProvider>,
    status: EnvironmentStatusHandle,
    ctx: TaskContext,
    timeout: Duration,
    poll_interval: Duration,
}

impl EnvironmentRequester {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        status: EnvironmentStatusHandle,
        ctx: TaskContext,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            provider,
            status,
            ctx,
            timeout,
            poll_interval,
        }
    }

    /// Issues the environment request.
    ///
    /// Failures are recorded on the status handle, never returned: the suite
    /// orchestrators pick them up from there.
    pub async fn issue(&self, testrun_id: &str, main_suite_ids: &[String]) {
        let span = tracing::info_span!(
            "request_environment",
            otel.kind = "client",
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        async {
            self.status.set_status(EnvironmentState::Pending, None);
            match self.provider.start(testrun_id, main_suite_ids).await {
                Ok(Some(task_id)) => {
                    debug!(task_id, "Environment request accepted");
                    self.status.set_task_id(task_id);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(
                        error = %err,
                        "Environment provider has failed in creating an environment for test"
                    );
                    crate::telemetry::record_error(
                        &tracing::Span::current(),
                        "EnvironmentProviderError",
                        &err,
                    );
                    self.status
                        .set_status(EnvironmentState::Failure, Some(err.to_string()));
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Polls the provider until it reaches a terminal state, the timeout
    /// expires, or the testrun is cancelled.
    pub async fn watch(self, testrun_id: String) {
        let span = tracing::info_span!(
            "environment_request",
            otel.kind = "client",
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        self.ctx.reinstate(&span);
        async move {
            let deadline = Deadline::after(self.timeout);
            loop {
                if self.ctx.tick(self.poll_interval).await.is_err() {
                    return;
                }
                if matches!(
                    self.status.get().state,
                    EnvironmentState::Success | EnvironmentState::Failure
                ) {
                    return;
                }
                if deadline.expired() {
                    self.status.set_status(
                        EnvironmentState::Failure,
                        Some(format!(
                            "Timed out after {} seconds waiting for environments",
                            self.timeout.as_secs()
                        )),
                    );
                    return;
                }
                match self.provider.check(&testrun_id).await {
                    Ok(Provisioning::Pending) => {}
                    Ok(Provisioning::Ready) => {
                        info!("Environment provider has finished creating an environment for test");
                        self.status.set_status(EnvironmentState::Success, None);
                        return;
                    }
                    Ok(Provisioning::Failed(message)) => {
                        error!(
                            message,
                            "Environment provider has failed in creating an environment for test"
                        );
                        crate::telemetry::record_error(
                            &tracing::Span::current(),
                            "EnvironmentProviderError",
                            &message,
                        );
                        self.status
                            .set_status(EnvironmentState::Failure, Some(message));
                        return;
                    }
                    Err(err) => {
                        // Transient provider errors are retried until the deadline.
                        warn!(error = %err, "Failed to check environment request status");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
