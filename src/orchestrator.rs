//! Per-suite orchestration engine.
//!
//! One [`SuiteOrchestrator`] drives one main suite end-to-end:
//!
//! ```text
//!   SuiteOrchestrator                 Event bus                 Workers
//!        │                               │                        │
//!        │ TestSuiteStarted ────────────►│                        │
//!        │                               │                        │
//!        │ environment discovery loop    │                        │
//!        │   activityTriggered? ────────►│                        │
//!        │   environmentDefined? ───────►│                        │
//!        │      │ (per new environment)  │                        │
//!        │      └── download definition, spawn ──────────────────►│ SubSuiteWorker
//!        │   activityFinished? ─────────►│                        │
//!        │                               │                        │
//!        │ join workers ◄────────────────────────────────────────┘
//!        │                               │
//!        │ TestSuiteFinished(verdict) ──►│
//!        │ release remaining sub suites  │
//! ```
//!
//! Workers are spawned while discovery is still running, so early
//! environments start executing before late ones exist. The discovery loop
//! is bounded by the environment timeout and observes both cancellation and
//! the shared provider status.

pub mod sub_suite;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::task::JoinSet;
use tracing::{error, info, Instrument};

use crate::context::{Deadline, TaskContext};
use crate::environment::{EnvironmentProvider, EnvironmentState, EnvironmentStatusHandle};
use crate::events::{self, EventPublisher};
use crate::executor::ExecutorClient;
use crate::params::Parameters;
use crate::query::{ActivityFinished, ActivityTriggered, EnvironmentDefined, EventQuery};
use crate::tercc::Suite;
use crate::verdict::{assess, SuiteAssessment, SuiteResult};
use crate::Error;

pub use sub_suite::{ReleaseState, SubSuite, SubSuiteWorker};

/// A user-declared suite with its generated correlation id.
#[derive(Debug, Clone)]
pub struct MainSuite {
    pub id: String,
    pub suite: Suite,
}

/// Orchestrates one main suite.
pub struct SuiteOrchestrator {
    params: Arc<Parameters>,
    publisher: Arc<dyn EventPublisher>,
    query: Arc<dyn EventQuery>,
    provider: Arc<dyn EnvironmentProvider>,
    executor: Arc<dyn ExecutorClient>,
    status: EnvironmentStatusHandle,
    ctx: TaskContext,
    testrun_id: String,
    activity_id: String,
    product: Option<String>,
    main_suite: MainSuite,
    sub_suites: Mutex<Vec<Arc<SubSuite>>>,
    activity_triggered: OnceLock<ActivityTriggered>,
    activity_finished: OnceLock<ActivityFinished>,
}

impl SuiteOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: Arc<Parameters>,
        publisher: Arc<dyn EventPublisher>,
        query: Arc<dyn EventQuery>,
        provider: Arc<dyn EnvironmentProvider>,
        executor: Arc<dyn ExecutorClient>,
        status: EnvironmentStatusHandle,
        ctx: TaskContext,
        testrun_id: String,
        activity_id: String,
        product: Option<String>,
        main_suite: MainSuite,
    ) -> Self {
        Self {
            params,
            publisher,
            query,
            provider,
            executor,
            status,
            ctx,
            testrun_id,
            activity_id,
            product,
            main_suite,
            sub_suites: Mutex::new(Vec::new()),
            activity_triggered: OnceLock::new(),
            activity_finished: OnceLock::new(),
        }
    }

    /// Runs the suite: started event, discovery, workers, verdict, finished
    /// event, release.
    ///
    /// Unrecoverable errors are returned after the finished event has been
    /// emitted and the suite's environments have been released.
    pub async fn run(self) -> crate::Result<SuiteResult> {
        let span = tracing::info_span!(
            "test_suite",
            suite = %self.main_suite.suite.name,
            main_suite_id = %self.main_suite.id,
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        async move {
            self.publisher
                .publish(events::test_suite_started(
                    &self.main_suite.id,
                    &self.activity_id,
                    &self.testrun_id,
                    &self.main_suite.suite.name,
                    self.product.as_deref(),
                ))
                .await?;
            info!("Test suite started {:?}", self.main_suite.id);

            let empty = self.main_suite.suite.tests.is_empty();
            let mut started = false;
            let error = if empty {
                error!("No recipes found in test suite. Exiting.");
                None
            } else {
                match self.start_sub_suites().await {
                    Ok(()) => {
                        started = true;
                        None
                    }
                    Err(err) => Some(err),
                }
            };

            let assessment = match &error {
                Some(err) => {
                    crate::telemetry::record_error(&tracing::Span::current(), err.kind(), err);
                    SuiteAssessment {
                        verdict: crate::verdict::Verdict::Failed,
                        conclusion: crate::verdict::Conclusion::Failed,
                        description: err.to_string(),
                    }
                }
                None => {
                    let snapshots: Vec<_> = self
                        .sub_suites
                        .lock()
                        .map(|subs| subs.iter().map(|sub| sub.snapshot()).collect())
                        .unwrap_or_default();
                    assess(
                        &self.testrun_id,
                        &self.main_suite.id,
                        empty,
                        started,
                        &snapshots,
                    )
                }
            };
            info!(
                verdict = %assessment.verdict,
                conclusion = %assessment.conclusion,
                description = %assessment.description,
                "Test suite result for {:?}",
                self.main_suite.suite.name,
            );

            let finished = self
                .publisher
                .publish(events::test_suite_finished(
                    &self.activity_id,
                    &self.main_suite.id,
                    assessment.verdict.as_event_str(),
                    assessment.conclusion.as_event_str(),
                    &assessment.description,
                ))
                .await;
            info!("Test suite finished.");

            self.release_all().await;

            if let Some(err) = error {
                return Err(err);
            }
            finished?;
            Ok(SuiteResult {
                main_suite_id: self.main_suite.id.clone(),
                suite_name: self.main_suite.suite.name.clone(),
                verdict: assessment.verdict,
                conclusion: assessment.conclusion,
                description: assessment.description,
            })
        }
        .instrument(span)
        .await
    }

    /// Discovers environments and spawns their workers, then joins them all.
    async fn start_sub_suites(&self) -> crate::Result<()> {
        let mut workers = JoinSet::new();
        info!(
            "Waiting for an environment for {:?} ({:?})",
            self.main_suite.suite.name, self.main_suite.id,
        );
        let result = self.discover(&mut workers).await;
        if result.is_ok() {
            info!(
                "All sub suites for {:?} have now been triggered",
                self.main_suite.suite.name,
            );
        }
        // Join every spawned worker even if discovery failed; each worker
        // releases its own environment on the way out.
        while let Some(join_result) = workers.join_next().await {
            if let Err(err) = join_result {
                error!(error = %err, "Sub suite worker panicked");
            }
        }
        if result.is_ok() {
            info!(
                "All sub suites for {:?} have now finished",
                self.main_suite.suite.name,
            );
        }
        result
    }

    /// The environment discovery loop.
    ///
    /// Yields every new environment exactly once (dedup by event id) and
    /// exits successfully once the provider's activity finished and at least
    /// one environment was seen.
    async fn discover(&self, workers: &mut JoinSet<()>) -> crate::Result<()> {
        let timeout = self.params.wait_for_environment_timeout;
        let deadline = Deadline::after(timeout);
        let mut discovered: HashSet<String> = HashSet::new();
        loop {
            self.ctx.tick(self.params.environment_poll_interval).await?;
            if deadline.expired() {
                return Err(Error::Timeout {
                    seconds: timeout.as_secs(),
                });
            }

            let Some(activity) = self.environment_activity().await? else {
                let status = self.status.get();
                if status.state == EnvironmentState::Failure {
                    return Err(Error::EnvironmentProvider {
                        message: status
                            .error
                            .unwrap_or_else(|| "Environment provider failed".to_string()),
                        task_id: status.task_id,
                    });
                }
                continue;
            };
            let finished = self.environment_activity_finished(&activity.meta.id).await?;

            for environment in self.query.environments_defined(&activity.meta.id).await? {
                if !discovered.insert(environment.meta.id.clone()) {
                    continue;
                }
                info!("Environment received. Starting up a sub suite");
                let sub_suite = self.materialize(&environment).await?;
                workers.spawn(
                    SubSuiteWorker::new(
                        sub_suite,
                        self.query.clone(),
                        self.executor.clone(),
                        self.provider.clone(),
                        self.ctx.fork(),
                        self.testrun_id.clone(),
                        self.params.test_result_timeout,
                        self.params.result_poll_interval,
                    )
                    .run(),
                );
            }

            if let Some(finished) = finished {
                let outcome = &finished.data.activity_outcome;
                if outcome.conclusion != "SUCCESSFUL" {
                    return Err(Error::EnvironmentProvider {
                        message: outcome.description.clone().unwrap_or_else(|| {
                            "Environment provider activity failed".to_string()
                        }),
                        task_id: self.status.get().task_id,
                    });
                }
                // Must be at least one sub suite.
                if !discovered.is_empty() {
                    info!(
                        "Total count of sub suites for {:?}: {}",
                        self.main_suite.suite.name,
                        discovered.len(),
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Downloads the definition behind an environment and binds it.
    async fn materialize(
        &self,
        environment: &EnvironmentDefined,
    ) -> crate::Result<Arc<SubSuite>> {
        let uri = environment
            .data
            .uri
            .as_deref()
            .ok_or_else(|| Error::EnvironmentProvider {
                message: "URL to sub suite is missing".to_string(),
                task_id: self.status.get().task_id,
            })?;
        let mut definition =
            self.executor
                .download_sub_suite(uri)
                .await
                .map_err(|err| Error::EnvironmentProvider {
                    message: err.to_string(),
                    task_id: self.status.get().task_id,
                })?;
        definition.id = Some(environment.meta.id.clone());
        let sub_suite = Arc::new(SubSuite::new(definition, self.main_suite.id.clone()));
        if let Ok(mut subs) = self.sub_suites.lock() {
            subs.push(sub_suite.clone());
        }
        Ok(sub_suite)
    }

    /// Cached lookup of the environment provider's activity for this suite.
    async fn environment_activity(&self) -> crate::Result<Option<ActivityTriggered>> {
        if let Some(activity) = self.activity_triggered.get() {
            return Ok(Some(activity.clone()));
        }
        match self.query.activity_triggered(&self.main_suite.id).await? {
            Some(activity) => {
                let _ = self.activity_triggered.set(activity.clone());
                Ok(Some(activity))
            }
            None => Ok(None),
        }
    }

    /// Cached lookup of the provider activity's finished event.
    async fn environment_activity_finished(
        &self,
        activity_id: &str,
    ) -> crate::Result<Option<ActivityFinished>> {
        if let Some(finished) = self.activity_finished.get() {
            return Ok(Some(finished.clone()));
        }
        match self.query.activity_finished(activity_id).await? {
            Some(finished) => {
                let _ = self.activity_finished.set(finished.clone());
                Ok(Some(finished))
            }
            None => Ok(None),
        }
    }

    /// Releases every sub suite that has not been released yet.
    async fn release_all(&self) {
        info!("Releasing all sub suite environments");
        let sub_suites: Vec<Arc<SubSuite>> = self
            .sub_suites
            .lock()
            .map(|subs| subs.clone())
            .unwrap_or_default();
        for sub_suite in sub_suites {
            if sub_suite.release_state() == ReleaseState::Unreleased {
                sub_suite
                    .release(self.provider.as_ref(), &self.testrun_id)
                    .await;
            }
        }
        info!("All sub suite environments are released");
    }
}
