//! Sub suite tracking and execution.
//!
//! A [`SubSuite`] is one environment materialized into a running unit. The
//! struct owns the immutable definition and collects runtime state behind
//! interior mutability, so the orchestrator can keep a handle while the
//! worker task drives execution.
//!
//! Within one sub suite the order is fixed: executor call, started
//! observation, finished observation, release. The release runs on every
//! exit path, exactly once, through a small state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn, Instrument};

use crate::context::{Deadline, TaskContext};
use crate::environment::EnvironmentProvider;
use crate::executor::{ExecutorClient, ExecutorError, SubSuiteDefinition};
use crate::query::{EventQuery, TestSuiteFinished, TestSuiteStarted};
use crate::verdict::SubSuiteSnapshot;
use crate::Error;

/// Release progress of one sub suite environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Unreleased,
    Releasing,
    Released,
    ReleaseFailed,
}

/// One environment bound to a running sub suite.
pub struct SubSuite {
    definition: SubSuiteDefinition,
    main_suite_id: String,
    failed: AtomicBool,
    started: Mutex<Option<TestSuiteStarted>>,
    finished: Mutex<Option<TestSuiteFinished>>,
    release: Mutex<ReleaseState>,
}

impl SubSuite {
    pub fn new(definition: SubSuiteDefinition, main_suite_id: String) -> Self {
        Self {
            definition,
            main_suite_id,
            failed: AtomicBool::new(false),
            started: Mutex::new(None),
            finished: Mutex::new(None),
            release: Mutex::new(ReleaseState::Unreleased),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &SubSuiteDefinition {
        &self.definition
    }

    pub fn main_suite_id(&self) -> &str {
        &self.main_suite_id
    }

    /// Marks the sub suite as failed to start.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Caches the started event. First write wins.
    pub fn mark_started(&self, event: TestSuiteStarted) {
        if let Ok(mut started) = self.started.lock() {
            started.get_or_insert(event);
        }
    }

    pub fn has_started(&self) -> bool {
        self.started
            .lock()
            .map(|started| started.is_some())
            .unwrap_or(false)
    }

    /// Event id of the cached started event.
    pub fn started_event_id(&self) -> Option<String> {
        self.started
            .lock()
            .ok()?
            .as_ref()
            .map(|event| event.meta.id.clone())
    }

    /// Caches the finished event. First write wins.
    pub fn mark_finished(&self, event: TestSuiteFinished) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.get_or_insert(event);
        }
    }

    pub fn has_finished(&self) -> bool {
        self.finished
            .lock()
            .map(|finished| finished.is_some())
            .unwrap_or(false)
    }

    pub fn release_state(&self) -> ReleaseState {
        self.release
            .lock()
            .map(|state| *state)
            .unwrap_or(ReleaseState::Unreleased)
    }

    /// Snapshot of the runtime state for verdict aggregation.
    pub fn snapshot(&self) -> SubSuiteSnapshot {
        SubSuiteSnapshot {
            failed: self.has_failed(),
            finished: self.has_finished(),
            outcome: self
                .finished
                .lock()
                .ok()
                .and_then(|finished| {
                    finished
                        .as_ref()
                        .map(|event| event.data.test_suite_outcome.clone())
                }),
        }
    }

    /// Releases the environment bound to this sub suite.
    ///
    /// Only the first call releases; later calls observe a non-`Unreleased`
    /// state and return. Release failures are logged, never raised.
    pub async fn release(&self, provider: &dyn EnvironmentProvider, testrun_id: &str) {
        {
            let Ok(mut state) = self.release.lock() else {
                return;
            };
            if *state != ReleaseState::Unreleased {
                return;
            }
            *state = ReleaseState::Releasing;
        }
        let environment = self.definition.id.clone().unwrap_or_default();
        let span = tracing::info_span!(
            "release_environment",
            otel.kind = "client",
            environment = %environment,
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        async {
            info!("Check in test environment {:?}", environment);
            let state = match provider.release_sub_suite(testrun_id, &self.definition).await {
                Ok(()) => {
                    info!("Checked in {:?}", environment);
                    ReleaseState::Released
                }
                Err(err) => {
                    crate::telemetry::record_error(
                        &tracing::Span::current(),
                        "ReleaseError",
                        &err,
                    );
                    error!(error = %err, "Failed to check in {:?}", environment);
                    ReleaseState::ReleaseFailed
                }
            };
            if let Ok(mut release) = self.release.lock() {
                *release = state;
            }
        }
        .instrument(span)
        .await
    }
}

/// Drives one sub suite: start the test runner, poll for its lifecycle
/// events, release its environment.
pub struct SubSuiteWorker {
    sub_suite: Arc<SubSuite>,
    query: Arc<dyn EventQuery>,
    executor: Arc<dyn ExecutorClient>,
    provider: Arc<dyn EnvironmentProvider>,
    ctx: TaskContext,
    testrun_id: String,
    result_timeout: Duration,
    poll_interval: Duration,
}

impl SubSuiteWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sub_suite: Arc<SubSuite>,
        query: Arc<dyn EventQuery>,
        executor: Arc<dyn ExecutorClient>,
        provider: Arc<dyn EnvironmentProvider>,
        ctx: TaskContext,
        testrun_id: String,
        result_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sub_suite,
            query,
            executor,
            provider,
            ctx,
            testrun_id,
            result_timeout,
            poll_interval,
        }
    }

    /// Runs the sub suite to completion. The environment release always runs.
    pub async fn run(self) {
        let span = tracing::info_span!(
            "execute_testrunner",
            otel.kind = "client",
            sub_suite = %self.sub_suite.name(),
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        self.ctx.reinstate(&span);
        async {
            if let Err(err) = self.execute().await {
                crate::telemetry::record_error(&tracing::Span::current(), err.kind(), &err);
                match err {
                    Error::Terminated => warn!("Sub suite terminated before completion"),
                    err => error!(error = %err, "Sub suite failed"),
                }
            }
            self.sub_suite
                .release(self.provider.as_ref(), &self.testrun_id)
                .await;
        }
        .instrument(span)
        .await
    }

    async fn execute(&self) -> crate::Result<()> {
        info!("Starting up the test runner");
        if let Err(err) = self.executor.run_tests(self.sub_suite.definition()).await {
            self.sub_suite.mark_failed();
            error!(error = %err, "Failed to start sub suite");
            return Err(match err {
                ExecutorError::TestStart(err) => Error::TestStart(err),
                other => Error::TestStart(crate::executor::TestStartError::message(
                    other.to_string(),
                )),
            });
        }
        debug!("Test runner triggered");

        let deadline = Deadline::after(self.result_timeout);
        while !deadline.expired() {
            self.ctx.tick(self.poll_interval).await?;
            if !self.refresh_started().await? {
                continue;
            }
            if self.refresh_finished().await? {
                info!("Test runner has finished");
                break;
            }
        }
        Ok(())
    }

    /// Looks for the started event of this sub suite.
    ///
    /// Matching on the name is safe: the `_SubSuite_<N>` suffix is generated
    /// by the environment provider, not by users.
    async fn refresh_started(&self) -> crate::Result<bool> {
        if self.sub_suite.has_started() {
            return Ok(true);
        }
        for started in self
            .query
            .test_suites_started(self.sub_suite.main_suite_id())
            .await?
        {
            if started.data.name == self.sub_suite.name() {
                info!("Test runner has started");
                self.sub_suite.mark_started(started);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn refresh_finished(&self) -> crate::Result<bool> {
        if self.sub_suite.has_finished() {
            return Ok(true);
        }
        let Some(started_id) = self.sub_suite.started_event_id() else {
            return Ok(false);
        };
        if let Some(finished) = self.query.test_suite_finished(&started_id).await? {
            self.sub_suite.mark_finished(finished);
            return Ok(true);
        }
        Ok(false)
    }
}
