//! Top-level testrun driver.
//!
//! The [`Runner`] owns the lifecycle of one testrun: the activity event
//! triple, the background environment requester, the per-suite
//! orchestrators, the aggregated outcome and — on every exit path — the full
//! environment release.

use std::sync::Arc;

use tracing::{error, info, warn, Instrument};

use crate::context::TaskContext;
use crate::environment::{
    EnvironmentProvider, EnvironmentRequester, EnvironmentState, EnvironmentStatusHandle,
};
use crate::events::{self, EventPublisher, Severity};
use crate::executor::ExecutorClient;
use crate::orchestrator::{MainSuite, SuiteOrchestrator};
use crate::params::Parameters;
use crate::query::EventQuery;
use crate::verdict::SuiteResult;
use crate::Error;

/// Name of the activity representing the whole testrun on the bus.
const ACTIVITY_NAME: &str = "ETOS testrun";

/// Drives one testrun end-to-end.
pub struct Runner {
    params: Arc<Parameters>,
    publisher: Arc<dyn EventPublisher>,
    query: Arc<dyn EventQuery>,
    provider: Arc<dyn EnvironmentProvider>,
    executor: Arc<dyn ExecutorClient>,
    status: EnvironmentStatusHandle,
    ctx: TaskContext,
}

impl Runner {
    pub fn new(
        params: Arc<Parameters>,
        publisher: Arc<dyn EventPublisher>,
        query: Arc<dyn EventQuery>,
        provider: Arc<dyn EnvironmentProvider>,
        executor: Arc<dyn ExecutorClient>,
        ctx: TaskContext,
    ) -> Self {
        Self {
            params,
            publisher,
            query,
            provider,
            executor,
            status: EnvironmentStatusHandle::new(),
            ctx,
        }
    }

    /// The shared environment provider status.
    pub fn environment_status(&self) -> EnvironmentStatusHandle {
        self.status.clone()
    }

    /// Runs the testrun.
    ///
    /// Returns one result per main suite on a completed run. Whatever
    /// happens, environments reserved for the testrun are released before
    /// this returns.
    pub async fn run(&self) -> crate::Result<Vec<SuiteResult>> {
        let testrun_id = self.params.testrun_id()?;
        let span = tracing::info_span!(
            "testrun",
            testrun_id = %testrun_id,
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        self.ctx.reinstate(&span);
        async {
            info!("Suite runner is starting up");

            if self.params.operator_mode() {
                self.publish_missing_recipe_collection(&testrun_id).await?;
            }
            let iut_id = self.params.iut_id(self.query.as_ref()).await?;

            let triggered = events::activity_triggered(ACTIVITY_NAME, &testrun_id, &iut_id);
            let activity_id = triggered.meta.id.clone();
            self.publisher.publish(triggered).await?;

            if let Err(err) = self.params.verify() {
                // Nothing has been requested yet, so there is nothing to
                // release and no activity to cancel.
                let _ = self
                    .publisher
                    .publish(events::announcement(
                        Some(&activity_id),
                        "Suite runner failed to start",
                        &err.to_string(),
                        Severity::Critical,
                    ))
                    .await;
                error!(error = %err, "Suite runner failed to start test execution");
                return Err(err);
            }

            let outcome = self.execute(&testrun_id, &activity_id).await;
            self.release_full(&testrun_id).await;
            match outcome {
                Ok(results) => {
                    self.publisher
                        .publish(events::activity_finished(&activity_id, "SUCCESSFUL"))
                        .await?;
                    info!("Suite runner finished executing");
                    Ok(results)
                }
                Err(err) => {
                    crate::telemetry::record_error(&tracing::Span::current(), err.kind(), &err);
                    error!(error = %err, "Suite runner failed to execute test suites");
                    if matches!(err, Error::Terminated) {
                        let _ = self
                            .publisher
                            .publish(events::announcement(
                                Some(&activity_id),
                                "Suite runner was terminated",
                                &err.to_string(),
                                Severity::Major,
                            ))
                            .await;
                    }
                    let _ = self
                        .publisher
                        .publish(events::activity_canceled(&activity_id, &err.to_string()))
                        .await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// In operator mode the testrun's recipe collection event may not exist
    /// on the bus yet; publish it so downstream consumers can link to it.
    async fn publish_missing_recipe_collection(&self, testrun_id: &str) -> crate::Result<()> {
        if self.query.recipe_collection(testrun_id).await?.is_some() {
            return Ok(());
        }
        let iut_id = self.params.iut_id(self.query.as_ref()).await?;
        info!("Recipe collection is missing from the bus, publishing it");
        self.publisher
            .publish(events::recipe_collection_created(
                testrun_id,
                &iut_id,
                self.params.suite_source.as_deref().unwrap_or("Unknown"),
            ))
            .await?;
        Ok(())
    }

    /// The failure-prone middle of the testrun: suites, workers, requester.
    async fn execute(
        &self,
        testrun_id: &str,
        activity_id: &str,
    ) -> crate::Result<Vec<SuiteResult>> {
        let suites = self.params.test_suite().await?;
        let ids = self
            .provider
            .main_suite_ids(testrun_id, suites.len())
            .await
            .map_err(|err| Error::EnvironmentProvider {
                message: err.to_string(),
                task_id: None,
            })?;
        if ids.len() != suites.len() {
            return Err(Error::EnvironmentProvider {
                message: format!(
                    "Expected {} environment requests, found {}",
                    suites.len(),
                    ids.len()
                ),
                task_id: None,
            });
        }
        let main_suites: Vec<MainSuite> = ids
            .into_iter()
            .zip(suites)
            .map(|(id, suite)| MainSuite { id, suite })
            .collect();
        info!("Number of test suites to run: {}", main_suites.len());

        self.publisher
            .publish(events::environment_defined(
                activity_id,
                "ETOS Suite Runner",
                self.params.suite_runner_image.as_deref().unwrap_or("Unknown"),
            ))
            .await?;

        info!("Get test environment.");
        let requester = EnvironmentRequester::new(
            self.provider.clone(),
            self.status.clone(),
            self.ctx.fork(),
            self.params.wait_for_environment_timeout,
            self.params.environment_poll_interval,
        );
        let main_suite_ids: Vec<String> =
            main_suites.iter().map(|suite| suite.id.clone()).collect();
        // The request is issued before the activity starts; only the status
        // watcher runs in the background.
        requester.issue(testrun_id, &main_suite_ids).await;
        let watcher = tokio::spawn(requester.watch(testrun_id.to_string()));

        self.publisher
            .publish(events::activity_started(activity_id))
            .await?;

        let product = self.params.product(self.query.as_ref()).await?;
        info!("Starting suite orchestration");
        let orchestrators = main_suites.into_iter().map(|main_suite| {
            SuiteOrchestrator::new(
                self.params.clone(),
                self.publisher.clone(),
                self.query.clone(),
                self.provider.clone(),
                self.executor.clone(),
                self.status.clone(),
                self.ctx.fork(),
                testrun_id.to_string(),
                activity_id.to_string(),
                product.clone(),
                main_suite,
            )
            .run()
        });
        let results = futures::future::join_all(orchestrators).await;
        watcher.abort();

        if self.ctx.is_cancelled() {
            warn!("Termination requested, shutting down");
            return Err(Error::Terminated);
        }

        let mut suite_results = Vec::with_capacity(results.len());
        let mut first_error: Option<Error> = None;
        for result in results {
            match result {
                Ok(suite_result) => suite_results.push(suite_result),
                Err(err) => {
                    error!(error = %err, "Test suite failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let status = self.status.get();
        if status.state == EnvironmentState::Failure {
            return Err(Error::EnvironmentProvider {
                message: status
                    .error
                    .unwrap_or_else(|| "Environment provider failed".to_string()),
                task_id: status.task_id,
            });
        }
        Ok(suite_results)
    }

    /// Releases every environment reservation tied to the testrun.
    ///
    /// Runs on every exit path once the environment request has been issued.
    /// Failures are logged, never raised, so they cannot mask the verdict.
    async fn release_full(&self, testrun_id: &str) {
        let span = tracing::info_span!(
            "release_full_environment",
            otel.kind = "client",
            otel.status_code = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            exception.message = tracing::field::Empty,
        );
        async {
            info!("Release the full test environment.");
            if let Err(err) = self.provider.release_all(testrun_id).await {
                crate::telemetry::record_error(&tracing::Span::current(), "ReleaseError", &err);
                error!(error = %err, "Failed to release the full test environment");
            }
        }
        .instrument(span)
        .await
    }
}
