//! Scenario tests for a regular testrun: one suite, one sub suite, plus the
//! failure modes around it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{
    artifact_created_event, parameters, tercc, ExecutorBehavior, FakeBus, FakeExecutor,
    FakeProvider,
};
use etos_suite_runner::events;
use etos_suite_runner::verdict::FinalVerdict;
use etos_suite_runner::{testrun_verdict, Conclusion, Error, Runner, TaskContext, Verdict};

const TESTRUN_ID: &str = "6e8ec0be-3299-4242-b07c-1843113c350f";
const ARTIFACT_ID: &str = "349f9bf9-0fc7-4dd4-b641-ac5f1c9ea7aa";

fn runner(
    bus: &Arc<FakeBus>,
    provider: &Arc<FakeProvider>,
    executor: &Arc<FakeExecutor>,
    batches: &[(&str, usize)],
    ctx: TaskContext,
) -> Runner {
    let params = Arc::new(parameters(&tercc(TESTRUN_ID, ARTIFACT_ID, batches)));
    bus.publish_raw(artifact_created_event(ARTIFACT_ID));
    Runner::new(
        params,
        bus.clone(),
        bus.clone(),
        provider.clone(),
        executor.clone(),
        ctx,
    )
}

#[tokio::test(start_paused = true)]
async fn regular_scenario_passes() {
    let bus = FakeBus::new();
    let executor = FakeExecutor::new(bus.clone(), ExecutorBehavior::HappyPath);
    let provider = FakeProvider::new(
        bus.clone(),
        executor.clone(),
        vec![("Suite".to_string(), 1)],
    );
    let runner = runner(&bus, &provider, &executor, &[("Suite", 1)], TaskContext::new());

    let results = runner.run().await.expect("testrun should complete");
    assert_eq!(results.len(), 1);

    let verdict = testrun_verdict(&results);
    assert_eq!(
        verdict,
        FinalVerdict {
            conclusion: Conclusion::Successful,
            verdict: Verdict::Passed,
            description: "All tests passed.".to_string(),
        }
    );
    // Title-case on the way out.
    let serialized = serde_json::to_value(&verdict).unwrap();
    assert_eq!(serialized["verdict"], "Passed");
    assert_eq!(serialized["conclusion"], "Successful");

    // Exactly one main suite started and finished on the bus.
    let main_suite_id = &results[0].main_suite_id;
    let started: Vec<_> = bus
        .events_of_type(events::TEST_SUITE_STARTED)
        .into_iter()
        .filter(|event| &event.meta.id == main_suite_id)
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].data["name"], "Suite");
    let finished: Vec<_> = bus
        .events_of_type(events::TEST_SUITE_FINISHED)
        .into_iter()
        .filter(|event| event.links_to(main_suite_id))
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].data["testSuiteOutcome"]["verdict"], "PASSED");

    // The activity triple: triggered, started, finished - and no cancel.
    let triggered: Vec<_> = bus
        .events_of_type(events::ACTIVITY_TRIGGERED)
        .into_iter()
        .filter(|event| event.data["name"] == "ETOS testrun")
        .collect();
    assert_eq!(triggered.len(), 1);
    let activity_id = &triggered[0].meta.id;
    assert_eq!(
        bus.events_of_type(events::ACTIVITY_STARTED)
            .iter()
            .filter(|event| event.links_to(activity_id))
            .count(),
        1
    );
    assert_eq!(
        bus.events_of_type(events::ACTIVITY_FINISHED)
            .iter()
            .filter(|event| event.links_to(activity_id))
            .count(),
        1
    );
    assert!(bus.events_of_type(events::ACTIVITY_CANCELED).is_empty());

    // Exactly one release for the single environment, plus the full release.
    assert_eq!(provider.released_environments().len(), 1);
    assert_eq!(
        provider
            .full_releases
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(executor.runs.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_suite_is_inconclusive() {
    let bus = FakeBus::new();
    let executor = FakeExecutor::new(bus.clone(), ExecutorBehavior::HappyPath);
    let provider = FakeProvider::new(
        bus.clone(),
        executor.clone(),
        vec![("Suite".to_string(), 0)],
    );
    let runner = runner(&bus, &provider, &executor, &[("Suite", 0)], TaskContext::new());

    let results = runner.run().await.expect("testrun should complete");
    let verdict = testrun_verdict(&results);
    assert_eq!(verdict.verdict, Verdict::Inconclusive);
    assert_eq!(verdict.conclusion, Conclusion::Failed);
    assert!(verdict.description.contains("No tests in suite"));

    // No sub suite was ever handed to a test runner.
    assert_eq!(executor.runs.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(provider.released_environments().is_empty());

    // The suite still got its started/finished pair.
    let main_suite_id = &results[0].main_suite_id;
    assert_eq!(
        bus.events_of_type(events::TEST_SUITE_FINISHED)
            .iter()
            .filter(|event| event.links_to(main_suite_id))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn environment_provider_failure_cancels_the_testrun() {
    let bus = FakeBus::new();
    let executor = FakeExecutor::new(bus.clone(), ExecutorBehavior::HappyPath);
    let provider = FakeProvider::failing(bus.clone(), executor.clone(), "boom");
    let runner = runner(&bus, &provider, &executor, &[("Suite", 1)], TaskContext::new());

    let err = runner.run().await.expect_err("testrun should fail");
    assert!(matches!(err, Error::EnvironmentProvider { .. }));
    assert_eq!(err.to_string(), "boom");

    // The failure is reported as a canceled activity with the provider's
    // error as the reason.
    let canceled = bus.events_of_type(events::ACTIVITY_CANCELED);
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].data["reason"], "boom");
    assert!(bus.events_of_type(events::ACTIVITY_FINISHED).is_empty());

    // The full release still ran, and the termination log reads
    // Failed/Inconclusive.
    assert_eq!(
        provider
            .full_releases
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    let verdict = FinalVerdict::failure(err.to_string());
    assert_eq!(verdict.conclusion, Conclusion::Failed);
    assert_eq!(verdict.verdict, Verdict::Inconclusive);
}

#[tokio::test(start_paused = true)]
async fn sub_suite_start_failure_is_inconclusive_and_released() {
    let bus = FakeBus::new();
    let executor = FakeExecutor::new(bus.clone(), ExecutorBehavior::RejectStart);
    let provider = FakeProvider::new(
        bus.clone(),
        executor.clone(),
        vec![("Suite".to_string(), 1)],
    );
    let runner = runner(&bus, &provider, &executor, &[("Suite", 1)], TaskContext::new());

    let results = runner.run().await.expect("testrun should complete");
    let verdict = testrun_verdict(&results);
    assert_eq!(verdict.verdict, Verdict::Inconclusive);
    assert_eq!(verdict.conclusion, Conclusion::Failed);
    assert_eq!(verdict.description, "1 sub suites failed to start");

    // The environment was still released, exactly once.
    assert_eq!(provider.released_environments().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn termination_mid_flight_releases_everything() {
    let bus = FakeBus::new();
    // Started but never finishing: the worker sits in its result poll.
    let executor = FakeExecutor::new(bus.clone(), ExecutorBehavior::StartedOnly);
    let provider = FakeProvider::new(
        bus.clone(),
        executor.clone(),
        vec![("Suite".to_string(), 1)],
    );
    let token = CancellationToken::new();
    let runner = runner(
        &bus,
        &provider,
        &executor,
        &[("Suite", 1)],
        TaskContext::with_token(token.clone()),
    );

    let handle = tokio::spawn(async move { runner.run().await });
    // Let the suite start and the worker enter its poll loop, then pull the
    // plug.
    tokio::time::sleep(Duration::from_secs(30)).await;
    token.cancel();
    let err = handle
        .await
        .expect("runner task should not panic")
        .expect_err("testrun should be terminated");
    assert!(matches!(err, Error::Terminated));

    // Both the sub suite environment and the full reservation were released.
    assert_eq!(provider.released_environments().len(), 1);
    assert_eq!(
        provider
            .full_releases
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // And the termination log triple reads Failed/Inconclusive.
    let verdict = FinalVerdict::failure(err.to_string());
    assert_eq!(verdict.conclusion, Conclusion::Failed);
    assert_eq!(verdict.verdict, Verdict::Inconclusive);
    assert!(!bus.events_of_type(events::ACTIVITY_CANCELED).is_empty());
}
