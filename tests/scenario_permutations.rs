//! Scenario test for permutations: two suites with one sub suite each.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{
    artifact_created_event, parameters, tercc, ExecutorBehavior, FakeBus, FakeExecutor,
    FakeProvider,
};
use etos_suite_runner::events;
use etos_suite_runner::{testrun_verdict, Conclusion, Runner, TaskContext, Verdict};

const TESTRUN_ID: &str = "6e8ec0be-3299-4242-b07c-1843113c350f";
const ARTIFACT_ID: &str = "349f9bf9-0fc7-4dd4-b641-ac5f1c9ea7aa";

#[tokio::test(start_paused = true)]
async fn permutation_scenario_runs_both_suites() {
    let bus = FakeBus::new();
    let executor = FakeExecutor::new(bus.clone(), ExecutorBehavior::HappyPath);
    let provider = FakeProvider::new(
        bus.clone(),
        executor.clone(),
        vec![
            ("PermutatedSuite1".to_string(), 1),
            ("PermutatedSuite2".to_string(), 1),
        ],
    );
    let document = tercc(
        TESTRUN_ID,
        ARTIFACT_ID,
        &[("PermutatedSuite1", 1), ("PermutatedSuite2", 1)],
    );
    bus.publish_raw(artifact_created_event(ARTIFACT_ID));
    let runner = Runner::new(
        Arc::new(parameters(&document)),
        bus.clone(),
        bus.clone(),
        provider.clone(),
        executor.clone(),
        TaskContext::new(),
    );

    let results = runner.run().await.expect("testrun should complete");
    assert_eq!(results.len(), 2);
    // Suite order from the recipe collection is preserved.
    assert_eq!(results[0].suite_name, "PermutatedSuite1");
    assert_eq!(results[1].suite_name, "PermutatedSuite2");
    assert_ne!(results[0].main_suite_id, results[1].main_suite_id);

    let verdict = testrun_verdict(&results);
    assert_eq!(verdict.verdict, Verdict::Passed);
    assert_eq!(verdict.conclusion, Conclusion::Successful);

    // Each main suite has its own started/finished pair on the bus.
    for result in &results {
        assert_eq!(
            bus.events_of_type(events::TEST_SUITE_STARTED)
                .iter()
                .filter(|event| event.meta.id == result.main_suite_id)
                .count(),
            1
        );
        assert_eq!(
            bus.events_of_type(events::TEST_SUITE_FINISHED)
                .iter()
                .filter(|event| event.links_to(&result.main_suite_id))
                .count(),
            1
        );
    }

    // Both sub suites were handed to test runners, and both environments
    // were released exactly once.
    assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
    let released = provider.released_environments();
    assert_eq!(released.len(), 2);
    assert_ne!(released[0], released[1]);
    assert_eq!(provider.full_releases.load(Ordering::SeqCst), 1);
}
