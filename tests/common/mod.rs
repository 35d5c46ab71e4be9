//! Scenario test support: an in-memory event bus, a scripted environment
//! provider and a scripted test runner executor.
//!
//! The fakes mirror how the real collaborators behave on the bus: the
//! provider announces an activity per main suite, defines environments under
//! it and finishes the activity; the executor publishes the sub suite
//! started/finished events a real test runner would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use etos_suite_runner::environment::{EnvironmentProvider, ProviderError, Provisioning};
use etos_suite_runner::events::{self, Event, EventPublisher, PublishError};
use etos_suite_runner::executor::{
    ExecutorClient, ExecutorError, SubSuiteDefinition, TestStartError,
};
use etos_suite_runner::query::{
    ActivityFinished, ActivityTriggered, ArtifactCreated, EnvironmentDefined, EventQuery,
    QueryError, RecipeCollectionCreated, TestSuiteFinished, TestSuiteStarted,
};

/// In-memory event bus implementing both the publish and the query seam.
#[derive(Default)]
pub struct FakeBus {
    events: Mutex<Vec<Event>>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes without going through the async trait, for fakes and
    /// fixtures.
    pub fn publish_raw(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.meta.event_type == event_type)
            .collect()
    }

    fn view<T: serde::de::DeserializeOwned>(event: &Event) -> T {
        serde_json::from_value(serde_json::to_value(event).unwrap()).unwrap()
    }

    fn linked(&self, event_type: &str, target: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.meta.event_type == event_type && event.links_to(target))
            .collect()
    }

    fn by_id(&self, event_type: &str, id: &str) -> Option<Event> {
        self.events()
            .into_iter()
            .find(|event| event.meta.event_type == event_type && event.meta.id == id)
    }
}

#[async_trait]
impl EventPublisher for FakeBus {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        self.publish_raw(event);
        Ok(())
    }
}

#[async_trait]
impl EventQuery for FakeBus {
    async fn artifact_created(
        &self,
        artifact_id: &str,
    ) -> Result<Option<ArtifactCreated>, QueryError> {
        Ok(self
            .by_id(events::ARTIFACT_CREATED, artifact_id)
            .map(|event| Self::view(&event)))
    }

    async fn recipe_collection(
        &self,
        testrun_id: &str,
    ) -> Result<Option<RecipeCollectionCreated>, QueryError> {
        Ok(self
            .by_id(events::RECIPE_COLLECTION_CREATED, testrun_id)
            .map(|event| Self::view(&event)))
    }

    async fn activity_triggered(
        &self,
        link_target: &str,
    ) -> Result<Option<ActivityTriggered>, QueryError> {
        Ok(self
            .linked(events::ACTIVITY_TRIGGERED, link_target)
            .first()
            .map(Self::view))
    }

    async fn activity_finished(
        &self,
        link_target: &str,
    ) -> Result<Option<ActivityFinished>, QueryError> {
        Ok(self
            .linked(events::ACTIVITY_FINISHED, link_target)
            .first()
            .map(Self::view))
    }

    async fn environments_defined(
        &self,
        link_target: &str,
    ) -> Result<Vec<EnvironmentDefined>, QueryError> {
        Ok(self
            .linked(events::ENVIRONMENT_DEFINED, link_target)
            .iter()
            .map(Self::view)
            .collect())
    }

    async fn test_suites_started(
        &self,
        link_target: &str,
    ) -> Result<Vec<TestSuiteStarted>, QueryError> {
        Ok(self
            .linked(events::TEST_SUITE_STARTED, link_target)
            .iter()
            .map(Self::view)
            .collect())
    }

    async fn test_suite_finished(
        &self,
        link_target: &str,
    ) -> Result<Option<TestSuiteFinished>, QueryError> {
        Ok(self
            .linked(events::TEST_SUITE_FINISHED, link_target)
            .first()
            .map(Self::view))
    }
}

/// What the scripted test runner does when a sub suite is handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorBehavior {
    /// Publish started and finished events with a PASSED outcome.
    HappyPath,
    /// Publish only the started event; results never arrive.
    StartedOnly,
    /// Reject the start request with an HTTP-style error body.
    RejectStart,
}

/// Scripted stand-in for the external test runners.
pub struct FakeExecutor {
    bus: Arc<FakeBus>,
    behavior: ExecutorBehavior,
    definitions: Mutex<HashMap<String, SubSuiteDefinition>>,
    pub runs: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(bus: Arc<FakeBus>, behavior: ExecutorBehavior) -> Arc<Self> {
        Arc::new(Self {
            bus,
            behavior,
            definitions: Mutex::new(HashMap::new()),
            runs: AtomicUsize::new(0),
        })
    }

    pub fn register(&self, uri: String, definition: SubSuiteDefinition) {
        self.definitions.lock().unwrap().insert(uri, definition);
    }
}

#[async_trait]
impl ExecutorClient for FakeExecutor {
    async fn download_sub_suite(&self, uri: &str) -> Result<SubSuiteDefinition, ExecutorError> {
        self.definitions
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| ExecutorError::Definition {
                uri: uri.to_string(),
                message: "unknown sub suite".to_string(),
            })
    }

    async fn run_tests(&self, definition: &SubSuiteDefinition) -> Result<(), ExecutorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        // The controller passes the main suite id along in the definition so
        // the test runner knows which suite to link its events to.
        let main_suite_id = definition
            .extra
            .get("test_suite_started_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match self.behavior {
            ExecutorBehavior::RejectStart => Err(ExecutorError::TestStart(TestStartError {
                error: json!({"error": "nope"}),
            })),
            ExecutorBehavior::StartedOnly => {
                self.bus.publish_raw(
                    Event::new(events::TEST_SUITE_STARTED, json!({"name": definition.name}))
                        .link("CONTEXT", &main_suite_id),
                );
                Ok(())
            }
            ExecutorBehavior::HappyPath => {
                let started =
                    Event::new(events::TEST_SUITE_STARTED, json!({"name": definition.name}))
                        .link("CONTEXT", &main_suite_id);
                let started_id = started.meta.id.clone();
                self.bus.publish_raw(started);
                self.bus.publish_raw(
                    Event::new(
                        events::TEST_SUITE_FINISHED,
                        json!({
                            "testSuiteOutcome": {
                                "verdict": "PASSED",
                                "conclusion": "SUCCESSFUL",
                                "description": "All tests passed.",
                            }
                        }),
                    )
                    .link("TEST_SUITE_EXECUTION", &started_id),
                );
                Ok(())
            }
        }
    }
}

/// Scripted stand-in for the environment provider.
///
/// On `start` it announces one activity per main suite, defines the
/// configured number of sub suite environments under each and finishes the
/// activity, exactly like the provider's events look on a real bus.
pub struct FakeProvider {
    bus: Arc<FakeBus>,
    executor: Arc<FakeExecutor>,
    suites: Vec<(String, usize)>,
    fail_request: Option<String>,
    pub released: Mutex<Vec<String>>,
    pub full_releases: AtomicUsize,
}

impl FakeProvider {
    pub fn new(
        bus: Arc<FakeBus>,
        executor: Arc<FakeExecutor>,
        suites: Vec<(String, usize)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            executor,
            suites,
            fail_request: None,
            released: Mutex::new(Vec::new()),
            full_releases: AtomicUsize::new(0),
        })
    }

    pub fn failing(
        bus: Arc<FakeBus>,
        executor: Arc<FakeExecutor>,
        message: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            executor,
            suites: Vec::new(),
            fail_request: Some(message.to_string()),
            released: Mutex::new(Vec::new()),
            full_releases: AtomicUsize::new(0),
        })
    }

    pub fn released_environments(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvironmentProvider for FakeProvider {
    async fn main_suite_ids(
        &self,
        _testrun_id: &str,
        suite_count: usize,
    ) -> Result<Vec<String>, ProviderError> {
        Ok((0..suite_count)
            .map(|_| Uuid::new_v4().to_string())
            .collect())
    }

    async fn start(
        &self,
        _testrun_id: &str,
        main_suite_ids: &[String],
    ) -> Result<Option<String>, ProviderError> {
        if let Some(message) = &self.fail_request {
            return Err(ProviderError::Response(message.clone()));
        }
        for (index, main_suite_id) in main_suite_ids.iter().enumerate() {
            let (name, sub_suites) = self
                .suites
                .get(index)
                .cloned()
                .unwrap_or_else(|| ("Suite".to_string(), 1));
            let activity = Event::new(
                events::ACTIVITY_TRIGGERED,
                json!({"name": "Environment Provider"}),
            )
            .link("CONTEXT", main_suite_id);
            let activity_id = activity.meta.id.clone();
            self.bus.publish_raw(activity);

            for number in 1..=sub_suites {
                let sub_suite_name = format!("{name}_SubSuite_{number}");
                let uri = format!(
                    "http://environment-provider/sub_suite/{}",
                    Uuid::new_v4()
                );
                let definition: SubSuiteDefinition = serde_json::from_value(json!({
                    "name": sub_suite_name,
                    "priority": 1,
                    "recipes": [],
                    "test_suite_started_id": main_suite_id,
                    "executor": {
                        "id": format!("execution-space-{number}"),
                        "request": {
                            "method": "POST",
                            "url": "http://test-runner/start",
                            "json": {"suite": sub_suite_name},
                        }
                    }
                }))
                .unwrap();
                self.executor.register(uri.clone(), definition);
                self.bus.publish_raw(
                    Event::new(
                        events::ENVIRONMENT_DEFINED,
                        json!({"name": sub_suite_name, "uri": uri}),
                    )
                    .link("CONTEXT", &activity_id),
                );
            }
            self.bus.publish_raw(
                Event::new(
                    events::ACTIVITY_FINISHED,
                    json!({"activityOutcome": {"conclusion": "SUCCESSFUL"}}),
                )
                .link("CONTEXT", &activity_id),
            );
        }
        Ok(Some("environment-task-1".to_string()))
    }

    async fn check(&self, _testrun_id: &str) -> Result<Provisioning, ProviderError> {
        Ok(Provisioning::Ready)
    }

    async fn release_sub_suite(
        &self,
        _testrun_id: &str,
        definition: &SubSuiteDefinition,
    ) -> Result<(), ProviderError> {
        self.released
            .lock()
            .unwrap()
            .push(definition.id.clone().unwrap_or_default());
        Ok(())
    }

    async fn release_all(&self, _testrun_id: &str) -> Result<(), ProviderError> {
        self.full_releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A recipe collection event document, shaped like the ones the suite
/// runner is triggered with.
pub fn tercc(testrun_id: &str, artifact_id: &str, batches: &[(&str, usize)]) -> Value {
    let batches: Vec<Value> = batches
        .iter()
        .map(|(name, recipes)| {
            let recipes: Vec<Value> = (0..*recipes)
                .map(|_| {
                    json!({
                        "id": Uuid::new_v4().to_string(),
                        "testCase": {"id": "test_case", "tracker": "", "uri": ""},
                        "constraints": [
                            {"key": "ENVIRONMENT", "value": {}},
                            {"key": "PARAMETERS", "value": {}},
                            {"key": "COMMAND", "value": "exit 0"},
                            {"key": "EXECUTE", "value": []},
                            {"key": "CHECKOUT", "value": ["git clone https://github.com/eiffel-community/etos.git"]},
                            {"key": "TEST_RUNNER", "value": "registry.example.com/test-runner:1.0.0"}
                        ]
                    })
                })
                .collect();
            json!({"name": name, "priority": 1, "recipes": recipes})
        })
        .collect();
    json!({
        "meta": {
            "type": "EiffelTestExecutionRecipeCollectionCreatedEvent",
            "id": testrun_id,
            "time": 1664260578384u64,
            "version": "4.1.1",
        },
        "data": {
            "selectionStrategy": {"id": Uuid::new_v4().to_string()},
            "batches": batches,
        },
        "links": [{"type": "CAUSE", "target": artifact_id}],
    })
}

/// The artifact created event the testrun links to.
pub fn artifact_created_event(artifact_id: &str) -> Event {
    Event::new(
        events::ARTIFACT_CREATED,
        json!({"identity": "pkg:etos/suite-runner@1.0.0"}),
    )
    .with_id(artifact_id)
}

/// Parameters for scenario runs: short timeouts, everything else default.
pub fn parameters(tercc: &Value) -> etos_suite_runner::Parameters {
    let mut params = etos_suite_runner::Parameters::default();
    params.source_host = Some("localhost".to_string());
    params.suite_runner_image = Some("registry.example.com/suite-runner:1.0.0".to_string());
    params.tercc = Some(tercc.to_string());
    params.wait_for_environment_timeout = std::time::Duration::from_secs(20);
    params.test_result_timeout = std::time::Duration::from_secs(120);
    params
}
