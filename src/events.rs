//! Event model and publishing.
//!
//! The runner communicates with the rest of the system over an append-only
//! event bus. Only the fields the runner reads or writes are modeled; event
//! data is otherwise carried as raw JSON. Publishing goes through the
//! [`EventPublisher`] seam so scenario tests can run against an in-memory
//! bus while production uses the AMQP transport in [`amqp`].

pub mod amqp;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const ACTIVITY_TRIGGERED: &str = "EiffelActivityTriggeredEvent";
pub const ACTIVITY_STARTED: &str = "EiffelActivityStartedEvent";
pub const ACTIVITY_FINISHED: &str = "EiffelActivityFinishedEvent";
pub const ACTIVITY_CANCELED: &str = "EiffelActivityCanceledEvent";
pub const ENVIRONMENT_DEFINED: &str = "EiffelEnvironmentDefinedEvent";
pub const TEST_SUITE_STARTED: &str = "EiffelTestSuiteStartedEvent";
pub const TEST_SUITE_FINISHED: &str = "EiffelTestSuiteFinishedEvent";
pub const ANNOUNCEMENT_PUBLISHED: &str = "EiffelAnnouncementPublishedEvent";
pub const ARTIFACT_CREATED: &str = "EiffelArtifactCreatedEvent";
pub const RECIPE_COLLECTION_CREATED: &str = "EiffelTestExecutionRecipeCollectionCreatedEvent";

/// Event metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub time: i64,
}

/// A link from one event to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Link {
    #[serde(rename = "type")]
    pub link_type: String,
    pub target: String,
}

/// One event as published to (or read from) the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub meta: EventMeta,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Event {
    /// A new event with a generated id and the current timestamp.
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            meta: EventMeta {
                id: Uuid::new_v4().to_string(),
                event_type: event_type.to_string(),
                version: "1.0.0".to_string(),
                time: Utc::now().timestamp_millis(),
            },
            data,
            links: Vec::new(),
        }
    }

    /// Overrides the generated event id.
    ///
    /// Used where the id is a correlation key decided before the event
    /// exists, e.g. the main suite id on a test suite started event.
    pub fn with_id(mut self, id: &str) -> Self {
        self.meta.id = id.to_string();
        self
    }

    /// Adds a link to another event.
    pub fn link(mut self, link_type: &str, target: &str) -> Self {
        self.links.push(Link {
            link_type: link_type.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Whether any link points at `target`.
    pub fn links_to(&self, target: &str) -> bool {
        self.links.iter().any(|link| link.target == target)
    }
}

/// Severity of an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// The activity triggered event opening a testrun.
pub fn activity_triggered(name: &str, testrun_id: &str, iut_id: &str) -> Event {
    Event::new(
        ACTIVITY_TRIGGERED,
        json!({
            "name": name,
            "executionType": "AUTOMATED",
            "triggers": [{"type": "EIFFEL_EVENT"}],
        }),
    )
    .link("CAUSE", testrun_id)
    .link("CAUSE", iut_id)
}

pub fn activity_started(activity_id: &str) -> Event {
    Event::new(ACTIVITY_STARTED, json!({})).link("CONTEXT", activity_id)
}

pub fn activity_finished(activity_id: &str, conclusion: &str) -> Event {
    Event::new(
        ACTIVITY_FINISHED,
        json!({"activityOutcome": {"conclusion": conclusion}}),
    )
    .link("CONTEXT", activity_id)
}

pub fn activity_canceled(activity_id: &str, reason: &str) -> Event {
    Event::new(ACTIVITY_CANCELED, json!({"reason": reason})).link("CONTEXT", activity_id)
}

/// Self-announce which suite runner image is executing this testrun.
pub fn environment_defined(activity_id: &str, name: &str, image: &str) -> Event {
    Event::new(ENVIRONMENT_DEFINED, json!({"name": name, "image": image}))
        .link("CONTEXT", activity_id)
}

/// The test suite started event for one main suite.
///
/// The event id is the main suite id, so that test runners and environment
/// providers can link back to it.
pub fn test_suite_started(
    main_suite_id: &str,
    activity_id: &str,
    testrun_id: &str,
    name: &str,
    product: Option<&str>,
) -> Event {
    let mut categories = vec!["Regression test suite".to_string()];
    if let Some(product) = product {
        categories.push(product.to_string());
    }
    Event::new(
        TEST_SUITE_STARTED,
        json!({
            "name": name,
            "categories": categories,
            "types": ["FUNCTIONAL"],
        }),
    )
    .with_id(main_suite_id)
    .link("CONTEXT", activity_id)
    .link("TERC", testrun_id)
}

pub fn test_suite_finished(
    activity_id: &str,
    test_suite_started_id: &str,
    verdict: &str,
    conclusion: &str,
    description: &str,
) -> Event {
    Event::new(
        TEST_SUITE_FINISHED,
        json!({
            "testSuiteOutcome": {
                "verdict": verdict,
                "conclusion": conclusion,
                "description": description,
            }
        }),
    )
    .link("CONTEXT", activity_id)
    .link("TEST_SUITE_EXECUTION", test_suite_started_id)
}

/// A user-facing status line.
pub fn announcement(
    activity_id: Option<&str>,
    heading: &str,
    body: &str,
    severity: Severity,
) -> Event {
    let event = Event::new(
        ANNOUNCEMENT_PUBLISHED,
        json!({
            "heading": heading,
            "body": body,
            "severity": severity.as_str(),
        }),
    );
    match activity_id {
        Some(activity_id) => event.link("CONTEXT", activity_id),
        None => event,
    }
}

/// The recipe collection event, published in operator mode when the testrun
/// event is missing from the bus.
pub fn recipe_collection_created(testrun_id: &str, iut_id: &str, batches_uri: &str) -> Event {
    Event::new(
        RECIPE_COLLECTION_CREATED,
        json!({
            "selectionStrategy": {"tracker": "Suite Builder", "id": Uuid::new_v4().to_string()},
            "batchesUri": batches_uri,
        }),
    )
    .with_id(testrun_id)
    .link("CAUSE", iut_id)
}

/// Errors from publishing events.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The event could not be serialized.
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The bus transport rejected or dropped the event.
    #[error("Event bus transport error: {0}")]
    Transport(String),
}

/// Publishing capability over the event bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), PublishError>;
}
