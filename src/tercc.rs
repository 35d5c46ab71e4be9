//! Recipe collection parsing.
//!
//! A testrun is triggered with a recipe collection: either an event whose
//! `data.batches` (or a document behind `data.batchesUri`) lists the suites
//! to run, or directly a list of pre-shaped suites. Each batch carries
//! recipes whose execution directives are encoded as constraint records;
//! parsing maps those onto the typed [`Execution`] the rest of the runner
//! works with.
//!
//! Parsing is lenient: unknown fields are ignored and missing directives
//! fall back to defaults, mirroring the permissive inputs test suites are
//! triggered with in practice.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single test suite to execute in a testrun.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suite {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub tests: Vec<Test>,
}

fn default_priority() -> i64 {
    1
}

/// A single test case specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Test {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub execution: Execution,
    #[serde(rename = "testCase", default)]
    pub test_case: TestCase,
}

/// Metadata about the test case behind a recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub tracker: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// How to execute a single test case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    #[serde(default)]
    pub checkout: Vec<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub test_runner: String,
    #[serde(default)]
    pub environment: HashMap<String, Value>,
    #[serde(default)]
    pub execute: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl Suite {
    /// Builds a suite from one recipe collection batch.
    pub fn from_tercc(batch: &Value) -> Suite {
        let recipes = batch
            .get("recipes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Suite {
            name: batch
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("NoName")
                .to_string(),
            priority: batch.get("priority").and_then(Value::as_i64).unwrap_or(1),
            tests: Self::tests_from_recipes(&recipes),
        }
    }

    /// Maps recipe constraint records onto typed executions.
    pub fn tests_from_recipes(recipes: &[Value]) -> Vec<Test> {
        let mut tests = Vec::with_capacity(recipes.len());
        for recipe in recipes {
            let mut execution = Execution::default();
            for constraint in recipe
                .get("constraints")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let value = constraint.get("value").cloned().unwrap_or(Value::Null);
                match constraint.get("key").and_then(Value::as_str) {
                    Some("ENVIRONMENT") => {
                        execution.environment =
                            serde_json::from_value(value).unwrap_or_default();
                    }
                    Some("PARAMETERS") => {
                        execution.parameters = serde_json::from_value(value).unwrap_or_default();
                    }
                    Some("COMMAND") => {
                        execution.command =
                            value.as_str().map(str::to_string).unwrap_or_default();
                    }
                    Some("EXECUTE") => {
                        execution.execute = serde_json::from_value(value).unwrap_or_default();
                    }
                    Some("CHECKOUT") => {
                        execution.checkout = serde_json::from_value(value).unwrap_or_default();
                    }
                    Some("TEST_RUNNER") => {
                        execution.test_runner =
                            value.as_str().map(str::to_string).unwrap_or_default();
                    }
                    _ => {}
                }
            }

            // Older collections use "url" for the test case URI.
            let mut test_case = recipe.get("testCase").cloned().unwrap_or(Value::Null);
            if let Some(object) = test_case.as_object_mut() {
                if let Some(url) = object.remove("url") {
                    object.entry("uri").or_insert(url);
                }
            }

            tests.push(Test {
                id: recipe
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                execution,
                test_case: serde_json::from_value(test_case).unwrap_or_default(),
            });
        }
        tests
    }
}

/// Builds all suites from the batches of a recipe collection, preserving
/// their order.
pub fn suites_from_batches(batches: &[Value]) -> Vec<Suite> {
    batches.iter().map(Suite::from_tercc).collect()
}
