//! Query side of the event bus.
//!
//! The bus is queried through a GraphQL server. This module is a stateless
//! set of typed lookups — one query shape per event kind the runner needs to
//! observe — behind the [`EventQuery`] seam, with [`GraphqlQuery`] as the
//! HTTP implementation. Responses are decoded from the conventional
//! `data.<query>.edges[].node` envelope.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::verdict::SuiteOutcome;

/// Errors from querying the event bus.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The GraphQL server could not be reached or returned an error status.
    #[error("GraphQL request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The GraphQL server reported query errors.
    #[error("GraphQL server error: {0}")]
    Server(String),

    /// The response envelope did not decode.
    #[error("Failed to decode GraphQL response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Event metadata as returned by queries.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMetaView {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactCreated {
    pub meta: EventMetaView,
    #[serde(default)]
    pub data: ArtifactCreatedData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactCreatedData {
    #[serde(default)]
    pub identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipeCollectionCreated {
    pub meta: EventMetaView,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityTriggered {
    pub meta: EventMetaView,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityFinished {
    pub meta: EventMetaView,
    #[serde(default)]
    pub data: ActivityFinishedData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityFinishedData {
    #[serde(rename = "activityOutcome", default)]
    pub activity_outcome: ActivityOutcome,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityOutcome {
    #[serde(default)]
    pub conclusion: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentDefined {
    pub meta: EventMetaView,
    #[serde(default)]
    pub data: EnvironmentDefinedData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentDefinedData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestSuiteStarted {
    pub meta: EventMetaView,
    #[serde(default)]
    pub data: TestSuiteStartedData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSuiteStartedData {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestSuiteFinished {
    pub meta: EventMetaView,
    #[serde(default)]
    pub data: TestSuiteFinishedData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSuiteFinishedData {
    #[serde(rename = "testSuiteOutcome", default)]
    pub test_suite_outcome: SuiteOutcome,
}

/// Typed lookups over the event bus.
#[async_trait]
pub trait EventQuery: Send + Sync {
    /// The artifact created event with the given id.
    async fn artifact_created(&self, artifact_id: &str)
        -> Result<Option<ArtifactCreated>, QueryError>;

    /// The recipe collection event with the given id.
    async fn recipe_collection(
        &self,
        testrun_id: &str,
    ) -> Result<Option<RecipeCollectionCreated>, QueryError>;

    /// The activity triggered event linking to `link_target`.
    async fn activity_triggered(
        &self,
        link_target: &str,
    ) -> Result<Option<ActivityTriggered>, QueryError>;

    /// The activity finished event linking to `link_target`.
    async fn activity_finished(
        &self,
        link_target: &str,
    ) -> Result<Option<ActivityFinished>, QueryError>;

    /// All environment defined events linking to `link_target`.
    async fn environments_defined(
        &self,
        link_target: &str,
    ) -> Result<Vec<EnvironmentDefined>, QueryError>;

    /// All test suite started events linking to `link_target`.
    async fn test_suites_started(
        &self,
        link_target: &str,
    ) -> Result<Vec<TestSuiteStarted>, QueryError>;

    /// The test suite finished event linking to `link_target`.
    async fn test_suite_finished(
        &self,
        link_target: &str,
    ) -> Result<Option<TestSuiteFinished>, QueryError>;
}

/// GraphQL-backed implementation of [`EventQuery`].
pub struct GraphqlQuery {
    client: reqwest::Client,
    server: String,
}

impl GraphqlQuery {
    pub fn new(client: reqwest::Client, server: String) -> Self {
        Self { client, server }
    }

    async fn execute(&self, query: String) -> Result<Value, QueryError> {
        let response = self
            .client
            .post(&self.server)
            .json(&serde_json::json!({"query": query}))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors") {
            return Err(QueryError::Server(errors.to_string()));
        }
        Ok(body)
    }

    async fn nodes<T: DeserializeOwned>(
        &self,
        query: String,
        key: &str,
    ) -> Result<Vec<T>, QueryError> {
        let body = self.execute(query).await?;
        decode_nodes(&body, key)
    }
}

/// Decodes `data.<key>.edges[].node` into typed views.
fn decode_nodes<T: DeserializeOwned>(body: &Value, key: &str) -> Result<Vec<T>, QueryError> {
    let mut nodes = Vec::new();
    if let Some(edges) = body
        .pointer(&format!("/data/{key}/edges"))
        .and_then(Value::as_array)
    {
        for edge in edges {
            if let Some(node) = edge.get("node") {
                nodes.push(serde_json::from_value(node.clone())?);
            }
        }
    }
    Ok(nodes)
}

/// A query for events linking to a target event.
fn search_by_link(query_name: &str, target: &str, fields: &str) -> String {
    format!(
        "{{ {query_name}(search: \"{{'links.target': '{target}'}}\") {{ edges {{ node {fields} }} }} }}"
    )
}

/// A query for an event by its id.
fn search_by_id(query_name: &str, id: &str, fields: &str) -> String {
    format!(
        "{{ {query_name}(search: \"{{'meta.id': '{id}'}}\") {{ edges {{ node {fields} }} }} }}"
    )
}

#[async_trait]
impl EventQuery for GraphqlQuery {
    async fn artifact_created(
        &self,
        artifact_id: &str,
    ) -> Result<Option<ArtifactCreated>, QueryError> {
        let query = search_by_id(
            "artifactCreated",
            artifact_id,
            "{ data { identity } meta { id } }",
        );
        Ok(self.nodes(query, "artifactCreated").await?.into_iter().next())
    }

    async fn recipe_collection(
        &self,
        testrun_id: &str,
    ) -> Result<Option<RecipeCollectionCreated>, QueryError> {
        let query = search_by_id(
            "testExecutionRecipeCollectionCreated",
            testrun_id,
            "{ meta { id } }",
        );
        Ok(self
            .nodes(query, "testExecutionRecipeCollectionCreated")
            .await?
            .into_iter()
            .next())
    }

    async fn activity_triggered(
        &self,
        link_target: &str,
    ) -> Result<Option<ActivityTriggered>, QueryError> {
        let query = search_by_link("activityTriggered", link_target, "{ meta { id } }");
        Ok(self
            .nodes(query, "activityTriggered")
            .await?
            .into_iter()
            .next())
    }

    async fn activity_finished(
        &self,
        link_target: &str,
    ) -> Result<Option<ActivityFinished>, QueryError> {
        let query = search_by_link(
            "activityFinished",
            link_target,
            "{ data { activityOutcome { conclusion description } } meta { id } }",
        );
        Ok(self
            .nodes(query, "activityFinished")
            .await?
            .into_iter()
            .next())
    }

    async fn environments_defined(
        &self,
        link_target: &str,
    ) -> Result<Vec<EnvironmentDefined>, QueryError> {
        let query = search_by_link(
            "environmentDefined",
            link_target,
            "{ data { name uri } meta { id } }",
        );
        self.nodes(query, "environmentDefined").await
    }

    async fn test_suites_started(
        &self,
        link_target: &str,
    ) -> Result<Vec<TestSuiteStarted>, QueryError> {
        let query = search_by_link(
            "testSuiteStarted",
            link_target,
            "{ data { name } meta { id } }",
        );
        self.nodes(query, "testSuiteStarted").await
    }

    async fn test_suite_finished(
        &self,
        link_target: &str,
    ) -> Result<Option<TestSuiteFinished>, QueryError> {
        let query = search_by_link(
            "testSuiteFinished",
            link_target,
            "{ data { testSuiteOutcome { verdict conclusion description } } meta { id } }",
        );
        Ok(self
            .nodes(query, "testSuiteFinished")
            .await?
            .into_iter()
            .next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_queries_have_the_expected_shape() {
        let query = search_by_link("testSuiteStarted", "main-suite", "{ meta { id } }");
        assert_eq!(
            query,
            "{ testSuiteStarted(search: \"{'links.target': 'main-suite'}\") { edges { node { meta { id } } } } }"
        );
        let query = search_by_id("artifactCreated", "artifact", "{ meta { id } }");
        assert!(query.contains("'meta.id': 'artifact'"));
    }

    #[test]
    fn nodes_decode_from_the_edge_envelope() {
        let body = json!({
            "data": {
                "testSuiteStarted": {
                    "edges": [
                        {"node": {"meta": {"id": "1"}, "data": {"name": "Suite_SubSuite_1"}}},
                        {"node": {"meta": {"id": "2"}, "data": {"name": "Suite_SubSuite_2"}}}
                    ]
                }
            }
        });
        let nodes: Vec<TestSuiteStarted> = decode_nodes(&body, "testSuiteStarted").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].data.name, "Suite_SubSuite_1");
    }

    #[test]
    fn missing_edges_decode_to_nothing() {
        let body = json!({"data": {"testSuiteStarted": null}});
        let nodes: Vec<TestSuiteStarted> = decode_nodes(&body, "testSuiteStarted").unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn outcome_fields_are_optional() {
        let body = json!({
            "data": {
                "testSuiteFinished": {
                    "edges": [{"node": {"meta": {"id": "1"}, "data": {"testSuiteOutcome": {"verdict": "PASSED"}}}}]
                }
            }
        });
        let nodes: Vec<TestSuiteFinished> = decode_nodes(&body, "testSuiteFinished").unwrap();
        assert_eq!(
            nodes[0].data.test_suite_outcome.verdict.as_deref(),
            Some("PASSED")
        );
        assert!(nodes[0].data.test_suite_outcome.description.is_none());
    }
}
