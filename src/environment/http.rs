//! Direct HTTP mode of the environment provider.
//!
//! The handoff is task based: a POST with the testrun id and the main suite
//! ids returns a task id, which is then polled until the provider reports
//! SUCCESS or FAILURE. Releases go through the same endpoint with `release`
//! (full) or `single_release` (one environment) query parameters.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::{EnvironmentProvider, ProviderError, Provisioning};
use crate::executor::SubSuiteDefinition;

/// Environment provider reached over its HTTP API.
pub struct HttpEnvironmentProvider {
    client: reqwest::Client,
    url: String,
    release_timeout: Duration,
    task_id: Mutex<Option<String>>,
}

impl HttpEnvironmentProvider {
    pub fn new(client: reqwest::Client, url: String, release_timeout: Duration) -> Self {
        Self {
            client,
            url,
            release_timeout,
            task_id: Mutex::new(None),
        }
    }

    fn current_task_id(&self) -> Option<String> {
        self.task_id
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

#[async_trait]
impl EnvironmentProvider for HttpEnvironmentProvider {
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
        testrun_id: &str,
        main_suite_ids: &[String],
    ) -> Result<Option<String>, ProviderError> {
        let response: Value = self
            .client
            .post(&self.url)
            .json(&json!({
                "suite_id": testrun_id,
                "suite_runner_ids": main_suite_ids,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.get("error").and_then(Value::as_str) {
            return Err(ProviderError::Response(error.to_string()));
        }
        let task_id = response
            .pointer("/data/id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProviderError::Response(
                    "Environment provider did not return a task id".to_string(),
                )
            })?
            .to_string();
        *self
            .task_id
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(task_id.clone());
        Ok(Some(task_id))
    }

    async fn check(&self, _testrun_id: &str) -> Result<Provisioning, ProviderError> {
        let Some(task_id) = self.current_task_id() else {
            return Ok(Provisioning::Pending);
        };
        let response: Value = self
            .client
            .get(&self.url)
            .query(&[("id", task_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let status = response
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("PENDING");
        match status {
            "SUCCESS" => Ok(Provisioning::Ready),
            "FAILURE" => {
                let error = response
                    .pointer("/result/error")
                    .and_then(Value::as_str)
                    .unwrap_or("Environment provider failed without an error message");
                Ok(Provisioning::Failed(error.to_string()))
            }
            _ => Ok(Provisioning::Pending),
        }
    }

    async fn release_sub_suite(
        &self,
        _testrun_id: &str,
        definition: &SubSuiteDefinition,
    ) -> Result<(), ProviderError> {
        let environment_id = definition.id.as_deref().ok_or_else(|| {
            ProviderError::Response("Sub suite definition has no environment id".to_string())
        })?;
        self.client
            .get(&self.url)
            .query(&[("single_release", environment_id)])
            .timeout(self.release_timeout)
            .send()
            .await?
            .error_for_status()?;
        debug!(environment_id, "Released sub suite environment");
        Ok(())
    }

    async fn release_all(&self, _testrun_id: &str) -> Result<(), ProviderError> {
        let Some(task_id) = self.current_task_id() else {
            // Nothing was requested, nothing to release.
            return Ok(());
        };
        self.client
            .get(&self.url)
            .query(&[("release", task_id.as_str())])
            .timeout(self.release_timeout)
            .send()
            .await?
            .error_for_status()?;
        debug!(task_id, "Released the full environment");
        Ok(())
    }
}
