//! Operator mode of the environment provider.
//!
//! When the runner executes under the external controller, environment
//! requests are Kubernetes resources the controller created ahead of us: the
//! runner only watches their `Ready` conditions and, on the way out, deletes
//! the `Environment` resources labeled with the testrun id.

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{EnvironmentProvider, ProviderError, Provisioning};
use crate::executor::SubSuiteDefinition;

/// Label carrying the testrun id on environment resources.
pub const ID_LABEL: &str = "etos.eiffel-community.github.io/id";

/// An environment request owned by the controller.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "etos.eiffel-community.github.io",
    version = "v1alpha1",
    kind = "EnvironmentRequest",
    namespaced,
    status = "EnvironmentRequestStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRequestSpec {
    /// Main suite id this request provisions environments for.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct EnvironmentRequestStatus {
    #[serde(default)]
    pub conditions: Vec<RequestCondition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RequestCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// A provisioned environment resource.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "etos.eiffel-community.github.io",
    version = "v1alpha1",
    kind = "Environment",
    namespaced
)]
pub struct EnvironmentSpec {}

/// Environment provider driven through the Kubernetes API.
pub struct ClusterEnvironmentProvider {
    client: Client,
    namespace: String,
}

impl ClusterEnvironmentProvider {
    /// Connects with in-cluster (or kubeconfig) credentials.
    pub async fn new() -> Result<Self, ProviderError> {
        let client = Client::try_default().await?;
        let namespace = client.default_namespace().to_string();
        Ok(Self { client, namespace })
    }

    fn requests(&self) -> Api<EnvironmentRequest> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn environments(&self) -> Api<Environment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn selector(testrun_id: &str) -> String {
        format!("{ID_LABEL}={testrun_id}")
    }

    async fn delete_environment(&self, name: &str) -> Result<(), ProviderError> {
        match self
            .environments()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Already gone is as released as it gets.
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for ClusterEnvironmentProvider {
    async fn main_suite_ids(
        &self,
        testrun_id: &str,
        _suite_count: usize,
    ) -> Result<Vec<String>, ProviderError> {
        let requests = self
            .requests()
            .list(&ListParams::default().labels(&Self::selector(testrun_id)))
            .await?;
        Ok(requests
            .items
            .into_iter()
            .map(|request| request.spec.id)
            .collect())
    }

    async fn start(
        &self,
        _testrun_id: &str,
        _main_suite_ids: &[String],
    ) -> Result<Option<String>, ProviderError> {
        // The controller created the environment requests before we started.
        Ok(None)
    }

    async fn check(&self, testrun_id: &str) -> Result<Provisioning, ProviderError> {
        let requests = self
            .requests()
            .list(&ListParams::default().labels(&Self::selector(testrun_id)))
            .await?;
        let total = requests.items.len();
        let mut found = false;
        let mut done = 0;
        let mut failures: Vec<String> = Vec::new();
        for request in &requests.items {
            let conditions = request
                .status
                .as_ref()
                .map(|status| status.conditions.as_slice())
                .unwrap_or_default();
            for condition in conditions {
                if !condition.condition_type.eq_ignore_ascii_case("ready") {
                    continue;
                }
                found = true;
                let ready = condition.status.eq_ignore_ascii_case("true");
                if ready {
                    continue;
                }
                if condition.reason.eq_ignore_ascii_case("failed") {
                    failures.push(condition.message.clone());
                } else if condition.reason.eq_ignore_ascii_case("done") {
                    done += 1;
                }
            }
        }
        if found && !failures.is_empty() {
            return Ok(Provisioning::Failed(
                failures.pop().unwrap_or_else(|| {
                    "Environment provider failed without an error message".to_string()
                }),
            ));
        }
        if found && total > 0 && done == total {
            return Ok(Provisioning::Ready);
        }
        Ok(Provisioning::Pending)
    }

    async fn release_sub_suite(
        &self,
        _testrun_id: &str,
        definition: &SubSuiteDefinition,
    ) -> Result<(), ProviderError> {
        let name = definition.executor.id.as_deref().ok_or_else(|| {
            ProviderError::Response("Sub suite definition has no executor id".to_string())
        })?;
        self.delete_environment(name).await?;
        debug!(environment = name, "Deleted environment resource");
        Ok(())
    }

    async fn release_all(&self, testrun_id: &str) -> Result<(), ProviderError> {
        let environments = self
            .environments()
            .list(&ListParams::default().labels(&Self::selector(testrun_id)))
            .await?;
        for environment in environments.items {
            let name = environment.name_any();
            self.delete_environment(&name).await?;
        }
        info!("Deleted all environment resources for the testrun");
        Ok(())
    }
}
