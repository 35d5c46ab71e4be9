//! Runner parameters.
//!
//! All configuration comes from the environment of the single process
//! invocation; derived facts (the recipe collection document, the suite
//! list, the testrun id, the artifact under test, the product name) are
//! computed once and cached. Each of those is set exactly once and never
//! changes for the lifetime of the testrun.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::query::{ArtifactCreated, EventQuery};
use crate::tercc::{self, Suite};
use crate::Error;

/// Immutable configuration plus memoized derived facts.
pub struct Parameters {
    /// Identity string set as the source host on outbound events.
    pub source_host: Option<String>,
    /// Operator-mode identifier; doubles as the testrun id when set.
    pub identifier: Option<String>,
    /// Artifact (IUT) event id, overriding the bus lookup.
    pub artifact: Option<String>,
    /// Package URL of the IUT, overriding the bus lookup.
    pub identity: Option<String>,
    /// Image reference for the self-announce environment event.
    pub suite_runner_image: Option<String>,
    /// Where the recipe batches were downloaded from, for the recipe
    /// collection event published in operator mode.
    pub suite_source: Option<String>,
    /// Raw recipe collection JSON from the `TERCC` variable.
    pub tercc: Option<String>,
    /// Key for decrypting executor passwords.
    pub encryption_key: Option<String>,
    /// GraphQL server for event queries.
    pub graphql_server: Option<String>,
    /// Environment provider API (direct mode).
    pub environment_provider_url: Option<String>,

    pub wait_for_environment_timeout: Duration,
    pub test_result_timeout: Duration,
    pub http_timeout: Duration,
    pub release_timeout: Duration,
    pub environment_poll_interval: Duration,
    pub result_poll_interval: Duration,

    /// Where the final verdict triple is written.
    pub termination_log: PathBuf,

    http: reqwest::Client,
    document: OnceLock<Value>,
    suites: OnceCell<Vec<Suite>>,
    testrun_id: OnceLock<String>,
    artifact_event: OnceCell<Option<ArtifactCreated>>,
    product: OnceCell<Option<String>>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            source_host: None,
            identifier: None,
            artifact: None,
            identity: None,
            suite_runner_image: None,
            suite_source: None,
            tercc: None,
            encryption_key: None,
            graphql_server: None,
            environment_provider_url: None,
            wait_for_environment_timeout: Duration::from_secs(3600),
            test_result_timeout: Duration::from_secs(24 * 3600),
            http_timeout: Duration::from_secs(3600),
            release_timeout: Duration::from_secs(60),
            environment_poll_interval: Duration::from_secs(5),
            result_poll_interval: Duration::from_secs(10),
            termination_log: PathBuf::from("/dev/termination-log"),
            http: reqwest::Client::new(),
            document: OnceLock::new(),
            suites: OnceCell::new(),
            testrun_id: OnceLock::new(),
            artifact_event: OnceCell::new(),
            product: OnceCell::new(),
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_seconds(name: &str) -> crate::Result<Option<Duration>> {
    match env(name) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(|seconds| Some(Duration::from_secs(seconds)))
            .map_err(|_| Error::Config(format!("{name} is not a valid number of seconds"))),
    }
}

impl Parameters {
    /// Reads parameters from the process environment.
    ///
    /// `ESR_WAIT_FOR_ENVIRONMENT_TIMEOUT` is mandatory; everything else
    /// falls back to defaults or is verified later by [`verify`](Self::verify).
    pub fn from_env() -> crate::Result<Self> {
        let wait_for_environment_timeout = env_seconds("ESR_WAIT_FOR_ENVIRONMENT_TIMEOUT")?
            .ok_or_else(|| {
                Error::Config(
                    "ESR_WAIT_FOR_ENVIRONMENT_TIMEOUT environment variable not provided."
                        .to_string(),
                )
            })?;
        let mut params = Self::default();
        params.source_host = env("SOURCE_HOST");
        params.identifier = env("IDENTIFIER");
        params.artifact = env("ARTIFACT");
        params.identity = env("IDENTITY");
        params.suite_runner_image = env("SUITE_RUNNER");
        params.suite_source = env("SUITE_SOURCE");
        params.tercc = env("TERCC");
        params.encryption_key = env("ETOS_ENCRYPTION_KEY");
        params.graphql_server = env("ETOS_GRAPHQL_SERVER");
        params.environment_provider_url = env("ETOS_ENVIRONMENT_PROVIDER");
        params.wait_for_environment_timeout = wait_for_environment_timeout;
        if let Some(timeout) = env_seconds("ETOS_DEFAULT_TEST_RESULT_TIMEOUT")? {
            params.test_result_timeout = timeout;
        }
        if let Some(timeout) = env_seconds("ETOS_DEFAULT_HTTP_TIMEOUT")? {
            params.http_timeout = timeout;
        }
        if let Some(path) = env("TERMINATION_LOG") {
            params.termination_log = PathBuf::from(path);
        }
        Ok(params)
    }

    /// Whether the runner executes under the external controller.
    pub fn operator_mode(&self) -> bool {
        self.identifier.is_some()
    }

    /// Verifies that the required inputs are present.
    pub fn verify(&self) -> crate::Result<()> {
        if self.source_host.is_none() {
            return Err(Error::Config(
                "SOURCE_HOST environment variable not provided.".to_string(),
            ));
        }
        if self.tercc.is_none() {
            return Err(Error::Config(
                "TERCC environment variable not provided.".to_string(),
            ));
        }
        Ok(())
    }

    /// The parsed recipe collection document.
    fn tercc_document(&self) -> crate::Result<&Value> {
        if let Some(document) = self.document.get() {
            return Ok(document);
        }
        let raw = self.tercc.as_deref().ok_or_else(|| {
            Error::Config("TERCC environment variable not provided.".to_string())
        })?;
        let document: Value = serde_json::from_str(raw)
            .map_err(|err| Error::Config(format!("TERCC is not valid JSON: {err}")))?;
        let _ = self.document.set(document);
        Ok(self.document.get().expect("document was just set"))
    }

    /// The testrun id: the operator-mode identifier when present, otherwise
    /// the id of the recipe collection event. Set exactly once.
    pub fn testrun_id(&self) -> crate::Result<String> {
        if let Some(id) = self.testrun_id.get() {
            return Ok(id.clone());
        }
        let id = match &self.identifier {
            Some(identifier) => identifier.clone(),
            None => self
                .tercc_document()?
                .pointer("/meta/id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Config(
                        "testrun id is not set, neither in the recipe collection nor the \
                         IDENTIFIER environment variable"
                            .to_string(),
                    )
                })?,
        };
        let _ = self.testrun_id.set(id.clone());
        Ok(id)
    }

    /// The suites to run, parsed (and downloaded, when the collection points
    /// at a `batchesUri`) once.
    pub async fn test_suite(&self) -> crate::Result<Vec<Suite>> {
        self.suites
            .get_or_try_init(|| async {
                let document = self.tercc_document()?.clone();
                if document.is_array() {
                    return serde_json::from_value(document).map_err(|err| {
                        Error::Config(format!("Failed to parse suites from TERCC: {err}"))
                    });
                }
                let batches = document.pointer("/data/batches");
                let batches_uri = document
                    .pointer("/data/batchesUri")
                    .and_then(Value::as_str);
                match (batches, batches_uri) {
                    (Some(_), Some(_)) => Err(Error::Config(
                        "Only one of 'batches' or 'batchesUri' shall be set".to_string(),
                    )),
                    (Some(batches), None) => {
                        let batches = batches.as_array().cloned().unwrap_or_default();
                        Ok(tercc::suites_from_batches(&batches))
                    }
                    (None, Some(uri)) => {
                        let batches: Vec<Value> = self
                            .http
                            .get(uri)
                            .header(reqwest::header::ACCEPT, "application/json")
                            .send()
                            .await
                            .and_then(reqwest::Response::error_for_status)
                            .map_err(|err| {
                                Error::Config(format!(
                                    "Failed to download test batches from {uri}: {err}"
                                ))
                            })?
                            .json()
                            .await
                            .map_err(|err| {
                                Error::Config(format!(
                                    "Failed to parse test batches from {uri}: {err}"
                                ))
                            })?;
                        Ok(tercc::suites_from_batches(&batches))
                    }
                    (None, None) => Err(Error::Config(
                        "At least one of 'batches' or 'batchesUri' shall be set".to_string(),
                    )),
                }
            })
            .await
            .cloned()
    }

    /// The artifact created event for the artifact under test.
    pub async fn artifact_created(
        &self,
        query: &dyn EventQuery,
    ) -> crate::Result<Option<ArtifactCreated>> {
        self.artifact_event
            .get_or_try_init(|| async {
                let artifact_id = match &self.artifact {
                    Some(id) => Some(id.clone()),
                    None => self.artifact_id_from_tercc(),
                };
                let Some(artifact_id) = artifact_id else {
                    return Ok(None);
                };
                Ok(query.artifact_created(&artifact_id).await?)
            })
            .await
            .cloned()
    }

    /// CAUSE link target of the recipe collection, when it has one.
    fn artifact_id_from_tercc(&self) -> Option<String> {
        let document = self.tercc_document().ok()?;
        document
            .get("links")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|link| link.get("type").and_then(Value::as_str) == Some("CAUSE"))
            .and_then(|link| link.get("target").and_then(Value::as_str))
            .map(str::to_string)
    }

    /// Id of the artifact under test.
    pub async fn iut_id(&self, query: &dyn EventQuery) -> crate::Result<String> {
        if let Some(id) = &self.artifact {
            return Ok(id.clone());
        }
        let artifact = self.artifact_created(query).await?.ok_or_else(|| {
            Error::Config("Unable to find the artifact under test".to_string())
        })?;
        Ok(artifact.meta.id)
    }

    /// Product name parsed from the artifact identity.
    pub async fn product(&self, query: &dyn EventQuery) -> crate::Result<Option<String>> {
        self.product
            .get_or_try_init(|| async {
                let identity = match &self.identity {
                    Some(identity) => Some(identity.clone()),
                    None => self
                        .artifact_created(query)
                        .await?
                        .map(|artifact| artifact.data.identity),
                };
                Ok(identity.as_deref().and_then(purl_name))
            })
            .await
            .cloned()
    }
}

/// Name component of a package URL, e.g.
/// `pkg:docker/etos/suite-runner@1.0.0` → `suite-runner`.
fn purl_name(identity: &str) -> Option<String> {
    let rest = identity.strip_prefix("pkg:")?;
    let path = rest.split('@').next()?.split('?').next()?;
    path.rsplit('/')
        .next()
        .map(str::to_string)
        .filter(|name| !name.is_empty())
}
