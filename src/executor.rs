//! Test runner execution client.
//!
//! Each sub suite environment carries an `executor.request` describing the
//! HTTP call that hands the sub suite over to an external test runner. The
//! [`ExecutorClient`] seam covers that call plus the download of the
//! sub suite definition itself; [`HttpExecutor`] is the production
//! implementation with basic/digest auth and optional password decryption.
//!
//! The test runner does its actual work asynchronously on another host — a
//! successful call only means the sub suite was accepted.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use diqwest::WithDigestAuth;
use fernet::Fernet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// The HTTP call to a test runner failed.
///
/// Carries whatever the test runner responded with: its JSON body when there
/// was one, otherwise `{"error": <text>}`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to start test runner: {error}")]
pub struct TestStartError {
    pub error: Value,
}

impl TestStartError {
    /// A start error from a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            error: json!({"error": message.into()}),
        }
    }
}

/// Errors from the executor client.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The test runner rejected the sub suite.
    #[error(transparent)]
    TestStart(#[from] TestStartError),

    /// The sub suite definition could not be fetched.
    #[error("Failed to fetch sub suite definition from {uri}: {message}")]
    Definition { uri: String, message: String },
}

/// A sub suite definition downloaded from an environment defined event.
///
/// The runner only interprets the name and the executor block; the recipes
/// and any additional content are passed through to the test runner as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubSuiteDefinition {
    pub name: String,
    /// The environment event id this definition was downloaded for.
    /// Attached after download; used when releasing the environment.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub executor: ExecutorSpec,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The executor block of a sub suite definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Name of the execution-space resource, used for cluster-side release.
    #[serde(default)]
    pub id: Option<String>,
    pub request: ExecutorRequest,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The HTTP call template handing a sub suite to a test runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: Option<ExecutorAuth>,
}

/// Authentication for the executor request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorAuth {
    pub username: String,
    pub password: Password,
    #[serde(rename = "type", default = "default_auth_type")]
    pub auth_type: String,
}

fn default_auth_type() -> String {
    "basic".to_string()
}

/// A password, either in the clear or as an encrypted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Password {
    Encrypted {
        #[serde(rename = "$decrypt")]
        decrypt: EncryptedValue,
    },
    Plain(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub value: String,
}

/// Capability to hand sub suites to external test runners.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Downloads a sub suite definition from the URI announced on an
    /// environment defined event.
    async fn download_sub_suite(&self, uri: &str) -> Result<SubSuiteDefinition, ExecutorError>;

    /// Triggers the test runner for one sub suite.
    async fn run_tests(&self, definition: &SubSuiteDefinition) -> Result<(), ExecutorError>;
}

/// HTTP implementation of [`ExecutorClient`].
pub struct HttpExecutor {
    client: reqwest::Client,
    encryption_key: Option<String>,
    http_timeout: Duration,
}

impl HttpExecutor {
    pub fn new(
        client: reqwest::Client,
        encryption_key: Option<String>,
        http_timeout: Duration,
    ) -> Self {
        Self {
            client,
            encryption_key,
            http_timeout,
        }
    }

    /// Resolves a password to its clear-text value.
    ///
    /// Without a configured encryption key the encrypted value is passed
    /// through opaquely.
    fn resolve_password(&self, password: &Password) -> Result<String, TestStartError> {
        match password {
            Password::Plain(value) => Ok(value.clone()),
            Password::Encrypted { decrypt } => match &self.encryption_key {
                None => {
                    debug!("No encryption key available, won't decrypt password");
                    Ok(decrypt.value.clone())
                }
                Some(key) => {
                    let fernet = Fernet::new(key)
                        .ok_or_else(|| TestStartError::message("Invalid encryption key"))?;
                    let clear = fernet.decrypt(&decrypt.value).map_err(|_| {
                        TestStartError::message("Failed to decrypt executor password")
                    })?;
                    String::from_utf8(clear).map_err(|_| {
                        TestStartError::message("Decrypted password is not valid UTF-8")
                    })
                }
            },
        }
    }
}

/// Maps an HTTP error response body to a start error.
fn start_error(body: &str) -> TestStartError {
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.is_object() => TestStartError { error: value },
        _ => TestStartError {
            error: json!({"error": body}),
        },
    }
}

fn connection_error(err: reqwest::Error) -> TestStartError {
    TestStartError::message(err.to_string())
}

#[async_trait]
impl ExecutorClient for HttpExecutor {
    async fn download_sub_suite(&self, uri: &str) -> Result<SubSuiteDefinition, ExecutorError> {
        let definition_error = |message: String| ExecutorError::Definition {
            uri: uri.to_string(),
            message,
        };
        let response = self
            .client
            .get(uri)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.http_timeout)
            .send()
            .await
            .map_err(|err| definition_error(err.to_string()))?
            .error_for_status()
            .map_err(|err| definition_error(err.to_string()))?;
        response
            .json()
            .await
            .map_err(|err| definition_error(err.to_string()))
    }

    async fn run_tests(&self, definition: &SubSuiteDefinition) -> Result<(), ExecutorError> {
        let request = &definition.executor.request;
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| {
                TestStartError::message(format!("Invalid HTTP method {:?}", request.method))
            })?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(self.http_timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        } else if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match &request.auth {
            Some(auth) => {
                let password = self.resolve_password(&auth.password)?;
                if auth.auth_type.eq_ignore_ascii_case("digest") {
                    builder
                        .send_with_digest_auth(&auth.username, &password)
                        .await
                        .map_err(|err| TestStartError::message(err.to_string()))?
                } else {
                    builder
                        .basic_auth(&auth.username, Some(password))
                        .send()
                        .await
                        .map_err(connection_error)?
                }
            }
            None => builder.send().await.map_err(connection_error)?,
        };

        let status = response.status();
        if status.is_success() {
            debug!(%status, url = %request.url, "Test runner accepted the sub suite");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(start_error(&body).into())
    }
}
