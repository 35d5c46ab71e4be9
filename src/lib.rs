//! # etos-suite-runner
//!
//! A single-shot orchestration process that drives one testrun end-to-end:
//! it obtains test environments from an external environment provider, fans
//! execution out to per-environment test runners over HTTP, tracks their
//! lifecycle by querying an event bus, aggregates the verdicts and releases
//! every environment on the way out — successful or not.
//!
//! ## Architecture
//!
//! ```text
//!   Parameters ──► Runner ──┬──► EnvironmentRequester (background)
//!                           │
//!                           └──► SuiteOrchestrator (one per main suite)
//!                                     │
//!                                     └──► SubSuiteWorker (one per environment)
//!                                               │
//!                                               ├── ExecutorClient ──► Test Runner (HTTP)
//!                                               └── EventQuery ─────► Event bus (GraphQL)
//! ```
//!
//! The external collaborators sit behind small trait seams:
//!
//! - [`events::EventPublisher`] — publish side of the bus
//!   ([`events::amqp::AmqpPublisher`] in production)
//! - [`query::EventQuery`] — query side of the bus ([`query::GraphqlQuery`])
//! - [`environment::EnvironmentProvider`] — environment provisioning and
//!   release (direct HTTP or Kubernetes operator mode)
//! - [`executor::ExecutorClient`] — handing sub suites to test runners
//!
//! All long-running work is cooperative: every wait is a bounded poll that
//! observes the process-wide cancellation token carried in
//! [`context::TaskContext`], and every exit path funnels through the
//! environment release.

pub mod context;
pub mod environment;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod params;
pub mod query;
pub mod runner;
pub mod telemetry;
pub mod tercc;
pub mod verdict;

pub use context::TaskContext;
pub use params::Parameters;
pub use runner::Runner;
pub use verdict::{testrun_verdict, Conclusion, FinalVerdict, SuiteResult, Verdict};

/// Failure taxonomy of a testrun.
///
/// Errors surface up from the enclosing unit (sub suite → main suite →
/// testrun) and are converted to verdicts at the top; the environment
/// release path runs regardless.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required inputs are missing. Fatal before the testrun starts; nothing
    /// to release.
    #[error("{0}")]
    Config(String),

    /// The environment provider failed or reported failure. Fatal for the
    /// testrun; triggers the full release.
    #[error("{message}")]
    EnvironmentProvider {
        message: String,
        task_id: Option<String>,
    },

    /// Environment discovery ran out of time.
    #[error("Timed out after {seconds} seconds.")]
    Timeout { seconds: u64 },

    /// External termination was requested.
    #[error("Terminate command received - Shutting down.")]
    Terminated,

    /// A test runner rejected its sub suite. Fatal only for that sub suite.
    #[error(transparent)]
    TestStart(#[from] executor::TestStartError),

    /// An event could not be published.
    #[error(transparent)]
    Publish(#[from] events::PublishError),

    /// The event bus could not be queried.
    #[error(transparent)]
    Query(#[from] query::QueryError),
}

impl Error {
    /// Stable error kind label, recorded on spans as `error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::EnvironmentProvider { .. } => "EnvironmentProviderError",
            Error::Timeout { .. } => "Timeout",
            Error::Terminated => "Terminated",
            Error::TestStart(_) => "TestStartError",
            Error::Publish(_) => "PublishError",
            Error::Query(_) => "QueryError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
