//! Suite runner entry point.
//!
//! The process is configured entirely through environment variables by the
//! controller that spawns it. Whatever happens, the final verdict triple is
//! written to the termination log and the exit code reflects whether the
//! testrun itself ran to completion (tests failing is a completed testrun).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use etos_suite_runner::environment::cluster::ClusterEnvironmentProvider;
use etos_suite_runner::environment::http::HttpEnvironmentProvider;
use etos_suite_runner::environment::EnvironmentProvider;
use etos_suite_runner::events::amqp::{AmqpConfig, AmqpPublisher};
use etos_suite_runner::events::EventPublisher;
use etos_suite_runner::executor::{ExecutorClient, HttpExecutor};
use etos_suite_runner::query::{EventQuery, GraphqlQuery};
use etos_suite_runner::verdict::{self, FinalVerdict};
use etos_suite_runner::{testrun_verdict, Parameters, Runner, TaskContext};

#[tokio::main]
async fn main() {
    etos_suite_runner::telemetry::init().await;
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let params = match Parameters::from_env() {
        Ok(params) => Arc::new(params),
        Err(err) => {
            error!(error = %err, "Suite runner could not read its parameters");
            write_verdict(
                &PathBuf::from("/dev/termination-log"),
                &FinalVerdict::failure(err.to_string()),
            );
            return 1;
        }
    };

    let (verdict, failed) = match execute(params.clone()).await {
        Ok(results) => {
            let verdict = testrun_verdict(&results);
            info!(
                verdict = %verdict.verdict,
                conclusion = %verdict.conclusion,
                description = %verdict.description,
                "Suite runner result",
            );
            (verdict, false)
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Suite runner failed");
            (FinalVerdict::failure(format!("{err:#}")), true)
        }
    };
    write_verdict(&params.termination_log, &verdict);
    info!("Suite runner finished executing.");
    if failed {
        1
    } else {
        0
    }
}

/// Wires the collaborators and runs the testrun.
async fn execute(
    params: Arc<Parameters>,
) -> anyhow::Result<Vec<etos_suite_runner::SuiteResult>> {
    let testrun_id = params.testrun_id()?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());
    let ctx = TaskContext::with_token(token)
        .with_carrier(etos_suite_runner::telemetry::carrier_from_env());

    let client = reqwest::Client::builder()
        .timeout(params.http_timeout)
        .build()
        .context("Failed to create HTTP client")?;

    let amqp_config = AmqpConfig::from_env().context("Event bus is not configured")?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(
        AmqpPublisher::connect(&amqp_config, &testrun_id)
            .await
            .context("Failed to connect to the event bus")?,
    );

    let graphql_server = params
        .graphql_server
        .clone()
        .context("ETOS_GRAPHQL_SERVER environment variable not provided.")?;
    let query: Arc<dyn EventQuery> = Arc::new(GraphqlQuery::new(client.clone(), graphql_server));

    let provider: Arc<dyn EnvironmentProvider> = if params.operator_mode() {
        Arc::new(
            ClusterEnvironmentProvider::new()
                .await
                .context("Failed to connect to the Kubernetes API")?,
        )
    } else {
        let url = params
            .environment_provider_url
            .clone()
            .context("ETOS_ENVIRONMENT_PROVIDER environment variable not provided.")?;
        Arc::new(HttpEnvironmentProvider::new(
            client.clone(),
            url,
            params.release_timeout,
        ))
    };

    let executor: Arc<dyn ExecutorClient> = Arc::new(HttpExecutor::new(
        client,
        params.encryption_key.clone(),
        params.http_timeout,
    ));

    let runner = Runner::new(params, publisher, query, provider, executor, ctx);
    Ok(runner.run().await?)
}

/// Cancels the token when a termination signal arrives.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "Failed to install the termination signal handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {
                warn!("Kill command received - Attempting to shut down all processes.");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupt received - Attempting to shut down all processes.");
            }
        }
        token.cancel();
    });
}

fn write_verdict(path: &std::path::Path, verdict: &FinalVerdict) {
    if let Err(err) = verdict::write_termination_log(path, verdict) {
        error!(error = %err, path = %path.display(), "Failed to write the termination log");
    }
}
