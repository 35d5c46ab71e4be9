//! Task context carried into every concurrent unit of work.
//!
//! A [`TaskContext`] bundles the process-wide cancellation token with a
//! serialized trace-context carrier. Spawned tasks receive a forked context
//! and reinstate the parent span before opening their own spans, instead of
//! relying on hidden thread-local propagation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::Error;

/// Cancellation and trace context for one task.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    cancel: CancellationToken,
    carrier: HashMap<String, String>,
}

impl TaskContext {
    /// Creates a context with a fresh cancellation token and no trace parent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context observing an externally owned cancellation token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            carrier: HashMap::new(),
        }
    }

    /// Sets the trace-context carrier, e.g. one parsed from `OTEL_CONTEXT`.
    pub fn with_carrier(mut self, carrier: HashMap<String, String>) -> Self {
        self.carrier = carrier;
        self
    }

    /// Forks this context for a task spawned from the current span.
    ///
    /// The cancellation token is shared; the carrier is re-captured from the
    /// span that is current at the fork point.
    pub fn fork(&self) -> Self {
        let mut carrier = HashMap::new();
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&tracing::Span::current().context(), &mut carrier);
        });
        Self {
            cancel: self.cancel.clone(),
            carrier,
        }
    }

    /// Sets the parent of `span` from the carried trace context.
    pub fn reinstate(&self, span: &tracing::Span) {
        if self.carrier.is_empty() {
            return;
        }
        let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&self.carrier)
        });
        span.set_parent(parent);
    }

    /// The shared cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether termination has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleeps for one poll interval, observing cancellation.
    ///
    /// Returns [`Error::Terminated`] as soon as the token is cancelled, so
    /// every poll loop reacts within a single tick.
    pub async fn tick(&self, interval: Duration) -> crate::Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Terminated),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }
}

/// An absolute point in time after which a poll loop must give up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            end: Instant::now() + timeout,
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tick_returns_terminated_on_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::with_token(token.clone());
        token.cancel();
        let result = ctx.tick(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Terminated)));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_completes_after_interval() {
        let ctx = TaskContext::new();
        ctx.tick(Duration::from_secs(5))
            .await
            .expect("tick should complete");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert!(!deadline.expired());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(deadline.expired());
    }
}
