//! The provider adapter boundary.
//!
//! The upstream generative-AI services themselves are explicitly out of
//! scope for this router: from the router's perspective a provider is an
//! opaque dispatch function that accepts a payload and a deadline and
//! returns a [`DispatchOutcome`](crate::models::DispatchOutcome). This
//! module defines that boundary and a couple of adapters used for local
//! smoke-testing and the CLI demo path; real deployments wire in adapters
//! that call out to the configured `endpoint` over HTTP or a local script,
//! following the same shape.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{error::AppError, models::DispatchOutcome};

/// A common trait for all provider dispatch adapters.
///
/// Implementations are the only code in the crate permitted to perform the
/// actual upstream call; everything upstream of this trait (classifier,
/// selector, executor) only ever deals in `TaskType`s, providers-by-name,
/// and `DispatchOutcome`s.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Sends `payload` to the provider and awaits a result, honouring
    /// `deadline` as a best-effort upper bound on how long the call may
    /// run for.
    async fn dispatch(&self, payload: &str, deadline: Duration) -> Result<DispatchOutcome, AppError>;
}

/// A deterministic adapter useful for tests and for running the CLI without
/// any network access: it always succeeds, echoing the payload back with a
/// synthetic cost/latency/quality profile.
#[derive(Debug, Clone)]
pub struct EchoAdapter {
    /// Synthetic cost reported for every dispatch.
    pub cost: f64,
    /// Synthetic latency reported for every dispatch.
    pub latency: Duration,
    /// Synthetic quality estimate reported for every dispatch.
    pub quality_estimate: f64,
}

impl Default for EchoAdapter {
    fn default() -> Self {
        Self {
            cost: 0.0,
            latency: Duration::from_millis(200),
            quality_estimate: 0.8,
        }
    }
}

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    async fn dispatch(&self, payload: &str, _deadline: Duration) -> Result<DispatchOutcome, AppError> {
        Ok(DispatchOutcome {
            success: true,
            data: Some(format!("echo: {payload}")),
            cost: self.cost,
            latency: self.latency,
            quality_estimate: self.quality_estimate,
        })
    }
}

/// An adapter that always fails, useful for exercising fallback logic in
/// tests.
#[derive(Debug, Clone)]
pub struct FailingAdapter {
    /// The error message the adapter reports on every call.
    pub message: String,
}

#[async_trait]
impl ProviderAdapter for FailingAdapter {
    async fn dispatch(&self, _payload: &str, _deadline: Duration) -> Result<DispatchOutcome, AppError> {
        Err(AppError::UpstreamFailed(self.message.clone()))
    }
}

/// An adapter that measures and reports real wall-clock latency around a
/// delegate, used by adapters that wrap an actual HTTP round trip.
pub struct TimedAdapter<A: ProviderAdapter> {
    inner: A,
}

impl<A: ProviderAdapter> TimedAdapter<A> {
    /// Wraps `inner`, overriding its latency with the measured call time.
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<A: ProviderAdapter> ProviderAdapter for TimedAdapter<A> {
    async fn dispatch(&self, payload: &str, deadline: Duration) -> Result<DispatchOutcome, AppError> {
        let start = Instant::now();
        let mut outcome = self.inner.dispatch(payload, deadline).await?;
        outcome.latency = start.elapsed();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_adapter_succeeds() {
        let adapter = EchoAdapter::default();
        let outcome = adapter.dispatch("hi", Duration::from_secs(1)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data.as_deref(), Some("echo: hi"));
    }

    #[tokio::test]
    async fn failing_adapter_errors() {
        let adapter = FailingAdapter {
            message: "boom".into(),
        };
        let err = adapter.dispatch("hi", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamFailed(_)));
    }

    #[tokio::test]
    async fn timed_adapter_measures_latency() {
        let adapter = TimedAdapter::new(EchoAdapter::default());
        let outcome = adapter.dispatch("hi", Duration::from_secs(1)).await.unwrap();
        assert!(outcome.success);
    }
}
