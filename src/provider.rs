//! External analysis provider
//!
//! Phases that need judgment beyond learned patterns (classification hints,
//! debt narratives) call an `AnalysisProvider`. The provider is a trait seam
//! so the flow engine never depends on a concrete service; tests use
//! `MockProvider`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Error type for provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider returned malformed output: {0}")]
    Malformed(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::RateLimited(_))
    }
}

/// A request to the provider: what kind of analysis, over which payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// e.g. "classify_asset", "score_debt"
    pub operation: String,
    pub payload: Value,
}

/// Structured provider output with an overall confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredResult {
    pub data: Value,
    pub confidence: f32,
}

/// Trait for external analysis backends.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Whether the provider can take requests right now. Phases that treat
    /// the provider as optional check this and fall back to local scoring.
    async fn is_available(&self) -> bool;

    async fn analyze(&self, request: AnalysisRequest) -> Result<StructuredResult, ProviderError>;
}

/// Retry policy for provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Call the provider with per-attempt timeouts and doubling backoff.
///
/// Non-retryable errors surface immediately; retryable ones are retried up
/// to the policy's attempt bound.
pub async fn analyze_with_retry(
    provider: &dyn AnalysisProvider,
    request: AnalysisRequest,
    policy: &RetryPolicy,
) -> Result<StructuredResult, ProviderError> {
    let mut backoff = policy.initial_backoff;
    let mut last_err = ProviderError::Unavailable("no attempts made".to_string());

    for attempt in 1..=policy.max_attempts.max(1) {
        let outcome = tokio::time::timeout(
            policy.per_attempt_timeout,
            provider.analyze(request.clone()),
        )
        .await;

        let err = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e,
            Err(_) => ProviderError::Timeout(policy.per_attempt_timeout),
        };

        if !err.is_retryable() || attempt == policy.max_attempts {
            return Err(err);
        }
        tracing::debug!(attempt, error = %err, "provider call failed, retrying");
        last_err = err;
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    Err(last_err)
}

// ---------------------------------------------------------------------------
// MockProvider for tests and offline runs
// ---------------------------------------------------------------------------

enum MockStep {
    Respond(StructuredResult),
    Fail(ProviderError),
}

/// Scriptable provider: queue responses and failures, consumed in order.
/// When the queue runs dry it echoes the request payload back.
pub struct MockProvider {
    available: bool,
    script: Mutex<VecDeque<MockStep>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            available: true,
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_response(self, data: Value, confidence: f32) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockStep::Respond(StructuredResult { data, confidence }));
        self
    }

    pub fn with_failure(self, err: ProviderError) -> Self {
        self.script.lock().unwrap().push_back(MockStep::Fail(err));
        self
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisProvider for MockProvider {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn analyze(&self, request: AnalysisRequest) -> Result<StructuredResult, ProviderError> {
        if !self.available {
            return Err(ProviderError::Unavailable("mock offline".to_string()));
        }
        match self.script.lock().unwrap().pop_front() {
            Some(MockStep::Respond(r)) => Ok(r),
            Some(MockStep::Fail(e)) => Err(e),
            None => Ok(StructuredResult {
                data: request.payload,
                confidence: 0.5,
            }),
        }
    }
}
