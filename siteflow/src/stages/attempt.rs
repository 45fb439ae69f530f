//! Provider invocation with timeout, backoff and one corrective retry.

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::retry::{decide_for_provider, RetryConfig, RetryDecision, RetryState};
use crate::cancellation::CancellationToken;
use crate::core::{SchemaViolation, StageName};
use crate::errors::{ProviderError, StageError};
use crate::events::RunEvents;
use crate::providers::{CapabilityProvider, ProviderRequest};
use crate::utils::millis;

/// Why a validated invocation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Transient failures used up the retry budget.
    Exhausted {
        /// Invocations made.
        attempts: u32,
        /// The last transient failure.
        last_error: ProviderError,
    },
    /// The provider failed with a non-retryable error.
    Provider {
        /// Invocations made.
        attempts: u32,
        /// The failure.
        error: ProviderError,
    },
    /// Output stayed invalid after the corrective retry.
    Validation {
        /// Invocations made.
        attempts: u32,
        /// The last schema violation.
        reason: String,
    },
    /// The token was cancelled.
    Cancelled {
        /// Invocations made.
        attempts: u32,
        /// Cancellation reason.
        reason: String,
    },
}

impl AttemptError {
    /// Returns the invocations made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Provider { attempts, .. }
            | Self::Validation { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Returns the root error kind, e.g. `timeout` or `invalid_response`.
    #[must_use]
    pub const fn root_kind(&self) -> &'static str {
        match self {
            Self::Exhausted { last_error, .. } => last_error.kind(),
            Self::Provider { error, .. } => error.kind(),
            Self::Validation { .. } => "invalid_response",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns a human-readable description.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Exhausted { attempts, last_error } => {
                format!("gave up after {attempts} attempts: {last_error}")
            }
            Self::Provider { error, .. } => error.to_string(),
            Self::Validation { reason, .. } => reason.clone(),
            Self::Cancelled { reason, .. } => format!("cancelled: {reason}"),
        }
    }
}

impl From<AttemptError> for StageError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Exhausted {
                attempts,
                last_error,
            } => Self::ProviderExhausted {
                attempts,
                last_error,
            },
            AttemptError::Provider { error, .. } => Self::ProviderFailed(error),
            AttemptError::Validation { attempts, reason } => {
                Self::ValidationFailed { reason, attempts }
            }
            AttemptError::Cancelled { reason, .. } => Self::Cancelled { reason },
        }
    }
}

/// Builds the instruction sent with the corrective retry.
#[must_use]
pub fn corrective_instruction(stage: StageName, violation: &str) -> String {
    format!(
        "Previous response did not conform to the {stage} schema: {violation}. \
         Respond again with JSON that conforms to the schema."
    )
}

/// Invokes one provider under a retry policy.
///
/// Each call runs under `timeout`. `Timeout` and `RateLimited` failures are
/// retried with backoff until `retry.max_attempts` calls were made. An
/// invalid response gets exactly one corrective retry. Other failures are
/// returned immediately.
pub struct AttemptRunner<'a> {
    provider: &'a dyn CapabilityProvider,
    retry: &'a RetryConfig,
    timeout: Duration,
    events: &'a RunEvents,
    cancel: &'a Arc<CancellationToken>,
    counter: Option<Arc<AtomicU32>>,
}

impl<'a> AttemptRunner<'a> {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        provider: &'a dyn CapabilityProvider,
        retry: &'a RetryConfig,
        timeout: Duration,
        events: &'a RunEvents,
        cancel: &'a Arc<CancellationToken>,
    ) -> Self {
        Self {
            provider,
            retry,
            timeout,
            events,
            cancel,
            counter: None,
        }
    }

    /// Mirrors the attempt count into `counter` as calls start.
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<AtomicU32>) -> Self {
        self.counter = Some(counter);
        self
    }

    fn cancelled(&self, attempts: u32) -> AttemptError {
        AttemptError::Cancelled {
            attempts,
            reason: self
                .cancel
                .reason()
                .unwrap_or_else(|| "cancelled".to_string()),
        }
    }

    async fn invoke_once(
        &self,
        request: &ProviderRequest,
    ) -> Option<Result<serde_json::Value, ProviderError>> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.timeout, self.provider.invoke(request)) => {
                Some(result.unwrap_or_else(|_| Err(ProviderError::timeout(self.timeout))))
            }
        }
    }

    fn emit_retry(&self, request: &ProviderRequest, delay: Duration, error: &ProviderError) {
        self.events.emit(
            "stage.retrying",
            json!({
                "stage": request.stage,
                "attempt": request.attempt,
                "query_index": request.query.as_ref().map(|q| q.index),
                "delay_ms": millis(delay),
                "error": error.to_dict(),
            }),
        );
    }

    /// Invokes the provider until `validate` accepts its output.
    pub async fn run<T, V>(
        &self,
        mut request: ProviderRequest,
        validate: V,
    ) -> Result<(T, u32), AttemptError>
    where
        V: Fn(serde_json::Value) -> Result<T, SchemaViolation>,
    {
        let mut state = RetryState::new();
        let mut corrected = false;
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(attempts));
            }
            attempts += 1;
            request.attempt = attempts;
            if let Some(ref counter) = self.counter {
                counter.store(attempts, Ordering::SeqCst);
            }

            let Some(result) = self.invoke_once(&request).await else {
                return Err(self.cancelled(attempts));
            };
            let error = match result.map(&validate) {
                Ok(Ok(value)) => return Ok((value, attempts)),
                Ok(Err(violation)) => ProviderError::invalid_response(violation.to_string()),
                Err(e) => e,
            };

            if let ProviderError::InvalidResponse { ref reason } = error {
                if corrected {
                    return Err(AttemptError::Validation {
                        attempts,
                        reason: reason.clone(),
                    });
                }
                corrected = true;
                debug!(
                    run_id = %request.run_id,
                    stage = %request.stage,
                    attempt = attempts,
                    error = %error,
                    "Retrying with corrective instruction"
                );
                request.corrective_instruction = Some(corrective_instruction(request.stage, reason));
                self.emit_retry(&request, Duration::ZERO, &error);
                continue;
            }

            match decide_for_provider(&mut state, self.retry, &error) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        run_id = %request.run_id,
                        stage = %request.stage,
                        provider = self.provider.name(),
                        attempt = attempts,
                        delay_ms = millis(delay),
                        error = %error,
                        "Provider call failed, retrying"
                    );
                    self.emit_retry(&request, delay, &error);
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(self.cancelled(attempts)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    return Err(AttemptError::Exhausted {
                        attempts,
                        last_error: error,
                    })
                }
                RetryDecision::NotRetryable => {
                    return Err(AttemptError::Provider { attempts, error })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageInputs;
    use crate::events::CollectingEventSink;
    use crate::providers::{MockCapabilityProvider, ProviderSession};
    use serde_json::Value;
    use uuid::Uuid;

    fn request(cancel: &Arc<CancellationToken>) -> ProviderRequest {
        ProviderRequest {
            run_id: Uuid::now_v7(),
            stage: StageName::Design,
            attempt: 0,
            user_input: Arc::from("a bakery site"),
            inputs: StageInputs::new(StageName::Design),
            corrective_instruction: None,
            query: None,
            session: Arc::new(ProviderSession::default()),
            tools: None,
            cancel: Arc::clone(cancel),
        }
    }

    fn accept_object(raw: Value) -> Result<Value, SchemaViolation> {
        if raw.get("ok").is_some() {
            Ok(raw)
        } else {
            Err(SchemaViolation::for_field("ok", "missing"))
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new().with_base_delay_ms(10)
    }

    fn events(sink: &Arc<CollectingEventSink>) -> RunEvents {
        RunEvents::new(sink.clone(), Uuid::now_v7())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_mock = calls.clone();
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("designer".to_string());
        provider.expect_invoke().returning(move |_| {
            if calls_in_mock.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::timeout(Duration::from_secs(60)))
            } else {
                Ok(json!({"ok": true}))
            }
        });
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry();
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel);

        let (value, attempts) = runner.run(request(&cancel), accept_object).await.unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(attempts, 3);
        assert_eq!(sink.count("stage.retrying"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_budget() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("designer".to_string());
        provider
            .expect_invoke()
            .times(3)
            .returning(|_| Err(ProviderError::rate_limited(None)));
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry();
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel);

        let err = runner.run(request(&cancel), accept_object).await.unwrap_err();

        assert_eq!(err.attempts(), 3);
        assert_eq!(err.root_kind(), "rate_limited");
        assert_eq!(StageError::from(err).kind(), "provider_exhausted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_hits_attempt_timeout() {
        struct Slow;
        #[async_trait::async_trait]
        impl CapabilityProvider for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn invoke(&self, _request: &ProviderRequest) -> Result<Value, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({"ok": true}))
            }
        }

        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry().with_max_attempts(2);
        let runner = AttemptRunner::new(&Slow, &retry, Duration::from_millis(50), &events, &cancel);

        let err = runner.run(request(&cancel), accept_object).await.unwrap_err();
        assert_eq!(err.root_kind(), "timeout");
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test]
    async fn test_invalid_output_gets_one_corrective_retry() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("designer".to_string());
        provider
            .expect_invoke()
            .withf(|r| !r.is_corrective())
            .times(1)
            .returning(|_| Ok(json!({"colors": "blue"})));
        provider
            .expect_invoke()
            .withf(|r| {
                r.corrective_instruction
                    .as_deref()
                    .is_some_and(|i| i.contains("design schema"))
            })
            .times(1)
            .returning(|_| Ok(json!({"ok": true})));
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry();
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel);

        let (_, attempts) = runner.run(request(&cancel), accept_object).await.unwrap();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_second_invalid_output_fails_validation() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("designer".to_string());
        provider
            .expect_invoke()
            .times(2)
            .returning(|_| Ok(json!({"nope": 1})));
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry();
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel);

        let err = runner.run(request(&cancel), accept_object).await.unwrap_err();
        assert!(matches!(err, AttemptError::Validation { attempts: 2, .. }));
        assert_eq!(StageError::from(err).kind(), "validation_failed");
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("designer".to_string());
        provider
            .expect_invoke()
            .times(1)
            .returning(|_| Err(ProviderError::unavailable("connection refused")));
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry();
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel);

        let err = runner.run(request(&cancel), accept_object).await.unwrap_err();
        assert_eq!(StageError::from(err).kind(), "provider_failed");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let provider = MockCapabilityProvider::new();
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("user abort");
        let retry = fast_retry();
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel);

        let err = runner.run(request(&cancel), accept_object).await.unwrap_err();
        assert_eq!(
            err,
            AttemptError::Cancelled {
                attempts: 0,
                reason: "user abort".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_tracks_attempts() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("designer".to_string());
        provider
            .expect_invoke()
            .returning(|_| Err(ProviderError::timeout(Duration::from_secs(1))));
        let sink = Arc::new(CollectingEventSink::new());
        let events = events(&sink);
        let cancel = Arc::new(CancellationToken::new());
        let retry = fast_retry();
        let counter = Arc::new(AtomicU32::new(0));
        let runner = AttemptRunner::new(&provider, &retry, Duration::from_secs(1), &events, &cancel)
            .with_counter(counter.clone());

        let _ = runner.run(request(&cancel), accept_object).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
