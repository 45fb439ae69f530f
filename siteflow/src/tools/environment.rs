//! The execution environment handed to the final stage.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::definitions::{EffectTool, ToolInvocation, ToolOutcome, ToolResult};
use super::idempotency::{check_idempotency, CachedResult, IdempotencyCheck, IdempotencyStore};
use super::registry::ToolRegistry;
use crate::errors::ToolError;
use crate::events::RunEvents;
use crate::providers::ProviderSession;
use crate::stages::{with_retry, RetryConfig};

const fn default_fail_on_error() -> bool {
    true
}

const fn default_tool_max_attempts() -> u32 {
    3
}

const fn default_tool_base_delay_ms() -> u64 {
    200
}

/// How tool failures are retried and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    /// Fail the final stage on the first unrecovered tool error.
    #[serde(default = "default_fail_on_error")]
    pub fail_on_error: bool,
    /// Maximum calls for transient tool errors, including the first.
    #[serde(default = "default_tool_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_tool_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            fail_on_error: default_fail_on_error(),
            max_attempts: default_tool_max_attempts(),
            base_delay_ms: default_tool_base_delay_ms(),
        }
    }
}

impl ToolPolicy {
    /// Returns the retry config for transient tool errors.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay_ms(self.base_delay_ms)
    }
}

/// Applies tool invocations for one run.
///
/// Invocations are applied one at a time. Identical file writes are
/// replayed from the idempotency store, transient failures are retried,
/// and every invocation is recorded in the outcome log.
pub struct ToolEnvironment {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn IdempotencyStore>,
    policy: ToolPolicy,
    session: Arc<ProviderSession>,
    events: RunEvents,
    serial: Mutex<()>,
    outcomes: parking_lot::Mutex<Vec<ToolOutcome>>,
}

impl ToolEnvironment {
    /// Creates an environment for one run.
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<dyn IdempotencyStore>,
        policy: ToolPolicy,
        session: Arc<ProviderSession>,
        events: RunEvents,
    ) -> Self {
        Self {
            registry,
            store,
            policy,
            session,
            events,
            serial: Mutex::new(()),
            outcomes: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Returns the shared session.
    #[must_use]
    pub fn session(&self) -> &ProviderSession {
        &self.session
    }

    /// Returns the tool policy.
    #[must_use]
    pub const fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Applies an invocation.
    pub async fn apply(&self, invocation: ToolInvocation) -> Result<ToolResult, ToolError> {
        let _serial = self.serial.lock().await;

        let Some(tool) = self.registry.get(invocation.tool) else {
            let err = ToolError::not_found(invocation.tool.as_str(), "tool is not registered");
            self.record_failure(&invocation, &err, 0);
            return Err(err);
        };

        if invocation.tool.is_cacheable() {
            let check = check_idempotency(
                self.store.as_ref(),
                &invocation.idempotency_key,
                &invocation.params_hash,
            )
            .await;
            if let IdempotencyCheck::Hit(cached) = check {
                let result = cached.replayed();
                debug!(
                    tool = %invocation.tool,
                    key = %invocation.idempotency_key,
                    "Replaying tool result"
                );
                self.record_success(&invocation, &result, 0, "tool.replayed");
                return Ok(result);
            }
        }

        let retry = self.policy.retry_config();
        let tool_ref: &dyn EffectTool = tool.as_ref();
        let invocation_ref = &invocation;
        let (result, attempts) = with_retry(
            &retry,
            &invocation.idempotency_key,
            ToolError::is_retryable,
            move || tool_ref.apply(invocation_ref),
        )
        .await;

        match result {
            Ok(result) => {
                if invocation.tool.is_cacheable() {
                    self.store
                        .set(
                            &invocation.idempotency_key,
                            CachedResult::new(result.clone(), invocation.params_hash.clone()),
                        )
                        .await;
                }
                self.record_success(&invocation, &result, attempts, "tool.applied");
                Ok(result)
            }
            Err(err) => {
                warn!(
                    run_id = %self.events.run_id(),
                    tool = %invocation.tool,
                    attempt = attempts,
                    error = %err,
                    "Tool invocation failed"
                );
                self.record_failure(&invocation, &err, attempts);
                Err(err)
            }
        }
    }

    /// Returns a copy of the outcome log.
    #[must_use]
    pub fn outcomes(&self) -> Vec<ToolOutcome> {
        self.outcomes.lock().clone()
    }

    /// Drains the outcome log.
    pub fn take_outcomes(&self) -> Vec<ToolOutcome> {
        std::mem::take(&mut *self.outcomes.lock())
    }

    fn record_success(
        &self,
        invocation: &ToolInvocation,
        result: &ToolResult,
        attempts: u32,
        event_type: &str,
    ) {
        self.events.emit(
            event_type,
            json!({
                "tool": invocation.tool,
                "idempotency_key": invocation.idempotency_key,
                "status": result.status,
                "attempts": attempts,
            }),
        );
        self.outcomes.lock().push(ToolOutcome {
            tool: invocation.tool,
            idempotency_key: invocation.idempotency_key.clone(),
            arguments: invocation.summary(),
            result: Some(result.clone()),
            error: None,
            attempts,
        });
    }

    fn record_failure(&self, invocation: &ToolInvocation, error: &ToolError, attempts: u32) {
        self.events.emit(
            "tool.failed",
            json!({
                "tool": invocation.tool,
                "idempotency_key": invocation.idempotency_key,
                "error": error.to_dict(),
                "attempts": attempts,
            }),
        );
        self.outcomes.lock().push(ToolOutcome {
            tool: invocation.tool,
            idempotency_key: invocation.idempotency_key.clone(),
            arguments: invocation.summary(),
            result: None,
            error: Some(error.clone()),
            attempts,
        });
    }
}

impl std::fmt::Debug for ToolEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEnvironment")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("outcomes", &self.outcomes.lock().len())
            .finish_non_exhaustive()
    }
}

/// Returns the first error whose idempotency key never later succeeded.
#[must_use]
pub fn first_unrecovered_error(outcomes: &[ToolOutcome]) -> Option<ToolError> {
    let mut last_by_key: HashMap<&str, usize> = HashMap::new();
    for (i, outcome) in outcomes.iter().enumerate() {
        last_by_key.insert(outcome.idempotency_key.as_str(), i);
    }
    outcomes
        .iter()
        .enumerate()
        .filter(|(i, o)| last_by_key.get(o.idempotency_key.as_str()) == Some(i))
        .find_map(|(_, o)| o.error.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::tools::definitions::{MockEffectTool, ToolId};
    use crate::tools::idempotency::InMemoryIdempotencyStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn environment(
        tools: Vec<Arc<dyn EffectTool>>,
        sink: Arc<CollectingEventSink>,
    ) -> ToolEnvironment {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let policy = ToolPolicy {
            base_delay_ms: 1,
            ..ToolPolicy::default()
        };
        ToolEnvironment::new(
            Arc::new(registry),
            Arc::new(InMemoryIdempotencyStore::new()),
            policy,
            Arc::new(ProviderSession::default()),
            RunEvents::new(sink, Uuid::now_v7()),
        )
    }

    #[tokio::test]
    async fn test_identical_file_write_is_replayed() {
        let mut tool = MockEffectTool::new();
        tool.expect_id().return_const(ToolId::FileWrite);
        tool.expect_apply()
            .times(1)
            .returning(|_| Ok(ToolResult::ok("written")));
        let sink = Arc::new(CollectingEventSink::new());
        let env = environment(vec![Arc::new(tool)], sink.clone());

        let first = env
            .apply(ToolInvocation::file_write("index.html", "<h1>Hi</h1>"))
            .await
            .unwrap();
        let second = env
            .apply(ToolInvocation::file_write("index.html", "<h1>Hi</h1>"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(sink.count("tool.applied"), 1);
        assert_eq!(sink.count("tool.replayed"), 1);
        let outcomes = env.take_outcomes();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].attempts, 0);
        assert!(env.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_changed_content_is_applied_again() {
        let mut tool = MockEffectTool::new();
        tool.expect_id().return_const(ToolId::FileWrite);
        tool.expect_apply()
            .times(2)
            .returning(|_| Ok(ToolResult::ok("written")));
        let env = environment(vec![Arc::new(tool)], Arc::new(CollectingEventSink::new()));

        env.apply(ToolInvocation::file_write("index.html", "v1"))
            .await
            .unwrap();
        let result = env
            .apply(ToolInvocation::file_write("index.html", "v2"))
            .await
            .unwrap();
        assert!(!result.replayed);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_tool = calls.clone();
        let mut tool = MockEffectTool::new();
        tool.expect_id().return_const(ToolId::VcsCommit);
        tool.expect_apply().returning(move |_| {
            if calls_in_tool.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ToolError::transient("vcs.commit", "index.lock exists"))
            } else {
                Ok(ToolResult::ok("committed"))
            }
        });
        let env = environment(vec![Arc::new(tool)], Arc::new(CollectingEventSink::new()));

        let result = env
            .apply(ToolInvocation::vcs_commit("Add site", &["index.html".to_string()]))
            .await
            .unwrap();

        assert_eq!(result.status, "committed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(env.outcomes()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_recorded() {
        let mut tool = MockEffectTool::new();
        tool.expect_id().return_const(ToolId::RemotePublish);
        tool.expect_apply()
            .times(1)
            .returning(|_| Err(ToolError::conflict("remote.publish", "non-fast-forward")));
        let sink = Arc::new(CollectingEventSink::new());
        let env = environment(vec![Arc::new(tool)], sink.clone());

        let err = env
            .apply(ToolInvocation::remote_publish("acme/site", "main", &[]))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "conflict");
        assert_eq!(sink.count("tool.failed"), 1);
        assert_eq!(first_unrecovered_error(&env.outcomes()), Some(err));
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_not_found() {
        let env = environment(vec![], Arc::new(CollectingEventSink::new()));
        let err = env
            .apply(ToolInvocation::file_write("a.html", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(env.outcomes().len(), 1);
    }

    #[test]
    fn test_recovered_error_is_ignored() {
        let invocation = ToolInvocation::file_write("a.html", "x");
        let failed = ToolOutcome {
            tool: ToolId::FileWrite,
            idempotency_key: invocation.idempotency_key.clone(),
            arguments: invocation.summary(),
            result: None,
            error: Some(ToolError::transient("file.write", "disk busy")),
            attempts: 3,
        };
        let recovered = ToolOutcome {
            result: Some(ToolResult::ok("written")),
            error: None,
            ..failed.clone()
        };
        assert_eq!(first_unrecovered_error(&[failed.clone(), recovered]), None);
        assert!(first_unrecovered_error(&[failed]).is_some());
    }
}
