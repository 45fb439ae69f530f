//! Scripted providers and tools for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::{ProviderError, ToolError};
use crate::providers::{CapabilityProvider, ProviderRequest};
use crate::tools::{EffectTool, ToolId, ToolInvocation, ToolResult};

/// What a provider saw on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Attempt number from the request.
    pub attempt: u32,
    /// Research query, if any.
    pub query: Option<String>,
    /// Whether the call carried a corrective instruction.
    pub corrective: bool,
    /// Dependency outputs handed to the provider.
    pub inputs: Value,
}

impl RecordedCall {
    fn from_request(request: &ProviderRequest) -> Self {
        Self {
            attempt: request.attempt,
            query: request.query_text().map(str::to_string),
            corrective: request.is_corrective(),
            inputs: request.inputs.to_json(),
        }
    }
}

/// A provider that replays a queue of responses.
///
/// Once the queue is drained every call returns the fallback, or
/// `unavailable` when none is set.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<Value, ProviderError>>>,
    fallback: Option<Value>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    /// Creates a provider with an empty script.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Creates a provider that always answers `value`.
    #[must_use]
    pub fn always(name: impl Into<String>, value: Value) -> Self {
        Self::new(name).with_fallback(value)
    }

    /// Sets the answer used once the script is drained.
    #[must_use]
    pub fn with_fallback(mut self, value: Value) -> Self {
        self.fallback = Some(value);
        self
    }

    /// Sleeps before every answer.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a successful answer.
    #[must_use]
    pub fn then_ok(self, value: Value) -> Self {
        self.script.lock().push_back(Ok(value));
        self
    }

    /// Queues an error.
    #[must_use]
    pub fn then_err(self, error: ProviderError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Returns how many times the provider was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        self.calls.lock().push(RecordedCall::from_request(request));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        match next {
            Some(response) => response,
            None => self.fallback.clone().ok_or_else(|| {
                ProviderError::unavailable(format!("{} has no scripted response", self.name))
            }),
        }
    }
}

/// How the research provider treats a matching query.
#[derive(Debug, Clone)]
pub enum QueryBehavior {
    /// Answer with a finding.
    Succeed,
    /// Fail every call with the error.
    Fail(ProviderError),
    /// Fail the first `n` calls with the error, then succeed.
    Flaky(u32, ProviderError),
    /// Fail call `n` with the `n`th error, repeating the last one.
    Sequence(Vec<ProviderError>),
    /// Answer after a delay.
    Delay(Duration),
    /// Never answer.
    Hang,
}

/// A research provider whose behavior is routed by query text.
///
/// Queries with no matching rule succeed with a finding whose summary
/// names the query. Rules match on substrings, first match wins.
#[derive(Debug, Default)]
pub struct ResearchProvider {
    rules: Vec<(String, QueryBehavior)>,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ResearchProvider {
    /// Creates a provider where every query succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for queries containing `pattern`.
    #[must_use]
    pub fn when(mut self, pattern: impl Into<String>, behavior: QueryBehavior) -> Self {
        self.rules.push((pattern.into(), behavior));
        self
    }

    /// Fails every query containing `pattern`.
    #[must_use]
    pub fn fail_when(self, pattern: impl Into<String>, error: ProviderError) -> Self {
        self.when(pattern, QueryBehavior::Fail(error))
    }

    /// Hangs on every query containing `pattern`.
    #[must_use]
    pub fn hang_when(self, pattern: impl Into<String>) -> Self {
        self.when(pattern, QueryBehavior::Hang)
    }

    /// Returns how many calls were made for `query`.
    #[must_use]
    pub fn calls_for(&self, query: &str) -> u32 {
        self.calls.lock().get(query).copied().unwrap_or(0)
    }

    /// Returns the total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// The summary produced for a successful query.
    #[must_use]
    pub fn summary_for(query: &str) -> String {
        format!("Findings for {query}")
    }

    fn behavior(&self, query: &str) -> QueryBehavior {
        self.rules
            .iter()
            .find(|(pattern, _)| query.contains(pattern.as_str()))
            .map_or(QueryBehavior::Succeed, |(_, b)| b.clone())
    }

    async fn answer(&self, query: &str, call: u32) -> Result<Value, ProviderError> {
        let finding = json!({
            "summary": Self::summary_for(query),
            "sources": [format!("https://example.com/{}", query.len())],
        });
        match self.behavior(query) {
            QueryBehavior::Succeed => Ok(finding),
            QueryBehavior::Fail(err) => Err(err),
            QueryBehavior::Flaky(failures, err) if call <= failures => Err(err),
            QueryBehavior::Flaky(..) => Ok(finding),
            QueryBehavior::Sequence(errors) => {
                let i = usize::try_from(call).unwrap_or(usize::MAX).saturating_sub(1);
                match errors.get(i).or_else(|| errors.last()) {
                    Some(err) => Err(err.clone()),
                    None => Ok(finding),
                }
            }
            QueryBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(finding)
            }
            QueryBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(finding)
            }
        }
    }
}

#[async_trait]
impl CapabilityProvider for ResearchProvider {
    fn name(&self) -> &str {
        "research"
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        let query = request.query_text().unwrap_or_default().to_string();
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(query.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.answer(&query, call).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A code generation provider that applies its files through the tools.
///
/// Every file is written with `file.write`. When configured it then
/// commits the written paths and publishes the branch. Tools missing from
/// the registry are not called.
#[derive(Debug)]
pub struct FileWritingGenerator {
    files: BTreeMap<String, String>,
    commit_message: Option<String>,
    publish: Option<(String, String)>,
    calls: AtomicUsize,
}

impl FileWritingGenerator {
    /// Creates a generator producing `files`.
    #[must_use]
    pub fn new<P, C>(files: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(p, c)| (p.into(), c.into()))
                .collect(),
            commit_message: None,
            publish: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Commits the written files with `message`.
    #[must_use]
    pub fn with_commit(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    /// Publishes `branch` to `repo_ref` after committing.
    #[must_use]
    pub fn with_publish(mut self, repo_ref: impl Into<String>, branch: impl Into<String>) -> Self {
        self.publish = Some((repo_ref.into(), branch.into()));
        self
    }

    /// Returns how many times the generator was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for FileWritingGenerator {
    fn name(&self) -> &str {
        "file-writer"
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tools) = &request.tools {
            let registered = |id| tools.registry().contains(id);
            let paths: Vec<String> = self.files.keys().cloned().collect();
            // Errors land in the outcome log; the stage decides.
            if registered(ToolId::FileWrite) {
                for (path, content) in &self.files {
                    let _ = tools
                        .apply(ToolInvocation::file_write(path.clone(), content.clone()))
                        .await;
                }
            }
            if let Some(message) = self
                .commit_message
                .as_ref()
                .filter(|_| registered(ToolId::VcsCommit))
            {
                let _ = tools
                    .apply(ToolInvocation::vcs_commit(message.clone(), &paths))
                    .await;
            }
            if let Some((repo_ref, branch)) =
                self.publish.as_ref().filter(|_| registered(ToolId::RemotePublish))
            {
                let _ = tools
                    .apply(ToolInvocation::remote_publish(repo_ref.clone(), branch.clone(), &paths))
                    .await;
            }
        }
        Ok(json!({ "files": self.files }))
    }
}

/// A tool that records invocations instead of applying them.
///
/// Queued errors are returned first, one per call.
#[derive(Debug)]
pub struct RecordingTool {
    id: ToolId,
    failures: Mutex<VecDeque<ToolError>>,
    applied: Mutex<Vec<ToolInvocation>>,
}

impl RecordingTool {
    /// Creates a recording tool for `id`.
    #[must_use]
    pub fn new(id: ToolId) -> Self {
        Self {
            id,
            failures: Mutex::new(VecDeque::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Queues an error for the next call.
    #[must_use]
    pub fn then_fail(self, error: ToolError) -> Self {
        self.failures.lock().push_back(error);
        self
    }

    /// Returns every invocation received, including failed ones.
    #[must_use]
    pub fn applied(&self) -> Vec<ToolInvocation> {
        self.applied.lock().clone()
    }

    /// Returns how many calls were received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.applied.lock().len()
    }
}

#[async_trait]
impl EffectTool for RecordingTool {
    fn id(&self) -> ToolId {
        self.id
    }

    async fn apply(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        self.applied.lock().push(invocation.clone());
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(ToolResult::ok("recorded").with_data(invocation.summary()))
    }
}
