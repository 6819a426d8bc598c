use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::results::TestVerdict;
use crate::spec::TestSpec;
use crate::suite::Phase;

const MAX_API_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Matches the line the result-collection wrapper prints when it opens a new
/// results invocation for a shard.
static INVOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"included "([^"]+)" in"#).expect("invocation regex"));

/// Pull results-invocation ids out of a backend task log.
pub fn extract_invocation_ids(log: &str) -> Vec<String> {
    INVOCATION_RE
        .captures_iter(log)
        .map(|c| c[1].to_string())
        .collect()
}

/// Scheduling request for one remote task covering one suite phase.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskRequest {
    pub name: String,
    pub target: String,
    pub args: Vec<String>,
    pub shards: u32,
    pub shard_indices: Vec<u32>,
    /// None defers to the backend's default deduplication policy.
    pub idempotent: Option<bool>,
    /// Numerically lower is more urgent.
    pub priority: u8,
    pub serialize_tests: bool,
    pub dimensions: BTreeMap<String, String>,
    pub merge_script: Option<String>,
}

/// Handle to a dispatched task, as exposed by the execution backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    pub id: String,
    pub shard_task_ids: Vec<String>,
    pub shard_count: u32,
    pub shard_indices: Vec<u32>,
}

impl TaskHandle {
    pub fn task_ids(&self) -> &[String] {
        &self.shard_task_ids
    }
}

/// Terminal state of a remote task at the backend level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Completed,
    BotDied,
    Expired,
    Canceled,
}

impl TaskState {
    /// The task ran to completion. Shards may still have failed; that is an
    /// application-level signal, not a backend-level one.
    pub fn completed(self) -> bool {
        self == TaskState::Completed
    }
}

/// Everything collected from a finished task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub non_succeeding_shards: Vec<u32>,
    pub verdicts: Vec<TestVerdict>,
    pub invocation_ids: Vec<String>,
    pub variant_hash: String,
    pub log: String,
}

/// What the engine remembers about a phase's dispatch after collection, for
/// shard-retry provenance and observability.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub handle: TaskHandle,
    pub non_succeeding_shards: Vec<u32>,
    pub invocation_ids: Vec<String>,
}

/// Capability interface to the remote execution backend: trigger a task,
/// collect it later. The fleet itself is out of scope.
pub trait RemoteBackend {
    fn trigger(
        &self,
        request: &TaskRequest,
    ) -> impl std::future::Future<Output = Result<TaskHandle>> + Send;

    fn collect(
        &self,
        handle: &TaskHandle,
    ) -> impl std::future::Future<Output = Result<TaskOutcome>> + Send;
}

/// Trigger/collect lifecycle for the per-phase tasks of remote suites:
/// shard-index selection, idempotency, and priority policy live here.
pub struct RemoteCoordinator<B> {
    backend: B,
    base_priority: u8,
}

impl<B: RemoteBackend> RemoteCoordinator<B> {
    pub fn new(backend: B, base_priority: u8) -> Self {
        Self {
            backend,
            base_priority,
        }
    }

    /// Build the dispatch request for one suite phase.
    ///
    /// A genuine shard retry (a predecessor task exists) targets only the
    /// predecessor's non-succeeding shard indices; everything else runs the
    /// full shard range. An empty non-succeeding set on a suite that reports
    /// failing tests means the shard-level and test-level signals disagree,
    /// which is a result-parsing bug upstream, not "nothing to retry".
    pub fn build_request(
        &self,
        spec: &TestSpec,
        phase: Phase,
        step_name: &str,
        args: Vec<String>,
        shards: u32,
        predecessor: Option<&TaskRecord>,
        has_reported_failures: bool,
    ) -> Result<TaskRequest> {
        let shard_indices = match (phase, predecessor) {
            (Phase::RetryShardsWithPatch, Some(previous)) => {
                if previous.non_succeeding_shards.is_empty() {
                    if has_reported_failures {
                        return Err(Error::Infra(format!(
                            "'{step_name}' has no failed shards but the suite reports \
                             failing tests; the test runner reported failures with \
                             exit code 0"
                        )));
                    }
                    return Err(Error::Infra(format!(
                        "'{step_name}' was scheduled for shard retry with no failed shards"
                    )));
                }
                previous.non_succeeding_shards.clone()
            }
            _ => (0..shards).collect(),
        };

        let idempotent = if phase == Phase::RetryShardsWithPatch {
            // A shard retry must actually re-execute, never reuse a
            // deduplicated cached result.
            Some(false)
        } else {
            spec.idempotent
        };

        let priority = if phase.on_critical_path() {
            self.base_priority.saturating_sub(1)
        } else {
            self.base_priority
        };

        Ok(TaskRequest {
            name: step_name.to_string(),
            target: spec.target.clone(),
            args,
            shards,
            shard_indices,
            idempotent,
            priority,
            serialize_tests: spec.serialize_tests,
            dimensions: spec.dimensions.clone(),
            merge_script: spec.merge_script.clone(),
        })
    }

    pub async fn trigger(&self, request: &TaskRequest) -> Result<TaskHandle> {
        info!(
            task = request.name,
            shards = request.shard_indices.len(),
            priority = request.priority,
            "triggering remote task"
        );
        self.backend.trigger(request).await
    }

    /// Suspend until the backend reports the task finished, observing
    /// cancellation. Invocation ids found in the task log are merged into the
    /// outcome.
    pub async fn collect(
        &self,
        handle: &TaskHandle,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<TaskOutcome> {
        let mut outcome = loop {
            let collect = self.backend.collect(handle);
            tokio::pin!(collect);

            let cancelled = match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        outcome = &mut collect => break outcome?,
                        changed = rx.changed() => changed.is_ok() && *rx.borrow(),
                    }
                }
                None => break collect.await?,
            };

            if cancelled {
                warn!(task = handle.id, "cancelled while collecting");
                return Err(Error::Cancelled);
            }
            cancel = None;
        };

        for id in extract_invocation_ids(&outcome.log) {
            if !outcome.invocation_ids.contains(&id) {
                outcome.invocation_ids.push(id);
            }
        }

        if !outcome.state.completed() {
            warn!(task = handle.id, state = ?outcome.state, "task did not complete");
        }
        Ok(outcome)
    }
}

/// Blocking JSON transport to the backend's task API, behind a trait so tests
/// inject fakes.
pub trait TaskApi {
    fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value>;
    fn get(&self, path: &str) -> Result<serde_json::Value>;
}

pub struct HttpTaskApi {
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTaskApi {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token,
        }
    }

    fn request(
        &self,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        for attempt in 1..=MAX_API_RETRIES {
            let mut req = match body {
                Some(_) => ureq::post(&url),
                None => ureq::get(&url),
            };
            if let Some(ref token) = self.auth_token {
                req = req.set("Authorization", &format!("Bearer {token}"));
            }

            let response = match body {
                Some(json) => req.send_json(json),
                None => req.call(),
            };

            match response {
                Ok(resp) => {
                    return resp.into_json().map_err(|e| {
                        Error::Dispatch(format!("malformed backend response from {url}: {e}"))
                    });
                }
                Err(ref e) if attempt < MAX_API_RETRIES && is_retryable(e) => {
                    warn!(attempt, error = %e, backoff_ms, "retrying backend API call");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => {
                    return Err(Error::Dispatch(format!("backend API call failed: {e}")));
                }
            }
        }
        unreachable!("loop returns on final attempt")
    }
}

fn is_retryable(error: &ureq::Error) -> bool {
    match error {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

impl TaskApi for HttpTaskApi {
    fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        self.request(path, Some(body))
    }

    fn get(&self, path: &str) -> Result<serde_json::Value> {
        self.request(path, None)
    }
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    task_id: String,
    #[serde(default)]
    shard_task_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum PolledState {
    Pending,
    Running,
    Completed,
    BotDied,
    Expired,
    Canceled,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    state: PolledState,
    #[serde(default)]
    non_succeeding_shards: Vec<u32>,
    #[serde(default)]
    verdicts: Vec<TestVerdict>,
    #[serde(default)]
    invocation_ids: Vec<String>,
    #[serde(default)]
    variant_hash: String,
    #[serde(default)]
    log: String,
}

/// Production backend speaking JSON over HTTP to the task execution service.
pub struct HttpBackend<A = HttpTaskApi> {
    api: A,
    poll_interval: Duration,
}

impl HttpBackend<HttpTaskApi> {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>, poll_interval: Duration) -> Self {
        Self {
            api: HttpTaskApi::new(base_url, auth_token),
            poll_interval,
        }
    }
}

impl<A: TaskApi> HttpBackend<A> {
    pub fn with_api(api: A, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }
}

impl<A: TaskApi + Sync> RemoteBackend for HttpBackend<A> {
    async fn trigger(&self, request: &TaskRequest) -> Result<TaskHandle> {
        let body = serde_json::to_value(request)
            .map_err(|e| Error::Dispatch(format!("failed to encode task request: {e}")))?;
        let response = self.api.post("tasks/new", &body)?;
        let trigger: TriggerResponse = serde_json::from_value(response)
            .map_err(|e| Error::Dispatch(format!("malformed trigger response: {e}")))?;

        debug!(task = trigger.task_id, name = request.name, "task triggered");
        Ok(TaskHandle {
            id: trigger.task_id,
            shard_task_ids: trigger.shard_task_ids,
            shard_count: request.shards,
            shard_indices: request.shard_indices.clone(),
        })
    }

    async fn collect(&self, handle: &TaskHandle) -> Result<TaskOutcome> {
        loop {
            let response = self.api.get(&format!("tasks/{}/result", handle.id))?;
            let result: ResultResponse = serde_json::from_value(response)
                .map_err(|e| Error::Infra(format!("malformed result response: {e}")))?;

            let state = match result.state {
                PolledState::Pending | PolledState::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                PolledState::Completed => TaskState::Completed,
                PolledState::BotDied => TaskState::BotDied,
                PolledState::Expired => TaskState::Expired,
                PolledState::Canceled => TaskState::Canceled,
            };

            return Ok(TaskOutcome {
                state,
                non_succeeding_shards: result.non_succeeding_shards,
                verdicts: result.verdicts,
                invocation_ids: result.invocation_ids,
                variant_hash: result.variant_hash,
                log: result.log,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_spec;

    fn coordinator() -> RemoteCoordinator<NullBackend> {
        RemoteCoordinator::new(NullBackend, 100)
    }

    struct NullBackend;

    impl RemoteBackend for NullBackend {
        async fn trigger(&self, _request: &TaskRequest) -> Result<TaskHandle> {
            unreachable!("build_request tests never dispatch")
        }

        async fn collect(&self, _handle: &TaskHandle) -> Result<TaskOutcome> {
            unreachable!("build_request tests never dispatch")
        }
    }

    fn record_with_failed_shards(shards: &[u32]) -> TaskRecord {
        TaskRecord {
            handle: TaskHandle {
                id: "task-1".into(),
                shard_task_ids: vec![],
                shard_count: 4,
                shard_indices: (0..4).collect(),
            },
            non_succeeding_shards: shards.to_vec(),
            invocation_ids: vec![],
        }
    }

    #[test]
    fn test_with_patch_runs_full_shard_range() {
        let spec = make_spec("base_unittests", 4);
        let request = coordinator()
            .build_request(
                &spec,
                Phase::WithPatch,
                "base_unittests (with patch)",
                vec![],
                4,
                None,
                false,
            )
            .unwrap();
        assert_eq!(request.shard_indices, vec![0, 1, 2, 3]);
        assert_eq!(request.priority, 100);
        assert_eq!(request.idempotent, None);
    }

    #[test]
    fn test_shard_retry_targets_failed_shards() {
        let spec = make_spec("base_unittests", 4);
        let predecessor = record_with_failed_shards(&[1, 3]);
        let request = coordinator()
            .build_request(
                &spec,
                Phase::RetryShardsWithPatch,
                "base_unittests (retry shards with patch)",
                vec![],
                4,
                Some(&predecessor),
                true,
            )
            .unwrap();
        assert_eq!(request.shard_indices, vec![1, 3]);
    }

    #[test]
    fn test_shard_retry_is_never_idempotent() {
        let mut spec = make_spec("base_unittests", 4);
        spec.idempotent = Some(true);
        let predecessor = record_with_failed_shards(&[0]);
        let request = coordinator()
            .build_request(
                &spec,
                Phase::RetryShardsWithPatch,
                "base_unittests (retry shards with patch)",
                vec![],
                4,
                Some(&predecessor),
                true,
            )
            .unwrap();
        assert_eq!(request.idempotent, Some(false));
    }

    #[test]
    fn test_critical_path_phases_get_priority_bump() {
        let spec = make_spec("base_unittests", 1);
        let request = coordinator()
            .build_request(
                &spec,
                Phase::WithoutPatch,
                "base_unittests (without patch)",
                vec![],
                1,
                None,
                true,
            )
            .unwrap();
        assert_eq!(request.priority, 99);
    }

    #[test]
    fn test_empty_failed_shards_with_failures_is_infra_error() {
        let spec = make_spec("base_unittests", 4);
        let predecessor = record_with_failed_shards(&[]);
        let err = coordinator()
            .build_request(
                &spec,
                Phase::RetryShardsWithPatch,
                "base_unittests (retry shards with patch)",
                vec![],
                4,
                Some(&predecessor),
                true,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Infra(_)));
        assert!(err.to_string().contains("no failed shards"));
    }

    #[test]
    fn test_shard_retry_without_predecessor_runs_full_range() {
        let spec = make_spec("base_unittests", 3);
        let request = coordinator()
            .build_request(
                &spec,
                Phase::RetryShardsWithPatch,
                "base_unittests (retry shards with patch)",
                vec![],
                3,
                None,
                false,
            )
            .unwrap();
        assert_eq!(request.shard_indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_with_patch_honors_declared_idempotency() {
        let mut spec = make_spec("base_unittests", 1);
        spec.idempotent = Some(true);
        let request = coordinator()
            .build_request(&spec, Phase::WithPatch, "x", vec![], 1, None, false)
            .unwrap();
        assert_eq!(request.idempotent, Some(true));
    }

    #[test]
    fn test_extract_invocation_ids() {
        let log = r#"
shard 0: collecting results
rdb-stream: included "invocations/task-abc-0" in "invocations/build-1"
shard 1: collecting results
rdb-stream: included "invocations/task-abc-1" in "invocations/build-1"
"#;
        assert_eq!(
            extract_invocation_ids(log),
            vec!["invocations/task-abc-0", "invocations/task-abc-1"]
        );
    }

    #[test]
    fn test_extract_invocation_ids_empty_log() {
        assert!(extract_invocation_ids("no matches here").is_empty());
    }
}
