#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reflake::error::{Error, Result};
use reflake::remote::{
    RemoteBackend, RemoteCoordinator, TaskHandle, TaskOutcome, TaskRequest, TaskState,
};
use reflake::results::{TestVerdict, VerdictStatus};

pub fn verdicts(entries: &[(&str, VerdictStatus)]) -> Vec<TestVerdict> {
    entries
        .iter()
        .map(|(test, status)| TestVerdict {
            test: test.to_string(),
            status: *status,
            invocation_id: String::new(),
            variant_hash: "deadbeef".to_string(),
        })
        .collect()
}

pub fn completed(verdicts: Vec<TestVerdict>, non_succeeding_shards: Vec<u32>) -> TaskOutcome {
    TaskOutcome {
        state: TaskState::Completed,
        non_succeeding_shards,
        verdicts,
        invocation_ids: vec![],
        variant_hash: "deadbeef".to_string(),
        log: String::new(),
    }
}

pub fn bot_died() -> TaskOutcome {
    TaskOutcome {
        state: TaskState::BotDied,
        non_succeeding_shards: vec![],
        verdicts: vec![],
        invocation_ids: vec![],
        variant_hash: String::new(),
        log: String::new(),
    }
}

#[derive(Default)]
struct FakeBackendState {
    outcomes: Mutex<HashMap<String, TaskOutcome>>,
    /// Step names whose dispatch fails outright (missing build artifact).
    refuse: Mutex<Vec<String>>,
    /// Step names whose collection never completes.
    hang: Mutex<Vec<String>>,
    triggered: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<TaskRequest>>,
    counter: AtomicUsize,
}

/// Scripted remote backend: outcomes are keyed by the step name of the
/// triggering request, and every request is recorded for assertions. Clones
/// share state, so tests keep one clone while the coordinator owns another.
#[derive(Default, Clone)]
pub struct FakeBackend {
    state: Arc<FakeBackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, step_name: &str, outcome: TaskOutcome) {
        self.state
            .outcomes
            .lock()
            .unwrap()
            .insert(step_name.to_string(), outcome);
    }

    pub fn refuse_dispatch(&self, step_name: &str) {
        self.state.refuse.lock().unwrap().push(step_name.to_string());
    }

    pub fn hang_collection(&self, step_name: &str) {
        self.state.hang.lock().unwrap().push(step_name.to_string());
    }

    pub fn request_named(&self, step_name: &str) -> Option<TaskRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == step_name)
            .cloned()
    }

    pub fn request_names(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }
}

impl RemoteBackend for FakeBackend {
    async fn trigger(&self, request: &TaskRequest) -> Result<TaskHandle> {
        if self.state.refuse.lock().unwrap().contains(&request.name) {
            return Err(Error::Dispatch(format!(
                "no build artifact for '{}'",
                request.name
            )));
        }
        self.state.requests.lock().unwrap().push(request.clone());
        let id = format!("task-{}", self.state.counter.fetch_add(1, Ordering::SeqCst));
        self.state
            .triggered
            .lock()
            .unwrap()
            .insert(id.clone(), request.name.clone());
        Ok(TaskHandle {
            id: id.clone(),
            shard_task_ids: request
                .shard_indices
                .iter()
                .map(|i| format!("{id}-shard-{i}"))
                .collect(),
            shard_count: request.shards,
            shard_indices: request.shard_indices.clone(),
        })
    }

    async fn collect(&self, handle: &TaskHandle) -> Result<TaskOutcome> {
        let name = self
            .state
            .triggered
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::Infra(format!("unknown task '{}'", handle.id)))?;

        if self.state.hang.lock().unwrap().contains(&name) {
            // Simulates a task that never finishes; only cancellation or a
            // test timeout gets out of here.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let outcome = self.state.outcomes.lock().unwrap().get(&name).cloned();
        Ok(outcome.unwrap_or_else(|| completed(vec![], vec![])))
    }
}

pub fn make_coordinator(backend: FakeBackend) -> RemoteCoordinator<FakeBackend> {
    RemoteCoordinator::new(backend, 100)
}
