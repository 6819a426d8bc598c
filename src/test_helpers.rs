use std::collections::{BTreeMap, BTreeSet};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::remote::{RemoteBackend, TaskHandle, TaskOutcome, TaskRequest};
use crate::results::{PassFailCounts, ResultRecord};
use crate::spec::{ResultFormat, TestSpec};

/// Create a `TestSpec` with sensible defaults for tests.
pub fn make_spec(name: &str, shards: u32) -> TestSpec {
    TestSpec {
        name: name.to_string(),
        target: format!("//base:{name}"),
        shards,
        retry_failed_shards: false,
        retry_without_patch: false,
        serialize_tests: false,
        idempotent: None,
        dimensions: BTreeMap::new(),
        result_format: ResultFormat::Gtest,
        merge_script: None,
        args: vec![],
    }
}

/// Engine config with defaults for tests.
pub fn make_config() -> Config {
    Config {
        backend_url: None,
        auth_token_env: "REFLAKE_BACKEND_TOKEN".to_string(),
        base_priority: 100,
        poll_seconds: 10,
        repeat_count: 10,
        max_repeat_retry_tests: 100,
        summary_size_limit: 4000,
        working_dir: None,
    }
}

/// Valid record where each listed test failed deterministically (one failing
/// run, no passing runs).
pub fn record_with_failures(tests: &[&str]) -> ResultRecord {
    record_with_counts(
        &tests
            .iter()
            .map(|t| (*t, 0u32, 1u32))
            .collect::<Vec<_>>(),
    )
}

/// Valid record where each listed test passed once.
pub fn record_with_no_failures(tests: &[&str]) -> ResultRecord {
    record_with_counts(
        &tests
            .iter()
            .map(|t| (*t, 1u32, 0u32))
            .collect::<Vec<_>>(),
    )
}

/// Valid record built from explicit (test, pass_count, fail_count) entries.
pub fn record_with_counts(entries: &[(&str, u32, u32)]) -> ResultRecord {
    let mut counts = BTreeMap::new();
    let mut failures = BTreeSet::new();
    for (name, pass_count, fail_count) in entries {
        counts.insert(
            name.to_string(),
            PassFailCounts {
                pass_count: *pass_count,
                fail_count: *fail_count,
            },
        );
        if *fail_count > 0 {
            failures.insert(name.to_string());
        }
    }
    ResultRecord {
        valid: true,
        failures,
        total_tests_ran: entries.len() as u64,
        pass_fail_counts: counts,
        not_run: BTreeSet::new(),
    }
}

/// Backend for tests that never reach the remote path.
pub struct NoopBackend;

impl RemoteBackend for NoopBackend {
    async fn trigger(&self, request: &TaskRequest) -> Result<TaskHandle> {
        Err(Error::Dispatch(format!(
            "no backend configured in tests (tried to trigger '{}')",
            request.name
        )))
    }

    async fn collect(&self, handle: &TaskHandle) -> Result<TaskOutcome> {
        Err(Error::Dispatch(format!(
            "no backend configured in tests (tried to collect '{}')",
            handle.id
        )))
    }
}
