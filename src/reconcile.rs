use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::results::ResultRecord;
use crate::spec::TestOptions;
use crate::suite::Phase;

/// Bounds on when a repeated, filtered rerun is worthwhile.
#[derive(Debug, Clone)]
pub struct RetryLimits {
    /// How many times each failing test is re-run without the patch.
    pub repeat_count_for_failing_tests: u32,
    /// Above this many failing tests, rerun the full suite unfiltered and
    /// unrepeated; a longer invocation risks timeouts and an oversized
    /// filter argument risks omitting genuinely new failures.
    pub max_repeat_retry_tests: usize,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            repeat_count_for_failing_tests: 10,
            max_repeat_retry_tests: 100,
        }
    }
}

/// Reconcile the patched phases into the post-retry failing set.
///
/// When both phases are valid, a test is a regression only if it is in the
/// deterministic-failure set of both: a test that failed once but passed on
/// shard retry is absorbed as a flake. The externally supplied known-flaky
/// set is subtracted unconditionally. Returns `(false, empty)` when neither
/// phase is valid; callers must then treat the suite as failed, never passed.
pub fn failures_including_retry(
    with_patch: Option<&ResultRecord>,
    retry_shards: Option<&ResultRecord>,
    known_flaky: &BTreeSet<String>,
) -> (bool, BTreeSet<String>) {
    let with_patch = with_patch.filter(|r| r.valid);
    let retry_shards = retry_shards.filter(|r| r.valid);

    let failures = match (with_patch, retry_shards) {
        (Some(original), Some(retry)) => {
            let original = original.deterministic_failures();
            let retry = retry.deterministic_failures();
            original.intersection(&retry).cloned().collect()
        }
        (Some(original), None) => original.deterministic_failures(),
        (None, Some(retry)) => retry.deterministic_failures(),
        (None, None) => return (false, BTreeSet::new()),
    };

    (true, failures.difference(known_flaky).cloned().collect())
}

/// Failures that the without-patch phase proves pre-existing: any test that
/// failed at least once across the repeated run is flaky independent of the
/// patch. A test that was merely NOTRUN is not exculpated. Returns None when
/// the record is missing or invalid, in which case nothing can be ignored.
pub fn without_patch_ignorable(record: Option<&ResultRecord>) -> Option<BTreeSet<String>> {
    let record = record.filter(|r| r.valid)?;
    Some(
        record
            .pass_fail_counts
            .iter()
            .filter(|(_, counts)| counts.fail_count > 0)
            .map(|(name, _)| name.clone())
            .collect(),
    )
}

/// Number of shards to use when retrying `num_tests_to_retry` tests.
///
/// Approximates the original per-shard workload, inflated by the repeat
/// multiplier, while never exceeding the original parallelism or the number
/// of distinct failing tests (extra shards would sit idle).
pub fn shards_to_retry_with(
    original_shards: u32,
    num_tests_to_retry: u64,
    total_tests_ran: u64,
    repeat_multiplier: u32,
) -> Result<u32> {
    if total_tests_ran == 0 {
        return Err(Error::Infra(
            "cannot compute shards to retry with: no tests ran with patch".into(),
        ));
    }

    let scaled = u64::from(original_shards) * u64::from(repeat_multiplier) * num_tests_to_retry;
    let raw = scaled.div_ceil(total_tests_ran);

    let upper = u64::from(original_shards).min(num_tests_to_retry).max(1);
    Ok(raw.clamp(1, upper) as u32)
}

/// Per-phase adjustment of test options.
///
/// A without-patch rerun of a bounded failing set runs each test a fixed
/// number of times regardless of outcome, with launcher-level retries off so
/// the repeat count is exact, and with tests forced independent for more
/// reliable signal. An explicit caller-set repeat count is left alone, and so
/// is anything above `max_repeat_retry_tests`.
pub fn options_for_phase(
    base: &TestOptions,
    phase: Phase,
    tests_to_retry: Option<&[String]>,
    limits: &RetryLimits,
) -> TestOptions {
    let mut options = base.clone();

    let Some(tests) = tests_to_retry else {
        return options;
    };
    if tests.is_empty() || tests.len() > limits.max_repeat_retry_tests {
        return options;
    }

    if phase == Phase::WithoutPatch && options.repeat_count.is_none() {
        options.repeat_count = Some(limits.repeat_count_for_failing_tests);
        options.retry_limit = Some(0);
        options.force_independent = true;
    }

    options
}
