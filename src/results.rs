use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Status of a single test execution as reported by the results backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
    Notrun,
    Unknown,
}

impl VerdictStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, VerdictStatus::Fail | VerdictStatus::Crash | VerdictStatus::Abort)
    }

    /// NOTRUN/UNKNOWN executions carry no signal either way.
    pub fn is_inconclusive(self) -> bool {
        matches!(self, VerdictStatus::Notrun | VerdictStatus::Unknown)
    }
}

/// One test execution from the results collaborator, queryable by the
/// invocation that produced it.
#[derive(Debug, Clone, Deserialize)]
pub struct TestVerdict {
    pub test: String,
    pub status: VerdictStatus,
    #[serde(default)]
    pub invocation_id: String,
    #[serde(default)]
    pub variant_hash: String,
}

/// Pass/fail tallies for one test across every execution within a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassFailCounts {
    pub pass_count: u32,
    pub fail_count: u32,
}

/// Canonical per-phase outcome for one suite.
///
/// When `valid` is false the remaining fields must not be trusted: callers
/// treat the phase as "whole suite failed", never as "zero failures".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    pub valid: bool,
    pub failures: BTreeSet<String>,
    pub total_tests_ran: u64,
    pub pass_fail_counts: BTreeMap<String, PassFailCounts>,
    pub not_run: BTreeSet<String>,
}

impl ResultRecord {
    /// Record for a phase whose results could not be obtained or parsed.
    pub fn invalid() -> Self {
        ResultRecord::default()
    }

    /// Tests that failed on every execution within the phase, as opposed to a
    /// flaky pass/fail mix.
    pub fn deterministic_failures(&self) -> BTreeSet<String> {
        self.pass_fail_counts
            .iter()
            .filter(|(_, counts)| counts.fail_count > 0 && counts.pass_count == 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Build a record from per-test verdicts reported by the results backend.
    pub fn from_verdicts(verdicts: &[TestVerdict]) -> Self {
        let mut counts: BTreeMap<String, PassFailCounts> = BTreeMap::new();
        let mut conclusive: BTreeSet<String> = BTreeSet::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for verdict in verdicts {
            seen.insert(verdict.test.clone());
            if verdict.status.is_inconclusive() {
                continue;
            }
            conclusive.insert(verdict.test.clone());
            if verdict.status == VerdictStatus::Skip {
                // Deliberately not executed: a known state, but no tally.
                continue;
            }
            let entry = counts.entry(verdict.test.clone()).or_default();
            if verdict.status.is_failure() {
                entry.fail_count += 1;
            } else {
                entry.pass_count += 1;
            }
        }

        let failures = counts
            .iter()
            .filter(|(_, c)| c.fail_count > 0)
            .map(|(name, _)| name.clone())
            .collect();
        let not_run = seen.difference(&conclusive).cloned().collect();

        ResultRecord {
            valid: true,
            failures,
            total_tests_ran: seen.len() as u64,
            pass_fail_counts: counts,
            not_run,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GtestIterationResult {
    status: String,
}

#[derive(Debug, Deserialize)]
struct GtestSummary {
    per_iteration_data: Vec<BTreeMap<String, Vec<GtestIterationResult>>>,
}

/// Parse the gtest JSON summary written by the test launcher.
///
/// Every iteration entry counts toward the pass/fail tallies; a test whose
/// every iteration ended NOTRUN or UNKNOWN lands in `not_run`.
pub fn parse_gtest_summary(raw: &str) -> Result<ResultRecord> {
    let summary: GtestSummary = serde_json::from_str(raw)
        .map_err(|e| Error::ResultParse(format!("gtest summary: {e}")))?;

    let mut counts: BTreeMap<String, PassFailCounts> = BTreeMap::new();
    let mut conclusive: BTreeSet<String> = BTreeSet::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for iteration in &summary.per_iteration_data {
        for (test, runs) in iteration {
            seen.insert(test.clone());
            for run in runs {
                match run.status.as_str() {
                    "SUCCESS" => {
                        conclusive.insert(test.clone());
                        counts.entry(test.clone()).or_default().pass_count += 1;
                    }
                    "FAILURE" | "CRASH" | "TIMEOUT" | "FAILURE_ON_EXIT" => {
                        conclusive.insert(test.clone());
                        counts.entry(test.clone()).or_default().fail_count += 1;
                    }
                    // A skip is a known state, but carries no tally.
                    "SKIPPED" => {
                        conclusive.insert(test.clone());
                    }
                    // NOTRUN, UNKNOWN and anything unrecognized.
                    _ => {}
                }
            }
        }
    }

    let failures = counts
        .iter()
        .filter(|(_, c)| c.fail_count > 0)
        .map(|(name, _)| name.clone())
        .collect();
    let not_run = seen.difference(&conclusive).cloned().collect();

    Ok(ResultRecord {
        valid: true,
        failures,
        total_tests_ran: seen.len() as u64,
        pass_fail_counts: counts,
        not_run,
    })
}

#[derive(Debug, Deserialize)]
struct ScriptResult {
    valid: bool,
    #[serde(default)]
    failures: Vec<String>,
}

/// Parse the `{valid, failures}` contract emitted by script suites.
///
/// Script suites report per-suite outcomes only, so each failure is recorded
/// as a single deterministic failing run.
pub fn parse_script_result(raw: &str) -> Result<ResultRecord> {
    let result: ScriptResult = serde_json::from_str(raw)
        .map_err(|e| Error::ResultParse(format!("script result: {e}")))?;

    if !result.valid {
        return Ok(ResultRecord::invalid());
    }

    let mut counts = BTreeMap::new();
    for test in &result.failures {
        counts.insert(
            test.clone(),
            PassFailCounts {
                pass_count: 0,
                fail_count: 1,
            },
        );
    }

    Ok(ResultRecord {
        valid: true,
        failures: result.failures.iter().cloned().collect(),
        total_tests_ran: counts.len() as u64,
        pass_fail_counts: counts,
        not_run: BTreeSet::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(test: &str, status: VerdictStatus) -> TestVerdict {
        TestVerdict {
            test: test.to_string(),
            status,
            invocation_id: String::new(),
            variant_hash: String::new(),
        }
    }

    #[test]
    fn test_invalid_record_has_no_trustworthy_fields() {
        let record = ResultRecord::invalid();
        assert!(!record.valid);
        assert!(record.failures.is_empty());
    }

    #[test]
    fn test_from_verdicts_counts() {
        let record = ResultRecord::from_verdicts(&[
            verdict("A.One", VerdictStatus::Fail),
            verdict("A.One", VerdictStatus::Pass),
            verdict("A.Two", VerdictStatus::Fail),
            verdict("A.Three", VerdictStatus::Pass),
        ]);
        assert!(record.valid);
        assert_eq!(record.total_tests_ran, 3);
        assert!(record.failures.contains("A.One"));
        assert!(record.failures.contains("A.Two"));
        // A.One passed once, so it is flaky, not deterministic
        let det = record.deterministic_failures();
        assert!(!det.contains("A.One"));
        assert!(det.contains("A.Two"));
    }

    #[test]
    fn test_from_verdicts_not_run() {
        let record = ResultRecord::from_verdicts(&[
            verdict("A.One", VerdictStatus::Notrun),
            verdict("A.Two", VerdictStatus::Unknown),
            verdict("A.Three", VerdictStatus::Pass),
        ]);
        assert!(record.not_run.contains("A.One"));
        assert!(record.not_run.contains("A.Two"));
        assert!(!record.not_run.contains("A.Three"));
        // NOTRUN is not a failure
        assert!(record.failures.is_empty());
    }

    #[test]
    fn test_skip_is_conclusive_but_untallied() {
        let record = ResultRecord::from_verdicts(&[verdict("A.One", VerdictStatus::Skip)]);
        assert!(record.not_run.is_empty());
        assert!(record.failures.is_empty());
        assert!(record.pass_fail_counts.is_empty());
    }

    #[test]
    fn test_notrun_then_pass_is_conclusive() {
        let record = ResultRecord::from_verdicts(&[
            verdict("A.One", VerdictStatus::Notrun),
            verdict("A.One", VerdictStatus::Pass),
        ]);
        assert!(record.not_run.is_empty());
    }

    #[test]
    fn test_parse_gtest_summary() {
        let raw = r#"{
            "per_iteration_data": [
                {
                    "Suite.Pass": [{"status": "SUCCESS"}],
                    "Suite.Fail": [{"status": "FAILURE"}, {"status": "FAILURE"}],
                    "Suite.Flaky": [{"status": "FAILURE"}, {"status": "SUCCESS"}],
                    "Suite.NotRun": [{"status": "NOTRUN"}]
                }
            ]
        }"#;
        let record = parse_gtest_summary(raw).unwrap();
        assert!(record.valid);
        assert_eq!(record.total_tests_ran, 4);
        assert!(record.failures.contains("Suite.Fail"));
        assert!(record.failures.contains("Suite.Flaky"));
        let det = record.deterministic_failures();
        assert!(det.contains("Suite.Fail"));
        assert!(!det.contains("Suite.Flaky"));
        assert!(record.not_run.contains("Suite.NotRun"));
    }

    #[test]
    fn test_parse_gtest_summary_malformed() {
        let err = parse_gtest_summary("not json").unwrap_err();
        assert!(err.to_string().contains("result parse error"));
    }

    #[test]
    fn test_parse_script_result_valid() {
        let record = parse_script_result(r#"{"valid": true, "failures": ["check_licenses"]}"#)
            .unwrap();
        assert!(record.valid);
        assert!(record.failures.contains("check_licenses"));
        assert!(record.deterministic_failures().contains("check_licenses"));
    }

    #[test]
    fn test_parse_script_result_invalid_flag() {
        let record = parse_script_result(r#"{"valid": false}"#).unwrap();
        assert!(!record.valid);
    }

    #[test]
    fn test_parse_script_result_no_failures() {
        let record = parse_script_result(r#"{"valid": true, "failures": []}"#).unwrap();
        assert!(record.valid);
        assert!(record.failures.is_empty());
    }
}
