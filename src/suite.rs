use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::process::{LaunchConfig, launch_and_wait};
use crate::reconcile::{self, RetryLimits};
use crate::remote::{RemoteBackend, RemoteCoordinator, TaskHandle, TaskRecord};
use crate::results::{self, ResultRecord};
use crate::spec::{TestOptions, TestSpec, apply_test_options, merge_arg};

/// Filter-argument length budget. Backends that dispatch through a
/// constrained shell have a short command-line limit; everywhere else the
/// limit is generous but still finite.
pub const FILTER_CHAR_LIMIT: usize = 90_000;
pub const FILTER_CHAR_LIMIT_CONSTRAINED: usize = 6_000;

/// One execution attempt of a suite under a specific patch condition.
/// Ordered: later phases are conditional on the earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    WithPatch,
    RetryShardsWithPatch,
    WithoutPatch,
}

impl Phase {
    pub fn suffix(self) -> &'static str {
        match self {
            Phase::WithPatch => "with patch",
            Phase::RetryShardsWithPatch => "retry shards with patch",
            Phase::WithoutPatch => "without patch",
        }
    }

    /// Phases that stand between an observed failure and the final verdict
    /// get a modest scheduling priority bump.
    pub fn on_critical_path(self) -> bool {
        matches!(self, Phase::RetryShardsWithPatch | Phase::WithoutPatch)
    }

    pub fn patched(self) -> bool {
        matches!(self, Phase::WithPatch | Phase::RetryShardsWithPatch)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Wrapper behaviors layered over a suite, applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum WrapperBehavior {
    /// Run the same phases under an alternate label; the results never
    /// influence the suite verdict.
    Experimental { label: String },
}

/// Synchronous local invocation; parses the launcher's JSON summary file.
#[derive(Debug, Clone)]
pub struct LocalSuite {
    pub command: String,
}

/// Delegates execution to the remote backend through the coordinator.
#[derive(Debug, Clone)]
pub struct RemoteSuite;

/// Delegates to an external contract expecting `{valid, failures}` JSON on
/// stdout.
#[derive(Debug, Clone)]
pub struct ScriptSuite {
    pub command: String,
}

/// Test double for exercising the engine itself: phases return scripted
/// records and the double keeps a log of what the engine asked of it.
#[derive(Debug, Clone, Default)]
pub struct MockSuite {
    pub records: BTreeMap<Phase, ResultRecord>,
    pub non_succeeding: BTreeMap<Phase, Vec<u32>>,
    pub ran_phases: Vec<Phase>,
    pub rendered_args: BTreeMap<Phase, Vec<String>>,
    pub requested_shards: BTreeMap<Phase, u32>,
}

/// Closed set of execution backends a suite can run on.
#[derive(Debug, Clone)]
pub enum SuiteBackend {
    Local(LocalSuite),
    Remote(RemoteSuite),
    Script(ScriptSuite),
    Mock(MockSuite),
}

/// Per-phase metadata surfaced for downstream observability.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseMetadata {
    pub suite: String,
    pub step_name: String,
    pub phase: Phase,
    pub patched: bool,
    pub task_ids: Vec<String>,
    pub invocation_ids: Vec<String>,
}

/// Shared context threaded into every suite execution call.
pub struct RunContext<'a, B> {
    pub coordinator: &'a RemoteCoordinator<B>,
    pub limits: &'a RetryLimits,
    pub working_dir: &'a Path,
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Runtime object driving one suite through its phases. Owns the per-phase
/// result map exclusively: `run` writes, everything else only reads after
/// `run` returns.
pub struct Suite {
    spec: TestSpec,
    backend: SuiteBackend,
    wrappers: Vec<WrapperBehavior>,
    pub options: TestOptions,
    pub known_flaky: BTreeSet<String>,
    runs: BTreeMap<Phase, ResultRecord>,
    tasks: BTreeMap<Phase, TaskRecord>,
    pending: BTreeMap<Phase, TaskHandle>,
}

impl Suite {
    /// Build the runtime suite described by one manifest entry.
    pub fn from_entry(entry: &crate::spec::SuiteEntry) -> Self {
        let backend = match entry.backend {
            crate::spec::BackendKind::Remote => SuiteBackend::Remote(RemoteSuite),
            crate::spec::BackendKind::Local => SuiteBackend::Local(LocalSuite {
                command: entry.command.clone().unwrap_or_default(),
            }),
            crate::spec::BackendKind::Script => SuiteBackend::Script(ScriptSuite {
                command: entry.command.clone().unwrap_or_default(),
            }),
        };
        let mut suite = Suite::new(entry.spec(), backend);
        suite.known_flaky = entry.known_flaky.iter().cloned().collect();
        if entry.experimental {
            suite = suite.with_wrapper(WrapperBehavior::Experimental {
                label: "experimental".to_string(),
            });
        }
        suite
    }

    pub fn new(spec: TestSpec, backend: SuiteBackend) -> Self {
        Self {
            spec,
            backend,
            wrappers: Vec::new(),
            options: TestOptions::default(),
            known_flaky: BTreeSet::new(),
            runs: BTreeMap::new(),
            tasks: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn with_wrapper(mut self, wrapper: WrapperBehavior) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    pub fn spec(&self) -> &TestSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn shards(&self) -> u32 {
        self.spec.shards
    }

    pub fn is_experimental(&self) -> bool {
        self.wrappers
            .iter()
            .any(|w| matches!(w, WrapperBehavior::Experimental { .. }))
    }

    /// Suite name with wrapper labels applied in order.
    pub fn display_name(&self) -> String {
        let mut name = self.spec.name.clone();
        for wrapper in &self.wrappers {
            match wrapper {
                WrapperBehavior::Experimental { label } => {
                    name = format!("{name} ({label})");
                }
            }
        }
        name
    }

    pub fn step_name(&self, phase: Phase) -> String {
        format!("{} ({})", self.display_name(), phase)
    }

    /// Build targets this suite needs compiled before any phase can run.
    pub fn compile_targets(&self) -> Vec<String> {
        let mut targets = vec![self.spec.target.clone()];
        if let Some(ref merge_script) = self.spec.merge_script {
            targets.push(merge_script.clone());
        }
        targets
    }

    pub fn run_record(&self, phase: Phase) -> Option<&ResultRecord> {
        self.runs.get(&phase)
    }

    pub fn task_record(&self, phase: Phase) -> Option<&TaskRecord> {
        self.tasks.get(&phase)
    }

    pub fn has_valid_results(&self, phase: Phase) -> bool {
        self.runs.get(&phase).is_some_and(|r| r.valid)
    }

    /// Tests that failed at least once in the phase. Only meaningful when the
    /// phase has valid results.
    pub fn failing_tests(&self, phase: Phase) -> BTreeSet<String> {
        self.runs
            .get(&phase)
            .map(|r| r.failures.clone())
            .unwrap_or_default()
    }

    pub fn deterministic_failures(&self, phase: Phase) -> BTreeSet<String> {
        self.runs
            .get(&phase)
            .map(|r| r.deterministic_failures())
            .unwrap_or_default()
    }

    pub fn pass_fail_counts(&self, phase: Phase) -> BTreeMap<String, results::PassFailCounts> {
        self.runs
            .get(&phase)
            .map(|r| r.pass_fail_counts.clone())
            .unwrap_or_default()
    }

    /// Post-retry failing set for the patched phases; see `reconcile`.
    pub fn failures_including_retry(&self) -> (bool, BTreeSet<String>) {
        reconcile::failures_including_retry(
            self.runs.get(&Phase::WithPatch),
            self.runs.get(&Phase::RetryShardsWithPatch),
            &self.known_flaky,
        )
    }

    /// Failures proven pre-existing by the without-patch phase.
    pub fn without_patch_ignorable(&self) -> Option<BTreeSet<String>> {
        reconcile::without_patch_ignorable(self.runs.get(&Phase::WithoutPatch))
    }

    pub fn phase_metadata(&self, phase: Phase) -> Option<PhaseMetadata> {
        if !self.runs.contains_key(&phase) {
            return None;
        }
        let task = self.tasks.get(&phase);
        Some(PhaseMetadata {
            suite: self.spec.name.clone(),
            step_name: self.step_name(phase),
            phase,
            patched: phase.patched(),
            task_ids: task
                .map(|t| t.handle.task_ids().to_vec())
                .unwrap_or_default(),
            invocation_ids: task.map(|t| t.invocation_ids.clone()).unwrap_or_default(),
        })
    }

    /// Tests this phase should rerun, or None to run the whole suite.
    ///
    /// The with-patch phases always run everything. The without-patch phase
    /// reruns the reconciled failing set, unless it is too large to rerun
    /// meaningfully, in which case the whole suite runs unfiltered so that
    /// genuinely new failures are not silently omitted.
    fn tests_to_retry(&self, phase: Phase, limits: &RetryLimits) -> Option<Vec<String>> {
        if phase != Phase::WithoutPatch {
            return None;
        }
        let (valid, failures) = self.failures_including_retry();
        if !valid {
            // Invalid results are treated as if every test failed.
            return None;
        }
        if failures.len() > limits.max_repeat_retry_tests {
            return None;
        }
        Some(failures.into_iter().collect())
    }

    fn filter_char_limit(&self) -> usize {
        if self.spec.dispatches_to_constrained_shell() {
            FILTER_CHAR_LIMIT_CONSTRAINED
        } else {
            FILTER_CHAR_LIMIT
        }
    }

    /// Render the launcher arguments and shard count for one phase.
    fn invocation(&self, phase: Phase, limits: &RetryLimits) -> Result<(Vec<String>, u32)> {
        let tests_to_retry = self.tests_to_retry(phase, limits);
        let options = reconcile::options_for_phase(
            &self.options,
            phase,
            tests_to_retry.as_deref(),
            limits,
        );
        let mut args = apply_test_options(&self.spec.args, &options, self.spec.result_format);
        let mut shards = self.spec.shards;

        if let Some(tests) = tests_to_retry
            && !tests.is_empty()
        {
            let (flag, delimiter) = self.spec.result_format.filter_flag();
            let expected_len: usize =
                tests.iter().map(String::len).sum::<usize>() + tests.len() * delimiter.len();

            if expected_len < self.filter_char_limit() {
                args = merge_arg(&args, flag, Some(&tests.join(delimiter)));
                shards = reconcile::shards_to_retry_with(
                    self.spec.shards,
                    tests.len() as u64,
                    self.total_tests_ran_with_patch()?,
                    options.repeat_count.unwrap_or(1),
                )?;
            } else {
                warn!(
                    suite = self.spec.name,
                    expected_len, "filter argument over budget, running full suite"
                );
            }
        }

        Ok((args, shards))
    }

    /// Largest test population observed across the patched runs. Retrying
    /// makes no sense before the suite has run with the patch at all.
    fn total_tests_ran_with_patch(&self) -> Result<u64> {
        let with_patch = self
            .runs
            .get(&Phase::WithPatch)
            .map(|r| r.total_tests_ran)
            .ok_or_else(|| {
                Error::Infra(format!(
                    "'{}' has not run with patch; cannot size a retry",
                    self.spec.name
                ))
            })?;
        let retry = self
            .runs
            .get(&Phase::RetryShardsWithPatch)
            .map(|r| r.total_tests_ran)
            .unwrap_or(0);
        Ok(with_patch.max(retry))
    }

    fn has_reported_failures(&self) -> bool {
        self.runs
            .get(&Phase::WithPatch)
            .is_some_and(|r| r.valid && !r.failures.is_empty())
    }

    /// Trigger the phase's remote task. No-op for suites that run locally at
    /// collection time.
    pub async fn pre_run<B: RemoteBackend>(
        &mut self,
        phase: Phase,
        cx: &RunContext<'_, B>,
    ) -> Result<()> {
        if !matches!(self.backend, SuiteBackend::Remote(_)) {
            return Ok(());
        }

        let (args, shards) = self.invocation(phase, cx.limits)?;
        let predecessor = if phase == Phase::RetryShardsWithPatch {
            self.tasks.get(&Phase::WithPatch)
        } else {
            None
        };
        let request = cx.coordinator.build_request(
            &self.spec,
            phase,
            &self.step_name(phase),
            args,
            shards,
            predecessor,
            self.has_reported_failures(),
        )?;
        let handle = cx.coordinator.trigger(&request).await?;
        self.pending.insert(phase, handle);
        Ok(())
    }

    /// Execute (or collect) the phase and finalize its `ResultRecord`.
    pub async fn run<B: RemoteBackend>(
        &mut self,
        phase: Phase,
        cx: &RunContext<'_, B>,
    ) -> Result<()> {
        let step_name = self.step_name(phase);
        info!(step = step_name, "running");

        let (args, shards) = self.invocation(phase, cx.limits)?;

        enum Launch {
            Remote,
            Local(String),
            Script(String),
            Mock,
        }
        let launch = match &self.backend {
            SuiteBackend::Remote(_) => Launch::Remote,
            SuiteBackend::Local(local) => Launch::Local(local.command.clone()),
            SuiteBackend::Script(script) => Launch::Script(script.command.clone()),
            SuiteBackend::Mock(_) => Launch::Mock,
        };

        let record = match launch {
            Launch::Remote => {
                let handle = self.pending.remove(&phase).ok_or_else(|| {
                    Error::Infra(format!("'{step_name}' was never triggered"))
                })?;
                let outcome = cx
                    .coordinator
                    .collect(&handle, cx.cancel.clone())
                    .await?;
                let record = if outcome.state.completed() {
                    ResultRecord::from_verdicts(&outcome.verdicts)
                } else {
                    ResultRecord::invalid()
                };
                self.tasks.insert(
                    phase,
                    TaskRecord {
                        handle,
                        non_succeeding_shards: outcome.non_succeeding_shards,
                        invocation_ids: outcome.invocation_ids,
                    },
                );
                record
            }
            Launch::Local(command) => {
                self.run_local(phase, &step_name, command, args, cx).await?
            }
            Launch::Script(command) => {
                let output = launch_and_wait(
                    LaunchConfig {
                        command,
                        args,
                        working_dir: cx.working_dir.to_path_buf(),
                        timeout: None,
                        log_prefix: step_name.clone(),
                        env: vec![],
                    },
                    cx.cancel.clone(),
                )
                .await?;
                match results::parse_script_result(&output.stdout) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(step = step_name, error = %e, "script output unparseable");
                        ResultRecord::invalid()
                    }
                }
            }
            Launch::Mock => {
                let shard_count = self.spec.shards;
                let SuiteBackend::Mock(mock) = &mut self.backend else {
                    unreachable!("launch kind derived from backend");
                };
                mock.ran_phases.push(phase);
                mock.rendered_args.insert(phase, args);
                mock.requested_shards.insert(phase, shards);
                let record = mock
                    .records
                    .get(&phase)
                    .cloned()
                    .unwrap_or_else(ResultRecord::invalid);
                let non_succeeding =
                    mock.non_succeeding.get(&phase).cloned().unwrap_or_default();
                self.tasks.insert(
                    phase,
                    TaskRecord {
                        handle: TaskHandle {
                            id: format!("mock-{}", phase.suffix().replace(' ', "-")),
                            shard_task_ids: vec![],
                            shard_count,
                            shard_indices: (0..shard_count).collect(),
                        },
                        non_succeeding_shards: non_succeeding,
                        invocation_ids: vec![],
                    },
                );
                record
            }
        };

        if !record.valid {
            warn!(step = self.step_name(phase), "phase produced invalid results");
        }
        self.runs.insert(phase, record);
        Ok(())
    }

    async fn run_local<B: RemoteBackend>(
        &self,
        phase: Phase,
        step_name: &str,
        command: String,
        mut args: Vec<String>,
        cx: &RunContext<'_, B>,
    ) -> Result<ResultRecord> {
        let summary_path = self.summary_path(phase, cx.working_dir);
        args = merge_arg(
            &args,
            "--test-launcher-summary-output",
            Some(&summary_path.display().to_string()),
        );

        let output = launch_and_wait(
            LaunchConfig {
                command,
                args,
                working_dir: cx.working_dir.to_path_buf(),
                timeout: None,
                log_prefix: step_name.to_string(),
                env: vec![],
            },
            cx.cancel.clone(),
        )
        .await?;

        let raw = match std::fs::read_to_string(&summary_path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    step = step_name,
                    exit_code = output.exit_code,
                    error = %e,
                    "no launcher summary written"
                );
                return Ok(ResultRecord::invalid());
            }
        };
        match results::parse_gtest_summary(&raw) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(step = step_name, error = %e, "launcher summary unparseable");
                Ok(ResultRecord::invalid())
            }
        }
    }

    fn summary_path(&self, phase: Phase, working_dir: &Path) -> PathBuf {
        working_dir.join(format!(
            "{}_{}.summary.json",
            self.spec.name,
            phase.suffix().replace(' ', "_")
        ))
    }

    /// Scripted double accessor for engine tests.
    pub fn mock(&self) -> Option<&MockSuite> {
        match &self.backend {
            SuiteBackend::Mock(mock) => Some(mock),
            _ => None,
        }
    }
}
