use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::reconcile::RetryLimits;
use crate::remote::{RemoteBackend, RemoteCoordinator};
use crate::suite::{Phase, PhaseMetadata, RunContext, Suite};
use crate::summary;

/// Final verdict for a suite or a whole build. Ordered so the worst verdict
/// wins when aggregating: an infra exception is never masked by other suites
/// passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildVerdict {
    Success,
    Failure,
    Exception,
}

impl std::fmt::Display for BuildVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildVerdict::Success => write!(f, "SUCCESS"),
            BuildVerdict::Failure => write!(f, "FAILURE"),
            BuildVerdict::Exception => write!(f, "EXCEPTION"),
        }
    }
}

/// Everything the build wants to know about one suite after its phases ran.
#[derive(Debug, Clone)]
pub struct SuiteOutcome {
    pub name: String,
    pub verdict: BuildVerdict,
    /// Deterministic failures attributed to the change.
    pub new_failures: BTreeSet<String>,
    /// Failures forgiven because they also fail without the patch.
    pub ignored_failures: BTreeSet<String>,
    /// Failures forgiven because they are known flaky on main.
    pub ignored_flakes: BTreeSet<String>,
    pub annotation: String,
    pub exception: Option<String>,
    pub experimental: bool,
    pub phases: Vec<PhaseMetadata>,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub verdict: BuildVerdict,
    pub reason: String,
    pub suites: Vec<SuiteOutcome>,
}

/// The phase state machine: decides which phases each suite runs, feeds
/// results through reconciliation, and produces the build verdict.
pub struct Orchestrator<B> {
    coordinator: RemoteCoordinator<B>,
    limits: RetryLimits,
    summary_size_limit: usize,
    working_dir: PathBuf,
}

impl<B: RemoteBackend> Orchestrator<B> {
    pub fn new(coordinator: RemoteCoordinator<B>, config: &Config, working_dir: PathBuf) -> Self {
        Self {
            coordinator,
            limits: config.retry_limits(),
            summary_size_limit: config.summary_size_limit,
            working_dir,
        }
    }

    /// Drive every suite through its phases and reconcile a build verdict.
    ///
    /// Within one suite phases are strictly sequential; across suites each
    /// phase is triggered for everyone before anything is collected, so
    /// wall-clock cost is bounded by the slowest suite. Cancellation aborts
    /// every outstanding collection and suppresses all not-yet-dispatched
    /// phases.
    pub async fn run_build(
        &self,
        suites: &mut [Suite],
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<BuildOutcome> {
        for suite in suites.iter() {
            info!(
                suite = suite.name(),
                targets = ?suite.compile_targets(),
                shards = suite.shards(),
                "scheduling suite"
            );
        }

        let mut excepted: BTreeMap<usize, String> = BTreeMap::new();

        let everyone: Vec<usize> = (0..suites.len()).collect();
        self.run_phase(suites, &everyone, Phase::WithPatch, &mut excepted, cancel.clone())
            .await?;

        let retriable: Vec<usize> = suites
            .iter()
            .enumerate()
            .filter(|(i, suite)| {
                !excepted.contains_key(i)
                    && suite.spec().retry_failed_shards
                    && suite
                        .task_record(Phase::WithPatch)
                        .is_some_and(|t| !t.non_succeeding_shards.is_empty())
                    && !Self::exonerated_as_known_flaky(suite)
            })
            .map(|(i, _)| i)
            .collect();

        if !retriable.is_empty() {
            self.run_phase(
                suites,
                &retriable,
                Phase::RetryShardsWithPatch,
                &mut excepted,
                cancel.clone(),
            )
            .await?;
        }

        let deapplied: Vec<usize> = suites
            .iter()
            .enumerate()
            .filter(|(i, suite)| {
                if excepted.contains_key(i) || !suite.spec().retry_without_patch {
                    return false;
                }
                let (valid, failures) = suite.failures_including_retry();
                valid && !failures.is_empty()
            })
            .map(|(i, _)| i)
            .collect();

        if !deapplied.is_empty() {
            self.run_phase(suites, &deapplied, Phase::WithoutPatch, &mut excepted, cancel)
                .await?;
        }

        let outcomes: Vec<SuiteOutcome> = suites
            .iter()
            .enumerate()
            .map(|(i, suite)| Self::suite_outcome(suite, excepted.get(&i)))
            .collect();

        let verdict = outcomes
            .iter()
            .map(|o| o.verdict)
            .max()
            .unwrap_or(BuildVerdict::Success);
        let reason = Self::build_reason(verdict, &outcomes, self.summary_size_limit);

        info!(%verdict, "build finished");
        Ok(BuildOutcome {
            verdict,
            reason,
            suites: outcomes,
        })
    }

    /// Single-suite contract: run one suite through its phases and return its
    /// verdict.
    pub async fn run_suite(
        &self,
        suite: &mut Suite,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<SuiteOutcome> {
        let outcome = self
            .run_build(std::slice::from_mut(suite), cancel)
            .await?;
        outcome
            .suites
            .into_iter()
            .next()
            .ok_or_else(|| Error::Infra("suite produced no outcome".into()))
    }

    /// Trigger the phase for every listed suite (largest shard counts first,
    /// since they take longest to finish), then collect every result. A
    /// suite-scoped error marks that suite excepted without disturbing the
    /// rest; cancellation aborts everything.
    async fn run_phase(
        &self,
        suites: &mut [Suite],
        indices: &[usize],
        phase: Phase,
        excepted: &mut BTreeMap<usize, String>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let mut order: Vec<usize> = indices.to_vec();
        order.sort_by_key(|&i| std::cmp::Reverse(suites[i].shards()));

        let cx = RunContext {
            coordinator: &self.coordinator,
            limits: &self.limits,
            working_dir: &self.working_dir,
            cancel,
        };

        for &i in &order {
            if Self::cancel_requested(&cx.cancel) {
                return Err(Error::Cancelled);
            }
            if let Err(e) = suites[i].pre_run(phase, &cx).await {
                self.note_suite_error(suites, i, phase, e, excepted)?;
            }
        }

        for &i in &order {
            if excepted.contains_key(&i) {
                continue;
            }
            if Self::cancel_requested(&cx.cancel) {
                return Err(Error::Cancelled);
            }
            if let Err(e) = suites[i].run(phase, &cx).await {
                self.note_suite_error(suites, i, phase, e, excepted)?;
            }
        }

        Ok(())
    }

    fn note_suite_error(
        &self,
        suites: &[Suite],
        index: usize,
        phase: Phase,
        error: Error,
        excepted: &mut BTreeMap<usize, String>,
    ) -> Result<()> {
        if !error.is_suite_scoped() {
            return Err(error);
        }
        warn!(
            step = suites[index].step_name(phase),
            error = %error,
            "suite excepted"
        );
        excepted.insert(index, error.to_string());
        Ok(())
    }

    fn cancel_requested(cancel: &Option<watch::Receiver<bool>>) -> bool {
        cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// A suite whose deterministic with-patch failures are all contained in
    /// the known-flaky set is exonerated: nothing left to retry.
    fn exonerated_as_known_flaky(suite: &Suite) -> bool {
        if !suite.has_valid_results(Phase::WithPatch) {
            return false;
        }
        let deterministic = suite.deterministic_failures(Phase::WithPatch);
        !deterministic.is_empty() && deterministic.is_subset(&suite.known_flaky)
    }

    fn suite_outcome(suite: &Suite, exception: Option<&String>) -> SuiteOutcome {
        let phases = [
            Phase::WithPatch,
            Phase::RetryShardsWithPatch,
            Phase::WithoutPatch,
        ]
        .into_iter()
        .filter_map(|p| suite.phase_metadata(p))
        .collect();

        let ignored_flakes: BTreeSet<String> = if suite.has_valid_results(Phase::WithPatch) {
            suite
                .deterministic_failures(Phase::WithPatch)
                .intersection(&suite.known_flaky)
                .cloned()
                .collect()
        } else {
            BTreeSet::new()
        };

        if let Some(reason) = exception {
            return SuiteOutcome {
                name: suite.name().to_string(),
                verdict: if suite.is_experimental() {
                    BuildVerdict::Success
                } else {
                    BuildVerdict::Exception
                },
                new_failures: BTreeSet::new(),
                ignored_failures: BTreeSet::new(),
                ignored_flakes,
                annotation: format!("{} (test results summary)\n{reason}", suite.name()),
                exception: Some(reason.clone()),
                experimental: suite.is_experimental(),
                phases,
            };
        }

        let (valid, failures) = suite.failures_including_retry();
        if !valid {
            let reason = format!(
                "'{}' produced no valid results in any phase",
                suite.name()
            );
            return SuiteOutcome {
                name: suite.name().to_string(),
                verdict: if suite.is_experimental() {
                    BuildVerdict::Success
                } else {
                    BuildVerdict::Exception
                },
                new_failures: BTreeSet::new(),
                ignored_failures: BTreeSet::new(),
                ignored_flakes,
                annotation: format!("{} (test results summary)\n{reason}", suite.name()),
                exception: Some(reason),
                experimental: suite.is_experimental(),
                phases,
            };
        }

        let ignorable = suite.without_patch_ignorable().unwrap_or_default();
        let new_failures: BTreeSet<String> =
            failures.difference(&ignorable).cloned().collect();
        let ignored_failures: BTreeSet<String> =
            failures.intersection(&ignorable).cloned().collect();

        let verdict = if suite.is_experimental() || new_failures.is_empty() {
            BuildVerdict::Success
        } else {
            BuildVerdict::Failure
        };

        let annotation = summary::suite_annotation(
            suite.name(),
            &new_failures,
            &ignored_failures,
            &ignored_flakes,
        );

        SuiteOutcome {
            name: suite.name().to_string(),
            verdict,
            new_failures,
            ignored_failures,
            ignored_flakes,
            annotation,
            exception: None,
            experimental: suite.is_experimental(),
            phases,
        }
    }

    fn build_reason(
        verdict: BuildVerdict,
        outcomes: &[SuiteOutcome],
        size_limit: usize,
    ) -> String {
        let failed: Vec<(String, BTreeSet<String>)> = outcomes
            .iter()
            .filter(|o| o.verdict == BuildVerdict::Failure)
            .map(|o| (o.name.clone(), o.new_failures.clone()))
            .collect();

        match verdict {
            BuildVerdict::Success => "All test suites passed.".to_string(),
            BuildVerdict::Failure => summary::failure_reason(&failed, size_limit),
            BuildVerdict::Exception => {
                let excepted: Vec<&str> = outcomes
                    .iter()
                    .filter(|o| o.verdict == BuildVerdict::Exception)
                    .map(|o| o.name.as_str())
                    .collect();
                let mut reason = format!(
                    "{} Test Suite(s) had no valid results: {}.",
                    excepted.len(),
                    excepted.join(", ")
                );
                if !failed.is_empty() {
                    reason.push_str("\n\n");
                    reason.push_str(&summary::failure_reason(&failed, size_limit));
                }
                reason
            }
        }
    }
}
