use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// How a suite's results are produced and parsed, and which filter syntax its
/// launcher understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    #[default]
    Gtest,
    IsolatedScript,
    Script,
}

impl ResultFormat {
    /// Filter flag and delimiter used when rendering a name-filtered rerun.
    pub fn filter_flag(self) -> (&'static str, &'static str) {
        match self {
            ResultFormat::Gtest => ("--gtest_filter", ":"),
            ResultFormat::IsolatedScript => ("--isolated-script-test-filter", "::"),
            ResultFormat::Script => ("--filter", "::"),
        }
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultFormat::Gtest => write!(f, "gtest"),
            ResultFormat::IsolatedScript => write!(f, "isolated_script"),
            ResultFormat::Script => write!(f, "script"),
        }
    }
}

/// Immutable per-suite configuration, resolved by the caller before the
/// engine starts. Never mutated across phases.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub name: String,
    pub target: String,
    pub shards: u32,
    pub retry_failed_shards: bool,
    pub retry_without_patch: bool,
    pub serialize_tests: bool,
    pub idempotent: Option<bool>,
    pub dimensions: BTreeMap<String, String>,
    pub result_format: ResultFormat,
    pub merge_script: Option<String>,
    pub args: Vec<String>,
}

impl TestSpec {
    /// True when the suite's tasks dispatch to a shell with a short command
    /// line limit, which shrinks the filter-argument budget.
    pub fn dispatches_to_constrained_shell(&self) -> bool {
        self.dimensions
            .get("os")
            .is_some_and(|os| os.starts_with("Windows"))
    }
}

/// Invocation adjustments applied per phase: repeat count, name filter, and
/// launcher retry limit. Mutable, unlike the spec it decorates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestOptions {
    pub repeat_count: Option<u32>,
    pub test_filter: Vec<String>,
    pub retry_limit: Option<u32>,
    pub force_independent: bool,
}

/// Replace any existing occurrence of `flag` in `args`, then append
/// `flag=value` (or the bare flag when `value` is None).
pub fn merge_arg(args: &[String], flag: &str, value: Option<&str>) -> Vec<String> {
    let mut merged: Vec<String> = args
        .iter()
        .filter(|a| !a.starts_with(flag))
        .cloned()
        .collect();
    match value {
        Some(v) => merged.push(format!("{flag}={v}")),
        None => merged.push(flag.to_string()),
    }
    merged
}

/// Render test options into launcher arguments. The name filter is handled
/// separately because it is subject to a length budget.
pub fn apply_test_options(
    args: &[String],
    options: &TestOptions,
    format: ResultFormat,
) -> Vec<String> {
    let mut args = args.to_vec();

    if let Some(repeat) = options.repeat_count
        && repeat > 1
    {
        let flag = match format {
            ResultFormat::Gtest => "--gtest_repeat",
            _ => "--isolated-script-test-repeat",
        };
        args = merge_arg(&args, flag, Some(&repeat.to_string()));
    }

    if let Some(limit) = options.retry_limit {
        let flag = match format {
            ResultFormat::Gtest => "--test-launcher-retry-limit",
            _ => "--isolated-script-test-launcher-retry-limit",
        };
        args = merge_arg(&args, flag, Some(&limit.to_string()));
    }

    if options.force_independent && format == ResultFormat::Gtest {
        args = merge_arg(&args, "--test-launcher-batch-limit", Some("1"));
    }

    args
}

/// Return the value of a field that must agree across every record, or fail
/// with an explicit conflict error naming the field.
pub fn consistent_value<R, T>(
    records: &[R],
    field: &str,
    accessor: impl Fn(&R) -> &T,
) -> Result<T>
where
    T: PartialEq + Clone + fmt::Debug,
{
    let mut iter = records.iter().map(&accessor);
    let first = iter
        .next()
        .ok_or_else(|| Error::SpecConflict(format!("no records to read field '{field}' from")))?;
    for value in iter {
        if value != first {
            return Err(Error::SpecConflict(format!(
                "field '{field}' disagrees across {} records: {first:?} vs {value:?}",
                records.len()
            )));
        }
    }
    Ok(first.clone())
}

/// Which execution backend a suite runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    Local,
    Script,
}

/// One `[[suite]]` manifest record: a `TestSpec` plus execution parameters,
/// as handed over by the configuration-resolution step.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SuiteEntry {
    pub name: String,
    pub target: String,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default)]
    pub retry_failed_shards: bool,
    #[serde(default)]
    pub retry_without_patch: bool,
    #[serde(default)]
    pub serialize_tests: bool,
    #[serde(default)]
    pub idempotent: Option<bool>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub result_format: ResultFormat,
    #[serde(default)]
    pub merge_script: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub backend: BackendKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub known_flaky: Vec<String>,
}

fn default_shards() -> u32 {
    1
}

impl SuiteEntry {
    pub fn spec(&self) -> TestSpec {
        TestSpec {
            name: self.name.clone(),
            target: self.target.clone(),
            shards: self.shards,
            retry_failed_shards: self.retry_failed_shards,
            retry_without_patch: self.retry_without_patch,
            serialize_tests: self.serialize_tests,
            idempotent: self.idempotent,
            dimensions: self.dimensions.clone(),
            result_format: self.result_format,
            merge_script: self.merge_script.clone(),
            args: self.args.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "suite")]
    pub suites: Vec<SuiteEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        parse_manifest(&content)
    }
}

pub fn parse_manifest(content: &str) -> Result<Manifest> {
    let manifest: Manifest = toml::from_str(content)?;
    let merged = merge_duplicate_entries(manifest.suites)?;
    for entry in &merged {
        validate_entry(entry)?;
    }
    Ok(Manifest { suites: merged })
}

fn validate_entry(entry: &SuiteEntry) -> Result<()> {
    if entry.shards == 0 {
        return Err(Error::ConfigValidation(format!(
            "suite '{}': shards must be > 0",
            entry.name
        )));
    }
    match entry.backend {
        BackendKind::Local | BackendKind::Script => {
            if entry.command.is_none() {
                return Err(Error::ConfigValidation(format!(
                    "suite '{}': backend '{:?}' requires a command",
                    entry.name, entry.backend
                )));
            }
        }
        BackendKind::Remote => {}
    }
    if entry.backend == BackendKind::Script && entry.result_format != ResultFormat::Script {
        return Err(Error::ConfigValidation(format!(
            "suite '{}': script suites must use result_format = \"script\"",
            entry.name
        )));
    }
    Ok(())
}

/// Resolvers occasionally emit the same suite once per referencing builder.
/// Collapse duplicates, requiring every execution-relevant field to agree and
/// taking the union of the known-flaky sets.
fn merge_duplicate_entries(entries: Vec<SuiteEntry>) -> Result<Vec<SuiteEntry>> {
    let mut by_name: BTreeMap<String, Vec<SuiteEntry>> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for entry in entries {
        if !by_name.contains_key(&entry.name) {
            order.push(entry.name.clone());
        }
        by_name.entry(entry.name.clone()).or_default().push(entry);
    }

    let mut merged = Vec::new();
    for name in order {
        let group = &by_name[&name];
        if group.len() == 1 {
            merged.push(group[0].clone());
            continue;
        }

        let mut entry = group[0].clone();
        entry.target = consistent_value(group, "target", |e| &e.target)?;
        entry.shards = consistent_value(group, "shards", |e| &e.shards)?;
        entry.retry_failed_shards =
            consistent_value(group, "retry_failed_shards", |e| &e.retry_failed_shards)?;
        entry.retry_without_patch =
            consistent_value(group, "retry_without_patch", |e| &e.retry_without_patch)?;
        entry.serialize_tests =
            consistent_value(group, "serialize_tests", |e| &e.serialize_tests)?;
        entry.idempotent = consistent_value(group, "idempotent", |e| &e.idempotent)?;
        entry.dimensions = consistent_value(group, "dimensions", |e| &e.dimensions)?;
        entry.result_format = consistent_value(group, "result_format", |e| &e.result_format)?;
        entry.merge_script = consistent_value(group, "merge_script", |e| &e.merge_script)?;
        entry.args = consistent_value(group, "args", |e| &e.args)?;
        entry.backend = consistent_value(group, "backend", |e| &e.backend)?;
        entry.command = consistent_value(group, "command", |e| &e.command)?;
        entry.experimental = consistent_value(group, "experimental", |e| &e.experimental)?;

        let mut known_flaky: Vec<String> =
            group.iter().flat_map(|e| e.known_flaky.clone()).collect();
        known_flaky.sort();
        known_flaky.dedup();
        entry.known_flaky = known_flaky;

        merged.push(entry);
    }
    Ok(merged)
}
