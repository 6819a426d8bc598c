use std::path::Path;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::reconcile::RetryLimits;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub backend_url: Option<String>,
    pub auth_token_env: Option<String>,
    pub base_priority: Option<u8>,
    pub poll_seconds: Option<u64>,
    pub repeat_count: Option<u32>,
    pub max_repeat_retry_tests: Option<usize>,
    pub summary_size_limit: Option<usize>,
    pub working_dir: Option<String>,
}

/// Engine configuration, assembled once at startup and passed into the
/// orchestrator; there is no global mutable registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend_url: Option<String>,
    pub auth_token_env: String,
    pub base_priority: u8,
    pub poll_seconds: u64,
    pub repeat_count: u32,
    pub max_repeat_retry_tests: usize,
    pub summary_size_limit: usize,
    pub working_dir: Option<String>,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match cli.config.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                let content = std::fs::read_to_string(path)?;
                parse_config(&content)?
            }
            None => ConfigFile::default(),
        };

        Ok(merge(file_config, cli))
    }

    pub fn retry_limits(&self) -> RetryLimits {
        RetryLimits {
            repeat_count_for_failing_tests: self.repeat_count,
            max_repeat_retry_tests: self.max_repeat_retry_tests,
        }
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(poll) = config.poll_seconds
        && poll == 0
    {
        return Err(Error::ConfigValidation(
            "poll_seconds must be > 0".to_string(),
        ));
    }
    if let Some(repeat) = config.repeat_count
        && repeat == 0
    {
        return Err(Error::ConfigValidation(
            "repeat_count must be > 0".to_string(),
        ));
    }
    if let Some(priority) = config.base_priority
        && priority == 0
    {
        return Err(Error::ConfigValidation(
            "base_priority must be > 0".to_string(),
        ));
    }
    if let Some(limit) = config.summary_size_limit
        && limit < 100
    {
        return Err(Error::ConfigValidation(
            "summary_size_limit must be >= 100".to_string(),
        ));
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Config {
    Config {
        backend_url: cli.backend_url.clone().or(file.backend_url),
        auth_token_env: file
            .auth_token_env
            .unwrap_or_else(|| "REFLAKE_BACKEND_TOKEN".to_string()),
        base_priority: cli.base_priority.or(file.base_priority).unwrap_or(100),
        poll_seconds: cli.poll_seconds.or(file.poll_seconds).unwrap_or(10),
        repeat_count: cli.repeat_count.or(file.repeat_count).unwrap_or(10),
        max_repeat_retry_tests: cli
            .max_repeat_retry_tests
            .or(file.max_repeat_retry_tests)
            .unwrap_or(100),
        summary_size_limit: cli
            .summary_size_limit
            .or(file.summary_size_limit)
            .unwrap_or(4000),
        working_dir: cli.working_dir.clone().or(file.working_dir),
    }
}
