use clap::Parser;

/// reflake — test execution and retry reconciliation for sharded suites
#[derive(Parser, Debug, Clone)]
#[command(name = "reflake", version, about)]
pub struct Cli {
    /// Suite manifest (TOML) produced by configuration resolution
    #[arg(long)]
    pub suites: String,

    /// Path to config file
    #[arg(long)]
    pub config: Option<String>,

    /// Remote execution backend URL
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Base task priority (lower is more urgent)
    #[arg(long)]
    pub base_priority: Option<u8>,

    /// Seconds between result polls of the remote backend
    #[arg(long)]
    pub poll_seconds: Option<u64>,

    /// How many times each failing test is re-run without the patch
    #[arg(long)]
    pub repeat_count: Option<u32>,

    /// Above this many failing tests, rerun the full suite unfiltered
    #[arg(long)]
    pub max_repeat_retry_tests: Option<usize>,

    /// Character budget for the build failure summary
    #[arg(long)]
    pub summary_size_limit: Option<usize>,

    /// Scratch directory for launcher summaries
    #[arg(long)]
    pub working_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cli = Cli::parse_from(["reflake", "--suites", "suites.toml"]);
        assert_eq!(cli.suites, "suites.toml");
        assert!(cli.config.is_none());
        assert!(cli.backend_url.is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let cli = Cli::parse_from([
            "reflake",
            "--suites",
            "suites.toml",
            "--backend-url",
            "https://swarm.example.com",
            "--base-priority",
            "30",
            "--repeat-count",
            "5",
        ]);
        assert_eq!(cli.backend_url.as_deref(), Some("https://swarm.example.com"));
        assert_eq!(cli.base_priority, Some(30));
        assert_eq!(cli.repeat_count, Some(5));
    }

    #[test]
    fn test_suites_is_required() {
        assert!(Cli::try_parse_from(["reflake"]).is_err());
    }
}
