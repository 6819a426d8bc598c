use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use reflake::cli::Cli;
use reflake::config::Config;
use reflake::error::Error;
use reflake::orchestrator::{BuildVerdict, Orchestrator};
use reflake::remote::{HttpBackend, RemoteCoordinator};
use reflake::spec::{BackendKind, Manifest};
use reflake::suite::Suite;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("reflake starting");

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    info!(?config, "config loaded");

    let manifest = match Manifest::load(Path::new(&cli.suites)) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    if manifest.suites.is_empty() {
        eprintln!("error: suite manifest '{}' lists no suites", cli.suites);
        std::process::exit(2);
    }

    let needs_backend = manifest
        .suites
        .iter()
        .any(|entry| entry.backend == BackendKind::Remote);
    let backend_url = match (&config.backend_url, needs_backend) {
        (Some(url), _) => url.clone(),
        (None, false) => "http://backend.invalid".to_string(),
        (None, true) => {
            eprintln!("error: manifest contains remote suites but no backend_url is configured");
            std::process::exit(2);
        }
    };
    let auth_token = std::env::var(&config.auth_token_env).ok();
    let backend = HttpBackend::new(
        backend_url,
        auth_token,
        Duration::from_secs(config.poll_seconds),
    );
    let coordinator = RemoteCoordinator::new(backend, config.base_priority);

    let working_dir = config
        .working_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::temp_dir().join(format!("reflake-{}", std::process::id()))
        });
    if let Err(e) = std::fs::create_dir_all(&working_dir) {
        eprintln!("error: failed to create working dir: {e}");
        std::process::exit(2);
    }

    let mut suites: Vec<Suite> = manifest.suites.iter().map(Suite::from_entry).collect();
    info!(count = suites.len(), "suites loaded");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling build");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator = Orchestrator::new(coordinator, &config, working_dir);
    match orchestrator.run_build(&mut suites, Some(cancel_rx)).await {
        Ok(outcome) => {
            for suite in &outcome.suites {
                info!(
                    suite = suite.name,
                    verdict = %suite.verdict,
                    "suite finished"
                );
                if !suite.annotation.is_empty() {
                    info!("{}", suite.annotation);
                }
            }
            println!("{}", outcome.reason);
            match outcome.verdict {
                BuildVerdict::Success => {}
                BuildVerdict::Failure => std::process::exit(1),
                BuildVerdict::Exception => std::process::exit(2),
            }
        }
        Err(Error::Cancelled) => {
            eprintln!("build cancelled");
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    }
}
