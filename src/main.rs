//! CLI entry point for mediafetch.
//!
//! Every command prints a JSON document on stdout; logs go to stderr.

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use mediafetch_core::{
    Engine, EngineConfig, HistoryQuery, HistoryStatus, Platform, RequestError, SubmitRequest,
    SyncOutcome, SystemClock,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command, CookiesCommand};

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    /// The task or command finished but did not produce what was asked for.
    Failure,
    /// The request was refused (validation, unsupported platform, rate limit, unknown task).
    Rejected,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Failure => ExitCode::from(1),
            ProcessExit::Rejected => ExitCode::from(2),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    init_tracing(&args);
    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(args: &Args) {
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &args.db {
        config.database_path.clone_from(db);
    }
    if let Command::Worker {
        concurrency: Some(concurrency),
    } = &args.command
    {
        config.worker_concurrency = usize::from(*concurrency);
    }
    Ok(config)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints a refused request as an error body and maps it to an exit status.
fn report_request_error(error: &RequestError) -> Result<ProcessExit> {
    warn!(error_kind = error.kind(), error = %error, "request refused");
    print_json(&error.to_body())?;
    Ok(if error.is_client_error() {
        ProcessExit::Rejected
    } else {
        ProcessExit::Failure
    })
}

async fn run(args: Args) -> Result<ProcessExit> {
    let config = load_config(&args)?;
    ensure_parent_dir(&config.database_path)?;
    let engine = Engine::build(config, SystemClock::shared()).await?;

    match args.command {
        Command::Submit {
            url,
            quality,
            client,
            wait,
        } => {
            let request = SubmitRequest {
                url,
                quality,
                client_key: client,
            };
            if wait {
                submit_and_wait(&engine, &request).await
            } else {
                match engine.service().submit(&request).await {
                    Ok(response) => {
                        print_json(&response)?;
                        Ok(ProcessExit::Success)
                    }
                    Err(e) => report_request_error(&e),
                }
            }
        }
        Command::Formats { url, client } => match engine.service().formats(&url, &client).await {
            Ok(response) => {
                print_json(&response)?;
                Ok(ProcessExit::Success)
            }
            Err(e) => report_request_error(&e),
        },
        Command::Stats => match engine.service().stats().await {
            Ok(stats) => {
                print_json(&stats)?;
                Ok(ProcessExit::Success)
            }
            Err(e) => report_request_error(&e),
        },
        Command::Status { task_id } => match engine.service().status(&task_id).await {
            Ok(status) => {
                print_json(&status)?;
                Ok(ProcessExit::Success)
            }
            Err(e) => report_request_error(&e),
        },
        Command::Cancel { task_id } => match engine.service().cancel(&task_id).await {
            Ok(response) => {
                print_json(&response)?;
                Ok(ProcessExit::Success)
            }
            Err(e) => report_request_error(&e),
        },
        Command::Worker { .. } => {
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("shutdown requested, finishing in-flight attempts");
                signal_token.cancel();
            });

            let stats = engine.run_workers(shutdown).await;
            print_json(&json!({
                "succeeded": stats.succeeded(),
                "retried": stats.retried(),
                "failed": stats.failed(),
            }))?;
            Ok(ProcessExit::Success)
        }
        Command::Drain => {
            let stats = engine.pool().run_until_idle().await?;
            print_json(&json!({
                "succeeded": stats.succeeded(),
                "retried": stats.retried(),
                "failed": stats.failed(),
                "skipped": stats.skipped(),
            }))?;
            Ok(ProcessExit::Success)
        }
        Command::Sweep => {
            let report = engine.sweeper().sweep_once().await?;
            print_json(&report)?;
            Ok(ProcessExit::Success)
        }
        Command::History {
            platform,
            status,
            limit,
            offset,
        } => {
            let query = HistoryQuery {
                platform: platform
                    .as_deref()
                    .map(Platform::from_str)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                status: status
                    .as_deref()
                    .map(HistoryStatus::from_str)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                limit,
                offset,
            };
            match engine.service().history(&query).await {
                Ok(entries) => {
                    print_json(&entries)?;
                    Ok(ProcessExit::Success)
                }
                Err(e) => report_request_error(&e),
            }
        }
        Command::Cookies { action } => run_cookies(&engine, action).await,
    }
}

async fn submit_and_wait(engine: &Engine, request: &SubmitRequest) -> Result<ProcessExit> {
    let shutdown = CancellationToken::new();
    let pool = engine.pool().clone();
    let pool_token = shutdown.clone();
    let workers = tokio::spawn(async move { pool.run(pool_token).await });

    let outcome = engine.service().submit_and_wait(request).await;
    shutdown.cancel();
    if let Err(e) = workers.await {
        warn!(error = %e, "worker pool task panicked");
    }

    match outcome {
        Ok(SyncOutcome::File { path, status }) => {
            print_json(&json!({ "path": path, "status": status }))?;
            Ok(ProcessExit::Success)
        }
        Ok(SyncOutcome::Pending(status)) => {
            print_json(&status)?;
            Ok(ProcessExit::Success)
        }
        Ok(SyncOutcome::Failed(status)) => {
            print_json(&status)?;
            Ok(ProcessExit::Failure)
        }
        Err(e) => report_request_error(&e),
    }
}

async fn run_cookies(engine: &Engine, action: CookiesCommand) -> Result<ProcessExit> {
    match action {
        CookiesCommand::Install { platform, file } => {
            let platform = Platform::from_str(&platform).map_err(|e| anyhow!(e))?;
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let bundle = engine.cookies().install(platform, content).await?;
            print_json(&bundle.info())?;
        }
        CookiesCommand::List => {
            print_json(&engine.cookies().list())?;
        }
        CookiesCommand::Remove { platform } => {
            let platform = Platform::from_str(&platform).map_err(|e| anyhow!(e))?;
            let removed = engine.cookies().remove(platform).await?;
            print_json(&json!({ "platform": platform, "removed": removed }))?;
        }
    }
    Ok(ProcessExit::Success)
}
