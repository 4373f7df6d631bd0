//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Queue, download and serve media from social and video platforms.
///
/// Submissions are stored as durable tasks; a `worker` process executes
/// them with retries and sweeps expired files.
#[derive(Parser, Debug)]
#[command(name = "mediafetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue a URL for download
    Submit {
        url: String,

        /// Requested quality: 144p..2160p, best, or audio
        #[arg(long = "quality", short = 'Q')]
        quality: Option<String>,

        /// Rate-limit identity for this submission
        #[arg(long = "client", default_value = "cli")]
        client: String,

        /// Run the download in-process and wait for the file
        #[arg(long)]
        wait: bool,
    },

    /// List the formats a URL offers without downloading
    Formats {
        url: String,

        /// Rate-limit identity for this lookup
        #[arg(long = "client", default_value = "cli")]
        client: String,
    },

    /// Show a task's state, result or error
    Status { task_id: String },

    /// Show task totals per state and download outcomes
    Stats,

    /// Cancel a pending, retrying or running task
    Cancel { task_id: String },

    /// Run workers and the file sweeper until interrupted
    Worker {
        /// Number of concurrent workers (overrides config)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=64))]
        concurrency: Option<u16>,
    },

    /// Run every task that is due now, then exit
    Drain,

    /// Run one sweep of expired and orphaned media files
    Sweep,

    /// List completed downloads, newest first
    History {
        /// Only this platform (e.g. youtube)
        #[arg(long)]
        platform: Option<String>,

        /// Only SUCCESS or FAILURE rows
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Manage per-platform cookie bundles
    Cookies {
        #[command(subcommand)]
        action: CookiesCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CookiesCommand {
    /// Install a Netscape-format cookie file for a platform
    Install { platform: String, file: PathBuf },

    /// List installed bundles
    List,

    /// Remove a platform's bundle
    Remove { platform: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_submit_parses_flags() {
        let args = Args::try_parse_from([
            "mediafetch",
            "submit",
            "https://youtu.be/abc",
            "-Q",
            "1080p",
            "--client",
            "10.0.0.1",
            "--wait",
        ])
        .unwrap();
        match args.command {
            Command::Submit {
                url,
                quality,
                client,
                wait,
            } => {
                assert_eq!(url, "https://youtu.be/abc");
                assert_eq!(quality.as_deref(), Some("1080p"));
                assert_eq!(client, "10.0.0.1");
                assert!(wait);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_formats_and_stats() {
        let args = Args::try_parse_from(["mediafetch", "formats", "https://vimeo.com/1"]).unwrap();
        match args.command {
            Command::Formats { url, client } => {
                assert_eq!(url, "https://vimeo.com/1");
                assert_eq!(client, "cli");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let args = Args::try_parse_from(["mediafetch", "stats"]).unwrap();
        assert!(matches!(args.command, Command::Stats));
    }

    #[test]
    fn test_cli_verbose_flag_is_global() {
        let args = Args::try_parse_from(["mediafetch", "status", "abc", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["mediafetch", "-q", "sweep"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_worker_concurrency_range() {
        let args = Args::try_parse_from(["mediafetch", "worker", "-c", "8"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Worker {
                concurrency: Some(8)
            }
        ));
        assert!(Args::try_parse_from(["mediafetch", "worker", "-c", "0"]).is_err());
        assert!(Args::try_parse_from(["mediafetch", "worker", "-c", "65"]).is_err());
    }

    #[test]
    fn test_cli_history_defaults() {
        let args = Args::try_parse_from(["mediafetch", "history"]).unwrap();
        match args.command {
            Command::History {
                platform,
                status,
                limit,
                offset,
            } => {
                assert!(platform.is_none());
                assert!(status.is_none());
                assert_eq!(limit, 20);
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_cookies_install() {
        let args =
            Args::try_parse_from(["mediafetch", "cookies", "install", "instagram", "c.txt"])
                .unwrap();
        assert!(matches!(
            args.command,
            Command::Cookies {
                action: CookiesCommand::Install { .. }
            }
        ));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        let result = Args::try_parse_from(["mediafetch"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["mediafetch", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
