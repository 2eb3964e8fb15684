#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps
)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use streamlog::retention::{survey_directory, DirectorySummary, SweepReport};
use streamlog::sessions::SessionId;
use streamlog::{create_stream_sink, Config, ConfigCommands, StreamingLogManager};

/// `streamlog` - per-session streaming log files with automatic retention.
#[derive(Parser, Debug)]
#[command(name = "streamlog")]
#[command(author = "theonlyhennygod")]
#[command(version)]
#[command(about = "Buffered per-session log files with background flush and cleanup.", long_about = None)]
struct Cli {
    /// Config file (overrides STREAMLOG_CONFIG and ~/.streamlog/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the flush and cleanup loop until Ctrl-C
    #[command(long_about = "\
Run the flush and cleanup loop until Ctrl-C.

Cleans up log files left behind by earlier runs according to the \
retention settings, then keeps sweeping on the configured interval. \
On Ctrl-C every open session is flushed and closed before exit.

Examples:
  streamlog run
  RUST_LOG=debug streamlog --config ./streamlog.toml run")]
    Run,

    /// Append stdin to a session log, one line at a time
    #[command(long_about = "\
Append stdin to a session log, one line at a time.

Each input line (with its newline) becomes one chunk. The session is \
completed at end of input or on Ctrl-C. Without --session a random \
id is generated and printed to stderr.

Examples:
  make 2>&1 | streamlog stream --session build-42
  tail -f app.log | streamlog stream")]
    Stream {
        /// Session id ([A-Za-z0-9._-], at most 128 characters)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Run one cleanup sweep now and print the report
    Sweep {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective settings and a summary of the log directory
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or initialize the configuration file
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `--json` output on stdout stays machine-readable.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let explicit = cli.config.as_deref();
    match cli.command {
        // Handled before loading so that an invalid existing file can be replaced.
        Commands::Config {
            config_command: ConfigCommands::Init { force },
        } => init_config(explicit, force).await,
        Commands::Config {
            config_command: ConfigCommands::Show,
        } => show_config(&Config::load(explicit).await?),
        Commands::Run => run_service(&Config::load(explicit).await?).await,
        Commands::Stream { session } => stream_stdin(&Config::load(explicit).await?, session).await,
        Commands::Sweep { json } => sweep_now(&Config::load(explicit).await?, json).await,
        Commands::Status { json } => print_status(&Config::load(explicit).await?, json).await,
    }
}

fn show_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{rendered}");
    Ok(())
}

async fn run_service(config: &Config) -> Result<()> {
    let manager = StreamingLogManager::start(&config.streaming_logs)?;
    if !manager.is_enabled() {
        info!("Streaming logs disabled (streaming_logs.enabled = false), nothing to run");
        return Ok(());
    }

    info!(
        directory = %config.streaming_logs.resolved_directory().display(),
        "streamlog running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}

async fn stream_stdin(config: &Config, session: Option<String>) -> Result<()> {
    let session_id = match session {
        Some(raw) => {
            SessionId::parse(&raw).with_context(|| format!("Invalid session id {raw:?}"))?
        }
        None => SessionId::generate(),
    };

    let sink = create_stream_sink(&config.streaming_logs)?;
    if sink.name() == "disabled" {
        tracing::warn!("Streaming logs disabled, input will be discarded");
    }
    eprintln!("session: {session_id}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut count = 0usize;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        sink.append(session_id.as_str(), &format!("{line}\n"));
                        count += 1;
                    }
                    None => break,
                }
            }
            _ = &mut ctrl_c => {
                info!(session_id = %session_id, "Interrupted, completing session");
                break;
            }
        }
    }

    sink.complete(session_id.as_str()).await;
    sink.shutdown().await;
    info!(session_id = %session_id, lines = count, "Stream finished");
    Ok(())
}

async fn sweep_now(config: &Config, json: bool) -> Result<()> {
    if !config.streaming_logs.enabled {
        bail!("Streaming logs are disabled (streaming_logs.enabled = false)");
    }
    let manager = StreamingLogManager::new(&config.streaming_logs)?;
    let report = manager.cleanup().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_sweep_report(&report);
    }
    Ok(())
}

fn print_sweep_report(report: &SweepReport) {
    println!("Cleanup sweep of {}", report.directory.display());
    println!("  Scanned:        {}", report.scanned);
    println!(
        "  Deleted:        {} ({} past emergency age)",
        report.deleted, report.deleted_emergency
    );
    println!("  Retained:       {}", report.retained);
    println!("  Active:         {}", report.skipped_active);
    if !report.unrecognized.is_empty() {
        println!("  Unrecognized:   {}", report.unrecognized.join(", "));
    }
    for error in &report.errors {
        println!("  Error:          {}: {}", error.file_name, error.message);
    }
}

async fn print_status(config: &Config, json: bool) -> Result<()> {
    let directory = config.streaming_logs.resolved_directory();
    let summary = {
        let survey_dir = directory.clone();
        tokio::task::spawn_blocking(move || survey_directory(&survey_dir, SystemTime::now()))
            .await
            .context("Directory survey task failed")?
            .with_context(|| format!("Failed to read {}", directory.display()))?
    };

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "config_path": config.config_path,
            "streaming_logs": config.streaming_logs,
            "directory": summary,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let logs = &config.streaming_logs;
    println!("streamlog status");
    println!();
    println!("Version:          {}", env!("CARGO_PKG_VERSION"));
    println!("Config:           {}", config.config_path.display());
    println!("Enabled:          {}", logs.enabled);
    println!("Directory:        {}", directory.display());
    println!("Flush interval:   {}s", logs.flush_interval_seconds);
    println!(
        "Cleanup:          {} (every {}s)",
        if logs.cleanup_enabled { "on" } else { "off" },
        logs.cleanup_interval_seconds
    );
    println!("Retention:        {} min", logs.file_retention_minutes);
    println!("Emergency age:    {} h", logs.max_session_age_hours);
    println!();
    print_directory_summary(&summary);
    Ok(())
}

fn print_directory_summary(summary: &DirectorySummary) {
    if !summary.exists {
        println!("Log directory does not exist yet.");
        return;
    }
    println!("Log files:        {}", summary.log_files);
    println!("Total size:       {} bytes", summary.total_bytes);
    match summary.oldest_age_secs {
        Some(age) => println!("Oldest file:      {}", format_age(age)),
        None => println!("Oldest file:      (none)"),
    }
    if !summary.unrecognized.is_empty() {
        println!("Unrecognized:     {}", summary.unrecognized.join(", "));
    }
}

fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

async fn init_config(explicit: Option<&std::path::Path>, force: bool) -> Result<()> {
    let path = Config::resolve_path(explicit)?;
    if path.exists() && !force {
        bail!(
            "Config file {} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let config = Config {
        config_path: path,
        ..Config::default()
    };
    config.save().await?;
    println!("Wrote {}", config.config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn stream_accepts_session_and_global_config() {
        let cli = Cli::try_parse_from([
            "streamlog",
            "stream",
            "--session",
            "build-42",
            "--config",
            "/tmp/streamlog.toml",
        ])
        .expect("stream invocation should parse");

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/streamlog.toml")));
        match cli.command {
            Commands::Stream { session } => assert_eq!(session.as_deref(), Some("build-42")),
            other => panic!("expected stream command, got {other:?}"),
        }
    }

    #[test]
    fn sweep_and_status_take_json_flag() {
        let cli = Cli::try_parse_from(["streamlog", "sweep", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Sweep { json: true }));

        let cli = Cli::try_parse_from(["streamlog", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: false }));
    }

    #[test]
    fn config_init_parses_force() {
        let cli = Cli::try_parse_from(["streamlog", "config", "init", "--force"]).unwrap();
        match cli.command {
            Commands::Config { config_command } => {
                assert_eq!(config_command, ConfigCommands::Init { force: true });
            }
            other => panic!("expected config command, got {other:?}"),
        }
    }

    #[test]
    fn missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["streamlog"]).is_err());
    }

    #[test]
    fn format_age_picks_units() {
        assert_eq!(format_age(42), "42s");
        assert_eq!(format_age(61), "1m 1s");
        assert_eq!(format_age(2 * 3600 + 5 * 60), "2h 5m");
    }

    #[tokio::test]
    async fn init_config_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        init_config(Some(&path), false).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[streaming_logs]"));

        assert!(init_config(Some(&path), false).await.is_err());
        init_config(Some(&path), true).await.unwrap();
    }
}
