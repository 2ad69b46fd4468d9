//! crabtest CLI - production test runner for OrangeCrab r0.2 boards.
//!
//! ## Features
//!
//! - Full bring-up runs: flash, telemetry session, bootloader, DFU upload
//! - Standalone telemetry sessions against an already-running test image
//! - Operator loop mode for testing a batch of boards
//! - Serial port listing and shell completion generation

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use crabtest::orchestrator::{DeviceLink, HarnessConfig, Orchestrator, SerialLink, TestReport};
use crabtest::process::SystemRunner;
use crabtest::report::{banner, exit_code, render_verdict, write_record};
use crabtest::telemetry::Outcome;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::env;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if spinners/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod config;

use config::Config;

/// crabtest - production test harness for OrangeCrab r0.2 boards.
///
/// Environment variables:
///   CRABTEST_PORT      - Serial port of the board (skips discovery)
///   CRABTEST_LOG_DIR   - Directory for result records
#[derive(Parser)]
#[command(name = "crabtest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port of the board (discovered automatically if not specified).
    #[arg(short, long, global = true, env = "CRABTEST_PORT")]
    port: Option<String>,

    /// Directory for result records.
    #[arg(long, global = true, env = "CRABTEST_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (never prompt; with --loop, start the next
    /// board immediately).
    #[arg(long, global = true, env = "CRABTEST_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the full bring-up sequence on one board (or a batch with --loop).
    Run {
        /// Keep testing boards one after another until interrupted.
        #[arg(long = "loop")]
        loop_boards: bool,

        /// Give up if the serial interface does not appear in time.
        #[arg(long, value_name = "SECS")]
        device_timeout: Option<u64>,

        /// Give up if the DFU bootloader does not enumerate in time.
        #[arg(long, value_name = "SECS")]
        enum_timeout: Option<u64>,

        /// Override the test image loaded into SRAM.
        #[arg(long, value_name = "PATH")]
        test_image: Option<PathBuf>,

        /// Override the bootloader image burned into flash.
        #[arg(long, value_name = "PATH")]
        bootloader_image: Option<PathBuf>,

        /// Override the reboot-monitor image.
        #[arg(long, value_name = "PATH")]
        recovery_image: Option<PathBuf>,

        /// Override the application image pushed over DFU.
        #[arg(long, value_name = "PATH")]
        app_image: Option<PathBuf>,
    },

    /// Run only the telemetry session against an already-flashed board.
    Session,

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "crabtest v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Ctrl-C folds into the library's interrupt checker so long-running
    // loops stop cleanly instead of killing the process mid-record.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }
    {
        let flag = Arc::clone(&interrupted);
        crabtest::set_interrupt_checker(move || flag.load(Ordering::SeqCst));
    }

    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    if let Some(ref log_dir) = cli.log_dir {
        config.log_dir.clone_from(log_dir);
    }

    match &cli.command {
        Commands::Run {
            loop_boards,
            device_timeout,
            enum_timeout,
            test_image,
            bootloader_image,
            recovery_image,
            app_image,
        } => {
            let mut harness = config.harness.clone();
            if device_timeout.is_some() {
                harness.device_timeout_secs = *device_timeout;
            }
            if enum_timeout.is_some() {
                harness.enum_timeout_secs = *enum_timeout;
            }
            if let Some(image) = test_image {
                harness.test_image.clone_from(image);
            }
            if let Some(image) = bootloader_image {
                harness.bootloader_image.clone_from(image);
            }
            if let Some(image) = recovery_image {
                harness.recovery_image.clone_from(image);
            }
            if let Some(image) = app_image {
                harness.app_image.clone_from(image);
            }

            cmd_run(&cli, &config, &harness, *loop_boards)?;
        },
        Commands::Session => {
            cmd_session(&cli, &config)?;
        },
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
        },
        Commands::Completions { shell } => {
            cmd_completions(*shell);
        },
    }

    Ok(())
}

/// Serial access for a run: automatic discovery, or a port pinned by
/// `--port` / `CRABTEST_PORT`.
enum Link {
    Auto(SerialLink),
    Pinned(String),
}

impl DeviceLink for Link {
    fn wait_for_device(&mut self, config: &HarnessConfig) -> crabtest::Result<String> {
        match self {
            Self::Auto(inner) => inner.wait_for_device(config),
            Self::Pinned(name) => Ok(name.clone()),
        }
    }

    fn open(&mut self, port: &str) -> crabtest::Result<Box<dyn Read + Send>> {
        match self {
            Self::Auto(inner) => inner.open(port),
            Self::Pinned(_) => Ok(Box::new(crabtest::open_port(port)?)),
        }
    }
}

/// Run command implementation.
fn cmd_run(cli: &Cli, config: &Config, harness: &HarnessConfig, loop_boards: bool) -> Result<()> {
    if !loop_boards {
        let report = run_board(cli, harness);
        let code = finalize(cli, &config.log_dir, &report)?;
        std::process::exit(code);
    }

    let mut passed = 0usize;
    let mut failed = 0usize;

    loop {
        let report = run_board(cli, harness);
        match report.outcome {
            Outcome::Pass => passed += 1,
            Outcome::Fail => failed += 1,
        }
        finalize(cli, &config.log_dir, &report)?;

        if crabtest::is_interrupt_requested() {
            break;
        }

        if !cli.non_interactive {
            eprintln!(
                "\n{} Insert the next board and press Enter ({} to stop)",
                style("→").cyan().bold(),
                style("Ctrl-C").yellow()
            );
            let mut line = String::new();
            if io::stdin().read_line(&mut line).is_err() || crabtest::is_interrupt_requested() {
                break;
            }
        }
    }

    eprintln!(
        "\n{} Batch finished: {} passed, {} failed",
        style("Σ").bold(),
        style(passed).green().bold(),
        style(failed).red().bold()
    );
    Ok(())
}

/// Drive one board through the full sequence with a progress spinner.
fn run_board(cli: &Cli, harness: &HarnessConfig) -> TestReport {
    let spinner = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}").unwrap());
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    };

    let link = match &cli.port {
        Some(name) => Link::Pinned(name.clone()),
        None => Link::Auto(SerialLink),
    };

    let orchestrator = Orchestrator::new(harness, SystemRunner, link);
    let report = orchestrator.run(&mut |stage| {
        spinner.set_message(stage.label());
    });
    spinner.finish_and_clear();
    report
}

/// One verdict line on stderr, colored by outcome.
fn print_verdict(verdict: &crabtest::Verdict) {
    let line = render_verdict(verdict);
    match verdict.outcome {
        Outcome::Pass => eprintln!("{}", style(line).green()),
        Outcome::Fail => eprintln!("{}", style(line).red().bold()),
    }
}

/// Render the record to the operator and write it to the log directory.
///
/// The returned code is the process exit status for single-board runs.
fn finalize(cli: &Cli, log_dir: &Path, report: &TestReport) -> Result<i32> {
    if !cli.quiet {
        for verdict in &report.verdicts {
            print_verdict(verdict);
        }
        if report.outcome == Outcome::Fail {
            if let Some(last) = report.stages.iter().rev().find(|r| r.outcome == Outcome::Fail) {
                eprintln!("{} {}: {}", style("✗").red().bold(), last.stage, last.message);
            }
        }
        let text = banner(report.outcome);
        match report.outcome {
            Outcome::Pass => eprintln!("{}", style(text).green().bold()),
            Outcome::Fail => eprintln!("{}", style(text).red().bold()),
        }
    }

    let path = write_record(log_dir, report.outcome, &report.verdicts, &report.debug_lines)
        .context("failed to write result record")?;
    if !cli.quiet {
        eprintln!(
            "{} Record written to {}",
            style("✓").green(),
            style(path.display()).cyan()
        );
    }

    Ok(exit_code(report.outcome))
}

/// Session command implementation.
fn cmd_session(cli: &Cli, config: &Config) -> Result<()> {
    let harness = &config.harness;

    let port = match &cli.port {
        Some(name) => name.clone(),
        None => {
            if !cli.quiet {
                eprintln!(
                    "{} Waiting for the board's serial interface...",
                    style("⏳").yellow()
                );
            }
            crabtest::wait_for_board(
                &harness.port_descriptors,
                harness.device_poll(),
                harness.device_timeout(),
            )?
            .name
        },
    };

    let reader = crabtest::open_port(&port).with_context(|| format!("failed to open {port}"))?;
    if !cli.quiet {
        eprintln!("{} Session on {}", style("🔌").cyan(), style(&port).green());
    }

    let mut state = crabtest::SessionState::new();
    let result = crabtest::run_session(reader, &harness.calibration, &mut state);

    let outcome = match result {
        Ok(()) if state.all_passed() => Outcome::Pass,
        Ok(()) => Outcome::Fail,
        Err(e) => {
            if !cli.quiet {
                eprintln!("{} Session failed: {e}", style("✗").red().bold());
            }
            Outcome::Fail
        },
    };

    if !cli.quiet {
        for verdict in &state.verdicts {
            print_verdict(verdict);
        }
        let text = banner(outcome);
        match outcome {
            Outcome::Pass => eprintln!("{}", style(text).green().bold()),
            Outcome::Fail => eprintln!("{}", style(text).red().bold()),
        }
    }

    let path = write_record(&config.log_dir, outcome, &state.verdicts, &state.debug_lines)
        .context("failed to write result record")?;
    if !cli.quiet {
        eprintln!(
            "{} Record written to {}",
            style("✓").green(),
            style(path.display()).cyan()
        );
    }

    std::process::exit(exit_code(outcome));
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let ports = crabtest::discover_ports();

    if json {
        let items: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "description": p.description,
                    "vid": p.vid,
                    "pid": p.pid,
                    "serial": p.serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&items).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("no serial ports found").dim());
    } else {
        for port in &ports {
            let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" ({vid:04X}:{pid:04X})")
            } else {
                String::new()
            };

            eprintln!(
                "  {} {}{}{}",
                style("•").green(),
                style(&port.name).cyan(),
                vid_pid,
                if port.description.is_empty() {
                    String::new()
                } else {
                    format!(" - {}", style(&port.description).dim())
                }
            );
        }
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        // Verifies that all derive macros produce a valid clap Command
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["crabtest", "run"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { loop_boards: false, .. }
        ));
    }

    #[test]
    fn test_cli_parse_run_with_all_options() {
        let cli = Cli::try_parse_from([
            "crabtest",
            "run",
            "--loop",
            "--device-timeout",
            "30",
            "--enum-timeout",
            "120",
            "--test-image",
            "images/test.bit",
            "--app-image",
            "images/app.dfu",
        ])
        .unwrap();
        if let Commands::Run {
            loop_boards,
            device_timeout,
            enum_timeout,
            test_image,
            app_image,
            ..
        } = cli.command
        {
            assert!(loop_boards);
            assert_eq!(device_timeout, Some(30));
            assert_eq!(enum_timeout, Some(120));
            assert_eq!(test_image.unwrap().to_str().unwrap(), "images/test.bit");
            assert_eq!(app_image.unwrap().to_str().unwrap(), "images/app.dfu");
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_session_with_port() {
        let cli =
            Cli::try_parse_from(["crabtest", "--port", "/dev/ttyACM0", "session"]).unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert!(matches!(cli.command, Commands::Session));
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["crabtest", "list-ports", "--json"]).unwrap();
        if let Commands::ListPorts { json } = cli.command {
            assert!(json);
        } else {
            panic!("Expected ListPorts command");
        }
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["crabtest", "completions", "bash"]).unwrap();
        assert!(matches!(cli.command, Commands::Completions { .. }));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "crabtest",
            "--log-dir",
            "/tmp/records",
            "--config",
            "/tmp/config.toml",
            "-vv",
            "--quiet",
            "--non-interactive",
            "run",
        ])
        .unwrap();
        assert_eq!(cli.log_dir.unwrap().to_str().unwrap(), "/tmp/records");
        assert_eq!(cli.config_path.unwrap().to_str().unwrap(), "/tmp/config.toml");
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        let result = Cli::try_parse_from(["crabtest"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_invalid_flag() {
        let result = Cli::try_parse_from(["crabtest", "run", "--bogus"]);
        assert!(result.is_err());
    }
}
