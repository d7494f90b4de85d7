//! churnlab - installation churn reproduction harness
//!
//! ## Commands
//!
//! - `poke`: churn the receiver, then send one message and wait for it
//! - `stress`: churn the receiver, then send a batch and observe a window
//! - `listen`: bring up the receiver only and log what arrives
//!
//! With no subcommand, `poke` runs (or `listen` when `RECV_ONLY` is set).
//!
//! Exit codes: `0` when the run completed, `1` on a fatal error, `2` with
//! `--strict` when the message exchange did not end in `delivered`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use churnlab_core::{
    render_summary, write_report_json, Address, ExchangeOutcome, FaultModel, HarnessConfig,
    LoopbackNetwork, NetworkEnv, Orchestrator, RunReport, StartStyle, Variant,
};

#[derive(Parser)]
#[command(name = "churnlab")]
#[command(author = "Stevedores Org")]
#[command(version = churnlab_core::VERSION)]
#[command(about = "Reproduce message loss after installation churn", long_about = None)]
struct Cli {
    /// Network environment
    #[arg(long, global = true, env = "XMTP_ENV", default_value = "local")]
    network: NetworkEnv,

    /// Enable debug logging
    #[arg(short, long, global = true, env = "DEBUG")]
    debug: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory for installation storage files
    #[arg(long, global = true, default_value = ".")]
    work_dir: PathBuf,

    /// Number of stale receiver installations to create before the final one
    #[arg(long, global = true, env = "STALE_INSTALLATIONS", default_value_t = 3)]
    stale_installations: u32,

    /// Send to this address instead of bringing up a local receiver
    #[arg(long, global = true, env = "RECEIVER_ADDRESS")]
    receiver_address: Option<String>,

    /// Receive-only mode when no subcommand is given
    #[arg(long, global = true, env = "RECV_ONLY")]
    recv_only: bool,

    /// Write the run report as JSON to this path
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Abort the run if it has not reached cleanup after this many milliseconds
    #[arg(long, global = true)]
    deadline_ms: Option<u64>,

    /// Exit with code 2 unless the exchange ended in `delivered`
    #[arg(long, global = true)]
    strict: bool,

    /// Make the loopback network fail decryption once the receiver has this
    /// many stale installations
    #[arg(long, global = true)]
    simulate_stale_fault: Option<usize>,

    /// How simulated clients report readiness
    #[arg(long, global = true, value_enum, default_value_t = StartArg::Event)]
    start_style: StartArg,

    /// Skip the fixed registration, churn and sync pauses
    #[arg(long, global = true)]
    no_pauses: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single message and wait for it on the receiver
    Poke {
        /// Delivery timeout in milliseconds
        #[arg(long, env = "DELIVERY_TIMEOUT_MS", default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Send a batch without confirmation, then observe the receiver
    Stress {
        /// Number of messages to send
        #[arg(short = 'n', long, env = "NUM_MESSAGES", default_value_t = 8)]
        messages: u32,

        /// Delay between messages in milliseconds
        #[arg(long, env = "MESSAGE_DELAY_MS", default_value_t = 1_000)]
        delay_ms: u64,

        /// Trailing observation window in milliseconds
        #[arg(long, default_value_t = 10_000)]
        window_ms: u64,
    },

    /// Bring up the receiver and log incoming messages until Ctrl-C
    Listen {
        /// Heartbeat interval in milliseconds
        #[arg(long, default_value_t = 5_000)]
        heartbeat_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StartArg {
    /// `start()` resolves once the client is ready
    Await,
    /// Readiness arrives as an event while `start()` keeps running
    Event,
}

impl From<StartArg> for StartStyle {
    fn from(arg: StartArg) -> Self {
        match arg {
            StartArg::Await => StartStyle::AwaitReady,
            StartArg::Event => StartStyle::FireAndEvent,
        }
    }
}

fn build_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut cfg = HarnessConfig {
        network: cli.network,
        debug: cli.debug,
        work_dir: cli.work_dir.clone(),
        stale_installations: cli.stale_installations,
        run_deadline_ms: cli.deadline_ms,
        ..Default::default()
    };
    if let Some(raw) = &cli.receiver_address {
        cfg.receiver_address =
            Some(Address::parse(raw).context("Invalid --receiver-address / RECEIVER_ADDRESS")?);
    }

    match &cli.command {
        Some(Commands::Poke { timeout_ms }) => {
            cfg.variant = Variant::Poke;
            cfg.delivery_timeout_ms = *timeout_ms;
        }
        Some(Commands::Stress {
            messages,
            delay_ms,
            window_ms,
        }) => {
            cfg.variant = Variant::Stress;
            cfg.message_count = *messages;
            cfg.message_interval_ms = *delay_ms;
            cfg.observation_window_ms = *window_ms;
        }
        Some(Commands::Listen { heartbeat_ms }) => {
            cfg.variant = Variant::Listen;
            cfg.heartbeat_interval_ms = *heartbeat_ms;
        }
        None if cli.recv_only => cfg.variant = Variant::Listen,
        None => cfg.variant = Variant::Poke,
    }

    if cli.no_pauses {
        cfg = cfg.without_pauses();
    }
    cfg.validate().context("Invalid configuration")?;
    Ok(cfg)
}

fn build_network(cli: &Cli) -> LoopbackNetwork {
    let network = LoopbackNetwork::new().with_start_style(cli.start_style.into());
    match cli.simulate_stale_fault {
        Some(threshold) => network.with_fault(FaultModel::DecryptFailure {
            stale_threshold: threshold,
        }),
        None => network,
    }
}

/// Map a finished run to the process exit code.
fn exit_code(report: &RunReport, strict: bool) -> ExitCode {
    if !report.is_success() {
        return ExitCode::from(1);
    }
    if strict && report.variant != Variant::Listen && report.outcome != ExchangeOutcome::Delivered
    {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = build_config(&cli)?;
    churnlab_core::init_tracing(&cfg, cli.json);

    std::fs::create_dir_all(&cfg.work_dir)
        .with_context(|| format!("Failed to create work dir {:?}", cfg.work_dir))?;
    info!(
        variant = %cfg.variant,
        network = %cfg.network,
        stale_installations = cfg.stale_installations,
        "starting reproduction run"
    );

    let factory = Arc::new(build_network(&cli));
    let orchestrator = Orchestrator::new(factory, cfg).context("Failed to build orchestrator")?;

    let report = orchestrator
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                // No signal handler available: keep listening until killed.
                std::future::pending::<()>().await;
            }
        })
        .await;

    println!("{}", render_summary(&report));
    if let Some(path) = &cli.report {
        write_report_json(path, &report)?;
        println!("report written to {}", path.display());
    }

    Ok(exit_code(&report, cli.strict))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_poke() {
        let cli = Cli::try_parse_from(["churnlab"]).unwrap();
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.variant, Variant::Poke);
        assert_eq!(cfg.stale_installations, 3);
        assert_eq!(cfg.delivery_timeout_ms, 30_000);
    }

    #[test]
    fn test_debug_flag_reaches_config() {
        let cli = Cli::try_parse_from(["churnlab", "--debug"]).unwrap();
        let cfg = build_config(&cli).unwrap();
        assert!(cfg.debug);
        assert!(churnlab_core::telemetry::default_directives(cfg.debug).contains("churnlab=debug"));
    }

    #[test]
    fn test_stress_args() {
        let cli = Cli::try_parse_from([
            "churnlab",
            "--stale-installations",
            "0",
            "stress",
            "-n",
            "4",
            "--delay-ms",
            "250",
        ])
        .unwrap();
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.variant, Variant::Stress);
        assert_eq!(cfg.stale_installations, 0);
        assert_eq!(cfg.message_count, 4);
        assert_eq!(cfg.message_interval_ms, 250);
    }

    #[test]
    fn test_recv_only_without_subcommand_listens() {
        let cli = Cli::try_parse_from(["churnlab", "--recv-only"]).unwrap();
        assert_eq!(build_config(&cli).unwrap().variant, Variant::Listen);
    }

    #[test]
    fn test_rejects_bad_receiver_address() {
        let cli = Cli::try_parse_from(["churnlab", "--receiver-address", "not-an-address"]).unwrap();
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn test_rejects_unknown_network() {
        assert!(Cli::try_parse_from(["churnlab", "--network", "mainnet-ish"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let mut report = RunReport::new(Variant::Poke, NetworkEnv::Local);
        report.outcome = ExchangeOutcome::TimedOut;
        assert_eq!(exit_code(&report, false), ExitCode::SUCCESS);
        assert_eq!(exit_code(&report, true), ExitCode::from(2));

        report.outcome = ExchangeOutcome::Delivered;
        assert_eq!(exit_code(&report, true), ExitCode::SUCCESS);

        report.fatal_error = Some("boom".into());
        assert_eq!(exit_code(&report, false), ExitCode::from(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poke_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from([
            "churnlab",
            "--work-dir",
            work_dir.as_str(),
            "--stale-installations",
            "1",
            "poke",
        ])
        .unwrap();
        let cfg = build_config(&cli).unwrap();
        let orchestrator = Orchestrator::new(Arc::new(build_network(&cli)), cfg).unwrap();

        let report = orchestrator.run().await;
        assert!(report.is_success(), "{:?}", report.fatal_error);
        assert_eq!(report.stale_installations_created, 1);
        assert_eq!(report.outcome, ExchangeOutcome::Delivered);
        assert_eq!(exit_code(&report, true), ExitCode::SUCCESS);
    }
}
