//! The `vigil` command: runs acceptance-test suites against hosts.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vigil::config::RunConfig;
use vigil::core::{HostStep, Suite};
use vigil::run_suite;

/// The exit code for errors that keep a suite from running at all, e.g. an invalid suite file.
const LOAD_ERROR: u8 = 255;

/// Multi-host acceptance tests for declarative infrastructure.
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the configuration file [default: /etc/vigil/config.yaml]
    #[arg(short, long, global = true, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv). RUST_LOG overrides this.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a suite and report the results
    Run(RunArgs),

    /// Load and validate a suite, and list its steps without contacting any host
    Check {
        /// Path to the suite file
        suite: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the suite file
    suite: PathBuf,

    /// Only use these hosts (comma-separated)
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Run steps on all of their hosts at once unless a step says otherwise
    #[arg(long)]
    parallel: bool,

    /// Ceiling on any single command, in seconds
    #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// Only run the scenario with this name
    #[arg(long, value_name = "NAME")]
    scenario: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    ExitCode::from(exit_status(run(cli).await))
}

/// Maps the result of [run] to an exit status, printing the error chain if there is one.
fn exit_status(result: anyhow::Result<u8>) -> u8 {
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            LOAD_ERROR
        }
    }
}

/// Initializes logging based on verbosity level.
fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(verbosity >= 3))
        .with(env_filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut config = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::load_default()?,
    };
    debug!("configuration: {config:?}");

    match cli.command {
        Command::Check { suite } => {
            let suite = Suite::from_file(suite)?;
            check(&suite, io::stdout().lock()).context("failed to write to stdout")?;
            Ok(0)
        }
        Command::Run(args) => {
            let mut suite = Suite::from_file(&args.suite)?;
            if !args.hosts.is_empty() {
                suite.retain_hosts(&args.hosts)?;
            }
            if let Some(name) = &args.scenario {
                suite.retain_scenarios(name)?;
            }
            if args.parallel {
                config.parallel = true;
            }
            if let Some(secs) = args.timeout {
                config.command_timeout = Duration::from_secs(secs);
            }

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted; abandoning running commands");
                    trigger.cancel();
                }
            });

            let summary = run_suite(&suite, &config, cancel)
                .await
                .context("failed to report results")?;
            Ok(summary.exit_code())
        }
    }
}

/// Lists every scenario of `suite` with its expanded steps and their targets.
fn check(suite: &Suite, mut stdout: impl Write) -> io::Result<()> {
    writeln!(
        stdout,
        "Suite \"{}\": {} hosts, {} scenarios",
        suite.name,
        suite.hosts.len(),
        suite.scenarios.len(),
    )?;

    for scenario in &suite.scenarios {
        writeln!(stdout, "\n=== {}", scenario.name)?;
        let vars = suite.vars_for(scenario);
        for step in &scenario.steps {
            let targets: Vec<_> = step
                .on
                .resolve(&suite.hosts)
                .into_iter()
                .map(|(host, peer)| {
                    let compiled = HostStep::new(host, peer, step, &vars).compile();
                    match peer {
                        Some(peer) => format!("{} -> {}: {}", host.name, peer.name, compiled.name),
                        None => format!("{}: {}", host.name, compiled.name),
                    }
                })
                .collect();

            let mode = match step.parallel {
                Some(true) => " (parallel)",
                Some(false) => " (sequential)",
                None => "",
            };
            writeln!(stdout, "{}{mode}", step.name)?;
            for target in targets {
                writeln!(stdout, "    {target}")?;
            }
        }
    }
    Ok(())
}
