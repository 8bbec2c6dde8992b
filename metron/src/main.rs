//! The metron command line: `metron run --config <file> [--env <file>]`.

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use metron::Runtime;
use metron_common::{Signal, config::Config, logging};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "metron", version, about = "A metric collection agent")]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_ansi: bool,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Very verbose logging
    #[arg(long, global = true)]
    trace: bool,

    /// Disable delivery and backlog side effects
    #[arg(long, global = true)]
    test: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent until signaled
    Run {
        /// Configuration file
        #[arg(long, value_name = "file")]
        config: PathBuf,

        /// Environment variable file
        #[arg(long, value_name = "file")]
        env: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&logging::Options {
        ansi: !cli.no_ansi,
        debug: cli.debug,
        trace: cli.trace,
    });

    let result = match cli.command {
        Command::Run { config, env } => run(&config, env.as_deref(), cli.test),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(
    config_file: &std::path::Path,
    env_file: Option<&std::path::Path>,
    test: bool,
) -> anyhow::Result<()> {
    info!("metron v{}", metron::VERSION);
    let config = Config::load(config_file, env_file, test)?;
    info!("the configuration was loaded from {}", config_file.display());
    if test {
        info!("running in test mode, writers will not deliver anything");
    }

    let mut runtime = Runtime::new(config);
    runtime.init()?;

    info!("starting the components");
    runtime.start();

    let shutdown = runtime.shutdown_sender();
    wait_for_exit_signal().await?;
    let _ = shutdown.send(Signal::Shutdown);

    info!("waiting for the workers to end");
    runtime.join().await;
    info!("destroying the components");
    runtime.destroy();
    info!("done");
    Ok(())
}

/// Parks until SIGTERM, SIGHUP or SIGINT arrives.
#[cfg(unix)]
async fn wait_for_exit_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received signal INT"),
        _ = terminate.recv() => info!("received signal TERM"),
        _ = hangup.recv() => info!("received signal HUP"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_exit_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received interrupt");
    Ok(())
}
