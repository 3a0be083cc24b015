use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ralph_runner::config::Config;
use ralph_runner::control::{ControlWatcher, FsControlStore};
use ralph_runner::error::RalphError;
use ralph_runner::loop_controller::{LoopController, LoopResult};
use ralph_runner::run_log::{generate_run_id, FeedbackAudit, RunLog};
use ralph_runner::runner::CliAgent;

/// Ralph: run a coding agent in a loop until stopped or out of iterations
#[derive(Parser, Debug)]
#[command(name = "ralph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Prompt file re-read before each iteration (default: RALPH.md)
    #[arg(short = 'f', long = "prompt-file")]
    prompt_file: Option<PathBuf>,

    /// Maximum number of iterations (0 = run until stopped)
    #[arg(short = 'n', long = "max-iterations")]
    max_iterations: Option<u32>,

    /// Agent CLI executable (default: claude)
    #[arg(long = "agent-path")]
    agent_path: Option<String>,

    /// Stop marker file (default: STOP_RALPH)
    #[arg(long = "stop-file")]
    stop_file: Option<PathBuf>,

    /// Feedback file (default: FEEDBACK.md)
    #[arg(long = "feedback-file")]
    feedback_file: Option<PathBuf>,

    /// Directory to write run logs to (default: ~/.ralph/logs)
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Script run between iterations to populate the feedback file
    #[arg(long = "fetch-feedback-script")]
    fetch_feedback_script: Option<PathBuf>,

    /// Config file (TOML format)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ralph_runner=debug,info")
    } else {
        EnvFilter::new("ralph_runner=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, RalphError> {
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    config.merge_cli_args(
        cli.prompt_file.clone(),
        cli.max_iterations,
        cli.agent_path.clone(),
        cli.stop_file.clone(),
        cli.feedback_file.clone(),
        cli.log_dir.clone(),
        cli.fetch_feedback_script.clone(),
    );

    Ok(config)
}

async fn run(
    config: Config,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<LoopResult, RalphError> {
    let run_id = generate_run_id();
    let log = Arc::new(RunLog::create(&config.log_dir, &run_id)?);
    println!("Logging to: {}", log.path().display().to_string().cyan());

    let audit = FeedbackAudit::new(&config.log_dir, &run_id);
    let watcher = ControlWatcher::new(FsControlStore::new(
        &config.stop_file,
        &config.feedback_file,
    ));

    match config.max_iterations {
        Some(max) => info!("Max iterations: {}", max),
        None => info!(
            "Running until {} appears (no iteration limit)",
            config.stop_file.display()
        ),
    }
    info!("Agent: {}", config.agent_path);

    let config = Arc::new(config);
    let agent = CliAgent::new(Arc::clone(&config), Arc::clone(&log));
    let controller = LoopController::new(config, agent, watcher, log, Some(audit));

    tokio::select! {
        result = controller.run() => {
            result
        }
        _ = shutdown_rx.recv() => {
            warn!("Shutdown signal received");
            Err(RalphError::ShutdownRequested)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    // Setup shutdown signal handling
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, shutting down...");
        let _ = shutdown_tx_clone.send(());
    });

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    match run(config, shutdown_rx).await {
        Ok(LoopResult::Completed { iterations }) => {
            println!(
                "\n{} Completed {} iteration(s)",
                "DONE:".green().bold(),
                iterations
            );
            std::process::exit(0);
        }
        Ok(LoopResult::Stopped { iterations }) => {
            println!(
                "\n{} Stop marker found after {} iteration(s)",
                "STOPPED:".yellow().bold(),
                iterations
            );
            std::process::exit(0);
        }
        Err(RalphError::ShutdownRequested) => {
            println!("\n{} Shutdown requested", "INTERRUPTED:".yellow().bold());
            std::process::exit(130);
        }
        Err(e @ RalphError::LaunchFailure(_)) => {
            eprintln!("{} {}", "ERROR:".red().bold(), e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
