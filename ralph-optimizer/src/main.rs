use std::path::PathBuf;

use clap::Parser;

mod cost;
mod error;
mod log_parser;
mod patterns;
mod report;

use error::{OptimizerError, Result};
use patterns::PatternDetector;
use report::Reporter;

/// Ralph Optimizer: analyze run logs for token waste and inefficiency
#[derive(Parser, Debug)]
#[command(name = "ralph-optimizer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Run log to analyze (default: most recent in the log directory)
    log_file: Option<PathBuf>,

    /// Directory to search for run logs (default: ~/.ralph/logs)
    #[arg(short = 'd', long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Only analyze the last N iterations
    #[arg(long = "last", default_value_t = 0)]
    last: usize,

    /// Show detailed per-iteration breakdown
    #[arg(long = "detailed")]
    detailed: bool,

    /// Output as JSON
    #[arg(long = "json")]
    json: bool,
}

fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ralph")
        .join("logs")
}

fn run(cli: Cli) -> Result<()> {
    let log_path = match cli.log_file {
        Some(path) => {
            if !path.exists() {
                return Err(OptimizerError::LogNotFound(path));
            }
            path
        }
        None => log_parser::find_latest_log(&cli.log_dir.unwrap_or_else(default_log_dir))?,
    };

    let mut parsed = log_parser::parse(&log_path)?;
    if parsed.iterations.is_empty() {
        return Err(OptimizerError::NoIterations(log_path));
    }

    if cli.last > 0 && parsed.iterations.len() > cli.last {
        let keep_from = parsed.iterations.len() - cli.last;
        parsed.iterations = parsed.iterations.split_off(keep_from);
    }

    let costs: Vec<_> = parsed.iterations.iter().map(cost::estimate).collect();
    let detector = PatternDetector::default();
    let detected = detector.detect_all(&parsed.iterations);
    let reporter = Reporter;

    if cli.json {
        println!("{}", reporter.json(&parsed, &costs, &detected));
    } else {
        println!("{}", reporter.summary(&parsed, &costs, &detected));

        if cli.detailed {
            println!("{}", "=".repeat(50));
            println!("DETAILED ITERATION BREAKDOWN");
            println!("{}", "=".repeat(50));
            for (iteration, cost) in parsed.iterations.iter().zip(&costs) {
                println!();
                println!("{}", reporter.detailed(iteration, cost));
            }
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
