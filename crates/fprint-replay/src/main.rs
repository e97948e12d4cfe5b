use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use fprint_replay::cli::Cli;
use fprint_replay::harness::error_chain;
use fprint_replay::ReplayHarness;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", error_chain(&e));
            return Ok(ExitCode::from(e.exit_code()));
        }
    };

    let report = ReplayHarness::new(config).execute(&cli.fixture).await;
    if cli.json {
        println!("{}", report.to_json().context("failed to serialize run report")?);
    }
    if let Some(message) = &report.message {
        eprintln!("{}: {}", report.fixture, message);
    }
    Ok(ExitCode::from(report.exit_code()))
}
