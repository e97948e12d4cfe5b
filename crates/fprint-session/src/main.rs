use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use fprint_session::virtual_device::register_virtual;
use fprint_session::{Context, MainLoop, SessionProfile, SessionScript};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Runs the device-session protocol against the in-process virtual driver.
#[derive(Debug, Parser)]
#[command(name = "fprint-session", version, about)]
struct Cli {
    /// Session profile (`custom.toml`).
    profile: PathBuf,

    /// Override the sysfs root holding the USB power attributes.
    #[arg(long, env = "FPRINT_SYSFS_ROOT")]
    sysfs_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut profile = SessionProfile::from_file(&cli.profile)?;
    if let Some(root) = cli.sysfs_root {
        profile.sysfs_root = root;
    }

    let mut context = Context::new(MainLoop::new());
    register_virtual(&mut context, profile.virtual_device_config());

    let report = SessionScript::new(profile, context)
        .run()
        .with_context(|| format!("session script {} failed", cli.profile.display()))?;

    tracing::info!(
        driver = %report.driver,
        steps = report.steps.len(),
        dispatched = report.loop_stats.dispatched,
        "session passed"
    );
    Ok(())
}
