use std::path::PathBuf;

use clap::Parser;

use crate::config::HarnessConfig;
use crate::error::HarnessResult;

#[derive(Debug, Parser)]
#[command(name = "fprint-umockdev-test")]
#[command(about = "Replay recorded device traces against a fingerprint driver", long_about = None)]
pub struct Cli {
    /// Fixture directory with device descriptors and traces.
    pub fixture: PathBuf,

    /// Harness configuration file (TOML or JSON).
    #[arg(short, long, env = "FPRINT_REPLAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "UMOCKDEV_RUN")]
    pub engine: Option<String>,

    #[arg(long)]
    pub interpreter: Option<String>,

    #[arg(long)]
    pub capture_script: Option<PathBuf>,

    #[arg(long)]
    pub session_program: Option<String>,

    #[arg(long)]
    pub errors_dir: Option<PathBuf>,

    /// Command prepended to every child, e.g. `valgrind --error-exitcode=1`.
    #[arg(long, env = "LIBFPRINT_TEST_WRAPPER")]
    pub wrapper: Option<String>,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Loads the config file, if any, and applies command line overrides.
    pub fn resolve_config(&self) -> HarnessResult<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_file(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(engine) = &self.engine {
            config.engine = engine.clone();
        }
        if let Some(interpreter) = &self.interpreter {
            config.interpreter = interpreter.clone();
        }
        if let Some(script) = &self.capture_script {
            config.capture_script = Some(script.clone());
        }
        if let Some(program) = &self.session_program {
            config.session_program = program.clone();
        }
        if let Some(dir) = &self.errors_dir {
            config.errors_dir = dir.clone();
        }
        if let Some(wrapper) = self.wrapper.as_deref().filter(|w| !w.trim().is_empty()) {
            config.wrapper = Some(wrapper.to_string());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_over_defaults() {
        let cli = Cli::try_parse_from([
            "fprint-umockdev-test",
            "--engine",
            "/opt/bin/umockdev-run",
            "--interpreter",
            "sh",
            "--errors-dir",
            "/tmp/errors",
            "--json",
            "tests/synaptics",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.fixture, PathBuf::from("tests/synaptics"));

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.engine, "/opt/bin/umockdev-run");
        assert_eq!(config.interpreter, "sh");
        assert_eq!(config.errors_dir, PathBuf::from("/tmp/errors"));
        assert_eq!(config.session_program, "fprint-session");
    }

    #[test]
    fn test_fixture_is_required() {
        assert!(Cli::try_parse_from(["fprint-umockdev-test"]).is_err());
    }

    #[test]
    fn test_blank_wrapper_ignored() {
        let cli = Cli::try_parse_from(["fprint-umockdev-test", "--wrapper", "  ", "fx"]).unwrap();
        assert_eq!(cli.resolve_config().unwrap().wrapper, None);
    }
}
