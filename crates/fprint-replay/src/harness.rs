//! Runs every mode of one fixture under the replay engine.

use std::error::Error;
use std::path::Path;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::artifacts::Workspace;
use crate::capability::{locate_engine, probe, ReplayCapability};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::fixture::{Fixture, ModePlan, TestMode};
use crate::image_cmp::compare_pngs;
use crate::launcher::ReplayCommand;
use crate::report::{CaseResult, CaseStatus, RunReport};

const CAPTURE_OUTPUT: &str = "capture.png";

/// Renders an error and its sources as `outer: inner: ...`.
pub fn error_chain(err: &dyn Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

fn fixture_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn log_skip(err: &HarnessError) {
    match err {
        HarnessError::EngineUnavailable { engine } => {
            warn!(%engine, "replay engine not found, skipping test; please install umockdev")
        }
        HarnessError::CapabilityInsufficient {
            flavor,
            required,
            found,
        } => warn!(%flavor, %required, %found, "replay engine too old for this trace, skipping test"),
        other => warn!(reason = %other, "child requested a skip"),
    }
}

pub struct ReplayHarness {
    config: HarnessConfig,
}

impl ReplayHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs the fixture and reports the outcome. The workspace is removed
    /// whatever happens; it is copied under the errors directory first when
    /// the run fails.
    pub async fn execute(&self, fixture_dir: &Path) -> RunReport {
        let started = Instant::now();
        let name = fixture_name(fixture_dir);
        let mut report = RunReport::new(&name);

        let workspace = match Workspace::new() {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %error_chain(&e), "cannot create workspace");
                report.outcome = CaseStatus::Fail;
                report.message = Some(error_chain(&e));
                report.duration = started.elapsed();
                return report;
            }
        };

        match self.run(fixture_dir, &workspace, &mut report).await {
            Ok(()) => {
                info!(fixture = %name, passed = report.passed(), "fixture passed");
            }
            Err(e) if e.is_skip() => {
                log_skip(&e);
                report.outcome = CaseStatus::Skip;
                report.message = Some(error_chain(&e));
            }
            Err(e) => {
                error!(fixture = %name, error = %error_chain(&e), "fixture failed");
                report.outcome = CaseStatus::Fail;
                report.message = Some(error_chain(&e));
                match workspace.preserve(&self.config.errors_dir, &name) {
                    Ok(dest) => report.preserved = Some(dest),
                    Err(pe) => warn!(error = %error_chain(&pe), "cannot preserve failure artifacts"),
                }
            }
        }

        if let Err(e) = workspace.close() {
            warn!(error = %error_chain(&e), "cannot remove workspace");
        }
        report.duration = started.elapsed();
        report
    }

    async fn run(&self, fixture_dir: &Path, workspace: &Workspace, report: &mut RunReport) -> HarnessResult<()> {
        let fixture = Fixture::discover(fixture_dir)?;
        let engine = locate_engine(&self.config.engine).ok_or_else(|| HarnessError::EngineUnavailable {
            engine: self.config.engine.clone(),
        })?;
        let capability = probe(&engine, self.config.ci_override_active()).await?;

        if fixture.modes.is_empty() {
            warn!(fixture = %fixture.name, "fixture has neither capture nor custom files");
        }

        for plan in &fixture.modes {
            let started = Instant::now();
            let result = self.run_mode(&fixture, plan, &engine, &capability, workspace).await;
            let status = match &result {
                Ok(()) => CaseStatus::Pass,
                Err(e) if e.is_skip() => CaseStatus::Skip,
                Err(_) => CaseStatus::Fail,
            };
            let mut case = CaseResult::new(plan.mode, status, started.elapsed());
            if let Err(e) = &result {
                case = case.with_message(&error_chain(e));
            }
            report.add_result(case);
            result?;
        }
        Ok(())
    }

    async fn run_mode(
        &self,
        fixture: &Fixture,
        plan: &ModePlan,
        engine: &Path,
        capability: &ReplayCapability,
        workspace: &Workspace,
    ) -> HarnessResult<()> {
        capability.check(plan.trace.flavor())?;
        let command = ReplayCommand::new(engine, &fixture.descriptors, plan.trace.clone())
            .with_wrapper(self.config.wrapper.as_deref());

        match plan.mode {
            TestMode::Capture => {
                let output = workspace.path().join(CAPTURE_OUTPUT);
                command
                    .with_program(self.capture_program(&output))
                    .run("capture")
                    .await?;
                if !output.is_file() {
                    return Err(HarnessError::MissingOutput { path: output });
                }
                match &plan.reference {
                    Some(reference) => {
                        compare_pngs(&output, reference)?;
                        info!(reference = %reference.display(), "capture matches reference image");
                    }
                    None => info!("fixture has no reference image, comparison skipped"),
                }
                Ok(())
            }
            TestMode::Custom => {
                let script = plan
                    .script
                    .as_deref()
                    .ok_or_else(|| HarnessError::malformed(&fixture.dir, "custom mode has no custom script"))?;
                command
                    .with_program(self.custom_program(script))
                    .run("custom")
                    .await
            }
        }
    }

    /// `<interpreter> <capture-script> <output>`
    pub fn capture_program(&self, output: &Path) -> Vec<String> {
        vec![
            self.config.interpreter.clone(),
            self.config.capture_script_path().to_string_lossy().into_owned(),
            output.to_string_lossy().into_owned(),
        ]
    }

    /// Session profiles run under the session program, anything else under
    /// the interpreter.
    pub fn custom_program(&self, script: &Path) -> Vec<String> {
        let script_arg = script.to_string_lossy().into_owned();
        if script.extension().is_some_and(|ext| ext == "toml") {
            let program = self.config.session_program_path();
            vec![program.to_string_lossy().into_owned(), script_arg]
        } else {
            vec![self.config.interpreter.clone(), script_arg]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImageError;
    use std::path::PathBuf;

    fn harness() -> ReplayHarness {
        ReplayHarness::new(HarnessConfig {
            interpreter: "sh".to_string(),
            capture_script: Some(PathBuf::from("/opt/fprint/capture.sh")),
            session_program: "/opt/fprint/fprint-session".to_string(),
            ..HarnessConfig::default()
        })
    }

    #[test]
    fn test_capture_program() {
        assert_eq!(
            harness().capture_program(Path::new("/tmp/ws/capture.png")),
            vec!["sh", "/opt/fprint/capture.sh", "/tmp/ws/capture.png"]
        );
    }

    #[test]
    fn test_custom_program_by_extension() {
        let h = harness();
        assert_eq!(
            h.custom_program(Path::new("/fx/custom.toml")),
            vec!["/opt/fprint/fprint-session", "/fx/custom.toml"]
        );
        assert_eq!(h.custom_program(Path::new("/fx/custom.py")), vec!["sh", "/fx/custom.py"]);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = HarnessError::Image(ImageError::Io {
            path: PathBuf::from("/tmp/a.png"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        });
        assert_eq!(error_chain(&err), "cannot read image /tmp/a.png: gone");
    }

    #[tokio::test]
    async fn test_missing_fixture_fails_without_engine_probe() {
        let errors = tempfile::tempdir().unwrap();
        let h = ReplayHarness::new(HarnessConfig {
            engine: "/nonexistent/umockdev-run".to_string(),
            errors_dir: errors.path().to_path_buf(),
            ..HarnessConfig::default()
        });
        let report = h.execute(Path::new("/nonexistent/fixture")).await;
        assert_eq!(report.outcome, CaseStatus::Fail);
        assert_eq!(report.exit_code(), 1);
        assert!(report.message.unwrap().contains("not a directory"));
        assert_eq!(report.preserved, Some(errors.path().join("fixture")));
    }

    #[tokio::test]
    async fn test_missing_engine_skips_without_preserving() {
        let fixture = tempfile::tempdir().unwrap();
        std::fs::write(fixture.path().join("device"), "P: /devices/usb1/1-1\n").unwrap();
        std::fs::write(fixture.path().join("capture.ioctl"), "@DEV /dev/bus/usb/001/002\n").unwrap();
        let errors = tempfile::tempdir().unwrap();
        let h = ReplayHarness::new(HarnessConfig {
            engine: "/nonexistent/umockdev-run".to_string(),
            errors_dir: errors.path().join("errors"),
            ..HarnessConfig::default()
        });

        let report = h.execute(fixture.path()).await;
        assert_eq!(report.outcome, CaseStatus::Skip);
        assert_eq!(report.exit_code(), 77);
        assert!(report.cases.is_empty());
        assert_eq!(report.preserved, None);
        assert!(!errors.path().join("errors").exists());
    }
}
