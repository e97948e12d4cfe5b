//! Session protocol script.
//!
//! Drives the first enumerated device through open, enroll, list, verify,
//! delete and close, asserting device state after every step. The extended
//! variant also checks the USB power attributes, the feature set, finger
//! status around capture operations, and injects a suspend/resume cycle into
//! the middle of a blocking verify.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, info};

use crate::device::{Context, Device, EnrollProgress, FingerStatus, Print, ProgressFn};
use crate::error::{DeviceResult, ScriptError, ScriptResult};
use crate::main_loop::{LoopStats, Priority};
use crate::power::{PowerAttrs, PERSIST_OFF, WAKEUP_DISABLED, WAKEUP_ENABLED};
use crate::profile::SessionProfile;

/// Steps of the session script, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Enumerate,
    PowerDefaults,
    Features,
    Open,
    ClearStorage,
    Template,
    Enroll,
    List,
    Verify,
    SuspendResume,
    Identify,
    Delete,
    Close,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Enumerate => "enumerate",
            Step::PowerDefaults => "power-defaults",
            Step::Features => "features",
            Step::Open => "open",
            Step::ClearStorage => "clear-storage",
            Step::Template => "template",
            Step::Enroll => "enroll",
            Step::List => "list",
            Step::Verify => "verify",
            Step::SuspendResume => "suspend-resume",
            Step::Identify => "identify",
            Step::Delete => "delete",
            Step::Close => "close",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a successful script run.
#[derive(Debug, Clone)]
pub struct ScriptReport {
    pub driver: String,
    pub usb_id: Option<String>,
    pub steps: Vec<Step>,
    /// Progress callbacks delivered during enrollment.
    pub enroll_progress_reports: u32,
    pub suspend_resume_ran: bool,
    pub loop_stats: LoopStats,
}

fn check(step: Step, condition: bool, message: impl FnOnce() -> String) -> ScriptResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ScriptError::Assertion {
            step,
            message: message(),
        })
    }
}

fn device_op<T>(step: Step, result: DeviceResult<T>) -> ScriptResult<T> {
    result.map_err(|source| ScriptError::Device { step, source })
}

fn read_attr(
    step: Step,
    path: PathBuf,
    read: impl FnOnce() -> std::io::Result<String>,
) -> ScriptResult<String> {
    read().map_err(|source| ScriptError::Io { step, path, source })
}

fn expect_finger_none(step: Step, device: &Device, when: &str) -> ScriptResult<()> {
    let status = device.finger_status();
    check(step, status == FingerStatus::NONE, || {
        format!("finger status {when} is {status}, expected none")
    })
}

/// Suspends and resumes `device` while an operation is in flight and checks
/// the power attributes on both sides.
fn suspend_resume_cycle(device: &Device, attrs: &PowerAttrs) -> ScriptResult<()> {
    let step = Step::SuspendResume;
    check(step, device.is_busy(), || {
        "no operation in flight when suspend was injected".to_string()
    })?;

    device_op(step, device.suspend_sync())?;
    let persist = read_attr(step, attrs.persist_path(), || attrs.read_persist())?;
    check(step, persist == PERSIST_OFF, || {
        format!("persist is {persist:?} while suspended, expected {PERSIST_OFF:?}")
    })?;
    let wakeup = read_attr(step, attrs.wakeup_path(), || attrs.read_wakeup())?;
    check(step, wakeup == WAKEUP_ENABLED, || {
        format!("wakeup is {wakeup:?} while suspended, expected {WAKEUP_ENABLED:?}")
    })?;

    // A value the driver already considers correct must survive resume unchanged.
    attrs
        .write_persist_raw("0\n")
        .map_err(|source| ScriptError::Io {
            step,
            path: attrs.persist_path(),
            source,
        })?;

    device_op(step, device.resume_sync())?;
    let raw = read_attr(step, attrs.persist_path(), || attrs.read_persist_raw())?;
    check(step, raw == "0\n", || {
        format!("persist is {raw:?} after resume, expected \"0\\n\"")
    })?;
    let wakeup = read_attr(step, attrs.wakeup_path(), || attrs.read_wakeup())?;
    check(step, wakeup == WAKEUP_DISABLED, || {
        format!("wakeup is {wakeup:?} after resume, expected {WAKEUP_DISABLED:?}")
    })?;
    debug!("suspend/resume cycle passed");
    Ok(())
}

/// Runs the session protocol against the devices of a [`Context`].
pub struct SessionScript {
    profile: SessionProfile,
    context: Context,
    completed: Vec<Step>,
}

impl SessionScript {
    pub fn new(profile: SessionProfile, context: Context) -> Self {
        Self {
            profile,
            context,
            completed: Vec::new(),
        }
    }

    fn done(&mut self, step: Step) {
        info!(step = step.as_str(), "step passed");
        self.completed.push(step);
    }

    pub fn run(mut self) -> ScriptResult<ScriptReport> {
        let extended = self.profile.is_extended();
        info!(driver = %self.profile.driver, variant = ?self.profile.variant, "starting session script");

        self.context.enumerate();
        let device = self
            .context
            .devices()
            .first()
            .cloned()
            .ok_or_else(|| ScriptError::Assertion {
                step: Step::Enumerate,
                message: "no devices enumerated".to_string(),
            })?;
        check(Step::Enumerate, device.driver() == self.profile.driver, || {
            format!(
                "first device uses driver {}, expected {}",
                device.driver(),
                self.profile.driver
            )
        })?;
        self.done(Step::Enumerate);

        let usb_id = device.usb_path().map(|p| p.id());
        let mut power = None;
        if extended {
            power = Some(self.check_power_defaults(&device)?);
            self.done(Step::PowerDefaults);

            self.check_features(&device)?;
            self.done(Step::Features);
        }

        device_op(Step::Open, device.open_sync())?;
        self.done(Step::Open);

        if extended {
            device_op(Step::ClearStorage, device.clear_storage_sync())?;
            self.done(Step::ClearStorage);
        }

        let template = Print::new(&device);
        check(Step::Template, !template.is_enrolled(), || {
            "new template already carries data".to_string()
        })?;
        self.done(Step::Template);

        let (print, enroll_progress_reports) = self.enroll(&device, template, extended)?;
        self.done(Step::Enroll);

        let stored = device_op(Step::List, device.list_prints_sync())?;
        check(Step::List, stored.len() == 1, || {
            format!("{} prints in storage, expected 1", stored.len())
        })?;
        check(Step::List, stored[0].equal(&print), || {
            "stored print differs from the enrolled print".to_string()
        })?;
        self.done(Step::List);

        let suspend_resume_ran = self.verify(&device, &print, power.as_ref())?;
        self.done(Step::Verify);
        if suspend_resume_ran {
            self.done(Step::SuspendResume);
        }

        if self.profile.identify {
            let outcome = device_op(Step::Identify, device.identify_sync(&[print.clone()]))?;
            check(
                Step::Identify,
                outcome.matched.as_ref().is_some_and(|m| m.equal(&print)),
                || "identify did not return the enrolled print".to_string(),
            )?;
            self.done(Step::Identify);
        }

        device_op(Step::Delete, device.delete_print_sync(&print))?;
        self.done(Step::Delete);

        device_op(Step::Close, device.close_sync())?;
        self.done(Step::Close);

        let report = ScriptReport {
            driver: device.driver().to_string(),
            usb_id,
            steps: self.completed,
            enroll_progress_reports,
            suspend_resume_ran,
            loop_stats: self.context.main_loop().stats(),
        };
        info!(steps = report.steps.len(), "session script passed");
        Ok(report)
    }

    fn check_power_defaults(&self, device: &Device) -> ScriptResult<PowerAttrs> {
        let step = Step::PowerDefaults;
        let path = device.usb_path().ok_or_else(|| ScriptError::Assertion {
            step,
            message: "device is not attached over USB".to_string(),
        })?;
        let attrs = PowerAttrs::for_device(&path, &self.profile.sysfs_root);
        debug!(usb = %path.id(), dir = %attrs.dir().display(), "checking power attributes");

        let persist = read_attr(step, attrs.persist_path(), || attrs.read_persist())?;
        check(step, persist == PERSIST_OFF, || {
            format!("persist is {persist:?}, expected {PERSIST_OFF:?}")
        })?;
        let wakeup = read_attr(step, attrs.wakeup_path(), || attrs.read_wakeup())?;
        check(step, wakeup == WAKEUP_DISABLED, || {
            format!("wakeup is {wakeup:?}, expected {WAKEUP_DISABLED:?}")
        })?;
        Ok(attrs)
    }

    fn check_features(&self, device: &Device) -> ScriptResult<()> {
        for (&feature, &expected) in &self.profile.features {
            let actual = device.has_feature(feature);
            check(Step::Features, actual == expected, || {
                format!("feature {feature:?} is {actual}, expected {expected}")
            })?;
        }
        Ok(())
    }

    fn enroll(&self, device: &Device, template: Print, extended: bool) -> ScriptResult<(Print, u32)> {
        let step = Step::Enroll;
        expect_finger_none(step, device, "before enroll")?;

        let reports = Rc::new(Cell::new(0u32));
        let violations = Rc::new(RefCell::new(Vec::new()));
        let progress: Option<ProgressFn> = if extended {
            let reports = Rc::clone(&reports);
            let violations = Rc::clone(&violations);
            let observed = device.clone();
            Some(Box::new(move |p: &EnrollProgress| {
                reports.set(reports.get() + 1);
                let status = observed.finger_status();
                debug!(stage = p.completed_stages, total = p.total_stages, %status, "enroll progress");
                if !status.contains(FingerStatus::NEEDED) {
                    violations.borrow_mut().push(format!(
                        "finger status {status} at stage {}, expected needed",
                        p.completed_stages
                    ));
                }
            }))
        } else {
            None
        };

        let result = device.enroll_sync(template, progress);
        expect_finger_none(step, device, "after enroll")?;
        let print = device_op(step, result)?;

        if let Some(violation) = violations.borrow_mut().drain(..).next() {
            return Err(ScriptError::Assertion {
                step,
                message: violation,
            });
        }
        check(step, print.is_enrolled(), || {
            "enrolled print carries no template data".to_string()
        })?;
        Ok((print, reports.get()))
    }

    /// Returns whether the suspend/resume cycle ran inside verify.
    fn verify(&self, device: &Device, print: &Print, power: Option<&PowerAttrs>) -> ScriptResult<bool> {
        let step = Step::Verify;
        let outcome_slot: Rc<RefCell<Option<ScriptResult<()>>>> = Rc::new(RefCell::new(None));

        expect_finger_none(step, device, "before verify")?;
        if let Some(attrs) = power {
            // Queued at High before verify starts, so it runs ahead of the
            // first verify step while the operation is in flight.
            let inner = device.clone();
            let attrs = attrs.clone();
            let slot = Rc::clone(&outcome_slot);
            device
                .main_loop()
                .idle_add(Priority::High, move || {
                    *slot.borrow_mut() = Some(suspend_resume_cycle(&inner, &attrs));
                })
                .map_err(|e| ScriptError::Device {
                    step,
                    source: e.into(),
                })?;
        }

        let outcome = device_op(step, device.verify_sync(print))?;
        expect_finger_none(step, device, "after verify")?;

        let injected = power.is_some();
        if injected {
            match outcome_slot.borrow_mut().take() {
                Some(result) => result?,
                None => {
                    return Err(ScriptError::Assertion {
                        step,
                        message: "suspend/resume task did not run during verify".to_string(),
                    })
                }
            }
        }
        check(step, outcome.matched, || "verify did not match the enrolled print".to_string())?;
        Ok(injected)
    }
}
