//! In-process virtual match-on-chip sensor.
//!
//! Behaves like a USB driver with on-device storage: every operation advances
//! through main loop steps at [`Priority::Default`], reports finger status
//! while scanning, and manages the USB `power/` attributes across
//! suspend/resume the way real drivers do.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::{
    Context, DeviceDriver, DeviceFeature, EnrollProgress, FeatureSet, FingerStatus,
    IdentifyOutcome, Print, ProgressFn, VerifyOutcome,
};
use crate::error::{DeviceError, DeviceResult};
use crate::main_loop::{Completion, MainLoop, Priority};
use crate::power::{PowerAttrs, UsbDeviceNode, UsbPath};

/// Configuration of a virtual sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualDeviceConfig {
    pub device_id: String,
    pub driver: String,
    pub name: String,
    pub features: FeatureSet,
    pub enroll_stages: u32,
    /// Loop iterations a single finger scan takes.
    pub scan_steps: u32,
    pub bus: u8,
    pub ports: Vec<u8>,
    /// Root of the sysfs tree holding the USB power attributes. Without it
    /// the device does no power management.
    pub sysfs_root: Option<PathBuf>,
    /// Finger presented during enrollment.
    pub enroll_finger: String,
    /// Finger presented during verify/identify; defaults to the enrolled one.
    pub verify_finger: Option<String>,
    /// Abort enrollment after this stage.
    pub fail_enroll_at: Option<u32>,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "virtual-0".to_string(),
            driver: "synaptics".to_string(),
            name: "Virtual match-on-chip sensor".to_string(),
            features: FeatureSet::match_on_chip(),
            enroll_stages: 5,
            scan_steps: 2,
            bus: 1,
            ports: vec![1],
            sysfs_root: None,
            enroll_finger: "right-index".to_string(),
            verify_finger: None,
            fail_enroll_at: None,
        }
    }
}

impl VirtualDeviceConfig {
    pub fn usb_path(&self) -> UsbPath {
        UsbPath::new(self.bus, self.ports.clone())
    }

    fn presented_finger(&self) -> &str {
        self.verify_finger.as_deref().unwrap_or(&self.enroll_finger)
    }
}

/// Operation currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Open,
    Close,
    Enroll,
    Verify,
    Identify,
    List,
    Delete,
    ClearStorage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Open => "open",
            Action::Close => "close",
            Action::Enroll => "enroll",
            Action::Verify => "verify",
            Action::Identify => "identify",
            Action::List => "list",
            Action::Delete => "delete",
            Action::ClearStorage => "clear-storage",
        }
    }
}

struct State {
    open: bool,
    action: Action,
    suspended: bool,
    /// Steps that came due while suspended; requeued on resume.
    parked: Vec<Box<dyn FnOnce()>>,
    finger: FingerStatus,
    storage: Vec<Print>,
}

struct Shared {
    config: VirtualDeviceConfig,
    main_loop: Rc<MainLoop>,
    usb: Rc<UsbDeviceNode>,
    power: Option<PowerAttrs>,
    state: RefCell<State>,
}

struct EnrollJob {
    template: Print,
    progress: Option<ProgressFn>,
    stage: u32,
    tick: u32,
}

struct ScanJob {
    tick: u32,
}

/// Virtual sensor implementing [`DeviceDriver`].
#[derive(Clone)]
pub struct VirtualDevice {
    shared: Rc<Shared>,
}

impl VirtualDevice {
    pub fn new(main_loop: Rc<MainLoop>, config: VirtualDeviceConfig) -> Self {
        let usb = UsbDeviceNode::chain(config.bus, &config.ports);
        let power = config
            .sysfs_root
            .as_deref()
            .map(|root| PowerAttrs::for_device(&config.usb_path(), root));
        Self {
            shared: Rc::new(Shared {
                config,
                main_loop,
                usb,
                power,
                state: RefCell::new(State {
                    open: false,
                    action: Action::None,
                    suspended: false,
                    parked: Vec::new(),
                    finger: FingerStatus::NONE,
                    storage: Vec::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &VirtualDeviceConfig {
        &self.shared.config
    }

    pub fn current_action(&self) -> Action {
        self.shared.state.borrow().action
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.borrow().suspended
    }

    /// Prints held in device storage.
    pub fn stored_prints(&self) -> Vec<Print> {
        self.shared.state.borrow().storage.clone()
    }

    /// Places a print in device storage, as if enrolled in an earlier session.
    pub fn preload(&self, print: Print) {
        self.shared.state.borrow_mut().storage.push(print);
    }

    /// Template data the sensor produces for `finger`.
    pub fn template_for(&self, finger: &str) -> Vec<u8> {
        self.shared.template_for(finger)
    }
}

impl Shared {
    fn template_for(&self, finger: &str) -> Vec<u8> {
        format!("{}:{}:{}", self.config.driver, self.config.device_id, finger).into_bytes()
    }

    fn scanned_print(&self) -> Print {
        let finger = self.config.presented_finger();
        Print::for_driver(&self.config.driver, &self.config.device_id)
            .with_finger(finger)
            .with_data(self.template_for(finger))
    }

    fn busy(&self, action: &'static str) -> DeviceError {
        DeviceError::Busy {
            device: self.config.device_id.clone(),
            action,
        }
    }

    /// Checks preconditions and marks `action` as in flight.
    fn begin(&self, action: Action, feature: Option<DeviceFeature>) -> DeviceResult<()> {
        let mut state = self.state.borrow_mut();
        if state.suspended {
            return Err(self.busy("suspend"));
        }
        if state.action != Action::None {
            return Err(self.busy(state.action.as_str()));
        }
        match action {
            Action::Open if state.open => {
                return Err(DeviceError::AlreadyOpen {
                    device: self.config.device_id.clone(),
                })
            }
            Action::Open => {}
            _ if !state.open => {
                return Err(DeviceError::NotOpen {
                    device: self.config.device_id.clone(),
                })
            }
            _ => {}
        }
        if let Some(feature) = feature {
            if !self.config.features.has(feature) {
                return Err(DeviceError::NotSupported {
                    device: self.config.device_id.clone(),
                    feature,
                });
            }
        }
        state.action = action;
        debug!(device = %self.config.device_id, action = action.as_str(), "begin");
        Ok(())
    }

    /// Schedules `task` on the loop; a stopped loop fails the operation.
    fn post<T: 'static>(
        &self,
        done: &Completion<DeviceResult<T>>,
        priority: Priority,
        label: &'static str,
        task: impl FnOnce() + 'static,
    ) -> bool {
        match self.main_loop.schedule(priority, label, task) {
            Ok(_) => true,
            Err(e) => {
                done.resolve(Err(e.into()));
                false
            }
        }
    }

    /// Schedules the next step of the running action. A step that comes due
    /// while suspended is parked until resume.
    fn step<T: 'static>(
        self: &Rc<Self>,
        done: &Completion<DeviceResult<T>>,
        label: &'static str,
        task: impl FnOnce(Rc<Shared>) + 'static,
    ) {
        let shared = Rc::clone(self);
        let scheduled = self.post(done, Priority::Default, label, move || {
            let parked_shared = Rc::clone(&shared);
            let mut state = shared.state.borrow_mut();
            if state.suspended {
                debug!(label, "step parked while suspended");
                state.parked.push(Box::new(move || task(parked_shared)));
                return;
            }
            drop(state);
            task(parked_shared);
        });
        if !scheduled {
            let mut state = self.state.borrow_mut();
            state.action = Action::None;
            state.finger = FingerStatus::NONE;
        }
    }

    /// Ends the in-flight action and returns `result` from an idle task.
    fn finish<T: 'static>(&self, done: &Completion<DeviceResult<T>>, result: DeviceResult<T>) {
        {
            let mut state = self.state.borrow_mut();
            debug!(
                device = %self.config.device_id,
                action = state.action.as_str(),
                ok = result.is_ok(),
                "finish"
            );
            state.action = Action::None;
            state.finger = FingerStatus::NONE;
        }
        let completion = done.clone();
        self.post(done, Priority::Default, done.label(), move || {
            completion.resolve(result)
        });
    }

    /// Fails an operation that never started.
    fn reject<T: 'static>(&self, label: &'static str, err: DeviceError) -> Completion<DeviceResult<T>> {
        debug!(device = %self.config.device_id, op = label, error = %err, "rejected");
        let done = Completion::new(label);
        let completion = done.clone();
        self.post(&done, Priority::Default, label, move || {
            completion.resolve(Err(err))
        });
        done
    }

    fn set_finger(&self, status: FingerStatus) {
        self.state.borrow_mut().finger = status;
    }

    fn enroll_step(self: &Rc<Self>, mut job: EnrollJob, done: Completion<DeviceResult<Print>>) {
        let next = done.clone();
        self.step(&done, "enroll-step", move |shared| {
            let scan_steps = shared.config.scan_steps.max(1);
            job.tick += 1;
            if job.tick < scan_steps {
                shared.set_finger(FingerStatus::NEEDED.union(FingerStatus::PRESENT));
                shared.enroll_step(job, next);
                return;
            }

            job.tick = 0;
            job.stage += 1;
            shared.set_finger(FingerStatus::NEEDED);

            if shared.config.fail_enroll_at == Some(job.stage) {
                shared.finish(
                    &next,
                    Err(DeviceError::EnrollFailed {
                        stage: job.stage,
                        reason: "finger removed too early".to_string(),
                    }),
                );
                return;
            }

            let total_stages = shared.config.enroll_stages;
            if let Some(progress) = job.progress.as_mut() {
                progress(&EnrollProgress {
                    completed_stages: job.stage,
                    total_stages,
                });
            }

            if job.stage < total_stages {
                shared.enroll_step(job, next);
                return;
            }

            let finger = &shared.config.enroll_finger;
            let mut print = job.template.with_data(shared.template_for(finger));
            if print.finger().is_none() {
                print = print.with_finger(finger);
            }
            if shared.config.features.storage {
                shared.state.borrow_mut().storage.push(print.clone());
            }
            info!(device = %shared.config.device_id, stages = total_stages, "enrolled");
            shared.finish(&next, Ok(print));
        });
    }

    /// Runs a finger scan, then hands the scanned print to `on_scanned`.
    fn scan_step<T: 'static>(
        self: &Rc<Self>,
        mut job: ScanJob,
        done: Completion<DeviceResult<T>>,
        on_scanned: impl FnOnce(&Rc<Shared>, Print) -> DeviceResult<T> + 'static,
    ) {
        let next = done.clone();
        self.step(&done, "scan-step", move |shared| {
            job.tick += 1;
            if job.tick < shared.config.scan_steps.max(1) {
                shared.set_finger(FingerStatus::NEEDED.union(FingerStatus::PRESENT));
                shared.scan_step(job, next, on_scanned);
                return;
            }
            let scanned = shared.scanned_print();
            let result = on_scanned(&shared, scanned);
            shared.finish(&next, result);
        });
    }
}

impl DeviceDriver for VirtualDevice {
    fn device_id(&self) -> &str {
        &self.shared.config.device_id
    }

    fn driver(&self) -> &str {
        &self.shared.config.driver
    }

    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn features(&self) -> FeatureSet {
        self.shared.config.features
    }

    fn usb_device(&self) -> Option<Rc<UsbDeviceNode>> {
        Some(Rc::clone(&self.shared.usb))
    }

    fn finger_status(&self) -> FingerStatus {
        self.shared.state.borrow().finger
    }

    fn enroll_stages(&self) -> u32 {
        self.shared.config.enroll_stages
    }

    fn is_open(&self) -> bool {
        self.shared.state.borrow().open
    }

    fn is_busy(&self) -> bool {
        self.shared.state.borrow().action != Action::None
    }

    fn open(&self) -> Completion<DeviceResult<()>> {
        if let Err(e) = self.shared.begin(Action::Open, None) {
            return self.shared.reject("open", e);
        }
        let done = Completion::new("open");
        let next = done.clone();
        self.shared.step(&done, "open-step", move |shared| {
            shared.state.borrow_mut().open = true;
            info!(device = %shared.config.device_id, "opened");
            shared.finish(&next, Ok(()));
        });
        done
    }

    fn close(&self) -> Completion<DeviceResult<()>> {
        if let Err(e) = self.shared.begin(Action::Close, None) {
            return self.shared.reject("close", e);
        }
        let done = Completion::new("close");
        let next = done.clone();
        self.shared.step(&done, "close-step", move |shared| {
            shared.state.borrow_mut().open = false;
            info!(device = %shared.config.device_id, "closed");
            shared.finish(&next, Ok(()));
        });
        done
    }

    fn enroll(&self, template: Print, progress: Option<ProgressFn>) -> Completion<DeviceResult<Print>> {
        let config = &self.shared.config;
        if !template.is_bound_to(&config.driver, &config.device_id) {
            return self.shared.reject(
                "enroll",
                DeviceError::ForeignTemplate {
                    driver: template.driver().to_string(),
                    device_id: template.device_id().to_string(),
                },
            );
        }
        if let Err(e) = self.shared.begin(Action::Enroll, None) {
            return self.shared.reject("enroll", e);
        }
        self.shared.set_finger(FingerStatus::NEEDED);
        let done = Completion::new("enroll");
        let job = EnrollJob {
            template,
            progress,
            stage: 0,
            tick: 0,
        };
        self.shared.enroll_step(job, done.clone());
        done
    }

    fn verify(&self, print: &Print) -> Completion<DeviceResult<VerifyOutcome>> {
        if let Err(e) = self.shared.begin(Action::Verify, Some(DeviceFeature::Verify)) {
            return self.shared.reject("verify", e);
        }
        self.shared.set_finger(FingerStatus::NEEDED);
        let done = Completion::new("verify");
        let enrolled = print.clone();
        self.shared
            .scan_step(ScanJob { tick: 0 }, done.clone(), move |_, scanned| {
                let matched = scanned.equal(&enrolled);
                debug!(matched, "verify scanned");
                Ok(VerifyOutcome {
                    matched,
                    scanned: Some(scanned),
                })
            });
        done
    }

    fn identify(&self, gallery: &[Print]) -> Completion<DeviceResult<IdentifyOutcome>> {
        if let Err(e) = self
            .shared
            .begin(Action::Identify, Some(DeviceFeature::Identify))
        {
            return self.shared.reject("identify", e);
        }
        self.shared.set_finger(FingerStatus::NEEDED);
        let done = Completion::new("identify");
        let gallery = gallery.to_vec();
        self.shared
            .scan_step(ScanJob { tick: 0 }, done.clone(), move |_, scanned| {
                let matched = gallery.into_iter().find(|p| p.equal(&scanned));
                debug!(matched = matched.is_some(), "identify scanned");
                Ok(IdentifyOutcome {
                    matched,
                    scanned: Some(scanned),
                })
            });
        done
    }

    fn list_prints(&self) -> Completion<DeviceResult<Vec<Print>>> {
        if let Err(e) = self
            .shared
            .begin(Action::List, Some(DeviceFeature::StorageList))
        {
            return self.shared.reject("list", e);
        }
        let done = Completion::new("list");
        let next = done.clone();
        self.shared.step(&done, "list-step", move |shared| {
            let prints = shared.state.borrow().storage.clone();
            shared.finish(&next, Ok(prints));
        });
        done
    }

    fn delete_print(&self, print: &Print) -> Completion<DeviceResult<()>> {
        if let Err(e) = self
            .shared
            .begin(Action::Delete, Some(DeviceFeature::StorageDelete))
        {
            return self.shared.reject("delete", e);
        }
        let done = Completion::new("delete");
        let next = done.clone();
        let target = print.clone();
        self.shared.step(&done, "delete-step", move |shared| {
            let removed = {
                let mut state = shared.state.borrow_mut();
                let position = state.storage.iter().position(|p| p.equal(&target));
                position.map(|i| state.storage.remove(i))
            };
            let result = match removed {
                Some(_) => Ok(()),
                None => Err(DeviceError::PrintNotFound),
            };
            shared.finish(&next, result);
        });
        done
    }

    fn clear_storage(&self) -> Completion<DeviceResult<()>> {
        if let Err(e) = self
            .shared
            .begin(Action::ClearStorage, Some(DeviceFeature::StorageClear))
        {
            return self.shared.reject("clear-storage", e);
        }
        let done = Completion::new("clear-storage");
        let next = done.clone();
        self.shared.step(&done, "clear-step", move |shared| {
            let cleared = std::mem::take(&mut shared.state.borrow_mut().storage).len();
            debug!(cleared, "storage cleared");
            shared.finish(&next, Ok(()));
        });
        done
    }

    fn suspend(&self) -> Completion<DeviceResult<()>> {
        let in_flight = {
            let mut state = self.shared.state.borrow_mut();
            if state.suspended {
                drop(state);
                return self.shared.reject(
                    "suspend",
                    DeviceError::AlreadySuspended {
                        device: self.shared.config.device_id.clone(),
                    },
                );
            }
            state.suspended = true;
            state.action != Action::None
        };

        let done = Completion::new("suspend");
        let completion = done.clone();
        let shared = Rc::clone(&self.shared);
        self.shared.post(&done, Priority::High, "suspend-complete", move || {
            // An operation continues across the suspend: let the device wake the host.
            if in_flight {
                if let Some(power) = &shared.power {
                    power.configure_wakeup(true);
                }
            }
            info!(device = %shared.config.device_id, in_flight, "suspended");
            completion.resolve(Ok(()));
        });
        done
    }

    fn resume(&self) -> Completion<DeviceResult<()>> {
        let parked = {
            let mut state = self.shared.state.borrow_mut();
            if !state.suspended {
                drop(state);
                return self.shared.reject(
                    "resume",
                    DeviceError::NotSuspended {
                        device: self.shared.config.device_id.clone(),
                    },
                );
            }
            state.suspended = false;
            std::mem::take(&mut state.parked)
        };

        let done = Completion::new("resume");
        let completion = done.clone();
        let shared = Rc::clone(&self.shared);
        self.shared.post(&done, Priority::High, "resume-complete", move || {
            if let Some(power) = &shared.power {
                power.configure_wakeup(false);
            }
            let requeued = parked.len();
            for task in parked {
                if let Err(e) = shared.main_loop.schedule(Priority::Default, "resumed-step", task) {
                    debug!(error = %e, "dropping parked step");
                }
            }
            info!(device = %shared.config.device_id, requeued, "resumed");
            completion.resolve(Ok(()));
        });
        done
    }
}

/// Registers a virtual device with `context` and returns it.
pub fn register_virtual(context: &mut Context, config: VirtualDeviceConfig) -> VirtualDevice {
    let device = VirtualDevice::new(Rc::clone(context.main_loop()), config);
    context.register(Rc::new(device.clone()));
    device
}
