//! Device-session API.
//!
//! A driver implements [`DeviceDriver`]: every long-running operation starts
//! immediately and returns a [`Completion`] that the driver resolves from a
//! main loop task. [`Device`] wraps a driver together with its [`MainLoop`]
//! and offers the blocking `*_sync` calls a test script uses.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DeviceError, DeviceResult};
use crate::main_loop::{Completion, MainLoop};
use crate::power::{UsbDeviceNode, UsbPath};

/// The fixed list of optional device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFeature {
    Capture,
    Identify,
    Verify,
    DuplicatesCheck,
    Storage,
    StorageList,
    StorageDelete,
    StorageClear,
    AlwaysOn,
}

impl DeviceFeature {
    pub const ALL: [DeviceFeature; 9] = [
        DeviceFeature::Capture,
        DeviceFeature::Identify,
        DeviceFeature::Verify,
        DeviceFeature::DuplicatesCheck,
        DeviceFeature::Storage,
        DeviceFeature::StorageList,
        DeviceFeature::StorageDelete,
        DeviceFeature::StorageClear,
        DeviceFeature::AlwaysOn,
    ];
}

/// Capability set of a device, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSet {
    pub capture: bool,
    pub identify: bool,
    pub verify: bool,
    pub duplicates_check: bool,
    pub storage: bool,
    pub storage_list: bool,
    pub storage_delete: bool,
    pub storage_clear: bool,
    pub always_on: bool,
}

impl FeatureSet {
    /// Match-on-chip sensor with on-device storage and no image capture.
    pub fn match_on_chip() -> Self {
        Self {
            capture: false,
            identify: true,
            verify: true,
            duplicates_check: false,
            storage: true,
            storage_list: true,
            storage_delete: true,
            storage_clear: true,
            always_on: false,
        }
    }

    pub fn has(&self, feature: DeviceFeature) -> bool {
        match feature {
            DeviceFeature::Capture => self.capture,
            DeviceFeature::Identify => self.identify,
            DeviceFeature::Verify => self.verify,
            DeviceFeature::DuplicatesCheck => self.duplicates_check,
            DeviceFeature::Storage => self.storage,
            DeviceFeature::StorageList => self.storage_list,
            DeviceFeature::StorageDelete => self.storage_delete,
            DeviceFeature::StorageClear => self.storage_clear,
            DeviceFeature::AlwaysOn => self.always_on,
        }
    }

    pub fn set(&mut self, feature: DeviceFeature, enabled: bool) {
        let slot = match feature {
            DeviceFeature::Capture => &mut self.capture,
            DeviceFeature::Identify => &mut self.identify,
            DeviceFeature::Verify => &mut self.verify,
            DeviceFeature::DuplicatesCheck => &mut self.duplicates_check,
            DeviceFeature::Storage => &mut self.storage,
            DeviceFeature::StorageList => &mut self.storage_list,
            DeviceFeature::StorageDelete => &mut self.storage_delete,
            DeviceFeature::StorageClear => &mut self.storage_clear,
            DeviceFeature::AlwaysOn => &mut self.always_on,
        };
        *slot = enabled;
    }

    pub fn with(mut self, feature: DeviceFeature, enabled: bool) -> Self {
        self.set(feature, enabled);
        self
    }

    pub fn enabled(&self) -> impl Iterator<Item = DeviceFeature> + '_ {
        DeviceFeature::ALL.into_iter().filter(|f| self.has(*f))
    }
}

/// Finger-presence status bits reported by a device.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FingerStatus(u8);

impl FingerStatus {
    pub const NONE: FingerStatus = FingerStatus(0);
    /// The device is waiting for a finger.
    pub const NEEDED: FingerStatus = FingerStatus(1 << 0);
    /// A finger is on the sensor.
    pub const PRESENT: FingerStatus = FingerStatus(1 << 1);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: FingerStatus) -> bool {
        self.0 & other.0 == other.0 && !other.is_none()
    }

    pub fn insert(&mut self, other: FingerStatus) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FingerStatus) {
        self.0 &= !other.0;
    }

    pub fn union(self, other: FingerStatus) -> FingerStatus {
        FingerStatus(self.0 | other.0)
    }
}

impl fmt::Debug for FingerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for FingerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        let mut names = Vec::new();
        if self.contains(FingerStatus::NEEDED) {
            names.push("needed");
        }
        if self.contains(FingerStatus::PRESENT) {
            names.push("present");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// An enrolled (or to-be-enrolled) fingerprint template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Print {
    driver: String,
    device_id: String,
    finger: Option<String>,
    description: Option<String>,
    data: Vec<u8>,
}

impl Print {
    /// Empty template bound to `device`, ready for enrollment.
    pub fn new(device: &Device) -> Self {
        Self::for_driver(device.driver(), device.device_id())
    }

    pub fn for_driver(driver: &str, device_id: &str) -> Self {
        Self {
            driver: driver.to_string(),
            device_id: device_id.to_string(),
            finger: None,
            description: None,
            data: Vec::new(),
        }
    }

    pub fn with_finger(mut self, finger: &str) -> Self {
        self.finger = Some(finger.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Copy of this template carrying enrolled template data.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn finger(&self) -> Option<&str> {
        self.finger.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_enrolled(&self) -> bool {
        !self.data.is_empty()
    }

    /// Driver equality: same driver, same device, same template data.
    /// Finger and description are metadata and ignored.
    pub fn equal(&self, other: &Print) -> bool {
        self.driver == other.driver && self.device_id == other.device_id && self.data == other.data
    }

    pub fn is_bound_to(&self, driver: &str, device_id: &str) -> bool {
        self.driver == driver && self.device_id == device_id
    }
}

/// Progress report delivered after each enrollment stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollProgress {
    pub completed_stages: u32,
    pub total_stages: u32,
}

pub type ProgressFn = Box<dyn FnMut(&EnrollProgress)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub matched: bool,
    /// The print scanned during verification, if the driver reports it.
    pub scanned: Option<Print>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyOutcome {
    /// The gallery entry that matched.
    pub matched: Option<Print>,
    pub scanned: Option<Print>,
}

/// Asynchronous completion contract a driver implements.
pub trait DeviceDriver {
    /// Unique id of this device instance.
    fn device_id(&self) -> &str;
    /// Id of the driver handling the device.
    fn driver(&self) -> &str;
    /// Human readable product name.
    fn name(&self) -> &str;
    fn features(&self) -> FeatureSet;
    /// Leaf node of the USB tree for USB devices.
    fn usb_device(&self) -> Option<Rc<UsbDeviceNode>>;
    fn finger_status(&self) -> FingerStatus;
    fn enroll_stages(&self) -> u32;
    fn is_open(&self) -> bool;
    /// True while an operation is in flight.
    fn is_busy(&self) -> bool;

    fn open(&self) -> Completion<DeviceResult<()>>;
    fn close(&self) -> Completion<DeviceResult<()>>;
    fn enroll(&self, template: Print, progress: Option<ProgressFn>) -> Completion<DeviceResult<Print>>;
    fn verify(&self, print: &Print) -> Completion<DeviceResult<VerifyOutcome>>;
    fn identify(&self, gallery: &[Print]) -> Completion<DeviceResult<IdentifyOutcome>>;
    fn list_prints(&self) -> Completion<DeviceResult<Vec<Print>>>;
    fn delete_print(&self, print: &Print) -> Completion<DeviceResult<()>>;
    fn clear_storage(&self) -> Completion<DeviceResult<()>>;
    fn suspend(&self) -> Completion<DeviceResult<()>>;
    fn resume(&self) -> Completion<DeviceResult<()>>;
}

/// A driver bound to the loop that drives it, with blocking wrappers.
#[derive(Clone)]
pub struct Device {
    driver: Rc<dyn DeviceDriver>,
    main_loop: Rc<MainLoop>,
}

impl Device {
    pub fn new(driver: Rc<dyn DeviceDriver>, main_loop: Rc<MainLoop>) -> Self {
        Self { driver, main_loop }
    }

    pub fn device_id(&self) -> &str {
        self.driver.device_id()
    }

    pub fn driver(&self) -> &str {
        self.driver.driver()
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn features(&self) -> FeatureSet {
        self.driver.features()
    }

    pub fn has_feature(&self, feature: DeviceFeature) -> bool {
        self.driver.features().has(feature)
    }

    pub fn usb_path(&self) -> Option<UsbPath> {
        self.driver.usb_device().map(|node| UsbPath::resolve(&node))
    }

    pub fn finger_status(&self) -> FingerStatus {
        self.driver.finger_status()
    }

    pub fn enroll_stages(&self) -> u32 {
        self.driver.enroll_stages()
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_open()
    }

    pub fn is_busy(&self) -> bool {
        self.driver.is_busy()
    }

    pub fn main_loop(&self) -> &Rc<MainLoop> {
        &self.main_loop
    }

    fn wait<T>(&self, completion: Completion<DeviceResult<T>>) -> DeviceResult<T> {
        debug!(device = self.device_id(), op = completion.label(), "waiting");
        self.main_loop.run_until_complete(&completion)?
    }

    pub fn open_sync(&self) -> DeviceResult<()> {
        self.wait(self.driver.open())
    }

    pub fn close_sync(&self) -> DeviceResult<()> {
        self.wait(self.driver.close())
    }

    pub fn enroll_sync(&self, template: Print, progress: Option<ProgressFn>) -> DeviceResult<Print> {
        self.wait(self.driver.enroll(template, progress))
    }

    pub fn verify_sync(&self, print: &Print) -> DeviceResult<VerifyOutcome> {
        self.wait(self.driver.verify(print))
    }

    pub fn identify_sync(&self, gallery: &[Print]) -> DeviceResult<IdentifyOutcome> {
        self.wait(self.driver.identify(gallery))
    }

    pub fn list_prints_sync(&self) -> DeviceResult<Vec<Print>> {
        self.wait(self.driver.list_prints())
    }

    pub fn delete_print_sync(&self, print: &Print) -> DeviceResult<()> {
        self.wait(self.driver.delete_print(print))
    }

    pub fn clear_storage_sync(&self) -> DeviceResult<()> {
        self.wait(self.driver.clear_storage())
    }

    pub fn suspend_sync(&self) -> DeviceResult<()> {
        self.wait(self.driver.suspend())
    }

    pub fn resume_sync(&self) -> DeviceResult<()> {
        self.wait(self.driver.resume())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id())
            .field("driver", &self.driver())
            .finish()
    }
}

/// Owns the session's main loop and the devices known to it.
pub struct Context {
    main_loop: Rc<MainLoop>,
    drivers: Vec<Rc<dyn DeviceDriver>>,
    devices: Vec<Device>,
}

impl Context {
    pub fn new(main_loop: Rc<MainLoop>) -> Self {
        Self {
            main_loop,
            drivers: Vec::new(),
            devices: Vec::new(),
        }
    }

    /// Makes a driver instance discoverable by [`Context::enumerate`].
    pub fn register(&mut self, driver: Rc<dyn DeviceDriver>) {
        self.drivers.push(driver);
    }

    /// Refreshes the device list from the registered drivers. Devices keep
    /// registration order; duplicate device ids are ignored.
    pub fn enumerate(&mut self) {
        self.devices.clear();
        for driver in &self.drivers {
            if self
                .devices
                .iter()
                .any(|d| d.device_id() == driver.device_id())
            {
                debug!(device = driver.device_id(), "duplicate device id ignored");
                continue;
            }
            self.devices
                .push(Device::new(Rc::clone(driver), Rc::clone(&self.main_loop)));
        }
        info!(count = self.devices.len(), "enumerated devices");
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn main_loop(&self) -> &Rc<MainLoop> {
        &self.main_loop
    }

    /// Convenience for drivers: an error if `feature` is missing.
    pub fn require(device: &dyn DeviceDriver, feature: DeviceFeature) -> DeviceResult<()> {
        if device.features().has(feature) {
            Ok(())
        } else {
            Err(DeviceError::NotSupported {
                device: device.device_id().to_string(),
                feature,
            })
        }
    }
}
