//! Device-session layer of the fprint replay harness: a priority-tier main
//! loop, the driver-facing session API, USB power attributes, an in-process
//! virtual driver and the session protocol script.

pub mod device;
pub mod error;
pub mod main_loop;
pub mod power;
pub mod profile;
pub mod script;
pub mod virtual_device;

pub use device::{Context, Device, DeviceDriver, DeviceFeature, FeatureSet, FingerStatus, Print};
pub use error::{DeviceError, LoopError, ScriptError};
pub use main_loop::{Completion, MainLoop, Priority};
pub use power::{PowerAttrs, UsbPath};
pub use profile::{ScriptVariant, SessionProfile};
pub use script::{ScriptReport, SessionScript, Step};
pub use virtual_device::{VirtualDevice, VirtualDeviceConfig};
