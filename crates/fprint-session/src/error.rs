//! Error types for the device-session layer.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceFeature;
use crate::script::Step;

/// Result type alias for main loop operations.
pub type LoopResult<T> = Result<T, LoopError>;

/// Result type alias for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Result type alias for the session script.
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Errors raised by the main loop itself.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The loop was stopped; no further work is dispatched.
    #[error("main loop has been stopped")]
    Stopped,

    /// Nothing is queued but the awaited completion is still pending.
    #[error("main loop stalled waiting for {label}: no runnable tasks")]
    Stalled {
        /// Label of the completion that can no longer resolve.
        label: &'static str,
    },
}

/// Errors reported by a driver through the device-session API.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device was not opened before the operation.
    #[error("device {device} is not open")]
    NotOpen { device: String },

    /// The device is already open.
    #[error("device {device} is already open")]
    AlreadyOpen { device: String },

    /// Another operation is still in flight.
    #[error("device {device} is busy with {action}")]
    Busy { device: String, action: &'static str },

    /// The driver does not advertise the feature needed by the operation.
    #[error("device {device} does not support {feature:?}")]
    NotSupported {
        device: String,
        feature: DeviceFeature,
    },

    /// A suspend was requested while already suspended.
    #[error("device {device} is already suspended")]
    AlreadySuspended { device: String },

    /// A resume was requested while not suspended.
    #[error("device {device} is not suspended")]
    NotSuspended { device: String },

    /// The template belongs to another driver or device.
    #[error("template is bound to {driver}/{device_id}, not this device")]
    ForeignTemplate { driver: String, device_id: String },

    /// The print is not in the device storage.
    #[error("print not found in device storage")]
    PrintNotFound,

    /// The enrollment was aborted by the driver.
    #[error("enrollment failed at stage {stage}: {reason}")]
    EnrollFailed { stage: u32, reason: String },

    /// The main loop could not complete the operation.
    #[error(transparent)]
    Loop(#[from] LoopError),
}

/// Errors that abort the session script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// An invariant check failed.
    #[error("assertion failed during {step}: {message}")]
    Assertion { step: Step, message: String },

    /// A device operation returned an error.
    #[error("device operation failed during {step}")]
    Device {
        step: Step,
        #[source]
        source: DeviceError,
    },

    /// A sysfs attribute could not be read or written.
    #[error("I/O error during {step} on {path}")]
    Io {
        step: Step,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The profile file could not be loaded.
    #[error("invalid session profile {path}: {reason}")]
    InvalidProfile { path: PathBuf, reason: String },
}

impl ScriptError {
    /// The script step that failed, if the error came from one.
    pub fn step(&self) -> Option<Step> {
        match self {
            ScriptError::Assertion { step, .. }
            | ScriptError::Device { step, .. }
            | ScriptError::Io { step, .. } => Some(*step),
            ScriptError::InvalidProfile { .. } => None,
        }
    }
}
