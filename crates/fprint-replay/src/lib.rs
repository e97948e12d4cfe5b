//! umockdev replay harness for fingerprint drivers: fixture discovery,
//! replay engine capability gating, replay launch, reference image
//! comparison and failure artifact preservation.

pub mod artifacts;
pub mod capability;
pub mod cli;
pub mod config;
pub mod error;
pub mod fixture;
pub mod harness;
pub mod image_cmp;
pub mod launcher;
pub mod report;

pub use capability::{EngineVersion, ReplayCapability, TraceFlavor};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult, ImageError, FAILURE_EXIT_CODE, SKIP_EXIT_CODE};
pub use fixture::{DeviceDescriptor, Fixture, ModePlan, TestMode, TraceFile};
pub use harness::ReplayHarness;
pub use report::{CaseResult, CaseStatus, RunReport};
