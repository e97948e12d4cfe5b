//! Session profile: what the session script expects of a device.
//!
//! Loaded from a fixture's `custom.toml`:
//!
//! ```toml
//! driver = "synaptics"
//! variant = "extended"
//! sysfs_root = "/sys"
//! identify = false
//!
//! [features]
//! capture = false
//! verify = true
//!
//! [device]
//! bus = 1
//! ports = [2]
//! enroll_stages = 5
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::DeviceFeature;
use crate::error::{ScriptError, ScriptResult};
use crate::virtual_device::VirtualDeviceConfig;

/// Which protocol the session script runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptVariant {
    /// Open, enroll, list, verify, delete, close.
    Base,
    /// Base plus power attributes, feature assertions, storage clearing,
    /// finger status checks and a suspend/resume cycle inside verify.
    #[default]
    Extended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProfile {
    /// Driver id the first enumerated device must report.
    pub driver: String,
    pub variant: ScriptVariant,
    /// Expected value of each listed feature; unlisted features are not checked.
    pub features: BTreeMap<DeviceFeature, bool>,
    pub sysfs_root: PathBuf,
    /// Run an extra identify step after verify.
    pub identify: bool,
    /// In-process virtual driver used by the `fprint-session` binary.
    pub device: VirtualDeviceConfig,
}

impl Default for SessionProfile {
    fn default() -> Self {
        let features = BTreeMap::from([
            (DeviceFeature::Capture, false),
            (DeviceFeature::Identify, true),
            (DeviceFeature::Verify, true),
            (DeviceFeature::DuplicatesCheck, false),
            (DeviceFeature::Storage, true),
            (DeviceFeature::StorageDelete, true),
            (DeviceFeature::StorageClear, true),
        ]);
        Self {
            driver: "synaptics".to_string(),
            variant: ScriptVariant::Extended,
            features,
            sysfs_root: PathBuf::from("/sys"),
            identify: false,
            device: VirtualDeviceConfig::default(),
        }
    }
}

impl SessionProfile {
    pub fn from_file(path: &Path) -> ScriptResult<Self> {
        let invalid = |reason: String| ScriptError::InvalidProfile {
            path: path.to_path_buf(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let profile: SessionProfile = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| invalid(e.to_string()))?,
            _ => return Err(invalid(format!("unsupported profile extension: {ext}"))),
        };
        debug!(path = %path.display(), driver = %profile.driver, variant = ?profile.variant, "loaded session profile");
        Ok(profile)
    }

    pub fn is_extended(&self) -> bool {
        self.variant == ScriptVariant::Extended
    }

    /// Virtual driver configuration, tied to the profile's driver id and
    /// sysfs root unless the `[device]` table overrides them.
    pub fn virtual_device_config(&self) -> VirtualDeviceConfig {
        let mut config = self.device.clone();
        if config.driver == VirtualDeviceConfig::default().driver {
            config.driver = self.driver.clone();
        }
        if config.sysfs_root.is_none() {
            config.sysfs_root = Some(self.sysfs_root.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_profile(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_profile_is_synaptics_extended() {
        let profile = SessionProfile::default();
        assert_eq!(profile.driver, "synaptics");
        assert!(profile.is_extended());
        assert_eq!(profile.features.len(), 7);
        assert_eq!(profile.features.get(&DeviceFeature::Capture), Some(&false));
        assert_eq!(profile.features.get(&DeviceFeature::StorageList), None);
        assert_eq!(profile.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_from_file_toml() {
        let file = write_profile(
            ".toml",
            r#"
driver = "elanmoc"
variant = "base"
identify = true

[features]
capture = false
duplicates_check = true

[device]
ports = [2, 4]
enroll_stages = 3
"#,
        );
        let profile = SessionProfile::from_file(file.path()).unwrap();
        assert_eq!(profile.driver, "elanmoc");
        assert_eq!(profile.variant, ScriptVariant::Base);
        assert!(profile.identify);
        assert_eq!(profile.features.len(), 2);
        assert!(profile.features[&DeviceFeature::DuplicatesCheck]);
        assert_eq!(profile.device.ports, vec![2, 4]);
        assert_eq!(profile.device.enroll_stages, 3);
        assert_eq!(profile.device.bus, 1);
    }

    #[test]
    fn test_virtual_device_inherits_driver_and_sysfs_root() {
        let profile = SessionProfile {
            driver: "elanmoc".to_string(),
            sysfs_root: PathBuf::from("/tmp/sys"),
            ..SessionProfile::default()
        };
        let config = profile.virtual_device_config();
        assert_eq!(config.driver, "elanmoc");
        assert_eq!(config.sysfs_root, Some(PathBuf::from("/tmp/sys")));
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let file = write_profile(".toml", "[features]\nteleport = true\n");
        let err = SessionProfile::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidProfile { .. }));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_profile(".yaml", "driver: synaptics\n");
        let err = SessionProfile::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported profile extension"));
    }

    #[test]
    fn test_missing_file() {
        let err = SessionProfile::from_file(Path::new("/nonexistent/custom.toml")).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidProfile { .. }));
    }
}
