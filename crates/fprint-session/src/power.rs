//! USB power-management attributes of a device.
//!
//! Drivers keep `power/wakeup` enabled only while an operation is running
//! across a system suspend, and keep `power/persist` at `0` so a device that
//! lost power re-enumerates instead of being silently reattached.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const PERSIST_ATTR: &str = "persist";
pub const WAKEUP_ATTR: &str = "wakeup";

pub const WAKEUP_ENABLED: &str = "enabled";
pub const WAKEUP_DISABLED: &str = "disabled";
pub const PERSIST_OFF: &str = "0";

/// A node in the USB device tree. The root hub has no parent.
#[derive(Debug, Clone)]
pub struct UsbDeviceNode {
    pub bus: u8,
    pub port_number: u8,
    pub parent: Option<Rc<UsbDeviceNode>>,
}

impl UsbDeviceNode {
    pub fn root_hub(bus: u8) -> Rc<Self> {
        Rc::new(Self {
            bus,
            port_number: 0,
            parent: None,
        })
    }

    /// Builds the chain `root hub -> ports[0] -> ports[1] -> ...` and returns the leaf.
    pub fn chain(bus: u8, ports: &[u8]) -> Rc<Self> {
        ports.iter().fold(Self::root_hub(bus), |parent, &port| {
            Rc::new(Self {
                bus,
                port_number: port,
                parent: Some(parent),
            })
        })
    }
}

/// Stable bus/port identity of a USB device, e.g. `1-2.4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbPath {
    pub bus: u8,
    /// Port numbers from the root hub down to the device.
    pub ports: Vec<u8>,
}

impl UsbPath {
    pub fn new(bus: u8, ports: Vec<u8>) -> Self {
        Self { bus, ports }
    }

    /// Walks up from `device` to the root hub, skipping the root hub itself.
    pub fn resolve(device: &UsbDeviceNode) -> Self {
        let mut ports = Vec::new();
        let mut node = device;
        while let Some(parent) = node.parent.as_deref() {
            ports.push(node.port_number);
            node = parent;
        }
        ports.reverse();
        Self {
            bus: device.bus,
            ports,
        }
    }

    /// Kernel device name, `<bus>-<port>.<port>...`.
    pub fn id(&self) -> String {
        let ports: Vec<String> = self.ports.iter().map(u8::to_string).collect();
        format!("{}-{}", self.bus, ports.join("."))
    }

    /// `<sysfs_root>/bus/usb/devices/<id>/power`.
    pub fn power_dir(&self, sysfs_root: &Path) -> PathBuf {
        sysfs_root
            .join("bus/usb/devices")
            .join(self.id())
            .join("power")
    }
}

/// Outcome of [`update_attr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrUpdate {
    /// The attribute already held the value; nothing was written.
    Unchanged,
    Written,
}

/// Writes `value` to a sysfs attribute unless it already holds it.
///
/// The current content is compared with trailing whitespace stripped. A write
/// truncates the file and stores `value` without a newline.
pub fn update_attr(path: &Path, value: &str) -> io::Result<AttrUpdate> {
    let current = fs::read_to_string(path)?;
    if current.trim_end() == value {
        return Ok(AttrUpdate::Unchanged);
    }

    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())?;
    debug!(path = %path.display(), value, "updated attribute");
    Ok(AttrUpdate::Written)
}

/// The `power/` attributes of one USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerAttrs {
    dir: PathBuf,
}

impl PowerAttrs {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn for_device(path: &UsbPath, sysfs_root: &Path) -> Self {
        Self::new(path.power_dir(sysfs_root))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn persist_path(&self) -> PathBuf {
        self.dir.join(PERSIST_ATTR)
    }

    pub fn wakeup_path(&self) -> PathBuf {
        self.dir.join(WAKEUP_ATTR)
    }

    /// Raw bytes of `persist`, including any trailing newline.
    pub fn read_persist_raw(&self) -> io::Result<String> {
        fs::read_to_string(self.persist_path())
    }

    pub fn read_persist(&self) -> io::Result<String> {
        Ok(self.read_persist_raw()?.trim().to_string())
    }

    pub fn read_wakeup(&self) -> io::Result<String> {
        Ok(fs::read_to_string(self.wakeup_path())?.trim().to_string())
    }

    /// Overwrites `persist` with exactly `content`.
    pub fn write_persist_raw(&self, content: &str) -> io::Result<()> {
        fs::write(self.persist_path(), content)
    }

    /// Creates the directory and both attributes with the given content.
    pub fn seed(&self, persist: &str, wakeup: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.persist_path(), persist)?;
        fs::write(self.wakeup_path(), wakeup)
    }

    /// Enables or disables remote wakeup and forces persist off.
    ///
    /// Failures are logged, not returned: a driver keeps running when the
    /// attributes are not writable.
    pub fn configure_wakeup(&self, enabled: bool) {
        let wakeup = if enabled { WAKEUP_ENABLED } else { WAKEUP_DISABLED };
        let wakeup_path = self.wakeup_path();
        if let Err(e) = update_attr(&wakeup_path, wakeup) {
            debug!(path = %wakeup_path.display(), wakeup, error = %e, "failed to set wakeup");
        }

        let persist_path = self.persist_path();
        if let Err(e) = update_attr(&persist_path, PERSIST_OFF) {
            warn!(path = %persist_path.display(), error = %e, "failed to disable USB persist");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> (TempDir, PowerAttrs) {
        let temp = tempfile::tempdir().unwrap();
        let attrs = PowerAttrs::for_device(&UsbPath::new(1, vec![2]), temp.path());
        attrs.seed("0\n", "disabled\n").unwrap();
        (temp, attrs)
    }

    #[test]
    fn test_resolve_skips_root_hub() {
        let leaf = UsbDeviceNode::chain(3, &[2, 4]);
        let path = UsbPath::resolve(&leaf);
        assert_eq!(path, UsbPath::new(3, vec![2, 4]));
        assert_eq!(path.id(), "3-2.4");
    }

    #[test]
    fn test_resolve_single_port() {
        let leaf = UsbDeviceNode::chain(1, &[1]);
        assert_eq!(UsbPath::resolve(&leaf).id(), "1-1");
    }

    #[test]
    fn test_power_dir_layout() {
        let path = UsbPath::new(1, vec![5]);
        assert_eq!(
            path.power_dir(Path::new("/sys")),
            PathBuf::from("/sys/bus/usb/devices/1-5/power")
        );
    }

    #[test]
    fn test_update_attr_leaves_equal_value_untouched() {
        let (_temp, attrs) = seeded();
        let res = update_attr(&attrs.persist_path(), "0").unwrap();
        assert_eq!(res, AttrUpdate::Unchanged);
        assert_eq!(attrs.read_persist_raw().unwrap(), "0\n");
    }

    #[test]
    fn test_update_attr_rewrites_without_newline() {
        let (_temp, attrs) = seeded();
        let res = update_attr(&attrs.wakeup_path(), "enabled").unwrap();
        assert_eq!(res, AttrUpdate::Written);
        assert_eq!(fs::read_to_string(attrs.wakeup_path()).unwrap(), "enabled");
    }

    #[test]
    fn test_update_attr_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let err = update_attr(&temp.path().join("nope"), "0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_configure_wakeup_round_trip() {
        let (_temp, attrs) = seeded();
        attrs.configure_wakeup(true);
        assert_eq!(attrs.read_wakeup().unwrap(), "enabled");
        assert_eq!(attrs.read_persist_raw().unwrap(), "0\n");

        attrs.configure_wakeup(false);
        assert_eq!(attrs.read_wakeup().unwrap(), "disabled");
        assert_eq!(attrs.read_persist_raw().unwrap(), "0\n");
    }

    #[test]
    fn test_configure_wakeup_resets_persist() {
        let (_temp, attrs) = seeded();
        attrs.write_persist_raw("1\n").unwrap();
        attrs.configure_wakeup(false);
        assert_eq!(attrs.read_persist_raw().unwrap(), "0");
    }

    #[test]
    fn test_configure_wakeup_tolerates_missing_dir() {
        let temp = tempfile::tempdir().unwrap();
        let attrs = PowerAttrs::new(temp.path().join("absent"));
        attrs.configure_wakeup(true);
        assert!(!attrs.dir().exists());
    }
}
