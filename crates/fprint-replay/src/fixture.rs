//! Fixture discovery.
//!
//! A fixture directory holds the virtual device descriptors (`device`,
//! `device-*`), one trace per test mode (`capture.ioctl`, `custom.pcapng`,
//! ...), and optionally a reference `capture.png` or a `custom.*` script.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::capability::TraceFlavor;
use crate::error::{HarnessError, HarnessResult};

const DESCRIPTOR_PREFIX: &str = "P: ";
const IOCTL_PREFIX: &str = "@DEV ";
const SPI_SUFFIX: &str = " (SPI)";

/// A udev device description to instantiate in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub path: PathBuf,
    /// Device path from the `P: ` line, e.g. `/devices/pci0000:00/.../1-1`.
    pub devpath: String,
}

impl DeviceDescriptor {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let first = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        let devpath = first.strip_prefix(DESCRIPTOR_PREFIX).ok_or_else(|| {
            HarnessError::malformed(path, format!("first line {first:?} does not start with {DESCRIPTOR_PREFIX:?}"))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            devpath: devpath.to_string(),
        })
    }

    /// Location of the device in the sandboxed sysfs.
    pub fn syspath(&self) -> String {
        format!("/sys{}", self.devpath)
    }
}

/// The recording a mode replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceFile {
    Ioctl {
        path: PathBuf,
        device_node: String,
        spi: bool,
    },
    Packet {
        path: PathBuf,
        syspath: String,
    },
}

impl TraceFile {
    pub fn path(&self) -> &Path {
        match self {
            TraceFile::Ioctl { path, .. } | TraceFile::Packet { path, .. } => path,
        }
    }

    pub fn flavor(&self) -> TraceFlavor {
        match self {
            TraceFile::Ioctl { spi: false, .. } => TraceFlavor::Ioctl,
            TraceFile::Ioctl { spi: true, .. } => TraceFlavor::IoctlSpi,
            TraceFile::Packet { .. } => TraceFlavor::Packet,
        }
    }

    /// Reads the `@DEV <node>` header of an ioctl trace.
    pub fn load_ioctl(path: &Path) -> HarnessResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let first = contents.lines().next().unwrap_or_default().trim();
        let node = first.strip_prefix(IOCTL_PREFIX).ok_or_else(|| {
            HarnessError::malformed(path, format!("first line {first:?} does not start with {IOCTL_PREFIX:?}"))
        })?;
        let (device_node, spi) = match node.strip_suffix(SPI_SUFFIX) {
            Some(node) => (node, true),
            None => (node, false),
        };
        Ok(TraceFile::Ioctl {
            path: path.to_path_buf(),
            device_node: device_node.to_string(),
            spi,
        })
    }
}

/// A test mode of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Capture an image and compare it with the reference.
    Capture,
    /// Run the fixture's own script.
    Custom,
}

impl TestMode {
    /// Modes in execution order.
    pub const ALL: [TestMode; 2] = [TestMode::Capture, TestMode::Custom];

    /// File stem of the mode's trace and artifacts.
    pub fn base_name(&self) -> &'static str {
        match self {
            TestMode::Capture => "capture",
            TestMode::Custom => "custom",
        }
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base_name())
    }
}

/// Everything needed to run one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModePlan {
    pub mode: TestMode,
    pub trace: TraceFile,
    /// Reference `capture.png` (capture mode).
    pub reference: Option<PathBuf>,
    /// The custom script (custom mode).
    pub script: Option<PathBuf>,
}

/// A resolved fixture directory.
#[derive(Debug, Clone, Serialize)]
pub struct Fixture {
    pub dir: PathBuf,
    pub name: String,
    pub descriptors: Vec<DeviceDescriptor>,
    pub modes: Vec<ModePlan>,
}

fn is_descriptor_name(name: &str) -> bool {
    if name.ends_with('~') {
        return false;
    }
    name == "device" || name.strip_prefix("device-").is_some_and(|rest| !rest.is_empty())
}

fn is_trace_name(name: &str) -> bool {
    name.ends_with(".ioctl") || name.ends_with(".pcapng")
}

impl Fixture {
    /// Resolves descriptors and every mode's trace up front, so a malformed
    /// fixture fails before anything is launched.
    pub fn discover(dir: &Path) -> HarnessResult<Self> {
        if !dir.is_dir() {
            return Err(HarnessError::malformed(dir, "not a directory"));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());

        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| HarnessError::io(dir, e))? {
            let entry = entry.map_err(|e| HarnessError::io(dir, e))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        // `device` sorts before every `device-*`.
        let descriptors = names
            .iter()
            .filter(|n| is_descriptor_name(n))
            .map(|n| DeviceDescriptor::load(&dir.join(n)))
            .collect::<HarnessResult<Vec<_>>>()?;

        let mut modes = Vec::new();
        for mode in TestMode::ALL {
            let prefix = format!("{}.", mode.base_name());
            let present: Vec<&String> = names.iter().filter(|n| n.starts_with(&prefix)).collect();
            if present.is_empty() {
                continue;
            }
            let trace = Self::resolve_trace(dir, mode, &descriptors)?;
            let plan = match mode {
                TestMode::Capture => ModePlan {
                    mode,
                    trace,
                    reference: Some(dir.join("capture.png")).filter(|p| p.is_file()),
                    script: None,
                },
                TestMode::Custom => ModePlan {
                    mode,
                    trace,
                    reference: None,
                    script: Some(Self::custom_script(dir, &present)?),
                },
            };
            debug!(mode = %mode, trace = %plan.trace.path().display(), flavor = %plan.trace.flavor(), "resolved mode");
            modes.push(plan);
        }

        info!(
            fixture = %name,
            descriptors = descriptors.len(),
            modes = modes.len(),
            "discovered fixture"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            descriptors,
            modes,
        })
    }

    /// `<base>.pcapng` wins over `<base>.ioctl`.
    fn resolve_trace(dir: &Path, mode: TestMode, descriptors: &[DeviceDescriptor]) -> HarnessResult<TraceFile> {
        let base = mode.base_name();
        let pcap = dir.join(format!("{base}.pcapng"));
        if pcap.is_file() {
            // The capture is attached to the last descriptor's device.
            let last = descriptors.last().ok_or_else(|| {
                HarnessError::malformed(&pcap, "packet trace without a device descriptor")
            })?;
            return Ok(TraceFile::Packet {
                path: pcap,
                syspath: last.syspath(),
            });
        }

        let ioctl = dir.join(format!("{base}.ioctl"));
        if !ioctl.is_file() {
            return Err(HarnessError::malformed(
                dir,
                format!("{base} mode has neither {base}.pcapng nor {base}.ioctl"),
            ));
        }
        TraceFile::load_ioctl(&ioctl)
    }

    /// `custom.toml` is preferred, then `custom.py`, then any other
    /// non-trace `custom.*` file.
    fn custom_script(dir: &Path, present: &[&String]) -> HarnessResult<PathBuf> {
        let scripts: Vec<&&String> = present.iter().filter(|n| !is_trace_name(n)).collect();
        ["custom.toml", "custom.py"]
            .iter()
            .find_map(|preferred| scripts.iter().find(|n| n.as_str() == *preferred))
            .or_else(|| scripts.first())
            .map(|n| dir.join(n.as_str()))
            .ok_or_else(|| HarnessError::malformed(dir, "custom mode has no custom script"))
    }

    pub fn plan(&self, mode: TestMode) -> Option<&ModePlan> {
        self.modes.iter().find(|p| p.mode == mode)
    }
}
