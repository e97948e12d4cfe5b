//! Replay engine detection and version gating.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Version triple reported by `umockdev-run --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Oldest engine that replays packet-capture traces.
pub const PCAP_MIN: EngineVersion = EngineVersion::new(0, 16, 3);
/// Oldest engine that replays SPI ioctl traces.
pub const SPI_MIN: EngineVersion = EngineVersion::new(0, 16, 0);
/// Older engines run, but replay is known to be flaky.
pub const RELIABLE_MIN: EngineVersion = EngineVersion::new(0, 13, 2);

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses up to three dot-separated components. Each component
    /// contributes its leading digits; parsing stops at the first component
    /// without any, and missing components are zero. Returns `None` when not
    /// even the first component is numeric.
    pub fn parse(output: &str) -> Option<Self> {
        let mut parts = [0u32; 3];
        let mut parsed = 0;
        for (slot, component) in parts.iter_mut().zip(output.trim().split('.')) {
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            match digits.parse() {
                Ok(value) => {
                    *slot = value;
                    parsed += 1;
                }
                Err(_) => break,
            }
        }
        if parsed == 0 {
            return None;
        }
        Some(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Kind of trace a mode replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceFlavor {
    Ioctl,
    IoctlSpi,
    Packet,
}

impl TraceFlavor {
    /// Minimum engine version, if the flavor has one.
    pub fn required(&self) -> Option<EngineVersion> {
        match self {
            TraceFlavor::Ioctl => None,
            TraceFlavor::IoctlSpi => Some(SPI_MIN),
            TraceFlavor::Packet => Some(PCAP_MIN),
        }
    }
}

impl fmt::Display for TraceFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceFlavor::Ioctl => write!(f, "ioctl"),
            TraceFlavor::IoctlSpi => write!(f, "SPI ioctl"),
            TraceFlavor::Packet => write!(f, "pcapng"),
        }
    }
}

/// What the installed engine can replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayCapability {
    pub version: EngineVersion,
    /// Set by the CI override: every flavor counts as supported.
    pub forced: bool,
}

impl ReplayCapability {
    pub fn new(version: EngineVersion, forced: bool) -> Self {
        Self { version, forced }
    }

    pub fn packet_supported(&self) -> bool {
        self.supports(TraceFlavor::Packet)
    }

    pub fn spi_supported(&self) -> bool {
        self.supports(TraceFlavor::IoctlSpi)
    }

    pub fn supports(&self, flavor: TraceFlavor) -> bool {
        self.forced || flavor.required().map_or(true, |min| self.version >= min)
    }

    /// Skip error if `flavor` cannot be replayed.
    pub fn check(&self, flavor: TraceFlavor) -> HarnessResult<()> {
        match flavor.required() {
            Some(required) if !self.supports(flavor) => Err(HarnessError::CapabilityInsufficient {
                flavor,
                required,
                found: self.version,
            }),
            _ => Ok(()),
        }
    }
}

/// Finds the engine binary: an explicit path is used as is, a bare name is
/// looked up in `PATH` order.
pub fn locate_engine(engine: &str) -> Option<PathBuf> {
    locate_engine_in(engine, std::env::var_os("PATH").as_deref())
}

/// [`locate_engine`] against a given search path.
pub fn locate_engine_in(engine: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if engine.contains('/') {
        let path = PathBuf::from(engine);
        return path.is_file().then_some(path);
    }
    std::env::split_paths(search_path?)
        .map(|dir| dir.join(engine))
        .find(|candidate| candidate.is_file())
}

/// Runs `<engine> --version` and derives the replay capability.
pub async fn probe(engine: &Path, forced: bool) -> HarnessResult<ReplayCapability> {
    let output = match Command::new(engine).arg("--version").output().await {
        Ok(output) => output,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(HarnessError::EngineUnavailable {
                engine: engine.display().to_string(),
            })
        }
        Err(e) => return Err(HarnessError::io(engine, e)),
    };
    if !output.status.success() {
        return Err(HarnessError::ChildFailed {
            what: format!("{} --version", engine.display()),
            status: output.status.to_string(),
            code: output.status.code(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = EngineVersion::parse(&stdout).ok_or_else(|| HarnessError::UnparseableVersion {
        output: stdout.trim().to_string(),
    })?;
    debug!(engine = %engine.display(), %version, "probed replay engine");

    if version < RELIABLE_MIN {
        warn!(
            %version,
            "umockdev is too old for replay to be reliable, expect random failures; update to at least {}",
            RELIABLE_MIN
        );
    }

    let capability = ReplayCapability::new(version, forced);
    info!(
        %version,
        forced,
        pcap = capability.packet_supported(),
        spi = capability.spi_supported(),
        "replay capability"
    );
    Ok(capability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!(EngineVersion::parse("0.16"), Some(EngineVersion::new(0, 16, 0)));
        assert_eq!(EngineVersion::parse("0.17.1\n"), Some(EngineVersion::new(0, 17, 1)));
        assert_eq!(EngineVersion::parse("0.18.0-rc1"), Some(EngineVersion::new(0, 18, 0)));
        assert_eq!(EngineVersion::parse("0.16.3.4"), Some(EngineVersion::new(0, 16, 3)));
        assert_eq!(EngineVersion::parse("1.rc.5"), Some(EngineVersion::new(1, 0, 0)));
        assert_eq!(EngineVersion::parse("unknown"), None);
        assert_eq!(EngineVersion::parse(""), None);
    }

    #[test]
    fn test_thresholds() {
        let old = ReplayCapability::new(EngineVersion::new(0, 16, 2), false);
        assert!(!old.packet_supported());
        assert!(old.spi_supported());
        assert!(old.supports(TraceFlavor::Ioctl));

        let older = ReplayCapability::new(EngineVersion::new(0, 15, 9), false);
        assert!(!older.spi_supported());

        let new = ReplayCapability::new(PCAP_MIN, false);
        assert!(new.packet_supported());
    }

    #[test]
    fn test_forced_supports_everything() {
        let cap = ReplayCapability::new(EngineVersion::new(0, 1, 0), true);
        assert!(cap.packet_supported());
        assert!(cap.spi_supported());
        assert!(cap.check(TraceFlavor::Packet).is_ok());
    }

    #[test]
    fn test_check_reports_skip() {
        let cap = ReplayCapability::new(EngineVersion::new(0, 16, 2), false);
        let err = cap.check(TraceFlavor::Packet).unwrap_err();
        assert!(err.is_skip());
        assert!(matches!(
            err,
            HarnessError::CapabilityInsufficient {
                flavor: TraceFlavor::Packet,
                required: PCAP_MIN,
                ..
            }
        ));
        assert!(cap.check(TraceFlavor::IoctlSpi).is_ok());
    }

    #[test]
    fn test_locate_engine_explicit_path() {
        let temp = tempfile::tempdir().unwrap();
        let engine = temp.path().join("fake-engine");
        assert_eq!(locate_engine(engine.to_str().unwrap()), None);
        std::fs::write(&engine, "#!/bin/sh\n").unwrap();
        assert_eq!(locate_engine(engine.to_str().unwrap()), Some(engine));
    }

    #[test]
    fn test_locate_engine_follows_search_path_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [&first, &second] {
            std::fs::write(dir.path().join("umockdev-run"), "#!/bin/sh\n").unwrap();
        }
        let search = std::env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(
            locate_engine_in("umockdev-run", Some(search.as_os_str())),
            Some(first.path().join("umockdev-run"))
        );

        let search = std::env::join_paths([second.path(), first.path()]).unwrap();
        assert_eq!(
            locate_engine_in("umockdev-run", Some(search.as_os_str())),
            Some(second.path().join("umockdev-run"))
        );
        assert_eq!(locate_engine_in("missing-engine", Some(search.as_os_str())), None);
        assert_eq!(locate_engine_in("umockdev-run", None), None);
    }

    #[test]
    fn test_locate_engine_missing_name() {
        assert_eq!(locate_engine("definitely-not-an-installed-engine-xyz"), None);
    }

    #[tokio::test]
    async fn test_probe_missing_engine_is_unavailable() {
        let err = probe(Path::new("/nonexistent/umockdev-run"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::EngineUnavailable { .. }));
        assert_eq!(err.exit_code(), 77);
    }

    proptest! {
        #[test]
        fn test_parse_display_roundtrip(major in 0u32..100, minor in 0u32..100, patch in 0u32..100) {
            let version = EngineVersion::new(major, minor, patch);
            prop_assert_eq!(EngineVersion::parse(&version.to_string()), Some(version));
        }

        #[test]
        fn test_parse_never_panics(input in ".{0,32}") {
            let _ = EngineVersion::parse(&input);
        }
    }
}
