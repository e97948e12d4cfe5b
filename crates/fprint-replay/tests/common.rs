//! Common fixtures for the end-to-end harness tests: a fake replay engine,
//! a fake capture program and fixture directories.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fprint_replay::image_cmp::write_png;
use fprint_replay::HarnessConfig;
use png::ColorType;
use tempfile::TempDir;

pub const DESCRIPTOR: &str = "P: /devices/pci0000:00/0000:00:14.0/usb1/1-9\nN: bus/usb/001/005\n";
pub const USB_IOCTL: &str = "@DEV /dev/bus/usb/001/005\nUSBDEVFS_CONTROL 0 40 0C 0000 0000 0\n";

/// A 4x2 greyscale image with a gradient.
pub const GREY: [u8; 8] = [0, 30, 60, 90, 120, 150, 180, 210];

pub fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn write_grey_png(path: &Path, values: &[u8]) {
    write_png(path, 4, 2, ColorType::Grayscale, values).unwrap();
}

/// Scratch tree holding the fake tools, the errors root and one fixture.
pub struct TestEnv {
    root: TempDir,
}

impl TestEnv {
    /// Sets up an engine that reports `version` and otherwise execs whatever
    /// follows `--`, logging its arguments to `engine-args`.
    pub fn new(version: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let env = Self { root };
        fs::create_dir(env.tools()).unwrap();
        fs::create_dir(env.fixture()).unwrap();

        let log = env.engine_log();
        write_executable(
            &env.engine(),
            &format!(
                "#!/bin/sh\n\
                 if [ \"$1\" = \"--version\" ]; then\n  echo \"{version}\"\n  exit 0\nfi\n\
                 printf '%s\\n' \"$@\" > \"{log}\"\n\
                 while [ $# -gt 0 ]; do\n  \
                   if [ \"$1\" = \"--\" ]; then\n    shift\n    exec \"$@\"\n  fi\n  \
                   shift\n\
                 done\n\
                 exit 2\n",
                log = log.display()
            ),
        );
        env
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn tools(&self) -> PathBuf {
        self.path().join("tools")
    }

    pub fn engine(&self) -> PathBuf {
        self.tools().join("umockdev-run")
    }

    pub fn engine_log(&self) -> PathBuf {
        self.path().join("engine-args")
    }

    /// Arguments of the last replay, one per line.
    pub fn engine_args(&self) -> Vec<String> {
        fs::read_to_string(self.engine_log())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn fixture(&self) -> PathBuf {
        self.path().join("elan-0c4b")
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.path().join("errors")
    }

    pub fn capture_script(&self) -> PathBuf {
        self.tools().join("capture.sh")
    }

    pub fn add_fixture_file(&self, name: &str, contents: &str) {
        fs::write(self.fixture().join(name), contents).unwrap();
    }

    /// The capture program copies `image` to the requested output.
    pub fn capture_produces(&self, image: &[u8]) {
        let produced = self.tools().join("produced.png");
        write_grey_png(&produced, image);
        fs::write(
            self.capture_script(),
            format!("cp \"{}\" \"$1\"\n", produced.display()),
        )
        .unwrap();
    }

    /// The capture program runs `body` instead.
    pub fn capture_runs(&self, body: &str) {
        fs::write(self.capture_script(), body).unwrap();
    }

    pub fn reference(&self, image: &[u8]) {
        write_grey_png(&self.fixture().join("capture.png"), image);
    }

    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            engine: self.engine().to_string_lossy().into_owned(),
            interpreter: "sh".to_string(),
            capture_script: Some(self.capture_script()),
            errors_dir: self.errors_dir(),
            ci_project_var: "FPRINT_REPLAY_TEST_UNSET_CI_PROJECT".to_string(),
            ..HarnessConfig::default()
        }
    }
}
