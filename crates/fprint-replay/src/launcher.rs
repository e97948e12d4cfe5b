//! Replay engine invocation.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult, SKIP_EXIT_CODE};
use crate::fixture::{DeviceDescriptor, TraceFile};

/// Splits `LIBFPRINT_TEST_WRAPPER` into program and arguments.
pub fn split_wrapper(wrapper: &str) -> Vec<String> {
    wrapper.split_whitespace().map(str::to_string).collect()
}

/// Maps a child's exit status: 0 passes, 77 skips, anything else fails.
pub fn interpret_status(what: &str, status: ExitStatus) -> HarnessResult<()> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) if code == i32::from(SKIP_EXIT_CODE) => Err(HarnessError::ChildSkipped {
            what: what.to_string(),
        }),
        code => Err(HarnessError::ChildFailed {
            what: what.to_string(),
            status: status.to_string(),
            code,
        }),
    }
}

/// `<engine> -d <descriptor>... (-i <node>=<ioctl> | -p <syspath>=<pcap>) -- [wrapper...] <program...>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayCommand {
    pub engine: PathBuf,
    pub descriptors: Vec<PathBuf>,
    pub trace: TraceFile,
    pub wrapper: Vec<String>,
    pub program: Vec<String>,
}

impl ReplayCommand {
    pub fn new(engine: &Path, descriptors: &[DeviceDescriptor], trace: TraceFile) -> Self {
        Self {
            engine: engine.to_path_buf(),
            descriptors: descriptors.iter().map(|d| d.path.clone()).collect(),
            trace,
            wrapper: Vec::new(),
            program: Vec::new(),
        }
    }

    pub fn with_wrapper(mut self, wrapper: Option<&str>) -> Self {
        self.wrapper = wrapper.map(split_wrapper).unwrap_or_default();
        self
    }

    pub fn with_program<I, S>(mut self, program: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into_iter().map(Into::into).collect();
        self
    }

    /// Engine arguments, without the engine itself.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for descriptor in &self.descriptors {
            args.push("-d".to_string());
            args.push(descriptor.to_string_lossy().to_string());
        }
        match &self.trace {
            TraceFile::Ioctl {
                path, device_node, ..
            } => {
                args.push("-i".to_string());
                args.push(format!("{}={}", device_node, path.to_string_lossy()));
            }
            TraceFile::Packet { path, syspath } => {
                args.push("-p".to_string());
                args.push(format!("{}={}", syspath, path.to_string_lossy()));
            }
        }
        args.push("--".to_string());
        args.extend(self.wrapper.iter().cloned());
        args.extend(self.program.iter().cloned());
        args
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.engine);
        command
            .args(self.to_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Runs the engine to completion.
    pub async fn run(&self, what: &str) -> HarnessResult<()> {
        info!(what, engine = %self.engine.display(), args = ?self.to_args(), "launching replay");
        let status = self
            .to_command()
            .status()
            .await
            .map_err(|e| HarnessError::io(&self.engine, e))?;
        debug!(what, %status, "replay finished");
        interpret_status(what, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn descriptors() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor {
                path: PathBuf::from("/fx/device"),
                devpath: "/devices/usb1/1-1".to_string(),
            },
            DeviceDescriptor {
                path: PathBuf::from("/fx/device-2"),
                devpath: "/devices/usb1/1-2".to_string(),
            },
        ]
    }

    #[test]
    fn test_ioctl_args() {
        let trace = TraceFile::Ioctl {
            path: PathBuf::from("/fx/capture.ioctl"),
            device_node: "/dev/bus/usb/001/005".to_string(),
            spi: false,
        };
        let cmd = ReplayCommand::new(Path::new("umockdev-run"), &descriptors(), trace)
            .with_program(["python3", "/bin/capture.py", "/tmp/ws/capture.png"]);
        assert_eq!(
            cmd.to_args(),
            vec![
                "-d",
                "/fx/device",
                "-d",
                "/fx/device-2",
                "-i",
                "/dev/bus/usb/001/005=/fx/capture.ioctl",
                "--",
                "python3",
                "/bin/capture.py",
                "/tmp/ws/capture.png",
            ]
        );
    }

    #[test]
    fn test_packet_args_with_wrapper() {
        let trace = TraceFile::Packet {
            path: PathBuf::from("/fx/custom.pcapng"),
            syspath: "/sys/devices/usb1/1-2".to_string(),
        };
        let cmd = ReplayCommand::new(Path::new("umockdev-run"), &[], trace)
            .with_wrapper(Some("valgrind  --error-exitcode=3"))
            .with_program(["fprint-session", "/fx/custom.toml"]);
        assert_eq!(
            cmd.to_args(),
            vec![
                "-p",
                "/sys/devices/usb1/1-2=/fx/custom.pcapng",
                "--",
                "valgrind",
                "--error-exitcode=3",
                "fprint-session",
                "/fx/custom.toml",
            ]
        );
    }

    #[test]
    fn test_empty_wrapper() {
        assert!(split_wrapper("").is_empty());
        assert!(split_wrapper("   ").is_empty());
    }

    #[test]
    fn test_interpret_status() {
        assert!(interpret_status("x", ExitStatus::from_raw(0)).is_ok());

        let skip = interpret_status("x", ExitStatus::from_raw(77 << 8)).unwrap_err();
        assert!(matches!(skip, HarnessError::ChildSkipped { .. }));

        let fail = interpret_status("x", ExitStatus::from_raw(1 << 8)).unwrap_err();
        assert!(matches!(fail, HarnessError::ChildFailed { code: Some(1), .. }));

        // Killed by SIGKILL: no exit code.
        let killed = interpret_status("x", ExitStatus::from_raw(9)).unwrap_err();
        assert!(matches!(killed, HarnessError::ChildFailed { code: None, .. }));
        assert!(!killed.is_skip());
    }

    #[tokio::test]
    async fn test_run_missing_engine_is_io_error() {
        let trace = TraceFile::Ioctl {
            path: PathBuf::from("/fx/capture.ioctl"),
            device_node: "/dev/x".to_string(),
            spi: false,
        };
        let cmd = ReplayCommand::new(Path::new("/nonexistent/umockdev-run"), &[], trace);
        let err = cmd.run("capture").await.unwrap_err();
        assert!(matches!(err, HarnessError::Io { .. }));
    }
}
