use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{FAILURE_EXIT_CODE, SKIP_EXIT_CODE};
use crate::fixture::TestMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub mode: String,
    pub status: CaseStatus,
    pub duration: Duration,
    pub message: Option<String>,
}

impl CaseResult {
    pub fn new(mode: TestMode, status: CaseStatus, duration: Duration) -> Self {
        Self {
            mode: mode.to_string(),
            status,
            duration,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

/// Outcome of one harness run over a fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub fixture: String,
    pub timestamp: u64,
    pub duration: Duration,
    pub cases: Vec<CaseResult>,
    pub outcome: CaseStatus,
    /// Error chain of a failed or skipped run.
    pub message: Option<String>,
    /// Where the workspace was preserved after a failure.
    pub preserved: Option<PathBuf>,
}

impl RunReport {
    pub fn new(fixture: &str) -> Self {
        Self {
            fixture: fixture.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            duration: Duration::default(),
            cases: vec![],
            outcome: CaseStatus::Pass,
            message: None,
            preserved: None,
        }
    }

    pub fn add_result(&mut self, result: CaseResult) {
        self.cases.push(result);
    }

    pub fn passed(&self) -> usize {
        self.count(CaseStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(CaseStatus::Fail)
    }

    pub fn skipped(&self) -> usize {
        self.count(CaseStatus::Skip)
    }

    fn count(&self, status: CaseStatus) -> usize {
        self.cases.iter().filter(|c| c.status == status).count()
    }

    pub fn is_passing(&self) -> bool {
        self.outcome == CaseStatus::Pass
    }

    /// 0 on pass, 77 on skip, 1 on failure.
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            CaseStatus::Pass => 0,
            CaseStatus::Skip => SKIP_EXIT_CODE,
            CaseStatus::Fail => FAILURE_EXIT_CODE,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
