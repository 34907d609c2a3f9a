use crate::error::{ErrorKind, ErrorRecord};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    Abandoned,
    NotAttempted,
}

/// Final word on one asset of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub key: String,
    pub status: ResultStatus,
    pub attempts: u32,
    pub bytes_written: u64,
    /// False when an existing local file already satisfied the descriptor.
    pub transferred: bool,
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl FetchResult {
    pub fn not_attempted(key: &str) -> Self {
        Self {
            key: key.to_string(),
            status: ResultStatus::NotAttempted,
            attempts: 0,
            bytes_written: 0,
            transferred: false,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ResultStatus::NotAttempted
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    /// Subset of `succeeded` that needed no transfer.
    pub already_present: usize,
    pub abandoned: usize,
    pub not_attempted: usize,
    /// Subset of `abandoned` that failed size or checksum verification.
    pub integrity_failures: usize,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    AllSucceeded,
    PartialFailure { failed: Vec<String> },
    Cancelled {
        completed: Vec<String>,
        incomplete: Vec<String>,
    },
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllSucceeded => write!(f, "all assets succeeded"),
            Self::PartialFailure { failed } => {
                write!(f, "{} asset(s) failed: {}", failed.len(), failed.join(", "))
            }
            Self::Cancelled {
                completed,
                incomplete,
            } => write!(
                f,
                "cancelled with {} completed and {} incomplete asset(s); incomplete: {}",
                completed.len(),
                incomplete.len(),
                incomplete.join(", ")
            ),
        }
    }
}

/// Per-asset results in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<FetchResult>,
    pub summary: Summary,
    pub cancelled: bool,
    pub finished: bool,
}

impl BatchReport {
    pub fn get(&self, key: &str) -> Option<&FetchResult> {
        self.results.iter().find(|r| r.key == key)
    }

    pub fn outcome(&self) -> BatchOutcome {
        if self.cancelled {
            let (completed, incomplete): (Vec<_>, Vec<_>) = self
                .results
                .iter()
                .partition(|r| r.status == ResultStatus::Succeeded);
            return BatchOutcome::Cancelled {
                completed: completed.into_iter().map(|r| r.key.clone()).collect(),
                incomplete: incomplete.into_iter().map(|r| r.key.clone()).collect(),
            };
        }
        let failed = self
            .results
            .iter()
            .filter(|r| r.status != ResultStatus::Succeeded)
            .map(|r| r.key.clone())
            .collect::<Vec<_>>();
        if failed.is_empty() {
            BatchOutcome::AllSucceeded
        } else {
            BatchOutcome::PartialFailure { failed }
        }
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Collects results as they complete. Keys that never report stay
/// `NotAttempted`.
#[derive(Debug)]
pub struct Aggregator {
    results: Vec<FetchResult>,
    index: HashMap<String, usize>,
    cancelled: bool,
    finished: bool,
}

impl Aggregator {
    pub fn new<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let results = keys
            .into_iter()
            .map(FetchResult::not_attempted)
            .collect::<Vec<_>>();
        let index = results
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();
        Self {
            results,
            index,
            cancelled: false,
            finished: false,
        }
    }

    /// Records a terminal result. Results for unknown keys, results after
    /// the report is frozen, and second results for a key are ignored.
    pub fn record(&mut self, result: FetchResult) -> bool {
        if self.finished || !result.is_terminal() {
            return false;
        }
        let Some(&i) = self.index.get(&result.key) else {
            return false;
        };
        if self.results[i].is_terminal() {
            return false;
        }
        self.results[i] = result;
        true
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn snapshot(&self) -> BatchReport {
        let mut summary = Summary {
            total: self.results.len(),
            ..Summary::default()
        };
        for result in &self.results {
            summary.bytes_written += result.bytes_written;
            match result.status {
                ResultStatus::Succeeded => {
                    summary.succeeded += 1;
                    if !result.transferred {
                        summary.already_present += 1;
                    }
                }
                ResultStatus::Abandoned => {
                    summary.abandoned += 1;
                    if result.error_kind().is_some_and(ErrorKind::is_integrity) {
                        summary.integrity_failures += 1;
                    }
                }
                ResultStatus::NotAttempted => summary.not_attempted += 1,
            }
        }
        BatchReport {
            results: self.results.clone(),
            summary,
            cancelled: self.cancelled,
            finished: self.finished,
        }
    }

    /// Freezes the aggregator and returns the final report.
    pub fn finish(&mut self) -> BatchReport {
        self.finished = true;
        self.snapshot()
    }
}
