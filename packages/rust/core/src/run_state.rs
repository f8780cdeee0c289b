//! Per-stage run-state ledger persisted as `run_state.json`.
//!
//! The ledger records what happened to each stage the last time it ran:
//! status, run id, timestamps, configuration fingerprint and checksums of the
//! produced outputs. The orchestrator consults it to tell an interrupted
//! ingestion apart from a complete one.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use imgflow_shared::{PipelineError, Result, StageName};

/// Current ledger schema version.
pub const RUN_STATE_VERSION: u32 = 1;

/// Outcome of the most recent attempt at a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StageStatus {
    /// The previous attempt never reached a clean end.
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Running | Self::Failed)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        })
    }
}

/// Checksum of one produced output (a file, or a directory tree).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub files: usize,
}

impl OutputRecord {
    /// Hash a file, or every file under a directory in sorted path order.
    /// Returns `None` if nothing exists at `path`.
    pub fn capture(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        let mut files = 0usize;

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let p = e.path().unwrap_or(path).to_path_buf();
                PipelineError::io(p, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(path) {
                hasher.update(rel.to_string_lossy().as_bytes());
            }
            bytes += hash_file(entry.path(), &mut hasher)?;
            files += 1;
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            sha256: format!("{:x}", hasher.finalize()),
            bytes,
            files,
        }))
    }
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> Result<u64> {
    let mut file = std::fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| PipelineError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// Ledger entry for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub run_id: String,
    pub fingerprint: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// The whole ledger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageRecord>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: RUN_STATE_VERSION,
            stages: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Ledger file handle. Every mutation is written through immediately.
#[derive(Debug)]
pub struct RunStateStore {
    path: PathBuf,
    state: RunState,
}

impl RunStateStore {
    /// Open the ledger. A missing file starts empty; an unreadable or
    /// corrupt one is logged and replaced by an empty ledger.
    pub fn open(path: &Path) -> Result<Self> {
        let state = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<RunState>(&content) {
                Ok(state) if state.schema_version == RUN_STATE_VERSION => state,
                Ok(state) => {
                    warn!(
                        path = %path.display(),
                        version = state.schema_version,
                        "unsupported run-state version, starting fresh"
                    );
                    RunState::default()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt run-state ledger, starting fresh");
                    RunState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RunState::default(),
            Err(e) => return Err(PipelineError::io(path, e)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn record(&self, stage: StageName) -> Option<&StageRecord> {
        self.state.stages.get(&stage)
    }

    /// Record that `stage` has started.
    pub fn mark_running(&mut self, stage: StageName, run_id: &str, fingerprint: &str) -> Result<()> {
        self.state.stages.insert(
            stage,
            StageRecord {
                status: StageStatus::Running,
                run_id: run_id.to_string(),
                fingerprint: fingerprint.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                outputs: Vec::new(),
                error: None,
                error_kind: None,
            },
        );
        self.save()
    }

    /// Record a clean end (`Completed` or `Skipped`) with output checksums.
    pub fn mark_finished(
        &mut self,
        stage: StageName,
        status: StageStatus,
        outputs: Vec<OutputRecord>,
    ) -> Result<()> {
        if let Some(record) = self.state.stages.get_mut(&stage) {
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.outputs = outputs;
        }
        self.save()
    }

    /// Record a failure.
    pub fn mark_failed(&mut self, stage: StageName, error: &PipelineError) -> Result<()> {
        if let Some(record) = self.state.stages.get_mut(&stage) {
            record.status = StageStatus::Failed;
            record.finished_at = Some(Utc::now());
            record.error = Some(error.to_string());
            record.error_kind = Some(error.kind().to_string());
        }
        self.save()
    }

    /// Write the ledger atomically.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(&self.state)
            .map_err(|e| PipelineError::io(&self.path, std::io::Error::other(e)))?;

        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, content).map_err(|e| PipelineError::io(&temp, e))?;
        std::fs::rename(&temp, &self.path).map_err(|e| PipelineError::io(&self.path, e))?;

        debug!(path = %self.path.display(), "run state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir;

    #[test]
    fn missing_ledger_starts_empty() {
        let dir = temp_dir("ledger");
        let store = RunStateStore::open(&dir.join("run_state.json")).unwrap();
        assert!(store.state().stages.is_empty());
    }

    #[test]
    fn transitions_are_persisted() {
        let dir = temp_dir("ledger");
        let path = dir.join("run_state.json");
        let output = dir.join("model.json");
        std::fs::write(&output, b"{}").unwrap();

        let mut store = RunStateStore::open(&path).unwrap();
        store.mark_running(StageName::BasePrep, "run-1", "abc").unwrap();
        assert_eq!(
            RunStateStore::open(&path).unwrap().record(StageName::BasePrep).unwrap().status,
            StageStatus::Running
        );

        let captured = OutputRecord::capture(&output).unwrap().unwrap();
        store
            .mark_finished(StageName::BasePrep, StageStatus::Completed, vec![captured])
            .unwrap();

        let reopened = RunStateStore::open(&path).unwrap();
        let record = reopened.record(StageName::BasePrep).unwrap();
        assert_eq!(record.status, StageStatus::Completed);
        assert_eq!(record.fingerprint, "abc");
        assert!(record.finished_at.is_some());
        assert_eq!(record.outputs[0].bytes, 2);
        assert_eq!(record.outputs[0].files, 1);
    }

    #[test]
    fn failure_records_error_kind() {
        let dir = temp_dir("ledger");
        let mut store = RunStateStore::open(&dir.join("run_state.json")).unwrap();
        store.mark_running(StageName::Ingestion, "run-1", "f").unwrap();
        store
            .mark_failed(StageName::Ingestion, &PipelineError::Download("HTTP 404".into()))
            .unwrap();

        let record = store.record(StageName::Ingestion).unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.status.is_interrupted());
        assert_eq!(record.error_kind.as_deref(), Some("DownloadError"));
    }

    #[test]
    fn corrupt_ledger_starts_fresh() {
        let dir = temp_dir("ledger");
        let path = dir.join("run_state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = RunStateStore::open(&path).unwrap();
        assert!(store.state().stages.is_empty());
    }

    #[test]
    fn directory_checksum_is_stable_and_content_sensitive() {
        let dir = temp_dir("ledger");
        let data = dir.join("data");
        std::fs::create_dir_all(data.join("cats")).unwrap();
        std::fs::write(data.join("cats/a.png"), b"aaa").unwrap();
        std::fs::write(data.join("b.txt"), b"bb").unwrap();

        let first = OutputRecord::capture(&data).unwrap().unwrap();
        let second = OutputRecord::capture(&data).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.files, 2);
        assert_eq!(first.bytes, 5);

        std::fs::write(data.join("b.txt"), b"bc").unwrap();
        let changed = OutputRecord::capture(&data).unwrap().unwrap();
        assert_ne!(first.sha256, changed.sha256);

        assert!(OutputRecord::capture(&dir.join("absent")).unwrap().is_none());
    }
}
