//! Batch loader for directories of normalized record files.
//!
//! Every `*.json` file holding a JSON array of objects is one ingest batch.
//! Files are processed in name order; a file that cannot be read or has
//! another structure is reported and skipped without stopping the run.

use crate::error::{Error, Result};
use crate::ingest::{validate, IngestResult, IngestionGateway};
use crate::record::{RawRecord, Record};
use crate::rollup::{RollupEngine, RollupMode, RollupReport};
use crate::storage::Tier;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested {
        result: IngestResult,
        rollup: Option<RollupReport>,
    },
    /// Valid JSON that is not an array of objects
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub files: Vec<FileReport>,
}

impl LoadReport {
    fn results(&self) -> impl Iterator<Item = &IngestResult> {
        self.files.iter().filter_map(|file| match &file.outcome {
            FileOutcome::Ingested { result, .. } => Some(result),
            _ => None,
        })
    }

    pub fn accepted(&self) -> usize {
        self.results().map(|r| r.accepted).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.results().map(|r| r.duplicates).sum()
    }

    pub fn rejected(&self) -> usize {
        self.results().map(|r| r.rejected.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Failed { .. }))
            .count()
    }
}

struct Rollups {
    engine: RollupEngine,
    tiers: Vec<Tier>,
    mode: RollupMode,
}

pub struct BatchLoader {
    gateway: IngestionGateway,
    rollups: Option<Rollups>,
}

impl BatchLoader {
    pub fn new(gateway: IngestionGateway) -> Self {
        Self {
            gateway,
            rollups: None,
        }
    }

    /// Updates `tiers` for the windows touched by each loaded file.
    pub fn with_rollups(mut self, engine: RollupEngine, tiers: Vec<Tier>, mode: RollupMode) -> Self {
        self.rollups = Some(Rollups { engine, tiers, mode });
        self
    }

    pub async fn load_dir(&self, dir: &Path) -> Result<LoadReport> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        info!(dir = %dir.display(), files = paths.len(), "loading directory");

        let mut report = LoadReport::default();
        for path in paths {
            let outcome = self.load_file(&path).await;
            report.files.push(FileReport { path, outcome });
        }
        info!(
            accepted = report.accepted(),
            duplicates = report.duplicates(),
            rejected = report.rejected(),
            skipped = report.skipped(),
            failed = report.failed(),
            "load complete"
        );
        Ok(report)
    }

    async fn load_file(&self, path: &Path) -> FileOutcome {
        let batch = match read_batch(path).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                warn!(path = %path.display(), "skipping file with unsupported structure");
                return FileOutcome::Skipped {
                    reason: "expected a JSON array of objects".into(),
                };
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "could not read file");
                return FileOutcome::Failed { error: e.to_string() };
            }
        };

        let touched: Vec<Record> = batch.iter().filter_map(|raw| validate(raw).ok()).collect();
        let result = match self.gateway.ingest(batch).await {
            Ok(result) => result,
            Err(e) => {
                error!(path = %path.display(), error = %e, "ingest failed");
                return FileOutcome::Failed { error: e.to_string() };
            }
        };
        info!(
            path = %path.display(),
            accepted = result.accepted,
            duplicates = result.duplicates,
            rejected = result.rejected.len(),
            "file ingested"
        );

        let rollup = match &self.rollups {
            Some(rollups) if !touched.is_empty() => {
                match rollups.engine.run(rollups.mode, &rollups.tiers, &touched).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "rollup failed");
                        return FileOutcome::Failed { error: e.to_string() };
                    }
                }
            }
            _ => None,
        };
        FileOutcome::Ingested { result, rollup }
    }
}

/// `Ok(None)` when the file is valid JSON of the wrong shape.
async fn read_batch(path: &Path) -> Result<Option<Vec<RawRecord>>> {
    let bytes = tokio::fs::read(path).await?;
    let value: Value = serde_json::from_slice(&bytes)?;
    let Value::Array(items) = value else {
        return Ok(None);
    };
    if !items.iter().all(Value::is_object) {
        return Ok(None);
    }
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| Error::Serialization(e.to_string())))
        .collect::<Result<Vec<RawRecord>>>()
        .map(Some)
}
