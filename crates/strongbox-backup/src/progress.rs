//! Progress reporting for backup and restore operations.
//!
//! The pipeline reports stage transitions and per-batch row counts to a
//! [`ProgressSink`]. Three sinks are provided: [`NoProgress`],
//! [`TracingProgress`] for log output and [`TerminalProgress`] for an
//! interactive progress bar.

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;

/// Stages of an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStage {
    Idle,
    ReadingTables,
    Serializing,
    Packing,
    Encrypting,
    Finalizing,
    Done,
    Failed(String),
}

/// Stages of a restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStage {
    Idle,
    ValidatingMetadata,
    Decrypting,
    Unpacking,
    Deserializing,
    WritingTables,
    Done,
    Failed(String),
}

/// A stage of either pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Export(ExportStage),
    Restore(RestoreStage),
}

impl Stage {
    /// Whether the pipeline has stopped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Export(ExportStage::Done | ExportStage::Failed(_))
                | Stage::Restore(RestoreStage::Done | RestoreStage::Failed(_))
        )
    }

    fn label(&self) -> &'static str {
        match self {
            Stage::Export(stage) => match stage {
                ExportStage::Idle => "Idle",
                ExportStage::ReadingTables => "Reading tables",
                ExportStage::Serializing => "Serializing",
                ExportStage::Packing => "Packing archive",
                ExportStage::Encrypting => "Encrypting",
                ExportStage::Finalizing => "Finalizing",
                ExportStage::Done => "Backup complete",
                ExportStage::Failed(_) => "Backup failed",
            },
            Stage::Restore(stage) => match stage {
                RestoreStage::Idle => "Idle",
                RestoreStage::ValidatingMetadata => "Validating metadata",
                RestoreStage::Decrypting => "Decrypting",
                RestoreStage::Unpacking => "Unpacking archive",
                RestoreStage::Deserializing => "Verifying records",
                RestoreStage::WritingTables => "Writing tables",
                RestoreStage::Done => "Restore complete",
                RestoreStage::Failed(_) => "Restore failed",
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Export(ExportStage::Failed(reason))
            | Stage::Restore(RestoreStage::Failed(reason)) => {
                write!(f, "{}: {}", self.label(), reason)
            }
            _ => f.write_str(self.label()),
        }
    }
}

impl From<ExportStage> for Stage {
    fn from(stage: ExportStage) -> Self {
        Stage::Export(stage)
    }
}

impl From<RestoreStage> for Stage {
    fn from(stage: RestoreStage) -> Self {
        Stage::Restore(stage)
    }
}

/// Receives progress events. Called from the pipeline's worker tasks.
pub trait ProgressSink: Send + Sync {
    fn on_stage(&self, stage: &Stage);

    /// Total rows the operation will process, once known
    fn on_total_rows(&self, _rows: u64) {}

    /// A batch has been exported or restored
    fn on_batch(&self, _table: &str, _batch: u32, _rows: usize) {}
}

/// Discards all events
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_stage(&self, _stage: &Stage) {}
}

/// Logs events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_stage(&self, stage: &Stage) {
        match stage {
            Stage::Export(ExportStage::Failed(_)) | Stage::Restore(RestoreStage::Failed(_)) => {
                tracing::warn!("{}", stage)
            }
            _ => tracing::info!("{}", stage),
        }
    }

    fn on_total_rows(&self, rows: u64) {
        tracing::info!("{} rows to process", rows);
    }

    fn on_batch(&self, table: &str, batch: u32, rows: usize) {
        tracing::debug!(table, batch, rows, "Batch processed");
    }
}

/// Interactive progress bar counting rows
#[derive(Debug, Clone)]
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    /// Drive an existing bar, e.g. one added to a `MultiProgress`
    pub fn with_bar(bar: ProgressBar) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} rows ({percent}%)")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalProgress {
    fn on_stage(&self, stage: &Stage) {
        match stage {
            Stage::Export(ExportStage::Done) | Stage::Restore(RestoreStage::Done) => {
                self.bar.finish_with_message(stage.to_string())
            }
            Stage::Export(ExportStage::Failed(_)) | Stage::Restore(RestoreStage::Failed(_)) => {
                self.bar.abandon_with_message(stage.to_string())
            }
            _ => self.bar.set_message(stage.to_string()),
        }
    }

    fn on_total_rows(&self, rows: u64) {
        self.bar.set_length(rows);
    }

    fn on_batch(&self, _table: &str, _batch: u32, rows: usize) {
        self.bar.inc(rows as u64);
    }
}

/// Forwards events to a sink and mirrors stage changes to the debug log
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn stage(&self, stage: impl Into<Stage>) {
        let stage = stage.into();
        tracing::debug!("Stage: {}", stage);
        self.sink.on_stage(&stage);
    }

    pub(crate) fn total_rows(&self, rows: u64) {
        self.sink.on_total_rows(rows);
    }

    pub(crate) fn batch(&self, table: &str, batch: u32, rows: usize) {
        self.sink.on_batch(table, batch, rows);
    }
}
