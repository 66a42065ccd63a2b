//! Seam to the extraction/save pipeline.
//!
//! The daemon never fetches or maps records itself. It asks a [`Pipeline`] to
//! run one entity over a date window and gets back the extraction and save
//! outcomes, which the classifier turns into a completeness status.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

use crate::clock;
use crate::config::{EntityConfig, PipelineConfig};
use crate::daemon::classify::{Classifier, ExtractionOutcome, SaveOutcome};
use crate::daemon::reconcile::{BackfillError, ReconciliationExecutor};

/// Inclusive calendar window handed to the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateWindow {
    pub start: Date,
    pub end: Date,
}

impl DateWindow {
    pub fn single(date: Date) -> Self {
        Self {
            start: date,
            end: date,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReport {
    pub extraction: ExtractionOutcome,
    pub save: SaveOutcome,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline's own consistency checks tripped.
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("entity {entity} failed: {message}")]
    Entity { entity: String, message: String },
    #[error("failed to launch {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, PipelineError::Integrity(_))
    }
}

pub trait Pipeline: Send + Sync {
    fn run_entity(
        &self,
        entity: &EntityConfig,
        window: DateWindow,
    ) -> Result<EntityReport, PipelineError>;
}

/// Runs an external program per entity and reads an [`EntityReport`] as JSON
/// from its stdout.
#[derive(Clone, Debug)]
pub struct CommandPipeline {
    program: PathBuf,
    args: Vec<String>,
    integrity_marker: String,
}

impl CommandPipeline {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            integrity_marker: PipelineConfig::default().integrity_marker,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Option<Self> {
        let program = config.program.clone()?;
        Some(Self {
            program,
            args: config.args.clone(),
            integrity_marker: config.integrity_marker.clone(),
        })
    }

    pub fn with_integrity_marker(mut self, marker: impl Into<String>) -> Self {
        self.integrity_marker = marker.into();
        self
    }

    fn render_args(&self, entity: &EntityConfig, window: DateWindow) -> Vec<String> {
        let start = clock::format_date(window.start);
        let end = clock::format_date(window.end);
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{entity}", &entity.name)
                    .replace("{start}", &start)
                    .replace("{end}", &end)
            })
            .collect()
    }

    fn failure(&self, entity: &EntityConfig, message: String) -> PipelineError {
        if !self.integrity_marker.is_empty() && message.contains(&self.integrity_marker) {
            PipelineError::Integrity(message)
        } else {
            PipelineError::Entity {
                entity: entity.name.clone(),
                message,
            }
        }
    }
}

impl Pipeline for CommandPipeline {
    fn run_entity(
        &self,
        entity: &EntityConfig,
        window: DateWindow,
    ) -> Result<EntityReport, PipelineError> {
        let args = self.render_args(entity, window);
        tracing::debug!(entity = %entity.name, program = %self.program.display(), ?args, "running pipeline");
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| PipelineError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{} {}: {}", output.status, stderr.trim(), stdout.trim());
            return Err(self.failure(entity, message));
        }

        let report = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default();
        serde_json::from_str(report).map_err(|err| PipelineError::Entity {
            entity: entity.name.clone(),
            message: format!("unreadable pipeline report: {err}"),
        })
    }
}

/// Backfills one date by re-running every entity over that single day.
pub struct PipelineBackfill {
    pipeline: Arc<dyn Pipeline>,
    entities: Vec<EntityConfig>,
    classifier: Classifier,
}

impl PipelineBackfill {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        entities: Vec<EntityConfig>,
        classifier: Classifier,
    ) -> Self {
        Self {
            pipeline,
            entities,
            classifier,
        }
    }
}

impl ReconciliationExecutor for PipelineBackfill {
    fn execute(&self, date: Date, include_optional: bool) -> Result<(), BackfillError> {
        let window = DateWindow::single(date);
        let mut problems = Vec::new();
        for entity in self
            .entities
            .iter()
            .filter(|entity| include_optional || !entity.optional)
        {
            match self.pipeline.run_entity(entity, window) {
                Ok(report) => {
                    let result =
                        self.classifier
                            .classify_entity(&entity.name, &report.extraction, &report.save);
                    if !result.status.is_complete() {
                        problems.push(format!("{}={}", entity.name, result.status));
                    }
                }
                Err(err) => problems.push(format!("{}: {err}", entity.name)),
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BackfillError::new(problems.join(", ")))
        }
    }
}
