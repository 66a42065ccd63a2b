use std::collections::BTreeMap;
use std::sync::Mutex;

use ingest_loop::config::EntityConfig;
use ingest_loop::pipeline::{DateWindow, EntityReport, Pipeline, PipelineError};
use ingest_loop::{ExtractionOutcome, SaveOutcome, StopReason};

#[derive(Clone, Debug)]
pub enum Scripted {
    Report(EntityReport),
    Integrity(String),
    Fail(String),
}

pub fn complete(records: u64) -> EntityReport {
    EntityReport {
        extraction: ExtractionOutcome {
            fetched: records,
            unique: records,
            stop_reason: None,
        },
        save: SaveOutcome {
            persisted: records,
            ..SaveOutcome::default()
        },
    }
}

pub fn stopped(records: u64, reason: StopReason) -> EntityReport {
    let mut report = complete(records);
    report.extraction.stop_reason = Some(reason);
    report
}

/// Answers per entity; unknown entities complete with 10 records.
#[derive(Default)]
pub struct ScriptedPipeline {
    responses: BTreeMap<String, Scripted>,
    calls: Mutex<Vec<(String, DateWindow)>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity: &str, response: Scripted) -> Self {
        self.responses.insert(entity.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn windows(&self) -> Vec<DateWindow> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, window)| *window)
            .collect()
    }
}

impl Pipeline for ScriptedPipeline {
    fn run_entity(
        &self,
        entity: &EntityConfig,
        window: DateWindow,
    ) -> Result<EntityReport, PipelineError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((entity.name.clone(), window));
        match self.responses.get(&entity.name) {
            None => Ok(complete(10)),
            Some(Scripted::Report(report)) => Ok(*report),
            Some(Scripted::Integrity(message)) => Err(PipelineError::Integrity(message.clone())),
            Some(Scripted::Fail(message)) => Err(PipelineError::Entity {
                entity: entity.name.clone(),
                message: message.clone(),
            }),
        }
    }
}
