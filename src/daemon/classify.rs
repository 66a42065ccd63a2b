//! Completeness classification of one entity's extraction + save.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ClassificationConfig;

/// Why an extraction stopped before exhausting its source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// The upstream API failed.
    UpstreamError,
    PageLimit,
    RecordLimit,
    LoopDetected,
    CircuitBreaker,
    EmptyPage,
}

impl StopReason {
    pub fn code(self) -> &'static str {
        match self {
            StopReason::UpstreamError => "UPSTREAM_ERROR",
            StopReason::PageLimit => "PAGE_LIMIT",
            StopReason::RecordLimit => "RECORD_LIMIT",
            StopReason::LoopDetected => "LOOP_DETECTED",
            StopReason::CircuitBreaker => "CIRCUIT_BREAKER",
            StopReason::EmptyPage => "EMPTY_PAGE",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionOutcome {
    pub fetched: u64,
    /// Distinct records after deduplication; the count the save is held to.
    pub unique: u64,
    pub stop_reason: Option<StopReason>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOutcome {
    pub persisted: u64,
    pub duplicates: u64,
    pub invalid: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtractionStatus {
    Complete,
    IncompleteLimit,
    IncompleteData,
    IncompleteDb,
    ApiError,
    /// Historical catch-all; parsed from old records, never produced.
    LegacyIncomplete,
}

impl ExtractionStatus {
    pub fn code(self) -> &'static str {
        match self {
            ExtractionStatus::Complete => "COMPLETO",
            ExtractionStatus::IncompleteLimit => "INCOMPLETO_LIMITE",
            ExtractionStatus::IncompleteData => "INCOMPLETO_DADOS",
            ExtractionStatus::IncompleteDb => "INCOMPLETO_DB",
            ExtractionStatus::ApiError => "ERRO_API",
            ExtractionStatus::LegacyIncomplete => "INCOMPLETO",
        }
    }

    pub fn is_complete(self) -> bool {
        self == ExtractionStatus::Complete
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
#[error("unknown extraction status {0:?}")]
pub struct UnknownExtractionStatus(String);

impl FromStr for ExtractionStatus {
    type Err = UnknownExtractionStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim().to_ascii_uppercase().as_str() {
            "COMPLETO" => ExtractionStatus::Complete,
            "INCOMPLETO_LIMITE" => ExtractionStatus::IncompleteLimit,
            "INCOMPLETO_DADOS" => ExtractionStatus::IncompleteData,
            "INCOMPLETO_DB" => ExtractionStatus::IncompleteDb,
            "ERRO_API" => ExtractionStatus::ApiError,
            "INCOMPLETO" => ExtractionStatus::LegacyIncomplete,
            _ => return Err(UnknownExtractionStatus(raw.to_string())),
        })
    }
}

/// Machine-readable reason accompanying a status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    Ok,
    Stopped(StopReason),
    InvalidSourceData,
    InvalidTolerated,
    SaveDivergence,
}

impl Reason {
    pub fn code(self) -> &'static str {
        match self {
            Reason::Ok => "OK",
            Reason::Stopped(stop) => stop.code(),
            Reason::InvalidSourceData => "INVALID_SOURCE_DATA",
            Reason::InvalidTolerated => "INVALID_TOLERATED",
            Reason::SaveDivergence => "SAVE_DIVERGENCE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub status: ExtractionStatus,
    pub reason: Reason,
}

impl Classification {
    fn new(status: ExtractionStatus, reason: Reason) -> Self {
        Self { status, reason }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Classifier {
    max_tolerated_invalid: u64,
    max_tolerated_invalid_percent: f64,
    unique_override: BTreeSet<String>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ClassificationConfig) -> Self {
        Self {
            max_tolerated_invalid: config.max_tolerated_invalid,
            max_tolerated_invalid_percent: config.max_tolerated_invalid_percent.max(0.0),
            unique_override: config.unique_override_entities.iter().cloned().collect(),
        }
    }

    /// Let `entity` persist more rows than it extracted without failing.
    pub fn with_unique_override(mut self, entity: impl Into<String>) -> Self {
        self.unique_override.insert(entity.into());
        self
    }

    /// Classify without the per-entity unique-count override.
    pub fn classify(&self, extraction: &ExtractionOutcome, save: &SaveOutcome) -> Classification {
        self.decide(extraction, save, false)
    }

    pub fn classify_entity(
        &self,
        entity: &str,
        extraction: &ExtractionOutcome,
        save: &SaveOutcome,
    ) -> Classification {
        self.decide(extraction, save, self.unique_override.contains(entity))
    }

    fn decide(
        &self,
        extraction: &ExtractionOutcome,
        save: &SaveOutcome,
        unique_override: bool,
    ) -> Classification {
        match extraction.stop_reason {
            Some(StopReason::UpstreamError) => {
                return Classification::new(
                    ExtractionStatus::ApiError,
                    Reason::Stopped(StopReason::UpstreamError),
                );
            }
            Some(stop) => {
                return Classification::new(
                    ExtractionStatus::IncompleteLimit,
                    Reason::Stopped(stop),
                );
            }
            None => {}
        }

        if save.invalid > 0 && !self.invalid_tolerated(save.invalid, extraction.fetched) {
            return Classification::new(ExtractionStatus::IncompleteData, Reason::InvalidSourceData);
        }

        let save_diverged = if unique_override {
            save.persisted < extraction.unique
        } else {
            save.persisted != extraction.unique
        };
        if save_diverged {
            return Classification::new(ExtractionStatus::IncompleteDb, Reason::SaveDivergence);
        }

        if save.invalid > 0 {
            Classification::new(ExtractionStatus::Complete, Reason::InvalidTolerated)
        } else {
            Classification::new(ExtractionStatus::Complete, Reason::Ok)
        }
    }

    fn invalid_tolerated(&self, invalid: u64, fetched: u64) -> bool {
        let percent = invalid as f64 * 100.0 / fetched.max(1) as f64;
        invalid <= self.max_tolerated_invalid && percent <= self.max_tolerated_invalid_percent
    }
}
