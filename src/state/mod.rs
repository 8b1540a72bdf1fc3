//! Per-(part, step) persisted state: what the Sequencer compares against
//! when deciding the next action, and what the Executor writes on success.

mod store;

pub use store::StateStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The current schema version written by this crate. Records found on disk
/// with any other version are treated as absent — see `StateStore::load`.
pub const SCHEMA_VERSION: u32 = 1;

/// What a completed step actually produced, tagged by step so one file
/// format covers all five.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum StepOutcome {
    Pull {
        assets: Vec<crate::source::PulledAsset>,
        stage_packages_manifest: Vec<String>,
    },
    Overlay {
        hash: String,
        manifest: Vec<String>,
    },
    Build {
        package_manifest: Vec<String>,
        project_vars_written: BTreeMap<String, String>,
    },
    Stage {
        files: Vec<String>,
        dirs: Vec<String>,
        overlay_files_annotation: Vec<String>,
    },
    Prime {
        files: Vec<String>,
        dirs: Vec<String>,
        primed_stage_packages: Vec<String>,
    },
}

impl StepOutcome {
    pub fn step(&self) -> crate::step::Step {
        match self {
            StepOutcome::Pull { .. } => crate::step::Step::Pull,
            StepOutcome::Overlay { .. } => crate::step::Step::Overlay,
            StepOutcome::Build { .. } => crate::step::Step::Build,
            StepOutcome::Stage { .. } => crate::step::Step::Stage,
            StepOutcome::Prime { .. } => crate::step::Step::Prime,
        }
    }
}

/// A full persisted record for one (part, step): the fingerprint the
/// Sequencer compares against, plus the outcome the Executor produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    pub schema_version: u32,
    pub fingerprint: String,
    pub outcome: StepOutcome,
    /// When this record was written. Used only for diagnostics, never for
    /// ordering decisions — fingerprints drive those.
    pub written_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(fingerprint: impl Into<String>, outcome: StepOutcome, written_at: DateTime<Utc>) -> Self {
        StateRecord {
            schema_version: SCHEMA_VERSION,
            fingerprint: fingerprint.into(),
            outcome,
            written_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_step_matches_variant() {
        let outcome = StepOutcome::Build {
            package_manifest: vec![],
            project_vars_written: BTreeMap::new(),
        };
        assert_eq!(outcome.step(), crate::step::Step::Build);
    }

    #[test]
    fn record_serializes_schema_version_field() {
        let record = StateRecord::new(
            "deadbeef",
            StepOutcome::Pull {
                assets: vec![],
                stage_packages_manifest: vec![],
            },
            Utc::now(),
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"schema_version\":1"));
    }
}
