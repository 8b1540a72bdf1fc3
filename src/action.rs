//! The unit of planning output: one decision about one part's one step.

use serde::{Deserialize, Serialize};

use crate::step::Step;

/// What the Executor should do for a given (part, step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// No prior state; run the step fresh.
    Run,
    /// The caller asked for a rerun; the prior state (and everything after
    /// it) is discarded first.
    Rerun,
    /// Prior state exists and the fingerprint differs only in "the upstream
    /// source moved" terms, and the plugin supports an in-place update.
    Update,
    /// Prior state exists, matches the current fingerprint: nothing to do.
    Skip,
    /// Like `Skip`, but the step in question is `Stage` or `Prime` and the
    /// decision was driven by the stage/prime tree already reflecting this
    /// part rather than a fresh fingerprint comparison.
    SkipStaged,
    /// Like `Skip`, but the only reason a rerun would otherwise trigger is
    /// source outdatedness, and the part is covered by `ignore_outdated`.
    SkipOutdated,
}

impl ActionKind {
    /// Whether this action kind leaves the part's state for this step
    /// untouched (no execution work to perform).
    pub fn is_skip(self) -> bool {
        matches!(self, ActionKind::Skip | ActionKind::SkipStaged | ActionKind::SkipOutdated)
    }
}

/// One planned unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub part_name: String,
    pub step: Step,
    pub kind: ActionKind,
    pub properties: Option<serde_json::Value>,
}

impl Action {
    pub fn new(part_name: impl Into<String>, step: Step, kind: ActionKind) -> Self {
        Action {
            part_name: part_name.into(),
            step,
            kind,
            properties: None,
        }
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_variants_are_all_considered_skips() {
        assert!(ActionKind::Skip.is_skip());
        assert!(ActionKind::SkipStaged.is_skip());
        assert!(ActionKind::SkipOutdated.is_skip());
        assert!(!ActionKind::Run.is_skip());
        assert!(!ActionKind::Rerun.is_skip());
        assert!(!ActionKind::Update.is_skip());
    }
}
