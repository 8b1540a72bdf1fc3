//! The fixed five-step lifecycle pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of a part's lifecycle. Ordering is total and fixed — there is no
/// arbitrary DAG of steps, only this pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Pull,
    Overlay,
    Build,
    Stage,
    Prime,
}

impl Step {
    /// All steps in pipeline order.
    pub const ALL: [Step; 5] = [
        Step::Pull,
        Step::Overlay,
        Step::Build,
        Step::Stage,
        Step::Prime,
    ];

    /// Steps from `Pull` through (and including) `self`.
    pub fn up_to(self) -> impl Iterator<Item = Step> {
        Self::ALL.into_iter().filter(move |s| *s <= self)
    }

    /// The step that follows this one, or `None` if this is the last step.
    pub fn next(self) -> Option<Step> {
        Self::ALL.into_iter().find(|s| *s > self)
    }

    /// Whether fingerprints for this step must include the overlay hash.
    /// The overlay hash only matters from `Overlay` onward — `Pull` never
    /// reads it.
    pub fn reads_overlay_hash(self) -> bool {
        self >= Step::Overlay
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Pull => "pull",
            Step::Overlay => "overlay",
            Step::Build => "build",
            Step::Stage => "stage",
            Step::Prime => "prime",
        };
        f.write_str(s)
    }
}
