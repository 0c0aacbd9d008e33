//! Pipeline phases
//!
//! A book job advances through these phases in order; the marker is
//! persisted before a phase produces any work units so a restart can
//! resume where it left off.

use serde::{Deserialize, Serialize};

/// Phases of a book reconstruction job, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// OCR every page and persist its text
    Build,
    /// Extract the table of contents
    Extract,
    /// Compute chapter boundaries from the ToC
    Classify,
    /// Clean each chapter's text
    Polish,
    /// Write the completion marker
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 5] = [Phase::Build, Phase::Extract, Phase::Classify, Phase::Polish, Phase::Finalize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Extract => "extract",
            Phase::Classify => "classify",
            Phase::Polish => "polish",
            Phase::Finalize => "finalize",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Build => Some(Phase::Extract),
            Phase::Extract => Some(Phase::Classify),
            Phase::Classify => Some(Phase::Polish),
            Phase::Polish => Some(Phase::Finalize),
            Phase::Finalize => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Phase::Build),
            "extract" => Ok(Phase::Extract),
            "classify" => Ok(Phase::Classify),
            "polish" => Ok(Phase::Polish),
            "finalize" => Ok(Phase::Finalize),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}
