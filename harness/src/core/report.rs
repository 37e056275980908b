//! Reduction of per-category artifact counts into a verification verdict.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Artifact categories the evaluation is expected to leave in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Datasets,
    Scorers,
    Traces,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Datasets,
        ArtifactKind::Scorers,
        ArtifactKind::Traces,
    ];
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArtifactKind::Datasets => "datasets",
            ArtifactKind::Scorers => "scorers",
            ArtifactKind::Traces => "traces",
        };
        f.write_str(label)
    }
}

/// Count and pass flag for one category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryResult {
    pub found: usize,
    pub pass: bool,
}

impl CategoryResult {
    /// A category passes when at least one artifact was found.
    pub fn from_count(found: usize) -> Self {
        Self {
            found,
            pass: found >= 1,
        }
    }
}

/// Verdict over all three categories, persisted as `verification.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub experiment_id: String,
    pub datasets: CategoryResult,
    pub scorers: CategoryResult,
    pub traces: CategoryResult,
    pub overall_pass: bool,
}

impl VerificationReport {
    pub fn from_counts(experiment_id: &str, datasets: usize, scorers: usize, traces: usize) -> Self {
        let datasets = CategoryResult::from_count(datasets);
        let scorers = CategoryResult::from_count(scorers);
        let traces = CategoryResult::from_count(traces);
        Self {
            experiment_id: experiment_id.to_string(),
            overall_pass: datasets.pass && scorers.pass && traces.pass,
            datasets,
            scorers,
            traces,
        }
    }

    pub fn category(&self, kind: ArtifactKind) -> CategoryResult {
        match kind {
            ArtifactKind::Datasets => self.datasets,
            ArtifactKind::Scorers => self.scorers,
            ArtifactKind::Traces => self.traces,
        }
    }

    /// Categories that did not pass, in reporting order.
    pub fn missing(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .filter(|kind| !self.category(*kind).pass)
            .collect()
    }

    /// One human-readable line per category.
    pub fn render_lines(&self) -> Vec<String> {
        ArtifactKind::ALL
            .into_iter()
            .map(|kind| {
                let result = self.category(kind);
                let (noun, verb) = match kind {
                    ArtifactKind::Datasets => ("Datasets", "created"),
                    ArtifactKind::Scorers => ("Scorers", "registered"),
                    ArtifactKind::Traces => ("Traces", "recorded"),
                };
                if result.pass {
                    format!("[PASS] {noun}: {} {verb}", result.found)
                } else {
                    format!("[FAIL] {noun}: {} {verb} (expected >= 1)", result.found)
                }
            })
            .collect()
    }
}
