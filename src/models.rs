use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single evaluation unit: one prompt with its frozen reference output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Opaque identifier, assigned during test-set authoring
    #[serde(default)]
    pub id: String,
    /// The prompt submitted to the candidate model
    pub input_text: String,
    /// Frozen reference output, if a baseline has been generated
    #[serde(default)]
    pub baseline_output: Option<String>,
    /// Output produced by the candidate configuration during this run
    #[serde(default)]
    pub current_output: Option<String>,
}

/// An ordered set of test cases sharing a system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSet {
    pub name: String,
    /// System prompt the baseline outputs were generated with
    #[serde(default)]
    pub system_prompt: String,
    /// Model the baseline was frozen against, if recorded
    #[serde(default)]
    pub baseline_model: Option<String>,
    pub cases: Vec<TestCase>,
}

impl TestSet {
    /// Load a test set from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read test set file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse test set: {}", path.display()))
    }
}

/// Comparative judgment of a candidate output against the baseline.
///
/// Parsed from the grading model's `{-2, -1, 0, +1, +2}` scale. Text that
/// does not match the scale is carried through as `Invalid` rather than
/// rejected, so a sloppy grader response never sinks the whole case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    MuchWorse,
    Worse,
    Same,
    Better,
    MuchBetter,
    Invalid(String),
}

impl Grade {
    /// Normalize raw grade text from the grading model.
    ///
    /// Bare `1` and `2` are treated as `+1` and `+2`; interior spaces are
    /// dropped so `+ 1` still parses.
    pub fn parse(raw: &str) -> Grade {
        let normalized: String = raw.trim().replace(' ', "");
        match normalized.as_str() {
            "-2" => Grade::MuchWorse,
            "-1" => Grade::Worse,
            "0" => Grade::Same,
            "+1" | "1" => Grade::Better,
            "+2" | "2" => Grade::MuchBetter,
            _ => {
                tracing::warn!(grade = raw, "unexpected grade format");
                Grade::Invalid(normalized)
            }
        }
    }

    /// Numeric value on the comparative scale, or `None` for invalid grades.
    /// Used when summing grades into the report's aggregate.
    pub fn numeric(&self) -> Option<i64> {
        match self {
            Grade::MuchWorse => Some(-2),
            Grade::Worse => Some(-1),
            Grade::Same => Some(0),
            Grade::Better => Some(1),
            Grade::MuchBetter => Some(2),
            Grade::Invalid(_) => None,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grade::MuchWorse => write!(f, "much worse"),
            Grade::Worse => write!(f, "worse"),
            Grade::Same => write!(f, "same"),
            Grade::Better => write!(f, "better"),
            Grade::MuchBetter => write!(f, "much better"),
            Grade::Invalid(raw) => write!(f, "{raw} (invalid)"),
        }
    }
}

/// One row of evaluation output. Immutable once constructed: the analyzer
/// builds it only after both embeddings and the grade are available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Prompt echoed from the source case
    pub input_text: String,
    /// Frozen reference output
    pub baseline_output: String,
    /// Output produced by the candidate configuration
    pub current_output: String,
    /// Cosine similarity between baseline and candidate embeddings
    pub similarity_score: f64,
    /// Comparative judgment from the grading model
    pub llm_grade: Grade,
    /// Free-text rationale accompanying the grade
    pub llm_feedback: String,
    /// Fixed notes about the comparison method
    pub key_changes: Vec<String>,
}
