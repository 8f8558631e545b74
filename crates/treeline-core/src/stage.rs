//! Stage identifiers and per-(sub-)stage metadata.

use serde::{Deserialize, Serialize};

/// The four experimental stages, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageIdentifier {
    Stage1,
    Stage2,
    Stage3,
    Stage4,
}

impl StageIdentifier {
    pub const ORDERED: [StageIdentifier; 4] = [
        StageIdentifier::Stage1,
        StageIdentifier::Stage2,
        StageIdentifier::Stage3,
        StageIdentifier::Stage4,
    ];

    pub fn number(self) -> u32 {
        match self {
            StageIdentifier::Stage1 => 1,
            StageIdentifier::Stage2 => 2,
            StageIdentifier::Stage3 => 3,
            StageIdentifier::Stage4 => 4,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            StageIdentifier::Stage1 => "initial_implementation",
            StageIdentifier::Stage2 => "baseline_tuning",
            StageIdentifier::Stage3 => "creative_research",
            StageIdentifier::Stage4 => "ablation_studies",
        }
    }

    /// The canonical stage name used everywhere: `"<n>_<slug>"`.
    pub fn prefixed_name(self) -> String {
        format!("{}_{}", self.number(), self.slug())
    }

    pub fn from_prefixed_name(name: &str) -> Option<StageIdentifier> {
        Self::ORDERED
            .into_iter()
            .find(|id| id.prefixed_name() == name)
    }

    pub fn next(self) -> Option<StageIdentifier> {
        let idx = Self::ORDERED.iter().position(|id| *id == self)?;
        Self::ORDERED.get(idx + 1).copied()
    }
}

impl std::fmt::Display for StageIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefixed_name())
    }
}

/// Metadata for one sub-stage: the identifier of its main stage, the goals
/// text handed to workers, and the iteration/draft budgets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageMeta {
    pub identifier: StageIdentifier,
    pub goals: String,
    pub max_iterations: usize,
    pub num_drafts: usize,
}

impl StageMeta {
    pub fn number(&self) -> u32 {
        self.identifier.number()
    }

    pub fn slug(&self) -> &'static str {
        self.identifier.slug()
    }

    pub fn name(&self) -> String {
        self.identifier.prefixed_name()
    }
}

/// The research idea driving the run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDescription {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub short_hypothesis: String,
    pub code: Option<String>,
    pub experiments: Vec<String>,
    pub risk_factors_and_limitations: Vec<String>,
}

impl TaskDescription {
    /// Render the idea as the preamble for worker prompts.
    pub fn render(&self) -> String {
        let mut out = String::from(
            "You are an ambitious AI researcher who is looking to publish a paper that will \
             contribute significantly to the field.\n\
             You have an idea and you want to conduct creative experiments to gain scientific \
             insights.\nYour research idea:\n\n",
        );
        out.push_str(&format!("Title:\n{}\n", self.title));
        out.push_str(&format!("Abstract:\n{}\n", self.abstract_text));
        out.push_str(&format!("Short Hypothesis:\n{}\n", self.short_hypothesis));
        if let Some(code) = &self.code {
            out.push_str(&format!("Code To Use:\n{}\n", code));
        }
        out
    }
}
