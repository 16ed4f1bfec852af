use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: String,
    pub description: String,
    pub outcome: Outcome,
}

/// Pass/fail record of every executed step plus free-form notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub scenario: String,
    pub steps: Vec<StepRecord>,
    pub notes: Vec<String>,
}

impl Report {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, step: &'static str, description: String, outcome: Outcome) {
        self.steps.push(StepRecord {
            index: self.steps.len(),
            step: step.to_string(),
            description,
            outcome,
        });
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn passed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == Outcome::Passed)
            .count()
    }

    pub fn failed(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| matches!(s.outcome, Outcome::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_none()
    }

    pub fn summary(&self) -> String {
        match self.failed() {
            None => format!("{}: {} steps passed", self.scenario, self.passed()),
            Some(step) => format!(
                "{}: {} steps passed, step {} ({}) failed",
                self.scenario,
                self.passed(),
                step.index,
                step.description
            ),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            match &step.outcome {
                Outcome::Passed => writeln!(f, "[ok]   {:>3} {}", step.index, step.description)?,
                Outcome::Failed(e) => {
                    writeln!(f, "[FAIL] {:>3} {}: {}", step.index, step.description, e)?
                }
            }
        }
        for note in &self.notes {
            writeln!(f, "note: {}", note)?;
        }
        write!(f, "{}", self.summary())
    }
}
