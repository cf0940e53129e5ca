//! Declarative step schema
//!
//! Supplied once as configuration by the business-logic side. The engine
//! never inspects payload shapes beyond the field paths listed here: they set
//! the granularity of change tracking and feed completion estimates.

use crate::error::{FlowError, Result};
use crate::flow::paths::FieldPath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// One step of the guided flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step identifier, also the first segment of every field path in it
    pub id: String,
    /// Display title (informational only)
    #[serde(default)]
    pub title: String,
    /// Field paths relative to the step payload (e.g. "materials", "labor.hours")
    #[serde(default)]
    pub fields: Vec<String>,
    /// Subset of `fields` that must be non-empty for the step to count as complete
    #[serde(default)]
    pub required: Vec<String>,
}

/// Ordered list of steps; step number = position + 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSchema {
    pub steps: Vec<StepDefinition>,
}

impl StepSchema {
    /// Build and validate a schema
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self> {
        let schema = Self { steps };
        schema.validate()?;
        Ok(schema)
    }

    /// Load a schema from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read step schema '{}': {}", path.display(), e))?;
        let schema: StepSchema = serde_json::from_str(&raw)?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(FlowError::validation("step schema has no steps"));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            let root = FieldPath::step(&step.id)?;
            if !seen.insert(step.id.as_str()) {
                return Err(FlowError::validation(format!("duplicate step id '{}'", step.id)));
            }
            for field in &step.fields {
                FieldPath::parse(&format!("{}.{}", root, field))?;
            }
            if let Some(missing) = step.required.iter().find(|r| !step.fields.contains(r)) {
                return Err(FlowError::validation(format!(
                    "required field '{}' is not declared in step '{}'",
                    missing, step.id
                )));
            }
        }
        Ok(())
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// 1-based position of a step
    pub fn position(&self, step_id: &str) -> Option<u32> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .map(|idx| idx as u32 + 1)
    }

    /// Field paths a patch touches, at the granularity the schema declares
    ///
    /// Rejects unknown steps and malformed keys before anything is persisted.
    pub fn changed_fields(&self, step_id: &str, patch: &Map<String, Value>) -> Result<BTreeSet<FieldPath>> {
        let step = self
            .step(step_id)
            .ok_or_else(|| FlowError::validation(format!("unknown step id '{}'", step_id)))?;
        if patch.is_empty() {
            return Err(FlowError::validation("patch is empty"));
        }
        let declared = step.declared_paths()?;
        let leaves = crate::flow::paths::patch_leaves(step_id, patch)?;
        Ok(leaves
            .into_iter()
            .map(|leaf| {
                declared
                    .iter()
                    .filter(|d| d.is_prefix_of(&leaf))
                    .max_by_key(|d| d.as_str().len())
                    .cloned()
                    .unwrap_or(leaf)
            })
            .collect())
    }
}

impl StepDefinition {
    /// Declared field paths, prefixed with the step id
    pub fn declared_paths(&self) -> Result<Vec<FieldPath>> {
        let root = FieldPath::step(&self.id)?;
        self.fields.iter().map(|f| FieldPath::parse(&format!("{}.{}", root, f))).collect()
    }
}

impl Default for StepSchema {
    /// Built-in estimate flow used when no schema file is configured
    fn default() -> Self {
        fn step(id: &str, title: &str, fields: &[&str], required: &[&str]) -> StepDefinition {
            StepDefinition {
                id: id.to_string(),
                title: title.to_string(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
                required: required.iter().map(|r| r.to_string()).collect(),
            }
        }

        Self {
            steps: vec![
                step("client", "Client", &["name", "email", "phone", "address"], &["name", "address"]),
                step("scope", "Scope of work", &["description", "tradeType", "squareFootage"], &["description", "tradeType"]),
                step("duration", "Schedule", &["startDate", "endDate", "crewSize"], &["startDate", "endDate"]),
                step("expenses", "Expenses", &["materials", "labor", "equipment", "overhead"], &["materials", "labor"]),
                step("pricing", "Pricing", &["markup", "margin", "total"], &["markup", "total"]),
                step("review", "Review", &["notes", "approved"], &["approved"]),
            ],
        }
    }
}
