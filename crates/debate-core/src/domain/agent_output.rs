//! Structured agent output and its validation.
//!
//! Executors return raw text. The structured part is a JSON object inside a
//! fenced block tagged `json:structured_output` (preferred) or `json`; a
//! bare JSON object is accepted when the whole reply is one. Anything that
//! does not match the schema is a [`OutputError`], never a partial result.

use serde::Deserialize;

use debate_state::{AgentRunId, AgreementRef, FindingId, FindingRecord, Severity};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OutputError {
    #[error("agent output contains no structured JSON block")]
    MissingBlock,

    #[error("structured output is not valid: {0}")]
    Malformed(String),

    #[error("structured output field {field} is invalid: {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputFinding {
    pub category: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub description: String,
    #[serde(default)]
    pub agreement_refs: Vec<AgreementRef>,
}

/// The validated, structured part of an agent reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentOutput {
    pub findings: Vec<OutputFinding>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub explicit_agreements: Vec<AgreementRef>,
}

const FENCES: [&str; 2] = ["```json:structured_output", "```json"];

fn fenced_block<'a>(raw: &'a str, fence: &str) -> Option<&'a str> {
    let start = raw.find(fence)? + fence.len();
    let rest = &raw[start..];
    // The tag must end the fence line.
    let body_start = rest.find('\n')?;
    if !rest[..body_start].trim().is_empty() {
        return None;
    }
    let body = &rest[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn extract_block(raw: &str) -> Option<&str> {
    FENCES
        .iter()
        .find_map(|fence| fenced_block(raw, fence))
        .or_else(|| {
            let trimmed = raw.trim();
            (trimmed.starts_with('{') && trimmed.ends_with('}')).then_some(trimmed)
        })
}

fn invalid(field: impl Into<String>, reason: &str) -> OutputError {
    OutputError::InvalidField {
        field: field.into(),
        reason: reason.to_string(),
    }
}

impl AgentOutput {
    /// Parse and validate an executor reply.
    pub fn parse(raw: &str) -> Result<Self, OutputError> {
        let block = extract_block(raw).ok_or(OutputError::MissingBlock)?;
        let output: AgentOutput =
            serde_json::from_str(block).map_err(|e| OutputError::Malformed(e.to_string()))?;
        output.validate()?;
        Ok(output.normalized())
    }

    fn validate(&self) -> Result<(), OutputError> {
        for (i, f) in self.findings.iter().enumerate() {
            if f.category.trim().is_empty() {
                return Err(invalid(format!("findings[{i}].category"), "must not be empty"));
            }
            if f.description.trim().is_empty() {
                return Err(invalid(
                    format!("findings[{i}].description"),
                    "must not be empty",
                ));
            }
            if f.file_path.as_deref().is_some_and(|p| p.trim().is_empty()) {
                return Err(invalid(
                    format!("findings[{i}].file_path"),
                    "must be omitted or non-empty",
                ));
            }
            if f.agreement_refs.iter().any(|r| r.topic.trim().is_empty()) {
                return Err(invalid(
                    format!("findings[{i}].agreement_refs"),
                    "topics must not be empty",
                ));
            }
        }
        if self
            .explicit_agreements
            .iter()
            .any(|r| r.topic.trim().is_empty())
        {
            return Err(invalid("explicit_agreements", "topics must not be empty"));
        }
        Ok(())
    }

    fn normalized(mut self) -> Self {
        for f in &mut self.findings {
            f.category = f.category.trim().to_string();
            f.description = f.description.trim().to_string();
            f.file_path = f.file_path.as_ref().map(|p| p.trim().to_string());
        }
        self.recommendations = self
            .recommendations
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        self
    }

    /// Findings as records owned by `run_id`.
    pub fn finding_records(&self, run_id: &AgentRunId) -> Vec<FindingRecord> {
        self.findings
            .iter()
            .map(|f| FindingRecord {
                id: FindingId::new(),
                run_id: run_id.clone(),
                category: f.category.clone(),
                file_path: f.file_path.clone(),
                severity: f.severity,
                description: f.description.clone(),
                agreement_refs: f.agreement_refs.clone(),
            })
            .collect()
    }
}
