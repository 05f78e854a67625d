//! Heuristic complexity triage.
//!
//! Three signals in `[0, 1]` (higher means more complex) are blended:
//! keyword score (0.4), scope score (0.3) and a neutral history prior (0.3).
//! The blend maps to a tier: `<= 0.3` trivial, `>= 0.7` complex, otherwise
//! standard. Confidence is one minus the spread of the three signals.

use regex::Regex;
use serde::{Deserialize, Serialize};

use debate_state::{Complexity, TriageSnapshot};

use crate::error::{DebateError, Result};

const TRIVIAL_KEYWORDS: &[&str] = &[
    "typo",
    "typos",
    "spelling",
    "rename",
    "comment",
    "documentation",
    "readme",
    "docs",
    "todo",
    "remove unused",
    "delete unused",
    "cleanup",
    "update version",
    "bump version",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "refactor",
    "security",
    "authentication",
    "authorization",
    "database schema",
    "migration",
    "performance",
    "scalability",
    "api redesign",
    "breaking change",
    "major version",
];

const SINGLE_FILE_PATTERNS: &[&str] = &[r"in (\w+\.\w+)", r"file (\w+\.\w+)", r"^fix (\w+)"];

const MULTI_FILE_PATTERNS: &[&str] = &[
    r"across (?:all|the|multiple)",
    r"throughout",
    r"everywhere",
    r"all (\w+) files",
];

const KEYWORD_WEIGHT: f64 = 0.4;
const SCOPE_WEIGHT: f64 = 0.3;
const HISTORY_WEIGHT: f64 = 0.3;
/// No task history is consulted; the prior is neutral.
const HISTORY_PRIOR: f64 = 0.5;

/// Change counts at or above this are treated as multi-file work.
const MULTI_FILE_CHANGES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub complexity: Complexity,
    pub score: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub requires_confirmation: bool,
}

impl TriageVerdict {
    /// Snapshot stored on the task; `shadow` records whether routing ignored it.
    pub fn snapshot(&self, shadow: bool) -> TriageSnapshot {
        TriageSnapshot {
            complexity: self.complexity,
            confidence: self.confidence,
            score: self.score,
            reasons: self.reasons.clone(),
            requires_confirmation: self.requires_confirmation,
            shadow,
        }
    }

    pub fn recommended_action(&self) -> &'static str {
        match self.complexity {
            Complexity::Trivial => "fast_track",
            Complexity::Standard => "debate",
            Complexity::Complex => "extended_debate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriageClassifier {
    single_file: Vec<Regex>,
    multi_file: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| DebateError::Triage(format!("pattern {p:?}: {e}"))))
        .collect()
}

impl TriageClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            single_file: compile(SINGLE_FILE_PATTERNS)?,
            multi_file: compile(MULTI_FILE_PATTERNS)?,
        })
    }

    /// Classify a request. `change_estimate` is an optional count of files
    /// the caller expects to touch.
    pub fn classify(&self, request: &str, change_estimate: Option<u32>) -> TriageVerdict {
        let text = request.to_lowercase();

        let keyword = keyword_score(&text);
        let scope = self.scope_score(&text, change_estimate);
        let score =
            KEYWORD_WEIGHT * keyword + SCOPE_WEIGHT * scope + HISTORY_WEIGHT * HISTORY_PRIOR;

        let mut reasons = Vec::new();
        if keyword < 0.3 {
            reasons.push("trivial_keywords".to_string());
        }
        if keyword > 0.7 {
            reasons.push("complex_keywords".to_string());
        }
        if scope < 0.3 {
            reasons.push("single_file_scope".to_string());
        }
        if scope > 0.7 {
            reasons.push("multi_file_scope".to_string());
        }

        // Compared with a small tolerance: the blend of exact tier boundaries
        // is not exactly representable.
        let complexity = if score <= 0.3 + 1e-9 {
            Complexity::Trivial
        } else if score >= 0.7 - 1e-9 {
            Complexity::Complex
        } else {
            Complexity::Standard
        };

        let signals = [keyword, scope, HISTORY_PRIOR];
        let max = signals.iter().copied().fold(f64::MIN, f64::max);
        let min = signals.iter().copied().fold(f64::MAX, f64::min);
        let confidence = (1.0 - (max - min)).clamp(0.0, 1.0);

        let requires_confirmation = needs_confirmation(complexity, confidence, &text);

        TriageVerdict {
            complexity,
            score,
            confidence,
            reasons,
            requires_confirmation,
        }
    }

    fn scope_score(&self, text: &str, change_estimate: Option<u32>) -> f64 {
        let multi = self.multi_file.iter().any(|re| re.is_match(text))
            || change_estimate.is_some_and(|n| n >= MULTI_FILE_CHANGES);
        let single = self.single_file.iter().any(|re| re.is_match(text))
            || change_estimate.is_some_and(|n| n <= 1);

        if multi {
            0.9
        } else if single {
            0.2
        } else {
            0.5
        }
    }
}

fn needs_confirmation(complexity: Complexity, confidence: f64, text: &str) -> bool {
    confidence < 0.7 || (complexity == Complexity::Trivial && text.contains("security"))
}

fn keyword_score(text: &str) -> f64 {
    let trivial = TRIVIAL_KEYWORDS.iter().filter(|k| text.contains(*k)).count();
    let complex = COMPLEX_KEYWORDS.iter().filter(|k| text.contains(*k)).count();

    match (trivial, complex) {
        (t, 0) if t > 0 => 0.1,
        (0, c) if c > 0 => 0.9,
        (t, c) if c > t => 0.7,
        (t, c) if t > c => 0.3,
        _ => 0.5,
    }
}
