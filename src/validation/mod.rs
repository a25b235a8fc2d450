//! Validator - judges worker output against fake-success detectors.
//!
//! # Verdict rules
//! - `Rejected`: the attempt errored, the output is empty, a denylisted
//!   signature is present, or a claimed file path does not exist
//! - `Revise`: fewer than `min_evidence` concrete evidence items
//!   (test counts, line references, exit codes, shell transcripts,
//!   code blocks, verified paths)
//! - `Accepted`: otherwise
//!
//! # Invariants
//! - Validation is a function of the `ExecutionResult`, the injected
//!   `FsChecker` and the timestamp; it holds no state between calls

mod fs;
mod patterns;

pub use fs::{FsChecker, StaticFs, WorkspaceFs};
pub use patterns::{count_text_evidence, extract_paths, find_signatures, ClaimKind, PathClaim};

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::{ExecutionResult, TIMEOUT_ERROR};
use crate::task::TaskId;

/// Violation reported for an attempt that produced nothing.
pub const EMPTY_OUTPUT: &str = "empty output";

/// Violation reported for a worker error other than a timeout.
pub const WORKER_ERROR: &str = "worker error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    Rejected,
    Revise,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::Rejected => "Rejected",
            Verdict::Revise => "Revise",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Accepted" => Ok(Verdict::Accepted),
            "Rejected" => Ok(Verdict::Rejected),
            "Revise" => Ok(Verdict::Revise),
            other => Err(format!("unknown verdict: {}", other)),
        }
    }
}

/// The validator's judgment on one execution attempt. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub task_id: TaskId,
    pub worker_id: String,
    pub verdict: Verdict,
    pub feedback: String,
    pub detected_violations: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

#[derive(Clone)]
pub struct Validator {
    fs: Arc<dyn FsChecker>,
    min_evidence: usize,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("min_evidence", &self.min_evidence)
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(fs: Arc<dyn FsChecker>, min_evidence: usize) -> Self {
        Self { fs, min_evidence }
    }

    pub fn min_evidence(&self) -> usize {
        self.min_evidence
    }

    pub fn validate(&self, result: &ExecutionResult) -> ValidationVerdict {
        self.validate_at(result, Utc::now())
    }

    /// Validate with an explicit timestamp.
    pub fn validate_at(&self, result: &ExecutionResult, timestamp: DateTime<Utc>) -> ValidationVerdict {
        let mut violations = BTreeSet::new();
        let mut problems: Vec<String> = Vec::new();

        if let Some(error) = &result.error {
            if result.is_timeout() {
                violations.insert(TIMEOUT_ERROR.to_string());
                problems.push("attempt timed out".to_string());
            } else {
                violations.insert(WORKER_ERROR.to_string());
                problems.push(format!("worker failed: {}", error));
            }
        }

        let output = result.output.trim();
        if output.is_empty() {
            if result.error.is_none() {
                violations.insert(EMPTY_OUTPUT.to_string());
                problems.push("worker produced no output".to_string());
            }
        } else {
            let found = find_signatures(output);
            if !found.is_empty() {
                problems.push(format!("fake-success markers: {}", found.join(", ")));
                violations.extend(found.into_iter().map(str::to_string));
            }
        }

        let mut evidence = count_text_evidence(output);
        let mut missing = Vec::new();
        for claim in extract_paths(output) {
            if self.fs.exists(Path::new(&claim.path)) {
                evidence += 1;
                if claim.line.is_some() {
                    evidence += 1;
                }
            } else if claim.kind == ClaimKind::Firm {
                violations.insert(format!("missing file: {}", claim.path));
                missing.push(claim.path);
            }
        }
        if !missing.is_empty() {
            problems.push(format!("claimed files do not exist: {}", missing.join(", ")));
        }

        let (verdict, feedback) = if !problems.is_empty() {
            (Verdict::Rejected, format!("Rejected: {}", problems.join("; ")))
        } else if evidence < self.min_evidence {
            (
                Verdict::Revise,
                format!(
                    "Revise: found {} evidence item(s), need {}. Include command output, test counts, exit codes or file:line references",
                    evidence, self.min_evidence
                ),
            )
        } else {
            (
                Verdict::Accepted,
                format!("Accepted: {} evidence item(s)", evidence),
            )
        };

        tracing::debug!(
            task_id = %result.task_id,
            worker_id = %result.worker_id,
            verdict = %verdict,
            evidence,
            "Validated attempt"
        );

        ValidationVerdict {
            task_id: result.task_id,
            worker_id: result.worker_id.clone(),
            verdict,
            feedback,
            detected_violations: violations,
            timestamp,
        }
    }
}
