//! Request decomposition into capability-tagged tasks.
//!
//! A request is split into clauses on sentence boundaries and on sequencing
//! conjunctions ("and", "then", "also"). Each clause is tagged with the
//! capability named by its first intent word. Clauses that name no capability
//! are treated as a continuation of the neighbouring clause rather than a task
//! of their own.
//!
//! Decomposition is a pure function of the request text: the same input always
//! yields the same ids, descriptions, capabilities and priorities.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::capability::{Capability, CapabilitySet};
use super::task::{Task, TaskError, TaskId};

/// Words that bump a clause's priority.
const URGENCY_MARKERS: &[&str] = &["urgent", "urgently", "asap", "critical", "first"];

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\n;]+|[.!?]+(?:\s+|$)").expect("valid sentence regex"))
}

fn conjunction() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i),?\s+(?:and\s+then|and|then|also|after\s+that)\s+")
            .expect("valid conjunction regex")
    })
}

/// A clause before it becomes a task.
#[derive(Debug, Clone)]
struct Clause {
    text: String,
    capabilities: CapabilitySet,
    priority: i32,
}

/// Splits free-text requests into ordered tasks.
#[derive(Debug, Clone, Default)]
pub struct Decomposer;

impl Decomposer {
    pub fn new() -> Self {
        Self
    }

    /// Decompose `request` into tasks stamped with the current time.
    ///
    /// # Errors
    /// `DecomposeError::InvalidRequest` if the request is blank.
    pub fn decompose(&self, request: &str) -> Result<Vec<Task>, DecomposeError> {
        self.decompose_at(request, Utc::now())
    }

    /// Decompose `request` with an explicit creation timestamp.
    pub fn decompose_at(
        &self,
        request: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<Task>, DecomposeError> {
        let trimmed = request.trim();
        if trimmed.is_empty() {
            return Err(DecomposeError::InvalidRequest(
                "request must not be empty".to_string(),
            ));
        }

        let clauses = merge_continuations(split_clauses(trimmed));

        clauses
            .into_iter()
            .enumerate()
            .map(|(position, clause)| {
                Task::new(
                    TaskId::derive(trimmed, position),
                    position,
                    clause.text,
                    clause.capabilities,
                    clause.priority,
                    created_at,
                )
                .map_err(DecomposeError::from)
            })
            .collect()
    }
}

fn split_clauses(request: &str) -> Vec<Clause> {
    sentence_boundary()
        .split(request)
        .flat_map(|sentence| conjunction().split(sentence))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(tag_clause)
        .collect()
}

fn tag_clause(text: &str) -> Clause {
    let mut capabilities = CapabilitySet::new();
    let mut priority = 0;
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let word = word.to_lowercase();
        // Later keyword hits are objects of the intent, not extra requirements.
        if capabilities.is_empty() {
            if let Some(cap) = Capability::from_keyword(&word) {
                capabilities.insert(cap);
            }
        }
        if URGENCY_MARKERS.contains(&word.as_str()) {
            priority = 1;
        }
    }
    Clause {
        text: text.to_string(),
        capabilities,
        priority,
    }
}

/// Fold clauses without capabilities into their neighbour.
///
/// A leading untagged clause is prepended to the first tagged clause; later
/// untagged clauses are appended to the previous one. A request with no
/// tagged clause at all becomes a single task with an empty requirement set.
fn merge_continuations(clauses: Vec<Clause>) -> Vec<Clause> {
    let mut merged: Vec<Clause> = Vec::new();
    let mut leading: Vec<Clause> = Vec::new();

    for clause in clauses {
        if clause.capabilities.is_empty() {
            match merged.last_mut() {
                Some(prev) => {
                    prev.text = format!("{} and {}", prev.text, clause.text);
                    prev.priority = prev.priority.max(clause.priority);
                }
                None => leading.push(clause),
            }
            continue;
        }

        let mut clause = clause;
        if !leading.is_empty() {
            let prefix: Vec<&str> = leading.iter().map(|c| c.text.as_str()).collect();
            clause.text = format!("{}: {}", prefix.join(", "), clause.text);
            clause.priority = leading
                .iter()
                .map(|c| c.priority)
                .fold(clause.priority, i32::max);
            leading.clear();
        }
        merged.push(clause);
    }

    if merged.is_empty() && !leading.is_empty() {
        let text = leading
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" and ");
        let priority = leading.iter().map(|c| c.priority).max().unwrap_or(0);
        merged.push(Clause {
            text,
            capabilities: CapabilitySet::new(),
            priority,
        });
    }

    merged
}

/// Errors raised while decomposing a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecomposeError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Task creation failed: {0}")]
    Task(#[from] TaskError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[Capability]) -> CapabilitySet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_implement_and_test_yields_two_tasks() {
        let tasks = Decomposer::new().decompose("implement X and test X").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].required_capabilities(), &caps(&[Capability::Implement]));
        assert_eq!(tasks[1].required_capabilities(), &caps(&[Capability::Test]));
        assert_eq!(tasks[0].description(), "implement X");
        assert_eq!(tasks[1].description(), "test X");
    }

    #[test]
    fn test_empty_request_is_invalid() {
        let err = Decomposer::new().decompose("   \n ").unwrap_err();
        assert!(matches!(err, DecomposeError::InvalidRequest(_)));
    }

    #[test]
    fn test_decomposition_is_deterministic() {
        let decomposer = Decomposer::new();
        let at = Utc::now();
        let request = "Research the cache layer. Then implement an LRU and document it";
        let a = decomposer.decompose_at(request, at).unwrap();
        let b = decomposer.decompose_at(request, at).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id(), y.id());
            assert_eq!(x.description(), y.description());
            assert_eq!(x.required_capabilities(), y.required_capabilities());
            assert_eq!(x.priority(), y.priority());
            assert_eq!(x.created_at(), y.created_at());
        }
    }

    #[test]
    fn test_untagged_clause_continues_previous() {
        let tasks = Decomposer::new()
            .decompose("research caching strategies and the eviction policies")
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].description(),
            "research caching strategies and the eviction policies"
        );
    }

    #[test]
    fn test_leading_untagged_clause_prefixes_first_task() {
        let tasks = Decomposer::new()
            .decompose("For the billing service; implement retries")
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description(), "For the billing service: implement retries");
        assert_eq!(tasks[0].required_capabilities(), &caps(&[Capability::Implement]));
    }

    #[test]
    fn test_request_without_intent_is_single_open_task() {
        let tasks = Decomposer::new().decompose("hello there").unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].required_capabilities().is_empty());
    }

    #[test]
    fn test_urgency_marker_raises_priority() {
        let tasks = Decomposer::new()
            .decompose("document the API and urgently fix the login bug")
            .unwrap();
        assert_eq!(tasks[0].priority(), 0);
        assert_eq!(tasks[1].priority(), 1);
    }

    #[test]
    fn test_objects_do_not_add_capabilities() {
        let decomposer = Decomposer::new();
        let cases = [
            ("research the codebase", Capability::Research),
            ("analyze the code", Capability::Research),
            ("fix the failing test", Capability::Implement),
            ("create the test fixtures", Capability::Implement),
            ("review the test plan", Capability::Review),
        ];
        for (request, expected) in cases {
            let tasks = decomposer.decompose(request).unwrap();
            assert_eq!(tasks.len(), 1, "{}", request);
            assert_eq!(tasks[0].required_capabilities(), &caps(&[expected]), "{}", request);
        }
    }

    #[test]
    fn test_positions_follow_output_order() {
        let tasks = Decomposer::new()
            .decompose("research a; implement b; test c")
            .unwrap();
        let positions: Vec<usize> = tasks.iter().map(|t| t.position()).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }
}
