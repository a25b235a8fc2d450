//! Synthesizer - folds task states, attempts and verdicts into one report.
//!
//! Tasks are reported in decomposer order regardless of the order in which
//! their attempts finished. For each task the last attempt decides the final
//! verdict and output.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::runner::ExecutionResult;
use crate::task::{CapabilitySet, Task, TaskId, TaskStatus};
use crate::validation::{ValidationVerdict, Verdict};

/// One validated execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub result: ExecutionResult,
    pub verdict: ValidationVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOutcome {
    AllAccepted,
    PartialFailure,
    TotalFailure,
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestOutcome::AllAccepted => "AllAccepted",
            RequestOutcome::PartialFailure => "PartialFailure",
            RequestOutcome::TotalFailure => "TotalFailure",
        };
        f.write_str(s)
    }
}

/// Final state of one task within a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub position: usize,
    pub description: String,
    pub capabilities: CapabilitySet,
    pub priority: i32,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub attempts: u32,
    /// Verdict of the last validated attempt
    pub verdict: Option<Verdict>,
    pub feedback: Option<String>,
    pub detected_violations: BTreeSet<String>,
    pub output: Option<String>,
    pub learning: Option<String>,
    /// Failure reason when the task ended `Failed`
    pub failure: Option<String>,
}

impl TaskReport {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Some(Verdict::Accepted) && matches!(self.status, TaskStatus::Completed)
    }
}

/// Aggregate report for a whole request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReport {
    pub outcome: RequestOutcome,
    pub accepted: usize,
    pub total: usize,
    pub tasks: Vec<TaskReport>,
}

impl RequestReport {
    /// Human readable rendering of the report.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Outcome: {} ({}/{} tasks accepted)\n",
            self.outcome, self.accepted, self.total
        );
        for task in &self.tasks {
            let state = match (&task.verdict, &task.failure) {
                (_, Some(failure)) => format!("Failed: {}", failure),
                (Some(verdict), None) => verdict.to_string(),
                (None, None) => task.status.to_string(),
            };
            let _ = write!(out, "\n{}. [{}] {}", task.position + 1, state, task.description);
            if let Some(worker) = &task.worker_id {
                let _ = write!(out, " (worker: {}, attempts: {})", worker, task.attempts);
            }
            out.push('\n');
            if let Some(feedback) = &task.feedback {
                let _ = writeln!(out, "   {}", feedback);
            }
            if let Some(output) = task.output.as_deref().filter(|o| !o.is_empty()) {
                for line in output.lines() {
                    let _ = writeln!(out, "   > {}", line);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Synthesizer;

impl Synthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Build the report. `attempts` may arrive in any order.
    pub fn synthesize(&self, tasks: &[Task], attempts: &[Attempt]) -> RequestReport {
        let mut last: HashMap<TaskId, &Attempt> = HashMap::new();
        for attempt in attempts {
            let replace = match last.get(&attempt.result.task_id) {
                Some(current) => {
                    (attempt.result.attempt, attempt.verdict.timestamp)
                        > (current.result.attempt, current.verdict.timestamp)
                }
                None => true,
            };
            if replace {
                last.insert(attempt.result.task_id, attempt);
            }
        }

        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|t| t.position());

        let reports: Vec<TaskReport> = ordered
            .into_iter()
            .map(|task| {
                let final_attempt = last.get(&task.id()).copied();
                let failure = match task.status() {
                    TaskStatus::Failed { reason } => Some(reason.to_string()),
                    _ => None,
                };
                TaskReport {
                    task_id: task.id(),
                    position: task.position(),
                    description: task.description().to_string(),
                    capabilities: task.required_capabilities().clone(),
                    priority: task.priority(),
                    status: task.status().clone(),
                    worker_id: task.assigned_worker().map(str::to_string),
                    attempts: task.attempts(),
                    verdict: final_attempt.map(|a| a.verdict.verdict),
                    feedback: final_attempt.map(|a| a.verdict.feedback.clone()),
                    detected_violations: final_attempt
                        .map(|a| a.verdict.detected_violations.clone())
                        .unwrap_or_default(),
                    output: final_attempt.map(|a| a.result.output.clone()),
                    learning: final_attempt.and_then(|a| a.result.learning.clone()),
                    failure,
                }
            })
            .collect();

        let accepted = reports.iter().filter(|r| r.is_accepted()).count();
        let total = reports.len();
        let outcome = if total > 0 && accepted == total {
            RequestOutcome::AllAccepted
        } else if accepted == 0 {
            RequestOutcome::TotalFailure
        } else {
            RequestOutcome::PartialFailure
        };

        RequestReport {
            outcome,
            accepted,
            total,
            tasks: reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Decomposer, FailureReason};
    use chrono::{Duration, Utc};

    fn attempt(task: &Task, n: u32, verdict: Verdict, output: &str) -> Attempt {
        let result = ExecutionResult {
            task_id: task.id(),
            worker_id: "w".to_string(),
            attempt: n,
            output: output.to_string(),
            learning: None,
            error: None,
            duration_ms: 3,
        };
        let verdict = ValidationVerdict {
            task_id: task.id(),
            worker_id: "w".to_string(),
            verdict,
            feedback: format!("{}", verdict),
            detected_violations: BTreeSet::new(),
            timestamp: Utc::now() + Duration::milliseconds(n as i64),
        };
        Attempt { result, verdict }
    }

    fn finished(tasks: &mut [Task]) {
        for t in tasks.iter_mut() {
            t.dispatch("w").unwrap();
            t.start().unwrap();
            t.complete().unwrap();
        }
    }

    #[test]
    fn test_all_accepted() {
        let mut tasks = Decomposer::new().decompose("implement X and test X").unwrap();
        finished(&mut tasks);
        let attempts: Vec<Attempt> = tasks
            .iter()
            .map(|t| attempt(t, 1, Verdict::Accepted, "ok"))
            .collect();
        let report = Synthesizer::new().synthesize(&tasks, &attempts);
        assert_eq!(report.outcome, RequestOutcome::AllAccepted);
        assert_eq!(report.accepted, 2);
    }

    #[test]
    fn test_partial_and_total_failure() {
        let mut tasks = Decomposer::new().decompose("implement X and test X").unwrap();
        finished(&mut tasks);
        let mixed = vec![
            attempt(&tasks[0], 1, Verdict::Accepted, "ok"),
            attempt(&tasks[1], 1, Verdict::Revise, "meh"),
        ];
        assert_eq!(
            Synthesizer::new().synthesize(&tasks, &mixed).outcome,
            RequestOutcome::PartialFailure
        );

        let rejected = vec![
            attempt(&tasks[0], 1, Verdict::Rejected, "TODO"),
            attempt(&tasks[1], 1, Verdict::Revise, "meh"),
        ];
        assert_eq!(
            Synthesizer::new().synthesize(&tasks, &rejected).outcome,
            RequestOutcome::TotalFailure
        );
    }

    #[test]
    fn test_order_independent() {
        let mut tasks = Decomposer::new()
            .decompose("research caching; implement the cache; document it")
            .unwrap();
        finished(&mut tasks);
        let attempts: Vec<Attempt> = tasks
            .iter()
            .map(|t| attempt(t, 1, Verdict::Accepted, t.description()))
            .collect();
        let mut reversed = attempts.clone();
        reversed.reverse();
        let mut shuffled_tasks = tasks.clone();
        shuffled_tasks.reverse();

        let a = Synthesizer::new().synthesize(&tasks, &attempts);
        let b = Synthesizer::new().synthesize(&shuffled_tasks, &reversed);
        assert_eq!(a, b);
        assert_eq!(a.tasks[0].position, 0);
        assert_eq!(a.tasks[2].position, 2);
    }

    #[test]
    fn test_last_attempt_wins() {
        let mut tasks = Decomposer::new().decompose("implement the parser").unwrap();
        finished(&mut tasks);
        let attempts = vec![
            attempt(&tasks[0], 2, Verdict::Accepted, "second"),
            attempt(&tasks[0], 1, Verdict::Rejected, ""),
        ];
        let report = Synthesizer::new().synthesize(&tasks, &attempts);
        assert_eq!(report.tasks[0].verdict, Some(Verdict::Accepted));
        assert_eq!(report.tasks[0].output.as_deref(), Some("second"));
    }

    #[test]
    fn test_failed_task_reports_reason() {
        let mut tasks = Decomposer::new().decompose("research the market").unwrap();
        tasks[0].fail(FailureReason::NoCapableWorker).unwrap();
        let report = Synthesizer::new().synthesize(&tasks, &[]);
        assert_eq!(report.outcome, RequestOutcome::TotalFailure);
        assert_eq!(report.tasks[0].failure.as_deref(), Some("NoCapableWorkerError"));
        assert!(report.tasks[0].verdict.is_none());
        assert!(report.render().contains("Failed: NoCapableWorkerError"));
    }
}
