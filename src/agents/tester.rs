//! Tester agent
//!
//! Runs a task's acceptance suite: expected-artifact checks, shell test
//! commands under per-command wall-time budgets, and metric assertions
//! parsed from `name=value` lines on stdout. A run killed for exceeding its
//! budget is classified as a timeout regardless of whatever partial output
//! it left behind, and the report carries a last-executed-line extraction
//! to aim the fix.

use crate::agents::Agent;
use crate::orchestrator::classify::classify_text;
use crate::protocol::{
    TaskAssignment, TaskFailure, TaskOutput, TestCaseRecord, TestCaseStatus, TestReport,
    TimeoutAnalysis,
};
use crate::workflow::{AgentRole, FailureClass, MetricAssertion};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

static METRIC_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*[=:]\s*(-?\d+(?:\.\d+)?)\s*$")
        .expect("static regex")
});

const STDERR_EXCERPT_LEN: usize = 400;

pub struct TesterAgent {
    working_dir: PathBuf,
}

impl TesterAgent {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> CommandResult {
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return CommandResult {
                    status: TestCaseStatus::Failed,
                    duration: started.elapsed(),
                    stdout: String::new(),
                    stderr: format!("failed to spawn: {e}"),
                }
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_elapsed) => {
                // kill_on_drop reaps the process when the future is dropped.
                warn!(command = %command, timeout_secs = timeout.as_secs(), "test command exceeded wall time");
                CommandResult {
                    status: TestCaseStatus::Timeout,
                    duration: started.elapsed(),
                    stdout: String::new(),
                    stderr: format!("wall time exceeded after {}s", timeout.as_secs()),
                }
            }
            Ok(Err(e)) => CommandResult {
                status: TestCaseStatus::Failed,
                duration: started.elapsed(),
                stdout: String::new(),
                stderr: format!("failed to collect output: {e}"),
            },
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let status = if output.status.success() {
                    TestCaseStatus::Passed
                } else {
                    TestCaseStatus::Failed
                };
                CommandResult {
                    status,
                    duration: started.elapsed(),
                    stdout,
                    stderr,
                }
            }
        }
    }
}

struct CommandResult {
    status: TestCaseStatus,
    duration: Duration,
    stdout: String,
    stderr: String,
}

/// Parse `name=value` / `name: value` metric lines out of a test run's
/// stdout.
pub(crate) fn parse_metrics(stdout: &str) -> Vec<(String, f64)> {
    METRIC_LINE_RE
        .captures_iter(stdout)
        .filter_map(|cap| {
            let value: f64 = cap[2].parse().ok()?;
            Some((cap[1].to_string(), value))
        })
        .collect()
}

/// Check one assertion against the observed metrics.
pub(crate) fn check_assertion(
    assertion: &MetricAssertion,
    observed: &[(String, f64)],
) -> Result<f64, String> {
    let Some((_, value)) = observed.iter().find(|(name, _)| *name == assertion.metric) else {
        return Err(format!("metric {} not reported by the run", assertion.metric));
    };
    if assertion.op.holds(*value, assertion.value) {
        Ok(*value)
    } else {
        Err(format!(
            "metric assertion failed: {} = {} (expected {:?} {})",
            assertion.metric, value, assertion.op, assertion.value
        ))
    }
}

fn excerpt(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut cut = trimmed.len().min(STDERR_EXCERPT_LEN);
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(trimmed[..cut].to_string())
}

fn last_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Agent for TesterAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Tester
    }

    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure> {
        let mut cases = Vec::new();
        let mut timeout_analysis: Option<TimeoutAnalysis> = None;
        let mut combined_stdout = String::new();

        // Fixture references must resolve to files on disk before the suite
        // runs; this crate consumes fixtures, it never generates them.
        for fixture in &assignment.fixtures {
            let path = self.working_dir.join(fixture);
            let exists = tokio::fs::metadata(&path).await.is_ok()
                || tokio::fs::metadata(fixture).await.is_ok();
            if !exists {
                return Err(TaskFailure {
                    message: format!("missing fixture: {fixture}"),
                    class: Some(FailureClass::MissingDependency),
                    stderr_excerpt: None,
                    test_report: None,
                });
            }
        }

        // Expected artifacts must exist before anything runs against them.
        for expected in &assignment.acceptance.expected_artifacts {
            let path = self.working_dir.join(expected);
            let exists = tokio::fs::metadata(&path).await.is_ok()
                || tokio::fs::metadata(expected).await.is_ok();
            if !exists {
                let failure = TaskFailure {
                    message: format!("expected artifact missing: {expected}"),
                    class: Some(FailureClass::MissingDependency),
                    stderr_excerpt: None,
                    test_report: Some(TestReport {
                        passed: false,
                        cases: vec![TestCaseRecord {
                            name: format!("artifact::{expected}"),
                            status: TestCaseStatus::Failed,
                            duration_seconds: 0.0,
                            message: Some("artifact not found".to_string()),
                            stderr_excerpt: None,
                        }],
                        suggested_class: Some(FailureClass::MissingDependency),
                        timeout_analysis: None,
                    }),
                };
                return Err(failure);
            }
        }

        for test in &assignment.acceptance.test_commands {
            let result = self
                .run_command(&test.command, Duration::from_secs(test.timeout_secs))
                .await;
            debug!(
                command = %test.command,
                status = ?result.status,
                duration_ms = result.duration.as_millis() as u64,
                "test command finished"
            );
            combined_stdout.push_str(&result.stdout);

            if result.status == TestCaseStatus::Timeout && timeout_analysis.is_none() {
                timeout_analysis = Some(TimeoutAnalysis {
                    last_executed_line: last_nonempty_line(&result.stdout)
                        .or_else(|| last_nonempty_line(&result.stderr)),
                    candidate_fix: Some(
                        "bound the slowest loop or shrink the data window under test".to_string(),
                    ),
                });
            }

            cases.push(TestCaseRecord {
                name: test.command.clone(),
                status: result.status,
                duration_seconds: result.duration.as_secs_f64(),
                message: match result.status {
                    TestCaseStatus::Passed => None,
                    TestCaseStatus::Timeout => Some("wall time exceeded".to_string()),
                    TestCaseStatus::Failed => last_nonempty_line(&result.stderr),
                },
                stderr_excerpt: excerpt(&result.stderr),
            });
        }

        // Metric assertions read the combined stdout of the suite.
        let observed = parse_metrics(&combined_stdout);
        for assertion in &assignment.acceptance.metric_assertions {
            match check_assertion(assertion, &observed) {
                Ok(value) => {
                    debug!(metric = %assertion.metric, value, "metric assertion held");
                    cases.push(TestCaseRecord {
                        name: format!("metric::{}", assertion.metric),
                        status: TestCaseStatus::Passed,
                        duration_seconds: 0.0,
                        message: None,
                        stderr_excerpt: None,
                    });
                }
                Err(message) => {
                    cases.push(TestCaseRecord {
                        name: format!("metric::{}", assertion.metric),
                        status: TestCaseStatus::Failed,
                        duration_seconds: 0.0,
                        message: Some(message),
                        stderr_excerpt: None,
                    });
                }
            }
        }

        let passed = cases.iter().all(|c| c.status == TestCaseStatus::Passed);
        let timed_out = cases.iter().any(|c| c.status == TestCaseStatus::Timeout);

        let suggested_class = if passed {
            None
        } else if timed_out {
            Some(FailureClass::Timeout)
        } else {
            cases
                .iter()
                .filter(|c| c.status == TestCaseStatus::Failed)
                .find_map(|c| {
                    let text = format!(
                        "{}\n{}",
                        c.message.as_deref().unwrap_or(""),
                        c.stderr_excerpt.as_deref().unwrap_or("")
                    );
                    match classify_text(&text) {
                        FailureClass::Unknown => None,
                        class => Some(class),
                    }
                })
                .or(Some(FailureClass::Unknown))
        };

        let report = TestReport {
            passed,
            cases,
            suggested_class,
            timeout_analysis,
        };

        info!(
            task_id = %assignment.task_id,
            passed,
            cases = report.cases.len(),
            "acceptance suite finished"
        );

        if passed {
            Ok(TaskOutput {
                artifact: None,
                summary: format!("{} acceptance checks passed", report.cases.len()),
                test_report: Some(report),
            })
        } else {
            let failing: Vec<&str> = report
                .failing_cases()
                .map(|c| c.name.as_str())
                .collect();
            let stderr_excerpt = report
                .failing_cases()
                .find_map(|c| c.stderr_excerpt.clone());
            Err(TaskFailure {
                message: format!("acceptance failed: {}", failing.join(", ")),
                class: report.suggested_class,
                stderr_excerpt,
                test_report: Some(report),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{AcceptanceCriteria, MetricOp, TestCommand};

    fn assignment(acceptance: AcceptanceCriteria) -> TaskAssignment {
        TaskAssignment {
            task_id: "t2".to_string(),
            role: AgentRole::Tester,
            title: "run acceptance".to_string(),
            description: String::new(),
            acceptance,
            fixtures: vec![],
            artifact: None,
            debug_instructions: None,
            attempt: 1,
            timeout_secs: 120,
        }
    }

    #[test]
    fn test_metric_parsing() {
        let stdout = "running backtest\nsharpe=1.42\nmax_drawdown: -0.08\nnoise = abc\n";
        let metrics = parse_metrics(stdout);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0], ("sharpe".to_string(), 1.42));
        assert_eq!(metrics[1], ("max_drawdown".to_string(), -0.08));
    }

    #[test]
    fn test_assertion_checks() {
        let observed = vec![("sharpe".to_string(), 1.42)];
        let holds = MetricAssertion {
            metric: "sharpe".to_string(),
            op: MetricOp::Gte,
            value: 1.0,
        };
        assert_eq!(check_assertion(&holds, &observed).unwrap(), 1.42);

        let fails = MetricAssertion {
            metric: "sharpe".to_string(),
            op: MetricOp::Gte,
            value: 2.0,
        };
        let message = check_assertion(&fails, &observed).unwrap_err();
        assert!(message.contains("metric assertion failed"));

        let missing = MetricAssertion {
            metric: "sortino".to_string(),
            op: MetricOp::Gte,
            value: 1.0,
        };
        assert!(check_assertion(&missing, &observed).is_err());
    }

    #[tokio::test]
    async fn test_passing_command_yields_passing_report() {
        let tester = TesterAgent::new(".");
        let acceptance = AcceptanceCriteria {
            test_commands: vec![TestCommand {
                command: "true".to_string(),
                timeout_secs: 10,
            }],
            expected_artifacts: vec![],
            metric_assertions: vec![],
        };

        let output = tester.execute(assignment(acceptance)).await.unwrap();
        let report = output.test_report.unwrap();
        assert!(report.passed);
        assert_eq!(report.cases.len(), 1);
        assert_eq!(report.cases[0].status, TestCaseStatus::Passed);
    }

    #[tokio::test]
    async fn test_failing_command_yields_failure_with_report() {
        let tester = TesterAgent::new(".");
        let acceptance = AcceptanceCriteria {
            test_commands: vec![TestCommand {
                command: "echo 'AssertionError: bad signal' >&2; false".to_string(),
                timeout_secs: 10,
            }],
            expected_artifacts: vec![],
            metric_assertions: vec![],
        };

        let failure = tester.execute(assignment(acceptance)).await.unwrap_err();
        let report = failure.test_report.unwrap();
        assert!(!report.passed);
        assert_eq!(report.suggested_class, Some(FailureClass::ImplementationBug));
        assert!(failure.stderr_excerpt.unwrap().contains("AssertionError"));
    }

    #[tokio::test]
    async fn test_wall_time_exceeded_classifies_as_timeout() {
        let tester = TesterAgent::new(".");
        let acceptance = AcceptanceCriteria {
            test_commands: vec![TestCommand {
                command: "echo 'step 1'; sleep 30".to_string(),
                timeout_secs: 1,
            }],
            expected_artifacts: vec![],
            metric_assertions: vec![],
        };

        let failure = tester.execute(assignment(acceptance)).await.unwrap_err();
        assert_eq!(failure.class, Some(FailureClass::Timeout));
        let report = failure.test_report.unwrap();
        assert_eq!(report.cases[0].status, TestCaseStatus::Timeout);
        // The timeout analysis captured where the run got to.
        let analysis = report.timeout_analysis.unwrap();
        assert_eq!(analysis.last_executed_line.as_deref(), Some("step 1"));
    }

    #[tokio::test]
    async fn test_missing_fixture_fails_with_missing_dependency() {
        let tester = TesterAgent::new(".");
        let mut unresolved = assignment(AcceptanceCriteria::default());
        unresolved.fixtures = vec!["fixtures/ohlcv_missing.csv".to_string()];

        let failure = tester.execute(unresolved).await.unwrap_err();
        assert_eq!(failure.class, Some(FailureClass::MissingDependency));
        assert!(failure.message.contains("missing fixture"));
    }

    #[tokio::test]
    async fn test_missing_expected_artifact_fails_fast() {
        let tester = TesterAgent::new(".");
        let acceptance = AcceptanceCriteria {
            test_commands: vec![],
            expected_artifacts: vec!["definitely/not/here.py".to_string()],
            metric_assertions: vec![],
        };

        let failure = tester.execute(assignment(acceptance)).await.unwrap_err();
        assert_eq!(failure.class, Some(FailureClass::MissingDependency));
    }

    #[tokio::test]
    async fn test_metric_assertions_evaluated_from_stdout() {
        let tester = TesterAgent::new(".");
        let acceptance = AcceptanceCriteria {
            test_commands: vec![TestCommand {
                command: "echo 'sharpe=0.5'".to_string(),
                timeout_secs: 10,
            }],
            expected_artifacts: vec![],
            metric_assertions: vec![MetricAssertion {
                metric: "sharpe".to_string(),
                op: MetricOp::Gte,
                value: 1.0,
            }],
        };

        let failure = tester.execute(assignment(acceptance)).await.unwrap_err();
        let report = failure.test_report.unwrap();
        let metric_case = report
            .cases
            .iter()
            .find(|c| c.name == "metric::sharpe")
            .unwrap();
        assert_eq!(metric_case.status, TestCaseStatus::Failed);
        assert_eq!(report.suggested_class, Some(FailureClass::LogicError));
    }
}
