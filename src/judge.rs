mod cases;
mod compare;

pub use cases::{CaseSource, ResolvedCases, resolve as resolve_cases};
pub use compare::outputs_match;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{JudgeConfig, OutputMatch};
use crate::error::EngineError;
use crate::language;
use crate::reclaimer::ReclaimTrigger;
use crate::sandbox::{RunOutcome, SandboxRunner};
use crate::workspace::{Workspace, WorkspaceManager};

pub const TIME_LIMIT_EXCEEDED: &str = "Time Limit Exceeded";
pub const RUNTIME_ERROR_PREFIX: &str = "Runtime Error: ";
pub const OUTPUT_LIMIT_EXCEEDED: &str = "Output Limit Exceeded";
pub const COMPILATION_FAILED: &str = "Compilation failed";
pub const SOME_CASES_FAILED: &str = "Some test cases failed";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// The slice of a problem statement the judge needs
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Problem {
    pub title: Option<String>,
    pub sample_input: Option<String>,
    pub sample_output: Option<String>,
    pub test_cases: Option<Vec<TestCase>>,
    /// Lowers the configured per-case time limit
    pub time_limit_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: String,
    #[serde(default)]
    pub problem: Problem,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub passed: bool,
    pub expected_output: String,
    pub actual_output: String,
    pub input: String,
    pub execution_time_ms: u64,
    pub memory_used_mb: f64,
}

/// Verdict for a whole submission
///
/// `success` is derived from the compile outcome and the per-case results and
/// can only be read, never set.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    success: bool,
    /// First case's actual output, for preview
    pub output: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compilation_error: Option<String>,
    pub execution_time_ms: u64,
    pub memory_used_mb: f64,
    pub test_results: Vec<TestOutcome>,
}

impl ExecutionResult {
    pub fn compile_failed(diagnostics: impl Into<String>) -> Self {
        let mut diagnostics = diagnostics.into();
        if diagnostics.trim().is_empty() {
            diagnostics = "Compiler exited with an error but printed no diagnostics".to_string();
        }
        Self {
            success: false,
            output: String::new(),
            error: COMPILATION_FAILED.to_string(),
            compilation_error: Some(diagnostics),
            execution_time_ms: 0,
            memory_used_mb: 0.0,
            test_results: Vec::new(),
        }
    }

    pub fn from_outcomes(test_results: Vec<TestOutcome>) -> Self {
        let success = test_results.iter().all(|outcome| outcome.passed);
        Self {
            success,
            output: test_results
                .first()
                .map(|outcome| outcome.actual_output.clone())
                .unwrap_or_default(),
            error: if success {
                String::new()
            } else {
                SOME_CASES_FAILED.to_string()
            },
            compilation_error: None,
            execution_time_ms: test_results.iter().map(|o| o.execution_time_ms).sum(),
            memory_used_mb: test_results
                .iter()
                .map(|o| o.memory_used_mb)
                .fold(0.0, f64::max),
            test_results,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }
}

/// Turns one sandbox run into a per-case verdict
pub fn judge_case(
    mode: OutputMatch,
    case: &TestCase,
    run: RunOutcome,
    time_limit: Duration,
) -> TestOutcome {
    let mut outcome = TestOutcome {
        passed: false,
        expected_output: case.expected_output.clone(),
        actual_output: String::new(),
        input: case.input.clone(),
        execution_time_ms: run.execution_time_ms,
        memory_used_mb: run.memory_used_mb,
    };

    if run.timed_out {
        outcome.actual_output = TIME_LIMIT_EXCEEDED.to_string();
        outcome.execution_time_ms = time_limit.as_millis() as u64;
        return outcome;
    }

    let stderr = run.stderr.trim();
    if !stderr.is_empty() || run.exit_code != Some(0) {
        let detail = match (stderr, run.exit_code) {
            ("", Some(137)) => {
                "process was killed (exit status 137), likely over the memory limit".to_string()
            }
            ("", Some(code)) => format!("process exited with status {code}"),
            ("", None) => "process was terminated by a signal".to_string(),
            (stderr, _) => stderr.to_string(),
        };
        outcome.actual_output = format!("{RUNTIME_ERROR_PREFIX}{detail}");
        return outcome;
    }

    if run.output_truncated {
        outcome.actual_output = OUTPUT_LIMIT_EXCEEDED.to_string();
        return outcome;
    }

    outcome.passed = outputs_match(mode, &run.stdout, &case.expected_output);
    outcome.actual_output = run.stdout.trim().to_string();
    outcome
}

/// The execution engine: resolves the language, brackets the attempt with a
/// workspace, compiles once and judges every case in order
pub struct Engine {
    runner: Arc<dyn SandboxRunner>,
    workspaces: WorkspaceManager,
    config: JudgeConfig,
    time_limit: Duration,
    executions: AtomicU64,
    reclaim_trigger: Option<ReclaimTrigger>,
}

impl Engine {
    pub fn new(
        runner: Arc<dyn SandboxRunner>,
        workspaces: WorkspaceManager,
        config: JudgeConfig,
        time_limit: Duration,
    ) -> Self {
        Self {
            runner,
            workspaces,
            config,
            time_limit,
            executions: AtomicU64::new(0),
            reclaim_trigger: None,
        }
    }

    pub fn with_reclaim_trigger(mut self, trigger: ReclaimTrigger) -> Self {
        self.reclaim_trigger = Some(trigger);
        self
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`Engine::execute`], giving up with [`EngineError::Cancelled`] once `cancel`
    /// fires. A running case is abandoned and its sandbox torn down.
    pub async fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let profile = language::resolve(&request.language)?;
        let resolved = resolve_cases(&request.problem, self.config.heuristic_fallback)?;
        if resolved.cases.len() > self.config.max_test_cases {
            return Err(EngineError::InvalidRequest(format!(
                "{} test cases exceed the limit of {}",
                resolved.cases.len(),
                self.config.max_test_cases
            )));
        }

        let time_limit = match request.problem.time_limit_ms {
            Some(0) => {
                return Err(EngineError::InvalidRequest(
                    "time_limit_ms must be positive".to_string(),
                ));
            }
            Some(ms) => Duration::from_millis(ms).min(self.time_limit),
            None => self.time_limit,
        };

        let mut workspace = self.workspaces.acquire(profile, &request.source_code)?;
        log::info!(
            "Judging {} submission in workspace {} against {} {:?} case(s)",
            profile.tag,
            workspace.id(),
            resolved.cases.len(),
            resolved.source
        );

        let verdict = self
            .judge(&mut workspace, &resolved.cases, time_limit, cancel)
            .await;
        let released = workspace.release();
        self.record_execution();

        let verdict = verdict?;
        released?;
        Ok(verdict)
    }

    async fn judge(
        &self,
        workspace: &mut Workspace,
        cases: &[TestCase],
        time_limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let compiled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            compiled = self.runner.compile(workspace) => compiled?,
        };
        if !compiled.success {
            log::info!("Workspace {} failed to compile", workspace.id());
            return Ok(ExecutionResult::compile_failed(compiled.stderr));
        }
        workspace.mark_compiled();

        let mut outcomes = Vec::with_capacity(cases.len());
        for (idx, case) in cases.iter().enumerate() {
            let run = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                run = self.runner.run(workspace, &case.input, time_limit) => run?,
            };
            let outcome = judge_case(self.config.output_match, case, run, time_limit);
            log::debug!(
                "Workspace {} case {idx}: passed={} in {} ms",
                workspace.id(),
                outcome.passed,
                outcome.execution_time_ms
            );
            outcomes.push(outcome);
        }

        Ok(ExecutionResult::from_outcomes(outcomes))
    }

    fn record_execution(&self) {
        let count = self.executions.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(trigger) = &self.reclaim_trigger {
            trigger.executed(count);
        }
    }
}
