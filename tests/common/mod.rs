#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use codejudge::config::JudgeConfig;
use codejudge::error::EngineError;
use codejudge::judge::{Engine, ExecutionRequest, Problem, TestCase};
use codejudge::sandbox::{CompileOutcome, RunOutcome, SandboxRunner};
use codejudge::workspace::{Workspace, WorkspaceManager};

pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(2);

/// Stands in for a container engine
///
/// The submitted "program" is a single directive read back from the workspace source file:
/// `ECHO` copies stdin, `PRINT <text>` prints text, `CRASH` fails at runtime, `LOOP` runs
/// past the time limit, `HANG` blocks for a long time, `COMPILE_ERROR` fails to build and
/// `UNAVAILABLE` behaves like a missing engine.
#[derive(Default)]
pub struct ScriptedRunner {
    pub compiles: AtomicUsize,
    pub runs: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

async fn directive(workspace: &Workspace) -> Result<String, EngineError> {
    let source = tokio::fs::read_to_string(workspace.source_path())
        .await
        .map_err(|e| EngineError::RunnerUnavailable(format!("source vanished: {e}")))?;
    Ok(source.trim().to_string())
}

#[async_trait]
impl SandboxRunner for ScriptedRunner {
    async fn compile(&self, workspace: &Workspace) -> Result<CompileOutcome, EngineError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let program = directive(workspace).await?;
        if program == "UNAVAILABLE" {
            return Err(EngineError::RunnerUnavailable("docker: command not found".into()));
        }
        if !workspace.profile().needs_compilation() {
            return Ok(CompileOutcome::skipped());
        }
        if program == "COMPILE_ERROR" {
            return Ok(CompileOutcome {
                success: false,
                stderr: "solution.cpp:1:12: error: expected '}' at end of input".into(),
            });
        }
        Ok(CompileOutcome::skipped())
    }

    async fn run(
        &self,
        workspace: &Workspace,
        input: &str,
        time_limit: Duration,
    ) -> Result<RunOutcome, EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        assert!(workspace.dir().exists(), "workspace released before running");
        if workspace.profile().needs_compilation() {
            assert!(workspace.compiled_artifact_path().is_some());
        }

        let program = directive(workspace).await?;
        let clean = |stdout: String| RunOutcome {
            stdout,
            exit_code: Some(0),
            execution_time_ms: 5,
            memory_used_mb: 1.5,
            ..Default::default()
        };

        let outcome = match program.split_once(' ').unwrap_or((program.as_str(), "")) {
            ("ECHO", _) => clean(format!("{input}\n")),
            ("PRINT", text) => clean(format!("{text}\n")),
            ("CRASH", _) => RunOutcome {
                stderr: "ZeroDivisionError: division by zero\n".into(),
                exit_code: Some(1),
                execution_time_ms: 3,
                ..Default::default()
            },
            ("LOOP", _) => {
                tokio::time::sleep(time_limit).await;
                RunOutcome::timed_out(time_limit.as_millis() as u64)
            }
            ("HANG", _) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                clean(String::new())
            }
            _ => clean(String::new()),
        };
        Ok(outcome)
    }
}

pub fn engine(root: &Path, runner: Arc<ScriptedRunner>) -> Engine {
    engine_with(root, runner, JudgeConfig::default())
}

pub fn engine_with(root: &Path, runner: Arc<ScriptedRunner>, config: JudgeConfig) -> Engine {
    let workspaces = WorkspaceManager::new(root).unwrap();
    Engine::new(runner, workspaces, config, DEFAULT_TIME_LIMIT)
}

pub fn request(language: &str, source_code: &str, cases: &[(&str, &str)]) -> ExecutionRequest {
    ExecutionRequest {
        source_code: source_code.to_string(),
        language: language.to_string(),
        problem: Problem {
            title: Some("Echo".to_string()),
            test_cases: Some(
                cases
                    .iter()
                    .map(|&(input, output)| TestCase::new(input, output))
                    .collect(),
            ),
            ..Default::default()
        },
    }
}

pub fn leftover_entries(root: &Path) -> usize {
    std::fs::read_dir(root).unwrap().count()
}
