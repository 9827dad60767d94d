use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::workspace::Workspace;

use super::{CompileOutcome, RunOutcome, StaleSweep, SweepPolicy};

/// Compiles and runs untrusted programs inside an isolated environment
///
/// Implementations must never leave a process or container behind: when a run exceeds
/// its time limit the child is killed before `run` returns. Missing toolchains or a
/// missing container engine are reported as [`EngineError::RunnerUnavailable`], never
/// as a failed compile or run.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Builds the workspace source once; succeeds trivially for interpreted languages
    async fn compile(&self, workspace: &Workspace) -> Result<CompileOutcome, EngineError>;

    /// Runs the built program with `input` on stdin
    async fn run(
        &self,
        workspace: &Workspace,
        input: &str,
        time_limit: Duration,
    ) -> Result<RunOutcome, EngineError>;

    /// Removes sandbox resources left behind by workspaces no longer in `active`
    async fn sweep_stale(&self, _active: &HashSet<String>, _policy: &SweepPolicy) -> StaleSweep {
        StaleSweep::default()
    }
}
