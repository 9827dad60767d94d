use std::time::Duration;

mod container_runner;
mod runner;

// Re-export the trait and common types
pub use container_runner::ContainerRunner;
pub use runner::SandboxRunner;

/// Result of the compilation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub success: bool,
    /// Compiler diagnostics, stdout and stderr combined
    pub stderr: String,
}

impl CompileOutcome {
    pub fn skipped() -> Self {
        Self {
            success: true,
            stderr: String::new(),
        }
    }
}

/// Result of a single program execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed before reporting a status
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_truncated: bool,
    pub execution_time_ms: u64,
    /// Peak memory, 0 when the sandbox could not report it
    pub memory_used_mb: f64,
}

impl RunOutcome {
    pub fn timed_out(time_limit_ms: u64) -> Self {
        Self {
            timed_out: true,
            execution_time_ms: time_limit_ms,
            ..Default::default()
        }
    }
}

/// What a sandbox-level stale resource sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSweep {
    pub containers_removed: usize,
    pub images_pruned: bool,
    pub errors: Vec<String>,
}

/// Age thresholds for sandbox-level cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPolicy {
    pub container_retention: Duration,
    /// `None` leaves images alone
    pub image_retention: Option<Duration>,
}
