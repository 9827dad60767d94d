use std::io;

use thiserror::Error;

/// Faults that abort an execution request
///
/// Judging outcomes (compile errors, wrong answers, runtime errors, timeouts) are not
/// errors; they are reported inside [`crate::judge::ExecutionResult`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No test cases available for problem {title:?}")]
    NoTestCases { title: String },

    #[error("Sandbox runtime unavailable: {0}")]
    RunnerUnavailable(String),

    #[error("Workspace I/O error while {context}: {source}")]
    WorkspaceIo {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Execution cancelled")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn workspace_io(context: impl Into<String>, source: io::Error) -> Self {
        Self::WorkspaceIo {
            context: context.into(),
            source,
        }
    }

    /// Infrastructure faults: the judge itself is broken, the caller may retry later
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::RunnerUnavailable(_) | Self::WorkspaceIo { .. } | Self::Cancelled
        )
    }
}
