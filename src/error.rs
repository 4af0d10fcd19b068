use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error taxonomy reported in `ExecuteResult::error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CodeExecDisabled,
    InvalidInput,
    Timeout,
    PkgInstallDisabled,
    NetFetchDisabled,
    MaxPendingJobs,
    ExecutionError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeExecDisabled => "CODE_EXEC_DISABLED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Timeout => "TIMEOUT",
            Self::PkgInstallDisabled => "PKG_INSTALL_DISABLED",
            Self::NetFetchDisabled => "NET_FETCH_DISABLED",
            Self::MaxPendingJobs => "MAX_PENDING_JOBS",
            Self::ExecutionError => "EXECUTION_ERROR",
        }
    }

    /// Returns true if this represents a resource limit violation
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::Timeout | Self::MaxPendingJobs)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a run, a host call or a package operation can fail
///
/// Variants with a dedicated code carry the code token at the start of
/// their message: the text survives a trip through guest code and still
/// classifies to the same code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("CODE_EXEC_DISABLED: code execution is disabled")]
    CodeExecDisabled,

    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    #[error("TIMEOUT: execution exceeded {0}ms")]
    Timeout(u64),

    #[error("PKG_INSTALL_DISABLED: package installation is disabled")]
    PkgInstallDisabled,

    #[error("NET_FETCH_DISABLED: network fetch is disabled")]
    NetFetchDisabled,

    #[error("MAX_PENDING_JOBS: pending work still queued after {0} drain rounds")]
    MaxPendingJobs(u64),

    #[error("host call budget exhausted ({0} calls per run)")]
    HostCallLimit(u64),

    #[error("fetch request limit reached ({0} per run)")]
    RequestLimit(u64),

    #[error("response of {size} bytes exceeds the {limit} byte limit")]
    ResponseTooLarge { size: u64, limit: u64 },

    #[error("download budget of {0} bytes per run exceeded")]
    DownloadBudget(u64),

    #[error("request to {url} timed out after {ms}ms")]
    RequestTimeout { url: String, ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid package spec: {0}")]
    InvalidSpec(String),

    #[error("package install limit reached ({0} per run)")]
    InstallLimit(u64),

    #[error("package {spec} could not be resolved: {reason}")]
    Resolve { spec: String, reason: String },

    #[error("module {url} is {size} bytes, above the {limit} byte limit")]
    ModuleTooLarge { url: String, size: u64, limit: u64 },

    #[error("module {0} is not available")]
    ModuleNotFound(String),

    #[error("{0}")]
    Guest(String),

    #[error("interpreter error: {0}")]
    Interpreter(String),
}

impl SandboxError {
    /// The taxonomy code for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CodeExecDisabled => ErrorCode::CodeExecDisabled,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::PkgInstallDisabled => ErrorCode::PkgInstallDisabled,
            Self::NetFetchDisabled => ErrorCode::NetFetchDisabled,
            Self::MaxPendingJobs(_) => ErrorCode::MaxPendingJobs,
            // Guest text is matched against sentinels
            Self::Guest(text) => crate::output::classify(text),
            _ => ErrorCode::ExecutionError,
        }
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.code().is_limit_exceeded()
            || matches!(
                self,
                Self::HostCallLimit(_)
                    | Self::RequestLimit(_)
                    | Self::ResponseTooLarge { .. }
                    | Self::DownloadBudget(_)
                    | Self::InstallLimit(_)
                    | Self::ModuleTooLarge { .. }
            )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
