use repowiki_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad submission input; the job is never created
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unreachable or invalid repository
    #[error("Clone failed: {0}")]
    ClonePermanent(String),

    /// The remote moved between resolving and fetching a revision
    #[error("Revision changed: expected {expected}, got {actual}")]
    RevisionChanged { expected: String, actual: String },

    /// Rate limit, timeout or upstream 5xx, after retries were exhausted
    #[error("Provider {provider} unavailable: {message}")]
    ProviderTransient { provider: String, message: String },

    /// Bad or missing credential
    #[error("Provider {provider} authentication failed: {message}")]
    ProviderAuth { provider: String, message: String },

    /// Request rejected or response malformed
    #[error("Provider {provider} returned an unusable response: {message}")]
    ProviderResponse { provider: String, message: String },

    /// Object store unavailable; callers fall back to recompute
    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::ProviderTransient { .. }
            | OrchestratorError::RevisionChanged { .. }
            | OrchestratorError::CacheIo(_) => ErrorCategory::Transient,
            OrchestratorError::Internal(_)
            | OrchestratorError::Storage(_)
            | OrchestratorError::Io(_)
            | OrchestratorError::Config(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            OrchestratorError::JobNotFound(_) => true,
            OrchestratorError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Single-line text written to a failed job's `error` field.
    ///
    /// Never contains source chains, stack traces or internal identifiers.
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::Validation(m) => format!("invalid request: {}", m),
            OrchestratorError::ClonePermanent(m) => format!("clone failed: {}", one_line(m)),
            OrchestratorError::RevisionChanged { .. } => {
                "clone failed: repository changed while it was being fetched; retry the job"
                    .to_string()
            }
            OrchestratorError::ProviderTransient { provider, .. } => format!(
                "provider {} is rate limited or unavailable; retries exhausted",
                provider
            ),
            OrchestratorError::ProviderAuth { provider, message } => format!(
                "provider {} rejected the credentials: {}",
                provider,
                one_line(message)
            ),
            OrchestratorError::ProviderResponse { provider, message } => format!(
                "provider {} returned an unusable response: {}",
                provider,
                one_line(message)
            ),
            OrchestratorError::CacheIo(_) => "artifact cache unavailable".to_string(),
            OrchestratorError::JobNotFound(_) => "job not found".to_string(),
            OrchestratorError::InvalidStateTransition { from, to } => {
                format!("invalid state transition: {} -> {}", from, to)
            }
            OrchestratorError::Serialization(_) | OrchestratorError::Bincode(_) => {
                "internal error: could not decode stage output".to_string()
            }
            OrchestratorError::Internal(_)
            | OrchestratorError::Storage(_)
            | OrchestratorError::Io(_)
            | OrchestratorError::Config(_) => "internal error".to_string(),
        }
    }
}

fn one_line(message: &str) -> String {
    const MAX: usize = 300;
    let line = message.lines().next().unwrap_or_default().trim();
    if line.chars().count() > MAX {
        let cut: String = line.chars().take(MAX).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, rate limit)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, bad credential)
    Permanent,
    /// Infrastructure error - alert ops (e.g., store unavailable, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
