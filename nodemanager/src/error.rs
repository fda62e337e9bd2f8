//! Error types for the process supervisor

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Process {app} already running")]
    AlreadyRunning { project_id: String, app: String },

    #[error("Process {app} not running")]
    NotRunning { project_id: String, app: String },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to terminate process tree: {0}")]
    Termination(String),

    #[error("Resource query failed: {0}")]
    ResourceQuery(String),

    #[error("Project store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Errors caused by the request itself rather than the environment.
    /// These are reported to the caller and never retried.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::AlreadyRunning { .. }
                | SupervisorError::NotRunning { .. }
                | SupervisorError::ProjectNotFound(_)
        )
    }

    /// Short machine-readable kind, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyRunning { .. } => "AlreadyRunning",
            SupervisorError::NotRunning { .. } => "NotRunning",
            SupervisorError::ProjectNotFound(_) => "ProjectNotFound",
            SupervisorError::SpawnFailed(_) => "SpawnFailed",
            SupervisorError::Termination(_) => "TerminationFailed",
            SupervisorError::ResourceQuery(_) => "ResourceQueryFailed",
            SupervisorError::Store(_) => "StoreError",
            SupervisorError::Io(_) => "IoError",
            SupervisorError::Json(_) => "JsonError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        let err = SupervisorError::AlreadyRunning {
            project_id: "42".into(),
            app: "web".into(),
        };
        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "Process web already running");

        let err = SupervisorError::NotRunning {
            project_id: "42".into(),
            app: "default".into(),
        };
        assert!(err.is_user_error());
        assert_eq!(err.kind(), "NotRunning");

        assert!(!SupervisorError::Termination("EPERM".into()).is_user_error());
        assert!(!SupervisorError::SpawnFailed("ENOENT".into()).is_user_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SupervisorError = io.into();
        assert_eq!(err.kind(), "IoError");
    }
}
