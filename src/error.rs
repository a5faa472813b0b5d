//! Error kinds surfaced by the merge coordinator and job runners.

use std::path::PathBuf;

/// Boxed cause carried by job failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the public merge API.
///
/// A merge is all-or-nothing: any of these means no merged output was
/// exposed and the caller must treat the loop result as undefined.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Invalid input shapes, formats, paths, or settings. Raised before any
    /// job is submitted.
    #[error("invalid merge configuration: {0}")]
    Config(String),

    /// A baseline or partial could not be written to stable storage.
    #[error("failed to export matrix `{name}` to {}", path.display())]
    Durability {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The merge job was rejected, a task exhausted its attempts, or the
    /// substrate failed.
    #[error("merge job `{job}` failed (output {}, {sources} sources)", output.display())]
    JobFailed {
        job: String,
        output: PathBuf,
        sources: usize,
        #[source]
        source: BoxError,
    },
}

impl MergeError {
    pub fn config(message: impl Into<String>) -> Self {
        MergeError::Config(message.into())
    }

    /// True if the error came from the job substrate rather than input checks.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, MergeError::JobFailed { .. })
    }
}

impl From<figment::Error> for MergeError {
    fn from(e: figment::Error) -> Self {
        MergeError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_failure_message_names_output_and_sources() {
        let err = MergeError::JobFailed {
            job: "ResultMerge-7".to_string(),
            output: PathBuf::from("/tmp/out"),
            sources: 3,
            source: anyhow::anyhow!("reduce task 0 exhausted 4 attempts").into(),
        };
        let message = err.to_string();
        assert!(message.contains("ResultMerge-7"));
        assert!(message.contains("/tmp/out"));
        assert!(message.contains("3 sources"));
        assert!(err.is_job_failure());
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert!(cause.contains("exhausted"));
    }

    #[test]
    fn test_config_error_is_not_job_failure() {
        let err = MergeError::config("rows must be positive");
        assert!(!err.is_job_failure());
        assert_eq!(
            err.to_string(),
            "invalid merge configuration: rows must be positive"
        );
    }
}
