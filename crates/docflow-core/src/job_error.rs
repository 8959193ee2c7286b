//! Job execution error types
//!
//! Lets a job handler tell the queue whether a failure is recoverable (retry
//! with backoff) or unrecoverable (fail now and finalize the document).

use std::fmt;

use crate::error::{ErrorMetadata, PipelineError};

/// Job execution error that can be either recoverable or unrecoverable
#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl JobError {
    /// Unrecoverable errors fail the job immediately without consuming the
    /// remaining attempt budget (missing document, terminal status).
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Recoverable errors are retried according to the job's backoff policy.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    /// Classify an arbitrary job failure.
    ///
    /// `JobError` wins when present, then [`PipelineError`] metadata; anything
    /// else is recoverable.
    pub fn is_recoverable_error(err: &anyhow::Error) -> bool {
        if let Some(job_err) = err.downcast_ref::<JobError>() {
            return job_err.is_recoverable();
        }
        if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
            return pipeline_err.is_recoverable();
        }
        true
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        let recoverable = err.is_recoverable();
        Self {
            inner: err.into(),
            recoverable,
        }
    }
}

/// Extension trait for Result to mark failures as unrecoverable
pub trait JobResultExt<T> {
    fn unrecoverable(self) -> Result<T, JobError>;
}

impl<T, E: Into<anyhow::Error>> JobResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, JobError> {
        self.map_err(|e| JobError::unrecoverable(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_unrecoverable_error() {
        let err = JobError::unrecoverable(anyhow::anyhow!("document gone"));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("document gone"));
    }

    #[test]
    fn test_from_anyhow_is_recoverable() {
        let err: JobError = anyhow::anyhow!("socket reset").into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_pipeline_error_keeps_its_classification() {
        let err: JobError = PipelineError::NotFound(Uuid::new_v4()).into();
        assert!(!err.is_recoverable());
        let err: JobError = PipelineError::storage("copy", anyhow::anyhow!("503")).into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_classify_through_anyhow() {
        let plain = anyhow::anyhow!("generic");
        assert!(JobError::is_recoverable_error(&plain));

        let wrapped: anyhow::Error = JobError::unrecoverable(anyhow::anyhow!("bad")).into();
        assert!(!JobError::is_recoverable_error(&wrapped));

        let pipeline: anyhow::Error = PipelineError::NotFound(Uuid::new_v4()).into();
        assert!(!JobError::is_recoverable_error(&pipeline));
    }

    #[test]
    fn test_result_ext() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "corrupt",
        ));
        let err = result.unrecoverable().unwrap_err();
        assert!(!err.is_recoverable());
    }
}
