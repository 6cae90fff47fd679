use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable, write rejected, or a response that could not be read.
    #[error("STORAGE: {op} failed: {cause:#}")]
    Storage {
        op: &'static str,
        cause: anyhow::Error,
    },
}

impl StoreError {
    pub fn storage(op: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Storage {
            op,
            cause: cause.into(),
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            StoreError::Storage { op, .. } => op,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
