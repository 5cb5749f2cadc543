use thiserror::Error;
use zentao_core::OptionsError;
use zentao_sources::AcquireError;
use zentao_storage::{FetchError, StoreError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("data source unavailable: {0}")]
    DataSource(#[from] AcquireError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("cannot decode {table} record: {reason}")]
    Extract { table: &'static str, reason: String },
    #[error("cannot convert record: {0}")]
    Convert(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
}

impl From<OptionsError> for TaskError {
    fn from(err: OptionsError) -> Self {
        TaskError::Configuration(err.to_string())
    }
}
