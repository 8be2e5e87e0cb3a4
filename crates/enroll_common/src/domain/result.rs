use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Image decode error: {0}")]
    ImageDecodeError(String),

    #[error("Image encoding error: {0}")]
    EncodingError(String),

    #[error("Invalid enrollment ID: {0}")]
    InvalidEnrollmentId(String),

    #[error("Enrollment IDs exhausted: no free ID between {0} and {1}")]
    EnrollmentIdsExhausted(u32, u32),

    #[error("Face image record is required")]
    MissingImageRecord,

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
