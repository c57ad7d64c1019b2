use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("message id generation failed: {0}")]
pub struct IdError(pub String);

/// Source of globally unique message ids.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String, IdError>;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> Result<String, IdError> {
        Ok(Uuid::new_v4().to_string())
    }
}
