use thiserror::Error;

use super::types::UserId;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("user `{0}` is not a valid identifier")]
    InvalidUserId(UserId),
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}
