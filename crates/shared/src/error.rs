use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{RegistrationId, SuggestionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyResolved,
    Busy,
    Persist,
    Validation,
    Internal,
}

/// Wire-shaped error returned by any transport adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the coordination engine.
///
/// Validation failures (`RegistrationNotFound`, `KeyNotFound`,
/// `SuggestionNotFound`, `AlreadyResolved`) are returned synchronously and
/// never appended to the event log. `Persist` failures are per-key and leave
/// the affected property dirty.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registration '{0}' not found")]
    RegistrationNotFound(RegistrationId),

    #[error("key '{key}' not found on registration '{registration}'")]
    KeyNotFound {
        registration: RegistrationId,
        key: String,
    },

    #[error("suggestion '{0}' not found")]
    SuggestionNotFound(SuggestionId),

    #[error("suggestion '{0}' was already resolved")]
    AlreadyResolved(SuggestionId),

    #[error("a save pass is already in flight")]
    SaveInProgress,

    #[error("persist failed for '{registration}.{key}': {source}")]
    Persist {
        registration: RegistrationId,
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RegistrationNotFound(_)
            | Self::KeyNotFound { .. }
            | Self::SuggestionNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyResolved(_) => ErrorCode::AlreadyResolved,
            Self::SaveInProgress => ErrorCode::Busy,
            Self::Persist { .. } => ErrorCode::Persist,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
