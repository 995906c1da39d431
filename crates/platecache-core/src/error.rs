use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;
use crate::sync::OperationId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the persistence and sync layer.
///
/// Every caller-facing operation returns these as values; use
/// [`Error::descriptor`] to hand them across the UI boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Malformed operation: {reason}")]
    MalformedOperation {
        id: Option<OperationId>,
        reason: String,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Pending queue changed: expected head {expected}, found {}", display_head(.found))]
    QueueChanged {
        expected: OperationId,
        found: Option<OperationId>,
    },

    #[error("Restaurant does not exist: {0}")]
    NotFound(i64),
}

fn display_head(found: &Option<OperationId>) -> String {
    match found {
        Some(id) => id.to_string(),
        None => "nothing".to_string(),
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NetworkUnavailable(_) => ErrorCode::NetworkUnavailable,
            Error::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            Error::MalformedOperation { .. } => ErrorCode::MalformedOperation,
            Error::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Error::QueueChanged { .. } => ErrorCode::QueueChanged,
            Error::NotFound(_) => ErrorCode::NotFound,
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            code: self.code(),
            message: self.to_string(),
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::NetworkUnavailable(err.to_string())
    }
}

/// Stable error codes for the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NetworkUnavailable,
    ResourceUnavailable,
    MalformedOperation,
    StoreUnavailable,
    QueueChanged,
    NotFound,
}

/// Error code plus human readable message, as returned to UI glue code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ErrorDescriptor {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Error> for ErrorDescriptor {
    fn from(err: &Error) -> Self {
        err.descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_carries_code_and_message() {
        let err = Error::ResourceUnavailable("/restaurants".to_string());
        let descriptor = err.descriptor();
        assert_eq!(descriptor.code, ErrorCode::ResourceUnavailable);
        assert_eq!(descriptor.message, "Resource unavailable: /restaurants");
    }

    #[test]
    fn test_error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::MalformedOperation).unwrap();
        assert_eq!(json, "\"malformed_operation\"");
    }

    #[test]
    fn test_queue_changed_message() {
        let err = Error::QueueChanged {
            expected: OperationId(3),
            found: None,
        };
        assert_eq!(
            err.to_string(),
            "Pending queue changed: expected head 3, found nothing"
        );
    }

    #[test]
    fn test_api_error_becomes_network_unavailable() {
        let err: Error = ApiError::Offline("connection refused".to_string()).into();
        assert_eq!(err.code(), ErrorCode::NetworkUnavailable);
    }
}
