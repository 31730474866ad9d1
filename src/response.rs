//! Response bodies shared by the HTTP endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    RateLimited,
    InvalidQuantity,
    InvalidPrice,
    PayloadTooLarge,
    PurchaseFailed,
    InternalError,
    FetchFailed,
    MethodNotAllowed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidQuantity => "INVALID_QUANTITY",
            ErrorCode::InvalidPrice => "INVALID_PRICE",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::PurchaseFailed => "PURCHASE_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FetchFailed => "FETCH_FAILED",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{success: false, error, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self { success: false, error, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_screaming_snake() {
        for code in [
            ErrorCode::RateLimited,
            ErrorCode::InvalidQuantity,
            ErrorCode::PayloadTooLarge,
            ErrorCode::MethodNotAllowed,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), code.as_str());
        }
        let body = serde_json::to_value(ErrorResponse::new(ErrorCode::Unauthorized, "sign in")).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "UNAUTHORIZED");
    }
}
