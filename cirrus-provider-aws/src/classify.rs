//! Error classification - AWS error codes to engine error kinds
//!
//! The engine only retries what classification calls transient, so
//! the code lists here decide the retry behavior of every API call.

use cirrus_core::error::EngineError;

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "RequestTimeout",
    "RequestTimeoutException",
    "InternalError",
    "InternalFailure",
    "InternalServiceError",
];

const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "AuthFailure",
];

/// Map a service error code and message onto an engine error
pub fn classify(code: &str, message: &str) -> EngineError {
    let rendered = if message.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, message)
    };
    if TRANSIENT_CODES.contains(&code) {
        EngineError::transient(rendered)
    } else if PERMISSION_CODES.contains(&code) {
        EngineError::Permission(rendered)
    } else if code.ends_with("NotFound")
        || code.ends_with("NotFoundException")
        || code.ends_with("NoSuchEntity")
        || code == "NoSuchEntityException"
    {
        EngineError::not_found(rendered)
    } else if code.contains("Conflict") || code == "ResourceInUseException" {
        EngineError::Conflict(rendered)
    } else {
        EngineError::api(rendered)
    }
}

/// Classify an SDK call result. Transport-level failures (dispatch,
/// client-side timeout) retry; modeled service errors go through code
/// classification.
pub fn classify_sdk<E, R>(error: aws_sdk_sts::error::SdkError<E, R>) -> EngineError
where
    E: aws_sdk_sts::error::ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    use aws_sdk_sts::error::{ProvideErrorMetadata as _, SdkError};
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            EngineError::transient(format!("{:?}", error))
        }
        SdkError::ServiceError(_) => {
            let code = error.code().unwrap_or("Unknown").to_string();
            let message = error.message().unwrap_or("").to_string();
            classify(&code, &message)
        }
        _ => EngineError::api(format!("{:?}", error)),
    }
}
