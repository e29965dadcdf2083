//! Error taxonomy shared by every layer of the command core.
//!
//! All failures converge on [`AppError`], the `{code, reason, meta}`
//! envelope the transport serializes for clients. Store adapters and
//! deciders keep their own narrow error enums and convert at the edges.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Machine-readable error codes, one per failure class.
///
/// Serialized in `SCREAMING_SNAKE_CASE` (e.g. `RESERVATION_OVERLAP`) to
/// match the wire envelope. [`ErrorCode::status`] gives the HTTP status
/// the transport maps each code to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request failed schema validation.
    InvalidRequest,
    /// A mutating endpoint was called without an `Idempotency-Key` header.
    MissingIdempotencyKey,
    /// Reservation interval has `from >= to`.
    InvalidInterval,
    /// Reservation interval starts before now.
    ReservationInPast,
    /// Login failed (unknown email or wrong password).
    InvalidCredentials,
    /// Missing or invalid bearer token.
    Unauthorized,
    /// Actor role does not permit the operation.
    Forbidden,
    /// Actor is neither an admin nor the reservation owner.
    UnauthorizedCancel,
    /// Bootstrap key mismatch.
    BootstrapForbidden,
    ResourceNotFound,
    ReservationNotFound,
    UserNotFound,
    /// Cancel of a reservation that is already cancelled.
    ReservationAlreadyCancelled,
    ResourceNameTaken,
    ResourceAlreadyExists,
    UserAlreadyExists,
    ReservationOverlap,
    /// Optimistic concurrency retries exhausted.
    VersionConflict,
    /// Same idempotency key presented with different request content.
    IdempotencyHashMismatch,
    /// A stream listing is missing a version and the gap persisted a retry.
    StreamGapDetected,
    InternalError,
}

impl ErrorCode {
    /// HTTP status the transport maps this code to.
    pub fn status(self) -> u16 {
        match self {
            Self::InvalidRequest
            | Self::MissingIdempotencyKey
            | Self::InvalidInterval
            | Self::ReservationInPast => 400,
            Self::InvalidCredentials | Self::Unauthorized => 401,
            Self::Forbidden | Self::UnauthorizedCancel | Self::BootstrapForbidden => 403,
            Self::ResourceNotFound | Self::ReservationNotFound | Self::UserNotFound => 404,
            Self::ResourceNameTaken
            | Self::ResourceAlreadyExists
            | Self::UserAlreadyExists
            | Self::ReservationOverlap
            | Self::ReservationAlreadyCancelled
            | Self::VersionConflict
            | Self::IdempotencyHashMismatch => 409,
            Self::StreamGapDetected | Self::InternalError => 500,
        }
    }
}

/// The failure envelope every command path resolves to.
///
/// `meta` carries code-specific structured detail (e.g. the expected and
/// actual versions for a stream gap) and is `null` when there is none.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code:?}: {reason}")]
pub struct AppError {
    pub code: ErrorCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl AppError {
    /// Build an error with no structured metadata.
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            meta: Value::Null,
        }
    }

    /// Attach structured metadata to the error.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// HTTP status for this error's code.
    pub fn status(&self) -> u16 {
        self.code.status()
    }

    /// The `{error: {code, reason, meta}}` body the transport returns.
    pub fn to_body(&self) -> Value {
        json!({
            "error": {
                "code": self.code,
                "reason": self.reason,
                "meta": self.meta,
            }
        })
    }

    /// Shorthand for the unhandled-exception envelope.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, reason)
    }
}
