use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as AxumJson, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Wire-level error kinds shared by relay and peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    AcceptanceTimeout,
    Rejected,
    NegotiationFailure,
    /// Target of a relayed signal was gone. Logged, never sent to a client.
    SignalDeliveryMiss,
    /// Byte count and completion message disagree. Logged, never fatal.
    ProtocolAnomaly,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::AcceptanceTimeout => "ACCEPTANCE_TIMEOUT",
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::NegotiationFailure => "NEGOTIATION_FAILURE",
            ErrorCode::SignalDeliveryMiss => "SIGNAL_DELIVERY_MISS",
            ErrorCode::ProtocolAnomaly => "PROTOCOL_ANOMALY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay registry failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Room not found")]
    RoomNotFound(String),

    #[error("Client {client_id} is not a member of room {room_id}")]
    NotAMember { room_id: String, client_id: String },

    #[error("Unknown client: {0}")]
    UnknownClient(String),
}

impl RelayError {
    /// Code surfaced to the client, if this error is client-visible at all
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RelayError::RoomNotFound(_) => Some(ErrorCode::RoomNotFound),
            RelayError::NotAMember { .. } | RelayError::UnknownClient(_) => None,
        }
    }
}

/// Peer session failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Negotiation with {peer_id} failed: {reason}")]
    NegotiationFailed { peer_id: String, reason: String },

    #[error("Negotiation with {0} did not complete in time")]
    NegotiationTimeout(String),

    #[error("No session for peer {0}")]
    UnknownPeer(String),

    #[error("Channel to {0} is not open")]
    NotOpen(String),

    #[error("Session with {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl SessionError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::NegotiationFailed { .. } | SessionError::NegotiationTimeout(_) => {
                Some(ErrorCode::NegotiationFailure)
            }
            SessionError::Transfer(e) => e.code(),
            SessionError::UnknownPeer(_) | SessionError::NotOpen(_) | SessionError::Closed(_) => {
                None
            }
        }
    }
}

/// Failures of a single file transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("No response to file offer within {0:?}")]
    AcceptanceTimeout(Duration),

    #[error("File offer rejected")]
    Rejected,

    #[error("Transfer cancelled: peer session closed")]
    Cancelled,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(Uuid),

    #[error("Failed to read file: {0}")]
    Io(String),
}

impl TransferError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::AcceptanceTimeout(_) => Some(ErrorCode::AcceptanceTimeout),
            TransferError::Rejected => Some(ErrorCode::Rejected),
            _ => None,
        }
    }
}

/// Structured error types for HTTP status code mapping
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
        };

        let body = AxumJson(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
