use axum::{http::StatusCode, response::IntoResponse};
use std::fmt::Display;

use crate::status::Status;

pub type AppResult<T> = Result<T, AppErr>;

#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    /// Lost a compare-and-persist race on the entry row.
    #[error("entry {0} was changed by someone else")]
    Conflict(i64),

    #[error("no free pin after {0} attempts")]
    PinExhausted(u32),

    #[error("unknown or closed entry {0}")]
    UnknownEntry(i64),

    #[error("no waiting room for doctor {0}")]
    RoomNotFound(i64),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{0} may not do that")]
    Forbidden(&'static str),

    #[error("whiteboard is not active for entry {0}")]
    WhiteboardInactive(i64),

    #[error("whiteboard cannot be used while entry {id} is {status}")]
    WhiteboardUnavailable { id: i64, status: Status },

    #[error("DB: {0}")]
    Db(#[from] sqlx::Error),
}

impl AppErr {
    /// Stable code sent in `error` replies on the live channel.
    pub fn code(&self) -> &'static str {
        match self {
            AppErr::Bad(_) => "bad_request",
            AppErr::InvalidTransition { .. } => "invalid_transition",
            AppErr::Conflict(_) => "conflict",
            AppErr::PinExhausted(_) => "pin_exhausted",
            AppErr::UnknownEntry(_) => "unknown_entry",
            AppErr::RoomNotFound(_) => "room_not_found",
            AppErr::Malformed(_) => "malformed_message",
            AppErr::Forbidden(_) => "forbidden",
            AppErr::WhiteboardInactive(_) => "whiteboard_inactive",
            AppErr::WhiteboardUnavailable { .. } => "whiteboard_unavailable",
            AppErr::Db(_) => "internal",
        }
    }

    /// Store failures; everything else is the caller's fault.
    pub fn is_internal(&self) -> bool {
        matches!(self, AppErr::Db(_))
    }
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let code = match &self {
            AppErr::RoomNotFound(_) | AppErr::UnknownEntry(_) => StatusCode::NOT_FOUND,
            AppErr::Forbidden(_) => StatusCode::FORBIDDEN,
            AppErr::InvalidTransition { .. } | AppErr::Conflict(_) => StatusCode::CONFLICT,
            AppErr::PinExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppErr::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (code, self.to_string()).into_response()
    }
}

/* ── helper: turn any displayable error into Bad ── */
pub fn bad<E: Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }
