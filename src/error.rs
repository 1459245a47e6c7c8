use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{event, Level};

use crate::dtos::ApiError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<mongodb::error::Error> for RepositoryError {
    fn from(e: mongodb::error::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Unauthorized(String),

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Too many failed login attempts, try again later")]
    TooManyAttempts,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_valid::validation::Errors> for AppError {
    fn from(errors: serde_valid::validation::Errors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials | AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::AccountDisabled => StatusCode::FORBIDDEN,
            AppError::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
            AppError::Repository(RepositoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Repository(RepositoryError::Conflict(_)) => StatusCode::BAD_REQUEST,
            AppError::Repository(RepositoryError::Database(_)) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Server-side detail stays in the log.
        let error = if status.is_server_error() {
            event!(Level::ERROR, "Request failed: {}", self);
            String::from("Internal server error")
        } else {
            self.to_string()
        };

        (status, Json(ApiError { error })).into_response()
    }
}
