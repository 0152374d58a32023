use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{repos::ModuleError, tokens::TokenError},
    domain::error::DomainError,
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// An error rendered to the client as a short public message, with the full
/// chain kept in an [`ErrorReport`] for the response logger.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: String,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: impl Into<String>,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message: public_message.into(),
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<ModuleError> for HttpError {
    fn from(error: ModuleError) -> Self {
        const SOURCE: &str = "application::error::module_error_to_http_error";
        match error.status_code() {
            Some(StatusCode::FORBIDDEN) => {
                HttpError::from_error(SOURCE, StatusCode::FORBIDDEN, "forbidden", &error)
            }
            // Upstream bodies are passed through so clients see GitHub's reason.
            Some(status) => {
                let message = match &error {
                    ModuleError::Upstream { message, .. } if !message.is_empty() => {
                        message.clone()
                    }
                    _ => status
                        .canonical_reason()
                        .unwrap_or("upstream error")
                        .to_string(),
                };
                HttpError::from_error(SOURCE, status, message, &error)
            }
            None => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                &error,
            ),
        }
    }
}

impl From<TokenError> for HttpError {
    fn from(error: TokenError) -> Self {
        const SOURCE: &str = "application::error::token_error_to_http_error";
        match &error {
            TokenError::Malformed(_) => {
                HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "malformed_token", &error)
            }
            TokenError::Invalid => {
                HttpError::from_error(SOURCE, StatusCode::UNAUTHORIZED, "invalid_token", &error)
            }
            TokenError::Expired { .. } => {
                HttpError::from_error(SOURCE, StatusCode::UNAUTHORIZED, "token_expired", &error)
            }
            TokenError::Encoding(_) => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                &error,
            ),
        }
    }
}

impl From<DomainError> for HttpError {
    fn from(error: DomainError) -> Self {
        HttpError::from_error(
            "application::error::domain_error_to_http_error",
            StatusCode::BAD_REQUEST,
            "invalid module address",
            &error,
        )
    }
}

/// Process-level failures surfaced by `main`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
