use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{feed::FeedError, posts::CreatePostError, repos::RepoError},
    domain::error::DomainError,
    infra::error::InfraError,
};

const FEED_ERROR_SOURCE: &str = "infra::http::feed_error_to_http_error";
const CREATE_POST_ERROR_SOURCE: &str = "infra::http::create_post_error_to_http_error";

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
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

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

fn domain_to_http(source: &'static str, error: &DomainError) -> HttpError {
    let public_message = match error {
        DomainError::InvalidUserId(_) => "Invalid user id",
        DomainError::Validation { .. } => "Request could not be processed",
    };
    HttpError::from_error(source, StatusCode::BAD_REQUEST, public_message, error)
}

pub(crate) fn repo_to_http(source: &'static str, error: &RepoError) -> HttpError {
    match error {
        RepoError::NotFound => {
            HttpError::from_error(source, StatusCode::NOT_FOUND, "Resource not found", error)
        }
        RepoError::InvalidInput { .. } => HttpError::from_error(
            source,
            StatusCode::BAD_REQUEST,
            "Request could not be processed",
            error,
        ),
        RepoError::Persistence(_) | RepoError::Timeout | RepoError::Unavailable(_) => {
            HttpError::from_error(
                source,
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable",
                error,
            )
        }
    }
}

impl From<FeedError> for HttpError {
    fn from(error: FeedError) -> Self {
        match &error {
            FeedError::Domain(err) => domain_to_http(FEED_ERROR_SOURCE, err),
            FeedError::Repo(err) => repo_to_http(FEED_ERROR_SOURCE, err),
        }
    }
}

impl From<CreatePostError> for HttpError {
    fn from(error: CreatePostError) -> Self {
        match &error {
            CreatePostError::Validation(err) => domain_to_http(CREATE_POST_ERROR_SOURCE, err),
            CreatePostError::Persistence(RepoError::InvalidInput { .. }) => HttpError::from_error(
                CREATE_POST_ERROR_SOURCE,
                StatusCode::BAD_REQUEST,
                "Request could not be processed",
                &error,
            ),
            CreatePostError::Persistence(_) => HttpError::from_error(
                CREATE_POST_ERROR_SOURCE,
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable",
                &error,
            ),
            // Handlers answer degraded success themselves; reaching this is a bug.
            CreatePostError::FanOut { .. } => HttpError::from_error(
                CREATE_POST_ERROR_SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unexpected error occurred",
                &error,
            ),
        }
    }
}

/// Process-level failure reported by the binary before it exits.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_errors_map_to_status() {
        let invalid: HttpError = FeedError::Domain(DomainError::InvalidUserId(0)).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let down: HttpError = FeedError::Repo(RepoError::Timeout).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn create_post_errors_map_to_status() {
        let invalid: HttpError =
            CreatePostError::Validation(DomainError::validation("empty")).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let down: HttpError =
            CreatePostError::Persistence(RepoError::Unavailable("db".into())).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn report_collects_source_chain() {
        let error = CreatePostError::Persistence(RepoError::Timeout);
        let report = ErrorReport::from_error("test", StatusCode::SERVICE_UNAVAILABLE, &error);
        assert_eq!(
            report.messages,
            vec![
                "failed to persist post: database timeout".to_string(),
                "database timeout".to_string()
            ]
        );
    }

    #[test]
    fn unknown_login_is_not_found() {
        let error = HttpError::new(
            "test",
            StatusCode::NOT_FOUND,
            "User not found",
            "no user with login `ghost`",
        );
        assert_eq!(error.status(), StatusCode::NOT_FOUND);

        let response = error.into_response();
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.messages, vec!["no user with login `ghost`".to_string()]);
    }

    #[test]
    fn app_error_wraps_infra_failures() {
        let error: AppError =
            InfraError::Broker(crate::queue::QueueError::Connection("down".into())).into();
        assert_eq!(error.to_string(), "broker error: broker connection failed: down");
    }
}
