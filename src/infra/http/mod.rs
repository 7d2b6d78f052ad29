mod middleware;
mod provider;

pub use middleware::RequestContext;
pub use provider::{HttpState, build_router};

use axum::http::StatusCode;

use crate::application::error::HttpError;
use crate::application::repos::RepoError;

/// Map a catalog error to a consistent HTTP error response.
pub fn repo_error_to_http(source: &'static str, err: RepoError) -> HttpError {
    match err {
        RepoError::NotFound => HttpError::new(
            source,
            StatusCode::NOT_FOUND,
            "Resource not found",
            "resource not found",
        ),
        RepoError::Invalid { message } => HttpError::new(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Catalog is invalid",
            message,
        ),
        RepoError::Domain(err) => HttpError::from_error(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Catalog is invalid",
            &err,
        ),
        RepoError::Persistence(message) => HttpError::new(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Catalog temporarily unavailable",
            message,
        ),
    }
}
