use axum::http;
use axum::response::{IntoResponse, Response};

/// Errors relating to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The coordinator has shut down.
    #[error("coordinator not available")]
    Unavailable,

    /// Invalid peer identifier.
    #[error("invalid peer id: {0}")]
    Id(#[from] uuid::Error),

    /// The request is not a protocol upgrade.
    #[error("expected a connection upgrade")]
    UpgradeExpected,

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn status(&self) -> http::StatusCode {
        match self {
            Error::Unavailable => http::StatusCode::SERVICE_UNAVAILABLE,
            Error::Id(_) => http::StatusCode::BAD_REQUEST,
            Error::UpgradeExpected => http::StatusCode::UPGRADE_REQUIRED,
            Error::Io(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::error!("{}", self);

        self.status().into_response()
    }
}
