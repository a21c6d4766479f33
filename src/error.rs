//! Request error taxonomy and HTTP status mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Client-caused input failures. Every variant maps to a 400 response with a
/// distinct, client-readable reason; none of these indicate a server fault.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Multipart body carried no `image` part.
    #[error("No image provided")]
    MissingImage,
    /// The `image` part had an empty filename.
    #[error("No image selected")]
    NoFileSelected,
    /// The `image` part had a filename but zero bytes of content.
    #[error("Uploaded image is empty")]
    EmptyContent,
    /// The body bytes could not be decoded as an image.
    #[error("Could not decode image: {0}")]
    DecodeError(String),
    /// The multipart framing itself was malformed.
    #[error("Malformed multipart body: {0}")]
    InvalidMultipart(String),
    /// JSON body missing the `image_url` field.
    #[error("Missing 'image_url' field")]
    MissingField,
    /// `image_url` was present but blank.
    #[error("'image_url' must not be empty")]
    EmptyField,
    /// Transport-level fetch failure: DNS, connect, timeout, or non-2xx.
    #[error("Failed to fetch image: {0}")]
    FetchError(String),
    /// The URL responded, but not with an image media type.
    #[error("URL did not return an image (content-type: {0})")]
    NotAnImage(String),
}

/// Terminal outcome of the predict pipeline, short of success.
///
/// The orchestrator maps each variant to its HTTP status deterministically;
/// internal detail never reaches the client.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Model not loaded")]
    NotReady,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Internal server error")]
    Internal(anyhow::Error),
}

impl PredictError {
    pub fn status(&self) -> StatusCode {
        match self {
            PredictError::Validation(_) => StatusCode::BAD_REQUEST,
            PredictError::NotReady | PredictError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        // Display of `Internal` is the generic message; the underlying detail
        // is logged by the handler, not serialized here.
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
