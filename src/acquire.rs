//! Image acquisition: multipart upload and remote URL variants
//!
//! Both variants converge on [`AcquiredImage`], the single shape the
//! inference executor consumes. Validation failures short-circuit here and
//! never reach the executor.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Multipart;
use image::RgbImage;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::ValidationError;

/// Name of the multipart file part carrying the image.
pub const UPLOAD_FIELD: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Upload,
    Url,
}

/// Where a request's image came from: the uploaded filename or the fetched URL.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub identifier: String,
}

/// A decoded RGB image together with its provenance. Owned by the request
/// that created it and discarded after inference.
#[derive(Debug)]
pub struct AcquiredImage {
    pixels: RgbImage,
    source: SourceDescriptor,
}

impl AcquiredImage {
    pub fn new(pixels: RgbImage, source: SourceDescriptor) -> Self {
        Self { pixels, source }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// The original URL, for URL-sourced images only.
    pub fn source_url(&self) -> Option<&str> {
        match self.source.kind {
            SourceKind::Url => Some(&self.source.identifier),
            SourceKind::Upload => None,
        }
    }
}

/// The two ways a predict request can carry an image. The orchestrator picks
/// the variant from the request's content type.
pub enum ImageSource {
    Upload(Multipart),
    RemoteUrl(String),
}

impl ImageSource {
    pub async fn acquire(self, fetcher: &UrlFetcher) -> Result<AcquiredImage, ValidationError> {
        match self {
            ImageSource::Upload(multipart) => acquire_upload(multipart).await,
            ImageSource::RemoteUrl(url) => fetcher.acquire(url).await,
        }
    }
}

async fn acquire_upload(mut multipart: Multipart) -> Result<AcquiredImage, ValidationError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ValidationError::InvalidMultipart(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        if file_name.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::NoFileSelected);
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ValidationError::InvalidMultipart(e.to_string()))?;
        if data.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let pixels = decode_rgb(&data)?;
        debug!(bytes = data.len(), file_name = file_name.as_deref(), "decoded uploaded image");
        return Ok(AcquiredImage::new(
            pixels,
            SourceDescriptor {
                kind: SourceKind::Upload,
                identifier: file_name.unwrap_or_default(),
            },
        ));
    }
    Err(ValidationError::MissingImage)
}

/// Decode arbitrary bytes to RGB, dropping alpha and other channels.
fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ValidationError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ValidationError::DecodeError(e.to_string()))
}

/// Remote image fetcher with a bounded timeout and no retries.
pub struct UrlFetcher {
    client: reqwest::Client,
}

impl UrlFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    async fn acquire(&self, url: String) -> Result<AcquiredImage, ValidationError> {
        if url.trim().is_empty() {
            return Err(ValidationError::EmptyField);
        }

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ValidationError::FetchError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ValidationError::FetchError(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        // Reject non-image media types before touching the body.
        if !content_type.starts_with("image/") {
            let reported = if content_type.is_empty() { "unknown".to_string() } else { content_type };
            return Err(ValidationError::NotAnImage(reported));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ValidationError::FetchError(e.to_string()))?;
        let pixels = decode_rgb(&bytes)?;
        debug!(bytes = bytes.len(), url = %url, "decoded remote image");
        Ok(AcquiredImage::new(
            pixels,
            SourceDescriptor { kind: SourceKind::Url, identifier: url },
        ))
    }
}
