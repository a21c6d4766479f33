//! Shared helpers for the integration tests: a stub model with a fixed
//! winning class, router construction, and in-memory request bodies.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use candle_core::{Device, Tensor};
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::Value;

use gpu_inference_server::acquire::UrlFetcher;
use gpu_inference_server::model::{ImageTransform, LoadedModel, CLASS_COUNT};
use gpu_inference_server::monitoring::metrics::Telemetry;
use gpu_inference_server::monitoring::MonitoringConfig;
use gpu_inference_server::{create_app, AppState};

pub const STUB_WINNING_CLASS: usize = 7;

/// A model whose forward pass always favors `STUB_WINNING_CLASS`, with a
/// margin large enough that softmax puts most of the mass there.
pub fn stub_model() -> LoadedModel {
    let device = Device::Cpu;
    let forward_device = device.clone();
    let forward = candle_nn::func(move |xs: &Tensor| {
        let (batch, _, _, _) = xs.dims4()?;
        let mut data = vec![0.0f32; batch * CLASS_COUNT];
        for row in 0..batch {
            data[row * CLASS_COUNT + STUB_WINNING_CLASS] = 5.0;
        }
        Tensor::from_vec(data, (batch, CLASS_COUNT), &forward_device)
    });
    LoadedModel::from_parts(device, forward, ImageTransform::imagenet(), 0)
}

/// A model whose forward pass always fails, for driving the internal error
/// path from a well-formed request.
pub fn failing_model() -> LoadedModel {
    let forward = candle_nn::func(|_xs: &Tensor| {
        candle_core::bail!("device lost")
    });
    LoadedModel::from_parts(Device::Cpu, forward, ImageTransform::imagenet(), 0)
}

pub fn test_app(model: Option<LoadedModel>) -> Router {
    let telemetry = Telemetry::install().unwrap();
    let fetcher = Arc::new(UrlFetcher::new(Duration::from_secs(5)).unwrap());
    let state = AppState::new(model.map(Arc::new), fetcher, telemetry);
    create_app(state, &MonitoringConfig::default())
}

/// Encode a solid-color RGB image as PNG bytes.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        image::Rgb([120, 80, 40]),
    ));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

/// Hand-rolled multipart body with a single form part.
pub fn multipart_body(field: &str, filename: Option<&str>, data: &[u8]) -> Vec<u8> {
    let disposition = match filename {
        Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
        None => format!("form-data; name=\"{field}\""),
    };
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(field: &str, filename: Option<&str>, data: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(field, filename, data)))
        .unwrap()
}

pub fn json_request(payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
