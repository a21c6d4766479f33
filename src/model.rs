//! Model lifecycle: device selection, weight loading, preprocessing

use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Func, VarBuilder};
use candle_transformers::models::resnet;
use image::imageops::FilterType;
use image::RgbImage;
use tracing::info;

use crate::monitoring::metrics::record_model_load;

/// ImageNet class count; every predicted class index is below this.
pub const CLASS_COUNT: usize = 1000;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Model loading configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Local safetensors file; when unset, weights come from the Hub.
    pub weights_path: Option<PathBuf>,
    /// HuggingFace Hub repository holding the pretrained weights.
    pub hub_repo: String,
    /// Weights filename within the repository.
    pub weights_file: String,
    /// Iterations of the synthetic compute-amplification step per request.
    pub synthetic_load_iters: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: None,
            hub_repo: "timm/resnet18.a1_in1k".to_string(),
            weights_file: "model.safetensors".to_string(),
            synthetic_load_iters: 10,
        }
    }
}

/// Fixed preprocessing bound to the model's expected input: resize the
/// shortest side, center-crop, scale to [0,1], normalize per channel.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransform {
    resize_to: u32,
    crop: u32,
}

impl ImageTransform {
    pub fn imagenet() -> Self {
        Self { resize_to: 256, crop: 224 }
    }

    /// Produce a `(3, crop, crop)` f32 tensor on `device`.
    pub fn apply(&self, image: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
        let (w, h) = image.dimensions();
        // The long side scales by resize_to / short side; reject ratios that
        // push it past u32 rather than truncating into an undersized crop.
        let scale_long = |long: u32, short: u32| -> candle_core::Result<u32> {
            u32::try_from(long as u64 * self.resize_to as u64 / short as u64).map_err(|_| {
                candle_core::Error::Msg(format!("image aspect ratio too extreme: {w}x{h}"))
            })
        };
        let (nw, nh) = if w <= h {
            (self.resize_to, scale_long(h, w)?)
        } else {
            (scale_long(w, h)?, self.resize_to)
        };
        let resized = image::imageops::resize(image, nw, nh, FilterType::Triangle);
        let x = (nw - self.crop) / 2;
        let y = (nh - self.crop) / 2;
        let cropped = image::imageops::crop_imm(&resized, x, y, self.crop, self.crop).to_image();

        let (crop_h, crop_w) = (self.crop as usize, self.crop as usize);
        let pixels = Tensor::from_vec(cropped.into_raw(), (crop_h, crop_w, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        let mean = Tensor::new(&IMAGENET_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&IMAGENET_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
        (pixels / 255f64)?.broadcast_sub(&mean)?.broadcast_div(&std)?.to_device(device)
    }
}

/// The loaded classifier: device, weights, and preprocessing transform.
///
/// Built exactly once at startup and shared read-only by every request;
/// nothing here is mutated after construction.
pub struct LoadedModel {
    device: Device,
    model: Func<'static>,
    transform: ImageTransform,
    loaded_at: SystemTime,
    synthetic_load_iters: usize,
}

impl LoadedModel {
    /// Load pretrained weights onto the best available device.
    ///
    /// Any failure is a startup abort: the caller must not serve traffic.
    /// On success the model-load histogram is observed and the readiness
    /// gauge flips to 1, both exactly once.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let device = select_device()?;
        let start = Instant::now();

        let weights = locate_weights(config)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                .context("loading model weights")?
        };
        let model = resnet::resnet18(CLASS_COUNT, vb).context("building resnet18")?;

        let load_time = start.elapsed();
        record_model_load(load_time);
        info!(
            device = device_name(&device),
            load_ms = load_time.as_millis(),
            "model loaded"
        );

        Ok(Self {
            device,
            model,
            transform: ImageTransform::imagenet(),
            loaded_at: SystemTime::now(),
            synthetic_load_iters: config.synthetic_load_iters,
        })
    }

    /// Assemble a model from an arbitrary forward function.
    ///
    /// Does not touch the readiness metrics; only [`LoadedModel::load`] does.
    pub fn from_parts(
        device: Device,
        model: Func<'static>,
        transform: ImageTransform,
        synthetic_load_iters: usize,
    ) -> Self {
        Self {
            device,
            model,
            transform,
            loaded_at: SystemTime::now(),
            synthetic_load_iters,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn transform(&self) -> &ImageTransform {
        &self.transform
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    pub fn synthetic_load_iters(&self) -> usize {
        self.synthetic_load_iters
    }

    /// Run the forward pass, producing per-class logits.
    pub fn forward(&self, batch: &Tensor) -> candle_core::Result<Tensor> {
        self.model.forward(batch)
    }
}

fn select_device() -> Result<Device> {
    let device = Device::cuda_if_available(0)?;
    if device.is_cuda() {
        info!("CUDA available, using GPU");
    } else {
        info!("CUDA not available, using CPU");
    }
    Ok(device)
}

fn locate_weights(config: &ModelConfig) -> Result<PathBuf> {
    if let Some(path) = &config.weights_path {
        if !path.exists() {
            bail!("model weights not found: {}", path.display());
        }
        return Ok(path.clone());
    }
    let api = hf_hub::api::sync::Api::new().context("initializing hub client")?;
    let path = api
        .model(config.hub_repo.clone())
        .get(&config.weights_file)
        .with_context(|| format!("fetching {} from {}", config.weights_file, config.hub_repo))?;
    Ok(path)
}

/// Name of the execution device as reported in prediction results.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_produces_chw_crop() {
        let image = RgbImage::from_pixel(64, 64, image::Rgb([128, 128, 128]));
        let tensor = ImageTransform::imagenet().apply(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 224, 224]);
    }

    #[test]
    fn transform_normalizes_with_imagenet_stats() {
        // A constant-gray image maps every pixel of channel c to
        // (128/255 - mean[c]) / std[c].
        let image = RgbImage::from_pixel(300, 300, image::Rgb([128, 128, 128]));
        let tensor = ImageTransform::imagenet().apply(&image, &Device::Cpu).unwrap();
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected_r = (128.0 / 255.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((values[0] - expected_r).abs() < 1e-4);
    }

    #[test]
    fn extreme_aspect_ratio_is_an_error_not_a_panic() {
        // 1 x 2^24: the scaled long side exceeds u32::MAX.
        let image = RgbImage::from_pixel(1, 1 << 24, image::Rgb([0, 0, 0]));
        assert!(ImageTransform::imagenet().apply(&image, &Device::Cpu).is_err());
    }

    #[test]
    fn transform_handles_landscape_aspect() {
        let image = RgbImage::from_pixel(640, 480, image::Rgb([0, 0, 0]));
        let tensor = ImageTransform::imagenet().apply(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 224, 224]);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn device_selection_falls_back_to_cpu() {
        let device = select_device().unwrap();
        assert!(!device.is_cuda());
        assert_eq!(device_name(&device), "cpu");
    }

    #[test]
    fn missing_local_weights_are_fatal() {
        let config = ModelConfig {
            weights_path: Some(PathBuf::from("/nonexistent/weights.safetensors")),
            ..ModelConfig::default()
        };
        assert!(locate_weights(&config).is_err());
    }
}
