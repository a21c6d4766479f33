//! Inference execution: preprocessing, synthetic load, forward pass, top-1

use anyhow::{anyhow, Result};
use candle_core::{Tensor, D};
use serde::Serialize;

use crate::acquire::AcquiredImage;
use crate::model::{device_name, LoadedModel};

/// Top-1 classification outcome, serialized as the response body.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub predicted_class: usize,
    pub confidence: f32,
    pub device_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// Run the full inference path for one acquired image.
///
/// Any error here is an internal failure, never a validation failure:
/// malformed input was already rejected during acquisition.
pub fn run(image: &AcquiredImage, model: &LoadedModel) -> Result<PredictionResult> {
    let batch = model
        .transform()
        .apply(image.pixels(), model.device())?
        .unsqueeze(0)?;

    simulate_accelerator_load(&batch, model.synthetic_load_iters())?;

    let logits = model.forward(&batch)?;
    let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?
        .squeeze(0)?
        .to_vec1::<f32>()?;
    let (predicted_class, confidence) = top1(&probabilities)?;

    Ok(PredictionResult {
        predicted_class,
        confidence,
        device_used: device_name(batch.device()).to_string(),
        source_url: image.source_url().map(str::to_string),
    })
}

/// Fixed compute-amplification step emulating heavier accelerator load.
///
/// Results are discarded; this must never influence the classification
/// output. The iteration count is configuration, not a correctness knob.
fn simulate_accelerator_load(batch: &Tensor, iterations: usize) -> candle_core::Result<()> {
    if iterations == 0 {
        return Ok(());
    }
    let transposed = batch.transpose(D::Minus2, D::Minus1)?;
    for _ in 0..iterations {
        let _ = batch.matmul(&transposed)?;
    }
    Ok(())
}

fn top1(probabilities: &[f32]) -> Result<(usize, f32)> {
    probabilities
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, p)| (index, *p))
        .ok_or_else(|| anyhow!("model produced no class scores"))
}
