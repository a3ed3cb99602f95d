//! ONNX recognition with greedy CTC decoding.
//!
//! The crop is grayscaled, resized to the model's fixed input and run as a
//! `[1, 1, h, w]` tensor. The output is a per-step distribution over the
//! vocabulary with the CTC blank at class 0; decoding takes the argmax per
//! step, collapses repeats and drops blanks. Confidence is the mean
//! probability of the steps that emitted a character.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::session::Session;
use ort::value::Value;
use tracing::info;

use super::{OcrCandidate, ReadText};
use crate::config::ComputeProvider;
use crate::detection::create_session;

/// Characters the recognition model was trained on, in class order. Class 0
/// is the CTC blank, so class `i` maps to `vocab[i - 1]`.
const DEFAULT_VOCAB: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-";
const DEFAULT_INPUT_WIDTH: u32 = 200;
const DEFAULT_INPUT_HEIGHT: u32 = 64;

#[derive(Debug, Clone)]
pub struct CtcConfig {
    pub model_path: PathBuf,
    pub provider: ComputeProvider,
    pub input_width: u32,
    pub input_height: u32,
    pub vocab: String,
}

impl CtcConfig {
    pub fn new(model_path: impl Into<PathBuf>, provider: ComputeProvider) -> Self {
        Self {
            model_path: model_path.into(),
            provider,
            input_width: DEFAULT_INPUT_WIDTH,
            input_height: DEFAULT_INPUT_HEIGHT,
            vocab: DEFAULT_VOCAB.to_string(),
        }
    }
}

pub struct CtcEngine {
    session: Session,
    output_name: String,
    vocab: Vec<char>,
    input_width: u32,
    input_height: u32,
}

impl CtcEngine {
    pub fn new(cfg: &CtcConfig) -> Result<Self> {
        let (session, provider_label) = create_session(&cfg.model_path, cfg.provider)?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("recognition model has no outputs")?;
        info!(
            model = %cfg.model_path.display(),
            provider = provider_label,
            "ctc recognizer ready"
        );
        Ok(Self {
            session,
            output_name,
            vocab: cfg.vocab.chars().collect(),
            input_width: cfg.input_width,
            input_height: cfg.input_height,
        })
    }
}

impl ReadText for CtcEngine {
    fn read(&mut self, crop: &RgbImage) -> Result<Vec<OcrCandidate>> {
        let tensor = gray_tensor(crop, self.input_width, self.input_height);
        let input = Value::from_array(tensor)?;
        let outputs = self.session.run(ort::inputs![input])?;
        let value = outputs
            .get(self.output_name.as_str())
            .with_context(|| format!("recognizer output {:?} missing", self.output_name))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("extracting recognizer output")?;
        let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();

        let (text, conf) = ctc_decode(&dims, data, &self.vocab)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![OcrCandidate { text, conf }])
    }
}

/// Grayscale `crop`, stretch it to `w` x `h` and pack a `[1, 1, h, w]`
/// tensor scaled to `[0, 1]`.
fn gray_tensor(crop: &RgbImage, w: u32, h: u32) -> Array<f32, IxDyn> {
    let gray = image::imageops::grayscale(crop);
    let resized = image::imageops::resize(&gray, w, h, FilterType::Triangle);
    let mut tensor = Array::zeros(IxDyn(&[1, 1, h as usize, w as usize]));
    for (x, y, p) in resized.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = p[0] as f32 / 255.0;
    }
    tensor
}

/// Greedy CTC decode over a `[1, steps, classes]` (or `[steps, classes]`)
/// tensor: argmax per step, collapse adjacent repeats, skip class 0.
fn ctc_decode(dims: &[usize], data: &[f32], vocab: &[char]) -> Result<(String, f32)> {
    let (steps, classes) = match dims {
        [1, steps, classes] => (*steps, *classes),
        [steps, classes] => (*steps, *classes),
        other => bail!("unexpected recognizer output shape {other:?}"),
    };
    if classes < 2 {
        bail!("recognizer output has {classes} classes, need blank plus vocabulary");
    }
    if data.len() < steps * classes {
        bail!(
            "recognizer output holds {} values, shape needs {}",
            data.len(),
            steps * classes
        );
    }

    let mut text = String::new();
    let mut emitted = 0usize;
    let mut conf_sum = 0.0f32;
    let mut prev = 0usize;
    for step in 0..steps {
        let row = &data[step * classes..(step + 1) * classes];
        let (class, prob) = argmax(row);
        if class != 0 && class != prev {
            if let Some(&ch) = vocab.get(class - 1) {
                text.push(ch);
                emitted += 1;
                conf_sum += prob;
            }
        }
        prev = class;
    }

    let conf = if emitted == 0 {
        0.0
    } else {
        (conf_sum / emitted as f32).clamp(0.0, 1.0)
    };
    Ok((text, conf))
}

fn argmax(row: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_val = f32::MIN;
    for (i, &v) in row.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    (best, best_val)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_VOCAB: [char; 3] = ['A', 'B', 'C'];

    /// Rows of (blank, A, B, C) probabilities for each step.
    fn tensor(rows: &[[f32; 4]]) -> Vec<f32> {
        rows.iter().flatten().copied().collect()
    }

    #[test]
    fn decode_emits_argmax_characters() {
        let data = tensor(&[
            [0.1, 0.8, 0.05, 0.05], // A
            [0.9, 0.03, 0.03, 0.04],
            [0.1, 0.1, 0.7, 0.1], // B
            [0.1, 0.1, 0.1, 0.7], // C
        ]);
        let (text, conf) = ctc_decode(&[1, 4, 4], &data, &TEST_VOCAB).unwrap();
        assert_eq!(text, "ABC");
        let expected = (0.8 + 0.7 + 0.7) / 3.0;
        assert!((conf - expected).abs() < 1e-6);
    }

    #[test]
    fn decode_collapses_repeats_unless_blank_separated() {
        let data = tensor(&[
            [0.1, 0.8, 0.05, 0.05], // A
            [0.1, 0.8, 0.05, 0.05], // A again, collapsed
            [0.9, 0.03, 0.03, 0.04],
            [0.1, 0.8, 0.05, 0.05], // A after blank, kept
        ]);
        let (text, _) = ctc_decode(&[1, 4, 4], &data, &TEST_VOCAB).unwrap();
        assert_eq!(text, "AA");
    }

    #[test]
    fn decode_all_blank_is_empty_with_zero_conf() {
        let data = tensor(&[[0.9, 0.03, 0.03, 0.04], [0.9, 0.03, 0.03, 0.04]]);
        let (text, conf) = ctc_decode(&[2, 4], &data, &TEST_VOCAB).unwrap();
        assert!(text.is_empty());
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn decode_ignores_classes_past_the_vocabulary() {
        // class 3 has no vocab entry when only two characters are known
        let data = tensor(&[[0.1, 0.1, 0.1, 0.7], [0.1, 0.8, 0.05, 0.05]]);
        let (text, _) = ctc_decode(&[1, 2, 4], &data, &['A', 'B']).unwrap();
        assert_eq!(text, "A");
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        assert!(ctc_decode(&[1, 2, 3, 4], &[0.0; 24], &TEST_VOCAB).is_err());
        assert!(ctc_decode(&[4, 1], &[0.0; 4], &TEST_VOCAB).is_err());
        assert!(ctc_decode(&[1, 4, 4], &[0.0; 8], &TEST_VOCAB).is_err());
    }

    #[test]
    fn gray_tensor_shape_and_range() {
        let crop = RgbImage::from_pixel(50, 20, image::Rgb([255, 0, 0]));
        let t = gray_tensor(&crop, 200, 64);
        assert_eq!(t.shape(), &[1, 1, 64, 200]);
        assert!(t.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn default_config_matches_the_model_contract() {
        let cfg = CtcConfig::new("models/plate_rec.onnx", ComputeProvider::Cpu);
        assert_eq!(cfg.input_width, 200);
        assert_eq!(cfg.input_height, 64);
        assert_eq!(cfg.vocab.chars().count(), 37);
        assert!(cfg.vocab.starts_with("0123456789"));
    }
}
