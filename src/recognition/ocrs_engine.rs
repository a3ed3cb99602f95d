//! Pure-Rust OCR over `.rten` models.
//!
//! Loads the ocrs detection/recognition model pair from an explicit
//! directory or the conventional `~/.cache/ocrs` location. The engine reads
//! whole lines; per-line confidence is not surfaced by the text API, so each
//! line carries a fixed nominal value the same way the classical detector
//! reports a fixed box confidence.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbImage;
use ocrs::{ImageSource, OcrEngineParams};
use rten::Model;
use tracing::info;

use super::{OcrCandidate, ReadText};

const NOMINAL_CONF: f32 = 0.9;
const DETECTION_MODEL: &str = "text-detection.rten";
const RECOGNITION_MODEL: &str = "text-recognition.rten";

#[derive(Debug, Clone, Default)]
pub struct OcrsConfig {
    /// Directory holding the model pair; `~/.cache/ocrs` when absent.
    pub model_dir: Option<PathBuf>,
}

pub struct OcrsEngine {
    engine: ocrs::OcrEngine,
}

impl OcrsEngine {
    pub fn new(cfg: &OcrsConfig) -> Result<Self> {
        let dir = match &cfg.model_dir {
            Some(dir) => dir.clone(),
            None => default_model_dir()?,
        };
        let detection_model = load_model(&dir.join(DETECTION_MODEL))?;
        let recognition_model = load_model(&dir.join(RECOGNITION_MODEL))?;
        let engine = ocrs::OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .context("constructing ocrs engine")?;
        info!(models = %dir.display(), "ocrs recognizer ready");
        Ok(Self { engine })
    }
}

impl ReadText for OcrsEngine {
    fn read(&mut self, crop: &RgbImage) -> Result<Vec<OcrCandidate>> {
        let source = ImageSource::from_bytes(crop.as_raw(), crop.dimensions())
            .context("wrapping crop for ocr")?;
        let input = self
            .engine
            .prepare_input(source)
            .context("preparing ocr input")?;
        let text = self.engine.get_text(&input).context("reading crop")?;
        Ok(lines_to_candidates(&text))
    }
}

fn default_model_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("home directory not resolvable")?;
    Ok(home.join(".cache").join("ocrs"))
}

fn load_model(path: &Path) -> Result<Model> {
    Model::load_file(path).with_context(|| format!("loading ocr model {}", path.display()))
}

/// One candidate per non-empty trimmed line of engine output.
fn lines_to_candidates(text: &str) -> Vec<OcrCandidate> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| OcrCandidate {
            text: line.to_string(),
            conf: NOMINAL_CONF,
        })
        .collect()
}
