//! Plate detection stage.
//!
//! Two interchangeable strategies behind one enum:
//! - NeuralDetector: ONNX model, letterboxed input, CUDA with CPU fallback
//! - CascadeDetector: classical edge-density scan, no model file

mod cascade;
mod neural;

use std::path::Path;

use anyhow::Result;
use image::RgbImage;

pub use cascade::CascadeDetector;
pub use neural::NeuralDetector;
pub(crate) use neural::create_session;

use crate::config::{DetectorKind, RuntimeOptions};
use crate::PlateBox;

/// Finds candidate plate regions in a frame.
pub trait Detect {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<PlateBox>>;
}

/// The closed set of detector strategies.
pub enum PlateDetector {
    Cascade(CascadeDetector),
    Neural(NeuralDetector),
}

impl PlateDetector {
    pub fn from_options(rt: &RuntimeOptions, model_path: &Path) -> Result<Self> {
        match rt.detector_kind {
            DetectorKind::Cascade => Ok(PlateDetector::Cascade(CascadeDetector::new())),
            DetectorKind::Neural => Ok(PlateDetector::Neural(NeuralDetector::new(
                model_path,
                rt.detector_provider,
                rt.det_conf_threshold,
            )?)),
        }
    }
}

impl Detect for PlateDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<PlateBox>> {
        match self {
            PlateDetector::Cascade(d) => d.detect(frame),
            PlateDetector::Neural(d) => d.detect(frame),
        }
    }
}
