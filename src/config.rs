// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Runtime tunables and the per-camera configuration document.
//!
//! `RuntimeOptions` is constructed once before a pipeline starts and never
//! mutated afterwards; every worker receives it by value or `Arc`. The camera
//! document is plain JSON keyed by camera name, loaded once by the binary.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::roi::MaskConfig;

/// Compute provider used for detector / OCR inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeProvider {
    Cpu,
    Cuda,
    /// Accepted for compatibility; registers no extra execution provider.
    Openvino,
}

impl FromStr for ComputeProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ComputeProvider::Cpu),
            "cuda" => Ok(ComputeProvider::Cuda),
            "openvino" => Ok(ComputeProvider::Openvino),
            other => bail!("unknown compute provider: {other:?}"),
        }
    }
}

/// Plate detector strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Classical edge-density scan, fixed nominal confidence.
    Cascade,
    /// ONNX model with letterbox pre/post-processing.
    Neural,
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cascade" | "haar" => Ok(DetectorKind::Cascade),
            "neural" | "onnx" | "onnx_yolo" => Ok(DetectorKind::Neural),
            other => bail!("unknown detector kind: {other:?}"),
        }
    }
}

/// OCR engine strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrKind {
    /// ONNX recognition model with greedy CTC decoding.
    Ctc,
    /// Pure-Rust `ocrs` engine over `.rten` models.
    Ocrs,
}

impl FromStr for OcrKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ctc" => Ok(OcrKind::Ctc),
            "ocrs" => Ok(OcrKind::Ocrs),
            other => bail!("unknown OCR kind: {other:?}"),
        }
    }
}

/// Crop preprocessing applied before OCR inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrPreproc {
    None,
    Clahe,
    AdaptiveThresh,
}

impl FromStr for OcrPreproc {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(OcrPreproc::None),
            "clahe" => Ok(OcrPreproc::Clahe),
            "adaptive_thresh" => Ok(OcrPreproc::AdaptiveThresh),
            other => bail!("unknown OCR preprocessing mode: {other:?}"),
        }
    }
}

/// Immutable pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Capture -> orchestrator frame queue capacity.
    pub capture_queue_size: usize,
    /// OCR-in / OCR-out queue capacity.
    pub detect_queue_size: usize,
    /// Number of OCR worker threads.
    pub ocr_workers: usize,
    pub detector_provider: ComputeProvider,
    pub ocr_provider: ComputeProvider,
    pub detector_batch_size: usize,
    /// Full frame queue: evict the oldest entry (true) or skip the new frame.
    pub drop_frames_when_busy: bool,
    pub show_debug_windows: bool,
    pub ocr_preproc: OcrPreproc,
    pub det_conf_threshold: f32,
    pub ocr_conf_threshold: f32,
    pub detector_kind: DetectorKind,
    pub ocr_kind: OcrKind,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            capture_queue_size: 5,
            detect_queue_size: 12,
            ocr_workers: 2,
            detector_provider: ComputeProvider::Cuda,
            ocr_provider: ComputeProvider::Cuda,
            detector_batch_size: 1,
            drop_frames_when_busy: true,
            show_debug_windows: false,
            ocr_preproc: OcrPreproc::Clahe,
            det_conf_threshold: 0.5,
            ocr_conf_threshold: 0.5,
            detector_kind: DetectorKind::Neural,
            ocr_kind: OcrKind::Ctc,
        }
    }
}

impl RuntimeOptions {
    /// Defaults overridden from `LPR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut rt = Self::default();
        rt.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(rt)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("LPR_OCR_WORKERS") {
            self.ocr_workers = v
                .parse()
                .with_context(|| format!("LPR_OCR_WORKERS: not an integer: {v:?}"))?;
        }
        if let Some(v) = lookup("LPR_DET_PROVIDER") {
            self.detector_provider = v.parse().context("LPR_DET_PROVIDER")?;
        }
        if let Some(v) = lookup("LPR_OCR_PROVIDER") {
            self.ocr_provider = v.parse().context("LPR_OCR_PROVIDER")?;
        }
        if let Some(v) = lookup("LPR_DETECTOR") {
            self.detector_kind = v.parse().context("LPR_DETECTOR")?;
        }
        if let Some(v) = lookup("LPR_OCR") {
            self.ocr_kind = v.parse().context("LPR_OCR")?;
        }
        if let Some(v) = lookup("LPR_DEBUG") {
            self.show_debug_windows = v == "1";
        }
        Ok(())
    }
}

/// Display relay settings for one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_enabled")]
    pub enabled: bool,
    /// Relay channel name; `lpr:<camera>:display` when absent.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_fps_limit")]
    pub fps_limit: u32,
}

fn default_display_enabled() -> bool {
    true
}

fn default_fps_limit() -> u32 {
    10
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: default_display_enabled(),
            channel: None,
            fps_limit: default_fps_limit(),
        }
    }
}

impl DisplayConfig {
    /// The resolved relay channel for `camera`.
    pub fn channel_for(&self, camera: &str) -> String {
        match &self.channel {
            Some(c) => c.clone(),
            None => format!("lpr:{camera}:display"),
        }
    }
}

/// Resolved settings for one camera, handed to the pipeline.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub source_url: String,
    /// Key into the mask store; by convention the camera name itself.
    pub mask_name: String,
    pub show_debug_window: bool,
    pub display: Option<DisplayConfig>,
}

/// One entry of the camera document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEntry {
    pub url: String,
    #[serde(default)]
    pub debug_window: bool,
    #[serde(default)]
    pub mask: Option<MaskConfig>,
    #[serde(default)]
    pub display: Option<DisplayConfig>,
}

/// The camera configuration document: `{"cameras": {"<name>": {...}}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraDocument {
    #[serde(default)]
    pub cameras: HashMap<String, CameraEntry>,
}

impl CameraDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("malformed camera document")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading camera document {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Resolve one camera into the settings the pipeline consumes.
    pub fn resolve(&self, name: &str) -> Result<CameraConfig> {
        let entry = self
            .cameras
            .get(name)
            .with_context(|| format!("camera {name:?} not present in document"))?;
        Ok(CameraConfig {
            name: name.to_string(),
            source_url: entry.url.clone(),
            mask_name: name.to_string(),
            show_debug_window: entry.debug_window,
            display: entry.display.clone(),
        })
    }
}
