//! License plate monitor for one camera stream.
//!
//! Resolves the camera from the shared document, wires a [`CameraPipeline`]
//! with the configured detector and OCR engine, and logs every classified
//! plate. Runtime knobs come from `LPR_*` environment variables; the display
//! relay address from `REDIS_URL`.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use platewatch::config::{CameraDocument, RuntimeOptions};
use platewatch::detection::PlateDetector;
use platewatch::pipeline::{CameraPipeline, LogSink};
use platewatch::recognition::{CtcConfig, OcrEngine, OcrsConfig, ReadText};
use platewatch::roi::MaskStore;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// platewatch - realtime license plate monitor
#[derive(Parser, Debug)]
#[command(author, version, about = "platewatch - realtime license plate monitor", long_about = None)]
struct Args {
    /// Camera document (JSON)
    #[arg(long, default_value = "config/cameras.json")]
    cameras: PathBuf,

    /// Camera name within the document
    #[arg(short, long)]
    camera: String,

    /// Plate detection ONNX model
    #[arg(long, default_value = "models/plate_det.onnx")]
    det_model: PathBuf,

    /// CTC recognition ONNX model
    #[arg(long, default_value = "models/plate_rec.onnx")]
    ocr_model: PathBuf,

    /// Directory with the ocrs model pair (default ~/.cache/ocrs)
    #[arg(long)]
    ocrs_models: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let rt = RuntimeOptions::from_env()?;
    let document = CameraDocument::load(&args.cameras)?;
    let cam = document.resolve(&args.camera)?;
    let masks = MaskStore::from_document(&document);

    info!(
        camera = %cam.name,
        url = %cam.source_url,
        detector = ?rt.detector_kind,
        ocr = ?rt.ocr_kind,
        "platewatch starting"
    );

    let detector = PlateDetector::from_options(&rt, &args.det_model)?;
    let ctc = CtcConfig::new(&args.ocr_model, rt.ocr_provider);
    let ocrs = OcrsConfig {
        model_dir: args.ocrs_models.clone(),
    };
    let engine_rt = rt.clone();

    let mut pipeline = CameraPipeline::new(cam, &masks, &rt, detector, move |_| {
        let engine = OcrEngine::from_options(&engine_rt, &ctc, &ocrs)?;
        Ok(Box::new(engine) as Box<dyn ReadText + Send>)
    });

    pipeline.start();
    let mut sink = LogSink;
    pipeline.run(&mut sink);
    pipeline.join();
    Ok(())
}
