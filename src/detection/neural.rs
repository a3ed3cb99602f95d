// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! ONNX plate detector.
//!
//! Frames are letterboxed to 640x640 (grey padding, centered), run through
//! the model, and the `[num, 6]` output rows (`x1, y1, x2, y2, conf, cls` in
//! letterbox space) are mapped back into original frame coordinates before
//! NMS.

use std::path::Path;

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use tracing::{info, warn};

use crate::config::ComputeProvider;
use crate::{non_max_suppression, PlateBox};

const INPUT_SIZE: u32 = 640;
const IOU_THRESHOLD: f32 = 0.45;
/// Grey value used for letterbox padding.
const PAD_VALUE: u8 = 114;
const DEVICE_ID: i32 = 0;
const INTRA_THREADS: usize = 4;
const INTER_THREADS: usize = 1;

/// How a frame was placed onto the model canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
    pub ratio: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

pub struct NeuralDetector {
    session: Session,
    output_name: String,
    conf_threshold: f32,
}

impl NeuralDetector {
    pub fn new(model_path: &Path, provider: ComputeProvider, conf_threshold: f32) -> Result<Self> {
        let (session, provider_label) = create_session(model_path, provider)?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("detector model has no outputs")?;
        info!(
            model = %model_path.display(),
            provider = provider_label,
            "plate detector ready"
        );
        Ok(Self {
            session,
            output_name,
            conf_threshold,
        })
    }

    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<PlateBox>> {
        let (orig_w, orig_h) = (frame.width() as f32, frame.height() as f32);
        let (tensor, lb) = letterbox_tensor(frame, INPUT_SIZE)?;
        let input = Value::from_array(tensor)?;
        let outputs = self.session.run(ort::inputs![input])?;
        let value = outputs
            .get(self.output_name.as_str())
            .with_context(|| format!("detector output {:?} missing", self.output_name))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("extracting detector output")?;
        let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();

        let mut boxes = decode_rows(&dims, data, &lb, orig_w, orig_h, self.conf_threshold)?;
        non_max_suppression(&mut boxes, IOU_THRESHOLD);
        Ok(boxes)
    }
}

/// Build the ONNX session for `provider`, falling back to CPU when the
/// preferred provider cannot be configured.
pub(crate) fn create_session(
    model_path: &Path,
    provider: ComputeProvider,
) -> Result<(Session, &'static str)> {
    match provider {
        ComputeProvider::Cuda => try_cuda(model_path),
        ComputeProvider::Openvino => {
            warn!(
                model = %model_path.display(),
                "openvino support not compiled in, using CPU"
            );
            try_cpu(model_path)
        }
        ComputeProvider::Cpu => try_cpu(model_path),
    }
}

fn try_cuda(model_path: &Path) -> Result<(Session, &'static str)> {
    info!(model = %model_path.display(), "attempting CUDA session");
    let result = Session::builder()
        .context("creating session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("setting optimization level")?
        .with_intra_threads(INTRA_THREADS)
        .context("setting intra threads")?
        .with_inter_threads(INTER_THREADS)
        .context("setting inter threads")?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(DEVICE_ID)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("registering execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA")),
        Err(e) => {
            warn!(error = %e, "CUDA session failed, using CPU");
            try_cpu(model_path)
        }
    }
}

fn try_cpu(model_path: &Path) -> Result<(Session, &'static str)> {
    let session = Session::builder()
        .context("creating session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("setting optimization level")?
        .with_intra_threads(INTRA_THREADS)
        .context("setting intra threads")?
        .with_inter_threads(INTER_THREADS)
        .context("setting inter threads")?
        .commit_from_file(model_path)
        .with_context(|| format!("loading model {}", model_path.display()))?;
    Ok((session, "CPU"))
}

/// Letterbox `frame` onto a `size`x`size` grey canvas and convert to an NCHW
/// tensor scaled to [0, 1].
fn letterbox_tensor(frame: &RgbImage, size: u32) -> Result<(Array<f32, IxDyn>, Letterbox)> {
    let (w, h) = frame.dimensions();
    let ratio = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * ratio).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * ratio).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let src = fr::images::ImageRef::new(w, h, frame.as_raw(), fr::PixelType::U8x3)
        .context("wrapping frame for resize")?;
    let mut dst = fr::images::Image::new(new_w, new_h, fr::PixelType::U8x3);
    let mut resizer = fr::Resizer::new();
    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("letterbox resize failed")?;
    let raw = dst.buffer();

    let side = size as usize;
    let mut tensor = Array::from_elem(IxDyn(&[1, 3, side, side]), PAD_VALUE as f32 / 255.0);
    let (px, py) = (pad_x as usize, pad_y as usize);
    for y in 0..new_h as usize {
        for x in 0..new_w as usize {
            let idx = (y * new_w as usize + x) * 3;
            tensor[[0, 0, py + y, px + x]] = raw[idx] as f32 / 255.0;
            tensor[[0, 1, py + y, px + x]] = raw[idx + 1] as f32 / 255.0;
            tensor[[0, 2, py + y, px + x]] = raw[idx + 2] as f32 / 255.0;
        }
    }

    Ok((
        tensor,
        Letterbox {
            ratio,
            pad_x,
            pad_y,
        },
    ))
}

/// Map raw output rows back into original frame coordinates.
fn decode_rows(
    dims: &[usize],
    data: &[f32],
    lb: &Letterbox,
    orig_w: f32,
    orig_h: f32,
    conf_threshold: f32,
) -> Result<Vec<PlateBox>> {
    let (rows, cols) = match dims {
        [n, c] => (*n, *c),
        [1, n, c] => (*n, *c),
        other => bail!("unexpected detector output shape {other:?}"),
    };
    if cols < 6 {
        bail!("detector output rows too short: {cols} columns");
    }

    let mut boxes = Vec::new();
    for i in 0..rows {
        let row = &data[i * cols..(i + 1) * cols];
        let conf = row[4];
        if conf < conf_threshold {
            continue;
        }
        let x1 = (row[0] - lb.pad_x as f32) / lb.ratio;
        let y1 = (row[1] - lb.pad_y as f32) / lb.ratio;
        let x2 = (row[2] - lb.pad_x as f32) / lb.ratio;
        let y2 = (row[3] - lb.pad_y as f32) / lb.ratio;
        if let Some(bb) = PlateBox::new(x1, y1, x2, y2, conf).clamped(orig_w, orig_h) {
            boxes.push(bb);
        }
    }
    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn letterbox_wide_frame_pads_top_and_bottom() {
        let frame = RgbImage::from_pixel(1280, 720, Rgb([255, 0, 0]));
        let (tensor, lb) = letterbox_tensor(&frame, 640).unwrap();

        assert_eq!(lb.ratio, 0.5);
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 140);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);

        // padding rows keep the grey fill
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 639, 639]] - 114.0 / 255.0).abs() < 1e-6);
        // image rows carry the red frame
        assert!((tensor[[0, 0, 140, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 140, 0]].abs() < 1e-6);
    }

    #[test]
    fn letterbox_tall_frame_pads_sides() {
        let frame = RgbImage::from_pixel(360, 640, Rgb([0, 0, 0]));
        let (_, lb) = letterbox_tensor(&frame, 640).unwrap();
        assert_eq!(lb.ratio, 1.0);
        assert_eq!(lb.pad_x, 140);
        assert_eq!(lb.pad_y, 0);
    }

    #[test]
    fn decode_maps_letterbox_coords_back() {
        let lb = Letterbox {
            ratio: 0.5,
            pad_x: 0,
            pad_y: 140,
        };
        let data = [100.0, 240.0, 200.0, 290.0, 0.9, 0.0];
        let boxes = decode_rows(&[1, 6], &data, &lb, 1280.0, 720.0, 0.5).unwrap();
        assert_eq!(boxes.len(), 1);
        let bb = &boxes[0];
        assert_eq!(bb.x1(), 200.0);
        assert_eq!(bb.y1(), 200.0);
        assert_eq!(bb.x2(), 400.0);
        assert_eq!(bb.y2(), 300.0);
        assert_eq!(bb.confidence(), 0.9);
    }

    #[test]
    fn decode_accepts_batched_layout_and_filters_conf() {
        let lb = Letterbox {
            ratio: 1.0,
            pad_x: 0,
            pad_y: 0,
        };
        let data = [
            10.0, 10.0, 50.0, 30.0, 0.8, 0.0, // kept
            10.0, 10.0, 50.0, 30.0, 0.2, 0.0, // below threshold
        ];
        let boxes = decode_rows(&[1, 2, 6], &data, &lb, 640.0, 640.0, 0.5).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].confidence(), 0.8);
    }

    #[test]
    fn decode_drops_boxes_outside_frame() {
        let lb = Letterbox {
            ratio: 1.0,
            pad_x: 100,
            pad_y: 0,
        };
        // entirely inside the left padding: maps to negative coordinates
        let data = [10.0, 10.0, 60.0, 30.0, 0.9, 0.0];
        let boxes = decode_rows(&[1, 6], &data, &lb, 640.0, 640.0, 0.5).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_shape() {
        let lb = Letterbox {
            ratio: 1.0,
            pad_x: 0,
            pad_y: 0,
        };
        assert!(decode_rows(&[6], &[0.0; 6], &lb, 640.0, 640.0, 0.5).is_err());
        assert!(decode_rows(&[1, 4], &[0.0; 4], &lb, 640.0, 640.0, 0.5).is_err());
    }
}
