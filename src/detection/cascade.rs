//! Classical plate detector, used where no ONNX model is available.
//!
//! Plates are dense clusters of vertical strokes. The scan thresholds the
//! horizontal Sobel response, closes the gaps between character strokes and
//! keeps connected components with plate-like size and aspect ratio. Every
//! detection carries the same nominal confidence.

use std::collections::HashMap;

use anyhow::Result;
use image::{GrayImage, Luma, RgbImage};
use imageproc::gradients::horizontal_sobel;
use imageproc::morphology::{close, Norm};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::{non_max_suppression, PlateBox};

const EDGE_THRESHOLD: i16 = 80;
const CLOSE_RADIUS: u8 = 3;
const MIN_WIDTH: u32 = 40;
const MIN_HEIGHT: u32 = 12;
const MIN_ASPECT: f32 = 2.0;
const MAX_ASPECT: f32 = 8.0;
const NOMINAL_CONF: f32 = 0.6;
const IOU_THRESHOLD: f32 = 0.45;

#[derive(Default)]
pub struct CascadeDetector;

impl CascadeDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<PlateBox>> {
        let gray = image::imageops::grayscale(frame);
        let edges = edge_mask(&gray);
        let merged = close(&edges, Norm::LInf, CLOSE_RADIUS);
        let mut boxes = component_boxes(&merged, frame.width() as f32, frame.height() as f32);
        non_max_suppression(&mut boxes, IOU_THRESHOLD);
        Ok(boxes)
    }
}

/// Binary mask of strong vertical edges.
fn edge_mask(gray: &GrayImage) -> GrayImage {
    let sobel = horizontal_sobel(gray);
    let mut mask = GrayImage::new(gray.width(), gray.height());
    for (x, y, p) in sobel.enumerate_pixels() {
        if p[0].abs() >= EDGE_THRESHOLD {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

fn component_boxes(mask: &GrayImage, frame_w: f32, frame_h: f32) -> Vec<PlateBox> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    // per-label bounding extents (x0, y0, x1, y1)
    let mut bounds: HashMap<u32, (u32, u32, u32, u32)> = HashMap::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p[0];
        if label == 0 {
            continue;
        }
        let entry = bounds.entry(label).or_insert((x, y, x, y));
        entry.0 = entry.0.min(x);
        entry.1 = entry.1.min(y);
        entry.2 = entry.2.max(x);
        entry.3 = entry.3.max(y);
    }

    let mut boxes = Vec::new();
    for (x0, y0, x1, y1) in bounds.into_values() {
        let w = x1 - x0 + 1;
        let h = y1 - y0 + 1;
        if w < MIN_WIDTH || h < MIN_HEIGHT {
            continue;
        }
        let aspect = w as f32 / h as f32;
        if !(MIN_ASPECT..=MAX_ASPECT).contains(&aspect) {
            continue;
        }
        let candidate = PlateBox::new(
            x0 as f32,
            y0 as f32,
            (x1 + 1) as f32,
            (y1 + 1) as f32,
            NOMINAL_CONF,
        );
        if let Some(bb) = candidate.clamped(frame_w, frame_h) {
            boxes.push(bb);
        }
    }
    boxes
}
