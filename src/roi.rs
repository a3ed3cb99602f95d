//! Per-camera region-of-interest masking.
//!
//! A mask is declared in the camera document and applied to frames before
//! detection (`analysis`) or before relaying (`display`). Masking never
//! fails: out-of-range crops are clamped and unusable polygons are ignored.

use std::collections::{HashMap, HashSet};

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

use crate::config::CameraDocument;
use crate::PlateBox;

/// Which pipeline stage a mask applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskTarget {
    Analysis,
    Display,
}

/// Mask declaration for one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_apply_to")]
    pub apply_to: Vec<MaskTarget>,
    /// `[x, y, width, height]` crop applied after the polygon.
    #[serde(default)]
    pub crop: Option<[i32; 4]>,
    /// Polygon vertices `[[x, y], ...]`; pixels outside are blacked out.
    #[serde(default)]
    pub polygon: Option<Vec<[i32; 2]>>,
}

fn default_enabled() -> bool {
    true
}

fn default_apply_to() -> Vec<MaskTarget> {
    vec![MaskTarget::Analysis]
}

impl MaskConfig {
    pub fn applies_to(&self, target: MaskTarget) -> bool {
        self.enabled && self.apply_to.contains(&target)
    }
}

/// All masks of a deployment, keyed by camera name.
#[derive(Debug, Clone, Default)]
pub struct MaskStore {
    masks: HashMap<String, MaskConfig>,
}

impl MaskStore {
    pub fn from_document(doc: &CameraDocument) -> Self {
        let masks = doc
            .cameras
            .iter()
            .filter_map(|(name, entry)| entry.mask.clone().map(|m| (name.clone(), m)))
            .collect();
        Self { masks }
    }

    pub fn get(&self, camera: &str) -> Option<&MaskConfig> {
        self.masks.get(camera)
    }

    pub fn insert(&mut self, camera: impl Into<String>, mask: MaskConfig) {
        self.masks.insert(camera.into(), mask);
    }
}

/// Apply `mask` to `frame` for `target`. Returns an untouched copy when the
/// mask is absent, disabled or aimed at a different target.
pub fn apply_mask(frame: &RgbImage, mask: Option<&MaskConfig>, target: MaskTarget) -> RgbImage {
    let mask = match mask {
        Some(m) if m.applies_to(target) => m,
        _ => return frame.clone(),
    };

    let mut out = frame.clone();
    if let Some(points) = mask.polygon.as_deref().and_then(polygon_points) {
        out = blackout_outside(&out, &points);
    }
    if let Some(crop) = mask.crop {
        if let Some((x, y, w, h)) = clamp_crop(crop, out.width(), out.height()) {
            out = image::imageops::crop_imm(&out, x, y, w, h).to_image();
        }
    }
    out
}

/// Crop the pixels under `bb` out of `frame`. None when the box does not
/// intersect the frame.
pub fn crop_box(frame: &RgbImage, bb: &PlateBox) -> Option<RgbImage> {
    let clamped = bb.clamped(frame.width() as f32, frame.height() as f32)?;
    let x = clamped.x1().floor().max(0.0) as u32;
    let y = clamped.y1().floor().max(0.0) as u32;
    let w = (clamped.width().ceil() as u32).max(1).min(frame.width() - x);
    let h = (clamped.height().ceil() as u32).max(1).min(frame.height() - y);
    Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Validate and open the polygon: consecutive duplicates and a closing vertex
/// are removed, fewer than three distinct vertices disables it.
fn polygon_points(raw: &[[i32; 2]]) -> Option<Vec<Point<i32>>> {
    let mut pts: Vec<Point<i32>> = Vec::with_capacity(raw.len());
    for p in raw {
        let candidate = Point::new(p[0], p[1]);
        if pts.last() != Some(&candidate) {
            pts.push(candidate);
        }
    }
    while pts.len() > 1 && pts.first() == pts.last() {
        pts.pop();
    }
    let distinct: HashSet<(i32, i32)> = pts.iter().map(|p| (p.x, p.y)).collect();
    if distinct.len() < 3 {
        return None;
    }
    Some(pts)
}

fn blackout_outside(frame: &RgbImage, points: &[Point<i32>]) -> RgbImage {
    let mut stencil = GrayImage::new(frame.width(), frame.height());
    draw_polygon_mut(&mut stencil, points, Luma([255u8]));

    let mut out = frame.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if stencil.get_pixel(x, y)[0] == 0 {
            *pixel = Rgb([0, 0, 0]);
        }
    }
    out
}

/// Clamp `[x, y, w, h]` into the frame, keeping at least one pixel. None only
/// for an empty frame.
fn clamp_crop(crop: [i32; 4], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let (fw, fh) = (i64::from(width), i64::from(height));
    let x = i64::from(crop[0]).clamp(0, fw - 1);
    let y = i64::from(crop[1]).clamp(0, fh - 1);
    let w = i64::from(crop[2]).clamp(1, fw - x);
    let h = i64::from(crop[3]).clamp(1, fh - y);
    Some((x as u32, y as u32, w as u32, h as u32))
}
