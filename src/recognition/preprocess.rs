//! Crop conditioning ahead of OCR.
//!
//! Three modes: pass the crop through untouched, lift local contrast with
//! tile-based CLAHE followed by an edge-preserving blur, or binarize with an
//! adaptive threshold. Every mode hands the engines an RGB buffer so they
//! see one input format regardless of configuration.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::adaptive_threshold;
use imageproc::filter::bilateral_filter;

use crate::config::OcrPreproc;

/// CLAHE clip limit, as a multiple of the uniform histogram level.
const CLAHE_CLIP: f32 = 2.0;
/// CLAHE tile grid along each axis.
const CLAHE_TILES: u32 = 8;
const BILATERAL_WINDOW: u32 = 9;
const BILATERAL_SIGMA_COLOR: f32 = 75.0;
const BILATERAL_SIGMA_SPATIAL: f32 = 75.0;
/// Adaptive threshold block radius; the sampled block is 2r + 1 pixels wide.
const THRESH_BLOCK_RADIUS: u32 = 15;

/// Condition one plate crop for recognition.
pub fn preprocess_crop(crop: &RgbImage, mode: OcrPreproc) -> RgbImage {
    match mode {
        OcrPreproc::None => crop.clone(),
        OcrPreproc::Clahe => {
            let gray = image::imageops::grayscale(crop);
            let equalized = clahe(&gray, CLAHE_CLIP, CLAHE_TILES);
            let smoothed = bilateral_filter(
                &equalized,
                BILATERAL_WINDOW,
                BILATERAL_SIGMA_COLOR,
                BILATERAL_SIGMA_SPATIAL,
            );
            gray_to_rgb(&smoothed)
        }
        OcrPreproc::AdaptiveThresh => {
            let gray = image::imageops::grayscale(crop);
            let binary = adaptive_threshold(&gray, THRESH_BLOCK_RADIUS);
            gray_to_rgb(&binary)
        }
    }
}

fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    let mut out = RgbImage::new(gray.width(), gray.height());
    for (x, y, p) in gray.enumerate_pixels() {
        out.put_pixel(x, y, Rgb([p[0], p[0], p[0]]));
    }
    out
}

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into a `tiles` x `tiles` grid, each tile gets its own
/// clipped equalization curve, and every pixel blends the curves of its four
/// surrounding tile centers. The blending removes the visible tile seams a
/// per-tile remap would leave.
fn clahe(gray: &GrayImage, clip: f32, tiles: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }

    let tiles = tiles.max(1);
    let tile_w = w.div_ceil(tiles).max(1);
    let tile_h = h.div_ceil(tiles).max(1);
    let grid_x = w.div_ceil(tile_w);
    let grid_y = h.div_ceil(tile_h);

    let mut curves = vec![[0u8; 256]; (grid_x * grid_y) as usize];
    for ty in 0..grid_y {
        for tx in 0..grid_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let pixels = (x1 - x0) * (y1 - y0);
            curves[(ty * grid_x + tx) as usize] = clipped_equalization(&mut hist, pixels, clip);
        }
    }

    let mut out = GrayImage::new(w, h);
    let gx = grid_x as i64;
    let gy = grid_y as i64;
    for (x, y, p) in gray.enumerate_pixels() {
        let v = p[0] as usize;
        // position in tile-center coordinates
        let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let cx = fx.floor();
        let cy = fy.floor();
        let wx = fx - cx;
        let wy = fy - cy;
        let tx0 = (cx as i64).clamp(0, gx - 1) as u32;
        let tx1 = (cx as i64 + 1).clamp(0, gx - 1) as u32;
        let ty0 = (cy as i64).clamp(0, gy - 1) as u32;
        let ty1 = (cy as i64 + 1).clamp(0, gy - 1) as u32;

        let at = |tx: u32, ty: u32| curves[(ty * grid_x + tx) as usize][v] as f32;
        let top = at(tx0, ty0) * (1.0 - wx) + at(tx1, ty0) * wx;
        let bottom = at(tx0, ty1) * (1.0 - wx) + at(tx1, ty1) * wx;
        let blended = top * (1.0 - wy) + bottom * wy;
        out.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
    }
    out
}

/// Equalization curve for one tile: clip the histogram at `clip` times the
/// uniform level, spread the clipped excess over all bins, then map through
/// the cumulative distribution.
fn clipped_equalization(hist: &mut [u32; 256], pixels: u32, clip: f32) -> [u8; 256] {
    let mut curve = [0u8; 256];
    if pixels == 0 {
        for (i, v) in curve.iter_mut().enumerate() {
            *v = i as u8;
        }
        return curve;
    }

    let limit = ((clip * pixels as f32 / 256.0).max(1.0)) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let bump = excess / 256;
    let leftover = excess % 256;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += bump + u32::from((i as u32) < leftover);
    }

    let mut cdf = 0u64;
    for (i, v) in curve.iter_mut().enumerate() {
        cdf += hist[i] as u64;
        *v = ((cdf * 255) / pixels as u64).min(255) as u8;
    }
    curve
}
