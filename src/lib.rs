// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod capture; // camera stream ingest
pub mod classify; // plate text normalization + classification
pub mod config; // runtime options and camera documents
pub mod detection; // plate detector strategies
pub mod display; // rate-limited frame relay
pub mod pipeline; // per-camera orchestrator
pub mod queue; // bounded queue wrappers
pub mod recognition; // OCR engines and worker pool
pub mod roi; // mask store and application

pub use crate::capture::FramePacket;
pub use crate::classify::{classify_plate, normalize_plate, PlateKind};
pub use crate::config::{
    CameraConfig, ComputeProvider, DetectorKind, OcrKind, OcrPreproc, RuntimeOptions,
};
pub use crate::detection::PlateDetector;
pub use crate::pipeline::{CameraPipeline, PlateEvent, PlateSink};
pub use crate::queue::{BlockingBoundedQueue, DropOldestQueue};
pub use crate::roi::{MaskConfig, MaskStore, MaskTarget};

/// An axis-aligned plate candidate box in the pixel coordinates of the frame
/// it was computed against, with a confidence in [0, 1].
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize)]
pub struct PlateBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

impl PlateBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }

    pub fn y1(&self) -> f32 {
        self.y1
    }

    pub fn x2(&self) -> f32 {
        self.x2
    }

    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn intersection_area(&self, another: &PlateBox) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    pub fn union(&self, another: &PlateBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &PlateBox) -> f32 {
        let u = self.union(another);
        if u <= 0.0 {
            return 0.0;
        }
        self.intersection_area(another) / u
    }

    /// Clamp to a `width` x `height` frame. Returns `None` when the clamped
    /// box degenerates (zero or negative extent), so callers never see a box
    /// violating `0 <= x1 < x2 <= width`, `0 <= y1 < y2 <= height`.
    pub fn clamped(&self, width: f32, height: f32) -> Option<PlateBox> {
        let x1 = self.x1.max(0.0).min(width);
        let y1 = self.y1.max(0.0).min(height);
        let x2 = self.x2.max(0.0).min(width);
        let y2 = self.y2.max(0.0).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(PlateBox::new(x1, y1, x2, y2, self.confidence))
    }
}

/// Greedy IoU suppression, highest confidence first.
pub fn non_max_suppression(xs: &mut Vec<PlateBox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| {
        b2.confidence()
            .partial_cmp(&b1.confidence())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = PlateBox::new(10.0, 10.0, 50.0, 30.0, 0.9);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = PlateBox::new(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = PlateBox::new(20.0, 20.0, 30.0, 30.0, 0.8);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_keeps_highest_confidence_of_overlapping_pair() {
        let mut boxes = vec![
            PlateBox::new(0.0, 0.0, 100.0, 40.0, 0.7),
            PlateBox::new(2.0, 2.0, 102.0, 42.0, 0.9),
            PlateBox::new(300.0, 0.0, 400.0, 40.0, 0.5),
        ];
        non_max_suppression(&mut boxes, 0.45);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].confidence(), 0.9);
        assert_eq!(boxes[1].confidence(), 0.5);
    }

    #[test]
    fn clamped_rejects_degenerate_boxes() {
        let off_frame = PlateBox::new(700.0, 20.0, 800.0, 60.0, 0.9);
        assert!(off_frame.clamped(640.0, 480.0).is_none());

        let partial = PlateBox::new(-20.0, -10.0, 50.0, 30.0, 0.9);
        let c = partial.clamped(640.0, 480.0).unwrap();
        assert_eq!((c.x1(), c.y1()), (0.0, 0.0));
        assert_eq!((c.x2(), c.y2()), (50.0, 30.0));
    }
}
