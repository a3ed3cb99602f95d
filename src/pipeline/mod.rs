//! Per-camera pipeline orchestration.
//!
//! A [`CameraPipeline`] owns the queues and the threads around them: the
//! capture thread feeding the frame queue, the OCR pool behind the task
//! queue, and the best-effort display publisher. The steady-state loop takes
//! one frame at a time, runs detection, hands crops to the pool and drains
//! whatever results are ready; it never waits for a specific crop to come
//! back, so a slow OCR engine costs latency, not frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;
use tracing::{info, warn};

use crate::capture::{spawn_capture, CapturePolicy, FramePacket};
use crate::classify::{classify_plate, PlateKind};
use crate::config::{CameraConfig, RuntimeOptions};
use crate::detection::{Detect, PlateDetector};
use crate::display::DisplayPublisher;
use crate::queue::{BlockingBoundedQueue, DropOldestQueue};
use crate::recognition::{OcrPool, OcrResult, OcrTask, ReadText};
use crate::roi::{apply_mask, crop_box, MaskConfig, MaskStore, MaskTarget};
use crate::PlateBox;

/// How long one loop iteration waits for a frame before re-checking the stop
/// flag.
const FRAME_WAIT: Duration = Duration::from_millis(500);
/// Box color for the debug overlay.
const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Builds one OCR engine per worker thread.
pub type OcrEngineFactory = Arc<dyn Fn(usize) -> Result<Box<dyn ReadText + Send>> + Send + Sync>;

/// One recognized, classified plate.
#[derive(Debug, Clone, Serialize)]
pub struct PlateEvent {
    pub kind: PlateKind,
    pub plate: String,
    pub conf: f32,
    pub src_name: String,
    pub bbox: PlateBox,
}

/// Receives classified plates. The default sink logs one line per event;
/// deployments substitute storage or barrier hardware.
pub trait PlateSink: Send {
    fn deliver(&mut self, event: PlateEvent);
}

/// One log line per recognized plate.
#[derive(Debug, Default)]
pub struct LogSink;

impl PlateSink for LogSink {
    fn deliver(&mut self, event: PlateEvent) {
        info!(
            "[{}] {} -> {} (conf={:.2})",
            event.src_name, event.kind, event.plate, event.conf
        );
    }
}

pub struct CameraPipeline {
    cam: CameraConfig,
    rt: RuntimeOptions,
    mask: Option<MaskConfig>,
    detector: PlateDetector,
    engine_factory: OcrEngineFactory,
    frames: DropOldestQueue<FramePacket>,
    ocr_in: BlockingBoundedQueue<OcrTask>,
    ocr_out: BlockingBoundedQueue<OcrResult>,
    publisher: Option<DisplayPublisher>,
    show_debug: bool,
    stop: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    pool: Option<OcrPool>,
}

impl CameraPipeline {
    /// Wire a pipeline for `cam`. Threads are not started until [`start`];
    /// the display publisher is built here but connects lazily, so a missing
    /// relay only surfaces as publish warnings.
    ///
    /// [`start`]: CameraPipeline::start
    pub fn new<F>(
        cam: CameraConfig,
        masks: &MaskStore,
        rt: &RuntimeOptions,
        detector: PlateDetector,
        engine_factory: F,
    ) -> Self
    where
        F: Fn(usize) -> Result<Box<dyn ReadText + Send>> + Send + Sync + 'static,
    {
        let mask = masks.get(&cam.mask_name).cloned();
        let show_debug = cam.show_debug_window || rt.show_debug_windows;

        let publisher = match cam.display.as_ref().filter(|d| d.enabled) {
            Some(display) => match DisplayPublisher::for_camera(display, &cam.name) {
                Ok(publisher) => Some(publisher),
                Err(e) => {
                    warn!(camera = %cam.name, error = %e, "display relay unavailable");
                    None
                }
            },
            None => None,
        };
        if show_debug && publisher.is_none() {
            warn!(camera = %cam.name, "debug overlay enabled but no display channel configured");
        }

        Self {
            frames: DropOldestQueue::with_capacity(rt.capture_queue_size),
            ocr_in: BlockingBoundedQueue::with_capacity(rt.detect_queue_size),
            ocr_out: BlockingBoundedQueue::with_capacity(rt.detect_queue_size),
            cam,
            rt: rt.clone(),
            mask,
            detector,
            engine_factory: Arc::new(engine_factory),
            publisher,
            show_debug,
            stop: Arc::new(AtomicBool::new(false)),
            capture: None,
            pool: None,
        }
    }

    /// Start the capture thread and the OCR pool.
    pub fn start(&mut self) {
        info!(camera = %self.cam.name, workers = self.rt.ocr_workers, "starting pipeline");
        self.start_ocr();
        self.start_capture();
    }

    fn start_capture(&mut self) {
        let policy = CapturePolicy::from_drop_flag(self.rt.drop_frames_when_busy);
        self.capture = Some(spawn_capture(
            self.cam.name.clone(),
            self.cam.source_url.clone(),
            self.frames.clone(),
            policy,
            Arc::clone(&self.stop),
        ));
    }

    fn start_ocr(&mut self) {
        let factory = Arc::clone(&self.engine_factory);
        self.pool = Some(OcrPool::spawn(
            self.rt.ocr_workers,
            self.rt.ocr_preproc,
            move |worker| factory(worker),
            self.ocr_in.clone(),
            self.ocr_out.clone(),
            Arc::clone(&self.stop),
        ));
    }

    /// Drive the loop until [`stop`] is called.
    ///
    /// [`stop`]: CameraPipeline::stop
    pub fn run(&mut self, sink: &mut dyn PlateSink) {
        while !self.stop.load(Ordering::Relaxed) {
            self.step(sink);
        }
        info!(camera = %self.cam.name, "pipeline loop exited");
    }

    /// One loop iteration: at most one frame in, any ready results out.
    fn step(&mut self, sink: &mut dyn PlateSink) {
        if let Some(packet) = self.frames.recv_timeout(FRAME_WAIT) {
            self.process_packet(packet);
        }
        self.drain_results(sink);
    }

    fn process_packet(&mut self, packet: FramePacket) {
        let analysis = apply_mask(&packet.frame, self.mask.as_ref(), MaskTarget::Analysis);

        let boxes = match self.detector.detect(&analysis) {
            Ok(boxes) => boxes,
            Err(e) => {
                warn!(camera = %self.cam.name, error = %e, "detector failed on frame");
                Vec::new()
            }
        };

        for bb in &boxes {
            let Some(crop) = crop_box(&analysis, bb) else {
                continue;
            };
            let task = OcrTask {
                crop,
                src_name: packet.src_name.clone(),
                bbox: bb.clone(),
            };
            // blocks when the pool is saturated; capture keeps the frame
            // queue fresh in the meantime
            if !self.ocr_in.send(task) {
                warn!(camera = %self.cam.name, "ocr task queue closed");
                break;
            }
        }

        if let Some(publisher) = self.publisher.as_mut() {
            if self.show_debug {
                let overlay = draw_boxes(&analysis, &boxes);
                publisher.maybe_publish(&overlay, "debug");
            } else {
                let shown = apply_mask(&packet.frame, self.mask.as_ref(), MaskTarget::Display);
                publisher.maybe_publish(&shown, "raw");
            }
        }
    }

    fn drain_results(&mut self, sink: &mut dyn PlateSink) {
        while let Some(result) = self.ocr_out.try_recv() {
            if result.text.is_empty() || result.conf < self.rt.ocr_conf_threshold {
                continue;
            }
            let Some((kind, plate)) = classify_plate(&result.text) else {
                continue;
            };
            sink.deliver(PlateEvent {
                kind,
                plate,
                conf: result.conf,
                src_name: result.src_name,
                bbox: result.bbox,
            });
        }
    }

    /// Flag every thread to wind down. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Handle for signaling stop from outside the run loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Stop and wait for the capture thread and the OCR pool.
    pub fn join(mut self) {
        self.stop();
        if let Some(capture) = self.capture.take() {
            let _ = capture.join();
        }
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
    }
}

/// Copy of `frame` with hollow rectangles over the detections.
fn draw_boxes(frame: &RgbImage, boxes: &[PlateBox]) -> RgbImage {
    let mut out = frame.clone();
    for bb in boxes {
        let w = (bb.width().round() as u32).max(1);
        let h = (bb.height().round() as u32).max(1);
        let rect = Rect::at(bb.x1().round() as i32, bb.y1().round() as i32).of_size(w, h);
        draw_hollow_rect_mut(&mut out, rect, OVERLAY_COLOR);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;

    use super::*;
    use crate::detection::CascadeDetector;
    use crate::recognition::OcrCandidate;

    #[derive(Default)]
    struct VecSink {
        events: Vec<PlateEvent>,
    }

    impl PlateSink for VecSink {
        fn deliver(&mut self, event: PlateEvent) {
            self.events.push(event);
        }
    }

    struct StubReader {
        text: &'static str,
        conf: f32,
    }

    impl ReadText for StubReader {
        fn read(&mut self, _crop: &RgbImage) -> Result<Vec<OcrCandidate>> {
            Ok(vec![OcrCandidate {
                text: self.text.to_string(),
                conf: self.conf,
            }])
        }
    }

    fn camera() -> CameraConfig {
        CameraConfig {
            name: "cam-test".to_string(),
            source_url: "rtsp://unused".to_string(),
            mask_name: "cam-test".to_string(),
            show_debug_window: false,
            display: None,
        }
    }

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            detector_kind: crate::config::DetectorKind::Cascade,
            ocr_workers: 1,
            ocr_preproc: crate::config::OcrPreproc::None,
            ..RuntimeOptions::default()
        }
    }

    /// Frame with one bright plate-shaped region full of dark vertical bars,
    /// the texture the cascade scan is tuned for.
    fn plate_frame() -> RgbImage {
        let mut frame = RgbImage::from_pixel(320, 160, Rgb([120, 120, 120]));
        for y in 60..100 {
            for x in 60..220 {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        for bar_x in (68..212).step_by(8) {
            for dx in 0..3 {
                for y in 64..96 {
                    frame.put_pixel(bar_x + dx, y, Rgb([20, 20, 20]));
                }
            }
        }
        frame
    }

    fn packet(frame: RgbImage) -> FramePacket {
        FramePacket {
            frame,
            ts: Utc::now(),
            seq: 0,
            src_name: "cam-test".to_string(),
        }
    }

    fn pipeline(text: &'static str, conf: f32) -> CameraPipeline {
        CameraPipeline::new(
            camera(),
            &MaskStore::default(),
            &options(),
            PlateDetector::Cascade(CascadeDetector::new()),
            move |_| Ok(Box::new(StubReader { text, conf }) as Box<dyn ReadText + Send>),
        )
    }

    #[test]
    fn civil_plate_flows_end_to_end() {
        let mut pipe = pipeline("A123BC77", 0.8);
        let mut sink = VecSink::default();

        pipe.start_ocr();
        assert_eq!(pipe.frames.push(packet(plate_frame())), crate::queue::PushOutcome::Queued);
        pipe.step(&mut sink);

        let deadline = Instant::now() + Duration::from_secs(3);
        while sink.events.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            pipe.drain_results(&mut sink);
        }

        assert_eq!(sink.events.len(), 1, "exactly one event for one detection");
        let event = &sink.events[0];
        assert_eq!(event.kind, PlateKind::Civil);
        assert_eq!(event.plate, "А123ВС77");
        assert_eq!(event.src_name, "cam-test");
        assert!((event.conf - 0.8).abs() < 1e-6);
        assert!(event.bbox.x2() <= 320.0 && event.bbox.y2() <= 160.0);

        pipe.stop();
        pipe.join();
    }

    #[test]
    fn frame_without_plates_produces_no_work() {
        let mut pipe = pipeline("A123BC77", 0.8);
        let mut sink = VecSink::default();

        let flat = RgbImage::from_pixel(320, 240, Rgb([90, 90, 90]));
        pipe.frames.push(packet(flat));
        pipe.step(&mut sink);

        assert!(pipe.ocr_in.is_empty(), "no crops queued for a flat frame");
        assert!(sink.events.is_empty());
        pipe.join();
    }

    #[test]
    fn low_confidence_and_unclassifiable_results_are_dropped() {
        let mut pipe = pipeline("unused", 0.0);
        let mut sink = VecSink::default();
        let bbox = PlateBox::new(10.0, 10.0, 60.0, 30.0, 0.7);

        // below the confidence floor
        pipe.ocr_out.send(OcrResult {
            text: "A123BC77".to_string(),
            conf: 0.2,
            src_name: "cam-test".to_string(),
            bbox: bbox.clone(),
        });
        // confident but not a plate
        pipe.ocr_out.send(OcrResult {
            text: "HELLO".to_string(),
            conf: 0.9,
            src_name: "cam-test".to_string(),
            bbox: bbox.clone(),
        });
        // confident, classifiable
        pipe.ocr_out.send(OcrResult {
            text: "B456EE99".to_string(),
            conf: 0.9,
            src_name: "cam-test".to_string(),
            bbox,
        });

        pipe.drain_results(&mut sink);

        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events[0].plate, "В456ЕЕ99");
        assert_eq!(sink.events[0].kind, PlateKind::Civil);
        pipe.join();
    }

    #[test]
    fn overlay_stays_inside_the_frame() {
        let frame = RgbImage::from_pixel(100, 60, Rgb([0, 0, 0]));
        let boxes = vec![PlateBox::new(10.0, 10.0, 40.0, 25.0, 0.9)];
        let out = draw_boxes(&frame, &boxes);
        assert_eq!(out.dimensions(), frame.dimensions());
        assert_eq!(*out.get_pixel(10, 10), OVERLAY_COLOR);
        assert_eq!(*out.get_pixel(5, 5), Rgb([0, 0, 0]));
    }
}
