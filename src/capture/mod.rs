//! Frame acquisition from RTSP or file sources.
//!
//! One capture thread per camera drives an FFmpeg graph that converts the
//! stream to rgb24 and hands each frame to a [`CaptureFilter`]. The filter
//! validates the frame, wraps it in a [`FramePacket`] and enqueues it without
//! ever blocking the decode loop. A failed first open is fatal for the
//! thread; once a stream has opened, any later error is retried after a
//! short pause.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::queue::{DropOldestQueue, PushOutcome};

/// Pause between reconnect attempts once a stream has been open.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// One decoded frame with its provenance.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub frame: RgbImage,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub src_name: String,
}

/// What a capture thread does with a frame when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    /// Evict the oldest queued frame to make room.
    EvictOldest,
    /// Drop the new frame, keep the backlog.
    SkipNewest,
}

impl CapturePolicy {
    pub fn from_drop_flag(drop_frames_when_busy: bool) -> Self {
        if drop_frames_when_busy {
            CapturePolicy::EvictOldest
        } else {
            CapturePolicy::SkipNewest
        }
    }
}

/// Hand `packet` to `queue` according to `policy`. Never blocks.
fn enqueue_frame(
    queue: &DropOldestQueue<FramePacket>,
    policy: CapturePolicy,
    packet: FramePacket,
) -> PushOutcome {
    match policy {
        CapturePolicy::EvictOldest => queue.push(packet),
        CapturePolicy::SkipNewest => queue.offer(packet),
    }
}

/// FFmpeg frame filter: rgb24 frames -> [`FramePacket`] queue.
struct CaptureFilter {
    camera: String,
    queue: DropOldestQueue<FramePacket>,
    policy: CapturePolicy,
    stop: Arc<AtomicBool>,
    seq: Arc<AtomicU64>,
    count: usize,
    dropped: usize,
    shed: usize,
    total: usize,
    last: Instant,
}

impl CaptureFilter {
    fn new(
        camera: String,
        queue: DropOldestQueue<FramePacket>,
        policy: CapturePolicy,
        stop: Arc<AtomicBool>,
        seq: Arc<AtomicU64>,
    ) -> Self {
        Self {
            camera,
            queue,
            policy,
            stop,
            seq,
            count: 0,
            dropped: 0,
            shed: 0,
            total: 0,
            last: Instant::now(),
        }
    }
}

impl FrameFilter for CaptureFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!(camera = %self.camera, "decode filter ready");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            return Err("capture stopped".to_string());
        }

        unsafe {
            self.total += 1;

            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as u32;
            let h = (*frame.as_ptr()).height as u32;
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                self.dropped += 1;
                return Ok(None);
            }

            let decode_error_flags = (*frame.as_ptr()).decode_error_flags;
            // missing reference frames / invalid bitstream
            if decode_error_flags & 0x03 != 0 {
                self.dropped += 1;
                return Ok(None);
            }

            let data = (*frame.as_ptr()).data[0];
            let stride = (*frame.as_ptr()).linesize[0] as usize;
            let row_len = w as usize * 3;
            if data.is_null() || stride < row_len {
                self.dropped += 1;
                return Ok(None);
            }

            // rgb24 is a single plane; copy row by row to strip the stride
            let mut buffer = vec![0u8; row_len * h as usize];
            for y in 0..h as usize {
                let src = std::slice::from_raw_parts(data.add(y * stride), row_len);
                buffer[y * row_len..(y + 1) * row_len].copy_from_slice(src);
            }
            let rgb = match RgbImage::from_raw(w, h, buffer) {
                Some(img) => img,
                None => {
                    self.dropped += 1;
                    return Ok(None);
                }
            };

            self.count += 1;
            let packet = FramePacket {
                frame: rgb,
                ts: Utc::now(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                src_name: self.camera.clone(),
            };
            if enqueue_frame(&self.queue, self.policy, packet) != PushOutcome::Queued {
                self.shed += 1;
            }

            if self.last.elapsed().as_secs_f64() >= 1.0 {
                let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
                debug!(
                    camera = %self.camera,
                    fps = format_args!("{fps:.1}"),
                    total = self.total,
                    dropped = self.dropped,
                    shed = self.shed,
                    "capture stats"
                );
                self.last = Instant::now();
                self.count = 0;
            }

            Ok(Some(frame))
        }
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!(camera = %self.camera, "decode filter closed");
    }
}

enum StreamEnd {
    /// The graph could not be built or started.
    NeverOpened(String),
    /// The graph ran and then stopped, cleanly or not.
    Ended(Option<String>),
}

fn run_stream(url: &str, filter: CaptureFilter) -> StreamEnd {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("capture", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let ctx = match FfmpegContext::builder()
        .input(url)
        .filter_desc("format=rgb24")
        .output(out)
        .build()
    {
        Ok(ctx) => ctx,
        Err(e) => return StreamEnd::NeverOpened(e.to_string()),
    };
    let sch = match ctx.start() {
        Ok(sch) => sch,
        Err(e) => return StreamEnd::NeverOpened(e.to_string()),
    };
    match sch.wait() {
        Ok(()) => StreamEnd::Ended(None),
        Err(e) => StreamEnd::Ended(Some(e.to_string())),
    }
}

/// Start the capture thread for one camera.
pub fn spawn_capture(
    camera: String,
    url: String,
    queue: DropOldestQueue<FramePacket>,
    policy: CapturePolicy,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        info!(camera = %camera, url = %url, "connecting to stream");
        let seq = Arc::new(AtomicU64::new(0));
        let mut opened_once = false;

        while !stop.load(Ordering::Relaxed) {
            let filter = CaptureFilter::new(
                camera.clone(),
                queue.clone(),
                policy,
                Arc::clone(&stop),
                Arc::clone(&seq),
            );
            match run_stream(&url, filter) {
                StreamEnd::NeverOpened(err) if !opened_once => {
                    error!(camera = %camera, error = %err, "failed to open stream");
                    return;
                }
                StreamEnd::NeverOpened(err) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!(camera = %camera, error = %err, "reconnect failed, retrying");
                }
                StreamEnd::Ended(err) => {
                    opened_once = true;
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match err {
                        Some(err) => {
                            warn!(camera = %camera, error = %err, "stream error, reconnecting")
                        }
                        None => warn!(camera = %camera, "stream ended, reconnecting"),
                    }
                }
            }
            std::thread::sleep(RETRY_PAUSE);
        }
        info!(camera = %camera, "capture thread exiting");
    })
}
