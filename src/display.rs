//! Best-effort frame relay for live viewing.
//!
//! Frames are JPEG-encoded and published on a per-camera pub/sub channel as
//! `kind|bytes`; an HTTP edge re-streams them as multipart MJPEG. The
//! publisher never queues and never blocks the analysis loop: a frame that
//! arrives before the minimum interval has passed is dropped, and a failed
//! publish is logged and forgotten.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use redis::Commands;
use tracing::{debug, warn};

use crate::config::DisplayConfig;

const JPEG_QUALITY: u8 = 80;
/// Separator between the kind tag and the image bytes.
const PAYLOAD_SEP: u8 = b'|';
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Where encoded frames go. [`RedisRelay`] in production; tests record.
pub trait FrameRelay: Send {
    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()>;
}

/// Redis pub/sub relay with lazy connection. A publish error drops the
/// connection so the next attempt reconnects.
pub struct RedisRelay {
    client: redis::Client,
    conn: Option<redis::Connection>,
}

impl RedisRelay {
    /// `url` falls back to `REDIS_URL`, then to the local default.
    pub fn new(url: Option<&str>) -> Result<Self> {
        let url = match url {
            Some(u) => u.to_string(),
            None => std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
        };
        let client =
            redis::Client::open(url.as_str()).with_context(|| format!("invalid redis url {url:?}"))?;
        Ok(Self { client, conn: None })
    }

    fn connection(&mut self) -> Result<&mut redis::Connection> {
        if self.conn.is_none() {
            debug!("connecting to display relay");
            let fresh = self.client.get_connection().context("connecting to redis")?;
            self.conn = Some(fresh);
        }
        self.conn.as_mut().context("redis connection missing")
    }
}

impl FrameRelay for RedisRelay {
    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        let conn = self.connection()?;
        let sent: redis::RedisResult<()> = conn.publish(channel, payload);
        match sent {
            Ok(()) => Ok(()),
            Err(e) => {
                self.conn = None;
                Err(anyhow::Error::new(e).context("publishing frame"))
            }
        }
    }
}

/// Rate-limited publisher for one camera's display channel.
pub struct DisplayPublisher {
    relay: Box<dyn FrameRelay>,
    channel: String,
    min_interval: Duration,
    last_publish: Option<Instant>,
}

impl DisplayPublisher {
    pub fn new(relay: Box<dyn FrameRelay>, channel: impl Into<String>, fps_limit: u32) -> Self {
        Self {
            relay,
            channel: channel.into(),
            min_interval: Duration::from_secs_f64(1.0 / f64::from(fps_limit.max(1))),
            last_publish: None,
        }
    }

    /// Publisher for `camera` backed by the redis relay.
    pub fn for_camera(cfg: &DisplayConfig, camera: &str) -> Result<Self> {
        let relay = RedisRelay::new(None)?;
        Ok(Self::new(Box::new(relay), cfg.channel_for(camera), cfg.fps_limit))
    }

    /// Encode and publish `frame` tagged `kind`, unless the previous publish
    /// was less than one interval ago. Encode and relay failures are logged,
    /// never retried.
    pub fn maybe_publish(&mut self, frame: &RgbImage, kind: &str) {
        let now = Instant::now();
        if let Some(last) = self.last_publish {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }
        self.last_publish = Some(now);

        let payload = match encode_payload(frame, kind) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "frame encode failed");
                return;
            }
        };
        if let Err(e) = self.relay.publish(&self.channel, &payload) {
            warn!(channel = %self.channel, error = %e, "display publish failed");
        }
    }
}

/// `kind|jpeg-bytes`, the framing the MJPEG edge expects.
fn encode_payload(frame: &RgbImage, kind: &str) -> Result<Vec<u8>> {
    let mut payload = Vec::from(kind.as_bytes());
    payload.push(PAYLOAD_SEP);
    let encoder = JpegEncoder::new_with_quality(&mut payload, JPEG_QUALITY);
    encoder
        .write_image(
            frame.as_raw(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .context("jpeg encoding failed")?;
    Ok(payload)
}
