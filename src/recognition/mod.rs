//! OCR over detected plate crops.
//!
//! A pool of worker threads pulls [`OcrTask`]s from a bounded queue, runs the
//! configured engine and always answers with one [`OcrResult`] per task. A
//! worker that cannot initialize its engine logs the failure and exits; the
//! rest of the pipeline keeps running.

mod ctc;
mod ocrs_engine;
mod preprocess;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use image::RgbImage;
use tracing::{debug, error, info, warn};

pub use ctc::{CtcConfig, CtcEngine};
pub use ocrs_engine::{OcrsConfig, OcrsEngine};
pub use preprocess::preprocess_crop;

use crate::config::{OcrKind, OcrPreproc, RuntimeOptions};
use crate::queue::BlockingBoundedQueue;
use crate::PlateBox;

/// Poll interval for the task queue; workers re-check their stop flag on
/// every timeout.
const TASK_POLL: Duration = Duration::from_millis(200);

/// Minimum character count for a reading to count as a plate.
const MIN_PLATE_CHARS: usize = 4;

/// One plate crop awaiting OCR.
#[derive(Debug, Clone)]
pub struct OcrTask {
    pub crop: RgbImage,
    pub src_name: String,
    pub bbox: PlateBox,
}

/// The pool's verdict for one crop. `text` is empty when nothing usable was
/// read.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub conf: f32,
    pub src_name: String,
    pub bbox: PlateBox,
}

/// One raw reading produced by an engine.
#[derive(Debug, Clone)]
pub struct OcrCandidate {
    pub text: String,
    pub conf: f32,
}

/// Reads text candidates off a prepared plate crop.
pub trait ReadText {
    fn read(&mut self, crop: &RgbImage) -> Result<Vec<OcrCandidate>>;
}

/// The closed set of OCR engines.
pub enum OcrEngine {
    Ctc(CtcEngine),
    Ocrs(OcrsEngine),
}

impl OcrEngine {
    pub fn from_options(rt: &RuntimeOptions, ctc: &CtcConfig, ocrs: &OcrsConfig) -> Result<Self> {
        match rt.ocr_kind {
            OcrKind::Ctc => Ok(OcrEngine::Ctc(CtcEngine::new(ctc)?)),
            OcrKind::Ocrs => Ok(OcrEngine::Ocrs(OcrsEngine::new(ocrs)?)),
        }
    }
}

impl ReadText for OcrEngine {
    fn read(&mut self, crop: &RgbImage) -> Result<Vec<OcrCandidate>> {
        match self {
            OcrEngine::Ctc(e) => e.read(crop),
            OcrEngine::Ocrs(e) => e.read(crop),
        }
    }
}

/// Best candidate by confidence among those long enough to be a plate.
/// `("", 0.0)` when none qualifies.
pub fn select_best(candidates: &[OcrCandidate]) -> (String, f32) {
    let mut best_text = String::new();
    let mut best_conf = 0.0f32;
    for c in candidates {
        if c.conf > best_conf && c.text.chars().count() >= MIN_PLATE_CHARS {
            best_text = c.text.clone();
            best_conf = c.conf;
        }
    }
    (best_text, best_conf)
}

/// OCR worker threads around a shared task queue.
pub struct OcrPool {
    handles: Vec<JoinHandle<()>>,
}

impl OcrPool {
    /// Start `workers` threads. Each builds its own engine via `factory`;
    /// a factory error is fatal for that worker only.
    pub fn spawn<F>(
        workers: usize,
        preproc: OcrPreproc,
        factory: F,
        tasks: BlockingBoundedQueue<OcrTask>,
        results: BlockingBoundedQueue<OcrResult>,
        stop: Arc<AtomicBool>,
    ) -> Self
    where
        F: Fn(usize) -> Result<Box<dyn ReadText + Send>> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let factory = Arc::clone(&factory);
            let tasks = tasks.clone();
            let results = results.clone();
            let stop = Arc::clone(&stop);
            handles.push(std::thread::spawn(move || {
                let mut engine = match factory(worker) {
                    Ok(engine) => {
                        info!(worker, "ocr worker ready");
                        engine
                    }
                    Err(e) => {
                        error!(worker, error = %e, "ocr engine init failed");
                        return;
                    }
                };
                run_worker(worker, &mut *engine, preproc, &tasks, &results, &stop);
            }));
        }
        Self { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    worker: usize,
    engine: &mut dyn ReadText,
    preproc: OcrPreproc,
    tasks: &BlockingBoundedQueue<OcrTask>,
    results: &BlockingBoundedQueue<OcrResult>,
    stop: &AtomicBool,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let task = match tasks.recv_timeout(TASK_POLL) {
            Some(task) => task,
            None => continue,
        };

        let prepared = preprocess_crop(&task.crop, preproc);
        let candidates = match engine.read(&prepared) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(worker, error = %e, "ocr read failed");
                Vec::new()
            }
        };
        let (text, conf) = select_best(&candidates);

        let delivered = results.send(OcrResult {
            text,
            conf,
            src_name: task.src_name,
            bbox: task.bbox,
        });
        if !delivered {
            break;
        }
    }
    debug!(worker, "ocr worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubReader {
        candidates: Vec<OcrCandidate>,
    }

    impl ReadText for StubReader {
        fn read(&mut self, _crop: &RgbImage) -> Result<Vec<OcrCandidate>> {
            Ok(self.candidates.clone())
        }
    }

    fn task() -> OcrTask {
        OcrTask {
            crop: RgbImage::new(8, 8),
            src_name: "cam".to_string(),
            bbox: PlateBox::new(0.0, 0.0, 8.0, 8.0, 0.9),
        }
    }

    #[test]
    fn select_best_requires_plate_length() {
        let candidates = vec![
            OcrCandidate {
                text: "X1".to_string(),
                conf: 0.99,
            },
            OcrCandidate {
                text: "A123BC77".to_string(),
                conf: 0.7,
            },
            OcrCandidate {
                text: "B456DE11".to_string(),
                conf: 0.6,
            },
        ];
        let (text, conf) = select_best(&candidates);
        assert_eq!(text, "A123BC77");
        assert_eq!(conf, 0.7);
    }

    #[test]
    fn select_best_empty_when_nothing_qualifies() {
        assert_eq!(select_best(&[]), (String::new(), 0.0));
        let short = vec![OcrCandidate {
            text: "АВ1".to_string(),
            conf: 0.95,
        }];
        assert_eq!(select_best(&short), (String::new(), 0.0));
    }

    #[test]
    fn pool_answers_every_task() {
        let tasks = BlockingBoundedQueue::with_capacity(8);
        let results = BlockingBoundedQueue::with_capacity(8);
        let stop = Arc::new(AtomicBool::new(false));

        let pool = OcrPool::spawn(
            2,
            OcrPreproc::None,
            |_| {
                Ok(Box::new(StubReader {
                    candidates: vec![OcrCandidate {
                        text: "A123BC77".to_string(),
                        conf: 0.8,
                    }],
                }) as Box<dyn ReadText + Send>)
            },
            tasks.clone(),
            results.clone(),
            Arc::clone(&stop),
        );

        for _ in 0..5 {
            assert!(tasks.send(task()));
        }
        let mut seen = 0;
        while seen < 5 {
            let r = results
                .recv_timeout(Duration::from_secs(2))
                .expect("result within timeout");
            assert_eq!(r.text, "A123BC77");
            assert_eq!(r.src_name, "cam");
            seen += 1;
        }

        stop.store(true, Ordering::Relaxed);
        pool.join();
    }

    #[test]
    fn failed_engine_init_kills_worker_only() {
        let tasks = BlockingBoundedQueue::with_capacity(2);
        let results: BlockingBoundedQueue<OcrResult> = BlockingBoundedQueue::with_capacity(2);
        let stop = Arc::new(AtomicBool::new(false));

        let pool = OcrPool::spawn(
            1,
            OcrPreproc::None,
            |_| anyhow::bail!("no such model"),
            tasks.clone(),
            results.clone(),
            Arc::clone(&stop),
        );

        assert!(tasks.send(task()));
        assert!(results.recv_timeout(Duration::from_millis(300)).is_none());

        stop.store(true, Ordering::Relaxed);
        pool.join();
    }
}
