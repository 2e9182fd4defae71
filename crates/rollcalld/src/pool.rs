//! Bounded extraction worker pool.
//!
//! Embedding extraction and gallery matching are the CPU-heavy part of
//! frame processing, so they run on dedicated OS threads behind a bounded
//! queue. `try_send` backpressure rejects frames when every worker is busy
//! and the queue is full; callers surface that as a 429 instead of
//! spawning unbounded work.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rollcall_core::{
    EmbeddingExtractor, ExtractionError, FrameMatch, FrameMatcher, GalleryEntry, NearestMatcher,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Builds one extractor per worker thread; ONNX sessions are not shared.
pub type ExtractorFactory =
    Arc<dyn Fn() -> Result<Box<dyn EmbeddingExtractor>, ExtractionError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("extraction queue full")]
    Saturated,
    #[error("extraction workers stopped")]
    Closed,
}

/// Result of extracting and matching one frame.
#[derive(Debug)]
pub struct FrameOutcome {
    pub faces_detected: usize,
    pub matches: Vec<FrameMatch>,
}

pub struct ExtractJob {
    pub session_id: Uuid,
    pub image: Vec<u8>,
    pub gallery: Arc<Vec<GalleryEntry>>,
    pub distance_threshold: f32,
    pub reply: oneshot::Sender<Result<FrameOutcome, ExtractionError>>,
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct ExtractorPool {
    tx: Sender<ExtractJob>,
}

impl ExtractorPool {
    /// Spawn `workers` named OS threads sharing one bounded queue.
    pub fn spawn(workers: usize, queue_depth: usize, factory: ExtractorFactory) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<ExtractJob>(queue_depth);

        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let factory = factory.clone();
            std::thread::Builder::new()
                .name(format!("rollcall-extract-{i}"))
                .spawn(move || worker_loop(rx, factory))
                .expect("failed to spawn extraction worker");
        }

        Self { tx }
    }

    /// Enqueue one frame without blocking; full queue rejects the frame.
    pub fn submit(&self, job: ExtractJob) -> Result<(), PoolError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed),
        }
    }
}

fn worker_loop(rx: Receiver<ExtractJob>, factory: ExtractorFactory) {
    let mut extractor = match factory() {
        Ok(e) => e,
        Err(err) => {
            tracing::error!(error = %err, "extractor init failed; worker exiting");
            return;
        }
    };
    tracing::info!("extraction worker started");

    while let Ok(job) = rx.recv() {
        let result = extractor.extract(&job.image).map(|faces| {
            let matches =
                NearestMatcher.match_frame(&faces, &job.gallery, job.distance_threshold);
            FrameOutcome {
                faces_detected: faces.len(),
                matches,
            }
        });
        if let Err(ref err) = result {
            tracing::debug!(session = %job.session_id, error = %err, "frame extraction errored");
        }
        // A dropped receiver means the submitter gave up; nothing to do.
        let _ = job.reply.send(result);
    }

    tracing::info!("extraction worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::DetectedFace;
    use std::sync::mpsc;
    use std::sync::Mutex;

    /// Extractor that signals when a job starts and blocks until released.
    struct GatedExtractor {
        started: mpsc::Sender<()>,
        release: Arc<Mutex<mpsc::Receiver<()>>>,
    }

    impl EmbeddingExtractor for GatedExtractor {
        fn extract(&mut self, _image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError> {
            let _ = self.started.send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(Vec::new())
        }
    }

    fn job(reply: oneshot::Sender<Result<FrameOutcome, ExtractionError>>) -> ExtractJob {
        ExtractJob {
            session_id: Uuid::new_v4(),
            image: vec![0u8],
            gallery: Arc::new(Vec::new()),
            distance_threshold: 0.5,
            reply,
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_with_saturated() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let factory: ExtractorFactory = {
            let release_rx = release_rx.clone();
            Arc::new(move || {
                Ok(Box::new(GatedExtractor {
                    started: started_tx.clone(),
                    release: release_rx.clone(),
                }) as Box<dyn EmbeddingExtractor>)
            })
        };
        let pool = ExtractorPool::spawn(1, 1, factory);

        // First job occupies the only worker...
        let (tx1, rx1) = oneshot::channel();
        pool.submit(job(tx1)).unwrap();
        started_rx.recv().unwrap();

        // ...second fills the queue, third must be rejected.
        let (tx2, rx2) = oneshot::channel();
        pool.submit(job(tx2)).unwrap();
        let (tx3, _rx3) = oneshot::channel();
        assert!(matches!(pool.submit(job(tx3)), Err(PoolError::Saturated)));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_extraction_error_is_delivered_not_fatal() {
        let factory: ExtractorFactory = Arc::new(|| {
            struct Failing;
            impl EmbeddingExtractor for Failing {
                fn extract(
                    &mut self,
                    _image: &[u8],
                ) -> Result<Vec<DetectedFace>, ExtractionError> {
                    Err(ExtractionError::InferenceFailed("boom".into()))
                }
            }
            Ok(Box::new(Failing) as Box<dyn EmbeddingExtractor>)
        });
        let pool = ExtractorPool::spawn(1, 4, factory);

        let (tx, rx) = oneshot::channel();
        pool.submit(job(tx)).unwrap();
        assert!(rx.await.unwrap().is_err());

        // The worker survives the failed frame.
        let (tx, rx) = oneshot::channel();
        pool.submit(job(tx)).unwrap();
        assert!(rx.await.unwrap().is_err());
    }
}
