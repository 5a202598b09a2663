//! Chunk delivery
//!
//! Handlers run synchronously on the worker thread, after the chunk file
//! has been written and closed. The next segment is not read until the
//! handler returns, so handlers should hand work off rather than process
//! the chunk inline.

use crate::error::CaptureError;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;

/// A completed chunk file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkReady {
    /// The file is owned by the consumer from here on; the engine never
    /// reads it again
    pub path: PathBuf,
    pub chunk_index: u32,
    pub session_id: String,
    pub frames: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub rms_level: f32,
}

impl ChunkReady {
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate.max(1) as f64
    }
}

/// Consumer of completed chunks
pub trait ChunkHandler: Send + Sync {
    fn on_chunk(&self, chunk: &ChunkReady) -> anyhow::Result<()>;
}

/// `(chunk_path, chunk_index, session_id)` callbacks
impl<F> ChunkHandler for F
where
    F: Fn(&Path, u32, &str) -> anyhow::Result<()> + Send + Sync,
{
    fn on_chunk(&self, chunk: &ChunkReady) -> anyhow::Result<()> {
        self(&chunk.path, chunk.chunk_index, &chunk.session_id)
    }
}

/// Bounded channel delivery; blocks the worker while the channel is full
impl ChunkHandler for SyncSender<ChunkReady> {
    fn on_chunk(&self, chunk: &ChunkReady) -> anyhow::Result<()> {
        self.send(chunk.clone())
            .map_err(|_| anyhow::anyhow!("chunk receiver was dropped"))
    }
}

/// Handler that only logs, for callers with no consumer
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl ChunkHandler for LogHandler {
    fn on_chunk(&self, chunk: &ChunkReady) -> anyhow::Result<()> {
        tracing::info!(
            "Chunk {} ready: {:?} ({:.1}s, rms {:.5})",
            chunk.chunk_index,
            chunk.path,
            chunk.duration_secs(),
            chunk.rms_level
        );
        Ok(())
    }
}

/// Run the handler, turning errors and panics into `CallbackError`
pub(crate) fn deliver(handler: &dyn ChunkHandler, chunk: &ChunkReady) -> Result<(), CaptureError> {
    match catch_unwind(AssertUnwindSafe(|| handler.on_chunk(chunk))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CaptureError::CallbackError(format!("{:#}", e))),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(CaptureError::CallbackError(format!("panic: {}", message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    fn chunk(index: u32) -> ChunkReady {
        ChunkReady {
            path: PathBuf::from("/tmp/m1_chunk_0000.wav"),
            chunk_index: index,
            session_id: "m1".into(),
            frames: 88200,
            sample_rate: 44100,
            channels: 2,
            rms_level: 0.0,
        }
    }

    #[test]
    fn test_closure_receives_triple() {
        let seen = AtomicU32::new(99);
        let handler = |path: &Path, index: u32, session: &str| -> anyhow::Result<()> {
            assert_eq!(session, "m1");
            assert!(path.ends_with("m1_chunk_0000.wav"));
            seen.store(index, Ordering::SeqCst);
            Ok(())
        };
        deliver(&handler, &chunk(5)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_channel_handler() {
        let (tx, rx) = mpsc::sync_channel(1);
        deliver(&tx, &chunk(0)).unwrap();
        assert_eq!(rx.recv().unwrap().chunk_index, 0);

        drop(rx);
        assert!(matches!(
            deliver(&tx, &chunk(1)),
            Err(CaptureError::CallbackError(_))
        ));
    }

    #[test]
    fn test_error_is_wrapped() {
        let handler = |_: &Path, _: u32, _: &str| -> anyhow::Result<()> {
            anyhow::bail!("transcriber offline")
        };
        let err = deliver(&handler, &chunk(0)).unwrap_err();
        assert_eq!(
            err,
            CaptureError::CallbackError("transcriber offline".into())
        );
    }

    #[test]
    fn test_panic_is_caught() {
        let handler = |_: &Path, _: u32, _: &str| -> anyhow::Result<()> { panic!("boom") };
        let err = deliver(&handler, &chunk(0)).unwrap_err();
        assert_eq!(err, CaptureError::CallbackError("panic: boom".into()));
    }

    #[test]
    fn test_duration() {
        assert_eq!(chunk(0).duration_secs(), 2.0);
    }
}
