//! Capture session engine
//!
//! A [`CaptureSession`] owns at most one background recording thread at a
//! time. Control calls (`start`, `pause`, `resume`, `stop`, `status`) may
//! come from any thread.
//!
//! # Architecture
//!
//! ```text
//! start ─ resolve device ─ probe (open+close) ─ spawn worker ─ wait for open
//!                                                   │
//!          segment reads ─→ ChunkBuffer ─→ WAV chunk ─→ ChunkHandler
//! ```
//!
//! Two locks are used. The lifecycle lock serializes `start`/`stop` and
//! owns the worker's join handle. The state lock guards everything
//! `status` reports and is only ever held briefly.

pub mod handler;
pub mod state;
pub mod worker;

pub use handler::{ChunkHandler, ChunkReady, LogHandler};
pub use state::{Phase, StartInfo, StatusSnapshot, StopSummary};
pub use worker::ChunkBuffer;

use crate::audio::StreamRequest;
use crate::config::{CaptureConfig, Config};
use crate::error::CaptureError;
use crate::registry::DeviceRegistry;
use crate::selector::DeviceSelector;
use state::SessionState;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use worker::{Worker, WorkerControl};

/// The running (or dead but not yet reaped) recording thread
struct ActiveWorker {
    handle: JoinHandle<()>,
    /// Disconnects when the thread exits
    done: Receiver<()>,
    control: Arc<WorkerControl>,
}

enum JoinOutcome {
    Finished,
    Panicked,
    TimedOut,
}

impl ActiveWorker {
    fn join_within(self, timeout: Duration) -> JoinOutcome {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => JoinOutcome::TimedOut,
            _ => match self.handle.join() {
                Ok(()) => JoinOutcome::Finished,
                Err(_) => JoinOutcome::Panicked,
            },
        }
    }
}

/// Chunked capture engine
pub struct CaptureSession {
    capture: CaptureConfig,
    chunk_dir: PathBuf,
    selector: DeviceSelector,
    state: Arc<Mutex<SessionState>>,
    lifecycle: Mutex<Option<ActiveWorker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CaptureSession {
    /// Build a session from the loaded configuration
    pub fn new(config: &Config, registry: Arc<DeviceRegistry>) -> Self {
        Self::with_selector(
            config.capture.clone(),
            config.chunk_dir(),
            DeviceSelector::new(registry, config.device.clone()),
        )
    }

    pub fn with_selector(
        capture: CaptureConfig,
        chunk_dir: impl Into<PathBuf>,
        selector: DeviceSelector,
    ) -> Self {
        Self {
            capture,
            chunk_dir: chunk_dir.into(),
            selector,
            state: Arc::new(Mutex::new(SessionState::default())),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }

    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }

    pub(crate) fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            sample_rate: self.capture.sample_rate,
            channels: self.capture.channels,
            read_timeout: self.capture.read_timeout(),
        }
    }

    /// Start recording.
    ///
    /// The device is opened once on the calling thread and closed again, so
    /// an unusable device fails here instead of inside the worker. When this
    /// returns `Ok` the worker has its stream open and the phase is
    /// `Recording`. A device that fails before that point is reported as an
    /// error here; one that fails afterwards ends the session on its own, and
    /// the failure shows up in `status()` and `stop()`.
    pub fn start<H>(
        &self,
        session_id: &str,
        handler: H,
        device_index: Option<usize>,
    ) -> Result<StartInfo, CaptureError>
    where
        H: ChunkHandler + 'static,
    {
        let mut lifecycle = lock(&self.lifecycle);
        if let Some(worker) = lifecycle.take() {
            if !worker.handle.is_finished() {
                *lifecycle = Some(worker);
                return Err(CaptureError::AlreadyRecording);
            }
            reap(worker);
        }
        if !lock(&self.state).phase.is_idle() {
            return Err(CaptureError::AlreadyRecording);
        }

        let (device_id, device) = self.selector.resolve(device_index)?;
        let backend = self
            .selector
            .registry()
            .backend_for(device.backend_kind)
            .ok_or_else(|| CaptureError::DeviceOpenFailed {
                device: device.display_name.clone(),
                reason: format!("no {} backend configured", device.backend_kind.label()),
            })?;

        let request = self.stream_request();
        let probed = backend.open(&device, &request).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;
        let negotiated = probed.config();
        drop(probed);

        let control = Arc::new(WorkerControl::new());
        let generation = {
            let mut state = lock(&self.state);
            let generation = state.begin(session_id, (device_id, device.clone()), negotiated);
            state.control = Some(Arc::clone(&control));
            generation
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = mpsc::channel();
        let worker = Worker {
            generation,
            session_id: session_id.to_string(),
            chunk_dir: self.chunk_dir.clone(),
            backend,
            device: device.clone(),
            request,
            capture: self.capture.clone(),
            handler: Box::new(handler),
            control: Arc::clone(&control),
            state: Arc::clone(&self.state),
        };

        let handle = match worker.spawn(ready_tx, done_tx) {
            Ok(handle) => handle,
            Err(e) => {
                lock(&self.state).finish();
                return Err(CaptureError::DeviceOpenFailed {
                    device: device.display_name,
                    reason: format!("failed to spawn capture thread: {}", e),
                });
            }
        };
        let active = ActiveWorker {
            handle,
            done: done_rx,
            control,
        };

        let granted = match ready_rx.recv_timeout(self.capture.read_timeout()) {
            Ok(Ok(granted)) => granted,
            Ok(Err(e)) => {
                tracing::error!("{}", e);
                active.control.request_stop();
                active.join_within(self.capture.stop_timeout());
                lock(&self.state).finish();
                return Err(e);
            }
            Err(_) => {
                active.control.request_stop();
                if let JoinOutcome::TimedOut = active.join_within(self.capture.stop_timeout()) {
                    tracing::warn!("Capture thread did not start or exit; detaching it");
                }
                lock(&self.state).finish();
                return Err(CaptureError::DeviceOpenFailed {
                    device: device.display_name,
                    reason: "capture thread failed to open the device in time".to_string(),
                });
            }
        };

        // A device can fail on its very first read, before this point
        let started = {
            let mut state = lock(&self.state);
            if state.generation == generation && state.phase.is_active() {
                if granted != negotiated {
                    tracing::debug!("Worker negotiated {:?} (probe had {:?})", granted, negotiated);
                    state.negotiated = Some(granted);
                }
                Ok(state.started_wall.unwrap_or_else(chrono::Utc::now))
            } else {
                Err(state.failure.clone().unwrap_or_else(|| {
                    CaptureError::AudioReadFailed(
                        state
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "capture ended while starting".to_string()),
                    )
                }))
            }
        };
        let started_at = match started {
            Ok(started_at) => started_at,
            Err(e) => {
                tracing::error!("{}", e);
                active.control.request_stop();
                active.join_within(self.capture.stop_timeout());
                lock(&self.state).finish();
                return Err(e);
            }
        };
        *lifecycle = Some(active);

        tracing::info!(
            "Recording session '{}' on [{}] {} ({} Hz, {} ch)",
            session_id,
            device_id,
            device,
            granted.sample_rate,
            granted.channels
        );

        Ok(StartInfo {
            session_id: session_id.to_string(),
            device_id,
            device: device.display_name.clone(),
            is_loopback: device.is_loopback,
            backend: device.backend_kind.label().to_string(),
            sample_rate: granted.sample_rate,
            channels: granted.channels,
            chunk_duration_secs: self.capture.chunk_duration_secs,
            started_at,
        })
    }

    /// Park the worker; buffered audio is kept for the next chunk
    pub fn pause(&self) -> Result<StatusSnapshot, CaptureError> {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Recording => {}
            Phase::Paused => return Err(CaptureError::AlreadyPaused),
            Phase::Idle | Phase::Stopping => return Err(CaptureError::NotRecording),
        }

        if let Some(ref control) = state.control {
            control.gate.set(false);
        }
        state.phase = Phase::Paused;
        tracing::info!("Recording paused");
        Ok(state.snapshot(self.capture.chunk_duration_secs))
    }

    pub fn resume(&self) -> Result<StatusSnapshot, CaptureError> {
        let mut state = lock(&self.state);
        if state.phase != Phase::Paused {
            return Err(CaptureError::NotPaused);
        }

        if let Some(ref control) = state.control {
            control.gate.set(true);
        }
        state.phase = Phase::Recording;
        tracing::info!("Recording resumed");
        Ok(state.snapshot(self.capture.chunk_duration_secs))
    }

    /// Stop recording, flush the partial chunk and join the worker.
    ///
    /// Also succeeds after the worker died on its own, reporting the error
    /// that killed it. A worker that does not exit within the stop timeout
    /// is detached and the session is reset anyway.
    pub fn stop(&self) -> Result<StopSummary, CaptureError> {
        let mut lifecycle = lock(&self.lifecycle);
        let worker = lifecycle.take().ok_or(CaptureError::NotRecording)?;

        {
            let mut state = lock(&self.state);
            if state.phase.is_active() {
                state.phase = Phase::Stopping;
            }
        }
        worker.control.request_stop();

        let timeout = self.capture.stop_timeout();
        let outcome = worker.join_within(timeout);

        let mut state = lock(&self.state);
        match outcome {
            JoinOutcome::Finished => {}
            JoinOutcome::Panicked => {
                if state.last_error.is_none() {
                    state.last_error = Some("capture worker panicked".to_string());
                }
            }
            JoinOutcome::TimedOut => {
                tracing::warn!(
                    "Capture worker did not stop within {:.1}s; detaching it",
                    timeout.as_secs_f64()
                );
            }
        }

        let summary = StopSummary {
            session_id: state.session_id.clone().unwrap_or_default(),
            total_chunks: state.chunk_index,
            duration_seconds: state.elapsed_secs().unwrap_or(0.0),
            last_error: state.last_error.clone(),
            last_chunk_level: state.last_chunk_level,
            chunk_duration_secs: self.capture.chunk_duration_secs,
        };
        state.finish();

        tracing::info!(
            "Recording session '{}' stopped: {} chunk(s), {:.1}s",
            summary.session_id,
            summary.total_chunks,
            summary.duration_seconds
        );
        Ok(summary)
    }

    /// Non-blocking snapshot of the session
    pub fn status(&self) -> StatusSnapshot {
        lock(&self.state).snapshot(self.capture.chunk_duration_secs)
    }

    /// Run `f` while holding the device exclusively.
    ///
    /// Fails with `AlreadyRecording` while a session is live; `start` waits
    /// until `f` returns.
    pub(crate) fn exclusive<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, CaptureError>,
    ) -> Result<T, CaptureError> {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
        {
            return Err(CaptureError::AlreadyRecording);
        }
        f(self)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let active = lock(&self.lifecycle).is_some();
        if active {
            if let Ok(summary) = self.stop() {
                tracing::debug!("Stopped session '{}' on drop", summary.session_id);
            }
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("chunk_dir", &self.chunk_dir)
            .field("phase", &self.status().phase)
            .finish()
    }
}

fn reap(worker: ActiveWorker) {
    if worker.handle.join().is_err() {
        tracing::warn!("Previous capture worker had panicked");
    }
}
