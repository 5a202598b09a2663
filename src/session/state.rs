//! State machine for capture sessions
//!
//! Idle -> Recording -> Paused -> Recording -> Stopping -> Idle

use super::worker::WorkerControl;
use crate::audio::{DeviceDescriptor, NegotiatedConfig};
use crate::error::CaptureError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle phase of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No session, no worker thread
    #[default]
    Idle,
    /// Worker is reading segments and emitting chunks
    Recording,
    /// Worker is parked on the resume gate; buffered audio is kept
    Paused,
    /// Stop was signalled, waiting for the worker to flush and exit
    Stopping,
}

impl Phase {
    pub fn is_idle(self) -> bool {
        self == Phase::Idle
    }

    /// Recording or paused
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Recording | Phase::Paused)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Recording => write!(f, "recording"),
            Phase::Paused => write!(f, "paused"),
            Phase::Stopping => write!(f, "stopping"),
        }
    }
}

/// Mutable session state, guarded by the session lock
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub phase: Phase,
    /// Bumped on every start so a detached worker cannot publish into a
    /// later session
    pub generation: u64,
    pub session_id: Option<String>,
    pub chunk_index: u32,
    pub active_device: Option<(usize, DeviceDescriptor)>,
    pub negotiated: Option<NegotiatedConfig>,
    pub last_error: Option<String>,
    /// The read error that ended the session, if one did
    pub failure: Option<CaptureError>,
    pub last_chunk_level: Option<f32>,
    pub started_at: Option<Instant>,
    pub started_wall: Option<DateTime<Utc>>,
    /// Stop flag and resume gate of the running worker
    pub control: Option<Arc<WorkerControl>>,
}

impl SessionState {
    /// Reset for a new session and return its generation
    pub fn begin(
        &mut self,
        session_id: &str,
        device: (usize, DeviceDescriptor),
        negotiated: NegotiatedConfig,
    ) -> u64 {
        self.generation += 1;
        self.phase = Phase::Recording;
        self.session_id = Some(session_id.to_string());
        self.chunk_index = 0;
        self.active_device = Some(device);
        self.negotiated = Some(negotiated);
        self.last_error = None;
        self.failure = None;
        self.last_chunk_level = None;
        self.started_at = Some(Instant::now());
        self.started_wall = Some(Utc::now());
        self.generation
    }

    /// Worker died: back to idle but keep what `status`/`stop` report
    pub fn fail(&mut self, error: String) {
        self.phase = Phase::Idle;
        self.active_device = None;
        self.last_error = Some(error);
    }

    /// Clear everything that belongs to the finished session and retire
    /// its worker
    pub fn finish(&mut self) {
        self.generation += 1;
        self.phase = Phase::Idle;
        self.session_id = None;
        self.active_device = None;
        self.negotiated = None;
        self.started_at = None;
        self.started_wall = None;
        self.control = None;
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        self.started_at.map(|t| t.elapsed().as_secs_f64())
    }

    pub fn snapshot(&self, chunk_duration_secs: f64) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            session_id: self.session_id.clone(),
            chunk_index: self.chunk_index,
            device_id: self.active_device.as_ref().map(|(id, _)| *id),
            device: self
                .active_device
                .as_ref()
                .map(|(_, d)| d.display_name.clone()),
            sample_rate: self.negotiated.map(|c| c.sample_rate),
            channels: self.negotiated.map(|c| c.channels),
            last_error: self.last_error.clone(),
            last_chunk_level: self.last_chunk_level,
            chunk_duration_secs,
            elapsed_secs: self.elapsed_secs(),
        }
    }
}

/// Point-in-time view of the session, safe to hand to any caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub session_id: Option<String>,
    /// Index the next chunk will get (= chunks emitted so far)
    pub chunk_index: u32,
    pub device_id: Option<usize>,
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub last_error: Option<String>,
    pub last_chunk_level: Option<f32>,
    pub chunk_duration_secs: f64,
    pub elapsed_secs: Option<f64>,
}

/// Returned by a successful `start`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartInfo {
    pub session_id: String,
    pub device_id: usize,
    pub device: String,
    pub is_loopback: bool,
    pub backend: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_secs: f64,
    pub started_at: DateTime<Utc>,
}

/// Returned by `stop`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopSummary {
    pub session_id: String,
    pub total_chunks: u32,
    /// Wall-clock time since start, pauses included
    pub duration_seconds: f64,
    /// Set when the worker died abnormally
    pub last_error: Option<String>,
    pub last_chunk_level: Option<f32>,
    pub chunk_duration_secs: f64,
}
