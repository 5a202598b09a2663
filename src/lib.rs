//! Loopcap: chunked system/loopback audio capture
//!
//! This library provides:
//! - Device enumeration across native capture subsystems (cpal hosts,
//!   WASAPI output loopback, PulseAudio/PipeWire monitors)
//! - A platform-aware default device policy that prefers loopback sources
//! - Best-effort negotiation of sample rate and channel count
//! - A capture session that records on a background thread and hands each
//!   completed WAV chunk to a consumer while recording continues
//! - A smoke test that checks a device actually carries sound
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//!   │   Backends   │ ──▶ │   Registry   │ ──▶ │   Selector   │
//!   │ stream/loop  │     │ index → desc │     │ platform pol │
//!   └──────────────┘     └──────────────┘     └──────────────┘
//!                                                    │
//!                                                    ▼
//!                           ┌──────────────────────────────────────┐
//!                           │            CaptureSession            │
//!                           │ start/pause/resume/stop/status       │
//!                           └──────────────────────────────────────┘
//!                                                    │ worker thread
//!                                                    ▼
//!          segments ──▶ ChunkBuffer ──▶ WAV chunk (hound) ──▶ ChunkHandler
//! ```
//!
//! # Example
//!
//! ```no_run
//! use loopcap::{CaptureSession, Config, DeviceRegistry};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let registry = Arc::new(DeviceRegistry::with_default_backends());
//! let session = CaptureSession::new(&config, registry);
//!
//! let on_chunk = |path: &Path, index: u32, session_id: &str| -> anyhow::Result<()> {
//!     println!("{} #{}: {}", session_id, index, path.display());
//!     Ok(())
//! };
//! session.start("standup", on_chunk, None)?;
//! // ...
//! let summary = session.stop()?;
//! println!("{} chunks", summary.total_chunks);
//! # Ok::<(), loopcap::CaptureError>(())
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod registry;
pub mod selector;
pub mod session;
pub mod smoke;

pub use audio::{
    BackendKind, CaptureBackend, CaptureStream, DeviceDescriptor, DeviceListing,
    NegotiatedConfig, StreamRequest,
};
pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::{CaptureError, LoopcapError, Result};
pub use registry::DeviceRegistry;
pub use selector::{DeviceSelector, Platform};
pub use session::{
    CaptureSession, ChunkHandler, ChunkReady, Phase, StartInfo, StatusSnapshot, StopSummary,
};
pub use smoke::SmokeReport;
