// Command-line interface definitions for loopcap
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loopcap")]
#[command(author, version, about = "Chunked system/loopback audio capture")]
#[command(long_about = "
Loopcap records what your computer is playing (or any input device) and
writes it as fixed-length WAV chunks while the recording is still running,
so a downstream consumer can process each chunk as soon as it is complete.

LOOPBACK SOURCES:
  Linux:    PulseAudio/PipeWire monitor sources (needs pactl and parec)
  Windows:  WASAPI loopback of any output device
  macOS:    a virtual loopback driver such as BlackHole

USAGE:
  loopcap devices              List capture devices
  loopcap smoke                Check that the default device carries sound
  loopcap record --session m1  Record until Ctrl-C or 'stop' on stdin
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the chunk directory
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<std::path::PathBuf>,

    /// Override the chunk length in seconds
    #[arg(long, value_name = "SECS")]
    pub chunk_seconds: Option<f64>,

    /// Override the requested sample rate
    #[arg(long, value_name = "HZ")]
    pub sample_rate: Option<u32>,

    /// Override the requested channel count (1 or 2)
    #[arg(long, value_name = "N")]
    pub channels: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List capture devices
    Devices {
        /// Print the device listing as JSON
        #[arg(long)]
        json: bool,

        /// Re-enumerate devices (always done on first use)
        #[arg(long)]
        refresh: bool,

        /// Use the simulated backend instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Record a chunked capture session
    ///
    /// While recording, type pause, resume, status or stop on stdin.
    /// Ctrl-C stops the session and flushes the last partial chunk.
    Record {
        /// Session identifier used in chunk file names (default: random UUID)
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Device index from `loopcap devices`
        #[arg(long, value_name = "N")]
        device: Option<usize>,

        /// Stop automatically after this many seconds
        #[arg(long, value_name = "SECS")]
        duration: Option<f64>,

        /// Use the simulated backend (a 440 Hz tone) instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Record a few seconds and check that the device carries sound
    Smoke {
        /// Seconds to record
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u64).range(5..=30))]
        duration: u64,

        /// Device index from `loopcap devices`
        #[arg(long, value_name = "N")]
        device_id: Option<usize>,

        /// Minimum RMS level for the check to pass
        #[arg(long, default_value_t = 1e-4)]
        min_rms: f32,

        /// Exit successfully when no capture device exists
        #[arg(long)]
        allow_missing_device: bool,

        /// Use the simulated backend instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Show current configuration
    Config,
}
