//! Loopcap - chunked system/loopback audio capture
//!
//! Use `loopcap devices` to list capture devices.
//! Use `loopcap record` to record a chunked session.
//! Use `loopcap smoke` to check that a device carries sound.

use clap::Parser;
use loopcap::audio::simulated::{Signal, SimulatedBackend, SimulatedDevice};
use loopcap::audio::BackendKind;
use loopcap::config::{self, Config};
use loopcap::{smoke, CaptureError, CaptureSession, Cli, Commands, DeviceRegistry, StatusSnapshot};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration (file + LOOPCAP_* environment)
    let mut config = config::load_config(cli.config.as_deref())?;

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let directive = match config.log_level {
        Some(ref directive) if cli.verbose == 0 && !cli.quiet => directive.clone(),
        _ => format!("loopcap={},warn", log_level),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&directive))
                .unwrap_or_else(|_| EnvFilter::new("loopcap=info,warn")),
        )
        .with_target(false)
        .init();

    // Apply CLI overrides
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(secs) = cli.chunk_seconds {
        config.capture.chunk_duration_secs = secs;
    }
    if let Some(rate) = cli.sample_rate {
        config.capture.sample_rate = rate;
    }
    if let Some(channels) = cli.channels {
        config.capture.channels = channels;
    }
    config.validate()?;

    match cli.command {
        Commands::Devices {
            json,
            refresh,
            simulate,
        } => {
            let registry = registry(simulate);
            list_devices(&registry, json, refresh)?;
        }

        Commands::Record {
            session,
            device,
            duration,
            simulate,
        } => {
            let registry = Arc::new(registry(simulate));
            run_record(&config, registry, session, device, duration).await?;
        }

        Commands::Smoke {
            duration,
            device_id,
            min_rms,
            allow_missing_device,
            simulate,
        } => {
            let registry = Arc::new(registry(simulate));
            run_smoke(
                &config,
                registry,
                Duration::from_secs(duration),
                device_id,
                min_rms,
                allow_missing_device,
            )
            .await?;
        }

        Commands::Config => {
            show_config(&config)?;
        }
    }

    Ok(())
}

/// Native backends, or a single simulated loopback device playing a tone
fn registry(simulate: bool) -> DeviceRegistry {
    if !simulate {
        return DeviceRegistry::with_default_backends();
    }

    let tone = SimulatedDevice::new("Simulated loopback (440 Hz)")
        .loopback()
        .host_api("Simulated")
        .signal(Signal::Sine {
            frequency: 440.0,
            amplitude: 0.25,
        });
    DeviceRegistry::new(vec![Arc::new(SimulatedBackend::new(
        BackendKind::LoopbackCapture,
        vec![tone],
    ))])
}

fn list_devices(registry: &DeviceRegistry, json: bool, refresh: bool) -> anyhow::Result<()> {
    let listing = registry.listing(refresh);

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if listing.is_empty() {
        println!("No capture devices found.");
        println!("Install or enable a loopback source (PulseAudio monitor, WASAPI, BlackHole).");
        return Ok(());
    }

    println!("Capture devices\n");
    for device in &listing {
        let api = device
            .host_api
            .as_deref()
            .map(|api| format!(" [{}]", api))
            .unwrap_or_default();
        let format = match (device.default_sample_rate, device.channels) {
            (Some(rate), Some(ch)) => format!("{} Hz, {} ch", rate, ch),
            (Some(rate), None) => format!("{} Hz", rate),
            (None, Some(ch)) => format!("{} ch", ch),
            (None, None) => "unknown format".to_string(),
        };
        println!(
            "  {:>3}  {}{}\n       {} / {}{} / {}",
            device.id,
            device.name,
            api,
            device.backend,
            serde_json::to_value(&device.device_type)?
                .as_str()
                .unwrap_or("input"),
            if device.is_loopback { " / loopback" } else { "" },
            format
        );
    }
    Ok(())
}

async fn run_record(
    config: &Config,
    registry: Arc<DeviceRegistry>,
    session_id: Option<String>,
    device: Option<usize>,
    duration: Option<f64>,
) -> anyhow::Result<()> {
    if let Some(secs) = duration {
        if !(secs.is_finite() && secs > 0.0) {
            anyhow::bail!("--duration must be a positive number of seconds");
        }
    }

    let session = Arc::new(CaptureSession::new(config, registry));
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let on_chunk = |path: &Path, index: u32, session_id: &str| -> anyhow::Result<()> {
        println!("{} chunk {:04}: {}", session_id, index, path.display());
        Ok(())
    };

    let info = {
        let session = Arc::clone(&session);
        let id = session_id.clone();
        tokio::task::spawn_blocking(move || session.start(&id, on_chunk, device)).await??
    };
    println!(
        "Recording '{}' from [{}] {} ({} Hz, {} ch, {}s chunks) into {:?}",
        info.session_id,
        info.device_id,
        info.device,
        info.sample_rate,
        info.channels,
        info.chunk_duration_secs,
        session.chunk_dir()
    );
    println!("Commands: pause, resume, status, stop (Ctrl-C also stops)");

    let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs_f64(secs));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut health = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                break;
            }
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::info!("Duration reached, stopping");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "pause" => report(session.pause()),
                        "resume" => report(session.resume()),
                        "status" => println!("{}", serde_json::to_string_pretty(&session.status())?),
                        "stop" => break,
                        "" => {}
                        other => eprintln!("Unknown command '{}' (pause, resume, status, stop)", other),
                    },
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = health.tick() => {
                if session.status().phase.is_idle() {
                    tracing::warn!("Recording ended on its own");
                    break;
                }
            }
        }
    }

    let summary = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || session.stop()).await??
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(error) = summary.last_error {
        anyhow::bail!("recording failed: {}", error);
    }
    Ok(())
}

fn report(result: Result<StatusSnapshot, CaptureError>) {
    match result {
        Ok(status) => println!("{} (chunk {})", status.phase, status.chunk_index),
        Err(e) if e.is_misuse() => eprintln!("{}", e),
        Err(e) => tracing::error!("{}", e),
    }
}

async fn run_smoke(
    config: &Config,
    registry: Arc<DeviceRegistry>,
    duration: Duration,
    device_id: Option<usize>,
    min_rms: f32,
    allow_missing_device: bool,
) -> anyhow::Result<()> {
    let session = Arc::new(CaptureSession::new(config, registry));
    let result = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || smoke::run(&session, duration, device_id)).await?
    };

    let report = match result {
        Ok(report) => report,
        Err(CaptureError::NoDeviceAvailable) if allow_missing_device => {
            println!("SKIP: no audio capture device available");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!("Device:      [{}] {}", report.device_id, report.device);
    println!("Loopback:    {}", report.is_loopback);
    println!("Duration:    {:.1}s", report.duration_secs);
    println!("Sample rate: {} Hz", report.sample_rate);
    println!("Channels:    {}", report.channels);
    println!("RMS level:   {:.6}", report.rms_level);

    if !report.passes(min_rms) {
        anyhow::bail!(
            "FAIL: RMS {:.6} below {:.6}; play some audio and retry",
            report.rms_level,
            min_rms
        );
    }
    println!("PASS");
    Ok(())
}

fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("Current Configuration\n");
    println!("=====================\n");

    if let Some(path) = Config::default_path() {
        println!("# Config file: {:?}", path);
    }
    println!("# Chunk directory: {:?}\n", config.chunk_dir());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
