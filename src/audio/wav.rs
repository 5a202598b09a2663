//! WAV chunk files
//!
//! Chunks are written as 16-bit signed PCM with the negotiated rate and
//! channel count. File names encode the session id, a zero-padded chunk
//! index and a UTC timestamp so they sort naturally and never collide
//! across sessions.

use crate::audio::NegotiatedConfig;
use crate::error::CaptureError;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Replace anything outside `[A-Za-z0-9_-]` so ids are safe in file names
pub fn sanitize_session_id(session_id: &str) -> String {
    let cleaned: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

/// `<session>_chunk_<index:04>_<YYYYMMDDTHHMMSSZ>.wav`
pub fn chunk_file_name(session_id: &str, chunk_index: u32, at: DateTime<Utc>) -> String {
    format!(
        "{}_chunk_{:04}_{}.wav",
        sanitize_session_id(session_id),
        chunk_index,
        at.format("%Y%m%dT%H%M%SZ")
    )
}

/// Convert a float sample to 16-bit PCM, clipping to [-1, 1]
pub fn to_pcm16(sample: f32) -> i16 {
    let clipped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clipped * i16::MAX as f32).round() as i16
}

/// Write interleaved samples to `path`; the file is finalized and closed
/// before this returns.
pub fn write_chunk(
    path: &Path,
    samples: &[f32],
    config: NegotiatedConfig,
) -> Result<(), CaptureError> {
    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(to_pcm16(sample))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Create the chunk directory if needed and write the chunk into it
pub fn write_chunk_in(
    dir: &Path,
    session_id: &str,
    chunk_index: u32,
    samples: &[f32],
    config: NegotiatedConfig,
) -> Result<PathBuf, CaptureError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        CaptureError::ChunkWrite(format!("cannot create {}: {}", dir.display(), e))
    })?;
    let path = dir.join(chunk_file_name(session_id, chunk_index, Utc::now()));
    write_chunk(&path, samples, config)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name_pattern() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            chunk_file_name("m1", 7, at),
            "m1_chunk_0007_20240309T140507Z.wav"
        );
    }

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize_session_id("team/standup 9:30"), "team_standup_9_30");
        assert_eq!(sanitize_session_id("abc-DEF_12"), "abc-DEF_12");
        assert_eq!(sanitize_session_id(""), "session");
    }

    #[test]
    fn test_pcm_conversion_clips() {
        assert_eq!(to_pcm16(0.0), 0);
        assert_eq!(to_pcm16(1.0), i16::MAX);
        assert_eq!(to_pcm16(3.5), i16::MAX);
        assert_eq!(to_pcm16(-7.0), -i16::MAX);
        assert_eq!(to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn test_written_chunk_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = NegotiatedConfig {
            sample_rate: 22050,
            channels: 2,
        };
        let frames = 1000;
        let samples: Vec<f32> = (0..frames * 2).map(|i| (i as f32 / 4000.0) - 0.25).collect();

        let path = write_chunk_in(dir.path(), "m1", 3, &samples, config).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("m1_chunk_0003_"));

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 22050);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.duration(), frames as u32);
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let config = NegotiatedConfig {
            sample_rate: 8000,
            channels: 1,
        };
        let path = write_chunk_in(&nested, "s", 0, &[0.0; 10], config).unwrap();
        assert!(path.exists());
    }
}
