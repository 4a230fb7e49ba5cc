use crate::error::{RenderError, Result};
use clipflow_core::types::TimeMs;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// What the compiler needs to know about a fetched media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_ms: TimeMs,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub audio_channels: u32,
}

/// Run ffprobe on a fetched asset and parse the result.
pub async fn probe_media(path: impl AsRef<Path>) -> Result<MediaInfo> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(RenderError::Probe {
            path: path.to_path_buf(),
            reason: "file not found".into(),
        });
    }

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| RenderError::Probe {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(RenderError::Probe {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let probe: FfprobeOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| RenderError::Probe {
            path: path.to_path_buf(),
            reason: format!("unparseable probe output: {e}"),
        })?;
    Ok(parse_probe_output(&probe))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_probe_output(probe: &FfprobeOutput) -> MediaInfo {
    let video_stream = probe.streams.iter().find(|s| s.codec_type == "video");
    let audio_stream = probe.streams.iter().find(|s| s.codec_type == "audio");

    let duration_ms = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .map(TimeMs::from_seconds)
        .unwrap_or(TimeMs::ZERO);

    MediaInfo {
        duration_ms,
        width: video_stream.and_then(|s| s.width).unwrap_or(0),
        height: video_stream.and_then(|s| s.height).unwrap_or(0),
        fps: video_stream
            .and_then(|s| s.r_frame_rate.as_deref())
            .and_then(parse_frame_rate)
            .unwrap_or(0.0),
        audio_channels: audio_stream.and_then(|s| s.channels).unwrap_or(0),
    }
}

/// Parse an ffprobe frame rate string like "30000/1001" or "30/1" into f64.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    if let Some((num, den)) = rate.split_once('/') {
        let n: f64 = num.parse().ok()?;
        let d: f64 = den.parse().ok()?;
        if d == 0.0 {
            return None;
        }
        Some(n / d)
    } else {
        rate.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
