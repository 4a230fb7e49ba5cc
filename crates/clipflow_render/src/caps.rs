//! Encoder capability probe, run once per service lifetime.

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

pub const HW_ENCODER: &str = "h264_nvenc";
pub const SW_ENCODER: &str = "libx264";

/// The encoder strategy every job uses until the service restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncoderProfile {
    pub video_encoder: String,
    pub preset: String,
    /// Whether scale/overlay can run device-resident.
    pub hw_filters: bool,
}

impl EncoderProfile {
    pub fn software() -> Self {
        Self {
            video_encoder: SW_ENCODER.to_string(),
            preset: "veryfast".to_string(),
            hw_filters: false,
        }
    }

    pub fn hardware() -> Self {
        Self {
            video_encoder: HW_ENCODER.to_string(),
            preset: "p4".to_string(),
            hw_filters: true,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.hw_filters
    }
}

/// Ask ffmpeg for its encoder list and pick a profile.
///
/// Never fails the service: an unreachable toolchain selects the software
/// profile with a degraded-capability warning, and the real unavailability
/// is reported when a job later fails to spawn.
pub async fn detect() -> EncoderProfile {
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-encoders")
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let profile = profile_from_encoders(&String::from_utf8_lossy(&out.stdout));
            info!(encoder = %profile.video_encoder, "encoder probe complete");
            profile
        }
        Ok(out) => {
            warn!(status = ?out.status, "encoder listing failed; degraded to software profile");
            EncoderProfile::software()
        }
        Err(e) => {
            warn!(error = %e, "ffmpeg unreachable at probe time; degraded to software profile");
            EncoderProfile::software()
        }
    }
}

/// Pure selection over the textual encoder listing.
pub fn profile_from_encoders(listing: &str) -> EncoderProfile {
    if listing.contains(HW_ENCODER) {
        EncoderProfile::hardware()
    } else {
        EncoderProfile::software()
    }
}
