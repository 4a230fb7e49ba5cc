//! Command synthesis: filter plan -> concrete encoder invocation.

use crate::caps::EncoderProfile;
use crate::plan::FilterPlan;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A concrete external-process invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Turn a plan into the argument vector for the encoding toolchain.
///
/// Pure function of its inputs: no I/O, no randomness, so identical inputs
/// always produce an identical invocation.
pub fn synthesize(plan: &FilterPlan, profile: &EncoderProfile, output: &Path) -> Invocation {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
    ];
    if profile.hw_filters {
        args.extend(["-hwaccel".into(), "cuda".into()]);
    }

    for input in &plan.inputs {
        if let Some(secs) = input.image_loop_secs {
            args.extend(["-loop".into(), "1".into(), "-t".into(), format!("{secs}")]);
        }
        args.extend(["-i".into(), input.path.to_string_lossy().to_string()]);
    }

    args.extend(["-filter_complex".into(), plan.filters.join(";")]);

    args.extend(["-map".into(), format!("[{}]", plan.video_out)]);
    args.extend([
        "-c:v".into(),
        profile.video_encoder.clone(),
        "-preset".into(),
        profile.preset.clone(),
    ]);
    if !profile.hw_filters {
        args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    }

    if let Some(audio_out) = &plan.audio_out {
        args.extend(["-map".into(), format!("[{audio_out}]")]);
        args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "192k".into()]);
    }

    args.extend(["-r".into(), plan.fps.to_string()]);
    args.extend(["-progress".into(), "pipe:1".into()]);
    args.push(output.to_string_lossy().to_string());

    Invocation {
        program: "ffmpeg".into(),
        args,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
