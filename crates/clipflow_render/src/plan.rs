//! Scene compiler: declarative scene -> ordered filter plan.

use crate::caps::EncoderProfile;
use crate::error::{RenderError, Result};
use crate::fetch::Asset;
use clipflow_core::types::{Clip, Scene, TimeMs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One entry per distinct asset, in first-reference order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanInput {
    pub path: PathBuf,
    pub index: usize,
    /// Still images are looped for this many seconds so they can be trimmed
    /// like any other stream.
    pub image_loop_secs: Option<f64>,
}

/// A compiled render plan ready for command synthesis.
///
/// `filters` is the ordered list of filter-chain descriptions; the
/// synthesizer joins them into the toolchain's graph string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterPlan {
    pub inputs: Vec<PlanInput>,
    pub filters: Vec<String>,
    pub video_out: String,
    pub audio_out: Option<String>,
    pub fps: u32,
    pub duration_ms: TimeMs,
}

/// Compile a scene plus its resolved assets into a `FilterPlan`.
///
/// The composite starts from a black canvas at scene size; every visual
/// clip, in track order (earlier track = lower z-order), is trimmed to its
/// `[trim_from, trim_to)` window, shifted to its window start, scaled to its
/// effective size, alpha-mixed when translucent, and overlaid at its pixel
/// position gated to the window. The hardware variant expresses scale and
/// overlay with device-resident filters behind an explicit upload; the
/// composition semantics are identical on both paths.
pub fn compile(
    scene: &Scene,
    assets: &HashMap<String, Asset>,
    profile: &EncoderProfile,
) -> Result<FilterPlan> {
    scene
        .validate()
        .map_err(|e| RenderError::Compilation(e.to_string()))?;

    // Feature gate before any other work is done on the scene's behalf.
    for (index, clip) in scene.clips() {
        if let Clip::Video { rotation, .. } | Clip::Image { rotation, .. } = clip {
            if normalized_rotation(*rotation).is_none() {
                return Err(RenderError::UnsupportedFeature(format!(
                    "clip {index}: rotation {rotation} degrees is not a multiple of 90"
                )));
            }
        }
    }

    let duration = scene.duration_ms();
    let dur_s = duration.as_seconds();

    // Inputs, deduplicated by source URL.
    let mut index_by_url: HashMap<&str, usize> = HashMap::new();
    let mut inputs: Vec<PlanInput> = Vec::new();
    for (_, clip) in scene.clips() {
        if index_by_url.contains_key(clip.src()) {
            continue;
        }
        let asset = assets.get(clip.src()).ok_or_else(|| {
            RenderError::Compilation(format!("no resolved asset for {}", clip.src()))
        })?;
        let index = inputs.len();
        index_by_url.insert(clip.src(), index);
        inputs.push(PlanInput {
            path: asset.path.clone(),
            index,
            image_loop_secs: matches!(clip, Clip::Image { .. }).then_some(dur_s),
        });
    }

    let mut filters: Vec<String> = Vec::new();
    let (canvas_w, canvas_h) = (scene.size.width, scene.size.height);
    let fps = scene.fps;

    // The base canvas anchors the composite so the trim-window law holds
    // uniformly for every clip, including the bottom one.
    if profile.hw_filters {
        filters.push(format!(
            "color=c=black:s={canvas_w}x{canvas_h}:r={fps}:d={dur_s},format=rgba,hwupload_cuda[base]"
        ));
    } else {
        filters.push(format!(
            "color=c=black:s={canvas_w}x{canvas_h}:r={fps}:d={dur_s}[base]"
        ));
    }

    let mut last = "base".to_string();
    let mut visual_n = 0usize;
    for (_, clip) in scene.clips() {
        let (src, x, y, scale, opacity, rotation, flip_x, flip_y, brightness) = match clip {
            Clip::Video {
                src,
                x,
                y,
                scale,
                opacity,
                rotation,
                flip_x,
                flip_y,
                brightness,
                ..
            }
            | Clip::Image {
                src,
                x,
                y,
                scale,
                opacity,
                rotation,
                flip_x,
                flip_y,
                brightness,
                ..
            } => (
                src, *x, *y, *scale, *opacity, *rotation, *flip_x, *flip_y, *brightness,
            ),
            Clip::Audio { .. } => continue,
        };
        let input_idx = index_by_url[src.as_str()];
        let from = clip.trim_from().as_seconds();
        let to = clip.trim_to().as_seconds();

        let rot = normalized_rotation(rotation).unwrap_or(0);
        let (ew, eh) = effective_size(scene, assets.get(src), scale, rot);
        let (px, py) = (x.round() as i64, y.round() as i64);

        let mut chain = format!(
            "[{input_idx}:v]trim=start={from}:end={to},setpts=PTS-STARTPTS+{from}/TB"
        );
        chain.push_str(transpose_steps(rot));
        if flip_x {
            chain.push_str(",hflip");
        }
        if flip_y {
            chain.push_str(",vflip");
        }
        if profile.hw_filters {
            // Brightness and alpha mixing stay on the CPU; scale and
            // overlay run device-resident behind the upload.
            chain.push_str(",format=rgba");
            if brightness.abs() > 0.001 {
                chain.push_str(&format!(",eq=brightness={brightness}"));
            }
            if opacity < 0.999 {
                chain.push_str(&format!(",colorchannelmixer=aa={opacity}"));
            }
            chain.push_str(&format!(",hwupload_cuda,scale_cuda={ew}:{eh}"));
        } else {
            chain.push_str(&format!(",scale={ew}:{eh},format=rgba"));
            if brightness.abs() > 0.001 {
                chain.push_str(&format!(",eq=brightness={brightness}"));
            }
            if opacity < 0.999 {
                chain.push_str(&format!(",colorchannelmixer=aa={opacity}"));
            }
        }
        chain.push_str(&format!("[v{visual_n}]"));
        filters.push(chain);

        let overlay = if profile.hw_filters {
            "overlay_cuda"
        } else {
            "overlay"
        };
        filters.push(format!(
            "[{last}][v{visual_n}]{overlay}=x={px}:y={py}:enable='between(t,{from},{to})'[c{visual_n}]"
        ));
        last = format!("c{visual_n}");
        visual_n += 1;
    }

    // Audio: trim to window, gain, delay to window start, equal-weight mix.
    let mut audio_labels: Vec<String> = Vec::new();
    for (_, clip) in scene.clips() {
        let (src, volume) = match clip {
            Clip::Audio { src, volume, .. } => (src, *volume),
            _ => continue,
        };
        let input_idx = index_by_url[src.as_str()];
        let from = clip.trim_from().as_seconds();
        let to = clip.trim_to().as_seconds();
        let delay_ms = clip.trim_from().0;
        let k = audio_labels.len();
        filters.push(format!(
            "[{input_idx}:a]atrim=start={from}:end={to},asetpts=PTS-STARTPTS,volume={volume},adelay={delay_ms}|{delay_ms}[a{k}]"
        ));
        audio_labels.push(format!("a{k}"));
    }

    let audio_out = if audio_labels.is_empty() {
        None
    } else {
        if audio_labels.len() == 1 {
            filters.push(format!("[{}]anull[aout]", audio_labels[0]));
        } else {
            // Uniform weights; amix with normalize=0 is the MVP mixing policy.
            let list: String = audio_labels.iter().map(|l| format!("[{l}]")).collect();
            filters.push(format!(
                "{list}amix=inputs={}:duration=longest:normalize=0[aout]",
                audio_labels.len()
            ));
        }
        Some("aout".to_string())
    };

    Ok(FilterPlan {
        inputs,
        filters,
        video_out: last,
        audio_out,
        fps,
        duration_ms: duration,
    })
}

/// Rotation normalized to {0, 90, 180, 270}; `None` when not a 90-multiple.
fn normalized_rotation(rotation: f64) -> Option<u32> {
    let r = rotation.round();
    if (rotation - r).abs() > 1e-6 || (r as i64) % 90 != 0 {
        return None;
    }
    Some((((r as i64) % 360 + 360) % 360) as u32)
}

fn transpose_steps(rot: u32) -> &'static str {
    match rot {
        90 => ",transpose=1",
        180 => ",hflip,vflip",
        270 => ",transpose=2",
        _ => "",
    }
}

/// Effective on-canvas size: source dimensions (probed, falling back to the
/// canvas) times the scale factor, axes swapped for 90/270 rotation.
fn effective_size(scene: &Scene, asset: Option<&Asset>, scale: f64, rot: u32) -> (u32, u32) {
    let (src_w, src_h) = asset
        .and_then(|a| a.info.as_ref())
        .filter(|i| i.width > 0 && i.height > 0)
        .map(|i| (i.width, i.height))
        .unwrap_or((scene.size.width, scene.size.height));
    let w = ((src_w as f64 * scale).round() as u32).max(1);
    let h = ((src_h as f64 * scale).round() as u32).max(1);
    if rot == 90 || rot == 270 {
        (h, w)
    } else {
        (w, h)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MediaInfo;
    use clipflow_core::types::{Size, Track};

    fn asset(url: &str, width: u32, height: u32) -> (String, Asset) {
        (
            url.to_string(),
            Asset {
                url: url.to_string(),
                path: PathBuf::from(format!("/tmp/assets/{}", crate::fetch::asset_filename(url))),
                info: Some(MediaInfo {
                    duration_ms: TimeMs(30_000),
                    width,
                    height,
                    fps: 30.0,
                    audio_channels: 2,
                }),
            },
        )
    }

    fn video(src: &str, from: u64, to: u64) -> Clip {
        Clip::Video {
            src: src.into(),
            trim_from: TimeMs(from),
            trim_to: TimeMs(to),
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            opacity: 1.0,
            rotation: 0.0,
            flip_x: false,
            flip_y: false,
            brightness: 0.0,
        }
    }

    fn scene_of(tracks: Vec<Track>) -> Scene {
        Scene {
            tracks,
            size: Size::default(),
            fps: 30,
            format: "mp4".into(),
        }
    }

    fn graph(plan: &FilterPlan) -> String {
        plan.filters.join(";")
    }

    #[test]
    fn single_video_produces_trimmed_overlay_onto_canvas() {
        let scene = scene_of(vec![Track {
            clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
        }]);
        let assets = HashMap::from([asset("https://assets.test/bg.mp4", 1920, 1080)]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();

        let g = graph(&plan);
        assert!(g.contains("color=c=black:s=1920x1080:r=30:d=5[base]"));
        assert!(g.contains("trim=start=0:end=5"));
        assert!(g.contains("setpts=PTS-STARTPTS+0/TB"));
        assert!(g.contains("scale=1920:1080"));
        assert!(g.contains("overlay=x=0:y=0:enable='between(t,0,5)'"));
        assert_eq!(plan.video_out, "c0");
        assert_eq!(plan.audio_out, None);
        assert_eq!(plan.duration_ms, TimeMs(5_000));
    }

    #[test]
    fn image_overlay_scales_positions_and_alpha_mixes() {
        let scene = scene_of(vec![
            Track {
                clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
            },
            Track {
                clips: vec![Clip::Image {
                    src: "https://assets.test/logo.png".into(),
                    trim_from: TimeMs(1_000),
                    trim_to: TimeMs(4_000),
                    x: 100.0,
                    y: 200.0,
                    scale: 0.5,
                    opacity: 0.5,
                    rotation: 0.0,
                    flip_x: false,
                    flip_y: false,
                    brightness: 0.0,
                }],
            },
        ]);
        let assets = HashMap::from([
            asset("https://assets.test/bg.mp4", 1920, 1080),
            asset("https://assets.test/logo.png", 800, 600),
        ]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();

        let g = graph(&plan);
        assert!(g.contains("trim=start=1:end=4"));
        assert!(g.contains("setpts=PTS-STARTPTS+1/TB"));
        assert!(g.contains("scale=400:300"));
        assert!(g.contains("colorchannelmixer=aa=0.5"));
        assert!(g.contains("overlay=x=100:y=200:enable='between(t,1,4)'"));

        // The image input is looped for the scene duration.
        let image_input = &plan.inputs[1];
        assert_eq!(image_input.image_loop_secs, Some(5.0));
        assert_eq!(plan.inputs[0].image_loop_secs, None);

        // Later track composites above the earlier one.
        assert_eq!(plan.video_out, "c1");
    }

    #[test]
    fn inputs_deduplicate_by_source_url() {
        let url = "https://assets.test/bg.mp4";
        let scene = scene_of(vec![Track {
            clips: vec![video(url, 0, 2_000), video(url, 2_000, 4_000)],
        }]);
        let assets = HashMap::from([asset(url, 1920, 1080)]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();

        assert_eq!(plan.inputs.len(), 1);
        // Both chains reference input 0.
        let refs = graph(&plan).matches("[0:v]").count();
        assert_eq!(refs, 2);
    }

    #[test]
    fn single_audio_clip_passes_through_anull() {
        let scene = scene_of(vec![
            Track {
                clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
            },
            Track {
                clips: vec![Clip::Audio {
                    src: "https://assets.test/music.mp3".into(),
                    trim_from: TimeMs(0),
                    trim_to: TimeMs(5_000),
                    volume: 0.8,
                }],
            },
        ]);
        let assets = HashMap::from([
            asset("https://assets.test/bg.mp4", 1920, 1080),
            asset("https://assets.test/music.mp3", 0, 0),
        ]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();

        let g = graph(&plan);
        assert!(g.contains("atrim=start=0:end=5"));
        assert!(g.contains("volume=0.8"));
        assert!(g.contains("adelay=0|0"));
        assert!(g.contains("[a0]anull[aout]"));
        assert_eq!(plan.audio_out.as_deref(), Some("aout"));
    }

    #[test]
    fn multiple_audio_clips_equal_weight_mix() {
        let audio = |src: &str, from: u64, to: u64| Clip::Audio {
            src: src.into(),
            trim_from: TimeMs(from),
            trim_to: TimeMs(to),
            volume: 1.0,
        };
        let scene = scene_of(vec![
            Track {
                clips: vec![video("https://assets.test/bg.mp4", 0, 6_000)],
            },
            Track {
                clips: vec![
                    audio("https://assets.test/music.mp3", 0, 6_000),
                    audio("https://assets.test/voice.wav", 2_000, 5_000),
                ],
            },
        ]);
        let assets = HashMap::from([
            asset("https://assets.test/bg.mp4", 1920, 1080),
            asset("https://assets.test/music.mp3", 0, 0),
            asset("https://assets.test/voice.wav", 0, 0),
        ]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();

        let g = graph(&plan);
        assert!(g.contains("[a0][a1]amix=inputs=2:duration=longest:normalize=0[aout]"));
        assert!(g.contains("adelay=2000|2000"));
    }

    #[test]
    fn non_right_angle_rotation_is_rejected() {
        let mut clip = video("https://assets.test/bg.mp4", 0, 5_000);
        if let Clip::Video { rotation, .. } = &mut clip {
            *rotation = 45.0;
        }
        let scene = scene_of(vec![Track { clips: vec![clip] }]);
        let assets = HashMap::from([asset("https://assets.test/bg.mp4", 1920, 1080)]);
        let err = compile(&scene, &assets, &EncoderProfile::software()).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedFeature(_)));
        assert_eq!(err.kind(), "UnsupportedFeatureError");
    }

    #[test]
    fn right_angle_rotation_transposes_and_swaps_axes() {
        let mut clip = video("https://assets.test/bg.mp4", 0, 5_000);
        if let Clip::Video { rotation, .. } = &mut clip {
            *rotation = 90.0;
        }
        let scene = scene_of(vec![Track { clips: vec![clip] }]);
        let assets = HashMap::from([asset("https://assets.test/bg.mp4", 1920, 1080)]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();

        let g = graph(&plan);
        assert!(g.contains("transpose=1"));
        assert!(g.contains("scale=1080:1920"));
    }

    #[test]
    fn flips_and_brightness_extend_the_visual_chain() {
        let mut clip = video("https://assets.test/bg.mp4", 0, 5_000);
        if let Clip::Video {
            flip_x,
            flip_y,
            brightness,
            ..
        } = &mut clip
        {
            *flip_x = true;
            *flip_y = true;
            *brightness = 0.2;
        }
        let scene = scene_of(vec![Track { clips: vec![clip] }]);
        let assets = HashMap::from([asset("https://assets.test/bg.mp4", 1920, 1080)]);

        let sw = compile(&scene, &assets, &EncoderProfile::software()).unwrap();
        let g = graph(&sw);
        assert!(g.contains(",hflip,vflip,"));
        assert!(g.contains("format=rgba,eq=brightness=0.2"));

        // On the hardware path both stay ahead of the upload.
        let hw = compile(&scene, &assets, &EncoderProfile::hardware()).unwrap();
        let chain = hw.filters.iter().find(|f| f.contains("hflip")).unwrap();
        let eq = chain.find("eq=brightness").unwrap();
        let upload = chain.rfind("hwupload_cuda").unwrap();
        assert!(eq < upload);
    }

    #[test]
    fn neutral_flips_and_brightness_leave_the_chain_alone() {
        let scene = scene_of(vec![Track {
            clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
        }]);
        let assets = HashMap::from([asset("https://assets.test/bg.mp4", 1920, 1080)]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();
        let g = graph(&plan);
        assert!(!g.contains("hflip"));
        assert!(!g.contains("vflip"));
        assert!(!g.contains("eq=brightness"));
    }

    #[test]
    fn empty_scene_is_a_compilation_error() {
        let scene = scene_of(vec![]);
        let err = compile(&scene, &HashMap::new(), &EncoderProfile::software()).unwrap_err();
        assert!(matches!(err, RenderError::Compilation(_)));
    }

    #[test]
    fn missing_asset_is_a_compilation_error() {
        let scene = scene_of(vec![Track {
            clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
        }]);
        let err = compile(&scene, &HashMap::new(), &EncoderProfile::software()).unwrap_err();
        assert!(matches!(err, RenderError::Compilation(_)));
    }

    #[test]
    fn hardware_plan_uses_device_filters_behind_explicit_upload() {
        let scene = scene_of(vec![Track {
            clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
        }]);
        let assets = HashMap::from([asset("https://assets.test/bg.mp4", 1920, 1080)]);
        let plan = compile(&scene, &assets, &EncoderProfile::hardware()).unwrap();

        let g = graph(&plan);
        assert!(g.contains("hwupload_cuda"));
        assert!(g.contains("scale_cuda=1920:1080"));
        assert!(g.contains("overlay_cuda=x=0:y=0"));
        assert!(!g.contains(",scale=1920"));
    }

    #[test]
    fn hardware_and_software_plans_are_semantically_equivalent() {
        let scene = scene_of(vec![
            Track {
                clips: vec![video("https://assets.test/bg.mp4", 0, 5_000)],
            },
            Track {
                clips: vec![Clip::Image {
                    src: "https://assets.test/logo.png".into(),
                    trim_from: TimeMs(1_000),
                    trim_to: TimeMs(4_000),
                    x: 100.0,
                    y: 200.0,
                    scale: 0.5,
                    opacity: 0.5,
                    rotation: 0.0,
                    flip_x: false,
                    flip_y: false,
                    brightness: 0.0,
                }],
            },
            Track {
                clips: vec![Clip::Audio {
                    src: "https://assets.test/music.mp3".into(),
                    trim_from: TimeMs(0),
                    trim_to: TimeMs(5_000),
                    volume: 0.8,
                }],
            },
        ]);
        let assets = HashMap::from([
            asset("https://assets.test/bg.mp4", 1920, 1080),
            asset("https://assets.test/logo.png", 800, 600),
            asset("https://assets.test/music.mp3", 0, 0),
        ]);

        let sw = compile(&scene, &assets, &EncoderProfile::software()).unwrap();
        let hw = compile(&scene, &assets, &EncoderProfile::hardware()).unwrap();

        // Same inputs, same composition order, same timing, same audio.
        assert_eq!(sw.inputs, hw.inputs);
        assert_eq!(sw.video_out, hw.video_out);
        assert_eq!(sw.audio_out, hw.audio_out);
        assert_eq!(sw.duration_ms, hw.duration_ms);

        for window in ["between(t,0,5)", "between(t,1,4)"] {
            assert!(graph(&sw).contains(window));
            assert!(graph(&hw).contains(window));
        }
        for placement in ["x=0:y=0", "x=100:y=200"] {
            assert!(graph(&sw).contains(placement));
            assert!(graph(&hw).contains(placement));
        }
        assert!(graph(&sw).contains("colorchannelmixer=aa=0.5"));
        assert!(graph(&hw).contains("colorchannelmixer=aa=0.5"));

        // Audio chains do not differ at all between the two paths.
        let audio_filters =
            |p: &FilterPlan| p.filters.iter().filter(|f| f.contains("atrim")).cloned().collect::<Vec<_>>();
        assert_eq!(audio_filters(&sw), audio_filters(&hw));
    }

    #[test]
    fn audio_only_scene_renders_the_bare_canvas() {
        let scene = scene_of(vec![Track {
            clips: vec![Clip::Audio {
                src: "https://assets.test/music.mp3".into(),
                trim_from: TimeMs(0),
                trim_to: TimeMs(3_000),
                volume: 1.0,
            }],
        }]);
        let assets = HashMap::from([asset("https://assets.test/music.mp3", 0, 0)]);
        let plan = compile(&scene, &assets, &EncoderProfile::software()).unwrap();
        assert_eq!(plan.video_out, "base");
        assert_eq!(plan.audio_out.as_deref(), Some("aout"));
    }

    #[test]
    fn normalized_rotation_accepts_negative_multiples() {
        assert_eq!(normalized_rotation(0.0), Some(0));
        assert_eq!(normalized_rotation(90.0), Some(90));
        assert_eq!(normalized_rotation(-90.0), Some(270));
        assert_eq!(normalized_rotation(450.0), Some(90));
        assert_eq!(normalized_rotation(45.0), None);
        assert_eq!(normalized_rotation(90.5), None);
    }
}
