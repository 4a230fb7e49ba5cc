use crate::error::{Result, SceneError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

// ---------------------------------------------------------------------------
// TimeMs
// ---------------------------------------------------------------------------

/// A point or span on the scene timeline, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeMs(pub u64);

impl TimeMs {
    pub const ZERO: Self = Self(0);

    pub fn from_seconds(s: f64) -> Self {
        Self((s * 1_000.0) as u64)
    }

    pub fn as_seconds(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }
}

impl Add for TimeMs {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for TimeMs {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for TimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0 % 1_000;
        let total_secs = self.0 / 1_000;
        let secs = total_secs % 60;
        let total_mins = total_secs / 60;
        let mins = total_mins % 60;
        let hours = total_mins / 60;
        write!(f, "{:02}:{:02}:{:02}.{:03}", hours, mins, secs, ms)
    }
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

// ---------------------------------------------------------------------------
// Clip
// ---------------------------------------------------------------------------

fn default_scale() -> f64 {
    1.0
}

fn default_opacity() -> f64 {
    1.0
}

fn default_volume() -> f64 {
    1.0
}

/// One media reference on a track. The trim window `[trim_from, trim_to)` is
/// both the source window and the span during which the clip is visible or
/// audible on the output timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Clip {
    #[serde(rename_all = "camelCase")]
    Video {
        src: String,
        trim_from: TimeMs,
        trim_to: TimeMs,
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default = "default_opacity")]
        opacity: f64,
        /// Degrees clockwise; only multiples of 90 are renderable.
        #[serde(default)]
        rotation: f64,
        #[serde(default)]
        flip_x: bool,
        #[serde(default)]
        flip_y: bool,
        /// Additive brightness offset in `[-1, 1]`; 0 leaves the clip
        /// unchanged.
        #[serde(default)]
        brightness: f64,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        src: String,
        trim_from: TimeMs,
        trim_to: TimeMs,
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default = "default_opacity")]
        opacity: f64,
        #[serde(default)]
        rotation: f64,
        #[serde(default)]
        flip_x: bool,
        #[serde(default)]
        flip_y: bool,
        #[serde(default)]
        brightness: f64,
    },
    #[serde(rename_all = "camelCase")]
    Audio {
        src: String,
        trim_from: TimeMs,
        trim_to: TimeMs,
        #[serde(default = "default_volume")]
        volume: f64,
    },
}

impl Clip {
    pub fn src(&self) -> &str {
        match self {
            Clip::Video { src, .. } => src,
            Clip::Image { src, .. } => src,
            Clip::Audio { src, .. } => src,
        }
    }

    pub fn trim_from(&self) -> TimeMs {
        match self {
            Clip::Video { trim_from, .. } => *trim_from,
            Clip::Image { trim_from, .. } => *trim_from,
            Clip::Audio { trim_from, .. } => *trim_from,
        }
    }

    pub fn trim_to(&self) -> TimeMs {
        match self {
            Clip::Video { trim_to, .. } => *trim_to,
            Clip::Image { trim_to, .. } => *trim_to,
            Clip::Audio { trim_to, .. } => *trim_to,
        }
    }

    pub fn is_visual(&self) -> bool {
        matches!(self, Clip::Video { .. } | Clip::Image { .. })
    }

    pub fn duration(&self) -> TimeMs {
        self.trim_to() - self.trim_from()
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.trim_from() >= self.trim_to() {
            return Err(SceneError::EmptyTrim {
                index,
                from: self.trim_from().0,
                to: self.trim_to().0,
            });
        }
        match *self {
            Clip::Video {
                x,
                y,
                scale,
                opacity,
                brightness,
                ..
            }
            | Clip::Image {
                x,
                y,
                scale,
                opacity,
                brightness,
                ..
            } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err(SceneError::BadPosition { index });
                }
                if !scale.is_finite() || scale <= 0.0 {
                    return Err(SceneError::BadScale { index, value: scale });
                }
                if !opacity.is_finite() || !(0.0..=1.0).contains(&opacity) {
                    return Err(SceneError::BadOpacity {
                        index,
                        value: opacity,
                    });
                }
                if !brightness.is_finite() || !(-1.0..=1.0).contains(&brightness) {
                    return Err(SceneError::BadBrightness {
                        index,
                        value: brightness,
                    });
                }
            }
            Clip::Audio { volume, .. } => {
                if !volume.is_finite() || volume < 0.0 {
                    return Err(SceneError::BadVolume {
                        index,
                        value: volume,
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Track / Scene
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Track {
    pub clips: Vec<Clip>,
}

/// A declarative scene description. Track order defines compositing order:
/// a later track draws above an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scene {
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub size: Size,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_fps() -> u32 {
    30
}

fn default_format() -> String {
    "mp4".to_string()
}

impl Scene {
    /// All clips in compositing order, with their global clip index.
    pub fn clips(&self) -> impl Iterator<Item = (usize, &Clip)> {
        self.tracks
            .iter()
            .flat_map(|t| t.clips.iter())
            .enumerate()
    }

    /// Total scene duration: the maximum clip end time.
    pub fn duration_ms(&self) -> TimeMs {
        self.clips()
            .map(|(_, c)| c.trim_to())
            .max()
            .unwrap_or(TimeMs::ZERO)
    }

    /// Check the scene invariants before any work is done on its behalf.
    pub fn validate(&self) -> Result<()> {
        let mut any = false;
        for (index, clip) in self.clips() {
            any = true;
            clip.validate(index)?;
        }
        if !any {
            return Err(SceneError::Empty);
        }
        if self.size.width == 0 || self.size.height == 0 || self.fps == 0 {
            return Err(SceneError::BadCanvas);
        }
        Ok(())
    }

    /// Apply submission-time overrides on top of the scene's own settings.
    pub fn apply_options(&mut self, options: &RenderOptions) {
        if let Some(fps) = options.fps {
            self.fps = fps;
        }
        if let Some(size) = options.size {
            self.size = size;
        }
        if let Some(format) = &options.format {
            self.format = format.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// RenderOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RenderOptions {
    pub fps: Option<u32>,
    pub size: Option<Size>,
    pub format: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
