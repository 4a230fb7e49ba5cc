use thiserror::Error;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("scene has no clips")]
    Empty,

    #[error("scene canvas size and fps must be non-zero")]
    BadCanvas,

    #[error("clip {index}: trim window is empty ({from}ms >= {to}ms)")]
    EmptyTrim { index: usize, from: u64, to: u64 },

    #[error("clip {index}: position must be finite")]
    BadPosition { index: usize },

    #[error("clip {index}: scale must be finite and positive (got {value})")]
    BadScale { index: usize, value: f64 },

    #[error("clip {index}: opacity must lie in [0, 1] (got {value})")]
    BadOpacity { index: usize, value: f64 },

    #[error("clip {index}: brightness must lie in [-1, 1] (got {value})")]
    BadBrightness { index: usize, value: f64 },

    #[error("clip {index}: volume must be finite and non-negative (got {value})")]
    BadVolume { index: usize, value: f64 },
}

pub type Result<T> = std::result::Result<T, SceneError>;
