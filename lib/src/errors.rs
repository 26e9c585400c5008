use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) value: f64,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

/// Numerical failures detected while the optimization loop is running
#[derive(Debug, thiserror::Error)]
pub enum OptimizationError {
    #[error("loss became non-finite at step {step}")]
    NonFiniteLoss { step: u32 },
    #[error("gradient became non-finite at step {step}")]
    NonFiniteGradient { step: u32 },
    /// The working image was not part of the autodiff graph, which means the
    /// backend dropped it somewhere between the forward and backward pass
    #[error("no gradient was recorded for the working image")]
    MissingGradient,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pretrained backbone weights could not be loaded
    #[error("unable to load backbone weights from '{}': {reason}", path.display())]
    BackboneUnavailable { path: PathBuf, reason: String },
    /// A content or style image could not be opened or decoded
    #[error("failed to load image '{}': {source}", path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    /// The generated image could not be encoded or written
    #[error("failed to write image '{}': {source}", path.display())]
    ImageWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Optimization(#[from] OptimizationError),
    /// An input parameter had an invalid range specified
    #[error("{0}")]
    InvalidRange(InvalidRange),
    /// Both a content and a style image are needed to build a session
    #[error("no {0} image was provided")]
    MissingImage(&'static str),
    /// The caller raised the cancellation flag between two steps
    #[error("transfer was cancelled at step {step}")]
    Cancelled { step: u32 },
    /// The user specified an image format we don't support as the output
    #[error("the output format '{0}' is not supported")]
    UnsupportedOutputFormat(String),
    /// A custom layer set names a stage that can't be captured on its own
    #[error("layer {layer} can't be captured: {reason}")]
    InvalidLayerSet { layer: usize, reason: &'static str },
    /// After resizing, an image's shorter side is too small to survive the
    /// pooling stages in front of the deepest layer the backbone reads
    #[error("the {role} image is {width}x{height}, its shorter side must be at least {min_side} pixels")]
    ImageTooSmall {
        role: &'static str,
        width: u32,
        height: u32,
        min_side: u32,
    },
}

impl Error {
    pub(crate) fn invalid_range(name: &'static str, value: f64, min: f64, max: f64) -> Self {
        Self::InvalidRange(InvalidRange {
            min,
            max,
            value,
            name,
        })
    }
}
