// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer: synthesizing an
//! image that keeps the structure of a content image while adopting the
//! textures and colors of a style image.
//!
//! The working image starts out as a copy of the content image and is refined
//! by gradient-based optimization against features extracted from a frozen,
//! pretrained VGG network. Content is matched through the activation of a
//! single mid-depth layer, style through the Gram matrices of several layers.
//!
//! First, you load a `Backbone` once. Then you build a `Session` via a
//! `SessionBuilder`, which follows the builder pattern. Calling `build` on the
//! `SessionBuilder` loads both images, checks the parameters and precomputes
//! the content and style references.
//!
//! `Session` has a `run()` method that optimizes the working image and
//! returns it as a `StyledImage`, which you can save or stream.
//!
//! ## Usage
//!
//! ```no_run
//! use neural_style::{Backbone, CpuBackend, Variant};
//!
//! // Load the backbone once, it can be shared by any number of sessions
//! let backbone =
//!     Backbone::<CpuBackend>::load(Variant::Vgg19, "vgg19.pth", &Default::default())
//!         .expect("failed to load backbone");
//!
//! let session = neural_style::SessionBuilder::new()
//!     .content(&"imgs/tom.jpg")
//!     .style(&"imgs/starry_night.jpg")
//!     // Set some parameters
//!     .steps(200)
//!     .intensity(1.5)
//!     .build(&backbone)
//!     .expect("failed to build session");
//!
//! let styled = session.run(None).expect("transfer failed");
//! styled.save("my_styled_img.png").expect("failed to save styled image");
//! ```
pub mod backbone;
mod errors;
pub mod gram;
pub mod loss;
pub mod optim;
mod optimize;
pub mod session;
mod utils;
use utils::*;

pub use burn;
pub use image;

use burn::tensor::{backend::AutodiffBackend, Tensor};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

pub use backbone::{Backbone, LayerSet, Variant};
pub use errors::{Error, InvalidRange, OptimizationError};
pub use loss::{LossComposer, LossValue, References};
pub use optim::{AdamConfig, LbfgsConfig, OptimizerKind};
pub use optimize::{Convergence, PROGRESS_INTERVAL};
pub use session::{ProgressUpdate, Session, SessionBuilder, TransferProgress};
pub use utils::{fit_longest_side, load_dynamic_image, ImageSource};

/// The CPU backend with autodiff, what the CLI uses by default
pub type CpuBackend = burn::backend::Autodiff<burn::backend::NdArray>;

/// The wgpu accelerator backend with autodiff
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// The style weight used when none is given, and the base that `intensity`
/// scales
pub const DEFAULT_STYLE_WEIGHT: f64 = 1_000_000.0;
pub const DEFAULT_CONTENT_WEIGHT: f64 = 1.0;
pub const DEFAULT_STEPS: u32 = 300;
pub const DEFAULT_IMAGE_SIZE: u32 = 512;
/// The step budget of `quick_transfer`
pub const QUICK_STEPS: u32 = 150;

const MAX_INTENSITY: f64 = 2.0;
const MAX_IMAGE_SIZE: u32 = 4096;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Step count presets
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Quality {
    Fast,
    Standard,
    High,
}

impl Quality {
    pub fn steps(self) -> u32 {
        match self {
            Self::Fast => 100,
            Self::Standard => 200,
            Self::High => 300,
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(format!(
                "quality `{}` not one of: 'fast', 'standard', 'high'",
                other
            )),
        }
    }
}

struct Parameters {
    steps: u32,
    style_weight: f64,
    content_weight: f64,
    intensity: Option<f64>,
    image_size: u32,
    optimizer: OptimizerKind,
    convergence: Option<Convergence>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            style_weight: DEFAULT_STYLE_WEIGHT,
            content_weight: DEFAULT_CONTENT_WEIGHT,
            intensity: None,
            image_size: DEFAULT_IMAGE_SIZE,
            optimizer: OptimizerKind::default(),
            convergence: None,
        }
    }
}

impl Parameters {
    fn style_weight(&self) -> f64 {
        match self.intensity {
            Some(intensity) => DEFAULT_STYLE_WEIGHT * intensity,
            None => self.style_weight,
        }
    }

    fn to_loop_params(&self) -> optimize::LoopParams {
        optimize::LoopParams {
            steps: self.steps,
            composer: LossComposer::new(self.content_weight, self.style_weight()),
            convergence: self.convergence,
        }
    }
}

/// An image produced by a `Session::run()`
pub struct StyledImage {
    inner: image::RgbImage,
}

impl StyledImage {
    /// Saves the styled image to the specified path, the format is inferred
    /// from the extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        save_image(&self.inner, path.as_ref())
    }

    /// Writes the styled image to the specified stream
    pub fn write<W: std::io::Write + std::io::Seek>(
        &self,
        writer: &mut W,
        fmt: image::ImageFormat,
    ) -> Result<(), Error> {
        self.inner
            .write_to(writer, fmt)
            .map_err(|source| Error::ImageWrite {
                path: PathBuf::from("<stream>"),
                source,
            })
    }

    pub fn dims(&self) -> Dims {
        Dims::new(self.inner.width(), self.inner.height())
    }

    /// Returns the styled output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.inner)
    }
}

impl AsRef<image::RgbImage> for StyledImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.inner
    }
}

/// Checks that `path` has an extension we can encode to
pub fn check_output_format(path: &Path) -> Result<(), Error> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") | Some("jpg") | Some("jpeg") | Some("bmp") => Ok(()),
        Some(other) => Err(Error::UnsupportedOutputFormat(other.to_owned())),
        None => Err(Error::UnsupportedOutputFormat(String::new())),
    }
}

/// Transfers the style of the image at `style` onto the image at `content`
/// and writes the result to `output`, returning the path of the written
/// image.
///
/// Both images are resized so their longer side is `DEFAULT_IMAGE_SIZE`.
/// Nothing is written unless the whole transfer succeeds.
pub fn transfer<B, C, S, O>(
    backbone: &Backbone<B>,
    content: C,
    style: S,
    output: O,
    steps: u32,
    style_weight: f64,
    content_weight: f64,
) -> Result<PathBuf, Error>
where
    B: AutodiffBackend,
    C: AsRef<Path>,
    S: AsRef<Path>,
    O: AsRef<Path>,
{
    let sb = SessionBuilder::new()
        .steps(steps)
        .style_weight(style_weight)
        .content_weight(content_weight);

    run_to_file(sb, backbone, content.as_ref(), style.as_ref(), output.as_ref())
}

/// A faster transfer with a fixed, lower step budget, where the style weight
/// is `DEFAULT_STYLE_WEIGHT` scaled by `intensity` (range 0.0 - 2.0), see
/// `SessionBuilder::quick`
pub fn quick_transfer<B, C, S, O>(
    backbone: &Backbone<B>,
    content: C,
    style: S,
    output: O,
    intensity: f64,
) -> Result<PathBuf, Error>
where
    B: AutodiffBackend,
    C: AsRef<Path>,
    S: AsRef<Path>,
    O: AsRef<Path>,
{
    let sb = SessionBuilder::new().quick(intensity);

    run_to_file(sb, backbone, content.as_ref(), style.as_ref(), output.as_ref())
}

fn run_to_file<'a, B: AutodiffBackend>(
    sb: SessionBuilder<'a>,
    backbone: &Backbone<B>,
    content: &'a Path,
    style: &'a Path,
    output: &Path,
) -> Result<PathBuf, Error> {
    check_output_format(output)?;

    let styled = sb
        .content(content)
        .style(style)
        .build(backbone)?
        .run(None)?;

    styled.save(output)?;
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intensity_scales_the_default_style_weight() {
        let params = Parameters {
            style_weight: 5.0,
            intensity: Some(1.5),
            ..Default::default()
        };
        assert_eq!(params.style_weight(), 1_500_000.0);

        let params = Parameters {
            style_weight: 5.0,
            ..Default::default()
        };
        assert_eq!(params.style_weight(), 5.0);
    }

    #[test]
    fn quality_presets() {
        assert_eq!(Quality::Fast.steps(), 100);
        assert_eq!(Quality::Standard.steps(), 200);
        assert_eq!(Quality::High.steps(), 300);
        assert_eq!("high".parse::<Quality>().unwrap(), Quality::High);
        assert!("ultra".parse::<Quality>().is_err());
    }

    #[test]
    fn output_formats() {
        assert!(check_output_format(Path::new("out/a.png")).is_ok());
        assert!(check_output_format(Path::new("a.jpeg")).is_ok());
        assert!(matches!(
            check_output_format(Path::new("a.tiff")),
            Err(Error::UnsupportedOutputFormat(ext)) if ext == "tiff"
        ));
        assert!(check_output_format(Path::new("noext")).is_err());
    }
}
