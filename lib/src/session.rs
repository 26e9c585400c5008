use crate::*;
use burn::tensor::backend::AutodiffBackend;
use std::sync::{atomic::AtomicBool, Arc};

/// Style transfer session.
///
/// A session owns the working image and the optimizer state of a single
/// transfer, while only borrowing the backbone, so any number of sessions can
/// share one loaded backbone.
///
/// Calling `run()` optimizes the working image and returns it, consuming the
/// session in the process. You can provide a `TransferProgress`
/// implementation to get updates every 50 steps.
///
/// # Example
/// ```no_run
/// use neural_style::{Backbone, CpuBackend, SessionBuilder, Variant};
///
/// let device = Default::default();
/// let backbone = Backbone::<CpuBackend>::load(Variant::Vgg19, "vgg19.pth", &device)
///     .expect("failed to load backbone");
///
/// let session = SessionBuilder::new()
///     .content(&"imgs/tom.jpg")
///     .style(&"imgs/starry_night.jpg")
///     .steps(200)
///     .build(&backbone)
///     .expect("failed to build session");
///
/// let styled = session.run(None).expect("transfer failed");
/// styled.save("out/tom.png").expect("failed to save image");
/// ```
pub struct Session<'b, B: AutodiffBackend> {
    backbone: &'b Backbone<B>,
    content: Tensor<B::InnerBackend, 4>,
    references: References<B>,
    params: Parameters,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'b, B: AutodiffBackend> Session<'b, B> {
    /// The dimensions of the resized content image, which are also the
    /// dimensions of the output
    pub fn output_size(&self) -> Dims {
        let [_, _, height, width] = self.content.dims();
        Dims::new(width as u32, height as u32)
    }

    pub fn total_steps(&self) -> u32 {
        self.params.steps
    }

    /// Runs the optimization loop and outputs the styled image.
    pub fn run(
        self,
        mut progress: Option<Box<dyn TransferProgress + '_>>,
    ) -> Result<StyledImage, Error> {
        let size = self.output_size();
        let start = std::time::Instant::now();

        tracing::info!(
            width = size.width,
            height = size.height,
            steps = self.params.steps,
            style_weight = self.params.style_weight(),
            content_weight = self.params.content_weight,
            optimizer = self.params.optimizer.name(),
            "starting style transfer"
        );

        let mut optimizer = self.params.optimizer.build::<B::InnerBackend>();

        let image = optimize::optimize(
            self.backbone,
            &self.references,
            self.content,
            &self.params.to_loop_params(),
            optimizer.as_mut(),
            progress.as_deref_mut(),
            self.cancel.as_deref(),
        )?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "style transfer complete"
        );

        Ok(StyledImage {
            inner: utils::tensor_to_image(image),
        })
    }
}

/// Builds a session by setting parameters and adding the content and style
/// images. Calling `build` validates the parameters, loads both images and
/// precomputes the references the working image is compared against.
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    cancel: Option<Arc<AtomicBool>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder` with default parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure is preserved. The output has the same
    /// dimensions as this image after resizing.
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose textures and colors are adopted
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// The number of optimization steps. The loop always runs all of them,
    /// unless a convergence criterion is set.
    ///
    /// Default: 300
    pub fn steps(mut self, steps: u32) -> Self {
        self.params.steps = steps;
        self
    }

    /// Sets the step count from a quality preset
    pub fn quality(mut self, quality: Quality) -> Self {
        self.params.steps = quality.steps();
        self
    }

    /// The weight of the Gram matrix distance. Overridden by `intensity`.
    ///
    /// Default: 1,000,000
    pub fn style_weight(mut self, weight: f64) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// Scales the default style weight, range (0.0, 2.0)
    pub fn intensity(mut self, intensity: f64) -> Self {
        self.params.intensity = Some(intensity);
        self
    }

    /// The fast-mode preset: `QUICK_STEPS` steps, the default content weight
    /// and a style weight of `DEFAULT_STYLE_WEIGHT * intensity`
    pub fn quick(self, intensity: f64) -> Self {
        self.steps(QUICK_STEPS)
            .intensity(intensity)
            .content_weight(DEFAULT_CONTENT_WEIGHT)
    }

    /// The weight of the content activation distance.
    ///
    /// Default: 1
    pub fn content_weight(mut self, weight: f64) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// Both images are resized so that their longer side is this many pixels
    ///
    /// Default: 512
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.image_size = size;
        self
    }

    /// Default: L-BFGS
    pub fn optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.params.optimizer = optimizer;
        self
    }

    /// Stops early once the loss stops improving, see `Convergence`
    pub fn converge(mut self, convergence: Convergence) -> Self {
        self.params.convergence = Some(convergence);
        self
    }

    /// A flag that is checked between steps. Raising it makes `run` fail with
    /// `Error::Cancelled`.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or input
    /// images were specified.
    pub fn build<'b, B: AutodiffBackend>(
        self,
        backbone: &'b Backbone<B>,
    ) -> Result<Session<'b, B>, Error> {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::MissingImage("content"))?;
        let style = self.style.ok_or(Error::MissingImage("style"))?;

        // Fail on either image before doing any work on the backbone
        let content = load_image(content, self.params.image_size)?;
        let style = load_image(style, self.params.image_size)?;

        // Every pool halves the image, so a thin image can vanish before the
        // deepest layer is reached
        let min_side = backbone.min_input_side();
        for (role, img) in [("content", &content), ("style", &style)] {
            if img.width().min(img.height()) < min_side {
                return Err(Error::ImageTooSmall {
                    role,
                    width: img.width(),
                    height: img.height(),
                    min_side,
                });
            }
        }

        let device = backbone.device();
        let content = image_to_tensor::<B>(&content, device);
        let style = image_to_tensor::<B>(&style, device);

        let references = References::new(backbone, content.clone(), style);

        Ok(Session {
            backbone,
            content: content.inner(),
            references,
            params: self.params,
            cancel: self.cancel,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let weight_ok = |w: f64| w.is_finite() && w >= 0.0;

        if !weight_ok(self.params.style_weight) {
            return Err(Error::invalid_range(
                "style-weight",
                self.params.style_weight,
                0.0,
                f64::MAX,
            ));
        }

        if !weight_ok(self.params.content_weight) {
            return Err(Error::invalid_range(
                "content-weight",
                self.params.content_weight,
                0.0,
                f64::MAX,
            ));
        }

        if let Some(intensity) = self.params.intensity {
            if !(0.0..=MAX_INTENSITY).contains(&intensity) {
                return Err(Error::invalid_range(
                    "intensity",
                    intensity,
                    0.0,
                    MAX_INTENSITY,
                ));
            }
        }

        if self.params.image_size == 0 || self.params.image_size > MAX_IMAGE_SIZE {
            return Err(Error::invalid_range(
                "image-size",
                f64::from(self.params.image_size),
                1.0,
                f64::from(MAX_IMAGE_SIZE),
            ));
        }

        if let Some(conv) = self.params.convergence {
            if !weight_ok(conv.tolerance) {
                return Err(Error::invalid_range(
                    "converge-tolerance",
                    conv.tolerance,
                    0.0,
                    f64::MAX,
                ));
            }

            if conv.patience == 0 {
                return Err(Error::invalid_range(
                    "converge-patience",
                    0.0,
                    1.0,
                    f64::from(u32::MAX),
                ));
            }
        }

        Ok(())
    }
}

/// Helper struct for passing progress information to external callers
#[derive(Copy, Clone, Debug)]
pub struct ProgressUpdate {
    /// The number of steps completed
    pub step: u32,
    pub total_steps: u32,
    /// `step / total_steps`, in the range `[0, 100]`
    pub percent: f64,
    /// The weighted loss components at the start of the last step
    pub loss: LossValue,
}

/// Allows the optimization loop to update external callers with the current
/// progress of the transfer.
///
/// Updates are purely observational. A panicking observer is logged and
/// otherwise ignored.
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info)
    }
}
