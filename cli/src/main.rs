mod progress_bar;

use structopt::StructOpt;

use neural_style::{
    check_output_format, Backbone, Convergence, Error, OptimizerKind, Quality, SessionBuilder,
    TransferProgress, Variant,
};
use progress_bar::TransferBar;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[cfg(not(feature = "wgpu"))]
type Backend = neural_style::CpuBackend;
#[cfg(feature = "wgpu")]
type Backend = neural_style::GpuBackend;

#[derive(StructOpt)]
struct Images {
    /// The image whose structure is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose textures and colors are transferred
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Transfer {
    #[structopt(flatten)]
    images: Images,
    /// The number of optimization steps
    #[structopt(long, conflicts_with = "quality")]
    steps: Option<u32>,
    /// A step count preset, one of 'fast' (100), 'standard' (200), 'high' (300)
    #[structopt(long)]
    quality: Option<Quality>,
    /// The weight of the style loss. Defaults to 1,000,000
    #[structopt(long, conflicts_with = "intensity")]
    style_weight: Option<f64>,
    /// Scales the default style weight. Range (0.0 - 2.0)
    #[structopt(long)]
    intensity: Option<f64>,
    /// The weight of the content loss
    #[structopt(long, default_value = "1")]
    content_weight: f64,
    /// Stop early once the total loss improves by less than this between
    /// progress checkpoints, `converge-patience` times in a row
    #[structopt(long)]
    converge_tolerance: Option<f64>,
    #[structopt(long, default_value = "3")]
    converge_patience: u32,
}

#[derive(StructOpt)]
struct Quick {
    #[structopt(flatten)]
    images: Images,
    /// Scales the default style weight. Range (0.0 - 2.0)
    #[structopt(long, default_value = "1")]
    intensity: f64,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Transfers the style of one image onto the content of another
    #[structopt(name = "transfer")]
    Transfer(Transfer),
    /// A faster transfer with a fixed step budget
    #[structopt(name = "quick")]
    Quick(Quick),
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Repaints an image in the style of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Path to the pretrained VGG weights, as a torchvision state dict (`.pth`)
    #[structopt(long, parse(from_os_str))]
    weights: PathBuf,
    /// The backbone architecture the weights belong to, 'vgg19' or 'vgg16'
    #[structopt(long, default_value = "vgg19")]
    variant: Variant,
    /// Both images are resized so that their longer side is this many pixels
    #[structopt(long, default_value = "512")]
    size: u32,
    /// The path to save the styled image to, the file extension determines
    /// the image format used
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// The optimizer used to refine the image, 'lbfgs' or 'adam'
    #[structopt(long, default_value = "lbfgs")]
    optimizer: OptimizerKind,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
    #[structopt(subcommand)]
    cmd: Subcommand,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    // Check the output extension before loading anything heavy
    check_output_format(&args.output_path)?;

    let (images, sb) = match &args.cmd {
        Subcommand::Transfer(t) => {
            let mut sb = SessionBuilder::new().content_weight(t.content_weight);

            if let Some(quality) = t.quality {
                sb = sb.quality(quality);
            }

            if let Some(steps) = t.steps {
                sb = sb.steps(steps);
            }

            if let Some(weight) = t.style_weight {
                sb = sb.style_weight(weight);
            }

            if let Some(intensity) = t.intensity {
                sb = sb.intensity(intensity);
            }

            if let Some(tolerance) = t.converge_tolerance {
                sb = sb.converge(Convergence {
                    tolerance,
                    patience: t.converge_patience,
                });
            }

            (&t.images, sb)
        }
        Subcommand::Quick(q) => (
            &q.images,
            SessionBuilder::new().quick(q.intensity),
        ),
    };

    let device = Default::default();
    let backbone = Backbone::<Backend>::load(args.variant, &args.weights, &device)?;

    let session = sb
        .content(&images.content)
        .style(&images.style)
        .image_size(args.size)
        .optimizer(args.optimizer)
        .build(&backbone)?;

    let progress: Option<Box<dyn TransferProgress>> = if !args.no_progress {
        Some(Box::new(TransferBar::new(session.total_steps())))
    } else {
        None
    };

    let styled = session.run(progress)?;
    styled.save(&args.output_path)?;

    tracing::info!(path = %args.output_path.display(), "saved styled image");

    Ok(())
}
