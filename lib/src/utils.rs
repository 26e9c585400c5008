use crate::{Dims, Error};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the session
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    /// What to call this source in error messages
    fn origin(&self) -> PathBuf {
        match self {
            Self::Path(path) => path.to_path_buf(),
            Self::Memory(_) => PathBuf::from("<memory>"),
            Self::Image(_) => PathBuf::from("<image>"),
        }
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + ?Sized + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(
    src: ImageSource<'_>,
) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Scales `dims` so that the longer side equals `target`, keeping the aspect
/// ratio. The shorter side is truncated to whole pixels and never drops
/// below 1.
pub fn fit_longest_side(dims: Dims, target: u32) -> Dims {
    let scale = |short: u32, long: u32| {
        ((f64::from(short) * f64::from(target) / f64::from(long)).floor() as u32).max(1)
    };

    if dims.width >= dims.height {
        Dims::new(target, scale(dims.height, dims.width))
    } else {
        Dims::new(scale(dims.width, dims.height), target)
    }
}

/// Loads an image as RGB, resized so its longer side is `target` pixels
pub(crate) fn load_image(src: ImageSource<'_>, target: u32) -> Result<image::RgbImage, Error> {
    let origin = src.origin();
    let img = load_dynamic_image(src).map_err(|source| Error::ImageLoad {
        path: origin,
        source,
    })?;

    let img = img.to_rgb8();
    let size = fit_longest_side(Dims::new(img.width(), img.height()), target);

    let img = if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img,
            size.width,
            size.height,
            image::imageops::FilterType::CatmullRom,
        )
    } else {
        img
    };

    Ok(img)
}

/// Converts an 8-bit RGB image into a `[1, 3, H, W]` tensor in `[0, 1]`
pub(crate) fn image_to_tensor<B: Backend>(
    img: &image::RgbImage,
    device: &B::Device,
) -> Tensor<B, 4> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;

    let mut values = vec![0f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            values[c * plane + i] = f32::from(pixel[c]) / 255.0;
        }
    }

    Tensor::from_data(
        TensorData::new(values, [1, 3, height as usize, width as usize]),
        device,
    )
}

/// Converts a `[1, 3, H, W]` tensor back to an 8-bit RGB image, clamping to
/// `[0, 1]` first. The quantization is lossy.
pub(crate) fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> image::RgbImage {
    let [_, _, height, width] = tensor.dims();
    let plane = height * width;
    let values: Vec<f32> = tensor.clamp(0.0, 1.0).into_data().iter::<f32>().collect();

    image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        let channel = |c: usize| (values[c * plane + i] * 255.0).round() as u8;
        image::Rgb([channel(0), channel(1), channel(2)])
    })
}

/// Encodes `img` with the format implied by the extension of `path` and
/// writes it out.
///
/// The image is encoded in memory, written to a temporary file next to
/// `path` and only then renamed over it, so `path` either holds the complete
/// image or is left as it was.
pub(crate) fn save_image(img: &image::RgbImage, path: &Path) -> Result<(), Error> {
    let write_err = |source| Error::ImageWrite {
        path: path.to_path_buf(),
        source,
    };
    let io_err = |err: std::io::Error| write_err(image::ImageError::IoError(err));

    let format = image::ImageFormat::from_path(path).map_err(write_err)?;

    let mut encoded = std::io::Cursor::new(Vec::new());
    img.write_to(&mut encoded, format).map_err(write_err)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    staged.write_all(encoded.get_ref()).map_err(io_err)?;
    staged.as_file().sync_all().map_err(io_err)?;
    staged.persist(path).map_err(|err| io_err(err.error))?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn fits_landscape() {
        assert_eq!(fit_longest_side(Dims::new(512, 341), 512), Dims::new(512, 341));
        assert_eq!(fit_longest_side(Dims::new(1024, 682), 512), Dims::new(512, 341));
        assert_eq!(fit_longest_side(Dims::new(600, 600), 512), Dims::square(512));
    }

    #[test]
    fn truncates_the_shorter_side() {
        // 667 * 512 / 1000 = 341.504
        assert_eq!(fit_longest_side(Dims::new(1000, 667), 512), Dims::new(512, 341));
        assert_eq!(fit_longest_side(Dims::new(12, 8), 512), Dims::new(512, 341));
    }

    #[test]
    fn fits_portrait() {
        assert_eq!(fit_longest_side(Dims::new(300, 600), 512), Dims::new(256, 512));
        assert_eq!(fit_longest_side(Dims::new(1, 4000), 512), Dims::new(1, 512));
    }

    #[test]
    fn tensor_layout_is_planar() {
        let img = image::RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([x as u8 * 100, y as u8 * 255, 51])
        });
        let tensor = image_to_tensor::<NdArray>(&img, &Default::default());

        assert_eq!(tensor.dims(), [1, 3, 2, 3]);

        let values = tensor.clone().into_data().to_vec::<f32>().unwrap();
        // red plane, first row
        assert_eq!(&values[0..3], &[0.0, 100.0 / 255.0, 200.0 / 255.0]);
        // green plane, second row
        assert_eq!(&values[6 + 3..6 + 6], &[1.0, 1.0, 1.0]);

        assert_eq!(tensor_to_image(tensor), img);
    }

    #[test]
    fn out_of_range_values_are_clamped_on_the_way_out() {
        let tensor = Tensor::<NdArray, 4>::from_data(
            TensorData::new(vec![-0.5f32, 1.5, 0.5], [1, 3, 1, 1]),
            &Default::default(),
        );

        let img = tensor_to_image(tensor);
        assert_eq!(img.get_pixel(0, 0), &image::Rgb([0, 255, 128]));
    }

    #[test]
    fn unknown_extension_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.nope");

        let err = save_image(&image::RgbImage::new(2, 2), &path).unwrap_err();

        assert!(matches!(err, Error::ImageWrite { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn saving_leaves_only_the_image_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");

        save_image(&image::RgbImage::new(4, 3), &path).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.png")]);
        assert_eq!(image::open(&path).unwrap().width(), 4);
    }

    #[test]
    fn failed_rename_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        // a directory squatting on the destination makes the final rename fail
        let path = dir.path().join("out.png");
        std::fs::create_dir(&path).unwrap();

        let err = save_image(&image::RgbImage::new(4, 3), &path).unwrap_err();

        assert!(matches!(err, Error::ImageWrite { .. }));
        assert!(path.is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
