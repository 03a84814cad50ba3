//! Turns uploaded bytes into the `[3, H, W]` float tensor the detector reads.

use std::io::Cursor;

use image::error::{LimitError, LimitErrorKind};
use image::{DynamicImage, ImageError, ImageReader, Limits};
use serde::Serialize;

use crate::error::DecodeError;

/// Width and height of the original upload, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Channel-first RGB pixels scaled to `[0, 1]`. No resizing, no mean/std
/// normalisation; the model does that itself.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    data: Vec<f32>,
    size: ImageSize,
}

impl ImageTensor {
    /// Converts any decoded image to 3-channel RGB and lays it out as CHW.
    pub fn from_image(image: DynamicImage) -> Self {
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        let plane = width as usize * height as usize;

        let mut data = vec![0.0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            data[i] = f32::from(pixel[0]) / 255.0;
            data[plane + i] = f32::from(pixel[1]) / 255.0;
            data[2 * plane + i] = f32::from(pixel[2]) / 255.0;
        }

        Self {
            data,
            size: ImageSize { width, height },
        }
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// Tensor shape as `[channels, height, width]`.
    pub fn shape(&self) -> [usize; 3] {
        [3, self.size.height as usize, self.size.width as usize]
    }

    #[cfg(test)]
    fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Bounds on what an upload may decode to. The f32 tensor costs 12 bytes
/// per pixel on top of the decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_side: u32,
    pub max_pixels: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_side: 8192,
            max_pixels: 25_000_000,
        }
    }
}

/// Decodes bytes of any supported format under the default [`DecodeLimits`].
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    decode_with(bytes, DecodeLimits::default())
}

/// Decodes bytes of any supported format, guessing it from the content.
///
/// Oversized images fail with an `image` limit error before their pixel
/// buffer is allocated where the format reports dimensions up front.
pub fn decode_with(bytes: &[u8], bounds: DecodeLimits) -> Result<DynamicImage, DecodeError> {
    let mut limits = Limits::default();
    limits.max_image_width = Some(bounds.max_side);
    limits.max_image_height = Some(bounds.max_side);
    // Room for a 4-channel 8-bit buffer at the pixel cap.
    limits.max_alloc = Some(bounds.max_pixels.saturating_mul(4));

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(ImageError::IoError)?;
    reader.limits(limits);
    let image = reader.decode()?;

    if u64::from(image.width()) * u64::from(image.height()) > bounds.max_pixels {
        return Err(DecodeError(ImageError::Limits(LimitError::from_kind(
            LimitErrorKind::DimensionError,
        ))));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    fn png_gray(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(GrayImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn is_limit_error(err: &DecodeError) -> bool {
        matches!(err.0, ImageError::Limits(_))
    }

    #[test]
    fn layout_is_channel_first() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 102, 255]));

        let tensor = ImageTensor::from_image(DynamicImage::ImageRgb8(img));
        assert_eq!(tensor.shape(), [3, 1, 2]);
        assert_eq!(tensor.size(), ImageSize { width: 2, height: 1 });
        let expected = [1.0, 0.0, 0.0, 0.4, 0.2, 1.0];
        for (got, want) in tensor.data().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn grayscale_is_expanded_to_rgb() {
        let img = GrayImage::from_pixel(3, 2, Luma([128]));
        let tensor = ImageTensor::from_image(DynamicImage::ImageLuma8(img));
        assert_eq!(tensor.shape(), [3, 2, 3]);
        assert_eq!(tensor.data().len(), 18);
        assert!(tensor.data().iter().all(|v| (v - 128.0 / 255.0).abs() < 1e-6));
    }

    #[test]
    fn alpha_is_dropped() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([10, 20, 30, 0]));
        let tensor = ImageTensor::from_image(DynamicImage::ImageRgba8(img));
        assert_eq!(tensor.into_data().len(), 3);
    }

    #[test]
    fn decode_png_bytes() {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(4, 5))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let img = decode(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (4, 5));
    }

    #[test]
    fn decode_rejects_side_over_limit() {
        let bounds = DecodeLimits {
            max_side: 64,
            max_pixels: 1_000_000,
        };
        assert!(decode_with(&png_gray(64, 10), bounds).is_ok());
        let err = decode_with(&png_gray(65, 10), bounds).unwrap_err();
        assert!(is_limit_error(&err), "{err}");
    }

    #[test]
    fn decode_rejects_pixel_count_over_limit() {
        let bounds = DecodeLimits {
            max_side: 1000,
            max_pixels: 10_000,
        };
        assert!(decode_with(&png_gray(100, 100), bounds).is_ok());
        let err = decode_with(&png_gray(200, 200), bounds).unwrap_err();
        assert!(is_limit_error(&err), "{err}");
    }

    #[test]
    fn default_limits_bound_the_tensor() {
        let bounds = DecodeLimits::default();
        assert!(bounds.max_pixels <= u64::from(bounds.max_side) * u64::from(bounds.max_side));
        assert!(decode(&png_gray(8193, 1)).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"definitely not an image").is_err());
        assert!(decode(&[]).is_err());
    }
}
