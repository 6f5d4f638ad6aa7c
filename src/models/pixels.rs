//! Pixel buffers flowing between the decode, preprocess and inference stages.

use image::DynamicImage;
use ndarray::{Array3, ArrayView3};

/// Model input resolution. Images are stretched to exactly this size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub height: u32,
    pub width: u32,
}

impl InputShape {
    pub fn square(side: u32) -> Self {
        Self {
            height: side,
            width: side,
        }
    }

    /// Tensor dimensions as (height, width, channels).
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, 3)
    }
}

/// A successfully decoded, non-empty image.
#[derive(Debug, Clone)]
pub struct RawImage {
    pixels: DynamicImage,
}

impl RawImage {
    /// Wrap a decoded image. Returns `None` for zero-sized images.
    pub fn new(pixels: DynamicImage) -> Option<Self> {
        if pixels.width() == 0 || pixels.height() == 0 {
            None
        } else {
            Some(Self { pixels })
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn channels(&self) -> u8 {
        self.pixels.color().channel_count()
    }

    /// Bytes per channel sample (1 for 8-bit, 2 for 16-bit, 4 for float).
    pub fn byte_depth(&self) -> u8 {
        self.pixels.color().bytes_per_pixel() / self.channels()
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }
}

/// Normalized HWC tensor, RGB, values in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct PreprocessedTensor {
    data: Array3<f32>,
}

impl PreprocessedTensor {
    pub(crate) fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// (height, width, channels)
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Flatten into channel-major (CHW) order, as NCHW networks expect.
    pub fn to_chw_vec(&self) -> Vec<f32> {
        let chw = self.data.view().permuted_axes([2, 0, 1]);
        chw.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbaImage};

    #[test]
    fn raw_image_reports_layout() {
        let raw = RawImage::new(DynamicImage::ImageRgba8(RgbaImage::new(4, 2))).unwrap();
        assert_eq!((raw.width(), raw.height()), (4, 2));
        assert_eq!(raw.channels(), 4);
        assert_eq!(raw.byte_depth(), 1);

        let wide: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::new(1, 1);
        let raw = RawImage::new(DynamicImage::ImageRgb16(wide)).unwrap();
        assert_eq!(raw.byte_depth(), 2);
    }

    #[test]
    fn zero_sized_image_is_rejected() {
        assert!(RawImage::new(DynamicImage::ImageRgba8(RgbaImage::new(0, 3))).is_none());
    }

    #[test]
    fn chw_flattening_groups_channels() {
        let mut data = Array3::<f32>::zeros((1, 2, 3));
        data[[0, 0, 0]] = 0.1;
        data[[0, 1, 0]] = 0.2;
        data[[0, 0, 2]] = 0.9;
        let tensor = PreprocessedTensor::from_array(data);
        assert_eq!(tensor.to_chw_vec(), vec![0.1, 0.2, 0.0, 0.0, 0.9, 0.0]);
    }
}
