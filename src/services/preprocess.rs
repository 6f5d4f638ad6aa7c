//! Image decoding and model-input preprocessing.
//!
//! Both functions are synchronous and CPU-bound; the pipeline runs them on the
//! blocking pool.

use crate::models::pixels::{InputShape, PreprocessedTensor, RawImage};
use image::{ImageError, ImageFormat, ImageReader, RgbImage};
use ndarray::Array3;
use std::{
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{path}` is empty")]
    EmptyFile { path: PathBuf },
    #[error("cannot decode `{path}`: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("`{path}` is truncated")]
    Truncated { path: PathBuf },
    #[error("`{path}` decoded to a zero-sized image")]
    ZeroSized { path: PathBuf },
    #[error("preprocessing worker failed: {0}")]
    Worker(String),
}

/// Decode the file at `path`. The format is sniffed from content, not extension.
pub fn decode(path: &Path) -> Result<RawImage, DecodeError> {
    let bytes = fs::read(path).map_err(|source| DecodeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(DecodeError::EmptyFile {
            path: path.to_path_buf(),
        });
    }

    let image_err = |source| DecodeError::Image {
        path: path.to_path_buf(),
        source,
    };
    let reader = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|err| image_err(ImageError::IoError(err)))?;
    // the JPEG decoder pads missing scan data instead of failing
    if reader.format() == Some(ImageFormat::Jpeg) && !ends_with_eoi(&bytes) {
        return Err(DecodeError::Truncated {
            path: path.to_path_buf(),
        });
    }
    let pixels = reader.decode().map_err(image_err)?;

    RawImage::new(pixels).ok_or_else(|| DecodeError::ZeroSized {
        path: path.to_path_buf(),
    })
}

/// Whether a JPEG stream ends with the EOI marker, ignoring trailing zero or
/// whitespace padding some writers append.
fn ends_with_eoi(bytes: &[u8]) -> bool {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    bytes[..end].ends_with(&[0xFF, 0xD9])
}

/// Stretch `raw` to `shape` with area averaging and scale intensities to `[0, 1]`.
///
/// Output samples are rounded to 8-bit before scaling, so the result matches an
/// 8-bit area resize followed by `/ 255`.
pub fn preprocess(raw: &RawImage, shape: InputShape) -> PreprocessedTensor {
    let rgb = raw.pixels().to_rgb8();
    let resized = area_resize(&rgb, shape);
    PreprocessedTensor::from_array(resized.mapv(|v| v / 255.0))
}

/// Source pixels contributing to one destination pixel along an axis, with
/// their normalized coverage weights.
fn axis_taps(src: u32, dst: u32) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let mut taps = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src as usize {
                let covered = end.min((s + 1) as f64) - start.max(s as f64);
                if covered > 1e-9 {
                    taps.push((s, (covered / scale) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Separable area-averaging resize into an HWC array of 8-bit values stored as f32.
fn area_resize(src: &RgbImage, shape: InputShape) -> Array3<f32> {
    let (src_w, src_h) = src.dimensions();
    let x_taps = axis_taps(src_w, shape.width);
    let y_taps = axis_taps(src_h, shape.height);
    let dst_w = shape.width as usize;

    // horizontal pass: src_h x dst_w x 3
    let mut rows = vec![0f32; src_h as usize * dst_w * 3];
    for y in 0..src_h {
        for (dx, taps) in x_taps.iter().enumerate() {
            let mut acc = [0f32; 3];
            for &(sx, weight) in taps {
                let px = src.get_pixel(sx as u32, y).0;
                for c in 0..3 {
                    acc[c] += px[c] as f32 * weight;
                }
            }
            let base = (y as usize * dst_w + dx) * 3;
            rows[base..base + 3].copy_from_slice(&acc);
        }
    }

    let mut out = Array3::<f32>::zeros(shape.dims());
    for (dy, taps) in y_taps.iter().enumerate() {
        for dx in 0..dst_w {
            for c in 0..3 {
                let value: f32 = taps
                    .iter()
                    .map(|&(sy, weight)| rows[(sy * dst_w + dx) * 3 + c] * weight)
                    .sum();
                out[[dy, dx, c]] = value.round().clamp(0.0, 255.0);
            }
        }
    }
    out
}
