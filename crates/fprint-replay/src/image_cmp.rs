//! PNG decoding into 32-bit surfaces and endian-independent comparison.
//!
//! Surfaces use the cairo image layout: four bytes per pixel holding a
//! native-endian `u32`, `0xXXRRGGBB` for [`PixelFormat::Rgb24`] (upper byte
//! set to `0xff`) and premultiplied `0xAARRGGBB` for [`PixelFormat::Argb32`].
//! Byte `+1` of each pixel is green on little-endian and red on big-endian
//! hosts; on greyscale captures both are identical, so comparing that byte
//! works everywhere.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use png::{ColorType, Transformations};
use serde::Serialize;
use tracing::debug;

use crate::error::{ImageError, ImageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    Rgb24,
    Argb32,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgb24 => write!(f, "RGB24"),
            PixelFormat::Argb32 => write!(f, "ARGB32"),
        }
    }
}

/// `c * a / 255`, rounded the way cairo premultiplies.
fn premultiply(color: u8, alpha: u8) -> u32 {
    let t = u32::from(color) * u32::from(alpha) + 0x80;
    ((t >> 8) + t) >> 8
}

/// A decoded image in cairo memory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    data: Vec<u8>,
}

impl Surface {
    /// Builds a surface from `0xAARRGGBB` pixel values in row-major order.
    /// `pixels` must hold exactly `width * height` values.
    pub fn from_pixels(format: PixelFormat, width: u32, height: u32, pixels: &[u32]) -> ImageResult<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(ImageError::PixelCount {
                width,
                height,
                actual: pixels.len(),
            });
        }
        let stride = width as usize * 4;
        let data = pixels.iter().flat_map(|p| p.to_ne_bytes()).collect();
        Ok(Self {
            format,
            width,
            height,
            stride,
            data,
        })
    }

    pub fn from_png(path: &Path) -> ImageResult<Self> {
        let file = File::open(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let decode_err = |source| ImageError::Decode {
            path: path.to_path_buf(),
            source,
        };

        let mut decoder = png::Decoder::new(BufReader::new(file));
        decoder.set_transformations(Transformations::EXPAND | Transformations::STRIP_16);
        let mut reader = decoder.read_info().map_err(decode_err)?;
        let mut buf = vec![0; reader.output_buffer_size()];
        let frame = reader.next_frame(&mut buf).map_err(decode_err)?;

        let (channels, format) = match frame.color_type {
            ColorType::Grayscale => (1, PixelFormat::Rgb24),
            ColorType::GrayscaleAlpha => (2, PixelFormat::Argb32),
            ColorType::Rgb => (3, PixelFormat::Rgb24),
            ColorType::Rgba => (4, PixelFormat::Argb32),
            ColorType::Indexed => {
                return Err(ImageError::Unsupported {
                    path: path.to_path_buf(),
                    reason: "palette was not expanded".to_string(),
                })
            }
        };

        let mut pixels = Vec::with_capacity(frame.width as usize * frame.height as usize);
        for row in buf.chunks(frame.line_size).take(frame.height as usize) {
            for px in row.chunks_exact(channels).take(frame.width as usize) {
                let (r, g, b, a) = match px {
                    [v] => (*v, *v, *v, 0xff),
                    [v, a] => (*v, *v, *v, *a),
                    [r, g, b] => (*r, *g, *b, 0xff),
                    [r, g, b, a] => (*r, *g, *b, *a),
                    _ => unreachable!("chunks_exact yields {channels} bytes"),
                };
                let pixel = match format {
                    PixelFormat::Rgb24 => {
                        0xff00_0000 | u32::from(r) << 16 | u32::from(g) << 8 | u32::from(b)
                    }
                    PixelFormat::Argb32 => {
                        u32::from(a) << 24
                            | premultiply(r, a) << 16
                            | premultiply(g, a) << 8
                            | premultiply(b, a)
                    }
                };
                pixels.push(pixel);
            }
        }

        debug!(
            path = %path.display(),
            width = frame.width,
            height = frame.height,
            %format,
            "decoded PNG"
        );
        Self::from_pixels(format, frame.width, frame.height, &pixels)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Compares byte `y * stride + x * 4 + 1` of every pixel. Format and
/// geometry must match first.
pub fn compare_surfaces(left: &Surface, right: &Surface) -> ImageResult<()> {
    if left.format != right.format {
        return Err(ImageError::FormatMismatch {
            left: left.format,
            right: right.format,
        });
    }
    if left.width != right.width || left.height != right.height || left.stride != right.stride {
        return Err(ImageError::DimensionMismatch {
            left_width: left.width,
            left_height: left.height,
            left_stride: left.stride,
            right_width: right.width,
            right_height: right.height,
            right_stride: right.stride,
        });
    }

    let stride = left.stride;
    for x in 0..left.width {
        for y in 0..left.height {
            let offset = y as usize * stride + x as usize * 4 + 1;
            let (a, b) = (left.data[offset], right.data[offset]);
            if a != b {
                return Err(ImageError::PixelMismatch {
                    x,
                    y,
                    left: a,
                    right: b,
                });
            }
        }
    }
    Ok(())
}

/// Decodes both PNGs and compares them.
pub fn compare_pngs(produced: &Path, reference: &Path) -> ImageResult<()> {
    debug!(produced = %produced.display(), reference = %reference.display(), "comparing PNGs");
    let left = Surface::from_png(produced)?;
    let right = Surface::from_png(reference)?;
    compare_surfaces(&left, &right)
}

/// Writes an 8-bit PNG. Used to produce fixtures and test images.
pub fn write_png(path: &Path, width: u32, height: u32, color: ColorType, data: &[u8]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), width, height);
    encoder.set_color(color);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(std::io::Error::other)?;
    writer.write_image_data(data).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grey(width: u32, height: u32, values: &[u8]) -> Surface {
        let pixels: Vec<u32> = values
            .iter()
            .map(|&v| 0xff00_0000 | u32::from(v) << 16 | u32::from(v) << 8 | u32::from(v))
            .collect();
        Surface::from_pixels(PixelFormat::Rgb24, width, height, &pixels).unwrap()
    }

    #[test]
    fn test_identical_surfaces_match() {
        let a = grey(2, 2, &[0, 64, 128, 255]);
        assert!(compare_surfaces(&a, &a.clone()).is_ok());
    }

    #[test]
    fn test_pixel_mismatch_reports_position() {
        let a = grey(3, 2, &[0, 0, 0, 0, 0, 0]);
        let b = grey(3, 2, &[0, 0, 0, 0, 0, 9]);
        let err = compare_surfaces(&a, &b).unwrap_err();
        assert!(matches!(
            err,
            ImageError::PixelMismatch {
                x: 2,
                y: 1,
                left: 0,
                right: 9
            }
        ));
    }

    #[test]
    fn test_geometry_checked_before_pixels() {
        let a = grey(2, 1, &[0, 0]);
        let b = grey(1, 2, &[0, 0]);
        assert!(matches!(
            compare_surfaces(&a, &b),
            Err(ImageError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_format_checked_first() {
        let a = grey(1, 1, &[0]);
        let b = Surface::from_pixels(PixelFormat::Argb32, 2, 2, &[0; 4]).unwrap();
        assert!(matches!(
            compare_surfaces(&a, &b),
            Err(ImageError::FormatMismatch {
                left: PixelFormat::Rgb24,
                right: PixelFormat::Argb32
            })
        ));
    }

    #[test]
    fn test_short_pixel_buffer_rejected() {
        let err = Surface::from_pixels(PixelFormat::Rgb24, 3, 2, &[0xff00_0000; 5]).unwrap_err();
        assert!(matches!(
            err,
            ImageError::PixelCount {
                width: 3,
                height: 2,
                actual: 5
            }
        ));
        assert!(Surface::from_pixels(PixelFormat::Rgb24, 3, 2, &[0xff00_0000; 7]).is_err());
    }

    #[test]
    fn test_premultiply_rounding() {
        assert_eq!(premultiply(255, 255), 255);
        assert_eq!(premultiply(255, 0), 0);
        assert_eq!(premultiply(200, 128), 100);
        assert_eq!(premultiply(1, 128), 1);
    }

    #[test]
    fn test_png_round_trip_through_decoder() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("grey.png");
        write_png(&path, 3, 2, ColorType::Grayscale, &[0, 50, 100, 150, 200, 250]).unwrap();

        let surface = Surface::from_png(&path).unwrap();
        assert_eq!(surface.format(), PixelFormat::Rgb24);
        assert_eq!((surface.width(), surface.height(), surface.stride()), (3, 2, 12));
        assert_eq!(surface, grey(3, 2, &[0, 50, 100, 150, 200, 250]));
    }

    #[test]
    fn test_rgba_png_is_argb32() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("rgba.png");
        write_png(&path, 1, 1, ColorType::Rgba, &[200, 100, 50, 128]).unwrap();
        let surface = Surface::from_png(&path).unwrap();
        assert_eq!(surface.format(), PixelFormat::Argb32);
        let pixel = u32::from_ne_bytes(surface.data()[0..4].try_into().unwrap());
        assert_eq!(pixel >> 24, 128);
        assert_eq!((pixel >> 16) & 0xff, premultiply(200, 128));
    }

    #[test]
    fn test_compare_pngs_mismatch_and_missing() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a.png");
        let b = temp.path().join("b.png");
        write_png(&a, 2, 1, ColorType::Grayscale, &[10, 20]).unwrap();
        write_png(&b, 2, 1, ColorType::Grayscale, &[10, 21]).unwrap();
        assert!(matches!(
            compare_pngs(&a, &b),
            Err(ImageError::PixelMismatch { x: 1, y: 0, .. })
        ));
        assert!(compare_pngs(&a, &a).is_ok());
        assert!(matches!(
            compare_pngs(&a, &temp.path().join("missing.png")),
            Err(ImageError::Io { .. })
        ));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bad.png");
        std::fs::write(&path, b"not a png").unwrap();
        assert!(matches!(
            Surface::from_png(&path),
            Err(ImageError::Decode { .. })
        ));
    }

    proptest! {
        #[test]
        fn test_only_compared_byte_matters(values in proptest::collection::vec(any::<u8>(), 1..32), noise in any::<u8>()) {
            let width = values.len() as u32;
            let a = grey(width, 1, &values);
            let mut b = a.clone();
            // Alpha byte differs on every pixel, compared byte untouched.
            for px in 0..values.len() {
                let idx = px * 4 + if cfg!(target_endian = "little") { 3 } else { 0 };
                b.data[idx] = noise;
            }
            prop_assert!(compare_surfaces(&a, &b).is_ok());
        }
    }
}
