//! Image decode/encode plumbing and RGB <-> NCHW tensor conversion.

use std::io::Cursor;

use anyhow::{bail, ensure, Context, Result};
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader, Limits, RgbImage};
use ndarray::{s, Array4, ArrayView4};

/// Model requires spatial dimensions to be multiples of this.
pub const PAD_ALIGN: usize = 4;

/// Worst-case decoder output: four channels of 32-bit float.
const MAX_BYTES_PER_PIXEL: u64 = 16;

/// Decode an uploaded image into 8-bit RGB, dropping alpha and expanding gray.
///
/// Images above `max_pixels` are refused from the header alone. Anything at
/// or below it is decoded, even past the `image` crate's default allocation
/// limit.
pub fn decode_rgb(bytes: &[u8], max_pixels: u64) -> Result<RgbImage> {
    if bytes.is_empty() {
        bail!("uploaded file is empty");
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to read image header")?;
    let format = reader.format().context("unrecognized image format")?;
    let (w, h) = reader
        .into_dimensions()
        .with_context(|| format!("failed to read {format:?} dimensions"))?;
    let pixels = w as u64 * h as u64;
    ensure!(
        pixels <= max_pixels,
        "{w}x{h} image is above the {max_pixels} pixel decode limit"
    );

    let mut limits = Limits::default();
    let needed = pixels.saturating_mul(MAX_BYTES_PER_PIXEL);
    limits.max_alloc = limits.max_alloc.map(|default| default.max(needed));

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(limits);
    let decoded = reader
        .decode()
        .with_context(|| format!("failed to decode {format:?} image"))?;
    Ok(decoded.into_rgb8())
}

pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(buf.into_inner())
}

pub fn resize_lanczos(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    image::imageops::resize(img, width, height, FilterType::Lanczos3)
}

/// Interleaved RGB8 -> NCHW `[1,3,H,W]` scaled to `0..=value_max`.
pub fn rgb_to_nchw(img: &RgbImage, value_max: f32) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let scale = value_max / 255.0;
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            nchw[[0, c, y, x]] = pixel.0[c] as f32 * scale;
        }
    }
    nchw
}

/// NCHW `[1,3,H,W]` in `0..=value_max` -> RGB8, rounding and clamping.
pub fn nchw_to_rgb(arr: ArrayView4<'_, f32>, value_max: f32) -> Result<RgbImage> {
    let shape = arr.shape();
    ensure!(
        shape[0] == 1 && shape[1] == 3,
        "expected [1,3,H,W] tensor, got {shape:?}"
    );
    let (h, w) = (shape[2], shape[3]);
    let scale = 255.0 / value_max;

    let mut img = RgbImage::new(w as u32, h as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let (xi, yi) = (x as usize, y as usize);
        for c in 0..3 {
            pixel.0[c] = (arr[[0, c, yi, xi]] * scale).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(img)
}

pub fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Mirror index into `0..len` for positions past the end (edge included).
fn mirror(i: usize, len: usize) -> usize {
    if i < len {
        return i;
    }
    let period = 2 * len;
    let k = i % period;
    if k < len {
        k
    } else {
        period - 1 - k
    }
}

/// Mirror-pad bottom and right edges so H and W are multiples of [`PAD_ALIGN`].
pub fn pad_nchw(arr: ArrayView4<'_, f32>) -> Array4<f32> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    let (pad_h, pad_w) = (pad_amount(h), pad_amount(w));

    if pad_h == 0 && pad_w == 0 {
        return arr.to_owned();
    }

    let (new_h, new_w) = (h + pad_h, w + pad_w);
    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));
    padded.slice_mut(s![.., .., ..h, ..w]).assign(&arr);

    for c in 0..3 {
        for y in 0..new_h {
            let src_y = mirror(y, h);
            let x_start = if y < h { w } else { 0 };
            for x in x_start..new_w {
                padded[[0, c, y, x]] = arr[[0, c, src_y, mirror(x, w)]];
            }
        }
    }

    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_DECODE_PIXELS;
    use image::{DynamicImage, GrayImage, Luma, Rgb, Rgba, RgbaImage};

    fn decode(bytes: &[u8]) -> Result<RgbImage> {
        decode_rgb(bytes, DEFAULT_MAX_DECODE_PIXELS)
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 20) as u8, (y * 30) as u8, 7]))
    }

    #[test]
    fn decode_png_roundtrip_preserves_pixels() {
        let img = gradient(5, 3);
        let png = encode_png(&img).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = decode(&png).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn decode_drops_alpha() {
        let rgba = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 0]));
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(rgba)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        let decoded = decode(png.get_ref()).unwrap();
        assert_eq!(decoded.get_pixel(1, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn decode_expands_grayscale() {
        let gray = GrayImage::from_pixel(3, 1, Luma([99]));
        let mut buf = Cursor::new(Vec::new());
        gray.write_to(&mut buf, ImageFormat::Png).unwrap();
        let decoded = decode(buf.get_ref()).unwrap();
        assert_eq!(decoded.get_pixel(2, 0), &Rgb([99, 99, 99]));
    }

    #[test]
    fn decode_rejects_empty_and_garbage() {
        let err = decode(&[]).unwrap_err();
        assert!(err.to_string().contains("empty"));
        let err = decode(b"definitely not an image").unwrap_err();
        assert!(err.to_string().contains("unrecognized image format"), "{err}");
    }

    #[test]
    fn decode_refuses_images_above_pixel_limit() {
        let png = encode_png(&gradient(20, 10)).unwrap();
        let err = decode_rgb(&png, 199).unwrap_err();
        assert!(err.to_string().contains("20x10 image is above the 199 pixel decode limit"), "{err}");
        assert_eq!(decode_rgb(&png, 200).unwrap().dimensions(), (20, 10));
    }

    #[test]
    fn resize_lanczos_hits_requested_dimensions() {
        let out = resize_lanczos(&gradient(8, 6), 3, 2);
        assert_eq!(out.dimensions(), (3, 2));
    }

    #[test]
    fn rgb_to_nchw_uses_planar_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 51]));

        let arr = rgb_to_nchw(&img, 255.0);
        assert_eq!(arr.shape(), &[1, 3, 1, 2]);
        assert_eq!(arr[[0, 0, 0, 0]], 255.0);
        assert_eq!(arr[[0, 1, 0, 1]], 255.0);
        assert_eq!(arr[[0, 2, 0, 1]], 51.0);

        let unit = rgb_to_nchw(&img, 1.0);
        assert!((unit[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn nchw_to_rgb_clamps_and_rounds() {
        let mut arr = Array4::<f32>::zeros((1, 3, 1, 1));
        arr[[0, 0, 0, 0]] = 300.0;
        arr[[0, 1, 0, 0]] = -10.0;
        arr[[0, 2, 0, 0]] = 128.6;

        let img = nchw_to_rgb(arr.view(), 255.0).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 0, 129]));
    }

    #[test]
    fn nchw_to_rgb_rejects_wrong_channel_count() {
        let arr = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(nchw_to_rgb(arr.view(), 255.0).is_err());
    }

    #[test]
    fn tensor_conversion_restores_original_pixels() {
        let img = gradient(4, 4);
        let restored = nchw_to_rgb(rgb_to_nchw(&img, 1.0).view(), 1.0).unwrap();
        assert_eq!(restored, img);
    }

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(4), 0);
        assert_eq!(pad_amount(5), 3);
        assert_eq!(pad_amount(6), 2);
        assert_eq!(pad_amount(7), 1);
        assert_eq!(pad_amount(1080), 0);
    }

    #[test]
    fn pad_nchw_no_padding_needed() {
        let arr = Array4::<f32>::ones((1, 3, 8, 8));
        assert_eq!(pad_nchw(arr.view()).shape(), &[1, 3, 8, 8]);
    }

    #[test]
    fn pad_nchw_mirrors_edges() {
        let mut arr = Array4::<f32>::zeros((1, 3, 5, 6));
        for y in 0..5 {
            for x in 0..6 {
                arr[[0, 0, y, x]] = (y * 10 + x) as f32;
            }
        }
        let padded = pad_nchw(arr.view());
        assert_eq!(padded.shape(), &[1, 3, 8, 8]);
        assert_eq!(padded[[0, 0, 4, 5]], 45.0);
        assert_eq!(padded[[0, 0, 5, 0]], padded[[0, 0, 4, 0]]);
        assert_eq!(padded[[0, 0, 6, 0]], padded[[0, 0, 3, 0]]);
        assert_eq!(padded[[0, 0, 7, 0]], padded[[0, 0, 2, 0]]);
        assert_eq!(padded[[0, 0, 0, 6]], padded[[0, 0, 0, 5]]);
        assert_eq!(padded[[0, 0, 0, 7]], padded[[0, 0, 0, 4]]);
        assert_eq!(padded[[0, 0, 7, 7]], arr[[0, 0, 2, 4]]);
    }

    #[test]
    fn pad_nchw_handles_single_pixel() {
        let arr = Array4::<f32>::from_elem((1, 3, 1, 1), 3.0);
        let padded = pad_nchw(arr.view());
        assert_eq!(padded.shape(), &[1, 3, 4, 4]);
        assert!(padded.iter().all(|v| *v == 3.0));
    }
}
