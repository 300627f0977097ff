//! Super-resolution inference around an ONNX Runtime session.
//!
//! [`Enhancer::enhance`] takes an RGB image through NCHW conversion, mirror
//! padding, optional tiling, the network itself and back, then resamples to
//! the requested output scale when it differs from the network's own factor.

use std::sync::Mutex;

use anyhow::{anyhow, ensure, Context, Result};
use half::{f16, slice::HalfFloatSliceExt};
use image::RgbImage;
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::config::DEFAULT_MAX_OUTPUT_PIXELS;
use crate::imaging::{nchw_to_rgb, pad_nchw, resize_lanczos, rgb_to_nchw};
use crate::tier::MAX_OUTSCALE;

/// Runs one NCHW `[1,3,H,W]` tile through the network.
pub trait TensorRunner: Send + Sync {
    fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>>;
}

pub struct OrtRunner {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OrtRunner {
    pub fn new(session: Session) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let input_name = input.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?
            .name()
            .to_string();

        debug!(input = %input_name, output = %output_name, is_fp16, "Inference session ready");
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
        })
    }
}

impl TensorRunner for OrtRunner {
    fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("inference session lock poisoned"))?;

        let output = if self.is_fp16 {
            run_fp16_inference(&mut session, input, &self.input_name, &self.output_name)?
        } else {
            let input_tensor = Tensor::from_array(input.clone())?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned()
        };

        Ok(output.into_dimensionality::<Ix4>()?)
    }
}

fn run_fp16_inference(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned = output_view.as_standard_layout();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
}

#[derive(Debug, Clone, Copy)]
pub struct EnhancerOptions {
    /// Upper bound of the model's value range (255 or 1).
    pub value_max: f32,
    /// Tile edge in input pixels, 0 for a single pass.
    pub tile_size: usize,
    /// Context pixels added on each side of a tile.
    pub tile_pad: usize,
    /// Ceiling on output pixels, checked before any allocation.
    pub max_output_pixels: u64,
}

impl Default for EnhancerOptions {
    fn default() -> Self {
        Self {
            value_max: 255.0,
            tile_size: 0,
            tile_pad: 10,
            max_output_pixels: DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

pub struct Enhancer {
    runner: Box<dyn TensorRunner>,
    options: EnhancerOptions,
}

impl std::fmt::Debug for Enhancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enhancer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Enhancer {
    pub fn new(runner: Box<dyn TensorRunner>, options: EnhancerOptions) -> Self {
        Self { runner, options }
    }

    /// Upscale `img` to `outscale` times its size.
    pub fn enhance(&self, img: &RgbImage, outscale: u32) -> Result<RgbImage> {
        ensure!(
            (1..=MAX_OUTSCALE).contains(&outscale),
            "outscale must be between 1 and {MAX_OUTSCALE}, got {outscale}"
        );
        let (w, h) = img.dimensions();
        ensure!(w > 0 && h > 0, "cannot enhance an empty image");
        self.check_output_size(w as u64 * outscale as u64, h as u64 * outscale as u64)?;

        let input = rgb_to_nchw(img, self.options.value_max);
        let (output, native_scale) = if self.options.tile_size == 0 {
            self.run_whole(&input)?
        } else {
            self.run_tiled(&input)?
        };
        let upscaled = nchw_to_rgb(output.view(), self.options.value_max)?;

        let target = (w * outscale, h * outscale);
        debug!(
            width = w,
            height = h,
            native_scale,
            outscale,
            "Network pass complete"
        );
        if upscaled.dimensions() == target {
            Ok(upscaled)
        } else {
            Ok(resize_lanczos(&upscaled, target.0, target.1))
        }
    }

    fn check_output_size(&self, width: u64, height: u64) -> Result<()> {
        let max = self.options.max_output_pixels;
        ensure!(
            width.saturating_mul(height) <= max,
            "output of {width}x{height} exceeds the {max} pixel limit"
        );
        Ok(())
    }

    fn run_whole(&self, input: &Array4<f32>) -> Result<(Array4<f32>, usize)> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let padded = pad_nchw(input.view());
        let output = self.runner.run(&padded)?;
        let scale = measure_scale(&padded, &output)?;

        let cropped = output.slice(s![.., .., ..h * scale, ..w * scale]).to_owned();
        Ok((cropped, scale))
    }

    fn run_tiled(&self, input: &Array4<f32>) -> Result<(Array4<f32>, usize)> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let tile = self.options.tile_size;
        let pad = self.options.tile_pad;
        let (tiles_y, tiles_x) = (h.div_ceil(tile), w.div_ceil(tile));

        debug!(tile, pad, tiles_y, tiles_x, "Starting tiled inference");

        let mut canvas: Option<(Array4<f32>, usize)> = None;
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let (y0, x0) = (ty * tile, tx * tile);
                let (y1, x1) = ((y0 + tile).min(h), (x0 + tile).min(w));
                let (in_y0, in_x0) = (y0.saturating_sub(pad), x0.saturating_sub(pad));
                let (in_y1, in_x1) = ((y1 + pad).min(h), (x1 + pad).min(w));

                let padded = pad_nchw(input.slice(s![.., .., in_y0..in_y1, in_x0..in_x1]));
                let tile_out = self.runner.run(&padded)?;
                let scale = measure_scale(&padded, &tile_out)?;
                if canvas.is_none() {
                    self.check_output_size((w * scale) as u64, (h * scale) as u64)?;
                }

                let (output, native) = canvas
                    .get_or_insert_with(|| (Array4::zeros((1, 3, h * scale, w * scale)), scale));
                ensure!(
                    *native == scale,
                    "tile ({ty}, {tx}) upscaled by {scale}, earlier tiles by {native}"
                );

                let crop_y0 = (y0 - in_y0) * scale;
                let crop_x0 = (x0 - in_x0) * scale;
                output
                    .slice_mut(s![.., .., y0 * scale..y1 * scale, x0 * scale..x1 * scale])
                    .assign(&tile_out.slice(s![
                        ..,
                        ..,
                        crop_y0..crop_y0 + (y1 - y0) * scale,
                        crop_x0..crop_x0 + (x1 - x0) * scale
                    ]));
            }
        }

        canvas.context("image produced no tiles")
    }
}

/// Integer factor between network input and output, identical on both axes.
fn measure_scale(input: &Array4<f32>, output: &Array4<f32>) -> Result<usize> {
    let (in_h, in_w) = (input.shape()[2], input.shape()[3]);
    let out_shape = output.shape();
    ensure!(
        out_shape[0] == 1 && out_shape[1] == 3,
        "model produced unexpected tensor shape {out_shape:?}"
    );
    let (out_h, out_w) = (out_shape[2], out_shape[3]);
    ensure!(
        out_h >= in_h && out_h % in_h == 0 && out_w % in_w == 0 && out_h / in_h == out_w / in_w,
        "model output {out_h}x{out_w} is not an integer upscale of input {in_h}x{in_w}"
    );
    Ok(out_h / in_h)
}
