//! The upscale request lifecycle shared by the HTTP handler and the CLI:
//! validate against the tier, decode and cap the input, enhance and encode.

use anyhow::{Context, Result};
use image::RgbImage;
use tracing::{debug, info};

use crate::config::TierLimits;
use crate::enhancer::Enhancer;
use crate::imaging::{decode_rgb, encode_png, resize_lanczos};
use crate::model_registry::ModelRegistry;
use crate::tier::{capped_dimensions, Feature, QualityTier, MAX_OUTSCALE};

pub const DEFAULT_SCALE: u32 = 4;

/// Why a request was refused before any work was done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Malformed or out-of-range parameters.
    Invalid(String),
    /// Valid, but not available on the caller's tier.
    Forbidden(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(msg) | Self::Forbidden(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscalePlan {
    /// Canonical catalog name.
    pub model: String,
    pub scale: u32,
    pub tier: QualityTier,
}

/// Check scale, model and tier access. `model` falls back to `default_model`;
/// picking any other model is a tier feature of its own.
pub fn plan(
    registry: &ModelRegistry,
    default_model: &str,
    scale: u32,
    tier: QualityTier,
    model: Option<&str>,
) -> Result<UpscalePlan, Rejection> {
    if !(1..=MAX_OUTSCALE).contains(&scale) {
        return Err(Rejection::Invalid(format!(
            "scale must be between 1 and {MAX_OUTSCALE}, got {scale}"
        )));
    }

    let requested = model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(default_model);
    let entry = registry
        .resolve(requested)
        .ok_or_else(|| Rejection::Invalid(format!("Unknown model: {requested}")))?;

    let feature = Feature::for_scale(scale);
    if !tier.has_feature(feature) {
        return Err(Rejection::Forbidden(format!(
            "{feature} is not available on the {tier} tier (max scale {}x)",
            tier.max_scale()
        )));
    }
    if entry.anime && !tier.has_feature(Feature::AnimeMode) {
        return Err(Rejection::Forbidden(format!(
            "{} is not available on the {tier} tier",
            Feature::AnimeMode
        )));
    }
    let is_default = registry
        .resolve(default_model)
        .is_some_and(|default| default.name == entry.name);
    if !is_default && !tier.has_feature(Feature::ModelSelect) {
        return Err(Rejection::Forbidden(format!(
            "{} is not available on the {tier} tier",
            Feature::ModelSelect
        )));
    }

    Ok(UpscalePlan {
        model: entry.name.clone(),
        scale,
        tier,
    })
}

/// Decode upload bytes and shrink to the tier's input cap if needed.
pub fn decode_for_tier(bytes: &[u8], tier: QualityTier, limits: &TierLimits) -> Result<RgbImage> {
    let img = decode_rgb(bytes, limits.max_decode_pixels).context("Failed to read image")?;
    let (w, h) = img.dimensions();
    debug!(width = w, height = h, %tier, "Decoded input image");

    let Some(max_pixels) = tier.input_pixel_cap(limits) else {
        return Ok(img);
    };
    match capped_dimensions(w, h, max_pixels) {
        Some((new_w, new_h)) => {
            info!(
                %tier,
                from = %format!("{w}x{h}"),
                to = %format!("{new_w}x{new_h}"),
                max_pixels,
                "Input above tier limit, downscaling"
            );
            Ok(resize_lanczos(&img, new_w, new_h))
        }
        None => Ok(img),
    }
}

pub fn enhance_to_png(enhancer: &Enhancer, img: &RgbImage, scale: u32) -> Result<Vec<u8>> {
    let upscaled = enhancer.enhance(img, scale).context("Upscaling failed")?;
    encode_png(&upscaled)
}
