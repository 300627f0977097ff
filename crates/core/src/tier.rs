//! Caller tiers and the limits they carry: input resolution cap, maximum
//! output scale and model access.

use serde::{Deserialize, Serialize};

use crate::config::TierLimits;

/// Largest output scale any tier may request.
pub const MAX_OUTSCALE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Free,
    Starter,
    Pro,
    Business,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    BasicUpscale,
    Upscale8x,
    AnimeMode,
    /// Any model other than the configured default.
    ModelSelect,
    Upscale16x,
}

impl Feature {
    fn required_level(self) -> u8 {
        match self {
            Self::BasicUpscale => 0,
            Self::Upscale8x => 1,
            Self::AnimeMode | Self::ModelSelect => 2,
            Self::Upscale16x => 3,
        }
    }

    /// Feature gate guarding an output scale.
    pub fn for_scale(scale: u32) -> Self {
        if scale > 8 {
            Self::Upscale16x
        } else if scale > 4 {
            Self::Upscale8x
        } else {
            Self::BasicUpscale
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BasicUpscale => write!(f, "basic upscale"),
            Self::Upscale8x => write!(f, "8x upscale"),
            Self::AnimeMode => write!(f, "anime mode"),
            Self::ModelSelect => write!(f, "model selection"),
            Self::Upscale16x => write!(f, "16x upscale"),
        }
    }
}

impl QualityTier {
    /// Parse from a form value (case-insensitive). Unknown values are `Free`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "starter" => Self::Starter,
            "pro" => Self::Pro,
            "business" => Self::Business,
            _ => Self::Free,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Starter => 1,
            Self::Pro => 2,
            Self::Business => 3,
        }
    }

    pub fn max_scale(self) -> u32 {
        match self {
            Self::Free => 4,
            Self::Starter | Self::Pro => 8,
            Self::Business => MAX_OUTSCALE,
        }
    }

    pub fn has_feature(self, feature: Feature) -> bool {
        self.level() >= feature.required_level()
    }

    /// Input pixel ceiling for this tier, `None` when uncapped.
    pub fn input_pixel_cap(self, limits: &TierLimits) -> Option<u64> {
        match self {
            Self::Free => Some(limits.free_max_input_pixels),
            _ => None,
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Starter => write!(f, "starter"),
            Self::Pro => write!(f, "pro"),
            Self::Business => write!(f, "business"),
        }
    }
}

/// Dimensions that fit `width x height` under `max_pixels` while keeping the
/// aspect ratio. Returns `None` when the image is already within the cap.
pub fn capped_dimensions(width: u32, height: u32, max_pixels: u64) -> Option<(u32, u32)> {
    let pixels = width as u64 * height as u64;
    if pixels <= max_pixels {
        return None;
    }

    let ratio = (max_pixels as f64 / pixels as f64).sqrt();
    let new_w = ((width as f64 * ratio).floor() as u32).max(1);
    let new_h = ((height as f64 * ratio).floor() as u32).max(1);
    Some((new_w, new_h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tiers_case_insensitively() {
        assert_eq!(QualityTier::from_str_lossy("free"), QualityTier::Free);
        assert_eq!(QualityTier::from_str_lossy("Starter"), QualityTier::Starter);
        assert_eq!(QualityTier::from_str_lossy(" PRO "), QualityTier::Pro);
        assert_eq!(QualityTier::from_str_lossy("business"), QualityTier::Business);
    }

    #[test]
    fn unknown_tier_is_free() {
        assert_eq!(QualityTier::from_str_lossy(""), QualityTier::Free);
        assert_eq!(QualityTier::from_str_lossy("enterprise"), QualityTier::Free);
    }

    #[test]
    fn only_free_tier_is_capped() {
        let limits = TierLimits::default();
        assert_eq!(QualityTier::Free.input_pixel_cap(&limits), Some(4_000_000));
        assert_eq!(QualityTier::Starter.input_pixel_cap(&limits), None);
        assert_eq!(QualityTier::Pro.input_pixel_cap(&limits), None);
        assert_eq!(QualityTier::Business.input_pixel_cap(&limits), None);
    }

    #[test]
    fn max_scale_table() {
        assert_eq!(QualityTier::Free.max_scale(), 4);
        assert_eq!(QualityTier::Starter.max_scale(), 8);
        assert_eq!(QualityTier::Pro.max_scale(), 8);
        assert_eq!(QualityTier::Business.max_scale(), 16);
    }

    #[test]
    fn feature_access_follows_levels() {
        assert!(QualityTier::Free.has_feature(Feature::BasicUpscale));
        assert!(!QualityTier::Free.has_feature(Feature::Upscale8x));
        assert!(QualityTier::Starter.has_feature(Feature::Upscale8x));
        assert!(!QualityTier::Starter.has_feature(Feature::AnimeMode));
        assert!(QualityTier::Pro.has_feature(Feature::AnimeMode));
        assert!(!QualityTier::Starter.has_feature(Feature::ModelSelect));
        assert!(QualityTier::Pro.has_feature(Feature::ModelSelect));
        assert!(!QualityTier::Pro.has_feature(Feature::Upscale16x));
        assert!(QualityTier::Business.has_feature(Feature::Upscale16x));
    }

    #[test]
    fn scale_features_agree_with_max_scale() {
        for tier in [
            QualityTier::Free,
            QualityTier::Starter,
            QualityTier::Pro,
            QualityTier::Business,
        ] {
            for scale in 1..=MAX_OUTSCALE {
                assert_eq!(
                    tier.has_feature(Feature::for_scale(scale)),
                    scale <= tier.max_scale(),
                    "tier {tier} scale {scale}"
                );
            }
        }
    }

    #[test]
    fn capped_dimensions_leaves_small_images_alone() {
        assert_eq!(capped_dimensions(2000, 2000, 4_000_000), None);
        assert_eq!(capped_dimensions(640, 480, 4_000_000), None);
    }

    #[test]
    fn capped_dimensions_scales_to_cap_and_keeps_aspect() {
        let (w, h) = capped_dimensions(4000, 3000, 4_000_000).expect("should downscale");
        assert!(w as u64 * h as u64 <= 4_000_000);
        assert_eq!((w, h), (2309, 1732));
        let aspect = w as f64 / h as f64;
        assert!((aspect - 4.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn capped_dimensions_never_returns_zero() {
        let (w, h) = capped_dimensions(100_000, 1, 1_000).expect("should downscale");
        assert!(w >= 1);
        assert_eq!(h, 1);
    }
}
