use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "PIXELSCALE_DATA_DIR";

/// 2000 x 2000 input ceiling for the free tier.
pub const DEFAULT_FREE_MAX_INPUT_PIXELS: u64 = 2000 * 2000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
/// Largest image any tier may upload, roughly 13400 x 13400.
pub const DEFAULT_MAX_DECODE_PIXELS: u64 = 178_956_970;
/// Largest canvas the enhancer will allocate, 16384 x 16384.
pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = 16384 * 16384;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub tiers: TierLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    /// `cuda`, `tensorrt` or `cpu`.
    pub backend: String,
    pub default_model: String,
    /// 0 runs the whole image in one pass.
    pub tile_size: u32,
    /// Overlap in input pixels on each side of a tile.
    pub tile_pad: u32,
    pub preload: bool,
    pub max_concurrent_jobs: usize,
    pub max_output_pixels: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierLimits {
    pub free_max_input_pixels: u64,
    /// Uploads above this are refused before decoding, on every tier.
    pub max_decode_pixels: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("weights"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            host: "0.0.0.0".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default().to_string(),
            default_model: crate::model_registry::DEFAULT_MODEL_NAME.to_string(),
            tile_size: 0,
            tile_pad: 10,
            preload: true,
            max_concurrent_jobs: 1,
            max_output_pixels: DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free_max_input_pixels: DEFAULT_FREE_MAX_INPUT_PIXELS,
            max_decode_pixels: DEFAULT_MAX_DECODE_PIXELS,
        }
    }
}

impl InferenceConfig {
    pub fn backend(&self) -> InferenceBackend {
        InferenceBackend::from_str_lossy(&self.backend)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Make relative model and cache paths absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.paths.models_dir = resolve_relative_to(base, &self.paths.models_dir);
        self.paths.trt_cache_dir = resolve_relative_to(base, &self.paths.trt_cache_dir);
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. PIXELSCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
/// An existing config file is never overwritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("weights"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.server.port, 8001);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.inference.backend, "cuda");
        assert_eq!(cfg.inference.default_model, "RealESRGAN_x4plus");
        assert_eq!(cfg.inference.tile_size, 0);
        assert_eq!(cfg.inference.tile_pad, 10);
        assert!(cfg.inference.preload);
        assert_eq!(cfg.inference.max_concurrent_jobs, 1);
        assert_eq!(cfg.inference.max_output_pixels, 268_435_456);
        assert_eq!(cfg.tiers.free_max_input_pixels, 4_000_000);
        assert_eq!(cfg.tiers.max_decode_pixels, 178_956_970);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.inference.tile_size = 256;
        original.tiers.free_max_input_pixels = 1_000_000;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let decoded: AppConfig =
            toml::from_str("[inference]\nbackend = \"cpu\"\n").expect("deserialize config");
        assert_eq!(decoded.inference.backend(), InferenceBackend::Cpu);
        assert_eq!(decoded.inference.tile_pad, 10);
        assert_eq!(decoded.server, ServerConfig::default());

        let tiers: AppConfig = toml::from_str("[tiers]\nmax_decode_pixels = 1000\n")
            .expect("deserialize config");
        assert_eq!(tiers.tiers.max_decode_pixels, 1000);
        assert_eq!(tiers.tiers.free_max_input_pixels, DEFAULT_FREE_MAX_INPUT_PIXELS);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_blank_file_returns_defaults() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "  \n").expect("write blank config");
        let loaded = AppConfig::load_from_path(&path).expect("load blank config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[server\nport = ").expect("write broken config");
        let err = AppConfig::load_from_path(&path).expect_err("should fail");
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.exists());
        assert!(dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_paths_only_touches_relative_entries() {
        let mut cfg = AppConfig::default();
        cfg.paths.trt_cache_dir = PathBuf::from("/abs/cache");
        cfg.resolve_paths(Path::new("/base"));
        assert_eq!(cfg.paths.models_dir, PathBuf::from("/base/weights"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("/abs/cache"));
    }
}
