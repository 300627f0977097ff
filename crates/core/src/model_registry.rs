use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_MODEL_NAME: &str = "RealESRGAN_x4plus";
pub const ANIME_MODEL_NAME: &str = "RealESRGAN_x4plus_anime_6B";
pub const CATALOG_FILE_NAME: &str = "models.json";

/// Short names accepted from clients in place of catalog names.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("real-esrgan", DEFAULT_MODEL_NAME),
    ("anime-4x", ANIME_MODEL_NAME),
];

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const DOWNLOAD_RETRY_BACKOFF_MS: u64 = 250;

fn default_normalization_range() -> (f32, f32) {
    (0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Advertised upscale factor. The enhancer measures the real one from the output.
    #[serde(default)]
    pub scale: Option<u32>,
    /// Value range the model expects/produces: `(0.0, 255.0)` or `(0.0, 1.0)`.
    #[serde(default = "default_normalization_range")]
    pub normalization_range: (f32, f32),
    #[serde(default)]
    pub is_fp16: bool,
    /// Tuned for anime / illustration; gated behind the anime feature.
    #[serde(default)]
    pub anime: bool,
    #[serde(default)]
    pub description: String,
}

impl ModelEntry {
    pub fn value_max(&self) -> f32 {
        self.normalization_range.1
    }
}

fn huggingface_realesrgan_url(name: &str) -> String {
    format!("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/{name}.onnx")
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: DEFAULT_MODEL_NAME.into(),
            filename: format!("{DEFAULT_MODEL_NAME}.onnx"),
            url: Some(huggingface_realesrgan_url(DEFAULT_MODEL_NAME)),
            sha256: None,
            scale: Some(4),
            normalization_range: (0.0, 255.0),
            is_fp16: false,
            anime: false,
            description: "RealESRGAN x4plus general-purpose photo model (RRDB, 23 blocks)".into(),
        },
        ModelEntry {
            name: ANIME_MODEL_NAME.into(),
            filename: format!("{ANIME_MODEL_NAME}.onnx"),
            url: Some(huggingface_realesrgan_url(ANIME_MODEL_NAME)),
            sha256: None,
            scale: Some(4),
            normalization_range: (0.0, 255.0),
            is_fp16: false,
            anime: true,
            description: "RealESRGAN x4 anime-optimized model (6-block variant, 17.9 MB)".into(),
        },
    ]
}

/// Map a client alias to its catalog name; other names pass through.
pub fn canonical_name(name_or_alias: &str) -> &str {
    let trimmed = name_or_alias.trim();
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        .map(|(_, name)| *name)
        .unwrap_or(trimmed)
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(());
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();

            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);

            if !is_onnx {
                continue;
            }

            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();

            info!(filename = %filename, "Discovered unknown ONNX model");

            let lower = filename.to_lowercase();
            self.entries.push(ModelEntry {
                name,
                is_fp16: lower.contains("fp16"),
                anime: lower.contains("anime"),
                filename,
                url: None,
                sha256: None,
                scale: None,
                normalization_range: default_normalization_range(),
                description: "Discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Look up by catalog name or client alias.
    pub fn resolve(&self, name_or_alias: &str) -> Option<&ModelEntry> {
        self.get(canonical_name(name_or_alias))
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.model_path(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.resolve(name).map(|e| self.models_dir.join(&e.filename))
    }

    /// Local path of the model weights, downloading them first when missing.
    pub fn ensure_downloaded(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .resolve(name)
            .with_context(|| format!("Unknown model: {name}"))?;
        let path = self.models_dir.join(&entry.filename);
        if path.is_file() {
            debug!(model = %entry.name, path = %path.display(), "Model weights present");
            return Ok(path);
        }
        self.download(&entry.name)
    }

    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .resolve(name)
            .with_context(|| format!("Unknown model: {name}"))?;
        let name = entry.name.as_str();

        let raw_url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;
        let url = parse_http_url(raw_url)?;
        let redacted = redacted_url_for_display(&url);

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "Failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let target = DownloadTarget {
            final_path: self.models_dir.join(&entry.filename),
            tmp_path: self.models_dir.join(format!("{}.part", entry.filename)),
            sha256: entry.sha256.as_deref(),
        };
        if target.sha256.is_none() {
            warn!(model = %name, "No SHA256 hash configured, skipping verification");
        }

        info!(model = %name, url = %redacted, "Downloading model");
        let final_path = download_with_retry(&url, &redacted, &target)?;
        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }

    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    /// Merge `models.json` from `data_dir` when present.
    pub fn load_catalog_file(&mut self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(CATALOG_FILE_NAME);
        if !path.is_file() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read model catalog: {}", path.display()))?;
        self.load_json(&raw)
            .with_context(|| format!("Invalid model catalog: {}", path.display()))
    }
}

struct DownloadTarget<'a> {
    final_path: PathBuf,
    tmp_path: PathBuf,
    sha256: Option<&'a str>,
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw).with_context(|| {
        format!(
            "invalid model URL: {}",
            crate::logging::redact_sensitive_text(raw)
        )
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => {
            let redacted = redacted_url_for_display(&parsed);
            bail!("unsupported model URL scheme '{scheme}' for '{redacted}' (expected http/https)")
        }
    }
}

fn download_with_retry(url: &Url, redacted_url: &str, target: &DownloadTarget<'_>) -> Result<PathBuf> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
        .timeout(DOWNLOAD_REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client for model download")?;

    for attempt in 1..=DOWNLOAD_MAX_ATTEMPTS {
        match download_once(&client, url, redacted_url, target) {
            Ok(()) => return Ok(target.final_path.clone()),
            Err(DownloadAttemptError { retryable, error }) => {
                if retryable && attempt < DOWNLOAD_MAX_ATTEMPTS {
                    warn!(
                        url = %redacted_url,
                        attempt,
                        max_attempts = DOWNLOAD_MAX_ATTEMPTS,
                        error = %error,
                        "model download attempt failed; retrying"
                    );

                    let backoff_ms = DOWNLOAD_RETRY_BACKOFF_MS.saturating_mul(attempt as u64);
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    continue;
                }

                if retryable {
                    return Err(anyhow!(
                        "download failed after {DOWNLOAD_MAX_ATTEMPTS} attempts for {redacted_url}: {error}"
                    ));
                }

                return Err(error);
            }
        }
    }

    Err(anyhow!(
        "download failed after {DOWNLOAD_MAX_ATTEMPTS} attempts for {redacted_url}"
    ))
}

fn download_once(
    client: &reqwest::blocking::Client,
    url: &Url,
    redacted_url: &str,
    target: &DownloadTarget<'_>,
) -> std::result::Result<(), DownloadAttemptError> {
    let mut response = client.get(url.as_str()).send().map_err(|err| {
        let wrapped = anyhow!("failed to start download from {redacted_url}");
        if is_retryable_reqwest_error(&err) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        }
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let wrapped = anyhow!(
            "download request returned HTTP {} for {}",
            status.as_u16(),
            redacted_url
        );

        if is_retryable_status(status) {
            return Err(DownloadAttemptError::retryable(wrapped));
        }
        return Err(DownloadAttemptError::fatal(wrapped));
    }

    let tmp_path = target.tmp_path.as_path();
    cleanup_file_if_exists(tmp_path);

    let mut tmp_file = fs::File::create(tmp_path)
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    let mut tmp_guard = TempFileCleanupGuard::new(tmp_path);

    response.copy_to(&mut tmp_file).map_err(|err| {
        let wrapped = anyhow!("failed while reading HTTP body from {redacted_url}");
        if is_retryable_reqwest_error(&err) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        }
    })?;

    tmp_file
        .flush()
        .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;

    tmp_file
        .sync_all()
        .with_context(|| format!("failed to fsync temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;

    drop(tmp_file);

    if let Some(expected) = target.sha256 {
        let actual = sha256_file(tmp_path).map_err(DownloadAttemptError::fatal)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(DownloadAttemptError::fatal(anyhow!(
                "SHA256 mismatch for {redacted_url}: expected {expected}, got {actual}"
            )));
        }
        debug!(url = %redacted_url, "SHA256 verified");
    }

    fs::rename(tmp_path, &target.final_path)
        .with_context(|| {
            format!(
                "failed to atomically move {} -> {}",
                tmp_path.display(),
                target.final_path.display()
            )
        })
        .map_err(DownloadAttemptError::fatal)?;

    tmp_guard.disarm();
    Ok(())
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

struct DownloadAttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl DownloadAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            cleanup_file_if_exists(self.path);
        }
    }
}

fn cleanup_file_if_exists(path: &Path) {
    let _ = fs::remove_file(path);
}

fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    if !redacted.username().is_empty() {
        let _ = redacted.set_username("<redacted>");
    }
    if redacted.password().is_some() {
        let _ = redacted.set_password(None);
    }
    if redacted.query().is_some() {
        redacted.set_query(Some("<redacted>"));
    }
    redacted.to_string()
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
