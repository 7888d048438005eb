use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::capture::CaptureSettings;
use crate::ingest::{CameraConfig, PixelFormat};
use crate::layout::{validate_object_name, FrameLayout};
use crate::lifecycle::{ResourceNames, DEFAULT_LOCK_NAME, DEFAULT_SEGMENT_NAME};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_CHANNEL: u32 = 301;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_FRAME_INTERVAL_MS: u64 = 650;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 1_000;
const DEFAULT_RATE_LOG_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    camera: Option<CameraConfigFile>,
    log_dir: Option<PathBuf>,
    shm: Option<ShmConfigFile>,
    pixel_format: Option<PixelFormat>,
    timing: Option<TimingConfigFile>,
    preview: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    channel: Option<u32>,
    timeout_secs: Option<u64>,
}

impl std::fmt::Debug for CameraConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraConfigFile")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ShmConfigFile {
    segment_name: Option<String>,
    lock_name: Option<String>,
    reset_stale: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TimingConfigFile {
    frame_interval_ms: Option<u64>,
    error_backoff_ms: Option<u64>,
    rate_log_interval_secs: Option<u64>,
}

/// Fully resolved configuration of the capture process.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub camera: CameraConfig,
    pub log_dir: PathBuf,
    pub names: ResourceNames,
    pub reset_stale: bool,
    pub pixel_format: PixelFormat,
    pub timing: CaptureSettings,
    pub preview: bool,
}

/// Values given on the command line. They win over file and environment.
#[derive(Debug, Default, Clone)]
pub struct CaptureOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub channel: Option<u32>,
    pub log_dir: Option<PathBuf>,
    pub pixel_format: Option<PixelFormat>,
    pub preview: bool,
    pub reset_stale: bool,
}

impl CaptureConfig {
    /// Resolve defaults, then the JSON file (`path` or `LIVE_ALERT_CONFIG`),
    /// then `LIVE_ALERT_*` variables, then `overrides`, and validate.
    pub fn load(path: Option<&Path>, overrides: CaptureOverrides) -> Result<Self> {
        let env_path = std::env::var("LIVE_ALERT_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => CaptureConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn layout(&self) -> Result<FrameLayout> {
        FrameLayout::new(self.width, self.height)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let shm = file.shm.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        Self {
            width: file.width.unwrap_or(DEFAULT_WIDTH),
            height: file.height.unwrap_or(DEFAULT_HEIGHT),
            camera: CameraConfig {
                host: camera.host.unwrap_or_default(),
                username: camera.username.unwrap_or_default(),
                password: Zeroizing::new(camera.password.unwrap_or_default()),
                channel: camera.channel.unwrap_or(DEFAULT_CHANNEL),
                timeout: Duration::from_secs(
                    camera.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
            },
            log_dir: file
                .log_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            names: ResourceNames {
                segment: shm
                    .segment_name
                    .unwrap_or_else(|| DEFAULT_SEGMENT_NAME.to_string()),
                lock: shm
                    .lock_name
                    .unwrap_or_else(|| DEFAULT_LOCK_NAME.to_string()),
            },
            reset_stale: shm.reset_stale.unwrap_or(false),
            pixel_format: file.pixel_format.unwrap_or_default(),
            timing: CaptureSettings {
                frame_interval: Duration::from_millis(
                    timing.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
                ),
                error_backoff: Duration::from_millis(
                    timing.error_backoff_ms.unwrap_or(DEFAULT_ERROR_BACKOFF_MS),
                ),
                rate_log_interval: Duration::from_secs(
                    timing
                        .rate_log_interval_secs
                        .unwrap_or(DEFAULT_RATE_LOG_INTERVAL_SECS),
                ),
            },
            preview: file.preview.unwrap_or(false),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(width) = env_u64("LIVE_ALERT_WIDTH")? {
            self.width = to_u32("LIVE_ALERT_WIDTH", width)?;
        }
        if let Some(height) = env_u64("LIVE_ALERT_HEIGHT")? {
            self.height = to_u32("LIVE_ALERT_HEIGHT", height)?;
        }
        if let Some(host) = env_string("LIVE_ALERT_CAMERA_HOST") {
            self.camera.host = host;
        }
        if let Some(username) = env_string("LIVE_ALERT_CAMERA_USERNAME") {
            self.camera.username = username;
        }
        if let Some(password) = env_string("LIVE_ALERT_CAMERA_PASSWORD") {
            self.camera.password = Zeroizing::new(password);
        }
        if let Some(channel) = env_u64("LIVE_ALERT_CAMERA_CHANNEL")? {
            self.camera.channel = to_u32("LIVE_ALERT_CAMERA_CHANNEL", channel)?;
        }
        if let Some(dir) = env_string("LIVE_ALERT_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(segment) = env_string("LIVE_ALERT_SEGMENT_NAME") {
            self.names.segment = segment;
        }
        if let Some(lock) = env_string("LIVE_ALERT_LOCK_NAME") {
            self.names.lock = lock;
        }
        if let Some(format) = env_string("LIVE_ALERT_PIXEL_FORMAT") {
            self.pixel_format = format.parse()?;
        }
        if let Some(ms) = env_u64("LIVE_ALERT_FRAME_INTERVAL_MS")? {
            self.timing.frame_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: CaptureOverrides) {
        if let Some(width) = overrides.width {
            self.width = width;
        }
        if let Some(height) = overrides.height {
            self.height = height;
        }
        if let Some(host) = overrides.host {
            self.camera.host = host;
        }
        if let Some(username) = overrides.username {
            self.camera.username = username;
        }
        if let Some(password) = overrides.password {
            self.camera.password = password;
        }
        if let Some(channel) = overrides.channel {
            self.camera.channel = channel;
        }
        if let Some(dir) = overrides.log_dir {
            self.log_dir = dir;
        }
        if let Some(format) = overrides.pixel_format {
            self.pixel_format = format;
        }
        self.preview |= overrides.preview;
        self.reset_stale |= overrides.reset_stale;
    }

    fn validate(&self) -> Result<()> {
        self.layout()?;
        validate_object_name(&self.names.segment)?;
        validate_object_name(&self.names.lock)?;
        if self.names.segment == self.names.lock {
            return Err(anyhow!(
                "segment and lock must use different names, both are {}",
                self.names.segment
            ));
        }
        if self.camera.host.trim().is_empty() {
            return Err(anyhow!(
                "camera host is required (--host or LIVE_ALERT_CAMERA_HOST)"
            ));
        }
        if self.camera.username.is_empty() {
            return Err(anyhow!(
                "camera username is required (--username or LIVE_ALERT_CAMERA_USERNAME)"
            ));
        }
        if self.camera.password.is_empty() {
            return Err(anyhow!(
                "camera password is required (--password or LIVE_ALERT_CAMERA_PASSWORD)"
            ));
        }
        if self.camera.timeout.is_zero() {
            return Err(anyhow!("camera timeout must be greater than zero"));
        }
        if self.timing.rate_log_interval.is_zero() {
            return Err(anyhow!("rate log interval must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match env_string(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        None => Ok(None),
    }
}

fn to_u32(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{} is out of range", key))
}
