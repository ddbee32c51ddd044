//! Capture configuration management

use anyhow::{Context, Result, anyhow};
use common::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default push destination when no file is configured
pub const DEFAULT_PUSH_SPEC: &str = "tcp://127.0.0.1:7878";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub activation: ActivationSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub sink: SinkSettings,
    #[serde(default)]
    pub startup: StartupSettings,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Serial number of the device to use; first candidate when unset
    #[serde(default)]
    pub udid: Option<String>,
}

/// How a device is taken out of the activated configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisableMode {
    /// Bus reset; the device re-enumerates in its normal configuration
    #[default]
    Reset,
    /// Vendor control request with the disable index
    Control,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationSettings {
    /// Interface subclass that marks the hidden configuration as active
    #[serde(default = "ActivationSettings::default_activated_subclass")]
    pub activated_subclass: u8,
    /// Interface subclass that marks a device as a candidate at all
    #[serde(default = "ActivationSettings::default_candidate_subclass")]
    pub candidate_subclass: u8,
    #[serde(default = "ActivationSettings::default_request_type")]
    pub request_type: u8,
    #[serde(default = "ActivationSettings::default_request")]
    pub request: u8,
    #[serde(default = "ActivationSettings::default_enable_index")]
    pub enable_index: u16,
    #[serde(default)]
    pub disable_index: u16,
    #[serde(default = "ActivationSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "ActivationSettings::default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default)]
    pub disable_mode: DisableMode,
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            activated_subclass: Self::default_activated_subclass(),
            candidate_subclass: Self::default_candidate_subclass(),
            request_type: Self::default_request_type(),
            request: Self::default_request(),
            enable_index: Self::default_enable_index(),
            disable_index: 0,
            poll_interval_ms: Self::default_poll_interval_ms(),
            max_poll_attempts: Self::default_max_poll_attempts(),
            disable_mode: DisableMode::default(),
        }
    }
}

impl ActivationSettings {
    fn default_activated_subclass() -> u8 {
        0x2A
    }

    fn default_candidate_subclass() -> u8 {
        0xFE
    }

    fn default_request_type() -> u8 {
        0x40 // host-to-device, vendor, device recipient
    }

    fn default_request() -> u8 {
        0x52
    }

    fn default_enable_index() -> u16 {
        0x02
    }

    fn default_poll_interval_ms() -> u64 {
        500
    }

    fn default_max_poll_attempts() -> u32 {
        5
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Configuration value selected before claiming
    #[serde(default = "StreamSettings::default_configuration")]
    pub configuration: u8,
    /// Subclass of the vendor-specific interface carrying the stream
    #[serde(default = "StreamSettings::default_interface_subclass")]
    pub interface_subclass: u8,
    /// Bytes requested per bulk IN transfer
    #[serde(default = "StreamSettings::default_transfer_size")]
    pub transfer_size: usize,
    /// Completed transfers buffered ahead of the deframer
    #[serde(default = "StreamSettings::default_transfer_depth")]
    pub transfer_depth: usize,
    /// Timeout of a single bulk read; bounds how long close() takes to be noticed
    #[serde(default = "StreamSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "StreamSettings::default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            configuration: Self::default_configuration(),
            interface_subclass: Self::default_interface_subclass(),
            transfer_size: Self::default_transfer_size(),
            transfer_depth: Self::default_transfer_depth(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            max_frame_len: Self::default_max_frame_len(),
        }
    }
}

impl StreamSettings {
    fn default_configuration() -> u8 {
        6
    }

    fn default_interface_subclass() -> u8 {
        0x2A
    }

    fn default_transfer_size() -> usize {
        4096
    }

    fn default_transfer_depth() -> usize {
        5
    }

    fn default_read_timeout_ms() -> u64 {
        100
    }

    fn default_max_frame_len() -> usize {
        protocol::MAX_FRAME_LEN
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Append payloads to this file instead of pushing them
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "SinkSettings::default_push_spec")]
    pub push_spec: String,
    /// Frames buffered between the session and the sink worker
    #[serde(default = "SinkSettings::default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "SinkSettings::default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "SinkSettings::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            file: None,
            push_spec: Self::default_push_spec(),
            queue_depth: Self::default_queue_depth(),
            flush_interval_ms: Self::default_flush_interval_ms(),
            reconnect_delay_ms: Self::default_reconnect_delay_ms(),
        }
    }
}

impl SinkSettings {
    fn default_push_spec() -> String {
        DEFAULT_PUSH_SPEC.to_string()
    }

    fn default_queue_depth() -> usize {
        256
    }

    fn default_flush_interval_ms() -> u64 {
        1000
    }

    fn default_reconnect_delay_ms() -> u64 {
        200
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Resolve which sink to open, expanding `~` in file paths
    pub fn target(&self) -> Result<SinkTarget> {
        match &self.file {
            Some(path) => {
                let expanded = shellexpand::tilde(path);
                Ok(SinkTarget::File(PathBuf::from(expanded.as_ref())))
            }
            None => Ok(SinkTarget::Push(parse_push_spec(&self.push_spec)?)),
        }
    }
}

/// Where deframed payloads go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    File(PathBuf),
    /// `host:port` to dial
    Push(String),
}

/// Strip the `tcp://` scheme and check the address has a port
pub fn parse_push_spec(spec: &str) -> Result<String> {
    let addr = spec
        .strip_prefix("tcp://")
        .ok_or_else(|| anyhow!("Invalid push spec '{}', expected tcp://host:port", spec))?;

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid push spec '{}', missing port", spec))?;
    if host.is_empty() {
        return Err(anyhow!("Invalid push spec '{}', missing host", spec));
    }
    port.parse::<u16>()
        .map_err(|_| anyhow!("Invalid push spec '{}', bad port '{}'", spec, port))?;

    // "*" is the nanomsg wildcard for bind, which means localhost when dialing
    if host == "*" {
        return Ok(format!("127.0.0.1:{}", port));
    }
    Ok(addr.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupSettings {
    #[serde(default = "StartupSettings::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "StartupSettings::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}

impl StartupSettings {
    fn default_max_attempts() -> u32 {
        4
    }

    fn default_retry_delay_ms() -> u64 {
        1000
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// How long main waits for teardown after the interrupt before giving up
    #[serde(default = "ShutdownSettings::default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            teardown_grace_ms: Self::default_teardown_grace_ms(),
        }
    }
}

impl ShutdownSettings {
    fn default_teardown_grace_ms() -> u64 {
        5000
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

impl CaptureConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/qt-pull/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to load config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML content
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CaptureConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("qt-pull").join("config.toml")
        } else {
            PathBuf::from(".config/qt-pull/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.activation.max_poll_attempts == 0 {
            return Err(anyhow!("activation.max_poll_attempts must be at least 1"));
        }
        if self.startup.max_attempts == 0 {
            return Err(anyhow!("startup.max_attempts must be at least 1"));
        }
        if self.stream.transfer_size == 0 || self.stream.transfer_depth == 0 {
            return Err(anyhow!(
                "stream.transfer_size and stream.transfer_depth must be non-zero"
            ));
        }
        if self.stream.max_frame_len < protocol::HEADER_LEN {
            return Err(anyhow!(
                "stream.max_frame_len must be at least {} bytes",
                protocol::HEADER_LEN
            ));
        }
        if self.sink.queue_depth == 0 {
            return Err(anyhow!("sink.queue_depth must be non-zero"));
        }

        if self.sink.file.is_none() {
            parse_push_spec(&self.sink.push_spec)?;
        }

        if let Some(udid) = &self.device.udid
            && udid.trim().is_empty()
        {
            return Err(anyhow!("device.udid must not be empty when set"));
        }

        Ok(())
    }
}
