//! Configuration management for the rgbd daemon.
//!
//! Handles loading, parsing, and validation of YAML configuration files
//! that define providers, named colors and their assignment to devices.

use crate::{
    color::Color,
    device::{DeviceType, DeviceTypeFilter},
    drivers::e131::ChannelOrder,
    event::ConfigChangeType,
    provider::ProviderSettings,
};
use anyhow::{Context, Result, anyhow, bail};
use log::{LevelFilter, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Main configuration structure for the rgbd daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// log_level: info
/// tick_millis: 1000
/// update_rate_hard_limit_ms: 33
///
/// providers:
///   - kind: debug
///     name: debug
///     devices:
///       - model: "Virtual Strip"
///         leds: 30
///
/// colors:
///   - name: ocean
///     value: "#0066CC"
///
/// assignments:
///   - device: "rgbd Virtual Strip"
///     color: ocean
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Maximum log level: off, error, warn, info, debug or trace.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Period of the lighting refresh in milliseconds.
    #[serde(default = "defaults::tick_millis")]
    pub tick_millis: u64,

    /// Minimum interval between two hardware updates, unless a provider overrides it.
    #[serde(default = "defaults::update_rate_hard_limit_ms")]
    pub update_rate_hard_limit_ms: u64,

    #[serde(default)]
    pub providers: Vec<ProviderCfg>,

    /// Named colors.
    #[serde(default)]
    pub colors: Vec<ColorCfg>,

    /// Which color each device shows.
    #[serde(default)]
    pub assignments: Vec<AssignmentCfg>,
}

/// One device provider and the back end it drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCfg {
    /// Unique provider name, also the namespace of its device names.
    pub name: String,

    /// Device types to keep after loading. All types when absent.
    #[serde(default)]
    pub load_filter: Option<Vec<DeviceType>>,

    /// Overrides the global `update_rate_hard_limit_ms`.
    #[serde(default)]
    pub update_rate_hard_limit_ms: Option<u64>,

    /// Fails initialization when a single device cannot be loaded.
    #[serde(default)]
    pub throw_exceptions: bool,

    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// Back end variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Virtual devices that log their frames.
    Debug {
        #[serde(default)]
        devices: Vec<DebugDeviceCfg>,
    },
    /// DMX fixtures reached over E1.31 (sACN).
    E131 {
        #[serde(default)]
        devices: Vec<E131DeviceCfg>,
    },
    /// Thermaltake Riing Quad HID controllers.
    RiingQuad {
        #[serde(default = "defaults::leds_per_fan")]
        leds_per_fan: u16,

        /// Controllers to open. Every Thermaltake device is probed when empty.
        #[serde(default)]
        controllers: Vec<UsbSelector>,
    },
}

impl ProviderKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Debug { .. } => "debug",
            ProviderKind::E131 { .. } => "e131",
            ProviderKind::RiingQuad { .. } => "riing-quad",
        }
    }
}

impl ProviderCfg {
    /// Builds provider settings, falling back to the global hard limit.
    pub fn settings(&self, default_hard_limit_ms: u64) -> ProviderSettings {
        ProviderSettings {
            update_rate_hard_limit: Duration::from_millis(
                self.update_rate_hard_limit_ms
                    .unwrap_or(default_hard_limit_ms),
            ),
            load_filter: self
                .load_filter
                .as_ref()
                .map(|types| types.iter().copied().collect())
                .unwrap_or(DeviceTypeFilter::ALL),
            throw_exceptions: self.throw_exceptions,
        }
    }
}

/// A virtual device of the debug provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugDeviceCfg {
    pub model: String,

    #[serde(default = "defaults::debug_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "defaults::device_type")]
    pub device_type: DeviceType,

    /// Number of LEDs.
    pub leds: u16,

    /// LEDs per row of the layout. Defaults to a single row.
    #[serde(default)]
    pub columns: Option<u16>,
}

impl DebugDeviceCfg {
    /// A single-row LED strip.
    pub fn strip(model: &str, leds: u16) -> Self {
        Self {
            model: model.to_string(),
            manufacturer: defaults::debug_manufacturer(),
            device_type: DeviceType::LedStripe,
            leds,
            columns: None,
        }
    }
}

/// A DMX fixture or pixel run inside one E1.31 universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct E131DeviceCfg {
    pub model: String,

    #[serde(default = "defaults::e131_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "defaults::device_type")]
    pub device_type: DeviceType,

    /// Receiver host name or address.
    pub host: String,

    #[serde(default = "defaults::e131_port")]
    pub port: u16,

    /// Universe number, 1 to 63999.
    pub universe: u16,

    /// First DMX slot used by this device, 1-based.
    #[serde(default = "defaults::start_channel")]
    pub start_channel: u16,

    /// Number of LEDs, each taking one channel per color component.
    pub leds: u16,

    #[serde(default)]
    pub channel_order: ChannelOrder,

    /// Per-packet priority, 0 to 200.
    #[serde(default = "defaults::e131_priority")]
    pub priority: u8,

    /// Source name announced in packets. Defaults to "rgbd".
    #[serde(default)]
    pub source_name: Option<String>,

    /// Component identifier as a UUID. A random one is used when absent.
    #[serde(default)]
    pub cid: Option<String>,
}

impl E131DeviceCfg {
    /// Last DMX slot used by this device.
    ///
    /// Saturates at 0 for an empty device starting at channel 0.
    pub fn last_channel(&self) -> u32 {
        (u32::from(self.start_channel) + u32::from(self.leds) * self.channel_order.width() as u32)
            .saturating_sub(1)
    }
}

/// USB device selector for hardware identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSelector {
    /// USB Vendor ID.
    pub vid: u16,

    /// USB Product ID.
    pub pid: u16,

    /// Optional serial number for device identification.
    #[serde(default)]
    pub serial: Option<String>,
}

/// Named color definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorCfg {
    pub name: String,

    /// `#RRGGBB` or `#AARRGGBB`.
    pub value: Color,
}

/// Binds a named color to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCfg {
    /// Device name as exposed by its provider, e.g. "rgbd Virtual Strip".
    pub device: String,

    /// Restricts the match to one provider.
    #[serde(default)]
    pub provider: Option<String>,

    /// Name of an entry in `colors`.
    pub color: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            log_level: defaults::log_level(),
            tick_millis: defaults::tick_millis(),
            update_rate_hard_limit_ms: defaults::update_rate_hard_limit_ms(),
            providers: Vec::new(),
            colors: Vec::new(),
            assignments: Vec::new(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rgbd::config::Config;
    ///
    /// let config = Config::default();
    /// config.validate()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn validate(&self) -> Result<()> {
        self.log_filter()?;

        if self.tick_millis == 0 {
            bail!("tick_millis must be greater than zero");
        }

        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                bail!("Duplicate provider name '{}'", provider.name);
            }
            validate_provider(provider)?;
        }

        let mut color_names = HashSet::new();
        for color in &self.colors {
            if !color_names.insert(color.name.as_str()) {
                bail!("Duplicate color name '{}'", color.name);
            }
        }

        for assignment in &self.assignments {
            if !color_names.contains(assignment.color.as_str()) {
                bail!(
                    "Assignment for device '{}' references non-existent color '{}'",
                    assignment.device,
                    assignment.color
                );
            }
            if let Some(provider) = &assignment.provider {
                if !provider_names.contains(provider.as_str()) {
                    bail!(
                        "Assignment for device '{}' references non-existent provider '{}'",
                        assignment.device,
                        provider
                    );
                }
            }
        }

        Ok(())
    }

    pub fn log_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| anyhow!("Invalid log_level '{}'", self.log_level))
    }

    pub fn find_color(&self, name: &str) -> Option<Color> {
        self.colors
            .iter()
            .find(|color| color.name == name)
            .map(|color| color.value)
    }

    pub fn find_provider(&self, name: &str) -> Option<&ProviderCfg> {
        self.providers.iter().find(|provider| provider.name == name)
    }

    /// Classifies the difference between `self` and a newer configuration.
    ///
    /// Returns `None` when nothing changed.
    pub fn classify_change(&self, new: &Config) -> Option<ConfigChangeType> {
        if self == new {
            return None;
        }

        let mut cold = Vec::new();
        if self.providers != new.providers {
            cold.push("providers".to_string());
        }
        if self.update_rate_hard_limit_ms != new.update_rate_hard_limit_ms {
            cold.push("update_rate_hard_limit_ms".to_string());
        }
        if self.log_level != new.log_level {
            cold.push("log_level".to_string());
        }

        if cold.is_empty() {
            Some(ConfigChangeType::HotReload)
        } else {
            Some(ConfigChangeType::ColdRestart {
                changed_sections: cold,
            })
        }
    }
}

fn validate_provider(provider: &ProviderCfg) -> Result<()> {
    match &provider.kind {
        ProviderKind::Debug { devices } => {
            for device in devices {
                if device.leds == 0 {
                    bail!(
                        "Device '{}' of provider '{}' has no LEDs",
                        device.model,
                        provider.name
                    );
                }
                if device.columns == Some(0) {
                    bail!("Device '{}' has zero columns", device.model);
                }
            }
        }
        ProviderKind::E131 { devices } => {
            for device in devices {
                if device.leds == 0 {
                    bail!(
                        "Device '{}' of provider '{}' has no LEDs",
                        device.model,
                        provider.name
                    );
                }
                if !(1..=63999).contains(&device.universe) {
                    bail!(
                        "Device '{}' uses universe {} outside 1..=63999",
                        device.model,
                        device.universe
                    );
                }
                if device.start_channel == 0 || device.last_channel() > 512 {
                    bail!(
                        "Device '{}' needs channels {}..={} outside 1..=512",
                        device.model,
                        device.start_channel,
                        device.last_channel()
                    );
                }
                if device.priority > 200 {
                    bail!("Device '{}' has priority above 200", device.model);
                }
                if let Some(cid) = &device.cid {
                    uuid::Uuid::parse_str(cid)
                        .with_context(|| format!("Device '{}' has invalid cid", device.model))?;
                }
            }
        }
        ProviderKind::RiingQuad { leds_per_fan, .. } => {
            if *leds_per_fan == 0 {
                bail!("Provider '{}' sets leds_per_fan to zero", provider.name);
            }
        }
    }
    Ok(())
}

mod defaults {
    use crate::device::DeviceType;

    pub fn log_level() -> String {
        String::from("info")
    }

    pub fn tick_millis() -> u64 {
        1000
    }

    /// Roughly 30 updates per second.
    pub fn update_rate_hard_limit_ms() -> u64 {
        33
    }

    pub fn leds_per_fan() -> u16 {
        52
    }

    pub fn debug_manufacturer() -> String {
        String::from("rgbd")
    }

    pub fn e131_manufacturer() -> String {
        String::from("E1.31")
    }

    pub fn device_type() -> DeviceType {
        DeviceType::LedStripe
    }

    pub fn e131_port() -> u16 {
        5568
    }

    pub fn start_channel() -> u16 {
        1
    }

    pub fn e131_priority() -> u8 {
        100
    }
}

pub fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("RGBD_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("rgbd/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/rgbd/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    bail!("Configuration file not found in any standard location")
}

/// Owns the live configuration and the file it came from.
///
/// # Example
///
/// ```no_run
/// use rgbd::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml"))).await?;
/// let tick = config_manager.get().await.tick_millis;
/// config_manager.reload().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from `path` or the standard locations.
    ///
    /// Lookup order:
    /// 1. Provided path parameter
    /// 2. RGBD_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/rgbd/config.yml or ~/.config/rgbd/config.yml
    /// 4. /etc/rgbd/config.yml
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::read_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file and replaces the live configuration.
    ///
    /// The live configuration is untouched if the file is invalid.
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading config from: {}", self.path.display());
        let new_config = Self::read_from_path(&self.path)?;

        *self.config.write().await = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Saves the current configuration through a temporary file.
    pub async fn save(&self) -> Result<()> {
        let config = self.config.read().await;
        let config_yaml =
            serde_yaml::to_string(&*config).context("Failed to serialize configuration")?;

        let tmp_path = self.path.with_extension("yml.tmp");
        fs::write(&tmp_path, config_yaml).with_context(|| {
            format!("Failed to write temporary config to {}", tmp_path.display())
        })?;

        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to move config to {}", self.path.display()))?;

        info!("Configuration saved to: {}", self.path.display());
        Ok(())
    }

    pub async fn validate(&self) -> Result<()> {
        self.config.read().await.validate()
    }

    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Replaces the live configuration after validating it.
    pub async fn update_config(&self, new_config: Config) -> Result<()> {
        new_config
            .validate()
            .context("New configuration is invalid")?;
        *self.config.write().await = new_config;
        info!("Configuration updated in memory");
        Ok(())
    }

    /// Parses and validates a file without touching the live configuration.
    pub fn read_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
