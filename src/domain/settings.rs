use crate::domain::battery::LowBatteryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "headset_control".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Protocol timing and link parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rfcomm_channel")]
    pub rfcomm_channel: u8,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rfcomm_channel: default_rfcomm_channel(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    100
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_read_timeout_ms() -> u64 {
    500
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_rfcomm_channel() -> u8 {
    crate::infrastructure::bluetooth::protocol::RFCOMM_CHANNEL
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatterySettings {
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: u8,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u8,
}

impl Default for BatterySettings {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl BatterySettings {
    pub fn policy(&self) -> LowBatteryPolicy {
        LowBatteryPolicy {
            warn_threshold: self.warn_threshold,
            error_threshold: self.error_threshold,
        }
    }
}

fn default_warn_threshold() -> u8 {
    30
}
fn default_error_threshold() -> u8 {
    20
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: String,
    pub name: String,
    pub address: u64,
    /// Bound RFCOMM TTY, when the link is set up through `rfcomm bind`
    #[serde(default)]
    pub tty_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub battery: BatterySettings,
    #[serde(default)]
    pub known_devices: Vec<KnownDevice>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is
    /// missing or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HeadsetControl");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Remember a device, replacing an older entry with the same id
    pub fn add_known_device(&mut self, device: KnownDevice) -> anyhow::Result<()> {
        let known = &mut self.settings.known_devices;
        match known.iter_mut().find(|d| d.id == device.id) {
            Some(existing) if *existing == device => return Ok(()),
            Some(existing) => *existing = device,
            None => known.push(device),
        }
        self.save()
    }

    pub fn find_known_device(&self, address: u64) -> Option<&KnownDevice> {
        self.settings
            .known_devices
            .iter()
            .find(|d| d.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.protocol.debounce_ms, 100);
        assert_eq!(settings.protocol.poll_interval_ms, 1000);
        assert_eq!(settings.protocol.rfcomm_channel, 8);
        assert_eq!(settings.battery.policy(), LowBatteryPolicy::default());
        assert!(settings.known_devices.is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "protocol": { "debounce_ms": 250 } }"#).unwrap();
        assert_eq!(settings.protocol.debounce_ms, 250);
        assert_eq!(settings.protocol.read_timeout_ms, 500);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::with_path(dir.path().join("absent.json"));
        assert_eq!(service.get().protocol, ProtocolSettings::default());
    }

    #[test]
    fn test_known_devices_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        let device = KnownDevice {
            id: "qc35".to_string(),
            name: "Headphones".to_string(),
            address: 0x04_52_C7_AA_BB_CC,
            tty_path: Some("/dev/rfcomm0".to_string()),
        };
        service.add_known_device(device.clone()).unwrap();

        let renamed = KnownDevice {
            name: "Travel headphones".to_string(),
            ..device
        };
        service.add_known_device(renamed).unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().known_devices.len(), 1);
        let known = reloaded.find_known_device(0x04_52_C7_AA_BB_CC).unwrap();
        assert_eq!(known.name, "Travel headphones");
    }
}
