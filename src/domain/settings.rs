use crate::domain::models::{ServiceSpec, TargetIdentity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

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

/// What happens when a read/write is issued while another is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationDiscipline {
    /// One callback slot; a newer operation replaces the older one's
    /// callbacks and the next completion fires whichever is installed.
    #[default]
    SingleSlot,
    /// A newer operation fails with `OperationInProgress` while one is
    /// outstanding, and completions must match target and characteristic.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Timeout for requests created implicitly by read/write
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u32,
    /// Countdown tick period
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub operation_discipline: OperationDiscipline,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            operation_discipline: OperationDiscipline::default(),
        }
    }
}

/// A device remembered between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownTarget {
    #[serde(flatten)]
    pub target: TargetIdentity,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Connection Settings
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub known_targets: Vec<KnownTarget>,
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
    "ble_orchestrator".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_timeout_secs() -> u32 {
    10
}
fn default_tick_interval_ms() -> u64 {
    1000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load(settings_path: PathBuf) -> Self {
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
        path.push("BleOrchestrator");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
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

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Remember a target (replacing an entry with the same identity) and persist
    pub fn remember_target(&mut self, known: KnownTarget) -> anyhow::Result<()> {
        let targets = &mut self.settings.known_targets;
        match targets.iter_mut().find(|t| t.target == known.target) {
            Some(existing) if *existing == known => return Ok(()),
            Some(existing) => *existing = known,
            None => targets.push(known),
        }
        self.save()
    }

    pub fn find_target(&self, name: &str) -> Option<&KnownTarget> {
        self.settings
            .known_targets
            .iter()
            .find(|t| t.target.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: Settings =
            serde_json::from_str(r#"{ "orchestrator": { "tick_interval_ms": 250 } }"#).unwrap();
        assert_eq!(settings.orchestrator.tick_interval_ms, 250);
        assert_eq!(settings.orchestrator.default_timeout_secs, 10);
        assert_eq!(
            settings.orchestrator.operation_discipline,
            OperationDiscipline::SingleSlot
        );
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.known_targets.is_empty());
    }

    #[test]
    fn test_discipline_names() {
        let settings: OrchestratorSettings =
            serde_json::from_str(r#"{ "operation_discipline": "reject" }"#).unwrap();
        assert_eq!(settings.operation_discipline, OperationDiscipline::Reject);
    }

    #[test]
    fn test_known_target_layout() {
        let known: KnownTarget = serde_json::from_str(
            r#"{
                "name": "Lock-01",
                "alias": "AA:BB:CC:DD:EE:FF",
                "services": [{
                    "service_uuid": "0000fff0-0000-1000-8000-00805f9b34fb",
                    "characteristic_uuids": ["0000fff1-0000-1000-8000-00805f9b34fb"]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(known.target.name, "Lock-01");
        assert_eq!(known.target.alias.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(
            known.services[0].service_uuid(),
            Uuid::parse_str("0000fff0-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn test_remember_target_persists() {
        let path = std::env::temp_dir().join(format!(
            "ble_orchestrator_settings_{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::load(path.clone());
        service
            .remember_target(KnownTarget {
                target: TargetIdentity::new("Lock-01"),
                services: Vec::new(),
            })
            .unwrap();

        let reloaded = SettingsService::load(path.clone());
        assert!(reloaded.find_target("Lock-01").is_some());
        assert!(reloaded.find_target("Lock-02").is_none());

        let _ = fs::remove_file(&path);
    }
}
