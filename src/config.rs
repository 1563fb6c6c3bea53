use crate::errors::{AppError, AppResult};
use crate::multiplexer::DEFAULT_CHANGE_DEBOUNCE;
use crate::widgets::DEFAULT_LAYOUT_DEBOUNCE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "HR_DASHBOARD_CONFIG";
const DATA_DIR_ENV: &str = "HR_DASHBOARD_DATA_DIR";
const LISTEN_ADDR_ENV: &str = "HR_DASHBOARD_LISTEN_ADDR";
const REALTIME_ENV: &str = "HR_DASHBOARD_REALTIME";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub data_dir: PathBuf,
    pub listen_addr: String,
    pub realtime_enabled: bool,
    pub change_debounce_ms: u64,
    pub layout_debounce_ms: u64,
    pub seed_demo_data: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            listen_addr: "127.0.0.1:8787".to_string(),
            realtime_enabled: true,
            change_debounce_ms: DEFAULT_CHANGE_DEBOUNCE.as_millis() as u64,
            layout_debounce_ms: DEFAULT_LAYOUT_DEBOUNCE.as_millis() as u64,
            seed_demo_data: true,
        }
    }
}

impl AppSettings {
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut settings = match path {
            Some(path) if path.is_file() => {
                let raw = std::fs::read_to_string(path)?;
                serde_yaml::from_str::<Self>(&raw)?
            }
            Some(path) => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
        if let Ok(flag) = std::env::var(REALTIME_ENV) {
            self.realtime_enabled = parse_flag(&flag);
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.change_debounce_ms == 0 || self.layout_debounce_ms == 0 {
            return Err(AppError::InvalidParams(
                "debounce periods must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("hr.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    pub fn layout_debounce(&self) -> Duration {
        Duration::from_millis(self.layout_debounce_ms)
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

#[cfg(test)]
mod tests {
    use super::{parse_flag, AppSettings};

    #[test]
    fn yaml_overrides_only_the_given_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "changeDebounceMs: 150\nrealtimeEnabled: false\n").expect("write config");

        let settings = AppSettings::load(Some(&path)).expect("load");
        assert_eq!(settings.change_debounce_ms, 150);
        assert!(!settings.realtime_enabled);
        assert_eq!(settings.layout_debounce_ms, 800);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = AppSettings::load(Some(&dir.path().join("absent.yaml"))).expect("load");
        assert_eq!(settings.change_debounce_ms, 300);
        assert_eq!(settings.database_path(), settings.data_dir.join("hr.sqlite"));
    }

    #[test]
    fn zero_debounce_is_rejected() {
        let settings = AppSettings {
            change_debounce_ms: 0,
            ..AppSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn realtime_flag_parsing() {
        assert!(!parse_flag("off"));
        assert!(!parse_flag(" 0 "));
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
    }
}
