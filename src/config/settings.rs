use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{LineConfiguration, TimeoutSettings};
use crate::serial::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(#[from] ConfigError),
}

/// Everything a port needs before it is opened, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub line: LineConfiguration,
    pub timeouts: TimeoutSettings,
    pub rx_queue_size: u32,
    pub tx_queue_size: u32,
    /// DataReceived fires once at least this many bytes are buffered.
    pub received_bytes_threshold: usize,
    pub open_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            line: LineConfiguration::default(),
            timeouts: TimeoutSettings::default(),
            rx_queue_size: 4096,
            tx_queue_size: 2048,
            received_bytes_threshold: 1,
            open_timeout_ms: 5000,
            close_timeout_ms: 2000,
        }
    }
}

impl PortSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.line.validate()?;
        if self.received_bytes_threshold == 0 {
            return Err(ConfigError::InvalidParameter(
                "received bytes threshold must be at least 1".into(),
            ));
        }
        if self.rx_queue_size == 0 {
            return Err(ConfigError::InvalidParameter(
                "receive queue size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path.as_ref())?;
        let settings: PortSettings = serde_json::from_str(&text)?;
        settings.validate()?;
        log::debug!("Loaded port settings from {}", path.as_ref().display());
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), text)?;
        log::debug!("Saved port settings to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Handshake, Parity};

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("comport-settings-{}.json", uuid::Uuid::new_v4()));
        let mut settings = PortSettings::default();
        settings.line = LineConfiguration::new(115_200).with_handshake(Handshake::RequestToSend);
        settings.line.parity = Parity::Odd;
        settings.timeouts = TimeoutSettings::return_immediately();
        settings.received_bytes_threshold = 16;

        settings.save(&path).unwrap();
        let loaded = PortSettings::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: PortSettings =
            serde_json::from_str(r#"{ "line": { "baud_rate": 19200 } }"#).unwrap();
        assert_eq!(settings.line.baud_rate, 19200);
        assert_eq!(settings.line.data_bits, 8);
        assert_eq!(settings.received_bytes_threshold, 1);
    }

    #[test]
    fn test_load_rejects_invalid_settings() {
        let path = std::env::temp_dir().join(format!("comport-settings-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, r#"{ "line": { "data_bits": 4 } }"#).unwrap();
        let result = PortSettings::load(&path);
        let _ = fs::remove_file(&path);
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }
}
