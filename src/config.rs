//! Configuration management.
use crate::error::CommError;
use config::Config;
use serde::Deserialize;
use std::time::Duration;

/// Tunable parameters of the communication engine.
///
/// All fields have defaults, so the engine runs without a configuration file.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Maximum number of resends after a recoverable receive failure.
    pub max_retries: u32,
    /// Directory scanned for candidate serial devices during discovery.
    pub device_dir: String,
    /// Regex a device filename must match to be probed.
    pub device_pattern: String,
    /// Delay after a target switch before the board is addressable again, in ms.
    pub settle_delay_ms: u64,
    /// Delay between detect probes while the MCU reports reconfiguration, in ms.
    pub reconfigure_delay_ms: u64,
    /// Default receive timeout for one exchange, in microseconds.
    pub receive_timeout_us: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            device_dir: "/dev".to_string(),
            device_pattern: r"^ttyUSB\d+$".to_string(),
            settle_delay_ms: 200,
            reconfigure_delay_ms: 500,
            receive_timeout_us: 200_000,
        }
    }
}

impl Settings {
    /// Loads settings from `config/<name>.toml` (default name: `default`).
    pub fn new(config_name: Option<&str>) -> Result<Self, CommError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .build()
            .map_err(CommError::Config)?;

        s.try_deserialize().map_err(CommError::Config)
    }

    /// Default receive timeout as a [`Duration`].
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_micros(self.receive_timeout_us)
    }

    /// Settle delay after a target switch as a [`Duration`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Inter-probe delay while the MCU reconfigures as a [`Duration`].
    pub fn reconfigure_delay(&self) -> Duration {
        Duration::from_millis(self.reconfigure_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.device_dir, "/dev");
        assert!(settings.receive_timeout() > Duration::ZERO);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_retries = 5").unwrap();
        writeln!(file, "device_pattern = \"^ttyACM\\\\d+$\"").unwrap();

        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .unwrap();
        let settings: Settings = s.try_deserialize().unwrap();

        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.device_pattern, r"^ttyACM\d+$");
        // Untouched fields keep their defaults.
        assert_eq!(settings.settle_delay_ms, 200);
    }
}
