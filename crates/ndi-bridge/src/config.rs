//! Optional TOML configuration for the bridge service. Command-line
//! flags override anything set here.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::controller::ControllerConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Capture device selector (path, name fragment or serial).
    pub device: Option<String>,
    /// Name broadcast on the network.
    pub ndi_name: Option<String>,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub auto_retry: bool,
    pub retry_delay_ms: u64,
    /// -1 retries forever.
    pub max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            retry_delay_ms: 5000,
            max_retries: -1,
        }
    }
}

impl BridgeConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Fold the file settings into a controller configuration.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            device: self.device.clone().unwrap_or_default(),
            ndi_name: self
                .ndi_name
                .clone()
                .unwrap_or_else(|| "NDI Bridge".to_string()),
            auto_retry: self.retry.auto_retry,
            retry_delay: Duration::from_millis(self.retry.retry_delay_ms),
            max_retries: self.retry.max_retries,
            ..ControllerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let config = BridgeConfig::load(Path::new("/nonexistent/ndi-bridge.toml")).unwrap();
        assert!(config.device.is_none());
        assert!(config.retry.auto_retry);
        assert_eq!(config.retry.max_retries, -1);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "ndi_name = \"Studio Cam\"\n\n[retry]\nretry_delay_ms = 1000"
        )
        .unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.ndi_name.as_deref(), Some("Studio Cam"));
        assert_eq!(config.retry.retry_delay_ms, 1000);
        assert_eq!(config.retry.max_retries, -1);

        let controller = config.controller_config();
        assert_eq!(controller.ndi_name, "Studio Cam");
        assert_eq!(controller.retry_delay, Duration::from_millis(1000));
    }

    #[test]
    fn rejects_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry = \"not a table\"").unwrap();
        assert!(BridgeConfig::load(file.path()).is_err());
    }
}
