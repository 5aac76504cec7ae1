use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings of one kriging run. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KrigingConfig {
    pub platform: usize,
    /// Use at most this many devices of the platform.
    pub device_limit: Option<usize>,
    pub lags_count: usize,
    pub grid_size: usize,
    pub profile: bool,
    /// Run the single-threaded host reference instead of the devices.
    pub run_serial: bool,
    pub progress: bool,
}

impl Default for KrigingConfig {
    fn default() -> Self {
        Self {
            platform: 0,
            device_limit: None,
            lags_count: 10,
            grid_size: 30,
            profile: false,
            run_serial: false,
            progress: false,
        }
    }
}

impl KrigingConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lags_count == 0 {
            return Err(Error::Configuration("lags_count must be at least 1".into()));
        }
        if self.grid_size == 0 {
            return Err(Error::Configuration("grid_size must be at least 1".into()));
        }
        if self.device_limit == Some(0) {
            return Err(Error::Configuration(
                "device_limit must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}
