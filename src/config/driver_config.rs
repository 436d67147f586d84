use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{ConfigError, ConfigResult};
use crate::host::BoardInfo;

/// Root configuration, one table per concern. Every field defaults to the
/// values the driver ships with, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub bus: BusSection,
    pub measurement: MeasurementSection,
    pub device: DeviceSection,
}

/// `[bus]`: where the sensor lives
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// I2C adapter index, i.e. `/dev/i2c-<index>`
    pub index: u32,
    /// 7-bit peer address
    pub address: u16,
    /// Peer name published with the client
    pub name: String,
    /// Directory holding the `i2c-<index>` adapter nodes
    pub adapter_dir: PathBuf,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            index: 1,
            address: 0x23,
            name: "BH1750".to_string(),
            adapter_dir: PathBuf::from("/dev"),
        }
    }
}

/// `[measurement]`: command byte and conversion wait
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeasurementSection {
    pub mode: u8,
    pub conversion_delay_ms: u64,
}

impl Default for MeasurementSection {
    fn default() -> Self {
        Self {
            mode: crate::sensors::bh1750::CONTINUOUS_H_RES_MODE,
            conversion_delay_ms: 180,
        }
    }
}

impl MeasurementSection {
    pub fn conversion_delay(&self) -> Duration {
        Duration::from_millis(self.conversion_delay_ms)
    }
}

/// `[device]`: names and location of the exposed interface
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub driver_name: String,
    pub class_name: String,
    pub run_dir: PathBuf,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            driver_name: "bh1750_driver".to_string(),
            class_name: "BH1750ClassLuz".to_string(),
            run_dir: PathBuf::from("/run/luz"),
        }
    }
}

impl DriverConfig {
    /// Board descriptor used to instantiate the bus client
    pub fn board_info(&self) -> BoardInfo {
        BoardInfo {
            name: self.bus.name.clone(),
            address: self.bus.address,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.bus.address > 0x7F {
            return Err(ConfigError::InvalidValue {
                field: "bus.address".to_string(),
                reason: format!("{:#04x} is not a 7-bit address", self.bus.address),
            });
        }
        for (field, value) in [
            ("bus.name", &self.bus.name),
            ("device.driver_name", &self.device.driver_name),
            ("device.class_name", &self.device.class_name),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            if value.contains('/') {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("'{}' must not contain '/'", value),
                });
            }
        }
        Ok(())
    }
}

/// Loads and validates the driver config from a TOML file
pub fn load_driver_config(path: &str) -> ConfigResult<DriverConfig> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::LoadError {
        path: path.to_string(),
        source: e,
    })?;
    let parsed: DriverConfig = toml::from_str(&content)?;
    parsed.validate()?;
    Ok(parsed)
}
