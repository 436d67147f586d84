pub mod driver_config;

pub use driver_config::{
    load_driver_config, BusSection, DeviceSection, DriverConfig, MeasurementSection,
};
