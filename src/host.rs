//! Primitives the registrar acquires and releases when bringing the driver
//! up. Each acquire has a symmetric release; releases never fail.

pub mod fs;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::bus::i2c::I2cClient;
use crate::endpoint::Endpoint;
use crate::errors::{HostError, HostResult};

/// Major/minor device number pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHandle {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    pub devnum: DevNum,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdevHandle {
    pub devnum: DevNum,
}

/// Reference to a bus controller; returned with `put_adapter`, never destroyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    pub index: u32,
    pub path: PathBuf,
}

/// Name and address the bus client is created from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub name: String,
    pub address: u16,
}

pub trait DeviceHost: Send + Sync {
    fn alloc_region(&self, name: &str, count: u32) -> HostResult<DevNum>;
    fn unregister_region(&self, base: DevNum, count: u32);

    fn class_create(&self, name: &str) -> HostResult<ClassHandle>;
    fn class_destroy(&self, class: ClassHandle);

    fn device_create(&self, class: &ClassHandle, devnum: DevNum, name: &str) -> HostResult<NodeHandle>;
    fn device_destroy(&self, class: &ClassHandle, node: NodeHandle);

    /// Binds the endpoint as the operation table for `devnum`.
    fn cdev_add(&self, devnum: DevNum, ops: Arc<Endpoint>) -> HostResult<CdevHandle>;
    fn cdev_del(&self, cdev: CdevHandle);

    fn get_adapter(&self, index: u32) -> HostResult<AdapterHandle>;
    fn put_adapter(&self, adapter: AdapterHandle);

    fn new_client(&self, adapter: &AdapterHandle, info: &BoardInfo) -> HostResult<Box<dyn I2cClient>>;
    fn unregister_client(&self, adapter: &AdapterHandle, client: Box<dyn I2cClient>);
}

/// Dynamic majors are handed out from the top of the range downwards.
const DYNAMIC_MAJOR_MAX: u32 = 511;
const DYNAMIC_MAJOR_MIN: u32 = 384;

static MAJORS_IN_USE: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());

/// Allocates a free dynamic major, unique within the process.
pub fn alloc_dynamic_major(name: &str) -> HostResult<u32> {
    let mut in_use = MAJORS_IN_USE.lock().unwrap_or_else(|p| p.into_inner());
    let major = (DYNAMIC_MAJOR_MIN..=DYNAMIC_MAJOR_MAX)
        .rev()
        .find(|m| !in_use.contains(m))
        .ok_or_else(|| HostError::NoDeviceNumbers { name: name.to_string() })?;
    in_use.insert(major);
    Ok(major)
}

pub fn release_dynamic_major(major: u32) {
    let mut in_use = MAJORS_IN_USE.lock().unwrap_or_else(|p| p.into_inner());
    in_use.remove(&major);
}
