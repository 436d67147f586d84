//! Filesystem-backed host.
//!
//! Layout under `run_dir`:
//! - `class/<class>/`                     device class
//! - `class/<class>/<node>/dev`           `"<major>:<minor>\n"`
//! - `dev/<node>`                         Unix socket serving the endpoint
//! - `bus/i2c/devices/<bus>-<addr>/name`  bus client

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    alloc_dynamic_major, release_dynamic_major, AdapterHandle, BoardInfo, CdevHandle,
    ClassHandle, DevNum, DeviceHost, NodeHandle,
};
use crate::bus::i2c::{I2cClient, LinuxI2CClient};
use crate::config::DriverConfig;
use crate::endpoint::Endpoint;
use crate::errors::{HostError, HostResult};
use crate::server::spawn_node_server;

/// Opens the bus client for a board on an adapter
pub type ClientConnector =
    Box<dyn Fn(&AdapterHandle, &BoardInfo) -> io::Result<Box<dyn I2cClient>> + Send + Sync>;

pub struct FsHost {
    run_dir: PathBuf,
    adapter_dir: PathBuf,
    runtime: Handle,
    connector: ClientConnector,
    classes: Mutex<HashSet<String>>,
    nodes: Mutex<HashMap<DevNum, UnixListener>>,
    cdevs: Mutex<HashMap<DevNum, JoinHandle<()>>>,
}

fn linux_connector(adapter: &AdapterHandle, info: &BoardInfo) -> io::Result<Box<dyn I2cClient>> {
    let client = LinuxI2CClient::new(&adapter.path, info.address)?;
    Ok(Box::new(client))
}

/// Removes a directory left behind by a previous run that did not tear down.
fn reclaim_stale_dir(path: &Path) -> HostResult<()> {
    if fs::symlink_metadata(path).is_ok() {
        warn!("[host] reclaiming stale {}", path.display());
        fs::remove_dir_all(path).map_err(io_error(path))?;
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> HostError + '_ {
    move |source| HostError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl FsHost {
    pub fn new(run_dir: impl Into<PathBuf>, adapter_dir: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            run_dir: run_dir.into(),
            adapter_dir: adapter_dir.into(),
            runtime,
            connector: Box::new(linux_connector),
            classes: Mutex::new(HashSet::new()),
            nodes: Mutex::new(HashMap::new()),
            cdevs: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &DriverConfig, runtime: Handle) -> Self {
        Self::new(&cfg.device.run_dir, &cfg.bus.adapter_dir, runtime)
    }

    pub fn with_connector(mut self, connector: ClientConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn client_dir(&self, adapter: &AdapterHandle, address: u16) -> PathBuf {
        self.run_dir
            .join("bus/i2c/devices")
            .join(format!("{}-{:04x}", adapter.index, address))
    }
}

impl DeviceHost for FsHost {
    fn alloc_region(&self, name: &str, count: u32) -> HostResult<DevNum> {
        let major = alloc_dynamic_major(name)?;
        debug!("[host] '{}' got {} minor(s) on major {}", name, count, major);
        Ok(DevNum { major, minor: 0 })
    }

    fn unregister_region(&self, base: DevNum, _count: u32) {
        release_dynamic_major(base.major);
    }

    fn class_create(&self, name: &str) -> HostResult<ClassHandle> {
        let root = self.run_dir.join("class");
        fs::create_dir_all(&root).map_err(io_error(&root))?;
        let path = root.join(name);

        let mut classes = self.classes.lock().unwrap_or_else(|p| p.into_inner());
        if classes.contains(name) {
            return Err(HostError::Io {
                path: path.display().to_string(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "class already registered"),
            });
        }
        reclaim_stale_dir(&path)?;
        fs::create_dir(&path).map_err(io_error(&path))?;
        classes.insert(name.to_string());
        Ok(ClassHandle {
            name: name.to_string(),
            path,
        })
    }

    fn class_destroy(&self, class: ClassHandle) {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&class.name);
        if let Err(e) = fs::remove_dir_all(&class.path) {
            warn!("[host] failed to remove class {}: {}", class.path.display(), e);
        }
    }

    fn device_create(&self, class: &ClassHandle, devnum: DevNum, name: &str) -> HostResult<NodeHandle> {
        let attr_dir = class.path.join(name);
        reclaim_stale_dir(&attr_dir)?;
        fs::create_dir(&attr_dir).map_err(io_error(&attr_dir))?;

        let bind = || -> HostResult<(PathBuf, UnixListener)> {
            let dev_attr = attr_dir.join("dev");
            fs::write(&dev_attr, format!("{}\n", devnum)).map_err(io_error(&dev_attr))?;

            let dev_dir = self.run_dir.join("dev");
            fs::create_dir_all(&dev_dir).map_err(io_error(&dev_dir))?;
            let path = dev_dir.join(name);
            if let Ok(meta) = fs::symlink_metadata(&path) {
                if meta.file_type().is_socket() {
                    debug!("[host] removing stale node {}", path.display());
                    fs::remove_file(&path).map_err(io_error(&path))?;
                }
            }
            let listener = UnixListener::bind(&path).map_err(io_error(&path))?;
            Ok((path, listener))
        };

        let (path, listener) = match bind() {
            Ok(bound) => bound,
            Err(e) => {
                let _ = fs::remove_dir_all(&attr_dir);
                return Err(e);
            }
        };

        self.nodes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(devnum, listener);
        info!("[host] node {} ({}) created", path.display(), devnum);
        Ok(NodeHandle {
            devnum,
            name: name.to_string(),
            path,
        })
    }

    fn device_destroy(&self, class: &ClassHandle, node: NodeHandle) {
        self.nodes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&node.devnum);
        if let Err(e) = fs::remove_file(&node.path) {
            warn!("[host] failed to remove node {}: {}", node.path.display(), e);
        }
        let attr_dir = class.path.join(&node.name);
        if let Err(e) = fs::remove_dir_all(&attr_dir) {
            warn!("[host] failed to remove {}: {}", attr_dir.display(), e);
        }
    }

    fn cdev_add(&self, devnum: DevNum, ops: Arc<Endpoint>) -> HostResult<CdevHandle> {
        let listener = {
            let nodes = self.nodes.lock().unwrap_or_else(|p| p.into_inner());
            let listener = nodes.get(&devnum).ok_or(HostError::NodeMissing { devnum })?;
            listener.try_clone().map_err(|source| HostError::Io {
                path: format!("node {}", devnum),
                source,
            })?
        };
        let task = spawn_node_server(listener, ops, &self.runtime).map_err(|source| HostError::Io {
            path: format!("node {}", devnum),
            source,
        })?;
        self.cdevs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(devnum, task);
        Ok(CdevHandle { devnum })
    }

    fn cdev_del(&self, cdev: CdevHandle) {
        let task = self
            .cdevs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&cdev.devnum);
        if let Some(task) = task {
            task.abort();
        }
    }

    fn get_adapter(&self, index: u32) -> HostResult<AdapterHandle> {
        let path = self.adapter_dir.join(format!("i2c-{}", index));
        if !path.exists() {
            return Err(HostError::AdapterNotFound {
                index,
                path: path.display().to_string(),
            });
        }
        Ok(AdapterHandle { index, path })
    }

    fn put_adapter(&self, adapter: AdapterHandle) {
        debug!("[host] released adapter i2c-{}", adapter.index);
    }

    fn new_client(&self, adapter: &AdapterHandle, info: &BoardInfo) -> HostResult<Box<dyn I2cClient>> {
        let client = (self.connector)(adapter, info).map_err(|source| HostError::Client {
            name: info.name.clone(),
            address: info.address,
            source,
        })?;

        let dir = self.client_dir(adapter, info.address);
        let name_attr = dir.join("name");
        fs::create_dir_all(&dir)
            .and_then(|_| fs::write(&name_attr, format!("{}\n", info.name)))
            .map_err(|source| {
                let _ = fs::remove_dir_all(&dir);
                HostError::Io {
                    path: name_attr.display().to_string(),
                    source,
                }
            })?;
        Ok(client)
    }

    fn unregister_client(&self, adapter: &AdapterHandle, client: Box<dyn I2cClient>) {
        let dir = self.client_dir(adapter, client.address());
        drop(client);
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("[host] failed to remove client {}: {}", dir.display(), e);
        }
    }
}

impl Drop for FsHost {
    fn drop(&mut self) {
        let cdevs = self.cdevs.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, task) in cdevs.drain() {
            task.abort();
        }
    }
}
