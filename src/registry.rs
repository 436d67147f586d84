use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::config::DriverConfig;
use crate::endpoint::Endpoint;
use crate::errors::{HostError, RegistryError, RegistryResult};
use crate::host::{DevNum, DeviceHost, NodeHandle};
use crate::sensors::Bh1750;

/// Registration steps, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    DeviceNumbers,
    Class,
    Node,
    Cdev,
    Adapter,
    Client,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::DeviceNumbers,
        Step::Class,
        Step::Node,
        Step::Cdev,
        Step::Adapter,
        Step::Client,
    ];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::DeviceNumbers => "device numbers",
            Step::Class => "device class",
            Step::Node => "device node",
            Step::Cdev => "char device",
            Step::Adapter => "i2c adapter",
            Step::Client => "i2c client",
        };
        f.write_str(name)
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// Stack of release actions. Dropping it releases everything still on it,
/// last acquired first.
#[derive(Default)]
struct Teardown {
    actions: Vec<(Step, Release)>,
}

impl Teardown {
    fn push(&mut self, step: Step, release: impl FnOnce() + Send + 'static) {
        self.actions.push((step, Box::new(release)));
    }

    fn unwind(&mut self) {
        while let Some((step, release)) = self.actions.pop() {
            debug!("[registry] releasing {}", step);
            release();
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.unwind();
    }
}

fn step_failed(step: Step) -> impl FnOnce(HostError) -> RegistryError {
    move |source| {
        error!("[registry] {} failed: {}", step, source);
        RegistryError::Step { step, source }
    }
}

/// Everything the driver registered. Shared between the registrar and any
/// open session; torn down when the last of them lets go.
struct Registration {
    teardown: Mutex<Teardown>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.teardown
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .unwind();
        info!("[registry] driver removed");
    }
}

/// Owns the driver's registration. Dropping it (or calling
/// [`Registrar::unload`]) tears the driver down in reverse order, once no
/// session is open any more.
pub struct Registrar {
    endpoint: Arc<Endpoint>,
    devnum: DevNum,
    node: NodeHandle,
    registration: Arc<Registration>,
}

impl Registrar {
    /// Brings the driver up. Either every step succeeds or everything
    /// acquired so far is released again before the error is returned.
    pub fn load(host: Arc<dyn DeviceHost>, config: &DriverConfig) -> RegistryResult<Self> {
        config.validate()?;
        let name = config.device.driver_name.as_str();
        let endpoint = Arc::new(Endpoint::new(Bh1750::from_config(&config.measurement)));
        let mut teardown = Teardown::default();

        let devnum = host
            .alloc_region(name, 1)
            .map_err(step_failed(Step::DeviceNumbers))?;
        {
            let host = host.clone();
            teardown.push(Step::DeviceNumbers, move || host.unregister_region(devnum, 1));
        }

        let class = host
            .class_create(&config.device.class_name)
            .map_err(step_failed(Step::Class))?;
        {
            let host = host.clone();
            let class = class.clone();
            teardown.push(Step::Class, move || host.class_destroy(class));
        }

        let node = host
            .device_create(&class, devnum, name)
            .map_err(step_failed(Step::Node))?;
        {
            let host = host.clone();
            let node = node.clone();
            teardown.push(Step::Node, move || host.device_destroy(&class, node));
        }

        let cdev = host
            .cdev_add(devnum, endpoint.clone())
            .map_err(step_failed(Step::Cdev))?;
        {
            let host = host.clone();
            teardown.push(Step::Cdev, move || host.cdev_del(cdev));
        }

        let adapter = host
            .get_adapter(config.bus.index)
            .map_err(step_failed(Step::Adapter))?;
        {
            let host = host.clone();
            let adapter = adapter.clone();
            teardown.push(Step::Adapter, move || host.put_adapter(adapter));
        }

        let client = host
            .new_client(&adapter, &config.board_info())
            .map_err(step_failed(Step::Client))?;
        endpoint.attach_client(client);
        {
            let endpoint = endpoint.clone();
            teardown.push(Step::Client, move || {
                if let Some(client) = endpoint.detach_client() {
                    host.unregister_client(&adapter, client);
                }
            });
        }

        info!(
            "[registry] driver initialized: {} ({}) on i2c-{} addr {:#04x}",
            node.path.display(),
            devnum,
            config.bus.index,
            config.bus.address
        );
        let registration = Arc::new(Registration {
            teardown: Mutex::new(teardown),
        });
        endpoint.set_owner(&registration);
        Ok(Self {
            endpoint,
            devnum,
            node,
            registration,
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn devnum(&self) -> DevNum {
        self.devnum
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Releases the registrar's hold. An open session keeps the driver
    /// registered until it is closed.
    pub fn unload(self) {}
}

impl Drop for Registrar {
    fn drop(&mut self) {
        if Arc::strong_count(&self.registration) > 1 {
            info!("[registry] session open, teardown deferred until it closes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::i2c::testing::ScriptedClient;
    use crate::bus::i2c::I2cClient;
    use crate::errors::HostResult;
    use crate::host::{AdapterHandle, BoardInfo, CdevHandle, ClassHandle};
    use std::collections::BTreeSet;
    use std::io;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Host that tracks what is resident and can fail any one step
    #[derive(Default)]
    struct RecordingHost {
        fail_at: Option<Step>,
        resident: Mutex<BTreeSet<&'static str>>,
        log: Mutex<Vec<String>>,
        client: ScriptedClient,
    }

    impl RecordingHost {
        fn failing_at(step: Step) -> Self {
            Self {
                fail_at: Some(step),
                ..Default::default()
            }
        }

        fn acquire(&self, step: Step, what: &'static str) -> HostResult<()> {
            if self.fail_at == Some(step) {
                return Err(HostError::Io {
                    path: what.to_string(),
                    source: io::Error::new(io::ErrorKind::Other, "injected"),
                });
            }
            assert!(self.resident.lock().unwrap().insert(what), "{} acquired twice", what);
            self.log.lock().unwrap().push(format!("+{}", what));
            Ok(())
        }

        fn release(&self, what: &'static str) {
            assert!(self.resident.lock().unwrap().remove(what), "{} released twice", what);
            self.log.lock().unwrap().push(format!("-{}", what));
        }

        fn resident(&self) -> BTreeSet<&'static str> {
            self.resident.lock().unwrap().clone()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl DeviceHost for RecordingHost {
        fn alloc_region(&self, _name: &str, count: u32) -> HostResult<DevNum> {
            assert_eq!(count, 1);
            self.acquire(Step::DeviceNumbers, "region")?;
            Ok(DevNum { major: 500, minor: 0 })
        }

        fn unregister_region(&self, _base: DevNum, _count: u32) {
            self.release("region");
        }

        fn class_create(&self, name: &str) -> HostResult<ClassHandle> {
            self.acquire(Step::Class, "class")?;
            Ok(ClassHandle {
                name: name.to_string(),
                path: PathBuf::from("class").join(name),
            })
        }

        fn class_destroy(&self, _class: ClassHandle) {
            self.release("class");
        }

        fn device_create(&self, class: &ClassHandle, devnum: DevNum, name: &str) -> HostResult<NodeHandle> {
            assert_eq!(class.name, "BH1750ClassLuz");
            self.acquire(Step::Node, "node")?;
            Ok(NodeHandle {
                devnum,
                name: name.to_string(),
                path: PathBuf::from("dev").join(name),
            })
        }

        fn device_destroy(&self, _class: &ClassHandle, _node: NodeHandle) {
            self.release("node");
        }

        fn cdev_add(&self, devnum: DevNum, _ops: Arc<Endpoint>) -> HostResult<CdevHandle> {
            self.acquire(Step::Cdev, "cdev")?;
            Ok(CdevHandle { devnum })
        }

        fn cdev_del(&self, _cdev: CdevHandle) {
            self.release("cdev");
        }

        fn get_adapter(&self, index: u32) -> HostResult<AdapterHandle> {
            self.acquire(Step::Adapter, "adapter")?;
            Ok(AdapterHandle {
                index,
                path: PathBuf::from(format!("/dev/i2c-{}", index)),
            })
        }

        fn put_adapter(&self, _adapter: AdapterHandle) {
            self.release("adapter");
        }

        fn new_client(&self, adapter: &AdapterHandle, info: &BoardInfo) -> HostResult<Box<dyn I2cClient>> {
            assert_eq!(adapter.index, 1);
            assert_eq!(info.name, "BH1750");
            assert_eq!(info.address, 0x23);
            self.acquire(Step::Client, "client")?;
            Ok(Box::new(self.client.clone()))
        }

        fn unregister_client(&self, _adapter: &AdapterHandle, _client: Box<dyn I2cClient>) {
            self.release("client");
        }
    }

    #[test]
    fn load_acquires_in_order_and_unload_reverses() {
        let host = Arc::new(RecordingHost::default());
        let registrar = Registrar::load(host.clone(), &DriverConfig::default()).unwrap();
        assert_eq!(registrar.devnum(), DevNum { major: 500, minor: 0 });
        assert_eq!(registrar.node().name, "bh1750_driver");
        assert_eq!(host.resident().len(), 6);

        registrar.unload();
        assert!(host.resident().is_empty());
        assert_eq!(
            host.log(),
            vec![
                "+region", "+class", "+node", "+cdev", "+adapter", "+client",
                "-client", "-adapter", "-cdev", "-node", "-class", "-region",
            ]
        );
    }

    #[test]
    fn failure_at_each_step_leaves_nothing_resident() {
        for (i, step) in Step::ALL.iter().enumerate() {
            let host = Arc::new(RecordingHost::failing_at(*step));
            let err = Registrar::load(host.clone(), &DriverConfig::default()).err().unwrap();
            assert!(
                matches!(err, RegistryError::Step { step: s, .. } if s == *step),
                "unexpected error for {}: {}",
                step,
                err
            );
            assert!(host.resident().is_empty(), "leak after {} failure: {:?}", step, host.resident());

            let log = host.log();
            assert_eq!(log.len(), i * 2, "log after {} failure: {:?}", step, log);
            let (acquired, released) = log.split_at(i);
            let mut undone: Vec<String> = released.iter().map(|r| r.replacen('-', "+", 1)).collect();
            undone.reverse();
            assert_eq!(acquired, undone.as_slice());
        }
    }

    #[test]
    fn invalid_config_acquires_nothing() {
        let host = Arc::new(RecordingHost::default());
        let mut cfg = DriverConfig::default();
        cfg.bus.address = 0x80;
        let err = Registrar::load(host.clone(), &cfg).err().unwrap();
        assert!(matches!(err, RegistryError::Config(_)));
        assert!(host.log().is_empty());
    }

    #[test]
    fn loaded_endpoint_measures_through_registered_client() {
        let host = Arc::new(RecordingHost::default());
        host.client.reply(&[0x03, 0x42]);
        let mut cfg = DriverConfig::default();
        cfg.measurement.conversion_delay_ms = 0;
        let registrar = Registrar::load(host.clone(), &cfg).unwrap();

        let mut session = registrar.endpoint().open().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"834\n");
        drop(session);

        drop(registrar);
        assert!(host.resident().is_empty());
    }

    #[test]
    fn open_session_defers_unload_until_closed() {
        let host = Arc::new(RecordingHost::default());
        host.client.reply(&[0x03, 0x42]);
        let mut cfg = DriverConfig::default();
        cfg.measurement.conversion_delay_ms = 0;
        let registrar = Registrar::load(host.clone(), &cfg).unwrap();

        let mut session = registrar.endpoint().open().unwrap();
        registrar.unload();
        assert_eq!(host.resident().len(), 6);

        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"834\n");

        session.release();
        assert!(host.resident().is_empty());
        assert_eq!(host.log().last().map(String::as_str), Some("-region"));
    }

    #[test]
    fn reads_after_unload_fail_with_io() {
        let host = Arc::new(RecordingHost::default());
        let registrar = Registrar::load(host.clone(), &DriverConfig::default()).unwrap();
        let endpoint = registrar.endpoint().clone();
        registrar.unload();
        assert!(host.resident().is_empty());

        let mut session = endpoint.open().unwrap();
        assert!(session.read(&mut [0u8; 16]).is_err());
    }
}
