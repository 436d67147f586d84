//! Single-consumer reader endpoint around the BH1750 driver.
//!
//! One session may be open at a time. Each session yields exactly one
//! `"<raw>\n"` record and then end-of-stream until it is closed.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, warn};

use crate::bus::i2c::I2cClient;
use crate::errors::{BusError, EndpointError, EndpointResult};
use crate::sensors::Bh1750;

/// Room for any `u16` (or `i32`) record plus the newline
pub const RECORD_CAPACITY: usize = 16;

/// Whatever keeps the endpoint registered; sessions hold it while open
pub type Owner = Arc<dyn Any + Send + Sync>;

/// Endpoint state shared by the registrar, open sessions and the node server
pub struct Endpoint {
    sensor: Bh1750,
    client: Mutex<Option<Box<dyn I2cClient>>>,
    open: AtomicBool,
    owner: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Endpoint {
    pub fn new(sensor: Bh1750) -> Self {
        Self {
            sensor,
            client: Mutex::new(None),
            open: AtomicBool::new(false),
            owner: Mutex::new(None),
        }
    }

    /// Records the owner every new session pins until it is closed.
    pub fn set_owner<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(owner) as Weak<T>;
        *self.owner.lock().unwrap_or_else(|p| p.into_inner()) = Some(weak);
    }

    /// Installs the bus client; returns the previous one, if any.
    pub fn attach_client(&self, client: Box<dyn I2cClient>) -> Option<Box<dyn I2cClient>> {
        let mut slot = self.client.lock().unwrap_or_else(|p| p.into_inner());
        slot.replace(client)
    }

    pub fn detach_client(&self) -> Option<Box<dyn I2cClient>> {
        let mut slot = self.client.lock().unwrap_or_else(|p| p.into_inner());
        slot.take()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Starts a session. Never waits: a second opener gets `Busy`.
    pub fn open(self: &Arc<Self>) -> EndpointResult<Session> {
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[endpoint] open rejected: device busy");
            return Err(EndpointError::Busy);
        }
        let owner = self
            .owner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        debug!("[endpoint] session opened");
        Ok(Session {
            endpoint: Arc::clone(self),
            _owner: owner,
            delivered: false,
        })
    }

    fn measure(&self) -> EndpointResult<u16> {
        // Sessions are exclusive, so this lock is never contended by readers.
        let mut slot = self.client.lock().unwrap_or_else(|p| p.into_inner());
        let client = slot.as_deref_mut().ok_or(BusError::Detached)?;
        Ok(self.sensor.measure(client)?)
    }
}

/// An open session. Holds the endpoint and its owner alive; closing it
/// (explicitly or by drop) frees the endpoint for the next opener.
pub struct Session {
    endpoint: Arc<Endpoint>,
    _owner: Option<Owner>,
    delivered: bool,
}

impl Session {
    /// Reads the session's record into `buf`.
    ///
    /// Returns the number of bytes written, or 0 once the record has been
    /// delivered. At most `min(record length, buf.len())` bytes are written.
    /// On failure nothing is written and the next read measures again.
    pub fn read(&mut self, buf: &mut [u8]) -> EndpointResult<usize> {
        if self.delivered {
            return Ok(0);
        }

        let raw = self.endpoint.measure().map_err(|e| {
            error!("[endpoint] measurement failed: {}", e);
            e
        })?;

        let record = format!("{}\n", raw);
        let n = record.len().min(buf.len());
        buf[..n].copy_from_slice(&record.as_bytes()[..n]);
        self.delivered = true;
        Ok(n)
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn release(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        self.endpoint.open.store(false, Ordering::Release);
        debug!("[endpoint] session released");
    }
}
