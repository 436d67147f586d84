use std::io;
use std::path::Path;

#[cfg(target_os = "linux")]
use i2cdev::core::I2CDevice;
#[cfg(target_os = "linux")]
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};

/// I2C bus error type - platform specific
#[cfg(target_os = "linux")]
pub type I2CError = LinuxI2CError;

#[cfg(not(target_os = "linux"))]
#[derive(Debug)]
pub struct I2CError(String);

#[cfg(not(target_os = "linux"))]
impl std::fmt::Display for I2CError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I2C not supported on this platform: {}", self.0)
    }
}

#[cfg(not(target_os = "linux"))]
impl std::error::Error for I2CError {}

#[cfg(not(target_os = "linux"))]
impl From<I2CError> for io::Error {
    fn from(e: I2CError) -> Self {
        io::Error::new(io::ErrorKind::Unsupported, e)
    }
}

/// A peer on one adapter at one address. Transfers are plain master
/// send/receive; status is the number of bytes moved.
pub trait I2cClient: Send {
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn address(&self) -> u16;
}

/// I2C client backed by the Linux i2c-dev interface
#[cfg(target_os = "linux")]
pub struct LinuxI2CClient {
    device: LinuxI2CDevice,
    address: u16,
}

#[cfg(not(target_os = "linux"))]
pub struct LinuxI2CClient {
    address: u16,
}

#[cfg(target_os = "linux")]
impl LinuxI2CClient {
    pub fn new(path: &Path, address: u16) -> Result<Self, I2CError> {
        let device = LinuxI2CDevice::new(path, address)?;
        Ok(Self { device, address })
    }
}

/// i2c-dev transfers are all-or-nothing through i2cdev, so a successful
/// send or receive always reports the full length.
#[cfg(target_os = "linux")]
impl I2cClient for LinuxI2CClient {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.device.write(data).map_err(io::Error::from)?;
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read(buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn address(&self) -> u16 {
        self.address
    }
}

#[cfg(not(target_os = "linux"))]
impl LinuxI2CClient {
    pub fn new(_path: &Path, _address: u16) -> Result<Self, I2CError> {
        Err(I2CError("I2C is only supported on Linux".to_string()))
    }
}

#[cfg(not(target_os = "linux"))]
impl I2cClient for LinuxI2CClient {
    fn send(&mut self, _data: &[u8]) -> io::Result<usize> {
        Err(I2CError("I2C is only supported on Linux".to_string()).into())
    }

    fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(I2CError("I2C is only supported on Linux".to_string()).into())
    }

    fn address(&self) -> u16 {
        self.address
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::I2cClient;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Transfer {
        Send(Vec<u8>),
        Recv(usize),
    }

    /// Outcome queued for the next receive
    pub enum Reply {
        Bytes(Vec<u8>),
        Fail(io::ErrorKind),
    }

    /// Client that replays queued replies and records every transfer
    #[derive(Clone, Default)]
    pub struct ScriptedClient {
        pub transfers: Arc<Mutex<Vec<Transfer>>>,
        replies: Arc<Mutex<VecDeque<Reply>>>,
        send_fails: Arc<Mutex<VecDeque<io::ErrorKind>>>,
        short_send: Arc<Mutex<bool>>,
    }

    impl ScriptedClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(&self, bytes: &[u8]) -> &Self {
            self.replies.lock().unwrap().push_back(Reply::Bytes(bytes.to_vec()));
            self
        }

        pub fn fail_recv(&self, kind: io::ErrorKind) -> &Self {
            self.replies.lock().unwrap().push_back(Reply::Fail(kind));
            self
        }

        pub fn fail_next_send(&self, kind: io::ErrorKind) -> &Self {
            self.send_fails.lock().unwrap().push_back(kind);
            self
        }

        pub fn short_send(&self) -> &Self {
            *self.short_send.lock().unwrap() = true;
            self
        }

        pub fn transfers(&self) -> Vec<Transfer> {
            self.transfers.lock().unwrap().clone()
        }
    }

    impl I2cClient for ScriptedClient {
        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            self.transfers.lock().unwrap().push(Transfer::Send(data.to_vec()));
            if let Some(kind) = self.send_fails.lock().unwrap().pop_front() {
                return Err(io::Error::new(kind, "injected send failure"));
            }
            if *self.short_send.lock().unwrap() {
                return Ok(0);
            }
            Ok(data.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.transfers.lock().unwrap().push(Transfer::Recv(buf.len()));
            match self.replies.lock().unwrap().pop_front() {
                Some(Reply::Bytes(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Reply::Fail(kind)) => Err(io::Error::new(kind, "injected recv failure")),
                None => Err(io::Error::new(io::ErrorKind::Other, "no reply scripted")),
            }
        }

        fn address(&self) -> u16 {
            0x23
        }
    }
}
