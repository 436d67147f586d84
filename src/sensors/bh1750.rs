use std::io;
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::bus::i2c::I2cClient;
use crate::config::MeasurementSection;
use crate::errors::{BusError, BusResult};

/// Opcode: continuously H-resolution mode (1 lx resolution)
pub const CONTINUOUS_H_RES_MODE: u8 = 0x10;

/// Max conversion time for H-resolution mode per datasheet
pub const H_RES_CONVERSION_TIME: Duration = Duration::from_millis(180);

const SAMPLE_LEN: usize = 2;

/// BH1750 ambient light sensor. Each measurement is one
/// command / wait / two-byte read sequence; nothing is cached.
#[derive(Debug, Clone)]
pub struct Bh1750 {
    mode: u8,
    conversion_time: Duration,
}

impl Default for Bh1750 {
    fn default() -> Self {
        Self::new(CONTINUOUS_H_RES_MODE, H_RES_CONVERSION_TIME)
    }
}

impl Bh1750 {
    pub fn new(mode: u8, conversion_time: Duration) -> Self {
        Self { mode, conversion_time }
    }

    pub fn from_config(cfg: &MeasurementSection) -> Self {
        Self::new(cfg.mode, cfg.conversion_delay())
    }

    pub fn conversion_time(&self) -> Duration {
        self.conversion_time
    }

    /// Runs one raw measurement and returns the big-endian register value.
    ///
    /// Blocks the calling thread for the conversion time. Async callers must
    /// run this on a blocking worker.
    pub fn measure(&self, client: &mut dyn I2cClient) -> BusResult<u16> {
        let sent = client.send(&[self.mode]).map_err(|e| {
            error!("[bh1750] failed to send measurement command: {}", e);
            BusError::Write { source: e }
        })?;
        if sent != 1 {
            error!("[bh1750] measurement command short write ({} byte(s))", sent);
            return Err(BusError::ShortWrite { sent, expected: 1 });
        }

        thread::sleep(self.conversion_time);

        let mut buf = [0u8; SAMPLE_LEN];
        let received = client.recv(&mut buf).map_err(|e| {
            error!("[bh1750] failed to read measurement data: {}", e);
            match e.kind() {
                io::ErrorKind::TimedOut => BusError::ReadTimeout { source: e },
                _ => BusError::Read { source: e },
            }
        })?;
        if received != SAMPLE_LEN {
            error!("[bh1750] measurement data short read ({} byte(s))", received);
            return Err(BusError::ShortRead { received, expected: SAMPLE_LEN });
        }

        let raw = u16::from_be_bytes(buf);
        debug!("[bh1750] addr={:#04x} raw={}", client.address(), raw);
        Ok(raw)
    }
}
