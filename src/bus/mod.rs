//! [`Bus`] is the main interface for accessing Commodore drives over the
//! serial transceiver.  It owns the link, performs the connection handshake,
//! and exposes the five channel operations: reset, open, read, write, close.
use crate::constants::{
    ATN_PIN, BANNER_ATTEMPTS, CLOCK_PIN, CMD_CLOSE, CMD_GET, CMD_OPEN, CMD_PUT, CMD_RESET,
    CONNECT_PREFIX, DATA_PIN, HOST_DEVICE_NUMBER, MAX_OPEN_PAYLOAD, MIN_PROTOCOL_VERSION,
    PUT_CHUNK_SIZE, RESET_PIN, RESET_SETTLE, SRQ_IN_PIN,
};
use crate::error::{Error, Result};
use crate::link::{printable, Link, CLIENT_CHANNEL};
use crate::DeviceChannel;

use chrono::Local;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::thread;
use std::time::Duration;

pub mod builder;

pub use builder::BusBuilder;

/// A connection to the IEC bus through the serial transceiver.
///
/// Use [`BusBuilder`] to create one, then call [`Bus::initialize`] to run
/// the connection handshake.  After that the channel operations may be
/// called from any thread; an internal mutex keeps exactly one request in
/// flight at a time.
///
/// # Example
/// ```no_run
/// use ard1541::{BusBuilder, DeviceChannel};
///
/// let mut bus = BusBuilder::new()
///     .path("/dev/ttyUSB0")
///     .speed(57600)
///     .build()
///     .unwrap();
/// bus.initialize().unwrap();
/// bus.reset().unwrap();
///
/// // Channel 15 is the drive's command channel; reading it yields the
/// // current DOS status, e.g. "73,CBM DOS V2.6 1541,00,00".
/// let status = bus.read_from_channel(DeviceChannel::new(8, 15).unwrap()).unwrap();
/// println!("{}", String::from_utf8_lossy(&status));
/// ```
pub struct Bus {
    link: Link,
    op_lock: Mutex<()>,
    initialized: bool,
}

impl Bus {
    pub(crate) fn new(link: Link) -> Self {
        trace!("Bus::new");
        Bus {
            link,
            op_lock: Mutex::new(()),
            initialized: false,
        }
    }

    /// Run the connection handshake and start the background reader.
    ///
    /// Reads the transceiver's banner (retrying through any boot noise),
    /// checks the protocol version, and sends back the host configuration:
    /// device number 0 (host mode), the pin assignment, and the local time.
    ///
    /// # Errors
    /// [`Error::Connection`] if no valid banner arrives within
    /// [`BANNER_ATTEMPTS`] lines or the protocol version is unsupported.
    pub fn initialize(&mut self) -> Result<()> {
        trace!("Bus::initialize");
        if self.initialized {
            return Ok(());
        }

        let banner = self.read_banner()?;
        let version = parse_protocol_version(&banner)?;
        if version < MIN_PROTOCOL_VERSION {
            return Err(Error::Connection {
                message: format!("Unsupported protocol: '{}'", printable(&banner)),
            });
        }
        info!("Transceiver speaks protocol version {version}");

        let timestamp = Local::now().format("%Y-%m-%d.%H:%M:%S");
        let config = format!(
            "OK>{HOST_DEVICE_NUMBER}|{ATN_PIN}|{CLOCK_PIN}|{DATA_PIN}|{RESET_PIN}|{SRQ_IN_PIN}|{timestamp}\r"
        );
        self.link.send(config.as_bytes())?;

        self.link.start_reader()?;
        self.initialized = true;
        Ok(())
    }

    /// Reset the IEC bus by pulsing the RESET line.  Waits for the drives'
    /// power-on self test before collecting the response, so this takes a
    /// couple of seconds.
    pub fn reset(&self) -> Result<()> {
        trace!("Bus::reset");
        let _guard = self.op_lock.lock();
        self.transact(&[CMD_RESET], Some(RESET_SETTLE))?;
        Ok(())
    }

    /// Open a channel on a device.  `cmd` is sent to the channel as part of
    /// the open, e.g. a filename or a DOS command; at most 255 bytes.
    pub fn open_channel(&self, dc: DeviceChannel, cmd: &[u8]) -> Result<()> {
        trace!("Bus::open_channel {dc} cmd.len() {}", cmd.len());
        if cmd.len() > MAX_OPEN_PAYLOAD {
            return Err(Error::Args {
                message: format!(
                    "Open payload of {} bytes exceeds maximum {MAX_OPEN_PAYLOAD}",
                    cmd.len()
                ),
            });
        }
        let _guard = self.op_lock.lock();
        let mut request = Vec::with_capacity(4 + cmd.len());
        request.push(CMD_OPEN);
        request.push(dc.device());
        request.push(dc.channel());
        request.push(cmd.len() as u8);
        request.extend_from_slice(cmd);
        self.transact(&request, None)?;
        Ok(())
    }

    /// Read from a channel until the device signals EOI.  Returns the data
    /// received.
    pub fn read_from_channel(&self, dc: DeviceChannel) -> Result<Vec<u8>> {
        trace!("Bus::read_from_channel {dc}");
        let _guard = self.op_lock.lock();
        self.transact(&[CMD_GET, dc.device(), dc.channel()], None)
    }

    /// Write data to a channel.  Data larger than one chunk is split into
    /// 256 byte requests, each acknowledged before the next is sent; the
    /// first failing chunk aborts the whole write.
    pub fn write_to_channel(&self, dc: DeviceChannel, data: &[u8]) -> Result<()> {
        trace!("Bus::write_to_channel {dc} data.len() {}", data.len());
        if data.is_empty() {
            return Ok(());
        }
        let _guard = self.op_lock.lock();
        for chunk in data.chunks(PUT_CHUNK_SIZE) {
            let mut request = Vec::with_capacity(4 + chunk.len());
            request.push(CMD_PUT);
            request.push(dc.device());
            request.push(dc.channel());
            // A full chunk's length byte wraps to 0, which means 256 on the
            // wire.
            request.push((chunk.len() & 0xff) as u8);
            request.extend_from_slice(chunk);
            self.transact(&request, None)?;
        }
        Ok(())
    }

    /// Close a channel on a device.
    pub fn close_channel(&self, dc: DeviceChannel) -> Result<()> {
        trace!("Bus::close_channel {dc}");
        let _guard = self.op_lock.lock();
        self.transact(&[CMD_CLOSE, dc.device(), dc.channel()], None)?;
        Ok(())
    }
}

/// Private functions for Bus
impl Bus {
    /// One request/response round trip.  The caller must hold `op_lock`.
    ///
    /// The response slot is installed before the request bytes are written
    /// so the reader can never resolve a request that hasn't been
    /// registered.
    fn transact(&self, request: &[u8], settle: Option<Duration>) -> Result<Vec<u8>> {
        if !self.initialized {
            return Err(Error::Connection {
                message: "bus is not initialized".to_string(),
            });
        }
        self.link.begin_request()?;
        if let Err(e) = self.link.send(request) {
            self.link.cancel_request();
            return Err(e);
        }
        if let Some(pause) = settle {
            thread::sleep(pause);
        }
        self.link.wait_response()
    }

    /// Read lines until one carries the connection banner.  Anything else
    /// within the retry budget is boot noise; log it and carry on.
    fn read_banner(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        for attempt in 1..=BANNER_ATTEMPTS {
            line = self.link.read_line()?;
            if line.starts_with(CONNECT_PREFIX.as_bytes()) {
                return Ok(line);
            }
            if attempt < BANNER_ATTEMPTS {
                self.link.log(
                    'W',
                    CLIENT_CHANNEL,
                    &format!("Malformed connection string '{}'", printable(&line)),
                );
            }
        }
        Err(Error::Connection {
            message: format!("Unknown protocol response: '{}'", printable(&line)),
        })
    }
}

fn parse_protocol_version(banner: &[u8]) -> Result<u32> {
    let suffix = String::from_utf8_lossy(&banner[CONNECT_PREFIX.len()..]);
    let digits: String = suffix
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().map_err(|_| Error::Connection {
        message: format!("Unsupported protocol: '{}'", printable(banner)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol_version() {
        assert_eq!(parse_protocol_version(b"connect_arduino:3").unwrap(), 3);
        assert_eq!(parse_protocol_version(b"connect_arduino:12").unwrap(), 12);
        assert!(parse_protocol_version(b"connect_arduino:x").is_err());
    }
}
