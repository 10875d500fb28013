use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::link::{serial, Link, LogCallback};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::fs::File;
use std::os::fd::OwnedFd;

/// Default serial speed, matching the stock transceiver firmware.
pub const DEFAULT_BAUD: u32 = 57600;

/// A builder pattern for creating [`Bus`] instances.
///
/// Point it at a serial device, or hand it an already configured full
/// duplex descriptor (useful for tests, where the other end is a simulated
/// transceiver on a socketpair).
///
/// # Examples
///
/// ## Over a serial device
///
/// ```no_run
/// use ard1541::BusBuilder;
///
/// let mut bus = BusBuilder::new()
///     .path("/dev/ttyUSB0")
///     .speed(115200)
///     .build()
///     .unwrap();
/// bus.initialize().unwrap();
/// ```
///
/// ## Over an existing descriptor
///
/// ```no_run
/// use ard1541::BusBuilder;
/// use std::os::unix::net::UnixStream;
///
/// let (ours, _theirs) = UnixStream::pair().unwrap();
/// let mut bus = BusBuilder::new().stream(ours).build().unwrap();
/// ```
pub struct BusBuilder {
    path: Option<String>,
    speed: u32,
    stream: Option<File>,
    log_callback: Option<LogCallback>,
}

impl Default for BusBuilder {
    fn default() -> Self {
        BusBuilder {
            path: None,
            speed: DEFAULT_BAUD,
            stream: None,
            log_callback: None,
        }
    }
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the serial device file to open, e.g. `/dev/ttyUSB0`.
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Sets the serial speed.  Defaults to [`DEFAULT_BAUD`]; must be one of
    /// the speeds in [`crate::constants::SUPPORTED_BAUD`].
    pub fn speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    /// Use an already configured full duplex descriptor instead of opening
    /// a serial device.  Takes ownership of the descriptor.
    pub fn stream<F: Into<OwnedFd>>(mut self, stream: F) -> Self {
        self.stream = Some(File::from(stream.into()));
        self
    }

    /// Install a callback for log frames received from the transceiver.
    /// Without one, remote log messages go to the `log` facade.
    pub fn log_callback(mut self, callback: LogCallback) -> Self {
        self.log_callback = Some(callback);
        self
    }

    /// Builds the [`Bus`].  Call [`Bus::initialize`] on the result before
    /// using it.
    ///
    /// # Errors
    /// If neither a stream nor a device path was configured, or the serial
    /// device cannot be opened and programmed.
    pub fn build(self) -> Result<Bus> {
        trace!("BusBuilder::build");
        let stream = match self.stream {
            Some(stream) => stream,
            None => {
                let path = self.path.as_deref().ok_or_else(|| Error::Args {
                    message: "No serial device or stream configured".to_string(),
                })?;
                serial::open_serial(path, self.speed)?
            }
        };
        let link = Link::new(stream, self.log_callback)?;
        Ok(Bus::new(link))
    }
}
