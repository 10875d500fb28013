use crate::constants::{MAX_CHANNEL_NUM, MAX_DEVICE_NUM, MIN_DEVICE_NUM};

use crate::Error;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::fmt;

/// Struct holding Device and Channel numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceChannel {
    device: u8,
    channel: u8,
}

impl DeviceChannel {
    /// Create a new DeviceChannel, validating both numbers
    pub fn new(device: u8, channel: u8) -> Result<Self, Error> {
        Self::validate(device, channel)?;
        Ok(Self { device, channel })
    }

    pub const fn device(&self) -> u8 {
        self.device
    }

    pub const fn channel(&self) -> u8 {
        self.channel
    }

    pub fn validate(device: u8, channel: u8) -> Result<(), Error> {
        trace!("DeviceChannel::validate: device {device} and channel {channel}");

        if device < MIN_DEVICE_NUM {
            Err(Error::Args {
                message: format!("Device number {device} is less than minimum {MIN_DEVICE_NUM}"),
            })
        } else if device > MAX_DEVICE_NUM {
            Err(Error::Args {
                message: format!("Device number {device} is greater than maximum {MAX_DEVICE_NUM}"),
            })
        } else if channel > MAX_CHANNEL_NUM {
            Err(Error::Args {
                message: format!(
                    "Channel number {channel} is greater than maximum {MAX_CHANNEL_NUM}"
                ),
            })
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for DeviceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device: {} Channel: {}", self.device, self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_drive_range() {
        assert!(DeviceChannel::new(8, 15).is_ok());
        assert!(DeviceChannel::new(30, 0).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(matches!(
            DeviceChannel::new(0, 15),
            Err(Error::Args { .. })
        ));
        assert!(matches!(
            DeviceChannel::new(31, 0),
            Err(Error::Args { .. })
        ));
        assert!(matches!(
            DeviceChannel::new(8, 16),
            Err(Error::Args { .. })
        ));
    }
}
