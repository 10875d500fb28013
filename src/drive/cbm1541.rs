//! A physical CBM-1541 drive as a [`SectorDevice`].
//!
//! Sector transfer uses the drive's own DOS over the channel API: `U1` and
//! `U2` move whole blocks between the disc and a drive buffer opened with
//! `#`, and `B-P` rewinds the buffer pointer.  The memory plumbing the DOS
//! offers (`M-W` to deposit bytes, `M-E` to call a routine) is exposed too,
//! for callers that upload custom drive code.

use crate::buscmd::DeviceChannel;
use crate::constants::{COMMAND_CHANNEL, SECTOR_SIZE};
use crate::drive::{geometry, DriveStatus, SectorDevice};
use crate::error::{Error, Result};
use crate::Bus;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Channel used for the drive buffer; 0 and 1 are reserved by the DOS for
/// LOAD and SAVE.
const BUFFER_CHANNEL: u8 = 2;

/// Largest payload of one `M-W` command.
const MEMORY_WRITE_CHUNK: usize = 32;

/// A full format is mechanical work; the drive stays busy for the best
/// part of a minute.
const FORMAT_TIMEOUT: Duration = Duration::from_secs(90);
const FORMAT_POLL: Duration = Duration::from_secs(1);

/// A CBM-1541 (or compatible) drive on the IEC bus.
///
/// The caller must ensure the addressed device is managed exclusively
/// through this instance; the drive has a single buffer pointer and DOS
/// channel state.
pub struct Cbm1541Drive<'a> {
    bus: &'a Bus,
    device: u8,
    command_channel: DeviceChannel,
    buffer_channel: DeviceChannel,
    buffer_open: bool,
}

impl<'a> Cbm1541Drive<'a> {
    pub fn new(bus: &'a Bus, device: u8) -> Result<Self> {
        Ok(Cbm1541Drive {
            bus,
            device,
            command_channel: DeviceChannel::new(device, COMMAND_CHANNEL)?,
            buffer_channel: DeviceChannel::new(device, BUFFER_CHANNEL)?,
            buffer_open: false,
        })
    }

    /// Send a DOS command string on the command channel.
    pub fn command(&self, cmd: &str) -> Result<()> {
        trace!("Cbm1541Drive::command '{cmd}'");
        self.bus
            .write_to_channel(self.command_channel, cmd.as_bytes())
    }

    /// Read and parse the drive's status message.  Reading the channel
    /// also clears the error condition in the DOS.
    pub fn read_status(&self) -> Result<DriveStatus> {
        let raw = self.bus.read_from_channel(self.command_channel)?;
        let status = DriveStatus::parse(&String::from_utf8_lossy(&raw))?;
        debug!("Drive {} status: {status}", self.device);
        Ok(status)
    }

    /// Deposit `data` into drive memory at `addr` using `M-W` commands.
    pub fn write_memory(&self, addr: u16, data: &[u8]) -> Result<()> {
        trace!(
            "Cbm1541Drive::write_memory addr 0x{addr:04x} len {}",
            data.len()
        );
        for (i, chunk) in data.chunks(MEMORY_WRITE_CHUNK).enumerate() {
            let chunk_addr = addr.wrapping_add((i * MEMORY_WRITE_CHUNK) as u16);
            let mut cmd = Vec::with_capacity(6 + chunk.len());
            cmd.extend_from_slice(b"M-W");
            cmd.push((chunk_addr & 0xff) as u8);
            cmd.push((chunk_addr >> 8) as u8);
            cmd.push(chunk.len() as u8);
            cmd.extend_from_slice(chunk);
            self.bus.write_to_channel(self.command_channel, &cmd)?;
        }
        Ok(())
    }

    /// Start executing drive code at `addr` with an `M-E` command.
    pub fn execute(&self, addr: u16) -> Result<()> {
        trace!("Cbm1541Drive::execute addr 0x{addr:04x}");
        let cmd = [
            b'M',
            b'-',
            b'E',
            (addr & 0xff) as u8,
            (addr >> 8) as u8,
        ];
        self.bus.write_to_channel(self.command_channel, &cmd)
    }

    /// Open the `#` buffer channel once; the DOS assigns us a free block
    /// buffer that U1/U2 operate on.
    fn ensure_buffer(&mut self) -> Result<()> {
        if self.buffer_open {
            return Ok(());
        }
        self.bus.open_channel(self.buffer_channel, b"#")?;
        self.check_status()?;
        self.buffer_open = true;
        Ok(())
    }

    fn check_status(&self) -> Result<()> {
        let status = self.read_status()?;
        // The DOS version banner queued after power-on or reset is an
        // error by number only; the first status read drains it.
        if status.is_error() && !status.is_power_on_banner() {
            Err(status.into_error())
        } else {
            Ok(())
        }
    }

    fn locate(&self, sector: usize) -> Result<(u8, u8)> {
        geometry::track_and_sector(sector).ok_or_else(|| Error::Args {
            message: format!("sector {sector} is beyond the end of the disc"),
        })
    }
}

impl SectorDevice for Cbm1541Drive<'_> {
    fn num_sectors(&mut self) -> Result<usize> {
        Ok(geometry::sector_count(geometry::TRACKS_STANDARD))
    }

    fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>> {
        let (track, sec) = self.locate(sector)?;
        trace!("Cbm1541Drive::read_sector {sector} ({track},{sec})");
        self.ensure_buffer()?;

        // Block-read into the buffer, then drain the buffer channel.
        self.command(&format!("U1 {BUFFER_CHANNEL} 0 {track} {sec}"))?;
        self.check_status()?;
        let data = self.bus.read_from_channel(self.buffer_channel)?;
        if data.len() != SECTOR_SIZE {
            return Err(Error::Iec {
                message: format!(
                    "short sector read: got {} bytes instead of {SECTOR_SIZE}",
                    data.len()
                ),
            });
        }
        Ok(data)
    }

    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(Error::Args {
                message: format!(
                    "sector data must be {SECTOR_SIZE} bytes, got {}",
                    data.len()
                ),
            });
        }
        let (track, sec) = self.locate(sector)?;
        trace!("Cbm1541Drive::write_sector {sector} ({track},{sec})");
        self.ensure_buffer()?;

        // Rewind the buffer pointer, fill the buffer, block-write it out.
        self.command(&format!("B-P {BUFFER_CHANNEL} 0"))?;
        self.check_status()?;
        self.bus.write_to_channel(self.buffer_channel, data)?;
        self.command(&format!("U2 {BUFFER_CHANNEL} 0 {track} {sec}"))?;
        self.check_status()
    }

    fn format_low_level(&mut self, tracks: usize) -> Result<()> {
        if tracks != geometry::TRACKS_STANDARD && tracks != geometry::TRACKS_EXTENDED {
            return Err(Error::Args {
                message: format!("cannot format {tracks} tracks, only 35 or 40"),
            });
        }
        info!("Formatting disc in drive {}", self.device);
        self.command("N:BACKUP,BK")?;

        // The drive is deaf while the head does its work; poll the command
        // channel until it answers again.
        let deadline = Instant::now() + FORMAT_TIMEOUT;
        loop {
            match self.read_status() {
                Ok(status) if status.is_error() && !status.is_power_on_banner() => {
                    return Err(status.into_error())
                }
                Ok(_) => return Ok(()),
                Err(Error::Iec { message }) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Iec { message });
                    }
                    debug!("Drive still formatting: {message}");
                    thread::sleep(FORMAT_POLL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Cbm1541Drive<'_> {
    fn drop(&mut self) {
        if self.buffer_open {
            // Best effort; the bus may already be gone.
            let _ = self.bus.close_channel(self.buffer_channel);
        }
    }
}
