//! Serial line setup for the transceiver link.
//!
//! The Arduino resets when the host opens the port and programs it to 1200
//! baud, so opening is a two step dance: program 1200 baud, give the board a
//! second to come back up, then reprogram to the real speed and flush
//! whatever the boot spewed at us.

use crate::constants::{ARDUINO_RESET_SLEEP, SUPPORTED_BAUD};
use crate::error::{Error, Result};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serialport::{ClearBuffer, SerialPort};
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::thread;
use termios::os::linux::CRTSCTS;
use termios::{
    tcsetattr, Termios, BRKINT, CREAD, CLOCAL, CS8, CSIZE, CSTOPB, ECHO, ECHONL, ICANON, ICRNL,
    IEXTEN, IGNBRK, IGNCR, INLCR, ISIG, ISTRIP, IXON, OPOST, PARENB, PARMRK, TCSANOW, VMIN, VTIME,
};

/// Open and configure the tty at `path`, returning a [`File`] owning the
/// descriptor, ready for the connection handshake.
///
/// # Args:
/// * `path` - the serial device file, e.g. `/dev/ttyUSB0`
/// * `speed` - target baud rate; must be in [`SUPPORTED_BAUD`]
///
/// # Errors
/// [`Error::Args`] for an unsupported speed, [`Error::Connection`] for any
/// tty level failure.
pub fn open_serial(path: &str, speed: u32) -> Result<File> {
    if !SUPPORTED_BAUD.contains(&speed) {
        return Err(Error::Args {
            message: format!("Unknown speed setting: {speed} baud"),
        });
    }

    debug!("Opening {path} at 1200 baud to trigger the transceiver reset");
    let mut port = serialport::new(path, 1200)
        .open_native()
        .map_err(|e| Error::connection(&format!("open(\"{path}\")"), e))?;

    // Wait for the board to reset, then switch to the requested speed and
    // drop anything sent or received in the meantime.
    thread::sleep(ARDUINO_RESET_SLEEP);
    port.set_baud_rate(speed)
        .map_err(|e| Error::connection("set_baud_rate", e))?;
    port.clear(ClearBuffer::Input)
        .map_err(|e| Error::connection("tcflush", e))?;

    let fd = port.into_raw_fd();
    // Safety: into_raw_fd transferred ownership of a valid descriptor.
    let file = unsafe { File::from_raw_fd(fd) };

    configure_raw(file.as_raw_fd())?;
    set_blocking(file.as_raw_fd())?;

    info!("Serial port {path} configured at {speed} baud");
    Ok(file)
}

/// Program raw 8N1 mode: no flow control, no canonical processing, no echo,
/// VMIN=1 / VTIME=1.
fn configure_raw(fd: RawFd) -> Result<()> {
    let mut tty = Termios::from_fd(fd).map_err(|e| Error::connection("tcgetattr", e))?;

    tty.c_cflag |= CLOCAL | CREAD;
    tty.c_cflag &= !CSIZE;
    tty.c_cflag |= CS8;
    tty.c_cflag &= !PARENB;
    tty.c_cflag &= !CSTOPB;
    tty.c_cflag &= !CRTSCTS;

    tty.c_iflag &= !(IGNBRK | BRKINT | PARMRK | ISTRIP | INLCR | IGNCR | ICRNL | IXON);
    tty.c_lflag &= !(ECHO | ECHONL | ICANON | ISIG | IEXTEN);
    tty.c_oflag &= !OPOST;

    tty.c_cc[VMIN] = 1;
    tty.c_cc[VTIME] = 1;

    tcsetattr(fd, TCSANOW, &tty).map_err(|e| Error::connection("tcsetattr", e))
}

/// The port is opened non-blocking so a wedged modem line can't hang us.
/// Once configured, the writer relies on ordinary blocking writes and the
/// reader multiplexes with poll, so clear `O_NONBLOCK` again.
fn set_blocking(fd: RawFd) -> Result<()> {
    // Safety: plain fcntl calls on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(Error::connection(
            "fcntl(F_GETFL)",
            std::io::Error::last_os_error(),
        ));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
    if rc == -1 {
        return Err(Error::connection(
            "fcntl(F_SETFL)",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}
