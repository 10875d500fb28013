//! The transceiver's serial command loop.
//!
//! [`Transceiver`] is the firmware main loop in portable form: it announces
//! itself on the serial stream, waits for the host's configuration line,
//! then dispatches single character opcodes against the [`IecDriver`],
//! framing results and asynchronous log messages back to the host.
//!
//! Generic over the serial stream, so it runs equally against a UART and
//! against one end of a socketpair in tests.

use crate::constants::{
    CMD_CLOSE, CMD_GET, CMD_OPEN, CMD_PUT, CMD_RESET, MAX_LINE_LENGTH, PROTOCOL_VERSION,
    PUT_CHUNK_SIZE,
};
use crate::link::escape::escape;
use crate::protocol::driver::{DriverError, IecDriver};
use crate::protocol::line::LinePort;
use crate::protocol::{
    ATN_CODE_CLOSE, ATN_CODE_DATA, ATN_CODE_LISTEN, ATN_CODE_OPEN, ATN_CODE_TALK,
    ATN_CODE_UNLISTEN, ATN_CODE_UNTALK,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::io::{self, Read, Write};

/// Identifier of the transceiver's debug log channel on the link.
const LOG_CHANNEL_ID: u8 = b'A';
const LOG_CHANNEL_NAME: &str = "IFACE";

/// How many configuration lines we are willing to reject before declaring
/// the host broken.  The firmware loops forever; bounding it here keeps a
/// misbehaving test from hanging.
const CONFIG_ATTEMPTS: usize = 10;

/// The serial front end of the transceiver.
pub struct Transceiver<S: Read + Write, P: LinePort> {
    serial: S,
    driver: IecDriver<P>,
}

impl<S: Read + Write, P: LinePort> Transceiver<S, P> {
    pub fn new(serial: S, driver: IecDriver<P>) -> Self {
        Transceiver { serial, driver }
    }

    /// Run the transceiver: handshake, then dispatch opcodes until the
    /// host closes the stream.
    pub fn run(&mut self) -> io::Result<()> {
        self.handshake()?;
        self.declare_channels()?;
        self.log_frame('I', "bus interface ready")?;

        loop {
            let mut opcode = [0u8; 1];
            match self.serial.read_exact(&mut opcode) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            self.dispatch(opcode[0])?;
        }
    }

    /// Announce ourselves until the host answers with a parseable
    /// configuration line.
    fn handshake(&mut self) -> io::Result<()> {
        for _ in 0..CONFIG_ATTEMPTS {
            self.serial
                .write_all(format!("connect_arduino:{PROTOCOL_VERSION}\r").as_bytes())?;
            self.serial.flush()?;

            let line = self.read_line()?;
            if self.apply_config(&line) {
                return Ok(());
            }
            debug!("Rejected configuration line {line:02x?}");
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no valid configuration line received",
        ))
    }

    /// Parse `OK>dev|atn|clk|data|reset|srq|timestamp` and adopt it.
    fn apply_config(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        let Some(rest) = text.strip_prefix("OK>") else {
            return false;
        };
        let fields: Vec<&str> = rest.split('|').collect();
        if fields.len() != 7 {
            return false;
        }
        let Ok(device) = fields[0].parse::<u8>() else {
            return false;
        };
        let mut pins = [0u8; 5];
        for (slot, field) in pins.iter_mut().zip(&fields[1..6]) {
            match field.parse::<u8>() {
                Ok(pin) => *slot = pin,
                Err(_) => return false,
            }
        }

        info!(
            "Configured as device {device}, pins ATN={} CLOCK={} DATA={} RESET={} SRQ={}, host time {}",
            pins[0], pins[1], pins[2], pins[3], pins[4], fields[6]
        );
        self.driver.set_device_number(device);
        true
    }

    fn declare_channels(&mut self) -> io::Result<()> {
        let mut frame = vec![b'!', LOG_CHANNEL_ID];
        frame.extend_from_slice(LOG_CHANNEL_NAME.as_bytes());
        frame.push(b'\r');
        self.serial.write_all(&frame)?;
        self.serial.flush()
    }

    /// Emit an asynchronous log frame.  These may interleave freely with a
    /// request in progress and never terminate one.
    fn log_frame(&mut self, level: char, message: &str) -> io::Result<()> {
        let mut frame = vec![level as u8, LOG_CHANNEL_ID];
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\r');
        self.serial.write_all(&frame)?;
        self.serial.flush()
    }

    fn dispatch(&mut self, opcode: u8) -> io::Result<()> {
        trace!("dispatch opcode '{}'", opcode as char);
        match opcode {
            CMD_RESET => {
                self.driver.trigger_reset();
                self.send_status(Ok(()))
            }
            CMD_OPEN => {
                let header = self.read_exact_buf(3)?;
                let payload = self.read_exact_buf(header[2] as usize)?;
                let result = self.do_open(header[0], header[1], &payload);
                self.send_status(result)
            }
            CMD_CLOSE => {
                let header = self.read_exact_buf(2)?;
                let result = self.do_close(header[0], header[1]);
                self.send_status(result)
            }
            CMD_GET => {
                let header = self.read_exact_buf(2)?;
                let (data, result) = self.do_get(header[0], header[1]);
                self.send_response(&data)?;
                self.send_status(result)
            }
            CMD_PUT => {
                let header = self.read_exact_buf(3)?;
                // A length byte of 0 means a full 256 byte chunk.
                let len = match header[2] {
                    0 => PUT_CHUNK_SIZE,
                    n => n as usize,
                };
                let data = self.read_exact_buf(len)?;
                let result = self.do_put(header[0], header[1], &data);
                self.send_status(result)
            }
            other => self.log_frame('W', &format!("unknown opcode {other:#04x}")),
        }
    }

    /// Open a channel: address the device as listener with an OPEN
    /// secondary, then send the command string, last byte with EOI.
    fn do_open(&mut self, device: u8, channel: u8, payload: &[u8]) -> Result<(), DriverError> {
        self.driver.clear_state();
        self.driver.atn_command(&[
            ATN_CODE_UNLISTEN,
            ATN_CODE_LISTEN | device,
            ATN_CODE_OPEN | channel,
        ])?;
        self.driver.atn_release();

        if let Some((&last, head)) = payload.split_last() {
            for &byte in head {
                self.driver.send(byte)?;
            }
            self.driver.send_eoi(last)?;
        }

        self.driver.atn_command(&[ATN_CODE_UNLISTEN])?;
        self.driver.atn_release();
        self.driver.release_all();
        Ok(())
    }

    fn do_close(&mut self, device: u8, channel: u8) -> Result<(), DriverError> {
        self.driver.clear_state();
        self.driver.atn_command(&[
            ATN_CODE_UNLISTEN,
            ATN_CODE_LISTEN | device,
            ATN_CODE_CLOSE | channel,
            ATN_CODE_UNLISTEN,
        ])?;
        self.driver.atn_release();
        self.driver.release_all();
        Ok(())
    }

    /// Read from a channel until the device signals EOI.  The data
    /// collected so far is returned even when the transfer errors out.
    fn do_get(&mut self, device: u8, channel: u8) -> (Vec<u8>, Result<(), DriverError>) {
        self.driver.clear_state();
        let mut data = Vec::new();

        let setup = self
            .driver
            .atn_command(&[
                ATN_CODE_UNLISTEN,
                ATN_CODE_TALK | device,
                ATN_CODE_DATA | channel,
            ])
            .and_then(|()| self.driver.turn_around());
        if let Err(e) = setup {
            self.driver.release_all();
            return (data, Err(e));
        }

        let result = loop {
            match self.driver.receive() {
                Ok(byte) => {
                    data.push(byte);
                    if self.driver.eoi() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let result = result.and_then(|()| {
            self.driver.atn_command(&[ATN_CODE_UNTALK])?;
            self.driver.atn_release();
            Ok(())
        });
        self.driver.release_all();
        (data, result)
    }

    /// Write one chunk to a channel.  Chunks are never EOI terminated; the
    /// host reassembles them, and the device sees the transfer end when the
    /// closing UNLISTEN arrives.
    fn do_put(&mut self, device: u8, channel: u8, data: &[u8]) -> Result<(), DriverError> {
        self.driver.clear_state();
        self.driver.atn_command(&[
            ATN_CODE_UNLISTEN,
            ATN_CODE_LISTEN | device,
            ATN_CODE_DATA | channel,
        ])?;
        self.driver.atn_release();

        for &byte in data {
            self.driver.send(byte)?;
        }

        self.driver.atn_command(&[ATN_CODE_UNLISTEN])?;
        self.driver.atn_release();
        self.driver.release_all();
        Ok(())
    }

    fn send_response(&mut self, data: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 2);
        frame.push(b'r');
        frame.extend_from_slice(&escape(data));
        frame.push(b'\r');
        self.serial.write_all(&frame)?;
        self.serial.flush()
    }

    fn send_status(&mut self, result: Result<(), DriverError>) -> io::Result<()> {
        match result {
            Ok(()) => self.serial.write_all(b"s\r")?,
            Err(e) => {
                self.driver.release_all();
                self.serial.write_all(format!("s{e}\r").as_bytes())?;
            }
        }
        self.serial.flush()
    }

    fn read_exact_buf(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.serial.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.serial.read_exact(&mut byte)?;
            if byte[0] == b'\r' {
                return Ok(line);
            }
            line.push(byte[0]);
            if line.len() >= MAX_LINE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "configuration line too long",
                ));
            }
        }
    }
}
