//! The Commodore IEC byte protocol engine.
//!
//! [`IecDriver`] implements the three-wire handshake over any [`LinePort`]:
//! byte send with optional EOI signalling, byte receive with EOI detection,
//! controller ATN sequences, the talker/listener turn-around, and the ATN
//! command decoder used when acting as a bus device.
//!
//! All line waits are bounded.  A timeout sets the error flag, aborts the
//! transfer, and surfaces as a [`DriverError`]; nothing here blocks forever
//! when the peer goes away.

use crate::constants::RESET_HOLD;
use crate::protocol::line::{IecLine, LinePort};
use crate::protocol::{
    AtnCheck, AtnCmd, ATN_CODE_LISTEN, ATN_CODE_TALK, ATN_CODE_UNLISTEN, ATN_CODE_UNTALK,
    FLAG_ATN, FLAG_EOI, FLAG_ERROR,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("timeout on {0} line")]
    Timeout(IecLine),

    #[error("no device present on the bus")]
    NoDevice,

    #[error("attention asserted during transfer")]
    Attention,
}

/// Protocol timing knobs.
///
/// The defaults are the timings of the real bus.  The software bus
/// simulator substitutes [`IecTiming::relaxed`], which stretches every
/// window far beyond thread scheduling jitter; the protocol logic is
/// identical.
#[derive(Debug, Clone, Copy)]
pub struct IecTiming {
    /// Budget for any single line edge wait
    pub line_wait: Duration,
    /// A talker leaving CLOCK released longer than this before a byte is
    /// signalling EOI
    pub eoi_threshold: Duration,
    /// Length of the listener's DATA pulse acknowledging EOI
    pub eoi_ack_pulse: Duration,
    /// Data setup time before each CLOCK release
    pub bit_setup: Duration,
    /// How long each bit is held valid with CLOCK released
    pub bit_valid: Duration,
    /// Pause after asserting ATN before expecting devices to respond
    pub atn_settle: Duration,
}

impl Default for IecTiming {
    fn default() -> Self {
        IecTiming {
            line_wait: Duration::from_millis(2),
            eoi_threshold: Duration::from_micros(200),
            eoi_ack_pulse: Duration::from_micros(80),
            bit_setup: Duration::from_micros(20),
            bit_valid: Duration::from_micros(70),
            atn_settle: Duration::from_millis(1),
        }
    }
}

impl IecTiming {
    /// Timings for the software bus, where a "line edge" is a mutex write
    /// observed by another thread.
    pub fn relaxed() -> Self {
        IecTiming {
            line_wait: Duration::from_millis(500),
            eoi_threshold: Duration::from_millis(25),
            eoi_ack_pulse: Duration::from_millis(5),
            bit_setup: Duration::from_millis(1),
            bit_valid: Duration::from_millis(2),
            atn_settle: Duration::from_millis(5),
        }
    }
}

/// How a byte receive should react to the ATN line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtnWatch {
    /// Data phase as a device: ATN going low aborts the transfer
    AbortWhenPulled,
    /// Command phase under ATN: ATN going high ends the sequence
    DoneWhenReleased,
    /// Controller receive: we own ATN, nothing to watch
    Ignore,
}

/// The IEC protocol engine over a [`LinePort`].
///
/// Device number 0 means host mode: the engine is the bus controller and
/// may issue ATN sequences and bus resets.  Any other number makes it a
/// device that answers to [`IecDriver::check_atn`].
pub struct IecDriver<P: LinePort> {
    port: P,
    timing: IecTiming,
    device_number: u8,
    flags: u8,
}

impl<P: LinePort> IecDriver<P> {
    pub fn new(port: P, device_number: u8) -> Self {
        Self::with_timing(port, device_number, IecTiming::default())
    }

    pub fn with_timing(port: P, device_number: u8, timing: IecTiming) -> Self {
        IecDriver {
            port,
            timing,
            device_number,
            flags: 0,
        }
    }

    pub fn device_number(&self) -> u8 {
        self.device_number
    }

    pub fn set_device_number(&mut self, device_number: u8) {
        self.device_number = device_number;
    }

    /// Running in host mode means acting as the bus controller.
    pub fn is_host_mode(&self) -> bool {
        self.device_number == 0
    }

    /// Current [`FLAG_EOI`] / [`FLAG_ATN`] / [`FLAG_ERROR`] state.
    pub fn state(&self) -> u8 {
        self.flags
    }

    /// True if the most recently received byte carried EOI.
    pub fn eoi(&self) -> bool {
        self.flags & FLAG_EOI != 0
    }

    pub fn clear_state(&mut self) {
        self.flags = 0;
    }

    /// True iff the RESET line is sensed pulled.
    pub fn check_reset(&mut self) -> bool {
        self.port.read(IecLine::Reset)
    }

    /// Pull the RESET line long enough to reboot every device on the bus,
    /// then release it.  For use in host mode.
    pub fn trigger_reset(&mut self) {
        debug!("Pulsing RESET");
        self.release_all();
        self.flags = 0;
        self.port.set(IecLine::Reset);
        thread::sleep(RESET_HOLD);
        self.port.release(IecLine::Reset);
    }

    /// Stop driving every line.
    pub fn release_all(&mut self) {
        for line in IecLine::ALL {
            self.port.release(line);
        }
    }

    /// Take the talker role: between bytes a talker idles with CLOCK
    /// pulled, not driving DATA.
    pub fn become_talker(&mut self) {
        self.port.set(IecLine::Clock);
        self.port.release(IecLine::Data);
    }

    /// Take the listener role: DATA pulled, CLOCK released.
    pub fn become_listener(&mut self) {
        self.port.set(IecLine::Data);
        self.port.release(IecLine::Clock);
    }

    /// Send one byte as the current talker.  `eoi` marks it as the last
    /// byte of the transfer using the timing handshake.
    pub fn send(&mut self, byte: u8) -> Result<(), DriverError> {
        self.send_byte(byte, false)
    }

    /// Same as [`IecDriver::send`], indicating that this is the last byte.
    pub fn send_eoi(&mut self, byte: u8) -> Result<(), DriverError> {
        self.send_byte(byte, true)
    }

    fn send_byte(&mut self, byte: u8, eoi: bool) -> Result<(), DriverError> {
        trace!("send_byte 0x{byte:02x} eoi {eoi}");
        // Signal ready-to-send and wait until every listener has released
        // DATA.
        self.port.release(IecLine::Data);
        self.port.release(IecLine::Clock);
        self.wait_line(IecLine::Data, false, self.timing.line_wait)?;

        if eoi {
            // Withhold the CLOCK pull; the listener times out on the EOI
            // threshold and acknowledges with a DATA pulse.
            let ack_budget = self.timing.eoi_threshold * 2 + self.timing.line_wait;
            self.wait_line(IecLine::Data, true, ack_budget)?;
            self.wait_line(IecLine::Data, false, self.timing.line_wait)?;
        }
        self.port.set(IecLine::Clock);

        for bit in 0..8 {
            let one = (byte >> bit) & 1 != 0;
            // A released line reads high, which is a 1 bit.
            self.port.write(IecLine::Data, !one);
            delay(self.timing.bit_setup);
            self.port.release(IecLine::Clock);
            delay(self.timing.bit_valid);
            self.port.set(IecLine::Clock);
        }

        // Byte acknowledge: the listener pulls DATA.
        self.port.release(IecLine::Data);
        self.wait_line(IecLine::Data, true, self.timing.line_wait)?;
        Ok(())
    }

    /// Receive one byte as the current listener.  Sets [`FLAG_EOI`] if the
    /// talker flagged this byte as the last one.  When running as a device,
    /// ATN going low aborts with [`DriverError::Attention`] and sets
    /// [`FLAG_ATN`].
    pub fn receive(&mut self) -> Result<u8, DriverError> {
        let watch = if self.is_host_mode() {
            AtnWatch::Ignore
        } else {
            AtnWatch::AbortWhenPulled
        };
        match self.receive_byte(watch)? {
            Some(byte) => Ok(byte),
            None => unreachable!("only DoneWhenReleased yields no byte"),
        }
    }

    fn receive_byte(&mut self, watch: AtnWatch) -> Result<Option<u8>, DriverError> {
        self.flags &= !FLAG_EOI;
        self.port.release(IecLine::Clock);

        // Wait for the talker to signal ready-to-send by releasing CLOCK.
        let deadline = Instant::now() + self.timing.line_wait;
        loop {
            match watch {
                AtnWatch::AbortWhenPulled if self.port.read(IecLine::Atn) => {
                    self.flags |= FLAG_ATN;
                    return Err(DriverError::Attention);
                }
                AtnWatch::DoneWhenReleased if !self.port.read(IecLine::Atn) => {
                    return Ok(None);
                }
                _ => {}
            }
            if !self.port.read(IecLine::Clock) {
                break;
            }
            if Instant::now() >= deadline {
                self.flags |= FLAG_ERROR;
                return Err(DriverError::Timeout(IecLine::Clock));
            }
            thread::yield_now();
        }

        // Signal ready-for-data.  If the talker doesn't start the byte
        // within the EOI threshold it is telling us this is the last one;
        // acknowledge with a DATA pulse and keep waiting.
        self.port.release(IecLine::Data);
        if self
            .wait_line_quiet(IecLine::Clock, true, self.timing.eoi_threshold)
            .is_err()
        {
            self.flags |= FLAG_EOI;
            self.port.set(IecLine::Data);
            delay(self.timing.eoi_ack_pulse);
            self.port.release(IecLine::Data);
            self.wait_line(IecLine::Clock, true, self.timing.line_wait)?;
        }

        // Clock in 8 bits, LSB first, each valid while CLOCK is released.
        let mut byte = 0u8;
        for bit in 0..8 {
            self.wait_line(IecLine::Clock, false, self.timing.line_wait)?;
            if !self.port.read(IecLine::Data) {
                byte |= 1 << bit;
            }
            self.wait_line(IecLine::Clock, true, self.timing.line_wait)?;
        }

        // Acknowledge the byte.
        self.port.set(IecLine::Data);
        trace!("receive_byte 0x{byte:02x} eoi {}", self.eoi());
        Ok(Some(byte))
    }

    /// Assert ATN and send a command sequence, leaving ATN asserted.
    /// For use in host mode.
    pub fn atn_command(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        trace!("atn_command {bytes:02x?}");
        self.port.set(IecLine::Atn);
        self.port.set(IecLine::Clock);
        self.port.release(IecLine::Data);
        delay(self.timing.atn_settle);

        // Every device on the bus answers ATN by pulling DATA.  Silence
        // means there is nothing connected.
        if self
            .wait_line_quiet(IecLine::Data, true, self.timing.line_wait)
            .is_err()
        {
            self.flags |= FLAG_ERROR;
            self.port.release(IecLine::Atn);
            return Err(DriverError::NoDevice);
        }

        for &byte in bytes {
            self.send_byte(byte, false).inspect_err(|_| {
                self.port.release(IecLine::Atn);
            })?;
        }
        Ok(())
    }

    /// Release ATN after a command sequence, ending it.
    pub fn atn_release(&mut self) {
        self.port.release(IecLine::Atn);
        delay(self.timing.bit_setup);
    }

    /// Controller side of the talker/listener swap.  After addressing a
    /// device with TALK, hand it the bus: we become the listener and wait
    /// for the device to take the CLOCK line as the new talker.
    pub fn turn_around(&mut self) -> Result<(), DriverError> {
        trace!("turn_around");
        self.port.set(IecLine::Data);
        self.port.release(IecLine::Clock);
        self.port.release(IecLine::Atn);
        self.wait_line(IecLine::Clock, true, self.timing.line_wait)
    }

    /// Checks whether the controller is sending an attention command, and
    /// decodes it if so.  For use as a bus device.
    ///
    /// Primary addresses (LISTEN/TALK plus device number) are consumed
    /// here; `cmd` receives the secondary command code and any further
    /// bytes that arrived while ATN was held.  Data phases (an OPEN's
    /// filename, a chunk of channel data) follow with ATN released and are
    /// the caller's to receive.
    pub fn check_atn(&mut self, cmd: &mut AtnCmd) -> AtnCheck {
        if self.check_reset() {
            self.release_all();
            self.flags = 0;
            return AtnCheck::Reset;
        }
        if !self.port.read(IecLine::Atn) {
            return AtnCheck::Idle;
        }

        // ATN is down: answer with DATA and decode the command bytes.
        self.port.set(IecLine::Data);
        self.port.release(IecLine::Clock);
        cmd.clear();

        #[derive(PartialEq, Clone, Copy)]
        enum Role {
            Listen,
            Talk,
        }
        let mut role: Option<Role> = None;
        let mut secondary_role: Option<Role> = None;
        let mut last_primary = 0u8;
        let mut saw_byte = false;

        loop {
            let byte = match self.receive_byte(AtnWatch::DoneWhenReleased) {
                Ok(Some(byte)) => byte,
                Ok(None) => break,
                Err(e) => {
                    debug!("check_atn aborted: {e}");
                    return AtnCheck::Error;
                }
            };
            saw_byte = true;

            if byte == ATN_CODE_UNLISTEN || byte == ATN_CODE_UNTALK {
                role = None;
                last_primary = byte;
            } else if secondary_role.is_some() {
                // Once our secondary has arrived, everything further until
                // ATN releases is its payload.
                cmd.push(byte);
            } else if byte & 0xe0 == ATN_CODE_LISTEN {
                role = (byte & 0x1f == self.device_number).then_some(Role::Listen);
                last_primary = byte;
            } else if byte & 0xe0 == ATN_CODE_TALK {
                role = (byte & 0x1f == self.device_number).then_some(Role::Talk);
                last_primary = byte;
            } else if role.is_some() {
                // Secondary for us: the command code.
                cmd.code = byte;
                secondary_role = role;
            }
            // Secondaries for other devices are ignored.
        }

        if !saw_byte {
            // ATN blinked with no command byte; nothing of our concern.
            self.port.release(IecLine::Data);
            return AtnCheck::Idle;
        }

        match secondary_role {
            Some(Role::Listen) => {
                // Stay in listener position for the data phase.
                AtnCheck::CmdListen
            }
            Some(Role::Talk) => {
                // Device side of the turn-around: take the bus as talker.
                self.become_talker();
                AtnCheck::CmdTalk
            }
            None => {
                self.port.release(IecLine::Data);
                self.port.release(IecLine::Clock);
                cmd.code = last_primary;
                AtnCheck::Cmd
            }
        }
    }

    /// Wait until `line` reads `pulled`, within `budget`.  Failure sets the
    /// error flag.
    fn wait_line(
        &mut self,
        line: IecLine,
        pulled: bool,
        budget: Duration,
    ) -> Result<(), DriverError> {
        self.wait_line_quiet(line, pulled, budget).inspect_err(|_| {
            self.flags |= FLAG_ERROR;
        })
    }

    /// Like [`IecDriver::wait_line`] but without flagging an error; used
    /// where a timeout is an expected protocol signal (the EOI window).
    fn wait_line_quiet(
        &mut self,
        line: IecLine,
        pulled: bool,
        budget: Duration,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + budget;
        while self.port.read(line) != pulled {
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(line));
            }
            thread::yield_now();
        }
        Ok(())
    }
}

/// Busy wait for short windows, sleep for long ones.  The bit level windows
/// are far below timer granularity.
fn delay(d: Duration) {
    if d >= Duration::from_millis(1) {
        thread::sleep(d);
    } else {
        let end = Instant::now() + d;
        while Instant::now() < end {
            std::hint::spin_loop();
        }
    }
}
