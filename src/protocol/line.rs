//! The open-collector line abstraction the IEC engine is built on.

use std::fmt;

/// The five lines of the IEC bus as seen by the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IecLine {
    Atn,
    Clock,
    Data,
    Reset,
    SrqIn,
}

impl IecLine {
    pub const ALL: [IecLine; 5] = [
        IecLine::Atn,
        IecLine::Clock,
        IecLine::Data,
        IecLine::Reset,
        IecLine::SrqIn,
    ];
}

impl fmt::Display for IecLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IecLine::Atn => "ATN",
            IecLine::Clock => "CLOCK",
            IecLine::Data => "DATA",
            IecLine::Reset => "RESET",
            IecLine::SrqIn => "SRQ",
        };
        f.write_str(name)
    }
}

/// One endpoint's view of the open-collector bus lines.
///
/// A line is *pulled* by driving it low (on real hardware: switching the pin
/// to output-low) and *released* by letting it float (switching the pin to
/// input, where the external pull-up holds it high).  Reading returns the
/// wired-OR state: `true` if *any* endpoint is pulling the line.
///
/// `read` takes `&mut self` because real hardware must switch a pin back to
/// input before sampling it.
pub trait LinePort {
    /// Drive the line: `pulled == true` pulls it low, `false` releases it.
    /// The pin must be in the requested state before this returns.
    fn write(&mut self, line: IecLine, pulled: bool);

    /// Sample the wired-OR line state: `true` means pulled low.
    fn read(&mut self, line: IecLine) -> bool;

    /// Pull the line low.
    fn set(&mut self, line: IecLine) {
        self.write(line, true);
    }

    /// Stop driving the line.
    fn release(&mut self, line: IecLine) {
        self.write(line, false);
    }
}
