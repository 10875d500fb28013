//! A software IEC bus.
//!
//! [`SimBus`] models the five open-collector lines as shared state.  Each
//! [`SimPort`] drives its own contribution per line; a read returns the
//! wired-OR of every port's drive, exactly like the electrical bus: low
//! wins, a line only floats high when nobody pulls it.
//!
//! This is what the engine tests and the loopback tests run against, with
//! one port per simulated bus participant.

use crate::protocol::line::{IecLine, LinePort};

use parking_lot::Mutex;
use std::sync::Arc;

const NUM_LINES: usize = 5;

fn index(line: IecLine) -> usize {
    match line {
        IecLine::Atn => 0,
        IecLine::Clock => 1,
        IecLine::Data => 2,
        IecLine::Reset => 3,
        IecLine::SrqIn => 4,
    }
}

#[derive(Default)]
struct State {
    // One drive mask per attached port, one bool per line.
    drives: Vec<[bool; NUM_LINES]>,
}

/// A shared software bus.  Clone-cheap handle; create ports with
/// [`SimBus::port`].
#[derive(Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<State>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the bus.  All of its lines start released.
    pub fn port(&self) -> SimPort {
        let mut state = self.state.lock();
        state.drives.push([false; NUM_LINES]);
        SimPort {
            state: self.state.clone(),
            id: state.drives.len() - 1,
        }
    }

    /// Observe the wired-OR state of a line without attaching a port.
    pub fn probe(&self, line: IecLine) -> bool {
        let state = self.state.lock();
        state.drives.iter().any(|drive| drive[index(line)])
    }
}

/// One endpoint's connection to a [`SimBus`].
pub struct SimPort {
    state: Arc<Mutex<State>>,
    id: usize,
}

impl LinePort for SimPort {
    fn write(&mut self, line: IecLine, pulled: bool) {
        let mut state = self.state.lock();
        state.drives[self.id][index(line)] = pulled;
    }

    fn read(&mut self, line: IecLine) -> bool {
        let state = self.state.lock();
        state.drives.iter().any(|drive| drive[index(line)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wired_or() {
        let bus = SimBus::new();
        let mut a = bus.port();
        let mut b = bus.port();

        assert!(!a.read(IecLine::Data));

        a.set(IecLine::Data);
        assert!(b.read(IecLine::Data));

        // Both pulling: releasing one keeps the line low.
        b.set(IecLine::Data);
        a.release(IecLine::Data);
        assert!(a.read(IecLine::Data));

        b.release(IecLine::Data);
        assert!(!a.read(IecLine::Data));
    }

    #[test]
    fn test_lines_are_independent() {
        let bus = SimBus::new();
        let mut a = bus.port();
        a.set(IecLine::Clock);
        assert!(bus.probe(IecLine::Clock));
        assert!(!bus.probe(IecLine::Atn));
        assert!(!bus.probe(IecLine::Reset));
    }
}
