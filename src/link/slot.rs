//! The one-slot mailbox binding each outgoing request to its response.
//!
//! Exactly one request is outstanding on a connection at any time.  The
//! caller installs a pending slot *before* writing the request bytes (so the
//! background reader can never race ahead of it), then blocks on [`wait`]
//! until the reader resolves the slot with the payload and status of the
//! matching `s` frame.
//!
//! [`wait`]: ResponseSlot::wait

use crate::error::{Error, Result};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
enum State {
    /// No request in flight
    Idle,
    /// A request has been written and awaits its `s` frame
    Pending,
    /// The reader delivered payload and status for the pending request
    Resolved(Vec<u8>, Result<()>),
    /// The reader has exited; nothing will ever be resolved again
    Dead,
}

#[derive(Debug)]
pub(crate) struct ResponseSlot {
    state: Mutex<State>,
    cond: Condvar,
}

impl ResponseSlot {
    pub(crate) fn new() -> Self {
        ResponseSlot {
            state: Mutex::new(State::Idle),
            cond: Condvar::new(),
        }
    }

    /// Install a fresh pending request.  Must be called before the request
    /// bytes hit the wire.
    pub(crate) fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            State::Idle => {
                *state = State::Pending;
                Ok(())
            }
            State::Dead => Err(Error::Connection {
                message: "connection is shut down".to_string(),
            }),
            State::Pending | State::Resolved(..) => Err(Error::Connection {
                message: "a request is already in flight".to_string(),
            }),
        }
    }

    /// Roll a pending request back to idle.  Used when writing the request
    /// bytes failed and no response will ever arrive.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Idle;
        }
    }

    /// Deliver the response for the pending request.  Called by the reader,
    /// exactly once per `s` frame.
    pub(crate) fn resolve(&self, payload: Vec<u8>, status: Result<()>) {
        let mut state = self.state.lock();
        match *state {
            State::Pending => {
                *state = State::Resolved(payload, status);
                self.cond.notify_all();
            }
            // A status frame with no request outstanding.  The transceiver
            // should never do this; don't let it corrupt a later request.
            _ => warn!("Dropping unsolicited status frame"),
        }
    }

    /// Mark the slot dead and wake any waiter.  Called when the reader
    /// exits, for whatever reason.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        *state = State::Dead;
        self.cond.notify_all();
    }

    /// Block until the pending request resolves.  Returns the payload on
    /// success, the status error on a bus failure, and a connection error if
    /// the reader died first.
    pub(crate) fn wait(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, State::Idle) {
                State::Resolved(payload, Ok(())) => return Ok(payload),
                State::Resolved(_, Err(e)) => return Err(e),
                State::Dead => {
                    *state = State::Dead;
                    return Err(Error::Connection {
                        message: "connection closed while waiting for a response".to_string(),
                    });
                }
                other => {
                    *state = other;
                    self.cond.wait(&mut state);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolve_wakes_waiter() {
        let slot = Arc::new(ResponseSlot::new());
        slot.begin().unwrap();
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(20));
        slot.resolve(b"hello".to_vec(), Ok(()));
        assert_eq!(waiter.join().unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_close_fails_waiter() {
        let slot = Arc::new(ResponseSlot::new());
        slot.begin().unwrap();
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(20));
        slot.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::Connection { .. })
        ));
    }

    #[test]
    fn test_begin_after_close_fails() {
        let slot = ResponseSlot::new();
        slot.close();
        assert!(slot.begin().is_err());
    }

    #[test]
    fn test_double_begin_rejected() {
        let slot = ResponseSlot::new();
        slot.begin().unwrap();
        assert!(slot.begin().is_err());
        slot.cancel();
        assert!(slot.begin().is_ok());
    }
}
