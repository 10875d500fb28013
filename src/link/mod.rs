//! The framed serial link between the host and the transceiver.
//!
//! [`Link`] owns the tty descriptor and everything that moves bytes across
//! it: the buffered frame reader, the request writer, the escape handling
//! for response payloads, and the single background thread that parses
//! response and log frames.  [`crate::Bus`] drives it and is the interface
//! most callers want.
//!
//! The background reader is the sole consumer of the descriptor and the
//! request writer the sole producer.  Shutdown is signalled by writing one
//! byte to an internal pipe; the reader polls both descriptors, so it never
//! has to close the tty out from under itself.

pub mod escape;
pub mod serial;
pub(crate) mod slot;

use crate::constants::{FRAME_CHANNEL_DECL, FRAME_RESPONSE, FRAME_STATUS, MAX_LINE_LENGTH};
use crate::error::{Error, Result};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Callback invoked for every log frame received from the transceiver:
/// level letter (`D`, `W`, `E` or `I`), channel label, message text.
pub type LogCallback = Box<dyn Fn(char, &str, &str) + Send + Sync + 'static>;

/// Channel label used for messages generated by the host side itself.
pub const CLIENT_CHANNEL: &str = "CLIENT";

/// Render arbitrary bytes for inclusion in an error or log message.
pub(crate) fn printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b if b < 32 || b > 126 => out.push_str(&format!("#{b}")),
            b => out.push(b as char),
        }
    }
    out
}

/// Where the log frames go: the caller's callback if one was installed,
/// otherwise the `log` facade.
pub(crate) struct LogSink {
    callback: Option<LogCallback>,
}

impl LogSink {
    pub(crate) fn emit(&self, level: char, channel: &str, message: &str) {
        match &self.callback {
            Some(callback) => callback(level, channel, message),
            None => match level {
                'E' => error!("{channel}: {message}"),
                'W' => warn!("{channel}: {message}"),
                'I' => info!("{channel}: {message}"),
                _ => debug!("{channel}: {message}"),
            },
        }
    }
}

pub(crate) struct Shared {
    pub(crate) slot: slot::ResponseSlot,
    pub(crate) sink: LogSink,
}

/// The connection to the transceiver.
///
/// Created with a configured full duplex stream (a tty, or any socket-like
/// descriptor in tests).  [`Link::start_reader`] hands the read side to the
/// background thread; dropping the link wakes that thread, joins it, and
/// only then closes the descriptor.
pub(crate) struct Link {
    stream: File,
    wake_tx: OwnedFd,
    wake_rx: Option<OwnedFd>,
    reader: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    buffer: VecDeque<u8>,
}

impl Link {
    pub(crate) fn new(stream: File, callback: Option<LogCallback>) -> Result<Self> {
        // Broken pipes may just happen when the board disappears mid-write;
        // they must not kill the process.
        ignore_sigpipe();

        let (wake_rx, wake_tx) = make_pipe()?;
        Ok(Link {
            stream,
            wake_tx,
            wake_rx: Some(wake_rx),
            reader: None,
            shared: Arc::new(Shared {
                slot: slot::ResponseSlot::new(),
                sink: LogSink { callback },
            }),
            buffer: VecDeque::new(),
        })
    }

    /// Emit a message through the same sink the reader uses.
    pub(crate) fn log(&self, level: char, channel: &str, message: &str) {
        self.shared.sink.emit(level, channel, message);
    }

    /// Read one `\r` terminated line, blocking.  Only used during the
    /// connection handshake, before the background reader exists.
    pub(crate) fn read_line(&mut self) -> Result<Vec<u8>> {
        match read_terminated(&mut self.buffer, self.stream.as_raw_fd(), None) {
            Ok(Input::Item(line)) => Ok(line),
            Ok(Input::Eof) => Err(Error::Connection {
                message: "connection closed during handshake".to_string(),
            }),
            Ok(Input::Shutdown) => unreachable!("no wakeup fd was polled"),
            Err(e) => Err(Error::connection("read", e)),
        }
    }

    /// Write raw request bytes to the transceiver.
    pub(crate) fn send(&self, bytes: &[u8]) -> Result<()> {
        trace!("Link::send {} bytes", bytes.len());
        (&self.stream)
            .write_all(bytes)
            .map_err(|e| Error::connection("write", e))
    }

    pub(crate) fn begin_request(&self) -> Result<()> {
        self.shared.slot.begin()
    }

    pub(crate) fn cancel_request(&self) {
        self.shared.slot.cancel();
    }

    pub(crate) fn wait_response(&self) -> Result<Vec<u8>> {
        self.shared.slot.wait()
    }

    /// Start the background reader.  From here on the reader owns the read
    /// side of the descriptor.
    pub(crate) fn start_reader(&mut self) -> Result<()> {
        let wake = self.wake_rx.take().ok_or_else(|| Error::Connection {
            message: "reader already started".to_string(),
        })?;
        let fd = self.stream.as_raw_fd();
        let buffer = std::mem::take(&mut self.buffer);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("ard1541-reader".to_string())
            .spawn(move || reader_loop(fd, wake, buffer, shared))
            .map_err(|e| Error::connection("spawn reader", e))?;
        self.reader = Some(handle);
        Ok(())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // It doesn't matter what the byte is; any write to the pipe tells
        // the reader to exit.
        let token = [b't'];
        // Safety: wake_tx is a valid pipe descriptor we own.
        let _ = unsafe { libc::write(self.wake_tx.as_raw_fd(), token.as_ptr().cast(), 1) };
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        // The descriptor closes when self.stream drops, after the join.
    }
}

/// What a buffered read produced.
enum Input<T> {
    Item(T),
    /// The wakeup pipe became readable: shut down.
    Shutdown,
    /// The peer closed the stream.
    Eof,
}

fn ignore_sigpipe() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Safety: installing SIG_IGN is async-signal safe and process wide.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    });
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // Safety: pipe fills in two descriptors on success.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc == -1 {
        return Err(Error::connection("pipe", io::Error::last_os_error()));
    }
    // Safety: on success both descriptors are valid and unowned elsewhere.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Block until the stream has data (or the wakeup pipe fires).
fn wait_input(fd: RawFd, wake: Option<RawFd>) -> io::Result<Input<()>> {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: wake.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let nfds = if wake.is_some() { 2 } else { 1 };
    loop {
        // Safety: fds points at nfds valid pollfd structs.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds as libc::nfds_t, -1) };
        if rc == -1 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if wake.is_some() && fds[1].revents != 0 {
            return Ok(Input::Shutdown);
        }
        if fds[0].revents != 0 {
            // POLLHUP and POLLERR fall through to read, which reports them.
            return Ok(Input::Item(()));
        }
    }
}

/// Top up `buffer` from the descriptor.
fn fill(buffer: &mut VecDeque<u8>, fd: RawFd, wake: Option<RawFd>) -> io::Result<Input<()>> {
    match wait_input(fd, wake)? {
        Input::Shutdown => return Ok(Input::Shutdown),
        Input::Eof => unreachable!("poll does not report EOF"),
        Input::Item(()) => {}
    }
    let mut chunk = [0u8; 256];
    loop {
        // Safety: chunk is a valid writable buffer of the given length.
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
        if n < 0 {
            let e = io::Error::last_os_error();
            match e.kind() {
                io::ErrorKind::Interrupted => continue,
                // Spurious wakeup on a non-blocking descriptor; the next
                // poll will block again.
                io::ErrorKind::WouldBlock => return Ok(Input::Item(())),
                _ => return Err(e),
            }
        }
        if n == 0 {
            return Ok(Input::Eof);
        }
        buffer.extend(&chunk[..n as usize]);
        return Ok(Input::Item(()));
    }
}

fn next_byte(buffer: &mut VecDeque<u8>, fd: RawFd, wake: Option<RawFd>) -> io::Result<Input<u8>> {
    loop {
        if let Some(b) = buffer.pop_front() {
            return Ok(Input::Item(b));
        }
        match fill(buffer, fd, wake)? {
            Input::Shutdown => return Ok(Input::Shutdown),
            Input::Eof => return Ok(Input::Eof),
            Input::Item(()) => {}
        }
    }
}

/// Read up to the next `\r`, excluded.  Lines are bounded at
/// [`MAX_LINE_LENGTH`] bytes; anything longer is a framing error.
fn read_terminated(
    buffer: &mut VecDeque<u8>,
    fd: RawFd,
    wake: Option<RawFd>,
) -> io::Result<Input<Vec<u8>>> {
    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == escape::TERMINATOR) {
            if pos >= MAX_LINE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {MAX_LINE_LENGTH} bytes"),
                ));
            }
            let line: Vec<u8> = buffer.drain(..pos).collect();
            buffer.pop_front(); // the terminator itself
            return Ok(Input::Item(line));
        }
        if buffer.len() >= MAX_LINE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_LENGTH} bytes"),
            ));
        }
        match fill(buffer, fd, wake)? {
            Input::Shutdown => return Ok(Input::Shutdown),
            Input::Eof => return Ok(Input::Eof),
            Input::Item(()) => {}
        }
    }
}

/// The background reader.  Parses frames until the wakeup pipe fires, the
/// peer disappears, or the framing breaks; then fails any outstanding
/// request and exits.  It never touches the write side and never closes the
/// tty.
fn reader_loop(fd: RawFd, wake: OwnedFd, mut buffer: VecDeque<u8>, shared: Arc<Shared>) {
    trace!("Link reader starting");
    let wake_fd = wake.as_raw_fd();
    let mut channels: HashMap<u8, String> = HashMap::new();
    // The payload staged by `r` frames; handed over on the next `s` frame.
    let mut last_response: Vec<u8> = Vec::new();

    loop {
        let discriminator = match next_byte(&mut buffer, fd, Some(wake_fd)) {
            Ok(Input::Item(b)) => b,
            Ok(Input::Shutdown) => {
                trace!("Link reader woken for shutdown");
                break;
            }
            Ok(Input::Eof) => {
                shared
                    .sink
                    .emit('E', CLIENT_CHANNEL, "connection closed by transceiver");
                break;
            }
            Err(e) => {
                shared
                    .sink
                    .emit('E', CLIENT_CHANNEL, &format!("read failed: {e}"));
                break;
            }
        };

        let line = match read_terminated(&mut buffer, fd, Some(wake_fd)) {
            Ok(Input::Item(line)) => line,
            Ok(Input::Shutdown) => break,
            Ok(Input::Eof) => {
                shared
                    .sink
                    .emit('E', CLIENT_CHANNEL, "connection closed mid-frame");
                break;
            }
            Err(e) => {
                shared
                    .sink
                    .emit('E', CLIENT_CHANNEL, &format!("read failed: {e}"));
                break;
            }
        };

        match discriminator {
            FRAME_CHANNEL_DECL => {
                if line.len() < 2 {
                    shared.sink.emit(
                        'E',
                        CLIENT_CHANNEL,
                        &format!(
                            "Malformed channel configuration string '{}'",
                            printable(&line)
                        ),
                    );
                    break;
                }
                let name = String::from_utf8_lossy(&line[1..]).into_owned();
                trace!("Debug channel {:?} is '{name}'", line[0] as char);
                channels.insert(line[0], name);
            }
            level @ (b'D' | b'W' | b'E' | b'I') => {
                if line.is_empty() {
                    shared.sink.emit(
                        'E',
                        CLIENT_CHANNEL,
                        &format!("Malformed debug message '{}'", printable(&line)),
                    );
                    break;
                }
                let message = String::from_utf8_lossy(&line[1..]);
                match channels.get(&line[0]) {
                    Some(name) => shared.sink.emit(level as char, name, &message),
                    None => shared.sink.emit(
                        'W',
                        CLIENT_CHANNEL,
                        &format!("Log message for unknown channel {:#x}", line[0]),
                    ),
                }
            }
            FRAME_RESPONSE => match escape::unescape(&line) {
                Ok(payload) => last_response = payload,
                Err(e) => {
                    shared.sink.emit('E', CLIENT_CHANNEL, &e.to_string());
                    break;
                }
            },
            FRAME_STATUS => {
                let status = if line.is_empty() {
                    Ok(())
                } else {
                    // The status string is never escaped.
                    Err(Error::Iec {
                        message: String::from_utf8_lossy(&line).into_owned(),
                    })
                };
                shared
                    .slot
                    .resolve(std::mem::take(&mut last_response), status);
            }
            other => {
                shared.sink.emit(
                    'E',
                    CLIENT_CHANNEL,
                    &format!("Unknown response msg type {other:#x}"),
                );
                break;
            }
        }
    }

    // Whatever the exit reason, nobody may be left waiting forever.
    shared.slot.close();
    trace!("Link reader exiting");
}
