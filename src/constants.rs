//! Constants shared by the host transport and the transceiver protocol engine.
use std::time::Duration;

/// Serial link framing

/// Banner emitted by the transceiver at startup, followed by the protocol
/// version and a carriage return
pub const CONNECT_PREFIX: &str = "connect_arduino:";
/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u32 = 3;
/// Minimum protocol version the host accepts.  Host mode (device number 0)
/// first appeared in version 3
pub const MIN_PROTOCOL_VERSION: u32 = 3;
/// Number of attempts at reading a valid connection banner before giving up
pub const BANNER_ATTEMPTS: usize = 5;
/// Maximum length of one `\r` terminated line on the link.  A 1541 sector is
/// 256 bytes and every byte may be escaped to two, plus the terminator
pub const MAX_LINE_LENGTH: usize = 512 + 1;

/// Host to transceiver opcodes

/// Reset the IEC bus
pub const CMD_RESET: u8 = b'r';
/// Open a channel on a device: `o <dev> <chan> <len> <cmd[len]>`
pub const CMD_OPEN: u8 = b'o';
/// Close a channel on a device: `c <dev> <chan>`
pub const CMD_CLOSE: u8 = b'c';
/// Read from a channel until EOI: `g <dev> <chan>`
pub const CMD_GET: u8 = b'g';
/// Write one chunk to a channel: `p <dev> <chan> <len> <data[len]>`
pub const CMD_PUT: u8 = b'p';

/// Transceiver to host frame discriminators

/// Debug channel declaration: `!<id><name>\r`
pub const FRAME_CHANNEL_DECL: u8 = b'!';
/// Escaped response payload: `r<payload>\r`
pub const FRAME_RESPONSE: u8 = b'r';
/// Status terminator for the current request: `s<message-or-empty>\r`
pub const FRAME_STATUS: u8 = b's';

/// Payload limits

/// Maximum payload of an open request.  The length travels as one byte and
/// 0 means an empty command string
pub const MAX_OPEN_PAYLOAD: usize = 255;
/// Chunk size for put requests.  The length byte is `len & 0xff`, so a value
/// of 0 on the wire means a full 256 byte chunk
pub const PUT_CHUNK_SIZE: usize = 256;

/// Reference pin assignment sent to the transceiver during the handshake

pub const ATN_PIN: u8 = 5;
pub const CLOCK_PIN: u8 = 4;
pub const DATA_PIN: u8 = 3;
pub const SRQ_IN_PIN: u8 = 6;
pub const RESET_PIN: u8 = 7;

/// The host addresses the bus as device 0.  Device 0 (the keyboard on a real
/// C64) is never a bus peripheral, so the transceiver special cases it to
/// mean "act as the controller"
pub const HOST_DEVICE_NUMBER: u8 = 0;

/// Minimum Commodore peripheral device number.  Lower numbers are reserved
/// for built in devices
pub const MIN_DEVICE_NUM: u8 = 4;
/// Maximum device number settable on Commodore drives
pub const MAX_DEVICE_NUM: u8 = 30;
/// Maximum channel (secondary address) within a device
pub const MAX_CHANNEL_NUM: u8 = 15;
/// The command and status channel of a CBM drive
pub const COMMAND_CHANNEL: u8 = 15;

/// Timeouts and settle times

/// How long the host waits after issuing a bus reset before it collects the
/// response, giving the drive time to run its power on self test
pub const RESET_SETTLE: Duration = Duration::from_secs(2);
/// How long the transceiver holds the RESET line pulled
pub const RESET_HOLD: Duration = Duration::from_millis(100);
/// Pause between programming the tty to 1200 baud (which makes the Arduino
/// auto-reset) and reprogramming it to the target speed
pub const ARDUINO_RESET_SLEEP: Duration = Duration::from_secs(1);

/// Serial speeds the host knows how to program
pub const SUPPORTED_BAUD: &[u32] = &[
    0, 50, 75, 110, 134, 150, 200, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
    230400,
];

/// A CBM-1541 sector
pub const SECTOR_SIZE: usize = 256;
