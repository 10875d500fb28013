//! Host transport tests against a scripted transceiver.
//!
//! Each test owns both ends of a socketpair: the host side goes into a
//! [`Bus`], the other side is driven byte by byte from a script thread
//! playing the transceiver's role.

use ard1541::{Bus, BusBuilder, DeviceChannel, Error};

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const BANNER: &[u8] = b"connect_arduino:3\r";

/// The scripted transceiver end of the link.
struct Mcu {
    stream: UnixStream,
}

impl Mcu {
    fn read_line(&mut self) -> Vec<u8> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).unwrap();
            if byte[0] == b'\r' {
                return line;
            }
            line.push(byte[0]);
        }
    }

    fn read_exact_n(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn expect(&mut self, expected: &[u8]) {
        let got = self.read_exact_n(expected.len());
        assert_eq!(got, expected, "unexpected request bytes on the wire");
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Serve the connection handshake: banner out, configuration line in.
    fn handshake(&mut self) {
        self.send(BANNER);
        let config = self.read_line();
        assert!(
            config.starts_with(b"OK>0|5|4|3|7|6|"),
            "unexpected configuration line: {:?}",
            String::from_utf8_lossy(&config)
        );
    }
}

/// Spawn a script thread and return an initialized [`Bus`] talking to it.
fn connect<F>(script: F) -> (Bus, JoinHandle<()>)
where
    F: FnOnce(&mut Mcu) + Send + 'static,
{
    let (host_end, mcu_end) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || {
        let mut mcu = Mcu { stream: mcu_end };
        script(&mut mcu);
    });
    let mut bus = BusBuilder::new().stream(host_end).build().unwrap();
    bus.initialize().unwrap();
    (bus, handle)
}

#[test]
fn test_reset_round_trip() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(b"r");
        mcu.send(b"s\r");
    });
    bus.reset().unwrap();
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_open_channel_wire_format() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'o', 0x09, 0x0f, 0x02, b'I', b'0']);
        mcu.send(b"s\r");
    });
    bus.open_channel(DeviceChannel::new(9, 15).unwrap(), b"I0")
        .unwrap();
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_read_from_channel() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'g', 0x09, 0x0f]);
        mcu.send(b"rDRIVE OK\r");
        mcu.send(b"s\r");
    });
    let data = bus
        .read_from_channel(DeviceChannel::new(9, 15).unwrap())
        .unwrap();
    assert_eq!(data, b"DRIVE OK");
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_write_chunking() {
    let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();

    let (bus, mcu) = connect(move |mcu| {
        mcu.handshake();
        // 300 bytes split as 256 + 44; a full chunk's length byte is 0.
        mcu.expect(&[b'p', 0x09, 0x02, 0x00]);
        let first = mcu.read_exact_n(256);
        mcu.send(b"s\r");
        mcu.expect(&[b'p', 0x09, 0x02, 44]);
        let second = mcu.read_exact_n(44);
        mcu.send(b"s\r");

        let mut reassembled = first;
        reassembled.extend_from_slice(&second);
        assert_eq!(reassembled, expected);
    });
    bus.write_to_channel(DeviceChannel::new(9, 2).unwrap(), &data)
        .unwrap();
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_error_status_reported_verbatim() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'g', 0x09, 0x0f]);
        // Status error with no preceding response frame.
        mcu.send(b"s41,FILE NOT FOUND,18,00\r");
    });
    let result = bus.read_from_channel(DeviceChannel::new(9, 15).unwrap());
    assert_eq!(
        result,
        Err(Error::Iec {
            message: "41,FILE NOT FOUND,18,00".to_string()
        })
    );
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_log_callback_fires_during_request() {
    let (host_end, mcu_end) = UnixStream::pair().unwrap();
    let logs: Arc<Mutex<Vec<(char, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = logs.clone();

    let mcu = thread::spawn(move || {
        let mut mcu = Mcu { stream: mcu_end };
        mcu.handshake();
        mcu.expect(&[b'o', 0x09, 0x0f, 0x02, b'I', b'0']);
        mcu.send(b"!ACLIENT\r");
        mcu.send(b"DAhello\r");
        mcu.send(b"s\r");
    });

    let mut bus = BusBuilder::new()
        .stream(host_end)
        .log_callback(Box::new(move |level, channel, message| {
            sink.lock()
                .unwrap()
                .push((level, channel.to_string(), message.to_string()));
        }))
        .build()
        .unwrap();
    bus.initialize().unwrap();
    bus.open_channel(DeviceChannel::new(9, 15).unwrap(), b"I0")
        .unwrap();

    let logs = logs.lock().unwrap();
    assert!(
        logs.contains(&('D', "CLIENT".to_string(), "hello".to_string())),
        "log callback did not observe the debug frame: {logs:?}"
    );
    drop(logs);
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_correlation_last_response_wins() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'g', 0x08, 0x0f]);
        mcu.send(b"rfirst\r");
        mcu.send(b"rsecond\r");
        mcu.send(b"s\r");
    });
    let data = bus
        .read_from_channel(DeviceChannel::new(8, 15).unwrap())
        .unwrap();
    assert_eq!(data, b"second");
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_log_frames_do_not_disturb_correlation() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'g', 0x08, 0x0f]);
        mcu.send(b"!BIEC\r");
        mcu.send(b"IBstarting read\r");
        mcu.send(b"rpayload\r");
        mcu.send(b"WBbus is slow today\r");
        mcu.send(b"EBnot really an error\r");
        mcu.send(b"s\r");
        // A second request proves the first future resolved exactly once.
        mcu.expect(&[b'g', 0x08, 0x0f]);
        mcu.send(b"rafter\r");
        mcu.send(b"s\r");
    });
    let dc = DeviceChannel::new(8, 15).unwrap();
    assert_eq!(bus.read_from_channel(dc).unwrap(), b"payload");
    assert_eq!(bus.read_from_channel(dc).unwrap(), b"after");
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_response_payload_is_unescaped() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'g', 0x08, 0x02]);
        // Payload "a\rb\x1bc" with 0x0d -> 1b 4d and 0x1b -> 1b 5b.
        mcu.send(b"ra\x1b\x4db\x1b\x5bc\r");
        mcu.send(b"s\r");
    });
    let data = bus
        .read_from_channel(DeviceChannel::new(8, 2).unwrap())
        .unwrap();
    assert_eq!(data, b"a\rb\x1bc");
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_banner_retry_succeeds_on_fifth_line() {
    let (host_end, mcu_end) = UnixStream::pair().unwrap();
    let mcu = thread::spawn(move || {
        let mut mcu = Mcu { stream: mcu_end };
        for _ in 0..4 {
            mcu.send(b"bootloader noise\r");
        }
        mcu.send(BANNER);
        let _config = mcu.read_line();
    });
    let mut bus = BusBuilder::new().stream(host_end).build().unwrap();
    bus.initialize().unwrap();
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_banner_retry_gives_up_after_five_lines() {
    let (host_end, mcu_end) = UnixStream::pair().unwrap();
    let mcu = thread::spawn(move || {
        let mut mcu = Mcu { stream: mcu_end };
        for _ in 0..5 {
            mcu.send(b"bootloader noise\r");
        }
    });
    let mut bus = BusBuilder::new().stream(host_end).build().unwrap();
    assert!(matches!(
        bus.initialize(),
        Err(Error::Connection { .. })
    ));
    mcu.join().unwrap();
}

#[test]
fn test_protocol_version_below_minimum_rejected() {
    let (host_end, mcu_end) = UnixStream::pair().unwrap();
    let mcu = thread::spawn(move || {
        let mut mcu = Mcu { stream: mcu_end };
        mcu.send(b"connect_arduino:2\r");
    });
    let mut bus = BusBuilder::new().stream(host_end).build().unwrap();
    assert!(matches!(
        bus.initialize(),
        Err(Error::Connection { .. })
    ));
    mcu.join().unwrap();
}

#[test]
fn test_reader_death_fails_outstanding_request() {
    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        mcu.expect(&[b'g', 0x08, 0x0f]);
        // Drop the stream without answering.
    });
    let start = Instant::now();
    let result = bus.read_from_channel(DeviceChannel::new(8, 15).unwrap());
    assert!(matches!(result, Err(Error::Connection { .. })));
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "caller must not wait forever"
    );
    drop(bus);
    mcu.join().unwrap();
}

#[test]
fn test_shutdown_is_prompt() {
    let (host_end, mcu_end) = UnixStream::pair().unwrap();
    let mcu = thread::spawn(move || {
        let mut mcu = Mcu { stream: mcu_end };
        mcu.handshake();
        // Hold the stream open until the host hangs up.
        let mut byte = [0u8; 1];
        let _ = mcu.stream.read(&mut byte);
    });
    let mut bus = BusBuilder::new().stream(host_end).build().unwrap();
    bus.initialize().unwrap();

    let start = Instant::now();
    drop(bus);
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "drop must wake and join the reader promptly"
    );
    mcu.join().unwrap();
}

#[test]
fn test_concurrent_writes_are_serialized_on_the_wire() {
    let data_a: Vec<u8> = vec![0xaa; 300];
    let data_b: Vec<u8> = vec![0xbb; 300];

    let (bus, mcu) = connect(|mcu| {
        mcu.handshake();
        // Four put requests arrive: two chunks per operation.  All of one
        // operation's chunks must land before the other's.
        let mut order = Vec::new();
        for _ in 0..4 {
            let header = mcu.read_exact_n(4);
            assert_eq!(header[0], b'p');
            let len = match header[3] {
                0 => 256,
                n => n as usize,
            };
            let _payload = mcu.read_exact_n(len);
            order.push(header[2]); // channel number
            mcu.send(b"s\r");
        }
        assert!(
            order == [2, 2, 3, 3] || order == [3, 3, 2, 2],
            "chunks of concurrent writes interleaved: {order:?}"
        );
    });

    let bus = Arc::new(bus);
    let bus_a = bus.clone();
    let bus_b = bus.clone();
    let writer_a = thread::spawn(move || {
        bus_a
            .write_to_channel(DeviceChannel::new(9, 2).unwrap(), &data_a)
            .unwrap();
    });
    let writer_b = thread::spawn(move || {
        bus_b
            .write_to_channel(DeviceChannel::new(9, 3).unwrap(), &data_b)
            .unwrap();
    });
    writer_a.join().unwrap();
    writer_b.join().unwrap();
    drop(bus);
    mcu.join().unwrap();
}
