//! End-to-end test: a real `Bus` talking through a `Transceiver` to a
//! simulated drive, with every byte travelling the full path: framed
//! serial link, ATN sequences, three-wire handshake on the software bus.

use ard1541::protocol::sim::{SimBus, SimPort};
use ard1541::protocol::{
    AtnCheck, AtnCmd, IecDriver, IecTiming, Transceiver, ATN_CODE_CLOSE, ATN_CODE_DATA,
    ATN_CODE_OPEN,
};
use ard1541::{BusBuilder, DeviceChannel};

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DRIVE_DEVICE: u8 = 8;

/// Everything the simulated drive observed, for the test to assert on.
#[derive(Default)]
struct DriveState {
    /// Channel number -> payload received with each OPEN
    opens: Mutex<HashMap<u8, Vec<u8>>>,
    /// Data received on data channels
    received: Mutex<Vec<u8>>,
    resets: AtomicUsize,
}

/// A minimal 1541 stand-in: answers ATN, stores what it is sent, and
/// serves a canned status string on the command channel.
fn sim_drive(port: SimPort, state: Arc<DriveState>, stop: Arc<AtomicBool>) {
    let mut driver = IecDriver::with_timing(port, DRIVE_DEVICE, IecTiming::relaxed());
    let mut cmd = AtnCmd::new();
    let status = b"00, OK,00,00";

    while !stop.load(Ordering::Relaxed) {
        match driver.check_atn(&mut cmd) {
            AtnCheck::Idle => thread::sleep(Duration::from_millis(1)),
            AtnCheck::Cmd => {}
            AtnCheck::CmdListen => {
                match cmd.class() {
                    ATN_CODE_OPEN => {
                        let data = receive_until_end(&mut driver);
                        state.opens.lock().unwrap().insert(cmd.number(), data);
                    }
                    ATN_CODE_DATA => {
                        let data = receive_until_end(&mut driver);
                        state.received.lock().unwrap().extend(data);
                    }
                    ATN_CODE_CLOSE => {}
                    _ => {}
                }
                driver.release_all();
            }
            AtnCheck::CmdTalk => {
                if cmd.class() == ATN_CODE_DATA && cmd.number() == 15 {
                    let (last, head) = status.split_last().unwrap();
                    let mut ok = true;
                    for &byte in head {
                        if driver.send(byte).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    if ok {
                        let _ = driver.send_eoi(*last);
                    }
                }
            }
            AtnCheck::Error => driver.release_all(),
            AtnCheck::Reset => {
                state.resets.fetch_add(1, Ordering::Relaxed);
                // check_atn already dropped all lines; wait out the pulse.
                while driver.check_reset() && !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

fn receive_until_end(driver: &mut IecDriver<SimPort>) -> Vec<u8> {
    let mut data = Vec::new();
    loop {
        match driver.receive() {
            Ok(byte) => {
                data.push(byte);
                if driver.eoi() {
                    return data;
                }
            }
            // EOI or attention both end the transfer; attention is how
            // un-terminated chunks finish.
            Err(_) => return data,
        }
    }
}

struct Stack {
    state: Arc<DriveState>,
    stop: Arc<AtomicBool>,
    transceiver: JoinHandle<std::io::Result<()>>,
    drive: JoinHandle<()>,
}

fn start_stack() -> (ard1541::Bus, Stack) {
    let bus = SimBus::new();
    let controller_port = bus.port();
    let drive_port = bus.port();

    let (host_end, mcu_end) = UnixStream::pair().unwrap();

    let transceiver = thread::spawn(move || {
        let driver = IecDriver::with_timing(controller_port, 0, IecTiming::relaxed());
        Transceiver::new(mcu_end, driver).run()
    });

    let state = Arc::new(DriveState::default());
    let stop = Arc::new(AtomicBool::new(false));
    let drive = {
        let state = state.clone();
        let stop = stop.clone();
        thread::spawn(move || sim_drive(drive_port, state, stop))
    };

    let mut host = BusBuilder::new().stream(host_end).build().unwrap();
    host.initialize().unwrap();

    (
        host,
        Stack {
            state,
            stop,
            transceiver,
            drive,
        },
    )
}

#[test]
fn test_full_stack_open_read_write_close() {
    let (host, stack) = start_stack();
    let buffer_channel = DeviceChannel::new(DRIVE_DEVICE, 2).unwrap();
    let command_channel = DeviceChannel::new(DRIVE_DEVICE, 15).unwrap();

    // Open a buffer channel; the drive should see the '#' payload.
    host.open_channel(buffer_channel, b"#").unwrap();
    assert_eq!(
        stack.state.opens.lock().unwrap().get(&2),
        Some(&b"#".to_vec())
    );

    // Read the drive status through the whole stack.
    let status = host.read_from_channel(command_channel).unwrap();
    assert_eq!(status, b"00, OK,00,00");

    // Write data; the drive reassembles it from the un-terminated chunk.
    host.write_to_channel(buffer_channel, b"HELLO").unwrap();
    assert_eq!(*stack.state.received.lock().unwrap(), b"HELLO".to_vec());

    host.close_channel(buffer_channel).unwrap();

    // Tear down: dropping the host closes the serial stream, which ends
    // the transceiver loop.
    drop(host);
    stack.transceiver.join().unwrap().unwrap();
    stack.stop.store(true, Ordering::Relaxed);
    stack.drive.join().unwrap();
}

#[test]
fn test_full_stack_reset_reaches_the_drive() {
    let (host, stack) = start_stack();

    host.reset().unwrap();
    assert!(
        stack.state.resets.load(Ordering::Relaxed) >= 1,
        "drive never observed the RESET pulse"
    );

    drop(host);
    stack.transceiver.join().unwrap().unwrap();
    stack.stop.store(true, Ordering::Relaxed);
    stack.drive.join().unwrap();
}
