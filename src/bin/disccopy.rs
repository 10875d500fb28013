//! Copy a `.d64` disk image onto a physical drive over the IEC bus.
//!
//! Connects to the serial transceiver, resets the bus, optionally formats
//! the target disc, then writes the image sector by sector with an optional
//! verify pass.
//!
//! All logging goes to stderr and is controlled via the `RUST_LOG`
//! environment variable; user facing progress goes to stdout.  Exits 0 on
//! success, 1 with a message on any failure.
use ard1541::constants::COMMAND_CHANNEL;
use ard1541::drive::{geometry, Cbm1541Drive, ImageD64, SectorDevice};
use ard1541::{BusBuilder, DeviceChannel, Error};

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

#[derive(Parser)]
#[command(author, version, about = "IEC bus disc copy utility")]
struct Args {
    /// Serial interface to use
    #[arg(long, default_value = "/dev/ttyUSB0")]
    serial: String,

    /// Baud rate
    #[arg(long, default_value_t = 57600)]
    speed: u32,

    /// Disk image to copy from
    #[arg(long)]
    source: String,

    /// Device to copy to
    #[arg(long, default_value_t = 9)]
    target: u8,

    /// Format the disc prior to copying
    #[arg(long)]
    format: bool,

    /// Verify the copy sector by sector
    #[arg(long)]
    verify: bool,
}

fn bytes_to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn execute(args: &Args) -> Result<(), Error> {
    let mut bus = BusBuilder::new()
        .path(&args.serial)
        .speed(args.speed)
        .build()?;
    bus.initialize()?;
    bus.reset()?;

    // The command channel needs no open call; reading it drains the
    // drive's queued status, normally the power-on banner after a reset.
    let command_channel = DeviceChannel::new(args.target, COMMAND_CHANNEL)?;
    let status = bus.read_from_channel(command_channel)?;
    println!(
        "Initial drive status: {}",
        String::from_utf8_lossy(&status).trim_end()
    );

    println!("Opening source '{}'.", args.source);
    let mut reader = ImageD64::open(&args.source, true)?;

    let mut drive = Cbm1541Drive::new(&bus, args.target)?;
    if args.format {
        println!("Formatting disc...");
        drive.format_low_level(geometry::TRACKS_STANDARD)?;
        println!("Formatting complete.");
    }

    let num_sectors = reader.num_sectors()?;
    for sector in 0..num_sectors {
        let data = reader.read_sector(sector)?;
        drive.write_sector(sector, &data)?;

        if args.verify {
            let readback = drive.read_sector(sector)?;
            if readback != data {
                println!("Verification failed (sector {sector}):");
                println!("Original sector ({} bytes):", data.len());
                println!("{}", bytes_to_hex(&data));
                println!("Read sector ({} bytes):", readback.len());
                println!("{}", bytes_to_hex(&readback));
            }
        }
    }
    drop(drive);

    let status = bus.read_from_channel(command_channel)?;
    println!(
        "Copying status: {}",
        String::from_utf8_lossy(&status).trim_end()
    );
    Ok(())
}

fn main() {
    env_logger::init();
    println!("IEC Bus disc copy utility.");
    println!();

    let args = Args::parse();
    match execute(&args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            println!("{e}");
            std::process::exit(1);
        }
    }
}
