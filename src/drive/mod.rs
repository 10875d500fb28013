//! Sector level access to drives and drive images.
//!
//! [`SectorDevice`] is the common interface: a physical drive on the bus
//! ([`Cbm1541Drive`]) and a `.d64` image file ([`ImageD64`]) expose the same
//! flat, 256 byte sector address space, which is all the disc copy tool
//! needs.

pub mod cbm1541;
pub mod d64;

pub use cbm1541::Cbm1541Drive;
pub use d64::ImageD64;

use crate::error::{Error, Result};

use std::fmt;

/// A device addressable as a flat array of 256 byte sectors.
pub trait SectorDevice {
    /// Total number of sectors on the device.
    fn num_sectors(&mut self) -> Result<usize>;

    /// Read one sector.  The result is always 256 bytes.
    fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>>;

    /// Write one sector.  `data` must be exactly 256 bytes.
    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<()>;

    /// Erase and lay down a fresh low level format covering `tracks`
    /// tracks (35 or 40).
    fn format_low_level(&mut self, tracks: usize) -> Result<()>;
}

/// CBM 1541 disk geometry: sectors per track by zone.
///
/// Tracks are numbered from 1.  Flat sector numbers count from track 1
/// sector 0 upwards.
pub mod geometry {
    /// Standard number of tracks on a 1541 disc
    pub const TRACKS_STANDARD: usize = 35;
    /// Extended 40 track format
    pub const TRACKS_EXTENDED: usize = 40;

    /// Number of sectors on `track` (1-based), or 0 for an invalid track.
    pub const fn sectors_in_track(track: usize) -> usize {
        match track {
            1..=17 => 21,
            18..=24 => 19,
            25..=30 => 18,
            31..=40 => 17,
            _ => 0,
        }
    }

    /// Total sectors on a disc with the given number of tracks.
    pub const fn sector_count(tracks: usize) -> usize {
        let mut total = 0;
        let mut track = 1;
        while track <= tracks {
            total += sectors_in_track(track);
            track += 1;
        }
        total
    }

    /// Map a flat sector number onto (track, sector), if it is on the disc.
    pub fn track_and_sector(mut sector: usize) -> Option<(u8, u8)> {
        for track in 1..=TRACKS_EXTENDED {
            let count = sectors_in_track(track);
            if sector < count {
                return Some((track as u8, sector as u8));
            }
            sector -= count;
        }
        None
    }
}

/// A parsed DOS status message from the drive's command channel, of the
/// form `"00, OK,00,00"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveStatus {
    pub code: u8,
    pub message: String,
    pub track: u8,
    pub sector: u8,
}

impl DriveStatus {
    /// Parse a raw status string.  Tolerates trailing terminators and
    /// whitespace around the fields.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = raw.splitn(4, ',').collect();
        if fields.len() != 4 {
            return Err(Error::Iec {
                message: format!("malformed drive status: '{raw}'"),
            });
        }
        let parse_num = |field: &str| -> Result<u8> {
            field.trim().parse().map_err(|_| Error::Iec {
                message: format!("malformed drive status: '{raw}'"),
            })
        };
        Ok(DriveStatus {
            code: parse_num(fields[0])?,
            message: fields[1].trim().to_string(),
            track: parse_num(fields[2])?,
            sector: parse_num(fields[3])?,
        })
    }

    /// Codes from 20 up are errors; below that the drive is reporting
    /// success or activity.
    pub fn is_error(&self) -> bool {
        self.code >= 20
    }

    /// Code 73 is the DOS version banner the drive queues after power-on
    /// or reset; an error by number, but expected in that one situation.
    pub fn is_power_on_banner(&self) -> bool {
        self.code == 73
    }

    pub(crate) fn into_error(self) -> Error {
        Error::Drive {
            code: self.code,
            message: self.message,
            track: self.track,
            sector: self.sector,
        }
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02},{},{:02},{:02}",
            self.code, self.message, self.track, self.sector
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_counts() {
        assert_eq!(geometry::sector_count(geometry::TRACKS_STANDARD), 683);
        assert_eq!(geometry::sector_count(geometry::TRACKS_EXTENDED), 768);
    }

    #[test]
    fn test_track_and_sector_mapping() {
        assert_eq!(geometry::track_and_sector(0), Some((1, 0)));
        assert_eq!(geometry::track_and_sector(20), Some((1, 20)));
        assert_eq!(geometry::track_and_sector(21), Some((2, 0)));
        // First sector of track 18 (the directory track): 17 * 21 = 357.
        assert_eq!(geometry::track_and_sector(357), Some((18, 0)));
        assert_eq!(geometry::track_and_sector(682), Some((35, 16)));
        assert_eq!(geometry::track_and_sector(768), None);
    }

    #[test]
    fn test_status_parse_ok() {
        let status = DriveStatus::parse("00, OK,00,00").unwrap();
        assert_eq!(status.code, 0);
        assert_eq!(status.message, "OK");
        assert!(!status.is_error());
    }

    #[test]
    fn test_status_parse_error() {
        let status = DriveStatus::parse("21,READ ERROR,18,04").unwrap();
        assert!(status.is_error());
        assert_eq!(status.track, 18);
        assert_eq!(status.sector, 4);
        assert_eq!(
            status.into_error(),
            Error::Drive {
                code: 21,
                message: "READ ERROR".to_string(),
                track: 18,
                sector: 4,
            }
        );
    }

    #[test]
    fn test_status_parse_power_on_banner() {
        let status = DriveStatus::parse("73,CBM DOS V2.6 1541,00,00\r").unwrap();
        assert_eq!(status.code, 73);
        assert!(status.is_power_on_banner());
    }

    #[test]
    fn test_status_parse_rejects_garbage() {
        assert!(DriveStatus::parse("not a status").is_err());
        assert!(DriveStatus::parse("xx,OK,00,00").is_err());
    }
}
