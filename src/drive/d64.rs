//! `.d64` disk images as [`SectorDevice`]s.
//!
//! A `.d64` file is the raw sector dump of a 1541 disc: 683 sectors of 256
//! bytes for the standard 35 track format, 768 for the 40 track variant,
//! stored in flat track order.  That makes the sector interface a straight
//! seek-and-copy.

use crate::constants::SECTOR_SIZE;
use crate::drive::{geometry, SectorDevice};
use crate::error::{Error, Result};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Byte size of a standard 35 track image.
const SIZE_35_TRACK: u64 = (geometry::sector_count(geometry::TRACKS_STANDARD) * SECTOR_SIZE) as u64;
/// Byte size of a 40 track image.
const SIZE_40_TRACK: u64 = (geometry::sector_count(geometry::TRACKS_EXTENDED) * SECTOR_SIZE) as u64;

/// A read/write view of a `.d64` image file.
pub struct ImageD64 {
    file: File,
    read_only: bool,
    num_sectors: usize,
}

impl ImageD64 {
    /// Open an existing image.  The file size must match one of the two
    /// known formats; images with appended error info bytes are not
    /// supported.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| Error::Image {
                message: format!("open(\"{}\"): {e}", path.display()),
            })?;
        let len = file
            .metadata()
            .map_err(|e| Error::Image {
                message: format!("stat(\"{}\"): {e}", path.display()),
            })?
            .len();

        let num_sectors = match len {
            SIZE_35_TRACK => geometry::sector_count(geometry::TRACKS_STANDARD),
            SIZE_40_TRACK => geometry::sector_count(geometry::TRACKS_EXTENDED),
            other => {
                return Err(Error::Image {
                    message: format!(
                        "'{}' is {other} bytes; not a 35 or 40 track image",
                        path.display()
                    ),
                })
            }
        };

        debug!(
            "Opened image '{}': {num_sectors} sectors{}",
            path.display(),
            if read_only { ", read only" } else { "" }
        );
        Ok(ImageD64 {
            file,
            read_only,
            num_sectors,
        })
    }

    /// Create a blank, zero filled image with the given track count.
    pub fn create<P: AsRef<Path>>(path: P, tracks: usize) -> Result<Self> {
        let path = path.as_ref();
        let num_sectors = match tracks {
            geometry::TRACKS_STANDARD | geometry::TRACKS_EXTENDED => {
                geometry::sector_count(tracks)
            }
            _ => {
                return Err(Error::Args {
                    message: format!("cannot create a {tracks} track image, only 35 or 40"),
                })
            }
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::Image {
                message: format!("create(\"{}\"): {e}", path.display()),
            })?;
        file.set_len((num_sectors * SECTOR_SIZE) as u64)
            .map_err(|e| Error::Image {
                message: format!("truncate(\"{}\"): {e}", path.display()),
            })?;
        Ok(ImageD64 {
            file,
            read_only: false,
            num_sectors,
        })
    }

    fn seek_to(&mut self, sector: usize) -> Result<()> {
        if sector >= self.num_sectors {
            return Err(Error::Args {
                message: format!(
                    "sector {sector} is beyond the end of the image ({} sectors)",
                    self.num_sectors
                ),
            });
        }
        self.file
            .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .map_err(|e| Error::Image {
                message: format!("seek to sector {sector}: {e}"),
            })?;
        Ok(())
    }
}

impl SectorDevice for ImageD64 {
    fn num_sectors(&mut self) -> Result<usize> {
        Ok(self.num_sectors)
    }

    fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>> {
        self.seek_to(sector)?;
        let mut data = vec![0u8; SECTOR_SIZE];
        self.file.read_exact(&mut data).map_err(|e| Error::Image {
            message: format!("read sector {sector}: {e}"),
        })?;
        Ok(data)
    }

    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Image {
                message: "image is opened read only".to_string(),
            });
        }
        if data.len() != SECTOR_SIZE {
            return Err(Error::Args {
                message: format!(
                    "sector data must be {SECTOR_SIZE} bytes, got {}",
                    data.len()
                ),
            });
        }
        self.seek_to(sector)?;
        self.file.write_all(data).map_err(|e| Error::Image {
            message: format!("write sector {sector}: {e}"),
        })
    }

    fn format_low_level(&mut self, tracks: usize) -> Result<()> {
        if geometry::sector_count(tracks) != self.num_sectors {
            return Err(Error::Args {
                message: format!(
                    "image holds {} sectors; cannot reformat as {tracks} tracks",
                    self.num_sectors
                ),
            });
        }
        if self.read_only {
            return Err(Error::Image {
                message: "image is opened read only".to_string(),
            });
        }
        // A fresh low level format is simply an all zero image.
        let blank = vec![0u8; SECTOR_SIZE];
        for sector in 0..self.num_sectors {
            self.seek_to(sector)?;
            self.file.write_all(&blank).map_err(|e| Error::Image {
                message: format!("write sector {sector}: {e}"),
            })?;
        }
        Ok(())
    }
}
