//! The five-operation block-device bridge a FAT layer consumes.
//!
//! This is the Rust rendering of the classic `diskio` contract: `status`,
//! `initialize`, `read`, `write` and `ioctl` on a drive number. Exactly one
//! drive (number 0) is supported; it is backed by whichever device was
//! handed to [`register_drive`], normally a `'static` [`SdCard`].
//!
//! ```rust,ignore
//! static CARD: StaticCell<SdCard<MySpi, MyPin, MyDelay>> = ...;
//! let card = CARD.init(SdCard::new(spi, cs, delay, Config::default()));
//! embedded_sdspi::diskio::register_drive(card);
//!
//! if embedded_sdspi::diskio::disk_initialize(0).is_empty() {
//!     // mount the filesystem
//! }
//! ```

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::blockdevice::Block;
use crate::sdcard::bus::SdSpiBus;
use crate::sdcard::{Error, SdCard};

bitflags::bitflags! {
    /// The drive status bitfield, as a FAT layer expects it. An empty set
    /// means the drive is initialised and ready.
    pub struct DiskStatus: u8 {
        /// The drive has not been initialised
        const NO_INIT = 0x01;
        /// No medium in the drive
        const NO_DISK = 0x02;
    }
}

/// The result of a bridge operation.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskResult {
    /// The operation succeeded
    Ok,
    /// A hard read/write/protocol error
    Error,
    /// The drive is absent, uninitialised or locked by another task
    NotReady,
    /// Invalid drive number, command or buffer
    ParamError,
}

/// Flush any pending writes on the medium
pub const CTRL_SYNC: u8 = 0;
/// Retrieve the number of sectors on the medium
pub const GET_SECTOR_COUNT: u8 = 1;
/// Retrieve the sector size in bytes (always 512 here)
pub const GET_SECTOR_SIZE: u8 = 2;
/// Retrieve the erase unit size in sectors (always 1 here)
pub const GET_BLOCK_SIZE: u8 = 3;

/// What the bridge needs from a drive. Implemented by [`SdCard`]; an
/// in-RAM fake works for tests.
pub trait DiskDevice: Sync {
    /// Presence and initialisation state, without touching the medium.
    fn disk_status(&self) -> DiskStatus;
    /// Run the initialisation sequence and report the resulting status.
    fn disk_initialize(&self) -> DiskStatus;
    /// Read whole sectors into `buf` (a non-empty multiple of 512 bytes).
    fn disk_read(&self, buf: &mut [u8], start_sector: u32) -> Result<(), Error>;
    /// Write whole sectors from `buf` (a non-empty multiple of 512 bytes).
    fn disk_write(&self, buf: &[u8], start_sector: u32) -> Result<(), Error>;
    /// Wait out any background programming.
    fn disk_sync(&self) -> Result<(), Error>;
    /// Capacity in sectors, zero when unknown.
    fn disk_capacity_blocks(&self) -> u32;
}

impl<SPI, CS, D, CD> DiskDevice for SdCard<SPI, CS, D, CD>
where
    SPI: SdSpiBus + Send,
    CS: OutputPin + Send,
    D: DelayNs + Clone + Sync,
    CD: InputPin + Send,
{
    fn disk_status(&self) -> DiskStatus {
        let mut status = DiskStatus::empty();
        match self.card_present() {
            Ok(true) => {}
            // An empty slot is also, for the FAT layer's purposes, not
            // initialised; an unanswerable probe is reported the same way
            Ok(false) => status |= DiskStatus::NO_DISK | DiskStatus::NO_INIT,
            Err(_) => status |= DiskStatus::NO_INIT,
        }
        if !self.is_initialized() {
            status |= DiskStatus::NO_INIT;
        }
        status
    }

    fn disk_initialize(&self) -> DiskStatus {
        let _ = self.initialize();
        self.disk_status()
    }

    fn disk_read(&self, buf: &mut [u8], start_sector: u32) -> Result<(), Error> {
        self.read(buf, start_sector)
    }

    fn disk_write(&self, buf: &[u8], start_sector: u32) -> Result<(), Error> {
        self.write(buf, start_sector)
    }

    fn disk_sync(&self) -> Result<(), Error> {
        self.sync()
    }

    fn disk_capacity_blocks(&self) -> u32 {
        self.capacity_blocks()
    }
}

static DRIVE0: Mutex<CriticalSectionRawMutex, Cell<Option<&'static dyn DiskDevice>>> =
    Mutex::new(Cell::new(None));

/// Install the device backing drive 0. Registering again replaces the
/// previous device.
pub fn register_drive(device: &'static dyn DiskDevice) {
    DRIVE0.lock(|slot| slot.set(Some(device)));
}

/// Remove the device backing drive 0. Subsequent bridge calls report an
/// absent, uninitialised drive.
pub fn unregister_drive() {
    DRIVE0.lock(|slot| slot.set(None));
}

fn drive0() -> Option<&'static dyn DiskDevice> {
    DRIVE0.lock(|slot| slot.get())
}

fn map_error(e: Error) -> DiskResult {
    match e {
        Error::NoMedia | Error::Busy => DiskResult::NotReady,
        Error::InvalidParam => DiskResult::ParamError,
        _ => DiskResult::Error,
    }
}

fn map_result(result: Result<(), Error>) -> DiskResult {
    match result {
        Ok(()) => DiskResult::Ok,
        Err(e) => map_error(e),
    }
}

/// The drive status bitfield for the given drive number.
pub fn disk_status(drive: u8) -> DiskStatus {
    match (drive, drive0()) {
        (0, Some(device)) => device.disk_status(),
        _ => DiskStatus::NO_INIT | DiskStatus::NO_DISK,
    }
}

/// Initialise the given drive and report its status.
pub fn disk_initialize(drive: u8) -> DiskStatus {
    match (drive, drive0()) {
        (0, Some(device)) => device.disk_initialize(),
        _ => DiskStatus::NO_INIT | DiskStatus::NO_DISK,
    }
}

/// Read `count` sectors into `buf`, starting at `sector`.
///
/// `buf` must be exactly `count * 512` bytes.
pub fn disk_read(drive: u8, buf: &mut [u8], sector: u32, count: u32) -> DiskResult {
    if drive != 0 {
        return DiskResult::ParamError;
    }
    if count == 0 || buf.len() != count as usize * Block::LEN {
        return DiskResult::ParamError;
    }
    let Some(device) = drive0() else {
        return DiskResult::NotReady;
    };
    if device
        .disk_status()
        .intersects(DiskStatus::NO_INIT | DiskStatus::NO_DISK)
    {
        return DiskResult::NotReady;
    }
    map_result(device.disk_read(buf, sector))
}

/// Write `count` sectors from `buf`, starting at `sector`.
///
/// `buf` must be exactly `count * 512` bytes.
pub fn disk_write(drive: u8, buf: &[u8], sector: u32, count: u32) -> DiskResult {
    if drive != 0 {
        return DiskResult::ParamError;
    }
    if count == 0 || buf.len() != count as usize * Block::LEN {
        return DiskResult::ParamError;
    }
    let Some(device) = drive0() else {
        return DiskResult::NotReady;
    };
    if device
        .disk_status()
        .intersects(DiskStatus::NO_INIT | DiskStatus::NO_DISK)
    {
        return DiskResult::NotReady;
    }
    map_result(device.disk_write(buf, sector))
}

/// Drive control. `out` receives the queried value for the `GET_*`
/// commands and is left alone otherwise. Unknown commands report
/// [`DiskResult::ParamError`].
pub fn disk_ioctl(drive: u8, command: u8, out: &mut u32) -> DiskResult {
    if drive != 0 {
        return DiskResult::ParamError;
    }
    let Some(device) = drive0() else {
        return DiskResult::NotReady;
    };
    match command {
        CTRL_SYNC => map_result(device.disk_sync()),
        GET_SECTOR_COUNT => {
            let capacity = device.disk_capacity_blocks();
            if capacity == 0 {
                return DiskResult::Error;
            }
            *out = capacity;
            DiskResult::Ok
        }
        GET_SECTOR_SIZE => {
            *out = Block::LEN_U32;
            DiskResult::Ok
        }
        GET_BLOCK_SIZE => {
            // Erase unit, in sectors
            *out = 1;
            DiskResult::Ok
        }
        _ => DiskResult::ParamError,
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
