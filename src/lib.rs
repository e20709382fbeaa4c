//! # embedded-sdspi
//!
//! > An SPI-mode SD card block driver written in Embedded Rust
//!
//! This crate drives an SD card connected to a SPI peripheral and exposes it
//! as a 512-byte block device, suitable for mounting a FAT filesystem on
//! top. It is written in pure-Rust, is `#![no_std]` and does not use `alloc`.
//! It handles the SD-SPI initialisation state machine (idle reset, voltage
//! check, ACMD41 polling, OCR and CSD discovery), single and multi block
//! transfers with bounded retries, and the concurrency glue a firmware
//! integration needs: a timed handle lock that refuses callers in interrupt
//! context, DMA completion signalling from interrupt handlers, and cache
//! maintenance around DMA buffers.
//!
//! ## Using the crate
//!
//! Implement [`SdSpiBus`] for your SPI peripheral (a polled exchange is
//! enough to start with; add the DMA hooks later), then build an [`SdCard`]
//! from the bus, a chip-select pin and a delay source:
//!
//! ```rust,ignore
//! use embedded_sdspi::{Config, SdCard};
//!
//! let card = SdCard::new(spi, cs_pin, delay, Config::default());
//! card.initialize()?;
//! let mut sector = [0u8; 512];
//! card.read(&mut sector, 0)?;
//! ```
//!
//! The [`diskio`] module adapts a `'static` card to the five-operation
//! contract a FAT layer consumes (`disk_status`, `disk_initialize`,
//! `disk_read`, `disk_write`, `disk_ioctl`). The [`isr`] module is where
//! your SPI/DMA interrupt handlers report transfer completion.
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log`
//!   crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod diskio;
pub mod isr;
pub mod sdcard;

#[doc(inline)]
pub use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx};

#[doc(inline)]
pub use crate::sdcard::{
    bus::{BusError, SdSpiBus, TransferEvents},
    CardDetect, CardType, Config, DetectLevel, Error, NoDetect, SdCard, Stats, Status, Timeouts,
};

#[doc(inline)]
pub use crate::diskio::{DiskDevice, DiskResult, DiskStatus};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
