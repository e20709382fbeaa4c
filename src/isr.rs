//! Interrupt-side delivery of DMA completion events.
//!
//! The SPI completion interrupts belong to the platform, so the platform's
//! handlers are the ones that fire; this module routes them to whichever
//! handle currently owns the SPI peripheral. Register the handle's event
//! block once after construction:
//!
//! ```rust,ignore
//! static CARD: StaticCell<SdCard<MySpi, MyPin, MyDelay>> = ...;
//! let card = CARD.init(SdCard::new(spi, cs, delay, Config::default()));
//! embedded_sdspi::isr::bind(card.events());
//! ```
//!
//! and call the three hooks from the matching interrupt handlers:
//!
//! ```rust,ignore
//! #[interrupt]
//! fn SPI2_TX_DMA() {
//!     embedded_sdspi::isr::on_transmit_complete();
//! }
//! ```
//!
//! The hooks are cheap, ISR-safe, and do nothing while no owner is bound.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::sdcard::bus::TransferEvents;

static OWNER: Mutex<CriticalSectionRawMutex, Cell<Option<&'static TransferEvents>>> =
    Mutex::new(Cell::new(None));

/// Register the handle that owns SPI completion events.
///
/// One handle at a time; binding again replaces the previous owner. Only
/// needed when the [`SdSpiBus`](crate::SdSpiBus) port completes DMA
/// transfers from interrupt handlers.
pub fn bind(events: &'static TransferEvents) {
    OWNER.lock(|owner| owner.set(Some(events)));
}

/// Release the owner registration, e.g. before tearing the handle down.
/// Completion interrupts arriving afterwards are dropped.
pub fn unbind() {
    OWNER.lock(|owner| owner.set(None));
}

fn with_owner(f: impl FnOnce(&TransferEvents)) {
    if let Some(events) = OWNER.lock(|owner| owner.get()) {
        f(events);
    }
}

/// Call from the transmit-complete (TX DMA done) interrupt handler.
pub fn on_transmit_complete() {
    with_owner(|events| events.signal_transmit_done());
}

/// Call from the receive-complete (RX DMA done) interrupt handler. Also
/// the right hook for the completion of a full-duplex transfer.
pub fn on_receive_complete() {
    with_owner(|events| events.signal_receive_done());
}

/// Call from the SPI/DMA error interrupt handler. Wakes waiters on both
/// transfer directions so nobody sleeps through a dead transfer.
pub fn on_transfer_error() {
    with_owner(|events| events.signal_fault());
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
