//! The SPI transport seam and the low-level SD protocol primitives.
//!
//! [`SdSpiBus`] is what a platform port implements: a polled full-duplex
//! exchange, plus optional DMA start/abort and cache maintenance hooks.
//! Everything above it - DMA gating, completion waits, command framing,
//! ready/token polling and chip-select bracketing - lives here and is
//! platform independent.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use super::proto::*;
use super::{Error, Timeouts};
use crate::{debug, trace};

/// Ways the platform SPI layer can fail.
///
/// Everything richer a platform knows about the fault is expected to be
/// logged at the platform layer; the driver only needs the classification.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The peripheral reported an error
    Peripheral,
    /// A blocking peripheral operation exceeded its deadline
    Timeout,
}

impl From<BusError> for Error {
    fn from(value: BusError) -> Error {
        match value {
            BusError::Peripheral => Error::Failed,
            BusError::Timeout => Error::Timeout,
        }
    }
}

/// The SPI peripheral binding a platform port provides.
///
/// `exchange` is mandatory and is always enough for a working driver. The
/// DMA methods only need real implementations when the port wants DMA
/// transfers; the driver falls back to `exchange` whenever DMA is disabled
/// in [`Config`](super::Config) or a buffer fails the alignment gate.
///
/// Implementations should bound every blocking peripheral operation by
/// [`Timeouts::spi_io_ms`] and report [`BusError::Timeout`] when exceeded.
pub trait SdSpiBus {
    /// Alignment (in bytes) a buffer must have to be handed to the DMA
    /// engine. 32 on parts with a data cache, 4 otherwise. Must be a power
    /// of two.
    const DMA_ALIGNMENT: usize = 4;

    /// Blocking full-duplex exchange.
    ///
    /// When `tx` is `None` the port must clock out 0xFF filler; when `rx`
    /// is `None` incoming bytes are discarded. `tx` and `rx` are the same
    /// length when both are present.
    fn exchange(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<(), BusError>;

    /// Start a DMA transfer and return immediately.
    ///
    /// Completion is reported by the port's interrupt handlers through
    /// [`crate::isr`] (or by signalling `events` directly). The buffers
    /// stay borrowed by the caller until the matching event fires or
    /// [`SdSpiBus::abort_dma`] returns, so the port may capture their
    /// addresses for the duration of the transfer.
    fn start_dma_exchange(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        events: &TransferEvents,
    ) -> Result<(), BusError> {
        let _ = (tx, rx, events);
        Err(BusError::Peripheral)
    }

    /// Stop an in-flight DMA transfer and return the peripheral to an idle
    /// state. Called when a completion wait times out.
    fn abort_dma(&mut self) {}

    /// Write back the given address range from the data cache so the DMA
    /// engine sees it. The range is already rounded out to
    /// `DMA_ALIGNMENT` boundaries. No-op on cacheless parts.
    fn cache_clean(&self, _addr: usize, _len: usize) {}

    /// Drop the given address range from the data cache so the CPU re-reads
    /// DMA-written memory. The range is already rounded out to
    /// `DMA_ALIGNMENT` boundaries. No-op on cacheless parts.
    fn cache_invalidate(&self, _addr: usize, _len: usize) {}
}

/// DMA completion rendezvous, shared between the initiating task and the
/// SPI/DMA interrupt handlers.
///
/// The initiator clears the flags before starting a transfer and is the
/// only consumer; the interrupt side only ever sets them. A fault raises
/// both done flags as well so a waiter on either direction wakes.
#[derive(Debug, Default)]
pub struct TransferEvents {
    tx_done: AtomicBool,
    rx_done: AtomicBool,
    fault: AtomicBool,
}

impl TransferEvents {
    /// A fresh event block with nothing signalled.
    pub const fn new() -> TransferEvents {
        TransferEvents {
            tx_done: AtomicBool::new(false),
            rx_done: AtomicBool::new(false),
            fault: AtomicBool::new(false),
        }
    }

    /// Signal that the transmit half of a transfer finished. ISR-safe.
    pub fn signal_transmit_done(&self) {
        self.tx_done.store(true, Ordering::Release);
    }

    /// Signal that the receive half of a transfer finished. ISR-safe.
    pub fn signal_receive_done(&self) {
        self.rx_done.store(true, Ordering::Release);
    }

    /// Signal a transfer fault. Releases waiters on both directions.
    /// ISR-safe.
    pub fn signal_fault(&self) {
        self.fault.store(true, Ordering::Release);
        self.tx_done.store(true, Ordering::Release);
        self.rx_done.store(true, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.fault.store(false, Ordering::Release);
        self.tx_done.store(false, Ordering::Release);
        self.rx_done.store(false, Ordering::Release);
    }

    pub(crate) fn transmit_done(&self) -> bool {
        self.tx_done.load(Ordering::Acquire)
    }

    pub(crate) fn receive_done(&self) -> bool {
        self.rx_done.load(Ordering::Acquire)
    }

    pub(crate) fn faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }
}

/// This an object you can use to busy-wait with a deadline.
///
/// Will let you call `tick` once per remaining millisecond of budget before
/// `tick` returns an error; each call burns one millisecond in the delay
/// source.
pub(crate) struct Deadline {
    ms_left: u32,
}

impl Deadline {
    /// Create a new Deadline with the given millisecond budget.
    pub(crate) fn new(ms: u32) -> Deadline {
        Deadline { ms_left: ms }
    }

    /// Wait for a millisecond.
    ///
    /// Checks the remaining budget first, and if it is exhausted the value
    /// `err` is returned. Otherwise we wait for 1 ms and then return
    /// `Ok(())`.
    pub(crate) fn tick<D>(&mut self, delay: &mut D, err: Error) -> Result<(), Error>
    where
        D: DelayNs,
    {
        if self.ms_left == 0 {
            Err(err)
        } else {
            delay.delay_ms(1);
            self.ms_left -= 1;
            Ok(())
        }
    }
}

/// Round an address range out to alignment boundaries for cache
/// maintenance.
fn cache_span(addr: usize, len: usize, align: usize) -> (usize, usize) {
    let start = addr & !(align - 1);
    let end = (addr + len + align - 1) & !(align - 1);
    (start, end - start)
}

/// Which completion event a DMA wait is parked on.
#[derive(Copy, Clone, PartialEq, Eq)]
enum DmaWait {
    TransmitDone,
    ReceiveDone,
}

/// A borrowed transport/protocol session over the locked handle state.
///
/// Holds the bus, the chip select pin and the delay source for the duration
/// of one public operation. All the SD-SPI protocol primitives live here;
/// the state machine and the block engine in the parent module drive them.
pub(crate) struct Io<'a, SPI, CS, D>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    spi: &'a mut SPI,
    cs: &'a mut CS,
    delay: &'a mut D,
    events: &'a TransferEvents,
    timeouts: Timeouts,
    use_dma: bool,
}

impl<'a, SPI, CS, D> Io<'a, SPI, CS, D>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    pub(crate) fn new(
        spi: &'a mut SPI,
        cs: &'a mut CS,
        delay: &'a mut D,
        events: &'a TransferEvents,
        timeouts: Timeouts,
        use_dma: bool,
    ) -> Self {
        Io {
            spi,
            cs,
            delay,
            events,
            timeouts,
            use_dma,
        }
    }

    /// Run `f` with chip select asserted.
    ///
    /// Chip select is released on every exit path, successful or not, and
    /// one trailing 0xFF is clocked out with chip select high to advance
    /// the card's SPI state machine.
    pub(crate) fn with_cs<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.cs.set_low().map_err(|_| Error::Failed)?;
        let result = f(self);
        let released = self.release_cs();
        match result {
            Ok(value) => released.map(|_| value),
            Err(e) => Err(e),
        }
    }

    fn release_cs(&mut self) -> Result<(), Error> {
        let deassert = self.cs.set_high().map_err(|_| Error::Failed);
        let trailing = self.transfer_byte(0xFF).map(|_| ());
        deassert.and(trailing)
    }

    /// Clock out at least 80 bits with chip select deasserted, bringing a
    /// freshly powered card into SPI mode.
    pub(crate) fn cold_clocks(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Failed)?;
        self.send_bytes(&[0xFF; 10], false)
    }

    /// Send one byte and receive one byte over the SPI bus.
    pub(crate) fn transfer_byte(&mut self, out: u8) -> Result<u8, Error> {
        let mut read_buf = [0u8; 1];
        self.spi
            .exchange(Some(&[out]), Some(&mut read_buf))
            .map_err(Error::from)?;
        Ok(read_buf[0])
    }

    /// Receive a byte from the SPI bus by clocking out an 0xFF byte.
    pub(crate) fn receive_byte(&mut self) -> Result<u8, Error> {
        self.transfer_byte(0xFF)
    }

    /// Send a byte over the SPI bus and ignore what comes back.
    pub(crate) fn send_byte(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer_byte(out)?;
        Ok(())
    }

    /// Send a buffer, by DMA when allowed and the buffer passes the
    /// alignment gate, polled otherwise. Both paths put identical bytes on
    /// the wire.
    pub(crate) fn send_bytes(&mut self, data: &[u8], allow_dma: bool) -> Result<(), Error> {
        if self.dma_eligible(data.as_ptr() as usize, allow_dma) {
            let (addr, len) = cache_span(data.as_ptr() as usize, data.len(), SPI::DMA_ALIGNMENT);
            self.spi.cache_clean(addr, len);
            self.events.clear();
            self.spi
                .start_dma_exchange(Some(data), None, self.events)
                .map_err(Error::from)?;
            self.wait_dma(DmaWait::TransmitDone)
        } else {
            self.spi.exchange(Some(data), None).map_err(Error::from)
        }
    }

    /// Fill a buffer while clocking out 0xFF filler, by DMA when allowed
    /// and the buffer passes the alignment gate, polled otherwise.
    pub(crate) fn receive_bytes(&mut self, buf: &mut [u8], allow_dma: bool) -> Result<(), Error> {
        if self.dma_eligible(buf.as_ptr() as usize, allow_dma) {
            let (addr, len) = cache_span(buf.as_ptr() as usize, buf.len(), SPI::DMA_ALIGNMENT);
            self.spi.cache_invalidate(addr, len);
            self.events.clear();
            self.spi
                .start_dma_exchange(None, Some(buf), self.events)
                .map_err(Error::from)?;
            self.wait_dma(DmaWait::ReceiveDone)?;
            self.spi.cache_invalidate(addr, len);
            Ok(())
        } else {
            self.spi.exchange(None, Some(buf)).map_err(Error::from)
        }
    }

    fn dma_eligible(&self, addr: usize, allow_dma: bool) -> bool {
        allow_dma && self.use_dma && addr % SPI::DMA_ALIGNMENT == 0
    }

    /// Park on a DMA completion event. Aborts the peripheral if the event
    /// does not arrive in time.
    fn wait_dma(&mut self, wait: DmaWait) -> Result<(), Error> {
        let mut deadline = Deadline::new(self.timeouts.dma_ms);
        loop {
            if self.events.faulted() {
                debug!("DMA fault reported");
                return Err(Error::Failed);
            }
            let done = match wait {
                DmaWait::TransmitDone => self.events.transmit_done(),
                DmaWait::ReceiveDone => self.events.receive_done(),
            };
            if done {
                return Ok(());
            }
            if deadline.tick(self.delay, Error::Timeout).is_err() {
                debug!("DMA completion timed out, aborting");
                self.spi.abort_dma();
                return Err(Error::Timeout);
            }
        }
    }

    /// Spin until the card returns 0xFF, or the deadline passes.
    pub(crate) fn wait_ready(&mut self, timeout_ms: u32) -> Result<(), Error> {
        let mut deadline = Deadline::new(timeout_ms);
        loop {
            let s = self.receive_byte()?;
            if s == 0xFF {
                return Ok(());
            }
            deadline.tick(self.delay, Error::Timeout)?;
        }
    }

    /// Spin until the card sends the start-block token, or the deadline
    /// passes.
    pub(crate) fn wait_data_token(&mut self, timeout_ms: u32) -> Result<(), Error> {
        let mut deadline = Deadline::new(timeout_ms);
        loop {
            let s = self.receive_byte()?;
            if s == DATA_START_BLOCK {
                return Ok(());
            }
            deadline.tick(self.delay, Error::Timeout)?;
        }
    }

    /// Perform a command and return its R1 response.
    pub(crate) fn command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        let cmd_timeout = self.timeouts.cmd_ms;
        self.wait_ready(cmd_timeout)?;

        let crc = match command {
            CMD0 => CMD0_CRC,
            CMD8 => CMD8_CRC,
            _ => DUMMY_CRC,
        };
        let frame = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];
        self.send_byte(0xFF)?;
        self.send_bytes(&frame, false)?;

        // skip stuff byte for stop read
        if command == CMD12 {
            let _ = self.receive_byte()?;
        }

        for _ in 0..R1_POLL_LIMIT {
            let result = self.receive_byte()?;
            if (result & 0x80) == 0 {
                trace!("CMD{} -> {:x}", command, result);
                return Ok(result);
            }
        }
        Err(Error::Timeout)
    }

    /// Perform an application-specific command.
    pub(crate) fn app_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.command(CMD55, 0)?;
        self.command(command, arg)
    }

    /// Read the 4 bytes trailing an R3 or R7 response.
    pub(crate) fn read_trailing(&mut self) -> Result<[u8; 4], Error> {
        let mut buf = [0xFF; 4];
        self.receive_bytes(&mut buf, false)?;
        Ok(buf)
    }

    /// Receive one data block: wait for the start token, take the payload,
    /// drain the two CRC bytes the card always appends.
    pub(crate) fn read_data_block(&mut self, buf: &mut [u8], allow_dma: bool) -> Result<(), Error> {
        let token_timeout = self.timeouts.data_token_ms;
        self.wait_data_token(token_timeout)?;
        self.receive_bytes(buf, allow_dma)?;
        let _ = self.receive_byte()?;
        let _ = self.receive_byte()?;
        Ok(())
    }

    /// Send one data block behind the given start token and classify the
    /// card's data response.
    pub(crate) fn write_data_block(&mut self, token: u8, data: &[u8]) -> Result<(), Error> {
        self.send_byte(token)?;
        self.send_bytes(data, true)?;
        // CRC filler; the card ignores it with CRC mode off
        self.send_bytes(&[0xFF, 0xFF], false)?;
        let status = self.receive_byte()?;
        match DataResponse::from_byte(status) {
            DataResponse::Accepted => Ok(()),
            DataResponse::CrcError => Err(Error::Crc),
            DataResponse::WriteError => Err(Error::WriteFault),
        }
    }

    /// Read the 16-byte card specific data register.
    pub(crate) fn read_csd(&mut self) -> Result<[u8; 16], Error> {
        if self.command(CMD9, 0)? != R1_READY_STATE {
            return Err(Error::Failed);
        }
        let mut csd = [0xFF; 16];
        self.read_data_block(&mut csd, false)?;
        Ok(csd)
    }

    /// One millisecond of backoff between retries.
    pub(crate) fn backoff(&mut self) {
        self.delay.delay_ms(1);
    }

    /// Burn one millisecond of the given deadline's budget, or fail with
    /// `err` once it is spent.
    pub(crate) fn tick(&mut self, deadline: &mut Deadline, err: Error) -> Result<(), Error> {
        deadline.tick(&mut *self.delay, err)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
