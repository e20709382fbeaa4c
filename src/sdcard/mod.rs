//! Implements the BlockDevice trait for an SD card in SPI mode.
//!
//! The driver owns its SPI bus and chip select pin outright and serialises
//! all public operations behind a timed handle lock, so one [`SdCard`] can
//! be shared by reference between tasks. DMA completion is signalled from
//! the platform's interrupt handlers through [`TransferEvents`]; everything
//! else is plain blocking SPI with deterministic, millisecond-bounded
//! waits.

pub mod bus;
pub mod proto;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx};
use crate::{debug, trace, warn};
use bus::{Deadline, Io, SdSpiBus, TransferEvents};
use proto::*;

// ****************************************************************************
// Types and Implementations
// ****************************************************************************

/// The possible errors this driver can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic protocol or peripheral failure
    Failed,
    /// A wait-bounded phase exceeded its deadline
    Timeout,
    /// The handle lock was unavailable, or the caller is in interrupt
    /// context
    Busy,
    /// Invalid argument
    InvalidParam,
    /// Card-detect reports no card
    NoMedia,
    /// The card rejected written data with a CRC fault
    Crc,
    /// The card rejected written data with a write fault
    WriteFault,
    /// The operation is not supported by this card
    Unsupported,
}

/// The outcome of the most recent operation on a handle, as stored in
/// [`SdCard::last_status`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The operation succeeded
    Ok,
    /// See [`Error::Failed`]
    Failed,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::Busy`]
    Busy,
    /// See [`Error::InvalidParam`]
    InvalidParam,
    /// See [`Error::NoMedia`]
    NoMedia,
    /// See [`Error::Crc`]
    Crc,
    /// See [`Error::WriteFault`]
    WriteFault,
    /// See [`Error::Unsupported`]
    Unsupported,
}

impl Status {
    fn from_result<T>(result: &Result<T, Error>) -> Status {
        match result {
            Ok(_) => Status::Ok,
            Err(Error::Failed) => Status::Failed,
            Err(Error::Timeout) => Status::Timeout,
            Err(Error::Busy) => Status::Busy,
            Err(Error::InvalidParam) => Status::InvalidParam,
            Err(Error::NoMedia) => Status::NoMedia,
            Err(Error::Crc) => Status::Crc,
            Err(Error::WriteFault) => Status::WriteFault,
            Err(Error::Unsupported) => Status::Unsupported,
        }
    }

    fn encode(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Failed => 1,
            Status::Timeout => 2,
            Status::Busy => 3,
            Status::InvalidParam => 4,
            Status::NoMedia => 5,
            Status::Crc => 6,
            Status::WriteFault => 7,
            Status::Unsupported => 8,
        }
    }

    fn decode(value: u8) -> Status {
        match value {
            0 => Status::Ok,
            1 => Status::Failed,
            2 => Status::Timeout,
            3 => Status::Busy,
            4 => Status::InvalidParam,
            5 => Status::NoMedia,
            6 => Status::Crc,
            7 => Status::WriteFault,
            _ => Status::Unsupported,
        }
    }
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// An standard-capacity SD Card supporting v1.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD1,
    /// An standard-capacity SD Card supporting v2.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD2,
    /// An high-capacity 'SDHC' Card.
    ///
    /// Uses block-addressing internally to support capacities above 2GiB.
    SDHC,
}

impl CardType {
    /// True for cards addressed in 512 byte sectors rather than bytes.
    pub fn is_high_capacity(self) -> bool {
        matches!(self, CardType::SDHC)
    }
}

/// Which level on the card-detect pin means "card present".
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DetectLevel {
    /// The pin reads high when a card is in the slot
    ActiveHigh,
    /// The pin reads low when a card is in the slot
    ActiveLow,
}

/// A card-detect input and its polarity.
pub struct CardDetect<CD> {
    pin: CD,
    level: DetectLevel,
}

impl<CD> CardDetect<CD>
where
    CD: InputPin,
{
    /// Wrap a card-detect input pin.
    pub fn new(pin: CD, level: DetectLevel) -> Self {
        CardDetect { pin, level }
    }

    fn is_present(&mut self) -> Result<bool, Error> {
        let high = self.pin.is_high().map_err(|_| Error::Failed)?;
        Ok(match self.level {
            DetectLevel::ActiveHigh => high,
            DetectLevel::ActiveLow => !high,
        })
    }
}

/// A card-detect placeholder for slots without a detect switch. Always
/// reports a card present.
pub struct NoDetect;

impl embedded_hal::digital::ErrorType for NoDetect {
    type Error = core::convert::Infallible;
}

impl InputPin for NoDetect {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }
    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

/// Per-phase deadline budget, in milliseconds.
///
/// Every blocking wait in the driver is bounded by one of these. The
/// defaults suit a full-speed SPI bus; slow cards may need a larger
/// `write_busy_ms`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on a single blocking peripheral operation (enforced by the
    /// [`SdSpiBus`] port)
    pub spi_io_ms: u32,
    /// Waiting for the card to report ready before a command
    pub cmd_ms: u32,
    /// Waiting for a start-block data token
    pub data_token_ms: u32,
    /// Waiting for the card to finish programming a written block
    pub write_busy_ms: u32,
    /// The whole reset / voltage-check / ACMD41 initialisation loop
    pub init_ms: u32,
    /// Waiting for a DMA completion event
    pub dma_ms: u32,
    /// Waiting to acquire the handle lock
    pub mutex_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            spi_io_ms: 50,
            cmd_ms: 100,
            data_token_ms: 200,
            write_busy_ms: 500,
            init_ms: 1000,
            dma_ms: 500,
            mutex_ms: 1000,
        }
    }
}

fn never_in_interrupt() -> bool {
    false
}

/// Options for the driver.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// Set to true to hand suitably aligned block buffers to the DMA
    /// engine. Buffers that fail the [`SdSpiBus::DMA_ALIGNMENT`] gate fall
    /// back to polled transfers with identical bytes on the wire.
    ///
    /// Off by default, because it needs a port that implements the DMA
    /// half of [`SdSpiBus`].
    pub use_dma: bool,

    /// How many times a failed single-block read or write is retried
    /// before the error is reported. Multi-block transfers are never
    /// retried as a whole.
    pub max_retries: u32,

    /// Deadline budgets for each blocking phase.
    pub timeouts: Timeouts,

    /// Tells the driver whether it is being called from interrupt
    /// context, in which case every public operation fails fast with
    /// [`Error::Busy`] instead of taking the handle lock. Wire this to
    /// your platform's active-interrupt query; the default says "never".
    pub in_interrupt: fn() -> bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            use_dma: false,
            max_retries: 2,
            timeouts: Timeouts::default(),
            in_interrupt: never_in_interrupt,
        }
    }
}

/// Operation counters for one handle.
///
/// Read and write calls count once each however many blocks they move and
/// whether or not they succeed, but only once they have passed argument
/// validation and reached the bus.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Read operations that reached the bus
    pub reads: u32,
    /// Write operations that reached the bus
    pub writes: u32,
    /// Blocks requested by read operations
    pub blocks_read: u32,
    /// Blocks submitted by write operations
    pub blocks_written: u32,
    /// Times the initialisation state machine was entered
    pub init_attempts: u32,
    /// Operations that ended in any error
    pub errors: u32,
    /// Operations that ended in a timeout
    pub timeouts: u32,
}

#[derive(Default)]
struct StatCounters {
    reads: AtomicU32,
    writes: AtomicU32,
    blocks_read: AtomicU32,
    blocks_written: AtomicU32,
    init_attempts: AtomicU32,
    errors: AtomicU32,
    timeouts: AtomicU32,
}

impl StatCounters {
    const fn new() -> StatCounters {
        StatCounters {
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            blocks_read: AtomicU32::new(0),
            blocks_written: AtomicU32::new(0),
            init_attempts: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
        }
    }

    fn snapshot(&self) -> Stats {
        Stats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            init_attempts: self.init_attempts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn note_outcome<T>(&self, result: &Result<T, Error>) {
        if let Err(e) = result {
            Self::bump(&self.errors);
            if *e == Error::Timeout {
                Self::bump(&self.timeouts);
            }
        }
    }
}

const CT_NONE: u8 = 0;
const CT_SD1: u8 = 1;
const CT_SD2: u8 = 2;
const CT_SDHC: u8 = 3;

/// Discovered card state. Written only while the handle lock is held;
/// readable without it.
struct CardState {
    initialized: AtomicBool,
    card_type: AtomicU8,
    capacity_blocks: AtomicU32,
}

impl CardState {
    const fn new() -> CardState {
        CardState {
            initialized: AtomicBool::new(false),
            card_type: AtomicU8::new(CT_NONE),
            capacity_blocks: AtomicU32::new(0),
        }
    }

    fn card_type(&self) -> Option<CardType> {
        match self.card_type.load(Ordering::Relaxed) {
            CT_SD1 => Some(CardType::SD1),
            CT_SD2 => Some(CardType::SD2),
            CT_SDHC => Some(CardType::SDHC),
            _ => None,
        }
    }

    fn set_card_type(&self, card_type: Option<CardType>) {
        let encoded = match card_type {
            None => CT_NONE,
            Some(CardType::SD1) => CT_SD1,
            Some(CardType::SD2) => CT_SD2,
            Some(CardType::SDHC) => CT_SDHC,
        };
        self.card_type.store(encoded, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.initialized.store(false, Ordering::Relaxed);
        self.card_type.store(CT_NONE, Ordering::Relaxed);
        self.capacity_blocks.store(0, Ordering::Relaxed);
    }
}

/// The transport binding: everything that needs `&mut` access and is
/// therefore only touched while the handle lock is held.
struct Bindings<SPI, CS, CD> {
    spi: SPI,
    cs: CS,
    detect: Option<CardDetect<CD>>,
}

/// Driver for an SD Card on an SPI bus.
///
/// Built from an [`SdSpiBus`] implementation, a chip select [`OutputPin`]
/// and a [`DelayNs`] source. All the APIs take `&self`; the handle is
/// `Sync` and can be shared by reference between tasks. Every public
/// operation takes the handle lock with a [`Timeouts::mutex_ms`] deadline
/// and returns [`Error::Busy`] when it expires, or immediately when called
/// from interrupt context.
///
/// The delay source must be `Clone` so that lock acquisition can back off
/// without access to the locked state; most platform delay types are
/// trivially cloneable.
pub struct SdCard<SPI, CS, D, CD = NoDetect>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    CD: InputPin,
{
    bindings: UnsafeCell<Bindings<SPI, CS, CD>>,
    lock: AtomicBool,
    events: TransferEvents,
    state: CardState,
    stats: StatCounters,
    last_status: AtomicU8,
    delay: D,
    config: Config,
}

// Interior access to `bindings` is serialised by `lock`; everything else
// is atomic. The delay source is only touched through `Clone`.
unsafe impl<SPI, CS, D, CD> Sync for SdCard<SPI, CS, D, CD>
where
    SPI: SdSpiBus + Send,
    CS: OutputPin + Send,
    D: DelayNs + Clone + Sync,
    CD: InputPin + Send,
{
}

impl<SPI, CS, D> SdCard<SPI, CS, D>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
{
    /// Create a new SD Card driver for a slot without a card-detect
    /// switch. Card presence is assumed.
    ///
    /// The card is not initialised at this time; call
    /// [`SdCard::initialize`] before the first read or write.
    pub fn new(spi: SPI, cs: CS, delay: D, config: Config) -> Self {
        Self::with_card_detect_option(spi, cs, delay, config, None)
    }
}

impl<SPI, CS, D, CD> SdCard<SPI, CS, D, CD>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    CD: InputPin,
{
    /// Create a new SD Card driver with a card-detect input. Reads,
    /// writes and syncs poll the input and fail with [`Error::NoMedia`]
    /// when the slot is empty.
    pub fn with_card_detect(
        spi: SPI,
        cs: CS,
        delay: D,
        config: Config,
        detect: CardDetect<CD>,
    ) -> Self {
        Self::with_card_detect_option(spi, cs, delay, config, Some(detect))
    }

    fn with_card_detect_option(
        spi: SPI,
        cs: CS,
        delay: D,
        config: Config,
        detect: Option<CardDetect<CD>>,
    ) -> Self {
        SdCard {
            bindings: UnsafeCell::new(Bindings { spi, cs, detect }),
            lock: AtomicBool::new(false),
            events: TransferEvents::new(),
            state: CardState::new(),
            stats: StatCounters::new(),
            last_status: AtomicU8::new(Status::Ok.encode()),
            delay,
            config,
        }
    }

    /// The DMA completion event block for this handle.
    ///
    /// Pass this to [`crate::isr::bind`] on a `'static` handle so the SPI
    /// interrupt handlers can find it.
    pub fn events(&self) -> &TransferEvents {
        &self.events
    }

    /// The outcome of the most recent public operation on this handle.
    pub fn last_status(&self) -> Status {
        Status::decode(self.last_status.load(Ordering::Relaxed))
    }

    /// Operation counters for this handle.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// True once the initialisation state machine has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.initialized.load(Ordering::Relaxed)
    }

    /// The card type discovered during initialisation.
    pub fn card_type(&self) -> Option<CardType> {
        self.state.card_type()
    }

    /// The usable size of the card in 512-byte blocks, from the CSD.
    /// Zero before initialisation or when the CSD did not parse.
    pub fn capacity_blocks(&self) -> u32 {
        self.state.capacity_blocks.load(Ordering::Relaxed)
    }

    /// Poll the card-detect input without touching the card. Slots
    /// without a detect switch always report `true`.
    ///
    /// Unlike the gate inside read/write/sync, this probe does not forget
    /// the discovered card state on absence.
    pub fn card_present(&self) -> Result<bool, Error> {
        let mut guard = self.acquire_lock()?;
        let bindings = guard.bindings();
        match bindings.detect.as_mut() {
            Some(detect) => detect.is_present(),
            None => Ok(true),
        }
    }

    /// Mark the card as requiring a reset.
    ///
    /// The next successful [`SdCard::initialize`] has to run the whole
    /// power-up sequence again, as if the card had just been inserted.
    pub fn mark_card_uninit(&self) -> Result<(), Error> {
        let guard = self.acquire_lock()?;
        self.state.clear();
        drop(guard);
        Ok(())
    }

    /// Tear the handle down: forget the discovered card and drain any
    /// stale completion events.
    ///
    /// If the handle was registered with [`crate::isr::bind`], call
    /// [`crate::isr::unbind`] first so no interrupt handler signals a
    /// handle that is going away.
    pub fn shutdown(&self) -> Result<(), Error> {
        let guard = self.acquire_lock()?;
        self.state.clear();
        self.events.clear();
        drop(guard);
        Ok(())
    }

    /// Run the card initialisation state machine: cold clocks, reset to
    /// idle, voltage check, ACMD41 polling, capacity-class discovery and
    /// CSD parsing.
    ///
    /// Re-entry re-runs the full sequence. On success the handle reports
    /// `is_initialized()`, knows the card type, and a 512 byte block
    /// length is in force on standard-capacity cards.
    pub fn initialize(&self) -> Result<(), Error> {
        let result = self.initialize_inner();
        self.record(&result);
        result
    }

    /// Read one or more 512-byte blocks into `buf`, starting at the given
    /// sector. `buf` must be a non-empty multiple of 512 bytes.
    pub fn read(&self, buf: &mut [u8], start_sector: u32) -> Result<(), Error> {
        let result = if buf.is_empty() || buf.len() % Block::LEN != 0 {
            Err(Error::InvalidParam)
        } else {
            let count = (buf.len() / Block::LEN) as u32;
            self.read_iter(buf.chunks_exact_mut(Block::LEN), count, start_sector)
        };
        self.record(&result);
        result
    }

    /// Write one or more 512-byte blocks from `buf`, starting at the
    /// given sector. `buf` must be a non-empty multiple of 512 bytes.
    pub fn write(&self, buf: &[u8], start_sector: u32) -> Result<(), Error> {
        let result = if buf.is_empty() || buf.len() % Block::LEN != 0 {
            Err(Error::InvalidParam)
        } else {
            let count = (buf.len() / Block::LEN) as u32;
            self.write_iter(buf.chunks_exact(Block::LEN), count, start_sector)
        };
        self.record(&result);
        result
    }

    /// Wait for the card to finish any background programming.
    pub fn sync(&self) -> Result<(), Error> {
        let result = self.sync_inner();
        self.record(&result);
        result
    }

    fn record<T>(&self, result: &Result<T, Error>) {
        self.last_status
            .store(Status::from_result(result).encode(), Ordering::Relaxed);
    }

    fn acquire_lock(&self) -> Result<LockGuard<'_, SPI, CS, D, CD>, Error> {
        if (self.config.in_interrupt)() {
            return Err(Error::Busy);
        }
        let mut deadline = Deadline::new(self.config.timeouts.mutex_ms);
        let mut delay = self.delay.clone();
        loop {
            if self
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(LockGuard { card: self });
            }
            deadline.tick(&mut delay, Error::Busy)?;
        }
    }

    /// Poll the card-detect input. A missing card forgets the discovered
    /// state so the next access has to re-initialise.
    fn presence_gate(&self, bindings: &mut Bindings<SPI, CS, CD>) -> Result<(), Error> {
        if let Some(detect) = bindings.detect.as_mut() {
            if !detect.is_present()? {
                debug!("card removed");
                self.state.clear();
                return Err(Error::NoMedia);
            }
        }
        Ok(())
    }

    fn initialize_inner(&self) -> Result<(), Error> {
        let mut guard = self.acquire_lock()?;
        let mut delay = self.delay.clone();
        StatCounters::bump(&self.stats.init_attempts);
        self.state.clear();

        let result: Result<(), Error> = (|| {
            let bindings = guard.bindings();
            self.presence_gate(bindings)?;
            let mut io = Io::new(
                &mut bindings.spi,
                &mut bindings.cs,
                &mut delay,
                &self.events,
                self.config.timeouts,
                self.config.use_dma,
            );
            let (card_type, capacity_blocks) = run_init(&mut io, &self.config.timeouts)?;
            self.state.set_card_type(Some(card_type));
            self.state
                .capacity_blocks
                .store(capacity_blocks, Ordering::Relaxed);
            self.state.initialized.store(true, Ordering::Relaxed);
            Ok(())
        })();
        self.stats.note_outcome(&result);
        result
    }

    fn read_iter<'b>(
        &self,
        mut blocks: impl Iterator<Item = &'b mut [u8]>,
        count: u32,
        start_sector: u32,
    ) -> Result<(), Error> {
        let mut guard = self.acquire_lock()?;
        let mut delay = self.delay.clone();
        let result: Result<(), Error> = (|| {
            let bindings = guard.bindings();
            self.presence_gate(bindings)?;
            if !self.state.initialized.load(Ordering::Relaxed) {
                return Err(Error::Failed);
            }
            let card_type = self.state.card_type().ok_or(Error::Failed)?;
            StatCounters::bump(&self.stats.reads);
            StatCounters::add(&self.stats.blocks_read, count);
            trace!("read {} blocks @ {}", count, start_sector);

            let address = block_address(card_type, start_sector);
            let mut io = Io::new(
                &mut bindings.spi,
                &mut bindings.cs,
                &mut delay,
                &self.events,
                self.config.timeouts,
                self.config.use_dma,
            );
            if count == 1 {
                let block = blocks.next().ok_or(Error::InvalidParam)?;
                retry(self.config.max_retries, &mut io, |io| {
                    read_single_block(io, address, block)
                })
            } else {
                read_multiple_blocks(&mut io, address, blocks)
            }
        })();
        self.stats.note_outcome(&result);
        result
    }

    fn write_iter<'b>(
        &self,
        mut blocks: impl Iterator<Item = &'b [u8]>,
        count: u32,
        start_sector: u32,
    ) -> Result<(), Error> {
        let mut guard = self.acquire_lock()?;
        let mut delay = self.delay.clone();
        let busy_ms = self.config.timeouts.write_busy_ms;
        let result: Result<(), Error> = (|| {
            let bindings = guard.bindings();
            self.presence_gate(bindings)?;
            if !self.state.initialized.load(Ordering::Relaxed) {
                return Err(Error::Failed);
            }
            let card_type = self.state.card_type().ok_or(Error::Failed)?;
            StatCounters::bump(&self.stats.writes);
            StatCounters::add(&self.stats.blocks_written, count);
            trace!("write {} blocks @ {}", count, start_sector);

            let address = block_address(card_type, start_sector);
            let mut io = Io::new(
                &mut bindings.spi,
                &mut bindings.cs,
                &mut delay,
                &self.events,
                self.config.timeouts,
                self.config.use_dma,
            );
            if count == 1 {
                let block = blocks.next().ok_or(Error::InvalidParam)?;
                retry(self.config.max_retries, &mut io, |io| {
                    write_single_block(io, address, block, busy_ms)
                })
            } else {
                write_multiple_blocks(&mut io, address, blocks, busy_ms)
            }
        })();
        self.stats.note_outcome(&result);
        result
    }

    fn sync_inner(&self) -> Result<(), Error> {
        let mut guard = self.acquire_lock()?;
        let mut delay = self.delay.clone();
        let busy_ms = self.config.timeouts.write_busy_ms;
        let result: Result<(), Error> = (|| {
            let bindings = guard.bindings();
            self.presence_gate(bindings)?;
            let mut io = Io::new(
                &mut bindings.spi,
                &mut bindings.cs,
                &mut delay,
                &self.events,
                self.config.timeouts,
                self.config.use_dma,
            );
            io.with_cs(|io| io.wait_ready(busy_ms))
        })();
        self.stats.note_outcome(&result);
        result
    }
}

impl<SPI, CS, D, CD> BlockDevice for SdCard<SPI, CS, D, CD>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    CD: InputPin,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let result = if blocks.is_empty() {
            Err(Error::InvalidParam)
        } else {
            let count = blocks.len() as u32;
            self.read_iter(
                blocks.iter_mut().map(|b| &mut b.contents[..]),
                count,
                start_block_idx.0,
            )
        };
        self.record(&result);
        result
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let result = if blocks.is_empty() {
            Err(Error::InvalidParam)
        } else {
            let count = blocks.len() as u32;
            self.write_iter(
                blocks.iter().map(|b| &b.contents[..]),
                count,
                start_block_idx.0,
            )
        };
        self.record(&result);
        result
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        if !self.is_initialized() {
            return Err(Error::Failed);
        }
        Ok(BlockCount(self.capacity_blocks()))
    }
}

/// Scoped ownership of the handle lock.
struct LockGuard<'a, SPI, CS, D, CD>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    CD: InputPin,
{
    card: &'a SdCard<SPI, CS, D, CD>,
}

impl<'a, SPI, CS, D, CD> LockGuard<'a, SPI, CS, D, CD>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    CD: InputPin,
{
    fn bindings(&mut self) -> &mut Bindings<SPI, CS, CD> {
        // Exclusive access is guaranteed by holding the lock.
        unsafe { &mut *self.card.bindings.get() }
    }
}

impl<'a, SPI, CS, D, CD> Drop for LockGuard<'a, SPI, CS, D, CD>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    CD: InputPin,
{
    fn drop(&mut self) {
        self.card.lock.store(false, Ordering::Release);
    }
}

// ****************************************************************************
// The initialisation state machine and the block engine
// ****************************************************************************

/// The wire address for a sector: high-capacity cards are sector
/// addressed, standard-capacity cards are byte addressed.
fn block_address(card_type: CardType, sector: u32) -> u32 {
    if card_type.is_high_capacity() {
        sector
    } else {
        sector * 512
    }
}

/// Retry a single-block operation with a millisecond of backoff between
/// attempts.
fn retry<SPI, CS, D>(
    max_retries: u32,
    io: &mut Io<'_, SPI, CS, D>,
    mut op: impl FnMut(&mut Io<'_, SPI, CS, D>) -> Result<(), Error>,
) -> Result<(), Error>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    let mut attempts = 0;
    loop {
        match op(io) {
            Ok(()) => return Ok(()),
            Err(e) if attempts < max_retries => {
                attempts += 1;
                warn!("block transfer failed ({:?}), retry {}", e, attempts);
                io.backoff();
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drive the card from power-up to the data-transfer state and discover
/// its capacity. Returns the card type and the capacity in blocks.
fn run_init<SPI, CS, D>(
    io: &mut Io<'_, SPI, CS, D>,
    timeouts: &Timeouts,
) -> Result<(CardType, u32), Error>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    // At least 80 clocks with CS high to put the card into SPI mode
    io.cold_clocks()?;

    // Reset into the idle state
    let mut deadline = Deadline::new(timeouts.init_ms);
    loop {
        match io.with_cs(|io| io.command(CMD0, 0)) {
            Ok(R1_IDLE_STATE) => break,
            Ok(_r) => {
                trace!("CMD0 answered {:x}, trying again", _r);
            }
            // No R1 yet; the card may still be waking up
            Err(Error::Timeout) => {}
            Err(e) => return Err(e),
        }
        io.tick(&mut deadline, Error::Failed)?;
    }

    // Voltage check tells SD v2 cards from legacy ones
    let (r1, r7) = io.with_cs(|io| {
        let r1 = io.command(CMD8, CMD8_VHS_PATTERN)?;
        let r7 = io.read_trailing()?;
        Ok((r1, r7))
    })?;
    let sdv2 = r1 == R1_IDLE_STATE && r7[2] == 0x01 && r7[3] == 0xAA;
    debug!("CMD8 -> {:x}, sdv2 = {}", r1, sdv2);

    // Start the card's internal initialisation, announcing high-capacity
    // support to v2 cards
    let acmd41_arg = if sdv2 { ACMD41_HCS } else { 0 };
    let mut deadline = Deadline::new(timeouts.init_ms);
    loop {
        let r1 = io.with_cs(|io| io.app_command(ACMD41, acmd41_arg))?;
        if r1 == R1_READY_STATE {
            break;
        }
        io.tick(&mut deadline, Error::Timeout)?;
    }

    // The OCR's capacity-status bit tells SDHC/SDXC from SDSC
    let mut card_type = if sdv2 { CardType::SD2 } else { CardType::SD1 };
    let ocr = io.with_cs(|io| {
        if io.command(CMD58, 0)? != R1_READY_STATE {
            return Err(Error::Failed);
        }
        io.read_trailing()
    })?;
    let ocr = Ocr { data: ocr };
    if ocr.is_high_capacity() {
        card_type = CardType::SDHC;
    }

    // Byte-addressed cards are pinned to 512 byte blocks; sector-addressed
    // cards are always 512
    if !card_type.is_high_capacity() {
        let r1 = io.with_cs(|io| io.command(CMD16, Block::LEN_U32))?;
        if r1 != R1_READY_STATE {
            return Err(Error::Failed);
        }
    }

    let csd = io.with_cs(|io| io.read_csd())?;
    let capacity_blocks = Csd::from_bytes(csd).card_capacity_blocks();
    debug!(
        "card type {:?}, capacity {} blocks",
        card_type, capacity_blocks
    );
    Ok((card_type, capacity_blocks))
}

fn read_single_block<SPI, CS, D>(
    io: &mut Io<'_, SPI, CS, D>,
    address: u32,
    buf: &mut [u8],
) -> Result<(), Error>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    io.with_cs(|io| {
        if io.command(CMD17, address)? != R1_READY_STATE {
            return Err(Error::Failed);
        }
        io.read_data_block(buf, true)
    })
}

fn read_multiple_blocks<'b, SPI, CS, D>(
    io: &mut Io<'_, SPI, CS, D>,
    address: u32,
    blocks: impl Iterator<Item = &'b mut [u8]>,
) -> Result<(), Error>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    io.with_cs(|io| {
        if io.command(CMD18, address)? != R1_READY_STATE {
            return Err(Error::Failed);
        }
        let mut result = Ok(());
        for block in blocks {
            if let Err(e) = io.read_data_block(block, true) {
                result = Err(e);
                break;
            }
        }
        // The transfer is terminated even when a block failed
        let stop = io.command(CMD12, 0).map(|_| ());
        result.and(stop)
    })
}

fn write_single_block<SPI, CS, D>(
    io: &mut Io<'_, SPI, CS, D>,
    address: u32,
    data: &[u8],
    busy_ms: u32,
) -> Result<(), Error>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    io.with_cs(|io| {
        if io.command(CMD24, address)? != R1_READY_STATE {
            return Err(Error::Failed);
        }
        io.write_data_block(DATA_START_BLOCK, data)?;
        io.wait_ready(busy_ms)
    })
}

fn write_multiple_blocks<'b, SPI, CS, D>(
    io: &mut Io<'_, SPI, CS, D>,
    address: u32,
    blocks: impl Iterator<Item = &'b [u8]>,
    busy_ms: u32,
) -> Result<(), Error>
where
    SPI: SdSpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    io.with_cs(|io| {
        if io.command(CMD25, address)? != R1_READY_STATE {
            return Err(Error::Failed);
        }
        let mut result = Ok(());
        for block in blocks {
            let wrote = io
                .write_data_block(WRITE_MULTIPLE_TOKEN, block)
                .and_then(|_| io.wait_ready(busy_ms));
            if let Err(e) = wrote {
                result = Err(e);
                break;
            }
        }
        // Close the transfer even when a block failed, then wait out the
        // final programming pass
        let stop = io
            .send_byte(STOP_TRAN_TOKEN)
            .and_then(|_| io.wait_ready(busy_ms));
        result.and(stop)
    })
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
