//! Useful library code for tests
//!
//! A scripted SD card simulator, byte-accurate at the SPI level: commands
//! are collected from MOSI while chip select is asserted, responses and
//! data tokens are queued onto MISO, and write busy is modelled as a run
//! of 0x00 bytes. The simulator records chip-select edges and decoded
//! commands so tests can assert on the wire trace.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

// Links the std critical-section implementation the isr/diskio globals
// need on the host.
use critical_section as _;
use embedded_sdspi::{BusError, SdSpiBus, TransferEvents};

/// The capacity-class personality a simulated card presents during
/// initialisation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimKind {
    /// SD v2 high-capacity: CMD8 answered, OCR CCS set, CSD v2
    Sdhc,
    /// SD v1 standard-capacity: CMD8 illegal, OCR CCS clear, CSD v1
    SdscV1,
}

/// A CSD v2 register describing 7,710,720 blocks (from a real card).
pub const CSD_V2: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x1D, 0x69, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x8B,
];
/// A CSD v1 register describing 3,864,576 blocks (from a real card).
pub const CSD_V1: [u8; 16] = [
    0x00, 0x7F, 0x00, 0x32, 0x5B, 0x5A, 0x83, 0xAF, 0x7F, 0xFF, 0xCF, 0x80, 0x16, 0x80, 0x00, 0x6F,
];

/// Capacity in blocks encoded by [`CSD_V2`].
pub const CSD_V2_BLOCKS: u32 = 7_710_720;
/// Capacity in blocks encoded by [`CSD_V1`].
pub const CSD_V1_BLOCKS: u32 = 3_864_576;

/// One observable event on the simulated wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// Chip select asserted
    CsLow,
    /// Chip select released
    CsHigh,
    /// A complete 6-byte command frame was received (command index and
    /// 32-bit argument)
    Cmd(u8, u32),
}

enum Transfer {
    /// No data phase in progress
    None,
    /// Waiting for a write start token (single or multi block)
    AwaitToken { multi: bool },
    /// Collecting 512 payload bytes plus 2 CRC bytes
    WriteData {
        multi: bool,
        buf: Vec<u8>,
    },
}

pub struct SimCard {
    pub kind: SimKind,
    /// How many ACMD41 polls answer "still idle" before the card reports
    /// ready
    pub acmd41_polls: u32,
    /// 0x00 bytes clocked out after an accepted write block
    pub write_busy_cycles: u32,
    /// Overrides for upcoming write data responses (raw response bytes)
    pub force_data_responses: VecDeque<u8>,

    selected: bool,
    idle: bool,
    app_cmd: bool,
    acmd41_remaining: u32,
    frame: Vec<u8>,
    out_queue: VecDeque<u8>,
    busy_count: u32,
    transfer: Transfer,
    write_sector: u32,
    multi_read: Option<u32>,
    sectors: HashMap<u32, [u8; 512]>,
    pub log: Vec<Event>,
}

impl SimCard {
    pub fn new(kind: SimKind) -> SimCard {
        SimCard {
            kind,
            acmd41_polls: 1,
            write_busy_cycles: 2,
            force_data_responses: VecDeque::new(),
            selected: false,
            idle: true,
            app_cmd: false,
            acmd41_remaining: 1,
            frame: Vec::new(),
            out_queue: VecDeque::new(),
            busy_count: 0,
            transfer: Transfer::None,
            write_sector: 0,
            multi_read: None,
            sectors: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// Peek at stored sector contents.
    pub fn sector(&self, sector: u32) -> [u8; 512] {
        self.sectors.get(&sector).copied().unwrap_or([0; 512])
    }

    /// Preload sector contents.
    pub fn set_sector(&mut self, sector: u32, data: [u8; 512]) {
        self.sectors.insert(sector, data);
    }

    /// The decoded commands seen so far, in order.
    pub fn commands(&self) -> Vec<(u8, u32)> {
        self.log
            .iter()
            .filter_map(|e| match e {
                Event::Cmd(cmd, arg) => Some((*cmd, *arg)),
                _ => None,
            })
            .collect()
    }

    fn set_select(&mut self, selected: bool) {
        if self.selected == selected {
            return;
        }
        self.selected = selected;
        self.log
            .push(if selected { Event::CsLow } else { Event::CsHigh });
        // The card stops driving MISO when deselected; a half-received
        // frame or data phase dies too. Busy programming continues
        // regardless.
        if !selected {
            self.frame.clear();
            self.out_queue.clear();
            self.transfer = Transfer::None;
            self.multi_read = None;
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }
        // During a host-to-card data phase the incoming byte is data, not
        // a command frame, and the outgoing byte is whatever was already
        // queued (the card responds on later clocks)
        if !matches!(self.transfer, Transfer::None) {
            let out = self.out_byte();
            self.consume_data_byte(mosi);
            return out;
        }
        // Command frame collection; 0xFF filler never looks like a frame
        // start because bit 7 must be clear and bit 6 set
        if self.frame.is_empty() {
            if mosi & 0xC0 == 0x40 {
                self.frame.push(mosi);
            }
        } else {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let cmd = self.frame[0] & 0x3F;
                let arg = u32::from_be_bytes([
                    self.frame[1],
                    self.frame[2],
                    self.frame[3],
                    self.frame[4],
                ]);
                self.frame.clear();
                self.process_command(cmd, arg);
            }
        }
        self.out_byte()
    }

    fn consume_data_byte(&mut self, mosi: u8) {
        match &mut self.transfer {
            Transfer::AwaitToken { multi } => {
                let multi = *multi;
                match mosi {
                    0xFF => {}
                    0xFD if multi => {
                        // Stop token: one final programming pass
                        self.busy_count = self.write_busy_cycles;
                        self.transfer = Transfer::None;
                    }
                    token if (token == 0xFE && !multi) || (token == 0xFC && multi) => {
                        self.transfer = Transfer::WriteData {
                            multi,
                            buf: Vec::with_capacity(514),
                        };
                    }
                    _ => {
                        // Unexpected token aborts the data phase
                        self.transfer = Transfer::None;
                    }
                }
            }
            Transfer::WriteData { multi, buf } => {
                buf.push(mosi);
                if buf.len() == 514 {
                    let multi = *multi;
                    let mut data = [0u8; 512];
                    data.copy_from_slice(&buf[..512]);
                    self.finish_write_block(multi, data);
                }
            }
            Transfer::None => {}
        }
    }

    fn finish_write_block(&mut self, multi: bool, data: [u8; 512]) {
        let response = self.force_data_responses.pop_front().unwrap_or(0x05);
        self.out_queue.push_back(response);
        if response & 0x1F == 0x05 {
            self.sectors.insert(self.write_sector, data);
            self.write_sector += 1;
            self.busy_count = self.write_busy_cycles;
        }
        self.transfer = if multi {
            Transfer::AwaitToken { multi: true }
        } else {
            Transfer::None
        };
    }

    fn sector_for(&self, arg: u32) -> u32 {
        match self.kind {
            SimKind::Sdhc => arg,
            SimKind::SdscV1 => {
                assert_eq!(arg % 512, 0, "byte-addressed card got a misaligned address");
                arg / 512
            }
        }
    }

    fn csd(&self) -> [u8; 16] {
        match self.kind {
            SimKind::Sdhc => CSD_V2,
            SimKind::SdscV1 => CSD_V1,
        }
    }

    fn queue_r1(&mut self, r1: u8) {
        // One Ncr filler byte before the response
        self.out_queue.push_back(0xFF);
        self.out_queue.push_back(r1);
    }

    fn process_command(&mut self, cmd: u8, arg: u32) {
        self.log.push(Event::Cmd(cmd, arg));
        let app_cmd = std::mem::replace(&mut self.app_cmd, false);
        let idle_bit = if self.idle { 0x01 } else { 0x00 };
        match (cmd, app_cmd) {
            (0, _) => {
                self.idle = true;
                self.acmd41_remaining = self.acmd41_polls;
                self.multi_read = None;
                self.transfer = Transfer::None;
                self.queue_r1(0x01);
            }
            (8, _) => match self.kind {
                SimKind::Sdhc => {
                    self.queue_r1(0x01);
                    self.out_queue.extend([0x00, 0x00, 0x01, 0xAA]);
                }
                // A v1 card has never heard of CMD8
                SimKind::SdscV1 => self.queue_r1(0x04 | idle_bit),
            },
            (55, _) => {
                self.app_cmd = true;
                self.queue_r1(idle_bit);
            }
            (41, true) => {
                if self.acmd41_remaining > 0 {
                    self.acmd41_remaining -= 1;
                    self.queue_r1(0x01);
                } else {
                    self.idle = false;
                    self.queue_r1(0x00);
                }
            }
            (58, _) => {
                self.queue_r1(idle_bit);
                let ccs = match self.kind {
                    SimKind::Sdhc => 0x40,
                    SimKind::SdscV1 => 0x00,
                };
                self.out_queue.extend([0x80 | ccs, 0xFF, 0x80, 0x00]);
            }
            (16, _) => {
                self.queue_r1(if arg == 512 { 0x00 } else { 0x40 });
            }
            (9, _) => {
                self.queue_r1(0x00);
                self.out_queue.push_back(0xFF);
                self.out_queue.push_back(0xFE);
                self.out_queue.extend(self.csd());
                self.out_queue.extend([0xFF, 0xFF]);
            }
            (17, _) => {
                let sector = self.sector_for(arg);
                self.queue_r1(0x00);
                self.out_queue.push_back(0xFF);
                self.out_queue.push_back(0xFE);
                let data = self.sector(sector);
                self.out_queue.extend(data);
                self.out_queue.extend([0xFF, 0xFF]);
            }
            (18, _) => {
                let sector = self.sector_for(arg);
                self.multi_read = Some(sector);
                self.queue_r1(0x00);
            }
            (12, _) => {
                self.multi_read = None;
                self.out_queue.clear();
                // Ncr filler, the stuff byte, then R1
                self.out_queue.extend([0xFF, 0xFF, 0x00]);
            }
            (24, _) => {
                self.write_sector = self.sector_for(arg);
                self.transfer = Transfer::AwaitToken { multi: false };
                self.queue_r1(0x00);
            }
            (25, _) => {
                self.write_sector = self.sector_for(arg);
                self.transfer = Transfer::AwaitToken { multi: true };
                self.queue_r1(0x00);
            }
            _ => {
                self.queue_r1(0x04 | idle_bit);
            }
        }
    }

    fn out_byte(&mut self) -> u8 {
        if let Some(b) = self.out_queue.pop_front() {
            return b;
        }
        if let Some(sector) = self.multi_read {
            // Next block of a CMD18 stream: a gap byte, the token, the
            // payload and two CRC bytes
            self.multi_read = Some(sector + 1);
            self.out_queue.push_back(0xFE);
            let data = self.sector(sector);
            self.out_queue.extend(data);
            self.out_queue.extend([0xFF, 0xFF]);
            return 0xFF;
        }
        if self.busy_count > 0 {
            self.busy_count -= 1;
            return 0x00;
        }
        0xFF
    }
}

/// DMA accounting shared between a [`SimBus`] and the test body.
#[derive(Default)]
pub struct DmaStats {
    pub transfers: AtomicU32,
    pub cache_cleans: AtomicU32,
    pub cache_invalidates: AtomicU32,
}

/// The platform SPI port over a shared [`SimCard`].
pub struct SimBus {
    card: Arc<Mutex<SimCard>>,
    pub dma: Arc<DmaStats>,
    /// Report DMA completion through the global [`embedded_sdspi::isr`]
    /// hooks instead of the per-transfer event block, the way real
    /// interrupt handlers do.
    pub deliver_via_isr: bool,
}

impl SimBus {
    pub fn new(card: Arc<Mutex<SimCard>>) -> SimBus {
        SimBus {
            card,
            dma: Arc::new(DmaStats::default()),
            deliver_via_isr: false,
        }
    }
}

impl SdSpiBus for SimBus {
    const DMA_ALIGNMENT: usize = 32;

    fn exchange(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<(), BusError> {
        let mut card = self.card.lock().unwrap();
        match (tx, rx) {
            (Some(tx), Some(rx)) => {
                for (o, i) in tx.iter().zip(rx.iter_mut()) {
                    *i = card.exchange(*o);
                }
            }
            (Some(tx), None) => {
                for o in tx {
                    card.exchange(*o);
                }
            }
            (None, Some(rx)) => {
                for i in rx.iter_mut() {
                    *i = card.exchange(0xFF);
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn start_dma_exchange(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        events: &TransferEvents,
    ) -> Result<(), BusError> {
        self.dma.transfers.fetch_add(1, Ordering::Relaxed);
        let receiving = rx.is_some();
        self.exchange(tx, rx)?;
        // Completion "interrupts" fire before the initiator starts
        // waiting; the flags hold the event until it is consumed
        if self.deliver_via_isr {
            if receiving {
                embedded_sdspi::isr::on_receive_complete();
            } else {
                embedded_sdspi::isr::on_transmit_complete();
            }
        } else if receiving {
            events.signal_receive_done();
        } else {
            events.signal_transmit_done();
        }
        Ok(())
    }

    fn cache_clean(&self, _addr: usize, _len: usize) {
        self.dma.cache_cleans.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_invalidate(&self, _addr: usize, _len: usize) {
        self.dma.cache_invalidates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Chip select pin wired to the simulated card.
pub struct SimCs {
    card: Arc<Mutex<SimCard>>,
}

impl SimCs {
    pub fn new(card: Arc<Mutex<SimCard>>) -> SimCs {
        SimCs { card }
    }
}

impl embedded_hal::digital::ErrorType for SimCs {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for SimCs {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.card.lock().unwrap().set_select(true);
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.card.lock().unwrap().set_select(false);
        Ok(())
    }
}

/// Card-detect input driven by a shared flag.
pub struct SimDetect {
    present: Arc<AtomicBool>,
}

impl SimDetect {
    pub fn new(present: Arc<AtomicBool>) -> SimDetect {
        SimDetect { present }
    }
}

impl embedded_hal::digital::ErrorType for SimDetect {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::InputPin for SimDetect {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.present.load(Ordering::Relaxed))
    }
    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.present.load(Ordering::Relaxed))
    }
}

/// A delay source that does not actually wait. Timeout budgets still
/// count down deterministically, one tick per poll.
#[derive(Clone, Default)]
pub struct SimDelay;

impl embedded_hal::delay::DelayNs for SimDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Check that chip-select brackets on the trace never nest and always
/// close, and that at most one command frame opens per bracket for the
/// given command index.
pub fn assert_bracketed(log: &[Event], cmd: u8) {
    let mut depth = 0;
    let mut cmds_in_bracket = 0;
    for event in log {
        match event {
            Event::CsLow => {
                assert_eq!(depth, 0, "nested chip-select assertion");
                depth = 1;
                cmds_in_bracket = 0;
            }
            Event::CsHigh => {
                assert_eq!(depth, 1, "chip select released while idle");
                depth = 0;
            }
            Event::Cmd(c, _) if *c == cmd => {
                assert_eq!(depth, 1, "command framed outside a chip-select bracket");
                cmds_in_bracket += 1;
                assert!(cmds_in_bracket <= 1, "two CMD{} frames in one bracket", cmd);
            }
            Event::Cmd(..) => {}
        }
    }
    assert_eq!(depth, 0, "chip select left asserted at end of trace");
}

/// Build the standard simulator rig: a shared card, its bus and its chip
/// select pin.
pub fn rig(kind: SimKind) -> (Arc<Mutex<SimCard>>, SimBus, SimCs) {
    let card = Arc::new(Mutex::new(SimCard::new(kind)));
    let bus = SimBus::new(card.clone());
    let cs = SimCs::new(card.clone());
    (card, bus, cs)
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
