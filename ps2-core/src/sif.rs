//! SIF (Sub-system Interface): the three DMA channels bridging the EE and
//! IOP address spaces through shared word FIFOs
//!
//! Each bridge channel has two independently-driven sides. The pump loops
//! interleave "producer side fills FIFO" and "consumer side drains FIFO"
//! steps until neither side can make progress; a side that finishes schedules
//! a cycle-delayed completion interrupt for its own processor. The two
//! processors run at an 8:1 clock ratio, which the IOP-side word accounting
//! divides out.
//!
//! Tag flow:
//! - SIF0 (IOP-to-EE): the IOP walks a tag list in IOP RAM. Each 16-byte tag
//!   holds the IOP-side address/count in its low two words and an EE
//!   destination tag in its high two words; the high half is pushed through
//!   the FIFO for the EE side to consume.
//! - SIF1 (EE-to-IOP): the EE walks a normal source chain. With TTE set, the
//!   high half of each source tag is pushed through the FIFO and doubles as
//!   the IOP-side tag (address/count).
//! - SIF2 (PS1 compatibility path): tagless block transfers in either
//!   direction, sized by the IOP-side BCR.

#[cfg(test)]
mod tests;

use crate::dmac::tag::ChainAction;
use crate::dmac::{
    CHAIN_LINK_LIMIT, Channel, DmaController, TransferMode, TransferPhase, normal_mode_qwc,
};
use crate::fifo::DmaFifo;
use crate::interrupts::{IopInterruptRegisters, IopInterruptType};
use crate::memory::Memory;
use crate::num::U32Ext;
use crate::scheduler::{Scheduler, SchedulerEvent, SchedulerEventType};
use bincode::{Decode, Encode};
use std::cmp;

// IOP-side DMA register blocks
pub const DMA9_MADR: u32 = 0x1F80_1520;
pub const DMA9_BCR: u32 = 0x1F80_1524;
pub const DMA9_CHCR: u32 = 0x1F80_1528;
pub const DMA9_TADR: u32 = 0x1F80_152C;
pub const DMA10_MADR: u32 = 0x1F80_1530;
pub const DMA10_BCR: u32 = 0x1F80_1534;
pub const DMA10_CHCR: u32 = 0x1F80_1538;
pub const DMA2_MADR: u32 = 0x1F80_10A0;
pub const DMA2_BCR: u32 = 0x1F80_10A4;
pub const DMA2_CHCR: u32 = 0x1F80_10A8;

// FIFO capacity in 32-bit words (8 quadwords)
pub const SIF_FIFO_WORDS: usize = 32;

const IOP_CHCR_START: u32 = 1 << 24;

// IOP tag word 0 control flags
const IOP_TAG_END: u32 = 0x8000_0000;
const IOP_TAG_IRQ: u32 = 0x4000_0000;

// Two EE bus cycles per quadword moved
const EE_CYCLES_PER_QUADWORD: u32 = 2;
// The IOP runs at 1/8 the EE clock; word-granular accounting divides by 8
const IOP_CYCLE_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum SifChannel {
    Sif0,
    Sif1,
    Sif2,
}

impl SifChannel {
    pub fn ee_channel(self) -> Channel {
        match self {
            Self::Sif0 => Channel::Sif0,
            Self::Sif1 => Channel::Sif1,
            Self::Sif2 => Channel::Sif2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct SifEeSide {
    pub cycles: u32,
    pub busy: bool,
    pub end: bool,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct SifIopSide {
    pub cycles: u32,
    /// Words remaining in the current transfer block
    pub counter: u32,
    pub busy: bool,
    pub end: bool,
    /// Zero-fill words appended to keep FIFO contents quadword-aligned when
    /// a tag names a word count that is not a multiple of 4
    pub junk_words: u32,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SifPath {
    pub fifo: DmaFifo<u32, SIF_FIFO_WORDS>,
    pub ee: SifEeSide,
    pub iop: SifIopSide,
}

impl SifPath {
    fn new() -> Self {
        Self { fifo: DmaFifo::new(), ee: SifEeSide::default(), iop: SifIopSide::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct IopDmaChannel {
    pub madr: u32,
    pub bcr: u32,
    pub chcr: u32,
    pub tadr: u32,
}

impl IopDmaChannel {
    pub fn started(&self) -> bool {
        self.chcr.bit(24)
    }

    /// BCR word count: block size times block count, with the PS1-era
    /// zero-means-0x10000 rule applied to both halves.
    fn word_count(&self) -> u32 {
        let mut block_size = self.bcr & 0xFFFF;
        let mut num_blocks = self.bcr >> 16;

        if block_size == 0 {
            block_size = 0x10000;
        }
        if num_blocks == 0 {
            num_blocks = 0x10000;
        }

        block_size * num_blocks
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SifBridge {
    pub sif0: SifPath,
    pub sif1: SifPath,
    pub sif2: SifPath,
    pub dma9: IopDmaChannel,
    pub dma10: IopDmaChannel,
    pub dma2: IopDmaChannel,
}

impl SifBridge {
    pub fn new() -> Self {
        Self {
            sif0: SifPath::new(),
            sif1: SifPath::new(),
            sif2: SifPath::new(),
            dma9: IopDmaChannel::default(),
            dma10: IopDmaChannel::default(),
            dma2: IopDmaChannel::default(),
        }
    }

    fn path_mut(&mut self, channel: SifChannel) -> &mut SifPath {
        match channel {
            SifChannel::Sif0 => &mut self.sif0,
            SifChannel::Sif1 => &mut self.sif1,
            SifChannel::Sif2 => &mut self.sif2,
        }
    }

    fn iop_channel_mut(&mut self, channel: SifChannel) -> &mut IopDmaChannel {
        match channel {
            SifChannel::Sif0 => &mut self.dma9,
            SifChannel::Sif1 => &mut self.dma10,
            SifChannel::Sif2 => &mut self.dma2,
        }
    }
}

impl Default for SifBridge {
    fn default() -> Self {
        Self::new()
    }
}

pub fn read_iop_dma_register(sif: &SifBridge, address: u32) -> u32 {
    match address {
        DMA9_MADR => sif.dma9.madr,
        DMA9_BCR => sif.dma9.bcr,
        DMA9_CHCR => sif.dma9.chcr,
        DMA9_TADR => sif.dma9.tadr,
        DMA10_MADR => sif.dma10.madr,
        DMA10_BCR => sif.dma10.bcr,
        DMA10_CHCR => sif.dma10.chcr,
        DMA2_MADR => sif.dma2.madr,
        DMA2_BCR => sif.dma2.bcr,
        DMA2_CHCR => sif.dma2.chcr,
        _ => {
            log::warn!("Unmapped IOP DMA register read: {address:08X}");
            0
        }
    }
}

pub fn write_iop_dma_register(
    sif: &mut SifBridge,
    dmac: &mut DmaController,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
    address: u32,
    value: u32,
) {
    let (channel, offset) = match address {
        DMA9_MADR..=DMA9_TADR => (SifChannel::Sif0, address - DMA9_MADR),
        DMA10_MADR..=DMA10_CHCR => (SifChannel::Sif1, address - DMA10_MADR),
        DMA2_MADR..=DMA2_CHCR => (SifChannel::Sif2, address - DMA2_MADR),
        _ => {
            log::warn!("Unmapped IOP DMA register write: {address:08X} {value:08X}");
            return;
        }
    };

    log::trace!("IOP DMA register write: {address:08X} {value:08X}");

    match offset {
        0x0 => sif.iop_channel_mut(channel).madr = value & 0x00FF_FFFF,
        0x4 => sif.iop_channel_mut(channel).bcr = value,
        0x8 => write_iop_chcr(sif, dmac, memory, scheduler, channel, value),
        0xC => sif.iop_channel_mut(channel).tadr = value & 0x00FF_FFFF,
        _ => unreachable!("offset is always 0x0/0x4/0x8/0xC"),
    }
}

fn write_iop_chcr(
    sif: &mut SifBridge,
    dmac: &mut DmaController,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
    channel: SifChannel,
    value: u32,
) {
    let was_started = sif.iop_channel_mut(channel).started();
    sif.iop_channel_mut(channel).chcr = value;

    if !was_started && value & IOP_CHCR_START != 0 {
        log::debug!("IOP DMA {channel:?} started: CHCR={value:08X}");

        let path = sif.path_mut(channel);
        path.iop.busy = true;
        path.iop.end = false;
        path.iop.counter = 0;
        path.iop.junk_words = 0;
        path.iop.cycles = 0;

        // SIF2 sizes its single block from BCR up front; SIF0/SIF1 get their
        // counts from tags. Rounded up to a quadword multiple so the EE side
        // never stalls on a partial quadword.
        if channel == SifChannel::Sif2 {
            let words = sif.iop_channel_mut(channel).word_count();
            let rounded = (words + 3) & !3;
            let path = sif.path_mut(channel);
            path.iop.counter = rounded;
            path.iop.junk_words = rounded - words;
            path.iop.end = true;
        }

        pump(channel, dmac, sif, memory, scheduler);
    } else if was_started && value & IOP_CHCR_START == 0 {
        log::debug!("IOP DMA {channel:?} force-stopped: CHCR={value:08X}");

        let path = sif.path_mut(channel);
        path.iop.busy = false;
        path.iop.end = false;
        path.iop.counter = 0;
        scheduler.remove_event(SchedulerEventType::IopDmaFinish(channel));
    }
}

/// EE-side start entry for D5 (SIF0), invoked on the CHCR write.
pub fn start_sif0_ee(
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    start_ee_side(SifChannel::Sif0, dmac, sif, memory, scheduler);
}

/// EE-side start entry for D6 (SIF1).
pub fn start_sif1_ee(
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    start_ee_side(SifChannel::Sif1, dmac, sif, memory, scheduler);
}

/// EE-side start entry for D7 (SIF2).
pub fn start_sif2_ee(
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    start_ee_side(SifChannel::Sif2, dmac, sif, memory, scheduler);
}

fn start_ee_side(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    let ee_channel = channel.ee_channel();
    let mode = dmac.channel(ee_channel).chcr.transfer_mode();

    let path = sif.path_mut(channel);
    path.ee.busy = true;
    path.ee.end = false;
    path.ee.cycles = 0;

    match mode {
        TransferMode::Normal => {
            // A normal-mode transfer is a single block; the channel ends as
            // soon as QWC drains
            let count = normal_mode_qwc(dmac.channel(ee_channel).qwc);
            dmac.channel_mut(ee_channel).qwc = count;
            path.ee.end = true;
        }
        TransferMode::Chain => {}
        TransferMode::Interleave => {
            log::error!("DMA{ee_channel:?} does not support interleave mode, treating as normal");
            let count = normal_mode_qwc(dmac.channel(ee_channel).qwc);
            dmac.channel_mut(ee_channel).qwc = count;
            path.ee.end = true;
        }
    }

    pump(channel, dmac, sif, memory, scheduler);
}

/// Called when the EE-side channel is force-stopped via a CHCR STR clear.
pub fn ee_channel_stopped(sif: &mut SifBridge, channel: Channel) {
    let sif_channel = match channel {
        Channel::Sif0 => SifChannel::Sif0,
        Channel::Sif1 => SifChannel::Sif1,
        Channel::Sif2 => SifChannel::Sif2,
        _ => return,
    };

    let path = sif.path_mut(sif_channel);
    path.ee.busy = false;
    path.ee.end = false;
    path.ee.cycles = 0;
}

/// IOP-side completion event handler: clears the IOP channel's start bit and
/// raises the IOP's DMA interrupt.
pub fn on_iop_finish(
    sif: &mut SifBridge,
    channel: SifChannel,
    iop_interrupt_registers: &mut IopInterruptRegisters,
) {
    log::debug!("IOP DMA {channel:?} transfer complete");

    sif.iop_channel_mut(channel).chcr &= !IOP_CHCR_START;
    iop_interrupt_registers.set_interrupt_flag(IopInterruptType::Dma);
}

/// The cooperative pump: interleaves one FIFO-bounded step per ready side
/// until neither side can progress. Both sides idle is the only exit with
/// nothing in flight.
pub fn pump(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    let ee_to_iop = match channel {
        SifChannel::Sif0 => false,
        SifChannel::Sif1 => true,
        // SIF2 direction follows the EE channel's DIR bit
        SifChannel::Sif2 => dmac.channel(Channel::Sif2).chcr.from_memory(),
    };

    let mut links = 0;

    loop {
        let mut progressed = false;

        if ee_to_iop {
            progressed |= step_ee_producer(channel, dmac, sif, memory, scheduler, &mut links);
            progressed |= step_iop_consumer(channel, dmac, sif, memory, scheduler);
        } else {
            progressed |= step_iop_producer(channel, dmac, sif, memory, scheduler, &mut links);
            progressed |= step_ee_consumer(channel, dmac, sif, memory, scheduler);
        }

        if !progressed {
            break;
        }
    }
}

/// IOP side of SIF0/SIF2 (IOP RAM into the FIFO). One tag fetch or one
/// FIFO-bounded chunk per call.
fn step_iop_producer(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
    links: &mut u32,
) -> bool {
    if !sif.path_mut(channel).iop.busy {
        return false;
    }

    let madr = sif.iop_channel_mut(channel).madr;
    let path = sif.path_mut(channel);

    if path.iop.counter > 0 {
        let room = path.fifo.free_space() as u32;
        if room == 0 {
            return false;
        }

        let count = cmp::min(path.iop.counter, room);
        let real_words = path.iop.counter.saturating_sub(path.iop.junk_words);
        let mut address = madr;

        for i in 0..count {
            let word = if i < real_words {
                let word = memory.read_iop_ram_u32(address);
                address = address.wrapping_add(4);
                word
            } else {
                // Quadword-alignment padding past the tag's word count
                0
            };
            path.fifo.push(word).expect("bounded by free_space above");
        }

        path.iop.counter -= count;
        path.iop.junk_words = path.iop.junk_words.saturating_sub(count.saturating_sub(real_words));
        path.iop.cycles += count >> IOP_CYCLE_SHIFT;
        sif.iop_channel_mut(channel).madr = address & 0x00FF_FFFF;

        return true;
    }

    if path.iop.end {
        end_iop_side(channel, dmac, sif, scheduler);
        return true;
    }

    // SIF0: fetch the next IOP-side tag; needs FIFO room for the EE
    // destination tag quadword it carries
    if channel != SifChannel::Sif0 {
        return false;
    }

    if sif.sif0.fifo.free_space() < 4 {
        return false;
    }

    *links += 1;
    if *links > CHAIN_LINK_LIMIT {
        log::error!("SIF0 IOP tag list exceeded {CHAIN_LINK_LIMIT} links, stopping");
        sif.sif0.iop.end = true;
        return true;
    }

    fetch_sif0_iop_tag(sif, memory);
    true
}

/// Reads one 16-byte SIF0 tag from IOP RAM: low half is the IOP-side
/// address/count, high half is the EE destination tag pushed into the FIFO.
fn fetch_sif0_iop_tag(sif: &mut SifBridge, memory: &Memory) {
    let tadr = sif.dma9.tadr;
    let w0 = memory.read_iop_ram_u32(tadr);
    let words = memory.read_iop_ram_u32(tadr + 4);
    let ee_tag_lo = memory.read_iop_ram_u32(tadr + 8);
    let ee_tag_hi = memory.read_iop_ram_u32(tadr + 12);

    sif.dma9.tadr = tadr.wrapping_add(16) & 0x00FF_FFFF;
    sif.dma9.madr = w0 & 0x00FF_FFFF;

    let rounded = (words + 3) & !3;
    sif.sif0.iop.counter = rounded;
    sif.sif0.iop.junk_words = rounded - words;

    if w0 & (IOP_TAG_END | IOP_TAG_IRQ) != 0 {
        sif.sif0.iop.end = true;
    }

    log::trace!(
        "SIF0 IOP tag: addr={:06X} words={words} end={} ee_tag={ee_tag_hi:08X}{ee_tag_lo:08X}",
        sif.dma9.madr,
        sif.sif0.iop.end
    );

    // Forward the EE destination tag, quadword-aligned
    for word in [ee_tag_lo, ee_tag_hi, 0, 0] {
        sif.sif0.fifo.push(word).expect("caller checked for one quadword of room");
    }
}

/// EE side of SIF0/SIF2 (FIFO into EE memory). One tag pop or one
/// FIFO-bounded chunk per call.
fn step_ee_consumer(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) -> bool {
    if !sif.path_mut(channel).ee.busy {
        return false;
    }

    let ee_channel = channel.ee_channel();
    let qwc = dmac.channel(ee_channel).qwc;

    if qwc > 0 {
        let available_qw = (sif.path_mut(channel).fifo.len() / 4) as u32;
        if available_qw == 0 {
            return false;
        }

        let count = cmp::min(qwc, available_qw);
        let madr = dmac.channel(ee_channel).madr;
        let Some(mut address) = memory.dma_resolve(madr, false) else {
            sif.path_mut(channel).ee.busy = false;
            dmac.bus_error(ee_channel, scheduler);
            return false;
        };

        let path = sif.path_mut(channel);
        for _ in 0..count {
            let mut bytes = [0u8; 16];
            for chunk in bytes.chunks_exact_mut(4) {
                let word = path.fifo.pop().expect("bounded by len above");
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            memory.dma_write_quadword(address, u128::from_le_bytes(bytes));
            address = address.offset_quadwords(1);
        }

        path.ee.cycles += count * EE_CYCLES_PER_QUADWORD;

        let regs = dmac.channel_mut(ee_channel);
        regs.madr = regs.madr.wrapping_add(count * 16);
        regs.qwc -= count;
        dmac.update_stall_address(ee_channel, dmac.channel(ee_channel).madr);

        return true;
    }

    if sif.path_mut(channel).ee.end {
        end_ee_side(channel, dmac, sif, scheduler);
        return true;
    }

    // SIF0 destination chain: the next tag comes through the FIFO
    if channel != SifChannel::Sif0 {
        return false;
    }

    if sif.sif0.fifo.len() < 4 {
        return false;
    }

    process_sif0_ee_tag(dmac, sif);
    true
}

/// Pops one EE destination tag from the FIFO and loads QWC/MADR from it.
fn process_sif0_ee_tag(dmac: &mut DmaController, sif: &mut SifBridge) {
    let w0 = sif.sif0.fifo.pop().expect("caller checked for one quadword");
    let w1 = sif.sif0.fifo.pop().expect("caller checked for one quadword");
    let _ = sif.sif0.fifo.pop();
    let _ = sif.sif0.fifo.pop();

    let regs = dmac.channel_mut(Channel::Sif0);
    regs.qwc = w0 & 0xFFFF;
    regs.madr = w1 & !0xF;
    regs.chcr.set_tag((w0 >> 16) as u16);

    let id = (w0 >> 28) & 7;
    let irq = w0.bit(31);

    log::trace!("SIF0 EE tag: id={id} qwc={:04X} madr={:08X} irq={irq}", regs.qwc, regs.madr);

    // Destination chains terminate on an END tag or a tag IRQ with TIE set
    if id == 7 || (irq && regs.chcr.tie()) {
        sif.sif0.ee.end = true;
    }
}

/// EE side of SIF1/SIF2 (EE memory into the FIFO). One tag fetch or one
/// FIFO-bounded chunk per call.
fn step_ee_producer(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
    links: &mut u32,
) -> bool {
    if !sif.path_mut(channel).ee.busy {
        return false;
    }

    let ee_channel = channel.ee_channel();
    let qwc = dmac.channel(ee_channel).qwc;

    if qwc > 0 {
        let room_qw = (sif.path_mut(channel).fifo.free_space() / 4) as u32;
        if room_qw == 0 {
            return false;
        }

        let count = cmp::min(qwc, room_qw);
        let madr = dmac.channel(ee_channel).madr;
        let Some(mut address) = memory.dma_resolve(madr, false) else {
            sif.path_mut(channel).ee.busy = false;
            dmac.bus_error(ee_channel, scheduler);
            return false;
        };

        let path = sif.path_mut(channel);
        for _ in 0..count {
            let quadword = memory.dma_read_quadword(address);
            for chunk in quadword.to_le_bytes().chunks_exact(4) {
                let word = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
                path.fifo.push(word).expect("bounded by free_space above");
            }
            address = address.offset_quadwords(1);
        }

        path.ee.cycles += count * EE_CYCLES_PER_QUADWORD;

        let regs = dmac.channel_mut(ee_channel);
        regs.madr = regs.madr.wrapping_add(count * 16);
        regs.qwc -= count;

        return true;
    }

    if sif.path_mut(channel).ee.end {
        end_ee_side(channel, dmac, sif, scheduler);
        return true;
    }

    // SIF1 source chain: fetch the next tag, forwarding its high half
    // through the FIFO when TTE is set (the IOP reads it as its own tag)
    if channel != SifChannel::Sif1 {
        return false;
    }

    if dmac.channel(ee_channel).chcr.tte() && sif.sif1.fifo.free_space() < 4 {
        return false;
    }

    *links += 1;
    if *links > CHAIN_LINK_LIMIT {
        log::error!("SIF1 source chain exceeded {CHAIN_LINK_LIMIT} links, stopping");
        sif.sif1.ee.end = true;
        return true;
    }

    let tte = dmac.channel(ee_channel).chcr.tte();
    let tadr = dmac.channel(ee_channel).tadr;
    let Some(source) = memory.dma_resolve(tadr, false) else {
        sif.sif1.ee.busy = false;
        dmac.bus_error(ee_channel, scheduler);
        return false;
    };
    let raw_tag = memory.dma_read_quadword(source);

    match dmac.walk_source_chain(ee_channel, memory, scheduler) {
        Some(ChainAction::Continue) => {}
        Some(ChainAction::LastTransfer) => sif.sif1.ee.end = true,
        None => {
            sif.sif1.ee.busy = false;
            return false;
        }
    }

    if tte {
        let high_half = (raw_tag >> 64) as u64;
        for word in [high_half as u32, (high_half >> 32) as u32, 0, 0] {
            sif.sif1.fifo.push(word).expect("room checked before the tag fetch");
        }
    }

    true
}

/// IOP side of SIF1/SIF2 (FIFO into IOP RAM). One tag pop or one
/// FIFO-bounded chunk per call.
fn step_iop_consumer(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) -> bool {
    if !sif.path_mut(channel).iop.busy {
        return false;
    }

    let madr = sif.iop_channel_mut(channel).madr;
    let path = sif.path_mut(channel);

    if path.iop.counter > 0 {
        let available = path.fifo.len() as u32;
        if available == 0 {
            return false;
        }

        let count = cmp::min(path.iop.counter, available);
        let mut address = madr;
        for _ in 0..count {
            let word = path.fifo.pop().expect("bounded by len above");
            memory.write_iop_ram_u32(address, word);
            address = address.wrapping_add(4);
        }

        path.iop.counter -= count;
        path.iop.cycles += count >> IOP_CYCLE_SHIFT;
        sif.iop_channel_mut(channel).madr = address & 0x00FF_FFFF;

        return true;
    }

    if path.iop.end {
        end_iop_side(channel, dmac, sif, scheduler);
        return true;
    }

    // SIF1: the next IOP tag arrives through the FIFO
    if channel != SifChannel::Sif1 {
        return false;
    }

    if sif.sif1.fifo.len() < 4 {
        return false;
    }

    let w0 = sif.sif1.fifo.pop().expect("caller checked for one quadword");
    let words = sif.sif1.fifo.pop().expect("caller checked for one quadword");
    let _ = sif.sif1.fifo.pop();
    let _ = sif.sif1.fifo.pop();

    sif.dma10.madr = w0 & 0x00FF_FFFF;
    sif.sif1.iop.counter = (words + 3) & !3;

    if w0 & (IOP_TAG_END | IOP_TAG_IRQ) != 0 {
        sif.sif1.iop.end = true;
    }

    log::trace!(
        "SIF1 IOP tag: addr={:06X} words={words} end={}",
        sif.dma10.madr,
        sif.sif1.iop.end
    );

    true
}

/// EE-side end: both queued data and chain state are drained; schedule the
/// deferred completion interrupt and release the busy flag.
fn end_ee_side(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    scheduler: &mut Scheduler,
) {
    let path = sif.path_mut(channel);
    path.ee.busy = false;
    path.ee.end = false;

    let cycles = path.ee.cycles;
    path.ee.cycles = 0;

    dmac.schedule_completion(channel.ee_channel(), cycles, scheduler);

    log::debug!("SIF {channel:?} EE side finished ({cycles} cycles accumulated)");
}

/// IOP-side end: schedules the IOP completion interrupt with the 8:1-scaled
/// cycle count (and the SIF0 halving quirk where enabled).
fn end_iop_side(
    channel: SifChannel,
    dmac: &mut DmaController,
    sif: &mut SifBridge,
    scheduler: &mut Scheduler,
) {
    let path = sif.path_mut(channel);
    path.iop.busy = false;
    path.iop.end = false;

    let mut cycles = path.iop.cycles;
    path.iop.cycles = 0;

    if channel == SifChannel::Sif0 && dmac.quirks().sif0_iop_cycle_halving {
        cycles >>= 1;
    }

    // Zero-cycle events would starve the scheduler
    let delay = u64::from(cmp::max(1, cycles));
    scheduler.update_or_push_event(SchedulerEvent::iop_dma_finish(
        channel,
        scheduler.cpu_cycle_counter() + delay,
    ));

    log::debug!("SIF {channel:?} IOP side finished ({cycles} cycles accumulated)");
}
