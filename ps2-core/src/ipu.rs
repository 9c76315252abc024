//! IPU DMA endpoints (channels D3/D4) and their quadword FIFOs
//!
//! The IPU decoder itself is external to this core; what lives here is the
//! pair of 8-quadword FIFOs and the DMA engines feeding/draining them. The
//! D4 (RAM-to-IPU) engine is explicitly backpressured: it may never push more
//! data than the decoder has requested, so when the request flag is down the
//! channel parks in `WaitingForConsumer` and is resumed by an explicit wake
//! from the consumer rather than by polling.

use crate::dmac::tag::ChainAction;
use crate::dmac::{
    CHAIN_LINK_LIMIT, Channel, DmaController, TransferMode, TransferPhase, normal_mode_qwc,
};
use crate::fifo::DmaFifo;
use crate::memory::Memory;
use crate::scheduler::Scheduler;
use bincode::{Decode, Encode};
use std::cmp;

pub const IPU_FIFO_QUADWORDS: usize = 8;

#[derive(Debug, Clone, Encode, Decode)]
pub struct ImageProcessor {
    pub to_ipu_fifo: DmaFifo<u128, IPU_FIFO_QUADWORDS>,
    pub from_ipu_fifo: DmaFifo<u128, IPU_FIFO_QUADWORDS>,
    data_requested: bool,
}

impl ImageProcessor {
    pub fn new() -> Self {
        Self { to_ipu_fifo: DmaFifo::new(), from_ipu_fifo: DmaFifo::new(), data_requested: false }
    }

    pub fn data_requested(&self) -> bool {
        self.data_requested
    }

    /// Raises or lowers the decoder's data request. Returns true when a
    /// parked D4 channel should be woken.
    #[must_use]
    pub fn set_data_request(&mut self, requested: bool) -> bool {
        let wake = requested && !self.data_requested;
        self.data_requested = requested;
        wake
    }

    /// Decoder-side consumption of one input quadword. The flag in the
    /// returned pair is true when a parked D4 channel should be woken (FIFO
    /// space opened up).
    pub fn consume_input(&mut self) -> Option<(u128, bool)> {
        let was_full = self.to_ipu_fifo.free_space() == 0;
        let quadword = self.to_ipu_fifo.pop().ok()?;
        Some((quadword, was_full))
    }

    /// Decoder-side production of one output quadword. Returns true when a
    /// parked D3 channel should be woken.
    #[must_use]
    pub fn produce_output(&mut self, quadword: u128) -> bool {
        if self.from_ipu_fifo.push(quadword).is_err() {
            log::error!("IPU output FIFO overflow, dropping quadword");
            return false;
        }

        true
    }
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// D3: IPU-to-RAM. Drains the output FIFO into MADR; parks when the decoder
/// has not produced enough data yet.
pub fn run_ipu_from_dma(
    dmac: &mut DmaController,
    ipu: &mut ImageProcessor,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    let channel = Channel::IpuFrom;

    if !dmac.channel(channel).chcr.str() {
        return;
    }

    if dmac.channel(channel).qwc == 0 && dmac.phase(channel) != TransferPhase::WaitingForConsumer {
        dmac.channel_mut(channel).qwc = normal_mode_qwc(0);
    }

    let mut transferred = 0;
    while dmac.channel(channel).qwc > 0 {
        if ipu.from_ipu_fifo.is_empty() {
            // Nothing to drain until the decoder produces more
            dmac.set_phase(channel, TransferPhase::WaitingForConsumer);
            log::trace!("IPU_FROM DMA parked: output FIFO empty, {} qwc left", dmac.channel(channel).qwc);
            return;
        }

        let madr = dmac.channel(channel).madr;
        let Some(address) = memory.dma_resolve(madr, false) else {
            dmac.bus_error(channel, scheduler);
            return;
        };

        let quadword = ipu.from_ipu_fifo.pop().expect("checked non-empty above");
        memory.dma_write_quadword(address, quadword);

        let regs = dmac.channel_mut(channel);
        regs.madr = regs.madr.wrapping_add(16);
        regs.qwc -= 1;
        transferred += 1;
    }

    dmac.update_stall_address(channel, dmac.channel(channel).madr);
    dmac.schedule_completion(channel, transferred * 2, scheduler);
}

/// D4: RAM-to-IPU. Normal or chain mode; respects the decoder's data request
/// flag and the input FIFO's capacity.
pub fn run_ipu_to_dma(
    dmac: &mut DmaController,
    ipu: &mut ImageProcessor,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    let channel = Channel::IpuTo;

    if !dmac.channel(channel).chcr.str() {
        return;
    }

    let chain_mode = dmac.channel(channel).chcr.transfer_mode() == TransferMode::Chain;
    let resuming = dmac.phase(channel) == TransferPhase::WaitingForConsumer;

    if !chain_mode && !resuming {
        let count = normal_mode_qwc(dmac.channel(channel).qwc);
        dmac.channel_mut(channel).qwc = count;
    }

    if resuming {
        dmac.set_phase(channel, TransferPhase::Idle);
    }

    let mut transferred = 0;
    let mut links = 0;
    let mut chain_done = !chain_mode || dmac.chain_end_pending(channel);

    loop {
        while dmac.channel(channel).qwc > 0 {
            if !ipu.data_requested() {
                dmac.set_phase(channel, TransferPhase::WaitingForConsumer);
                dmac.set_chain_end_pending(channel, chain_done);
                log::trace!(
                    "IPU_TO DMA parked: no data request, {} qwc left",
                    dmac.channel(channel).qwc
                );
                return;
            }

            if ipu.to_ipu_fifo.free_space() == 0 {
                dmac.set_phase(channel, TransferPhase::WaitingForConsumer);
                dmac.set_chain_end_pending(channel, chain_done);
                log::trace!("IPU_TO DMA parked: input FIFO full");
                return;
            }

            let madr = dmac.channel(channel).madr;
            let Some(address) = memory.dma_resolve(madr, false) else {
                dmac.bus_error(channel, scheduler);
                return;
            };

            let count = cmp::min(dmac.channel(channel).qwc, ipu.to_ipu_fifo.free_space() as u32);
            let mut address = address;
            for _ in 0..count {
                let quadword = memory.dma_read_quadword(address);
                ipu.to_ipu_fifo.push(quadword).expect("bounded by free_space above");
                address = address.offset_quadwords(1);
            }

            let regs = dmac.channel_mut(channel);
            regs.madr = regs.madr.wrapping_add(count * 16);
            regs.qwc -= count;
            transferred += count;
        }

        if chain_done {
            break;
        }

        links += 1;
        if links > CHAIN_LINK_LIMIT {
            log::error!("IPU_TO chain exceeded {CHAIN_LINK_LIMIT} links, stopping");
            break;
        }

        match dmac.walk_source_chain(channel, memory, scheduler) {
            Some(ChainAction::Continue) => {}
            Some(ChainAction::LastTransfer) => chain_done = true,
            None => return,
        }
    }

    dmac.set_chain_end_pending(channel, false);
    dmac.schedule_completion(channel, transferred * 2, scheduler);
}

/// Wake entry for a parked IPU channel; called by the system when the
/// decoder raises its request flag, consumes input, or produces output.
pub fn wake_ipu_channel(
    channel: Channel,
    dmac: &mut DmaController,
    ipu: &mut ImageProcessor,
    memory: &mut Memory,
    scheduler: &mut Scheduler,
) {
    if dmac.phase(channel) != TransferPhase::WaitingForConsumer {
        return;
    }

    log::trace!("Waking parked {channel:?} DMA");

    match channel {
        Channel::IpuFrom => run_ipu_from_dma(dmac, ipu, memory, scheduler),
        Channel::IpuTo => run_ipu_to_dma(dmac, ipu, memory, scheduler),
        _ => {}
    }
}
