//! EE DMA controller (DMAC) registers and channel engines
//!
//! DMA channels:
//! - D0: VIF0 (RAM-to-VIF0)
//! - D1: VIF1 (RAM-to-VIF1, reversible)
//! - D2: GIF (RAM-to-GIF)
//! - D3: IPU_FROM (IPU-to-RAM)
//! - D4: IPU_TO (RAM-to-IPU)
//! - D5: SIF0 (IOP-to-RAM, through the SIF FIFO)
//! - D6: SIF1 (RAM-to-IOP, through the SIF FIFO)
//! - D7: SIF2 (bidirectional IOP bridge, PS1 compatibility path)
//! - D8: SPR_FROM (scratchpad-to-RAM)
//! - D9: SPR_TO (RAM-to-scratchpad)

pub mod tag;

#[cfg(test)]
mod tests;

use crate::dmac::tag::ChainAction;
use crate::interrupts::InterruptRegisters;
use crate::ipu::ImageProcessor;
use crate::memory::Memory;
use crate::quirks::Quirks;
use crate::scheduler::{Scheduler, SchedulerEvent, SchedulerEventType};
use crate::sif::SifBridge;
use crate::{ipu, sif};
use bincode::{Decode, Encode};
use proc_bitfield::bitfield;
use std::cmp;

pub const DMAC_CTRL: u32 = 0x1000_E000;
pub const DMAC_STAT: u32 = 0x1000_E010;
pub const DMAC_PCR: u32 = 0x1000_E020;
pub const DMAC_SQWC: u32 = 0x1000_E030;
pub const DMAC_RBSR: u32 = 0x1000_E040;
pub const DMAC_RBOR: u32 = 0x1000_E050;
pub const DMAC_STADR: u32 = 0x1000_E060;
pub const DMAC_ENABLER: u32 = 0x1000_F520;
pub const DMAC_ENABLEW: u32 = 0x1000_F590;

// Channel register offsets within a channel's register block
const CHCR: u32 = 0x00;
const MADR: u32 = 0x10;
const QWC: u32 = 0x20;
const TADR: u32 = 0x30;
const ASR0: u32 = 0x40;
const ASR1: u32 = 0x50;
const SADR: u32 = 0x80;

// ENABLEW bit 16 suspends all channels without clearing their start bits
const ENABLE_SUSPEND_BIT: u32 = 1 << 16;

// A well-formed chain ends on its own; a cyclic chain would spin the pump
// loop forever since it runs to completion within one call. Real hardware
// livelocks here, the host must not.
pub const CHAIN_LINK_LIMIT: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Channel {
    Vif0 = 0,
    Vif1 = 1,
    Gif = 2,
    IpuFrom = 3,
    IpuTo = 4,
    Sif0 = 5,
    Sif1 = 6,
    Sif2 = 7,
    SprFrom = 8,
    SprTo = 9,
}

impl Channel {
    pub const ALL: [Self; 10] = [
        Self::Vif0,
        Self::Vif1,
        Self::Gif,
        Self::IpuFrom,
        Self::IpuTo,
        Self::Sif0,
        Self::Sif1,
        Self::Sif2,
        Self::SprFrom,
        Self::SprTo,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn register_base(self) -> u32 {
        match self {
            Self::Vif0 => 0x1000_8000,
            Self::Vif1 => 0x1000_9000,
            Self::Gif => 0x1000_A000,
            Self::IpuFrom => 0x1000_B000,
            Self::IpuTo => 0x1000_B400,
            Self::Sif0 => 0x1000_C000,
            Self::Sif1 => 0x1000_C400,
            Self::Sif2 => 0x1000_C800,
            Self::SprFrom => 0x1000_D000,
            Self::SprTo => 0x1000_D400,
        }
    }

    fn from_register_address(address: u32) -> Option<Self> {
        match address & !0x3FF {
            0x1000_8000 => Some(Self::Vif0),
            0x1000_9000 => Some(Self::Vif1),
            0x1000_A000 => Some(Self::Gif),
            0x1000_B000 => Some(Self::IpuFrom),
            0x1000_B400 => Some(Self::IpuTo),
            0x1000_C000 => Some(Self::Sif0),
            0x1000_C400 => Some(Self::Sif1),
            0x1000_C800 => Some(Self::Sif2),
            0x1000_D000 => Some(Self::SprFrom),
            0x1000_D400 => Some(Self::SprTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum TransferMode {
    #[default]
    Normal = 0,
    Chain = 1,
    Interleave = 2,
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
    pub struct ChannelControl(pub u32): Debug, FromStorage, IntoStorage {
        /// Direction: true = memory-to-peripheral
        pub from_memory: bool @ 0,
        pub mode: u8 @ 2..=3,
        /// Address stack pointer (CALL/RET depth, 0-2)
        pub asp: u8 @ 4..=5,
        /// Tag transfer enable: send fetched tags to the peripheral
        pub tte: bool @ 6,
        /// Tag interrupt enable: honor the IRQ bit in chain tags
        pub tie: bool @ 7,
        /// Start/busy; the sole authority for "is this channel running"
        pub str: bool @ 8,
        /// Bits 16-31 of the most recently fetched tag
        pub tag: u16 @ 16..=31,
    }
}

impl ChannelControl {
    pub fn transfer_mode(self) -> TransferMode {
        match self.mode() {
            0 => TransferMode::Normal,
            1 | 3 => TransferMode::Chain,
            2 => TransferMode::Interleave,
            _ => unreachable!("2-bit field is always <= 3"),
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
    pub struct DmacControl(pub u32): Debug, FromStorage, IntoStorage {
        /// Global DMA enable
        pub dmae: bool @ 0,
        /// Cycle-stealing release
        pub rele: bool @ 1,
        /// MFIFO drain channel
        pub mfd: u8 @ 2..=3,
        /// Stall-control source channel (0=none, 1=SIF0, 2=SPR_FROM, 3=IPU_FROM)
        pub sts: u8 @ 4..=5,
        /// Stall-control drain channel (0=none, 1=VIF1, 2=GIF, 3=SIF1)
        pub std: u8 @ 6..=7,
        /// Release cycle for cycle stealing
        pub rcyc: u8 @ 8..=10,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
    pub struct DmacStatus(pub u32): Debug, FromStorage, IntoStorage {
        /// Per-channel interrupt status (CIS), one bit per channel
        pub channel_stat: u16 @ 0..=9,
        /// DMA stall interrupt status
        pub sis: bool @ 13,
        /// MFIFO empty interrupt status
        pub meis: bool @ 14,
        /// Bus error interrupt status
        pub beis: bool @ 15,
        /// Per-channel interrupt mask (CIM)
        pub channel_mask: u16 @ 16..=25,
        pub sim: bool @ 29,
        pub meim: bool @ 30,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
    pub struct InterleaveControl(pub u32): Debug, FromStorage, IntoStorage {
        /// Quadwords to skip between interleave chunks
        pub skip_qwc: u8 @ 0..=7,
        /// Quadwords to transfer per interleave chunk
        pub transfer_qwc: u8 @ 16..=23,
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct ChannelRegisters {
    pub chcr: ChannelControl,
    pub madr: u32,
    pub qwc: u32,
    pub tadr: u32,
    pub asr0: u32,
    pub asr1: u32,
    pub sadr: u32,
}

/// Run-state beyond what CHCR.STR expresses: a channel that was started while
/// the DMAC was globally disabled sits in `Queued`, a channel whose transfer
/// finished but whose completion interrupt has not yet fired sits in
/// `Completing`, and the IPU channels park in `WaitingForConsumer` instead of
/// spinning on the decoder's request flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum TransferPhase {
    #[default]
    Idle,
    Queued,
    Completing,
    WaitingForConsumer,
}

/// Borrowed view of everything a register write may need to touch: a CHCR
/// write can run an entire transfer synchronously.
pub struct DmaContext<'a> {
    pub memory: &'a mut Memory,
    pub sif: &'a mut SifBridge,
    pub ipu: &'a mut ImageProcessor,
    pub gif: &'a mut GifUnit,
    pub vif0: &'a mut VifUnit,
    pub vif1: &'a mut VifUnit,
    pub interrupt_registers: &'a mut InterruptRegisters,
    pub scheduler: &'a mut Scheduler,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct DmaController {
    ctrl: DmacControl,
    stat: DmacStatus,
    pcr: u32,
    sqwc: InterleaveControl,
    rbsr: u32,
    rbor: u32,
    stadr: u32,
    enabler: u32,
    enablew: u32,
    channels: [ChannelRegisters; 10],
    phases: [TransferPhase; 10],
    queued: u16,
    // Channels parked mid-chain after their final tag; the resume path must
    // not fetch another tag
    chain_end_pending: u16,
    quirks: Quirks,
    mode3_warned: bool,
}

impl DmaController {
    pub fn new(quirks: Quirks) -> Self {
        Self {
            ctrl: DmacControl::default(),
            stat: DmacStatus::default(),
            pcr: 0,
            sqwc: InterleaveControl::default(),
            rbsr: 0,
            rbor: 0,
            stadr: 0,
            enabler: 0,
            enablew: 0,
            channels: [ChannelRegisters::default(); 10],
            phases: [TransferPhase::default(); 10],
            queued: 0,
            chain_end_pending: 0,
            quirks,
            mode3_warned: false,
        }
    }

    pub fn chain_end_pending(&self, channel: Channel) -> bool {
        self.chain_end_pending & channel.bit() != 0
    }

    pub fn set_chain_end_pending(&mut self, channel: Channel, pending: bool) {
        if pending {
            self.chain_end_pending |= channel.bit();
        } else {
            self.chain_end_pending &= !channel.bit();
        }
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    pub fn channel(&self, channel: Channel) -> &ChannelRegisters {
        &self.channels[channel.index()]
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelRegisters {
        &mut self.channels[channel.index()]
    }

    pub fn phase(&self, channel: Channel) -> TransferPhase {
        self.phases[channel.index()]
    }

    pub fn set_phase(&mut self, channel: Channel, phase: TransferPhase) {
        self.phases[channel.index()] = phase;
    }

    pub fn stat(&self) -> DmacStatus {
        self.stat
    }

    fn suspended(&self) -> bool {
        self.enablew & ENABLE_SUSPEND_BIT != 0
    }

    pub fn read_register(&self, address: u32) -> u32 {
        match address {
            DMAC_CTRL => self.ctrl.into(),
            DMAC_STAT => self.stat.into(),
            DMAC_PCR => self.pcr,
            DMAC_SQWC => self.sqwc.into(),
            DMAC_RBSR => self.rbsr,
            DMAC_RBOR => self.rbor,
            DMAC_STADR => self.stadr,
            DMAC_ENABLER => self.enabler,
            DMAC_ENABLEW => self.enablew,
            _ => {
                let Some(channel) = Channel::from_register_address(address) else {
                    log::warn!("Unmapped DMAC register read: {address:08X}");
                    return 0;
                };

                let regs = self.channel(channel);
                match address & 0x3FF {
                    CHCR => regs.chcr.into(),
                    MADR => regs.madr,
                    QWC => regs.qwc,
                    TADR => regs.tadr,
                    ASR0 => regs.asr0,
                    ASR1 => regs.asr1,
                    SADR => regs.sadr,
                    _ => {
                        log::warn!("Unmapped DMA{channel:?} register read: {address:08X}");
                        0
                    }
                }
            }
        }
    }

    /// Every MMIO write into DMAC space funnels through here; this is the one
    /// code path that mutates the register file. New registers are added by
    /// extending the match; anything not special-cased falls through to a
    /// plain register commit.
    pub fn write_register(&mut self, address: u32, value: u32, ctx: &mut DmaContext<'_>) {
        match address {
            DMAC_CTRL => self.write_ctrl(value, ctx),
            DMAC_STAT => self.write_stat(value, ctx.interrupt_registers),
            DMAC_PCR => self.pcr = value,
            DMAC_SQWC => self.sqwc = value.into(),
            DMAC_RBSR => self.rbsr = value,
            DMAC_RBOR => self.rbor = value,
            DMAC_STADR => self.stadr = value,
            DMAC_ENABLER => {
                // Read-only shadow of ENABLEW; writes are absorbed
                log::warn!("Write to read-only D_ENABLER: {value:08X}");
            }
            DMAC_ENABLEW => self.write_enablew(value, ctx),
            _ => self.write_channel_register(address, value, ctx),
        }
    }

    fn write_channel_register(&mut self, address: u32, value: u32, ctx: &mut DmaContext<'_>) {
        let Some(channel) = Channel::from_register_address(address) else {
            log::warn!("Unmapped DMAC register write: {address:08X} {value:08X}");
            return;
        };

        let offset = address & 0x3FF;
        if offset == CHCR {
            self.start_channel(channel, value, ctx);
            return;
        }

        if self.channel(channel).chcr.str() {
            // Hardware rejects every register write other than a CHCR STR
            // clear while the channel is running
            log::warn!(
                "DMA{channel:?} register write while channel is running, ignoring: {address:08X} {value:08X}"
            );
            return;
        }

        let regs = self.channel_mut(channel);
        match offset {
            MADR => regs.madr = value & !0xF,
            QWC => regs.qwc = value & 0xFFFF,
            TADR => regs.tadr = value & !0xF,
            ASR0 => regs.asr0 = value & !0xF,
            ASR1 => regs.asr1 = value & !0xF,
            SADR => regs.sadr = value & 0x3FF0,
            _ => {
                log::warn!("Unmapped DMA{channel:?} register write: {address:08X} {value:08X}");
            }
        }

        log::trace!("DMA{channel:?} register write: {address:08X} {value:08X}");
    }

    /// CHCR write handler: commits the new control value and starts, stops,
    /// or queues the channel.
    fn start_channel(&mut self, channel: Channel, value: u32, ctx: &mut DmaContext<'_>) {
        let mut new_chcr = ChannelControl::from(value);
        let current = self.channel(channel).chcr;

        if current.str() {
            if new_chcr.str() {
                // Can't reconfigure a running channel
                log::warn!("DMA{channel:?} CHCR write while running, ignoring: {value:08X}");
                return;
            }

            // Force stop: commit the STR clear and cancel any pending
            // completion so a stale interrupt can't fire later
            log::debug!("DMA{channel:?} force-stopped via CHCR write: {value:08X}");
            self.channel_mut(channel).chcr = new_chcr;
            self.set_phase(channel, TransferPhase::Idle);
            self.queued &= !channel.bit();
            self.set_chain_end_pending(channel, false);
            ctx.scheduler.remove_event(SchedulerEventType::EeDmaFinish(channel));
            sif::ee_channel_stopped(ctx.sif, channel);
            return;
        }

        if new_chcr.mode() == 3 {
            if self.quirks.mode3_coerce_to_chain {
                if !self.mode3_warned {
                    log::warn!("DMA{channel:?} started with undefined MOD=3, treating as chain");
                    self.mode3_warned = true;
                }
                new_chcr.set_mode(1);
            } else {
                log::error!("DMA{channel:?} started with undefined MOD=3");
            }
        }

        self.channel_mut(channel).chcr = new_chcr;

        log::debug!("DMA{channel:?} CHCR write: {value:08X}");
        log::debug!("  Direction: from_memory={}", new_chcr.from_memory());
        log::debug!("  Mode: {:?}", new_chcr.transfer_mode());
        log::debug!("  TTE: {}, TIE: {}, STR: {}", new_chcr.tte(), new_chcr.tie(), new_chcr.str());

        if !new_chcr.str() {
            return;
        }

        if !self.ctrl.dmae() || self.suspended() {
            // DMAC globally off; remember the start request and replay it on
            // the next enable transition
            log::debug!("DMA{channel:?} start deferred while DMAC is disabled");
            self.queued |= channel.bit();
            self.set_phase(channel, TransferPhase::Queued);
            return;
        }

        self.run_channel(channel, ctx);
    }

    fn run_channel(&mut self, channel: Channel, ctx: &mut DmaContext<'_>) {
        self.set_phase(channel, TransferPhase::Idle);

        match channel {
            Channel::Vif0 | Channel::Vif1 | Channel::Gif => self.run_sink_channel(channel, ctx),
            Channel::IpuFrom => ipu::run_ipu_from_dma(self, ctx.ipu, ctx.memory, ctx.scheduler),
            Channel::IpuTo => ipu::run_ipu_to_dma(self, ctx.ipu, ctx.memory, ctx.scheduler),
            Channel::Sif0 => sif::start_sif0_ee(self, ctx.sif, ctx.memory, ctx.scheduler),
            Channel::Sif1 => sif::start_sif1_ee(self, ctx.sif, ctx.memory, ctx.scheduler),
            Channel::Sif2 => sif::start_sif2_ee(self, ctx.sif, ctx.memory, ctx.scheduler),
            Channel::SprFrom => self.run_spr_from(ctx),
            Channel::SprTo => self.run_spr_to(ctx),
        }
    }

    fn write_ctrl(&mut self, value: u32, ctx: &mut DmaContext<'_>) {
        let was_enabled = self.ctrl.dmae();
        self.ctrl = value.into();

        log::debug!("D_CTRL write: {value:08X} {:?}", self.ctrl);

        if !was_enabled && self.ctrl.dmae() && !self.suspended() {
            self.drain_queued(ctx);
        }
    }

    /// DMAC_STAT multiplexes two write semantics: the lower 16 bits are
    /// status flags cleared by writing 1, the upper 16 bits are mask flags
    /// toggled by writing 1.
    fn write_stat(&mut self, value: u32, interrupt_registers: &mut InterruptRegisters) {
        let raw: u32 = self.stat.into();
        self.stat = ((raw & !(value & 0xFFFF)) ^ (value & 0xFFFF_0000)).into();

        log::debug!("D_STAT write: {value:08X}, now {:?}", self.stat);

        self.update_interrupt_line(interrupt_registers);
    }

    fn write_enablew(&mut self, value: u32, ctx: &mut DmaContext<'_>) {
        let was_suspended = self.suspended();

        self.enablew = value;
        self.enabler = value;

        log::debug!("D_ENABLEW write: {value:08X}");

        if was_suspended && !self.suspended() && self.ctrl.dmae() {
            self.drain_queued(ctx);
        }
    }

    fn drain_queued(&mut self, ctx: &mut DmaContext<'_>) {
        for channel in Channel::ALL {
            if self.queued & channel.bit() == 0 {
                continue;
            }

            self.queued &= !channel.bit();
            if self.channel(channel).chcr.str() {
                log::debug!("Draining queued DMA{channel:?} start");
                self.run_channel(channel, ctx);
            }
        }
    }

    /// Queues the cycle-delayed completion interrupt for a channel whose
    /// transfer has finished. STR stays set until the event fires.
    pub fn schedule_completion(&mut self, channel: Channel, cycles: u32, scheduler: &mut Scheduler) {
        self.set_phase(channel, TransferPhase::Completing);

        // Zero-cycle events would starve the scheduler
        let delay = u64::from(cmp::max(1, cycles));
        scheduler
            .update_or_push_event(SchedulerEvent::ee_dma_finish(channel, scheduler.cpu_cycle_counter() + delay));
    }

    /// Completion event handler: clears STR, raises the channel's interrupt
    /// status bit, and updates the INT1 line.
    pub fn on_ee_finish_event(
        &mut self,
        channel: Channel,
        interrupt_registers: &mut InterruptRegisters,
    ) {
        if !self.channel(channel).chcr.str() {
            // Channel was force-stopped after the event was queued; the event
            // should have been cancelled, but be tolerant
            return;
        }

        log::debug!("DMA{channel:?} transfer complete");

        self.channel_mut(channel).chcr.set_str(false);
        self.set_phase(channel, TransferPhase::Idle);

        self.stat.set_channel_stat(self.stat.channel_stat() | channel.bit());
        self.update_interrupt_line(interrupt_registers);
    }

    fn update_interrupt_line(&mut self, interrupt_registers: &mut InterruptRegisters) {
        let pending = (self.stat.channel_stat() & self.stat.channel_mask()) != 0
            || (self.stat.sis() && self.stat.sim())
            || (self.stat.meis() && self.stat.meim());
        interrupt_registers.set_dmac_irq_line(pending);
    }

    /// Bus-error abort: a tag or data address resolved to no backing memory.
    /// Recorded as the BEIS status bit; the channel halts, the host does not.
    pub fn bus_error(&mut self, channel: Channel, scheduler: &mut Scheduler) {
        log::error!(
            "DMA{channel:?} bus error: address {:08X} has no backing memory",
            self.channel(channel).madr
        );

        self.stat.set_beis(true);
        self.channel_mut(channel).chcr.set_str(false);
        self.set_phase(channel, TransferPhase::Idle);
        self.set_chain_end_pending(channel, false);
        scheduler.remove_event(SchedulerEventType::EeDmaFinish(channel));
    }

    /// Records the stall-control address as a stall-source channel makes
    /// progress (REFS drain channels compare against it).
    pub fn update_stall_address(&mut self, channel: Channel, address: u32) {
        let source = match self.ctrl.sts() {
            1 => Channel::Sif0,
            2 => Channel::SprFrom,
            3 => Channel::IpuFrom,
            _ => return,
        };

        if channel == source {
            self.stadr = address;
        }
    }

    pub fn stall_address(&self) -> u32 {
        self.stadr
    }

    // D0-D2: the VIF/GIF channels push quadwords into their peripheral unit.
    // The units themselves (VIF command decode, GIF path arbitration) are
    // external to this core; they consume everything they are handed.
    fn run_sink_channel(&mut self, channel: Channel, ctx: &mut DmaContext<'_>) {
        if !self.channel(channel).chcr.from_memory() {
            log::warn!("DMA{channel:?} started peripheral-to-memory; unit has no data source");
            self.schedule_completion(channel, 1, ctx.scheduler);
            return;
        }

        match self.channel(channel).chcr.transfer_mode() {
            TransferMode::Normal => {
                let count = normal_mode_qwc(self.channel(channel).qwc);
                let Some(transferred) = self.sink_transfer(channel, count, ctx) else {
                    return;
                };

                let regs = self.channel_mut(channel);
                regs.qwc = 0;
                self.schedule_completion(channel, transferred * 2, ctx.scheduler);
            }
            TransferMode::Chain => {
                let mut total = 0;
                let mut links = 0;

                loop {
                    let count = self.channel(channel).qwc;
                    if count > 0 {
                        let Some(transferred) = self.sink_transfer(channel, count, ctx) else {
                            return;
                        };
                        total += transferred;
                        self.channel_mut(channel).qwc = 0;
                    }

                    links += 1;
                    if links > CHAIN_LINK_LIMIT {
                        log::error!("DMA{channel:?} chain exceeded {CHAIN_LINK_LIMIT} links, stopping");
                        break;
                    }

                    match self.walk_source_chain(channel, ctx.memory, ctx.scheduler) {
                        Some(ChainAction::Continue) => {}
                        Some(ChainAction::LastTransfer) => {
                            let count = self.channel(channel).qwc;
                            if count > 0 {
                                let Some(transferred) = self.sink_transfer(channel, count, ctx)
                                else {
                                    return;
                                };
                                total += transferred;
                                self.channel_mut(channel).qwc = 0;
                            }
                            break;
                        }
                        None => return,
                    }
                }

                self.schedule_completion(channel, total * 2, ctx.scheduler);
            }
            TransferMode::Interleave => {
                log::error!("DMA{channel:?} does not support interleave mode");
                self.schedule_completion(channel, 1, ctx.scheduler);
            }
        }
    }

    /// Moves `count` quadwords from MADR into the channel's peripheral unit.
    /// Returns `None` after flagging a bus error.
    fn sink_transfer(
        &mut self,
        channel: Channel,
        count: u32,
        ctx: &mut DmaContext<'_>,
    ) -> Option<u32> {
        let madr = self.channel(channel).madr;
        let Some(mut address) = ctx.memory.dma_resolve(madr, false) else {
            self.bus_error(channel, ctx.scheduler);
            return None;
        };

        for _ in 0..count {
            let quadword = ctx.memory.dma_read_quadword(address);
            match channel {
                Channel::Gif => ctx.gif.receive(quadword),
                Channel::Vif0 => ctx.vif0.receive(quadword),
                Channel::Vif1 => ctx.vif1.receive(quadword),
                _ => unreachable!("sink_transfer is only called for VIF/GIF channels"),
            }
            address = address.offset_quadwords(1);
        }

        let regs = self.channel_mut(channel);
        regs.madr = regs.madr.wrapping_add(count * 16);
        self.update_stall_address(channel, self.channel(channel).madr);

        Some(count)
    }

    /// Fetches and applies the next source-chain tag for a channel. Returns
    /// `None` after flagging a bus error; honors TIE + the tag IRQ bit by
    /// converting `Continue` into `LastTransfer`.
    pub fn walk_source_chain(
        &mut self,
        channel: Channel,
        memory: &Memory,
        scheduler: &mut Scheduler,
    ) -> Option<ChainAction> {
        let regs = self.channel_mut(channel);
        let Some((tag, _raw)) = tag::fetch_source_tag(regs, memory) else {
            self.bus_error(channel, scheduler);
            return None;
        };

        let action = tag::apply_source_tag(regs, tag);

        log::trace!(
            "DMA{channel:?} tag: id={:?} qwc={:04X} addr={:08X} irq={}",
            tag.id(),
            tag.qwc(),
            tag.addr(),
            tag.irq()
        );

        if tag.irq() && regs.chcr.tie() {
            return Some(ChainAction::LastTransfer);
        }

        Some(action)
    }

    // D8: scratchpad-to-RAM. Normal and interleave modes only.
    fn run_spr_from(&mut self, ctx: &mut DmaContext<'_>) {
        let channel = Channel::SprFrom;

        match self.channel(channel).chcr.transfer_mode() {
            TransferMode::Normal => {
                let count = normal_mode_qwc(self.channel(channel).qwc);
                if self.spr_copy_to_ram(count, ctx).is_none() {
                    return;
                }

                self.channel_mut(channel).qwc = 0;
                self.update_stall_address(channel, self.channel(channel).madr);
                self.schedule_completion(channel, count * 2, ctx.scheduler);
            }
            TransferMode::Interleave => {
                let Some(total) = self.run_spr_interleave(channel, ctx) else {
                    return;
                };
                self.schedule_completion(channel, total * 2, ctx.scheduler);
            }
            TransferMode::Chain => {
                log::error!("DMA{channel:?} does not support chain mode, treating as normal");
                let count = normal_mode_qwc(self.channel(channel).qwc);
                if self.spr_copy_to_ram(count, ctx).is_none() {
                    return;
                }
                self.channel_mut(channel).qwc = 0;
                self.schedule_completion(channel, count * 2, ctx.scheduler);
            }
        }
    }

    // D9: RAM-to-scratchpad. Normal, chain, and interleave modes.
    fn run_spr_to(&mut self, ctx: &mut DmaContext<'_>) {
        let channel = Channel::SprTo;

        match self.channel(channel).chcr.transfer_mode() {
            TransferMode::Normal => {
                let count = normal_mode_qwc(self.channel(channel).qwc);
                if self.spr_copy_from_ram(count, ctx).is_none() {
                    return;
                }

                self.channel_mut(channel).qwc = 0;
                self.schedule_completion(channel, count * 2, ctx.scheduler);
            }
            TransferMode::Interleave => {
                let Some(total) = self.run_spr_interleave(channel, ctx) else {
                    return;
                };
                self.schedule_completion(channel, total * 2, ctx.scheduler);
            }
            TransferMode::Chain => {
                let mut total = 0;
                let mut links = 0;

                loop {
                    let count = self.channel(channel).qwc;
                    if count > 0 {
                        if self.spr_copy_from_ram(count, ctx).is_none() {
                            return;
                        }
                        total += count;
                        self.channel_mut(channel).qwc = 0;
                    }

                    links += 1;
                    if links > CHAIN_LINK_LIMIT {
                        log::error!("DMA{channel:?} chain exceeded {CHAIN_LINK_LIMIT} links, stopping");
                        break;
                    }

                    match self.walk_source_chain(channel, ctx.memory, ctx.scheduler) {
                        Some(ChainAction::Continue) => {}
                        Some(ChainAction::LastTransfer) => {
                            let count = self.channel(channel).qwc;
                            if count > 0 {
                                if self.spr_copy_from_ram(count, ctx).is_none() {
                                    return;
                                }
                                total += count;
                                self.channel_mut(channel).qwc = 0;
                            }
                            break;
                        }
                        None => return,
                    }
                }

                self.schedule_completion(channel, total * 2, ctx.scheduler);
            }
        }
    }

    /// Interleave mode: alternately transfer `transfer_qwc` quadwords and
    /// skip `skip_qwc` quadwords of the RAM-side address, with the
    /// scratchpad-side address advancing contiguously.
    fn run_spr_interleave(&mut self, channel: Channel, ctx: &mut DmaContext<'_>) -> Option<u32> {
        let chunk = u32::from(self.sqwc.transfer_qwc());
        let skip = u32::from(self.sqwc.skip_qwc());

        if chunk == 0 {
            log::warn!("DMA{channel:?} interleave with TQWC=0, transferring whole QWC");
        }

        let mut total = 0;
        while self.channel(channel).qwc > 0 {
            let count = if chunk == 0 {
                self.channel(channel).qwc
            } else {
                cmp::min(chunk, self.channel(channel).qwc)
            };

            let moved = match channel {
                Channel::SprFrom => self.spr_copy_to_ram(count, ctx),
                Channel::SprTo => self.spr_copy_from_ram(count, ctx),
                _ => unreachable!("interleave is only used by the SPR channels"),
            };
            moved?;

            let regs = self.channel_mut(channel);
            regs.qwc -= count;
            regs.madr = regs.madr.wrapping_add(skip * 16);
            total += count;
        }

        Some(total)
    }

    /// Copies `count` quadwords from scratchpad (SADR) to RAM (MADR),
    /// advancing both. Returns `None` after flagging a bus error.
    fn spr_copy_to_ram(&mut self, count: u32, ctx: &mut DmaContext<'_>) -> Option<()> {
        let channel = Channel::SprFrom;
        let madr = self.channel(channel).madr;
        let Some(mut dest) = ctx.memory.dma_resolve(madr, false) else {
            self.bus_error(channel, ctx.scheduler);
            return None;
        };

        let mut sadr = self.channel(channel).sadr;
        for _ in 0..count {
            let quadword = ctx.memory.read_scratchpad_quadword(sadr);
            ctx.memory.dma_write_quadword(dest, quadword);
            dest = dest.offset_quadwords(1);
            sadr = sadr.wrapping_add(16) & 0x3FF0;
        }

        let regs = self.channel_mut(channel);
        regs.sadr = sadr;
        regs.madr = regs.madr.wrapping_add(count * 16);

        Some(())
    }

    /// Copies `count` quadwords from RAM (MADR) to scratchpad (SADR).
    fn spr_copy_from_ram(&mut self, count: u32, ctx: &mut DmaContext<'_>) -> Option<()> {
        let channel = Channel::SprTo;
        let madr = self.channel(channel).madr;
        let Some(mut src) = ctx.memory.dma_resolve(madr, false) else {
            self.bus_error(channel, ctx.scheduler);
            return None;
        };

        let mut sadr = self.channel(channel).sadr;
        for _ in 0..count {
            let quadword = ctx.memory.dma_read_quadword(src);
            ctx.memory.write_scratchpad_quadword(sadr, quadword);
            src = src.offset_quadwords(1);
            sadr = sadr.wrapping_add(16) & 0x3FF0;
        }

        let regs = self.channel_mut(channel);
        regs.sadr = sadr;
        regs.madr = regs.madr.wrapping_add(count * 16);

        Some(())
    }
}

/// A NORMAL-mode transfer started with QWC=0 moves a full 0x10000 quadwords
/// and underflows naturally; this is documented hardware behavior that games
/// rely on, not a no-op.
pub fn normal_mode_qwc(qwc: u32) -> u32 {
    if qwc == 0 { 0x10000 } else { qwc }
}

/// Stand-in for the GIF path arbitration + GS interface, which are external
/// to this core. Consumes everything the GIF channel hands it.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct GifUnit {
    pub quadwords_received: u64,
    pub last_quadword: u128,
}

impl GifUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, quadword: u128) {
        self.quadwords_received += 1;
        self.last_quadword = quadword;

        log::trace!("GIF received quadword {quadword:032X}");
    }
}

/// Stand-in for a VIF command decoder, likewise external to this core.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct VifUnit {
    pub quadwords_received: u64,
    pub last_quadword: u128,
}

impl VifUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, quadword: u128) {
        self.quadwords_received += 1;
        self.last_quadword = quadword;

        log::trace!("VIF received quadword {quadword:032X}");
    }
}
