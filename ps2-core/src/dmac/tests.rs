use super::*;
use crate::interrupts::IopInterruptRegisters;
use crate::sif;

struct Harness {
    memory: Memory,
    sif: SifBridge,
    ipu: ImageProcessor,
    gif: GifUnit,
    vif0: VifUnit,
    vif1: VifUnit,
    interrupt_registers: InterruptRegisters,
    iop_interrupt_registers: IopInterruptRegisters,
    scheduler: Scheduler,
    dmac: DmaController,
}

impl Harness {
    fn new() -> Self {
        let mut harness = Self {
            memory: Memory::new(),
            sif: SifBridge::new(),
            ipu: ImageProcessor::new(),
            gif: GifUnit::new(),
            vif0: VifUnit::new(),
            vif1: VifUnit::new(),
            interrupt_registers: InterruptRegisters::new(),
            iop_interrupt_registers: IopInterruptRegisters::new(),
            scheduler: Scheduler::new(),
            dmac: DmaController::new(Quirks::default()),
        };

        // DMAE on, all channel completion interrupts unmasked
        harness.write_register(DMAC_CTRL, 1);
        harness.write_register(DMAC_STAT, 0x03FF_0000);

        harness
    }

    fn write_register(&mut self, address: u32, value: u32) {
        let mut ctx = DmaContext {
            memory: &mut self.memory,
            sif: &mut self.sif,
            ipu: &mut self.ipu,
            gif: &mut self.gif,
            vif0: &mut self.vif0,
            vif1: &mut self.vif1,
            interrupt_registers: &mut self.interrupt_registers,
            scheduler: &mut self.scheduler,
        };
        self.dmac.write_register(address, value, &mut ctx);
    }

    fn read_register(&self, address: u32) -> u32 {
        self.dmac.read_register(address)
    }

    fn tick(&mut self, cycles: u64) {
        self.scheduler.increment_cpu_cycles(cycles);
        while let Some(event) = self.scheduler.pop_ready_event() {
            match event.event_type {
                SchedulerEventType::EeDmaFinish(channel) => {
                    self.dmac.on_ee_finish_event(channel, &mut self.interrupt_registers);
                }
                SchedulerEventType::IopDmaFinish(channel) => {
                    sif::on_iop_finish(&mut self.sif, channel, &mut self.iop_interrupt_registers);
                }
            }
        }
    }

    /// Writes one 16-byte source-chain tag at `address`.
    fn write_tag(&mut self, address: u32, qwc: u16, id: u8, addr: u32, irq: bool) {
        let low = u64::from(qwc)
            | (u64::from(id & 7) << 28)
            | (u64::from(irq) << 31)
            | (u64::from(addr) << 32);
        self.memory.write_main_ram_quadword(address, u128::from(low));
    }
}

#[test]
fn chain_of_cnt_links_terminates() {
    let mut harness = Harness::new();

    // CNT(1) at 0x1000, CNT(2) at 0x1020, END(1) at 0x1050; data follows
    // each tag inline
    for i in 0..8u32 {
        harness.memory.write_main_ram_quadword(0x1000 + i * 16, (u128::from(i) << 64) | 0xDEAD);
    }
    harness.write_tag(0x1000, 1, 1, 0, false);
    harness.write_tag(0x1020, 2, 1, 0, false);
    harness.write_tag(0x1050, 1, 7, 0, false);

    let base = Channel::Gif.register_base();
    harness.write_register(base + 0x30, 0x1000);
    harness.write_register(base + 0x20, 0);
    // from_memory, chain mode, STR
    harness.write_register(base, 0x105);

    assert_eq!(harness.gif.quadwords_received, 4);
    assert!(harness.dmac.channel(Channel::Gif).chcr.str());

    harness.tick(1000);

    assert!(!harness.dmac.channel(Channel::Gif).chcr.str());
    assert_ne!(harness.dmac.stat().channel_stat() & (1 << 2), 0);
    assert!(harness.interrupt_registers.int1_pending());
}

#[test]
fn chain_call_ret_uses_address_stack() {
    let mut harness = Harness::new();

    // CALL(0) at 0x1000 -> subroutine at 0x2000; subroutine transfers one
    // quadword then RETs back to 0x1010, where an END(0) finishes the chain
    harness.write_tag(0x1000, 0, 5, 0x2000, false);
    harness.write_tag(0x1010, 0, 7, 0, false);
    harness.write_tag(0x2000, 1, 6, 0, false);
    harness.memory.write_main_ram_quadword(0x2010, 0xABCD);

    let base = Channel::Gif.register_base();
    harness.write_register(base + 0x30, 0x1000);
    harness.write_register(base, 0x105);

    assert_eq!(harness.gif.quadwords_received, 1);
    assert_eq!(harness.gif.last_quadword, 0xABCD);
    assert_eq!(harness.dmac.channel(Channel::Gif).chcr.asp(), 0);

    harness.tick(1000);
    assert!(!harness.dmac.channel(Channel::Gif).chcr.str());
}

#[test]
fn zero_qwc_normal_mode_transfers_0x10000_quadwords() {
    let mut harness = Harness::new();

    let base = Channel::Gif.register_base();
    harness.write_register(base + 0x10, 0x10000);
    harness.write_register(base + 0x20, 0);
    // from_memory, normal mode, STR
    harness.write_register(base, 0x101);

    assert_eq!(harness.gif.quadwords_received, 0x10000);

    harness.tick(0x40000);
    assert_eq!(harness.read_register(base + 0x20), 0);
    assert!(!harness.dmac.channel(Channel::Gif).chcr.str());
}

#[test]
fn chcr_write_while_running_is_rejected() {
    let mut harness = Harness::new();

    let base = Channel::SprTo.register_base();
    harness.write_register(base + 0x10, 0x4000);
    harness.write_register(base + 0x80, 0x100);
    harness.write_register(base + 0x20, 8);
    harness.write_register(base, 0x101);

    // Transfer ran synchronously; STR stays set until the completion event
    let chcr_before = harness.read_register(base);
    let madr_before = harness.read_register(base + 0x10);
    assert_ne!(chcr_before & 0x100, 0);

    // Attempted reconfigure with STR still set must change nothing
    harness.write_register(base, 0x1F5);
    assert_eq!(harness.read_register(base), chcr_before);
    assert_eq!(harness.read_register(base + 0x10), madr_before);

    // Non-CHCR register writes are also rejected while running
    harness.write_register(base + 0x10, 0xBEEF0);
    assert_eq!(harness.read_register(base + 0x10), madr_before);

    harness.tick(1000);
    assert!(!harness.dmac.channel(Channel::SprTo).chcr.str());
}

#[test]
fn clearing_str_cancels_pending_completion() {
    let mut harness = Harness::new();

    let base = Channel::SprTo.register_base();
    harness.write_register(base + 0x10, 0x4000);
    harness.write_register(base + 0x20, 8);
    harness.write_register(base, 0x101);

    assert!(harness.scheduler.event_scheduled(SchedulerEventType::EeDmaFinish(Channel::SprTo)));

    // Force stop before the completion fires
    harness.write_register(base, 0);
    assert!(!harness.scheduler.event_scheduled(SchedulerEventType::EeDmaFinish(Channel::SprTo)));

    // Advance well past the would-be fire point: no interrupt, no status bit
    harness.tick(1_000_000);
    assert_eq!(harness.dmac.stat().channel_stat() & (1 << 9), 0);
    assert!(!harness.interrupt_registers.int1_pending());
}

#[test]
fn start_while_dmac_disabled_queues_until_enable() {
    let mut harness = Harness::new();
    harness.write_register(DMAC_CTRL, 0);

    for i in 0..64u32 {
        harness.memory.write_main_ram_u8(0x5000 + i, i as u8);
    }

    let base = Channel::SprTo.register_base();
    harness.write_register(base + 0x10, 0x5000);
    harness.write_register(base + 0x80, 0);
    harness.write_register(base + 0x20, 4);
    harness.write_register(base, 0x101);

    // Nothing moved yet; the start request is parked
    assert_eq!(harness.dmac.phase(Channel::SprTo), TransferPhase::Queued);
    assert_eq!(harness.memory.read_scratchpad_u32(0), 0);

    // Re-enabling the DMAC drains the queued start without data loss
    harness.write_register(DMAC_CTRL, 1);
    for i in 0..64u32 {
        assert_eq!(harness.memory.read_scratchpad_u8(i), i as u8);
    }

    harness.tick(1000);
    assert!(!harness.dmac.channel(Channel::SprTo).chcr.str());
}

#[test]
fn enablew_suspend_queues_until_resume() {
    let mut harness = Harness::new();
    harness.write_register(DMAC_ENABLEW, 1 << 16);
    assert_eq!(harness.read_register(DMAC_ENABLER), 1 << 16);

    let base = Channel::Gif.register_base();
    harness.write_register(base + 0x10, 0x1000);
    harness.write_register(base + 0x20, 2);
    harness.write_register(base, 0x101);

    assert_eq!(harness.gif.quadwords_received, 0);
    assert_eq!(harness.dmac.phase(Channel::Gif), TransferPhase::Queued);

    harness.write_register(DMAC_ENABLEW, 0);
    assert_eq!(harness.gif.quadwords_received, 2);
}

#[test]
fn stat_write_clears_low_bits_and_toggles_high_bits() {
    let mut harness = Harness::new();

    // Run a transfer to completion so a status bit is set
    let base = Channel::SprTo.register_base();
    harness.write_register(base + 0x20, 1);
    harness.write_register(base, 0x101);
    harness.tick(1000);

    let spr_to_bit = 1 << 9;
    assert_ne!(harness.dmac.stat().channel_stat() & spr_to_bit, 0);

    // Writing 0 is a no-op
    let before: u32 = harness.dmac.stat().into();
    harness.write_register(DMAC_STAT, 0);
    let after: u32 = harness.dmac.stat().into();
    assert_eq!(before, after);

    // Writing 1 to a low bit acknowledges it
    harness.write_register(DMAC_STAT, u32::from(spr_to_bit));
    assert_eq!(harness.dmac.stat().channel_stat() & spr_to_bit, 0);
    assert!(!harness.interrupt_registers.int1_pending());

    // Writing 1 to a high bit toggles the mask
    let mask_before = harness.dmac.stat().channel_mask();
    harness.write_register(DMAC_STAT, u32::from(spr_to_bit) << 16);
    assert_eq!(harness.dmac.stat().channel_mask(), mask_before ^ spr_to_bit);
    harness.write_register(DMAC_STAT, u32::from(spr_to_bit) << 16);
    assert_eq!(harness.dmac.stat().channel_mask(), mask_before);
}

#[test]
fn stat_write_semantics_random_sweep() {
    let mut harness = Harness::new();

    let mut model: u32 = harness.dmac.stat().into();
    for _ in 0..10000 {
        let value: u32 = rand::random();
        harness.write_register(DMAC_STAT, value);

        model = (model & !(value & 0xFFFF)) ^ (value & 0xFFFF_0000);
        let actual: u32 = harness.dmac.stat().into();
        assert_eq!(actual, model);
    }
}

#[test]
fn spr_round_trip_end_to_end() {
    let mut harness = Harness::new();

    for i in 0..64u32 {
        harness.memory.write_main_ram_u8(0x8000 + i, i as u8);
    }

    // RAM -> scratchpad
    let spr_to = Channel::SprTo.register_base();
    harness.write_register(spr_to + 0x10, 0x8000);
    harness.write_register(spr_to + 0x80, 0);
    harness.write_register(spr_to + 0x20, 4);
    harness.write_register(spr_to, 0x101);

    for i in 0..64u32 {
        assert_eq!(harness.memory.read_scratchpad_u8(i), i as u8);
    }
    assert_eq!(harness.read_register(spr_to + 0x20), 0);

    harness.tick(1000);
    assert_eq!(harness.read_register(spr_to) & 0x100, 0);

    // Scratchpad -> RAM
    let spr_from = Channel::SprFrom.register_base();
    harness.write_register(spr_from + 0x10, 0x9000);
    harness.write_register(spr_from + 0x80, 0);
    harness.write_register(spr_from + 0x20, 4);
    harness.write_register(spr_from, 0x100);

    for i in 0..64u32 {
        assert_eq!(harness.memory.read_main_ram_u8(0x9000 + i), i as u8);
    }

    harness.tick(1000);
    assert_eq!(harness.read_register(spr_from) & 0x100, 0);
    assert_eq!(harness.read_register(spr_from + 0x20), 0);
}

#[test]
fn spr_interleave_skips_ram_addresses() {
    let mut harness = Harness::new();

    // TQWC=1, SQWC=1: copy one quadword, skip one, repeated
    harness.write_register(DMAC_SQWC, (1 << 16) | 1);

    for i in 0..4u32 {
        harness.memory.write_scratchpad_quadword(i * 16, u128::from(i + 1));
    }

    let base = Channel::SprFrom.register_base();
    harness.write_register(base + 0x10, 0xA000);
    harness.write_register(base + 0x80, 0);
    harness.write_register(base + 0x20, 4);
    harness.write_register(base, 0x108);

    // Quadwords land at every other quadword address
    for i in 0..4u32 {
        assert_eq!(harness.memory.read_main_ram_quadword(0xA000 + i * 32), u128::from(i + 1));
    }

    harness.tick(1000);
    assert!(!harness.dmac.channel(Channel::SprFrom).chcr.str());
}

#[test]
fn bus_error_sets_beis_and_halts_channel() {
    let mut harness = Harness::new();

    let base = Channel::Gif.register_base();
    // Address beyond main RAM with no SPR flag: no backing store
    harness.write_register(base + 0x10, 0x1F00_0000);
    harness.write_register(base + 0x20, 4);
    harness.write_register(base, 0x101);

    assert!(harness.dmac.stat().beis());
    assert!(!harness.dmac.channel(Channel::Gif).chcr.str());
    assert_eq!(harness.gif.quadwords_received, 0);

    // No completion event fires later
    harness.tick(1_000_000);
    assert_eq!(harness.dmac.stat().channel_stat(), 0);
}

#[test]
fn mode3_is_coerced_to_chain() {
    let mut harness = Harness::new();

    harness.write_tag(0x1000, 1, 7, 0, false);
    harness.memory.write_main_ram_quadword(0x1010, 0x77);

    let base = Channel::Gif.register_base();
    harness.write_register(base + 0x30, 0x1000);
    // MOD=3 (undefined) with STR
    harness.write_register(base, 0x10D);

    assert_eq!(harness.dmac.channel(Channel::Gif).chcr.mode(), 1);
    assert_eq!(harness.gif.quadwords_received, 1);
    assert_eq!(harness.gif.last_quadword, 0x77);
}

#[test]
fn tag_irq_with_tie_ends_chain_early() {
    let mut harness = Harness::new();

    // CNT with the IRQ bit; a second tag follows but must never be fetched
    harness.write_tag(0x1000, 1, 1, 0, true);
    harness.memory.write_main_ram_quadword(0x1010, 0x11);
    harness.write_tag(0x1020, 1, 1, 0, false);
    harness.memory.write_main_ram_quadword(0x1030, 0x22);

    let base = Channel::Gif.register_base();
    harness.write_register(base + 0x30, 0x1000);
    // from_memory, chain, TIE, STR
    harness.write_register(base, 0x185);

    assert_eq!(harness.gif.quadwords_received, 1);
    assert_eq!(harness.gif.last_quadword, 0x11);
}

#[test]
fn save_state_round_trips_register_file() {
    let mut harness = Harness::new();

    let base = Channel::SprTo.register_base();
    harness.write_register(base + 0x10, 0x8000);
    harness.write_register(base + 0x20, 4);

    let encoded =
        bincode::encode_to_vec(harness.dmac.clone(), bincode::config::standard()).unwrap();
    let (decoded, _): (DmaController, usize) =
        bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();

    assert_eq!(decoded.channel(Channel::SprTo).madr, 0x8000);
    assert_eq!(decoded.channel(Channel::SprTo).qwc, 4);
    let original: u32 = harness.dmac.stat().into();
    let round_tripped: u32 = decoded.stat().into();
    assert_eq!(original, round_tripped);
}
