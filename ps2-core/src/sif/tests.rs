use super::*;
use crate::dmac::{DmaContext, GifUnit, VifUnit};
use crate::interrupts::InterruptRegisters;
use crate::ipu::ImageProcessor;
use crate::quirks::Quirks;

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
        Self::with_quirks(Quirks::default())
    }

    fn with_quirks(quirks: Quirks) -> Self {
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
            dmac: DmaController::new(quirks),
        };

        harness.ee_write(0x1000_E000, 1);
        harness.ee_write(0x1000_E010, 0x03FF_0000);
        harness
    }

    fn ee_write(&mut self, address: u32, value: u32) {
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

    fn iop_write(&mut self, address: u32, value: u32) {
        write_iop_dma_register(
            &mut self.sif,
            &mut self.dmac,
            &mut self.memory,
            &mut self.scheduler,
            address,
            value,
        );
    }

    fn tick(&mut self, cycles: u64) {
        self.scheduler.increment_cpu_cycles(cycles);
        while let Some(event) = self.scheduler.pop_ready_event() {
            match event.event_type {
                SchedulerEventType::EeDmaFinish(channel) => {
                    self.dmac.on_ee_finish_event(channel, &mut self.interrupt_registers);
                }
                SchedulerEventType::IopDmaFinish(channel) => {
                    on_iop_finish(&mut self.sif, channel, &mut self.iop_interrupt_registers);
                }
            }
        }
    }

    /// One SIF0 tag in IOP RAM: data address + flags, word count, and the EE
    /// destination tag in the high half.
    fn write_sif0_tag(&mut self, tadr: u32, data_addr: u32, words: u32, ee_tag: (u32, u32)) {
        self.memory.write_iop_ram_u32(tadr, data_addr | IOP_TAG_END);
        self.memory.write_iop_ram_u32(tadr + 4, words);
        self.memory.write_iop_ram_u32(tadr + 8, ee_tag.0);
        self.memory.write_iop_ram_u32(tadr + 12, ee_tag.1);
    }
}

#[test]
fn sif0_pump_moves_data_in_order_through_small_fifo() {
    let mut harness = Harness::new();

    // 16 quadwords (64 words): twice the FIFO's capacity, forcing the pump
    // to interleave fill and drain
    for i in 0..64u32 {
        harness.memory.write_iop_ram_u32(0x1000 + i * 4, 0x1111_0000 + i);
    }
    // EE destination tag: qwc=16, id=END, MADR 0x40000
    harness.write_sif0_tag(0x2000, 0x1000, 64, (0x7000_0010, 0x0004_0000));

    // EE side up first (destination chain); it parks on the empty FIFO
    harness.ee_write(Channel::Sif0.register_base(), 0x104);
    assert!(harness.sif.sif0.ee.busy);

    // IOP side start drives the whole interleaved pump
    harness.iop_write(DMA9_TADR, 0x2000);
    harness.iop_write(DMA9_CHCR, IOP_CHCR_START);

    for i in 0..64u32 {
        assert_eq!(harness.memory.read_main_ram_u32(0x40000 + i * 4), 0x1111_0000 + i);
    }
    assert!(!harness.sif.sif0.ee.busy);
    assert!(!harness.sif.sif0.iop.busy);
    assert_eq!(harness.sif.sif0.fifo.len(), 0);
    assert_eq!(harness.dmac.channel(Channel::Sif0).qwc, 0);

    harness.tick(10_000);
    assert!(!harness.dmac.channel(Channel::Sif0).chcr.str());
    assert!(!harness.sif.dma9.started());
    assert!(harness.iop_interrupt_registers.read_interrupt_flag(IopInterruptType::Dma));
    assert!(harness.interrupt_registers.int1_pending());
}

#[test]
fn sif0_pads_odd_word_counts_with_junk() {
    let mut harness = Harness::new();

    for i in 0..6u32 {
        harness.memory.write_iop_ram_u32(0x1000 + i * 4, 0x2222_0000 + i);
    }
    // 6 words round up to 2 quadwords; the EE tag asks for 2
    harness.write_sif0_tag(0x2000, 0x1000, 6, (0x7000_0002, 0x0005_0000));

    harness.ee_write(Channel::Sif0.register_base(), 0x104);
    harness.iop_write(DMA9_TADR, 0x2000);
    harness.iop_write(DMA9_CHCR, IOP_CHCR_START);

    for i in 0..6u32 {
        assert_eq!(harness.memory.read_main_ram_u32(0x50000 + i * 4), 0x2222_0000 + i);
    }
    // Alignment padding, not stale data
    assert_eq!(harness.memory.read_main_ram_u32(0x50000 + 24), 0);
    assert_eq!(harness.memory.read_main_ram_u32(0x50000 + 28), 0);
    assert!(!harness.sif.sif0.ee.busy);
    assert!(!harness.sif.sif0.iop.busy);
}

#[test]
fn sif0_iop_cycle_halving_quirk_changes_completion_timing() {
    // 64 words accumulate 8 IOP cycles; the quirk halves that to 4
    let run = |quirks: Quirks| {
        let mut harness = Harness::with_quirks(quirks);
        for i in 0..64u32 {
            harness.memory.write_iop_ram_u32(0x1000 + i * 4, i);
        }
        harness.write_sif0_tag(0x2000, 0x1000, 64, (0x7000_0010, 0x0004_0000));
        harness.ee_write(Channel::Sif0.register_base(), 0x104);
        harness.iop_write(DMA9_TADR, 0x2000);
        harness.iop_write(DMA9_CHCR, IOP_CHCR_START);
        harness
    };

    let mut with_quirk = run(Quirks::default());
    with_quirk.tick(4);
    assert!(with_quirk.iop_interrupt_registers.read_interrupt_flag(IopInterruptType::Dma));

    let mut without_quirk =
        run(Quirks { sif0_iop_cycle_halving: false, ..Quirks::default() });
    without_quirk.tick(4);
    assert!(!without_quirk.iop_interrupt_registers.read_interrupt_flag(IopInterruptType::Dma));
    without_quirk.tick(4);
    assert!(without_quirk.iop_interrupt_registers.read_interrupt_flag(IopInterruptType::Dma));
}

#[test]
fn sif1_chain_with_tte_delivers_iop_tags_through_fifo() {
    let mut harness = Harness::new();

    // EE source chain: one END tag, qwc=2, whose high half is the IOP tag
    // (destination 0x2000, 8 words, end flag)
    let low = 2_u64 | (7 << 28);
    let high = u64::from(0x8000_2000_u32) | (8_u64 << 32);
    harness
        .memory
        .write_main_ram_quadword(0x3000, (u128::from(high) << 64) | u128::from(low));
    for i in 0..8u32 {
        harness.memory.write_main_ram_u32(0x3010 + i * 4, 0x3333_0000 + i);
    }

    // IOP side waits for its FIFO-borne tag
    harness.iop_write(DMA10_CHCR, IOP_CHCR_START);
    assert!(harness.sif.sif1.iop.busy);

    // EE side: chain mode with TTE; pumping drains everything to the IOP
    let base = Channel::Sif1.register_base();
    harness.ee_write(base + 0x30, 0x3000);
    harness.ee_write(base, 0x145);

    for i in 0..8u32 {
        assert_eq!(harness.memory.read_iop_ram_u32(0x2000 + i * 4), 0x3333_0000 + i);
    }
    assert!(!harness.sif.sif1.ee.busy);
    assert!(!harness.sif.sif1.iop.busy);
    assert_eq!(harness.sif.sif1.fifo.len(), 0);

    harness.tick(10_000);
    assert!(!harness.dmac.channel(Channel::Sif1).chcr.str());
    assert!(!harness.sif.dma10.started());
    assert!(harness.iop_interrupt_registers.read_interrupt_flag(IopInterruptType::Dma));
}

#[test]
fn sif2_block_transfer_ee_to_iop() {
    let mut harness = Harness::new();

    for i in 0..8u32 {
        harness.memory.write_main_ram_u32(0x6000 + i * 4, 0x4444_0000 + i);
    }

    let base = Channel::Sif2.register_base();
    harness.ee_write(base + 0x10, 0x6000);
    harness.ee_write(base + 0x20, 2);
    // from_memory, normal mode, STR: fills the FIFO and finishes the EE side
    harness.ee_write(base, 0x101);

    // IOP side: BCR sized for 8 words into 0x7000
    harness.iop_write(DMA2_MADR, 0x7000);
    harness.iop_write(DMA2_BCR, (2 << 16) | 4);
    harness.iop_write(DMA2_CHCR, IOP_CHCR_START);

    for i in 0..8u32 {
        assert_eq!(harness.memory.read_iop_ram_u32(0x7000 + i * 4), 0x4444_0000 + i);
    }
    assert!(!harness.sif.sif2.ee.busy);
    assert!(!harness.sif.sif2.iop.busy);

    harness.tick(10_000);
    assert!(!harness.dmac.channel(Channel::Sif2).chcr.str());
    assert!(!harness.sif.dma2.started());
}

#[test]
fn sif2_block_transfer_iop_to_ee() {
    let mut harness = Harness::new();

    for i in 0..8u32 {
        harness.memory.write_iop_ram_u32(0x8000 + i * 4, 0x5555_0000 + i);
    }

    // EE side: to-memory normal transfer of 2 quadwords
    let base = Channel::Sif2.register_base();
    harness.ee_write(base + 0x10, 0x60000);
    harness.ee_write(base + 0x20, 2);
    harness.ee_write(base, 0x100);

    harness.iop_write(DMA2_MADR, 0x8000);
    harness.iop_write(DMA2_BCR, (2 << 16) | 4);
    harness.iop_write(DMA2_CHCR, IOP_CHCR_START);

    for i in 0..8u32 {
        assert_eq!(harness.memory.read_main_ram_u32(0x60000 + i * 4), 0x5555_0000 + i);
    }
    assert!(!harness.sif.sif2.ee.busy);
    assert!(!harness.sif.sif2.iop.busy);
}

#[test]
fn stopping_iop_side_cancels_its_completion_event() {
    let mut harness = Harness::new();

    for i in 0..64u32 {
        harness.memory.write_iop_ram_u32(0x1000 + i * 4, i);
    }
    harness.write_sif0_tag(0x2000, 0x1000, 64, (0x7000_0010, 0x0004_0000));

    harness.ee_write(Channel::Sif0.register_base(), 0x104);
    harness.iop_write(DMA9_TADR, 0x2000);
    harness.iop_write(DMA9_CHCR, IOP_CHCR_START);

    // The transfer has fully drained; a completion event is pending
    assert!(harness.scheduler.event_scheduled(SchedulerEventType::IopDmaFinish(SifChannel::Sif0)));

    // Clearing the start bit cancels it
    harness.iop_write(DMA9_CHCR, 0);
    assert!(!harness.scheduler.event_scheduled(SchedulerEventType::IopDmaFinish(SifChannel::Sif0)));

    harness.tick(1_000_000);
    assert!(!harness.iop_interrupt_registers.read_interrupt_flag(IopInterruptType::Dma));
}
