//! Top-level system aggregate and public API

use crate::bus::Bus;
use crate::dmac::{Channel, DmaController, GifUnit, VifUnit};
use crate::interrupts::{InterruptRegisters, IopInterruptRegisters};
use crate::ipu::{self, ImageProcessor};
use crate::memory::{self, Memory};
use crate::quirks::Quirks;
use crate::scheduler::{Scheduler, SchedulerEventType};
use crate::sif::{self, SifBridge};
use crate::vtlb::{HandlerKind, PageTarget, Vtlb};
use bincode::{Decode, Encode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Ps2Error {
    #[error("RAM image larger than main RAM (32MB): was {image_len} bytes")]
    IncorrectRamImageSize { image_len: usize },
    #[error("Error encoding save state: {0}")]
    SaveStateEncode(#[from] bincode::error::EncodeError),
    #[error("Error decoding save state: {0}")]
    SaveStateDecode(#[from] bincode::error::DecodeError),
}

pub type Ps2Result<T> = Result<T, Ps2Error>;

/// Everything the DMA/memory core owns: the register files, channel state,
/// FIFOs, scheduler, and the VTLB. The CPUs are external; they drive this
/// through [`System::bus`] and [`System::tick`].
pub struct System {
    memory: Memory,
    dmac: DmaController,
    sif: SifBridge,
    ipu: ImageProcessor,
    gif: GifUnit,
    vif0: VifUnit,
    vif1: VifUnit,
    interrupt_registers: InterruptRegisters,
    iop_interrupt_registers: IopInterruptRegisters,
    scheduler: Scheduler,
    vtlb: Vtlb,
}

impl System {
    pub fn new() -> Self {
        Self::with_quirks(Quirks::default())
    }

    pub fn with_quirks(quirks: Quirks) -> Self {
        let mut vtlb = Vtlb::new();
        map_address_space(&mut vtlb);
        vtlb.init_dispatch();

        Self {
            memory: Memory::new(),
            dmac: DmaController::new(quirks),
            sif: SifBridge::new(),
            ipu: ImageProcessor::new(),
            gif: GifUnit::new(),
            vif0: VifUnit::new(),
            vif1: VifUnit::new(),
            interrupt_registers: InterruptRegisters::new(),
            iop_interrupt_registers: IopInterruptRegisters::new(),
            scheduler: Scheduler::new(),
            vtlb,
        }
    }

    pub fn load_ram_image(&mut self, image: &[u8]) -> Ps2Result<()> {
        self.memory.load_main_ram_image(image)
    }

    pub fn bus(&mut self) -> Bus<'_> {
        Bus {
            memory: &mut self.memory,
            dmac: &mut self.dmac,
            sif: &mut self.sif,
            ipu: &mut self.ipu,
            gif: &mut self.gif,
            vif0: &mut self.vif0,
            vif1: &mut self.vif1,
            interrupt_registers: &mut self.interrupt_registers,
            iop_interrupt_registers: &mut self.iop_interrupt_registers,
            scheduler: &mut self.scheduler,
            vtlb: &mut self.vtlb,
        }
    }

    /// Advances emulated time and services any completion events that come
    /// due. The external CPU loop calls this between instruction batches.
    pub fn tick(&mut self, cpu_cycles: u64) {
        self.scheduler.increment_cpu_cycles(cpu_cycles);
        self.process_ready_events();
    }

    fn process_ready_events(&mut self) {
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

    /// Raises or lowers the IPU decoder's data request, waking a parked
    /// RAM-to-IPU channel when it goes high.
    pub fn set_ipu_data_request(&mut self, requested: bool) {
        if self.ipu.set_data_request(requested) {
            ipu::wake_ipu_channel(
                Channel::IpuTo,
                &mut self.dmac,
                &mut self.ipu,
                &mut self.memory,
                &mut self.scheduler,
            );
        }
    }

    /// Decoder-side pop of one input quadword; wakes a channel parked on a
    /// full input FIFO.
    pub fn ipu_consume_input(&mut self) -> Option<u128> {
        let (quadword, wake) = self.ipu.consume_input()?;
        if wake {
            ipu::wake_ipu_channel(
                Channel::IpuTo,
                &mut self.dmac,
                &mut self.ipu,
                &mut self.memory,
                &mut self.scheduler,
            );
        }
        Some(quadword)
    }

    /// Decoder-side push of one output quadword; wakes a channel parked on
    /// an empty output FIFO.
    pub fn ipu_produce_output(&mut self, quadword: u128) {
        if self.ipu.produce_output(quadword) {
            ipu::wake_ipu_channel(
                Channel::IpuFrom,
                &mut self.dmac,
                &mut self.ipu,
                &mut self.memory,
                &mut self.scheduler,
            );
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn dmac(&self) -> &DmaController {
        &self.dmac
    }

    pub fn interrupt_registers(&self) -> &InterruptRegisters {
        &self.interrupt_registers
    }

    pub fn iop_interrupt_registers(&self) -> &IopInterruptRegisters {
        &self.iop_interrupt_registers
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn gif(&self) -> &GifUnit {
        &self.gif
    }

    /// Serializes all register/channel/FIFO state. Memory contents are not
    /// included; callers snapshot RAM separately. Field order is the binary
    /// layout, so it must not be reordered without versioning.
    pub fn save_state(&self) -> Ps2Result<Vec<u8>> {
        let state = SaveState {
            dmac: self.dmac.clone(),
            sif: self.sif.clone(),
            ipu: self.ipu.clone(),
            gif: self.gif.clone(),
            vif0: self.vif0.clone(),
            vif1: self.vif1.clone(),
            interrupt_registers: self.interrupt_registers.clone(),
            iop_interrupt_registers: self.iop_interrupt_registers.clone(),
            scheduler: self.scheduler.clone(),
        };

        Ok(bincode::encode_to_vec(state, bincode::config::standard())?)
    }

    pub fn load_state(&mut self, bytes: &[u8]) -> Ps2Result<()> {
        let (state, _): (SaveState, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;

        self.dmac = state.dmac;
        self.sif = state.sif;
        self.ipu = state.ipu;
        self.gif = state.gif;
        self.vif0 = state.vif0;
        self.vif1 = state.vif1;
        self.interrupt_registers = state.interrupt_registers;
        self.iop_interrupt_registers = state.iop_interrupt_registers;
        self.scheduler = state.scheduler;

        Ok(())
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Encode, Decode)]
struct SaveState {
    dmac: DmaController,
    sif: SifBridge,
    ipu: ImageProcessor,
    gif: GifUnit,
    vif0: VifUnit,
    vif1: VifUnit,
    interrupt_registers: InterruptRegisters,
    iop_interrupt_registers: IopInterruptRegisters,
    scheduler: Scheduler,
}

/// The EE's fixed address map: main RAM with its cached/uncached mirrors,
/// scratchpad, the IOP RAM window, and the hardware register pages.
fn map_address_space(vtlb: &mut Vtlb) {
    let ram_len = memory::MAIN_RAM_LEN as u32;
    for base in [0x0000_0000, 0x2000_0000, 0x3000_0000, 0x8000_0000, 0xA000_0000] {
        vtlb.map_direct(base, ram_len, PageTarget::MainRam, 0);
    }

    vtlb.map_direct(0x7000_0000, memory::SCRATCHPAD_LEN as u32, PageTarget::Scratchpad, 0);

    let iop_len = memory::IOP_RAM_LEN as u32;
    vtlb.map_direct(0x1C00_0000, iop_len, PageTarget::IopRam, 0);
    vtlb.map_direct(0xBC00_0000, iop_len, PageTarget::IopRam, 0);

    for base in [0x1000_0000, 0xB000_0000] {
        vtlb.map_handler(base + 0x8000, 0x6000, HandlerKind::DmacChannelPage, 0x1000_8000);
        vtlb.map_handler(base + 0xE000, 0x1000, HandlerKind::DmacCommonPage, 0x1000_E000);
        vtlb.map_handler(base + 0xF000, 0x1000, HandlerKind::ControlPage, 0x1000_F000);
    }
}
