//! The MMIO surface seen by the CPUs
//!
//! EE accesses go through the VTLB: direct pages hit the backing arrays, and
//! handler pages land in the hardware-register match below. IOP accesses use
//! the IOP's flat physical map.

use crate::dmac::{DmaContext, DmaController, GifUnit, VifUnit};
use crate::interrupts::{InterruptRegisters, IopInterruptRegisters};
use crate::ipu::ImageProcessor;
use crate::memory::Memory;
use crate::scheduler::Scheduler;
use crate::sif::{self, SifBridge};
use crate::vtlb::{HandlerKind, LoadKind, LoadResult, StoreResult, StoreWidth, Vtlb};

pub const INTC_STAT: u32 = 0x1000_F000;
pub const INTC_MASK: u32 = 0x1000_F010;

pub const IOP_I_STAT: u32 = 0x1F80_1070;
pub const IOP_I_MASK: u32 = 0x1F80_1074;

pub struct Bus<'a> {
    pub memory: &'a mut Memory,
    pub dmac: &'a mut DmaController,
    pub sif: &'a mut SifBridge,
    pub ipu: &'a mut ImageProcessor,
    pub gif: &'a mut GifUnit,
    pub vif0: &'a mut VifUnit,
    pub vif1: &'a mut VifUnit,
    pub interrupt_registers: &'a mut InterruptRegisters,
    pub iop_interrupt_registers: &'a mut IopInterruptRegisters,
    pub scheduler: &'a mut Scheduler,
    pub vtlb: &'a mut Vtlb,
}

impl Bus<'_> {
    pub fn read_u8(&mut self, vaddr: u32) -> u8 {
        match self.vtlb.load(LoadKind::U8, self.memory, vaddr) {
            LoadResult::Value(value) => value as u8,
            LoadResult::Handler { handler, paddr } => {
                self.read_io_register(handler, paddr) as u8
            }
        }
    }

    pub fn read_u16(&mut self, vaddr: u32) -> u16 {
        match self.vtlb.load(LoadKind::U16, self.memory, vaddr) {
            LoadResult::Value(value) => value as u16,
            LoadResult::Handler { handler, paddr } => {
                self.read_io_register(handler, paddr) as u16
            }
        }
    }

    pub fn read_u32(&mut self, vaddr: u32) -> u32 {
        match self.vtlb.load(LoadKind::U32, self.memory, vaddr) {
            LoadResult::Value(value) => value as u32,
            LoadResult::Handler { handler, paddr } => self.read_io_register(handler, paddr),
        }
    }

    pub fn read_u64(&mut self, vaddr: u32) -> u64 {
        match self.vtlb.load(LoadKind::U64, self.memory, vaddr) {
            LoadResult::Value(value) => value as u64,
            LoadResult::Handler { handler, paddr } => {
                u64::from(self.read_io_register(handler, paddr))
            }
        }
    }

    pub fn read_quadword(&mut self, vaddr: u32) -> u128 {
        match self.vtlb.load(LoadKind::U128, self.memory, vaddr) {
            LoadResult::Value(value) => value,
            LoadResult::Handler { handler, paddr } => {
                u128::from(self.read_io_register(handler, paddr))
            }
        }
    }

    pub fn write_u8(&mut self, vaddr: u32, value: u8) {
        match self.vtlb.store(StoreWidth::Byte, self.memory, vaddr, value.into()) {
            StoreResult::Done => {}
            StoreResult::Handler { handler, paddr } => {
                self.write_io_register(handler, paddr, value.into());
            }
        }
    }

    pub fn write_u16(&mut self, vaddr: u32, value: u16) {
        match self.vtlb.store(StoreWidth::Half, self.memory, vaddr, value.into()) {
            StoreResult::Done => {}
            StoreResult::Handler { handler, paddr } => {
                self.write_io_register(handler, paddr, value.into());
            }
        }
    }

    pub fn write_u32(&mut self, vaddr: u32, value: u32) {
        match self.vtlb.store(StoreWidth::Word, self.memory, vaddr, value.into()) {
            StoreResult::Done => {}
            StoreResult::Handler { handler, paddr } => {
                self.write_io_register(handler, paddr, value);
            }
        }
    }

    pub fn write_u64(&mut self, vaddr: u32, value: u64) {
        match self.vtlb.store(StoreWidth::Dword, self.memory, vaddr, value.into()) {
            StoreResult::Done => {}
            StoreResult::Handler { handler, paddr } => {
                self.write_io_register(handler, paddr, value as u32);
            }
        }
    }

    pub fn write_quadword(&mut self, vaddr: u32, value: u128) {
        match self.vtlb.store(StoreWidth::Quad, self.memory, vaddr, value) {
            StoreResult::Done => {}
            StoreResult::Handler { handler, paddr } => {
                self.write_io_register(handler, paddr, value as u32);
            }
        }
    }

    fn read_io_register(&mut self, handler: HandlerKind, paddr: u32) -> u32 {
        match handler {
            HandlerKind::Fault => {
                log::warn!("Read from unmapped address {paddr:08X}");
                0
            }
            HandlerKind::DmacChannelPage | HandlerKind::DmacCommonPage => {
                self.dmac.read_register(paddr)
            }
            HandlerKind::ControlPage => match paddr {
                INTC_STAT => self.interrupt_registers.read_intc_stat(),
                INTC_MASK => self.interrupt_registers.read_intc_mask(),
                // D_ENABLER / D_ENABLEW live in this page
                _ => self.dmac.read_register(paddr),
            },
        }
    }

    fn write_io_register(&mut self, handler: HandlerKind, paddr: u32, value: u32) {
        match handler {
            HandlerKind::Fault => {
                log::warn!("Write to unmapped address {paddr:08X} {value:08X}");
            }
            HandlerKind::DmacChannelPage | HandlerKind::DmacCommonPage => {
                let mut ctx = DmaContext {
                    memory: &mut *self.memory,
                    sif: &mut *self.sif,
                    ipu: &mut *self.ipu,
                    gif: &mut *self.gif,
                    vif0: &mut *self.vif0,
                    vif1: &mut *self.vif1,
                    interrupt_registers: &mut *self.interrupt_registers,
                    scheduler: &mut *self.scheduler,
                };
                self.dmac.write_register(paddr, value, &mut ctx);
            }
            HandlerKind::ControlPage => match paddr {
                INTC_STAT => self.interrupt_registers.write_intc_stat(value),
                INTC_MASK => self.interrupt_registers.write_intc_mask(value),
                _ => {
                    let mut ctx = DmaContext {
                        memory: &mut *self.memory,
                        sif: &mut *self.sif,
                        ipu: &mut *self.ipu,
                        gif: &mut *self.gif,
                        vif0: &mut *self.vif0,
                        vif1: &mut *self.vif1,
                        interrupt_registers: &mut *self.interrupt_registers,
                        scheduler: &mut *self.scheduler,
                    };
                    self.dmac.write_register(paddr, value, &mut ctx);
                }
            },
        }
    }

    /// IOP-side MMIO read; the IOP uses a flat physical map.
    pub fn iop_read_u32(&mut self, address: u32) -> u32 {
        match address {
            0x0000_0000..=0x001F_FFFF => self.memory.read_iop_ram_u32(address),
            IOP_I_STAT => self.iop_interrupt_registers.read_i_stat(),
            IOP_I_MASK => self.iop_interrupt_registers.read_i_mask(),
            0x1F80_1080..=0x1F80_10EF | 0x1F80_1500..=0x1F80_153F => {
                sif::read_iop_dma_register(self.sif, address)
            }
            _ => {
                log::warn!("Unhandled IOP register read: {address:08X}");
                0
            }
        }
    }

    /// IOP-side MMIO write.
    pub fn iop_write_u32(&mut self, address: u32, value: u32) {
        match address {
            0x0000_0000..=0x001F_FFFF => self.memory.write_iop_ram_u32(address, value),
            IOP_I_STAT => self.iop_interrupt_registers.write_i_stat(value),
            IOP_I_MASK => self.iop_interrupt_registers.write_i_mask(value),
            0x1F80_1080..=0x1F80_10EF | 0x1F80_1500..=0x1F80_153F => {
                sif::write_iop_dma_register(
                    self.sif,
                    self.dmac,
                    self.memory,
                    self.scheduler,
                    address,
                    value,
                );
            }
            _ => {
                log::warn!("Unhandled IOP register write: {address:08X} {value:08X}");
            }
        }
    }
}
