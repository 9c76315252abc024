//! EE and IOP interrupt register files
//!
//! The EE's INTC drives the INT0 CPU line; the DMAC does not go through the
//! INTC and instead asserts INT1 directly, so the DMAC's interrupt condition
//! is tracked here as a separate line for the CPU's interrupt-check hook.
//!
//! INTC_STAT is write-1-to-clear (interrupt acknowledge); INTC_MASK is
//! write-1-to-toggle, the same reverse-toggle scheme the DMAC uses for the
//! upper half of DMAC_STAT.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    Gs,
    SbusRef,
    VBlankStart,
    VBlankEnd,
    Vif0,
    Vif1,
    Vu0,
    Vu1,
    Ipu,
    Timer0,
    Timer1,
}

impl InterruptType {
    const fn bit_mask(self) -> u16 {
        match self {
            Self::Gs => 1,
            Self::SbusRef => 1 << 1,
            Self::VBlankStart => 1 << 2,
            Self::VBlankEnd => 1 << 3,
            Self::Vif0 => 1 << 4,
            Self::Vif1 => 1 << 5,
            Self::Vu0 => 1 << 6,
            Self::Vu1 => 1 << 7,
            Self::Ipu => 1 << 8,
            Self::Timer0 => 1 << 9,
            Self::Timer1 => 1 << 10,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct InterruptRegisters {
    intc_stat: u16,
    intc_mask: u16,
    dmac_irq_line: bool,
}

impl InterruptRegisters {
    pub fn new() -> Self {
        Self { intc_stat: 0, intc_mask: 0, dmac_irq_line: false }
    }

    pub fn read_intc_stat(&self) -> u32 {
        self.intc_stat.into()
    }

    pub fn write_intc_stat(&mut self, value: u32) {
        // Write-1-to-clear (acknowledge)
        self.intc_stat &= !(value as u16);

        log::debug!("INTC_STAT write: {value:04X}");
    }

    pub fn read_intc_mask(&self) -> u32 {
        self.intc_mask.into()
    }

    pub fn write_intc_mask(&mut self, value: u32) {
        // Write-1-to-toggle
        self.intc_mask ^= value as u16;

        log::debug!("INTC_MASK write: {value:04X}, mask now {:04X}", self.intc_mask);
    }

    pub fn set_interrupt_flag(&mut self, interrupt: InterruptType) {
        self.intc_stat |= interrupt.bit_mask();

        log::debug!("Set INTC_STAT flag: {interrupt:?}");
    }

    /// INT0: any unmasked INTC source pending.
    pub fn int0_pending(&self) -> bool {
        self.intc_stat & self.intc_mask != 0
    }

    /// INT1: the DMAC's interrupt condition, updated by the DMA controller
    /// whenever DMAC_STAT changes.
    pub fn int1_pending(&self) -> bool {
        self.dmac_irq_line
    }

    pub fn set_dmac_irq_line(&mut self, pending: bool) {
        if pending && !self.dmac_irq_line {
            log::debug!("DMAC interrupt line asserted");
        }
        self.dmac_irq_line = pending;
    }
}

impl Default for InterruptRegisters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IopInterruptType {
    VBlank,
    Cdvd,
    Dma,
    Timer0,
}

impl IopInterruptType {
    const fn bit_mask(self) -> u32 {
        match self {
            Self::VBlank => 1,
            Self::Cdvd => 1 << 2,
            Self::Dma => 1 << 3,
            Self::Timer0 => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct IopInterruptRegisters {
    i_stat: u32,
    i_mask: u32,
}

impl IopInterruptRegisters {
    pub fn new() -> Self {
        Self { i_stat: 0, i_mask: 0 }
    }

    pub fn read_i_stat(&self) -> u32 {
        self.i_stat
    }

    pub fn write_i_stat(&mut self, value: u32) {
        // Writing 0 to a bit clears it, writing 1 leaves it unchanged
        self.i_stat &= value;

        log::debug!("IOP I_STAT write: {value:08X}");
    }

    pub fn read_i_mask(&self) -> u32 {
        self.i_mask
    }

    pub fn write_i_mask(&mut self, value: u32) {
        self.i_mask = value;

        log::debug!("IOP I_MASK write: {value:08X}");
    }

    pub fn set_interrupt_flag(&mut self, interrupt: IopInterruptType) {
        self.i_stat |= interrupt.bit_mask();

        log::debug!("Set IOP I_STAT flag: {interrupt:?}");
    }

    pub fn read_interrupt_flag(&self, interrupt: IopInterruptType) -> bool {
        self.i_stat & interrupt.bit_mask() != 0
    }

    pub fn interrupt_pending(&self) -> bool {
        self.i_stat & self.i_mask != 0
    }
}

impl Default for IopInterruptRegisters {
    fn default() -> Self {
        Self::new()
    }
}
