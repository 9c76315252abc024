//! Named compatibility quirks
//!
//! These reproduce observed-behavior hacks that specific titles depend on.
//! They live behind named flags so their scope stays auditable instead of
//! being buried in the channel engines; all of them default to enabled.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Quirks {
    /// CHCR.MOD == 3 is undefined by the hardware manual, but some titles
    /// write it and expect chain-mode behavior. Coerced with a one-time warn.
    pub mode3_coerce_to_chain: bool,
    /// SIF0 halves its accumulated IOP-side cycles before scheduling the
    /// IOP completion interrupt. Timing hack required by at least one title
    /// (PaRappa the Rapper 2); not documented hardware behavior.
    pub sif0_iop_cycle_halving: bool,
}

impl Quirks {
    pub fn all_enabled() -> Self {
        Self { mode3_coerce_to_chain: true, sif0_iop_cycle_halving: true }
    }
}

impl Default for Quirks {
    fn default() -> Self {
        Self::all_enabled()
    }
}
