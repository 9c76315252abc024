//! Source-chain DMA tag decoding
//!
//! A chain-mode channel reads 128-bit tags from guest memory; the low 64 bits
//! describe one link (transfer size, chain opcode, next address) and the high
//! 64 bits are free-use payload (the SIF channels carry IOP-side tags there).

use crate::dmac::ChannelRegisters;
use crate::memory::Memory;
use bincode::{Decode, Encode};
use proc_bitfield::bitfield;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
    pub struct DmaTag(pub u64): Debug, FromStorage, IntoStorage {
        pub qwc: u16 @ 0..=15,
        pub priority_control: u8 @ 26..=27,
        pub id_bits: u8 @ 28..=30,
        pub irq: bool @ 31,
        pub addr: u32 @ 32..=62,
        pub spr: bool @ 63,
    }
}

impl DmaTag {
    pub fn id(self) -> TagId {
        TagId::from_bits(self.id_bits())
    }

    /// The CHCR TAG field mirrors bits 16-31 of the most recently fetched tag.
    pub fn chcr_tag_bits(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagId {
    Refe = 0,
    Cnt = 1,
    Next = 2,
    Ref = 3,
    Refs = 4,
    Call = 5,
    Ret = 6,
    End = 7,
}

impl TagId {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => Self::Refe,
            1 => Self::Cnt,
            2 => Self::Next,
            3 => Self::Ref,
            4 => Self::Refs,
            5 => Self::Call,
            6 => Self::Ret,
            7 => Self::End,
            _ => unreachable!("value & 7 is always <= 7"),
        }
    }
}

/// Outcome of applying one source-chain tag to a channel's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainAction {
    /// Transfer the new QWC, then fetch the next tag.
    Continue,
    /// Transfer the new QWC, then the chain is finished.
    LastTransfer,
}

/// Fetches the 128-bit tag at the channel's TADR.
///
/// Returns `None` when TADR resolves to no backing memory; the caller records
/// this as a bus error (BEIS) and halts the channel.
pub fn fetch_source_tag(regs: &ChannelRegisters, memory: &Memory) -> Option<(DmaTag, u128)> {
    let address = memory.dma_resolve(regs.tadr, false)?;
    let raw = memory.dma_read_quadword(address);
    Some((DmaTag::from(raw as u64), raw))
}

/// Applies a fetched source-chain tag: loads QWC and the CHCR TAG mirror,
/// computes the data address (MADR) and the next tag address (TADR/ASR), and
/// reports whether the chain continues past this link.
pub fn apply_source_tag(regs: &mut ChannelRegisters, tag: DmaTag) -> ChainAction {
    regs.qwc = u32::from(tag.qwc());
    regs.chcr.set_tag(tag.chcr_tag_bits());

    let data_after_tag = regs.tadr.wrapping_add(16);
    let past_data = |madr: u32, qwc: u32| madr.wrapping_add(qwc * 16);

    match tag.id() {
        TagId::Refe => {
            regs.madr = tag_data_address(tag);
            regs.tadr = data_after_tag;
            ChainAction::LastTransfer
        }
        TagId::Cnt => {
            regs.madr = data_after_tag;
            regs.tadr = past_data(regs.madr, regs.qwc);
            ChainAction::Continue
        }
        TagId::Next => {
            regs.madr = data_after_tag;
            regs.tadr = tag_data_address(tag);
            ChainAction::Continue
        }
        TagId::Ref | TagId::Refs => {
            regs.madr = tag_data_address(tag);
            regs.tadr = data_after_tag;
            ChainAction::Continue
        }
        TagId::Call => {
            regs.madr = data_after_tag;
            let return_address = past_data(regs.madr, regs.qwc);
            match regs.chcr.asp() {
                0 => regs.asr0 = return_address,
                1 => regs.asr1 = return_address,
                _ => {
                    // Address stack depth is 2; a third CALL has nowhere to
                    // save the return address. Hardware behavior is
                    // undocumented; end the chain like a RET underflow.
                    log::warn!("DMA CALL tag with address stack already full, ending chain");
                    return ChainAction::LastTransfer;
                }
            }
            regs.chcr.set_asp(regs.chcr.asp() + 1);
            regs.tadr = tag_data_address(tag);
            ChainAction::Continue
        }
        TagId::Ret => {
            regs.madr = data_after_tag;
            match regs.chcr.asp() {
                2 => {
                    regs.tadr = regs.asr1;
                    regs.chcr.set_asp(1);
                    ChainAction::Continue
                }
                1 => {
                    regs.tadr = regs.asr0;
                    regs.chcr.set_asp(0);
                    ChainAction::Continue
                }
                _ => ChainAction::LastTransfer,
            }
        }
        TagId::End => {
            regs.madr = data_after_tag;
            ChainAction::LastTransfer
        }
    }
}

/// ADDR with the SPR routing flag folded back into bit 31 so the generic
/// DMA-space translation sees it.
fn tag_data_address(tag: DmaTag) -> u32 {
    tag.addr() | (u32::from(tag.spr()) << 31)
}
