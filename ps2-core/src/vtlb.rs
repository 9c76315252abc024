//! Virtual-TLB memory dispatch
//!
//! Resolves EE virtual addresses to either a direct backing-array access
//! (fast path) or a tagged hardware-register handler (slow path), one entry
//! per 4 KB page. This is the emulator's own mapping layer, independent of
//! the guest-visible MIPS TLB.
//!
//! The interpreted page-table lookup is the reference implementation of
//! [`MemoryResolver`]; the dispatch table generated by `init` is the closed
//! direction x width x sign-extension set a recompiler would call through,
//! kept as plain function pointers so the portable build and a JIT backend
//! share one contract. Generation happens exactly once; per-page entries
//! mutate underneath the immutable table.

use crate::memory::Memory;
use bincode::{Decode, Encode};

pub const VTLB_PAGE_BITS: u32 = 12;
pub const VTLB_PAGE_SIZE: u32 = 1 << VTLB_PAGE_BITS;
pub const VTLB_PAGE_MASK: u32 = VTLB_PAGE_SIZE - 1;

const NUM_PAGES: usize = 1 << (32 - VTLB_PAGE_BITS);

/// Which backing array a direct entry points into. The safe-Rust rendition
/// of a raw host pointer: an offset into the owning region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum PageTarget {
    MainRam,
    Scratchpad,
    IopRam,
}

/// Hardware-register handler classes. `Fault` is the registered default for
/// unmapped pages, so every page resolves to something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum HandlerKind {
    Fault,
    DmacChannelPage,
    DmacCommonPage,
    ControlPage,
}

/// One page-map entry: a direct target or a handler, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum PageEntry {
    Direct { target: PageTarget, offset: u32 },
    Handler { handler: HandlerKind, paddr_base: u32 },
}

/// A resolved access: the page entry with the in-page offset folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Direct { target: PageTarget, offset: u32 },
    Handler { handler: HandlerKind, paddr: u32 },
}

/// The capability interface recompiler and interpreter share: every virtual
/// address resolves to exactly one access path.
pub trait MemoryResolver {
    fn resolve(&self, vaddr: u32) -> Resolution;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    U128,
}

impl LoadKind {
    const ALL: [Self; 8] =
        [Self::U8, Self::I8, Self::U16, Self::I16, Self::U32, Self::I32, Self::U64, Self::U128];

    fn index(self) -> usize {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::U64 => 6,
            Self::U128 => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWidth {
    Byte,
    Half,
    Word,
    Dword,
    Quad,
}

impl StoreWidth {
    const ALL: [Self; 5] = [Self::Byte, Self::Half, Self::Word, Self::Dword, Self::Quad];

    fn index(self) -> usize {
        match self {
            Self::Byte => 0,
            Self::Half => 1,
            Self::Word => 2,
            Self::Dword => 3,
            Self::Quad => 4,
        }
    }
}

/// Outcome of a dispatched load: a value from the fast path, or a handler
/// call for the bus to finish. Sign-extended loads extend within 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Value(u128),
    Handler { handler: HandlerKind, paddr: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Done,
    Handler { handler: HandlerKind, paddr: u32 },
}

pub type LoadFn = fn(&Vtlb, &Memory, u32) -> LoadResult;
pub type StoreFn = fn(&Vtlb, &mut Memory, u32, u128) -> StoreResult;

/// The per-operand-width dispatcher set. `init` populates it exactly once;
/// calling it again is a no-op, observable through `generation`.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    generation: u32,
    loads: [LoadFn; 8],
    stores: [StoreFn; 5],
}

impl DispatchTable {
    fn new() -> Self {
        Self { generation: 0, loads: [load_uninitialized; 8], stores: [store_uninitialized; 5] }
    }

    fn init(&mut self) {
        if self.generation > 0 {
            log::debug!("VTLB dispatch table already generated, skipping");
            return;
        }

        for kind in LoadKind::ALL {
            self.loads[kind.index()] = match kind {
                LoadKind::U8 => load_u8,
                LoadKind::I8 => load_i8,
                LoadKind::U16 => load_u16,
                LoadKind::I16 => load_i16,
                LoadKind::U32 => load_u32,
                LoadKind::I32 => load_i32,
                LoadKind::U64 => load_u64,
                LoadKind::U128 => load_u128,
            };
        }

        for width in StoreWidth::ALL {
            self.stores[width.index()] = match width {
                StoreWidth::Byte => store_u8,
                StoreWidth::Half => store_u16,
                StoreWidth::Word => store_u32,
                StoreWidth::Dword => store_u64,
                StoreWidth::Quad => store_u128,
            };
        }

        self.generation += 1;

        log::debug!("VTLB dispatch table generated");
    }
}

pub struct Vtlb {
    pages: Vec<PageEntry>,
    dispatch: DispatchTable,
}

impl Vtlb {
    /// Creates an empty map: every page carries the fault handler, so no
    /// lookup can fail to resolve.
    pub fn new() -> Self {
        let pages = (0..NUM_PAGES)
            .map(|page| PageEntry::Handler {
                handler: HandlerKind::Fault,
                paddr_base: (page as u32) << VTLB_PAGE_BITS,
            })
            .collect();

        Self { pages, dispatch: DispatchTable::new() }
    }

    /// Generates the dispatch table. Idempotent: the second and later calls
    /// change nothing, and the generation counter stays at 1.
    pub fn init_dispatch(&mut self) {
        self.dispatch.init();
    }

    pub fn dispatch_generation(&self) -> u32 {
        self.dispatch.generation
    }

    /// Maps `len` bytes of virtual address space directly onto a backing
    /// array starting at `target_offset`. All arguments must be page-aligned.
    pub fn map_direct(&mut self, vaddr_base: u32, len: u32, target: PageTarget, target_offset: u32) {
        debug_assert_eq!(vaddr_base & VTLB_PAGE_MASK, 0);
        debug_assert_eq!(len & VTLB_PAGE_MASK, 0);

        for i in 0..len >> VTLB_PAGE_BITS {
            let page = ((vaddr_base >> VTLB_PAGE_BITS) + i) as usize;
            self.pages[page] =
                PageEntry::Direct { target, offset: target_offset + (i << VTLB_PAGE_BITS) };
        }
    }

    /// Maps `len` bytes of virtual address space onto a handler, recording
    /// the physical base each page should report.
    pub fn map_handler(&mut self, vaddr_base: u32, len: u32, handler: HandlerKind, paddr_base: u32) {
        debug_assert_eq!(vaddr_base & VTLB_PAGE_MASK, 0);
        debug_assert_eq!(len & VTLB_PAGE_MASK, 0);

        for i in 0..len >> VTLB_PAGE_BITS {
            let page = ((vaddr_base >> VTLB_PAGE_BITS) + i) as usize;
            self.pages[page] =
                PageEntry::Handler { handler, paddr_base: paddr_base + (i << VTLB_PAGE_BITS) };
        }
    }

    pub fn page_entry(&self, vaddr: u32) -> PageEntry {
        self.pages[(vaddr >> VTLB_PAGE_BITS) as usize]
    }

    /// Constant-address resolution for a recompiler: the result a JIT backend
    /// would bake into generated code for an address known at compile time.
    /// Identical to the runtime lookup by construction.
    pub fn resolve_const(&self, vaddr: u32) -> Resolution {
        self.resolve(vaddr)
    }

    pub fn load(&self, kind: LoadKind, memory: &Memory, vaddr: u32) -> LoadResult {
        (self.dispatch.loads[kind.index()])(self, memory, vaddr)
    }

    pub fn store(&self, width: StoreWidth, memory: &mut Memory, vaddr: u32, value: u128) -> StoreResult {
        (self.dispatch.stores[width.index()])(self, memory, vaddr, value)
    }
}

impl MemoryResolver for Vtlb {
    fn resolve(&self, vaddr: u32) -> Resolution {
        let offset_in_page = vaddr & VTLB_PAGE_MASK;
        match self.page_entry(vaddr) {
            PageEntry::Direct { target, offset } => {
                Resolution::Direct { target, offset: offset + offset_in_page }
            }
            PageEntry::Handler { handler, paddr_base } => {
                Resolution::Handler { handler, paddr: paddr_base + offset_in_page }
            }
        }
    }
}

impl Default for Vtlb {
    fn default() -> Self {
        Self::new()
    }
}

fn load_uninitialized(_vtlb: &Vtlb, _memory: &Memory, vaddr: u32) -> LoadResult {
    log::error!("VTLB load dispatched before init: {vaddr:08X}");
    LoadResult::Handler { handler: HandlerKind::Fault, paddr: vaddr }
}

fn store_uninitialized(_vtlb: &Vtlb, _memory: &mut Memory, vaddr: u32, _value: u128) -> StoreResult {
    log::error!("VTLB store dispatched before init: {vaddr:08X}");
    StoreResult::Handler { handler: HandlerKind::Fault, paddr: vaddr }
}

macro_rules! impl_load {
    ($name:ident, $read_main:ident, $read_spr:ident, $read_iop:ident, $convert:expr) => {
        fn $name(vtlb: &Vtlb, memory: &Memory, vaddr: u32) -> LoadResult {
            match vtlb.resolve(vaddr) {
                Resolution::Direct { target, offset } => {
                    let raw = match target {
                        PageTarget::MainRam => memory.$read_main(offset),
                        PageTarget::Scratchpad => memory.$read_spr(offset),
                        PageTarget::IopRam => memory.$read_iop(offset),
                    };
                    LoadResult::Value($convert(raw))
                }
                Resolution::Handler { handler, paddr } => LoadResult::Handler { handler, paddr },
            }
        }
    };
}

impl_load!(load_u8, read_main_ram_u8, read_scratchpad_u8, read_iop_ram_u8, |v: u8| u128::from(v));
impl_load!(load_i8, read_main_ram_u8, read_scratchpad_u8, read_iop_ram_u8, |v: u8| {
    u128::from((v as i8 as i64) as u64)
});
impl_load!(load_u16, read_main_ram_u16, read_scratchpad_u16, read_iop_ram_u16, |v: u16| {
    u128::from(v)
});
impl_load!(load_i16, read_main_ram_u16, read_scratchpad_u16, read_iop_ram_u16, |v: u16| {
    u128::from((v as i16 as i64) as u64)
});
impl_load!(load_u32, read_main_ram_u32, read_scratchpad_u32, read_iop_ram_u32, |v: u32| {
    u128::from(v)
});
impl_load!(load_i32, read_main_ram_u32, read_scratchpad_u32, read_iop_ram_u32, |v: u32| {
    u128::from((v as i32 as i64) as u64)
});
impl_load!(load_u64, read_main_ram_u64, read_scratchpad_u64, read_iop_ram_u64, |v: u64| {
    u128::from(v)
});
impl_load!(
    load_u128,
    read_main_ram_quadword,
    read_scratchpad_quadword,
    read_iop_ram_quadword,
    |v: u128| v
);

macro_rules! impl_store {
    ($name:ident, $write_main:ident, $write_spr:ident, $write_iop:ident, $ty:ty) => {
        fn $name(vtlb: &Vtlb, memory: &mut Memory, vaddr: u32, value: u128) -> StoreResult {
            match vtlb.resolve(vaddr) {
                Resolution::Direct { target, offset } => {
                    let value = value as $ty;
                    match target {
                        PageTarget::MainRam => memory.$write_main(offset, value),
                        PageTarget::Scratchpad => memory.$write_spr(offset, value),
                        PageTarget::IopRam => memory.$write_iop(offset, value),
                    }
                    StoreResult::Done
                }
                Resolution::Handler { handler, paddr } => StoreResult::Handler { handler, paddr },
            }
        }
    };
}

impl_store!(store_u8, write_main_ram_u8, write_scratchpad_u8, write_iop_ram_u8, u8);
impl_store!(store_u16, write_main_ram_u16, write_scratchpad_u16, write_iop_ram_u16, u16);
impl_store!(store_u32, write_main_ram_u32, write_scratchpad_u32, write_iop_ram_u32, u32);
impl_store!(store_u64, write_main_ram_u64, write_scratchpad_u64, write_iop_ram_u64, u64);
impl_store!(store_u128, write_main_ram_quadword, write_scratchpad_quadword, write_iop_ram_quadword, u128);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;

    fn mapped_vtlb() -> Vtlb {
        let mut vtlb = Vtlb::new();
        vtlb.map_direct(0, memory::MAIN_RAM_LEN as u32, PageTarget::MainRam, 0);
        vtlb.map_handler(0x1000_E000, 0x1000, HandlerKind::DmacCommonPage, 0x1000_E000);
        vtlb.init_dispatch();
        vtlb
    }

    #[test]
    fn init_is_idempotent() {
        let mut vtlb = mapped_vtlb();
        assert_eq!(vtlb.dispatch_generation(), 1);

        let before = vtlb.dispatch.clone();
        vtlb.init_dispatch();

        assert_eq!(vtlb.dispatch_generation(), 1);
        assert_eq!(vtlb.dispatch.loads, before.loads);
        assert_eq!(vtlb.dispatch.stores, before.stores);
    }

    #[test]
    fn direct_and_handler_resolution() {
        let vtlb = mapped_vtlb();

        assert_eq!(
            vtlb.resolve(0x0010_1234),
            Resolution::Direct { target: PageTarget::MainRam, offset: 0x0010_1234 }
        );
        assert_eq!(
            vtlb.resolve(0x1000_E010),
            Resolution::Handler { handler: HandlerKind::DmacCommonPage, paddr: 0x1000_E010 }
        );
        // Unmapped pages land on the fault handler, never "not found"
        assert_eq!(
            vtlb.resolve(0x4000_0000),
            Resolution::Handler { handler: HandlerKind::Fault, paddr: 0x4000_0000 }
        );
    }

    #[test]
    fn const_resolution_matches_runtime() {
        let vtlb = mapped_vtlb();

        for vaddr in [0, 0x123, 0x0010_0000, 0x1000_E000, 0x1000_E010, 0xFFFF_FFF0] {
            assert_eq!(vtlb.resolve_const(vaddr), vtlb.resolve(vaddr));
        }
    }

    #[test]
    fn sign_extending_loads() {
        let vtlb = mapped_vtlb();
        let mut memory = Memory::new();

        memory.write_main_ram_u32(0x100, 0xFFFF_8080);

        assert_eq!(vtlb.load(LoadKind::U8, &memory, 0x100), LoadResult::Value(0x80));
        assert_eq!(
            vtlb.load(LoadKind::I8, &memory, 0x100),
            LoadResult::Value(u128::from(0xFFFF_FFFF_FFFF_FF80_u64))
        );
        assert_eq!(vtlb.load(LoadKind::U16, &memory, 0x100), LoadResult::Value(0x8080));
        assert_eq!(
            vtlb.load(LoadKind::I32, &memory, 0x100),
            LoadResult::Value(u128::from(0xFFFF_FFFF_FFFF_8080_u64))
        );
    }

    #[test]
    fn store_then_load_roundtrip_through_dispatch() {
        let vtlb = mapped_vtlb();
        let mut memory = Memory::new();

        assert_eq!(
            vtlb.store(StoreWidth::Quad, &mut memory, 0x200, 0x0123_4567_89AB_CDEF_1122_3344_5566_7788),
            StoreResult::Done
        );
        assert_eq!(
            vtlb.load(LoadKind::U128, &memory, 0x200),
            LoadResult::Value(0x0123_4567_89AB_CDEF_1122_3344_5566_7788)
        );

        // Handler pages report the handler instead of touching memory
        assert_eq!(
            vtlb.store(StoreWidth::Word, &mut memory, 0x1000_E000, 0x1234),
            StoreResult::Handler { handler: HandlerKind::DmacCommonPage, paddr: 0x1000_E000 }
        );
    }
}
