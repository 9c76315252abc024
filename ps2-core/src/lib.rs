//! PS2 Emotion Engine DMA/memory core: the DMAC register model and channel
//! engines, the SIF EE/IOP bridge, the IPU DMA endpoints, and the VTLB
//! memory-dispatch layer. The CPUs, GS, and the real VIF/IPU pipelines are
//! external collaborators driven through `api::System`.

pub mod api;
pub mod bus;
pub mod dmac;
pub mod fifo;
pub mod interrupts;
pub mod ipu;
pub mod memory;
mod num;
pub mod quirks;
pub mod scheduler;
pub mod sif;
pub mod vtlb;
