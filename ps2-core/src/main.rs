use clap::Parser;
use env_logger::Env;
use ps2_core::api::System;
use ps2_core::dmac::Channel;
use std::error::Error;
use std::fs;

#[derive(Debug, Parser)]
struct Args {
    /// Raw image loaded into EE main RAM at address 0 before the exercise
    #[arg(short = 'r', long)]
    ram_image: Option<String>,
    /// Cycles to tick after each programmed transfer
    #[arg(short = 'c', long, default_value_t = 1024)]
    cycles: u64,
}

// Headless exercise of the DMA core: an SPR round trip and a tag-chained
// SIF0 transfer, driven purely through the register surface.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut system = System::new();

    if let Some(path) = &args.ram_image {
        log::info!("Loading RAM image from '{path}'");
        let image = fs::read(path)?;
        system.load_ram_image(&image)?;
    }

    // Enable the DMAC and unmask every channel completion interrupt
    {
        let mut bus = system.bus();
        bus.write_u32(0x1000_E000, 1);
        bus.write_u32(0x1000_E010, 0x03FF_0000);
    }

    // SPR round trip: 4 quadwords RAM -> scratchpad -> RAM
    for i in 0..64u32 {
        system.memory_mut().write_main_ram_u8(0x10000 + i, i as u8);
    }

    let spr_to = Channel::SprTo.register_base();
    let spr_from = Channel::SprFrom.register_base();
    {
        let mut bus = system.bus();
        bus.write_u32(spr_to + 0x10, 0x10000);
        bus.write_u32(spr_to + 0x80, 0);
        bus.write_u32(spr_to + 0x20, 4);
        bus.write_u32(spr_to, 0x101);
    }
    system.tick(args.cycles);

    {
        let mut bus = system.bus();
        bus.write_u32(spr_from + 0x10, 0x20000);
        bus.write_u32(spr_from + 0x80, 0);
        bus.write_u32(spr_from + 0x20, 4);
        bus.write_u32(spr_from, 0x100);
    }
    system.tick(args.cycles);

    let round_trip_ok =
        (0..64).all(|i| system.memory().read_main_ram_u8(0x20000 + i) == i as u8);
    log::info!("SPR round trip intact: {round_trip_ok}");

    // SIF0: IOP sends 8 words to EE address 0x30000 through a one-tag list
    {
        let mut bus = system.bus();
        for i in 0..8u32 {
            bus.iop_write_u32(0x1000 + i * 4, 0xA000_0000 | i);
        }
        // IOP tag: addr 0x1000 with the end flag, 8 words, EE tag (qwc=2,
        // id=END) targeting 0x30000
        bus.iop_write_u32(0x2000, 0x8000_1000);
        bus.iop_write_u32(0x2004, 8);
        bus.iop_write_u32(0x2008, 0x7000_0002);
        bus.iop_write_u32(0x200C, 0x0003_0000);

        bus.iop_write_u32(0x1F80_152C, 0x2000);
        bus.iop_write_u32(0x1F80_1528, 0x0100_0000);

        // EE side: destination chain
        let sif0 = Channel::Sif0.register_base();
        bus.write_u32(sif0, 0x104);
    }
    system.tick(args.cycles);

    let sif_ok =
        (0..8).all(|i| system.memory().read_main_ram_u32(0x30000 + i * 4) == (0xA000_0000 | i));
    log::info!("SIF0 transfer intact: {sif_ok}");
    log::info!(
        "EE INT1 pending: {}, IOP I_STAT: {:08X}",
        system.interrupt_registers().int1_pending(),
        system.iop_interrupt_registers().read_i_stat()
    );

    Ok(())
}
