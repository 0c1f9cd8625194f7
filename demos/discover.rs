//! Runs the whole stack against the simulated chain: scan and validate the chain,
//! power up the Debug Port, do a memory round trip through the MEM-AP, then lay out
//! a small ROM table in target memory and walk it.  Set RUST_LOG=debug to watch the
//! layers work.
use arm_adi::ap::{MemAp, MemoryInterface};
use arm_adi::chain::{Chain, TapSpec};
use arm_adi::dp::{DpConfig, JtagDp};
use arm_adi::mock::{MockCable, MockDevice};
use arm_adi::peripherals::PeripheralDb;
use arm_adi::romtable::{self, CIDR_PREAMBLE};
use arm_adi::statemachine::TapSm;

/// ARM's JEP-106 identity plus the part number, byte-split over PIDR0..7
fn place_component(
    mem: &mut dyn MemoryInterface,
    base: u32,
    class: u32,
    part: u16,
) -> Result<(), arm_adi::Error> {
    let cidr = CIDR_PREAMBLE | (class << 12);
    for i in 0..4 {
        mem.write_word_32(base + 0xFF0 + i * 4, (cidr >> (8 * i)) & 0xFF)?;
    }
    let pidr = 0x0004_000B_B000u64 | part as u64;
    for i in 0..4 {
        mem.write_word_32(base + 0xFE0 + i * 4, ((pidr >> (8 * i)) & 0xFF) as u32)?;
    }
    for i in 4..8 {
        mem.write_word_32(base + 0xFD0 + (i - 4) * 4, ((pidr >> (8 * i)) & 0xFF) as u32)?;
    }
    Ok(())
}

fn main() -> Result<(), arm_adi::Error> {
    pretty_env_logger::init();

    let cable = Box::new(MockCable::new(vec![MockDevice::dap(0x4ba0_0477)]));
    let sm = TapSm::new(cable);
    let mut chain = Chain::new(
        sm,
        &[TapSpec {
            irlen: 4,
            idcode: 0x4ba0_0477,
            name: "dap",
        }],
    );
    chain.scan()?;

    let dp = JtagDp::new(chain, 0, DpConfig::default())?;
    let mut ap = MemAp::new(dp, 0)?;

    ap.write_word_32(0x2000_0000, 0xcafe_f00d)?;
    println!("memory round trip: {:#010x}", ap.read_word_32(0x2000_0000)?);

    // A one-entry ROM table pointing at a Cortex-A5 debug unit
    let table = ap.base() & 0xFFFF_F000;
    place_component(&mut ap, table, 1, 0x4C3)?;
    ap.write_word_32(table, 0x1001)?;
    ap.write_word_32(table + 4, 0)?;
    place_component(&mut ap, table.wrapping_add(0x1000), 9, 0xC05)?;

    let db = PeripheralDb::builtin();
    if let Some(tree) = romtable::discover(&mut ap, &db)? {
        println!("{:#?}", tree);
    }
    Ok(())
}
