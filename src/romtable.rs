//! CoreSight component discovery.  Starting from an AP's debug base address, read the
//! CIDR/PIDR identification registers, and for class 1 ROM tables recurse into every
//! present entry until a zero terminator.  The walk treats the hardware's answers as
//! untrusted: a visited set and a depth cap keep a malformed table from looping, and a
//! single broken or foreign component only prunes its own branch.
use std::collections::HashSet;

use thiserror::Error;

use crate::ap::{ApError, MemAp, MemoryInterface, NO_ROM_TABLE};
use crate::dp::DapAccess;
use crate::peripherals::PeripheralDb;

#[derive(Error, Debug)]
pub enum RomTableError {
    #[error("component at {addr:#010x}: CIDR {cidr:#010x} fails the preamble check")]
    InvalidCidr { addr: u32, cidr: u32 },
    #[error("component at {addr:#010x}: reserved component class {class:#x}")]
    UnknownClass { addr: u32, class: u32 },
    #[error("ROM table recursion deeper than {0} levels")]
    TooDeep(usize),
    #[error(transparent)]
    Ap(#[from] ApError),
}

/// Fixed CIDR value with the class nibble zeroed
pub const CIDR_PREAMBLE: u32 = 0xB105_000D;
const CIDR_CLASS_MASK: u32 = 0x0000_F000;

/// ARM's identity in the assembled PIDR: JEP-106 continuation code 4,
/// identification code 0x3B, and the uses-JEP-106 flag
const PIDR_DESIGNER_MASK: u64 = 0x000F_000F_F000;
const PIDR_DESIGNER_ARM: u64 = 0x0004_000B_B000;

/// A class 1 ROM table holds at most 960 entries (ADIv5 D3.4)
const ROM_MAX_ENTRIES: u32 = 960;
const MAX_DEPTH: usize = 16;

/// Component class from the CIDR1 class nibble, table D1-2 of the ADIv5 spec
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ComponentClass {
    GenericVerification = 0x0,
    RomTable = 0x1,
    CoreSight = 0x9,
    PeripheralTestBlock = 0xB,
    GenericIp = 0xE,
    PrimeCell = 0xF,
}

impl ComponentClass {
    fn from_nibble(nibble: u32) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::GenericVerification),
            0x1 => Some(Self::RomTable),
            0x9 => Some(Self::CoreSight),
            0xB => Some(Self::PeripheralTestBlock),
            0xE => Some(Self::GenericIp),
            0xF => Some(Self::PrimeCell),
            _ => None,
        }
    }
}

/// One node of the discovered component tree
#[derive(Debug)]
pub enum Component {
    RomTable {
        base: u32,
        children: Vec<Component>,
    },
    /// An ARM-designed component, identified by its 12-bit part number.  `name` is
    /// filled from the peripheral database, `probe_result` by the part's probe hook
    /// if it has one.
    Peripheral {
        base: u32,
        part: u16,
        class: ComponentClass,
        name: Option<&'static str>,
        probe_result: Option<String>,
    },
    /// A component some other designer put on the bus; identified but not probed
    Foreign { base: u32, pidr: u64 },
}

impl Component {
    pub fn base(&self) -> u32 {
        match self {
            Component::RomTable { base, .. } => *base,
            Component::Peripheral { base, .. } => *base,
            Component::Foreign { base, .. } => *base,
        }
    }

    /// Number of components in this subtree, the tables themselves included
    pub fn count(&self) -> usize {
        match self {
            Component::RomTable { children, .. } => {
                1 + children.iter().map(Component::count).sum::<usize>()
            }
            _ => 1,
        }
    }
}

fn read_cidr(mem: &mut dyn MemoryInterface, base: u32) -> Result<u32, RomTableError> {
    let mut regs = [0u32; 4];
    mem.read_32(base + 0xFF0, &mut regs)?;
    Ok(regs
        .iter()
        .rev()
        .fold(0, |acc, r| (acc << 8) | (r & 0xFF)))
}

fn read_pidr(mem: &mut dyn MemoryInterface, base: u32) -> Result<u64, RomTableError> {
    // PIDR4..7 sit below PIDR0..3 in the address map
    let mut regs = [0u32; 8];
    mem.read_32(base + 0xFD0, &mut regs[4..])?;
    mem.read_32(base + 0xFE0, &mut regs[..4])?;
    Ok(regs
        .iter()
        .rev()
        .fold(0, |acc, r| (acc << 8) | (r & 0xFF) as u64))
}

/// Identify and recursively probe the component at `addr`.  ROM tables recurse,
/// ARM peripherals are looked up in `db`, foreign parts are logged and recorded
/// unprobed.
pub fn component_probe(
    mem: &mut dyn MemoryInterface,
    addr: u32,
    db: &PeripheralDb,
) -> Result<Component, RomTableError> {
    let mut visited = HashSet::new();
    visited.insert(addr);
    probe_inner(mem, addr, db, &mut visited, 0)
}

fn probe_inner(
    mem: &mut dyn MemoryInterface,
    addr: u32,
    db: &PeripheralDb,
    visited: &mut HashSet<u32>,
    depth: usize,
) -> Result<Component, RomTableError> {
    if depth > MAX_DEPTH {
        return Err(RomTableError::TooDeep(MAX_DEPTH));
    }

    let cidr = read_cidr(mem, addr)?;
    if cidr & !CIDR_CLASS_MASK != CIDR_PREAMBLE {
        return Err(RomTableError::InvalidCidr { addr, cidr });
    }
    let class_nibble = (cidr & CIDR_CLASS_MASK) >> 12;
    let class = ComponentClass::from_nibble(class_nibble).ok_or(RomTableError::UnknownClass {
        addr,
        class: class_nibble,
    })?;

    if class == ComponentClass::RomTable {
        log::info!("ROM table at {:#010x}", addr);
        return walk_rom_table(mem, addr, db, visited, depth);
    }

    let pidr = read_pidr(mem, addr)?;
    if pidr & PIDR_DESIGNER_MASK != PIDR_DESIGNER_ARM {
        let cc = ((pidr >> 32) & 0xF) as u8;
        let id = ((pidr >> 12) & 0x7F) as u8;
        let designer = jep106::JEP106Code::new(cc, id);
        log::warn!(
            "component at {:#010x} designed by {} ({:?}), skipping",
            addr,
            designer.get().unwrap_or("unknown"),
            designer
        );
        return Ok(Component::Foreign { base: addr, pidr });
    }

    let part = (pidr & 0xFFF) as u16;
    match db.lookup(part) {
        Some(info) => {
            log::info!("{} at {:#010x} (part {:#05x})", info.name, addr, part);
            if info.class != class {
                log::warn!(
                    "part {:#05x} at {:#010x}: database expects class {:?}, CIDR says {:?}",
                    part,
                    addr,
                    info.class,
                    class
                );
            }
            let probe_result = match info.probe {
                Some(probe) => Some(probe(mem, addr)?),
                None => None,
            };
            Ok(Component::Peripheral {
                base: addr,
                part,
                class,
                name: Some(info.name),
                probe_result,
            })
        }
        None => {
            log::warn!("unknown ARM part {:#05x} at {:#010x}", part, addr);
            Ok(Component::Peripheral {
                base: addr,
                part,
                class,
                name: None,
                probe_result: None,
            })
        }
    }
}

fn walk_rom_table(
    mem: &mut dyn MemoryInterface,
    base: u32,
    db: &PeripheralDb,
    visited: &mut HashSet<u32>,
    depth: usize,
) -> Result<Component, RomTableError> {
    let mut children = Vec::new();
    for i in 0..ROM_MAX_ENTRIES {
        let entry = mem.read_word_32(base + i * 4)?;
        if entry == 0 {
            break;
        }
        if entry & 1 == 0 {
            log::debug!("ROM table entry {} not present", i);
            continue;
        }
        // The offset field is two's complement, so the masked add wraps correctly
        // for components below the table
        let child = base.wrapping_add(entry & 0xFFFF_F000);
        if !visited.insert(child) {
            log::warn!(
                "ROM table at {:#010x} revisits {:#010x}, pruning the cycle",
                base,
                child
            );
            continue;
        }
        match probe_inner(mem, child, db, visited, depth + 1) {
            Ok(component) => children.push(component),
            // A transport fault ends the walk; a malformed component only costs
            // its own branch
            Err(RomTableError::Ap(e)) => return Err(RomTableError::Ap(e)),
            Err(e) => log::warn!("entry {} at {:#010x}: {}", i, child, e),
        }
    }
    Ok(Component::RomTable { base, children })
}

/// Walk the ROM table the AP's BASE register points at.  An AP without one is
/// normal and yields `None`.
pub fn discover<D: DapAccess>(
    ap: &mut MemAp<D>,
    db: &PeripheralDb,
) -> Result<Option<Component>, RomTableError> {
    if ap.base() == NO_ROM_TABLE {
        log::info!("AP {} has no ROM table", ap.apsel());
        return Ok(None);
    }
    let base = ap.base() & 0xFFFF_F000;
    component_probe(ap, base, db).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ap::MemAp;
    use crate::mock::{FlatMemory, MockDap};
    use crate::peripherals::{PartInfo, PeripheralDb};

    const ARM_PIDR_BASE: u64 = PIDR_DESIGNER_ARM;

    fn place_component(mem: &mut dyn MemoryInterface, base: u32, class: u32, part: u16) {
        let cidr = CIDR_PREAMBLE | (class << 12);
        for i in 0..4 {
            mem.write_word_32(base + 0xFF0 + i * 4, (cidr >> (8 * i)) & 0xFF)
                .unwrap();
        }
        let pidr = ARM_PIDR_BASE | part as u64;
        for i in 0..4 {
            mem.write_word_32(base + 0xFE0 + i * 4, ((pidr >> (8 * i)) & 0xFF) as u32)
                .unwrap();
        }
        for i in 4..8 {
            mem.write_word_32(base + 0xFD0 + (i - 4) * 4, ((pidr >> (8 * i)) & 0xFF) as u32)
                .unwrap();
        }
    }

    fn place_rom_table(mem: &mut dyn MemoryInterface, base: u32, entries: &[u32]) {
        place_component(mem, base, 1, 0x4C3);
        for (i, &entry) in entries.iter().enumerate() {
            mem.write_word_32(base + 4 * i as u32, entry).unwrap();
        }
        mem.write_word_32(base + 4 * entries.len() as u32, 0).unwrap();
    }

    #[test]
    fn rom_table_probes_each_present_entry() {
        let mut mem = FlatMemory::new();
        place_rom_table(&mut mem, 0xE00F_F000, &[0x1001, 0x2001, 0x3001]);
        place_component(&mut mem, 0xE010_0000, 9, 0xC05);
        place_component(&mut mem, 0xE010_1000, 9, 0x906);
        place_component(&mut mem, 0xE010_2000, 0xE, 0x002);

        let db = PeripheralDb::builtin();
        let root = component_probe(&mut mem, 0xE00F_F000, &db).unwrap();
        match root {
            Component::RomTable { children, .. } => assert_eq!(children.len(), 3),
            other => panic!("expected a ROM table, got {:?}", other),
        }
    }

    #[test]
    fn absent_entries_are_skipped() {
        let mut mem = FlatMemory::new();
        // bit 0 clear: the component is not present, don't touch it
        place_rom_table(&mut mem, 0xE00F_F000, &[0x1000]);

        let db = PeripheralDb::builtin();
        let root = component_probe(&mut mem, 0xE00F_F000, &db).unwrap();
        match root {
            Component::RomTable { children, .. } => assert!(children.is_empty()),
            other => panic!("expected a ROM table, got {:?}", other),
        }
    }

    #[test]
    fn bad_cidr_fails_the_component() {
        let mut mem = FlatMemory::new();
        place_component(&mut mem, 0x1000, 9, 0xC05);
        mem.poke(0x1000 + 0xFFC, 0x42);

        let db = PeripheralDb::builtin();
        match component_probe(&mut mem, 0x1000, &db) {
            Err(RomTableError::InvalidCidr { addr: 0x1000, .. }) => {}
            other => panic!("expected InvalidCidr, got {:?}", other),
        }
    }

    #[test]
    fn bad_child_only_prunes_its_branch() {
        let mut mem = FlatMemory::new();
        place_rom_table(&mut mem, 0xE00F_F000, &[0x1001, 0x2001]);
        place_component(&mut mem, 0xE010_0000, 9, 0xC05);
        // garbage where the second child's CIDR should be
        mem.poke(0xE010_1000 + 0xFF0, 0xFFFF_FFFF);

        let db = PeripheralDb::builtin();
        let root = component_probe(&mut mem, 0xE00F_F000, &db).unwrap();
        match root {
            Component::RomTable { children, .. } => {
                assert_eq!(children.len(), 1);
                assert_eq!(children[0].base(), 0xE010_0000);
            }
            other => panic!("expected a ROM table, got {:?}", other),
        }
    }

    #[test]
    fn known_part_resolves_without_probe_hook() {
        let mut mem = FlatMemory::new();
        place_component(&mut mem, 0x8000_0000, 9, 0xC05);

        let db = PeripheralDb::builtin();
        match component_probe(&mut mem, 0x8000_0000, &db).unwrap() {
            Component::Peripheral {
                name: Some(name),
                probe_result: None,
                part: 0xC05,
                ..
            } => assert_eq!(name, "Cortex-A5 Debug Unit"),
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn probe_hook_runs_on_database_hit() {
        fn sample_probe(
            mem: &mut dyn MemoryInterface,
            base: u32,
        ) -> Result<String, RomTableError> {
            let devtype = mem.read_word_32(base + 0xFCC)?;
            Ok(format!("devtype {:#x}", devtype))
        }

        let mut mem = FlatMemory::new();
        place_component(&mut mem, 0x4000_0000, 9, 0x123);
        mem.poke(0x4000_0FCC, 0x31);

        let mut db = PeripheralDb::new();
        db.register(PartInfo {
            part: 0x123,
            class: ComponentClass::CoreSight,
            name: "test block",
            probe: Some(sample_probe),
        });

        match component_probe(&mut mem, 0x4000_0000, &db).unwrap() {
            Component::Peripheral {
                probe_result: Some(r),
                ..
            } => assert_eq!(r, "devtype 0x31"),
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn foreign_designer_is_skipped() {
        let mut mem = FlatMemory::new();
        place_component(&mut mem, 0x5000_0000, 9, 0xC05);
        // overwrite PIDR1/PIDR2 with a non-ARM designer
        mem.poke(0x5000_0FE4, 0x10);
        mem.poke(0x5000_0FE8, 0x0A);

        let db = PeripheralDb::builtin();
        match component_probe(&mut mem, 0x5000_0000, &db).unwrap() {
            Component::Foreign { .. } => {}
            other => panic!("expected Foreign, got {:?}", other),
        }
    }

    #[test]
    fn cyclic_rom_tables_terminate() {
        let mut mem = FlatMemory::new();
        // Two tables pointing at each other
        place_rom_table(&mut mem, 0x1000, &[0x1001]); // 0x1000 + 0x1000 -> 0x2000
        place_rom_table(&mut mem, 0x2000, &[0xFFFF_F001]); // 0x2000 - 0x1000 -> 0x1000

        let db = PeripheralDb::builtin();
        let root = component_probe(&mut mem, 0x1000, &db).unwrap();
        // The back edge is pruned: root, child, nothing below
        assert_eq!(root.count(), 2);
    }

    #[test]
    fn discover_walks_from_the_ap_base() {
        let mut ap = MemAp::new(MockDap::new(), 0).unwrap();
        let table = ap.base() & 0xFFFF_F000;
        place_rom_table(&mut ap, table, &[0x1001]);
        place_component(&mut ap, table.wrapping_add(0x1000), 9, 0xC05);

        let db = PeripheralDb::builtin();
        match discover(&mut ap, &db).unwrap() {
            Some(Component::RomTable { base, children }) => {
                assert_eq!(base, table);
                assert_eq!(children.len(), 1);
            }
            other => panic!("expected a ROM table, got {:?}", other),
        }
    }

    #[test]
    fn ap_without_rom_table_yields_none() {
        let mut ap = MemAp::new(MockDap::with_base(NO_ROM_TABLE), 0).unwrap();
        let db = PeripheralDb::builtin();
        assert!(discover(&mut ap, &db).unwrap().is_none());
    }
}
