//! Registry mapping ARM PIDR part numbers to human-readable names, with optional
//! per-part probe hooks that read extra identification out of the component once
//! discovery has located it.
use std::collections::HashMap;

use crate::ap::MemoryInterface;
use crate::romtable::{ComponentClass, RomTableError};

/// Reads component-specific detail from a located peripheral, e.g. its DEVTYPE
/// or a CPU's DBGDIDR.  `base` is the 4 KiB-aligned component base.
pub type ProbeFn = fn(&mut dyn MemoryInterface, base: u32) -> Result<String, RomTableError>;

pub struct PartInfo {
    pub part: u16,
    pub class: ComponentClass,
    pub name: &'static str,
    pub probe: Option<ProbeFn>,
}

/// Lookup table keyed by the 12-bit part number from PIDR
pub struct PeripheralDb {
    parts: HashMap<u16, PartInfo>,
}

impl PeripheralDb {
    pub fn new() -> Self {
        PeripheralDb {
            parts: HashMap::new(),
        }
    }

    pub fn register(&mut self, info: PartInfo) {
        self.parts.insert(info.part, info);
    }

    pub fn lookup(&self, part: u16) -> Option<&PartInfo> {
        self.parts.get(&part)
    }

    /// The parts seen on common ARM silicon
    pub fn builtin() -> Self {
        let mut db = PeripheralDb::new();
        let entries: &[(u16, ComponentClass, &'static str, Option<ProbeFn>)] = &[
            (0x000, ComponentClass::GenericIp, "Cortex-M3 SCS", None),
            (0x001, ComponentClass::GenericIp, "Cortex-M3 ITM", None),
            (0x002, ComponentClass::GenericIp, "Cortex-M3 DWT", None),
            (0x003, ComponentClass::GenericIp, "Cortex-M3 FPB", None),
            (0x008, ComponentClass::GenericIp, "Cortex-M0 SCS", None),
            (0x00A, ComponentClass::GenericIp, "Cortex-M0 DWT", None),
            (0x00B, ComponentClass::GenericIp, "Cortex-M0 BPU", None),
            (0x00C, ComponentClass::GenericIp, "Cortex-M4 SCS", None),
            (0x00D, ComponentClass::CoreSight, "CoreSight ETM11", None),
            (0x00E, ComponentClass::GenericIp, "Cortex-M7 FPB", None),
            (0x490, ComponentClass::CoreSight, "Cortex-A15 GIC", None),
            (0x4C0, ComponentClass::RomTable, "Cortex-M0+ ROM table", None),
            (0x4C3, ComponentClass::RomTable, "Cortex-M3 ROM table", None),
            (0x4C4, ComponentClass::RomTable, "Cortex-M4 ROM table", None),
            (0x4C7, ComponentClass::RomTable, "Cortex-M7 PPB ROM table", None),
            (0x906, ComponentClass::CoreSight, "CoreSight CTI", Some(devtype_probe)),
            (0x907, ComponentClass::CoreSight, "CoreSight ETB", Some(devtype_probe)),
            (0x908, ComponentClass::CoreSight, "CoreSight trace funnel", Some(devtype_probe)),
            (0x912, ComponentClass::CoreSight, "CoreSight TPIU", None),
            (0x913, ComponentClass::CoreSight, "CoreSight ITM", None),
            (0x914, ComponentClass::CoreSight, "CoreSight SWO", None),
            (0x950, ComponentClass::CoreSight, "Cortex-A9 PTM", None),
            (0x961, ComponentClass::CoreSight, "CoreSight TMC", Some(devtype_probe)),
            (0x962, ComponentClass::CoreSight, "CoreSight STM", None),
            (0x923, ComponentClass::CoreSight, "Cortex-M3 TPIU", None),
            (0x924, ComponentClass::CoreSight, "Cortex-M3 ETM", None),
            (0x925, ComponentClass::CoreSight, "Cortex-M4 ETM", None),
            (0x975, ComponentClass::CoreSight, "Cortex-M7 ETM", None),
            (0x9A0, ComponentClass::CoreSight, "CoreSight PMU", None),
            (0x9A1, ComponentClass::CoreSight, "Cortex-M4 TPIU", None),
            (0x9A9, ComponentClass::CoreSight, "Cortex-M7 TPIU", None),
            (0xC05, ComponentClass::CoreSight, "Cortex-A5 Debug Unit", None),
            (0xC07, ComponentClass::CoreSight, "Cortex-A7 Debug Unit", None),
            (0xC08, ComponentClass::CoreSight, "Cortex-A8 Debug Unit", None),
            (0xC09, ComponentClass::CoreSight, "Cortex-A9 Debug Unit", None),
            (0xC0F, ComponentClass::CoreSight, "Cortex-A15 Debug Unit", None),
            (0xC14, ComponentClass::CoreSight, "Cortex-R4 Debug Unit", None),
        ];
        for &(part, class, name, probe) in entries {
            db.register(PartInfo {
                part,
                class,
                name,
                probe,
            });
        }
        db
    }
}

impl Default for PeripheralDb {
    fn default() -> Self {
        PeripheralDb::new()
    }
}

/// Report the CoreSight DEVTYPE register, which tells the component's major/minor
/// function independent of the part number
fn devtype_probe(mem: &mut dyn MemoryInterface, base: u32) -> Result<String, RomTableError> {
    let devtype = mem.read_word_32(base + 0xFCC)?;
    Ok(format!(
        "DEVTYPE major {:#x} sub {:#x}",
        devtype & 0xF,
        (devtype >> 4) & 0xF
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_knows_common_parts() {
        let db = PeripheralDb::builtin();
        assert_eq!(db.lookup(0xC05).unwrap().name, "Cortex-A5 Debug Unit");
        assert_eq!(db.lookup(0x906).unwrap().name, "CoreSight CTI");
        assert!(db.lookup(0xFFF).is_none());
    }

    #[test]
    fn register_overrides_existing_entries() {
        let mut db = PeripheralDb::builtin();
        db.register(PartInfo {
            part: 0xC05,
            class: ComponentClass::CoreSight,
            name: "renamed",
            probe: None,
        });
        assert_eq!(db.lookup(0xC05).unwrap().name, "renamed");
    }
}
