//! MEM-AP access: addressed memory reads and writes through the CSW/TAR/DRW registers
//! of an ADIv5 Memory Access Port, on top of any `DapAccess` implementation.  Handles
//! the transfer-size lanes of sub-word accesses and the 1 KiB auto-increment window of
//! TAR, which silently stops incrementing at the boundary.
use bitfield::bitfield;
use thiserror::Error;

use crate::dp::{DapAccess, DpError};

#[derive(Error, Debug)]
pub enum ApError {
    #[error(transparent)]
    Dp(#[from] DpError),
    #[error("address {addr:#010x} is not aligned for a {bits}-bit transfer")]
    Unaligned { addr: u32, bits: u32 },
    #[error("{bits}-bit transfers are not supported by memory read/write")]
    UnsupportedSize { bits: u32 },
}

/// MEM-AP register addresses
pub const AP_CSW: u8 = 0x00;
pub const AP_TAR: u8 = 0x04;
pub const AP_DRW: u8 = 0x0C;
pub const AP_CFG: u8 = 0xF4;
pub const AP_BASE: u8 = 0xF8;
pub const AP_IDR: u8 = 0xFC;

/// TAR auto-increment is only architected within a 1 KiB window
const WINDOW_MASK: u32 = 0xFFFF_FC00;
const WINDOW_SIZE: u32 = 0x400;

/// BASE reads back all-ones when the AP has no debug base address
pub const NO_ROM_TABLE: u32 = 0xFFFF_FFFF;

bitfield! {
    /// CSW register of a MEM-AP
    #[derive(Clone)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, _: 31;
    pub u8, prot, set_prot: 30, 24;
    pub spiden, _: 23;
    pub tr_in_prog, set_tr_in_prog: 7;
    pub device_en, _: 6;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

const ADDR_INC_SINGLE: u8 = 0b01;

/// CSW transfer size encodings
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferSize {
    Bits8 = 0,
    Bits16 = 1,
    Bits32 = 2,
    Bits64 = 3,
    Bits128 = 4,
    Bits256 = 5,
}

impl TransferSize {
    pub fn bytes(self) -> u32 {
        1 << (self as u32)
    }

    pub fn bits(self) -> u32 {
        8 * self.bytes()
    }
}

/// Recover the meaningful part of a 32-bit DRW lane for a sub-word transfer at `addr`
pub fn extract(value: u32, addr: u32, size: TransferSize) -> u32 {
    let lane_mask = 4u32.saturating_sub(size.bytes()) & 0x3;
    let value = value >> ((addr & lane_mask) * 8);
    match size {
        TransferSize::Bits8 => value & 0xff,
        TransferSize::Bits16 => value & 0xffff,
        _ => value,
    }
}

/// Position a value into its DRW lane for a sub-word write at `addr`
fn insert(value: u32, addr: u32, size: TransferSize) -> u32 {
    let lane_mask = 4u32.saturating_sub(size.bytes()) & 0x3;
    value << ((addr & lane_mask) * 8)
}

pub struct MemAp<D> {
    dap: D,
    apsel: u8,
    /// CSW with the size, increment and transfer-in-progress bits cleared; each
    /// operation ORs its own size and increment mode back in
    csw_template: u32,
    /// Last CSW actually written, to skip redundant writes
    csw: u32,
    base: u32,
    cfg: u32,
}

impl<D: DapAccess> MemAp<D> {
    /// Attach to the AP numbered `apsel`, reading and caching its CFG, BASE and CSW
    pub fn new(mut dap: D, apsel: u8) -> Result<Self, ApError> {
        let idr = dap.ap_read(apsel, AP_IDR)?;
        let cfg = dap.ap_read(apsel, AP_CFG)?;
        let base = dap.ap_read(apsel, AP_BASE)?;
        let csw = dap.ap_read(apsel, AP_CSW)?;
        log::info!(
            "AP {}: idr {:#010x} base {:#010x} cfg {:#x}",
            apsel,
            idr,
            base,
            cfg
        );

        let mut template = Csw(csw);
        template.set_size(0);
        template.set_addr_inc(0);
        template.set_tr_in_prog(false);
        Ok(Self {
            dap,
            apsel,
            csw_template: template.0,
            csw,
            base,
            cfg,
        })
    }

    pub fn apsel(&self) -> u8 {
        self.apsel
    }

    pub fn cfg(&self) -> u32 {
        self.cfg
    }

    /// The BASE register value; `NO_ROM_TABLE` means the AP is terminal
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn dap(&mut self) -> &mut D {
        &mut self.dap
    }

    fn write_csw(&mut self, csw: u32) -> Result<(), ApError> {
        if csw != self.csw {
            self.dap.ap_write(self.apsel, AP_CSW, csw)?;
            self.csw = csw;
        }
        Ok(())
    }

    /// Program CSW for `size` transfers with single auto-increment and point TAR at
    /// `addr`
    pub fn mem_setup(&mut self, addr: u32, size: TransferSize) -> Result<(), ApError> {
        if addr % size.bytes().min(4) != 0 {
            return Err(ApError::Unaligned {
                addr,
                bits: size.bits(),
            });
        }
        let mut csw = Csw(self.csw_template);
        csw.set_size(size as u8);
        csw.set_addr_inc(ADDR_INC_SINGLE);
        self.write_csw(csw.0)?;
        self.dap.ap_write(self.apsel, AP_TAR, addr)?;
        Ok(())
    }

    /// Read `n` values of `size` bits starting at `addr`.  Values are lane-extracted,
    /// so a `Bits8` read yields one byte per element.
    pub fn mem_rd(&mut self, addr: u32, n: usize, size: TransferSize) -> Result<Vec<u32>, ApError> {
        if size.bytes() > 4 {
            return Err(ApError::UnsupportedSize { bits: size.bits() });
        }
        self.mem_setup(addr, size)?;

        let step = size.bytes();
        let mut out = Vec::with_capacity(n);
        let mut pos = addr;
        let mut remaining = n;
        while remaining > 0 {
            // TAR only auto-increments inside its window, so split the run at each
            // 1 KiB boundary and reprogram it there
            let window_end = (pos & WINDOW_MASK) + WINDOW_SIZE;
            let beats = (((window_end - pos) / step) as usize).min(remaining);
            for value in self.dap.ap_read_repeat(self.apsel, AP_DRW, beats)? {
                out.push(extract(value, pos, size));
                pos = pos.wrapping_add(step);
            }
            remaining -= beats;
            if remaining > 0 {
                self.dap.ap_write(self.apsel, AP_TAR, pos)?;
            }
        }
        Ok(out)
    }

    /// Write `data` as `size`-bit values starting at `addr`.  Values are positioned
    /// into their DRW lane here, so a `Bits8` write takes one byte per element.
    pub fn mem_wr(&mut self, addr: u32, data: &[u32], size: TransferSize) -> Result<(), ApError> {
        if size.bytes() > 4 {
            return Err(ApError::UnsupportedSize { bits: size.bits() });
        }
        self.mem_setup(addr, size)?;

        let step = size.bytes();
        let mut pos = addr;
        let mut remaining = data;
        while !remaining.is_empty() {
            let window_end = (pos & WINDOW_MASK) + WINDOW_SIZE;
            let beats = (((window_end - pos) / step) as usize).min(remaining.len());
            let lane: Vec<u32> = remaining[..beats]
                .iter()
                .enumerate()
                .map(|(i, &v)| insert(v, pos.wrapping_add(i as u32 * step), size))
                .collect();
            self.dap.ap_write_repeat(self.apsel, AP_DRW, &lane)?;
            pos = pos.wrapping_add(beats as u32 * step);
            remaining = &remaining[beats..];
            if !remaining.is_empty() {
                self.dap.ap_write(self.apsel, AP_TAR, pos)?;
            }
        }
        Ok(())
    }
}

/// Word-oriented memory access, the shape the component and discovery code consumes
pub trait MemoryInterface {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ApError>;
    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ApError>;
    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ApError>;
    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ApError>;
}

impl<D: DapAccess> MemoryInterface for MemAp<D> {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ApError> {
        Ok(self.mem_rd(address, 1, TransferSize::Bits32)?[0])
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ApError> {
        self.mem_wr(address, &[data], TransferSize::Bits32)
    }

    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ApError> {
        let values = self.mem_rd(address, data.len(), TransferSize::Bits32)?;
        data.copy_from_slice(&values);
        Ok(())
    }

    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ApError> {
        self.mem_wr(address, data, TransferSize::Bits32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDap;

    #[test]
    fn extract_selects_the_lane() {
        let v = 0x8765_4321;
        assert_eq!(extract(v, 0, TransferSize::Bits8), 0x21);
        assert_eq!(extract(v, 1, TransferSize::Bits8), 0x43);
        assert_eq!(extract(v, 2, TransferSize::Bits16), 0x8765);
        assert_eq!(extract(v, 0, TransferSize::Bits32), v);
    }

    #[test]
    fn insert_mirrors_extract() {
        for addr in 0..4 {
            let v = insert(0xab, addr, TransferSize::Bits8);
            assert_eq!(extract(v, addr, TransferSize::Bits8), 0xab);
        }
    }

    #[test]
    fn word_reads_round_trip() {
        let mut ap = MemAp::new(MockDap::new(), 0).unwrap();
        ap.write_word_32(0x2000_0000, 0x1122_3344).unwrap();
        assert_eq!(ap.read_word_32(0x2000_0000).unwrap(), 0x1122_3344);
    }

    #[test]
    fn byte_reads_use_lanes() {
        let mut ap = MemAp::new(MockDap::new(), 0).unwrap();
        ap.write_word_32(0x2000_0000, 0x8765_4321).unwrap();
        let bytes = ap.mem_rd(0x2000_0000, 4, TransferSize::Bits8).unwrap();
        assert_eq!(bytes, vec![0x21, 0x43, 0x65, 0x87]);
    }

    #[test]
    fn block_read_crosses_increment_window() {
        let mut dap = MockDap::new();
        // 16 words straddling a 1 KiB boundary
        for i in 0..16u32 {
            dap.poke(0x2000_03e0 + i * 4, 0x100 + i);
        }
        let mut ap = MemAp::new(dap, 0).unwrap();

        let tar_writes_before = ap.dap().tar_writes;
        let words = ap.mem_rd(0x2000_03e0, 16, TransferSize::Bits32).unwrap();
        let expected: Vec<u32> = (0..16).map(|i| 0x100 + i).collect();
        assert_eq!(words, expected);
        // One setup write plus exactly one reprogram at the boundary
        assert_eq!(ap.dap().tar_writes - tar_writes_before, 2);
    }

    #[test]
    fn block_write_crosses_increment_window() {
        let mut ap = MemAp::new(MockDap::new(), 0).unwrap();
        let data: Vec<u32> = (0..16).map(|i| 0xa000 + i).collect();
        ap.mem_wr(0x2000_03e0, &data, TransferSize::Bits32).unwrap();
        for (i, &v) in data.iter().enumerate() {
            assert_eq!(ap.dap().peek(0x2000_03e0 + i as u32 * 4), v);
        }
    }

    #[test]
    fn unaligned_setup_is_rejected() {
        let mut ap = MemAp::new(MockDap::new(), 0).unwrap();
        match ap.mem_rd(0x2000_0002, 1, TransferSize::Bits32) {
            Err(ApError::Unaligned { .. }) => {}
            other => panic!("expected Unaligned, got {:?}", other),
        }
    }
}
