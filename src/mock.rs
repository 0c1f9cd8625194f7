//! In-memory targets, for tests and for running the stack without hardware.
//! `MockCable` models a whole scan chain at the TAP level: it walks the real
//! successor graph clock by clock, so the state machine, chain padding and 35-bit
//! shift plumbing are exercised against something that behaves like silicon,
//! including the pipelined DPACC/APACC ack protocol.  `MockDap` and `FlatMemory`
//! sit higher up for tests that only need register or memory semantics.
use std::collections::HashMap;

use crate::ap::{ApError, MemoryInterface, AP_BASE, AP_CFG, AP_CSW, AP_DRW, AP_IDR, AP_TAR};
use crate::bits::BitBuffer;
use crate::cable::Cable;
use crate::dp::{DapAccess, DpError};
use crate::statemachine::{JtagState, SUCCESSORS};

const ACK_OK: u64 = 0b010;
const ACK_WAIT: u64 = 0b001;

const INS_ABORT: u64 = 0x8;
const INS_DPACC: u64 = 0xA;
const INS_APACC: u64 = 0xB;
const INS_IDCODE: u64 = 0xE;

fn ir_mask(irlen: usize) -> u64 {
    if irlen >= 64 {
        u64::MAX
    } else {
        (1 << irlen) - 1
    }
}

/// Debug Port and MEM-AP state of a DAP device
struct DapState {
    cdbg_req: bool,
    csys_req: bool,
    orun_detect: bool,
    sticky_err: bool,
    select: u32,
    rdbuff: u32,
    prev_ack: u64,
    prev_result: u32,
    csw: u32,
    tar: u32,
    mem: HashMap<u32, u32>,
}

impl DapState {
    fn new() -> Self {
        Self {
            cdbg_req: false,
            csys_req: false,
            orun_detect: false,
            sticky_err: false,
            select: 0,
            rdbuff: 0,
            prev_ack: ACK_OK,
            prev_result: 0,
            csw: 0,
            tar: 0,
            mem: HashMap::new(),
        }
    }

    fn ctrl_value(&self) -> u32 {
        // Power-up requests are acknowledged immediately
        (self.csys_req as u32) << 31
            | (self.csys_req as u32) << 30
            | (self.cdbg_req as u32) << 29
            | (self.cdbg_req as u32) << 28
            | (self.sticky_err as u32) << 5
            | self.orun_detect as u32
    }

    fn write_ctrl(&mut self, value: u32) {
        self.cdbg_req = value & (1 << 28) != 0;
        self.csys_req = value & (1 << 30) != 0;
        self.orun_detect = value & 1 != 0;
        if value & (1 << 5) != 0 {
            self.sticky_err = false;
        }
    }

    fn increment_tar(&mut self) {
        if (self.csw >> 4) & 0b11 == 0 {
            return;
        }
        let step = 1u32 << (self.csw & 0b111);
        // Auto-increment wraps inside the 1 KiB window, as the architecture allows
        self.tar = (self.tar & 0xFFFF_FC00) | (self.tar.wrapping_add(step) & 0x3FF);
    }

    fn dp_transaction(&mut self, addr: u8, rnw: bool, data: u32) {
        match (addr, rnw) {
            (0x4, true) => self.prev_result = self.ctrl_value(),
            (0x4, false) => self.write_ctrl(data),
            (0x8, true) => self.prev_result = self.select,
            (0x8, false) => self.select = data,
            (0xC, true) => self.prev_result = self.rdbuff,
            _ => {}
        }
    }

    fn ap_transaction(&mut self, addr: u8, rnw: bool, data: u32) {
        if self.select >> 24 != 0 {
            // Only AP 0 exists; reads of absent APs come back zero
            if rnw {
                self.prev_result = 0;
                self.rdbuff = 0;
            }
            return;
        }
        let bank = ((self.select >> 4) & 0xF) as u8;
        let reg = (bank << 4) | addr;
        if rnw {
            let value = match reg {
                AP_CSW => self.csw,
                AP_TAR => self.tar,
                AP_DRW => {
                    let value = self.mem.get(&(self.tar & !3)).copied().unwrap_or(0);
                    self.increment_tar();
                    value
                }
                AP_CFG => 0,
                AP_BASE => 0xE00F_F003,
                AP_IDR => 0x2477_0011,
                _ => 0,
            };
            self.prev_result = value;
            self.rdbuff = value;
        } else {
            match reg {
                AP_CSW => self.csw = data,
                AP_TAR => self.tar = data,
                AP_DRW => {
                    self.mem.insert(self.tar & !3, data);
                    self.increment_tar();
                }
                _ => {}
            }
        }
    }
}

/// One TAP on the mocked chain
pub struct MockDevice {
    irlen: usize,
    idcode: u32,
    ir_shift: u64,
    instruction: u64,
    dr_shift: u64,
    dr_len: usize,
    dap: Option<DapState>,
}

impl MockDevice {
    /// A plain TAP: all-ones selects BYPASS, any other instruction presents the
    /// 32-bit ID register
    pub fn generic(irlen: usize, idcode: u32) -> Self {
        Self {
            irlen,
            idcode,
            ir_shift: 0,
            instruction: 0,
            dr_shift: 0,
            dr_len: 1,
            dap: None,
        }
    }

    /// A JTAG-DP with one MEM-AP behind it, 4-bit IR
    pub fn dap(idcode: u32) -> Self {
        Self {
            irlen: 4,
            idcode,
            ir_shift: 0,
            instruction: INS_IDCODE,
            dr_shift: 0,
            dr_len: 1,
            dap: Some(DapState::new()),
        }
    }

    fn out_bit(&self, ir: bool) -> bool {
        if ir {
            self.ir_shift & 1 == 1
        } else {
            self.dr_shift & 1 == 1
        }
    }

    fn shift(&mut self, ir: bool, input: bool) {
        if ir {
            self.ir_shift = (self.ir_shift >> 1) | ((input as u64) << (self.irlen - 1));
        } else {
            self.dr_shift = (self.dr_shift >> 1) | ((input as u64) << (self.dr_len - 1));
        }
    }

    fn reset(&mut self) {
        // A TAP reset selects the ID register
        self.instruction = if self.dap.is_some() { INS_IDCODE } else { 0 };
    }

    fn capture_ir(&mut self) {
        // The mandatory 01 in the low bits
        self.ir_shift = 0b01;
    }

    fn update_ir(&mut self) {
        self.instruction = self.ir_shift & ir_mask(self.irlen);
    }

    fn capture_dr(&mut self) {
        let (value, len) = match &self.dap {
            None => {
                if self.instruction == ir_mask(self.irlen) {
                    (0, 1)
                } else {
                    (self.idcode as u64, 32)
                }
            }
            Some(dap) => match self.instruction {
                INS_IDCODE => (self.idcode as u64, 32),
                INS_DPACC | INS_APACC => (((dap.prev_result as u64) << 3) | dap.prev_ack, 35),
                INS_ABORT => (0, 35),
                _ => (0, 1),
            },
        };
        self.dr_shift = value;
        self.dr_len = len;
    }

    fn update_dr(&mut self, wait: &mut usize) {
        let Some(dap) = &mut self.dap else {
            return;
        };
        match self.instruction {
            INS_DPACC | INS_APACC => {
                if *wait > 0 {
                    *wait -= 1;
                    dap.prev_ack = ACK_WAIT;
                    return;
                }
                let word = self.dr_shift;
                let rnw = word & 1 == 1;
                let addr = (((word >> 1) & 0b11) as u8) << 2;
                let data = (word >> 3) as u32;
                if self.instruction == INS_DPACC {
                    dap.dp_transaction(addr, rnw, data);
                } else {
                    dap.ap_transaction(addr, rnw, data);
                }
                dap.prev_ack = ACK_OK;
            }
            INS_ABORT => {
                if (self.dr_shift >> 3) & 0b11110 != 0 {
                    dap.sticky_err = false;
                }
            }
            _ => {}
        }
    }
}

/// A `Cable` driving a simulated chain instead of hardware.  Device 0 is the one
/// closest to TDO.
pub struct MockCable {
    devices: Vec<MockDevice>,
    state: JtagState,
    wait: usize,
}

impl MockCable {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            state: JtagState::Reset,
            wait: 0,
        }
    }

    /// Answer the next `n` DPACC/APACC transactions with WAIT
    pub fn wait_answers(&mut self, n: usize) {
        self.wait = n;
    }

    /// Latch STICKYERR on every DAP device, as a faulting transaction would
    pub fn latch_sticky_err(&mut self) {
        for dev in &mut self.devices {
            if let Some(dap) = &mut dev.dap {
                dap.sticky_err = true;
            }
        }
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let ir = self.state == JtagState::ShiftIR;
        let tdo = if matches!(self.state, JtagState::ShiftIR | JtagState::ShiftDR) {
            let n = self.devices.len();
            let outs: Vec<bool> = self.devices.iter().map(|d| d.out_bit(ir)).collect();
            for (i, dev) in self.devices.iter_mut().enumerate() {
                let input = if i + 1 < n { outs[i + 1] } else { tdi };
                dev.shift(ir, input);
            }
            outs.first().copied().unwrap_or(tdi)
        } else {
            false
        };

        self.state = SUCCESSORS[self.state as usize][tms as usize];
        match self.state {
            JtagState::Reset => self.devices.iter_mut().for_each(MockDevice::reset),
            JtagState::CaptureIR => self.devices.iter_mut().for_each(MockDevice::capture_ir),
            JtagState::CaptureDR => self.devices.iter_mut().for_each(MockDevice::capture_dr),
            JtagState::UpdateIR => self.devices.iter_mut().for_each(MockDevice::update_ir),
            JtagState::UpdateDR => {
                let wait = &mut self.wait;
                for dev in &mut self.devices {
                    dev.update_dr(wait);
                }
            }
            _ => {}
        }
        tdo
    }

    fn shift_buffer(&mut self, data: &BitBuffer, pause_after: bool) -> BitBuffer {
        let bits = data.len();
        let mut packed = vec![0u8; bits.div_ceil(8)];
        for i in 0..bits {
            let last = pause_after && i + 1 == bits;
            if self.clock(last, data.bit(i)) {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        if pause_after {
            // Exit1 -> Pause
            self.clock(false, true);
        }
        BitBuffer::from_bytes(&packed, bits)
    }
}

impl Cable for MockCable {
    fn change_mode(&mut self, tms: &[u8], tdi: bool) {
        for &t in tms {
            self.clock(t != 0, tdi);
        }
    }

    fn read_data(&mut self, bits: usize, pause_after: bool) -> BitBuffer {
        self.shift_buffer(&BitBuffer::ones(bits), pause_after)
    }

    fn write_data(&mut self, data: &BitBuffer, pause_after: bool) {
        self.shift_buffer(data, pause_after);
    }

    fn read_write_data(&mut self, data: &BitBuffer, pause_after: bool) -> BitBuffer {
        self.shift_buffer(data, pause_after)
    }
}

/// A `DapAccess` with a flat word memory behind one MEM-AP, for tests above the wire
/// level.  `tar_writes` counts TAR programming so window handling is observable.
pub struct MockDap {
    mem: HashMap<u32, u32>,
    csw: u32,
    tar: u32,
    base: u32,
    pub tar_writes: usize,
}

impl MockDap {
    pub fn new() -> Self {
        Self::with_base(0xE00F_F003)
    }

    pub fn with_base(base: u32) -> Self {
        Self {
            mem: HashMap::new(),
            csw: 0,
            tar: 0,
            base,
            tar_writes: 0,
        }
    }

    pub fn poke(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr & !3, value);
    }

    pub fn peek(&self, addr: u32) -> u32 {
        self.mem.get(&(addr & !3)).copied().unwrap_or(0)
    }

    fn increment_tar(&mut self) {
        if (self.csw >> 4) & 0b11 == 0 {
            return;
        }
        let step = 1u32 << (self.csw & 0b111);
        self.tar = (self.tar & 0xFFFF_FC00) | (self.tar.wrapping_add(step) & 0x3FF);
    }

    fn drw_write(&mut self, value: u32) {
        let bytes = 1u32 << (self.csw & 0b111);
        if bytes >= 4 {
            self.mem.insert(self.tar & !3, value);
        } else {
            // Merge only the addressed lanes, as a sized hardware write would
            let lane_mask = (4 - bytes) & 0x3;
            let shift = (self.tar & lane_mask) * 8;
            let mask = (((1u64 << (8 * bytes)) - 1) as u32) << shift;
            let old = self.peek(self.tar);
            self.mem.insert(self.tar & !3, (old & !mask) | (value & mask));
        }
        self.increment_tar();
    }
}

impl Default for MockDap {
    fn default() -> Self {
        Self::new()
    }
}

impl DapAccess for MockDap {
    fn dp_read(&mut self, _addr: u8) -> Result<u32, DpError> {
        Ok(0)
    }

    fn dp_write(&mut self, _addr: u8, _value: u32) -> Result<(), DpError> {
        Ok(())
    }

    fn ap_read(&mut self, _apsel: u8, addr: u8) -> Result<u32, DpError> {
        Ok(match addr {
            AP_CSW => self.csw,
            AP_TAR => self.tar,
            AP_DRW => {
                let value = self.peek(self.tar);
                self.increment_tar();
                value
            }
            AP_CFG => 0,
            AP_BASE => self.base,
            AP_IDR => 0x2477_0011,
            _ => 0,
        })
    }

    fn ap_write(&mut self, _apsel: u8, addr: u8, value: u32) -> Result<(), DpError> {
        match addr {
            AP_CSW => self.csw = value,
            AP_TAR => {
                self.tar = value;
                self.tar_writes += 1;
            }
            AP_DRW => self.drw_write(value),
            _ => {}
        }
        Ok(())
    }

    fn ap_read_repeat(&mut self, apsel: u8, addr: u8, n: usize) -> Result<Vec<u32>, DpError> {
        (0..n).map(|_| self.ap_read(apsel, addr)).collect()
    }

    fn ap_write_repeat(&mut self, apsel: u8, addr: u8, values: &[u32]) -> Result<(), DpError> {
        for &value in values {
            self.ap_write(apsel, addr, value)?;
        }
        Ok(())
    }
}

/// A bare `MemoryInterface` over a word map, for discovery tests that do not need an
/// AP underneath
pub struct FlatMemory {
    mem: HashMap<u32, u32>,
}

impl FlatMemory {
    pub fn new() -> Self {
        Self {
            mem: HashMap::new(),
        }
    }

    pub fn poke(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr & !3, value);
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInterface for FlatMemory {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ApError> {
        Ok(self.mem.get(&(address & !3)).copied().unwrap_or(0))
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ApError> {
        self.mem.insert(address & !3, data);
        Ok(())
    }

    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ApError> {
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = self.read_word_32(address + 4 * i as u32)?;
        }
        Ok(())
    }

    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ApError> {
        for (i, &word) in data.iter().enumerate() {
            self.write_word_32(address + 4 * i as u32, word)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::TapSm;

    #[test]
    fn single_bypass_device_delays_by_one_bit() {
        let cable = Box::new(MockCable::new(vec![MockDevice::generic(4, 0x1234_5678)]));
        let mut sm = TapSm::new(cable);

        sm.scan_ir(&BitBuffer::ones(4), false);
        let mut pattern = BitBuffer::from_val(0b1011, 4);
        pattern.tail(&BitBuffer::zeros(1));
        let echo = sm.scan_dr(&pattern, true).unwrap();
        // One bypass bit of delay: the echoed stream is the input shifted up by one
        assert_eq!(echo.bit(0), false);
        for i in 0..4 {
            assert_eq!(echo.bit(i + 1), pattern.bit(i));
        }
    }

    #[test]
    fn reset_reselects_the_id_register() {
        let cable = Box::new(MockCable::new(vec![MockDevice::generic(4, 0xdead_beef)]));
        let mut sm = TapSm::new(cable);

        sm.scan_ir(&BitBuffer::ones(4), false);
        sm.tap_reset();
        let echo = sm.scan_dr(&BitBuffer::zeros(32), true).unwrap();
        assert_eq!(echo.to_u64() as u32, 0xdead_beef);
    }

    #[test]
    fn mock_dap_merges_byte_lanes() {
        let mut dap = MockDap::new();
        dap.poke(0x100, 0xaabb_ccdd);
        dap.ap_write(0, AP_CSW, 0).unwrap(); // 8-bit transfers, no increment
        dap.ap_write(0, AP_TAR, 0x101).unwrap();
        dap.ap_write(0, AP_DRW, 0x0000_1100).unwrap();
        assert_eq!(dap.peek(0x100), 0xaabb_11dd);
    }
}
