//! The ADIv5 JTAG Debug Port.  `JtagDp` drives one DAP device on a scanned chain
//! through the ABORT/DPACC/APACC instructions: 35-bit shift words, ack decoding, the
//! power-up handshake and sticky error handling.  Upper layers access it through the
//! `DapAccess` trait so a MEM-AP does not care what kind of DP carries it.
use core::ops::DerefMut;

use bitfield::bitfield;
use thiserror::Error;

use crate::bits::BitBuffer;
use crate::cable::Cable;
use crate::chain::{Chain, ChainError};

#[derive(Error, Debug)]
pub enum DpError {
    #[error("target answered WAIT and the retry budget is exhausted")]
    Wait,
    #[error("protocol error: DPACC/APACC ack {0:#05b}")]
    InvalidAck(u8),
    #[error("debug power-up request was not acknowledged")]
    PowerUp,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// JTAG-DP instruction register encodings, 4 bits each
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Instruction {
    Abort = 0x8,
    DpAcc = 0xA,
    ApAcc = 0xB,
    Idcode = 0xE,
}

const IR_LEN: usize = 4;

/// DPACC register addresses
pub const DP_CTRL_STAT: u8 = 0x4;
pub const DP_SELECT: u8 = 0x8;
pub const DP_RDBUFF: u8 = 0xC;

const ACK_OK: u8 = 0b010;
const ACK_WAIT: u8 = 0b001;

bitfield! {
    /// ABORT register.  Write-only; only the low five bits mean anything, the rest of
    /// the 35-bit shift word is reserved zero.
    #[derive(Clone)]
    pub struct Abort(u32);
    impl Debug;
    pub orunerrclr, set_orunerrclr: 4;
    pub wderrclr, set_wderrclr: 3;
    pub stkerrclr, set_stkerrclr: 2;
    pub stkcmpclr, set_stkcmpclr: 1;
    pub dapabort, set_dapabort: 0;
}

bitfield! {
    /// CTRL/STAT register.  The sticky bits clear when written back as ones.
    #[derive(Clone)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub sticky_err, set_sticky_err: 5;
    pub sticky_cmp, set_sticky_cmp: 4;
    pub sticky_orun, set_sticky_orun: 1;
    pub orun_detect, set_orun_detect: 0;
}

bitfield! {
    /// SELECT register: AP index, AP register bank and DP register bank
    #[derive(Clone)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

/// Sticky error flags observed by `JtagDp::error`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StickyErrors {
    pub orun: bool,
    pub cmp: bool,
    pub err: bool,
}

impl StickyErrors {
    pub fn any(&self) -> bool {
        self.orun || self.cmp || self.err
    }
}

/// Tuning knobs for the DP session.
///
/// `wait_retries` bounds how often a shift that came back with a WAIT ack is reissued
/// before giving up; the default of zero makes WAIT fatal immediately.  A boundary
/// layer that wants retry/backoff sets its own budget.  `powerup_polls` bounds the
/// CTRL/STAT polling loop of the power-up handshake.
#[derive(Clone, Debug)]
pub struct DpConfig {
    pub wait_retries: usize,
    pub powerup_polls: usize,
}

impl Default for DpConfig {
    fn default() -> Self {
        Self {
            wait_retries: 0,
            powerup_polls: 100,
        }
    }
}

/// Register access on a Debug Port and the APs behind it.  Implemented by `JtagDp`;
/// conceptually a SW-DP sits behind the same trait.
pub trait DapAccess {
    fn dp_read(&mut self, addr: u8) -> Result<u32, DpError>;
    fn dp_write(&mut self, addr: u8, value: u32) -> Result<(), DpError>;
    fn ap_read(&mut self, apsel: u8, addr: u8) -> Result<u32, DpError>;
    fn ap_write(&mut self, apsel: u8, addr: u8, value: u32) -> Result<(), DpError>;
    /// Pipelined read of the same AP register `n` times
    fn ap_read_repeat(&mut self, apsel: u8, addr: u8, n: usize) -> Result<Vec<u32>, DpError>;
    /// Back-to-back writes of the same AP register
    fn ap_write_repeat(&mut self, apsel: u8, addr: u8, values: &[u32]) -> Result<(), DpError>;
}

pub struct JtagDp<T> {
    chain: Chain<T>,
    index: usize,
    config: DpConfig,
    last_ir: Option<u8>,
}

impl<T, U> JtagDp<T>
where
    T: DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    /// Attach to the DAP device at chain position `index` and run the power-up
    /// handshake: clear sticky errors, request debug and system power, wait for both
    /// acks, then enable overrun detection.  The chain must already be scanned.
    pub fn new(chain: Chain<T>, index: usize, config: DpConfig) -> Result<Self, DpError> {
        let mut dp = Self {
            chain,
            index,
            config,
            last_ir: None,
        };

        let idcode = dp.read_idcode()?;
        log::info!("JTAG-DP at chain index {}, idcode {:#010x}", index, idcode);
        dp.power_up()?;
        Ok(dp)
    }

    /// Give the chain back, e.g. to talk to another device on it
    pub fn release(self) -> Chain<T> {
        self.chain
    }

    /// Shift `ins` into the IR unless it is already selected.  The last instruction is
    /// cached per session; anything else touching the chain invalidates the session.
    fn write_ir(&mut self, ins: Instruction) -> Result<(), DpError> {
        if self.last_ir != Some(ins as u8) {
            self.chain
                .wr_ir(self.index, &BitBuffer::from_val(ins as u64, IR_LEN))?;
            self.last_ir = Some(ins as u8);
        }
        Ok(())
    }

    /// One 35-bit DPACC/APACC shift.  The returned data belongs to the transaction
    /// before this one; the ack is checked here, reissuing on WAIT within the
    /// configured budget.
    fn acc(&mut self, ins: Instruction, addr: u8, rnw: bool, data: u32) -> Result<u32, DpError> {
        self.write_ir(ins)?;
        let word = BitBuffer::from_val(
            ((data as u64) << 3) | ((((addr >> 2) & 3) as u64) << 1) | rnw as u64,
            35,
        );
        for attempt in 0.. {
            let echo = self.chain.rw_dr(self.index, &word)?;
            let fields = echo.split(&[3, 32]);
            let ack = fields[0].to_u64() as u8;
            match ack {
                ACK_OK => return Ok(fields[1].to_u64() as u32),
                ACK_WAIT if attempt < self.config.wait_retries => {
                    log::debug!("ack WAIT, retry {}", attempt + 1);
                }
                ACK_WAIT => return Err(DpError::Wait),
                other => return Err(DpError::InvalidAck(other)),
            }
        }
        unreachable!()
    }

    /// Read the 32-bit device ID through the IDCODE instruction
    pub fn read_idcode(&mut self) -> Result<u32, DpError> {
        self.write_ir(Instruction::Idcode)?;
        let echo = self.chain.rw_dr(self.index, &BitBuffer::zeros(32))?;
        Ok(echo.to_u64() as u32)
    }

    /// Write the ABORT register
    pub fn abort(&mut self, value: Abort) -> Result<(), DpError> {
        self.write_ir(Instruction::Abort)?;
        let word = BitBuffer::from_val((value.0 as u64) << 3, 35);
        self.chain.wr_dr(self.index, &word)?;
        Ok(())
    }

    fn power_up(&mut self) -> Result<(), DpError> {
        // Clear whatever sticky errors a previous session left latched
        let mut clear = Ctrl(0);
        clear.set_sticky_err(true);
        clear.set_sticky_cmp(true);
        clear.set_sticky_orun(true);
        self.dp_write(DP_CTRL_STAT, clear.0)?;

        let mut req = Ctrl(0);
        req.set_cdbgpwrupreq(true);
        req.set_csyspwrupreq(true);
        self.dp_write(DP_CTRL_STAT, req.0)?;

        let mut powered = false;
        for _ in 0..self.config.powerup_polls {
            let stat = Ctrl(self.dp_read(DP_CTRL_STAT)?);
            if stat.cdbgpwrupack() && stat.csyspwrupack() {
                powered = true;
                break;
            }
        }
        if !powered {
            return Err(DpError::PowerUp);
        }

        req.set_orun_detect(true);
        self.dp_write(DP_CTRL_STAT, req.0)?;
        log::debug!("debug and system domains powered up");
        Ok(())
    }

    /// Read CTRL/STAT, clear the sticky error bits, and report which were set.  The
    /// read is destructive on purpose: the caller learns what faulted and the DP is
    /// clean for the next transaction.
    pub fn error(&mut self) -> Result<StickyErrors, DpError> {
        let stat = Ctrl(self.dp_read(DP_CTRL_STAT)?);
        let sticky = StickyErrors {
            orun: stat.sticky_orun(),
            cmp: stat.sticky_cmp(),
            err: stat.sticky_err(),
        };

        let mut clear = Ctrl(0);
        clear.set_cdbgpwrupreq(true);
        clear.set_csyspwrupreq(true);
        clear.set_orun_detect(true);
        clear.set_sticky_err(true);
        clear.set_sticky_cmp(true);
        clear.set_sticky_orun(true);
        self.dp_write(DP_CTRL_STAT, clear.0)?;
        Ok(sticky)
    }

    /// Route the following APACC transactions.  SELECT is rewritten before every AP
    /// access rather than cached; skipping redundant writes would be a pure
    /// optimization.
    fn select(&mut self, apsel: u8, addr: u8) -> Result<(), DpError> {
        let mut select = Select(0);
        select.set_ap_sel(apsel);
        select.set_ap_bank_sel(addr >> 4);
        select.set_dp_bank_sel(0);
        self.dp_write(DP_SELECT, select.0)
    }
}

impl<T, U> DapAccess for JtagDp<T>
where
    T: DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    fn dp_read(&mut self, addr: u8) -> Result<u32, DpError> {
        // A shift returns the data captured before it, so issue the read and collect
        // the value with a second transaction targeting RDBUFF.
        self.acc(Instruction::DpAcc, addr, true, 0)?;
        self.acc(Instruction::DpAcc, DP_RDBUFF, true, 0)
    }

    fn dp_write(&mut self, addr: u8, value: u32) -> Result<(), DpError> {
        self.acc(Instruction::DpAcc, addr, false, value)?;
        // The following RDBUFF read carries the write's ack
        self.acc(Instruction::DpAcc, DP_RDBUFF, true, 0)?;
        Ok(())
    }

    fn ap_read(&mut self, apsel: u8, addr: u8) -> Result<u32, DpError> {
        Ok(self.ap_read_repeat(apsel, addr, 1)?[0])
    }

    fn ap_write(&mut self, apsel: u8, addr: u8, value: u32) -> Result<(), DpError> {
        self.ap_write_repeat(apsel, addr, &[value])
    }

    fn ap_read_repeat(&mut self, apsel: u8, addr: u8, n: usize) -> Result<Vec<u32>, DpError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.select(apsel, addr)?;

        // Pipelined: the first response is stale, response i carries beat i-1, and
        // the last beat is collected from RDBUFF because no further AP transaction
        // follows to trigger its capture.
        self.acc(Instruction::ApAcc, addr, true, 0)?;
        let mut values = Vec::with_capacity(n);
        for _ in 1..n {
            values.push(self.acc(Instruction::ApAcc, addr, true, 0)?);
        }
        values.push(self.acc(Instruction::DpAcc, DP_RDBUFF, true, 0)?);
        Ok(values)
    }

    fn ap_write_repeat(&mut self, apsel: u8, addr: u8, values: &[u32]) -> Result<(), DpError> {
        self.select(apsel, addr)?;
        for &value in values {
            self.acc(Instruction::ApAcc, addr, false, value)?;
        }
        // Collect the final write's ack
        self.acc(Instruction::DpAcc, DP_RDBUFF, true, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, TapSpec};
    use crate::mock::{MockCable, MockDevice};
    use crate::statemachine::TapSm;

    const DAP_IDCODE: u32 = 0x4ba0_0477;

    fn dp_chain(cable: MockCable) -> Chain<Box<MockCable>> {
        let sm = TapSm::new(Box::new(cable));
        let mut chain = Chain::new(
            sm,
            &[TapSpec {
                irlen: 4,
                idcode: DAP_IDCODE,
                name: "dap",
            }],
        );
        chain.scan().unwrap();
        chain
    }

    fn powered_dp() -> JtagDp<Box<MockCable>> {
        let cable = MockCable::new(vec![MockDevice::dap(DAP_IDCODE)]);
        JtagDp::new(dp_chain(cable), 0, DpConfig::default()).unwrap()
    }

    #[test]
    fn power_up_sets_ack_bits() {
        let mut dp = powered_dp();
        let stat = Ctrl(dp.dp_read(DP_CTRL_STAT).unwrap());
        assert!(stat.cdbgpwrupack());
        assert!(stat.csyspwrupack());
        assert!(stat.orun_detect());
    }

    #[test]
    fn idcode_readback() {
        let mut dp = powered_dp();
        assert_eq!(dp.read_idcode().unwrap(), DAP_IDCODE);
    }

    #[test]
    fn ap_read_round_trips_memory() {
        let mut dp = powered_dp();
        // Point TAR at a word the mock preloaded and read DRW
        dp.ap_write(0, 0x04, 0x2000_0000).unwrap();
        dp.ap_write(0, 0x0C, 0xcafe_f00d).unwrap();
        dp.ap_write(0, 0x04, 0x2000_0000).unwrap();
        assert_eq!(dp.ap_read(0, 0x0C).unwrap(), 0xcafe_f00d);
    }

    #[test]
    fn wait_is_fatal_without_budget() {
        let mut cable = MockCable::new(vec![MockDevice::dap(DAP_IDCODE)]);
        cable.wait_answers(3);
        match JtagDp::new(dp_chain(cable), 0, DpConfig::default()) {
            Err(DpError::Wait) => {}
            Err(other) => panic!("expected Wait, got {:?}", other),
            Ok(_) => panic!("expected Wait, got a powered-up DP"),
        }
    }

    #[test]
    fn wait_retry_budget_recovers() {
        let mut cable = MockCable::new(vec![MockDevice::dap(DAP_IDCODE)]);
        cable.wait_answers(3);
        let config = DpConfig {
            wait_retries: 8,
            ..DpConfig::default()
        };
        let dp = JtagDp::new(dp_chain(cable), 0, config);
        assert!(dp.is_ok());
    }

    #[test]
    fn sticky_errors_are_read_and_cleared() {
        let mut dp = powered_dp();
        dp.chain.sm.cable.latch_sticky_err();

        let first = dp.error().unwrap();
        assert!(first.err);
        let second = dp.error().unwrap();
        assert!(!second.any());
    }
}
