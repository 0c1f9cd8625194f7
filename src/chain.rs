//! Multi-TAP scan chains.  `Chain` lets the upper layers talk to one device on the
//! chain as if it were alone: every other device is held in BYPASS and the IR/DR shift
//! words are padded so the target device sees exactly its own bits.  `scan` enumerates
//! the chain (device count, total IR length, ID codes) and validates it against the
//! expected chain description before any padded access is allowed.
use core::ops::DerefMut;

use thiserror::Error;

use crate::bits::BitBuffer;
use crate::cable::Cable;
use crate::statemachine::TapSm;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("expected {expected} devices on the chain, found {found}")]
    DeviceCount { expected: usize, found: usize },
    #[error("expected a total IR length of {expected} bits, measured {found}")]
    IrLength { expected: usize, found: usize },
    #[error("device {index}: expected IDCODE {expected:#010x}, read {found:#010x}")]
    Idcode {
        index: usize,
        expected: u32,
        found: u32,
    },
    #[error("device {index}: IR capture value {value:#x} does not end in 01")]
    IrCapture { index: usize, value: u64 },
    #[error("flush measurement saw {ones} one bits where exactly one should survive")]
    Flush { ones: usize },
    #[error("the chain has not been scanned")]
    NotScanned,
    #[error("no device at chain index {0}")]
    NoSuchDevice(usize),
    #[error("device {index} takes a {expected}-bit IR payload, got {found} bits")]
    IrWidth {
        index: usize,
        expected: usize,
        found: usize,
    },
}

/// One entry of the expected chain description, in chain order.  Index 0 is the device
/// closest to TDO.
#[derive(Clone, Debug)]
pub struct TapSpec {
    pub irlen: usize,
    pub idcode: u32,
    pub name: &'static str,
}

/// A device on a scanned chain, with the padding counts all shift words need so the
/// other devices stay transparent.
#[derive(Clone, Debug)]
pub struct JtagDevice {
    pub index: usize,
    pub irlen: usize,
    pub idcode: u32,
    pub name: &'static str,
    /// Summed IR length of the devices between this one and TDO
    pub irlen_before: usize,
    /// Summed IR length of the devices between this one and TDI
    pub irlen_after: usize,
    /// Bypassed devices contribute one DR bit each
    pub devs_before: usize,
    pub devs_after: usize,
}

pub struct Chain<T> {
    pub sm: TapSm<T>,
    expected: Vec<TapSpec>,
    devices: Vec<JtagDevice>,
    max_devices: usize,
}

impl<T, U> Chain<T>
where
    T: DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    /// Create a chain model from an existing `TapSm` and the expected chain layout.
    /// Nothing is shifted until `scan` is called.
    pub fn new(sm: TapSm<T>, expected: &[TapSpec]) -> Self {
        Self {
            sm,
            expected: expected.to_vec(),
            devices: Vec::new(),
            max_devices: 32,
        }
    }

    /// Bound on the number of devices the enumeration flush can see.  Sizes the
    /// all-ones bypass shift, so raising it costs time on every `scan`.
    pub fn set_max_devices(&mut self, max_devices: usize) {
        self.max_devices = max_devices;
    }

    pub fn device(&self, index: usize) -> Result<&JtagDevice, ChainError> {
        if self.devices.is_empty() {
            return Err(ChainError::NotScanned);
        }
        self.devices.get(index).ok_or(ChainError::NoSuchDevice(index))
    }

    pub fn devices(&self) -> &[JtagDevice] {
        &self.devices
    }

    fn flush_size(&self) -> usize {
        self.max_devices * 32
    }

    /// Measure the number of bits on the currently selected register path by flushing
    /// zeros through it, following them with a single one, and counting how many zero
    /// bits precede the surviving one in the echoed stream.
    fn path_length(&mut self, ir: bool) -> Result<usize, ChainError> {
        let flush = self.flush_size();
        let mut tdi = BitBuffer::zeros(flush);
        tdi.tail(&BitBuffer::ones(1));
        tdi.tail(&BitBuffer::zeros(flush));

        let mut echo = if ir {
            self.sm.scan_ir(&tdi, true)
        } else {
            self.sm.scan_dr(&tdi, true)
        }
        .expect("capture requested");

        // The first `flush` bits carry whatever the capture stage loaded; the
        // marker can only surface after them.
        echo.drop_head(flush);
        if echo.count_ones() != 1 {
            return Err(ChainError::Flush {
                ones: echo.count_ones(),
            });
        }
        Ok(echo.first_one().unwrap_or(0))
    }

    /// Number of bits on the IR path of the whole chain
    pub fn ir_length(&mut self) -> Result<usize, ChainError> {
        self.path_length(true)
    }

    /// Number of bits on the DR path of the whole chain
    pub fn dr_length(&mut self) -> Result<usize, ChainError> {
        self.path_length(false)
    }

    /// Count the devices on the chain by putting all of them into BYPASS (oversized
    /// all-ones IR) and measuring the DR path: each bypassed device is one bit.
    pub fn num_devices(&mut self) -> Result<usize, ChainError> {
        let ones = BitBuffer::ones(self.flush_size());
        self.sm.scan_ir(&ones, false);
        self.dr_length()
    }

    /// Read the IDCODEs of all expected devices.  After a TAP reset every device
    /// selects its ID register, so the DR chain is the concatenation of the 32-bit
    /// codes in chain order.
    pub fn read_idcodes(&mut self) -> Result<Vec<u32>, ChainError> {
        self.sm.tap_reset();
        let n = self.expected.len();
        let echo = self
            .sm
            .scan_dr(&BitBuffer::zeros(32 * n), true)
            .expect("capture requested");
        Ok(echo
            .split(&vec![32; n])
            .iter()
            .map(|f| f.to_u64() as u32)
            .collect())
    }

    /// Enumerate and validate the chain: device count, total IR length and IDCODEs
    /// must all match the expected layout, and every device's IR capture value must
    /// end in the mandatory `01` bits.  On success the per-device padding records are
    /// built and padded IR/DR access becomes available.
    pub fn scan(&mut self) -> Result<(), ChainError> {
        self.devices.clear();
        self.sm.tap_reset();

        let found = self.num_devices()?;
        if found != self.expected.len() {
            return Err(ChainError::DeviceCount {
                expected: self.expected.len(),
                found,
            });
        }

        let ir_total: usize = self.expected.iter().map(|t| t.irlen).sum();
        let measured = self.ir_length()?;
        if measured != ir_total {
            return Err(ChainError::IrLength {
                expected: ir_total,
                found: measured,
            });
        }

        let idcodes = self.read_idcodes()?;
        for (index, (found, spec)) in idcodes.iter().zip(&self.expected).enumerate() {
            if *found != spec.idcode {
                return Err(ChainError::Idcode {
                    index,
                    expected: spec.idcode,
                    found: *found,
                });
            }
            log::debug!("device {}: {} idcode {:#010x}", index, spec.name, found);
        }

        // An all-ones shift selects BYPASS everywhere and captures each device's IR
        // status bits on the way; the TAP specification fixes the low two at 01.
        let captures = self
            .sm
            .scan_ir(&BitBuffer::ones(ir_total), true)
            .expect("capture requested");
        let widths: Vec<usize> = self.expected.iter().map(|t| t.irlen).collect();
        for (index, field) in captures.split(&widths).iter().enumerate() {
            let value = field.to_u64();
            if value & 0b11 != 0b01 {
                return Err(ChainError::IrCapture { index, value });
            }
        }

        let n = self.expected.len();
        for (index, spec) in self.expected.iter().enumerate() {
            self.devices.push(JtagDevice {
                index,
                irlen: spec.irlen,
                idcode: spec.idcode,
                name: spec.name,
                irlen_before: self.expected[..index].iter().map(|t| t.irlen).sum(),
                irlen_after: self.expected[index + 1..].iter().map(|t| t.irlen).sum(),
                devs_before: index,
                devs_after: n - 1 - index,
            });
        }

        log::info!("chain scan complete, {} devices", n);
        self.sm.tap_reset();
        Ok(())
    }

    fn ir_word(&self, index: usize, payload: &BitBuffer) -> Result<BitBuffer, ChainError> {
        let dev = self.device(index)?;
        if payload.len() != dev.irlen {
            return Err(ChainError::IrWidth {
                index,
                expected: dev.irlen,
                found: payload.len(),
            });
        }
        // All-ones pads select BYPASS on every other device
        let mut word = payload.clone();
        word.head(&BitBuffer::ones(dev.irlen_before));
        word.tail(&BitBuffer::ones(dev.irlen_after));
        Ok(word)
    }

    fn dr_word(&self, index: usize, payload: &BitBuffer) -> Result<BitBuffer, ChainError> {
        let dev = self.device(index)?;
        let mut word = payload.clone();
        word.head(&BitBuffer::ones(dev.devs_before));
        word.tail(&BitBuffer::ones(dev.devs_after));
        Ok(word)
    }

    /// Shift `payload` into the instruction register of device `index`
    pub fn wr_ir(&mut self, index: usize, payload: &BitBuffer) -> Result<(), ChainError> {
        let word = self.ir_word(index, payload)?;
        self.sm.scan_ir(&word, false);
        Ok(())
    }

    /// Shift `payload` into the instruction register of device `index` and return the
    /// bits its IR shifted out
    pub fn rw_ir(&mut self, index: usize, payload: &BitBuffer) -> Result<BitBuffer, ChainError> {
        let word = self.ir_word(index, payload)?;
        let dev = self.device(index)?;
        let (before, after) = (dev.irlen_before, dev.irlen_after);
        let mut echo = self.sm.scan_ir(&word, true).expect("capture requested");
        echo.drop_head(before);
        echo.drop_tail(after);
        Ok(echo)
    }

    /// Shift `payload` into the data register of device `index`
    pub fn wr_dr(&mut self, index: usize, payload: &BitBuffer) -> Result<(), ChainError> {
        let word = self.dr_word(index, payload)?;
        self.sm.scan_dr(&word, false);
        Ok(())
    }

    /// Shift `payload` into the data register of device `index` and return the bits
    /// its DR shifted out
    pub fn rw_dr(&mut self, index: usize, payload: &BitBuffer) -> Result<BitBuffer, ChainError> {
        let word = self.dr_word(index, payload)?;
        let dev = self.device(index)?;
        let (before, after) = (dev.devs_before, dev.devs_after);
        let mut echo = self.sm.scan_dr(&word, true).expect("capture requested");
        echo.drop_head(before);
        echo.drop_tail(after);
        Ok(echo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCable, MockDevice};

    fn three_device_chain() -> Chain<Box<MockCable>> {
        let cable = Box::new(MockCable::new(vec![
            MockDevice::generic(4, 0x4ba0_0477),
            MockDevice::generic(5, 0x1234_1043),
            MockDevice::generic(4, 0x0ba0_0477),
        ]));
        let sm = TapSm::new(cable);
        Chain::new(
            sm,
            &[
                TapSpec {
                    irlen: 4,
                    idcode: 0x4ba0_0477,
                    name: "dap",
                },
                TapSpec {
                    irlen: 5,
                    idcode: 0x1234_1043,
                    name: "fpga",
                },
                TapSpec {
                    irlen: 4,
                    idcode: 0x0ba0_0477,
                    name: "dap2",
                },
            ],
        )
    }

    #[test]
    fn scan_builds_padding_records() {
        let mut chain = three_device_chain();
        chain.scan().unwrap();

        let dev = chain.device(1).unwrap();
        assert_eq!(dev.irlen_before, 4);
        assert_eq!(dev.irlen_after, 4);
        assert_eq!(dev.irlen_before + dev.irlen + dev.irlen_after, 13);
        assert_eq!(dev.devs_before, 1);
        assert_eq!(dev.devs_after, 1);
    }

    #[test]
    fn enumeration_measures_the_chain() {
        let mut chain = three_device_chain();
        assert_eq!(chain.num_devices().unwrap(), 3);
        assert_eq!(chain.ir_length().unwrap(), 13);
        assert_eq!(
            chain.read_idcodes().unwrap(),
            vec![0x4ba0_0477, 0x1234_1043, 0x0ba0_0477]
        );
    }

    #[test]
    fn scan_rejects_wrong_idcode() {
        let cable = Box::new(MockCable::new(vec![MockDevice::generic(4, 0xdead_beef)]));
        let sm = TapSm::new(cable);
        let mut chain = Chain::new(
            sm,
            &[TapSpec {
                irlen: 4,
                idcode: 0x4ba0_0477,
                name: "dap",
            }],
        );
        match chain.scan() {
            Err(ChainError::Idcode { index: 0, .. }) => {}
            other => panic!("expected an IDCODE mismatch, got {:?}", other),
        }
    }

    #[test]
    fn scan_rejects_wrong_device_count() {
        let cable = Box::new(MockCable::new(vec![
            MockDevice::generic(4, 0x4ba0_0477),
            MockDevice::generic(4, 0x0ba0_0477),
        ]));
        let sm = TapSm::new(cable);
        let mut chain = Chain::new(
            sm,
            &[TapSpec {
                irlen: 4,
                idcode: 0x4ba0_0477,
                name: "dap",
            }],
        );
        match chain.scan() {
            Err(ChainError::DeviceCount {
                expected: 1,
                found: 2,
            }) => {}
            other => panic!("expected a device count mismatch, got {:?}", other),
        }
    }

    #[test]
    fn dr_access_strips_bypass_bits() {
        let mut chain = three_device_chain();
        chain.scan().unwrap();

        // Shift the middle device's own 32-bit ID register back out
        let idcode_ir = BitBuffer::from_val(0b00110, 5);
        chain.wr_ir(1, &idcode_ir).unwrap();
        let echo = chain.rw_dr(1, &BitBuffer::zeros(32)).unwrap();
        assert_eq!(echo.len(), 32);
        assert_eq!(echo.to_u64() as u32, 0x1234_1043);
    }

    #[test]
    fn unscanned_chain_refuses_access() {
        let mut chain = three_device_chain();
        match chain.wr_ir(0, &BitBuffer::ones(4)) {
            Err(ChainError::NotScanned) => {}
            other => panic!("expected NotScanned, got {:?}", other),
        }
    }
}
