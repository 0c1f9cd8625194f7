//! The transport seam.  Physical probe drivers (FT2232/MPSSE, J-Link, CMSIS-DAP, ...)
//! live outside this crate and plug in by implementing the `Cable` trait.  A `Cable`
//! knows nothing about TAP states or the ADI protocol; it only clocks TMS walks and
//! shifts bits while the TAP sits in a Shift state.
use crate::bits::BitBuffer;

pub trait Cable {
    /// Clock out a series of TMS values to change the state of the JTAG chain.  Each
    /// element of `tms` determines the value of the TMS line, zero for low and any
    /// other value for high.  `tdi` controls the state of the TDI line during the walk.
    fn change_mode(&mut self, tms: &[u8], tdi: bool);

    /// Shift in `bits` bits from the TDO line while clocking out all ones.  Must be
    /// called with the TAP in ShiftIR or ShiftDR.  If `pause_after` is false the TAP
    /// remains in the Shift state; if true, the final bit is clocked with TMS high and
    /// one trailing TMS-low cycle follows, leaving the TAP in PauseIR or PauseDR.
    fn read_data(&mut self, bits: usize, pause_after: bool) -> BitBuffer;

    /// Shift `data` out on the TDI line, ignoring TDO.  Same state rules as
    /// `read_data`.
    fn write_data(&mut self, data: &BitBuffer, pause_after: bool);

    /// Shift `data` out on the TDI line while capturing TDO.  The returned buffer has
    /// the same length as `data`.  Same state rules as `read_data`.
    fn read_write_data(&mut self, data: &BitBuffer, pause_after: bool) -> BitBuffer;
}
