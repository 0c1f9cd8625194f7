//! This crate drives ARM ADIv5 debug targets over a JTAG scan chain, at a variety of
//! levels of abstraction.  At the lowest level, the `Cable` trait is the seam where a
//! physical probe driver plugs in: it clocks TMS walks and shifts bits, and nothing
//! more.  A `TapSm` on top of a cable tracks the 16-state TAP state machine and moves
//! between states by the shortest precomputed TMS walk.
//!
//! If there are multiple TAPs on the chain, `Chain` lets you talk to one of them as if
//! it were alone: it enumerates the chain, validates it against the layout you expect,
//! and pads every IR/DR shift so the other devices stay in BYPASS.
//!
//! `JtagDp` turns one chain device into an ADIv5 Debug Port: it speaks the 35-bit
//! DPACC/APACC shift protocol, runs the power-up handshake and tracks sticky errors.
//! `MemAp` gives addressed memory access through a MEM-AP behind any `DapAccess`
//! implementation, and `romtable::discover` walks the CoreSight ROM tables to report
//! what debug components the target carries.
//!
//! # Example
//! ```no_run
//! use arm_adi::chain::{Chain, TapSpec};
//! use arm_adi::dp::{DpConfig, JtagDp};
//! use arm_adi::ap::MemAp;
//! use arm_adi::peripherals::PeripheralDb;
//! use arm_adi::romtable;
//!
//! # fn open_cable() -> Box<dyn arm_adi::cable::Cable> { unimplemented!() }
//! let cable: Box<dyn arm_adi::cable::Cable> = open_cable();
//! let sm = arm_adi::statemachine::TapSm::new(cable);
//!
//! let expected = [TapSpec { irlen: 4, idcode: 0x4ba0_0477, name: "dap" }];
//! let mut chain = Chain::new(sm, &expected);
//! chain.scan().unwrap();
//!
//! let dp = JtagDp::new(chain, 0, DpConfig::default()).unwrap();
//! let mut ap = MemAp::new(dp, 0).unwrap();
//! let db = PeripheralDb::builtin();
//! if let Some(tree) = romtable::discover(&mut ap, &db).unwrap() {
//!     println!("found {} debug components", tree.count());
//! }
//! ```

pub mod ap;
pub mod bits;
pub mod cable;
pub mod chain;
pub mod dp;
pub mod error;
pub mod mock;
pub mod peripherals;
pub mod romtable;
pub mod statemachine;

pub use error::Error;
