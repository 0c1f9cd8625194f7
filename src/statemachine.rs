//! The 16-state JTAG TAP state machine.  `TapSm` owns a `Cable`, keeps track of the
//! current TAP state, and moves between states by the shortest TMS walk, which is
//! precomputed for every pair of states when the machine is built.  On top of the state
//! tracking it provides the three scan primitives the upper layers are written against:
//! `tap_reset`, `scan_ir` and `scan_dr`.
use core::ops::DerefMut;

use crate::bits::BitBuffer;
use crate::cable::Cable;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use JtagState::*;

/// Successor states from IEEE 1149.1, indexed by current state and then by TMS value.
pub const SUCCESSORS: [[JtagState; 2]; 16] = [
    [Idle, Reset],         // Reset
    [Idle, SelectDR],      // Idle
    [CaptureDR, SelectIR], // SelectDR
    [ShiftDR, Exit1DR],    // CaptureDR
    [ShiftDR, Exit1DR],    // ShiftDR
    [PauseDR, UpdateDR],   // Exit1DR
    [PauseDR, Exit2DR],    // PauseDR
    [ShiftDR, UpdateDR],   // Exit2DR
    [Idle, SelectDR],      // UpdateDR
    [CaptureIR, Reset],    // SelectIR
    [ShiftIR, Exit1IR],    // CaptureIR
    [ShiftIR, Exit1IR],    // ShiftIR
    [PauseIR, UpdateIR],   // Exit1IR
    [PauseIR, Exit2IR],    // PauseIR
    [ShiftIR, UpdateIR],   // Exit2IR
    [Idle, SelectIR],      // UpdateIR
];

/// Five clocks of TMS high reach Reset from any state, including an unknown one, which
/// no graph walk can do.  Used verbatim whenever the destination is Reset.
pub const RESET_TMS: [u8; 5] = [1, 1, 1, 1, 1];

/// Precomputed TMS walks for every ordered pair of TAP states.
pub struct TapPaths {
    paths: [[Vec<u8>; 16]; 16],
}

impl TapPaths {
    pub fn new() -> Self {
        let paths = core::array::from_fn(|src| {
            core::array::from_fn(|dst| {
                if dst == Reset as usize {
                    RESET_TMS.to_vec()
                } else if src == dst {
                    Vec::new()
                } else {
                    let mut visited = [false; 16];
                    visited[src] = true;
                    Self::search(src, dst, &mut visited)
                        .expect("TAP state graph is strongly connected")
                }
            })
        });
        Self { paths }
    }

    /// Shortest walk from `state` to `dst` that repeats no state, by depth-first
    /// enumeration of both TMS branches, keeping the shorter candidate.
    fn search(state: usize, dst: usize, visited: &mut [bool; 16]) -> Option<Vec<u8>> {
        let mut best: Option<Vec<u8>> = None;
        for tms in 0..2u8 {
            let next = SUCCESSORS[state][tms as usize] as usize;
            let candidate = if next == dst {
                Some(vec![tms])
            } else if visited[next] {
                None
            } else {
                visited[next] = true;
                let sub = Self::search(next, dst, visited);
                visited[next] = false;
                sub.map(|mut walk| {
                    walk.insert(0, tms);
                    walk
                })
            };
            if let Some(walk) = candidate {
                if best.as_ref().map(|b| walk.len() < b.len()).unwrap_or(true) {
                    best = Some(walk);
                }
            }
        }
        best
    }

    /// The cached TMS bit sequence leading from `src` to `dst`
    pub fn tms_sequence(&self, src: JtagState, dst: JtagState) -> &[u8] {
        &self.paths[src as usize][dst as usize]
    }
}

impl Default for TapPaths {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TapSm<T> {
    pub cable: T,
    state: JtagState,
    paths: TapPaths,
}

impl<T, U> TapSm<T>
where
    T: DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    /// Create a TAP state machine using an existing `Cable`.  The TAP is reset so its
    /// state is known.
    pub fn new(mut cable: T) -> Self {
        cable.change_mode(&RESET_TMS, true);
        Self {
            cable,
            state: Reset,
            paths: TapPaths::new(),
        }
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Reset the scan chain by driving TMS high for 5 clocks
    pub fn tap_reset(&mut self) {
        self.cable.change_mode(&RESET_TMS, true);
        self.state = Reset;
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn change_mode(&mut self, state: JtagState) {
        if self.state == state {
            return;
        }
        let path = self.paths.tms_sequence(self.state, state);
        self.cable.change_mode(path, true);
        self.state = state;
    }

    /// Shift `tdi` through the instruction register path.  Returns the captured TDO
    /// bits if `capture` is set.  The TAP passes through UpdateIR and is left in Idle.
    pub fn scan_ir(&mut self, tdi: &BitBuffer, capture: bool) -> Option<BitBuffer> {
        self.scan(ShiftIR, PauseIR, tdi, capture)
    }

    /// Shift `tdi` through the data register path.  Returns the captured TDO bits if
    /// `capture` is set.  The TAP passes through UpdateDR and is left in Idle.
    pub fn scan_dr(&mut self, tdi: &BitBuffer, capture: bool) -> Option<BitBuffer> {
        self.scan(ShiftDR, PauseDR, tdi, capture)
    }

    fn scan(
        &mut self,
        shift: JtagState,
        pause: JtagState,
        tdi: &BitBuffer,
        capture: bool,
    ) -> Option<BitBuffer> {
        self.change_mode(shift);
        let tdo = if capture {
            Some(self.cable.read_write_data(tdi, true))
        } else {
            self.cable.write_data(tdi, true);
            None
        };
        self.state = pause;
        // Complete the transaction: Pause -> Exit2 -> Update -> Idle
        self.change_mode(Idle);
        tdo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [JtagState; 16] = [
        Reset, Idle, SelectDR, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR, SelectIR,
        CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
    ];

    #[test]
    fn every_path_is_loop_free_and_arrives() {
        let paths = TapPaths::new();
        for src in ALL_STATES {
            for dst in ALL_STATES {
                let walk = paths.tms_sequence(src, dst);
                let mut state = src;
                let mut seen = [false; 16];
                seen[state as usize] = true;
                for &tms in walk {
                    state = SUCCESSORS[state as usize][tms as usize];
                    if dst != Reset {
                        assert!(
                            !seen[state as usize],
                            "walk {:?} -> {:?} revisits {:?}",
                            src, dst, state
                        );
                    }
                    seen[state as usize] = true;
                }
                assert_eq!(state as usize, dst as usize, "walk {:?} -> {:?}", src, dst);
            }
        }
    }

    #[test]
    fn reset_is_always_five_ones() {
        let paths = TapPaths::new();
        for src in ALL_STATES {
            assert_eq!(paths.tms_sequence(src, Reset), &RESET_TMS);
        }
    }

    #[test]
    fn idle_to_shiftdr() {
        let paths = TapPaths::new();
        assert_eq!(paths.tms_sequence(Idle, ShiftDR), &[1, 0, 0]);
    }

    #[test]
    fn idle_to_shiftir() {
        let paths = TapPaths::new();
        assert_eq!(paths.tms_sequence(Idle, ShiftIR), &[1, 1, 0, 0]);
    }

    #[test]
    fn same_state_is_empty() {
        let paths = TapPaths::new();
        assert!(paths.tms_sequence(Idle, Idle).is_empty());
        assert!(paths.tms_sequence(ShiftDR, ShiftDR).is_empty());
    }
}
