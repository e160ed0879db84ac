//! JTAG engine: TAP state tracking, IR/DR shifts and chain scan on
//! top of a cable transport.

use log::debug;

use crate::bits;
use crate::cable::Transport;
use crate::{ProgError, Result};

/// The 16 canonical TAP states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
    Unknown,
}

impl TapState {
    fn is_dr(self) -> bool {
        use TapState::*;
        matches!(self, CaptureDr | ShiftDr | Exit1Dr | PauseDr | Exit2Dr | UpdateDr)
    }

    fn is_ir(self) -> bool {
        use TapState::*;
        matches!(self, CaptureIr | ShiftIr | Exit1Ir | PauseIr | Exit2Ir | UpdateIr)
    }
}

// TMS bits are staged here before hitting the transport.
const TMS_BUFFER_SIZE: usize = 128;

pub struct Jtag<C: Transport> {
    cable: C,
    state: TapState,
    tms_buffer: [u8; TMS_BUFFER_SIZE],
    num_tms: usize,
}

impl<C: Transport> Jtag<C> {
    pub fn new(cable: C) -> Self {
        Self {
            cable,
            state: TapState::Unknown,
            tms_buffer: [0; TMS_BUFFER_SIZE],
            num_tms: 0,
        }
    }

    pub fn into_cable(self) -> C {
        self.cable
    }

    pub fn cable_mut(&mut self) -> &mut C {
        &mut self.cable
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        self.cable.set_clk_freq(freq_hz)
    }

    fn set_tms(&mut self, tms: bool) -> Result<()> {
        if self.num_tms == TMS_BUFFER_SIZE * 8 {
            self.flush_tms(false)?;
        }
        bits::set_bit(&mut self.tms_buffer, self.num_tms, tms);
        self.num_tms += 1;
        Ok(())
    }

    fn flush_tms(&mut self, flush_buffer: bool) -> Result<()> {
        if self.num_tms != 0 {
            let num = self.num_tms;
            self.num_tms = 0;
            self.cable.write_tms(&self.tms_buffer, num, flush_buffer)?;
        } else if flush_buffer {
            self.cable.write_tms(&[], 0, true)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_tms(true)
    }

    /// Five TMS=1 clocks land in Test-Logic-Reset from any state.
    pub fn go_test_logic_reset(&mut self) -> Result<()> {
        for _ in 0..5 {
            self.set_tms(true)?;
        }
        self.flush_tms(true)?;
        self.state = TapState::TestLogicReset;
        Ok(())
    }

    /// One step of the TMS walk from `from` towards `target`: the TMS
    /// bit to emit and the state it leads to.
    fn next_step(from: TapState, target: TapState) -> (bool, TapState) {
        use TapState::*;
        match from {
            TestLogicReset | Unknown => (false, RunTestIdle),
            RunTestIdle => (true, SelectDrScan),
            SelectDrScan => {
                if target.is_dr() {
                    (false, CaptureDr)
                } else {
                    (true, SelectIrScan)
                }
            }
            CaptureDr => {
                if target == ShiftDr {
                    (false, ShiftDr)
                } else {
                    (true, Exit1Dr)
                }
            }
            ShiftDr => (true, Exit1Dr),
            Exit1Dr => {
                if target == PauseDr {
                    (false, PauseDr)
                } else {
                    (true, UpdateDr)
                }
            }
            PauseDr => (true, Exit2Dr),
            Exit2Dr => {
                if target == ShiftDr {
                    (false, ShiftDr)
                } else {
                    (true, UpdateDr)
                }
            }
            UpdateDr => {
                if target == RunTestIdle {
                    (false, RunTestIdle)
                } else {
                    (true, SelectDrScan)
                }
            }
            SelectIrScan => {
                if target.is_ir() {
                    (false, CaptureIr)
                } else {
                    (true, TestLogicReset)
                }
            }
            CaptureIr => {
                if target == ShiftIr {
                    (false, ShiftIr)
                } else {
                    (true, Exit1Ir)
                }
            }
            ShiftIr => (true, Exit1Ir),
            Exit1Ir => {
                if target == PauseIr {
                    (false, PauseIr)
                } else {
                    (true, UpdateIr)
                }
            }
            PauseIr => (true, Exit2Ir),
            Exit2Ir => {
                if target == ShiftIr {
                    (false, ShiftIr)
                } else {
                    (true, UpdateIr)
                }
            }
            UpdateIr => {
                if target == RunTestIdle {
                    (false, RunTestIdle)
                } else {
                    (true, SelectDrScan)
                }
            }
        }
    }

    /// Walk the TAP to `target`, emitting the TMS bits of the fixed
    /// transition relation. Idempotent when already there.
    pub fn set_state(&mut self, target: TapState) -> Result<()> {
        if self.state == TapState::Unknown && target != TapState::TestLogicReset {
            self.go_test_logic_reset()?;
        }
        while self.state != target {
            if self.state == TapState::Unknown {
                self.go_test_logic_reset()?;
                continue;
            }
            let (tms, next) = Self::next_step(self.state, target);
            debug!("set_state {:?} -> {:?} (tms {})", self.state, next, tms as u8);
            self.set_tms(tms)?;
            self.state = next;
        }
        Ok(())
    }

    /// Raw shift inside a Shift state. With `last` the final bit rides
    /// the Exit1 transition and the recorded state moves there.
    pub fn read_write(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        nbits: usize,
        last: bool,
    ) -> Result<()> {
        self.flush_tms(false)?;
        self.cable.write_tdi(tx, rx, nbits, last)?;
        if last {
            self.state = match self.state {
                TapState::ShiftDr => TapState::Exit1Dr,
                TapState::ShiftIr => TapState::Exit1Ir,
                other => other,
            };
        }
        Ok(())
    }

    pub fn shift_ir(
        &mut self,
        tx: &[u8],
        rx: Option<&mut [u8]>,
        irlen: usize,
        end_state: TapState,
    ) -> Result<()> {
        self.set_state(TapState::ShiftIr)?;
        self.read_write(Some(tx), rx, irlen, true)?;
        self.set_state(end_state)
    }

    /// Single-byte IR convenience, ending in Run-Test/Idle.
    pub fn shift_ir_u8(&mut self, ir: u8, irlen: usize) -> Result<()> {
        self.shift_ir(&[ir], None, irlen, TapState::RunTestIdle)
    }

    pub fn shift_dr(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        drlen: usize,
        end_state: TapState,
    ) -> Result<()> {
        self.set_state(TapState::ShiftDr)?;
        self.read_write(tx, rx, drlen, true)?;
        self.set_state(end_state)
    }

    /// Idle clocks in the current state.
    pub fn toggle_clk(&mut self, cycles: u32) -> Result<()> {
        self.flush_tms(false)?;
        let tms = self.state == TapState::TestLogicReset;
        self.cable.toggle_clk(tms, false, cycles)?;
        Ok(())
    }

    /// Scan the chain after a TAP reset: each device presents either
    /// its 32-bit IDCODE (LSB = 1) or a single BYPASS zero, reported
    /// here as an all-zero entry. TDO-first order. Termination on 32
    /// consecutive ones or `max_dev` devices.
    pub fn detect_chain(&mut self, max_dev: usize) -> Result<Vec<u32>> {
        let mut devices = Vec::new();

        self.go_test_logic_reset()?;
        self.set_state(TapState::ShiftDr)?;

        for _ in 0..max_dev {
            let mut rx = [0u8; 4];
            self.read_write(None, Some(&mut rx), 32, false)?;
            let idcode = u32::from_le_bytes(rx);
            if idcode == 0xFFFF_FFFF {
                break;
            }
            if idcode & 1 == 0 {
                // No IDCODE register: device sits in BYPASS.
                devices.push(0);
            } else {
                devices.push(idcode);
            }
        }

        self.go_test_logic_reset()?;
        Ok(devices)
    }
}

// A malformed answer from the chain is reported through this helper so
// callers share one message shape.
pub fn check_single_device(devices: &[u32]) -> Result<u32> {
    match devices.len() {
        1 => Ok(devices[0]),
        n => Err(ProgError::UnsupportedChain(n).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TapSim;

    fn engine() -> Jtag<TapSim> {
        Jtag::new(TapSim::new())
    }

    const ALL_STATES: [TapState; 16] = [
        TapState::TestLogicReset,
        TapState::RunTestIdle,
        TapState::SelectDrScan,
        TapState::CaptureDr,
        TapState::ShiftDr,
        TapState::Exit1Dr,
        TapState::PauseDr,
        TapState::Exit2Dr,
        TapState::UpdateDr,
        TapState::SelectIrScan,
        TapState::CaptureIr,
        TapState::ShiftIr,
        TapState::Exit1Ir,
        TapState::PauseIr,
        TapState::Exit2Ir,
        TapState::UpdateIr,
    ];

    #[test]
    fn tlr_from_anywhere() {
        let mut jtag = engine();
        jtag.go_test_logic_reset().unwrap();
        assert_eq!(jtag.state(), TapState::TestLogicReset);
        assert_eq!(jtag.cable_mut().state, TapState::TestLogicReset);
        // Five TMS=1 clocks.
        assert_eq!(jtag.cable_mut().trace.len(), 5);
        assert!(jtag.cable_mut().trace.iter().all(|&(tms, _)| tms));
    }

    #[test]
    fn transitions_drive_simulator_to_target() {
        // The TMS walk must land the reference TAP in the target state
        // for every state pair.
        for &from in &ALL_STATES {
            for &to in &ALL_STATES {
                let mut jtag = engine();
                jtag.go_test_logic_reset().unwrap();
                jtag.set_state(from).unwrap();
                jtag.flush().unwrap();
                assert_eq!(jtag.cable_mut().state, from);

                let before = jtag.cable_mut().trace.len();
                jtag.set_state(to).unwrap();
                jtag.flush().unwrap();
                let clocks = jtag.cable_mut().trace.len() - before;

                assert_eq!(jtag.cable_mut().state, to, "{:?} -> {:?}", from, to);
                assert_eq!(jtag.state(), to);
                // Longest walk goes through the whole opposite column.
                assert!(clocks <= 7, "{:?} -> {:?} took {} clocks", from, to, clocks);
            }
        }
    }

    #[test]
    fn operational_transitions_within_five_clocks() {
        use TapState::*;
        let pairs = [
            (TestLogicReset, RunTestIdle),
            (TestLogicReset, ShiftDr),
            (TestLogicReset, ShiftIr),
            (RunTestIdle, ShiftDr),
            (RunTestIdle, ShiftIr),
            (Exit1Dr, RunTestIdle),
            (Exit1Ir, RunTestIdle),
            (UpdateDr, ShiftDr),
            (ShiftDr, RunTestIdle),
        ];
        for &(from, to) in &pairs {
            let mut jtag = engine();
            jtag.go_test_logic_reset().unwrap();
            jtag.set_state(from).unwrap();
            jtag.flush().unwrap();
            let before = jtag.cable_mut().trace.len();
            jtag.set_state(to).unwrap();
            jtag.flush().unwrap();
            let clocks = jtag.cable_mut().trace.len() - before;
            assert!(clocks <= 5, "{:?} -> {:?} took {} clocks", from, to, clocks);
            assert_eq!(jtag.cable_mut().state, to);
        }
    }

    #[test]
    fn set_state_is_idempotent() {
        let mut jtag = engine();
        jtag.go_test_logic_reset().unwrap();
        jtag.set_state(TapState::RunTestIdle).unwrap();
        jtag.flush().unwrap();
        let before = jtag.cable_mut().trace.len();
        jtag.set_state(TapState::RunTestIdle).unwrap();
        jtag.flush().unwrap();
        assert_eq!(jtag.cable_mut().trace.len(), before);
    }

    #[test]
    fn shift_ir_records_end_state() {
        let mut jtag = engine();
        jtag.go_test_logic_reset().unwrap();
        jtag.shift_ir(&[0x09], None, 6, TapState::RunTestIdle).unwrap();
        assert_eq!(jtag.state(), TapState::RunTestIdle);
        assert_eq!(jtag.cable_mut().state, TapState::RunTestIdle);
        // The instruction was latched at Update-IR.
        assert_eq!(jtag.cable_mut().ir_updates, vec![0x09]);

        jtag.shift_ir(&[0x05], None, 6, TapState::UpdateIr).unwrap();
        assert_eq!(jtag.state(), TapState::UpdateIr);
        assert_eq!(jtag.cable_mut().state, TapState::UpdateIr);
        assert_eq!(jtag.cable_mut().ir_updates, vec![0x09, 0x05]);
    }

    #[test]
    fn shift_dr_records_end_state() {
        let mut jtag = engine();
        jtag.go_test_logic_reset().unwrap();
        jtag.shift_dr(Some(&[0xA5, 0x0F]), None, 16, TapState::RunTestIdle)
            .unwrap();
        assert_eq!(jtag.state(), TapState::RunTestIdle);
        assert_eq!(jtag.cable_mut().state, TapState::RunTestIdle);
        let dr = jtag.cable_mut().dr_updates.pop().unwrap();
        assert_eq!(dr, vec![0xA5, 0x0F]);
    }

    #[test]
    fn tms_rises_on_final_tdi_bit() {
        let mut jtag = engine();
        jtag.go_test_logic_reset().unwrap();
        jtag.set_state(TapState::ShiftDr).unwrap();
        jtag.flush().unwrap();
        let before = jtag.cable_mut().trace.len();
        jtag.read_write(Some(&[0xFF]), None, 8, true).unwrap();
        jtag.flush().unwrap();
        let trace = &jtag.cable_mut().trace[before..];
        assert_eq!(trace.len(), 8);
        // TMS low for the first seven bits, high exactly on the last.
        for (i, &(tms, _)) in trace.iter().enumerate() {
            assert_eq!(tms, i == 7, "bit {}", i);
        }
    }

    #[test]
    fn chain_scan_two_devices() {
        let mut jtag = engine();
        // TDO bytes for an xc7a35 followed by a GW1N-9, then the
        // all-ones termination.
        jtag.cable_mut().script_tdo_bytes(&[
            0x93, 0xD0, 0x62, 0x03,
            0x1B, 0x58, 0x00, 0x11,
            0xFF, 0xFF, 0xFF, 0xFF,
        ]);
        let devices = jtag.detect_chain(5).unwrap();
        assert_eq!(devices, vec![0x0362D093, 0x1100581B]);
    }

    #[test]
    fn chain_scan_empty_and_bypass() {
        let mut jtag = engine();
        jtag.cable_mut().script_tdo_bytes(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(jtag.detect_chain(5).unwrap().is_empty());

        let mut jtag = engine();
        // LSB = 0: a device in BYPASS reports as zero.
        jtag.cable_mut().script_tdo_bytes(&[
            0x92, 0xD0, 0x62, 0x03,
            0xFF, 0xFF, 0xFF, 0xFF,
        ]);
        assert_eq!(jtag.detect_chain(5).unwrap(), vec![0]);
    }

    #[test]
    fn chain_scan_respects_max_dev() {
        let mut jtag = engine();
        let mut bytes = Vec::new();
        for _ in 0..8 {
            bytes.extend_from_slice(&[0x93, 0xD0, 0x62, 0x03]);
        }
        jtag.cable_mut().script_tdo_bytes(&bytes);
        let devices = jtag.detect_chain(5).unwrap();
        assert_eq!(devices.len(), 5);
    }

    #[test]
    fn single_device_check() {
        assert_eq!(check_single_device(&[42]).unwrap(), 42);
        assert!(check_single_device(&[]).is_err());
        assert!(check_single_device(&[1, 2]).is_err());
    }
}
