//! Reference TAP simulator used by the unit tests.
//!
//! A pure-software 16-state TAP with IR/DR shift registers, a wire
//! trace of every (TMS, TDI) clock and a scriptable TDO stream. It
//! implements `Transport`, so the real engine and device drivers run
//! against it unchanged.

use std::collections::{HashMap, VecDeque};

use crate::bits;
use crate::cable::Transport;
use crate::jtag::TapState;
use crate::Result;

fn next_tap_state(state: TapState, tms: bool) -> TapState {
    use TapState::*;
    match (state, tms) {
        (TestLogicReset, true) => TestLogicReset,
        (TestLogicReset, false) => RunTestIdle,
        (RunTestIdle, true) => SelectDrScan,
        (RunTestIdle, false) => RunTestIdle,
        (SelectDrScan, true) => SelectIrScan,
        (SelectDrScan, false) => CaptureDr,
        (CaptureDr, true) => Exit1Dr,
        (CaptureDr, false) => ShiftDr,
        (ShiftDr, true) => Exit1Dr,
        (ShiftDr, false) => ShiftDr,
        (Exit1Dr, true) => UpdateDr,
        (Exit1Dr, false) => PauseDr,
        (PauseDr, true) => Exit2Dr,
        (PauseDr, false) => PauseDr,
        (Exit2Dr, true) => UpdateDr,
        (Exit2Dr, false) => ShiftDr,
        (UpdateDr, true) => SelectDrScan,
        (UpdateDr, false) => RunTestIdle,
        (SelectIrScan, true) => TestLogicReset,
        (SelectIrScan, false) => CaptureIr,
        (CaptureIr, true) => Exit1Ir,
        (CaptureIr, false) => ShiftIr,
        (ShiftIr, true) => Exit1Ir,
        (ShiftIr, false) => ShiftIr,
        (Exit1Ir, true) => UpdateIr,
        (Exit1Ir, false) => PauseIr,
        (PauseIr, true) => Exit2Ir,
        (PauseIr, false) => PauseIr,
        (Exit2Ir, true) => UpdateIr,
        (Exit2Ir, false) => ShiftIr,
        (UpdateIr, true) => SelectDrScan,
        (UpdateIr, false) => RunTestIdle,
        (Unknown, _) => Unknown,
    }
}

pub struct TapSim {
    pub state: TapState,
    /// (TMS, TDI) for every clock seen on the wire.
    pub trace: Vec<(bool, bool)>,
    /// IR values latched at Update-IR, LSB-first.
    pub ir_updates: Vec<u64>,
    /// DR payloads latched at Update-DR, packed LSB-first.
    pub dr_updates: Vec<Vec<u8>>,
    /// Bit counts of the latched DR payloads.
    pub dr_lengths: Vec<usize>,
    /// Clocks spent idling in Run-Test/Idle.
    pub idle_clocks: u32,
    ir_shift: Vec<bool>,
    dr_shift: Vec<bool>,
    tdo_script: VecDeque<bool>,
    /// Per-instruction DR answers, loaded at Capture-DR. The last
    /// queued value is sticky.
    dr_responses: HashMap<u64, VecDeque<u32>>,
    /// Fixed bit pattern reloaded at every Capture-DR, regardless of
    /// the instruction.
    dr_pattern: Option<Vec<bool>>,
    current_ir: u64,
    dr_out: VecDeque<bool>,
    last_tms: bool,
    last_tdi: bool,
}

impl TapSim {
    pub fn new() -> Self {
        Self {
            state: TapState::TestLogicReset,
            trace: Vec::new(),
            ir_updates: Vec::new(),
            dr_updates: Vec::new(),
            dr_lengths: Vec::new(),
            idle_clocks: 0,
            ir_shift: Vec::new(),
            dr_shift: Vec::new(),
            tdo_script: VecDeque::new(),
            dr_responses: HashMap::new(),
            dr_pattern: None,
            current_ir: 0,
            dr_out: VecDeque::new(),
            last_tms: true,
            last_tdi: false,
        }
    }

    /// Queue 32-bit DR answers for an instruction; the final entry
    /// repeats for any further captures.
    pub fn set_dr_response(&mut self, ir: u64, values: &[u32]) {
        self.dr_responses.insert(ir, values.iter().copied().collect());
    }

    /// Present the same bit pattern at every Capture-DR. Takes
    /// precedence over per-instruction answers.
    pub fn set_dr_pattern(&mut self, pattern: Vec<bool>) {
        self.dr_pattern = Some(pattern);
    }

    /// Queue bytes to be presented on TDO (LSB-first per byte) while
    /// a shift state is active. An exhausted script reads as ones.
    pub fn script_tdo_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            for i in 0..8 {
                self.tdo_script.push_back(b & (1 << i) != 0);
            }
        }
    }

    /// Apply one TCK cycle; returns the TDO level sampled during it.
    /// The scripted TDO stream only advances when the host actually
    /// captures, so write-only shifts don't misalign later reads.
    fn clock(&mut self, tms: bool, tdi: bool, capture: bool) -> bool {
        self.trace.push((tms, tdi));

        let tdo = match self.state {
            TapState::ShiftDr if capture => match self.dr_out.pop_front() {
                Some(bit) => bit,
                None => self.tdo_script.pop_front().unwrap_or(true),
            },
            TapState::ShiftIr if capture => {
                self.tdo_script.pop_front().unwrap_or(true)
            }
            _ => true,
        };

        match self.state {
            TapState::ShiftDr => self.dr_shift.push(tdi),
            TapState::ShiftIr => self.ir_shift.push(tdi),
            _ => {}
        }

        if self.state == TapState::RunTestIdle && !tms {
            self.idle_clocks += 1;
        }

        let next = next_tap_state(self.state, tms);
        match next {
            TapState::CaptureDr => {
                self.dr_shift.clear();
                self.dr_out.clear();
                if let Some(pattern) = &self.dr_pattern {
                    self.dr_out.extend(pattern.iter().copied());
                } else if let Some(queue) = self.dr_responses.get_mut(&self.current_ir) {
                    let val = if queue.len() > 1 {
                        queue.pop_front().unwrap_or(0)
                    } else {
                        queue.front().copied().unwrap_or(0)
                    };
                    for i in 0..32 {
                        self.dr_out.push_back(val >> i & 1 == 1);
                    }
                }
            }
            TapState::CaptureIr => self.ir_shift.clear(),
            TapState::UpdateIr if self.state == TapState::Exit1Ir
                || self.state == TapState::Exit2Ir =>
            {
                let mut val = 0u64;
                for (i, &b) in self.ir_shift.iter().enumerate().take(64) {
                    if b {
                        val |= 1 << i;
                    }
                }
                self.ir_updates.push(val);
                self.current_ir = val;
            }
            TapState::UpdateDr if self.state == TapState::Exit1Dr
                || self.state == TapState::Exit2Dr =>
            {
                let nbits = self.dr_shift.len();
                let mut packed = vec![0u8; bits::bytes_for_bits(nbits)];
                for (i, &b) in self.dr_shift.iter().enumerate() {
                    bits::set_bit(&mut packed, i, b);
                }
                self.dr_updates.push(packed);
                self.dr_lengths.push(nbits);
            }
            _ => {}
        }
        self.state = next;

        tdo
    }
}

impl Transport for TapSim {
    fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        Ok(freq_hz)
    }

    fn write_tms(&mut self, tms: &[u8], nbits: usize, _flush: bool) -> Result<()> {
        for pos in 0..nbits {
            let bit = bits::get_bit(tms, pos);
            let tdi = self.last_tdi;
            self.clock(bit, tdi, false);
            self.last_tms = bit;
        }
        Ok(())
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        mut rx: Option<&mut [u8]>,
        nbits: usize,
        end: bool,
    ) -> Result<()> {
        let capture = rx.is_some();
        for pos in 0..nbits {
            let tdi = match tx {
                Some(data) => bits::get_bit(data, pos),
                None => true,
            };
            let tms = if end && pos == nbits - 1 { true } else { self.last_tms };
            let tdo = self.clock(tms, tdi, capture);
            self.last_tms = tms;
            self.last_tdi = tdi;
            if let Some(buf) = rx.as_deref_mut() {
                bits::set_bit(buf, pos, tdo);
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        for _ in 0..cycles {
            self.clock(tms, tdi, false);
        }
        self.last_tms = tms;
        self.last_tdi = tdi;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn buffer_capacity(&self) -> usize {
        4096 * 8
    }
}
