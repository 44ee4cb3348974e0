//! Residual phase tracking from UE-specific uplink pilots
//!
//! During the first `P` uplink symbols each UE transmits a known pilot on
//! every subcarrier. For pilot symbol `p` the tracker sums, over all
//! subcarriers, the unit direction of `equalized * conj(pilot)`; the angle of
//! that sum is the common phase error `theta[p]`.
//!
//! Data symbol `s >= P` is then derotated by
//!
//! ```text
//! theta(s) = theta[0] + s * inc,    inc = sum(theta[p] - theta[p-1]) / max(1, P - 1)
//! ```
//!
//! so a constant oscillator drift between the pilots and later symbols is
//! extrapolated linearly. With a single pilot `inc` is zero.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

use crate::demod::Modulation;
use crate::error::{DemulError, DemulResult};
use crate::frame_window::FrameWindow;
use crate::matrix::CMatView;
use crate::types::{IQSample, ZERO};

/// Unit-magnitude direction of `z`; zero stays zero.
#[inline]
pub fn complex_sign(z: IQSample) -> IQSample {
    let mag = z.norm();
    if mag > 0.0 {
        z / mag
    } else {
        ZERO
    }
}

/// Wrap an angle difference into `(-pi, pi]`.
#[inline]
fn wrap_angle(a: f32) -> f32 {
    let w = (a + PI).rem_euclid(2.0 * PI) - PI;
    if w <= -PI {
        w + 2.0 * PI
    } else {
        w
    }
}

/// Linear phase model for one UE within one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseEstimate {
    pub theta0: f32,
    pub increment: f32,
}

impl PhaseEstimate {
    /// Fit the model to per-pilot-symbol accumulator values.
    pub fn from_pilot_sums(sums: &[IQSample]) -> Self {
        let Some(first) = sums.first() else {
            return Self::default();
        };

        let theta0 = first.arg();
        let total: f32 = sums
            .windows(2)
            .map(|w| wrap_angle(w[1].arg() - w[0].arg()))
            .sum();
        let steps = sums.len().saturating_sub(1).max(1);

        Self {
            theta0,
            increment: total / steps as f32,
        }
    }

    #[inline]
    pub fn theta_at(&self, symbol_id: usize) -> f32 {
        self.theta0 + symbol_id as f32 * self.increment
    }

    /// Multiplier that removes the modelled phase at `symbol_id`.
    #[inline]
    pub fn correction(&self, symbol_id: usize) -> IQSample {
        IQSample::from_polar(1.0, -self.theta_at(symbol_id))
    }
}

/// Known per-(subcarrier, UE) pilot values, stored `[sc * ue + u]`.
#[derive(Debug, Clone)]
pub struct PilotSequence {
    ue_num: usize,
    values: Vec<IQSample>,
}

impl PilotSequence {
    /// Seeded pseudo-random QPSK pilots.
    pub fn generate(ofdm_data_num: usize, ue_num: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = (0..ofdm_data_num * ue_num)
            .map(|_| {
                let bits = [rng.gen_range(0..2u8), rng.gen_range(0..2u8)];
                Modulation::Qpsk.map_bits(&bits)
            })
            .collect();
        Self { ue_num, values }
    }

    /// Pilots supplied by the caller.
    pub fn from_values(ofdm_data_num: usize, ue_num: usize, values: Vec<IQSample>) -> DemulResult<Self> {
        if values.len() != ofdm_data_num * ue_num {
            return Err(DemulError::DimensionMismatch {
                what: "pilot table",
                expected: ofdm_data_num * ue_num,
                actual: values.len(),
            });
        }
        Ok(Self { ue_num, values })
    }

    #[inline]
    pub fn ue_num(&self) -> usize {
        self.ue_num
    }

    /// Number of subcarriers covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len() / self.ue_num.max(1)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pilot values of all UEs on subcarrier `sc`.
    #[inline]
    pub fn row(&self, sc: usize) -> &[IQSample] {
        &self.values[sc * self.ue_num..(sc + 1) * self.ue_num]
    }

    #[inline]
    pub fn get(&self, sc: usize, ue: usize) -> IQSample {
        self.values[sc * self.ue_num + ue]
    }
}

/// Per-worker phase tracking state.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    ue_num: usize,
    pilot_symbols: usize,
    partial: Vec<IQSample>,
    sums: Vec<IQSample>,
    rotations: Vec<IQSample>,
}

impl PhaseTracker {
    pub fn new(ue_num: usize, pilot_symbols: usize) -> Self {
        Self {
            ue_num,
            pilot_symbols,
            partial: vec![ZERO; ue_num],
            sums: vec![ZERO; pilot_symbols],
            rotations: vec![ZERO; ue_num],
        }
    }

    #[inline]
    pub fn pilot_symbols(&self) -> usize {
        self.pilot_symbols
    }

    #[inline]
    pub fn is_pilot(&self, symbol_id: usize) -> bool {
        symbol_id < self.pilot_symbols
    }

    /// Whether data symbol `symbol_id` gets derotated.
    #[inline]
    pub fn corrects(&self, symbol_id: usize) -> bool {
        self.pilot_symbols > 0 && symbol_id >= self.pilot_symbols
    }

    /// Sum this block's pilot directions per UE and add them to the frame's
    /// accumulators.
    ///
    /// `equalized` is the `sc x ue` block starting at subcarrier `sc_base`.
    pub fn accumulate(
        &mut self,
        window: &FrameWindow,
        frame_id: usize,
        symbol_id: usize,
        sc_base: usize,
        equalized: &CMatView<'_>,
        pilots: &PilotSequence,
    ) {
        debug_assert!(self.is_pilot(symbol_id));
        self.partial.fill(ZERO);
        for j in 0..equalized.rows() {
            let known = pilots.row(sc_base + j);
            for (u, acc) in self.partial.iter_mut().enumerate() {
                *acc += complex_sign(equalized.get(j, u) * known[u].conj());
            }
        }
        window.accumulate_pilots(frame_id, symbol_id, &self.partial);
    }

    /// Current phase model of UE `ue` in `frame_id`.
    pub fn estimate(&mut self, window: &FrameWindow, frame_id: usize, ue: usize) -> PhaseEstimate {
        window.pilot_sums(frame_id, ue, &mut self.sums);
        PhaseEstimate::from_pilot_sums(&self.sums)
    }

    /// Derotate the row-major `sc x ue` block of data symbol `symbol_id`.
    pub fn correct(&mut self, window: &FrameWindow, frame_id: usize, symbol_id: usize, block: &mut [IQSample]) {
        debug_assert!(self.corrects(symbol_id));
        for ue in 0..self.ue_num {
            let rot = self.estimate(window, frame_id, ue).correction(symbol_id);
            self.rotations[ue] = rot;
        }
        for row in block.chunks_exact_mut(self.ue_num) {
            for (v, rot) in row.iter_mut().zip(&self.rotations) {
                *v *= rot;
            }
        }
    }
}
