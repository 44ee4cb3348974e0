//! Error-vector-magnitude collection
//!
//! Optional observer fed with the phase-corrected constellation of the first
//! data symbol after the pilots. Nothing on the demodulation path reads it.

use parking_lot::Mutex;

use crate::error::{DemulError, DemulResult};
use crate::types::IQSample;

#[derive(Debug, Default, Clone, Copy)]
struct EvmAccumulator {
    frame_id: Option<usize>,
    error_sq: f64,
    count: u64,
}

/// EVM per (frame slot, UE) against known transmitted symbols.
#[derive(Debug)]
pub struct PhyStats {
    ue_num: usize,
    depth: usize,
    ground_truth: Vec<IQSample>,
    evm: Vec<Mutex<EvmAccumulator>>,
}

impl PhyStats {
    /// `ground_truth` holds the transmitted symbol at `[sc * ue_num + ue]`.
    pub fn new(ue_num: usize, frame_window: usize, ground_truth: Vec<IQSample>) -> DemulResult<Self> {
        if frame_window == 0 {
            return Err(DemulError::InvalidConfig(
                "frame_window must be non-zero".to_string(),
            ));
        }
        if ue_num == 0 || ground_truth.len() % ue_num != 0 {
            return Err(DemulError::DimensionMismatch {
                what: "EVM ground truth",
                expected: ue_num,
                actual: ground_truth.len(),
            });
        }
        Ok(Self {
            ue_num,
            depth: frame_window,
            ground_truth,
            evm: (0..frame_window * ue_num)
                .map(|_| Mutex::new(EvmAccumulator::default()))
                .collect(),
        })
    }

    #[inline]
    pub fn ue_num(&self) -> usize {
        self.ue_num
    }

    /// Subcarriers covered by the ground-truth table.
    #[inline]
    pub fn subcarriers(&self) -> usize {
        self.ground_truth.len() / self.ue_num
    }

    #[inline]
    fn index(&self, frame_id: usize, ue: usize) -> usize {
        (frame_id % self.depth) * self.ue_num + ue
    }

    /// Accumulate the squared error of the `sc x ue` block starting at
    /// subcarrier `sc_base`.
    pub fn update_evm(&self, frame_id: usize, sc_base: usize, block: &[IQSample]) {
        let rows = block.len() / self.ue_num;
        for ue in 0..self.ue_num {
            let mut err = 0.0f64;
            for j in 0..rows {
                let truth = self.ground_truth[(sc_base + j) * self.ue_num + ue];
                err += (block[j * self.ue_num + ue] - truth).norm_sqr() as f64;
            }

            let mut acc = self.evm[self.index(frame_id, ue)].lock();
            if acc.frame_id != Some(frame_id) {
                *acc = EvmAccumulator {
                    frame_id: Some(frame_id),
                    ..Default::default()
                };
            }
            acc.error_sq += err;
            acc.count += rows as u64;
        }
    }

    /// RMS EVM of `ue` in `frame_id`, relative to unit symbol energy.
    pub fn evm(&self, frame_id: usize, ue: usize) -> Option<f64> {
        let acc = *self.evm[self.index(frame_id, ue)].lock();
        match acc.frame_id {
            Some(f) if f == frame_id && acc.count > 0 => Some((acc.error_sq / acc.count as f64).sqrt()),
            _ => None,
        }
    }

    pub fn evm_db(&self, frame_id: usize, ue: usize) -> Option<f64> {
        self.evm(frame_id, ue).map(|e| 20.0 * e.max(1e-12).log10())
    }

    /// Forget everything recorded for `frame_id`'s slot.
    pub fn reset_frame(&self, frame_id: usize) {
        for ue in 0..self.ue_num {
            *self.evm[self.index(frame_id, ue)].lock() = EvmAccumulator::default();
        }
    }
}
