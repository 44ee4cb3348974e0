//! # Frame Window
//!
//! Fixed ring of `W` per-frame slots, addressed by `frame_id % W`. Every slot
//! is allocated when the window is built and lives for the whole process.
//!
//! Per slot:
//!
//! | Region            | Shape                                   | Writer         |
//! |-------------------|-----------------------------------------|----------------|
//! | ZF matrices       | `zf_count x (ue x ant)` row-major       | upstream solver |
//! | received samples  | per UL symbol, [`GatherGeometry`] layout | upstream FFT    |
//! | pilot accumulators| per UE, one sum per pilot symbol        | demul tasks     |
//! | LLR bytes         | per (UL symbol, UE), `sc x bits`        | demul tasks     |
//! | equalized export  | per UL symbol, `sc x ue` (optional)     | demul tasks     |
//!
//! Slot reuse is the scheduler's business: a slot is not handed to frame
//! `N + W` until every task of frame `N` has finished. The one exception is
//! the pilot accumulator, which carries the frame id it currently holds and
//! restarts from zero when a different frame contributes. Pilot tasks of one
//! frame may therefore run on any thread in any order.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::config::DemulConfig;
use crate::error::{DemulError, DemulResult};
use crate::gather::GatherGeometry;
use crate::types::{IQSample, Llr, ZERO};

#[derive(Debug)]
struct PilotAccumulator {
    frame_id: Option<usize>,
    sums: Vec<IQSample>,
}

impl PilotAccumulator {
    fn new(pilot_symbols: usize) -> Self {
        Self {
            frame_id: None,
            sums: vec![ZERO; pilot_symbols],
        }
    }

    fn adopt(&mut self, frame_id: usize) {
        if self.frame_id != Some(frame_id) {
            self.sums.fill(ZERO);
            self.frame_id = Some(frame_id);
        }
    }
}

#[derive(Debug)]
struct FrameSlot {
    zf: RwLock<Vec<IQSample>>,
    data: Vec<RwLock<Vec<IQSample>>>,
    pilots: Vec<Mutex<PilotAccumulator>>,
    llr: Vec<Mutex<Vec<Llr>>>,
    equalized: Vec<Mutex<Vec<IQSample>>>,
}

/// Ring of per-frame buffers shared by all demodulation workers.
#[derive(Debug)]
pub struct FrameWindow {
    depth: usize,
    ue_num: usize,
    ant_num: usize,
    ofdm_data_num: usize,
    ul_symbols: usize,
    pilot_symbols: usize,
    bits_per_symbol: usize,
    zf_count: usize,
    geometry: GatherGeometry,
    slots: Vec<FrameSlot>,
}

impl FrameWindow {
    /// Allocate every slot for `cfg`.
    ///
    /// Only the structural part of the configuration is checked here, so a
    /// window can be built for a configuration whose modulation order the
    /// workers later reject.
    pub fn new(cfg: &DemulConfig) -> DemulResult<Self> {
        cfg.validate_dimensions()?;

        let geometry = GatherGeometry::from_config(cfg);
        let zf_count = cfg.zf_matrix_count();
        let zf_len = zf_count * cfg.ue_num * cfg.bs_ant_num;
        let llr_len = cfg.llr_bytes_per_symbol();
        let export_len = if cfg.export_constellation {
            cfg.ofdm_data_num * cfg.ue_num
        } else {
            0
        };

        let slots = (0..cfg.frame_window)
            .map(|_| FrameSlot {
                zf: RwLock::new(vec![ZERO; zf_len]),
                data: (0..cfg.ul_data_symbols)
                    .map(|_| RwLock::new(vec![ZERO; geometry.buffer_len()]))
                    .collect(),
                pilots: (0..cfg.ue_num)
                    .map(|_| Mutex::new(PilotAccumulator::new(cfg.ul_pilot_symbols)))
                    .collect(),
                llr: (0..cfg.ul_data_symbols * cfg.ue_num)
                    .map(|_| Mutex::new(vec![0; llr_len]))
                    .collect(),
                equalized: (0..cfg.ul_data_symbols)
                    .map(|_| Mutex::new(vec![ZERO; export_len]))
                    .collect(),
            })
            .collect();

        tracing::info!(
            depth = cfg.frame_window,
            zf_count,
            ul_symbols = cfg.ul_data_symbols,
            export = cfg.export_constellation,
            "frame window allocated"
        );

        Ok(Self {
            depth: cfg.frame_window,
            ue_num: cfg.ue_num,
            ant_num: cfg.bs_ant_num,
            ofdm_data_num: cfg.ofdm_data_num,
            ul_symbols: cfg.ul_data_symbols,
            pilot_symbols: cfg.ul_pilot_symbols,
            bits_per_symbol: cfg.mod_order_bits,
            zf_count,
            geometry,
            slots,
        })
    }

    /// Number of slots `W`.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn slot_of(&self, frame_id: usize) -> usize {
        frame_id % self.depth
    }

    #[inline]
    pub fn geometry(&self) -> &GatherGeometry {
        &self.geometry
    }

    /// Samples in one channel-inversion matrix.
    #[inline]
    pub fn zf_matrix_len(&self) -> usize {
        self.ue_num * self.ant_num
    }

    #[inline]
    fn slot(&self, frame_id: usize) -> &FrameSlot {
        &self.slots[self.slot_of(frame_id)]
    }

    fn check_symbol(&self, symbol_id: usize) -> DemulResult<()> {
        if symbol_id >= self.ul_symbols {
            return Err(DemulError::TaskOutOfRange {
                field: "symbol_id",
                value: symbol_id,
                limit: self.ul_symbols,
            });
        }
        Ok(())
    }

    fn check_len(what: &'static str, expected: usize, actual: usize) -> DemulResult<()> {
        if expected != actual {
            return Err(DemulError::DimensionMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }

    // ── Upstream writers ──────────────────────────────────────────────

    /// Store all channel-inversion matrices of a frame.
    pub fn write_zf(&self, frame_id: usize, matrices: &[IQSample]) -> DemulResult<()> {
        let mut zf = self.slot(frame_id).zf.write();
        Self::check_len("ZF matrix table", zf.len(), matrices.len())?;
        zf.copy_from_slice(matrices);
        Ok(())
    }

    /// Store one `ue x ant` row-major channel-inversion matrix.
    pub fn write_zf_matrix(
        &self,
        frame_id: usize,
        index: usize,
        matrix: &[IQSample],
    ) -> DemulResult<()> {
        if index >= self.zf_count {
            return Err(DemulError::TaskOutOfRange {
                field: "zf matrix",
                value: index,
                limit: self.zf_count,
            });
        }
        let len = self.zf_matrix_len();
        Self::check_len("ZF matrix", len, matrix.len())?;
        let mut zf = self.slot(frame_id).zf.write();
        zf[index * len..(index + 1) * len].copy_from_slice(matrix);
        Ok(())
    }

    /// Store a symbol's received samples, already in the configured layout.
    pub fn write_data(&self, frame_id: usize, symbol_id: usize, samples: &[IQSample]) -> DemulResult<()> {
        self.check_symbol(symbol_id)?;
        let mut data = self.slot(frame_id).data[symbol_id].write();
        Self::check_len("received symbol", data.len(), samples.len())?;
        data.copy_from_slice(samples);
        Ok(())
    }

    /// Store one antenna's subcarriers, placing them per the configured layout.
    pub fn write_antenna(
        &self,
        frame_id: usize,
        symbol_id: usize,
        ant: usize,
        samples: &[IQSample],
    ) -> DemulResult<()> {
        self.check_symbol(symbol_id)?;
        if ant >= self.ant_num {
            return Err(DemulError::TaskOutOfRange {
                field: "antenna",
                value: ant,
                limit: self.ant_num,
            });
        }
        Self::check_len("antenna samples", self.ofdm_data_num, samples.len())?;

        let mut data = self.slot(frame_id).data[symbol_id].write();
        for (sc, &s) in samples.iter().enumerate() {
            data[self.geometry.offset(ant, sc)] = s;
        }
        Ok(())
    }

    // ── Task-path readers ─────────────────────────────────────────────

    /// Channel-inversion matrices of the frame's slot.
    pub fn zf(&self, frame_id: usize) -> RwLockReadGuard<'_, Vec<IQSample>> {
        self.slot(frame_id).zf.read()
    }

    /// Received samples of one symbol.
    ///
    /// # Panics
    ///
    /// Panics if `symbol_id` is not an uplink symbol of the frame.
    pub fn data(&self, frame_id: usize, symbol_id: usize) -> RwLockReadGuard<'_, Vec<IQSample>> {
        self.slot(frame_id).data[symbol_id].read()
    }

    // ── Pilot accumulators ────────────────────────────────────────────

    /// Add one task's per-UE pilot contributions for pilot symbol `pilot_idx`.
    ///
    /// The first contribution of a frame to a slot still holding an older
    /// frame clears the old sums, whichever pilot symbol it belongs to.
    pub fn accumulate_pilots(&self, frame_id: usize, pilot_idx: usize, contributions: &[IQSample]) {
        debug_assert!(pilot_idx < self.pilot_symbols);
        debug_assert_eq!(contributions.len(), self.ue_num);

        let slot = self.slot(frame_id);
        for (acc, &c) in slot.pilots.iter().zip(contributions) {
            let mut acc = acc.lock();
            acc.adopt(frame_id);
            acc.sums[pilot_idx] += c;
        }
    }

    /// Copy UE `ue`'s pilot sums for `frame_id` into `out`.
    ///
    /// Returns zeros if the slot holds no contribution from this frame.
    pub fn pilot_sums(&self, frame_id: usize, ue: usize, out: &mut [IQSample]) {
        let acc = self.slot(frame_id).pilots[ue].lock();
        if acc.frame_id == Some(frame_id) {
            out.copy_from_slice(&acc.sums);
        } else {
            out.fill(ZERO);
        }
    }

    /// Pilot symbols per frame.
    #[inline]
    pub fn pilot_symbols(&self) -> usize {
        self.pilot_symbols
    }

    // ── Outputs ───────────────────────────────────────────────────────

    /// Store one UE's LLRs for the block starting at `sc_base`.
    pub fn write_llr(&self, frame_id: usize, symbol_id: usize, ue: usize, sc_base: usize, llrs: &[Llr]) {
        let start = sc_base * self.bits_per_symbol;
        let mut out = self.slot(frame_id).llr[symbol_id * self.ue_num + ue].lock();
        out[start..start + llrs.len()].copy_from_slice(llrs);
    }

    /// LLR bytes of one UE for a whole symbol.
    pub fn llr(&self, frame_id: usize, symbol_id: usize, ue: usize) -> MutexGuard<'_, Vec<Llr>> {
        self.slot(frame_id).llr[symbol_id * self.ue_num + ue].lock()
    }

    /// Store the equalized `sc x ue` block starting at `sc_base`.
    pub fn write_equalized(&self, frame_id: usize, symbol_id: usize, sc_base: usize, block: &[IQSample]) {
        let mut out = self.slot(frame_id).equalized[symbol_id].lock();
        if out.is_empty() {
            return;
        }
        let start = sc_base * self.ue_num;
        out[start..start + block.len()].copy_from_slice(block);
    }

    /// Exported equalized constellation of a symbol, `[sc * ue + u]`.
    ///
    /// `None` unless the window was built with constellation export enabled.
    pub fn equalized(&self, frame_id: usize, symbol_id: usize) -> Option<MutexGuard<'_, Vec<IQSample>>> {
        let guard = self.slot(frame_id).equalized[symbol_id].lock();
        if guard.is_empty() {
            None
        } else {
            Some(guard)
        }
    }
}
