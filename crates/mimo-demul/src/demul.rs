//! # Demodulation Task
//!
//! [`DoDemul`] is one worker's handle on the uplink demodulation stage. Each
//! call to [`DoDemul::launch`] processes one subcarrier block of one symbol:
//!
//! ```text
//!  for each 8-subcarrier group in the block:
//!      gather   antenna samples  -> [sc][ant] tile
//!      equalize W(sc) * x(sc)    -> [sc][ue] block
//!  pilot symbol:  accumulate pilot phase per UE
//!  data symbol:   derotate by the extrapolated pilot phase
//!  for each UE:
//!      transpose [sc][ue] -> [sc] and soft-demodulate into the frame's LLRs
//! ```
//!
//! All scratch memory is allocated in [`DoDemul::new`]; `launch` does not
//! allocate.

use std::sync::Arc;
use std::time::Instant;

use crate::config::DemulConfig;
use crate::demod::SoftDemodulator;
use crate::equalize::{select_kernel, MatVecKernel};
use crate::error::{DemulError, DemulResult};
use crate::frame_window::FrameWindow;
use crate::gather::{select_gatherer, transpose_ue, GatherGeometry, Gatherer};
use crate::matrix::CMatView;
use crate::phase::{PhaseTracker, PilotSequence};
use crate::phy_stats::PhyStats;
use crate::rt::AlignedBuffer;
use crate::stats::{DurationStat, Stage, StageTimer, StatsSink};
use crate::tag::{EventData, EventType, TaskTag};
use crate::types::{IQSample, Llr, SCS_PER_CACHELINE};

/// Per-worker uplink demodulation stage.
#[derive(Debug)]
pub struct DoDemul {
    cfg: Arc<DemulConfig>,
    tid: usize,
    window: Arc<FrameWindow>,
    pilots: Arc<PilotSequence>,
    phy_stats: Option<Arc<PhyStats>>,
    stats: Arc<DurationStat>,
    geometry: GatherGeometry,
    gatherer: Box<dyn Gatherer>,
    kernel: Box<dyn MatVecKernel>,
    tracker: PhaseTracker,
    demod: SoftDemodulator,
    gather_buf: AlignedBuffer<IQSample>,
    equalized: AlignedBuffer<IQSample>,
    ue_buf: AlignedBuffer<IQSample>,
    llr_buf: AlignedBuffer<Llr>,
}

impl DoDemul {
    /// Build worker `tid`'s stage.
    ///
    /// Fails on any configuration the task path cannot honour (including an
    /// unsupported modulation order), on a frame window or pilot table built
    /// for different dimensions, and on scratch allocation failure.
    pub fn new(
        cfg: Arc<DemulConfig>,
        tid: usize,
        window: Arc<FrameWindow>,
        pilots: Arc<PilotSequence>,
        stats: &StatsSink,
    ) -> DemulResult<Self> {
        cfg.validate()?;
        let worker_stats = stats.worker(tid).ok_or_else(|| {
            DemulError::InvalidConfig(format!(
                "worker {} has no counters in a sink of {}",
                tid,
                stats.num_workers()
            ))
        })?;

        let geometry = GatherGeometry::from_config(&cfg);
        if *window.geometry() != geometry {
            return Err(DemulError::DimensionMismatch {
                what: "frame window sample buffer",
                expected: geometry.buffer_len(),
                actual: window.geometry().buffer_len(),
            });
        }
        if window.zf_matrix_len() != cfg.ue_num * cfg.bs_ant_num {
            return Err(DemulError::DimensionMismatch {
                what: "frame window ZF matrix",
                expected: cfg.ue_num * cfg.bs_ant_num,
                actual: window.zf_matrix_len(),
            });
        }
        if pilots.ue_num() != cfg.ue_num || pilots.len() < cfg.ofdm_data_num {
            return Err(DemulError::DimensionMismatch {
                what: "pilot table",
                expected: cfg.ofdm_data_num * cfg.ue_num,
                actual: pilots.len() * pilots.ue_num(),
            });
        }

        let demod = SoftDemodulator::from_config(&cfg)?;
        let kernel = select_kernel(cfg.kernel, cfg.ue_num, cfg.bs_ant_num)?;
        let gatherer = select_gatherer(cfg.bs_ant_num, cfg.simd_gather);

        let block = cfg.demul_block_size;
        let gather_buf = AlignedBuffer::try_new("gather tile", SCS_PER_CACHELINE * cfg.bs_ant_num)?;
        let equalized = AlignedBuffer::try_new("equalized block", block * cfg.ue_num)?;
        let ue_buf = AlignedBuffer::try_new("per-UE block", block)?;
        let llr_buf = AlignedBuffer::try_new("LLR block", block * cfg.mod_order_bits)?;

        tracing::info!(
            tid,
            kernel = kernel.name(),
            gather = gatherer.name(),
            modulation = %demod.modulation(),
            scratch_locked = gather_buf.is_locked(),
            "demul worker ready"
        );

        Ok(Self {
            tracker: PhaseTracker::new(cfg.ue_num, cfg.ul_pilot_symbols),
            stats: worker_stats,
            cfg,
            tid,
            window,
            pilots,
            phy_stats: None,
            geometry,
            gatherer,
            kernel,
            demod,
            gather_buf,
            equalized,
            ue_buf,
            llr_buf,
        })
    }

    /// Feed corrected constellations of the first post-pilot symbol to `stats`.
    ///
    /// The ground truth must cover every subcarrier of every UE.
    pub fn with_phy_stats(mut self, stats: Arc<PhyStats>) -> DemulResult<Self> {
        if stats.ue_num() != self.cfg.ue_num || stats.subcarriers() != self.cfg.ofdm_data_num {
            return Err(DemulError::DimensionMismatch {
                what: "EVM ground truth",
                expected: self.cfg.ofdm_data_num * self.cfg.ue_num,
                actual: stats.subcarriers() * stats.ue_num(),
            });
        }
        self.phy_stats = Some(stats);
        Ok(self)
    }

    /// Replace the automatically selected matrix-vector kernel.
    pub fn with_kernel(mut self, kernel: Box<dyn MatVecKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    #[inline]
    pub fn tid(&self) -> usize {
        self.tid
    }

    #[inline]
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    #[inline]
    pub fn gatherer_name(&self) -> &'static str {
        self.gatherer.name()
    }

    fn check_tag(&self, tag: TaskTag) -> DemulResult<()> {
        let symbol_id = tag.symbol_id();
        if symbol_id >= self.cfg.ul_data_symbols {
            return Err(DemulError::TaskOutOfRange {
                field: "symbol_id",
                value: symbol_id,
                limit: self.cfg.ul_data_symbols,
            });
        }
        let base_sc = tag.sc_id();
        if base_sc >= self.cfg.ofdm_data_num {
            return Err(DemulError::TaskOutOfRange {
                field: "sc_id",
                value: base_sc,
                limit: self.cfg.ofdm_data_num,
            });
        }
        if base_sc % self.cfg.demul_block_size != 0 {
            return Err(DemulError::MisalignedBlock {
                what: "task base subcarrier",
                size: base_sc,
                width: self.cfg.demul_block_size,
            });
        }
        Ok(())
    }

    /// Equalize, phase-correct and demodulate the block addressed by `tag`.
    ///
    /// `tag` carries frame id, uplink symbol index and base subcarrier.
    /// Returns the completion event for the scheduler.
    pub fn launch(&mut self, tag: TaskTag) -> DemulResult<EventData> {
        self.check_tag(tag)?;
        let _total = StageTimer::new(&self.stats, Stage::Total);

        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let base_sc = tag.sc_id();
        let max_sc = (base_sc + self.cfg.demul_block_size).min(self.cfg.ofdm_data_num);
        let n_sc = max_sc - base_sc;
        let ue_num = self.cfg.ue_num;
        let ant_num = self.cfg.bs_ant_num;
        let zf_len = ue_num * ant_num;

        let mut gather_ns = 0u64;
        let mut equalize_ns = 0u64;
        {
            let data = self.window.data(frame_id, symbol_id);
            let zf = self.window.zf(frame_id);
            let equalized = self.equalized.as_mut_slice();

            for group in (base_sc..max_sc).step_by(SCS_PER_CACHELINE) {
                let t0 = Instant::now();
                self.gatherer
                    .gather(&self.geometry, &data, group, self.gather_buf.as_mut_slice());
                let t1 = Instant::now();
                gather_ns += (t1 - t0).as_nanos() as u64;

                let tile = self.gather_buf.as_slice();
                for j in 0..SCS_PER_CACHELINE {
                    let sc = group + j;
                    let m = self.cfg.zf_index(sc) * zf_len;
                    let w = CMatView::row_major(&zf[m..m + zf_len], ue_num, ant_num)?;
                    let row = sc - base_sc;
                    self.kernel.gemv(
                        &w,
                        &tile[j * ant_num..(j + 1) * ant_num],
                        &mut equalized[row * ue_num..(row + 1) * ue_num],
                    );
                }
                equalize_ns += t1.elapsed().as_nanos() as u64;
            }
        }

        let t_phase = Instant::now();
        let block = &mut self.equalized.as_mut_slice()[..n_sc * ue_num];
        if self.tracker.is_pilot(symbol_id) {
            let view = CMatView::row_major(block, n_sc, ue_num)?;
            self.tracker
                .accumulate(&self.window, frame_id, symbol_id, base_sc, &view, &self.pilots);
        } else if self.tracker.corrects(symbol_id) {
            self.tracker.correct(&self.window, frame_id, symbol_id, block);
            if symbol_id == self.tracker.pilot_symbols() {
                if let Some(phy) = &self.phy_stats {
                    phy.update_evm(frame_id, base_sc, block);
                }
            }
        }
        if self.cfg.export_constellation {
            self.window.write_equalized(frame_id, symbol_id, base_sc, block);
        }
        equalize_ns += t_phase.elapsed().as_nanos() as u64;

        {
            let _demod = StageTimer::new(&self.stats, Stage::Demod);
            let bits = self.demod.modulation().bits_per_symbol();
            let view = CMatView::row_major(&self.equalized.as_slice()[..n_sc * ue_num], n_sc, ue_num)?;
            for ue in 0..ue_num {
                let ue_vec = &mut self.ue_buf.as_mut_slice()[..n_sc];
                transpose_ue(&view, ue, ue_vec);
                let llrs = &mut self.llr_buf.as_mut_slice()[..n_sc * bits];
                self.demod.demodulate(ue_vec, llrs);
                self.window.write_llr(frame_id, symbol_id, ue, base_sc, llrs);
            }
        }

        self.stats.record(Stage::Gather, gather_ns);
        self.stats.record(Stage::Equalize, equalize_ns);
        self.stats.record_task();

        tracing::debug!(
            tid = self.tid,
            frame_id,
            symbol_id,
            base_sc,
            "demul task complete"
        );

        Ok(EventData::new(EventType::Demul, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SampleLayout;
    use crate::demod::hard_decision;
    use crate::equalize::DirectKernel;
    use crate::synth::UplinkScenario;

    fn scenario_config(mod_order_bits: usize, pilots: usize) -> DemulConfig {
        DemulConfig {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_data_num: 16,
            demul_block_size: 8,
            transpose_block_size: 8,
            ul_pilot_symbols: pilots,
            ul_data_symbols: pilots + 3,
            mod_order_bits,
            frame_window: 4,
            ..Default::default()
        }
    }

    struct Harness {
        cfg: Arc<DemulConfig>,
        window: Arc<FrameWindow>,
        sink: StatsSink,
        demul: DoDemul,
    }

    fn harness(cfg: DemulConfig, scenario: &UplinkScenario, frame_id: usize) -> Harness {
        let cfg = Arc::new(cfg);
        let window = Arc::new(FrameWindow::new(&cfg).unwrap());
        scenario.load(&window, frame_id).unwrap();
        let sink = StatsSink::new(1);
        let demul = DoDemul::new(
            Arc::clone(&cfg),
            0,
            Arc::clone(&window),
            scenario.pilots(),
            &sink,
        )
        .unwrap();
        Harness {
            cfg,
            window,
            sink,
            demul,
        }
    }

    /// Run every block of every symbol of `frame_id` in order.
    fn run_frame(h: &mut Harness, frame_id: usize) {
        for symbol in 0..h.cfg.ul_data_symbols {
            for base_sc in (0..h.cfg.ofdm_data_num).step_by(h.cfg.demul_block_size) {
                let tag = TaskTag::frm_sym_sc(frame_id, symbol, base_sc);
                let event = h.demul.launch(tag).unwrap();
                assert_eq!(event, EventData::new(EventType::Demul, tag));
            }
        }
    }

    fn assert_bits_recovered(h: &Harness, scenario: &UplinkScenario, frame_id: usize) {
        for symbol in h.cfg.ul_pilot_symbols..h.cfg.ul_data_symbols {
            for ue in 0..h.cfg.ue_num {
                let llr = h.window.llr(frame_id, symbol, ue);
                assert_eq!(
                    hard_decision(&llr),
                    scenario.tx_bits(symbol, ue),
                    "symbol {} ue {}",
                    symbol,
                    ue
                );
            }
        }
    }

    #[test]
    fn test_qpsk_pattern_without_pilots() {
        let cfg = scenario_config(2, 0);
        let pattern = [1, 0, 1, 1];
        let scenario = UplinkScenario::with_pattern(&cfg, &pattern).unwrap();
        let mut h = harness(cfg, &scenario, 3);
        run_frame(&mut h, 3);

        for ue in 0..2 {
            let llr = h.window.llr(3, 0, ue);
            assert_eq!(llr.len(), 32);
            let expected: Vec<u8> = pattern.iter().copied().cycle().take(32).collect();
            assert_eq!(hard_decision(&llr), expected);
            assert!(llr.iter().all(|&l| l != 0));
        }
    }

    #[test]
    fn test_all_modulations_round_trip() {
        for bits in [2, 4, 6] {
            for layout in [SampleLayout::Contiguous, SampleLayout::PartialTranspose] {
                let cfg = DemulConfig {
                    sample_layout: layout,
                    ..scenario_config(bits, 0)
                };
                let scenario = UplinkScenario::random(&cfg, bits as u64).unwrap();
                let mut h = harness(cfg, &scenario, 1);
                run_frame(&mut h, 1);
                assert_bits_recovered(&h, &scenario, 1);
            }
        }
    }

    #[test]
    fn test_wide_array_and_direct_kernel_agree() {
        let cfg = DemulConfig {
            bs_ant_num: 12,
            ue_num: 4,
            ofdm_data_num: 48,
            demul_block_size: 16,
            transpose_block_size: 16,
            ..scenario_config(6, 0)
        };
        let scenario = UplinkScenario::random(&cfg, 77).unwrap();

        let mut fast = harness(cfg.clone(), &scenario, 0);
        run_frame(&mut fast, 0);
        assert_bits_recovered(&fast, &scenario, 0);

        let mut slow = harness(cfg, &scenario, 0);
        slow.demul = DoDemul::new(
            Arc::clone(&slow.cfg),
            0,
            Arc::clone(&slow.window),
            scenario.pilots(),
            &slow.sink,
        )
        .unwrap()
        .with_kernel(Box::new(DirectKernel));
        assert_eq!(slow.demul.kernel_name(), "direct");
        run_frame(&mut slow, 0);

        for symbol in 0..3 {
            for ue in 0..4 {
                assert_eq!(*fast.window.llr(0, symbol, ue), *slow.window.llr(0, symbol, ue));
            }
        }
    }

    #[test]
    fn test_phase_drift_is_removed() {
        let cfg = scenario_config(4, 2);
        let scenario = UplinkScenario::random(&cfg, 5)
            .unwrap()
            .with_phase_drift(vec![0.05, -0.08])
            .unwrap();
        let mut h = harness(cfg, &scenario, 2);
        run_frame(&mut h, 2);
        assert_bits_recovered(&h, &scenario, 2);
    }

    #[test]
    fn test_uncorrected_drift_breaks_decoding() {
        // No pilots, so nothing removes the drift: by symbol 2 the rotation is
        // 0.4 rad, enough to push outer 16-QAM points across a boundary
        let cfg = scenario_config(4, 0);
        let scenario = UplinkScenario::random(&cfg, 5)
            .unwrap()
            .with_phase_drift(vec![0.2, 0.2])
            .unwrap();
        let mut h = harness(cfg, &scenario, 0);
        run_frame(&mut h, 0);
        let llr = h.window.llr(0, 2, 0);
        assert_ne!(hard_decision(&llr), scenario.tx_bits(2, 0));
    }

    #[test]
    fn test_single_pilot_without_drift() {
        let cfg = scenario_config(6, 1);
        let scenario = UplinkScenario::random(&cfg, 9).unwrap();
        let mut h = harness(cfg, &scenario, 0);
        run_frame(&mut h, 0);
        assert_bits_recovered(&h, &scenario, 0);
    }

    #[test]
    fn test_pilots_reset_when_slot_is_reused() {
        let cfg = scenario_config(4, 2);
        let first = UplinkScenario::random(&cfg, 1)
            .unwrap()
            .with_phase_drift(vec![0.6, -0.6])
            .unwrap();
        let mut h = harness(cfg.clone(), &first, 1);
        run_frame(&mut h, 1);

        // Frame 5 shares frame 1's slot and has no drift
        let second = UplinkScenario::random(&cfg, 1).unwrap();
        second.load(&h.window, 5).unwrap();
        run_frame(&mut h, 5);
        assert_bits_recovered(&h, &second, 5);
    }

    #[test]
    fn test_export_matches_transmitted_constellation() {
        let cfg = DemulConfig {
            export_constellation: true,
            ..scenario_config(4, 0)
        };
        let scenario = UplinkScenario::random(&cfg, 21).unwrap();
        let mut h = harness(cfg, &scenario, 0);
        run_frame(&mut h, 0);

        let exported = h.window.equalized(0, 1).unwrap();
        assert_eq!(exported.as_slice(), scenario.tx_symbols(1));
    }

    #[test]
    fn test_evm_recorded_after_pilots() {
        let cfg = scenario_config(4, 2);
        let scenario = UplinkScenario::random(&cfg, 8)
            .unwrap()
            .with_phase_drift(vec![0.03, 0.01])
            .unwrap();
        let phy = Arc::new(PhyStats::new(2, cfg.frame_window, scenario.evm_reference()).unwrap());
        let mut h = harness(cfg, &scenario, 0);
        h.demul = DoDemul::new(
            Arc::clone(&h.cfg),
            0,
            Arc::clone(&h.window),
            scenario.pilots(),
            &h.sink,
        )
        .unwrap()
        .with_phy_stats(Arc::clone(&phy))
        .unwrap();
        run_frame(&mut h, 0);

        for ue in 0..2 {
            let evm = phy.evm(0, ue).unwrap();
            assert!(evm < 1e-3, "ue {} evm {}", ue, evm);
        }
    }

    #[test]
    fn test_unsupported_modulation_is_fatal_at_construction() {
        let good = scenario_config(4, 0);
        let scenario = UplinkScenario::random(&good, 0).unwrap();
        let bad = Arc::new(DemulConfig {
            mod_order_bits: 3,
            ..good
        });
        let window = Arc::new(FrameWindow::new(&bad).unwrap());
        scenario.load(&window, 0).unwrap();

        let err = DoDemul::new(bad, 0, Arc::clone(&window), scenario.pilots(), &StatsSink::new(1))
            .unwrap_err();
        assert_eq!(err, DemulError::UnsupportedModulation(3));
        assert!(err.is_config_fatal());
        for ue in 0..2 {
            assert!(window.llr(0, 0, ue).iter().all(|&l| l == 0));
        }
    }

    #[test]
    fn test_bad_tags_rejected() {
        let cfg = scenario_config(2, 0);
        let scenario = UplinkScenario::random(&cfg, 0).unwrap();
        let mut h = harness(cfg, &scenario, 0);

        assert!(matches!(
            h.demul.launch(TaskTag::frm_sym_sc(0, 3, 0)),
            Err(DemulError::TaskOutOfRange { field: "symbol_id", .. })
        ));
        assert!(matches!(
            h.demul.launch(TaskTag::frm_sym_sc(0, 0, 16)),
            Err(DemulError::TaskOutOfRange { field: "sc_id", .. })
        ));
        assert!(matches!(
            h.demul.launch(TaskTag::frm_sym_sc(0, 0, 4)),
            Err(DemulError::MisalignedBlock { .. })
        ));
        assert_eq!(h.sink.aggregate().task_count, 0);

        // Cache-line aligned but inside another task's block
        let cfg = DemulConfig {
            ofdm_data_num: 32,
            demul_block_size: 16,
            transpose_block_size: 16,
            ..scenario_config(2, 0)
        };
        let scenario = UplinkScenario::random(&cfg, 0).unwrap();
        let mut h = harness(cfg, &scenario, 0);
        assert_eq!(
            h.demul.launch(TaskTag::frm_sym_sc(0, 0, 8)).unwrap_err(),
            DemulError::MisalignedBlock {
                what: "task base subcarrier",
                size: 8,
                width: 16,
            }
        );
        assert!(h.demul.launch(TaskTag::frm_sym_sc(0, 0, 16)).is_ok());
        assert_eq!(h.sink.aggregate().task_count, 1);
    }

    #[test]
    fn test_short_evm_truth_rejected() {
        let cfg = DemulConfig {
            ofdm_data_num: 32,
            ..scenario_config(4, 1)
        };
        let scenario = UplinkScenario::random(&cfg, 4).unwrap();
        let h = harness(cfg, &scenario, 0);

        // Half the subcarriers only
        let truth = scenario.evm_reference()[..16 * 2].to_vec();
        let phy = Arc::new(PhyStats::new(2, h.cfg.frame_window, truth).unwrap());
        let err = h.demul.with_phy_stats(phy).unwrap_err();
        assert_eq!(
            err,
            DemulError::DimensionMismatch {
                what: "EVM ground truth",
                expected: 64,
                actual: 32,
            }
        );
    }

    #[test]
    fn test_worker_outside_sink_rejected() {
        let cfg = Arc::new(scenario_config(2, 0));
        let scenario = UplinkScenario::random(&cfg, 0).unwrap();
        let window = Arc::new(FrameWindow::new(&cfg).unwrap());
        let err = DoDemul::new(cfg, 3, window, scenario.pilots(), &StatsSink::new(1)).unwrap_err();
        assert!(matches!(err, DemulError::InvalidConfig(_)));
    }

    #[test]
    fn test_mismatched_window_rejected() {
        let cfg = scenario_config(2, 0);
        let scenario = UplinkScenario::random(&cfg, 0).unwrap();
        let other = DemulConfig {
            bs_ant_num: 8,
            ..cfg.clone()
        };
        let window = Arc::new(FrameWindow::new(&other).unwrap());
        let err = DoDemul::new(Arc::new(cfg), 0, window, scenario.pilots(), &StatsSink::new(1))
            .unwrap_err();
        assert!(matches!(err, DemulError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_stage_counters() {
        let cfg = scenario_config(2, 0);
        let scenario = UplinkScenario::random(&cfg, 0).unwrap();
        let mut h = harness(cfg, &scenario, 0);
        run_frame(&mut h, 0);

        let snap = h.sink.aggregate();
        assert_eq!(snap.task_count, 6);
        let parts = snap.stage_ns(Stage::Gather)
            + snap.stage_ns(Stage::Equalize)
            + snap.stage_ns(Stage::Demod);
        assert!(snap.stage_ns(Stage::Total) >= parts);
    }
}
