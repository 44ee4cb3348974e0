//! Synthetic uplink frames
//!
//! Builds a noiseless frame for a configuration: pilots on the first
//! `ul_pilot_symbols` symbols, Gray-mapped data afterwards, an identity
//! channel (`[I | 0]` inversion matrices), and optionally a per-UE linear
//! phase drift. Used to exercise the whole demodulation path without the
//! upstream FFT and ZF stages.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::config::DemulConfig;
use crate::demod::Modulation;
use crate::error::{DemulError, DemulResult};
use crate::frame_window::FrameWindow;
use crate::phase::PilotSequence;
use crate::types::{IQSample, ZERO};

/// Transmitted content of one synthetic frame.
#[derive(Debug, Clone)]
pub struct UplinkScenario {
    ant_num: usize,
    ue_num: usize,
    ofdm_data_num: usize,
    pilot_symbols: usize,
    zf_count: usize,
    modulation: Modulation,
    pilots: Arc<PilotSequence>,
    /// Per (symbol, UE), `ofdm_data_num * bits` bits; empty for pilot symbols
    tx_bits: Vec<Vec<u8>>,
    /// Per symbol, `[sc * ue + u]`
    tx_symbols: Vec<Vec<IQSample>>,
    drift: Vec<f32>,
    filler_seed: u64,
}

impl UplinkScenario {
    /// Uniformly random data bits.
    pub fn random(cfg: &DemulConfig, seed: u64) -> DemulResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::build(cfg, seed, |_, _, n| (0..n).map(|_| rng.gen_range(0..2u8)).collect())
    }

    /// Every UE repeats `pattern` across each data symbol.
    pub fn with_pattern(cfg: &DemulConfig, pattern: &[u8]) -> DemulResult<Self> {
        if pattern.is_empty() {
            return Err(DemulError::InvalidConfig("empty bit pattern".to_string()));
        }
        Self::build(cfg, 0, |_, _, n| pattern.iter().copied().cycle().take(n).collect())
    }

    fn build<F>(cfg: &DemulConfig, seed: u64, mut bits_for: F) -> DemulResult<Self>
    where
        F: FnMut(usize, usize, usize) -> Vec<u8>,
    {
        cfg.validate()?;
        let modulation = cfg.modulation()?;
        let bps = modulation.bits_per_symbol();
        let (ue_num, sc_num) = (cfg.ue_num, cfg.ofdm_data_num);
        let pilots = Arc::new(PilotSequence::generate(sc_num, ue_num, seed ^ 0x5EED));

        let mut tx_bits = Vec::with_capacity(cfg.ul_data_symbols * ue_num);
        let mut tx_symbols = Vec::with_capacity(cfg.ul_data_symbols);
        for symbol in 0..cfg.ul_data_symbols {
            let mut row = vec![ZERO; sc_num * ue_num];
            if symbol < cfg.ul_pilot_symbols {
                for sc in 0..sc_num {
                    row[sc * ue_num..(sc + 1) * ue_num].copy_from_slice(pilots.row(sc));
                }
                tx_bits.extend((0..ue_num).map(|_| Vec::new()));
            } else {
                for ue in 0..ue_num {
                    let bits = bits_for(symbol, ue, sc_num * bps);
                    for (sc, chunk) in bits.chunks_exact(bps).enumerate() {
                        row[sc * ue_num + ue] = modulation.map_bits(chunk);
                    }
                    tx_bits.push(bits);
                }
            }
            tx_symbols.push(row);
        }

        Ok(Self {
            ant_num: cfg.bs_ant_num,
            ue_num,
            ofdm_data_num: sc_num,
            pilot_symbols: cfg.ul_pilot_symbols,
            zf_count: cfg.zf_matrix_count(),
            modulation,
            pilots,
            tx_bits,
            tx_symbols,
            drift: vec![0.0; ue_num],
            filler_seed: seed,
        })
    }

    /// Rotate UE `u`'s signal by `drift[u] * symbol` radians.
    pub fn with_phase_drift(mut self, drift: Vec<f32>) -> DemulResult<Self> {
        if drift.len() != self.ue_num {
            return Err(DemulError::DimensionMismatch {
                what: "phase drift",
                expected: self.ue_num,
                actual: drift.len(),
            });
        }
        self.drift = drift;
        Ok(self)
    }

    pub fn modulation(&self) -> Modulation {
        self.modulation
    }

    pub fn pilots(&self) -> Arc<PilotSequence> {
        Arc::clone(&self.pilots)
    }

    /// Data bits UE `ue` sent on `symbol`; empty for pilot symbols.
    pub fn tx_bits(&self, symbol: usize, ue: usize) -> &[u8] {
        &self.tx_bits[symbol * self.ue_num + ue]
    }

    /// Transmitted constellation of `symbol`, `[sc * ue + u]`.
    pub fn tx_symbols(&self, symbol: usize) -> &[IQSample] {
        &self.tx_symbols[symbol]
    }

    /// Ground truth for the first data symbol after the pilots.
    pub fn evm_reference(&self) -> Vec<IQSample> {
        self.tx_symbols
            .get(self.pilot_symbols)
            .cloned()
            .unwrap_or_default()
    }

    /// `[I | 0]` inversion matrix: UE `u` is read from antenna `u`.
    pub fn identity_zf(&self) -> Vec<IQSample> {
        let mut w = vec![ZERO; self.ue_num * self.ant_num];
        for u in 0..self.ue_num {
            w[u * self.ant_num + u] = IQSample::new(1.0, 0.0);
        }
        w
    }

    /// Write the frame's ZF table and every symbol's received samples.
    ///
    /// Antennas beyond the UE count carry arbitrary values that the
    /// inversion matrices null out.
    pub fn load(&self, window: &FrameWindow, frame_id: usize) -> DemulResult<()> {
        let zf: Vec<IQSample> = self.identity_zf().repeat(self.zf_count);
        window.write_zf(frame_id, &zf)?;

        let mut rng = StdRng::seed_from_u64(self.filler_seed.wrapping_add(frame_id as u64));
        let mut antenna = vec![ZERO; self.ofdm_data_num];
        for (symbol, tx) in self.tx_symbols.iter().enumerate() {
            for ant in 0..self.ant_num {
                if ant < self.ue_num {
                    let rot = IQSample::from_polar(1.0, self.drift[ant] * symbol as f32);
                    for (sc, out) in antenna.iter_mut().enumerate() {
                        *out = tx[sc * self.ue_num + ant] * rot;
                    }
                } else {
                    for out in antenna.iter_mut() {
                        *out = IQSample::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
                    }
                }
                window.write_antenna(frame_id, symbol, ant, &antenna)?;
            }
        }
        Ok(())
    }
}
