//! Soft demodulation of equalized constellations into LLR bytes
//!
//! Gray-coded square QAM with unit average energy. For each subcarrier the
//! bits are emitted I-sign, Q-sign, then magnitude bits MSB first with I and
//! Q interleaved:
//!
//! ```text
//! QPSK   : sI sQ
//! 16-QAM : sI sQ mI mQ
//! 64-QAM : sI sQ m1I m1Q m2I m2Q
//! ```
//!
//! Soft values use the max-log approximation per rail, expressed in units of
//! the received amplitude and scaled to `i8`. Positive means bit 0.
//!
//! ```
//! use mimo_demul::demod::{hard_decision, Modulation, SoftDemodulator};
//!
//! let bits = [1, 0, 1, 1];
//! let sym = Modulation::Qam16.map_bits(&bits);
//!
//! let demod = SoftDemodulator::new(Modulation::Qam16, 32.0);
//! let mut llr = [0i8; 4];
//! demod.demodulate(&[sym], &mut llr);
//! assert_eq!(hard_decision(&llr), bits.to_vec());
//! ```

use serde::{Deserialize, Serialize};

use crate::config::DemulConfig;
use crate::error::{DemulError, DemulResult};
use crate::types::{IQSample, Llr};

/// 1/√2
const QPSK_NORM: f32 = std::f32::consts::FRAC_1_SQRT_2;
/// 1/√10
const QAM16_NORM: f32 = 0.316_227_77;
/// 1/√42
const QAM64_NORM: f32 = 0.154_303_35;

/// Supported constellations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    /// 2 bits per subcarrier
    Qpsk,
    /// 4 bits per subcarrier on a 4×4 grid
    Qam16,
    /// 6 bits per subcarrier on an 8×8 grid
    Qam64,
}

impl Modulation {
    /// Resolve a modulation order given in bits per symbol.
    pub fn from_order_bits(bits: usize) -> DemulResult<Self> {
        match bits {
            2 => Ok(Modulation::Qpsk),
            4 => Ok(Modulation::Qam16),
            6 => Ok(Modulation::Qam64),
            other => {
                tracing::error!(mod_order_bits = other, "modulation order not supported");
                Err(DemulError::UnsupportedModulation(other))
            }
        }
    }

    #[inline]
    pub fn bits_per_symbol(self) -> usize {
        match self {
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
        }
    }

    /// Amplitude of the innermost constellation level.
    #[inline]
    pub fn norm(self) -> f32 {
        match self {
            Modulation::Qpsk => QPSK_NORM,
            Modulation::Qam16 => QAM16_NORM,
            Modulation::Qam64 => QAM64_NORM,
        }
    }

    /// Map one symbol's bits (values 0/1, `bits_per_symbol` of them).
    pub fn map_bits(self, bits: &[u8]) -> IQSample {
        debug_assert_eq!(bits.len(), self.bits_per_symbol());
        let n = self.norm();
        let sign = |b: u8| if b == 0 { 1.0 } else { -1.0 };

        let (mag_i, mag_q) = match self {
            Modulation::Qpsk => (1.0, 1.0),
            Modulation::Qam16 => (qam16_level(bits[2]), qam16_level(bits[3])),
            Modulation::Qam64 => (
                qam64_level(bits[2], bits[4]),
                qam64_level(bits[3], bits[5]),
            ),
        };

        IQSample::new(sign(bits[0]) * mag_i * n, sign(bits[1]) * mag_q * n)
    }
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modulation::Qpsk => write!(f, "QPSK"),
            Modulation::Qam16 => write!(f, "16-QAM"),
            Modulation::Qam64 => write!(f, "64-QAM"),
        }
    }
}

#[inline]
fn qam16_level(m: u8) -> f32 {
    if m == 0 {
        1.0
    } else {
        3.0
    }
}

#[inline]
fn qam64_level(m1: u8, m2: u8) -> f32 {
    match (m1, m2) {
        (0, 1) => 1.0,
        (0, _) => 3.0,
        (_, 0) => 5.0,
        _ => 7.0,
    }
}

/// Per-UE soft demodulator for one configured constellation.
#[derive(Debug, Clone, Copy)]
pub struct SoftDemodulator {
    modulation: Modulation,
    scale: f32,
}

impl SoftDemodulator {
    pub fn new(modulation: Modulation, scale: f32) -> Self {
        Self { modulation, scale }
    }

    pub fn from_config(cfg: &DemulConfig) -> DemulResult<Self> {
        Ok(Self::new(cfg.modulation()?, cfg.llr_scale))
    }

    #[inline]
    pub fn modulation(&self) -> Modulation {
        self.modulation
    }

    /// Demodulate `symbols` into `out`, `bits_per_symbol` bytes per symbol.
    pub fn demodulate(&self, symbols: &[IQSample], out: &mut [Llr]) {
        let bits = self.modulation.bits_per_symbol();
        debug_assert!(out.len() >= symbols.len() * bits);

        match self.modulation {
            Modulation::Qpsk => self.demod_qpsk(symbols, out),
            Modulation::Qam16 => self.demod_16qam(symbols, out),
            Modulation::Qam64 => self.demod_64qam(symbols, out),
        }
    }

    #[inline]
    fn quantize(&self, llr: f32) -> Llr {
        (llr * self.scale).round().clamp(-127.0, 127.0) as Llr
    }

    // ── QPSK ──────────────────────────────────────────────────────────

    fn demod_qpsk(&self, symbols: &[IQSample], out: &mut [Llr]) {
        for (s, llr) in symbols.iter().zip(out.chunks_exact_mut(2)) {
            llr[0] = self.quantize(s.re);
            llr[1] = self.quantize(s.im);
        }
    }

    // ── 16-QAM ────────────────────────────────────────────────────────

    fn demod_16qam(&self, symbols: &[IQSample], out: &mut [Llr]) {
        let thresh = 2.0 * QAM16_NORM;
        for (s, llr) in symbols.iter().zip(out.chunks_exact_mut(4)) {
            llr[0] = self.quantize(s.re);
            llr[1] = self.quantize(s.im);
            llr[2] = self.quantize(thresh - s.re.abs());
            llr[3] = self.quantize(thresh - s.im.abs());
        }
    }

    // ── 64-QAM ────────────────────────────────────────────────────────

    fn demod_64qam(&self, symbols: &[IQSample], out: &mut [Llr]) {
        let outer = 4.0 * QAM64_NORM;
        let inner = 2.0 * QAM64_NORM;
        for (s, llr) in symbols.iter().zip(out.chunks_exact_mut(6)) {
            let (ai, aq) = (s.re.abs(), s.im.abs());
            llr[0] = self.quantize(s.re);
            llr[1] = self.quantize(s.im);
            llr[2] = self.quantize(outer - ai);
            llr[3] = self.quantize(outer - aq);
            llr[4] = self.quantize(inner - (ai - outer).abs());
            llr[5] = self.quantize(inner - (aq - outer).abs());
        }
    }
}

/// Hard bits from LLR signs (negative = 1).
pub fn hard_decision(llrs: &[Llr]) -> Vec<u8> {
    llrs.iter().map(|&l| u8::from(l < 0)).collect()
}
