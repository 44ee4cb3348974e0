//! Gather and transpose of received samples
//!
//! The FFT stage writes one symbol's samples per antenna, either fully
//! antenna-major or in partial-transpose blocks of `T` subcarriers:
//!
//! ```text
//! Contiguous:        [ant0: sc0 sc1 ... scN-1][ant1: sc0 ...]...
//!
//! PartialTranspose:  [blk0: ant0 sc0..T-1 | ant1 sc0..T-1 | ...]
//!                    [blk1: ant0 scT..2T-1 | ...]...
//! ```
//!
//! The equalizer wants, for each subcarrier of a cache-line group, the full
//! antenna vector contiguous in memory. A [`Gatherer`] builds that
//! `SCS_PER_CACHELINE x ant` row-major tile.
//!
//! [`transpose_ue`] is the inverse reorganisation on the output side: it
//! pulls one UE's column out of the `sc x ue` equalized block so the soft
//! demodulator sees a contiguous per-UE vector.

use std::fmt::Debug;

use crate::config::{DemulConfig, SampleLayout};
use crate::matrix::CMatView;
use crate::types::{IQSample, SCS_PER_CACHELINE};

/// Address arithmetic for one symbol's received sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherGeometry {
    ant_num: usize,
    ofdm_data_num: usize,
    layout: SampleLayout,
    transpose_block_size: usize,
}

impl GatherGeometry {
    pub fn new(
        ant_num: usize,
        ofdm_data_num: usize,
        layout: SampleLayout,
        transpose_block_size: usize,
    ) -> Self {
        Self {
            ant_num,
            ofdm_data_num,
            layout,
            transpose_block_size,
        }
    }

    pub fn from_config(cfg: &DemulConfig) -> Self {
        Self::new(
            cfg.bs_ant_num,
            cfg.ofdm_data_num,
            cfg.sample_layout,
            cfg.transpose_block_size,
        )
    }

    #[inline]
    pub fn ant_num(&self) -> usize {
        self.ant_num
    }

    /// Distance between the same subcarrier on consecutive antennas.
    #[inline]
    pub fn antenna_stride(&self) -> usize {
        match self.layout {
            SampleLayout::Contiguous => self.ofdm_data_num,
            SampleLayout::PartialTranspose => self.transpose_block_size,
        }
    }

    /// Offset of antenna 0's sample for subcarrier `sc`.
    #[inline]
    pub fn base_offset(&self, sc: usize) -> usize {
        match self.layout {
            SampleLayout::Contiguous => sc,
            SampleLayout::PartialTranspose => {
                let t = self.transpose_block_size;
                (sc / t) * t * self.ant_num + sc % t
            }
        }
    }

    /// Offset of the sample for `(ant, sc)`.
    #[inline]
    pub fn offset(&self, ant: usize, sc: usize) -> usize {
        self.base_offset(sc) + ant * self.antenna_stride()
    }

    /// Samples per symbol buffer, padding the last partial-transpose block.
    pub fn buffer_len(&self) -> usize {
        match self.layout {
            SampleLayout::Contiguous => self.ant_num * self.ofdm_data_num,
            SampleLayout::PartialTranspose => {
                let t = self.transpose_block_size;
                self.ofdm_data_num.div_ceil(t) * t * self.ant_num
            }
        }
    }
}

/// Gathers one cache-line group of subcarriers into an `sc x ant` tile.
pub trait Gatherer: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Fill `dst[j * ant + a]` with sample `(a, sc_base + j)` for
    /// `j < SCS_PER_CACHELINE`.
    ///
    /// `sc_base` must be a multiple of `SCS_PER_CACHELINE`, so the whole
    /// group lies in one transpose block.
    fn gather(&self, geom: &GatherGeometry, src: &[IQSample], sc_base: usize, dst: &mut [IQSample]);
}

/// One sample at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarGather;

impl Gatherer for ScalarGather {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn gather(&self, geom: &GatherGeometry, src: &[IQSample], sc_base: usize, dst: &mut [IQSample]) {
        gather_tail(geom, src, sc_base, 0, dst);
    }
}

/// `LANES` antennas per step through a fixed-stride index, the shape of a
/// hardware gather instruction; remaining antennas go through the scalar
/// tail.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneGather<const LANES: usize>;

impl<const LANES: usize> Gatherer for LaneGather<LANES> {
    fn name(&self) -> &'static str {
        match LANES {
            8 => "lane8",
            4 => "lane4",
            _ => "lane",
        }
    }

    fn gather(&self, geom: &GatherGeometry, src: &[IQSample], sc_base: usize, dst: &mut [IQSample]) {
        debug_assert_eq!(sc_base % SCS_PER_CACHELINE, 0);
        let ant_num = geom.ant_num();
        let stride = geom.antenna_stride();
        let vector_ants = ant_num - ant_num % LANES;

        for j in 0..SCS_PER_CACHELINE {
            let base = geom.base_offset(sc_base + j);
            let row = &mut dst[j * ant_num..(j + 1) * ant_num];
            for ant in (0..vector_ants).step_by(LANES) {
                let first = base + ant * stride;
                let lanes: [IQSample; LANES] = std::array::from_fn(|l| src[first + l * stride]);
                row[ant..ant + LANES].copy_from_slice(&lanes);
            }
        }

        if vector_ants < ant_num {
            gather_tail(geom, src, sc_base, vector_ants, dst);
        }
    }
}

/// Scalar copy of antennas `ant_start..` for one cache-line group.
fn gather_tail(
    geom: &GatherGeometry,
    src: &[IQSample],
    sc_base: usize,
    ant_start: usize,
    dst: &mut [IQSample],
) {
    let ant_num = geom.ant_num();
    for j in 0..SCS_PER_CACHELINE {
        for ant in ant_start..ant_num {
            dst[j * ant_num + ant] = src[geom.offset(ant, sc_base + j)];
        }
    }
}

/// Widest gather the running CPU handles natively, in complex lanes.
fn detected_lane_width() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx512f") {
            return 8;
        }
        if std::is_x86_feature_detected!("avx2") {
            return 4;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("neon") {
            return 4;
        }
    }
    1
}

/// Choose the gather strategy for `ant_num` antennas.
pub fn select_gatherer(ant_num: usize, allow_simd: bool) -> Box<dyn Gatherer> {
    let width = if allow_simd { detected_lane_width() } else { 1 };
    let gatherer: Box<dyn Gatherer> = if width >= 8 && ant_num >= 8 {
        Box::new(LaneGather::<8>)
    } else if width >= 4 && ant_num >= 4 {
        Box::new(LaneGather::<4>)
    } else {
        Box::new(ScalarGather)
    };
    tracing::info!(gather = gatherer.name(), ant_num, "gather strategy selected");
    gatherer
}

/// Copy UE `ue`'s column of the row-major `sc x ue` block into `dst`.
#[inline]
pub fn transpose_ue(equalized: &CMatView<'_>, ue: usize, dst: &mut [IQSample]) {
    equalized.copy_col(ue, dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO;

    /// Buffer where every sample encodes its own (ant, sc) coordinates.
    fn labelled_buffer(geom: &GatherGeometry, ofdm_data_num: usize) -> Vec<IQSample> {
        let mut buf = vec![IQSample::new(-1.0, -1.0); geom.buffer_len()];
        for ant in 0..geom.ant_num() {
            for sc in 0..ofdm_data_num {
                buf[geom.offset(ant, sc)] = IQSample::new(ant as f32, sc as f32);
            }
        }
        buf
    }

    fn check_tile(tile: &[IQSample], ant_num: usize, sc_base: usize) {
        for j in 0..SCS_PER_CACHELINE {
            for ant in 0..ant_num {
                assert_eq!(
                    tile[j * ant_num + ant],
                    IQSample::new(ant as f32, (sc_base + j) as f32),
                    "ant {} sc {}",
                    ant,
                    sc_base + j
                );
            }
        }
    }

    #[test]
    fn test_offsets() {
        let geom = GatherGeometry::new(4, 64, SampleLayout::Contiguous, 16);
        assert_eq!(geom.offset(2, 5), 2 * 64 + 5);
        assert_eq!(geom.buffer_len(), 256);

        let geom = GatherGeometry::new(4, 64, SampleLayout::PartialTranspose, 16);
        // Block 1 starts at 16 * 4, antenna 2 is 2 * 16 further in
        assert_eq!(geom.offset(2, 21), 64 + 32 + 5);
        assert_eq!(geom.buffer_len(), 256);

        // Last block padded to a full transpose block
        let geom = GatherGeometry::new(2, 40, SampleLayout::PartialTranspose, 16);
        assert_eq!(geom.buffer_len(), 3 * 16 * 2);
    }

    #[test]
    fn test_offsets_are_a_bijection() {
        let geom = GatherGeometry::new(6, 48, SampleLayout::PartialTranspose, 16);
        let mut seen = vec![false; geom.buffer_len()];
        for ant in 0..6 {
            for sc in 0..48 {
                let off = geom.offset(ant, sc);
                assert!(!seen[off]);
                seen[off] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_all_strategies_agree() {
        let strategies: Vec<Box<dyn Gatherer>> = vec![
            Box::new(ScalarGather),
            Box::new(LaneGather::<4>),
            Box::new(LaneGather::<8>),
        ];

        for layout in [SampleLayout::Contiguous, SampleLayout::PartialTranspose] {
            // 5 and 6 exercise the scalar tail after the lane pass
            for ant_num in [4, 5, 6, 8, 12, 16] {
                let geom = GatherGeometry::new(ant_num, 64, layout, 32);
                let src = labelled_buffer(&geom, 64);
                for gatherer in &strategies {
                    for sc_base in (0..64).step_by(SCS_PER_CACHELINE) {
                        let mut tile = vec![ZERO; SCS_PER_CACHELINE * ant_num];
                        gatherer.gather(&geom, &src, sc_base, &mut tile);
                        check_tile(&tile, ant_num, sc_base);
                    }
                }
            }
        }
    }

    #[test]
    fn test_select_gatherer() {
        assert_eq!(select_gatherer(8, false).name(), "scalar");
        assert_eq!(select_gatherer(2, true).name(), "scalar");
        let name = select_gatherer(16, true).name();
        assert!(["scalar", "lane4", "lane8"].contains(&name));
    }

    #[test]
    fn test_transpose_ue() {
        // 3 subcarriers x 2 UEs
        let block: Vec<IQSample> = (0..6).map(|i| IQSample::new(i as f32, 0.0)).collect();
        let view = CMatView::row_major(&block, 3, 2).unwrap();
        let mut ue1 = vec![ZERO; 3];
        transpose_ue(&view, 1, &mut ue1);
        assert_eq!(ue1, vec![block[1], block[3], block[5]]);
    }
}
