//! # Demodulation Configuration
//!
//! YAML-backed configuration for the uplink demodulation stage. The values
//! are supplied by the surrounding baseband processor and are read-only to
//! the workers.
//!
//! ## Example Configuration
//!
//! ```yaml
//! bs_ant_num: 64
//! ue_num: 8
//! ofdm_data_num: 1200
//! demul_block_size: 48
//! transpose_block_size: 64
//! sample_layout: partial_transpose
//! ul_pilot_symbols: 2
//! ul_data_symbols: 12
//! mod_order_bits: 4
//! frame_window: 40
//! worker:
//!   num_workers: 4
//!   cpu_affinity: [2, 3, 4, 5]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::demod::Modulation;
use crate::equalize::KernelChoice;
use crate::error::{DemulError, DemulResult};
use crate::tag::TaskTag;
use crate::types::SCS_PER_CACHELINE;

/// Error type for configuration loading.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    ReadError(String),
    /// Failed to parse configuration
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(msg) => write!(f, "failed to read config: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for DemulError {
    fn from(err: ConfigError) -> Self {
        DemulError::InvalidConfig(err.to_string())
    }
}

/// Memory layout of the per-antenna frequency-domain samples produced by the
/// FFT stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleLayout {
    /// Sample (ant, sc) at `ant * ofdm_data_num + sc`
    Contiguous,
    /// Blocks of `transpose_block_size` subcarriers stored antenna-major:
    /// `(sc / T) * T * ant_num + ant * T + sc % T`
    PartialTranspose,
}

impl Default for SampleLayout {
    fn default() -> Self {
        SampleLayout::PartialTranspose
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of demodulation workers
    pub num_workers: usize,
    /// Thread name prefix, suffixed with the worker index
    pub name_prefix: String,
    /// CPUs to pin workers to, assigned round-robin (empty = no pinning)
    pub cpu_affinity: Vec<usize>,
    /// Capacity of the task and completion queues
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            name_prefix: "demul".to_string(),
            cpu_affinity: Vec::new(),
            queue_capacity: 4096,
        }
    }
}

/// Uplink demodulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemulConfig {
    /// Base-station antenna count
    pub bs_ant_num: usize,
    /// Number of jointly received UEs
    pub ue_num: usize,
    /// OFDM data subcarriers per symbol
    pub ofdm_data_num: usize,
    /// Subcarriers per demodulation task
    pub demul_block_size: usize,
    /// Subcarriers per partial-transpose block
    pub transpose_block_size: usize,
    /// Layout of the received sample buffers
    pub sample_layout: SampleLayout,
    /// UE-specific uplink pilot symbols at the start of each frame
    pub ul_pilot_symbols: usize,
    /// Uplink symbols per frame, pilots included
    pub ul_data_symbols: usize,
    /// Bits per constellation symbol (2 = QPSK, 4 = 16-QAM, 6 = 64-QAM)
    pub mod_order_bits: usize,
    /// Frames held in flight by the frame window
    pub frame_window: usize,
    /// Keep equalized constellations in the frame window for inspection
    pub export_constellation: bool,
    /// Scale from soft values to LLR bytes
    pub llr_scale: f32,
    /// Subcarriers sharing one channel-inversion matrix
    pub zf_group_size: usize,
    /// Matrix-vector kernel selection
    pub kernel: KernelChoice,
    /// Use the lane-wide gather when the platform supports it
    pub simd_gather: bool,
    /// Worker pool settings
    pub worker: WorkerConfig,
}

impl Default for DemulConfig {
    fn default() -> Self {
        Self {
            bs_ant_num: 8,
            ue_num: 4,
            ofdm_data_num: 1200,
            demul_block_size: 48,
            transpose_block_size: 64,
            sample_layout: SampleLayout::PartialTranspose,
            ul_pilot_symbols: 0,
            ul_data_symbols: 4,
            mod_order_bits: 4,
            frame_window: 40,
            export_constellation: false,
            llr_scale: 32.0,
            zf_group_size: 1,
            kernel: KernelChoice::Auto,
            simd_gather: true,
            worker: WorkerConfig::default(),
        }
    }
}

impl DemulConfig {
    /// Load configuration from a YAML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Resolve the configured modulation order.
    pub fn modulation(&self) -> DemulResult<Modulation> {
        Modulation::from_order_bits(self.mod_order_bits)
    }

    /// Number of subcarrier tasks per symbol.
    pub fn demul_tasks_per_symbol(&self) -> usize {
        self.ofdm_data_num.div_ceil(self.demul_block_size.max(1))
    }

    /// Number of channel-inversion matrices per frame.
    pub fn zf_matrix_count(&self) -> usize {
        self.ofdm_data_num.div_ceil(self.zf_group_size.max(1))
    }

    /// Index of the channel-inversion matrix used by subcarrier `sc`.
    #[inline]
    pub fn zf_index(&self, sc: usize) -> usize {
        sc / self.zf_group_size
    }

    /// LLR bytes produced per UE per symbol.
    pub fn llr_bytes_per_symbol(&self) -> usize {
        self.ofdm_data_num * self.mod_order_bits
    }

    /// Check every configuration-time invariant the task path relies on.
    pub fn validate(&self) -> DemulResult<()> {
        self.validate_dimensions()?;
        self.modulation()?;
        Ok(())
    }

    /// Structural checks only: shapes, alignment and tag field widths.
    pub fn validate_dimensions(&self) -> DemulResult<()> {
        let nonzero = [
            ("bs_ant_num", self.bs_ant_num),
            ("ue_num", self.ue_num),
            ("ofdm_data_num", self.ofdm_data_num),
            ("demul_block_size", self.demul_block_size),
            ("ul_data_symbols", self.ul_data_symbols),
            ("frame_window", self.frame_window),
            ("zf_group_size", self.zf_group_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(DemulError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.ue_num > self.bs_ant_num {
            return Err(DemulError::InvalidConfig(format!(
                "ue_num ({}) exceeds bs_ant_num ({})",
                self.ue_num, self.bs_ant_num
            )));
        }

        check_aligned("demul block size", self.demul_block_size)?;
        check_aligned("OFDM data subcarrier count", self.ofdm_data_num)?;
        if self.sample_layout == SampleLayout::PartialTranspose {
            if self.transpose_block_size == 0 {
                return Err(DemulError::InvalidConfig(
                    "transpose_block_size must be non-zero".to_string(),
                ));
            }
            check_aligned("transpose block size", self.transpose_block_size)?;
        }

        if self.ul_pilot_symbols > self.ul_data_symbols {
            return Err(DemulError::InvalidConfig(format!(
                "ul_pilot_symbols ({}) exceeds ul_data_symbols ({})",
                self.ul_pilot_symbols, self.ul_data_symbols
            )));
        }
        if self.ul_data_symbols > TaskTag::MAX_SYMBOL_ID + 1 {
            return Err(DemulError::TaskOutOfRange {
                field: "symbol count",
                value: self.ul_data_symbols,
                limit: TaskTag::MAX_SYMBOL_ID + 1,
            });
        }
        if self.ofdm_data_num > TaskTag::MAX_ID + 1 {
            return Err(DemulError::TaskOutOfRange {
                field: "subcarrier count",
                value: self.ofdm_data_num,
                limit: TaskTag::MAX_ID + 1,
            });
        }

        if !(self.llr_scale.is_finite() && self.llr_scale > 0.0) {
            return Err(DemulError::InvalidConfig(format!(
                "llr_scale must be positive, got {}",
                self.llr_scale
            )));
        }

        Ok(())
    }
}

fn check_aligned(what: &'static str, size: usize) -> DemulResult<()> {
    if size % SCS_PER_CACHELINE != 0 {
        return Err(DemulError::MisalignedBlock {
            what,
            size,
            width: SCS_PER_CACHELINE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DemulConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modulation().unwrap(), Modulation::Qam16);
        assert_eq!(config.demul_tasks_per_symbol(), 25);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
bs_ant_num: 64
ue_num: 8
ofdm_data_num: 1200
demul_block_size: 48
sample_layout: contiguous
mod_order_bits: 6
worker:
  num_workers: 4
  cpu_affinity: [2, 3]
"#;
        let config = DemulConfig::parse(yaml).unwrap();
        assert_eq!(config.bs_ant_num, 64);
        assert_eq!(config.ue_num, 8);
        assert_eq!(config.sample_layout, SampleLayout::Contiguous);
        assert_eq!(config.modulation().unwrap(), Modulation::Qam64);
        assert_eq!(config.worker.num_workers, 4);
        assert_eq!(config.worker.cpu_affinity, vec![2, 3]);
        // Unspecified fields keep their defaults
        assert_eq!(config.frame_window, 40);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = DemulConfig::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = DemulConfig::parse(&yaml).unwrap();
        assert_eq!(parsed.ofdm_data_num, config.ofdm_data_num);
        assert_eq!(parsed.kernel, config.kernel);
    }

    #[test]
    fn test_parse_error() {
        let err = DemulConfig::parse("bs_ant_num: [not a number").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
        let demul: DemulError = err.into();
        assert!(demul.is_config_fatal());
    }

    #[test]
    fn test_block_alignment() {
        for block in [8, 16, 48, 64] {
            let config = DemulConfig {
                demul_block_size: block,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "block {} should be valid", block);
        }

        for block in [1, 4, 12, 50] {
            let config = DemulConfig {
                demul_block_size: block,
                ..Default::default()
            };
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, DemulError::MisalignedBlock { size, width: 8, .. } if size == block),
                "block {} gave {:?}",
                block,
                err
            );
        }
    }

    #[test]
    fn test_transpose_alignment() {
        let config = DemulConfig {
            transpose_block_size: 12,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DemulError::MisalignedBlock { .. })
        ));

        // Irrelevant for the contiguous layout
        let config = DemulConfig {
            transpose_block_size: 12,
            sample_layout: SampleLayout::Contiguous,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unsupported_modulation_rejected() {
        let config = DemulConfig {
            mod_order_bits: 3,
            ..Default::default()
        };
        assert!(config.validate_dimensions().is_ok());
        assert_eq!(
            config.validate(),
            Err(DemulError::UnsupportedModulation(3))
        );
    }

    #[test]
    fn test_dimension_checks() {
        let config = DemulConfig {
            ue_num: 16,
            bs_ant_num: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DemulError::InvalidConfig(_))));

        let config = DemulConfig {
            ul_pilot_symbols: 5,
            ul_data_symbols: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DemulError::InvalidConfig(_))));

        let config = DemulConfig {
            frame_window: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DemulError::InvalidConfig(_))));
    }

    #[test]
    fn test_zf_grouping() {
        let config = DemulConfig {
            zf_group_size: 4,
            ofdm_data_num: 64,
            ..Default::default()
        };
        assert_eq!(config.zf_matrix_count(), 16);
        assert_eq!(config.zf_index(0), 0);
        assert_eq!(config.zf_index(7), 1);
        assert_eq!(config.zf_index(63), 15);
    }
}
