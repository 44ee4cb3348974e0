//! # Massive-MIMO Uplink Demodulation
//!
//! The equalization, phase-tracking and soft-demodulation stage of a
//! real-time massive-MIMO baseband receiver. For every OFDM symbol received on
//! many base-station antennas it separates the jointly transmitting UEs with
//! precomputed zero-forcing matrices, removes residual carrier phase drift
//! measured on UE-specific pilots, and turns the result into signed LLR bytes
//! for the channel decoder.
//!
//! ## Signal Flow
//!
//! ```text
//! FFT output ─┐                            ┌─ pilot symbol: accumulate phase
//!  (per ant)  ├─ gather ─ equalize (W·x) ──┤
//! ZF matrices ┘                            └─ data symbol:  derotate
//!                                                   │
//!                     LLR bytes ◄─ soft demod ◄─ transpose per UE
//! ```
//!
//! One task covers one block of subcarriers of one symbol, addressed by a
//! [`TaskTag`]. Workers own a [`DoDemul`] each and share a [`FrameWindow`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mimo_demul::prelude::*;
//! use mimo_demul::synth::UplinkScenario;
//! use mimo_demul::demod::hard_decision;
//!
//! let cfg = Arc::new(DemulConfig {
//!     bs_ant_num: 4,
//!     ue_num: 2,
//!     ofdm_data_num: 16,
//!     demul_block_size: 8,
//!     transpose_block_size: 8,
//!     mod_order_bits: 2,
//!     ..Default::default()
//! });
//!
//! let scenario = UplinkScenario::random(&cfg, 7).unwrap();
//! let window = Arc::new(FrameWindow::new(&cfg).unwrap());
//! scenario.load(&window, 0).unwrap();
//!
//! let sink = StatsSink::new(1);
//! let mut demul = DoDemul::new(cfg, 0, Arc::clone(&window), scenario.pilots(), &sink).unwrap();
//! for sc in [0, 8] {
//!     let event = demul.launch(TaskTag::frm_sym_sc(0, 0, sc)).unwrap();
//!     assert_eq!(event.event_type, EventType::Demul);
//! }
//!
//! let llr = window.llr(0, 0, 1);
//! assert_eq!(hard_decision(&llr), scenario.tx_bits(0, 1));
//! ```

pub mod config;
pub mod demod;
pub mod demul;
pub mod equalize;
pub mod error;
pub mod frame_window;
pub mod gather;
pub mod logging;
pub mod matrix;
pub mod phase;
pub mod phy_stats;
pub mod rt;
pub mod stats;
pub mod synth;
pub mod tag;
pub mod types;
pub mod worker;

pub use config::{DemulConfig, SampleLayout, WorkerConfig};
pub use demod::{Modulation, SoftDemodulator};
pub use demul::DoDemul;
pub use error::{DemulError, DemulResult};
pub use frame_window::FrameWindow;
pub use tag::{EventData, EventType, TaskTag};
pub use types::{IQSample, Llr};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{DemulConfig, SampleLayout, WorkerConfig};
    pub use crate::demod::{Modulation, SoftDemodulator};
    pub use crate::demul::DoDemul;
    pub use crate::equalize::KernelChoice;
    pub use crate::error::{DemulError, DemulResult};
    pub use crate::frame_window::FrameWindow;
    pub use crate::phase::PilotSequence;
    pub use crate::phy_stats::PhyStats;
    pub use crate::stats::{Stage, StatsSink};
    pub use crate::tag::{EventData, EventType, TaskTag};
    pub use crate::types::IQSample;
    pub use crate::worker::WorkerPool;
}
