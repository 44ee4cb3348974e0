//! Core sample types for the uplink receive path
//!
//! Every buffer handled by the demodulation stage holds single-precision
//! complex baseband samples, one per (antenna or UE, subcarrier).
//!
//! ## Cache-line groups
//!
//! The gather and equalization loops walk the task's subcarrier range one
//! cache line of samples at a time:
//!
//! ```text
//!   64-byte cache line = 8 x Complex<f32>
//!
//!   sc:  | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | ...
//!        '-------------------------------'  '-----
//!                 group 0                    group 1
//! ```
//!
//! Task block sizes and transpose block sizes must therefore be multiples of
//! [`SCS_PER_CACHELINE`].

use num_complex::Complex32;

use crate::rt::CACHE_LINE_SIZE;

/// A single complex baseband sample, single precision.
pub type IQSample = Complex32;

/// A signed soft bit: sign is the hard decision, magnitude the confidence.
pub type Llr = i8;

/// Number of complex samples that fit in one cache line.
pub const SCS_PER_CACHELINE: usize = CACHE_LINE_SIZE / std::mem::size_of::<IQSample>();

/// The zero sample.
pub const ZERO: IQSample = IQSample::new(0.0, 0.0);
