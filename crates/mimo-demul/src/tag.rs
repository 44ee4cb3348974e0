//! Task identifiers and completion events
//!
//! A task tag is a 64-bit integer carrying the coordinates of one unit of
//! work. The demodulation stage only reads the frame, symbol and subcarrier
//! fields; the sub-id is shared with antenna, UE and codeblock tasks of other
//! stages.
//!
//! ```text
//!  63                32 31         19 18  16 15              0
//! +--------------------+-------------+------+-----------------+
//! |      frame_id      |  symbol_id  | kind |  sc/ant/ue/cb   |
//! +--------------------+-------------+------+-----------------+
//!         32 bits          13 bits    3 bits      16 bits
//! ```

use crate::error::{DemulError, DemulResult};

const ID_BITS: u32 = 16;
const KIND_BITS: u32 = 3;
const SYMBOL_BITS: u32 = 13;
const FRAME_BITS: u32 = 32;

const ID_SHIFT: u32 = 0;
const KIND_SHIFT: u32 = ID_SHIFT + ID_BITS;
const SYMBOL_SHIFT: u32 = KIND_SHIFT + KIND_BITS;
const FRAME_SHIFT: u32 = SYMBOL_SHIFT + SYMBOL_BITS;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// What the sub-id field of a tag addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// Base subcarrier of a subcarrier block
    Subcarrier,
    /// Base-station antenna
    Antenna,
    /// User equipment
    Ue,
    /// Codeblock within a symbol
    Codeblock,
}

impl TagKind {
    fn to_bits(self) -> u64 {
        match self {
            TagKind::Subcarrier => 0,
            TagKind::Antenna => 1,
            TagKind::Ue => 2,
            TagKind::Codeblock => 3,
        }
    }

    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(TagKind::Subcarrier),
            1 => Some(TagKind::Antenna),
            2 => Some(TagKind::Ue),
            3 => Some(TagKind::Codeblock),
            _ => None,
        }
    }
}

/// Bit-packed task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskTag(u64);

impl TaskTag {
    /// Largest frame id representable in a tag.
    pub const MAX_FRAME_ID: usize = mask(FRAME_BITS) as usize;
    /// Largest symbol id representable in a tag.
    pub const MAX_SYMBOL_ID: usize = mask(SYMBOL_BITS) as usize;
    /// Largest subcarrier/antenna/UE/codeblock id representable in a tag.
    pub const MAX_ID: usize = mask(ID_BITS) as usize;

    /// Pack a tag, rejecting fields that do not fit their width.
    pub fn try_new(kind: TagKind, frame_id: usize, symbol_id: usize, id: usize) -> DemulResult<Self> {
        check_field("frame_id", frame_id, Self::MAX_FRAME_ID)?;
        check_field("symbol_id", symbol_id, Self::MAX_SYMBOL_ID)?;
        check_field("id", id, Self::MAX_ID)?;

        Ok(Self(
            ((frame_id as u64) << FRAME_SHIFT)
                | ((symbol_id as u64) << SYMBOL_SHIFT)
                | (kind.to_bits() << KIND_SHIFT)
                | ((id as u64) << ID_SHIFT),
        ))
    }

    /// Tag for the subcarrier block starting at `sc_id`.
    ///
    /// # Panics
    ///
    /// Panics if a field exceeds its bit width.
    pub fn frm_sym_sc(frame_id: usize, symbol_id: usize, sc_id: usize) -> Self {
        Self::packed(TagKind::Subcarrier, frame_id, symbol_id, sc_id)
    }

    /// Tag for one antenna of a symbol.
    ///
    /// # Panics
    ///
    /// Panics if a field exceeds its bit width.
    pub fn frm_sym_ant(frame_id: usize, symbol_id: usize, ant_id: usize) -> Self {
        Self::packed(TagKind::Antenna, frame_id, symbol_id, ant_id)
    }

    /// Tag for one UE of a symbol.
    ///
    /// # Panics
    ///
    /// Panics if a field exceeds its bit width.
    pub fn frm_sym_ue(frame_id: usize, symbol_id: usize, ue_id: usize) -> Self {
        Self::packed(TagKind::Ue, frame_id, symbol_id, ue_id)
    }

    /// Tag for one codeblock of a symbol.
    ///
    /// # Panics
    ///
    /// Panics if a field exceeds its bit width.
    pub fn frm_sym_cb(frame_id: usize, symbol_id: usize, cb_id: usize) -> Self {
        Self::packed(TagKind::Codeblock, frame_id, symbol_id, cb_id)
    }

    fn packed(kind: TagKind, frame_id: usize, symbol_id: usize, id: usize) -> Self {
        match Self::try_new(kind, frame_id, symbol_id, id) {
            Ok(tag) => tag,
            Err(e) => panic!("{}", e),
        }
    }

    /// Reinterpret a raw tag value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The packed integer.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn frame_id(self) -> usize {
        ((self.0 >> FRAME_SHIFT) & mask(FRAME_BITS)) as usize
    }

    #[inline]
    pub fn symbol_id(self) -> usize {
        ((self.0 >> SYMBOL_SHIFT) & mask(SYMBOL_BITS)) as usize
    }

    /// Kind of the sub-id, `None` for a value no constructor produces.
    #[inline]
    pub fn kind(self) -> Option<TagKind> {
        TagKind::from_bits((self.0 >> KIND_SHIFT) & mask(KIND_BITS))
    }

    /// Raw sub-id field.
    #[inline]
    pub fn id(self) -> usize {
        ((self.0 >> ID_SHIFT) & mask(ID_BITS)) as usize
    }

    #[inline]
    pub fn sc_id(self) -> usize {
        self.id()
    }

    #[inline]
    pub fn ant_id(self) -> usize {
        self.id()
    }

    #[inline]
    pub fn ue_id(self) -> usize {
        self.id()
    }

    #[inline]
    pub fn cb_id(self) -> usize {
        self.id()
    }
}

impl std::fmt::Display for TaskTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame {} symbol {} id {}",
            self.frame_id(),
            self.symbol_id(),
            self.id()
        )
    }
}

fn check_field(field: &'static str, value: usize, max: usize) -> DemulResult<()> {
    if value > max {
        return Err(DemulError::TaskOutOfRange {
            field,
            value,
            limit: max,
        });
    }
    Ok(())
}

/// Event type delivered to the scheduler's notification queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// FFT of one antenna's symbol finished
    Fft,
    /// Channel-inversion matrices for a subcarrier block are ready
    Zf,
    /// Equalization and soft demodulation of a subcarrier block finished
    Demul,
    /// Channel decoding of a codeblock finished
    Decode,
}

/// Completion event carrying the originating task tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventData {
    pub event_type: EventType,
    pub tag: TaskTag,
}

impl EventData {
    pub fn new(event_type: EventType, tag: TaskTag) -> Self {
        Self { event_type, tag }
    }
}
