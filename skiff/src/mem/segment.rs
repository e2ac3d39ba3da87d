use core::fmt;

use super::MemoryError;

/// Bits of a virtual address taken up by the in-segment offset.
const OFFSET_BITS: u16 = 12;
const OFFSET_MASK: u16 = (1 << OFFSET_BITS) - 1;

const SELECTOR_CODE: u16 = 0x3;
const SELECTOR_HEAP: u16 = 0x4;

/// The segment types a virtual-address selector may name.
///
/// Selector values aliasing the reserved operating-system region, and all
/// other unassigned values, decode to an error rather than a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Code,
    Heap,
}

impl Segment {
    /// Splits a virtual address into its segment and 12-bit offset.
    pub fn decode(addr: u16) -> Result<(Segment, u16), MemoryError> {
        let selector = addr >> OFFSET_BITS;
        let offset = addr & OFFSET_MASK;
        let segment = match selector {
            SELECTOR_CODE => Segment::Code,
            SELECTOR_HEAP => Segment::Heap,
            _ => return Err(MemoryError::InvalidSelector(selector)),
        };
        Ok((segment, offset))
    }

    /// The virtual address of the segment's first word (offset zero).
    pub const fn origin(&self) -> u16 {
        match self {
            Segment::Code => SELECTOR_CODE << OFFSET_BITS,
            Segment::Heap => SELECTOR_HEAP << OFFSET_BITS,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Code => write!(f, "code"),
            Segment::Heap => write!(f, "heap"),
        }
    }
}

/// One process's view of a segment: the physical base of its storage and
/// the inclusive offset bound the segmentation unit enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentWindow {
    pub base: u16,
    pub bound: u16,
}

impl SegmentWindow {
    pub const fn new(base: u16, bound: u16) -> Self {
        Self { base, bound }
    }

    /// Resolves an in-segment offset to a physical index, enforcing the
    /// inclusive bound check.
    pub fn resolve(&self, segment: Segment, offset: u16) -> Result<usize, MemoryError> {
        if offset > self.bound {
            Err(MemoryError::SegmentBound {
                segment,
                offset,
                bound: self.bound,
            })
        } else {
            Ok(self.base as usize + offset as usize)
        }
    }
}
