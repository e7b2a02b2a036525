use bitvec::prelude::*;

// Use the BEP 3 wire format's bit layout for faster conversion.
pub type Bitfield = BitVec<u8, Msb0>;

/// Returns true if any piece in `range` is set.
pub fn any_in(bitfield: &Bitfield, range: std::ops::Range<usize>) -> bool {
    let end = range.end.min(bitfield.len());
    let start = range.start.min(end);
    bitfield[start..end].any()
}
