use serde::{Deserialize, Serialize};

/// XOR swizzle over linear element offsets.
///
/// Takes the `bits` bits starting at `base + shift` and XORs them into the
/// `bits` bits starting at `base`:
///
/// ```text
///   offset:  ....[ yyy ][ shift-bits ][ zzz ][ base-bits ]
///   result:  ....[ yyy ][ shift-bits ][zzz^yyy][ base-bits ]
/// ```
///
/// With `base` chosen so that `2^base` elements are one 16-byte chunk and
/// `shift = 3` (8 chunks = one 128-byte bank line), consecutive rows land
/// their chunks in different banks. The high bits are untouched, so the
/// map is its own inverse and a bijection on any block of `2^(base+shift+bits)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Swizzle {
    pub bits: u32,
    pub base: u32,
    pub shift: u32,
}

/// Bytes in one swizzle chunk; every hardware mode permutes 16-byte units.
pub const CHUNK_BYTES: u32 = 16;

impl Swizzle {
    pub fn new(bits: u32, base: u32, shift: u32) -> Self {
        Self { bits, base, shift }
    }

    /// The 32/64/128-byte swizzle mode for an element size, if expressible.
    pub fn for_bytes(swizzle_bytes: u32, elem_bytes: u32) -> Option<Self> {
        let bits = match swizzle_bytes {
            32 => 1,
            64 => 2,
            128 => 3,
            _ => return None,
        };
        if elem_bytes == 0 || elem_bytes > CHUNK_BYTES || !elem_bytes.is_power_of_two() {
            return None;
        }
        let base = (CHUNK_BYTES / elem_bytes).trailing_zeros();
        Some(Self::new(bits, base, 3))
    }

    /// Source and target bit fields must not overlap.
    pub fn is_well_formed(&self) -> bool {
        self.bits >= 1 && self.shift >= self.bits && self.base + self.shift + self.bits < 63
    }

    pub fn apply(&self, offset: u64) -> u64 {
        let mask = ((1u64 << self.bits) - 1) << (self.base + self.shift);
        offset ^ ((offset & mask) >> self.shift)
    }

    /// Only the bits below `base + bits` change, so offsets never leave
    /// their aligned block of this many elements.
    pub fn period(&self) -> u64 {
        1u64 << (self.base + self.bits)
    }

    /// Swizzle width in bytes (32, 64 or 128 for hardware modes).
    pub fn width_bytes(&self, elem_bytes: u32) -> u32 {
        (1u32 << (self.base + self.bits)) * elem_bytes
    }

    /// Elements that stay contiguous under the swizzle.
    pub fn chunk_elems(&self) -> u32 {
        1 << self.base
    }

    /// True when this is one of the modes a tensor-memory copy engine
    /// writes natively (16-byte chunks, 32/64/128-byte width).
    pub fn is_hardware_mode(&self, elem_bytes: u32) -> bool {
        self.shift == 3
            && (1..=3).contains(&self.bits)
            && self.chunk_elems() * elem_bytes == CHUNK_BYTES
    }
}
