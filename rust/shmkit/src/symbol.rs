//! Densely packed arrays of fixed-width integers.

/// `len` symbols of `BITS` bits each, packed back to back with no padding.
///
/// Bits are stored least-significant first: symbol `i` occupies bits
/// `i * BITS .. (i + 1) * BITS` of the byte buffer, counting from bit 0 of
/// byte 0. A symbol may start in the middle of a byte and straddle any number
/// of byte boundaries.
#[derive(Clone, PartialEq, Eq)]
pub struct SymbolArray<const BITS: usize> {
    bytes: Vec<u8>,
    len: usize,
}

impl<const BITS: usize> SymbolArray<BITS> {
    const WIDTH_OK: () = assert!(BITS >= 1 && BITS <= 64, "symbol width must be 1..=64 bits");

    /// Largest value a symbol can hold.
    pub const MAX_VALUE: u64 = if BITS >= 64 {
        u64::MAX
    } else {
        (1u64 << BITS) - 1
    };

    /// `len` symbols, all zero.
    pub fn new(len: usize) -> Self {
        let () = Self::WIDTH_OK;
        Self {
            bytes: vec![0; Self::bytes_for(len)],
            len,
        }
    }

    /// `len` symbols, all set to `value`.
    pub fn with_value(len: usize, value: u64) -> Self {
        let mut array = Self::new(len);
        array.fill(value);
        array
    }

    /// Bytes needed to store `len` symbols.
    pub const fn bytes_for(len: usize) -> usize {
        (len * BITS).div_ceil(8)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Read symbol `index`.
    pub fn get(&self, index: usize) -> u64 {
        assert!(
            index < self.len,
            "symbol index {} out of bounds for {} symbols",
            index,
            self.len
        );

        let mut value = 0u64;
        let mut done = 0;
        let mut bit = index * BITS;
        while done < BITS {
            let shift = bit % 8;
            let take = (8 - shift).min(BITS - done);
            let chunk = (self.bytes[bit / 8] >> shift) & low_mask(take);
            value |= (chunk as u64) << done;
            done += take;
            bit += take;
        }
        value
    }

    /// Overwrite symbol `index` with `value`, leaving its neighbours intact.
    pub fn set(&mut self, index: usize, value: u64) {
        assert!(
            index < self.len,
            "symbol index {} out of bounds for {} symbols",
            index,
            self.len
        );
        assert!(
            value <= Self::MAX_VALUE,
            "value {} does not fit in {} bits",
            value,
            BITS
        );

        let mut done = 0;
        let mut bit = index * BITS;
        while done < BITS {
            let shift = bit % 8;
            let take = (8 - shift).min(BITS - done);
            let mask = low_mask(take) << shift;
            let chunk = (((value >> done) as u8) & low_mask(take)) << shift;
            let byte = &mut self.bytes[bit / 8];
            *byte = (*byte & !mask) | chunk;
            done += take;
            bit += take;
        }
    }

    /// Set every symbol to `value`.
    pub fn fill(&mut self, value: u64) {
        for index in 0..self.len {
            self.set(index, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(|index| self.get(index))
    }
}

impl<const BITS: usize> std::fmt::Debug for SymbolArray<BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[inline]
fn low_mask(bits: usize) -> u8 {
    if bits >= 8 { 0xff } else { (1u8 << bits) - 1 }
}
