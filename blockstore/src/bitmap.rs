use crate::error::{BlockStoreError, Result};

/// Allocation state of the entity a single bit tracks.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// Number of bytes needed to pack `bit_count` bits.
pub fn bytes_for(bit_count: usize) -> usize {
    bit_count / 8 + (bit_count % 8 != 0) as usize
}

/// A fixed length bit vector. Bit `i` lives in byte `i / 8` at position `i % 8`.
///
/// The storage decides ownership. `Bitmap<Vec<u8>>` owns its bytes and frees them
/// on drop, while `Bitmap<&mut [u8]>` and `Bitmap<&[u8]>` overlay a region owned by
/// someone else, in which case dropping the bitmap leaves the region untouched.
#[derive(Debug, Clone)]
pub struct Bitmap<S> {
    /// Total number of addressable bits. Padding bits in the final byte are never
    /// addressed.
    bit_count: usize,
    storage: S,
}

impl Bitmap<Vec<u8>> {
    /// Creates a bitmap with zeroed, owned storage.
    pub fn new(bit_count: usize) -> Self {
        Self {
            bit_count,
            storage: vec![0; bytes_for(bit_count)],
        }
    }
}

impl<S: AsRef<[u8]>> Bitmap<S> {
    /// Wraps an existing byte region without copying it. The region may be larger than
    /// the bitmap needs, trailing bytes are ignored.
    pub fn overlay(bit_count: usize, region: S) -> Result<Self> {
        let needed = bytes_for(bit_count);
        let available = region.as_ref().len();
        if available < needed {
            return Err(BlockStoreError::InvalidArgument(format!(
                "overlay region of {} bytes cannot hold {} bits",
                available, bit_count
            )));
        }

        Ok(Self {
            bit_count,
            storage: region,
        })
    }

    /// Wraps a region the caller already knows is large enough.
    pub(crate) fn from_region(bit_count: usize, region: S) -> Self {
        debug_assert!(region.as_ref().len() >= bytes_for(bit_count));
        Self {
            bit_count,
            storage: region,
        }
    }

    pub fn len(&self) -> usize {
        self.bit_count
    }

    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    /// The packed bytes backing the bitmap, exactly `ceil(len / 8)` of them.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage.as_ref()[..bytes_for(self.bit_count)]
    }

    fn check(&self, bit: usize) -> Result<()> {
        if bit >= self.bit_count {
            return Err(BlockStoreError::OutOfRange {
                index: bit,
                limit: self.bit_count,
            });
        }
        Ok(())
    }

    pub fn test(&self, bit: usize) -> Result<bool> {
        self.check(bit)?;
        Ok(self.as_bytes()[bit / 8] & (1 << (bit % 8)) != 0)
    }

    pub fn get(&self, bit: usize) -> Result<State> {
        match self.test(bit)? {
            true => Ok(State::Used),
            false => Ok(State::Free),
        }
    }

    /// Returns the lowest unset bit, or `None` when every bit is set.
    pub fn first_free_zero(&self) -> Option<usize> {
        self.as_bytes()
            .iter()
            .enumerate()
            // Skip saturated bytes, the lowest zero of the first unsaturated byte wins.
            .find(|&(_, &byte)| byte != u8::MAX)
            .map(|(n, byte)| n * 8 + byte.trailing_ones() as usize)
            .filter(|&bit| bit < self.bit_count)
    }

    /// Counts set bits straight from storage so that writes made through another view
    /// of an overlaid region are always reflected.
    pub fn count_set(&self) -> usize {
        let bytes = self.as_bytes();
        let tail_bits = self.bit_count % 8;
        let (full, last) = match (tail_bits, bytes.split_last()) {
            (0, _) | (_, None) => (bytes, 0),
            (_, Some((&last, full))) => (full, last & ((1 << tail_bits) - 1)),
        };

        full.iter()
            .map(|byte| byte.count_ones() as usize)
            .sum::<usize>()
            + last.count_ones() as usize
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> Bitmap<S> {
    pub fn set(&mut self, bit: usize) -> Result<()> {
        self.check(bit)?;
        self.storage.as_mut()[bit / 8] |= 1 << (bit % 8);
        Ok(())
    }

    pub fn reset(&mut self, bit: usize) -> Result<()> {
        self.check(bit)?;
        self.storage.as_mut()[bit / 8] &= !(1 << (bit % 8));
        Ok(())
    }
}
