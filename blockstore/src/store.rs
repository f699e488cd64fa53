use std::fmt;
use std::ops::Range;

use crate::bitmap::{bytes_for, Bitmap, State};
use crate::error::{BlockStoreError, Result};

use log::{debug, warn};

/// 65536 blocks of 512 bytes, a 32M store whose allocation bitmap fills the first
/// 16 blocks.
pub const DEFAULT_TOTAL_BLOCKS: usize = 65536;
pub const DEFAULT_BLOCK_SIZE_BYTES: usize = 512;
pub const DEFAULT_BITMAP_START_BLOCK: usize = 0;

/// Shape of a block store, fixed at construction. Both the in-memory buffer and the
/// persisted image are `total_blocks * block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Number of addressable blocks, valid ids range from 0 to `total_blocks - 1`.
    pub total_blocks: usize,
    /// Size of every block in bytes.
    pub block_size: usize,
    /// First of the blocks holding the allocation bitmap.
    pub bitmap_start: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            total_blocks: DEFAULT_TOTAL_BLOCKS,
            block_size: DEFAULT_BLOCK_SIZE_BYTES,
            bitmap_start: DEFAULT_BITMAP_START_BLOCK,
        }
    }
}

impl Geometry {
    /// Blocks needed to hold one bit per block.
    pub fn bitmap_blocks(&self) -> usize {
        if self.block_size == 0 {
            return 0;
        }
        let bytes = bytes_for(self.total_blocks);
        bytes / self.block_size + (bytes % self.block_size != 0) as usize
    }

    /// Block ids reserved for the bitmap.
    pub fn bitmap_range(&self) -> Range<usize> {
        self.bitmap_start..self.bitmap_start.saturating_add(self.bitmap_blocks())
    }

    /// Size of the whole block buffer in bytes.
    pub fn image_len(&self) -> usize {
        self.total_blocks * self.block_size
    }

    fn validate(&self) -> Result<()> {
        if self.total_blocks == 0 {
            return Err(BlockStoreError::InvalidGeometry(
                "store must have at least one block".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(BlockStoreError::InvalidGeometry(
                "block size must be non-zero".to_string(),
            ));
        }
        // Vec cannot hold more than isize::MAX bytes.
        let fits = self
            .total_blocks
            .checked_mul(self.block_size)
            .map_or(false, |len| len <= isize::MAX as usize);
        if !fits {
            return Err(BlockStoreError::InvalidGeometry(format!(
                "{} blocks of {} bytes overflow the address space",
                self.total_blocks, self.block_size
            )));
        }
        let bitmap_end = self.bitmap_start.checked_add(self.bitmap_blocks());
        if bitmap_end.map_or(true, |end| end > self.total_blocks) {
            return Err(BlockStoreError::InvalidGeometry(format!(
                "bitmap of {} blocks starting at block {} does not fit in {} blocks",
                self.bitmap_blocks(),
                self.bitmap_start,
                self.total_blocks
            )));
        }
        Ok(())
    }
}

/// A fixed number of equally sized blocks held in one contiguous buffer.
///
/// The allocation bitmap is not stored separately, it is a bit-indexed view over the
/// reserved range of the same buffer. Those reserved blocks are marked used when the
/// store is created so they are never handed out by [`BlockStore::allocate`].
///
/// Block ids are bounded exclusively: every operation treats `id >= total_blocks()`
/// as out of range.
///
/// Raw reads and writes do not consult the bitmap. Writing to the reserved range
/// overwrites allocator state, keeping higher level structures away from those blocks
/// is up to the caller.
pub struct BlockStore {
    pub(crate) geometry: Geometry,
    pub(crate) blocks: Vec<u8>,
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("geometry", &self.geometry)
            .field("used_blocks", &self.used_blocks())
            .finish()
    }
}

impl BlockStore {
    /// Creates a store with the default geometry.
    pub fn create() -> Result<Self> {
        BlockStoreBuilder::new().build()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn total_blocks(&self) -> usize {
        self.geometry.total_blocks
    }

    pub fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    pub fn used_blocks(&self) -> usize {
        self.bitmap().count_set()
    }

    pub fn free_blocks(&self) -> usize {
        self.total_blocks() - self.used_blocks()
    }

    /// Read-only view of the allocation bitmap.
    pub fn bitmap(&self) -> Bitmap<&[u8]> {
        let region = self.bitmap_bytes();
        Bitmap::from_region(self.total_blocks(), &self.blocks[region])
    }

    fn bitmap_mut(&mut self) -> Bitmap<&mut [u8]> {
        let region = self.bitmap_bytes();
        let bit_count = self.total_blocks();
        Bitmap::from_region(bit_count, &mut self.blocks[region])
    }

    /// Byte range of the buffer backing the bitmap.
    fn bitmap_bytes(&self) -> Range<usize> {
        let blocks = self.geometry.bitmap_range();
        blocks.start * self.block_size()..blocks.end * self.block_size()
    }

    fn block_bytes(&self, block: usize) -> Option<Range<usize>> {
        if block >= self.total_blocks() {
            return None;
        }
        let start = block * self.block_size();
        Some(start..start + self.block_size())
    }

    /// Allocates the lowest numbered free block. Block contents are left untouched.
    pub fn allocate(&mut self) -> Result<usize> {
        let total = self.total_blocks();
        let mut bitmap = self.bitmap_mut();
        let block = bitmap
            .first_free_zero()
            .filter(|&block| block < total)
            .ok_or(BlockStoreError::NoSpace)?;
        bitmap.set(block)?;

        debug!("Allocated block {}.", block);
        Ok(block)
    }

    /// Allocates one specific block.
    ///
    /// # Errors
    ///
    /// Fails when the block is out of range or already in use, reserved bitmap blocks
    /// included.
    pub fn request(&mut self, block: usize) -> Result<()> {
        let mut bitmap = self.bitmap_mut();
        if bitmap.test(block)? {
            return Err(BlockStoreError::AlreadyUsed(block));
        }
        bitmap.set(block)
    }

    /// Marks a block free. Releasing a free or out of range block does nothing.
    pub fn release(&mut self, block: usize) {
        if let Err(err) = self.bitmap_mut().reset(block) {
            debug!("Ignoring release of block {}: {}.", block, err);
        }
    }

    pub fn block_state(&self, block: usize) -> Result<State> {
        self.bitmap().get(block)
    }

    /// Copies one block into `buf`, returning the number of bytes copied.
    ///
    /// Returns 0 when the block is out of range or `buf` is shorter than a block.
    /// The allocation state of the block is not checked.
    #[must_use]
    pub fn read(&self, block: usize, buf: &mut [u8]) -> usize {
        let range = match self.block_bytes(block) {
            Some(range) if buf.len() >= self.block_size() => range,
            _ => {
                warn!(
                    "Rejected read of block {} into {} byte buffer.",
                    block,
                    buf.len()
                );
                return 0;
            }
        };

        buf[..self.block_size()].copy_from_slice(&self.blocks[range]);
        self.block_size()
    }

    /// Copies the first block-size bytes of `buf` into one block, returning the number
    /// of bytes copied.
    ///
    /// Returns 0 when the block is out of range or `buf` is shorter than a block.
    /// The allocation state of the block is not checked.
    #[must_use]
    pub fn write(&mut self, block: usize, buf: &[u8]) -> usize {
        let block_size = self.block_size();
        let range = match self.block_bytes(block) {
            Some(range) if buf.len() >= block_size => range,
            _ => {
                warn!(
                    "Rejected write of {} byte buffer to block {}.",
                    buf.len(),
                    block
                );
                return 0;
            }
        };

        self.blocks[range].copy_from_slice(&buf[..block_size]);
        block_size
    }
}

/// Configures the geometry of a new [`BlockStore`].
///
/// ```
/// use blockstore::BlockStoreBuilder;
///
/// let store = BlockStoreBuilder::new()
///     .with_total_blocks(1024)
///     .with_block_size(64)
///     .build()
///     .unwrap();
/// assert_eq!(store.used_blocks(), 2);
/// ```
#[derive(Debug, Default)]
pub struct BlockStoreBuilder {
    geometry: Geometry,
}

impl From<Geometry> for BlockStoreBuilder {
    fn from(geometry: Geometry) -> Self {
        BlockStoreBuilder { geometry }
    }
}

impl BlockStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total_blocks(mut self, blocks: usize) -> Self {
        self.geometry.total_blocks = blocks;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.geometry.block_size = bytes;
        self
    }

    pub fn with_bitmap_start(mut self, block: usize) -> Self {
        self.geometry.bitmap_start = block;
        self
    }

    /// Builds a zeroed store and marks the bitmap blocks as used.
    ///
    /// # Errors
    ///
    /// Fails on an invalid geometry, when the block buffer cannot be reserved or if a
    /// reserved block cannot be marked.
    pub fn build(self) -> Result<BlockStore> {
        let geometry = self.geometry;
        geometry.validate()?;

        let len = geometry.image_len();
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(len)
            .map_err(|_| BlockStoreError::AllocationFailed(len))?;
        blocks.resize(len, 0);

        let mut store = BlockStore { geometry, blocks };
        // Reserve the bitmap's own blocks the same way any other block is claimed.
        for block in geometry.bitmap_range() {
            store.request(block)?;
        }

        debug!(
            "Created block store of {} blocks x {} bytes, bitmap in blocks {:?}.",
            geometry.total_blocks,
            geometry.block_size,
            geometry.bitmap_range()
        );
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> BlockStore {
        // 64 blocks need 8 bitmap bytes, a single 16 byte block.
        BlockStoreBuilder::new()
            .with_total_blocks(64)
            .with_block_size(16)
            .with_bitmap_start(2)
            .build()
            .expect("Could not create block store.")
    }

    #[test]
    fn default_geometry_reserves_sixteen_blocks() {
        let geometry = Geometry::default();
        assert_eq!(geometry.bitmap_blocks(), 16);
        assert_eq!(geometry.bitmap_range(), 0..16);

        let store = BlockStore::create().unwrap();
        assert_eq!(store.total_blocks(), 65536);
        assert_eq!(store.used_blocks(), 16);
        assert_eq!(store.free_blocks(), 65520);
    }

    #[test]
    fn bitmap_blocks_round_up() {
        let geometry = Geometry {
            total_blocks: 100,
            block_size: 4,
            bitmap_start: 0,
        };
        // 100 bits need 13 bytes, spread over four 4 byte blocks.
        assert_eq!(geometry.bitmap_blocks(), 4);
    }

    #[test]
    fn invalid_geometries_are_rejected() {
        let zero_blocks = BlockStoreBuilder::new().with_total_blocks(0).build();
        assert!(matches!(
            zero_blocks,
            Err(BlockStoreError::InvalidGeometry(_))
        ));

        let zero_size = BlockStoreBuilder::new().with_block_size(0).build();
        assert!(matches!(zero_size, Err(BlockStoreError::InvalidGeometry(_))));

        let bitmap_past_end = BlockStoreBuilder::new()
            .with_total_blocks(64)
            .with_block_size(16)
            .with_bitmap_start(64)
            .build();
        assert!(matches!(
            bitmap_past_end,
            Err(BlockStoreError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn oversized_geometry_is_rejected_without_panicking() {
        let result = BlockStoreBuilder::from(Geometry {
            total_blocks: usize::MAX,
            block_size: 1,
            bitmap_start: 0,
        })
        .build();

        assert!(matches!(result, Err(BlockStoreError::InvalidGeometry(_))));
        assert_eq!(
            Geometry {
                total_blocks: usize::MAX,
                block_size: 1,
                bitmap_start: 0,
            }
            .bitmap_blocks(),
            usize::MAX / 8 + 1
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn unobtainable_buffer_reports_allocation_failure() {
        // 2^60 bytes is a valid geometry no machine can back.
        let result = BlockStoreBuilder::new()
            .with_total_blocks(1 << 40)
            .with_block_size(1 << 20)
            .build();

        assert!(matches!(
            result,
            Err(BlockStoreError::AllocationFailed(len)) if len == 1 << 60
        ));
    }

    #[test]
    fn reserved_blocks_are_marked_used() {
        let store = create_test_store();

        assert_eq!(store.used_blocks(), 1);
        assert_eq!(store.block_state(2).unwrap(), State::Used);
        assert_eq!(store.block_state(0).unwrap(), State::Free);
        // Bit 2 of the first bitmap byte lives at the start of block 2.
        assert_eq!(store.blocks[32], 0b0000_0100);
    }

    #[test]
    fn allocate_skips_reserved_blocks() {
        let mut store = create_test_store();

        assert_eq!(store.allocate().unwrap(), 0);
        assert_eq!(store.allocate().unwrap(), 1);
        assert_eq!(store.allocate().unwrap(), 3);
    }

    #[test]
    fn allocate_reports_no_space_when_full() {
        let mut store = create_test_store();
        for _ in 0..63 {
            store.allocate().unwrap();
        }

        assert_eq!(store.free_blocks(), 0);
        assert!(matches!(store.allocate(), Err(BlockStoreError::NoSpace)));
    }

    #[test]
    fn allocate_does_not_touch_contents() {
        let mut store = create_test_store();
        assert_eq!(store.write(0, &[0x55; 16]), 16);

        assert_eq!(store.allocate().unwrap(), 0);

        let mut buf = [0; 16];
        assert_eq!(store.read(0, &mut buf), 16);
        assert_eq!(buf, [0x55; 16]);
    }

    #[test]
    fn request_conflicts_and_bounds() {
        let mut store = create_test_store();

        store.request(63).unwrap();
        assert!(matches!(
            store.request(63),
            Err(BlockStoreError::AlreadyUsed(63))
        ));
        assert!(matches!(
            store.request(2),
            Err(BlockStoreError::AlreadyUsed(2))
        ));
        assert!(matches!(
            store.request(64),
            Err(BlockStoreError::OutOfRange { index: 64, limit: 64 })
        ));
    }

    #[test]
    fn release_is_idempotent_and_ignores_out_of_range() {
        let mut store = create_test_store();
        let block = store.allocate().unwrap();
        assert_eq!(store.used_blocks(), 2);

        store.release(block);
        store.release(block);
        store.release(64);
        store.release(usize::MAX);

        assert_eq!(store.used_blocks(), 1);
        store.request(block).unwrap();
    }

    #[test]
    fn read_and_write_check_bounds_and_buffer_size() {
        let mut store = create_test_store();
        let mut buf = [0; 16];

        assert_eq!(store.write(63, &[0xaa; 16]), 16);
        assert_eq!(store.read(63, &mut buf), 16);
        assert_eq!(buf, [0xaa; 16]);

        assert_eq!(store.write(64, &[0xaa; 16]), 0);
        assert_eq!(store.read(64, &mut buf), 0);

        assert_eq!(store.write(5, &[0xbb; 15]), 0);
        assert_eq!(store.read(5, &mut [0; 15]), 0);
    }

    #[test]
    fn oversized_buffers_transfer_one_block() {
        let mut store = create_test_store();
        let mut data = vec![0x11; 16];
        data.extend_from_slice(&[0x22; 16]);

        assert_eq!(store.write(10, &data), 16);
        assert_eq!(store.blocks[11 * 16], 0);

        let mut out = vec![0xff; 20];
        assert_eq!(store.read(10, &mut out), 16);
        assert_eq!(&out[..16], &[0x11; 16]);
        assert_eq!(&out[16..], &[0xff; 4]);
    }

    #[test]
    fn writes_to_bitmap_blocks_change_allocation_state() {
        let mut store = create_test_store();

        assert_eq!(store.write(2, &[0xff; 16]), 16);

        assert_eq!(store.used_blocks(), 64);
        assert!(matches!(store.allocate(), Err(BlockStoreError::NoSpace)));
    }
}
