//! A fixed capacity block store.
//!
//! The store is a flat array of equally sized blocks. Which blocks are in use is
//! tracked by a bitmap that lives inside the very blocks it describes, so persisting
//! the blocks persists the allocator along with them.
//!
//! # Layout
//! ```text
//! ========================================================================
//! | Blocks 0..bitmap_start | Bitmap (bitmap_blocks) | Remaining blocks  |
//! ========================================================================
//! ```
pub mod bitmap;
mod error;
mod persist;
mod store;

pub use crate::bitmap::{Bitmap, State};
pub use crate::error::{BlockStoreError, Result};
pub use crate::store::{
    BlockStore, BlockStoreBuilder, Geometry, DEFAULT_BITMAP_START_BLOCK,
    DEFAULT_BLOCK_SIZE_BYTES, DEFAULT_TOTAL_BLOCKS,
};
