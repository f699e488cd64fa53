//! Whole-store persistence.
//!
//! An image is the raw block buffer in block order, `total_blocks * block_size`
//! bytes with no header. The allocation bitmap lives inside the buffer, so writing
//! the blocks writes the allocator state and reading them back restores it.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::error::{BlockStoreError, Result};
use crate::store::{BlockStore, BlockStoreBuilder, Geometry};

impl BlockStore {
    /// Writes the full image to `writer`, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&self.blocks)?;
        writer.flush()?;
        Ok(self.blocks.len())
    }

    /// Writes the full image to a new or truncated file at `path`.
    ///
    /// An interrupted write leaves a partial file behind, see [`BlockStore::persist`]
    /// for an atomic replacement.
    pub fn serialize<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = check_path(path.as_ref())?;
        let file = File::create(path)?;
        let written = self.write_to(&file)?;

        debug!("Serialized {} bytes to {}.", written, path.display());
        Ok(written)
    }

    /// Atomically replaces the file at `path` with the full image. The image is
    /// written and synced to a temporary file in the same directory, which is then
    /// renamed over `path`.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = check_path(path.as_ref())?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut staged = NamedTempFile::new_in(dir)?;
        let written = self.write_to(&mut staged)?;
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|err| err.error)?;

        debug!("Persisted {} bytes to {}.", written, path.display());
        Ok(written)
    }

    /// Restores a store with the default geometry from the image at `path`.
    pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::deserialize_with(Geometry::default(), path)
    }

    /// Restores a store of the given geometry from the image at `path`.
    pub fn deserialize_with<P: AsRef<Path>>(geometry: Geometry, path: P) -> Result<Self> {
        let path = check_path(path.as_ref())?;
        let file = File::open(path)?;
        let store = Self::read_from(geometry, file)?;

        debug!(
            "Deserialized {} bytes from {}, {} blocks in use.",
            store.blocks.len(),
            path.display(),
            store.used_blocks()
        );
        Ok(store)
    }

    /// Restores a store from an image read from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockStoreError::ShortRead`] if the reader runs out before a full
    /// image has been read. Bytes past the end of the image are ignored.
    pub fn read_from<R: Read>(geometry: Geometry, mut reader: R) -> Result<Self> {
        // Start from a fresh store so the bitmap view lines up with the new buffer.
        let mut store = BlockStoreBuilder::from(geometry).build()?;

        let expected = store.blocks.len();
        let actual = fill(&mut reader, &mut store.blocks)?;
        if actual < expected {
            return Err(BlockStoreError::ShortRead { expected, actual });
        }

        let mut probe = [0u8; 1];
        if fill(&mut reader, &mut probe)? > 0 {
            warn!("Ignoring trailing bytes after {} byte image.", expected);
        }

        // The bitmap bytes just read are the allocator state, flag but keep them.
        let bitmap = store.bitmap();
        for block in geometry.bitmap_range() {
            if let Ok(false) = bitmap.test(block) {
                warn!("Image has bitmap block {} marked free.", block);
            }
        }
        Ok(store)
    }
}

fn check_path(path: &Path) -> Result<&Path> {
    if path.as_os_str().is_empty() {
        return Err(BlockStoreError::InvalidArgument(
            "image path must not be empty".to_string(),
        ));
    }
    Ok(path)
}

/// Reads until `buf` is full or the reader is exhausted, returning the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
