use std::env;

use blockstore::{BlockStore, BlockStoreError};

pub fn main() -> blockstore::Result<()> {
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "blockstore.img".to_string());

    let mut store = BlockStore::create()?;
    let block = store.allocate()?;
    let mut payload = vec![0; store.block_size()];
    payload[..5].copy_from_slice(b"hello");
    if store.write(block, &payload) == 0 {
        return Err(BlockStoreError::InvalidArgument(format!(
            "could not write block {}",
            block
        )));
    }
    store.persist(&path)?;

    let restored = BlockStore::deserialize(&path)?;
    let mut buf = vec![0; restored.block_size()];
    if restored.read(block, &mut buf) == 0 {
        return Err(BlockStoreError::InvalidArgument(format!(
            "could not read block {}",
            block
        )));
    }
    println!(
        "block {} -> {:?}, {} of {} blocks used",
        block,
        String::from_utf8_lossy(&buf[..5]),
        restored.used_blocks(),
        restored.total_blocks()
    );
    Ok(())
}
