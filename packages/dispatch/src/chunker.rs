//! Fixed-size partitioning of the item list.

use chirps_cog_pipeline_models::{Chunk, WorkItem};

/// Errors from chunking.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    /// A chunk size of zero cannot partition anything.
    #[error("Chunk size must be greater than zero")]
    ZeroSize,
}

/// Splits `items` into consecutive chunks of `size` items; the last chunk
/// may be smaller. Order is preserved and chunk indices start at 0.
///
/// Empty input yields no chunks.
///
/// # Errors
///
/// Returns [`ChunkError::ZeroSize`] if `size` is zero.
pub fn chunk(items: &[WorkItem], size: usize) -> Result<Vec<Chunk>, ChunkError> {
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }

    Ok(items
        .chunks(size)
        .enumerate()
        .map(|(index, items)| Chunk {
            index,
            items: items.to_vec(),
        })
        .collect())
}
