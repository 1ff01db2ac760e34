//! Splitting batches into contiguous chunks and merging chunk results back.

/// Partition `batch` into contiguous chunks of at most `chunk_size` items.
///
/// All chunks have exactly `chunk_size` items except possibly the last one.
/// A zero `chunk_size` is treated as one.
pub fn split_into_chunks<T>(batch: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(batch.len().div_ceil(chunk_size));
    let mut items = batch.into_iter().peekable();

    while items.peek().is_some() {
        chunks.push(items.by_ref().take(chunk_size).collect());
    }

    chunks
}

/// Concatenate per-chunk results in chunk order.
pub fn merge_chunks<T>(chunks: Vec<Vec<T>>) -> Vec<T> {
    let total = chunks.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    for chunk in chunks {
        merged.extend(chunk);
    }
    merged
}
