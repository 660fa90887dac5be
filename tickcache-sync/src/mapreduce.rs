//! Chunked fan-out over a private worker pool.
//!
//! Items are split into contiguous chunks of `ceil(count / worker_budget)`.
//! Each chunk runs as one task that fills its own result table; tables are
//! collected in completion order and concatenated. A chunk's table is dropped
//! by its task on every path, so nothing outlives the call.

use crate::error::SyncError;
use polars::prelude::*;
use std::sync::mpsc;
use tracing::debug;

/// Size of each contiguous chunk for `count` items and `worker_budget` workers.
pub fn chunk_size(count: usize, worker_budget: usize) -> usize {
    count.div_ceil(worker_budget.max(1)).max(1)
}

fn pool(workers: usize) -> Result<rayon::ThreadPool, SyncError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("tickcache-chunk-{i}"))
        .build()
        .map_err(|e| SyncError::Pool(e.to_string()))
}

/// Run `f(item, &mut table)` for every item, one task per chunk, and return
/// the concatenated tables in chunk completion order.
pub fn map_chunks<T, R, F>(items: &[T], worker_budget: usize, f: F) -> Result<Vec<R>, SyncError>
where
    T: Sync,
    R: Send,
    F: Fn(&T, &mut Vec<R>) + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let size = chunk_size(items.len(), worker_budget);
    let chunks: Vec<&[T]> = items.chunks(size).collect();
    let pool = pool(chunks.len())?;
    let (tx, rx) = mpsc::channel::<(usize, Vec<R>)>();
    let f = &f;
    pool.scope(|scope| {
        for (index, chunk) in chunks.iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let mut table = Vec::new();
                for item in chunk.iter() {
                    f(item, &mut table);
                }
                // The receiver outlives the scope; a send cannot fail here.
                let _ = tx.send((index, table));
            });
        }
    });
    drop(tx);

    let mut out = Vec::new();
    for (index, table) in rx {
        debug!(chunk = index, rows = table.len(), "chunk complete");
        out.extend(table);
    }
    Ok(out)
}

/// Numeric variant: each item appends whole rows of `columns.len()` f64
/// values to its chunk's flat buffer. The concatenated buffer is rebuilt into
/// a table by its row stride.
pub fn binary_map_reduce<T, F>(
    items: &[T],
    worker_budget: usize,
    columns: &[&str],
    f: F,
) -> Result<Option<DataFrame>, SyncError>
where
    T: Sync,
    F: Fn(&T, &mut Vec<f64>) + Sync,
{
    let buffer = map_chunks(items, worker_budget, |item, out: &mut Vec<f64>| f(item, out))?;
    from_strided(&buffer, columns)
}

/// Rebuild a row-major f64 buffer into named columns.
pub fn from_strided(buffer: &[f64], columns: &[&str]) -> Result<Option<DataFrame>, SyncError> {
    let stride = columns.len();
    if buffer.is_empty() || stride == 0 {
        return Ok(None);
    }
    if buffer.len() % stride != 0 {
        return Err(SyncError::Stride {
            len: buffer.len(),
            stride,
        });
    }
    let series: Vec<Column> = columns
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let values: Vec<f64> = buffer.iter().skip(j).step_by(stride).copied().collect();
            Column::new((*name).into(), values)
        })
        .collect();
    DataFrame::new(series)
        .map(Some)
        .map_err(|e| SyncError::Table(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_cover_every_item() {
        assert_eq!(chunk_size(10, 4), 3);
        assert_eq!(chunk_size(8, 4), 2);
        assert_eq!(chunk_size(3, 8), 1);
        assert_eq!(chunk_size(0, 8), 1);
    }

    #[test]
    fn every_item_is_mapped_once() {
        let items: Vec<u32> = (0..103).collect();
        let mut out = map_chunks(&items, 8, |item, table: &mut Vec<u32>| {
            if item % 2 == 0 {
                table.push(item * 10);
            }
        })
        .unwrap();
        out.sort();
        assert_eq!(out.len(), 52);
        assert_eq!(out[1], 20);
    }

    #[test]
    fn empty_results_are_none() {
        let items = [1, 2, 3];
        let frame = binary_map_reduce(&items, 2, &["a", "b"], |_, _| {}).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn binary_rows_are_rebuilt_by_stride() {
        let items = [1.0, 2.0, 3.0];
        let frame = binary_map_reduce(&items, 3, &["x", "square"], |x, out| {
            out.extend([*x, x * x]);
        })
        .unwrap()
        .unwrap();
        assert_eq!(frame.height(), 3);
        let mut squares: Vec<f64> = frame
            .column("square")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        squares.sort_by(f64::total_cmp);
        assert_eq!(squares, [1.0, 4.0, 9.0]);
    }

    #[test]
    fn ragged_buffer_is_rejected() {
        assert!(matches!(from_strided(&[1.0, 2.0, 3.0], &["a", "b"]), Err(SyncError::Stride { .. })));
    }
}
