//! Property tests for chunked fan-out.
//!
//! Uses proptest to verify:
//! 1. Chunks cover every item within the worker budget
//! 2. map_chunks maps each item exactly once, for any budget
//! 3. Strided buffers rebuild one row per stride

use proptest::prelude::*;
use tickcache_sync::mapreduce::{chunk_size, from_strided, map_chunks};

proptest! {
    #[test]
    fn chunks_cover_items_within_budget(count in 0usize..5_000, budget in 1usize..64) {
        let size = chunk_size(count, budget);
        prop_assert!(size >= 1);
        prop_assert!(size * budget >= count);
        prop_assert!(count.div_ceil(size) <= budget);
    }

    #[test]
    fn each_item_is_mapped_once(items in prop::collection::vec(0u32..1_000, 0..300), budget in 1usize..16) {
        let mut mapped = map_chunks(&items, budget, |item, out: &mut Vec<u32>| out.push(*item)).unwrap();
        let mut expected = items.clone();
        mapped.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(mapped, expected);
    }

    #[test]
    fn strided_rows_match_buffer(rows in 1usize..50, stride in 1usize..6) {
        let columns: Vec<String> = (0..stride).map(|i| format!("c{i}")).collect();
        let names: Vec<&str> = columns.iter().map(String::as_str).collect();
        let buffer: Vec<f64> = (0..rows * stride).map(|v| v as f64).collect();
        let frame = from_strided(&buffer, &names).unwrap().unwrap();
        prop_assert_eq!(frame.height(), rows);
        prop_assert_eq!(frame.width(), stride);
    }
}
