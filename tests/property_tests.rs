//! Property tests for chunking, zipping and windowing.

use proptest::prelude::*;
use sluice::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

fn chunked(items: Vec<i32>, chunk_size: usize) -> Stream<i32> {
    Stream::from_iter_with_chunk_size(items, chunk_size)
}

proptest! {
    #[test]
    fn rechunk_preserves_sequence_and_sizes(
        items in proptest::collection::vec(any::<i32>(), 0..200),
        input_chunk in 1usize..17,
        size in 1usize..17,
    ) {
        let chunks = block_on(chunked(items.clone(), input_chunk).rechunk(size).chunks().run_collect()).unwrap();
        let flat: Vec<i32> = chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        prop_assert_eq!(flat, items);
        if let Some((_, init)) = chunks.split_last() {
            prop_assert!(init.iter().all(|chunk| chunk.len() == size));
        }
        prop_assert!(chunks.iter().all(|chunk| !chunk.is_empty() && chunk.len() <= size));
    }

    #[test]
    fn zip_emits_min_and_zip_all_emits_max(
        left in proptest::collection::vec(any::<i32>(), 0..60),
        right in proptest::collection::vec(any::<i32>(), 0..60),
        left_chunk in 1usize..8,
        right_chunk in 1usize..8,
    ) {
        let zipped = block_on(
            chunked(left.clone(), left_chunk).zip(chunked(right.clone(), right_chunk)).run_collect(),
        )
        .unwrap();
        prop_assert_eq!(zipped.len(), left.len().min(right.len()));
        let expected: Vec<(i32, i32)> = left.iter().copied().zip(right.iter().copied()).collect();
        prop_assert_eq!(zipped, expected);

        let all = block_on(
            chunked(left.clone(), left_chunk)
                .zip_all(chunked(right.clone(), right_chunk), 0, 0)
                .run_collect(),
        )
        .unwrap();
        prop_assert_eq!(all.len(), left.len().max(right.len()));
    }

    #[test]
    fn sliding_window_count(
        len in 0usize..80,
        size in 1usize..10,
        step in 1usize..10,
    ) {
        let items: Vec<i32> = (0..len as i32).collect();
        let windows = block_on(chunked(items, 7).sliding(size, step).run_collect()).unwrap();
        let full = windows.iter().filter(|window| window.len() == size).count();
        if len >= size {
            let expected = (len - size) / step + 1;
            prop_assert_eq!(full, expected);
            prop_assert!(windows.len() <= expected + 1);
        } else if len > 0 {
            prop_assert_eq!(windows.len(), 1);
            prop_assert_eq!(windows[0].len(), len);
        } else {
            prop_assert!(windows.is_empty());
        }
    }
}
