//! Binary heap merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;

use crate::chunk::ChunkId;

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// Each input is identified by a [`ChunkId`]. Equal items are yielded from the input with the lower id first.
/// The merger stops after yielding the first input error.
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: Iterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<(T, ChunkId, usize)>>,
    chunks: Vec<C>,
    ids: Vec<ChunkId>,
    initiated: bool,
    failed: bool,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: Iterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Identified chunks to be merged in a single sorted one
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = (ChunkId, S)>,
        S: IntoIterator<IntoIter = C>,
    {
        let (ids, chunks): (Vec<ChunkId>, Vec<C>) =
            chunks.into_iter().map(|(id, chunk)| (id, chunk.into_iter())).unzip();
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            ids,
            items,
            initiated: false,
            failed: false,
        };
    }

    /// Number of merged inputs.
    pub fn fan_in(&self) -> usize {
        self.chunks.len()
    }

    fn pull(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.chunks[idx].next() {
            self.items.push(Reverse((item?, self.ids[idx], idx)));
        }
        return Ok(());
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.chunks.len() {
                if let Err(err) = self.pull(idx) {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }

        let Reverse((result, _, idx)) = self.items.pop()?;
        if let Err(err) = self.pull(idx) {
            self.failed = true;
            return Some(Err(err));
        }

        return Some(Ok(result));
    }
}

#[cfg(test)]
mod test {
    use rstest::*;
    use std::cmp::Ordering;
    use std::error::Error;
    use std::io::{self, ErrorKind};

    use super::BinaryHeapMerger;
    use crate::chunk::ChunkId;

    fn identified<T>(chunks: Vec<T>) -> impl Iterator<Item = (ChunkId, T)> {
        chunks
            .into_iter()
            .enumerate()
            .map(|(idx, chunk)| (ChunkId::from(idx as u64 + 1), chunk))
    }

    #[rstest]
    #[case(
        vec![],
        vec![],
    )]
    #[case(
        vec![
            vec![],
            vec![]
        ],
        vec![],
    )]
    #[case(
        vec![
            vec![Ok(4), Ok(5), Ok(7)],
            vec![Ok(1), Ok(6)],
            vec![Ok(3)],
            vec![],
        ],
        vec![Ok(1), Ok(3), Ok(4), Ok(5), Ok(6), Ok(7)],
    )]
    #[case(
        vec![
            vec![Ok(3), Ok(3), Ok(5)],
            vec![Ok(1), Ok(2), Ok(4)],
        ],
        vec![Ok(1), Ok(2), Ok(3), Ok(3), Ok(4), Ok(5)],
    )]
    #[case(
        vec![
            vec![Ok(1), Ok(2), Ok(3)],
        ],
        vec![Ok(1), Ok(2), Ok(3)],
    )]
    #[case(
        vec![
            vec![Result::Err(io::Error::new(ErrorKind::Other, "test error"))]
        ],
        vec![
            Result::Err(io::Error::new(ErrorKind::Other, "test error"))
        ],
    )]
    #[case(
        vec![
            vec![Ok(3), Result::Err(io::Error::new(ErrorKind::Other, "test error")), Ok(4)],
            vec![Ok(1), Ok(2)],
        ],
        vec![
            Ok(1),
            Ok(2),
            Result::Err(io::Error::new(ErrorKind::Other, "test error")),
        ],
    )]
    fn test_merger(
        #[case] chunks: Vec<Vec<Result<i32, io::Error>>>,
        #[case] expected_result: Vec<Result<i32, io::Error>>,
    ) {
        let merger = BinaryHeapMerger::new(identified(chunks));
        let actual_result = merger.collect();
        assert!(
            compare_vectors_of_result::<_, io::Error>(&actual_result, &expected_result),
            "actual={:?}, expected={:?}",
            actual_result,
            expected_result
        );
    }

    /// Value tagged with its source. Ordering ignores the tag.
    #[derive(Debug, Clone, Copy)]
    struct Tagged {
        value: u64,
        source: char,
    }

    impl PartialEq for Tagged {
        fn eq(&self, other: &Self) -> bool {
            self.value == other.value
        }
    }

    impl Eq for Tagged {}

    impl PartialOrd for Tagged {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Tagged {
        fn cmp(&self, other: &Self) -> Ordering {
            self.value.cmp(&other.value)
        }
    }

    #[test]
    fn test_merger_tie_break_by_chunk_id() {
        let tagged = |source: char, values: &[u64]| -> Vec<Result<Tagged, io::Error>> {
            values.iter().map(|&value| Ok(Tagged { value, source })).collect()
        };

        // inputs listed out of id order to make sure ids, not positions, break ties
        let chunks = vec![
            (ChunkId::from(3), tagged('c', &[1, 2, 2])),
            (ChunkId::from(1), tagged('a', &[2, 2, 3])),
            (ChunkId::from(2), tagged('b', &[1, 2])),
        ];

        let merger = BinaryHeapMerger::new(chunks);
        assert_eq!(merger.fan_in(), 3);

        let actual: Vec<(u64, char)> = merger.map(|item| item.unwrap()).map(|t| (t.value, t.source)).collect();
        let expected = vec![
            (1, 'b'),
            (1, 'c'),
            (2, 'a'),
            (2, 'a'),
            (2, 'b'),
            (2, 'c'),
            (2, 'c'),
            (3, 'a'),
        ];

        assert_eq!(actual, expected);
    }

    fn compare_vectors_of_result<T: PartialEq, E: Error + 'static>(
        actual: &Vec<Result<T, E>>,
        expected: &Vec<Result<T, E>>,
    ) -> bool {
        actual.len() == expected.len()
            && actual
                .into_iter()
                .zip(expected)
                .all(
                    |(actual_result, expected_result)| match (actual_result, expected_result) {
                        (Ok(actual_result), Ok(expected_result)) if actual_result == expected_result => true,
                        (Err(actual_err), Err(expected_err)) => actual_err.to_string() == expected_err.to_string(),
                        _ => false,
                    },
                )
    }
}
