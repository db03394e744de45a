use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use async_trait::async_trait;

use crate::comparator::{cmp_internal, ComparatorRef};
use crate::error::BasaltError;
use crate::iter::EntryIterator;
use crate::types::RowEntry;

struct MergeIteratorHeapEntry<'a> {
    next_kv: RowEntry,
    index: usize,
    comparator: ComparatorRef,
    iterator: Box<dyn EntryIterator + 'a>,
}

impl<'a> MergeIteratorHeapEntry<'a> {
    /// Seek the iterator and return a new heap entry.
    async fn seek(
        mut self,
        next_key: &[u8],
    ) -> Result<Option<MergeIteratorHeapEntry<'a>>, BasaltError> {
        if self.comparator.compare(&self.next_kv.key, next_key) != Ordering::Less {
            Ok(Some(self))
        } else {
            self.iterator.seek(next_key).await?;
            if let Some(next_kv) = self.iterator.next_entry().await? {
                Ok(Some(MergeIteratorHeapEntry { next_kv, ..self }))
            } else {
                Ok(None)
            }
        }
    }
}

impl Eq for MergeIteratorHeapEntry<'_> {}

impl PartialEq<Self> for MergeIteratorHeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.next_kv == other.next_kv
    }
}

impl PartialOrd<Self> for MergeIteratorHeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeIteratorHeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // wrapped in Reverse inside the BinaryHeap, so this cmp is in
        // increasing internal-key order; ties across sources break toward
        // the lower source index
        cmp_internal(self.comparator.as_ref(), &self.next_kv, &other.next_kv)
            .then(self.index.cmp(&other.index))
    }
}

/// K-way merge over the compaction inputs.
///
/// Emits every version of every key in internal-key order: ascending user
/// key, descending sequence number. Nothing is deduplicated here: deciding
/// which versions survive is the compaction iterator's job.
pub struct MergeIterator<'a> {
    /// The current entry popped from the heap.
    current: Option<MergeIteratorHeapEntry<'a>>,
    /// Use a heap to perform the merge sort.
    iterators: BinaryHeap<Reverse<MergeIteratorHeapEntry<'a>>>,
    /// Iterators that have not yet been initialized and seeded.
    pending_iterators: Vec<(usize, Box<dyn EntryIterator + 'a>)>,
    comparator: ComparatorRef,
    initialized: bool,
}

impl<'a> MergeIterator<'a> {
    pub fn new<T: EntryIterator + 'a>(
        iterators: impl IntoIterator<Item = T>,
        comparator: ComparatorRef,
    ) -> Self {
        Self {
            current: None,
            iterators: BinaryHeap::new(),
            pending_iterators: iterators
                .into_iter()
                .enumerate()
                .map(|(index, iterator)| {
                    (index, Box::new(iterator) as Box<dyn EntryIterator + 'a>)
                })
                .collect(),
            comparator,
            initialized: false,
        }
    }

    async fn initialize(&mut self) -> Result<(), BasaltError> {
        if self.initialized {
            return Ok(());
        }
        for (index, mut iterator) in self.pending_iterators.drain(..) {
            iterator.init().await?;
            if let Some(next_kv) = iterator.next_entry().await? {
                self.iterators.push(Reverse(MergeIteratorHeapEntry {
                    next_kv,
                    index,
                    comparator: self.comparator.clone(),
                    iterator,
                }));
            }
        }
        self.current = self.iterators.pop().map(|r| r.0);
        self.initialized = true;
        Ok(())
    }

    async fn advance(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        if let Some(mut iterator_state) = self.current.take() {
            let current_kv = iterator_state.next_kv;
            if let Some(kv) = iterator_state.iterator.next_entry().await? {
                iterator_state.next_kv = kv;
                self.iterators.push(Reverse(iterator_state));
            }
            self.current = self.iterators.pop().map(|r| r.0);
            return Ok(Some(current_kv));
        }
        Ok(None)
    }
}

#[async_trait]
impl EntryIterator for MergeIterator<'_> {
    async fn init(&mut self) -> Result<(), BasaltError> {
        self.initialize().await
    }

    async fn next_entry(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        if !self.initialized {
            return Err(BasaltError::IteratorNotInitialized);
        }
        self.advance().await
    }

    async fn seek(&mut self, next_key: &[u8]) -> Result<(), BasaltError> {
        if !self.initialized {
            return Err(BasaltError::IteratorNotInitialized);
        }
        let mut seek_futures = VecDeque::new();
        if let Some(iterator) = self.current.take() {
            seek_futures.push_back(iterator.seek(next_key))
        }
        for iterator in self.iterators.drain() {
            seek_futures.push_back(iterator.0.seek(next_key));
        }
        for seek_result in futures::future::join_all(seek_futures).await {
            if let Some(seeked_iterator) = seek_result? {
                self.iterators.push(Reverse(seeked_iterator));
            }
        }
        self.current = self.iterators.pop().map(|r| r.0);
        Ok(())
    }
}
