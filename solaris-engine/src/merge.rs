//! Cross-log merge iterator. Builds a balanced binary
//! tree of pairwise mergers over per-log iterators, each caching the
//! head element from its two children and advancing whichever wins the
//! comparator; sources that finish are treated as empty. The result is
//! restartable (if every source is restartable) and closes by dropping
//! (and thereby closing) every source.
//!
//! The per-log iterator is async (it calls through
//! [`crate::local_log::LocalLogEngine`], which takes locks and does file
//! I/O), so this merges over an async iterator trait rather than
//! [`solaris_common::IteratorIO`] (which the purely in-memory chunk reader
//! uses, see `solaris_storage::chunk::ChunkReader`).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use solaris_common::error::{Error, Result};
use solaris_common::model::{Direction, Record};

/// An async, cancellation-aware stream of records in id order. Both the
/// per-log paginated iterator ([`crate::paginated::PaginatedIterator`]) and
/// the merge iterator itself implement this.
#[async_trait]
pub trait AsyncRecordIterator: Send {
    async fn next(&mut self) -> Result<Option<Record>>;

    /// Restarts the stream from its original position. Only meaningful if
    /// every source merged over also supports it.
    async fn reset(&mut self) -> Result<()>;
}

struct EmptySource;

#[async_trait]
impl AsyncRecordIterator for EmptySource {
    async fn next(&mut self) -> Result<Option<Record>> {
        Ok(None)
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Merges exactly two sources, caching each side's head element and
/// yielding whichever compares first under `direction`.
struct PairMerge {
    left: Box<dyn AsyncRecordIterator>,
    right: Box<dyn AsyncRecordIterator>,
    left_head: Option<Record>,
    right_head: Option<Record>,
    primed: bool,
    direction: Direction,
}

impl PairMerge {
    fn new(left: Box<dyn AsyncRecordIterator>, right: Box<dyn AsyncRecordIterator>, direction: Direction) -> Self {
        Self {
            left,
            right,
            left_head: None,
            right_head: None,
            primed: false,
            direction,
        }
    }

    fn left_wins(&self, left: &Record, right: &Record) -> bool {
        match self.direction {
            Direction::Ascending => left.id <= right.id,
            Direction::Descending => left.id >= right.id,
        }
    }
}

#[async_trait]
impl AsyncRecordIterator for PairMerge {
    async fn next(&mut self) -> Result<Option<Record>> {
        if !self.primed {
            self.left_head = self.left.next().await?;
            self.right_head = self.right.next().await?;
            self.primed = true;
        }

        match (self.left_head.take(), self.right_head.take()) {
            (Some(l), Some(r)) => {
                if self.left_wins(&l, &r) {
                    self.right_head = Some(r);
                    self.left_head = self.left.next().await?;
                    Ok(Some(l))
                } else {
                    self.left_head = Some(l);
                    self.right_head = self.right.next().await?;
                    Ok(Some(r))
                }
            }
            (Some(l), None) => {
                self.left_head = self.left.next().await?;
                Ok(Some(l))
            }
            (None, Some(r)) => {
                self.right_head = self.right.next().await?;
                Ok(Some(r))
            }
            (None, None) => Ok(None),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        self.left.reset().await?;
        self.right.reset().await?;
        self.left_head = None;
        self.right_head = None;
        self.primed = false;
        Ok(())
    }
}

fn build_tree(mut sources: Vec<Box<dyn AsyncRecordIterator>>, direction: Direction) -> Box<dyn AsyncRecordIterator> {
    match sources.len() {
        0 => Box::new(EmptySource),
        1 => sources.pop().expect("len == 1"),
        n => {
            let right_half = sources.split_off(n / 2);
            let left = build_tree(sources, direction);
            let right = build_tree(right_half, direction);
            Box::new(PairMerge::new(left, right, direction))
        }
    }
}

/// k-way merge over per-log iterators in record-id order.
/// A shared cancellation token aborts the merge: every call to `next`
/// checks it before delegating to the tree, and sources that detect a
/// failure cancel the same token so merge peers shut down
/// (`PaginatedIterator`'s `cancel_sink`, constructed from the same token
/// passed to [`MergeIterator::new`]).
pub struct MergeIterator {
    root: Box<dyn AsyncRecordIterator>,
    cancel: CancellationToken,
}

impl MergeIterator {
    pub fn new(sources: Vec<Box<dyn AsyncRecordIterator>>, direction: Direction, cancel: CancellationToken) -> Self {
        Self {
            root: build_tree(sources, direction),
            cancel,
        }
    }
}

#[async_trait]
impl AsyncRecordIterator for MergeIterator {
    async fn next(&mut self) -> Result<Option<Record>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.root.next().await
    }

    async fn reset(&mut self) -> Result<()> {
        self.root.reset().await
    }
}
