//! Merging iterator over several [`InternalIterator`]s.
//!
//! Produces the union of its children's internal keys in comparer order.
//! Unlike a user-facing iterator it does not hide anything: every version
//! of every key is yielded, newest first. Visibility, range deletions and
//! compaction rules are applied by the callers.
//!
//! The children are kept in a heap ordered for the current direction. When
//! the direction flips, every child except the current one is repositioned
//! relative to the current key:
//!
//! ```text
//! forward -> backward: seek_ge(cur), step past keys < cur, then prev
//!                      (or last, if the child ran off the end)
//! backward -> forward: seek_ge(cur), step past keys <= cur
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::Result;
use base::{Comparer, InternalIterator, InternalKey, InternalKv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// The current key of one child, used for heap ordering.
struct HeapEntry {
    key: InternalKey,
    /// Index into `children`.
    source: usize,
    cmp: &'static Comparer,
    dir: Direction,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: going forward we want the *smallest*
        // key on top, going backward the largest. On tie, prefer the
        // child with the lower index.
        let by_key = self.cmp.cmp_internal(&self.key, &other.key);
        let by_key = match self.dir {
            Direction::Forward => by_key.reverse(),
            Direction::Backward => by_key,
        };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

pub struct MergingIter {
    cmp: &'static Comparer,
    children: Vec<Box<dyn InternalIterator>>,
    heap: BinaryHeap<HeapEntry>,
    dir: Direction,
}

impl MergingIter {
    pub fn new(cmp: &'static Comparer, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            cmp,
            children,
            heap: BinaryHeap::new(),
            dir: Direction::Forward,
        }
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    fn entry(&self, source: usize) -> Option<HeapEntry> {
        self.children[source].current().map(|kv| HeapEntry {
            key: kv.key.clone(),
            source,
            cmp: self.cmp,
            dir: self.dir,
        })
    }

    fn rebuild(&mut self, dir: Direction) {
        self.dir = dir;
        let entries: Vec<HeapEntry> = (0..self.children.len())
            .filter_map(|i| self.entry(i))
            .collect();
        self.heap = BinaryHeap::from(entries);
    }

    /// Pops the top child after it has been stepped and pushes it back if
    /// it still has a key.
    fn refresh_top(&mut self, source: usize) {
        self.heap.pop();
        if let Some(e) = self.entry(source) {
            self.heap.push(e);
        }
    }

    fn switch_to_forward(&mut self, cur: &InternalKey, top: usize) -> Result<()> {
        for i in 0..self.children.len() {
            if i == top {
                continue;
            }
            let child = &mut self.children[i];
            child.seek_ge(&cur.user_key)?;
            while let Some(kv) = child.current() {
                if self.cmp.cmp_internal(&kv.key, cur) == Ordering::Greater {
                    break;
                }
                child.next()?;
            }
        }
        self.children[top].next()?;
        self.rebuild(Direction::Forward);
        Ok(())
    }

    fn switch_to_backward(&mut self, cur: &InternalKey, top: usize) -> Result<()> {
        for i in 0..self.children.len() {
            if i == top {
                continue;
            }
            let child = &mut self.children[i];
            child.seek_ge(&cur.user_key)?;
            while let Some(kv) = child.current() {
                if self.cmp.cmp_internal(&kv.key, cur) != Ordering::Less {
                    break;
                }
                child.next()?;
            }
            if child.current().is_some() {
                child.prev()?;
            } else {
                child.last()?;
            }
        }
        self.children[top].prev()?;
        self.rebuild(Direction::Backward);
        Ok(())
    }
}

impl InternalIterator for MergingIter {
    fn first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.first()?;
        }
        self.rebuild(Direction::Forward);
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.last()?;
        }
        self.rebuild(Direction::Backward);
        Ok(())
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek_ge(key)?;
        }
        self.rebuild(Direction::Forward);
        Ok(())
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek_lt(key)?;
        }
        self.rebuild(Direction::Backward);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let (key, source) = match self.heap.peek() {
            Some(top) => (top.key.clone(), top.source),
            None => return Ok(()),
        };
        if self.dir == Direction::Backward {
            return self.switch_to_forward(&key, source);
        }
        self.children[source].next()?;
        self.refresh_top(source);
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let (key, source) = match self.heap.peek() {
            Some(top) => (top.key.clone(), top.source),
            None => return Ok(()),
        };
        if self.dir == Direction::Forward {
            return self.switch_to_backward(&key, source);
        }
        self.children[source].prev()?;
        self.refresh_top(source);
        Ok(())
    }

    fn current(&self) -> Option<&InternalKv> {
        self.heap
            .peek()
            .and_then(|top| self.children[top.source].current())
    }
}
