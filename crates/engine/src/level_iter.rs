//! Iterates one level of non-overlapping files as a single sorted stream,
//! opening tables only when the cursor reaches them.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use base::{Comparer, InternalIterator, InternalKv};
use sstable::TableIter;

use crate::file_cache::FileCache;
use crate::file_metadata::FileMetadata;

pub struct LevelIter {
    cmp: &'static Comparer,
    cache: Arc<FileCache>,
    files: Vec<Arc<FileMetadata>>,
    /// Index of the file `iter` belongs to.
    index: usize,
    iter: Option<TableIter>,
}

impl LevelIter {
    /// `files` must be sorted and non-overlapping.
    pub fn new(cmp: &'static Comparer, cache: Arc<FileCache>, files: Vec<Arc<FileMetadata>>) -> Self {
        Self {
            cmp,
            cache,
            files,
            index: 0,
            iter: None,
        }
    }

    fn open(&mut self, index: usize) -> Result<&mut TableIter> {
        self.index = index;
        let file = &self.files[index];
        let reader = self.cache.table(file)?;
        Ok(self.iter.insert(reader.iter(file.iter_options())))
    }

    fn skip_forward(&mut self) -> Result<()> {
        while self.iter.as_ref().is_some_and(|it| it.current().is_none()) {
            if self.index + 1 >= self.files.len() {
                self.iter = None;
                return Ok(());
            }
            self.open(self.index + 1)?.first()?;
        }
        Ok(())
    }

    fn skip_backward(&mut self) -> Result<()> {
        while self.iter.as_ref().is_some_and(|it| it.current().is_none()) {
            if self.index == 0 {
                self.iter = None;
                return Ok(());
            }
            self.open(self.index - 1)?.last()?;
        }
        Ok(())
    }
}

impl InternalIterator for LevelIter {
    fn first(&mut self) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        self.open(0)?.first()?;
        self.skip_forward()
    }

    fn last(&mut self) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        self.open(self.files.len() - 1)?.last()?;
        self.skip_backward()
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        let cmp = self.cmp;
        let i = self.files.partition_point(|f| match cmp.cmp(&f.largest.user_key, key) {
            Ordering::Less => true,
            Ordering::Equal => f.largest_is_exclusive(),
            Ordering::Greater => false,
        });
        if i == self.files.len() {
            self.iter = None;
            return Ok(());
        }
        self.open(i)?.seek_ge(key)?;
        self.skip_forward()
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        let cmp = self.cmp;
        let i = self
            .files
            .partition_point(|f| cmp.cmp(&f.smallest.user_key, key) == Ordering::Less);
        if i == 0 {
            self.iter = None;
            return Ok(());
        }
        self.open(i - 1)?.seek_lt(key)?;
        self.skip_backward()
    }

    fn next(&mut self) -> Result<()> {
        match self.iter.as_mut() {
            Some(it) => it.next()?,
            None => return Ok(()),
        }
        self.skip_forward()
    }

    fn prev(&mut self) -> Result<()> {
        match self.iter.as_mut() {
            Some(it) => it.prev()?,
            None => return Ok(()),
        }
        self.skip_backward()
    }

    fn current(&self) -> Option<&InternalKv> {
        self.iter.as_ref().and_then(|it| it.current())
    }
}
