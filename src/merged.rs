//! Virtual merged view: presents a stack of tables `[oldest, …, newest]`
//! as one logical table for reads, without physically compacting.
//!
//! Cursors from every table feed a min-heap keyed by record name; among
//! entries for the same name the one with the highest update index wins,
//! ties broken by stack position (newer tables shadow older ones). The
//! winner sorts first among its name group, so shadowed entries are
//! dropped by remembering the last yielded key, the same way newer LSM
//! sources shadow older ones during a merge scan.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::reader::{resolve_with, LogCursor, Reader, RefCursor};
use crate::source::BlockSource;
use crate::types::{Log, ObjectId, Ref};

pub struct MergedReader<S: BlockSource> {
    readers: Vec<Reader<S>>,
    include_deletes: bool,
}

impl<S: BlockSource> MergedReader<S> {
    /// Builds a merged view over `readers`, ordered oldest to newest.
    pub fn new(readers: Vec<Reader<S>>) -> Self {
        Self {
            readers,
            include_deletes: false,
        }
    }

    pub fn set_include_deletes(&mut self, include: bool) {
        self.include_deletes = include;
    }

    pub fn min_update_index(&self) -> u64 {
        self.readers
            .iter()
            .map(Reader::min_update_index)
            .min()
            .unwrap_or(0)
    }

    pub fn max_update_index(&self) -> u64 {
        self.readers
            .iter()
            .map(Reader::max_update_index)
            .max()
            .unwrap_or(0)
    }

    pub fn tables(&self) -> usize {
        self.readers.len()
    }

    /// True when every table in the stack can serve object lookups from its
    /// obj section.
    pub fn has_object_map(&self) -> Result<bool> {
        for reader in &self.readers {
            if !reader.has_object_map()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn all_refs(&self) -> Result<MergedRefCursor<'_, S>> {
        let children = self
            .readers
            .iter()
            .map(|r| r.all_refs())
            .collect::<Result<Vec<_>>>()?;
        self.merge_refs(children, None)
    }

    pub fn seek_ref(&self, name: &str) -> Result<MergedRefCursor<'_, S>> {
        let children = self
            .readers
            .iter()
            .map(|r| r.seek_ref(name))
            .collect::<Result<Vec<_>>>()?;
        self.merge_refs(children, None)
    }

    pub fn seek_refs_with_prefix(&self, prefix: &str) -> Result<MergedRefCursor<'_, S>> {
        let children = self
            .readers
            .iter()
            .map(|r| r.seek_refs_with_prefix(prefix))
            .collect::<Result<Vec<_>>>()?;
        self.merge_refs(children, None)
    }

    /// Refs resolving to `id` after last-writer-wins reconciliation. The
    /// winning value of every name is consulted, so a name rewritten to a
    /// different object in a newer table no longer matches its old id.
    pub fn by_object_id(&self, id: ObjectId) -> Result<MergedRefCursor<'_, S>> {
        let children = self
            .readers
            .iter()
            .map(|r| r.all_refs())
            .collect::<Result<Vec<_>>>()?;
        self.merge_refs(children, Some(id))
    }

    pub fn exact_ref(&self, name: &str) -> Result<Option<Ref>> {
        self.seek_ref(name)?.next().transpose()
    }

    /// Follows the symbolic-ref chain of `r` through at most five hops
    /// across the whole stack.
    pub fn resolve(&self, r: &Ref) -> Result<Option<Ref>> {
        resolve_with(|name| self.exact_ref(name), r)
    }

    pub fn all_logs(&self) -> Result<MergedLogCursor<'_, S>> {
        let children = self
            .readers
            .iter()
            .map(|r| r.all_logs())
            .collect::<Result<Vec<_>>>()?;
        self.merge_logs(children)
    }

    pub fn seek_log(&self, name: &str, max_update_index: u64) -> Result<MergedLogCursor<'_, S>> {
        let children = self
            .readers
            .iter()
            .map(|r| r.seek_log(name, max_update_index))
            .collect::<Result<Vec<_>>>()?;
        self.merge_logs(children)
    }

    fn merge_refs<'a>(
        &'a self,
        mut children: Vec<RefCursor<'a, S>>,
        filter_id: Option<ObjectId>,
    ) -> Result<MergedRefCursor<'a, S>> {
        // Children surface tombstones so newer deletions can shadow older
        // live records; the merged cursor applies its own policy.
        for child in &mut children {
            child.include_deletes = true;
        }
        let mut cursor = MergedRefCursor {
            children,
            heap: BinaryHeap::new(),
            last_name: None,
            include_deletes: self.include_deletes,
            filter_id,
            was_deleted: false,
        };
        for src in 0..cursor.children.len() {
            cursor.pull(src)?;
        }
        Ok(cursor)
    }

    fn merge_logs<'a>(
        &'a self,
        mut children: Vec<LogCursor<'a, S>>,
    ) -> Result<MergedLogCursor<'a, S>> {
        for child in &mut children {
            child.include_deletes = true;
        }
        let mut cursor = MergedLogCursor {
            children,
            heap: BinaryHeap::new(),
            last_key: None,
            include_deletes: self.include_deletes,
        };
        for src in 0..cursor.children.len() {
            cursor.pull(src)?;
        }
        Ok(cursor)
    }
}

struct RefEntry {
    record: Ref,
    src: usize,
}

impl PartialEq for RefEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RefEntry {}

impl PartialOrd for RefEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RefEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest name first, and within a name the winning
        // entry (highest update index, then latest table) pops first.
        match self.record.name.cmp(&other.record.name) {
            Ordering::Equal => match self.record.update_index.cmp(&other.record.update_index) {
                Ordering::Equal => self.src.cmp(&other.src),
                ord => ord,
            },
            ord => ord.reverse(),
        }
    }
}

pub struct MergedRefCursor<'a, S: BlockSource> {
    children: Vec<RefCursor<'a, S>>,
    heap: BinaryHeap<RefEntry>,
    last_name: Option<String>,
    include_deletes: bool,
    filter_id: Option<ObjectId>,
    was_deleted: bool,
}

impl<S: BlockSource> MergedRefCursor<'_, S> {
    pub fn was_deleted(&self) -> bool {
        self.was_deleted
    }

    /// Jumps every child past `prefix` and rebuilds the merge state.
    pub fn seek_past_prefix(&mut self, prefix: &str) -> Result<()> {
        for child in &mut self.children {
            child.seek_past_prefix(prefix)?;
        }
        self.heap.clear();
        for src in 0..self.children.len() {
            self.pull(src)?;
        }
        Ok(())
    }

    fn pull(&mut self, src: usize) -> Result<()> {
        match self.children[src].next() {
            Some(Ok(record)) => {
                self.heap.push(RefEntry { record, src });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S: BlockSource> Iterator for MergedRefCursor<'_, S> {
    type Item = Result<Ref>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.heap.pop()?;
            if let Err(e) = self.pull(entry.src) {
                return Some(Err(e));
            }
            // Entries after the first for a name lost the conflict.
            if self.last_name.as_deref() == Some(entry.record.name.as_str()) {
                continue;
            }
            self.last_name = Some(entry.record.name.clone());

            if entry.record.is_tombstone() && !self.include_deletes {
                continue;
            }
            if let Some(id) = &self.filter_id {
                let matches = entry.record.object_id() == Some(id)
                    || entry.record.peeled_id() == Some(id);
                if !matches {
                    continue;
                }
            }
            self.was_deleted = entry.record.is_tombstone();
            return Some(Ok(entry.record));
        }
    }
}

struct LogHeapEntry {
    log: Log,
    src: usize,
}

impl PartialEq for LogHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LogHeapEntry {}

impl PartialOrd for LogHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Name ascending, then newest update first; at the same composite
        // key the latest table masks the rest.
        match self.log.name.cmp(&other.log.name) {
            Ordering::Equal => match self.log.update_index.cmp(&other.log.update_index) {
                Ordering::Equal => self.src.cmp(&other.src),
                ord => ord,
            },
            ord => ord.reverse(),
        }
    }
}

pub struct MergedLogCursor<'a, S: BlockSource> {
    children: Vec<LogCursor<'a, S>>,
    heap: BinaryHeap<LogHeapEntry>,
    last_key: Option<(String, u64)>,
    include_deletes: bool,
}

impl<S: BlockSource> MergedLogCursor<'_, S> {
    fn pull(&mut self, src: usize) -> Result<()> {
        match self.children[src].next() {
            Some(Ok(log)) => {
                self.heap.push(LogHeapEntry { log, src });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S: BlockSource> Iterator for MergedLogCursor<'_, S> {
    type Item = Result<Log>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.heap.pop()?;
            if let Err(e) = self.pull(entry.src) {
                return Some(Err(e));
            }
            let key = (entry.log.name.clone(), entry.log.update_index);
            if self.last_key.as_ref() == Some(&key) {
                continue;
            }
            self.last_key = Some(key);

            if entry.log.entry.is_none() && !self.include_deletes {
                continue;
            }
            return Some(Ok(entry.log));
        }
    }
}
