//! Reader: random-access interpretation of a sealed table.
//!
//! A reader validates the header and footer up front, then resolves blocks
//! lazily. Sections are located by walking the self-delimiting block
//! headers from the end of the file header; the index roots recorded in the
//! footer short-circuit that walk for seeks. Readers clone cheaply and the
//! clones may be used from different threads when the block source allows
//! concurrent reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::{Block, BlockIterator};
use crate::cache::BlockCache;
use crate::errformat;
use crate::error::{Error, Result};
use crate::record::{
    check_stored_ref_name, log_key, split_log_key, BlockType, FileHeader, Footer, Payload,
    BLOCK_HEADER_LEN, FILE_HEADER_LEN, FOOTER_LEN,
};
use crate::source::BlockSource;
use crate::types::{Log, ObjectId, Ref};

/// Symbolic refs are followed through at most this many hops before the
/// chain is reported absent. Interface-visible: callers rely on the bound.
const MAX_SYMREF_DEPTH: usize = 5;

/// Corrupt index blocks must not cycle the descent forever.
const MAX_INDEX_DEPTH: usize = 16;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct Sections {
    ref_blocks: Vec<u64>,
    obj_blocks: Vec<u64>,
    log_blocks: Vec<u64>,
}

struct Inner<S> {
    source: S,
    size: u64,
    footer: Footer,
    id: u64,
    cache: Option<Arc<BlockCache>>,
    sections: Mutex<Option<Arc<Sections>>>,
}

pub struct Reader<S: BlockSource> {
    inner: Arc<Inner<S>>,
    include_deletes: bool,
}

impl<S: BlockSource> std::fmt::Debug for Reader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("include_deletes", &self.include_deletes)
            .finish()
    }
}

impl<S: BlockSource> Clone for Reader<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            include_deletes: self.include_deletes,
        }
    }
}

impl<S: BlockSource> Reader<S> {
    pub fn new(source: S) -> Result<Self> {
        Self::build(source, None)
    }

    /// Attaches a shared block cache. Correctness never depends on hits.
    pub fn with_cache(source: S, cache: Arc<BlockCache>) -> Result<Self> {
        Self::build(source, Some(cache))
    }

    fn build(source: S, cache: Option<Arc<BlockCache>>) -> Result<Self> {
        let size = source.size();
        if size < (FILE_HEADER_LEN + FOOTER_LEN) as u64 {
            return Err(Error::Integrity(format!(
                "table of {size} bytes is too short"
            )));
        }
        let header = FileHeader::decode(&source.read_at(0, FILE_HEADER_LEN)?)?;
        let footer = Footer::decode(&source.read_at(size - FOOTER_LEN as u64, FOOTER_LEN)?)?;
        if header != footer.header {
            return Err(Error::Integrity(
                "header and footer disagree".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                size,
                footer,
                id: NEXT_READER_ID.fetch_add(1, Ordering::Relaxed),
                cache,
                sections: Mutex::new(None),
            }),
            include_deletes: false,
        })
    }

    pub fn min_update_index(&self) -> u64 {
        self.inner.footer.header.min_update_index
    }

    pub fn max_update_index(&self) -> u64 {
        self.inner.footer.header.max_update_index
    }

    pub fn block_size(&self) -> u32 {
        self.inner.footer.header.block_size
    }

    /// When true, ref cursors yield tombstones instead of skipping them.
    pub fn set_include_deletes(&mut self, include: bool) {
        self.include_deletes = include;
    }

    pub fn include_deletes(&self) -> bool {
        self.include_deletes
    }

    /// Streams every ref in name order.
    pub fn all_refs(&self) -> Result<RefCursor<'_, S>> {
        self.ref_scan(Vec::new(), false)
    }

    /// Positions a cursor at `name`; it yields the record only on an exact
    /// match.
    pub fn seek_ref(&self, name: &str) -> Result<RefCursor<'_, S>> {
        self.ref_scan(name.as_bytes().to_vec(), true)
    }

    /// Streams the refs whose names start with `prefix`. An empty prefix
    /// streams everything.
    pub fn seek_refs_with_prefix(&self, prefix: &str) -> Result<RefCursor<'_, S>> {
        self.ref_scan(prefix.as_bytes().to_vec(), false)
    }

    /// Convenience single-record lookup.
    pub fn exact_ref(&self, name: &str) -> Result<Option<Ref>> {
        self.seek_ref(name)?.next().transpose()
    }

    /// Streams the refs whose target or peeled id equals `id`, in file
    /// order. Without an obj section this degrades to a filtered full scan.
    pub fn by_object_id(&self, id: ObjectId) -> Result<RefCursor<'_, S>> {
        let sections = self.sections()?;
        if sections.obj_blocks.is_empty() {
            let mut cursor = self.ref_scan(Vec::new(), false)?;
            cursor.filter_id = Some(id);
            cursor.obj_lookup = true;
            return Ok(cursor);
        }

        let prefix_len = self.inner.footer.obj_id_len as usize;
        if prefix_len == 0 || prefix_len > id.as_bytes().len() {
            return errformat!("invalid obj id prefix length {prefix_len}");
        }
        let key = id.as_bytes()[..prefix_len].to_vec();
        let mut lookup = SectionCursor::new(
            self,
            BlockType::Obj,
            self.inner.footer.obj_index_root,
            sections.obj_blocks.clone(),
        );
        lookup.seek(&key)?;
        let positions = match lookup.next_entry() {
            Some(Ok((found, Payload::Obj { positions }))) if found == key => positions,
            Some(Err(e)) => return Err(e),
            Some(Ok((_, Payload::Obj { .. }))) | None => Vec::new(),
            Some(Ok(_)) => return errformat!("non-obj record in obj section"),
        };

        let mut cursor = RefCursor {
            section: SectionCursor::new(self, BlockType::Ref, 0, positions),
            prefix: Vec::new(),
            exact: false,
            filter_id: Some(id),
            obj_lookup: true,
            include_deletes: self.include_deletes,
            last_name: Vec::new(),
            was_deleted: false,
        };
        cursor.section.exhausted = cursor.section.blocks.is_empty();
        Ok(cursor)
    }

    /// True when the table can serve `by_object_id` from its obj section,
    /// which trivially includes tables with no refs at all.
    pub fn has_object_map(&self) -> Result<bool> {
        let sections = self.sections()?;
        Ok(!sections.obj_blocks.is_empty() || sections.ref_blocks.is_empty())
    }

    /// Streams every log record, by name ascending then update index
    /// descending.
    pub fn all_logs(&self) -> Result<LogCursor<'_, S>> {
        self.log_scan(None, Vec::new())
    }

    /// Positions a cursor at the newest entry for `name` whose update index
    /// is at most `max_update_index`. The cursor never yields entries for a
    /// different name.
    pub fn seek_log(&self, name: &str, max_update_index: u64) -> Result<LogCursor<'_, S>> {
        self.log_scan(
            Some(name.as_bytes().to_vec()),
            log_key(name.as_bytes(), max_update_index),
        )
    }

    /// Follows the symbolic-ref chain of `r` through at most five hops.
    pub fn resolve(&self, r: &Ref) -> Result<Option<Ref>> {
        resolve_with(|name| self.exact_ref(name), r)
    }

    fn ref_scan(&self, bound: Vec<u8>, exact: bool) -> Result<RefCursor<'_, S>> {
        let sections = self.sections()?;
        let mut cursor = RefCursor {
            section: SectionCursor::new(
                self,
                BlockType::Ref,
                self.inner.footer.ref_index_root,
                sections.ref_blocks.clone(),
            ),
            prefix: bound.clone(),
            exact,
            filter_id: None,
            obj_lookup: false,
            include_deletes: self.include_deletes,
            last_name: Vec::new(),
            was_deleted: false,
        };
        cursor.section.seek(&bound)?;
        Ok(cursor)
    }

    fn log_scan(&self, name: Option<Vec<u8>>, target: Vec<u8>) -> Result<LogCursor<'_, S>> {
        let sections = self.sections()?;
        let mut section = SectionCursor::new(
            self,
            BlockType::Log,
            self.inner.footer.log_index_root,
            sections.log_blocks.clone(),
        );
        section.seek(&target)?;
        Ok(LogCursor {
            section,
            name,
            include_deletes: self.include_deletes,
        })
    }

    fn sections(&self) -> Result<Arc<Sections>> {
        let mut guard = self.inner.sections.lock()?;
        if let Some(sections) = guard.as_ref() {
            return Ok(Arc::clone(sections));
        }
        let sections = Arc::new(self.walk_sections()?);
        *guard = Some(Arc::clone(&sections));
        Ok(sections)
    }

    /// Walks block headers from the end of the file header, attributing
    /// each block to its section and skipping alignment padding.
    fn walk_sections(&self) -> Result<Sections> {
        let mut sections = Sections::default();
        let end = self.inner.size - FOOTER_LEN as u64;
        let block_size = u64::from(self.inner.footer.header.block_size);
        let mut pos = FILE_HEADER_LEN as u64;

        while pos < end {
            let header = self.inner.source.read_at(pos, BLOCK_HEADER_LEN)?;
            if header[0] == 0 {
                if block_size == 0 {
                    return errformat!("padding at {pos} in a table with no block size");
                }
                let next = (pos / block_size + 1) * block_size;
                if next <= pos || next > end {
                    return errformat!("padding at {pos} runs past the section area");
                }
                pos = next;
                continue;
            }
            let block_type = BlockType::from_byte(header[0]).ok_or_else(|| {
                Error::Format(format!("unknown block type 0x{:02x} at {pos}", header[0]))
            })?;
            let len = u64::from(u32::from_be_bytes([0, header[1], header[2], header[3]]));
            if len < (BLOCK_HEADER_LEN + 2) as u64 || pos + len > end {
                return errformat!("block at {pos} with impossible length {len}");
            }
            match block_type {
                BlockType::Ref => {
                    if !sections.obj_blocks.is_empty() || !sections.log_blocks.is_empty() {
                        return errformat!("ref block at {pos} after a later section");
                    }
                    sections.ref_blocks.push(pos);
                }
                BlockType::Obj => {
                    if !sections.log_blocks.is_empty() {
                        return errformat!("obj block at {pos} after the log section");
                    }
                    sections.obj_blocks.push(pos);
                }
                BlockType::Log => sections.log_blocks.push(pos),
                BlockType::Index => {}
            }
            pos += len;
        }
        Ok(sections)
    }

    fn read_block_at(&self, offset: u64) -> Result<Arc<Block>> {
        if let Some(cache) = &self.inner.cache {
            if let Some(block) = cache.get(&(self.inner.id, offset)) {
                return Ok(block);
            }
        }
        let end = self.inner.size - FOOTER_LEN as u64;
        if offset < FILE_HEADER_LEN as u64 || offset + (BLOCK_HEADER_LEN as u64) > end {
            return errformat!("block offset {offset} out of range");
        }
        let header = self.inner.source.read_at(offset, BLOCK_HEADER_LEN)?;
        let len = u64::from(u32::from_be_bytes([0, header[1], header[2], header[3]]));
        if len < (BLOCK_HEADER_LEN + 2) as u64 || offset + len > end {
            return errformat!("block at {offset} with impossible length {len}");
        }
        let bytes = self.inner.source.read_at(offset, len as usize)?;
        let block = Arc::new(Block::decode(bytes)?);
        if let Some(cache) = &self.inner.cache {
            cache.insert((self.inner.id, offset), Arc::clone(&block));
        }
        Ok(block)
    }

    /// Descends the index pyramid at `root` to the section block whose keys
    /// cover `target`. `None` means every key in the section is smaller.
    fn descend_index(&self, root: u64, target: &[u8]) -> Result<Option<u64>> {
        let mut offset = root;
        for _ in 0..MAX_INDEX_DEPTH {
            let block = self.read_block_at(offset)?;
            if block.block_type() != BlockType::Index {
                return Ok(Some(offset));
            }
            let mut iter = block.iter();
            iter.seek(target)?;
            match iter.next() {
                Some(Ok((_, Payload::Index { offset: child }))) => offset = child,
                Some(Ok(_)) => return errformat!("non-index record in index block at {offset}"),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
        errformat!("index pyramid deeper than {MAX_INDEX_DEPTH} levels")
    }
}

/// Low-level iteration over the blocks of one section.
struct SectionCursor<'r, S: BlockSource> {
    reader: &'r Reader<S>,
    section: BlockType,
    index_root: u64,
    blocks: Vec<u64>,
    next_block: usize,
    iter: Option<BlockIterator>,
    exhausted: bool,
}

impl<'r, S: BlockSource> SectionCursor<'r, S> {
    fn new(reader: &'r Reader<S>, section: BlockType, index_root: u64, blocks: Vec<u64>) -> Self {
        Self {
            reader,
            section,
            index_root,
            blocks,
            next_block: 0,
            iter: None,
            exhausted: false,
        }
    }

    /// Repositions so the next entry is the first with key >= `target`.
    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.iter = None;
        self.next_block = 0;
        self.exhausted = self.blocks.is_empty();
        if self.exhausted {
            return Ok(());
        }

        if self.index_root != 0 {
            match self.reader.descend_index(self.index_root, target)? {
                None => self.exhausted = true,
                Some(leaf) => {
                    let idx = self.blocks.binary_search(&leaf).map_err(|_| {
                        Error::Format(format!("index leaf {leaf} is not a section block"))
                    })?;
                    let mut iter = self.load(leaf)?;
                    iter.seek(target)?;
                    self.iter = Some(iter);
                    self.next_block = idx + 1;
                }
            }
            return Ok(());
        }

        for idx in 0..self.blocks.len() {
            let mut iter = self.load(self.blocks[idx])?;
            iter.seek(target)?;
            if !iter.is_exhausted() {
                self.iter = Some(iter);
                self.next_block = idx + 1;
                return Ok(());
            }
        }
        self.exhausted = true;
        Ok(())
    }

    fn load(&self, offset: u64) -> Result<BlockIterator> {
        let block = self.reader.read_block_at(offset)?;
        if block.block_type() != self.section {
            return errformat!(
                "expected {:?} block at {offset}, found {:?}",
                self.section,
                block.block_type()
            );
        }
        Ok(block.iter())
    }

    fn next_entry(&mut self) -> Option<Result<(Vec<u8>, Payload)>> {
        loop {
            if self.exhausted {
                return None;
            }
            if let Some(iter) = self.iter.as_mut() {
                match iter.next() {
                    Some(Ok(entry)) => return Some(Ok(entry)),
                    Some(Err(e)) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                    None => self.iter = None,
                }
            }
            if self.iter.is_none() {
                if self.next_block >= self.blocks.len() {
                    self.exhausted = true;
                    return None;
                }
                let offset = self.blocks[self.next_block];
                self.next_block += 1;
                match self.load(offset) {
                    Ok(iter) => self.iter = Some(iter),
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    fn exhaust(&mut self) {
        self.exhausted = true;
        self.iter = None;
    }
}

/// Cursor over reference records.
pub struct RefCursor<'r, S: BlockSource> {
    section: SectionCursor<'r, S>,
    prefix: Vec<u8>,
    exact: bool,
    filter_id: Option<ObjectId>,
    obj_lookup: bool,
    pub(crate) include_deletes: bool,
    last_name: Vec<u8>,
    was_deleted: bool,
}

impl<S: BlockSource> RefCursor<'_, S> {
    /// True when the most recently yielded record was a tombstone. Only
    /// meaningful while deletes are included.
    pub fn was_deleted(&self) -> bool {
        self.was_deleted
    }

    /// Jumps past every name that starts with `prefix`, leaving the cursor
    /// on the lexicographic next sibling. Never moves backwards. Raised as
    /// unsupported on cursors produced by `by_object_id`.
    pub fn seek_past_prefix(&mut self, prefix: &str) -> Result<()> {
        if self.obj_lookup {
            return Err(Error::Unsupported(
                "seek past prefix on an object lookup cursor".to_string(),
            ));
        }
        let successor = match prefix_successor(prefix.as_bytes()) {
            Some(successor) => successor,
            None => {
                self.section.exhaust();
                return Ok(());
            }
        };
        if !self.last_name.is_empty() && successor.as_slice() <= self.last_name.as_slice() {
            return Ok(());
        }
        self.section.seek(&successor)
    }
}

impl<S: BlockSource> Iterator for RefCursor<'_, S> {
    type Item = Result<Ref>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, payload) = match self.section.next_entry()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let in_bound = if self.exact {
                key == self.prefix
            } else {
                key.starts_with(&self.prefix)
            };
            if !in_bound {
                self.section.exhaust();
                return None;
            }

            let (update_delta, value) = match payload {
                Payload::Ref { update_delta, value } => (update_delta, value),
                _ => return Some(Err(Error::Format("non-ref record in ref section".to_string()))),
            };
            let name = match check_stored_ref_name(&key) {
                Ok(name) => name.to_string(),
                Err(e) => return Some(Err(e)),
            };
            let update_index = match self
                .section
                .reader
                .min_update_index()
                .checked_add(update_delta)
            {
                Some(update_index) => update_index,
                None => {
                    return Some(Err(Error::Format(format!(
                        "update index overflow for {name}"
                    ))))
                }
            };
            let record = Ref {
                name,
                value,
                update_index,
            };
            self.last_name = key;

            if let Some(id) = &self.filter_id {
                let matches = record.object_id() == Some(id) || record.peeled_id() == Some(id);
                if !matches {
                    continue;
                }
            }
            if record.is_tombstone() && !self.include_deletes {
                continue;
            }
            self.was_deleted = record.is_tombstone();
            return Some(Ok(record));
        }
    }
}

/// Cursor over reflog records.
pub struct LogCursor<'r, S: BlockSource> {
    section: SectionCursor<'r, S>,
    name: Option<Vec<u8>>,
    pub(crate) include_deletes: bool,
}

impl<S: BlockSource> Iterator for LogCursor<'_, S> {
    type Item = Result<Log>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, payload) = match self.section.next_entry()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let (name_bytes, update_index) = match split_log_key(&key) {
                Ok(parts) => parts,
                Err(e) => return Some(Err(e)),
            };
            if let Some(bound) = &self.name {
                if name_bytes != bound.as_slice() {
                    self.section.exhaust();
                    return None;
                }
            }
            let entry = match payload {
                Payload::Log(entry) => entry,
                _ => return Some(Err(Error::Format("non-log record in log section".to_string()))),
            };
            if entry.is_none() && !self.include_deletes {
                continue;
            }
            let name = match check_stored_ref_name(name_bytes) {
                Ok(name) => name.to_string(),
                Err(e) => return Some(Err(e)),
            };
            return Some(Ok(Log {
                name,
                update_index,
                entry,
            }));
        }
    }
}

/// The smallest key strictly greater than every key starting with `prefix`,
/// or `None` when no such key exists.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xff {
            out.pop();
        } else {
            *out.last_mut()? += 1;
            return Some(out);
        }
    }
    None
}

/// Follows a symbolic-ref chain with a fixed hop budget; exceeding it
/// yields an absent value rather than cycling.
pub(crate) fn resolve_with<F>(mut lookup: F, r: &Ref) -> Result<Option<Ref>>
where
    F: FnMut(&str) -> Result<Option<Ref>>,
{
    let mut current = r.clone();
    for _ in 0..MAX_SYMREF_DEPTH {
        let target = match current.symbolic_target() {
            Some(target) => target.to_string(),
            None => return Ok(Some(current)),
        };
        match lookup(&target)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    if current.is_symbolic() {
        Ok(None)
    } else {
        Ok(Some(current))
    }
}
