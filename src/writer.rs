//! Table writer. Streams ordered records through the block codec into the
//! refs → objs → logs sections, builds an index pyramid per multi-block
//! section, and seals the table with the CRC'd footer.
//!
//! The writer is a strict state machine: `begin` emits the file header,
//! refs must precede logs, and every key within a section must be strictly
//! greater than the previous one. Any out-of-order call is a contract
//! violation and the output must be discarded.

use std::collections::BTreeMap;
use std::io::Write;

use crate::block::Builder;
use crate::config::Config;
use crate::encoding::varint_len;
use crate::errcontract;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::record::{
    check_ref_name, encode_index_payload, encode_log_payload, encode_obj_payload,
    encode_ref_payload, log_key, BlockType, FileHeader, Footer, BLOCK_HEADER_LEN, FILE_HEADER_LEN,
    FOOTER_LEN,
};
use crate::types::{LogEntry, ObjectId, Ref, Signature, OBJECT_ID_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    None,
    Refs,
    Objs,
    Logs,
}

/// Statistics published by a finished writer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub min_update_index: u64,
    pub max_update_index: u64,
    pub ref_count: u64,
    pub obj_count: u64,
    pub log_count: u64,
    pub ref_blocks: u64,
    pub obj_blocks: u64,
    pub log_blocks: u64,
    pub ref_bytes: u64,
    pub obj_bytes: u64,
    pub log_bytes: u64,
    pub ref_index_levels: usize,
    pub ref_index_bytes: u64,
    pub obj_index_levels: usize,
    pub obj_index_bytes: u64,
    pub log_index_levels: usize,
    pub log_index_bytes: u64,
    pub obj_id_len: u8,
    pub padding_bytes: u64,
    pub total_bytes: u64,
}

pub struct Writer<W: Write> {
    out: W,
    position: u64,
    cfg: Config,
    begun: bool,
    finished: bool,
    section: Section,
    min_update_index: u64,
    max_update_index: u64,
    block: Option<Builder>,
    block_offset: u64,
    last_key: Vec<u8>,
    ref_index: Index,
    obj_index: Index,
    log_index: Index,
    obj_positions: BTreeMap<ObjectId, Vec<u64>>,
    ref_index_root: u64,
    obj_index_root: u64,
    obj_id_len: u8,
    log_index_root: u64,
    stats: Stats,
}

impl<W: Write> Writer<W> {
    pub fn new(cfg: Config, out: W) -> Self {
        Self {
            out,
            position: 0,
            cfg,
            begun: false,
            finished: false,
            section: Section::None,
            min_update_index: 0,
            max_update_index: 0,
            block: None,
            block_offset: 0,
            last_key: Vec::new(),
            ref_index: Index::new(),
            obj_index: Index::new(),
            log_index: Index::new(),
            obj_positions: BTreeMap::new(),
            ref_index_root: 0,
            obj_index_root: 0,
            obj_id_len: 0,
            log_index_root: 0,
            stats: Stats::default(),
        }
    }

    /// Writes the file header and fixes the table's update-index range.
    pub fn begin(&mut self, min_update_index: u64, max_update_index: u64) -> Result<()> {
        if self.begun {
            return errcontract!("begin called twice");
        }
        self.cfg.validate()?;
        if min_update_index > max_update_index {
            return errcontract!(
                "min update index {min_update_index} exceeds max {max_update_index}"
            );
        }
        self.min_update_index = min_update_index;
        self.max_update_index = max_update_index;
        self.stats.min_update_index = min_update_index;
        self.stats.max_update_index = max_update_index;

        let header = FileHeader {
            block_size: self.cfg.block_size as u32,
            min_update_index,
            max_update_index,
        };
        self.begun = true;
        self.write_all(&header.encode())
    }

    /// Appends one reference record. Names must arrive in strictly
    /// increasing order.
    pub fn write_ref(&mut self, r: &Ref) -> Result<()> {
        self.require_open()?;
        match self.section {
            Section::None => {
                self.section = Section::Refs;
            }
            Section::Refs => {}
            Section::Objs | Section::Logs => {
                return errcontract!("cannot write ref {} after the ref section closed", r.name);
            }
        }
        check_ref_name(&r.name)?;
        self.check_update_index(r.update_index)?;

        let key = r.name.as_bytes().to_vec();
        if key.as_slice() <= self.last_key.as_slice() {
            return errcontract!(
                "ref records must be increasing, {} does not sort after {}",
                r.name,
                String::from_utf8_lossy(&self.last_key)
            );
        }

        let mut value = Vec::new();
        let delta = r.update_index - self.min_update_index;
        let vtype = encode_ref_payload(&mut value, &r.name, delta, &r.value)?;
        self.append_record(BlockType::Ref, &key, vtype, &value)?;
        self.last_key = key;
        self.stats.ref_count += 1;

        if self.cfg.index_objects {
            if let Some(id) = r.object_id() {
                self.record_obj(*id);
            }
            if let Some(peeled) = r.peeled_id() {
                self.record_obj(*peeled);
            }
        }
        Ok(())
    }

    /// Writes a batch of refs, verifying the batch is strictly increasing
    /// by name before touching the output.
    pub fn write_sorted_refs(&mut self, refs: &[Ref]) -> Result<()> {
        for pair in refs.windows(2) {
            if pair[1].name <= pair[0].name {
                return errcontract!(
                    "ref records must be increasing, {} does not sort after {}",
                    pair[1].name,
                    pair[0].name
                );
            }
        }
        for r in refs {
            self.write_ref(r)?;
        }
        Ok(())
    }

    /// Appends one reflog entry. Composite keys `(name, update index)` must
    /// be strictly increasing: by name, then by descending update index.
    /// A transition from the zero id to the zero id with an empty message is
    /// written as a log tombstone.
    pub fn write_log(
        &mut self,
        name: &str,
        update_index: u64,
        who: &Signature,
        old_id: ObjectId,
        new_id: ObjectId,
        message: &str,
    ) -> Result<()> {
        let entry = if old_id.is_zero() && new_id.is_zero() && message.is_empty() {
            None
        } else {
            Some(LogEntry {
                old_id,
                new_id,
                who: who.clone(),
                message: message.to_string(),
            })
        };
        self.append_log(name, update_index, entry)
    }

    /// Writes a log tombstone marking deletion of history for `name` at
    /// `update_index`.
    pub fn delete_log(&mut self, name: &str, update_index: u64) -> Result<()> {
        self.append_log(name, update_index, None)
    }

    fn append_log(&mut self, name: &str, update_index: u64, entry: Option<LogEntry>) -> Result<()> {
        self.require_open()?;
        check_ref_name(name)?;
        self.check_update_index(update_index)?;

        if self.section != Section::Logs {
            self.finish_refs_and_objs()?;
            self.section = Section::Logs;
            self.last_key.clear();
        }

        let key = log_key(name.as_bytes(), update_index);
        if key.as_slice() <= self.last_key.as_slice() {
            return errcontract!(
                "log records must be increasing, {name}@{update_index} does not sort after the previous entry"
            );
        }

        let mut value = Vec::new();
        let vtype = encode_log_payload(&mut value, entry.as_ref());
        self.append_record(BlockType::Log, &key, vtype, &value)?;
        self.last_key = key;
        self.stats.log_count += 1;
        Ok(())
    }

    /// Closes the open section, writes any remaining indexes and the
    /// footer. Idempotent once the table is sealed.
    pub fn finish(&mut self) -> Result<()> {
        if !self.begun {
            return errcontract!("writer has not begun");
        }
        if self.finished {
            return Ok(());
        }

        if self.section == Section::Logs {
            self.flush_block()?;
            if self.log_index.len() > 1 {
                let level0 = std::mem::take(&mut self.log_index);
                let (root, levels, bytes) = self.write_index_pyramid(level0)?;
                self.log_index_root = root;
                self.stats.log_index_levels = levels;
                self.stats.log_index_bytes = bytes;
            }
        } else {
            self.finish_refs_and_objs()?;
        }

        let footer = Footer {
            header: FileHeader {
                block_size: self.cfg.block_size as u32,
                min_update_index: self.min_update_index,
                max_update_index: self.max_update_index,
            },
            ref_index_root: self.ref_index_root,
            obj_index_root: self.obj_index_root,
            obj_id_len: self.obj_id_len,
            log_index_root: self.log_index_root,
        };
        self.write_all(&footer.encode())?;
        self.finished = true;
        self.stats.obj_id_len = self.obj_id_len;
        self.stats.total_bytes = self.position;

        tracing::debug!(
            bytes = self.position,
            refs = self.stats.ref_count,
            objs = self.stats.obj_count,
            logs = self.stats.log_count,
            "sealed table"
        );
        Ok(())
    }

    /// Bytes the table would occupy if finished now, ignoring indexes that
    /// have not been written yet.
    pub fn estimate_total_bytes(&self) -> u64 {
        if !self.begun {
            return (FILE_HEADER_LEN + FOOTER_LEN) as u64;
        }
        if self.finished {
            return self.position;
        }
        let pending = self
            .block
            .as_ref()
            .filter(|b| !b.is_empty())
            .map(|b| b.estimated_len() as u64)
            .unwrap_or(0);
        self.position + pending + FOOTER_LEN as u64
    }

    pub fn stats(&self) -> Stats {
        self.stats.clone()
    }

    /// Consumes the writer, returning the output sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn require_open(&self) -> Result<()> {
        if !self.begun {
            return errcontract!("writer has not begun");
        }
        if self.finished {
            return errcontract!("table already finished");
        }
        Ok(())
    }

    fn check_update_index(&self, update_index: u64) -> Result<()> {
        if update_index < self.min_update_index || update_index > self.max_update_index {
            return errcontract!(
                "update index {update_index} outside [{}, {}]",
                self.min_update_index,
                self.max_update_index
            );
        }
        Ok(())
    }

    fn record_obj(&mut self, id: ObjectId) {
        let offsets = self.obj_positions.entry(id).or_default();
        if offsets.last() != Some(&self.block_offset) {
            offsets.push(self.block_offset);
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Pads to the next block boundary when alignment is on, then reports
    /// where the next block will start.
    fn pad_for_block(&mut self) -> Result<u64> {
        if self.cfg.align_blocks && self.position != FILE_HEADER_LEN as u64 {
            let block_size = self.cfg.block_size as u64;
            let rem = self.position % block_size;
            if rem != 0 {
                let pad = (block_size - rem) as usize;
                self.write_all(&vec![0u8; pad])?;
                self.stats.padding_bytes += pad as u64;
            }
        }
        Ok(self.position)
    }

    fn open_block(&mut self, block_type: BlockType) -> Result<()> {
        let offset = self.pad_for_block()?;
        self.block_offset = offset;
        // The first block shares its budget with the file header.
        let limit = if offset == FILE_HEADER_LEN as u64 {
            self.cfg.block_size - FILE_HEADER_LEN
        } else {
            self.cfg.block_size
        };
        self.block = Some(Builder::new(block_type, limit, self.cfg.restart_interval));
        Ok(())
    }

    fn append_record(
        &mut self,
        block_type: BlockType,
        key: &[u8],
        vtype: u8,
        value: &[u8],
    ) -> Result<()> {
        if self.block.is_none() {
            self.open_block(block_type)?;
        }
        if let Some(block) = self.block.as_mut() {
            if block.add(key, vtype, value) {
                return Ok(());
            }
            if block.is_empty() {
                return Err(record_too_large(key, vtype, value));
            }
        }
        self.flush_block()?;
        self.open_block(block_type)?;
        if let Some(block) = self.block.as_mut() {
            if block.add(key, vtype, value) {
                return Ok(());
            }
        }
        Err(record_too_large(key, vtype, value))
    }

    fn flush_block(&mut self) -> Result<()> {
        let block = match self.block.take() {
            Some(block) => block,
            None => return Ok(()),
        };
        if block.is_empty() {
            return Ok(());
        }
        let block_type = block.block_type();
        let last_key = block.last_key().to_vec();
        let compress = block_type == BlockType::Log && self.cfg.compress_logs;
        let bytes = block.finish(compress)?;
        let offset = self.block_offset;
        self.write_all(&bytes)?;

        match block_type {
            BlockType::Ref => {
                self.ref_index.push(last_key, offset);
                self.stats.ref_blocks += 1;
                self.stats.ref_bytes += bytes.len() as u64;
            }
            BlockType::Obj => {
                self.obj_index.push(last_key, offset);
                self.stats.obj_blocks += 1;
                self.stats.obj_bytes += bytes.len() as u64;
            }
            BlockType::Log => {
                self.log_index.push(last_key, offset);
                self.stats.log_blocks += 1;
                self.stats.log_bytes += bytes.len() as u64;
            }
            BlockType::Index => {}
        }
        Ok(())
    }

    fn finish_refs_and_objs(&mut self) -> Result<()> {
        if self.section == Section::Objs || self.section == Section::Logs {
            return Ok(());
        }
        self.flush_block()?;
        if self.ref_index.len() > 1 {
            let level0 = std::mem::take(&mut self.ref_index);
            let (root, levels, bytes) = self.write_index_pyramid(level0)?;
            self.ref_index_root = root;
            self.stats.ref_index_levels = levels;
            self.stats.ref_index_bytes = bytes;
        }
        self.write_obj_section()?;
        self.section = Section::Objs;
        Ok(())
    }

    fn write_obj_section(&mut self) -> Result<()> {
        if !self.cfg.index_objects || self.obj_positions.is_empty() {
            return Ok(());
        }

        // Shortest prefix (at least two bytes) unique across the indexed set.
        let mut prefix_len = 2usize;
        let ids: Vec<ObjectId> = self.obj_positions.keys().copied().collect();
        for pair in ids.windows(2) {
            let common = pair[0]
                .as_bytes()
                .iter()
                .zip(pair[1].as_bytes())
                .take_while(|(a, b)| a == b)
                .count();
            prefix_len = prefix_len.max(common + 1);
        }
        let prefix_len = prefix_len.min(OBJECT_ID_LEN);
        self.obj_id_len = prefix_len as u8;

        let positions = std::mem::take(&mut self.obj_positions);
        for (id, offsets) in &positions {
            let mut value = Vec::new();
            let vtype = encode_obj_payload(&mut value, offsets);
            let key = &id.as_bytes()[..prefix_len];
            self.append_record(BlockType::Obj, key, vtype, &value)?;
            self.stats.obj_count += 1;
        }
        self.flush_block()?;

        if self.obj_index.len() > 1 {
            let level0 = std::mem::take(&mut self.obj_index);
            let (root, levels, bytes) = self.write_index_pyramid(level0)?;
            self.obj_index_root = root;
            self.stats.obj_index_levels = levels;
            self.stats.obj_index_bytes = bytes;
        }
        Ok(())
    }

    /// Writes index levels bottom-up until one block covers the level, and
    /// returns `(root offset, levels, bytes written)`. When the configured
    /// level cap is hit, the top level becomes a single oversized flat
    /// block, which readers tolerate.
    fn write_index_pyramid(&mut self, level0: Index) -> Result<(u64, usize, u64)> {
        if level0.is_empty() {
            return Ok((0, 0, 0));
        }
        let mut level = level0.into_entries();
        let mut levels = 0usize;
        let mut total = 0u64;
        loop {
            levels += 1;
            let flat = self.cfg.max_index_levels != 0 && levels >= self.cfg.max_index_levels;
            let (parent, bytes) = self.emit_index_level(&level, flat)?;
            total += bytes;
            if parent.len() <= 1 {
                let root = parent.first().map(|(_, offset)| *offset).unwrap_or(0);
                return Ok((root, levels, total));
            }
            level = parent;
        }
    }

    fn emit_index_level(
        &mut self,
        entries: &[(Vec<u8>, u64)],
        flat: bool,
    ) -> Result<(Vec<(Vec<u8>, u64)>, u64)> {
        let mut parent = Vec::new();
        let mut written = 0u64;
        let mut open: Option<(Builder, u64)> = None;

        for (key, offset) in entries {
            let mut value = Vec::new();
            let vtype = encode_index_payload(&mut value, *offset);
            loop {
                if open.is_none() {
                    let at = self.pad_for_block()?;
                    let limit = if flat {
                        usize::MAX
                    } else if at == FILE_HEADER_LEN as u64 {
                        self.cfg.block_size - FILE_HEADER_LEN
                    } else {
                        self.cfg.block_size
                    };
                    open = Some((
                        Builder::new(BlockType::Index, limit, self.cfg.restart_interval),
                        at,
                    ));
                }
                if let Some((builder, _)) = open.as_mut() {
                    if builder.add(key, vtype, &value) {
                        break;
                    }
                    if builder.is_empty() {
                        return Err(record_too_large(key, vtype, &value));
                    }
                }
                if let Some((builder, at)) = open.take() {
                    written += self.emit_index_block(builder, at, &mut parent)?;
                }
            }
        }
        if let Some((builder, at)) = open.take() {
            if !builder.is_empty() {
                written += self.emit_index_block(builder, at, &mut parent)?;
            }
        }
        Ok((parent, written))
    }

    fn emit_index_block(
        &mut self,
        builder: Builder,
        offset: u64,
        parent: &mut Vec<(Vec<u8>, u64)>,
    ) -> Result<u64> {
        let last_key = builder.last_key().to_vec();
        let bytes = builder.finish(false)?;
        self.write_all(&bytes)?;
        parent.push((last_key, offset));
        Ok(bytes.len() as u64)
    }
}

fn record_too_large(key: &[u8], vtype: u8, value: &[u8]) -> Error {
    let entry = varint_len(0)
        + varint_len(((key.len() as u64) << 3) | u64::from(vtype))
        + key.len()
        + value.len();
    Error::BlockSizeTooSmall {
        required: FILE_HEADER_LEN + BLOCK_HEADER_LEN + entry + 5,
    }
}
