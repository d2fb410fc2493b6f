//! Compactor: merges a chronologically ordered stack of tables into one
//! physical table. The merged view supplies last-writer-wins reconciliation
//! and the writer re-serializes the surviving records; with deletes
//! excluded (the default) tombstones and deleted log entries are pruned
//! instead of copied forward.

use std::io::Write;

use crate::config::Config;
use crate::error::Result;
use crate::merged::MergedReader;
use crate::reader::Reader;
use crate::source::BlockSource;
use crate::writer::{Stats, Writer};

/// Statistics from one compaction: the writer's own numbers plus input
/// record counts.
#[derive(Clone, Debug, Default)]
pub struct CompactionStats {
    pub tables: usize,
    pub refs_in: u64,
    pub logs_in: u64,
    pub output: Stats,
}

pub struct Compactor<S: BlockSource, W: Write> {
    out: W,
    cfg: Config,
    include_deletes: bool,
    readers: Vec<Reader<S>>,
    stats: Option<CompactionStats>,
}

impl<S: BlockSource, W: Write> Compactor<S, W> {
    pub fn new(out: W) -> Self {
        Self::with_config(Config::default(), out)
    }

    pub fn with_config(cfg: Config, out: W) -> Self {
        Self {
            out,
            cfg,
            include_deletes: false,
            readers: Vec::new(),
            stats: None,
        }
    }

    /// When true, tombstones survive compaction; when false (default) they
    /// and the records they shadow are dropped entirely.
    pub fn set_include_deletes(&mut self, include: bool) {
        self.include_deletes = include;
    }

    /// Appends input tables, oldest first.
    pub fn add_all(&mut self, readers: Vec<Reader<S>>) {
        self.readers.extend(readers);
    }

    /// Merges all inputs into one table on the output sink. The output's
    /// update-index range spans the inputs'.
    pub fn compact(&mut self) -> Result<()> {
        let readers = std::mem::take(&mut self.readers);
        let tables = readers.len();
        let mut merged = MergedReader::new(readers);
        merged.set_include_deletes(self.include_deletes);
        let min = merged.min_update_index();
        let max = merged.max_update_index();

        tracing::debug!(
            tables,
            min_update_index = min,
            max_update_index = max,
            "starting compaction"
        );

        let mut writer = Writer::new(self.cfg.clone(), &mut self.out);
        writer.begin(min, max)?;

        let mut refs_in = 0u64;
        for record in merged.all_refs()? {
            let r = record?;
            refs_in += 1;
            writer.write_ref(&r)?;
        }

        let mut logs_in = 0u64;
        for record in merged.all_logs()? {
            let log = record?;
            logs_in += 1;
            match log.entry {
                Some(entry) => writer.write_log(
                    &log.name,
                    log.update_index,
                    &entry.who,
                    entry.old_id,
                    entry.new_id,
                    &entry.message,
                )?,
                None => writer.delete_log(&log.name, log.update_index)?,
            }
        }

        writer.finish()?;
        let output = writer.stats();

        tracing::info!(
            tables,
            refs = output.ref_count,
            logs = output.log_count,
            bytes = output.total_bytes,
            "finished compaction"
        );
        self.stats = Some(CompactionStats {
            tables,
            refs_in,
            logs_in,
            output,
        });
        Ok(())
    }

    pub fn stats(&self) -> Option<&CompactionStats> {
        self.stats.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BufSource;
    use crate::types::{Log, ObjectId, Ref, Signature, OBJECT_ID_LEN};

    const MASTER: &str = "refs/heads/master";
    const NEXT: &str = "refs/heads/next";

    fn oid(n: u32) -> ObjectId {
        let mut raw = [0u8; OBJECT_ID_LEN];
        raw[0..4].copy_from_slice(&n.to_le_bytes());
        ObjectId::from_raw(raw)
    }

    fn who() -> Signature {
        Signature::new("Log", "Ger", 1_500_079_709, -480)
    }

    fn table(min: u64, max: u64, refs: &[Ref]) -> Reader<BufSource> {
        let mut writer = Writer::new(Config::default(), Vec::new());
        writer.begin(min, max).expect("begin");
        writer.write_sorted_refs(refs).expect("refs");
        writer.finish().expect("finish");
        Reader::new(BufSource::new(writer.into_inner())).expect("reader")
    }

    fn compact(
        readers: Vec<Reader<BufSource>>,
        include_deletes: bool,
    ) -> (Reader<BufSource>, CompactionStats) {
        let mut compactor = Compactor::new(Vec::new());
        compactor.set_include_deletes(include_deletes);
        compactor.add_all(readers);
        compactor.compact().expect("compact");
        let stats = compactor.stats().expect("stats").clone();
        let reader = Reader::new(BufSource::new(compactor.into_inner())).expect("reader");
        (reader, stats)
    }

    #[test]
    fn test_no_tables() {
        let (out, stats) = compact(Vec::new(), false);
        assert_eq!(stats.output.min_update_index, 0);
        assert_eq!(stats.output.max_update_index, 0);
        assert_eq!(stats.output.ref_count, 0);
        assert!(out.all_refs().expect("cursor").next().is_none());
    }

    #[test]
    fn test_one_table_is_idempotent() {
        let mut writer = Writer::new(Config::default(), Vec::new());
        writer.begin(0, 0).expect("begin");
        writer.write_ref(&Ref::direct(MASTER, oid(1), 0)).expect("ref");
        writer.write_ref(&Ref::direct(NEXT, oid(2), 0)).expect("ref");
        writer
            .write_log(MASTER, 0, &who(), ObjectId::zero(), oid(1), "made")
            .expect("log");
        writer.finish().expect("finish");
        let table_bytes = writer.into_inner();

        let input = Reader::new(BufSource::new(table_bytes.clone())).expect("reader");
        let (out, stats) = compact(vec![input], false);
        assert_eq!(stats.output.min_update_index, 0);
        assert_eq!(stats.output.max_update_index, 0);
        assert_eq!(stats.output.ref_count, 2);
        assert_eq!(stats.refs_in, 2);

        let original = Reader::new(BufSource::new(table_bytes)).expect("reader");
        let original_refs: Vec<Ref> = original
            .all_refs()
            .expect("cursor")
            .map(|r| r.expect("record"))
            .collect();
        let compacted_refs: Vec<Ref> = out
            .all_refs()
            .expect("cursor")
            .map(|r| r.expect("record"))
            .collect();
        assert_eq!(original_refs, compacted_refs);

        let original_logs: Vec<Log> = original
            .all_logs()
            .expect("cursor")
            .map(|l| l.expect("record"))
            .collect();
        let compacted_logs: Vec<Log> = out
            .all_logs()
            .expect("cursor")
            .map(|l| l.expect("record"))
            .collect();
        assert_eq!(original_logs, compacted_logs);
    }

    #[test]
    fn test_two_tables_one_ref() {
        let t0 = table(0, 0, &[Ref::direct(MASTER, oid(1), 0)]);
        let t1 = table(1, 1, &[Ref::direct(MASTER, oid(2), 1)]);
        let (out, stats) = compact(vec![t0, t1], false);

        assert_eq!(stats.output.min_update_index, 0);
        assert_eq!(stats.output.max_update_index, 1);
        assert_eq!(stats.output.ref_count, 1);
        assert_eq!(stats.tables, 2);

        let r = out.exact_ref(MASTER).expect("lookup").expect("found");
        assert_eq!(r.object_id(), Some(&oid(2)));
        assert_eq!(r.update_index, 1);
        assert_eq!(out.min_update_index(), 0);
        assert_eq!(out.max_update_index(), 1);
    }

    #[test]
    fn test_two_tables_two_refs() {
        let t0 = table(0, 0, &[
            Ref::direct(MASTER, oid(1), 0),
            Ref::direct(NEXT, oid(2), 0),
        ]);
        let t1 = table(1, 1, &[Ref::direct(MASTER, oid(3), 1)]);
        let (out, stats) = compact(vec![t0, t1], false);

        assert_eq!(stats.output.ref_count, 2);
        let refs: Vec<(String, u64)> = out
            .all_refs()
            .expect("cursor")
            .map(|r| {
                let r = r.expect("record");
                (r.name.clone(), r.update_index)
            })
            .collect();
        assert_eq!(
            refs,
            vec![(MASTER.to_string(), 1), (NEXT.to_string(), 0)]
        );
        let r = out.exact_ref(MASTER).expect("lookup").expect("found");
        assert_eq!(r.object_id(), Some(&oid(3)));
    }

    #[test]
    fn test_tombstone_pruned_by_default() {
        let t0 = table(0, 0, &[Ref::direct(MASTER, oid(1), 0)]);
        let t1 = table(1, 1, &[Ref::tombstone(MASTER, 1)]);
        let (out, stats) = compact(vec![t0, t1], false);

        assert_eq!(stats.output.ref_count, 0);
        assert_eq!(stats.output.min_update_index, 0);
        assert_eq!(stats.output.max_update_index, 1);
        assert!(out.all_refs().expect("cursor").next().is_none());

        let mut out = out;
        out.set_include_deletes(true);
        assert!(out.all_refs().expect("cursor").next().is_none());
    }

    #[test]
    fn test_tombstone_kept_on_request() {
        let t0 = table(0, 0, &[Ref::direct(MASTER, oid(1), 0)]);
        let t1 = table(1, 1, &[Ref::tombstone(MASTER, 1)]);
        let (out, stats) = compact(vec![t0, t1], true);

        assert_eq!(stats.output.ref_count, 1);
        // The record is a tombstone, so default reads still hide it.
        assert!(out.all_refs().expect("cursor").next().is_none());

        let mut out = out;
        out.set_include_deletes(true);
        let mut cursor = out.all_refs().expect("cursor");
        let r = cursor.next().expect("some").expect("record");
        assert!(r.is_tombstone());
        assert_eq!(r.update_index, 1);
    }

    fn log_table(min: u64, max: u64, entries: &[(&str, u64, Option<&str>)]) -> Reader<BufSource> {
        let mut writer = Writer::new(Config::default(), Vec::new());
        writer.begin(min, max).expect("begin");
        for (name, index, message) in entries {
            match message {
                Some(message) => writer
                    .write_log(name, *index, &who(), ObjectId::zero(), oid(1), message)
                    .expect("log"),
                None => writer.delete_log(name, *index).expect("tombstone"),
            }
        }
        writer.finish().expect("finish");
        Reader::new(BufSource::new(writer.into_inner())).expect("reader")
    }

    #[test]
    fn test_log_merge_masks_and_prunes() {
        let t0 = log_table(
            1,
            2,
            &[(MASTER, 2, Some("old")), (MASTER, 1, Some("keep"))],
        );
        let t1 = log_table(2, 2, &[(MASTER, 2, Some("new"))]);
        let (out, stats) = compact(vec![t0, t1], false);

        assert_eq!(stats.output.log_count, 2);
        let messages: Vec<String> = out
            .all_logs()
            .expect("cursor")
            .map(|l| l.expect("record").entry.expect("entry").message)
            .collect();
        assert_eq!(messages, vec!["new".to_string(), "keep".to_string()]);
    }

    #[test]
    fn test_log_tombstone_drops_entry() {
        let t0 = log_table(1, 1, &[(MASTER, 1, Some("gone"))]);
        let t1 = log_table(1, 1, &[(MASTER, 1, None)]);

        let (out, stats) = compact(vec![t0, t1], false);
        assert_eq!(stats.output.log_count, 0);
        assert!(out.all_logs().expect("cursor").next().is_none());

        // With deletes included the tombstone itself is carried forward.
        let t0 = log_table(1, 1, &[(MASTER, 1, Some("gone"))]);
        let t1 = log_table(1, 1, &[(MASTER, 1, None)]);
        let (out, stats) = compact(vec![t0, t1], true);
        assert_eq!(stats.output.log_count, 1);
        let mut out = out;
        out.set_include_deletes(true);
        let l = out
            .all_logs()
            .expect("cursor")
            .next()
            .expect("some")
            .expect("record");
        assert!(l.entry.is_none());
    }

    #[test]
    fn test_compacted_output_serves_object_lookups() {
        let t0 = table(0, 0, &[Ref::direct(MASTER, oid(1), 0)]);
        let t1 = table(1, 1, &[Ref::direct(MASTER, oid(2), 1)]);
        let (out, _) = compact(vec![t0, t1], false);

        assert!(out.has_object_map().expect("sections"));
        assert!(out.by_object_id(oid(1)).expect("cursor").next().is_none());
        let r = out
            .by_object_id(oid(2))
            .expect("cursor")
            .next()
            .expect("some")
            .expect("record");
        assert_eq!(r.name, MASTER);
    }
}
