//! RocksDB-backed wide-column store.
//!
//! Cells are mapped onto RocksDB as `[row_len: u16 BE][row][qualifier]` keys
//! inside a column family, with a `[ts: u64 BE][payload]` value envelope.
//! The length prefix keeps qualifier ordering intact within a row while
//! allowing row-prefix iteration.
//!
//! Writes are last-write-wins by cell timestamp: a put or delete carrying a
//! timestamp older than the stored cell is a no-op. Compare-and-set and
//! atomic increments run inside a RocksDB transaction, which provides the
//! single-cell atomicity the commit protocol is built on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use rocksdb::{IteratorMode, Options, TransactionDB, TransactionDBOptions};

use super::{Cell, Family, PointGet, RangeGet, EDGE_CF, VERTEX_CF};
use crate::TimestampMilli;

/// Read-side counters, exposed so callers can assert on physical read
/// amplification.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    reads: AtomicU64,
}

impl StoreMetrics {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wide-column store over a RocksDB `TransactionDB`.
pub struct Store {
    db_path: PathBuf,
    db: Option<TransactionDB>,
    metrics: StoreMetrics,
}

impl Store {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: PathBuf::from(db_path),
            db: None,
            metrics: StoreMetrics::default(),
        }
    }

    /// Open the database and create missing column families.
    pub fn ready(&mut self) -> Result<()> {
        if self.db.is_some() {
            return Ok(());
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = [VERTEX_CF, EDGE_CF]
            .iter()
            .map(|name| rocksdb::ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = TransactionDB::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            &self.db_path,
            cf_descriptors,
        )
        .with_context(|| format!("Failed to open store at {}", self.db_path.display()))?;

        self.db = Some(db);
        tracing::info!(path = %self.db_path.display(), "Store ready");
        Ok(())
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    fn db(&self) -> Result<&TransactionDB> {
        self.db
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Store at {} is not ready", self.db_path.display()))
    }

    fn cf<'a>(
        &self,
        db: &'a TransactionDB,
        family: Family,
    ) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'a>>> {
        db.cf_handle(family.cf_name())
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", family.cf_name()))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Point read of a row, optionally restricted to the given qualifiers.
    pub fn get(&self, request: &PointGet) -> Result<Vec<Cell>> {
        self.metrics.record_read();
        let db = self.db()?;
        let cf = self.cf(db, request.family)?;

        match &request.qualifiers {
            Some(qualifiers) => {
                let mut cells = Vec::with_capacity(qualifiers.len());
                for qualifier in qualifiers {
                    let key = encode_key(&request.row, qualifier);
                    if let Some(raw) = db.get_cf(&cf, &key)? {
                        let (ts, payload) = decode_value(&raw)?;
                        cells.push(Cell {
                            row: request.row.clone(),
                            qualifier: qualifier.clone(),
                            value: payload.to_vec(),
                            ts,
                        });
                    }
                }
                Ok(cells)
            }
            None => self.scan_row(db, request.family, &request.row, |_, _| true, usize::MAX),
        }
    }

    /// Ranged read over the qualifiers of one row.
    ///
    /// Bounds are inclusive; timestamps are filtered as `min_ts <= ts < max_ts`
    /// and `offset`/`limit` apply after filtering.
    pub fn scan(&self, request: &RangeGet) -> Result<Vec<Cell>> {
        self.metrics.record_read();
        let db = self.db()?;

        let min = request.min_qualifier.as_deref();
        let max = request.max_qualifier.as_deref();
        let mut skipped = 0usize;
        let mut cells = Vec::new();

        let start = encode_key(&request.row, min.unwrap_or(&[]));
        let prefix = encode_key(&request.row, &[]);
        let cf = self.cf(db, request.family)?;
        let iter = db.iterator_cf(&cf, IteratorMode::From(&start, rocksdb::Direction::Forward));
        for item in iter {
            let (key, raw) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let qualifier = &key[prefix.len()..];
            if let Some(max) = max {
                if qualifier > max {
                    break;
                }
            }
            let (ts, payload) = decode_value(&raw)?;
            if ts < request.min_ts || ts >= request.max_ts {
                continue;
            }
            if skipped < request.offset {
                skipped += 1;
                continue;
            }
            cells.push(Cell {
                row: request.row.clone(),
                qualifier: qualifier.to_vec(),
                value: payload.to_vec(),
                ts,
            });
            if cells.len() >= request.limit {
                break;
            }
        }
        Ok(cells)
    }

    fn scan_row(
        &self,
        db: &TransactionDB,
        family: Family,
        row: &[u8],
        mut keep: impl FnMut(&[u8], u64) -> bool,
        limit: usize,
    ) -> Result<Vec<Cell>> {
        let prefix = encode_key(row, &[]);
        let cf = self.cf(db, family)?;
        let iter = db.iterator_cf(&cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        let mut cells = Vec::new();
        for item in iter {
            let (key, raw) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let qualifier = &key[prefix.len()..];
            let (ts, payload) = decode_value(&raw)?;
            if !keep(qualifier, ts) {
                continue;
            }
            cells.push(Cell {
                row: row.to_vec(),
                qualifier: qualifier.to_vec(),
                value: payload.to_vec(),
                ts,
            });
            if cells.len() >= limit {
                break;
            }
        }
        Ok(cells)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a cell. A put older than the stored cell's timestamp is dropped,
    /// so concurrent eventual-consistency writers converge on the newest ts.
    pub fn put(&self, family: Family, row: &[u8], qualifier: &[u8], value: &[u8], ts: u64) -> Result<()> {
        let db = self.db()?;
        let cf = self.cf(db, family)?;
        let key = encode_key(row, qualifier);

        let txn = db.transaction();
        if let Some(raw) = txn.get_for_update_cf(&cf, &key, true)? {
            let (current_ts, _) = decode_value(&raw)?;
            if current_ts > ts {
                return Ok(());
            }
        }
        txn.put_cf(&cf, &key, encode_value(ts, value))?;
        txn.commit().context("Failed to commit put")?;
        Ok(())
    }

    /// Remove a cell, provided the stored timestamp is not newer than `ts`.
    pub fn delete(&self, family: Family, row: &[u8], qualifier: &[u8], ts: u64) -> Result<()> {
        let db = self.db()?;
        let cf = self.cf(db, family)?;
        let key = encode_key(row, qualifier);

        let txn = db.transaction();
        match txn.get_for_update_cf(&cf, &key, true)? {
            None => return Ok(()),
            Some(raw) => {
                let (current_ts, _) = decode_value(&raw)?;
                if current_ts > ts {
                    return Ok(());
                }
            }
        }
        txn.delete_cf(&cf, &key)?;
        txn.commit().context("Failed to commit delete")?;
        Ok(())
    }

    /// Remove every qualifier of a row with a stored timestamp `<= ts`.
    pub fn delete_row(&self, family: Family, row: &[u8], ts: u64) -> Result<()> {
        let db = self.db()?;
        let cf = self.cf(db, family)?;
        let prefix = encode_key(row, &[]);

        let txn = db.transaction();
        let iter = db.iterator_cf(&cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, raw) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (current_ts, _) = decode_value(&raw)?;
            if current_ts <= ts {
                txn.delete_cf(&cf, &key)?;
            }
        }
        txn.commit().context("Failed to commit row delete")?;
        Ok(())
    }

    /// Compare-and-set on a cell's payload bytes.
    ///
    /// `expected` empty means "cell absent". On success the cell is written
    /// with the given timestamp; the boolean result reports whether the swap
    /// happened.
    pub fn compare_and_set(
        &self,
        family: Family,
        row: &[u8],
        qualifier: &[u8],
        expected: &[u8],
        new_value: &[u8],
        ts: u64,
    ) -> Result<bool> {
        let db = self.db()?;
        let cf = self.cf(db, family)?;
        let key = encode_key(row, qualifier);

        let txn = db.transaction();
        let current = txn.get_for_update_cf(&cf, &key, true)?;
        let matches = match &current {
            None => expected.is_empty(),
            Some(raw) => {
                let (_, payload) = decode_value(raw)?;
                payload == expected
            }
        };
        if !matches {
            return Ok(false);
        }
        txn.put_cf(&cf, &key, encode_value(ts, new_value))?;
        match txn.commit() {
            Ok(()) => Ok(true),
            // A commit conflict means another writer won the race.
            Err(e) if e.kind() == rocksdb::ErrorKind::Busy => Ok(false),
            Err(e) if e.kind() == rocksdb::ErrorKind::TryAgain => Ok(false),
            Err(e) => Err(e).context("Failed to commit compare-and-set"),
        }
    }

    /// Atomically add `amount` to the 8-byte big-endian counter stored in the
    /// cell, creating it at zero when absent. Returns the new value.
    pub fn atomic_increment(&self, family: Family, row: &[u8], qualifier: &[u8], amount: i64) -> Result<i64> {
        let db = self.db()?;
        let cf = self.cf(db, family)?;
        let key = encode_key(row, qualifier);

        let txn = db.transaction();
        let current = match txn.get_for_update_cf(&cf, &key, true)? {
            None => 0i64,
            Some(raw) => {
                let (_, payload) = decode_value(&raw)?;
                if payload.len() != 8 {
                    anyhow::bail!("counter cell has invalid length {}", payload.len());
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(payload);
                i64::from_be_bytes(buf)
            }
        };
        let next = current + amount;
        txn.put_cf(&cf, &key, encode_value(TimestampMilli::now().0, &next.to_be_bytes()))?;
        txn.commit().context("Failed to commit increment")?;
        Ok(next)
    }
}

fn encode_key(row: &[u8], qualifier: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + row.len() + qualifier.len());
    key.extend_from_slice(&(row.len() as u16).to_be_bytes());
    key.extend_from_slice(row);
    key.extend_from_slice(qualifier);
    key
}

fn encode_value(ts: u64, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + payload.len());
    value.extend_from_slice(&ts.to_be_bytes());
    value.extend_from_slice(payload);
    value
}

fn decode_value(raw: &[u8]) -> Result<(u64, &[u8])> {
    if raw.len() < 8 {
        anyhow::bail!("invalid cell value: expected >= 8 bytes, got {}", raw.len());
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[0..8]);
    Ok((u64::from_be_bytes(ts), &raw[8..]))
}
