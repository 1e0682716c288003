// Sorting support for the Sort operator: in-memory when the input fits
// the working-memory budget, external merge sort with spilled runs
// otherwise. Runs are plain files of self-describing rows in the
// configured scratch directory, deleted when the iterator drops.

use crate::common::{Row, Value};
use crate::error::{DbError, Result};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Bytes of row data buffered before spilling a run.
    pub memory_budget: usize,
    pub temp_dir: PathBuf,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            memory_budget: 16 * 1024 * 1024,
            temp_dir: std::env::temp_dir().join("anchordb").join("sort"),
        }
    }
}

/// Accumulates rows with precomputed sort keys, spilling sorted runs
/// when the budget is exceeded.
pub struct Sorter {
    config: SortConfig,
    desc: Vec<bool>,
    buffer: Vec<(Vec<Value>, Row)>,
    buffered_bytes: usize,
    runs: Vec<PathBuf>,
}

impl Sorter {
    pub fn new(config: SortConfig, desc: Vec<bool>) -> Self {
        Self {
            config,
            desc,
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
        }
    }

    pub fn push(&mut self, keys: Vec<Value>, row: Row) -> Result<()> {
        self.buffered_bytes += row_bytes(&keys) + row_bytes(&row);
        self.buffer.push((keys, row));
        if self.buffered_bytes > self.config.memory_budget {
            self.spill_run()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<SortedRows> {
        self.sort_buffer();
        if self.runs.is_empty() {
            let rows: Vec<Row> = std::mem::take(&mut self.buffer)
                .into_iter()
                .map(|(_, row)| row)
                .collect();
            return Ok(SortedRows::Memory(rows.into_iter()));
        }
        if !self.buffer.is_empty() {
            self.spill_run()?;
        }
        let mut readers = Vec::with_capacity(self.runs.len());
        for path in &self.runs {
            let file = File::open(path)?;
            let mut reader = BufReader::new(file);
            let head = read_entry(&mut reader)?;
            readers.push(RunReader { reader, head });
        }
        Ok(SortedRows::External(MergeIter {
            readers,
            paths: std::mem::take(&mut self.runs),
            desc: self.desc.clone(),
        }))
    }

    fn sort_buffer(&mut self) {
        let desc = self.desc.clone();
        self.buffer
            .sort_by(|a, b| compare_keys(&a.0, &b.0, &desc));
    }

    fn spill_run(&mut self) -> Result<()> {
        self.sort_buffer();
        std::fs::create_dir_all(&self.config.temp_dir)?;
        let id = RUN_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        let path = self
            .config
            .temp_dir
            .join(format!("run-{}-{}.tmp", std::process::id(), id));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        for (keys, row) in self.buffer.drain(..) {
            write_entry(&mut writer, &keys, &row)?;
        }
        writer.flush()?;
        self.runs.push(path);
        self.buffered_bytes = 0;
        Ok(())
    }
}

struct RunReader {
    reader: BufReader<File>,
    head: Option<(Vec<Value>, Row)>,
}

pub struct MergeIter {
    readers: Vec<RunReader>,
    paths: Vec<PathBuf>,
    desc: Vec<bool>,
}

pub enum SortedRows {
    Memory(std::vec::IntoIter<Row>),
    External(MergeIter),
}

impl SortedRows {
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match self {
            SortedRows::Memory(iter) => Ok(iter.next()),
            SortedRows::External(merge) => merge.next_row(),
        }
    }
}

impl MergeIter {
    fn next_row(&mut self) -> Result<Option<Row>> {
        let mut min_idx: Option<usize> = None;
        for (i, reader) in self.readers.iter().enumerate() {
            if let Some((keys, _)) = &reader.head {
                let better = match min_idx {
                    None => true,
                    Some(m) => {
                        let (mkeys, _) = self.readers[m].head.as_ref().unwrap();
                        compare_keys(keys, mkeys, &self.desc) == Ordering::Less
                    }
                };
                if better {
                    min_idx = Some(i);
                }
            }
        }
        match min_idx {
            None => Ok(None),
            Some(i) => {
                let reader = &mut self.readers[i];
                let (_, row) = reader.head.take().expect("head present");
                reader.head = read_entry(&mut reader.reader)?;
                Ok(Some(row))
            }
        }
    }
}

impl Drop for MergeIter {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Lexicographic comparison of key tuples, honoring per-key direction.
/// NULLs order first ascending (last descending).
pub fn compare_keys(a: &[Value], b: &[Value], desc: &[bool]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let ord = x.sort_cmp(y);
        let ord = if desc.get(i).copied().unwrap_or(false) {
            ord.reverse()
        } else {
            ord
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn row_bytes(row: &[Value]) -> usize {
    row.iter()
        .map(|v| match v {
            Value::Null => 1,
            Value::Integer(_) | Value::Real(_) => 9,
            Value::Boolean(_) => 2,
            Value::Text(s) => 5 + s.len(),
            Value::Blob(b) => 5 + b.len(),
        })
        .sum::<usize>()
        + 24
}

// ---- run-file codec: self-describing values, little-endian ----

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BLOB: u8 = 5;

fn write_entry(writer: &mut impl Write, keys: &[Value], row: &[Value]) -> Result<()> {
    write_values(writer, keys)?;
    write_values(writer, row)?;
    Ok(())
}

fn write_values(writer: &mut impl Write, values: &[Value]) -> Result<()> {
    writer.write_all(&(values.len() as u16).to_le_bytes())?;
    for value in values {
        match value {
            Value::Null => writer.write_all(&[TAG_NULL])?,
            Value::Integer(i) => {
                writer.write_all(&[TAG_INT])?;
                writer.write_all(&i.to_le_bytes())?;
            }
            Value::Real(r) => {
                writer.write_all(&[TAG_REAL])?;
                writer.write_all(&r.to_le_bytes())?;
            }
            Value::Boolean(b) => writer.write_all(&[TAG_BOOL, *b as u8])?,
            Value::Text(s) => {
                writer.write_all(&[TAG_TEXT])?;
                writer.write_all(&(s.len() as u32).to_le_bytes())?;
                writer.write_all(s.as_bytes())?;
            }
            Value::Blob(b) => {
                writer.write_all(&[TAG_BLOB])?;
                writer.write_all(&(b.len() as u32).to_le_bytes())?;
                writer.write_all(b)?;
            }
        }
    }
    Ok(())
}

/// `None` at a clean end of file.
fn read_entry(reader: &mut impl Read) -> Result<Option<(Vec<Value>, Row)>> {
    let keys = match read_values(reader, true)? {
        None => return Ok(None),
        Some(values) => values,
    };
    let row = read_values(reader, false)?
        .ok_or_else(|| DbError::Storage("truncated sort run".into()))?;
    Ok(Some((keys, row)))
}

fn read_values(reader: &mut impl Read, eof_ok: bool) -> Result<Option<Vec<Value>>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && eof_ok => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let count = u16::from_le_bytes(len_buf) as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        let value = match tag[0] {
            TAG_NULL => Value::Null,
            TAG_INT => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Value::Integer(i64::from_le_bytes(buf))
            }
            TAG_REAL => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Value::Real(f64::from_le_bytes(buf))
            }
            TAG_BOOL => {
                let mut buf = [0u8; 1];
                reader.read_exact(&mut buf)?;
                Value::Boolean(buf[0] != 0)
            }
            TAG_TEXT => {
                let mut len = [0u8; 4];
                reader.read_exact(&mut len)?;
                let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
                reader.read_exact(&mut buf)?;
                Value::Text(String::from_utf8(buf).map_err(|_| {
                    DbError::Storage("invalid utf-8 in sort run".into())
                })?)
            }
            TAG_BLOB => {
                let mut len = [0u8; 4];
                reader.read_exact(&mut len)?;
                let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
                reader.read_exact(&mut buf)?;
                Value::Blob(buf)
            }
            other => {
                return Err(DbError::Storage(format!(
                    "unknown sort-run tag {}",
                    other
                )))
            }
        };
        values.push(value);
    }
    Ok(Some(values))
}
