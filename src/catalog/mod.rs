// Catalog: persistent table and column metadata.
//
// Metadata lives as ordinary records on the chain rooted at page 1, one
// record per table, encoded with the same row codec user tables use.
// Table names are case-insensitive (lowercased on store and lookup) and
// column order is preserved exactly as declared. Every successful DDL
// bumps the schema version persisted in the database header; plans and
// prepared statements bound against an older version are rejected
// before execution.

use crate::common::{DataType, PageId, RecordId, Value, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::disk::DiskManager;
use crate::storage::heap::TableHeap;
use crate::storage::page::PageType;
use crate::storage::space::SpaceManager;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The page every database reserves for catalog storage.
pub const CATALOG_ROOT_PAGE: PageId = 1;

/// Column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub position: usize,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    /// Default-value expression as SQL text, re-parsed when needed.
    pub default: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into().to_lowercase(),
            position: 0,
            data_type,
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, sql: impl Into<String>) -> Self {
        self.default = Some(sql.into());
        self
    }
}

/// Table metadata as held in memory and persisted to the catalog chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: u32,
    pub name: String,
    pub columns: Vec<Column>,
    pub root_page: PageId,
    pub row_count: u64,
    pub created_at: DateTime<Utc>,
}

impl TableInfo {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let lowered = name.to_lowercase();
        self.columns.iter().position(|c| c.name == lowered)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_index(name).map(|i| &self.columns[i])
    }
}

struct TableEntry {
    info: TableInfo,
    record: RecordId,
    heap: Option<Arc<TableHeap>>,
}

pub struct Catalog {
    disk: Arc<DiskManager>,
    buffer: Arc<BufferPool>,
    space: Arc<SpaceManager>,
    heap: TableHeap,
    tables: RwLock<HashMap<String, TableEntry>>,
    next_table_id: RwLock<u32>,
}

/// Schema of the catalog's own records.
fn meta_columns() -> Vec<Column> {
    vec![
        Column::new("name", DataType::Text).not_null(),
        Column::new("table_id", DataType::Integer).not_null(),
        Column::new("root_page", DataType::Integer).not_null(),
        Column::new("row_count", DataType::Integer).not_null(),
        Column::new("created_at", DataType::Integer).not_null(),
        Column::new("columns", DataType::Blob).not_null(),
    ]
}

impl Catalog {
    /// Open the catalog, bootstrapping page 1 on a fresh database and
    /// loading every table record otherwise.
    pub fn open(
        disk: Arc<DiskManager>,
        buffer: Arc<BufferPool>,
        space: Arc<SpaceManager>,
        deadline: Instant,
    ) -> Result<Self> {
        if disk.page_count() <= CATALOG_ROOT_PAGE {
            let guard = buffer.new_page(PageType::Meta, deadline)?;
            if guard.page_id() != CATALOG_ROOT_PAGE {
                return Err(DbError::Corrupt(
                    guard.page_id(),
                    "catalog root allocated at unexpected page".into(),
                ));
            }
        }
        let heap = TableHeap::open(
            Arc::clone(&buffer),
            Arc::clone(&space),
            CATALOG_ROOT_PAGE,
            deadline,
        )?;

        let meta = meta_columns();
        let mut tables = HashMap::new();
        let mut max_id = 0u32;
        let mut scan = heap.scan();
        while let Some((record, row)) = scan.next(&heap, &meta, deadline)? {
            let info = decode_table_record(&row)?;
            max_id = max_id.max(info.id);
            tables.insert(
                info.name.clone(),
                TableEntry {
                    info,
                    record,
                    heap: None,
                },
            );
        }
        Ok(Self {
            disk,
            buffer,
            space,
            heap,
            tables: RwLock::new(tables),
            next_table_id: RwLock::new(max_id + 1),
        })
    }

    pub fn schema_version(&self) -> u32 {
        self.disk.schema_version()
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(&name.to_lowercase())
    }

    pub fn get_table(&self, name: &str) -> Result<TableInfo> {
        self.tables
            .read()
            .get(&name.to_lowercase())
            .map(|e| e.info.clone())
            .ok_or_else(|| DbError::NotFound(name.to_lowercase()))
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a table: allocate its root page, persist the metadata
    /// record, and bump the schema version.
    pub fn create_table(
        &self,
        name: &str,
        mut columns: Vec<Column>,
        deadline: Instant,
    ) -> Result<TableInfo> {
        let name = name.to_lowercase();
        if self.tables.read().contains_key(&name) {
            return Err(DbError::Semantic(format!("table '{}' already exists", name)));
        }
        let pk_count = columns.iter().filter(|c| c.primary_key).count();
        if pk_count > 1 {
            return Err(DbError::Constraint(format!(
                "table '{}' declares {} primary keys",
                name, pk_count
            )));
        }
        for (i, column) in columns.iter_mut().enumerate() {
            column.position = i;
            if column.primary_key {
                column.nullable = false;
            }
        }

        let root_guard = self.buffer.new_page(PageType::Leaf, deadline)?;
        let root_page = root_guard.page_id();
        drop(root_guard);
        self.space.mark(root_page, 0);

        let id = {
            let mut next = self.next_table_id.write();
            let id = *next;
            *next += 1;
            id
        };
        let info = TableInfo {
            id,
            name: name.clone(),
            columns,
            root_page,
            row_count: 0,
            created_at: Utc::now(),
        };
        let record = self
            .heap
            .insert(&meta_columns(), &encode_table_record(&info), deadline)?;
        self.tables.write().insert(
            name.clone(),
            TableEntry {
                info: info.clone(),
                record,
                heap: None,
            },
        );
        self.disk.bump_schema_version()?;
        debug!("created table '{}' rooted at page {}", name, root_page);
        Ok(info)
    }

    /// Remove a table from the catalog and bump the schema version. The
    /// data pages are left intact so a rollback can restore the table;
    /// call `free_table_pages` once the drop commits.
    pub fn drop_table(&self, name: &str, deadline: Instant) -> Result<TableInfo> {
        let name = name.to_lowercase();
        let entry = self
            .tables
            .write()
            .remove(&name)
            .ok_or_else(|| DbError::NotFound(name.clone()))?;
        self.heap.delete(&meta_columns(), entry.record, deadline)?;
        self.disk.bump_schema_version()?;
        debug!("dropped table '{}'", name);
        Ok(entry.info)
    }

    /// Reinsert a dropped table's metadata (rollback of DROP TABLE).
    pub fn restore_table(&self, info: TableInfo, deadline: Instant) -> Result<()> {
        let record = self
            .heap
            .insert(&meta_columns(), &encode_table_record(&info), deadline)?;
        self.tables.write().insert(
            info.name.clone(),
            TableEntry {
                info,
                record,
                heap: None,
            },
        );
        self.disk.bump_schema_version()?;
        Ok(())
    }

    /// Walk a dropped table's chain and return its pages to the free
    /// list. Commit-time half of DROP TABLE.
    pub fn free_table_pages(&self, info: &TableInfo, deadline: Instant) -> Result<()> {
        let mut current = info.root_page;
        while current != INVALID_PAGE_ID {
            let next = {
                let guard = self.buffer.get(current, deadline)?;
                let page = guard.read();
                page.next_page()
            };
            self.buffer.discard(current);
            self.space.forget(current);
            self.disk.deallocate_page(current)?;
            current = next;
        }
        Ok(())
    }

    /// Adjust a table's cached row count and persist the new value.
    /// Costing input only; best-effort by design of callers.
    pub fn adjust_row_count(&self, name: &str, delta: i64, deadline: Instant) -> Result<()> {
        let name = name.to_lowercase();
        let (record, row) = {
            let mut tables = self.tables.write();
            let entry = tables
                .get_mut(&name)
                .ok_or_else(|| DbError::NotFound(name.clone()))?;
            entry.info.row_count = entry.info.row_count.saturating_add_signed(delta);
            (entry.record, encode_table_record(&entry.info))
        };
        self.heap.update(&meta_columns(), record, &row, deadline)?;
        Ok(())
    }

    /// The heap for a table's rows, opened lazily and cached.
    pub fn table_heap(&self, name: &str, deadline: Instant) -> Result<Arc<TableHeap>> {
        let name = name.to_lowercase();
        if let Some(entry) = self.tables.read().get(&name) {
            if let Some(heap) = &entry.heap {
                return Ok(Arc::clone(heap));
            }
        } else {
            return Err(DbError::NotFound(name));
        }
        let root = self.get_table(&name)?.root_page;
        let heap = Arc::new(TableHeap::open(
            Arc::clone(&self.buffer),
            Arc::clone(&self.space),
            root,
            deadline,
        )?);
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(&name)
            .ok_or_else(|| DbError::NotFound(name.clone()))?;
        if let Some(existing) = &entry.heap {
            return Ok(Arc::clone(existing));
        }
        entry.heap = Some(Arc::clone(&heap));
        Ok(heap)
    }
}

fn encode_table_record(info: &TableInfo) -> Vec<Value> {
    vec![
        Value::Text(info.name.clone()),
        Value::Integer(info.id as i64),
        Value::Integer(info.root_page as i64),
        Value::Integer(info.row_count as i64),
        Value::Integer(info.created_at.timestamp()),
        Value::Blob(encode_columns(&info.columns)),
    ]
}

fn decode_table_record(row: &[Value]) -> Result<TableInfo> {
    let corrupt = || DbError::Corrupt(CATALOG_ROOT_PAGE, "malformed catalog record".into());
    let name = match row.first() {
        Some(Value::Text(s)) => s.clone(),
        _ => return Err(corrupt()),
    };
    let int_at = |i: usize| match row.get(i) {
        Some(Value::Integer(v)) => Ok(*v),
        _ => Err(corrupt()),
    };
    let columns = match row.get(5) {
        Some(Value::Blob(b)) => decode_columns(b)?,
        _ => return Err(corrupt()),
    };
    Ok(TableInfo {
        id: int_at(1)? as u32,
        name,
        columns,
        root_page: int_at(2)? as PageId,
        row_count: int_at(3)? as u64,
        created_at: Utc
            .timestamp_opt(int_at(4)?, 0)
            .single()
            .ok_or_else(corrupt)?,
    })
}

const FLAG_NULLABLE: u8 = 1;
const FLAG_PRIMARY_KEY: u8 = 2;
const FLAG_UNIQUE: u8 = 4;

fn type_tag(dt: DataType) -> u8 {
    match dt {
        DataType::Integer => 0,
        DataType::Real => 1,
        DataType::Text => 2,
        DataType::Blob => 3,
        DataType::Boolean => 4,
    }
}

fn tag_type(tag: u8) -> Result<DataType> {
    match tag {
        0 => Ok(DataType::Integer),
        1 => Ok(DataType::Real),
        2 => Ok(DataType::Text),
        3 => Ok(DataType::Blob),
        4 => Ok(DataType::Boolean),
        _ => Err(DbError::Corrupt(
            CATALOG_ROOT_PAGE,
            format!("unknown column type tag {}", tag),
        )),
    }
}

fn encode_columns(columns: &[Column]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(columns.len() as u16).to_le_bytes());
    for column in columns {
        let name = column.name.as_bytes();
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.push(type_tag(column.data_type));
        let mut flags = 0u8;
        if column.nullable {
            flags |= FLAG_NULLABLE;
        }
        if column.primary_key {
            flags |= FLAG_PRIMARY_KEY;
        }
        if column.unique {
            flags |= FLAG_UNIQUE;
        }
        out.push(flags);
        match &column.default {
            Some(sql) => {
                let bytes = sql.as_bytes();
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            None => out.extend_from_slice(&u16::MAX.to_le_bytes()),
        }
    }
    out
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let out = bytes
        .get(*pos..*pos + n)
        .ok_or_else(|| DbError::Corrupt(CATALOG_ROOT_PAGE, "malformed column blob".into()))?;
    *pos += n;
    Ok(out)
}

fn decode_columns(bytes: &[u8]) -> Result<Vec<Column>> {
    let corrupt = || DbError::Corrupt(CATALOG_ROOT_PAGE, "malformed column blob".into());
    let mut pos = 0usize;
    let count = u16::from_le_bytes(take(bytes, &mut pos, 2)?.try_into().unwrap()) as usize;
    let mut columns = Vec::with_capacity(count);
    for position in 0..count {
        let name_len = take(bytes, &mut pos, 1)?[0] as usize;
        let name = std::str::from_utf8(take(bytes, &mut pos, name_len)?)
            .map_err(|_| corrupt())?
            .to_string();
        let data_type = tag_type(take(bytes, &mut pos, 1)?[0])?;
        let flags = take(bytes, &mut pos, 1)?[0];
        let default_len = u16::from_le_bytes(take(bytes, &mut pos, 2)?.try_into().unwrap());
        let default = if default_len == u16::MAX {
            None
        } else {
            let raw = take(bytes, &mut pos, default_len as usize)?;
            Some(std::str::from_utf8(raw).map_err(|_| corrupt())?.to_string())
        };
        columns.push(Column {
            name,
            position,
            data_type,
            nullable: flags & FLAG_NULLABLE != 0,
            primary_key: flags & FLAG_PRIMARY_KEY != 0,
            unique: flags & FLAG_UNIQUE != 0,
            default,
        });
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn open_catalog(path: &std::path::Path) -> Catalog {
        let disk = Arc::new(DiskManager::open(path, 4096).unwrap());
        let buffer = Arc::new(BufferPool::new(32, Arc::clone(&disk)));
        let space = Arc::new(SpaceManager::new(Arc::clone(&disk)));
        Catalog::open(disk, buffer, space, deadline()).unwrap()
    }

    fn user_columns() -> Vec<Column> {
        vec![
            Column::new("id", DataType::Integer).primary_key(),
            Column::new("name", DataType::Text).not_null(),
            Column::new("age", DataType::Integer),
        ]
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(&dir.path().join("c.adb"));
        let info = catalog.create_table("Users", user_columns(), deadline()).unwrap();
        assert_eq!(info.name, "users");
        assert_eq!(info.columns.len(), 3);
        // Case-insensitive lookup, declared order preserved.
        let found = catalog.get_table("USERS").unwrap();
        assert_eq!(found.columns[1].name, "name");
        assert!(catalog.table_exists("users"));
        assert!(!found.columns[0].nullable);
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(&dir.path().join("c.adb"));
        catalog.create_table("t", user_columns(), deadline()).unwrap();
        assert!(catalog.create_table("T", user_columns(), deadline()).is_err());
    }

    #[test]
    fn test_two_primary_keys_rejected() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(&dir.path().join("c.adb"));
        let columns = vec![
            Column::new("a", DataType::Integer).primary_key(),
            Column::new("b", DataType::Integer).primary_key(),
        ];
        assert!(matches!(
            catalog.create_table("t", columns, deadline()),
            Err(DbError::Constraint(_))
        ));
    }

    #[test]
    fn test_ddl_bumps_schema_version() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(&dir.path().join("c.adb"));
        let v0 = catalog.schema_version();
        catalog.create_table("a", user_columns(), deadline()).unwrap();
        let v1 = catalog.schema_version();
        assert!(v1 > v0);
        catalog.drop_table("a", deadline()).unwrap();
        assert!(catalog.schema_version() > v1);
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.adb");
        {
            let catalog = open_catalog(&path);
            let columns = vec![
                Column::new("id", DataType::Integer).primary_key(),
                Column::new("note", DataType::Text).with_default("'n/a'"),
            ];
            catalog.create_table("memos", columns, deadline()).unwrap();
            catalog.adjust_row_count("memos", 5, deadline()).unwrap();
        }
        let catalog = open_catalog(&path);
        let info = catalog.get_table("memos").unwrap();
        assert_eq!(info.columns[1].default.as_deref(), Some("'n/a'"));
        assert_eq!(info.row_count, 5);
        assert_eq!(catalog.list_tables(), vec!["memos".to_string()]);
    }

    #[test]
    fn test_drop_and_restore() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(&dir.path().join("c.adb"));
        catalog.create_table("t", user_columns(), deadline()).unwrap();
        let info = catalog.drop_table("t", deadline()).unwrap();
        assert!(!catalog.table_exists("t"));
        catalog.restore_table(info, deadline()).unwrap();
        assert!(catalog.table_exists("t"));
    }

    #[test]
    fn test_table_ids_are_monotonic() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(&dir.path().join("c.adb"));
        let a = catalog.create_table("a", user_columns(), deadline()).unwrap();
        let b = catalog.create_table("b", user_columns(), deadline()).unwrap();
        catalog.drop_table("a", deadline()).unwrap();
        let c = catalog.create_table("c", user_columns(), deadline()).unwrap();
        assert!(b.id > a.id);
        assert!(c.id > b.id);
    }
}
