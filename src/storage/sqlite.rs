// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite relational backend.
//!
//! Schema:
//! ```sql
//! CREATE TABLE objects (
//!   id INTEGER PRIMARY KEY,
//!   obj_type INTEGER NOT NULL,
//!   channelset_id INTEGER NOT NULL,
//!   channel_id INTEGER NOT NULL,
//!   content_id TEXT NOT NULL,
//!   updated_at INTEGER NOT NULL,
//!   optimized TEXT NOT NULL        -- JSON map of optimized attribute values
//! );
//! CREATE TABLE attribute_values (
//!   object_id, name, sortorder,    -- one row per value
//!   kind,                          -- scalar tag or 'file'
//!   value_text, value_int, value_real, value_blob,
//!   file_path, file_hash, file_length
//! );
//! ```
//!
//! plus `channels` (MPTT rows), `object_types` (JSON definitions), `deletions`
//! (tombstones for change tracking), `channel_status` (change watermarks),
//! `replication_status` (source watermarks of replicated channels) and
//! `sequences` (id allocation).
//!
//! One connection behind a mutex; every trait method is one prepared statement
//! except the multi-row replacements inside a transaction. Id lists longer
//! than [`MAX_IDS_PER_STATEMENT`] are split across statements to stay below
//! SQLite's bound-variable limit.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::traits::{RelationalBackend, ScopedQuery, StorageError, TxWork, WriteTx};
use crate::channel::ChannelNode;
use crate::error::DatasourceError;
use crate::model::{
    AttributeRow, AttributeValue, ChangeRecord, ChannelId, ChannelsetId, FileRef, ObjectId,
    ObjectRow, ObjectType, ObjectTypeId, Scalar, StoredValue,
};
use crate::query::{SqlParam, SqlTranslator};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        mptt_left INTEGER NOT NULL,
        mptt_right INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS object_types (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS objects (
        id INTEGER PRIMARY KEY,
        obj_type INTEGER NOT NULL,
        channelset_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        content_id TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        optimized TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_objects_channelset ON objects(channelset_id);
    CREATE INDEX IF NOT EXISTS idx_objects_content_id ON objects(content_id);
    CREATE INDEX IF NOT EXISTS idx_objects_channel_updated ON objects(channel_id, updated_at);
    CREATE TABLE IF NOT EXISTS attribute_values (
        object_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        sortorder INTEGER NOT NULL,
        kind TEXT NOT NULL,
        value_text TEXT,
        value_int INTEGER,
        value_real REAL,
        value_blob BLOB,
        file_path TEXT,
        file_hash TEXT,
        file_length INTEGER,
        PRIMARY KEY (object_id, name, sortorder)
    );
    CREATE INDEX IF NOT EXISTS idx_attribute_values_name ON attribute_values(name);
    CREATE INDEX IF NOT EXISTS idx_attribute_values_file ON attribute_values(file_hash, file_length);
    CREATE INDEX IF NOT EXISTS idx_attribute_values_path ON attribute_values(file_path);
    CREATE TABLE IF NOT EXISTS deletions (
        object_id INTEGER NOT NULL,
        channelset_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        content_id TEXT NOT NULL,
        deleted_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_deletions_channel ON deletions(channel_id, deleted_at);
    CREATE TABLE IF NOT EXISTS channel_status (
        channel_id INTEGER PRIMARY KEY,
        last_update INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS replication_status (
        channel_id INTEGER PRIMARY KEY,
        source_watermark INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sequences (
        name TEXT PRIMARY KEY,
        next_value INTEGER NOT NULL
    );
"#;

const OBJECT_COLUMNS: &str =
    "id, obj_type, channelset_id, channel_id, content_id, updated_at, optimized";
const ATTRIBUTE_COLUMNS: &str = "object_id, name, sortorder, kind, value_text, value_int, \
     value_real, value_blob, file_path, file_hash, file_length";

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Most ids bound in one `IN (...)` list.
pub const MAX_IDS_PER_STATEMENT: usize = 500;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn to_value(param: SqlParam) -> Value {
    match param {
        SqlParam::Text(s) => Value::Text(s),
        SqlParam::Integer(n) => Value::Integer(n),
        SqlParam::Real(n) => Value::Real(n),
        SqlParam::Blob(b) => Value::Blob(b),
    }
}

/// Raw object columns, decoded outside the row callback.
type RawObject = (i64, i64, i64, i64, String, i64, String);

fn read_object(row: &Row<'_>) -> rusqlite::Result<RawObject> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_object(raw: RawObject) -> Result<ObjectRow, StorageError> {
    let (id, obj_type, channelset_id, channel_id, content_id, updated_at, optimized) = raw;
    let optimized: BTreeMap<String, AttributeValue> =
        serde_json::from_str(&optimized).map_err(|e| StorageError::Corruption {
            id: id.to_string(),
            reason: format!("optimized column: {e}"),
        })?;
    Ok(ObjectRow {
        id: id as ObjectId,
        obj_type: obj_type as ObjectTypeId,
        channelset_id: channelset_id as ChannelsetId,
        channel_id: channel_id as ChannelId,
        content_id,
        updated_at,
        optimized,
    })
}

fn encode_optimized(row: &ObjectRow) -> Result<String, StorageError> {
    serde_json::to_string(&row.optimized).map_err(|e| StorageError::Corruption {
        id: row.id.to_string(),
        reason: format!("optimized column: {e}"),
    })
}

fn query_objects(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<ObjectRow>, StorageError> {
    let mut stmt = conn.prepare_cached(sql).map_err(sql_err)?;
    let raw = stmt
        .query_map(params_from_iter(args), read_object)
        .map_err(sql_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err)?;
    raw.into_iter().map(decode_object).collect()
}

fn id_values(ids: &[u64]) -> Vec<Value> {
    ids.iter().map(|id| Value::Integer(*id as i64)).collect()
}

fn select_objects(conn: &Connection, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
    let mut rows = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id IN ({}) ORDER BY id",
            placeholders(chunk.len())
        );
        rows.extend(query_objects(conn, &sql, id_values(chunk))?);
    }
    if ids.len() > MAX_IDS_PER_STATEMENT {
        rows.sort_by_key(|row| row.id);
        rows.dedup_by_key(|row| row.id);
    }
    Ok(rows)
}

fn select_variants(conn: &Connection, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
    let mut rows = Vec::new();
    for chunk in channelsets.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE channelset_id IN ({}) ORDER BY id",
            placeholders(chunk.len())
        );
        rows.extend(query_objects(conn, &sql, id_values(chunk))?);
    }
    if channelsets.len() > MAX_IDS_PER_STATEMENT {
        rows.sort_by_key(|row| row.id);
        rows.dedup_by_key(|row| row.id);
    }
    Ok(rows)
}

/// Raw attribute columns.
type RawAttribute = (
    i64,
    String,
    i64,
    String,
    Option<String>,
    Option<i64>,
    Option<f64>,
    Option<Vec<u8>>,
    Option<String>,
    Option<String>,
    Option<i64>,
);

fn read_attribute(row: &Row<'_>) -> rusqlite::Result<RawAttribute> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn decode_attribute(raw: RawAttribute) -> Result<AttributeRow, StorageError> {
    let (object_id, name, sortorder, kind, text, int, real, blob, path, hash, length) = raw;
    let corrupt = |what: &str| StorageError::Corruption {
        id: format!("{object_id}/{name}/{sortorder}"),
        reason: format!("missing {what} for kind '{kind}'"),
    };
    let value = match kind.as_str() {
        "text" => StoredValue::Inline(Scalar::Text(text.ok_or_else(|| corrupt("value_text"))?)),
        "int" => StoredValue::Inline(Scalar::Int(int.ok_or_else(|| corrupt("value_int"))? as i32)),
        "long" => StoredValue::Inline(Scalar::Long(int.ok_or_else(|| corrupt("value_int"))?)),
        "date" => StoredValue::Inline(Scalar::Date(int.ok_or_else(|| corrupt("value_int"))?)),
        "link" => StoredValue::Inline(Scalar::Link(int.ok_or_else(|| corrupt("value_int"))? as u64)),
        "double" => StoredValue::Inline(Scalar::Double(real.ok_or_else(|| corrupt("value_real"))?)),
        "blob" => StoredValue::Inline(Scalar::Blob(blob.ok_or_else(|| corrupt("value_blob"))?)),
        "file" => StoredValue::File(FileRef {
            path: PathBuf::from(path.ok_or_else(|| corrupt("file_path"))?),
            hash: hash.ok_or_else(|| corrupt("file_hash"))?,
            length: length.ok_or_else(|| corrupt("file_length"))? as u64,
        }),
        _ => return Err(corrupt("a known kind")),
    };
    Ok(AttributeRow {
        object_id: object_id as ObjectId,
        name,
        sortorder: sortorder as u32,
        value,
    })
}

fn query_attributes(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<AttributeRow>, StorageError> {
    let mut stmt = conn.prepare_cached(sql).map_err(sql_err)?;
    let raw = stmt
        .query_map(params_from_iter(args), read_attribute)
        .map_err(sql_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err)?;
    raw.into_iter().map(decode_attribute).collect()
}

fn select_attribute(conn: &Connection, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
    let mut rows = Vec::new();
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "SELECT {ATTRIBUTE_COLUMNS} FROM attribute_values WHERE name = ? AND object_id IN ({}) \
             ORDER BY object_id, sortorder",
            placeholders(chunk.len())
        );
        let mut args = vec![Value::Text(name.to_string())];
        args.extend(id_values(chunk));
        rows.extend(query_attributes(conn, &sql, args)?);
    }
    if ids.len() > MAX_IDS_PER_STATEMENT {
        rows.sort_by_key(|row| (row.object_id, row.sortorder));
        rows.dedup_by_key(|row| (row.object_id, row.sortorder));
    }
    Ok(rows)
}

fn last_update(conn: &Connection, channel: ChannelId) -> Result<Option<i64>, StorageError> {
    conn.query_row(
        "SELECT last_update FROM channel_status WHERE channel_id = ?",
        params![channel],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql_err)
}

fn replication_mark(conn: &Connection, channel: ChannelId) -> Result<Option<i64>, StorageError> {
    conn.query_row(
        "SELECT source_watermark FROM replication_status WHERE channel_id = ?",
        params![channel],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql_err)
}

/// Column values of one stored attribute value:
/// (kind, text, int, real, blob, path, hash, length)
type Encoded = (
    &'static str,
    Option<String>,
    Option<i64>,
    Option<f64>,
    Option<Vec<u8>>,
    Option<String>,
    Option<String>,
    Option<i64>,
);

fn encode_value(value: &StoredValue) -> Encoded {
    match value {
        StoredValue::Inline(Scalar::Text(s)) => ("text", Some(s.clone()), None, None, None, None, None, None),
        StoredValue::Inline(Scalar::Int(v)) => ("int", None, Some(i64::from(*v)), None, None, None, None, None),
        StoredValue::Inline(Scalar::Long(v)) => ("long", None, Some(*v), None, None, None, None, None),
        StoredValue::Inline(Scalar::Date(v)) => ("date", None, Some(*v), None, None, None, None, None),
        StoredValue::Inline(Scalar::Link(v)) => ("link", None, Some(*v as i64), None, None, None, None, None),
        StoredValue::Inline(Scalar::Double(v)) => ("double", None, None, Some(*v), None, None, None, None),
        StoredValue::Inline(Scalar::Blob(b)) => ("blob", None, None, None, Some(b.clone()), None, None, None),
        StoredValue::File(file) => (
            "file",
            None,
            None,
            None,
            None,
            Some(file.path.to_string_lossy().into_owned()),
            Some(file.hash.clone()),
            Some(file.length as i64),
        ),
    }
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database file. Enables WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(|e| {
            StorageError::Backend(format!("Failed to enable WAL mode: {e}"))
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(|e| {
            StorageError::Backend(format!("Failed to set synchronous mode: {e}"))
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn matching_sql(query: &ScopedQuery<'_>, select: &str) -> (String, Vec<Value>) {
        let scope = SqlTranslator::scope_clause(query.scope);
        let filter = SqlTranslator::translate(query.expression, query.catalog);
        let sql = format!("SELECT {select} FROM objects o WHERE {scope} AND {}", filter.clause);
        (sql, filter.params.into_iter().map(to_value).collect())
    }
}

impl RelationalBackend for SqliteBackend {
    fn load_channel_nodes(&self) -> Result<Vec<ChannelNode>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id, name, mptt_left, mptt_right FROM channels ORDER BY mptt_left")
            .map_err(sql_err)?;
        let nodes = stmt
            .query_map([], |row| {
                Ok(ChannelNode {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    left: row.get(2)?,
                    right: row.get(3)?,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(nodes)
    }

    fn load_object_types(&self) -> Result<Vec<ObjectType>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id, definition FROM object_types ORDER BY id")
            .map_err(sql_err)?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        raw.into_iter()
            .map(|(id, definition)| {
                serde_json::from_str(&definition).map_err(|e| StorageError::Corruption {
                    id: format!("object_type {id}"),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn select_objects(&self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        select_objects(&self.conn.lock(), ids)
    }

    fn select_variants(&self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        select_variants(&self.conn.lock(), channelsets)
    }

    fn select_by_content_id(&self, content_id: &str) -> Result<Option<ObjectRow>, StorageError> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE content_id = ? ORDER BY id LIMIT 1");
        let rows = query_objects(&self.conn.lock(), &sql, vec![Value::Text(content_id.to_string())])?;
        Ok(rows.into_iter().next())
    }

    fn select_attribute(&self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        select_attribute(&self.conn.lock(), name, ids)
    }

    fn select_matching(&self, query: &ScopedQuery<'_>) -> Result<Vec<ObjectId>, StorageError> {
        let (sql, args) = Self::matching_sql(query, "o.id");
        let sql = format!("{sql} ORDER BY o.id");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let ids = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, i64>(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(ids.into_iter().map(|id| id as ObjectId).collect())
    }

    fn count_matching(&self, query: &ScopedQuery<'_>) -> Result<usize, StorageError> {
        let (sql, args) = Self::matching_sql(query, "COUNT(*)");
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(&sql, params_from_iter(args), |row| row.get(0))
            .map_err(sql_err)?;
        Ok(count as usize)
    }

    fn select_changed(&self, channel: ChannelId, since: i64) -> Result<Vec<ChangeRecord>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, channelset_id, channel_id, content_id, updated_at, 0 FROM objects \
                 WHERE channel_id = ?1 AND updated_at > ?2 \
                 UNION ALL \
                 SELECT object_id, channelset_id, channel_id, content_id, deleted_at, 1 FROM deletions \
                 WHERE channel_id = ?1 AND deleted_at > ?2 \
                 ORDER BY 5, 1",
            )
            .map_err(sql_err)?;
        let changes = stmt
            .query_map(params![channel, since], |row| {
                Ok(ChangeRecord {
                    id: row.get::<_, i64>(0)? as ObjectId,
                    channelset_id: row.get::<_, i64>(1)? as ChannelsetId,
                    channel_id: row.get(2)?,
                    content_id: row.get(3)?,
                    updated_at: row.get(4)?,
                    deleted: row.get::<_, i64>(5)? != 0,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(changes)
    }

    fn last_update(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        last_update(&self.conn.lock(), channel)
    }

    fn replication_mark(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        replication_mark(&self.conn.lock(), channel)
    }

    fn select_ids_in_channel(&self, channel: ChannelId) -> Result<Vec<ObjectId>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id FROM objects WHERE channel_id = ? ORDER BY id")
            .map_err(sql_err)?;
        let ids = stmt
            .query_map(params![channel], |row| row.get::<_, i64>(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(ids.into_iter().map(|id| id as ObjectId).collect())
    }

    fn count_attribute_rows(&self, name: &str) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM attribute_values WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count as usize)
    }

    fn is_file_referenced(&self, path: &Path) -> Result<bool, StorageError> {
        self.conn
            .lock()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM attribute_values WHERE file_path = ?)",
                params![path.to_string_lossy()],
                |row| row.get(0),
            )
            .map_err(sql_err)
    }

    fn transact(&self, work: &mut TxWork<'_>) -> Result<(), DatasourceError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        work(&mut SqliteTx { conn: &tx })?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl WriteTx for SqliteTx<'_> {
    fn replace_channel_nodes(&mut self, nodes: &[ChannelNode]) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM channels", []).map_err(sql_err)?;
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO channels (id, name, mptt_left, mptt_right) VALUES (?, ?, ?, ?)")
            .map_err(sql_err)?;
        for node in nodes {
            stmt.execute(params![node.id, node.name, node.left, node.right])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    fn save_object_type(&mut self, object_type: &ObjectType) -> Result<(), StorageError> {
        let definition = serde_json::to_string(object_type).map_err(|e| StorageError::Corruption {
            id: format!("object_type {}", object_type.id),
            reason: e.to_string(),
        })?;
        self.conn
            .execute(
                "INSERT INTO object_types (id, name, definition) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET name = ?2, definition = ?3",
                params![object_type.id, object_type.name, definition],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<ObjectId, StorageError> {
        let id: i64 = self
            .conn
            .query_row(
                "INSERT INTO sequences (name, next_value) \
                 VALUES ('objects', (SELECT COALESCE(MAX(id), 0) + 2 FROM objects)) \
                 ON CONFLICT(name) DO UPDATE SET next_value = next_value + 1 \
                 RETURNING next_value - 1",
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(id as ObjectId)
    }

    fn select_objects(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        select_objects(self.conn, ids)
    }

    fn select_objects_of_types(&mut self, types: &[ObjectTypeId]) -> Result<Vec<ObjectRow>, StorageError> {
        let mut rows = Vec::new();
        for chunk in types.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = format!(
                "SELECT {OBJECT_COLUMNS} FROM objects WHERE obj_type IN ({}) ORDER BY id",
                placeholders(chunk.len())
            );
            let args = chunk.iter().map(|t| Value::Integer(i64::from(*t))).collect();
            rows.extend(query_objects(self.conn, &sql, args)?);
        }
        if types.len() > MAX_IDS_PER_STATEMENT {
            rows.sort_by_key(|row| row.id);
        }
        Ok(rows)
    }

    fn select_variants(&mut self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        select_variants(self.conn, channelsets)
    }

    fn insert_object(&mut self, row: &ObjectRow) -> Result<(), StorageError> {
        let optimized = encode_optimized(row)?;
        let result = self.conn.execute(
            "INSERT INTO objects (id, obj_type, channelset_id, channel_id, content_id, updated_at, optimized) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                row.id as i64,
                row.obj_type,
                row.channelset_id as i64,
                row.channel_id,
                row.content_id,
                row.updated_at,
                optimized
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::Conflict(row.id));
            }
            Err(e) => return Err(sql_err(e)),
        }
        self.conn
            .execute(
                "UPDATE sequences SET next_value = MAX(next_value, ?) WHERE name = 'objects'",
                params![row.id as i64 + 1],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn update_object(&mut self, row: &ObjectRow) -> Result<(), StorageError> {
        let optimized = encode_optimized(row)?;
        let changed = self
            .conn
            .execute(
                "UPDATE objects SET obj_type = ?, channelset_id = ?, channel_id = ?, content_id = ?, \
                 updated_at = ?, optimized = ? WHERE id = ?",
                params![
                    row.obj_type,
                    row.channelset_id as i64,
                    row.channel_id,
                    row.content_id,
                    row.updated_at,
                    optimized,
                    row.id as i64
                ],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(row.id));
        }
        Ok(())
    }

    fn delete_object(&mut self, id: ObjectId) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM attribute_values WHERE object_id = ?", params![id as i64])
            .map_err(sql_err)?;
        self.conn
            .execute("DELETE FROM objects WHERE id = ?", params![id as i64])
            .map_err(sql_err)?;
        Ok(())
    }

    fn record_deletion(&mut self, change: &ChangeRecord) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO deletions (object_id, channelset_id, channel_id, content_id, deleted_at) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    change.id as i64,
                    change.channelset_id as i64,
                    change.channel_id,
                    change.content_id,
                    change.updated_at
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn select_attribute(&mut self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        select_attribute(self.conn, name, ids)
    }

    fn select_attribute_rows(&mut self, name: &str) -> Result<Vec<AttributeRow>, StorageError> {
        let sql = format!(
            "SELECT {ATTRIBUTE_COLUMNS} FROM attribute_values WHERE name = ? ORDER BY object_id, sortorder"
        );
        query_attributes(self.conn, &sql, vec![Value::Text(name.to_string())])
    }

    fn select_object_files(&mut self, id: ObjectId) -> Result<Vec<FileRef>, StorageError> {
        let sql = format!(
            "SELECT {ATTRIBUTE_COLUMNS} FROM attribute_values WHERE object_id = ? AND kind = 'file' \
             ORDER BY name, sortorder"
        );
        let rows = query_attributes(self.conn, &sql, vec![Value::Integer(id as i64)])?;
        Ok(rows.iter().filter_map(AttributeRow::file).cloned().collect())
    }

    fn replace_attribute(&mut self, id: ObjectId, name: &str, rows: &[AttributeRow]) -> Result<(), StorageError> {
        self.conn
            .execute(
                "DELETE FROM attribute_values WHERE object_id = ? AND name = ?",
                params![id as i64, name],
            )
            .map_err(sql_err)?;
        let sql = format!("INSERT INTO attribute_values ({ATTRIBUTE_COLUMNS}) VALUES ({})", placeholders(11));
        let mut stmt = self.conn.prepare_cached(&sql).map_err(sql_err)?;
        for row in rows {
            let (kind, text, int, real, blob, path, hash, length) = encode_value(&row.value);
            stmt.execute(params![
                id as i64, name, row.sortorder, kind, text, int, real, blob, path, hash, length
            ])
            .map_err(sql_err)?;
        }
        Ok(())
    }

    fn find_file_by_hash(&mut self, hash: &str, length: u64) -> Result<Option<PathBuf>, StorageError> {
        self.conn
            .query_row(
                "SELECT file_path FROM attribute_values WHERE file_hash = ? AND file_length = ? LIMIT 1",
                params![hash, length as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|path| path.map(PathBuf::from))
            .map_err(sql_err)
    }

    fn last_update(&mut self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        last_update(self.conn, channel)
    }

    fn set_last_update(&mut self, channel: ChannelId, timestamp: i64) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO channel_status (channel_id, last_update) VALUES (?1, ?2) \
                 ON CONFLICT(channel_id) DO UPDATE SET last_update = ?2",
                params![channel, timestamp],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn set_replication_mark(&mut self, channel: ChannelId, watermark: i64) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO replication_status (channel_id, source_watermark) VALUES (?1, ?2) \
                 ON CONFLICT(channel_id) DO UPDATE SET source_watermark = ?2",
                params![channel, watermark],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelScope, ChannelTree};
    use crate::model::{AttributeKind, AttributeType, TypeCatalog};
    use crate::query::{CompareOp, Expression};

    fn object(id: ObjectId, channelset_id: ChannelsetId, channel_id: ChannelId) -> ObjectRow {
        ObjectRow {
            id,
            obj_type: 10007,
            channelset_id,
            channel_id,
            content_id: format!("10007.{id}"),
            updated_at: 100 + id as i64,
            optimized: BTreeMap::from([("name".to_string(), AttributeValue::from(format!("obj{id}")))]),
        }
    }

    fn inline(id: ObjectId, name: &str, sortorder: u32, value: Scalar) -> AttributeRow {
        AttributeRow {
            object_id: id,
            name: name.into(),
            sortorder,
            value: StoredValue::Inline(value),
        }
    }

    fn catalog() -> TypeCatalog {
        TypeCatalog::new(vec![ObjectType::new(10007, "article")
            .with_attribute(AttributeType::new("name", AttributeKind::Text).optimized())
            .with_attribute(AttributeType::new("int", AttributeKind::Int))])
    }

    #[test]
    fn test_object_and_attribute_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let values = vec![
            inline(1, "all", 0, Scalar::Text("t".into())),
            inline(1, "all", 1, Scalar::Int(-3)),
            inline(1, "all", 2, Scalar::Long(1 << 40)),
            inline(1, "all", 3, Scalar::Double(2.5)),
            inline(1, "all", 4, Scalar::Date(1_700_000_000_000)),
            inline(1, "all", 5, Scalar::Blob(vec![0, 1, 255])),
            inline(1, "all", 6, Scalar::Link(9)),
            AttributeRow {
                object_id: 1,
                name: "all".into(),
                sortorder: 7,
                value: StoredValue::File(FileRef {
                    path: PathBuf::from("ab/cd/x"),
                    hash: "abcd".into(),
                    length: 12,
                }),
            },
        ];
        backend
            .transact(&mut |tx| {
                tx.insert_object(&object(1, 1, 1))?;
                tx.replace_attribute(1, "all", &values)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(backend.select_objects(&[1, 2]).unwrap(), vec![object(1, 1, 1)]);
        assert_eq!(backend.select_attribute("all", &[1]).unwrap(), values);
        assert_eq!(backend.count_attribute_rows("all").unwrap(), 8);
        assert!(backend.is_file_referenced(Path::new("ab/cd/x")).unwrap());
        assert_eq!(
            backend.select_by_content_id("10007.1").unwrap().map(|r| r.id),
            Some(1)
        );
    }

    #[test]
    fn test_large_id_lists_are_chunked() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let count = 2 * MAX_IDS_PER_STATEMENT + 200;
        backend
            .transact(&mut |tx| {
                for id in 1..=count as ObjectId {
                    tx.insert_object(&object(id, id, 1))?;
                    tx.replace_attribute(id, "int", &[inline(id, "int", 0, Scalar::Int(id as i32))])?;
                }
                Ok(())
            })
            .unwrap();

        // reversed, so chunk boundaries do not follow id order
        let ids: Vec<ObjectId> = (1..=count as ObjectId).rev().collect();
        let rows = backend.select_objects(&ids).unwrap();
        assert_eq!(rows.len(), count);
        assert!(rows.windows(2).all(|pair| pair[0].id < pair[1].id));

        assert_eq!(backend.select_variants(&ids).unwrap().len(), count);

        let values = backend.select_attribute("int", &ids).unwrap();
        assert_eq!(values.len(), count);
        assert_eq!(values.first().map(|row| row.object_id), Some(1));
        assert_eq!(values.last().map(|row| row.object_id), Some(count as ObjectId));
    }

    #[test]
    fn test_rollback_discards_everything() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let result = backend.transact(&mut |tx| {
            tx.insert_object(&object(1, 1, 1))?;
            tx.set_last_update(1, 5)?;
            Err(DatasourceError::Config("abort".into()))
        });
        assert!(result.is_err());
        assert!(backend.select_objects(&[1]).unwrap().is_empty());
        assert_eq!(backend.last_update(1).unwrap(), None);
    }

    #[test]
    fn test_id_allocation_skips_explicit_ids() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .transact(&mut |tx| {
                assert_eq!(tx.allocate_id()?, 1);
                tx.insert_object(&object(1, 1, 1))?;
                tx.insert_object(&object(7, 7, 1))?;
                assert_eq!(tx.allocate_id()?, 8);
                assert!(matches!(tx.insert_object(&object(7, 7, 1)), Err(StorageError::Conflict(7))));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_scoped_matching_with_fallback() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .transact(&mut |tx| {
                tx.insert_object(&object(1, 1, 1))?;
                tx.insert_object(&object(2, 1, 2))?;
                tx.insert_object(&object(3, 3, 1))?;
                tx.replace_attribute(1, "int", &[inline(1, "int", 0, Scalar::Int(42))])?;
                tx.replace_attribute(2, "int", &[inline(2, "int", 0, Scalar::Int(44))])?;
                tx.replace_attribute(3, "int", &[inline(3, "int", 0, Scalar::Int(1))])?;
                Ok(())
            })
            .unwrap();
        let tree = ChannelTree::new(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Channel"))]).unwrap();
        let catalog = catalog();
        let expr = Expression::attr("int", CompareOp::Gt, Scalar::Int(10));

        let channel = ChannelScope::for_channel(&tree, 2).unwrap();
        let query = ScopedQuery { expression: &expr, scope: &channel, catalog: &catalog };
        assert_eq!(backend.select_matching(&query).unwrap(), vec![2]);

        let master = ChannelScope::for_channel(&tree, 1).unwrap();
        let query = ScopedQuery { expression: &expr, scope: &master, catalog: &catalog };
        assert_eq!(backend.select_matching(&query).unwrap(), vec![1]);

        let by_name = Expression::attr_eq("name", Scalar::Text("obj3".into()));
        let query = ScopedQuery { expression: &by_name, scope: &channel, catalog: &catalog };
        assert_eq!(backend.select_matching(&query).unwrap(), vec![3]);
        assert_eq!(backend.count_matching(&query).unwrap(), 1);

        let all = Expression::All;
        let query = ScopedQuery { expression: &all, scope: &channel, catalog: &catalog };
        assert_eq!(backend.count_matching(&query).unwrap(), 2);
    }

    #[test]
    fn test_changes_and_watermarks() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .transact(&mut |tx| {
                tx.insert_object(&object(1, 1, 1))?;
                tx.insert_object(&object(2, 2, 1))?;
                tx.set_last_update(1, 102)?;
                Ok(())
            })
            .unwrap();
        backend
            .transact(&mut |tx| {
                tx.delete_object(1)?;
                tx.record_deletion(&ChangeRecord {
                    updated_at: 200,
                    deleted: true,
                    ..ChangeRecord::from(&object(1, 1, 1))
                })?;
                tx.set_last_update(1, 200)?;
                Ok(())
            })
            .unwrap();

        let changes = backend.select_changed(1, 101).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id, 2);
        assert!(changes[1].deleted);
        assert_eq!(backend.last_update(1).unwrap(), Some(200));
        assert_eq!(backend.select_ids_in_channel(1).unwrap(), vec![2]);

        assert_eq!(backend.replication_mark(1).unwrap(), None);
        backend
            .transact(&mut |tx| Ok(tx.set_replication_mark(1, 150)?))
            .unwrap();
        backend
            .transact(&mut |tx| Ok(tx.set_replication_mark(1, 180)?))
            .unwrap();
        assert_eq!(backend.replication_mark(1).unwrap(), Some(180));
        assert_eq!(backend.last_update(1).unwrap(), Some(200));
    }

    #[test]
    fn test_channels_and_types_persist() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let tree = ChannelTree::new(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Channel"))]).unwrap();
        let ty = ObjectType::new(10007, "article")
            .with_attribute(AttributeType::new("int", AttributeKind::Int).multivalue());
        backend
            .transact(&mut |tx| {
                tx.replace_channel_nodes(&tree.to_nodes())?;
                tx.save_object_type(&ty)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(backend.load_channel_nodes().unwrap(), tree.to_nodes());
        assert_eq!(backend.load_object_types().unwrap(), vec![ty]);
    }
}
