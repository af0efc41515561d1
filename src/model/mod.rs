//! Content data model: objects, attribute values, object types and the
//! row shapes exchanged with storage backends.

pub mod object;
pub mod types;

pub use object::{AttributeValue, ContentObject, Scalar};
pub use types::{AttributeKind, AttributeType, ObjectType, TypeCatalog};

/// Stable internal id of one object variant row.
pub type ObjectId = u64;
/// Id of the logical object shared by all of its channel variants.
pub type ChannelsetId = u64;
pub type ChannelId = u32;
pub type ObjectTypeId = u32;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One persisted object variant.
///
/// `optimized` holds the values of optimized attributes, which live in the
/// object row itself rather than in the attribute side table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub id: ObjectId,
    pub obj_type: ObjectTypeId,
    pub channelset_id: ChannelsetId,
    pub channel_id: ChannelId,
    pub content_id: String,
    pub updated_at: i64,
    #[serde(default)]
    pub optimized: BTreeMap<String, AttributeValue>,
}

/// Reference to a value stored on the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Path relative to the filesystem attribute root.
    pub path: PathBuf,
    /// Hex SHA-256 of the content.
    pub hash: String,
    pub length: u64,
}

/// A single stored attribute value, either inline or on the filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Inline(Scalar),
    File(FileRef),
}

/// One side-table row. Multivalue attributes have one row per value,
/// ordered by `sortorder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRow {
    pub object_id: ObjectId,
    pub name: String,
    pub sortorder: u32,
    pub value: StoredValue,
}

impl AttributeRow {
    pub fn file(&self) -> Option<&FileRef> {
        match &self.value {
            StoredValue::File(file) => Some(file),
            StoredValue::Inline(_) => None,
        }
    }
}

/// A change since some timestamp, as seen in one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub id: ObjectId,
    pub channelset_id: ChannelsetId,
    pub channel_id: ChannelId,
    pub content_id: String,
    pub updated_at: i64,
    pub deleted: bool,
}

impl From<&ObjectRow> for ChangeRecord {
    fn from(row: &ObjectRow) -> Self {
        Self {
            id: row.id,
            channelset_id: row.channelset_id,
            channel_id: row.channel_id,
            content_id: row.content_id.clone(),
            updated_at: row.updated_at,
            deleted: false,
        }
    }
}

/// Default content id for objects stored without one.
pub fn default_content_id(obj_type: ObjectTypeId, id: ObjectId) -> String {
    format!("{obj_type}.{id}")
}
