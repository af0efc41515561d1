// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content objects and attribute values.
//!
//! A [`ContentObject`] is the caller-facing view of one object variant. Read
//! results carry the values of optimized attributes; everything else is
//! fetched through `Datasource::get_attribute`, which goes through the cache.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{
    default_content_id, ChannelId, ChannelsetId, ObjectId, ObjectRow, ObjectTypeId,
};

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    /// `text` and `longtext`
    Text(String),
    Int(i32),
    Long(i64),
    Double(f64),
    /// Epoch milliseconds
    Date(i64),
    Blob(Vec<u8>),
    /// Internal id of the target object variant
    Link(ObjectId),
}

impl Scalar {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<ObjectId> {
        match self {
            Scalar::Link(id) => Some(*id),
            _ => None,
        }
    }

    /// Raw bytes of text and blob values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Scalar::Text(s) => Some(s.as_bytes()),
            Scalar::Blob(b) => Some(b),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(i64::from(*v)),
            Scalar::Long(v) | Scalar::Date(v) => Some(*v),
            Scalar::Link(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Ordering between comparable values. Integral kinds compare with each
    /// other and with doubles; text only with text. Blobs never compare.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (Scalar::Double(a), Scalar::Double(b)) => a.partial_cmp(b),
            (Scalar::Double(a), b) => b.as_i64().and_then(|b| a.partial_cmp(&(b as f64))),
            (a, Scalar::Double(b)) => a.as_i64().and_then(|a| (a as f64).partial_cmp(b)),
            (Scalar::Blob(_), _) | (_, Scalar::Blob(_)) => None,
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }
}

/// Value of one attribute on one object.
///
/// Absent attributes read back as `Null`. Storing `Null` or an empty
/// `Multi` removes the stored value. Stored values are normalized to the
/// attribute's arity, see [`AttributeType::normalize`](super::AttributeType::normalize).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum AttributeValue {
    #[default]
    Null,
    Single(Scalar),
    Multi(Vec<Scalar>),
}

impl AttributeValue {
    pub fn values(&self) -> &[Scalar] {
        match self {
            AttributeValue::Null => &[],
            AttributeValue::Single(s) => std::slice::from_ref(s),
            AttributeValue::Multi(v) => v,
        }
    }

    pub fn is_null(&self) -> bool {
        self.values().is_empty()
    }

    pub fn first(&self) -> Option<&Scalar> {
        self.values().first()
    }

    pub(crate) fn from_values(multivalue: bool, mut values: Vec<Scalar>) -> Self {
        if values.is_empty() {
            AttributeValue::Null
        } else if multivalue {
            AttributeValue::Multi(values)
        } else {
            AttributeValue::Single(values.swap_remove(0))
        }
    }
}

impl From<Scalar> for AttributeValue {
    fn from(value: Scalar) -> Self {
        AttributeValue::Single(value)
    }
}

impl From<Vec<Scalar>> for AttributeValue {
    fn from(values: Vec<Scalar>) -> Self {
        AttributeValue::Multi(values)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Single(Scalar::Text(value.to_string()))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Single(Scalar::Text(value))
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Single(Scalar::Int(value))
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Single(Scalar::Long(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Single(Scalar::Double(value))
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        AttributeValue::Single(Scalar::Blob(value))
    }
}

/// Caller-facing object variant.
///
/// Objects built with [`ContentObject::new`] have no internal id until stored.
/// `attributes` only lists the values a `store` should write; absent names are
/// left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentObject {
    pub id: Option<ObjectId>,
    pub obj_type: ObjectTypeId,
    pub channelset_id: Option<ChannelsetId>,
    pub channel_id: ChannelId,
    pub content_id: Option<String>,
    pub updated_at: i64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl ContentObject {
    #[must_use]
    pub fn new(obj_type: ObjectTypeId, channel_id: ChannelId) -> Self {
        Self {
            id: None,
            obj_type,
            channelset_id: None,
            channel_id,
            content_id: None,
            updated_at: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// A new variant of this object for another channel, sharing the channelset.
    #[must_use]
    pub fn variant_for(&self, channel_id: ChannelId) -> Self {
        Self {
            id: None,
            obj_type: self.obj_type,
            channelset_id: self.channelset_id.or(self.id),
            channel_id,
            content_id: None,
            updated_at: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttributeValue>) -> &mut Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Content id, falling back to the default form for stored objects.
    pub fn effective_content_id(&self) -> Option<String> {
        self.content_id
            .clone()
            .or_else(|| self.id.map(|id| default_content_id(self.obj_type, id)))
    }

    pub(crate) fn from_row(row: &ObjectRow) -> Self {
        Self {
            id: Some(row.id),
            obj_type: row.obj_type,
            channelset_id: Some(row.channelset_id),
            channel_id: row.channel_id,
            content_id: Some(row.content_id.clone()),
            updated_at: row.updated_at,
            attributes: row.optimized.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison_crosses_kinds() {
        assert_eq!(Scalar::Int(3).compare(&Scalar::Long(3)), Some(Ordering::Equal));
        assert_eq!(Scalar::Int(2).compare(&Scalar::Double(2.5)), Some(Ordering::Less));
        assert_eq!(Scalar::Date(10).compare(&Scalar::Long(9)), Some(Ordering::Greater));
    }

    #[test]
    fn test_text_and_blob_comparison() {
        assert_eq!(
            Scalar::Text("a".into()).compare(&Scalar::Text("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(Scalar::Text("1".into()).compare(&Scalar::Int(1)), None);
        assert_eq!(Scalar::Blob(vec![1]).compare(&Scalar::Blob(vec![1])), None);
    }

    #[test]
    fn test_from_values_shapes() {
        assert_eq!(AttributeValue::from_values(false, vec![]), AttributeValue::Null);
        assert_eq!(
            AttributeValue::from_values(false, vec![Scalar::Int(1)]),
            AttributeValue::Single(Scalar::Int(1))
        );
        assert_eq!(
            AttributeValue::from_values(true, vec![Scalar::Int(1), Scalar::Int(2)]),
            AttributeValue::Multi(vec![Scalar::Int(1), Scalar::Int(2)])
        );
    }

    #[test]
    fn test_empty_multi_is_null() {
        assert!(AttributeValue::Multi(vec![]).is_null());
        assert!(!AttributeValue::from(7).is_null());
    }

    #[test]
    fn test_variant_shares_channelset() {
        let mut master = ContentObject::new(1, 1).with("name", "x");
        master.id = Some(42);
        let variant = master.variant_for(2);
        assert_eq!(variant.channelset_id, Some(42));
        assert_eq!(variant.channel_id, 2);
        assert!(variant.attributes.is_empty());
    }

    #[test]
    fn test_effective_content_id_defaults() {
        let mut obj = ContentObject::new(10007, 1);
        assert_eq!(obj.effective_content_id(), None);
        obj.id = Some(5);
        assert_eq!(obj.effective_content_id().as_deref(), Some("10007.5"));
        obj.content_id = Some("custom".into());
        assert_eq!(obj.effective_content_id().as_deref(), Some("custom"));
    }
}
