//! Object type and attribute type metadata.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::object::{AttributeValue, Scalar};
use super::ObjectTypeId;
use crate::error::{DatasourceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Text,
    LongText,
    Int,
    Long,
    Double,
    Date,
    Blob,
    Link,
}

impl AttributeKind {
    pub fn accepts(self, value: &Scalar) -> bool {
        matches!(
            (self, value),
            (AttributeKind::Text | AttributeKind::LongText, Scalar::Text(_))
                | (AttributeKind::Int, Scalar::Int(_))
                | (AttributeKind::Long, Scalar::Long(_))
                | (AttributeKind::Double, Scalar::Double(_))
                | (AttributeKind::Date, Scalar::Date(_))
                | (AttributeKind::Blob, Scalar::Blob(_))
                | (AttributeKind::Link, Scalar::Link(_))
        )
    }

    /// Rebuild a typed value from raw filesystem bytes.
    pub(crate) fn scalar_from_bytes(self, attribute: &str, bytes: Vec<u8>) -> Result<Scalar> {
        match self {
            AttributeKind::Blob => Ok(Scalar::Blob(bytes)),
            AttributeKind::Text | AttributeKind::LongText => String::from_utf8(bytes)
                .map(Scalar::Text)
                .map_err(|e| DatasourceError::invalid_value(attribute, e.to_string())),
            other => Err(DatasourceError::invalid_value(
                attribute,
                format!("{other:?} values cannot be stored on the filesystem"),
            )),
        }
    }
}

/// Definition of one attribute. Attribute names are global: every object
/// type using a name must define it identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeType {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub multivalue: bool,
    /// Value lives in the object row instead of the side table.
    #[serde(default)]
    pub optimized: bool,
    /// Value lives in a file referenced by the side table row.
    #[serde(default)]
    pub filesystem: bool,
    #[serde(default)]
    pub linked_type: Option<ObjectTypeId>,
}

impl AttributeType {
    #[must_use]
    pub fn new(name: &str, kind: AttributeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            multivalue: false,
            optimized: false,
            filesystem: false,
            linked_type: None,
        }
    }

    #[must_use]
    pub fn multivalue(mut self) -> Self {
        self.multivalue = true;
        self
    }

    #[must_use]
    pub fn optimized(mut self) -> Self {
        self.optimized = true;
        self
    }

    #[must_use]
    pub fn filesystem(mut self) -> Self {
        self.filesystem = true;
        self
    }

    #[must_use]
    pub fn linking(mut self, target: ObjectTypeId) -> Self {
        self.linked_type = Some(target);
        self
    }

    /// Same storage and value shape, ignoring the name.
    fn same_shape(&self, other: &AttributeType) -> bool {
        self.kind == other.kind
            && self.multivalue == other.multivalue
            && self.optimized == other.optimized
            && self.filesystem == other.filesystem
    }

    pub fn validate(&self) -> Result<()> {
        let well_formed = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !well_formed {
            return Err(DatasourceError::invalid_value(
                &self.name,
                "attribute names must be non-empty and use only [A-Za-z0-9_-]",
            ));
        }
        if self.optimized && self.multivalue {
            return Err(DatasourceError::invalid_value(
                &self.name,
                "optimized attributes cannot be multivalue",
            ));
        }
        if self.optimized && self.filesystem {
            return Err(DatasourceError::invalid_value(
                &self.name,
                "optimized attributes cannot be stored on the filesystem",
            ));
        }
        if self.filesystem && !matches!(self.kind, AttributeKind::LongText | AttributeKind::Blob) {
            return Err(DatasourceError::invalid_value(
                &self.name,
                "only longtext and blob attributes can be stored on the filesystem",
            ));
        }
        Ok(())
    }

    /// Check that `value` has this attribute's kind and arity.
    pub fn check_value(&self, value: &AttributeValue) -> Result<()> {
        if let AttributeValue::Multi(values) = value {
            if !self.multivalue && values.len() > 1 {
                return Err(DatasourceError::invalid_value(
                    &self.name,
                    "multiple values for a single-valued attribute",
                ));
            }
        }
        for scalar in value.values() {
            if !self.kind.accepts(scalar) {
                return Err(DatasourceError::invalid_value(
                    &self.name,
                    format!("{scalar:?} is not a {:?} value", self.kind),
                ));
            }
        }
        Ok(())
    }

    /// `value` in the shape reads return: `Null` when empty, `Multi` for
    /// multivalue attributes, `Single` otherwise.
    #[must_use]
    pub fn normalize(&self, value: AttributeValue) -> AttributeValue {
        match value {
            AttributeValue::Null => AttributeValue::Null,
            AttributeValue::Single(scalar) => AttributeValue::from_values(self.multivalue, vec![scalar]),
            AttributeValue::Multi(values) => AttributeValue::from_values(self.multivalue, values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    pub id: ObjectTypeId,
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeType>,
}

impl ObjectType {
    #[must_use]
    pub fn new(id: ObjectTypeId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: AttributeType) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeType> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Indexed, immutable view of all object types.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: BTreeMap<ObjectTypeId, ObjectType>,
    by_name: HashMap<String, AttributeType>,
}

impl TypeCatalog {
    pub fn new(types: Vec<ObjectType>) -> Self {
        let mut by_name = HashMap::new();
        for ty in &types {
            for attr in &ty.attributes {
                by_name.entry(attr.name.clone()).or_insert_with(|| attr.clone());
            }
        }
        Self {
            types: types.into_iter().map(|t| (t.id, t)).collect(),
            by_name,
        }
    }

    pub fn object_type(&self, id: ObjectTypeId) -> Result<&ObjectType> {
        self.types.get(&id).ok_or(DatasourceError::UnknownObjectType(id))
    }

    pub fn types(&self) -> impl Iterator<Item = &ObjectType> {
        self.types.values()
    }

    /// Global attribute definition by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeType> {
        self.by_name.get(name)
    }

    /// Attribute definition as declared on `obj_type`.
    pub fn attribute_for(&self, obj_type: ObjectTypeId, name: &str) -> Result<&AttributeType> {
        self.object_type(obj_type)?
            .attribute(name)
            .ok_or_else(|| DatasourceError::UnknownAttribute {
                obj_type,
                attribute: name.to_string(),
            })
    }

    /// Ids of types declaring `name`.
    pub fn types_with_attribute(&self, name: &str) -> Vec<ObjectTypeId> {
        self.types
            .values()
            .filter(|t| t.attribute(name).is_some())
            .map(|t| t.id)
            .collect()
    }

    /// Validate a type before it replaces the stored definition with the same id.
    pub fn validate_replacement(&self, ty: &ObjectType) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for attr in &ty.attributes {
            attr.validate()?;
            if !seen.insert(attr.name.as_str()) {
                return Err(DatasourceError::invalid_value(&attr.name, "declared twice"));
            }
            let conflict = self
                .types
                .values()
                .filter(|other| other.id != ty.id)
                .filter_map(|other| other.attribute(&attr.name))
                .any(|other| !other.same_shape(attr));
            if conflict {
                return Err(DatasourceError::invalid_value(
                    &attr.name,
                    "already defined with a different shape by another object type",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> ObjectType {
        ObjectType::new(10007, "article")
            .with_attribute(AttributeType::new("name", AttributeKind::Text).optimized())
            .with_attribute(AttributeType::new("tags", AttributeKind::Text).multivalue())
            .with_attribute(AttributeType::new("body", AttributeKind::LongText).filesystem())
    }

    #[test]
    fn test_kind_accepts() {
        assert!(AttributeKind::LongText.accepts(&Scalar::Text("x".into())));
        assert!(!AttributeKind::Int.accepts(&Scalar::Long(1)));
        assert!(AttributeKind::Link.accepts(&Scalar::Link(4)));
    }

    #[test]
    fn test_invalid_attribute_shapes() {
        assert!(AttributeType::new("a", AttributeKind::Int).optimized().multivalue().validate().is_err());
        assert!(AttributeType::new("a", AttributeKind::Int).filesystem().validate().is_err());
        assert!(AttributeType::new("a.b", AttributeKind::Int).validate().is_err());
        assert!(AttributeType::new("b", AttributeKind::Blob).filesystem().validate().is_ok());
    }

    #[test]
    fn test_check_value_rejects_wrong_kind_and_arity() {
        let attr = AttributeType::new("n", AttributeKind::Int);
        assert!(attr.check_value(&AttributeValue::from(3)).is_ok());
        assert!(attr.check_value(&AttributeValue::from("3")).is_err());
        assert!(attr
            .check_value(&AttributeValue::Multi(vec![Scalar::Int(1), Scalar::Int(2)]))
            .is_err());
        assert!(attr.check_value(&AttributeValue::Null).is_ok());
    }

    #[test]
    fn test_normalize_matches_read_shape() {
        let single = AttributeType::new("n", AttributeKind::Int);
        let multi = AttributeType::new("tags", AttributeKind::Int).multivalue();

        assert_eq!(
            single.normalize(AttributeValue::Multi(vec![Scalar::Int(1)])),
            AttributeValue::Single(Scalar::Int(1))
        );
        assert_eq!(single.normalize(AttributeValue::Multi(vec![])), AttributeValue::Null);
        assert_eq!(
            multi.normalize(AttributeValue::Single(Scalar::Int(1))),
            AttributeValue::Multi(vec![Scalar::Int(1)])
        );
        assert_eq!(multi.normalize(AttributeValue::Multi(vec![])), AttributeValue::Null);
        assert_eq!(
            multi.normalize(AttributeValue::Multi(vec![Scalar::Int(1), Scalar::Int(2)])),
            AttributeValue::Multi(vec![Scalar::Int(1), Scalar::Int(2)])
        );
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = TypeCatalog::new(vec![article()]);
        assert!(catalog.attribute("tags").is_some_and(|a| a.multivalue));
        assert!(catalog.attribute_for(10007, "body").is_ok());
        assert!(matches!(
            catalog.attribute_for(10007, "missing"),
            Err(DatasourceError::UnknownAttribute { .. })
        ));
        assert!(matches!(
            catalog.object_type(1),
            Err(DatasourceError::UnknownObjectType(1))
        ));
        assert_eq!(catalog.types_with_attribute("name"), vec![10007]);
    }

    #[test]
    fn test_conflicting_definition_across_types() {
        let catalog = TypeCatalog::new(vec![article()]);
        let folder = ObjectType::new(10002, "folder")
            .with_attribute(AttributeType::new("name", AttributeKind::Int));
        assert!(catalog.validate_replacement(&folder).is_err());

        let folder = ObjectType::new(10002, "folder")
            .with_attribute(AttributeType::new("name", AttributeKind::Text).optimized());
        assert!(catalog.validate_replacement(&folder).is_ok());
    }

    #[test]
    fn test_replacement_of_same_type_may_change_shape() {
        let catalog = TypeCatalog::new(vec![article()]);
        let mut changed = article();
        changed.attributes[2].filesystem = false;
        assert!(catalog.validate_replacement(&changed).is_ok());
    }
}
