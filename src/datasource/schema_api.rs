// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object type metadata and storage medium migration.
//!
//! Changing an attribute's `optimized` or `filesystem` flag moves every
//! stored value to the new medium in the same transaction that saves the
//! type:
//!
//! ```text
//! optimized  ⇄ side table rows ⇄ filesystem files
//! (object row)  (inline values)   (path references)
//! ```

use std::collections::{BTreeMap, HashSet};
use tracing::info;

use super::write_api::{finish_files, inline_rows};
use super::{observed, Core, Datasource};
use crate::error::{DatasourceError, Result};
use crate::fs::FsAttributeStore;
use crate::model::{
    AttributeRow, AttributeType, AttributeValue, ObjectId, ObjectType, ObjectTypeId, Scalar,
    StoredValue, TypeCatalog,
};

/// One attribute of one type changing storage medium.
struct Migration {
    obj_type: ObjectTypeId,
    from: AttributeType,
    to: AttributeType,
}

impl Core {
    /// Save `changed` types and migrate values whose medium changed.
    /// Returns the number of objects whose values moved.
    pub(crate) fn apply_type_changes(&self, changed: Vec<ObjectType>) -> Result<usize> {
        let catalog = self.catalog()?;

        let mut merged: BTreeMap<ObjectTypeId, ObjectType> =
            catalog.types().map(|ty| (ty.id, ty.clone())).collect();
        for ty in &changed {
            merged.insert(ty.id, ty.clone());
        }
        let merged = TypeCatalog::new(merged.into_values().collect());

        let mut migrations = Vec::new();
        for ty in &changed {
            merged.validate_replacement(ty)?;
            for attribute in &ty.attributes {
                if attribute.filesystem {
                    self.file_store(&attribute.name)?;
                }
                let previous = catalog
                    .object_type(ty.id)
                    .ok()
                    .and_then(|old| old.attribute(&attribute.name));
                if let Some(previous) = previous {
                    if previous.optimized != attribute.optimized || previous.filesystem != attribute.filesystem {
                        migrations.push(Migration {
                            obj_type: ty.id,
                            from: previous.clone(),
                            to: attribute.clone(),
                        });
                    }
                }
            }
        }

        let mut files = self.files.as_ref().map(FsAttributeStore::begin);
        let mut migrated = 0;
        let result = self.backend.transact(&mut |tx| {
            migrated = 0;
            for migration in &migrations {
                let name = migration.from.name.as_str();
                let objects = tx.select_objects_of_types(&[migration.obj_type])?;
                if objects.is_empty() {
                    continue;
                }

                let mut values: BTreeMap<ObjectId, Vec<Scalar>> = BTreeMap::new();
                if migration.from.optimized {
                    for row in &objects {
                        if let Some(value) = row.optimized.get(name) {
                            values.insert(row.id, value.values().to_vec());
                        }
                    }
                } else {
                    let ids: HashSet<ObjectId> = objects.iter().map(|row| row.id).collect();
                    let mut rows: Vec<AttributeRow> = tx
                        .select_attribute_rows(name)?
                        .into_iter()
                        .filter(|row| ids.contains(&row.object_id))
                        .collect();
                    rows.sort_by_key(|row| (row.object_id, row.sortorder));
                    for row in rows {
                        let scalar = match row.value {
                            StoredValue::Inline(scalar) => scalar,
                            StoredValue::File(file) => {
                                let store = self.file_store(name)?;
                                let bytes = store.read(&file)?;
                                if let Some(files) = files.as_mut() {
                                    files.stage_removal(file.path.clone());
                                }
                                migration.from.kind.scalar_from_bytes(name, bytes)?
                            }
                        };
                        values.entry(row.object_id).or_default().push(scalar);
                    }
                }

                for mut row in objects {
                    let Some(scalars) = values.remove(&row.id) else {
                        continue;
                    };
                    if migration.to.optimized {
                        row.optimized
                            .insert(name.to_string(), AttributeValue::from_values(false, scalars));
                        tx.update_object(&row)?;
                        tx.replace_attribute(row.id, name, &[])?;
                    } else {
                        if migration.from.optimized {
                            row.optimized.remove(name);
                            tx.update_object(&row)?;
                        }
                        let rows = if migration.to.filesystem {
                            let files = files.as_mut().ok_or_else(|| {
                                DatasourceError::Config(format!("no attribute.path configured for '{name}'"))
                            })?;
                            let mut rows = Vec::with_capacity(scalars.len());
                            for (sortorder, scalar) in scalars.iter().enumerate() {
                                let bytes = scalar.as_bytes().ok_or_else(|| {
                                    DatasourceError::invalid_value(name, "filesystem values must be text or binary")
                                })?;
                                let sortorder = sortorder as u32;
                                let file = files.write(tx, row.obj_type, row.id, name, sortorder, bytes)?;
                                rows.push(AttributeRow {
                                    object_id: row.id,
                                    name: name.to_string(),
                                    sortorder,
                                    value: StoredValue::File(file),
                                });
                            }
                            rows
                        } else {
                            inline_rows(row.id, name, &scalars)
                        };
                        tx.replace_attribute(row.id, name, &rows)?;
                    }
                    migrated += 1;
                }
            }

            for ty in &changed {
                tx.save_object_type(ty)?;
            }
            Ok(())
        });

        finish_files(files, result.is_ok());
        result?;

        self.cache.clear_all();
        for migration in &migrations {
            info!(
                obj_type = migration.obj_type,
                attribute = %migration.from.name,
                optimized = migration.to.optimized,
                filesystem = migration.to.filesystem,
                "Attribute storage migrated"
            );
        }
        Ok(migrated)
    }
}

impl Datasource {
    /// Copies of all object types.
    pub fn object_types(&self) -> Result<Vec<ObjectType>> {
        let catalog = self.core.catalog()?;
        Ok(catalog.types().cloned().collect())
    }

    /// Copy of one object type.
    pub fn object_type(&self, id: ObjectTypeId) -> Result<ObjectType> {
        self.core.catalog()?.object_type(id).cloned()
    }

    /// Create or replace an object type. Flipping an attribute's
    /// `optimized` or `filesystem` flag migrates its stored values.
    #[tracing::instrument(skip(self, object_type), fields(id = object_type.id))]
    pub fn save_object_type(&self, object_type: ObjectType) -> Result<()> {
        let result = self.core.apply_type_changes(vec![object_type]).map(|_| ());
        observed("save_object_type", result)
    }

    /// Move every value of attribute `name` to or from the filesystem,
    /// byte for byte and in order. Returns the number of objects migrated.
    #[tracing::instrument(skip(self))]
    pub fn migrate_attribute(&self, name: &str, to_filesystem: bool) -> Result<usize> {
        let result: Result<usize> = (|| {
            let catalog = self.core.catalog()?;
            let current = catalog
                .attribute(name)
                .ok_or_else(|| DatasourceError::invalid_value(name, "no object type declares this attribute"))?;
            if current.filesystem == to_filesystem {
                return Ok(0);
            }
            let changed = catalog
                .types()
                .filter(|ty| ty.attribute(name).is_some())
                .map(|ty| {
                    let mut ty = ty.clone();
                    for attribute in ty.attributes.iter_mut().filter(|a| a.name == name) {
                        attribute.filesystem = to_filesystem;
                        if to_filesystem {
                            attribute.optimized = false;
                        }
                    }
                    ty
                })
                .collect();
            self.core.apply_type_changes(changed)
        })();
        observed("migrate_attribute", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::DatasourceConfig;
    use crate::model::{AttributeKind, ContentObject};
    use crate::storage::{MemoryBackend, RelationalBackend};
    use std::sync::Arc;

    fn datasource(root: Option<std::path::PathBuf>) -> (Arc<MemoryBackend>, Datasource) {
        let backend = Arc::new(MemoryBackend::new());
        let config = DatasourceConfig {
            filesystem_root: root,
            ..Default::default()
        };
        let ds = Datasource::new(backend.clone(), config).unwrap();
        ds.save_structure(vec![Channel::new(1, "Master")]).unwrap();
        (backend, ds)
    }

    #[test]
    fn test_types_are_defensive_copies() {
        let (_, ds) = datasource(None);
        ds.save_object_type(ObjectType::new(1, "page").with_attribute(AttributeType::new("title", AttributeKind::Text)))
            .unwrap();

        let mut copy = ds.object_type(1).unwrap();
        copy.name = "changed".into();
        assert_eq!(ds.object_type(1).unwrap().name, "page");
        assert_eq!(ds.object_types().unwrap().len(), 1);
    }

    #[test]
    fn test_conflicting_attribute_shapes_are_rejected() {
        let (_, ds) = datasource(None);
        ds.save_object_type(ObjectType::new(1, "page").with_attribute(AttributeType::new("title", AttributeKind::Text)))
            .unwrap();
        let err = ds
            .save_object_type(ObjectType::new(2, "file").with_attribute(AttributeType::new("title", AttributeKind::Int)))
            .unwrap_err();
        assert!(matches!(err, DatasourceError::InvalidValue { .. }));
        assert!(ds.object_type(2).is_err());
    }

    #[test]
    fn test_filesystem_attribute_needs_root() {
        let (_, ds) = datasource(None);
        let err = ds
            .save_object_type(
                ObjectType::new(1, "file").with_attribute(AttributeType::new("binary", AttributeKind::Blob).filesystem()),
            )
            .unwrap_err();
        assert!(matches!(err, DatasourceError::Config(_)));
    }

    #[test]
    fn test_migrate_to_filesystem_and_back_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, ds) = datasource(Some(dir.path().to_path_buf()));
        ds.save_object_type(
            ObjectType::new(1, "doc").with_attribute(AttributeType::new("parts", AttributeKind::LongText).multivalue()),
        )
        .unwrap();

        let parts = vec![Scalar::Text("first".into()), Scalar::Text("second".into())];
        let mut doc = ContentObject::new(1, 1).with("parts", parts.clone());
        ds.store(std::slice::from_mut(&mut doc)).unwrap();

        assert_eq!(ds.migrate_attribute("parts", true).unwrap(), 1);
        assert!(ds.object_type(1).unwrap().attribute("parts").unwrap().filesystem);
        assert_eq!(ds.get_attribute(&doc, "parts").unwrap(), AttributeValue::Multi(parts.clone()));
        let path = ds.get_attribute_path(&doc, "parts", 1).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "second");

        assert_eq!(ds.migrate_attribute("parts", false).unwrap(), 1);
        assert_eq!(ds.get_attribute(&doc, "parts").unwrap(), AttributeValue::Multi(parts));
        assert!(matches!(
            ds.get_attribute_path(&doc, "parts", 0),
            Err(DatasourceError::StreamUnavailable(_))
        ));
        assert_eq!(backend.count_attribute_rows("parts").unwrap(), 2);

        // no-op when already on the requested medium
        assert_eq!(ds.migrate_attribute("parts", false).unwrap(), 0);
    }
}
