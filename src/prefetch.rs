//! Batch attribute loading.
//!
//! Reading one attribute for N objects lazily costs N statements. When a
//! prefetch threshold holds, the loader instead issues one aggregate
//! statement per attribute for the whole id set and fills the cache before
//! the caller starts reading.
//!
//! ```text
//! paths ["name", "folder.name"]
//!   name         → select_attribute(name, ids)
//!   folder       → select_attribute(folder, ids)
//!   folder hop   → select_objects(targets) + select_variants(channelsets)
//!   folder.name  → select_attribute(name, target ids)
//! ```

use std::collections::BTreeMap;

use crate::cache::AttributeEntry;
use crate::config::PrefetchThresholds;
use crate::model::{AttributeRow, AttributeType, AttributeValue, ObjectId, StoredValue};

/// Why a batch load happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Warming and sorting load regardless of thresholds
    Forced,
    Count,
    Misses,
    MissPercent,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Forced => "forced",
            Trigger::Count => "count",
            Trigger::Misses => "misses",
            Trigger::MissPercent => "miss_percent",
        }
    }
}

/// Decide whether `objects` candidates with `misses` uncached values should
/// be loaded in one batch. Thresholds combine with OR; none configured means
/// lazy loading. Nothing is loaded when nothing is missing.
pub fn decide(thresholds: &PrefetchThresholds, objects: usize, misses: usize, force: bool) -> Option<Trigger> {
    if misses == 0 {
        return None;
    }
    if force {
        return Some(Trigger::Forced);
    }
    if thresholds.count.is_some_and(|count| objects >= count) {
        return Some(Trigger::Count);
    }
    if thresholds.misses.is_some_and(|limit| misses >= limit) {
        return Some(Trigger::Misses);
    }
    if let Some(percent) = thresholds.miss_percent {
        let missing = misses as f64 * 100.0 / objects.max(1) as f64;
        if missing >= percent {
            return Some(Trigger::MissPercent);
        }
    }
    None
}

/// Split a dotted path into link hops and the final attribute.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Build the cache entry of `attribute` from its side-table rows.
pub fn entry_from_rows(attribute: &AttributeType, rows: Vec<AttributeRow>) -> AttributeEntry {
    let mut rows = rows;
    rows.sort_by_key(|row| row.sortorder);
    if attribute.filesystem {
        AttributeEntry::Files(rows.iter().filter_map(|row| row.file().cloned()).collect())
    } else {
        let values = rows
            .into_iter()
            .filter_map(|row| match row.value {
                StoredValue::Inline(scalar) => Some(scalar),
                StoredValue::File(_) => None,
            })
            .collect();
        AttributeEntry::Inline(AttributeValue::from_values(attribute.multivalue, values))
    }
}

/// Group rows of one attribute by object. Every id in `ids` gets an entry,
/// objects without rows an empty one.
pub fn group_entries(
    attribute: &AttributeType,
    ids: &[ObjectId],
    rows: Vec<AttributeRow>,
) -> Vec<(ObjectId, AttributeEntry)> {
    let mut grouped: BTreeMap<ObjectId, Vec<AttributeRow>> =
        ids.iter().map(|id| (*id, Vec::new())).collect();
    for row in rows {
        if let Some(bucket) = grouped.get_mut(&row.object_id) {
            bucket.push(row);
        }
    }
    grouped
        .into_iter()
        .map(|(id, rows)| (id, entry_from_rows(attribute, rows)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeKind, FileRef, Scalar};

    fn thresholds(count: Option<usize>, misses: Option<usize>, percent: Option<f64>) -> PrefetchThresholds {
        PrefetchThresholds {
            count,
            misses,
            miss_percent: percent,
        }
    }

    #[test]
    fn test_no_thresholds_is_lazy() {
        assert_eq!(decide(&PrefetchThresholds::default(), 1000, 1000, false), None);
        assert_eq!(decide(&PrefetchThresholds::default(), 10, 3, true), Some(Trigger::Forced));
    }

    #[test]
    fn test_thresholds_combine_with_or() {
        let t = thresholds(Some(50), Some(5), Some(80.0));
        assert_eq!(decide(&t, 50, 1, false), Some(Trigger::Count));
        assert_eq!(decide(&t, 10, 5, false), Some(Trigger::Misses));
        assert_eq!(decide(&t, 4, 4, false), Some(Trigger::MissPercent));
        assert_eq!(decide(&t, 10, 4, false), None);
    }

    #[test]
    fn test_nothing_missing_never_loads() {
        let t = thresholds(Some(1), None, None);
        assert_eq!(decide(&t, 100, 0, false), None);
        assert_eq!(decide(&t, 100, 0, true), None);
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("folder.name"), vec!["folder", "name"]);
        assert_eq!(split_path("name"), vec!["name"]);
        assert!(split_path("").is_empty());
    }

    #[test]
    fn test_group_entries_orders_values_and_fills_gaps() {
        let tags = AttributeType::new("tags", AttributeKind::Text).multivalue();
        let row = |id, sortorder, text: &str| AttributeRow {
            object_id: id,
            name: "tags".into(),
            sortorder,
            value: StoredValue::Inline(Scalar::Text(text.into())),
        };
        let entries = group_entries(&tags, &[1, 2], vec![row(1, 1, "b"), row(1, 0, "a")]);
        assert_eq!(
            entries,
            vec![
                (
                    1,
                    AttributeEntry::Inline(AttributeValue::Multi(vec![
                        Scalar::Text("a".into()),
                        Scalar::Text("b".into())
                    ]))
                ),
                (2, AttributeEntry::Inline(AttributeValue::Null)),
            ]
        );
    }

    #[test]
    fn test_filesystem_entries_keep_references() {
        let body = AttributeType::new("body", AttributeKind::LongText).filesystem();
        let file = FileRef {
            path: "aa/bb/x".into(),
            hash: "aabb".into(),
            length: 3,
        };
        let rows = vec![AttributeRow {
            object_id: 1,
            name: "body".into(),
            sortorder: 0,
            value: StoredValue::File(file.clone()),
        }];
        assert_eq!(entry_from_rows(&body, rows), AttributeEntry::Files(vec![file]));
    }
}
