//! Validated filters.

use super::expression::Expression;
use crate::error::{DatasourceError, Result};
use crate::model::TypeCatalog;

/// An expression checked against the type catalog.
///
/// Construction fails with [`DatasourceError::FilterUnsupported`] when the
/// expression references a filesystem attribute: those values are not
/// queryable.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    expression: Expression,
    key: String,
}

impl Filter {
    pub fn new(expression: Expression, catalog: &TypeCatalog) -> Result<Self> {
        for name in expression.attribute_names() {
            if catalog.attribute(name).is_some_and(|a| a.filesystem) {
                return Err(DatasourceError::FilterUnsupported(name.to_string()));
            }
        }
        let key = format!("{expression:?}");
        Ok(Self { expression, key })
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// Stable cache key for this filter.
    pub fn key(&self) -> &str {
        &self.key
    }
}
