//! Filters, result options and SQL translation.

pub mod expression;
pub mod filter;
pub mod sql_translator;

pub use expression::{CompareOp, CoreField, Expression, Operand};
pub use filter::Filter;
pub use sql_translator::{SqlParam, SqlQuery, SqlTranslator};

/// Sort key for `get_result`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortSpec {
    pub attribute: String,
    pub ascending: bool,
}

impl SortSpec {
    pub fn asc(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            ascending: true,
        }
    }

    pub fn desc(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            ascending: false,
        }
    }
}

/// Sorting, paging and prefetch options for `get_result`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub sort: Vec<SortSpec>,
    pub start: usize,
    /// Maximum number of results; `None` returns everything after `start`.
    pub count: Option<usize>,
    /// Attribute names or dotted `link.attr` paths to prefetch for the result.
    pub prefetch: Vec<String>,
}

impl QueryOptions {
    #[must_use]
    pub fn sorted_by(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    #[must_use]
    pub fn page(mut self, start: usize, count: usize) -> Self {
        self.start = start;
        self.count = Some(count);
        self
    }

    #[must_use]
    pub fn prefetching(mut self, paths: &[&str]) -> Self {
        self.prefetch.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    /// Cache key component; prefetch does not change the result ids.
    pub(crate) fn key(&self) -> String {
        format!("{:?}|{}|{:?}", self.sort, self.start, self.count)
    }
}
