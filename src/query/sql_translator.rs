//! SQL Translator
//!
//! Translates filter expressions and channel scopes into parameterized SQL
//! conditions over the relational schema:
//!
//! ```sql
//! o.content_id LIKE ?                                         -- core field
//! COALESCE(json_extract(o.optimized, ?) > ?, 0)               -- optimized attribute
//! EXISTS (SELECT 1 FROM attribute_values av
//!         WHERE av.object_id = o.id AND av.name = ? AND av.value_int = ?)
//! ```
//!
//! Comparisons between a literal and an attribute of an incompatible kind
//! translate to `1=0`, matching in-memory evaluation.

use super::expression::{CompareOp, CoreField, Expression, Operand};
use crate::channel::ChannelScope;
use crate::model::{AttributeKind, Scalar, TypeCatalog};

pub struct SqlTranslator;

/// SQL condition with `?` placeholders and their values in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    /// Condition without the `WHERE` keyword
    pub clause: String,
    pub params: Vec<SqlParam>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Real(f64),
    Blob(Vec<u8>),
}

impl From<&Scalar> for SqlParam {
    fn from(value: &Scalar) -> Self {
        match value {
            Scalar::Text(s) => SqlParam::Text(s.clone()),
            Scalar::Int(v) => SqlParam::Integer(i64::from(*v)),
            Scalar::Long(v) | Scalar::Date(v) => SqlParam::Integer(*v),
            Scalar::Link(v) => SqlParam::Integer(*v as i64),
            Scalar::Double(v) => SqlParam::Real(*v),
            Scalar::Blob(b) => SqlParam::Blob(b.clone()),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ValueClass {
    Text,
    Number,
    Opaque,
}

fn class_of_kind(kind: AttributeKind) -> ValueClass {
    match kind {
        AttributeKind::Text | AttributeKind::LongText => ValueClass::Text,
        AttributeKind::Blob => ValueClass::Opaque,
        _ => ValueClass::Number,
    }
}

fn class_of_scalar(value: &Scalar) -> ValueClass {
    match value {
        Scalar::Text(_) => ValueClass::Text,
        Scalar::Blob(_) => ValueClass::Opaque,
        _ => ValueClass::Number,
    }
}

/// Side-table column holding values of `kind`.
pub fn value_column(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Text | AttributeKind::LongText => "value_text",
        AttributeKind::Double => "value_real",
        AttributeKind::Blob => "value_blob",
        _ => "value_int",
    }
}

/// Variant tag of `kind` inside the optimized JSON column.
fn json_tag(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Text | AttributeKind::LongText => "Text",
        AttributeKind::Int => "Int",
        AttributeKind::Long => "Long",
        AttributeKind::Double => "Double",
        AttributeKind::Date => "Date",
        AttributeKind::Blob => "Blob",
        AttributeKind::Link => "Link",
    }
}

const NEVER: &str = "1=0";

/// What a condition compares against.
enum Target {
    Column(&'static str, ValueClass),
    Optimized(String, ValueClass),
    SideTable(String, &'static str, ValueClass),
    Unknown,
}

impl SqlTranslator {
    /// Translate an expression to a parameterized condition on alias `o`.
    pub fn translate(expr: &Expression, catalog: &TypeCatalog) -> SqlQuery {
        let mut params = Vec::new();
        let clause = Self::translate_node(expr, catalog, &mut params);
        SqlQuery { clause, params }
    }

    /// Translate with values inlined.
    ///
    /// Debugging only; never execute the result.
    pub fn translate_inline(expr: &Expression, catalog: &TypeCatalog) -> String {
        let SqlQuery { clause, params } = Self::translate(expr, catalog);
        let mut result = clause;
        for param in params {
            let value = match param {
                SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
                SqlParam::Integer(n) => n.to_string(),
                SqlParam::Real(n) => n.to_string(),
                SqlParam::Blob(b) => format!("X'{}'", hex::encode(b)),
            };
            result = result.replacen('?', &value, 1);
        }
        result
    }

    /// Condition keeping, per channelset, only the variant nearest the
    /// selected channel of each forest.
    pub fn scope_clause(scope: &ChannelScope) -> String {
        let channels = scope.channel_ids();
        if channels.is_empty() {
            return NEVER.to_string();
        }
        let list = channels
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let rank = |alias: &str| {
            let arms: String = channels
                .iter()
                .filter_map(|c| scope.rank(*c).map(|r| format!(" WHEN {c} THEN {r}")))
                .collect();
            format!("(CASE {alias}.channel_id{arms} END)")
        };
        format!(
            "o.channel_id IN ({list}) AND NOT EXISTS (SELECT 1 FROM objects n \
             WHERE n.channelset_id = o.channelset_id AND n.channel_id IN ({list}) \
             AND {} < {})",
            rank("n"),
            rank("o")
        )
    }

    fn translate_node(expr: &Expression, catalog: &TypeCatalog, params: &mut Vec<SqlParam>) -> String {
        match expr {
            Expression::All => "1=1".to_string(),
            Expression::And(parts) => Self::join(parts, " AND ", "1=1", catalog, params),
            Expression::Or(parts) => Self::join(parts, " OR ", NEVER, catalog, params),
            Expression::Not(inner) => {
                format!("NOT ({})", Self::translate_node(inner, catalog, params))
            }
            Expression::Compare { operand, op, value } => {
                let target = Self::target(operand, catalog);
                Self::condition(target, class_of_scalar(value), params, |column, params| {
                    params.push(SqlParam::from(value));
                    format!("{column} {} ?", op.sql())
                })
            }
            Expression::In { operand, values } => {
                let Some(first) = values.first() else {
                    return NEVER.to_string();
                };
                let class = class_of_scalar(first);
                if values.iter().any(|v| class_of_scalar(v) != class) {
                    return NEVER.to_string();
                }
                let target = Self::target(operand, catalog);
                Self::condition(target, class, params, |column, params| {
                    params.extend(values.iter().map(SqlParam::from));
                    let marks = vec!["?"; values.len()].join(", ");
                    format!("{column} IN ({marks})")
                })
            }
            Expression::Like { operand, pattern } => {
                let target = Self::target(operand, catalog);
                Self::condition(target, ValueClass::Text, params, |column, params| {
                    params.push(SqlParam::Text(pattern.clone()));
                    format!("{column} LIKE ?")
                })
            }
        }
    }

    fn join(
        parts: &[Expression],
        sep: &str,
        empty: &str,
        catalog: &TypeCatalog,
        params: &mut Vec<SqlParam>,
    ) -> String {
        let parts: Vec<String> = parts
            .iter()
            .map(|p| Self::translate_node(p, catalog, params))
            .collect();
        match parts.len() {
            0 => empty.to_string(),
            1 => parts[0].clone(),
            _ => format!("({})", parts.join(sep)),
        }
    }

    fn target(operand: &Operand, catalog: &TypeCatalog) -> Target {
        match operand {
            Operand::Field(field) => {
                let column = match field {
                    CoreField::Id => "o.id",
                    CoreField::ObjType => "o.obj_type",
                    CoreField::ChannelsetId => "o.channelset_id",
                    CoreField::ChannelId => "o.channel_id",
                    CoreField::ContentId => "o.content_id",
                    CoreField::UpdatedAt => "o.updated_at",
                };
                let class = if *field == CoreField::ContentId {
                    ValueClass::Text
                } else {
                    ValueClass::Number
                };
                Target::Column(column, class)
            }
            Operand::Attribute(name) => match catalog.attribute(name) {
                None => Target::Unknown,
                Some(attr) if attr.optimized => Target::Optimized(
                    format!("$.\"{}\".Single.{}", attr.name, json_tag(attr.kind)),
                    class_of_kind(attr.kind),
                ),
                Some(attr) => Target::SideTable(
                    attr.name.clone(),
                    value_column(attr.kind),
                    class_of_kind(attr.kind),
                ),
            },
        }
    }

    /// Wrap `build(column)` for the given target, or `1=0` when the literal
    /// class can never compare with the target.
    fn condition<F>(target: Target, literal: ValueClass, params: &mut Vec<SqlParam>, build: F) -> String
    where
        F: FnOnce(&str, &mut Vec<SqlParam>) -> String,
    {
        match target {
            Target::Unknown => NEVER.to_string(),
            Target::Column(_, class)
            | Target::Optimized(_, class)
            | Target::SideTable(_, _, class)
                if class != literal || class == ValueClass::Opaque =>
            {
                NEVER.to_string()
            }
            Target::Column(column, _) => build(column, params),
            Target::Optimized(path, _) => {
                params.push(SqlParam::Text(path));
                let inner = build("json_extract(o.optimized, ?)", params);
                format!("COALESCE({inner}, 0)")
            }
            Target::SideTable(name, column, _) => {
                params.push(SqlParam::Text(name));
                let inner = build(&format!("av.{column}"), params);
                format!(
                    "EXISTS (SELECT 1 FROM attribute_values av \
                     WHERE av.object_id = o.id AND av.name = ? AND {inner})"
                )
            }
        }
    }
}
