// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter expression AST.
//!
//! Expressions are built programmatically or deserialized from JSON; there is
//! no textual grammar. Backends either translate them to SQL
//! ([`SqlTranslator`](super::sql_translator::SqlTranslator)) or evaluate them
//! directly with [`Expression::matches`].
//!
//! # Example
//!
//! ```rust
//! use multichannel_store::query::{CompareOp, Expression};
//! use multichannel_store::model::Scalar;
//!
//! let expr = Expression::obj_type(10007)
//!     .and(Expression::attr("int", CompareOp::Gt, Scalar::Int(5)));
//! assert_eq!(expr.attribute_names(), vec!["int"]);
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::model::{ObjectId, ObjectTypeId, Scalar};

/// Columns every object row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreField {
    Id,
    ObjType,
    ChannelsetId,
    ChannelId,
    ContentId,
    UpdatedAt,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Field(CoreField),
    Attribute(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Filter expression node.
///
/// Attribute conditions hold when *any* stored value of the attribute
/// satisfies them, so unset attributes never match a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Compare {
        operand: Operand,
        op: CompareOp,
        value: Scalar,
    },
    In {
        operand: Operand,
        values: Vec<Scalar>,
    },
    /// SQL `LIKE` pattern (`%` and `_`), ASCII case-insensitive.
    Like {
        operand: Operand,
        pattern: String,
    },
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    /// Matches every object.
    All,
}

impl Expression {
    pub fn attr(name: &str, op: CompareOp, value: Scalar) -> Self {
        Expression::Compare {
            operand: Operand::Attribute(name.to_string()),
            op,
            value,
        }
    }

    pub fn attr_eq(name: &str, value: Scalar) -> Self {
        Self::attr(name, CompareOp::Eq, value)
    }

    pub fn attr_like(name: &str, pattern: &str) -> Self {
        Expression::Like {
            operand: Operand::Attribute(name.to_string()),
            pattern: pattern.to_string(),
        }
    }

    pub fn field(field: CoreField, op: CompareOp, value: Scalar) -> Self {
        Expression::Compare {
            operand: Operand::Field(field),
            op,
            value,
        }
    }

    pub fn obj_type(obj_type: ObjectTypeId) -> Self {
        Self::field(CoreField::ObjType, CompareOp::Eq, Scalar::Long(i64::from(obj_type)))
    }

    pub fn ids_in(ids: &[ObjectId]) -> Self {
        Expression::In {
            operand: Operand::Field(CoreField::Id),
            values: ids.iter().map(|id| Scalar::Long(*id as i64)).collect(),
        }
    }

    #[must_use]
    pub fn and(self, other: Expression) -> Self {
        match self {
            Expression::And(mut parts) => {
                parts.push(other);
                Expression::And(parts)
            }
            first => Expression::And(vec![first, other]),
        }
    }

    #[must_use]
    pub fn or(self, other: Expression) -> Self {
        match self {
            Expression::Or(mut parts) => {
                parts.push(other);
                Expression::Or(parts)
            }
            first => Expression::Or(vec![first, other]),
        }
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Expression::Not(Box::new(self))
    }

    /// Attribute names referenced anywhere in the tree, in first-seen order.
    pub fn attribute_names(&self) -> Vec<&str> {
        fn walk<'a>(expr: &'a Expression, out: &mut Vec<&'a str>) {
            match expr {
                Expression::Compare { operand, .. }
                | Expression::In { operand, .. }
                | Expression::Like { operand, .. } => {
                    if let Operand::Attribute(name) = operand {
                        if !out.contains(&name.as_str()) {
                            out.push(name);
                        }
                    }
                }
                Expression::And(parts) | Expression::Or(parts) => {
                    parts.iter().for_each(|p| walk(p, out));
                }
                Expression::Not(inner) => walk(inner, out),
                Expression::All => {}
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }

    /// Evaluate against one object. `values` yields the stored values of an
    /// operand (empty when unset).
    pub fn matches<F>(&self, values: &mut F) -> bool
    where
        F: FnMut(&Operand) -> Vec<Scalar>,
    {
        match self {
            Expression::Compare { operand, op, value } => values(operand)
                .iter()
                .any(|v| v.compare(value).is_some_and(|ord| op.holds(ord))),
            Expression::In { operand, values: wanted } => values(operand).iter().any(|v| {
                wanted
                    .iter()
                    .any(|w| v.compare(w) == Some(Ordering::Equal))
            }),
            Expression::Like { operand, pattern } => values(operand)
                .iter()
                .filter_map(Scalar::as_text)
                .any(|text| like_match(pattern, text)),
            Expression::And(parts) => parts.iter().all(|p| p.matches(values)),
            Expression::Or(parts) => parts.iter().any(|p| p.matches(values)),
            Expression::Not(inner) => !inner.matches(values),
            Expression::All => true,
        }
    }
}

/// SQL `LIKE` semantics: `%` matches any run, `_` one character,
/// ASCII letters compare case-insensitively.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    // dp[j]: pattern prefix p[..i] matches text prefix t[..j]
    let mut dp = vec![false; t.len() + 1];
    dp[0] = true;
    for pc in &p {
        let mut next = vec![false; t.len() + 1];
        if *pc == '%' {
            let mut seen = false;
            for j in 0..=t.len() {
                seen |= dp[j];
                next[j] = seen;
            }
        } else {
            for j in 1..=t.len() {
                next[j] = dp[j - 1] && (*pc == '_' || pc.eq_ignore_ascii_case(&t[j - 1]));
            }
        }
        dp = next;
    }
    dp[t.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str, vals: Vec<Scalar>) -> impl FnMut(&Operand) -> Vec<Scalar> {
        let name = name.to_string();
        move |operand| match operand {
            Operand::Attribute(a) if *a == name => vals.clone(),
            Operand::Field(CoreField::ObjType) => vec![Scalar::Long(10007)],
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("abc", "ABC"));
        assert!(like_match("a%", "anything"));
        assert!(like_match("%mid%", "in the middle"));
        assert!(like_match("a_c", "abc"));
        assert!(!like_match("a_c", "abbc"));
        assert!(like_match("%", ""));
        assert!(!like_match("_", ""));
    }

    #[test]
    fn test_compare_any_value() {
        let expr = Expression::attr("tags", CompareOp::Eq, Scalar::Text("b".into()));
        let mut values = lookup("tags", vec![Scalar::Text("a".into()), Scalar::Text("b".into())]);
        assert!(expr.matches(&mut values));
    }

    #[test]
    fn test_unset_attribute_never_compares() {
        let expr = Expression::attr("int", CompareOp::Ne, Scalar::Int(1));
        let mut values = lookup("other", vec![]);
        assert!(!expr.matches(&mut values));
        assert!(expr.negate().matches(&mut values));
    }

    #[test]
    fn test_boolean_combinators() {
        let expr = Expression::obj_type(10007)
            .and(Expression::attr("int", CompareOp::Ge, Scalar::Int(5)))
            .and(Expression::In {
                operand: Operand::Attribute("int".into()),
                values: vec![Scalar::Int(5), Scalar::Int(6)],
            });
        assert!(matches!(&expr, Expression::And(parts) if parts.len() == 3));
        let mut values = lookup("int", vec![Scalar::Int(6)]);
        assert!(expr.matches(&mut values));
        let mut values = lookup("int", vec![Scalar::Int(7)]);
        assert!(!expr.matches(&mut values));
        assert!(!Expression::Or(vec![]).matches(&mut values));
        assert!(Expression::And(vec![]).matches(&mut values));
    }

    #[test]
    fn test_attribute_names_deduplicated() {
        let expr = Expression::attr_eq("a", Scalar::Int(1))
            .or(Expression::attr_like("b", "x%"))
            .or(Expression::attr_eq("a", Scalar::Int(2)).negate());
        assert_eq!(expr.attribute_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_json_shape() {
        let expr = Expression::attr_eq("name", Scalar::Text("x".into()));
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["compare"]["operand"]["attribute"], "name");
        assert_eq!(json["compare"]["op"], "eq");
        let back: Expression = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
