//! Row predicates. A [`Conditions`] value is a conjunction: a row matches
//! only when every condition holds.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use tether_core::{Row, RowId, Value};

/// Comparison applied between a row's field and a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub(crate) fn holds(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (CompareOp::Ne, None) => true,
            (_, None) => false,
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field <op> value`; an absent field reads as `Null`.
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// Row id is one of the given ids.
    IdIn(BTreeSet<RowId>),
}

impl Condition {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Compare { field, op, value } => {
                let cell = row.record.get(field).unwrap_or(&Value::Null);
                op.holds(cell.compare(value))
            }
            Condition::IdIn(ids) => ids.contains(&row.id),
        }
    }
}

/// Conjunction of [`Condition`]s. Empty matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.0.push(condition);
        self
    }

    fn compare(self, field: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.and(Condition::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        })
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(field, CompareOp::Eq, value)
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(field, CompareOp::Ne, value)
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(field, CompareOp::Lt, value)
    }

    pub fn le(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(field, CompareOp::Le, value)
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(field, CompareOp::Gt, value)
    }

    pub fn ge(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(field, CompareOp::Ge, value)
    }

    pub fn ids(self, ids: impl IntoIterator<Item = RowId>) -> Self {
        self.and(Condition::IdIn(ids.into_iter().collect()))
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|c| c.matches(row))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tether_core::Record;

    use super::*;

    fn row(id: u64, ts: i64, committed: bool) -> Row {
        Row {
            id: RowId(id),
            record: Record::new()
                .with("owner", "P1")
                .with("timestamp", ts)
                .with("committed", committed),
        }
    }

    #[rstest]
    #[case(Conditions::new().le("timestamp", 100i64), true)]
    #[case(Conditions::new().lt("timestamp", 100i64), false)]
    #[case(Conditions::new().ge("timestamp", 100i64), true)]
    #[case(Conditions::new().gt("timestamp", 99i64), true)]
    #[case(Conditions::new().eq("committed", false).eq("owner", "P1"), true)]
    #[case(Conditions::new().eq("committed", false).eq("owner", "P2"), false)]
    #[case(Conditions::new().ne("owner", "P2"), true)]
    #[case(Conditions::new().ids([RowId(1), RowId(3)]), true)]
    #[case(Conditions::new().ids([RowId(2)]), false)]
    #[case(Conditions::new(), true)]
    fn conditions_against_single_row(#[case] conditions: Conditions, #[case] expected: bool) {
        assert_eq!(conditions.matches(&row(1, 100, false)), expected);
    }

    #[test]
    fn absent_field_reads_as_null() {
        let r = row(1, 100, false);
        assert!(Conditions::new().eq("label", Value::Null).matches(&r));
        assert!(!Conditions::new().le("label", 5i64).matches(&r));
        assert!(Conditions::new().ne("label", "walk").matches(&r));
    }
}
