//! Small structured builder for the `SELECT` statements run against staging tables.
use crate::names::quote_ident;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn keyword(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct SelectItem {
    expr: String,
    alias: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
struct OrderTerm {
    expr: String,
    direction: SortDirection,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectQuery {
    distinct: bool,
    items: Vec<SelectItem>,
    from: String,
    condition: Option<String>,
    group_by: Vec<String>,
    order_by: Vec<OrderTerm>,
}

impl SelectQuery {
    /// Start a query against `table` (quoted on render).
    pub fn from(table: &str) -> Self {
        Self {
            distinct: false,
            items: Vec::new(),
            from: table.to_string(),
            condition: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn column(mut self, expr: impl Into<String>) -> Self {
        self.push_column(expr, None);
        self
    }

    pub fn push_column(&mut self, expr: impl Into<String>, alias: Option<String>) {
        self.items.push(SelectItem {
            expr: expr.into(),
            alias,
        });
    }

    /// Set the `WHERE` condition (without the keyword).
    pub fn filter(mut self, condition: Option<String>) -> Self {
        self.condition = condition;
        self
    }

    pub fn group_by(mut self, expr: impl Into<String>) -> Self {
        self.group_by.push(expr.into());
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>, direction: SortDirection) -> Self {
        self.push_order(expr, direction);
        self
    }

    pub fn push_order(&mut self, expr: impl Into<String>, direction: SortDirection) {
        self.order_by.push(OrderTerm {
            expr: expr.into(),
            direction,
        });
    }

    pub fn column_count(&self) -> usize {
        self.items.len()
    }

    pub fn to_sql(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&item.expr)?;
            if let Some(alias) = &item.alias {
                write!(f, " AS {}", quote_ident(alias))?;
            }
        }
        write!(f, " FROM {}", quote_ident(&self.from))?;
        if let Some(condition) = &self.condition {
            write!(f, " WHERE {condition}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }
        for (i, term) in self.order_by.iter().enumerate() {
            f.write_str(if i == 0 { " ORDER BY " } else { ", " })?;
            write!(f, "{} {}", term.expr, term.direction.keyword())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_clauses_in_order() {
        let mut q = SelectQuery::from("t")
            .column("\"a\"")
            .filter(Some("(\"a\" > 1)".into()))
            .group_by("\"a\"")
            .order_by("MIN(\"id\")", SortDirection::Asc);
        q.push_column("COUNT(\"id\")", Some("n".into()));
        assert_eq!(
            q.to_sql(),
            "SELECT \"a\", COUNT(\"id\") AS \"n\" FROM \"t\" WHERE (\"a\" > 1) GROUP BY \"a\" ORDER BY MIN(\"id\") ASC"
        );
    }
}
