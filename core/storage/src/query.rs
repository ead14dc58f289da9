//! Predicates and ordering for store reads.
//!
//! A [`Query`] is rendered to SQL against one table. Column names are
//! checked against the entity's declared columns before rendering.

use rusqlite::types::Value;

use waypoint_common::{Error, Result};

/// Row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every row.
    All,
    /// `column = value`.
    Eq(&'static str, Value),
    /// `column IS NULL`.
    IsNull(&'static str),
    /// `column IN (SELECT select FROM table WHERE filter)`.
    InSubquery {
        column: &'static str,
        table: &'static str,
        select: &'static str,
        filter: Box<Filter>,
    },
    /// Conjunction of predicates.
    And(Vec<Filter>),
}

impl Filter {
    /// `column = value`.
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Filter::Eq(column, value.into())
    }

    fn render(&self, columns: &[&str], sql: &mut String, params: &mut Vec<Value>) -> Result<()> {
        match self {
            Filter::All => sql.push_str("1"),
            Filter::Eq(column, value) => {
                check_column(columns, column)?;
                params.push(value.clone());
                sql.push_str(&format!("{} = ?{}", column, params.len()));
            }
            Filter::IsNull(column) => {
                check_column(columns, column)?;
                sql.push_str(&format!("{} IS NULL", column));
            }
            Filter::InSubquery {
                column,
                table,
                select,
                filter,
            } => {
                check_column(columns, column)?;
                sql.push_str(&format!("{} IN (SELECT {} FROM {} WHERE ", column, select, table));
                // Inner columns belong to another table and are not checked here.
                filter.render(&[], sql, params)?;
                sql.push(')');
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    sql.push_str("1");
                    return Ok(());
                }
                sql.push('(');
                for (i, filter) in filters.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" AND ");
                    }
                    filter.render(columns, sql, params)?;
                }
                sql.push(')');
            }
        }
        Ok(())
    }

    /// Render as a `WHERE` body, returning the SQL and its positional parameters.
    pub(crate) fn to_sql(&self, columns: &[&str]) -> Result<(String, Vec<Value>)> {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(columns, &mut sql, &mut params)?;
        Ok((sql, params))
    }
}

fn check_column(columns: &[&str], column: &str) -> Result<()> {
    // An empty column list means the caller opted out of checking.
    if columns.is_empty() || columns.contains(&column) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Unknown column: {}", column)))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub column: &'static str,
    pub direction: Direction,
}

impl Order {
    pub const fn asc(column: &'static str) -> Self {
        Self {
            column,
            direction: Direction::Asc,
        }
    }

    pub const fn desc(column: &'static str) -> Self {
        Self {
            column,
            direction: Direction::Desc,
        }
    }
}

/// A predicate plus ordering and an optional row limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<u32>,
}

impl Query {
    /// All rows, unordered.
    pub fn all() -> Self {
        Self {
            filter: Filter::All,
            order: None,
            limit: None,
        }
    }

    /// Rows matching `filter`.
    pub fn filter(filter: Filter) -> Self {
        Self {
            filter,
            order: None,
            limit: None,
        }
    }

    /// Set the ordering.
    pub fn order_by(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Limit the number of rows returned.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render a full `SELECT` against `table`.
    pub(crate) fn to_select(&self, table: &str, columns: &[&str]) -> Result<(String, Vec<Value>)> {
        let (where_sql, params) = self.filter.to_sql(columns)?;
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            columns.join(", "),
            table,
            where_sql
        );

        if let Some(order) = self.order {
            check_column(columns, order.column)?;
            let direction = match order.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            sql.push_str(&format!(" ORDER BY {} {}", order.column, direction));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        Ok((sql, params))
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}
