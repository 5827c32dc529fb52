use regex::Regex;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, GenericDialect};
use sqlparser::parser::Parser;
use std::sync::LazyLock;

use crate::api::middleware::AppError;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

/// SQL validation for dataset queries and the identifiers spliced around them
pub struct SqlValidator;

impl SqlValidator {
    /// Validate that `sql` is exactly one read-only query.
    ///
    /// Returns the parsed statement re-rendered as text. Comments and
    /// trailing semicolons are gone, so it can be wrapped as a subquery.
    pub fn validate_select_only(sql: &str, dialect: &dyn Dialect) -> Result<String, AppError> {
        let ast = Parser::parse_sql(dialect, sql).map_err(|e| {
            AppError::NonSelectQuery(format!("Query text is not a parseable SELECT: {}", e))
        })?;

        let stmt = match ast.as_slice() {
            [] => return Err(AppError::NonSelectQuery("Empty SQL query".to_string())),
            [stmt] => stmt,
            _ => {
                return Err(AppError::NonSelectQuery(format!(
                    "Expected a single statement, found {}",
                    ast.len()
                )))
            }
        };

        match stmt {
            Statement::Query(query) => Self::check_query(query)?,
            Statement::Insert { .. } => {
                return Err(AppError::NonSelectQuery("INSERT statements are not allowed. Only SELECT queries are permitted.".to_string()));
            }
            Statement::Update { .. } => {
                return Err(AppError::NonSelectQuery("UPDATE statements are not allowed. Only SELECT queries are permitted.".to_string()));
            }
            Statement::Delete { .. } => {
                return Err(AppError::NonSelectQuery("DELETE statements are not allowed. Only SELECT queries are permitted.".to_string()));
            }
            Statement::Drop { .. } => {
                return Err(AppError::NonSelectQuery("DROP statements are not allowed. Only SELECT queries are permitted.".to_string()));
            }
            _ => {
                return Err(AppError::NonSelectQuery(
                    "Only SELECT queries are permitted".to_string(),
                ));
            }
        }

        Ok(stmt.to_string())
    }

    /// Same as `validate_select_only` with the dialect-neutral parser
    pub fn validate_select(sql: &str) -> Result<String, AppError> {
        Self::validate_select_only(sql, &GenericDialect {})
    }

    /// A query body is read-only when every branch is a plain SELECT (without
    /// INTO), VALUES or TABLE, and every CTE is read-only too
    fn check_query(query: &Query) -> Result<(), AppError> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                Self::check_query(&cte.query)?;
            }
        }
        if !query.locks.is_empty() {
            return Err(AppError::NonSelectQuery(
                "Locking clauses (FOR UPDATE/SHARE) are not permitted".to_string(),
            ));
        }
        Self::check_set_expr(&query.body)
    }

    fn check_set_expr(body: &SetExpr) -> Result<(), AppError> {
        match body {
            SetExpr::Select(select) if select.into.is_some() => Err(AppError::NonSelectQuery(
                "SELECT ... INTO is not permitted".to_string(),
            )),
            SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
            SetExpr::Query(query) => Self::check_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                Self::check_set_expr(left)?;
                Self::check_set_expr(right)
            }
            _ => Err(AppError::NonSelectQuery(
                "Data-modifying statements are not permitted".to_string(),
            )),
        }
    }

    /// Whether `name` can be spliced into statement text as a bare identifier
    pub fn is_identifier(name: &str) -> bool {
        IDENTIFIER.is_match(name)
    }

    /// Validate a column identifier against its shape and, when known, the
    /// allow-list of columns of the dataset
    pub fn validate_column(name: &str, allowed: Option<&[String]>) -> Result<(), AppError> {
        if !Self::is_identifier(name) {
            return Err(AppError::InvalidColumnReference(format!(
                "'{}' is not a valid column identifier",
                name
            )));
        }
        match allowed {
            Some(columns) if !columns.iter().any(|c| c == name) => {
                Err(AppError::InvalidColumnReference(format!(
                    "Column '{}' does not exist in the dataset",
                    name
                )))
            }
            _ => Ok(()),
        }
    }

    /// Table names are identifiers, optionally schema-qualified with dots
    pub fn validate_table_name(name: &str) -> Result<(), AppError> {
        if name.split('.').all(Self::is_identifier) {
            Ok(())
        } else {
            Err(AppError::InvalidColumnReference(format!(
                "'{}' is not a valid table name",
                name
            )))
        }
    }
}
