use std::ops::ControlFlow;

use sha2::{Digest, Sha256};
use sqlparser::ast::{visit_expressions_mut, Expr, Ident, Statement, UnaryOperator};
use sqlparser::dialect::{dialect_from_str, Dialect, GenericDialect};
use sqlparser::parser::Parser;

use crate::error::{Error, Result};

const PLACEHOLDER: &str = "?";

/// Dialect names understood by `sqlparser`, matched against the driver name.
const KNOWN_DIALECTS: &[&str] = &[
    "postgres",
    "sqlite",
    "mssql",
    "snowflake",
    "bigquery",
    "duckdb",
    "clickhouse",
    "redshift",
    "hive",
    "databricks",
    "ansi",
];

pub(crate) fn dialect_for(driver: &str) -> Box<dyn Dialect> {
    let driver = driver.to_ascii_lowercase();
    KNOWN_DIALECTS
        .iter()
        .find(|name| driver.contains(*name))
        .and_then(|name| dialect_from_str(name))
        .unwrap_or_else(|| Box::new(GenericDialect {}))
}

/// Parses `query`, replaces every literal with a placeholder and hashes the
/// re-rendered statements.
pub(crate) fn fingerprint(driver: &str, query: &str) -> Result<String> {
    let dialect = dialect_for(driver);
    let mut statements =
        Parser::parse_sql(&*dialect, query).map_err(|err| Error::MalformedQuery {
            query: query.to_string(),
            reason: err.to_string(),
        })?;

    let canonical = canonical_text(&mut statements);
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn canonical_text(statements: &mut Vec<Statement>) -> String {
    // Expressions are visited children first, so a signed literal has already
    // been replaced by the time its unary operator is seen.
    let _ = visit_expressions_mut(statements, |expr| {
        let collapse = match expr {
            Expr::Value(_) => true,
            Expr::UnaryOp {
                op: UnaryOperator::Minus | UnaryOperator::Plus,
                expr: inner,
            } => is_placeholder(inner),
            Expr::InList { list, .. } => {
                list.truncate(1);
                false
            }
            _ => false,
        };
        if collapse {
            *expr = placeholder();
        }
        ControlFlow::<()>::Continue(())
    });

    statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
        .to_lowercase()
}

fn placeholder() -> Expr {
    Expr::Identifier(Ident::new(PLACEHOLDER))
}

fn is_placeholder(expr: &Expr) -> bool {
    matches!(expr, Expr::Identifier(ident) if ident.value == PLACEHOLDER && ident.quote_style.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(driver: &str, query: &str) -> String {
        let dialect = dialect_for(driver);
        let mut statements = Parser::parse_sql(&*dialect, query).unwrap();
        canonical_text(&mut statements)
    }

    #[test]
    fn literals_become_placeholders() {
        assert_eq!(
            canonical("postgresql", "SELECT * FROM legs WHERE chair_id = 42 AND name = 'x'"),
            "select * from legs where chair_id = ? and name = ?"
        );
    }

    #[test]
    fn negative_numbers_match_positive_ones() {
        assert_eq!(
            canonical("postgresql", "SELECT * FROM t WHERE a = -1"),
            canonical("postgresql", "SELECT * FROM t WHERE a = 7"),
        );
    }

    #[test]
    fn in_lists_collapse_to_one_element() {
        assert_eq!(
            canonical("sqlite3", "SELECT id FROM legs WHERE id IN (1, 2, 3)"),
            "select id from legs where id in (?)"
        );
    }

    #[test]
    fn unknown_drivers_fall_back_to_generic_dialect() {
        assert!(fingerprint("oracle-enhanced", "SELECT 1").is_ok());
    }

    #[test]
    fn parse_failures_carry_the_query() {
        let err = fingerprint("postgresql", "SELEC oops FROM").unwrap_err();
        match err {
            Error::MalformedQuery { query, .. } => assert_eq!(query, "SELEC oops FROM"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
