//! Query fingerprinting.
//!
//! A fingerprint is the structural signature of a statement: two queries that
//! only differ in bound values share one. MySQL-family drivers go through the
//! text canonicalizer in [`structural`]; every other driver is parsed with
//! `sqlparser`, which is only available with the `grammar` feature.

#[cfg(feature = "grammar")]
mod grammar;
pub mod structural;

use crate::error::{Error, Result};

const STRUCTURAL_DRIVERS: &[&str] = &["mysql", "mariadb", "trilogy"];

/// Strategy used to fingerprint queries for one driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprinter {
    Structural,
    Grammar { driver: String },
}

impl Fingerprinter {
    /// Picks the strategy for a driver name such as `"mysql2"` or `"postgresql"`.
    ///
    /// Fails when the driver needs the grammar-aware parser and this build
    /// was compiled without it.
    pub fn for_driver(driver: &str) -> Result<Self> {
        let lowered = driver.to_ascii_lowercase();
        if STRUCTURAL_DRIVERS.iter().any(|name| lowered.contains(name)) {
            return Ok(Fingerprinter::Structural);
        }
        if cfg!(feature = "grammar") {
            Ok(Fingerprinter::Grammar {
                driver: driver.to_string(),
            })
        } else {
            Err(Error::Configuration(format!(
                "driver `{driver}` needs grammar-aware fingerprinting; \
                 enable the `grammar` feature of n1_scanner (sqlparser)"
            )))
        }
    }

    pub fn fingerprint(&self, query: &str) -> Result<String> {
        match self {
            Fingerprinter::Structural => structural::canonicalize(query),
            #[cfg(feature = "grammar")]
            Fingerprinter::Grammar { driver } => grammar::fingerprint(driver, query),
            #[cfg(not(feature = "grammar"))]
            Fingerprinter::Grammar { driver } => Err(Error::Configuration(format!(
                "driver `{driver}` needs grammar-aware fingerprinting; \
                 enable the `grammar` feature of n1_scanner (sqlparser)"
            ))),
        }
    }
}

/// Fingerprints `query` with the strategy selected for `driver`.
pub fn fingerprint(driver: &str, query: &str) -> Result<String> {
    Fingerprinter::for_driver(driver)?.fingerprint(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_family_drivers_use_the_canonicalizer() {
        for driver in ["mysql", "Mysql2", "MariaDB", "trilogy"] {
            assert_eq!(
                Fingerprinter::for_driver(driver).unwrap(),
                Fingerprinter::Structural
            );
        }
    }

    #[test]
    fn structural_signature_is_readable() {
        assert_eq!(
            fingerprint("mysql2", "SELECT * FROM a_table WHERE a_value IN (1, 2, 3)").unwrap(),
            "select * from a_table where a_value in(?+)"
        );
    }

    #[cfg(feature = "grammar")]
    #[test]
    fn other_drivers_hash_the_parsed_statement() {
        let a = fingerprint("PostgreSQL", "SELECT * FROM legs WHERE chair_id = 1").unwrap();
        let b = fingerprint("PostgreSQL", "SELECT * FROM legs WHERE chair_id = 2").unwrap();
        let c = fingerprint("PostgreSQL", "SELECT id FROM legs WHERE chair_id = 2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[cfg(not(feature = "grammar"))]
    #[test]
    fn other_drivers_fail_without_the_parser() {
        let err = fingerprint("postgresql", "SELECT 1").unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("grammar")));
    }
}
