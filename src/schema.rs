//! Schema verification helpers: thin builders over the core read/write API,
//! used by callers to converge table, index, and column definitions at
//! startup. They run inside the caller's transaction so schema changes are
//! journaled and replicated like any other write.

use crate::error::ChaindbError;
use crate::{Connection, QueryResult};
use tracing::{debug, info, warn};

/// Outcome of a schema verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheck {
    /// The object did not exist and was created with the given definition.
    Created,
    /// The object exists and matches the expected definition.
    Matches,
    /// The object exists with a different definition; an upgrade is needed.
    Mismatch,
    /// The object does not exist and creation was not requested.
    Missing,
}

fn collapse_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_whitespace(sql: &str) -> String {
    sql.chars().filter(|c| !c.is_whitespace()).collect()
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn first_cell_owned(result: &QueryResult) -> String {
    result.first_cell().unwrap_or_default().to_string()
}

impl Connection {
    /// Ensures `table_name` exists with the given definition. The definition
    /// must not carry a trailing semicolon (the engine trims it from
    /// `sqlite_master`, which would confuse the comparison). Correctness is
    /// judged on columns and their order; whitespace differences are
    /// ignored.
    pub fn verify_table(
        &mut self,
        table_name: &str,
        sql: &str,
    ) -> Result<SchemaCheck, ChaindbError> {
        if sql.trim_end().ends_with(';') {
            return Err(ChaindbError::invalid_state(
                "table definition must not end with a semicolon",
            ));
        }
        let existing = self.read_rows(&format!(
            "SELECT sql FROM sqlite_master WHERE type='table' AND tbl_name={};",
            sql_quote(table_name)
        ))?;
        let collapsed_sql = collapse_whitespace(sql);
        if existing.is_empty() {
            info!(table = table_name, sql = %collapsed_sql, "creating table");
            self.write(&format!("{collapsed_sql};"))?;
            return Ok(SchemaCheck::Created);
        }
        let collapsed_existing = collapse_whitespace(&first_cell_owned(&existing));
        if strip_whitespace(&collapsed_existing) == strip_whitespace(&collapsed_sql) {
            debug!(table = table_name, "table already exists with correct schema");
            Ok(SchemaCheck::Matches)
        } else {
            warn!(
                table = table_name,
                existing = %collapsed_existing,
                expected = %collapsed_sql,
                "table has incorrect schema, upgrade needed?"
            );
            Ok(SchemaCheck::Mismatch)
        }
    }

    /// Ensures `index_name` exists on `table_name` with the given
    /// definition, optionally creating it.
    pub fn verify_index(
        &mut self,
        index_name: &str,
        table_name: &str,
        index_definition: &str,
        is_unique: bool,
        create_if_missing: bool,
    ) -> Result<SchemaCheck, ChaindbError> {
        debug!(index = index_name, unique = is_unique, "verifying index");
        let existing = self.read_rows(&format!(
            "SELECT sql FROM sqlite_master WHERE type='index' AND tbl_name={} AND name={};",
            sql_quote(table_name),
            sql_quote(index_name)
        ))?;
        let create_sql = format!(
            "CREATE{}INDEX {index_name} ON {table_name} {index_definition}",
            if is_unique { " UNIQUE " } else { " " }
        );
        if existing.is_empty() {
            if !create_if_missing {
                info!(index = index_name, table = table_name, "index does not exist");
                return Ok(SchemaCheck::Missing);
            }
            info!(index = index_name, sql = %create_sql, "creating index");
            self.write(&format!("{create_sql};"))?;
            return Ok(SchemaCheck::Created);
        }
        let existing_sql = first_cell_owned(&existing);
        if strip_whitespace(&create_sql).eq_ignore_ascii_case(&strip_whitespace(&existing_sql)) {
            Ok(SchemaCheck::Matches)
        } else {
            warn!(
                index = index_name,
                existing = %existing_sql,
                expected = %create_sql,
                "index has incorrect definition"
            );
            Ok(SchemaCheck::Mismatch)
        }
    }

    /// Adds `column` to `table_name` unless the table definition already
    /// mentions it. Returns true when the column was added.
    pub fn add_column(
        &mut self,
        table_name: &str,
        column: &str,
        column_type: &str,
    ) -> Result<bool, ChaindbError> {
        let sql = collapse_whitespace(&self.read(&format!(
            "SELECT sql FROM sqlite_master WHERE type='table' AND tbl_name={};",
            sql_quote(table_name)
        ))?);
        if sql.contains(&format!(" {column} ")) {
            debug!(table = table_name, column, "column already present");
            return Ok(false);
        }
        info!(table = table_name, column, column_type, "adding column");
        self.write(&format!(
            "ALTER TABLE {table_name} ADD COLUMN {column} {column_type};"
        ))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::{collapse_whitespace, sql_quote, strip_whitespace};

    #[test]
    fn whitespace_normalization() {
        assert_eq!(
            collapse_whitespace("CREATE TABLE  t\n ( a   INTEGER )"),
            "CREATE TABLE t ( a INTEGER )"
        );
        assert_eq!(
            strip_whitespace("CREATE TABLE t ( a INTEGER )"),
            "CREATETABLEt(aINTEGER)"
        );
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(sql_quote("plain"), "'plain'");
        assert_eq!(sql_quote("o'brien"), "'o''brien'");
    }
}
