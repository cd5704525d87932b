//! Append-only journal tables recording committed writes as
//! `(id, query, hash)` rows for the replication feed.
//!
//! A database file carries one plain `journal` table plus zero or more
//! striped `journalNNNN` tables. Writers are assigned one table each; readers
//! always query the union of every discovered table, so a commit id resolves
//! no matter which connection wrote it.

use rusqlite::OptionalExtension;

/// Name of the journal table at `index`, or the plain `journal` table when
/// `index` is `None`.
pub(crate) fn table_name(index: Option<usize>) -> String {
    match index {
        None => "journal".to_string(),
        Some(i) => format!("journal{i:04}"),
    }
}

fn create_sql(name: &str) -> String {
    format!("CREATE TABLE IF NOT EXISTS {name} ( id INTEGER PRIMARY KEY, query TEXT, hash TEXT )")
}

pub(crate) fn table_exists(
    conn: &rusqlite::Connection,
    name: &str,
) -> Result<bool, rusqlite::Error> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Ensures the plain `journal` table and `min_striped` striped tables exist,
/// then discovers the contiguous prefix of striped tables actually present
/// (which may exceed what this connection was asked to create).
pub(crate) fn initialize(
    conn: &rusqlite::Connection,
    min_striped: usize,
) -> Result<Vec<String>, rusqlite::Error> {
    conn.execute_batch(&create_sql(&table_name(None)))?;
    for i in 0..min_striped {
        conn.execute_batch(&create_sql(&table_name(Some(i))))?;
    }

    let mut names = vec![table_name(None)];
    let mut index = 0;
    loop {
        let name = table_name(Some(index));
        if !table_exists(conn, &name)? {
            break;
        }
        names.push(name);
        index += 1;
    }
    Ok(names)
}

/// Composes one query per journal table and joins them with UNION. `parts`
/// are interleaved with the table name; with `append_table` the name is also
/// appended after the final part (for queries that end in `FROM`).
pub(crate) fn union_query(names: &[String], parts: &[&str], append_table: bool) -> String {
    let queries: Vec<String> = names
        .iter()
        .map(|name| {
            let mut query = parts.join(&format!(" {name} "));
            if append_table {
                query.push(' ');
                query.push_str(name);
            }
            query
        })
        .collect();
    queries.join(" UNION ")
}

/// Reads `(query, hash)` for one commit id across every journal table.
pub(crate) fn get_commit(
    conn: &rusqlite::Connection,
    names: &[String],
    id: u64,
) -> Result<Option<(String, String)>, rusqlite::Error> {
    let clause = format!("WHERE id = {id}");
    let query = union_query(names, &["SELECT query, hash FROM", &clause], false);
    conn.query_row(&query, [], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
}

/// Reads `(hash, query)` rows for commit ids in `[from, to]`, ordered by id.
/// A `to` of zero leaves the range unbounded above.
pub(crate) fn get_commits(
    conn: &rusqlite::Connection,
    names: &[String],
    from: u64,
    to: u64,
) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut clause = format!("WHERE id >= {from}");
    if to > 0 {
        clause.push_str(&format!(" AND id <= {to}"));
    }
    let inner = union_query(names, &["SELECT id, hash, query FROM", &clause], false);
    let query = format!("SELECT hash, query FROM ({inner}) ORDER BY id");

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

/// Highest commit id across all journal tables and its hash. A database with
/// no committed writes reports `(0, "")`.
pub(crate) fn initial_commit_state(
    conn: &rusqlite::Connection,
    names: &[String],
) -> Result<(u64, String), rusqlite::Error> {
    let inner = union_query(names, &["SELECT MAX(id) AS max_id FROM"], true);
    let max_id: Option<i64> =
        conn.query_row(&format!("SELECT MAX(max_id) FROM ({inner})"), [], |row| {
            row.get(0)
        })?;
    let commit_count = max_id.unwrap_or(0) as u64;
    let hash = match get_commit(conn, names, commit_count)? {
        Some((_, hash)) => hash,
        None => String::new(),
    };
    Ok((commit_count, hash))
}

/// Row span (max id - min id) across all journal tables; the running size
/// estimate the trim path maintains.
pub(crate) fn journal_size(
    conn: &rusqlite::Connection,
    names: &[String],
) -> Result<u64, rusqlite::Error> {
    let min_inner = union_query(names, &["SELECT MIN(id) AS id FROM"], true);
    let max_inner = union_query(names, &["SELECT MAX(id) AS id FROM"], true);
    let min: Option<i64> =
        conn.query_row(&format!("SELECT MIN(id) FROM ({min_inner})"), [], |row| {
            row.get(0)
        })?;
    let max: Option<i64> =
        conn.query_row(&format!("SELECT MAX(id) FROM ({max_inner})"), [], |row| {
            row.get(0)
        })?;
    Ok((max.unwrap_or(0) - min.unwrap_or(0)).max(0) as u64)
}

/// Deletes up to ten of the oldest rows that fall outside the retention
/// window. The window is anchored on the table's own max id so striped
/// tables trim independently.
pub(crate) fn trim_statement(journal_name: &str, max_journal_size: u64) -> String {
    format!(
        "DELETE FROM {journal_name} WHERE id IN ( \
         SELECT id FROM {journal_name} \
         WHERE id < (SELECT MAX(id) FROM {journal_name}) - {max_journal_size} \
         ORDER BY id LIMIT 10 )"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_zero_padded() {
        assert_eq!(table_name(None), "journal");
        assert_eq!(table_name(Some(0)), "journal0000");
        assert_eq!(table_name(Some(123)), "journal0123");
    }

    #[test]
    fn union_query_interleaves_table_names() {
        let names = vec!["journal".to_string(), "journal0000".to_string()];
        assert_eq!(
            union_query(&names, &["SELECT MAX(id) AS max_id FROM"], true),
            "SELECT MAX(id) AS max_id FROM journal UNION \
             SELECT MAX(id) AS max_id FROM journal0000"
        );
        assert_eq!(
            union_query(&names, &["SELECT query, hash FROM", "WHERE id = 7"], false),
            "SELECT query, hash FROM journal WHERE id = 7 UNION \
             SELECT query, hash FROM journal0000 WHERE id = 7"
        );
    }

    #[test]
    fn initialize_discovers_contiguous_tables() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let names = initialize(&conn, 2).expect("initialize");
        assert_eq!(names, vec!["journal", "journal0000", "journal0001"]);

        // A gap after journal0001 stops discovery even if later tables exist.
        conn.execute_batch("CREATE TABLE journal0003 ( id INTEGER PRIMARY KEY, query TEXT, hash TEXT )")
            .expect("create");
        let names = initialize(&conn, 0).expect("re-initialize");
        assert_eq!(names, vec!["journal", "journal0000", "journal0001"]);
    }

    #[test]
    fn commit_lookup_spans_tables() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let names = initialize(&conn, 1).expect("initialize");
        conn.execute_batch(
            "INSERT INTO journal VALUES (1, 'INSERT INTO t VALUES (1);', 'aa'); \
             INSERT INTO journal0000 VALUES (2, 'INSERT INTO t VALUES (2);', 'bb');",
        )
        .expect("seed");

        let (count, hash) = initial_commit_state(&conn, &names).expect("state");
        assert_eq!(count, 2);
        assert_eq!(hash, "bb");

        let (query, hash) = get_commit(&conn, &names, 1).expect("get").expect("row");
        assert_eq!(query, "INSERT INTO t VALUES (1);");
        assert_eq!(hash, "aa");
        assert!(get_commit(&conn, &names, 9).expect("get").is_none());

        let rows = get_commits(&conn, &names, 1, 2).expect("range");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "aa");
        assert_eq!(rows[1].0, "bb");

        assert_eq!(journal_size(&conn, &names).expect("size"), 1);
    }
}
